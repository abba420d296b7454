use crate::domain::model::{
    AuditEvent, BackupEntry, BackupManifest, BatchOutcome, EntityKind, ImportCounts,
    ImportOptions, JobId, JobSnapshot, JobStatus, PhaseKind, PhaseNotification, PhaseStatus,
    PhaseUpdate, Record,
};
use crate::domain::ports::{ChangeFeed, JobStore, RecordSink};
use crate::utils::error::{ImportError, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::broadcast;

struct StoredJob {
    snapshot: JobSnapshot,
    audit: Vec<AuditEvent>,
}

/// 行程內的任務記錄與變更通知，供 CLI 與測試使用
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<JobId, StoredJob>>,
    notifications: broadcast::Sender<PhaseNotification>,
    healthy: AtomicBool,
    fail_writes: AtomicBool,
    created: AtomicUsize,
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        let (notifications, _) = broadcast::channel(256);
        Self {
            jobs: Mutex::new(HashMap::new()),
            notifications,
            healthy: AtomicBool::new(true),
            fail_writes: AtomicBool::new(false),
            created: AtomicUsize::new(0),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// 模擬資料庫寫入失敗
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn created_jobs(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self.jobs.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn audit_events(&self, job_id: &JobId) -> Vec<AuditEvent> {
        self.jobs
            .lock()
            .get(job_id)
            .map(|job| job.audit.clone())
            .unwrap_or_default()
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ImportError::PersistenceError {
                message: "job store rejected the write".to_string(),
            });
        }
        Ok(())
    }

    fn with_job<T>(&self, job_id: &JobId, f: impl FnOnce(&mut StoredJob) -> T) -> Result<T> {
        let mut jobs = self.jobs.lock();
        let job = jobs.get_mut(job_id).ok_or_else(|| ImportError::JobNotFound {
            job_id: job_id.to_string(),
        })?;
        let value = f(job);
        job.snapshot.updated_at = Utc::now();
        Ok(value)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn health_check(&self) -> Result<()> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ImportError::PersistenceError {
                message: "job store is unreachable".to_string(),
            })
        }
    }

    async fn create_job(&self, options: &ImportOptions) -> Result<JobId> {
        self.check_writable()?;
        let job_id = JobId::generate();
        let now = Utc::now();
        let snapshot = JobSnapshot {
            job_id: job_id.clone(),
            options: options.clone(),
            status: JobStatus::Pending,
            phases: PhaseKind::plan(options.import_type)
                .iter()
                .map(|kind| PhaseUpdate {
                    phase: kind.name(),
                    status: PhaseStatus::Pending,
                    progress: 0,
                    details: None,
                })
                .collect(),
            counts: ImportCounts::default(),
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        self.jobs.lock().insert(
            job_id.clone(),
            StoredJob {
                snapshot,
                audit: Vec::new(),
            },
        );
        self.created.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("💾 Created job {}", job_id);
        Ok(job_id)
    }

    async fn update_phase(&self, job_id: &JobId, update: &PhaseUpdate) -> Result<()> {
        self.check_writable()?;
        self.with_job(job_id, |job| {
            match job
                .snapshot
                .phases
                .iter()
                .position(|p| p.phase == update.phase)
            {
                Some(index) => job.snapshot.phases[index] = update.clone(),
                None => job.snapshot.phases.push(update.clone()),
            }
            if job.snapshot.status == JobStatus::Pending {
                job.snapshot.status = JobStatus::Running;
            }
        })?;

        // 沒有訂閱者時送出失敗是正常的
        let _ = self.notifications.send(PhaseNotification {
            job_id: job_id.clone(),
            phase: update.phase.clone(),
            status: update.status,
            progress: update.progress,
        });
        Ok(())
    }

    async fn update_status(
        &self,
        job_id: &JobId,
        status: JobStatus,
        error: Option<serde_json::Value>,
    ) -> Result<()> {
        self.check_writable()?;
        self.with_job(job_id, |job| {
            job.snapshot.status = status;
            if error.is_some() {
                job.snapshot.error = error;
            }
            if status.is_terminal() {
                job.snapshot.completed_at = Some(Utc::now());
            }
        })
    }

    async fn update_counts(&self, job_id: &JobId, counts: &ImportCounts) -> Result<()> {
        self.check_writable()?;
        self.with_job(job_id, |job| job.snapshot.counts = *counts)
    }

    async fn get_job(&self, job_id: &JobId) -> Result<JobSnapshot> {
        self.jobs
            .lock()
            .get(job_id)
            .map(|job| job.snapshot.clone())
            .ok_or_else(|| ImportError::JobNotFound {
                job_id: job_id.to_string(),
            })
    }

    async fn append_audit_event(&self, job_id: &JobId, event: AuditEvent) -> Result<()> {
        self.check_writable()?;
        let mut jobs = self.jobs.lock();
        let job = jobs.get_mut(job_id).ok_or_else(|| ImportError::JobNotFound {
            job_id: job_id.to_string(),
        })?;
        job.audit.push(event);
        Ok(())
    }
}

impl ChangeFeed for InMemoryJobStore {
    fn subscribe(&self, job_id: &JobId) -> Option<BoxStream<'static, PhaseNotification>> {
        let receiver = self.notifications.subscribe();
        let job_id = job_id.clone();
        let stream = stream::unfold(receiver, move |mut receiver| {
            let job_id = job_id.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(notification) if notification.job_id == job_id => {
                            return Some((notification, receiver))
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::debug!("📡 Change feed lagged, skipped {}", skipped);
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Some(stream.boxed())
    }
}

/// 以 identifier 為鍵的使用者/車輛資料表
#[derive(Default)]
pub struct InMemoryRecordSink {
    tables: Mutex<HashMap<EntityKind, BTreeMap<String, Record>>>,
    backups: Mutex<HashMap<String, BTreeMap<String, Record>>>,
    reject_batches: AtomicBool,
    fail_restore: AtomicBool,
}

impl InMemoryRecordSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, kind: EntityKind, records: Vec<Record>) {
        let mut tables = self.tables.lock();
        let table = tables.entry(kind).or_default();
        for record in records {
            if let Some(id) = record.identifier() {
                table.insert(id, record);
            }
        }
    }

    pub fn records(&self, kind: EntityKind) -> Vec<Record> {
        self.tables
            .lock()
            .get(&kind)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn set_reject_batches(&self, reject: bool) {
        self.reject_batches.store(reject, Ordering::SeqCst);
    }

    pub fn set_fail_restore(&self, fail: bool) {
        self.fail_restore.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl RecordSink for InMemoryRecordSink {
    async fn capture_backup(&self, kinds: &[EntityKind]) -> Result<BackupManifest> {
        let tables = self.tables.lock();
        let mut backups = self.backups.lock();
        let mut entries = Vec::with_capacity(kinds.len());

        for kind in kinds {
            let table = tables.get(kind).cloned().unwrap_or_default();
            let reference = format!("{}-{}", kind, uuid::Uuid::new_v4());
            entries.push(BackupEntry {
                kind: *kind,
                reference: reference.clone(),
                record_count: table.len(),
            });
            backups.insert(reference, table);
        }

        Ok(BackupManifest {
            captured_at: Utc::now(),
            entries,
        })
    }

    async fn apply_batch(&self, kind: EntityKind, records: &[Record]) -> Result<BatchOutcome> {
        if self.reject_batches.load(Ordering::SeqCst) {
            return Err(ImportError::PersistenceError {
                message: format!("{} table rejected the batch", kind),
            });
        }

        let mut tables = self.tables.lock();
        let table = tables.entry(kind).or_default();
        let mut outcome = BatchOutcome::default();

        for (index, record) in records.iter().enumerate() {
            match record.identifier() {
                Some(id) => {
                    table.insert(id, record.clone());
                    outcome.successful += 1;
                }
                None => {
                    outcome.failed += 1;
                    outcome
                        .errors
                        .push(format!("{} record #{} has no identifier", kind, index));
                }
            }
        }
        Ok(outcome)
    }

    async fn restore_backup(&self, manifest: &BackupManifest) -> Result<()> {
        if self.fail_restore.load(Ordering::SeqCst) {
            return Err(ImportError::PersistenceError {
                message: "backup storage unavailable".to_string(),
            });
        }

        let mut restored = Vec::with_capacity(manifest.entries.len());
        {
            let backups = self.backups.lock();
            for entry in &manifest.entries {
                let table = backups
                    .get(&entry.reference)
                    .ok_or_else(|| ImportError::PersistenceError {
                        message: format!("backup '{}' not found", entry.reference),
                    })?;
                restored.push((entry.kind, table.clone()));
            }
        }

        let mut tables = self.tables.lock();
        for (kind, table) in restored {
            tables.insert(kind, table);
        }
        Ok(())
    }
}
