use crate::core::executor::{EntityImport, ExecutionSettings};
use crate::core::ledger::ErrorLedger;
use crate::core::progress::{ProgressAggregator, ProgressCallback, ProgressConfig, UpdateSource};
use crate::core::session::{SessionConfig, SessionManager};
use crate::core::supervisor::{CancellationHandle, SupervisorConfig, TimeoutSupervisor};
use crate::domain::model::{
    AuditEvent, AuditKind, BackupManifest, Credentials, ImportJob, ImportOptions, ImportResult,
    ImportType, JobId, JobStatus, PhaseKind, PhaseStatus, PhaseUpdate, ProgressEvent,
    RollbackReport,
};
use crate::domain::ports::{ChangeFeed, JobStore, RecordSink, TrackingProvider};
use crate::utils::error::{ErrorCode, ImportError, Result};
use crate::utils::monitor::SystemMonitor;
use crate::utils::validation::Validate;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub credentials: Credentials,
    pub session: SessionConfig,
    pub supervisor: SupervisorConfig,
    pub progress: ProgressConfig,
    /// WithRetry 的最大嘗試次數
    pub retry_attempts: u32,
    pub operation_timeout: Duration,
    pub operation_timeout_retries: u32,
    pub monitoring: bool,
}

impl OrchestratorConfig {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            session: SessionConfig::default(),
            supervisor: SupervisorConfig::default(),
            progress: ProgressConfig::default(),
            retry_attempts: 3,
            operation_timeout: Duration::from_secs(120),
            operation_timeout_retries: 1,
            monitoring: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Created,
    Validating,
    Initializing,
    Executing,
    Completed,
    Failed,
    Cancelled,
    RolledBack,
}

impl OrchestratorState {
    pub fn can_transition_to(&self, next: OrchestratorState) -> bool {
        use OrchestratorState::*;
        matches!(
            (self, next),
            (Created, Validating)
                | (Validating, Initializing)
                | (Initializing, Executing)
                | (Executing, Completed)
                | (Created | Validating | Initializing | Executing, Failed | Cancelled)
                | (Executing | Completed | Failed | Cancelled, RolledBack)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestratorState::Completed
                | OrchestratorState::Failed
                | OrchestratorState::Cancelled
                | OrchestratorState::RolledBack
        )
    }
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrchestratorState::Created => "created",
            OrchestratorState::Validating => "validating",
            OrchestratorState::Initializing => "initializing",
            OrchestratorState::Executing => "executing",
            OrchestratorState::Completed => "completed",
            OrchestratorState::Failed => "failed",
            OrchestratorState::Cancelled => "cancelled",
            OrchestratorState::RolledBack => "rolled back",
        };
        f.write_str(s)
    }
}

/// 對外公開的任務狀態副本
#[derive(Debug, Clone)]
struct JobEntry {
    job: ImportJob,
    state: OrchestratorState,
    ledger: ErrorLedger,
    backup: Option<BackupManifest>,
    rollback: Option<RollbackReport>,
}

struct ActiveRun {
    job_id: Option<JobId>,
    supervisor: Arc<TimeoutSupervisor>,
    finished: watch::Receiver<bool>,
}

/// 清除進行中標記；start_import 的 future 被丟棄時也會執行
struct ActiveGuard<'a> {
    active: &'a Mutex<Option<ActiveRun>>,
    finished: watch::Sender<bool>,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        *self.active.lock() = None;
        self.finished.send_replace(true);
    }
}

/// Authoritative state of the job being driven by one `start_import` call.
struct RunContext {
    options: ImportOptions,
    job: ImportJob,
    created: bool,
    state: OrchestratorState,
    ledger: ErrorLedger,
    backup: Option<BackupManifest>,
    rollback: Option<RollbackReport>,
    sessions: Arc<SessionManager>,
    supervisor: Arc<TimeoutSupervisor>,
    aggregator: ProgressAggregator,
    background: CancellationToken,
}

impl RunContext {
    fn enter(&mut self, next: OrchestratorState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(ImportError::InvalidTransition {
                subject: format!("import {}", self.job.id),
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        tracing::debug!("🔀 Import {}: {} -> {}", self.job.id, self.state, next);
        self.state = next;
        Ok(())
    }

    fn current_context(&self) -> String {
        self.job
            .running_phase()
            .map(|p| p.name.clone())
            .unwrap_or_else(|| self.state.to_string())
    }
}

/// Drives one import job at a time through validation, initialization,
/// execution and completion.
///
/// Rollback is advisory: it restores the backup captured at job start when it
/// can, but a failed restore is only reported and the imported data may stay
/// partially applied.
pub struct ImportOrchestrator {
    provider: Arc<dyn TrackingProvider>,
    store: Arc<dyn JobStore>,
    sink: Arc<dyn RecordSink>,
    feed: Option<Arc<dyn ChangeFeed>>,
    config: OrchestratorConfig,
    jobs: Mutex<HashMap<JobId, JobEntry>>,
    active: Mutex<Option<ActiveRun>>,
    latest_ledger: Mutex<ErrorLedger>,
    subscribers: Mutex<Vec<ProgressCallback>>,
    channels: Arc<Mutex<Vec<mpsc::UnboundedSender<ProgressEvent>>>>,
    monitor: SystemMonitor,
}

impl ImportOrchestrator {
    pub fn new(
        provider: Arc<dyn TrackingProvider>,
        store: Arc<dyn JobStore>,
        sink: Arc<dyn RecordSink>,
        config: OrchestratorConfig,
    ) -> Self {
        let monitor = SystemMonitor::new(config.monitoring);
        Self {
            provider,
            store,
            sink,
            feed: None,
            config,
            jobs: Mutex::new(HashMap::new()),
            active: Mutex::new(None),
            latest_ledger: Mutex::new(ErrorLedger::new()),
            subscribers: Mutex::new(Vec::new()),
            channels: Arc::new(Mutex::new(Vec::new())),
            monitor,
        }
    }

    pub fn with_change_feed(mut self, feed: Arc<dyn ChangeFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    /// 註冊進度回呼，套用於之後啟動的匯入
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        self.subscribers.lock().push(Arc::new(callback));
    }

    /// 進度事件的接收端；接收端丟棄後對應的傳送端會被移除
    pub fn progress_channel(&self) -> mpsc::UnboundedReceiver<ProgressEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut channels = self.channels.lock();
        channels.retain(|sender| !sender.is_closed());
        channels.push(tx);
        rx
    }

    pub fn active_job(&self) -> Option<JobId> {
        self.active.lock().as_ref().and_then(|run| run.job_id.clone())
    }

    pub fn job(&self, job_id: &JobId) -> Option<ImportJob> {
        self.jobs.lock().get(job_id).map(|entry| entry.job.clone())
    }

    pub fn state(&self, job_id: &JobId) -> Option<OrchestratorState> {
        self.jobs.lock().get(job_id).map(|entry| entry.state)
    }

    pub fn rollback_report(&self, job_id: &JobId) -> Option<RollbackReport> {
        self.jobs
            .lock()
            .get(job_id)
            .and_then(|entry| entry.rollback.clone())
    }

    pub fn error_summary(&self, job_id: &JobId) -> Result<String> {
        self.jobs
            .lock()
            .get(job_id)
            .map(|entry| entry.ledger.summarize())
            .ok_or_else(|| ImportError::JobNotFound {
                job_id: job_id.to_string(),
            })
    }

    /// 最近一次匯入的錯誤報告，包含尚未建立任務就失敗的情況
    pub fn latest_error_summary(&self) -> String {
        self.latest_ledger.lock().summarize()
    }

    /// Runs a complete import and returns once the job reached a terminal
    /// state. Only one import may run at a time.
    pub async fn start_import(&self, options: ImportOptions) -> Result<ImportResult> {
        let supervisor = Arc::new(TimeoutSupervisor::new(self.config.supervisor.clone()));
        let (finished_tx, finished_rx) = watch::channel(false);
        {
            let mut active = self.active.lock();
            if let Some(run) = active.as_ref() {
                return Err(ImportError::ImportInProgress {
                    job_id: run.job_id.as_ref().map(JobId::to_string),
                });
            }
            *active = Some(ActiveRun {
                job_id: None,
                supervisor: Arc::clone(&supervisor),
                finished: finished_rx,
            });
        }
        let _guard = ActiveGuard {
            active: &self.active,
            finished: finished_tx,
        };

        *self.latest_ledger.lock() = ErrorLedger::new();
        let mut ctx = self.new_run(options, supervisor);
        tracing::info!(
            "🚀 Starting {} import (batch size {})",
            ctx.options.import_type,
            ctx.options.batch_size
        );

        let handle = ctx.supervisor.handle();
        let outcome = tokio::select! {
            biased;
            _ = handle.cancelled() => Err(handle.to_error()),
            result = self.run_phases(&mut ctx) => result,
        };

        self.finish(ctx, outcome).await
    }

    fn new_run(&self, options: ImportOptions, supervisor: Arc<TimeoutSupervisor>) -> RunContext {
        // 正式 id 在 create_job 之後取得
        let job = ImportJob::new(JobId::generate(), options.import_type);
        let aggregator = ProgressAggregator::new(
            job.phases.iter().map(|p| p.name.clone()).collect(),
            Arc::clone(&self.store),
            self.feed.clone(),
            self.config.progress.clone(),
        );
        for subscriber in self.subscribers.lock().iter() {
            aggregator.subscribe(Arc::clone(subscriber));
        }
        let channels = Arc::clone(&self.channels);
        aggregator.subscribe(Arc::new(move |event: &ProgressEvent| {
            channels
                .lock()
                .retain(|sender| sender.send(event.clone()).is_ok());
        }));

        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&self.provider),
            self.config.credentials.clone(),
            self.config.session.clone(),
        ));
        let background = supervisor.handle().token().child_token();

        RunContext {
            options,
            job,
            created: false,
            state: OrchestratorState::Created,
            ledger: ErrorLedger::new(),
            backup: None,
            rollback: None,
            sessions,
            supervisor,
            aggregator,
            background,
        }
    }

    async fn run_phases(&self, ctx: &mut RunContext) -> Result<()> {
        self.validate(ctx).await?;
        self.initialize(ctx).await?;
        self.execute(ctx).await?;
        self.complete(ctx).await
    }

    /// 更新階段狀態：本地副本、進度訂閱者、持久層（任務建立後）
    async fn set_phase(
        &self,
        ctx: &mut RunContext,
        kind: PhaseKind,
        status: PhaseStatus,
        progress: u8,
        details: Option<&str>,
    ) -> Result<()> {
        ctx.supervisor.heartbeat()?;

        let name = kind.name();
        let update = {
            let phase = ctx
                .job
                .phase_mut(&name)
                .ok_or_else(|| ImportError::InvalidTransition {
                    subject: format!("phase '{}'", name),
                    from: "missing".to_string(),
                    to: status.to_string(),
                })?;
            phase.transition(status, progress, details)?;
            phase.to_update()
        };
        ctx.aggregator.observe(&update, UpdateSource::Local);

        if ctx.created {
            self.store.update_phase(&ctx.job.id, &update).await?;
            if status == PhaseStatus::Completed {
                self.store
                    .append_audit_event(
                        &ctx.job.id,
                        AuditEvent::new(AuditKind::PhaseCompleted, format!("{} completed", name)),
                    )
                    .await?;
            }
        }
        if status == PhaseStatus::Completed {
            self.monitor.log_stats(&name);
        }

        self.publish(ctx);
        Ok(())
    }

    fn publish(&self, ctx: &RunContext) {
        if ctx.created {
            self.jobs.lock().insert(
                ctx.job.id.clone(),
                JobEntry {
                    job: ctx.job.clone(),
                    state: ctx.state,
                    ledger: ctx.ledger.clone(),
                    backup: ctx.backup.clone(),
                    rollback: ctx.rollback.clone(),
                },
            );
        }
        *self.latest_ledger.lock() = ctx.ledger.clone();
    }

    async fn check_configuration(&self) -> Result<()> {
        let credentials = &self.config.credentials;
        if credentials.principal.trim().is_empty() || credentials.secret.is_empty() {
            return Err(ImportError::ConfigError {
                message: "tracking provider credentials are not configured".to_string(),
            });
        }
        self.provider
            .health_check()
            .await
            .map_err(|e| ImportError::ConfigError {
                message: format!("tracking provider is unreachable: {}", e),
            })
    }

    /// Cheapest checks first: nothing is created and no login happens when
    /// the options themselves are invalid.
    async fn validate(&self, ctx: &mut RunContext) -> Result<()> {
        ctx.enter(OrchestratorState::Validating)?;
        let phase = PhaseKind::Validation;

        self.set_phase(ctx, phase, PhaseStatus::Running, 0, Some("checking import options"))
            .await?;
        ctx.options.validate()?;

        self.set_phase(ctx, phase, PhaseStatus::Running, 25, Some("checking provider configuration"))
            .await?;
        self.check_configuration().await?;

        self.set_phase(ctx, phase, PhaseStatus::Running, 50, Some("checking job store"))
            .await?;
        self.store.health_check().await?;

        self.set_phase(ctx, phase, PhaseStatus::Running, 75, Some("acquiring provider session"))
            .await?;
        ctx.sessions.ensure_valid_session().await?;

        self.set_phase(ctx, phase, PhaseStatus::Completed, 100, Some("all checks passed"))
            .await?;
        tracing::info!("✅ Validation passed");
        Ok(())
    }

    async fn initialize(&self, ctx: &mut RunContext) -> Result<()> {
        ctx.enter(OrchestratorState::Initializing)?;
        let phase = PhaseKind::Initialization;
        self.set_phase(ctx, phase, PhaseStatus::Running, 0, Some("creating job record"))
            .await?;

        let job_id = self.store.create_job(&ctx.options).await?;
        ctx.job.id = job_id.clone();
        ctx.job.status = JobStatus::Running;
        ctx.created = true;
        if let Some(run) = self.active.lock().as_mut() {
            run.job_id = Some(job_id.clone());
        }
        tracing::info!("📝 Created import job {}", job_id);

        let replay: Vec<PhaseUpdate> = ctx
            .job
            .phases
            .iter()
            .filter(|p| p.status != PhaseStatus::Pending)
            .map(|p| p.to_update())
            .collect();
        for update in &replay {
            self.store.update_phase(&job_id, update).await?;
        }
        self.store
            .update_status(&job_id, JobStatus::Running, None)
            .await?;
        self.store
            .append_audit_event(
                &job_id,
                AuditEvent::new(
                    AuditKind::JobStarted,
                    format!("{} import started", ctx.options.import_type),
                ),
            )
            .await?;

        ctx.supervisor.start(&job_id)?;
        ctx.sessions.prepare_for_long_operation(&ctx.background);
        ctx.aggregator.start(&job_id, &ctx.background);

        self.set_phase(ctx, phase, PhaseStatus::Running, 50, Some("capturing backup"))
            .await?;
        let manifest = self
            .sink
            .capture_backup(ctx.options.import_type.entity_kinds())
            .await?;
        let captured: usize = manifest.entries.iter().map(|e| e.record_count).sum();
        ctx.backup = Some(manifest);

        let details = format!("backup captured ({} existing records)", captured);
        self.set_phase(ctx, phase, PhaseStatus::Completed, 100, Some(&details))
            .await
    }

    async fn execute(&self, ctx: &mut RunContext) -> Result<()> {
        ctx.enter(OrchestratorState::Executing)?;

        let settings = ExecutionSettings {
            batch_size: ctx.options.batch_size,
            retry_attempts: self.config.retry_attempts,
            operation_timeout: self.config.operation_timeout,
            operation_timeout_retries: self.config.operation_timeout_retries,
        };
        let usernames = if ctx.options.import_type == ImportType::Selective {
            ctx.options.selected_usernames.clone()
        } else {
            Vec::new()
        };
        let sessions = Arc::clone(&ctx.sessions);
        let supervisor = Arc::clone(&ctx.supervisor);

        for kind in ctx.options.import_type.entity_kinds() {
            let phase = PhaseKind::Execution(*kind);
            let starting = format!("importing {}", kind);
            self.set_phase(ctx, phase, PhaseStatus::Running, 0, Some(&starting))
                .await?;

            let mut import = EntityImport::new(
                *kind,
                Arc::clone(&self.provider),
                &sessions,
                &supervisor,
                self.sink.as_ref(),
                &settings,
                &usernames,
            );
            while let Some(page) = import.next_page(&mut ctx.ledger).await? {
                *ctx.job.counts.for_kind_mut(*kind) = page.counts;
                self.store.update_counts(&ctx.job.id, &ctx.job.counts).await?;
                self.set_phase(ctx, phase, PhaseStatus::Running, page.progress, Some(&page.details))
                    .await?;
            }

            let counts = import.counts();
            *ctx.job.counts.for_kind_mut(*kind) = counts;
            let summary = format!(
                "{} {} imported, {} failed",
                counts.successful, kind, counts.failed
            );
            self.set_phase(ctx, phase, PhaseStatus::Completed, 100, Some(&summary))
                .await?;
        }

        let overdue = supervisor.take_overdue_operations();
        if !overdue.is_empty() {
            tracing::debug!("⏱️ {} operation(s) ran past their deadline", overdue.len());
        }
        Ok(())
    }

    async fn complete(&self, ctx: &mut RunContext) -> Result<()> {
        let phase = PhaseKind::Completion;
        self.set_phase(ctx, phase, PhaseStatus::Running, 0, Some("finalizing job"))
            .await?;

        ctx.job.status = JobStatus::Completed;
        ctx.job.completed_at = Some(Utc::now());
        self.store.update_counts(&ctx.job.id, &ctx.job.counts).await?;

        let details = format!(
            "{} users, {} vehicles imported",
            ctx.job.counts.users.successful, ctx.job.counts.vehicles.successful
        );
        self.set_phase(ctx, phase, PhaseStatus::Completed, 100, Some(&details))
            .await?;
        self.store
            .update_status(&ctx.job.id, JobStatus::Completed, None)
            .await?;
        self.store
            .append_audit_event(
                &ctx.job.id,
                AuditEvent::new(AuditKind::JobCompleted, details),
            )
            .await?;
        ctx.enter(OrchestratorState::Completed)
    }

    async fn finish(&self, mut ctx: RunContext, outcome: Result<()>) -> Result<ImportResult> {
        ctx.background.cancel();
        ctx.aggregator.stop();

        let result = match outcome {
            Ok(()) => {
                ctx.supervisor.complete();
                let result = ImportResult {
                    job_id: ctx.job.id.clone(),
                    status: JobStatus::Completed,
                    counts: ctx.job.counts,
                    started_at: ctx.job.created_at,
                    completed_at: ctx.job.completed_at.unwrap_or_else(Utc::now),
                    recovered_errors: ctx.ledger.recoverable_count(),
                };
                tracing::info!(
                    "✅ Import {} completed: {} users, {} vehicles, {} failed record(s), {} recovered issue(s)",
                    result.job_id,
                    result.counts.users.successful,
                    result.counts.vehicles.successful,
                    result.counts.total_failed(),
                    result.recovered_errors
                );
                Ok(result)
            }
            Err(error) => Err(self.fail(&mut ctx, error).await),
        };

        ctx.sessions.release().await;
        self.monitor.log_final_stats();
        self.publish(&ctx);
        result
    }

    async fn fail(&self, ctx: &mut RunContext, error: ImportError) -> ImportError {
        ctx.supervisor.stop();
        let cancelled = error.code() == ErrorCode::Cancelled;

        let context = ctx.current_context();
        ctx.ledger.record_fatal(&error, context);

        let open_phases: Vec<String> = ctx
            .job
            .phases
            .iter()
            .filter(|p| !p.status.is_terminal())
            .map(|p| p.name.clone())
            .collect();
        let mut failed_updates = Vec::with_capacity(open_phases.len());
        for name in open_phases {
            if let Some(phase) = ctx.job.phase_mut(&name) {
                if phase.transition(PhaseStatus::Failed, 0, None).is_ok() {
                    failed_updates.push(phase.to_update());
                }
            }
        }
        for update in &failed_updates {
            ctx.aggregator.observe(update, UpdateSource::Local);
        }

        let (status, state, audit) = if cancelled {
            (JobStatus::Cancelled, OrchestratorState::Cancelled, AuditKind::JobCancelled)
        } else {
            (JobStatus::Failed, OrchestratorState::Failed, AuditKind::JobFailed)
        };
        ctx.job.status = status;
        ctx.job.completed_at = Some(Utc::now());
        if let Err(e) = ctx.enter(state) {
            tracing::warn!("⚠️ {}", e);
        }

        if cancelled {
            tracing::warn!("🛑 Import cancelled: {}", error);
        } else {
            tracing::error!("❌ Import failed: {}", error);
        }

        if ctx.created {
            if let Err(e) = self.persist_failure(ctx, &failed_updates, &error, audit).await {
                tracing::warn!("⚠️ Could not persist final job state: {}", e);
            }

            if cancelled || ctx.options.rollback_on_failure {
                let reason = error.to_string();
                let report = self
                    .perform_rollback(&ctx.job.id, ctx.backup.as_ref(), &reason, &mut ctx.ledger)
                    .await;
                if report.restored {
                    ctx.job.rolled_back_at = Some(Utc::now());
                    if let Err(e) = ctx.enter(OrchestratorState::RolledBack) {
                        tracing::warn!("⚠️ {}", e);
                    }
                }
                ctx.rollback = Some(report);
            }
        }

        error
    }

    async fn persist_failure(
        &self,
        ctx: &RunContext,
        failed_updates: &[PhaseUpdate],
        error: &ImportError,
        audit: AuditKind,
    ) -> Result<()> {
        for update in failed_updates {
            self.store.update_phase(&ctx.job.id, update).await?;
        }
        self.store.update_counts(&ctx.job.id, &ctx.job.counts).await?;
        self.store
            .update_status(&ctx.job.id, ctx.job.status, Some(error.to_payload()))
            .await?;
        self.store
            .append_audit_event(&ctx.job.id, AuditEvent::new(audit, error.to_string()))
            .await
    }

    /// 盡力還原備份；失敗只記錄為可恢復的警告
    async fn perform_rollback(
        &self,
        job_id: &JobId,
        backup: Option<&BackupManifest>,
        reason: &str,
        ledger: &mut ErrorLedger,
    ) -> RollbackReport {
        tracing::warn!("⏪ Rolling back import {} ({})", job_id, reason);

        let mut warnings = Vec::new();
        let restored = match backup {
            None => {
                warnings.push(
                    "no backup was captured; imported records were left in place".to_string(),
                );
                false
            }
            Some(manifest) => match self.sink.restore_backup(manifest).await {
                Ok(()) => true,
                Err(e) => {
                    warnings.push(format!("backup restore failed: {}", e));
                    false
                }
            },
        };

        for warning in &warnings {
            ledger.record(ErrorCode::RollbackFailed, warning.as_str(), "rollback", true);
        }

        let message = if restored {
            tracing::info!("⏪ Rollback of {} restored the captured backup", job_id);
            format!("backup restored ({})", reason)
        } else {
            format!("rollback incomplete ({})", reason)
        };
        if let Err(e) = self
            .store
            .append_audit_event(job_id, AuditEvent::new(AuditKind::RollbackAttempted, message))
            .await
        {
            tracing::warn!("⚠️ Could not record rollback audit event: {}", e);
        }

        RollbackReport {
            job_id: job_id.clone(),
            restored,
            warnings,
        }
    }

    /// Cancels the import currently running as `job_id` and waits until it has
    /// rolled back and released its session. Cancelling a finished job is a
    /// no-op.
    pub async fn cancel_import(&self, job_id: &JobId, reason: &str) -> Result<()> {
        let waiter = {
            let active = self.active.lock();
            match active.as_ref() {
                Some(run) if run.job_id.as_ref() == Some(job_id) => {
                    run.supervisor.cancel(reason);
                    Some(run.finished.clone())
                }
                _ => None,
            }
        };
        if let Some(mut finished) = waiter {
            let _ = finished.wait_for(|done| *done).await;
            return Ok(());
        }

        match self.state(job_id) {
            Some(state) if state.is_terminal() => {
                tracing::info!("ℹ️ Job {} is already {}, nothing to cancel", job_id, state);
                Ok(())
            }
            Some(state) => Err(ImportError::InvalidTransition {
                subject: format!("import {}", job_id),
                from: state.to_string(),
                to: OrchestratorState::Cancelled.to_string(),
            }),
            None => Err(ImportError::JobNotFound {
                job_id: job_id.to_string(),
            }),
        }
    }

    /// 取消目前進行中的匯入（包含尚未建立任務的驗證階段）
    pub async fn cancel_active(&self, reason: &str) -> bool {
        let waiter = {
            let active = self.active.lock();
            active.as_ref().map(|run| {
                run.supervisor.cancel(reason);
                run.finished.clone()
            })
        };
        match waiter {
            Some(mut finished) => {
                let _ = finished.wait_for(|done| *done).await;
                true
            }
            None => false,
        }
    }

    /// Best-effort restore of the backup captured when `job_id` started. A
    /// running job is cancelled first. The returned report says whether the
    /// data was actually restored; failures never surface as errors.
    pub async fn rollback_import(&self, job_id: &JobId, reason: &str) -> Result<RollbackReport> {
        if self.active_job().as_ref() == Some(job_id) {
            self.cancel_import(job_id, reason).await?;
        }

        let (backup, mut ledger, state, previous) = {
            let jobs = self.jobs.lock();
            let entry = jobs.get(job_id).ok_or_else(|| ImportError::JobNotFound {
                job_id: job_id.to_string(),
            })?;
            (
                entry.backup.clone(),
                entry.ledger.clone(),
                entry.state,
                entry.rollback.clone(),
            )
        };

        if let Some(report) = previous.filter(|r| r.restored) {
            return Ok(report);
        }
        if !state.can_transition_to(OrchestratorState::RolledBack) {
            return Err(ImportError::InvalidTransition {
                subject: format!("import {}", job_id),
                from: state.to_string(),
                to: OrchestratorState::RolledBack.to_string(),
            });
        }

        let report = self
            .perform_rollback(job_id, backup.as_ref(), reason, &mut ledger)
            .await;

        if let Some(entry) = self.jobs.lock().get_mut(job_id) {
            entry.ledger = ledger;
            entry.rollback = Some(report.clone());
            if report.restored {
                entry.state = OrchestratorState::RolledBack;
                entry.job.rolled_back_at = Some(Utc::now());
            }
        }
        Ok(report)
    }

    /// Waits for `job_id` to reach a terminal state by polling the job store.
    /// While the job is running here, its deadline and cancellation end the
    /// wait early.
    pub async fn await_completion(&self, job_id: &JobId) -> Result<ImportResult> {
        let phases: Vec<String> = self
            .jobs
            .lock()
            .get(job_id)
            .map(|entry| entry.job.phases.iter().map(|p| p.name.clone()).collect())
            .ok_or_else(|| ImportError::JobNotFound {
                job_id: job_id.to_string(),
            })?;
        let handle = match self.active.lock().as_ref() {
            Some(run) if run.job_id.as_ref() == Some(job_id) => run.supervisor.handle(),
            _ => CancellationHandle::new(),
        };

        let aggregator = ProgressAggregator::new(
            phases,
            Arc::clone(&self.store),
            None,
            self.config.progress.clone(),
        );
        let snapshot = aggregator.await_completion(job_id, &handle).await?;

        let recovered = self
            .jobs
            .lock()
            .get(job_id)
            .map(|entry| entry.ledger.recoverable_count())
            .unwrap_or(0);
        Ok(snapshot.to_result(recovered))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory_store::{InMemoryJobStore, InMemoryRecordSink};
    use crate::domain::model::ExternalSession;
    use crate::utils::error::ProviderError;
    use async_trait::async_trait;

    /// 沒有任何資料的追蹤服務
    struct EmptyProvider;

    #[async_trait]
    impl TrackingProvider for EmptyProvider {
        async fn login(
            &self,
            principal: &str,
            _secret: &str,
        ) -> std::result::Result<ExternalSession, ProviderError> {
            Ok(ExternalSession::new(
                "token",
                principal,
                Utc::now() + chrono::Duration::hours(1),
            ))
        }

        async fn query(
            &self,
            _session: &ExternalSession,
            _action: &str,
            _params: &serde_json::Value,
        ) -> std::result::Result<serde_json::Value, ProviderError> {
            Ok(serde_json::json!([]))
        }
    }

    #[tokio::test]
    async fn test_dropped_progress_channels_are_pruned() {
        let orchestrator = ImportOrchestrator::new(
            Arc::new(EmptyProvider),
            Arc::new(InMemoryJobStore::new()),
            Arc::new(InMemoryRecordSink::new()),
            OrchestratorConfig::new(Credentials::new("fleet-admin", "s3cret")),
        );

        drop(orchestrator.progress_channel());
        let mut live = orchestrator.progress_channel();
        assert_eq!(orchestrator.channels.lock().len(), 1);

        drop(orchestrator.progress_channel());
        assert_eq!(orchestrator.channels.lock().len(), 2);

        orchestrator
            .start_import(ImportOptions::new(ImportType::UsersOnly))
            .await
            .unwrap();

        assert_eq!(orchestrator.channels.lock().len(), 1);
        assert!(live.try_recv().is_ok());
    }

    #[test]
    fn test_state_machine_transitions() {
        use OrchestratorState::*;
        assert!(Created.can_transition_to(Validating));
        assert!(Validating.can_transition_to(Failed));
        assert!(Executing.can_transition_to(Cancelled));
        assert!(Completed.can_transition_to(RolledBack));
        assert!(Failed.can_transition_to(RolledBack));

        assert!(!Validating.can_transition_to(Executing));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Initializing.can_transition_to(RolledBack));
        assert!(!RolledBack.can_transition_to(RolledBack));
    }

    #[test]
    fn test_terminal_states() {
        assert!(OrchestratorState::Cancelled.is_terminal());
        assert!(OrchestratorState::RolledBack.is_terminal());
        assert!(!OrchestratorState::Executing.is_terminal());
    }
}
