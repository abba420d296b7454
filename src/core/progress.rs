use crate::core::supervisor::CancellationHandle;
use crate::domain::model::{JobId, JobSnapshot, JobStatus, PhaseStatus, PhaseUpdate, ProgressEvent};
use crate::domain::ports::{ChangeFeed, JobStore};
use crate::utils::error::{ImportError, Result};
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct ProgressConfig {
    pub poll_interval: Duration,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// 進度更新的來源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSource {
    Local,
    Push,
    Poll,
}

pub type ProgressCallback = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

#[derive(Debug, Clone)]
struct PhaseView {
    name: String,
    status: PhaseStatus,
    progress: u8,
    details: Option<String>,
}

struct AggregatorInner {
    phases: Mutex<Vec<PhaseView>>,
    delivery: Mutex<()>,
    subscribers: Mutex<Vec<ProgressCallback>>,
}

impl AggregatorInner {
    /// Merges one update into the per-phase view and notifies subscribers
    /// when it moved anything forward. Stale or duplicate updates are
    /// dropped, so every subscriber sees non-decreasing progress.
    ///
    /// Callbacks run after the view lock is released, one event at a time
    /// and in merge order.
    fn observe(&self, update: &PhaseUpdate, source: UpdateSource) -> Option<ProgressEvent> {
        let mut phases = self.phases.lock();

        let Some(index) = phases.iter().position(|p| p.name == update.phase) else {
            tracing::debug!("📊 Ignoring update for unknown phase '{}'", update.phase);
            return None;
        };

        let view = &mut phases[index];
        let status = if update.status.rank() > view.status.rank() {
            update.status
        } else {
            view.status
        };
        let progress = if status == PhaseStatus::Completed {
            100
        } else {
            view.progress.max(update.progress.min(100))
        };
        let details_changed = update.details.is_some() && update.details != view.details;

        if status == view.status && progress == view.progress && !details_changed {
            return None;
        }

        view.status = status;
        view.progress = progress;
        if details_changed {
            view.details = update.details.clone();
        }

        let current_operation = match status {
            PhaseStatus::Pending => format!("Waiting for {}", view.name),
            PhaseStatus::Running => format!("Running {}", view.name),
            PhaseStatus::Completed => format!("Completed {}", view.name),
            PhaseStatus::Failed => format!("{} failed", view.name),
        };
        let event = ProgressEvent {
            phase: view.name.clone(),
            phase_progress: progress,
            overall_progress: 0,
            current_operation,
            details: view.details.clone(),
        };

        let total: u32 = phases.iter().map(|p| p.progress as u32).sum();
        let event = ProgressEvent {
            overall_progress: (total / phases.len().max(1) as u32) as u8,
            ..event
        };

        // 先取得派送鎖再放開狀態鎖，保持事件順序
        let delivery = self.delivery.lock();
        drop(phases);

        tracing::debug!(
            "📊 [{:?}] {} {}% (overall {}%)",
            source,
            event.phase,
            event.phase_progress,
            event.overall_progress
        );

        let subscribers = self.subscribers.lock().clone();
        for subscriber in &subscribers {
            subscriber(&event);
        }
        drop(delivery);
        Some(event)
    }
}

/// Reconciles pushed change notifications with periodic polling of the job
/// store into one ordered progress stream.
pub struct ProgressAggregator {
    store: Arc<dyn JobStore>,
    feed: Option<Arc<dyn ChangeFeed>>,
    config: ProgressConfig,
    inner: Arc<AggregatorInner>,
    stop: Mutex<Option<CancellationToken>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ProgressAggregator {
    pub fn new(
        phase_names: Vec<String>,
        store: Arc<dyn JobStore>,
        feed: Option<Arc<dyn ChangeFeed>>,
        config: ProgressConfig,
    ) -> Self {
        let phases = phase_names
            .into_iter()
            .map(|name| PhaseView {
                name,
                status: PhaseStatus::Pending,
                progress: 0,
                details: None,
            })
            .collect();
        Self {
            store,
            feed,
            config,
            inner: Arc::new(AggregatorInner {
                phases: Mutex::new(phases),
                delivery: Mutex::new(()),
                subscribers: Mutex::new(Vec::new()),
            }),
            stop: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, callback: ProgressCallback) {
        self.inner.subscribers.lock().push(callback);
    }

    pub fn observe(&self, update: &PhaseUpdate, source: UpdateSource) -> Option<ProgressEvent> {
        self.inner.observe(update, source)
    }

    /// 各階段目前的 (名稱, 進度)
    pub fn phase_progress(&self) -> Vec<(String, u8)> {
        self.inner
            .phases
            .lock()
            .iter()
            .map(|p| (p.name.clone(), p.progress))
            .collect()
    }

    pub fn overall_progress(&self) -> u8 {
        let phases = self.inner.phases.lock();
        let total: u32 = phases.iter().map(|p| p.progress as u32).sum();
        (total / phases.len().max(1) as u32) as u8
    }

    /// 啟動輪詢與推播兩個背景任務，跟隨 `parent` 一起停止
    pub fn start(&self, job_id: &JobId, parent: &CancellationToken) {
        let mut stop = self.stop.lock();
        if stop.as_ref().is_some_and(|token| !token.is_cancelled()) {
            return;
        }
        let token = parent.child_token();
        let mut tasks = self.tasks.lock();

        {
            let token = token.clone();
            let store = Arc::clone(&self.store);
            let inner = Arc::clone(&self.inner);
            let job_id = job_id.clone();
            let period = self.config.poll_interval;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => match store.get_job(&job_id).await {
                            Ok(snapshot) => {
                                for update in &snapshot.phases {
                                    inner.observe(update, UpdateSource::Poll);
                                }
                            }
                            Err(e) => tracing::warn!("⚠️ Progress poll failed: {}", e),
                        },
                    }
                }
            }));
        }

        match self.feed.as_ref().and_then(|feed| feed.subscribe(job_id)) {
            Some(mut stream) => {
                let token = token.clone();
                let inner = Arc::clone(&self.inner);
                let job_id = job_id.clone();
                tasks.push(tokio::spawn(async move {
                    loop {
                        let notification = tokio::select! {
                            _ = token.cancelled() => break,
                            next = stream.next() => match next {
                                Some(notification) => notification,
                                None => break,
                            },
                        };
                        if notification.job_id == job_id {
                            inner.observe(&notification.to_update(), UpdateSource::Push);
                        }
                    }
                }));
            }
            None => tracing::debug!("📊 No change feed available, relying on polling"),
        }

        *stop = Some(token);
    }

    pub fn stop(&self) {
        if let Some(token) = self.stop.lock().take() {
            token.cancel();
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// 讀取一次權威狀態並合併進度
    pub async fn poll_once(&self, job_id: &JobId) -> Result<JobSnapshot> {
        let snapshot = self.store.get_job(job_id).await?;
        for update in &snapshot.phases {
            self.inner.observe(update, UpdateSource::Poll);
        }
        Ok(snapshot)
    }

    /// Polls the job store until the job reaches a terminal status. A failed
    /// job is rebuilt into an error from its stored payload; a breached
    /// deadline or cancellation on `cancel` ends the wait immediately. Poll
    /// errors other than an unknown job are logged and the poll repeats.
    pub async fn await_completion(
        &self,
        job_id: &JobId,
        cancel: &CancellationHandle,
    ) -> Result<JobSnapshot> {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancel.to_error()),
                _ = ticker.tick() => {
                    let snapshot = match self.poll_once(job_id).await {
                        Ok(snapshot) => snapshot,
                        Err(e @ ImportError::JobNotFound { .. }) => return Err(e),
                        Err(e) => {
                            tracing::warn!("⚠️ Completion poll failed, retrying: {}", e);
                            continue;
                        }
                    };
                    match snapshot.status {
                        JobStatus::Completed => return Ok(snapshot),
                        JobStatus::Failed => {
                            return Err(ImportError::from_payload(snapshot.error.as_ref()))
                        }
                        JobStatus::Cancelled => {
                            let reason = snapshot
                                .error
                                .as_ref()
                                .and_then(|e| e.get("message"))
                                .and_then(|m| m.as_str())
                                .unwrap_or("job was cancelled")
                                .to_string();
                            return Err(ImportError::Cancelled { reason });
                        }
                        JobStatus::Pending | JobStatus::Running => {}
                    }
                }
            }
        }
    }
}

impl Drop for ProgressAggregator {
    fn drop(&mut self) {
        if let Some(token) = self.stop.get_mut().take() {
            token.cancel();
        }
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}
