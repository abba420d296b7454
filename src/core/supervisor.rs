use crate::domain::model::JobId;
use crate::utils::error::{ImportError, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub total_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// 允許連續漏掉的心跳次數
    pub heartbeat_tolerance: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            total_timeout: Duration::from_secs(45 * 60),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_tolerance: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Armed,
    Completed,
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationKind {
    Cancelled,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancellationRecord {
    pub kind: CancellationKind,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

impl CancellationRecord {
    pub fn to_error(&self) -> ImportError {
        match self.kind {
            CancellationKind::TimedOut => ImportError::JobTimeout {
                reason: self.reason.clone(),
            },
            CancellationKind::Cancelled => ImportError::Cancelled {
                reason: self.reason.clone(),
            },
        }
    }
}

/// Shared, terminal cancellation flag. Once triggered it never resets; the
/// first trigger's reason wins.
#[derive(Debug, Clone, Default)]
pub struct CancellationHandle {
    token: CancellationToken,
    record: Arc<OnceLock<CancellationRecord>>,
}

impl CancellationHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self, kind: CancellationKind, reason: impl Into<String>) -> bool {
        let record = CancellationRecord {
            kind,
            reason: reason.into(),
            timestamp: Utc::now(),
        };
        if self.record.set(record).is_ok() {
            self.token.cancel();
            true
        } else {
            false
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.record.get().is_some()
    }

    pub fn record(&self) -> Option<CancellationRecord> {
        self.record.get().cloned()
    }

    /// 已取消時回傳對應錯誤（逾時與取消分開）
    pub fn check(&self) -> Result<()> {
        match self.record.get() {
            Some(record) => Err(record.to_error()),
            None => Ok(()),
        }
    }

    pub fn to_error(&self) -> ImportError {
        self.record
            .get()
            .map(CancellationRecord::to_error)
            .unwrap_or_else(|| ImportError::Cancelled {
                reason: "cancellation requested".to_string(),
            })
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

type CancelCallback = Box<dyn FnOnce(&CancellationRecord) + Send>;

struct OperationDeadline {
    deadline: Instant,
    reported: bool,
}

struct SupervisorShared {
    config: SupervisorConfig,
    handle: CancellationHandle,
    state: Mutex<SupervisorState>,
    last_heartbeat: Mutex<Instant>,
    operations: Mutex<HashMap<String, OperationDeadline>>,
    overdue: Mutex<Vec<String>>,
    on_cancel: Mutex<Option<CancelCallback>>,
    watchers: CancellationToken,
}

impl SupervisorShared {
    /// Armed/Idle -> Cancelled|TimedOut，只會成功一次
    fn terminate(&self, kind: CancellationKind, reason: String) -> bool {
        {
            let mut state = self.state.lock();
            if !matches!(*state, SupervisorState::Idle | SupervisorState::Armed) {
                return false;
            }
            *state = match kind {
                CancellationKind::Cancelled => SupervisorState::Cancelled,
                CancellationKind::TimedOut => SupervisorState::TimedOut,
            };
        }

        self.handle.trigger(kind, reason);
        self.watchers.cancel();

        let callback = self.on_cancel.lock().take();
        if let (Some(callback), Some(record)) = (callback, self.handle.record()) {
            callback(&record);
        }
        true
    }

    /// 檢查心跳與操作期限；回傳 false 表示已逾時終止
    fn check_liveness(&self) -> bool {
        let now = Instant::now();
        let mut newly_overdue = Vec::new();
        // 期限內仍在執行的操作視為存活
        let mut busy = false;
        for (op_id, op) in self.operations.lock().iter_mut() {
            if now < op.deadline {
                busy = true;
            } else if !op.reported {
                op.reported = true;
                newly_overdue.push(op_id.clone());
            }
        }
        if !newly_overdue.is_empty() {
            for op_id in &newly_overdue {
                tracing::warn!("⏱️ Operation '{}' exceeded its deadline", op_id);
            }
            self.overdue.lock().extend(newly_overdue);
        }

        let allowed = self.config.heartbeat_interval * self.config.heartbeat_tolerance.max(1);
        let silent_for = self.last_heartbeat.lock().elapsed();
        if silent_for > allowed && !busy {
            tracing::warn!(
                "💔 No heartbeat for {:?} (tolerance {} x {:?})",
                silent_for,
                self.config.heartbeat_tolerance,
                self.config.heartbeat_interval
            );
            self.terminate(
                CancellationKind::TimedOut,
                format!(
                    "no heartbeat for {:?} (tolerance {} missed intervals)",
                    silent_for, self.config.heartbeat_tolerance
                ),
            );
            return false;
        }
        true
    }
}

/// Watches the total job deadline, heartbeat liveness and per-operation
/// deadlines for one job.
pub struct TimeoutSupervisor {
    shared: Arc<SupervisorShared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TimeoutSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self::with_handle(config, CancellationHandle::new())
    }

    pub fn with_handle(config: SupervisorConfig, handle: CancellationHandle) -> Self {
        Self {
            shared: Arc::new(SupervisorShared {
                config,
                handle,
                state: Mutex::new(SupervisorState::Idle),
                last_heartbeat: Mutex::new(Instant::now()),
                operations: Mutex::new(HashMap::new()),
                overdue: Mutex::new(Vec::new()),
                on_cancel: Mutex::new(None),
                watchers: CancellationToken::new(),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn handle(&self) -> CancellationHandle {
        self.shared.handle.clone()
    }

    pub fn state(&self) -> SupervisorState {
        *self.shared.state.lock()
    }

    /// 註冊取消回呼；終止時最多呼叫一次
    pub fn on_cancel<F>(&self, callback: F)
    where
        F: FnOnce(&CancellationRecord) + Send + 'static,
    {
        *self.shared.on_cancel.lock() = Some(Box::new(callback));
    }

    /// Idle -> Armed，啟動總時限計時器與心跳檢查
    pub fn start(&self, job_id: &JobId) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if *state != SupervisorState::Idle {
                return Err(ImportError::InvalidTransition {
                    subject: "timeout supervisor".to_string(),
                    from: format!("{:?}", *state),
                    to: "Armed".to_string(),
                });
            }
            *state = SupervisorState::Armed;
        }
        *self.shared.last_heartbeat.lock() = Instant::now();

        let config = &self.shared.config;
        tracing::info!(
            "⏱️ Supervising job {} (total {:?}, heartbeat every {:?}, tolerance {})",
            job_id,
            config.total_timeout,
            config.heartbeat_interval,
            config.heartbeat_tolerance
        );

        let deadline = {
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                let total = shared.config.total_timeout;
                tokio::select! {
                    _ = shared.watchers.cancelled() => {}
                    _ = tokio::time::sleep(total) => {
                        tracing::warn!("⏱️ Total job deadline of {:?} exceeded", total);
                        shared.terminate(
                            CancellationKind::TimedOut,
                            format!("total job deadline of {:?} exceeded", total),
                        );
                    }
                }
            })
        };

        let heartbeat = {
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                let period = shared.config.heartbeat_interval;
                let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                loop {
                    tokio::select! {
                        _ = shared.watchers.cancelled() => break,
                        _ = ticker.tick() => {
                            if !shared.check_liveness() {
                                break;
                            }
                        }
                    }
                }
            })
        };

        self.tasks.lock().extend([deadline, heartbeat]);
        Ok(())
    }

    /// 證明任務仍在進行；已終止時立即失敗
    pub fn heartbeat(&self) -> Result<()> {
        self.shared.handle.check()?;
        *self.shared.last_heartbeat.lock() = Instant::now();
        Ok(())
    }

    pub fn start_operation(&self, op_id: &str, timeout: Duration) {
        self.shared.operations.lock().insert(
            op_id.to_string(),
            OperationDeadline {
                deadline: Instant::now() + timeout,
                reported: false,
            },
        );
    }

    pub fn clear_operation(&self, op_id: &str) {
        self.shared.operations.lock().remove(op_id);
    }

    /// 取出心跳檢查發現已逾時、尚未處理的操作
    pub fn take_overdue_operations(&self) -> Vec<String> {
        std::mem::take(&mut *self.shared.overdue.lock())
    }

    pub fn cancel(&self, reason: &str) -> bool {
        let cancelled = self
            .shared
            .terminate(CancellationKind::Cancelled, reason.to_string());
        if cancelled {
            tracing::warn!("🛑 Import cancelled: {}", reason);
        }
        cancelled
    }

    /// Armed -> Completed，停止所有背景檢查
    pub fn complete(&self) -> bool {
        let completed = {
            let mut state = self.shared.state.lock();
            if *state == SupervisorState::Armed {
                *state = SupervisorState::Completed;
                true
            } else {
                false
            }
        };
        self.shared.watchers.cancel();
        completed
    }

    /// 不改變狀態，只停止背景檢查（任務已因其他原因失敗）
    pub fn stop(&self) {
        self.shared.watchers.cancel();
    }

    /// Runs `op` under a per-operation deadline and the shared cancellation.
    /// An operation timeout does not cancel the job.
    pub async fn with_timeout<T, F>(&self, op_id: &str, timeout: Duration, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.shared.handle.check()?;
        self.start_operation(op_id, timeout);

        let outcome = tokio::select! {
            biased;
            _ = self.shared.handle.cancelled() => Err(self.shared.handle.to_error()),
            result = op => result,
            _ = tokio::time::sleep(timeout) => {
                tracing::warn!("⏱️ Operation '{}' timed out after {:?}", op_id, timeout);
                Err(ImportError::OperationTimeout {
                    operation: op_id.to_string(),
                    timeout,
                })
            }
        };

        self.clear_operation(op_id);
        outcome
    }
}

impl Drop for TimeoutSupervisor {
    fn drop(&mut self) {
        self.shared.watchers.cancel();
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}
