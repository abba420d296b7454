use crate::domain::model::{Credentials, ExternalSession};
use crate::domain::ports::TrackingProvider;
use crate::utils::error::{ImportError, ProviderError, Result};
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 時間來源，測試時可替換
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub revalidate_interval: Duration,
    /// 視為即將過期的安全邊界
    pub expiry_margin: Duration,
    pub retry_base_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            revalidate_interval: Duration::from_secs(600),
            expiry_margin: Duration::from_secs(30),
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

type LoginOutcome = std::result::Result<ExternalSession, ProviderError>;
type LoginFuture = Shared<BoxFuture<'static, LoginOutcome>>;

#[derive(Default)]
struct SessionSlot {
    cached: Option<ExternalSession>,
    in_flight: Option<LoginFuture>,
}

struct SessionInner {
    provider: Arc<dyn TrackingProvider>,
    credentials: Credentials,
    config: SessionConfig,
    clock: Arc<dyn Clock>,
    slot: Mutex<SessionSlot>,
    login_count: AtomicUsize,
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}

impl SessionInner {
    fn is_usable(&self, session: &ExternalSession) -> bool {
        session.is_valid_at(self.clock.now(), to_chrono(self.config.expiry_margin))
    }

    fn start_login(&self) -> LoginFuture {
        let provider = Arc::clone(&self.provider);
        let credentials = self.credentials.clone();
        let attempt = self.login_count.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(
            "🔑 Logging in to tracking provider as '{}' (attempt #{})",
            credentials.principal,
            attempt
        );
        async move {
            provider
                .login(&credentials.principal, &credentials.secret)
                .await
        }
        .boxed()
        .shared()
    }

    /// 快取有效則直接回傳；否則加入（或發起）唯一一個進行中的登入
    async fn ensure(&self) -> LoginOutcome {
        let login = {
            let mut slot = self.slot.lock();
            if let Some(session) = &slot.cached {
                if self.is_usable(session) {
                    return Ok(session.clone());
                }
                tracing::debug!("🔑 Cached session expired at {}", session.expires_at);
                slot.cached = None;
            }
            match slot.in_flight.clone() {
                Some(login) => login,
                None => {
                    let login = self.start_login();
                    slot.in_flight = Some(login.clone());
                    login
                }
            }
        };

        let mut result = login.clone().await;
        if let Ok(session) = &result {
            if !session.is_valid_at(self.clock.now(), chrono::Duration::zero()) {
                result = Err(ProviderError::AuthExpired(
                    "provider issued an already expired session".to_string(),
                ));
            }
        }

        let mut slot = self.slot.lock();
        if slot.in_flight.as_ref().is_some_and(|f| f.ptr_eq(&login)) {
            slot.in_flight = None;
            match &result {
                Ok(session) => {
                    tracing::info!("✅ Provider session valid until {}", session.expires_at);
                    slot.cached = Some(session.clone());
                }
                Err(e) => tracing::error!("❌ Provider login failed: {}", e),
            }
        }
        result
    }

    /// 只清除指定 token，避免覆蓋別人剛取得的新 session
    fn invalidate_token(&self, token: &str) -> bool {
        let mut slot = self.slot.lock();
        if slot.cached.as_ref().is_some_and(|s| s.token == token) {
            slot.cached = None;
            true
        } else {
            false
        }
    }

    async fn revalidate(&self, horizon: Duration) {
        let cached = self.slot.lock().cached.clone();
        let needs_refresh = match &cached {
            None => true,
            Some(session) => {
                let lookahead = to_chrono(self.config.expiry_margin + horizon);
                if !session.is_valid_at(self.clock.now(), lookahead) {
                    tracing::info!("🔄 Session expires before next revalidation, refreshing");
                    true
                } else {
                    match self.provider.check_session(session).await {
                        Ok(()) => false,
                        Err(e) if e.is_session_related() => {
                            tracing::warn!("🔄 Session rejected by provider: {}", e);
                            true
                        }
                        Err(e) => {
                            tracing::warn!("⚠️ Session check failed, keeping session: {}", e);
                            false
                        }
                    }
                }
            }
        };

        if !needs_refresh {
            tracing::debug!("🔑 Session revalidated");
            return;
        }
        if let Some(session) = &cached {
            self.invalidate_token(&session.token);
        }
        if let Err(e) = self.ensure().await {
            tracing::warn!("⚠️ Background session refresh failed: {}", e);
        }
    }
}

struct Revalidation {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns the provider credential for one job: deduplicated login, expiry
/// handling, background revalidation and session-aware retries.
pub struct SessionManager {
    inner: Arc<SessionInner>,
    revalidation: Mutex<Option<Revalidation>>,
}

impl SessionManager {
    pub fn new(
        provider: Arc<dyn TrackingProvider>,
        credentials: Credentials,
        config: SessionConfig,
    ) -> Self {
        Self::with_clock(provider, credentials, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        provider: Arc<dyn TrackingProvider>,
        credentials: Credentials,
        config: SessionConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                provider,
                credentials,
                config,
                clock,
                slot: Mutex::new(SessionSlot::default()),
                login_count: AtomicUsize::new(0),
            }),
            revalidation: Mutex::new(None),
        }
    }

    /// 取得可立即使用的 session。登入失敗直接回報，不在此重試。
    pub async fn ensure_valid_session(&self) -> Result<ExternalSession> {
        self.inner
            .ensure()
            .await
            .map_err(|source| ImportError::SessionAcquisitionFailed { source })
    }

    pub fn invalidate(&self) {
        self.inner.slot.lock().cached = None;
    }

    pub fn cached_session(&self) -> Option<ExternalSession> {
        self.inner.slot.lock().cached.clone()
    }

    /// 已發出的遠端登入次數
    pub fn login_count(&self) -> usize {
        self.inner.login_count.load(Ordering::SeqCst)
    }

    /// Starts the background revalidation loop under `parent`. Calling it
    /// again while a loop is running does nothing.
    pub fn prepare_for_long_operation(&self, parent: &CancellationToken) {
        let mut revalidation = self.revalidation.lock();
        if revalidation
            .as_ref()
            .is_some_and(|r| !r.token.is_cancelled() && !r.task.is_finished())
        {
            return;
        }

        let token = parent.child_token();
        let inner = Arc::clone(&self.inner);
        let period = self.inner.config.revalidate_interval;
        let loop_token = token.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = ticker.tick() => inner.revalidate(period).await,
                }
            }
            tracing::debug!("🔑 Session revalidation stopped");
        });

        tracing::info!("🔑 Session revalidation every {:?}", period);
        *revalidation = Some(Revalidation { token, task });
    }

    pub fn stop_long_operation(&self) {
        if let Some(revalidation) = self.revalidation.lock().take() {
            revalidation.token.cancel();
            revalidation.task.abort();
        }
    }

    pub fn is_long_operation_active(&self) -> bool {
        self.revalidation
            .lock()
            .as_ref()
            .is_some_and(|r| !r.token.is_cancelled() && !r.task.is_finished())
    }

    fn backoff(&self, attempt: u32, error: &ProviderError) -> Duration {
        let exponential = self
            .inner
            .config
            .retry_base_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        match error {
            ProviderError::RateLimited {
                retry_after: Some(retry_after),
            } => exponential.max(*retry_after),
            _ => exponential,
        }
    }

    /// Runs `op` with a valid session, retrying up to `max_attempts` times.
    /// The wait after attempt `n` is `retry_base_delay * 2^n` (2 s, 4 s, ...
    /// with the default base). A session-related failure drops the cached
    /// session so the next attempt logs in again, at most once per call.
    pub async fn with_retry<T, F, Fut>(
        &self,
        operation: &str,
        max_attempts: u32,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut(ExternalSession) -> Fut,
        Fut: Future<Output = std::result::Result<T, ProviderError>>,
    {
        let max_attempts = max_attempts.max(1);
        let mut reacquired = false;
        let mut attempt = 0;

        loop {
            attempt += 1;

            let (error, failed_session) = match self.inner.ensure().await {
                Ok(session) => {
                    let token = session.token.clone();
                    match op(session).await {
                        Ok(value) => return Ok(value),
                        Err(e) => (e, Some(token)),
                    }
                }
                Err(e) => (e, None),
            };

            let session_related = failed_session.is_some() && error.is_session_related();

            if attempt >= max_attempts {
                tracing::error!(
                    "❌ {} failed after {} attempt(s): {}",
                    operation,
                    attempt,
                    error
                );
                return Err(match failed_session {
                    None => ImportError::SessionAcquisitionFailed { source: error },
                    Some(_) if session_related => ImportError::SessionExpired {
                        operation: operation.to_string(),
                        source: error,
                    },
                    Some(_) => ImportError::RemoteApiError {
                        operation: operation.to_string(),
                        source: error,
                    },
                });
            }

            if let (true, false, Some(token)) = (session_related, reacquired, &failed_session) {
                self.inner.invalidate_token(token);
                reacquired = true;
                tracing::warn!("🔑 {} hit a session failure, re-acquiring session", operation);
            }

            let delay = self.backoff(attempt, &error);
            tracing::warn!(
                "🔄 {} attempt {}/{} failed: {} (retrying in {:?})",
                operation,
                attempt,
                max_attempts,
                error,
                delay
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// 停止背景檢查並登出（盡力而為）
    pub async fn release(&self) {
        self.stop_long_operation();
        let session = self.inner.slot.lock().cached.take();
        if let Some(session) = session {
            match self.inner.provider.logout(&session).await {
                Ok(()) => tracing::info!("🔑 Provider session released"),
                Err(e) => tracing::warn!("⚠️ Provider logout failed: {}", e),
            }
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Some(revalidation) = self.revalidation.get_mut().take() {
            revalidation.token.cancel();
            revalidation.task.abort();
        }
    }
}
