//! Shared fixtures for the import integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use fleet_import::adapters::{InMemoryJobStore, InMemoryRecordSink};
use fleet_import::domain::model::{Credentials, ExternalSession, JobId};
use fleet_import::domain::ports::TrackingProvider;
use fleet_import::utils::error::ProviderError;
use fleet_import::{ImportOrchestrator, OrchestratorConfig};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// 可設定分頁資料、延遲與失敗的追蹤服務替身
pub struct MockTrackingProvider {
    users: Vec<Value>,
    vehicles: Vec<Value>,
    query_delay: Mutex<Duration>,
    failures: Mutex<Vec<(String, ProviderError)>>,
    login_failure: Mutex<Option<ProviderError>>,
    healthy: AtomicBool,
    logins: AtomicUsize,
    queries: AtomicUsize,
}

impl MockTrackingProvider {
    pub fn new(user_count: usize, vehicle_count: usize) -> Self {
        Self {
            users: (1..=user_count)
                .map(|i| json!({ "username": format!("driver{:03}", i), "name": format!("Driver {}", i) }))
                .collect(),
            vehicles: (1..=vehicle_count)
                .map(|i| json!({ "plate": format!("FLT-{:04}", i), "owner": format!("driver{:03}", i) }))
                .collect(),
            query_delay: Mutex::new(Duration::ZERO),
            failures: Mutex::new(Vec::new()),
            login_failure: Mutex::new(None),
            healthy: AtomicBool::new(true),
            logins: AtomicUsize::new(0),
            queries: AtomicUsize::new(0),
        }
    }

    pub fn set_query_delay(&self, delay: Duration) {
        *self.query_delay.lock() = delay;
    }

    /// 之後所有此 action 的查詢都回傳指定錯誤
    pub fn fail_action(&self, action: &str, error: ProviderError) {
        self.failures.lock().push((action.to_string(), error));
    }

    /// 之後所有登入都回傳指定錯誤
    pub fn fail_login(&self, error: ProviderError) {
        *self.login_failure.lock() = Some(error);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn login_count(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TrackingProvider for MockTrackingProvider {
    async fn login(
        &self,
        principal: &str,
        _secret: &str,
    ) -> Result<ExternalSession, ProviderError> {
        let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(error) = self.login_failure.lock().clone() {
            return Err(error);
        }
        Ok(ExternalSession::new(
            format!("token-{}", n),
            principal,
            Utc::now() + chrono::Duration::hours(1),
        ))
    }

    async fn query(
        &self,
        _session: &ExternalSession,
        action: &str,
        params: &Value,
    ) -> Result<Value, ProviderError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let delay = *self.query_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failure = self
            .failures
            .lock()
            .iter()
            .find(|(failing, _)| failing == action)
            .map(|(_, error)| error.clone());
        if let Some(error) = failure {
            return Err(error);
        }

        let (records, key) = match action {
            "list_users" => (&self.users, "username"),
            "list_vehicles" => (&self.vehicles, "owner"),
            other => return Err(ProviderError::Other(format!("unknown action {}", other))),
        };
        let source: Vec<Value> = match params.get("usernames").and_then(Value::as_array) {
            Some(wanted) => records
                .iter()
                .filter(|r| wanted.contains(&r[key]))
                .cloned()
                .collect(),
            None => records.clone(),
        };

        let offset = params["offset"].as_u64().unwrap_or(0) as usize;
        let limit = params["limit"].as_u64().unwrap_or(50) as usize;
        let items: Vec<Value> = source.iter().skip(offset).take(limit).cloned().collect();
        Ok(json!({ "items": items, "total": source.len() }))
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProviderError::Unavailable("connection refused".to_string()))
        }
    }
}

pub fn fast_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::new(Credentials::new("fleet-admin", "s3cret"));
    config.session.retry_base_delay = Duration::from_millis(5);
    config.progress.poll_interval = Duration::from_millis(20);
    config.supervisor.heartbeat_interval = Duration::from_millis(500);
    config.operation_timeout = Duration::from_secs(5);
    config
}

pub struct Harness {
    pub provider: Arc<MockTrackingProvider>,
    pub store: Arc<InMemoryJobStore>,
    pub sink: Arc<InMemoryRecordSink>,
    pub orchestrator: Arc<ImportOrchestrator>,
}

pub fn harness(provider: MockTrackingProvider, config: OrchestratorConfig) -> Harness {
    let provider = Arc::new(provider);
    let store = Arc::new(InMemoryJobStore::new());
    let sink = Arc::new(InMemoryRecordSink::new());
    let orchestrator = Arc::new(
        ImportOrchestrator::new(provider.clone(), store.clone(), sink.clone(), config)
            .with_change_feed(store.clone()),
    );
    Harness {
        provider,
        store,
        sink,
        orchestrator,
    }
}

impl Harness {
    /// 單一任務測試中唯一建立的 job id
    pub fn only_job_id(&self) -> JobId {
        let ids = self.store.job_ids();
        assert_eq!(ids.len(), 1, "expected exactly one job");
        ids[0].clone()
    }
}

/// 等待協調器取得正式 job id
pub async fn wait_for_active_job(orchestrator: &ImportOrchestrator) -> JobId {
    loop {
        if let Some(job_id) = orchestrator.active_job() {
            return job_id;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
