use crate::core::ledger::ErrorLedger;
use crate::core::session::SessionManager;
use crate::core::supervisor::TimeoutSupervisor;
use crate::domain::model::{EntityCounts, EntityKind, PhaseKind, Record};
use crate::domain::ports::{RecordSink, TrackingProvider};
use crate::utils::error::{ErrorCode, ImportError, Result};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    pub batch_size: usize,
    pub retry_attempts: u32,
    pub operation_timeout: Duration,
    /// 單頁逾時後可再嘗試的次數
    pub operation_timeout_retries: u32,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            retry_attempts: 3,
            operation_timeout: Duration::from_secs(120),
            operation_timeout_retries: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub records: Vec<Record>,
    /// 原始項目數，含無法解析的項目
    pub size: usize,
    /// 不是 JSON 物件的項目，(位置, 說明)
    pub invalid: Vec<(usize, String)>,
    pub total: Option<usize>,
}

/// 接受純陣列，或帶 items / data / records 與 total 的物件
pub fn parse_page(payload: &Value) -> Result<Page> {
    let (items, total) = match payload {
        Value::Array(items) => (items, None),
        Value::Object(object) => {
            let items = ["items", "data", "records"]
                .iter()
                .find_map(|key| object.get(*key).and_then(Value::as_array))
                .ok_or_else(|| ImportError::ValidationError {
                    message: "provider page has no items array".to_string(),
                })?;
            let total = object
                .get("total")
                .and_then(Value::as_u64)
                .map(|t| t as usize);
            (items, total)
        }
        other => {
            return Err(ImportError::ValidationError {
                message: format!("unexpected provider page: {}", other),
            })
        }
    };

    let mut records = Vec::with_capacity(items.len());
    let mut invalid = Vec::new();
    for (index, item) in items.iter().enumerate() {
        match item.as_object() {
            Some(object) => records.push(Record::from_object(object.clone())),
            None => invalid.push((index, format!("expected an object, got {}", item))),
        }
    }
    Ok(Page {
        records,
        size: items.len(),
        invalid,
        total,
    })
}

pub fn query_params(offset: usize, limit: usize, usernames: &[String]) -> Value {
    let mut params = json!({ "offset": offset, "limit": limit });
    if !usernames.is_empty() {
        params["usernames"] = json!(usernames);
    }
    params
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageProgress {
    pub kind: EntityKind,
    pub page: usize,
    pub fetched: usize,
    pub counts: EntityCounts,
    pub progress: u8,
    pub details: String,
}

/// Pulls one entity kind page by page from the tracking provider and applies
/// every page through the record sink.
pub struct EntityImport<'a> {
    kind: EntityKind,
    phase: String,
    provider: Arc<dyn TrackingProvider>,
    sessions: &'a SessionManager,
    supervisor: &'a TimeoutSupervisor,
    sink: &'a dyn RecordSink,
    settings: &'a ExecutionSettings,
    usernames: &'a [String],
    offset: usize,
    page: usize,
    total: Option<usize>,
    counts: EntityCounts,
    exhausted: bool,
}

impl<'a> EntityImport<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kind: EntityKind,
        provider: Arc<dyn TrackingProvider>,
        sessions: &'a SessionManager,
        supervisor: &'a TimeoutSupervisor,
        sink: &'a dyn RecordSink,
        settings: &'a ExecutionSettings,
        usernames: &'a [String],
    ) -> Self {
        Self {
            kind,
            phase: PhaseKind::Execution(kind).name(),
            provider,
            sessions,
            supervisor,
            sink,
            settings,
            usernames,
            offset: 0,
            page: 0,
            total: None,
            counts: EntityCounts::default(),
            exhausted: false,
        }
    }

    pub fn counts(&self) -> EntityCounts {
        self.counts
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    async fn fetch(&self, ledger: &mut ErrorLedger) -> Result<Value> {
        let action = self.kind.query_action();
        let params = query_params(self.offset, self.settings.batch_size, self.usernames);
        let op_id = format!("{}:page-{}", self.kind, self.page);
        let mut timeouts = 0;

        loop {
            let attempt = self.sessions.with_retry(action, self.settings.retry_attempts, |session| {
                let provider = Arc::clone(&self.provider);
                let params = params.clone();
                async move { provider.query(&session, action, &params).await }
            });

            match self
                .supervisor
                .with_timeout(&op_id, self.settings.operation_timeout, attempt)
                .await
            {
                Ok(payload) => return Ok(payload),
                Err(e @ ImportError::OperationTimeout { .. })
                    if timeouts < self.settings.operation_timeout_retries =>
                {
                    timeouts += 1;
                    ledger.record_error(&e, self.phase.as_str());
                    tracing::warn!(
                        "🔄 Retrying {} after timeout ({}/{})",
                        op_id,
                        timeouts,
                        self.settings.operation_timeout_retries
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Fetches and applies the next page. Returns `None` once the provider
    /// has no more records.
    pub async fn next_page(&mut self, ledger: &mut ErrorLedger) -> Result<Option<PageProgress>> {
        if self.exhausted {
            return Ok(None);
        }

        let payload = self.fetch(ledger).await?;
        let page = parse_page(&payload)?;
        if page.total.is_some() {
            self.total = page.total;
        }

        let fetched = page.size;
        if fetched == 0 {
            self.exhausted = true;
            tracing::debug!("📭 No more {} after {} record(s)", self.kind, self.offset);
            return Ok(None);
        }

        for (index, reason) in &page.invalid {
            ledger.record(
                ErrorCode::ValidationFailed,
                format!("{} record #{} skipped: {}", self.kind, self.offset + index, reason),
                self.phase.as_str(),
                true,
            );
        }
        self.counts.total += page.invalid.len();
        self.counts.failed += page.invalid.len();

        if !page.records.is_empty() {
            match self.sink.apply_batch(self.kind, &page.records).await {
                Ok(outcome) => {
                    for message in &outcome.errors {
                        ledger.record(ErrorCode::ValidationFailed, message.as_str(), self.phase.as_str(), true);
                    }
                    self.counts.absorb(&outcome);
                }
                Err(e) => {
                    ledger.record(e.code(), e.to_string(), self.phase.as_str(), true);
                    self.counts.total += page.records.len();
                    self.counts.failed += page.records.len();
                }
            }
        }

        self.supervisor.heartbeat()?;

        self.offset += fetched;
        self.page += 1;
        if fetched < self.settings.batch_size || self.total.is_some_and(|t| self.offset >= t) {
            self.exhausted = true;
        }

        let progress = match self.total {
            Some(total) if total > 0 => ((self.offset * 100) / total).min(99) as u8,
            _ => (self.page * 10).min(95) as u8,
        };
        let details = match self.total {
            Some(total) => format!("{}/{} {} processed", self.offset, total, self.kind),
            None => format!("{} {} processed", self.offset, self.kind),
        };

        tracing::info!(
            "📦 {} page {}: {} fetched, {} ok, {} failed",
            self.kind,
            self.page,
            fetched,
            self.counts.successful,
            self.counts.failed
        );

        Ok(Some(PageProgress {
            kind: self.kind,
            page: self.page,
            fetched,
            counts: self.counts,
            progress,
            details,
        }))
    }
}
