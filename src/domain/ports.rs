use crate::domain::model::{
    AuditEvent, BackupManifest, BatchOutcome, EntityKind, ExternalSession, ImportCounts,
    ImportOptions, JobId, JobSnapshot, JobStatus, PhaseNotification, PhaseUpdate, Record,
};
use crate::utils::error::{ProviderError, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;

/// 遠端車輛追蹤服務
#[async_trait]
pub trait TrackingProvider: Send + Sync {
    async fn login(
        &self,
        principal: &str,
        secret: &str,
    ) -> std::result::Result<ExternalSession, ProviderError>;

    async fn query(
        &self,
        session: &ExternalSession,
        action: &str,
        params: &serde_json::Value,
    ) -> std::result::Result<serde_json::Value, ProviderError>;

    async fn logout(&self, _session: &ExternalSession) -> std::result::Result<(), ProviderError> {
        Ok(())
    }

    /// Lightweight check used by session revalidation.
    async fn check_session(
        &self,
        _session: &ExternalSession,
    ) -> std::result::Result<(), ProviderError> {
        Ok(())
    }

    async fn health_check(&self) -> std::result::Result<(), ProviderError> {
        Ok(())
    }
}

/// 匯入任務的系統記錄 (system of record)
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn health_check(&self) -> Result<()>;
    async fn create_job(&self, options: &ImportOptions) -> Result<JobId>;
    async fn update_phase(&self, job_id: &JobId, update: &PhaseUpdate) -> Result<()>;
    async fn update_status(
        &self,
        job_id: &JobId,
        status: JobStatus,
        error: Option<serde_json::Value>,
    ) -> Result<()>;
    async fn update_counts(&self, job_id: &JobId, counts: &ImportCounts) -> Result<()>;
    async fn get_job(&self, job_id: &JobId) -> Result<JobSnapshot>;
    async fn append_audit_event(&self, job_id: &JobId, event: AuditEvent) -> Result<()>;
}

/// Best-effort push channel of phase changes. Implementations may return
/// `None` when no feed is available; polling alone must suffice.
pub trait ChangeFeed: Send + Sync {
    fn subscribe(&self, job_id: &JobId) -> Option<BoxStream<'static, PhaseNotification>>;
}

/// 實際寫入使用者/車輛資料的 CRUD 層
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn capture_backup(&self, kinds: &[EntityKind]) -> Result<BackupManifest>;
    async fn apply_batch(&self, kind: EntityKind, records: &[Record]) -> Result<BatchOutcome>;
    async fn restore_backup(&self, manifest: &BackupManifest) -> Result<()>;
}
