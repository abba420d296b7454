use crate::utils::error::{ErrorCode, ImportError, Result};
use crate::utils::validation::Validate;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// 從追蹤服務取得的一筆原始資料
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub data: HashMap<String, serde_json::Value>,
}

impl Record {
    pub fn from_object(object: serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            data: object.into_iter().collect(),
        }
    }

    /// 依序嘗試 id / username / plate 作為識別鍵
    pub fn identifier(&self) -> Option<String> {
        ["id", "username", "plate"].iter().find_map(|key| {
            self.data.get(*key).and_then(|value| match value {
                serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
                serde_json::Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityKind {
    User,
    Vehicle,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::User => "users",
            EntityKind::Vehicle => "vehicles",
        }
    }

    /// 對應追蹤服務的查詢動作
    pub fn query_action(&self) -> &'static str {
        match self {
            EntityKind::User => "list_users",
            EntityKind::Vehicle => "list_vehicles",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImportType {
    #[serde(alias = "users_only")]
    UsersOnly,
    #[serde(alias = "vehicles_only")]
    VehiclesOnly,
    #[serde(alias = "complete_system")]
    CompleteSystem,
    Selective,
}

impl ImportType {
    pub const ALL: [ImportType; 4] = [
        ImportType::UsersOnly,
        ImportType::VehiclesOnly,
        ImportType::CompleteSystem,
        ImportType::Selective,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ImportType::UsersOnly => "users-only",
            ImportType::VehiclesOnly => "vehicles-only",
            ImportType::CompleteSystem => "complete-system",
            ImportType::Selective => "selective",
        }
    }

    /// 執行階段要依序匯入的實體種類
    pub fn entity_kinds(&self) -> &'static [EntityKind] {
        match self {
            ImportType::UsersOnly => &[EntityKind::User],
            ImportType::VehiclesOnly => &[EntityKind::Vehicle],
            ImportType::CompleteSystem | ImportType::Selective => {
                &[EntityKind::User, EntityKind::Vehicle]
            }
        }
    }
}

impl fmt::Display for ImportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImportType {
    type Err = ImportError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        ImportType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| ImportError::ValidationError {
                message: format!(
                    "Unknown import type '{}'. Valid types: {}",
                    s,
                    ImportType::ALL
                        .iter()
                        .map(|t| t.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl PhaseStatus {
    /// 單調遞增的排序：pending < running < (completed | failed)
    pub fn rank(&self) -> u8 {
        match self {
            PhaseStatus::Pending => 0,
            PhaseStatus::Running => 1,
            PhaseStatus::Completed | PhaseStatus::Failed => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 2
    }

    pub fn can_transition_to(&self, next: PhaseStatus) -> bool {
        match (self, next) {
            (PhaseStatus::Pending, PhaseStatus::Running) => true,
            (PhaseStatus::Pending, PhaseStatus::Failed) => true,
            (PhaseStatus::Running, PhaseStatus::Running) => true,
            (PhaseStatus::Running, PhaseStatus::Completed | PhaseStatus::Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::Running => "running",
            PhaseStatus::Completed => "completed",
            PhaseStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhaseKind {
    Validation,
    Initialization,
    Execution(EntityKind),
    Completion,
}

impl PhaseKind {
    pub fn name(&self) -> String {
        match self {
            PhaseKind::Validation => "validation".to_string(),
            PhaseKind::Initialization => "initialization".to_string(),
            PhaseKind::Execution(kind) => format!("execution:{}", kind),
            PhaseKind::Completion => "completion".to_string(),
        }
    }

    /// 依匯入類型展開完整且有序的階段列表
    pub fn plan(import_type: ImportType) -> Vec<PhaseKind> {
        let mut phases = vec![PhaseKind::Validation, PhaseKind::Initialization];
        phases.extend(
            import_type
                .entity_kinds()
                .iter()
                .map(|kind| PhaseKind::Execution(*kind)),
        );
        phases.push(PhaseKind::Completion);
        phases
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportPhase {
    pub name: String,
    pub status: PhaseStatus,
    pub progress: u8,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub details: String,
}

impl ImportPhase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: PhaseStatus::Pending,
            progress: 0,
            started_at: None,
            completed_at: None,
            details: String::new(),
        }
    }

    /// 套用狀態轉換；進度只增不減
    pub fn transition(
        &mut self,
        status: PhaseStatus,
        progress: u8,
        details: Option<&str>,
    ) -> Result<()> {
        if !self.status.can_transition_to(status) {
            return Err(ImportError::InvalidTransition {
                subject: format!("phase '{}'", self.name),
                from: self.status.to_string(),
                to: status.to_string(),
            });
        }

        let now = Utc::now();
        if self.started_at.is_none() && status != PhaseStatus::Pending {
            self.started_at = Some(now);
        }
        if status.is_terminal() {
            self.completed_at = Some(now);
        }

        self.status = status;
        self.progress = if status == PhaseStatus::Completed {
            100
        } else {
            self.progress.max(progress.min(100))
        };
        if let Some(details) = details {
            self.details = details.to_string();
        }
        Ok(())
    }

    pub fn to_update(&self) -> PhaseUpdate {
        PhaseUpdate {
            phase: self.name.clone(),
            status: self.status,
            progress: self.progress,
            details: (!self.details.is_empty()).then(|| self.details.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityCounts {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
}

impl EntityCounts {
    pub fn absorb(&mut self, outcome: &BatchOutcome) {
        self.total += outcome.successful + outcome.failed;
        self.successful += outcome.successful;
        self.failed += outcome.failed;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportCounts {
    pub users: EntityCounts,
    pub vehicles: EntityCounts,
}

impl ImportCounts {
    pub fn for_kind_mut(&mut self, kind: EntityKind) -> &mut EntityCounts {
        match kind {
            EntityKind::User => &mut self.users,
            EntityKind::Vehicle => &mut self.vehicles,
        }
    }

    pub fn total_failed(&self) -> usize {
        self.users.failed + self.vehicles.failed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportOptions {
    pub import_type: ImportType,
    #[serde(default)]
    pub selected_usernames: Vec<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub rollback_on_failure: bool,
}

pub(crate) fn default_batch_size() -> usize {
    50
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            import_type: ImportType::CompleteSystem,
            selected_usernames: Vec::new(),
            batch_size: default_batch_size(),
            rollback_on_failure: false,
        }
    }
}

impl ImportOptions {
    pub fn new(import_type: ImportType) -> Self {
        Self {
            import_type,
            ..Self::default()
        }
    }

    pub fn with_usernames(mut self, usernames: Vec<String>) -> Self {
        self.selected_usernames = usernames;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_rollback_on_failure(mut self, enabled: bool) -> Self {
        self.rollback_on_failure = enabled;
        self
    }
}

pub const MAX_BATCH_SIZE: usize = 100;

impl Validate for ImportOptions {
    fn validate(&self) -> Result<()> {
        if !(1..=MAX_BATCH_SIZE).contains(&self.batch_size) {
            return Err(ImportError::ValidationError {
                message: format!(
                    "Batch size must be between 1 and {}, got {}",
                    MAX_BATCH_SIZE, self.batch_size
                ),
            });
        }

        if self.import_type == ImportType::Selective && self.selected_usernames.is_empty() {
            return Err(ImportError::ValidationError {
                message: "Selective import requires at least one username".to_string(),
            });
        }

        if self.selected_usernames.iter().any(|u| u.trim().is_empty()) {
            return Err(ImportError::ValidationError {
                message: "Selected usernames must not be blank".to_string(),
            });
        }
        Ok(())
    }
}

/// 協調器持有的權威任務狀態
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportJob {
    pub id: JobId,
    pub import_type: ImportType,
    pub status: JobStatus,
    pub phases: Vec<ImportPhase>,
    pub counts: ImportCounts,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub rolled_back_at: Option<DateTime<Utc>>,
}

impl ImportJob {
    pub fn new(id: JobId, import_type: ImportType) -> Self {
        Self {
            id,
            import_type,
            status: JobStatus::Pending,
            phases: PhaseKind::plan(import_type)
                .iter()
                .map(|kind| ImportPhase::new(kind.name()))
                .collect(),
            counts: ImportCounts::default(),
            created_at: Utc::now(),
            completed_at: None,
            rolled_back_at: None,
        }
    }

    pub fn phase(&self, name: &str) -> Option<&ImportPhase> {
        self.phases.iter().find(|p| p.name == name)
    }

    pub fn phase_mut(&mut self, name: &str) -> Option<&mut ImportPhase> {
        self.phases.iter_mut().find(|p| p.name == name)
    }

    pub fn running_phase(&self) -> Option<&ImportPhase> {
        self.phases
            .iter()
            .find(|p| p.status == PhaseStatus::Running)
    }

    /// 所有階段都到達終態才算完成
    pub fn is_done(&self) -> bool {
        self.phases.iter().all(|p| p.status.is_terminal())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseUpdate {
    pub phase: String,
    pub status: PhaseStatus,
    pub progress: u8,
    pub details: Option<String>,
}

/// 持久層中可被輪詢的任務快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub options: ImportOptions,
    pub status: JobStatus,
    pub phases: Vec<PhaseUpdate>,
    pub counts: ImportCounts,
    pub error: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobSnapshot {
    pub fn to_result(&self, recovered_errors: usize) -> ImportResult {
        ImportResult {
            job_id: self.job_id.clone(),
            status: self.status,
            counts: self.counts,
            started_at: self.created_at,
            completed_at: self.completed_at.unwrap_or(self.updated_at),
            recovered_errors,
        }
    }
}

/// 變更通知管道推送的內容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseNotification {
    pub job_id: JobId,
    pub phase: String,
    pub status: PhaseStatus,
    pub progress: u8,
}

impl PhaseNotification {
    pub fn to_update(&self) -> PhaseUpdate {
        PhaseUpdate {
            phase: self.phase.clone(),
            status: self.status,
            progress: self.progress,
            details: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub phase: String,
    pub phase_progress: u8,
    pub overall_progress: u8,
    pub current_operation: String,
    pub details: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub code: ErrorCode,
    pub message: String,
    pub context: String,
    pub recoverable: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub principal: String,
    pub secret: String,
}

impl Credentials {
    pub fn new(principal: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            secret: secret.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("principal", &self.principal)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// 追蹤服務核發的限時憑證
#[derive(Clone, PartialEq, Eq)]
pub struct ExternalSession {
    pub token: String,
    pub principal: String,
    pub expires_at: DateTime<Utc>,
}

impl ExternalSession {
    pub fn new(
        token: impl Into<String>,
        principal: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            token: token.into(),
            principal: principal.into(),
            expires_at,
        }
    }

    /// 僅在 now + margin < expires_at 時可用
    pub fn is_valid_at(&self, now: DateTime<Utc>, margin: chrono::Duration) -> bool {
        now + margin < self.expires_at
    }
}

impl fmt::Debug for ExternalSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalSession")
            .field("token", &"<redacted>")
            .field("principal", &self.principal)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupEntry {
    pub kind: EntityKind,
    pub reference: String,
    pub record_count: usize,
}

/// 任務開始時擷取的備份清單，供 advisory rollback 使用
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub captured_at: DateTime<Utc>,
    pub entries: Vec<BackupEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub successful: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    JobStarted,
    PhaseCompleted,
    JobCompleted,
    JobFailed,
    JobCancelled,
    RollbackAttempted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub kind: AuditKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(kind: AuditKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportResult {
    pub job_id: JobId,
    pub status: JobStatus,
    pub counts: ImportCounts,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub recovered_errors: usize,
}

/// Outcome of an advisory rollback. `restored == false` means the data may
/// still contain partially imported records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackReport {
    pub job_id: JobId,
    pub restored: bool,
    pub warnings: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_plan_per_import_type() {
        let names: Vec<String> = PhaseKind::plan(ImportType::CompleteSystem)
            .iter()
            .map(|p| p.name())
            .collect();
        assert_eq!(
            names,
            vec![
                "validation",
                "initialization",
                "execution:users",
                "execution:vehicles",
                "completion"
            ]
        );

        let names: Vec<String> = PhaseKind::plan(ImportType::VehiclesOnly)
            .iter()
            .map(|p| p.name())
            .collect();
        assert_eq!(
            names,
            vec!["validation", "initialization", "execution:vehicles", "completion"]
        );
    }

    #[test]
    fn test_phase_transitions_are_monotonic() {
        let mut phase = ImportPhase::new("execution:users");
        phase.transition(PhaseStatus::Running, 10, None).unwrap();
        phase.transition(PhaseStatus::Running, 40, Some("page 2")).unwrap();
        // 進度不倒退
        phase.transition(PhaseStatus::Running, 20, None).unwrap();
        assert_eq!(phase.progress, 40);
        assert_eq!(phase.details, "page 2");

        phase.transition(PhaseStatus::Completed, 0, None).unwrap();
        assert_eq!(phase.progress, 100);
        assert!(phase.completed_at.is_some());

        assert!(phase.transition(PhaseStatus::Running, 0, None).is_err());
        assert!(phase.transition(PhaseStatus::Failed, 0, None).is_err());
    }

    #[test]
    fn test_job_done_only_when_all_phases_terminal() {
        let mut job = ImportJob::new(JobId::new("job-1"), ImportType::UsersOnly);
        assert!(!job.is_done());
        for phase in job.phases.iter_mut() {
            phase.transition(PhaseStatus::Running, 0, None).unwrap();
            phase.transition(PhaseStatus::Completed, 100, None).unwrap();
        }
        assert!(job.is_done());
    }

    #[test]
    fn test_import_type_parsing() {
        assert_eq!(
            "selective".parse::<ImportType>().unwrap(),
            ImportType::Selective
        );
        assert_eq!(
            "complete_system".parse::<ImportType>().unwrap(),
            ImportType::CompleteSystem
        );
        let err = "everything".parse::<ImportType>().unwrap_err();
        assert!(err.to_string().contains("users-only"));
    }

    #[test]
    fn test_options_deserialize_from_camel_case() {
        let options: ImportOptions = serde_json::from_value(serde_json::json!({
            "importType": "selective",
            "selectedUsernames": []
        }))
        .unwrap();
        assert_eq!(options.import_type, ImportType::Selective);
        assert!(options.selected_usernames.is_empty());
        assert_eq!(options.batch_size, 50);
    }

    #[test]
    fn test_options_validation() {
        assert!(ImportOptions::default().validate().is_ok());

        let err = ImportOptions::new(ImportType::Selective).validate().unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationFailed);
        assert!(err.to_string().contains("username"));

        assert!(ImportOptions::new(ImportType::Selective)
            .with_usernames(vec!["driver01".into()])
            .validate()
            .is_ok());
        assert!(ImportOptions::default().with_batch_size(0).validate().is_err());
        assert!(ImportOptions::default().with_batch_size(101).validate().is_err());
        assert!(ImportOptions::default()
            .with_usernames(vec![" ".into()])
            .validate()
            .is_err());
    }

    #[test]
    fn test_session_validity_and_redaction() {
        let now = Utc::now();
        let session = ExternalSession::new("secret-token", "fleet", now + chrono::Duration::hours(24));
        assert!(session.is_valid_at(now, chrono::Duration::zero()));
        assert!(!session.is_valid_at(now + chrono::Duration::hours(25), chrono::Duration::zero()));
        assert!(!format!("{:?}", session).contains("secret-token"));

        let credentials = Credentials::new("fleet", "hunter2");
        assert!(!format!("{:?}", credentials).contains("hunter2"));
    }

    #[test]
    fn test_record_identifier() {
        let record = Record::from_object(
            serde_json::json!({"username": "driver01", "name": "A"})
                .as_object()
                .cloned()
                .unwrap(),
        );
        assert_eq!(record.identifier().as_deref(), Some("driver01"));

        let record = Record::from_object(serde_json::json!({"id": 7}).as_object().cloned().unwrap());
        assert_eq!(record.identifier().as_deref(), Some("7"));

        let record = Record {
            data: HashMap::new(),
        };
        assert!(record.identifier().is_none());
    }
}
