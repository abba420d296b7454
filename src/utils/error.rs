use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// 對外公開的錯誤分類碼
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ConfigurationInvalid,
    SessionAcquisitionFailed,
    SessionExpiredMidOperation,
    ValidationFailed,
    RemoteApiError,
    PersistenceFailed,
    Timeout,
    Cancelled,
    RollbackFailed,
    Unknown,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConfigurationInvalid => "CONFIGURATION_INVALID",
            ErrorCode::SessionAcquisitionFailed => "SESSION_ACQUISITION_FAILED",
            ErrorCode::SessionExpiredMidOperation => "SESSION_EXPIRED_MID_OPERATION",
            ErrorCode::ValidationFailed => "VALIDATION_FAILED",
            ErrorCode::RemoteApiError => "REMOTE_API_ERROR",
            ErrorCode::PersistenceFailed => "PERSISTENCE_FAILED",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::RollbackFailed => "ROLLBACK_FAILED",
            ErrorCode::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// 遠端追蹤服務回傳訊息中代表 session/授權失效的關鍵字
const SESSION_FAILURE_PATTERNS: &[&str] = &["session", "token", "unauthorized", "expired"];

/// 無法結構化分類時，以訊息內容判斷是否為 session 相關失敗
pub fn looks_like_session_failure(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    SESSION_FAILURE_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Typed failure surfaced by a remote tracking provider.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("authentication expired or invalid: {0}")]
    AuthExpired(String),

    #[error("rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    pub fn is_session_related(&self) -> bool {
        match self {
            ProviderError::AuthExpired(_) => true,
            ProviderError::Other(message) => looks_like_session_failure(message),
            ProviderError::RateLimited { .. } | ProviderError::Unavailable(_) => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Invalid value '{value}' for '{field}': {reason}")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Missing required configuration field: {field}")]
    MissingConfigError { field: String },

    #[error("Validation error: {message}")]
    ValidationError { message: String },

    #[error("Failed to acquire provider session: {source}")]
    SessionAcquisitionFailed { source: ProviderError },

    #[error("Provider session expired during {operation}: {source}")]
    SessionExpired {
        operation: String,
        source: ProviderError,
    },

    #[error("Provider request failed during {operation}: {source}")]
    RemoteApiError {
        operation: String,
        source: ProviderError,
    },

    #[error("Persistence error: {message}")]
    PersistenceError { message: String },

    #[error("Import timed out: {reason}")]
    JobTimeout { reason: String },

    #[error("Operation '{operation}' timed out after {timeout:?}")]
    OperationTimeout { operation: String, timeout: Duration },

    #[error("Import cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("Import job failed ({code}): {message}")]
    JobFailed { code: ErrorCode, message: String },

    #[error("Import job not found: {job_id}")]
    JobNotFound { job_id: String },

    #[error("Another import is already running")]
    ImportInProgress { job_id: Option<String> },

    #[error("Illegal transition for {subject}: {from} -> {to}")]
    InvalidTransition {
        subject: String,
        from: String,
        to: String,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl ImportError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ImportError::ConfigError { .. }
            | ImportError::InvalidConfigValueError { .. }
            | ImportError::MissingConfigError { .. } => ErrorCode::ConfigurationInvalid,
            ImportError::ValidationError { .. } | ImportError::ImportInProgress { .. } => {
                ErrorCode::ValidationFailed
            }
            ImportError::SessionAcquisitionFailed { .. } => ErrorCode::SessionAcquisitionFailed,
            ImportError::SessionExpired { .. } => ErrorCode::SessionExpiredMidOperation,
            ImportError::RemoteApiError { .. } => ErrorCode::RemoteApiError,
            ImportError::PersistenceError { .. } => ErrorCode::PersistenceFailed,
            ImportError::JobTimeout { .. } | ImportError::OperationTimeout { .. } => {
                ErrorCode::Timeout
            }
            ImportError::Cancelled { .. } => ErrorCode::Cancelled,
            ImportError::JobFailed { code, .. } => *code,
            ImportError::JobNotFound { .. }
            | ImportError::InvalidTransition { .. }
            | ImportError::IoError(_)
            | ImportError::SerializationError(_) => ErrorCode::Unknown,
        }
    }

    /// 單一錯誤本身是否不至於讓整個匯入失效
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ImportError::OperationTimeout { .. })
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self.code() {
            ErrorCode::RollbackFailed => ErrorSeverity::Low,
            ErrorCode::Cancelled | ErrorCode::Timeout | ErrorCode::RemoteApiError => {
                ErrorSeverity::Medium
            }
            ErrorCode::ValidationFailed
            | ErrorCode::SessionAcquisitionFailed
            | ErrorCode::SessionExpiredMidOperation => ErrorSeverity::High,
            ErrorCode::ConfigurationInvalid | ErrorCode::PersistenceFailed | ErrorCode::Unknown => {
                ErrorSeverity::Critical
            }
        }
    }

    pub fn recovery_suggestion(&self) -> &'static str {
        match self.code() {
            ErrorCode::ConfigurationInvalid => {
                "Check the provider URL and credentials in the configuration file"
            }
            ErrorCode::SessionAcquisitionFailed | ErrorCode::SessionExpiredMidOperation => {
                "Verify the tracking account credentials and retry with a fresh session"
            }
            ErrorCode::ValidationFailed => "Correct the import options and start the import again",
            ErrorCode::RemoteApiError => "Wait for the tracking provider to recover and retry",
            ErrorCode::PersistenceFailed => "Check the database connection, then roll back and retry",
            ErrorCode::Timeout => "Retry with a smaller batch size or a longer timeout",
            ErrorCode::Cancelled => "Start a new import when ready",
            ErrorCode::RollbackFailed => "Review the imported data manually; rollback is best-effort",
            ErrorCode::Unknown => "Check the logs for details",
        }
    }

    /// 給終端使用者看的訊息，區分逾時、取消與服務端拒絕
    pub fn user_friendly_message(&self) -> String {
        match self.code() {
            ErrorCode::Timeout => format!("The import took too long and was stopped ({})", self),
            ErrorCode::Cancelled => "The import was cancelled".to_string(),
            ErrorCode::RemoteApiError
            | ErrorCode::SessionAcquisitionFailed
            | ErrorCode::SessionExpiredMidOperation => {
                format!("The tracking provider rejected the request: {}", self)
            }
            ErrorCode::ValidationFailed | ErrorCode::ConfigurationInvalid => {
                format!("The import could not start: {}", self)
            }
            _ => format!("The import failed: {}", self),
        }
    }

    /// 寫入持久層的失敗內容
    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "code": self.code(),
            "message": self.to_string(),
        })
    }

    pub fn from_payload(payload: Option<&serde_json::Value>) -> Self {
        let code = payload
            .and_then(|p| p.get("code"))
            .and_then(|c| serde_json::from_value::<ErrorCode>(c.clone()).ok())
            .unwrap_or(ErrorCode::Unknown);
        let message = payload
            .and_then(|p| p.get("message"))
            .and_then(|m| m.as_str())
            .unwrap_or("import failed without an error payload")
            .to_string();
        ImportError::JobFailed { code, message }
    }
}

pub type Result<T> = std::result::Result<T, ImportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structural_session_classification() {
        assert!(ProviderError::AuthExpired("401".into()).is_session_related());
        assert!(!ProviderError::Unavailable("connection refused".into()).is_session_related());
        assert!(!ProviderError::RateLimited { retry_after: None }.is_session_related());
    }

    #[test]
    fn test_message_heuristic_for_unclassified_errors() {
        assert!(ProviderError::Other("Token expired".into()).is_session_related());
        assert!(ProviderError::Other("UNAUTHORIZED access".into()).is_session_related());
        assert!(ProviderError::Other("invalid session id".into()).is_session_related());
        assert!(!ProviderError::Other("device not found".into()).is_session_related());
    }

    #[test]
    fn test_codes_and_recoverability() {
        let err = ImportError::ValidationError {
            message: "bad".into(),
        };
        assert_eq!(err.code(), ErrorCode::ValidationFailed);
        assert!(!err.is_recoverable());

        let err = ImportError::OperationTimeout {
            operation: "users:page-0".into(),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(err.code(), ErrorCode::Timeout);
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_user_messages_distinguish_timeout_and_cancel() {
        let timeout = ImportError::JobTimeout {
            reason: "deadline".into(),
        };
        let cancelled = ImportError::Cancelled {
            reason: "by user".into(),
        };
        let rejected = ImportError::RemoteApiError {
            operation: "list_users".into(),
            source: ProviderError::Other("bad request".into()),
        };
        assert!(timeout.user_friendly_message().contains("took too long"));
        assert!(cancelled.user_friendly_message().contains("cancelled"));
        assert!(rejected.user_friendly_message().contains("rejected"));
    }

    #[test]
    fn test_payload_round_trip_keeps_code() {
        let err = ImportError::PersistenceError {
            message: "db down".into(),
        };
        let rebuilt = ImportError::from_payload(Some(&err.to_payload()));
        assert_eq!(rebuilt.code(), ErrorCode::PersistenceFailed);
        assert!(rebuilt.to_string().contains("db down"));

        assert_eq!(ImportError::from_payload(None).code(), ErrorCode::Unknown);
    }
}
