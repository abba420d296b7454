use crate::domain::model::ErrorRecord;
use crate::utils::error::{ErrorCode, ImportError};
use chrono::Utc;

/// 可恢復錯誤的固定處理建議表
pub fn recovery_hint(code: ErrorCode) -> Option<&'static str> {
    match code {
        ErrorCode::RemoteApiError
        | ErrorCode::SessionAcquisitionFailed
        | ErrorCode::SessionExpiredMidOperation => Some("retry with a fresh provider session"),
        ErrorCode::PersistenceFailed => Some("roll back the import and retry the batch"),
        ErrorCode::ValidationFailed => Some("skip the invalid record and continue"),
        ErrorCode::Timeout => Some("retry with a smaller batch size"),
        ErrorCode::RollbackFailed => Some("review the imported data manually"),
        ErrorCode::ConfigurationInvalid | ErrorCode::Cancelled | ErrorCode::Unknown => None,
    }
}

/// Append-only log of everything that went wrong during one import.
#[derive(Debug, Clone, Default)]
pub struct ErrorLedger {
    records: Vec<ErrorRecord>,
}

impl ErrorLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &mut self,
        code: ErrorCode,
        message: impl Into<String>,
        context: impl Into<String>,
        recoverable: bool,
    ) {
        let record = ErrorRecord {
            code,
            message: message.into(),
            context: context.into(),
            recoverable,
            timestamp: Utc::now(),
        };
        if recoverable {
            tracing::warn!("⚠️ [{}] {} ({})", record.code, record.message, record.context);
        } else {
            tracing::error!("❌ [{}] {} ({})", record.code, record.message, record.context);
        }
        self.records.push(record);
    }

    /// 以錯誤本身的分類記錄
    pub fn record_error(&mut self, error: &ImportError, context: impl Into<String>) {
        self.record(error.code(), error.to_string(), context, error.is_recoverable());
    }

    /// 記錄導致任務終止的錯誤，一律視為不可恢復
    pub fn record_fatal(&mut self, error: &ImportError, context: impl Into<String>) {
        self.record(error.code(), error.to_string(), context, false);
    }

    pub fn records(&self) -> &[ErrorRecord] {
        &self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn has_unrecoverable(&self) -> bool {
        self.records.iter().any(|r| !r.recoverable)
    }

    pub fn recoverable_count(&self) -> usize {
        self.records.iter().filter(|r| r.recoverable).count()
    }

    /// 兩段式報告：先列不可恢復錯誤，再列可恢復問題與建議
    pub fn summarize(&self) -> String {
        let (fatal, recovered): (Vec<&ErrorRecord>, Vec<&ErrorRecord>) =
            self.records.iter().partition(|r| !r.recoverable);

        let mut lines = Vec::new();

        if fatal.is_empty() {
            lines.push("Critical errors: none".to_string());
        } else {
            lines.push(format!("Critical errors ({}):", fatal.len()));
            for record in &fatal {
                lines.push(format!(
                    "  - [{}] {} (during {})",
                    record.code, record.message, record.context
                ));
            }
        }

        if recovered.is_empty() {
            lines.push("Recovered issues: none".to_string());
        } else {
            lines.push(format!("Recovered issues ({}):", recovered.len()));
            for record in &recovered {
                let mut line = format!(
                    "  - [{}] {} (during {})",
                    record.code, record.message, record.context
                );
                if let Some(hint) = recovery_hint(record.code) {
                    line.push_str(&format!("\n    Suggested action: {}", hint));
                }
                lines.push(line);
            }
        }

        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_ledger_summary_has_both_sections() {
        let ledger = ErrorLedger::new();
        let summary = ledger.summarize();
        assert!(summary.contains("Critical errors: none"));
        assert!(summary.contains("Recovered issues: none"));
        assert!(!ledger.has_unrecoverable());
    }

    #[test]
    fn test_summary_lists_fatal_first_and_one_hint() {
        let mut ledger = ErrorLedger::new();
        ledger.record(
            ErrorCode::RemoteApiError,
            "provider returned 503 for page 3",
            "execution:users",
            true,
        );
        ledger.record(
            ErrorCode::ValidationFailed,
            "selective import requires usernames",
            "validation",
            false,
        );

        let summary = ledger.summarize();
        assert!(summary.contains("provider returned 503 for page 3"));
        assert!(summary.contains("selective import requires usernames"));
        assert_eq!(summary.matches("Suggested action:").count(), 1);
        assert!(summary.contains("retry with a fresh provider session"));

        let fatal_at = summary.find("Critical errors (1)").unwrap();
        let recovered_at = summary.find("Recovered issues (1)").unwrap();
        assert!(fatal_at < recovered_at);
        assert!(ledger.has_unrecoverable());
        assert_eq!(ledger.recoverable_count(), 1);
    }

    #[test]
    fn test_record_error_uses_error_classification() {
        let mut ledger = ErrorLedger::new();
        ledger.record_error(
            &ImportError::OperationTimeout {
                operation: "users:page-0".into(),
                timeout: std::time::Duration::from_secs(5),
            },
            "execution:users",
        );
        ledger.record_fatal(
            &ImportError::OperationTimeout {
                operation: "users:page-0".into(),
                timeout: std::time::Duration::from_secs(5),
            },
            "execution:users",
        );

        assert_eq!(ledger.records().len(), 2);
        assert!(ledger.records()[0].recoverable);
        assert!(!ledger.records()[1].recoverable);
        assert_eq!(ledger.records()[0].code, ErrorCode::Timeout);
    }
}
