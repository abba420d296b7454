#[cfg(feature = "cli")]
pub mod cli;

use crate::core::orchestrator::OrchestratorConfig;
use crate::core::progress::ProgressConfig;
use crate::core::session::SessionConfig;
use crate::core::supervisor::SupervisorConfig;
use crate::domain::model::{Credentials, ImportOptions, ImportType};
use crate::utils::error::{ImportError, Result};
use crate::utils::validation::{
    validate_non_empty_string, validate_positive_number, validate_range, validate_url, Validate,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportConfig {
    pub provider: ProviderConfig,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub timeouts: TimeoutSection,
    #[serde(default)]
    pub progress: ProgressSection,
    #[serde(default)]
    pub import: ImportSection,
    #[serde(default)]
    pub monitoring: MonitoringSection,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub base_url: String,
    pub principal: String,
    pub secret: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("base_url", &self.base_url)
            .field("principal", &self.principal)
            .field("secret", &"<redacted>")
            .field("request_timeout_seconds", &self.request_timeout_seconds)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub revalidate_interval_seconds: u64,
    pub expiry_margin_seconds: u64,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            revalidate_interval_seconds: 600,
            expiry_margin_seconds: 30,
            retry_attempts: 3,
            retry_base_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSection {
    pub total_seconds: u64,
    pub heartbeat_interval_seconds: u64,
    pub heartbeat_tolerance: u32,
    pub operation_seconds: u64,
    pub operation_timeout_retries: u32,
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            total_seconds: 45 * 60,
            heartbeat_interval_seconds: 30,
            heartbeat_tolerance: 3,
            operation_seconds: 120,
            operation_timeout_retries: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressSection {
    pub poll_interval_ms: u64,
}

impl Default for ProgressSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportSection {
    pub r#type: ImportType,
    pub selected_usernames: Vec<String>,
    pub batch_size: usize,
    pub rollback_on_failure: bool,
}

impl Default for ImportSection {
    fn default() -> Self {
        let options = ImportOptions::default();
        Self {
            r#type: options.import_type,
            selected_usernames: options.selected_usernames,
            batch_size: options.batch_size,
            rollback_on_failure: options.rollback_on_failure,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringSection {
    pub enabled: bool,
}

fn default_request_timeout() -> u64 {
    30
}

impl ImportConfig {
    /// 從 TOML 檔案載入配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(ImportError::IoError)?;
        Self::from_toml_str(&content)
    }

    /// 從 TOML 字串解析配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let processed_content = Self::substitute_env_vars(content)?;

        toml::from_str(&processed_content).map_err(|e| ImportError::ConfigError {
            message: format!("TOML parsing error: {}", e),
        })
    }

    /// 替換環境變數 (例如 ${TRACKING_SECRET})，未設定的保留原樣
    fn substitute_env_vars(content: &str) -> Result<String> {
        use regex::Regex;
        let re = Regex::new(r"\$\{([^}]+)\}").map_err(|e| ImportError::ConfigError {
            message: format!("invalid substitution pattern: {}", e),
        })?;

        let result = re.replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
        });

        Ok(result.to_string())
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.provider.principal.clone(), self.provider.secret.clone())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.provider.request_timeout_seconds)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            revalidate_interval: Duration::from_secs(self.session.revalidate_interval_seconds),
            expiry_margin: Duration::from_secs(self.session.expiry_margin_seconds),
            retry_base_delay: Duration::from_millis(self.session.retry_base_delay_ms),
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            total_timeout: Duration::from_secs(self.timeouts.total_seconds),
            heartbeat_interval: Duration::from_secs(self.timeouts.heartbeat_interval_seconds),
            heartbeat_tolerance: self.timeouts.heartbeat_tolerance,
        }
    }

    pub fn progress_config(&self) -> ProgressConfig {
        ProgressConfig {
            poll_interval: Duration::from_millis(self.progress.poll_interval_ms),
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            credentials: self.credentials(),
            session: self.session_config(),
            supervisor: self.supervisor_config(),
            progress: self.progress_config(),
            retry_attempts: self.session.retry_attempts,
            operation_timeout: Duration::from_secs(self.timeouts.operation_seconds),
            operation_timeout_retries: self.timeouts.operation_timeout_retries,
            monitoring: self.monitoring.enabled,
        }
    }

    pub fn import_options(&self) -> ImportOptions {
        ImportOptions::new(self.import.r#type)
            .with_usernames(self.import.selected_usernames.clone())
            .with_batch_size(self.import.batch_size)
            .with_rollback_on_failure(self.import.rollback_on_failure)
    }
}

impl Validate for ImportConfig {
    fn validate(&self) -> Result<()> {
        validate_url("provider.base_url", &self.provider.base_url)?;
        validate_non_empty_string("provider.principal", &self.provider.principal)?;
        if self.provider.secret.is_empty() {
            return Err(ImportError::MissingConfigError {
                field: "provider.secret".to_string(),
            });
        }
        validate_positive_number(
            "provider.request_timeout_seconds",
            self.provider.request_timeout_seconds,
            1,
        )?;

        validate_positive_number(
            "session.revalidate_interval_seconds",
            self.session.revalidate_interval_seconds,
            1,
        )?;
        validate_range("session.retry_attempts", self.session.retry_attempts, 1, 10)?;

        validate_positive_number("timeouts.total_seconds", self.timeouts.total_seconds, 1)?;
        validate_positive_number(
            "timeouts.heartbeat_interval_seconds",
            self.timeouts.heartbeat_interval_seconds,
            1,
        )?;
        validate_range("timeouts.heartbeat_tolerance", self.timeouts.heartbeat_tolerance, 1, 100)?;
        validate_positive_number("timeouts.operation_seconds", self.timeouts.operation_seconds, 1)?;
        validate_positive_number("progress.poll_interval_ms", self.progress.poll_interval_ms, 1)?;

        self.import_options().validate()
    }
}
