pub mod adapters;
pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

#[cfg(feature = "cli")]
pub use config::cli::CliArgs;
pub use config::ImportConfig;

pub use adapters::{HttpTrackingProvider, InMemoryJobStore, InMemoryRecordSink};
pub use crate::core::{ImportOrchestrator, OrchestratorConfig, OrchestratorState};
pub use domain::model::{ImportOptions, ImportResult, ImportType, JobId, JobStatus};
pub use utils::error::{ErrorCode, ImportError, Result};
