pub mod executor;
pub mod ledger;
pub mod orchestrator;
pub mod progress;
pub mod session;
pub mod supervisor;

pub use ledger::ErrorLedger;
pub use orchestrator::{ImportOrchestrator, OrchestratorConfig, OrchestratorState};
pub use progress::{ProgressAggregator, ProgressConfig};
pub use session::{SessionConfig, SessionManager};
pub use supervisor::{CancellationHandle, SupervisorConfig, TimeoutSupervisor};
