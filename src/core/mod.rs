//! 核心编排层：错误与恢复、会话状态、会话监管、健康检查、编排器与 worker

pub mod error;
pub mod health;
pub mod orchestrator;
pub mod recovery;
pub mod session_supervisor;
pub mod shutdown;
pub mod state;
pub mod worker;

pub use error::{AutomationError, ErrorClass, RecoveryAction};
pub use health::{HealthMonitor, HealthReport, HealthStatus};
pub use orchestrator::{Orchestrator, StartParams, StartedSession};
pub use recovery::{ErrorContext, ErrorRecoveryEngine, RecoveryPolicy};
pub use session_supervisor::SessionSupervisor;
pub use shutdown::{ShutdownManager, ShutdownReason};
pub use state::{ContextId, Progress, SessionId, SessionStatus};
