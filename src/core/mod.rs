// Deployment engine: targets, remote execution, release storage, hooks and
// the orchestrator that ties them together.
pub mod cancel;
pub mod config;
pub mod defaults;
pub mod deploy;
pub mod error;
pub mod executor;
pub mod hooks;
pub mod host;
pub mod lifecycle;
pub mod lock;
pub mod release;
pub mod roles;
pub mod scm;
pub mod ssh;

// Re-export common types for convenience
pub use cancel::CancelToken;
pub use config::DeployConfig;
pub use deploy::{DeployOutcome, DeployPlan, DeployReport, DeploymentOrchestrator};
pub use error::{Error, ErrorCode, Result};
pub use executor::{RemoteExecutor, Transport};
pub use hooks::{HookHandle, HookRegistry, HookTask};
pub use lifecycle::{Stage, When};
pub use release::{ReleaseDescriptor, ReleaseId, ReleaseStore, SharedPath};
