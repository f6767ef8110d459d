//! Redeploys driven by source changes
//!
//! File changes pass through a [`WatchFilter`], are batched by the debouncer,
//! and each batch asks the [`DeployCoordinator`] for a deploy.

mod coordinator;
mod debounce;

pub use coordinator::{DeployCoordinator, DeployCoordinatorState, DeployRequest, Deployer};
pub use debounce::{run_debouncer, ChangeKind, FileChange, WatchFilter};
