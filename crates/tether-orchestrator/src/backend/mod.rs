//! Backend process management
//!
//! - `ports`: ephemeral port selection
//! - `health`: readiness polling with exponential backoff
//! - `registry`: PID tracking across host restarts
//! - `supervisor`: spawn, stop and deploy

pub mod health;
pub mod ports;
mod registry;
mod supervisor;

pub use health::{wait_for_healthy, ExponentialBackoff};
pub use registry::{BackendRegistry, RegisteredBackend};
pub use supervisor::{BackendEndpoint, BackendHandle, BackendStatus, BackendSupervisor};
