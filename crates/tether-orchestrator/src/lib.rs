//! tether-orchestrator: Supervises a local backend during development
//!
//! The orchestrator downloads and runs the backend binary against a
//! per-branch state directory, keeps it authenticated and configured, and
//! redeploys the project's functions as the source tree changes.

pub mod backend;
pub mod binary;
pub mod control;
pub mod deploy;
pub mod env;
pub mod orchestrator;

pub use env::{EnvContext, EnvSource};
pub use orchestrator::Orchestrator;
