//! tether-core: Core types and configuration for tether
//!
//! This crate provides the configuration, error types, state identity and
//! credential handling shared by the orchestrator and its binary.

pub mod config;
pub mod credentials;
pub mod error;
pub mod identity;
pub mod pidfile;

pub use credentials::CredentialSet;
pub use error::TetherError;
pub use identity::StateIdentity;
