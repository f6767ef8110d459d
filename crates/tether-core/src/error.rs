//! Core error types for tether

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Top-level error type for the tether ecosystem
#[derive(Error, Debug)]
pub enum TetherError {
    /// Credential error
    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    /// Binary provisioning error
    #[error("Provisioning error: {0}")]
    Provision(#[from] ProvisionError),

    /// Backend process error
    #[error("Backend error: {0}")]
    Supervisor(#[from] SupervisorError),

    /// Control-plane request error
    #[error("Control plane error: {0}")]
    ControlPlane(#[from] ControlPlaneError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Credential-related errors
#[derive(Error, Debug)]
pub enum CredentialError {
    /// Instance secret is not exactly 32 bytes
    #[error("Instance secret must be 32 bytes, got {0}")]
    InvalidSecretLength(usize),

    /// Instance secret is not valid hex
    #[error("Instance secret is not valid hex: {0}")]
    InvalidSecretEncoding(#[from] hex::FromHexError),

    /// Admin key could not be parsed
    #[error("Malformed admin key: {0}")]
    MalformedToken(String),

    /// Admin key uses a version we cannot decrypt
    #[error("Unsupported admin key version: {0}")]
    UnsupportedVersion(u8),

    /// AEAD encryption or decryption failed
    #[error("Admin key encryption failed")]
    Encryption,

    /// keys.json could not be read or written
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// keys.json is not valid JSON
    #[error("Invalid credentials file: {0}")]
    Json(#[from] serde_json::Error),
}

/// Binary acquisition errors
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// No backend build exists for this OS
    #[error("Unsupported platform: {os}/{arch}")]
    UnsupportedPlatform { os: String, arch: String },

    /// No release carries an asset for the platform target
    #[error("No release asset found for target {0}")]
    AssetNotFound(String),

    /// Release index or archive download failed
    #[error("Download failed: {0}")]
    DownloadFailed(String),

    /// Archive extraction failed
    #[error("Extraction failed: {0}")]
    ExtractionFailed(String),

    /// Cache directory I/O error
    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Backend process supervision errors
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// Backend never answered the health endpoint
    #[error("Backend did not become healthy within {0:?}")]
    HealthCheckTimeout(Duration),

    /// Backend process could not be started
    #[error("Backend process failed to start: {0}")]
    ProcessStartFailed(String),

    /// Deploy command failed; carries captured stdout and stderr
    #[error("Deploy failed: {output}")]
    DeployFailed { output: String },

    /// Operation requires a running backend
    #[error("Backend not started")]
    NotStarted,

    /// Backend directory or port I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Control-plane HTTP errors
#[derive(Error, Debug)]
pub enum ControlPlaneError {
    /// No port has been assigned to the backend yet
    #[error("Backend not started")]
    BackendNotStarted,

    /// Backend answered with a non-2xx status
    #[error("Request failed with status {status}: {body}")]
    Status { status: u16, body: String },

    /// Transport-level failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Result alias used across tether crates
pub type Result<T, E = TetherError> = std::result::Result<T, E>;
