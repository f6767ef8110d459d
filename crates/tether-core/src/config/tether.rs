//! Orchestrator configuration

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::{duration_millis, duration_secs};
use super::FunctionCallSpec;
use crate::credentials::ProvidedCredentials;

/// Configuration for a tether session, usually read from `tether.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    /// State directory and credential settings
    pub state: StateConfig,

    /// Backend binary acquisition
    pub binary: BinaryConfig,

    /// Backend process settings
    pub backend: BackendConfig,

    /// Deploy command and file watching
    pub deploy: DeployConfig,

    /// Environment variables pushed to the backend after it starts
    pub env: BTreeMap<String, String>,

    /// Functions invoked in order after the initial deploy
    pub functions: Vec<FunctionCallSpec>,
}

/// Where backend state lives and how it is keyed
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Directory under the project root holding per-identity state
    pub dir_name: String,

    /// Extra discriminator mixed into the state identity
    pub suffix: Option<String>,

    /// Discard persisted state and start fresh
    pub reset: bool,

    /// Instance name override (defaults to one derived from the state identity)
    pub instance_name: Option<String>,

    /// Explicit credentials instead of generated ones
    pub credentials: Option<ProvidedCredentials>,

    /// How long to wait for `git` when reading the branch
    #[serde(with = "duration_secs")]
    pub branch_timeout: Duration,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir_name: ".state".to_string(),
            suffix: None,
            reset: false,
            instance_name: None,
            credentials: None,
            branch_timeout: Duration::from_secs(5),
        }
    }
}

/// Backend binary download and cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BinaryConfig {
    /// Use this backend binary instead of downloading one
    pub path: Option<PathBuf>,

    /// Directory holding downloaded binaries
    pub cache_dir: PathBuf,

    /// How long a cached binary is reused without consulting the release index.
    /// Zero always consults the index.
    #[serde(with = "duration_secs")]
    pub cache_ttl: Duration,

    /// Release index (most recent release first)
    pub release_index_url: String,

    /// Asset name prefix; the platform target and `.zip` are appended
    pub artifact_prefix: String,

    /// User agent sent to the release host
    pub user_agent: String,
}

impl Default for BinaryConfig {
    fn default() -> Self {
        Self {
            path: None,
            cache_dir: super::default_cache_dir(),
            cache_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            release_index_url:
                "https://api.github.com/repos/get-convex/convex-backend/releases?per_page=50"
                    .to_string(),
            artifact_prefix: "convex-local-backend".to_string(),
            user_agent: concat!("tether/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Backend process settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Hard deadline for the backend to answer `/version`
    #[serde(with = "duration_secs")]
    pub health_timeout: Duration,

    /// Backoff between health probes
    pub health_backoff: BackoffConfig,

    /// Storage subdirectory inside the state directory
    pub storage_dir: String,

    /// SQLite file inside the state directory
    pub sqlite_file: String,

    /// Remove the state directory when the orchestrator shuts down
    pub purge_on_exit: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            health_timeout: Duration::from_secs(10),
            health_backoff: BackoffConfig::default(),
            storage_dir: "convex_local_storage".to_string(),
            sqlite_file: "convex_local_backend.sqlite3".to_string(),
            purge_on_exit: false,
        }
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "duration_millis")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_millis")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(1000),
            multiplier: 1.5,
        }
    }
}

/// Deploy command and file-watch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    /// Program and leading arguments; `--url` and `--admin-key` are appended
    pub command: Vec<String>,

    /// Deploy subprocess timeout
    #[serde(with = "duration_secs")]
    pub timeout: Duration,

    /// Quiet period after the last file change before a deploy is requested
    #[serde(with = "duration_millis")]
    pub debounce: Duration,

    /// Capacity of the file-change queue
    pub queue_capacity: usize,

    /// Directories (relative to the project root) whose changes trigger deploys
    pub watch_dirs: Vec<PathBuf>,

    /// Path components that never trigger deploys
    pub ignore: Vec<String>,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "npx".to_string(),
                "convex".to_string(),
                "deploy".to_string(),
            ],
            timeout: Duration::from_secs(120),
            debounce: Duration::from_millis(500),
            queue_capacity: 64,
            watch_dirs: vec![PathBuf::from("convex")],
            ignore: vec![
                "_generated".to_string(),
                "node_modules".to_string(),
                ".git".to_string(),
                ".state".to_string(),
            ],
        }
    }
}
