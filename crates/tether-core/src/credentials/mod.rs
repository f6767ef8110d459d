//! Backend instance credentials
//!
//! Each state directory holds a `keys.json` with the instance name, the
//! hex-encoded instance secret and an admin key issued under that secret.
//! Credentials are generated once and reloaded on every later run so the
//! backend's stored data stays readable across restarts.
//!
//! # Precedence
//!
//! 1. Without `reset`, an existing `keys.json` wins and is returned as-is.
//! 2. Caller-supplied credentials are persisted and used, with or without `reset`.
//! 3. Otherwise a fresh secret and admin key are generated and persisted.

pub mod admin_key;

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::CredentialError;
pub use admin_key::{
    decrypt_admin_key, generate_secret, issue_admin_key, AdminKeyClaims, DEFAULT_MEMBER_ID,
    SECRET_LEN,
};

/// Credentials file name inside the state directory
pub const KEYS_FILENAME: &str = "keys.json";

/// Instance name, secret and admin key for one backend state
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialSet {
    /// Instance name passed to the backend
    pub instance_name: String,
    /// 32-byte instance secret
    pub instance_secret: [u8; SECRET_LEN],
    /// Encrypted admin key (`<name>|<hex>`)
    pub admin_key: String,
}

impl CredentialSet {
    /// Generate a fresh secret and admin key
    pub fn generate(instance_name: &str) -> Result<Self, CredentialError> {
        Self::from_secret(instance_name, generate_secret())
    }

    /// Issue an admin key under an existing secret
    pub fn from_secret(
        instance_name: &str,
        instance_secret: [u8; SECRET_LEN],
    ) -> Result<Self, CredentialError> {
        let admin_key =
            issue_admin_key(instance_name, &instance_secret, DEFAULT_MEMBER_ID, false)?;
        Ok(Self {
            instance_name: instance_name.to_string(),
            instance_secret,
            admin_key,
        })
    }

    /// Hex encoding of the secret, as the backend expects it on its command line
    pub fn secret_hex(&self) -> String {
        hex::encode(self.instance_secret)
    }
}

// Keep the secret out of logs.
impl std::fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialSet")
            .field("instance_name", &self.instance_name)
            .field("instance_secret", &"<redacted>")
            .field("admin_key", &"<redacted>")
            .finish()
    }
}

/// Credentials supplied by the caller instead of generated ones
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidedCredentials {
    /// Instance name; defaults to the session's instance name
    #[serde(default)]
    pub instance_name: Option<String>,
    /// Hex-encoded 32-byte secret
    pub instance_secret: String,
    /// Admin key; issued from the secret when absent
    #[serde(default)]
    pub admin_key: Option<String>,
}

/// On-disk shape of `keys.json`
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeysFile {
    instance_name: String,
    instance_secret: String,
    admin_key: String,
}

/// Path of the credentials file inside a state directory
pub fn keys_path(state_dir: &Path) -> PathBuf {
    state_dir.join(KEYS_FILENAME)
}

/// Load the credentials for a state directory, creating them if needed
pub fn load_or_create(
    state_dir: &Path,
    instance_name: &str,
    provided: Option<&ProvidedCredentials>,
    reset: bool,
) -> Result<CredentialSet, CredentialError> {
    let path = keys_path(state_dir);

    if !reset {
        if let Some(credentials) = read_keys(&path)? {
            tracing::info!("Loaded credentials for {} from {:?}", credentials.instance_name, path);
            return Ok(credentials);
        }
    }

    let credentials = match provided {
        Some(provided) => {
            tracing::info!("Using provided credentials");
            from_provided(provided, instance_name)?
        }
        None => {
            tracing::info!("Generating credentials for {}", instance_name);
            CredentialSet::generate(instance_name)?
        }
    };

    write_keys(&path, &credentials)?;
    Ok(credentials)
}

fn from_provided(
    provided: &ProvidedCredentials,
    default_name: &str,
) -> Result<CredentialSet, CredentialError> {
    let instance_name = provided.instance_name.as_deref().unwrap_or(default_name);
    let instance_secret = decode_secret(&provided.instance_secret)?;

    match &provided.admin_key {
        Some(admin_key) => Ok(CredentialSet {
            instance_name: instance_name.to_string(),
            instance_secret,
            admin_key: admin_key.clone(),
        }),
        None => CredentialSet::from_secret(instance_name, instance_secret),
    }
}

/// Decode a hex secret, requiring exactly 32 bytes
pub fn decode_secret(secret_hex: &str) -> Result<[u8; SECRET_LEN], CredentialError> {
    let bytes = hex::decode(secret_hex.trim())?;
    <[u8; SECRET_LEN]>::try_from(bytes.as_slice())
        .map_err(|_| CredentialError::InvalidSecretLength(bytes.len()))
}

fn read_keys(path: &Path) -> Result<Option<CredentialSet>, CredentialError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(CredentialError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let keys: KeysFile = serde_json::from_str(&contents)?;
    Ok(Some(CredentialSet {
        instance_secret: decode_secret(&keys.instance_secret)?,
        instance_name: keys.instance_name,
        admin_key: keys.admin_key,
    }))
}

/// Overwrite `keys.json`, creating the state directory if needed
fn write_keys(path: &Path, credentials: &CredentialSet) -> Result<(), CredentialError> {
    let io_err = |source| CredentialError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }

    let keys = KeysFile {
        instance_name: credentials.instance_name.clone(),
        instance_secret: credentials.secret_hex(),
        admin_key: credentials.admin_key.clone(),
    };
    let json = serde_json::to_string_pretty(&keys)?;
    fs::write(path, json).map_err(io_err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(io_err)?;
    }

    tracing::debug!("Wrote credentials to {:?}", path);
    Ok(())
}
