//! State identity derivation
//!
//! Every (branch, project path, suffix) tuple gets its own backend state
//! directory so that switching branches or running several worktrees side by
//! side never mixes data. The identity is a sanitized, human-readable label
//! followed by a short SHA-256 digest of the full inputs.

use std::fmt;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

/// Branch name used when the VCS cannot be queried
pub const UNKNOWN_BRANCH: &str = "unknown";

/// Number of hex characters kept from the digest
const HASH_LEN: usize = 16;

/// Separator between digest inputs
const SEPARATOR: &str = "\u{0}";

/// Poll interval while waiting for `git`
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Deterministic name for one persisted backend state
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StateIdentity {
    /// Sanitized branch (and suffix)
    pub raw_label: String,
    /// First 16 hex characters of the input digest
    pub hash: String,
}

impl StateIdentity {
    /// Derive an identity from already-known inputs
    pub fn derive(branch: &str, project_path: &Path, suffix: Option<&str>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(branch.as_bytes());
        hasher.update(SEPARATOR.as_bytes());
        hasher.update(project_path.to_string_lossy().as_bytes());
        if let Some(suffix) = suffix {
            hasher.update(SEPARATOR.as_bytes());
            hasher.update(suffix.as_bytes());
        }
        let mut hash = hex::encode(hasher.finalize());
        hash.truncate(HASH_LEN);

        let raw_label = match suffix {
            Some(suffix) => format!("{}-{}", sanitize(branch), sanitize(suffix)),
            None => sanitize(branch),
        };

        Self { raw_label, hash }
    }

    /// Directory name for this identity: `<label>-<hash>`
    pub fn dir_name(&self) -> String {
        format!("{}-{}", self.raw_label, self.hash)
    }
}

impl fmt::Display for StateIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.raw_label, self.hash)
    }
}

/// Resolve the identity for a project from its current branch
///
/// Never fails: if the branch cannot be read, `"unknown"` is used.
pub fn resolve(project_path: &Path, suffix: Option<&str>, timeout: Duration) -> StateIdentity {
    let branch = read_branch(project_path, timeout);
    tracing::debug!("Resolved branch {:?} for {:?}", branch, project_path);
    StateIdentity::derive(&branch, project_path, suffix)
}

/// Read the current branch with `git`, falling back to [`UNKNOWN_BRANCH`]
pub fn read_branch(project_path: &Path, timeout: Duration) -> String {
    match git_branch(project_path, timeout) {
        Some(branch) => branch,
        None => UNKNOWN_BRANCH.to_string(),
    }
}

fn git_branch(project_path: &Path, timeout: Duration) -> Option<String> {
    let mut child = Command::new("git")
        .args(["rev-parse", "--abbrev-ref", "HEAD"])
        .current_dir(project_path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| tracing::debug!("Could not run git: {}", e))
        .ok()?;

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if Instant::now() >= deadline => {
                tracing::warn!("git did not answer within {:?}, using {:?}", timeout, UNKNOWN_BRANCH);
                let _ = child.kill();
                let _ = child.wait();
                return None;
            }
            Ok(None) => std::thread::sleep(POLL_INTERVAL),
            Err(_) => return None,
        }
    };

    if !status.success() {
        return None;
    }

    let mut stdout = String::new();
    child.stdout.take()?.read_to_string(&mut stdout).ok()?;
    let branch = stdout.trim();
    if branch.is_empty() {
        None
    } else {
        Some(branch.to_string())
    }
}

/// Map every character outside `[A-Za-z0-9-]` to `-`
fn sanitize(input: &str) -> String {
    input
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}
