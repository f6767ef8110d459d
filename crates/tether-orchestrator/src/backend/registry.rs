//! Tracking of the live backend process
//!
//! The registry remembers which backend this orchestrator owns, both in
//! memory and as a PID file in the state directory. A PID file left behind
//! by a crashed host lets the next run terminate the orphan before spawning
//! a replacement on the same state.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tether_core::pidfile::{
    is_process_alive, read_pid_file, remove_pid_file, terminate_process, write_pid_file,
    PID_FILE_NAME,
};

/// A backend recorded by the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredBackend {
    pub pid: u32,
    pub pid_file: PathBuf,
}

/// Registry of the backend owned by one orchestrator
#[derive(Debug, Default)]
pub struct BackendRegistry {
    current: Mutex<Option<RegisteredBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// PID file location for a state directory
    pub fn pid_file(state_dir: &Path) -> PathBuf {
        state_dir.join(PID_FILE_NAME)
    }

    /// Backend currently recorded, if any
    pub fn current(&self) -> Option<RegisteredBackend> {
        self.current.lock().ok().and_then(|guard| guard.clone())
    }

    /// Terminate a backend left running on `state_dir` by an earlier host
    ///
    /// Returns the PID that was signalled. Stale or unreadable PID files are
    /// removed.
    pub fn terminate_previous(&self, state_dir: &Path) -> Option<u32> {
        let pid_file = Self::pid_file(state_dir);
        let pid = match read_pid_file(&pid_file) {
            Ok(Some(pid)) => pid,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!("Ignoring unreadable PID file {:?}: {}", pid_file, e);
                let _ = remove_pid_file(&pid_file);
                return None;
            }
        };

        let signalled = if pid != std::process::id() && is_process_alive(pid) {
            tracing::info!("Terminating previous backend (PID {})", pid);
            match terminate_process(pid) {
                Ok(()) => Some(pid),
                Err(e) => {
                    tracing::warn!("Failed to terminate previous backend {}: {}", pid, e);
                    None
                }
            }
        } else {
            tracing::debug!("Removing stale PID file for {}", pid);
            None
        };

        if let Err(e) = remove_pid_file(&pid_file) {
            tracing::warn!("Failed to remove PID file {:?}: {}", pid_file, e);
        }
        signalled
    }

    /// Record a freshly spawned backend
    pub fn record(&self, state_dir: &Path, pid: u32) {
        let pid_file = Self::pid_file(state_dir);
        if let Err(e) = write_pid_file(&pid_file, pid) {
            tracing::warn!("Failed to write PID file {:?}: {}", pid_file, e);
        }
        if let Ok(mut current) = self.current.lock() {
            *current = Some(RegisteredBackend { pid, pid_file });
        }
    }

    /// Forget the recorded backend and remove its PID file
    pub fn clear(&self) -> Option<RegisteredBackend> {
        let previous = self.current.lock().ok().and_then(|mut guard| guard.take());
        if let Some(backend) = &previous {
            if let Err(e) = remove_pid_file(&backend.pid_file) {
                tracing::warn!("Failed to remove PID file {:?}: {}", backend.pid_file, e);
            }
        }
        previous
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_record_and_clear() {
        let dir = TempDir::new().unwrap();
        let registry = BackendRegistry::new();

        registry.record(dir.path(), 4242);
        let pid_file = BackendRegistry::pid_file(dir.path());
        assert_eq!(read_pid_file(&pid_file).unwrap(), Some(4242));
        assert_eq!(registry.current().map(|b| b.pid), Some(4242));

        let cleared = registry.clear().unwrap();
        assert_eq!(cleared.pid, 4242);
        assert!(registry.current().is_none());
        assert!(!pid_file.exists());
        assert!(registry.clear().is_none());
    }

    #[test]
    fn test_terminate_previous_without_pid_file() {
        let dir = TempDir::new().unwrap();
        assert!(BackendRegistry::new().terminate_previous(dir.path()).is_none());
    }

    #[test]
    fn test_terminate_previous_removes_stale_pid_file() {
        let dir = TempDir::new().unwrap();
        let pid_file = BackendRegistry::pid_file(dir.path());
        write_pid_file(&pid_file, 999_999_999).unwrap();

        assert!(BackendRegistry::new().terminate_previous(dir.path()).is_none());
        assert!(!pid_file.exists());
    }

    #[test]
    fn test_terminate_previous_removes_garbage_pid_file() {
        let dir = TempDir::new().unwrap();
        let pid_file = BackendRegistry::pid_file(dir.path());
        std::fs::write(&pid_file, "garbage").unwrap();

        assert!(BackendRegistry::new().terminate_previous(dir.path()).is_none());
        assert!(!pid_file.exists());
    }

    #[test]
    fn test_terminate_previous_never_signals_self() {
        let dir = TempDir::new().unwrap();
        write_pid_file(&BackendRegistry::pid_file(dir.path()), std::process::id()).unwrap();

        assert!(BackendRegistry::new().terminate_previous(dir.path()).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_terminate_previous_kills_orphan() {
        let dir = TempDir::new().unwrap();
        let mut orphan = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        write_pid_file(&BackendRegistry::pid_file(dir.path()), orphan.id()).unwrap();

        let signalled = BackendRegistry::new().terminate_previous(dir.path());
        assert_eq!(signalled, Some(orphan.id()));
        assert!(!orphan.wait().unwrap().success());
    }
}
