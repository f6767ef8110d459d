//! PID file utilities for tracking the supervised backend
//!
//! The orchestrator records the backend's PID next to its state so that a
//! later run can find and terminate a backend orphaned by a crashed or
//! restarted host.

use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;

/// PID file name inside a state directory
pub const PID_FILE_NAME: &str = "backend.pid";

/// Read the PID from the PID file
///
/// Returns `Ok(Some(pid))` if the file exists and contains a valid PID,
/// `Ok(None)` if the file doesn't exist, or an error if the file is malformed.
pub fn read_pid_file(path: &Path) -> io::Result<Option<u32>> {
    match fs::File::open(path) {
        Ok(mut file) => {
            let mut contents = String::new();
            file.read_to_string(&mut contents)?;
            let pid = contents
                .trim()
                .parse::<u32>()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            Ok(Some(pid))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Write a PID to the PID file, creating parent directories
pub fn write_pid_file(path: &Path, pid: u32) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut file = fs::File::create(path)?;
    writeln!(file, "{}", pid)?;
    Ok(())
}

/// Remove the PID file
///
/// Returns `Ok(())` even if the file doesn't exist.
pub fn remove_pid_file(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Check if a process with the given PID is still alive
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // kill(pid, 0) probes without signalling; EPERM means it exists but isn't ours
    unsafe {
        if libc::kill(pid, 0) == 0 {
            return true;
        }
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(windows)]
pub fn is_process_alive(pid: u32) -> bool {
    use windows_sys::Win32::Foundation::CloseHandle;
    use windows_sys::Win32::System::Threading::{OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION};

    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if handle == 0 {
            return false;
        }
        CloseHandle(handle);
        true
    }
}

/// Ask a process to terminate (SIGTERM on Unix, `taskkill` on Windows)
#[cfg(unix)]
pub fn terminate_process(pid: u32) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    if pid <= 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "refusing to signal a process group",
        ));
    }
    let result = unsafe { libc::kill(pid, libc::SIGTERM) };
    if result == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(windows)]
pub fn terminate_process(pid: u32) -> io::Result<()> {
    let status = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()?;
    if status.success() {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::Other,
            format!("taskkill exited with {}", status),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_read_nonexistent_pid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(PID_FILE_NAME);
        assert!(read_pid_file(&path).unwrap().is_none());
    }

    #[test]
    fn test_write_and_read_pid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join(PID_FILE_NAME);

        write_pid_file(&path, 12345).unwrap();
        assert_eq!(read_pid_file(&path).unwrap(), Some(12345));
    }

    #[test]
    fn test_malformed_pid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(PID_FILE_NAME);
        fs::write(&path, "not-a-pid").unwrap();
        let err = read_pid_file(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_remove_pid_file_twice() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(PID_FILE_NAME);

        write_pid_file(&path, 12345).unwrap();
        remove_pid_file(&path).unwrap();
        remove_pid_file(&path).unwrap();
        assert!(read_pid_file(&path).unwrap().is_none());
    }

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn test_invalid_pid_not_alive() {
        assert!(!is_process_alive(999_999_999));
    }

    #[cfg(unix)]
    #[test]
    fn test_terminate_child_process() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        terminate_process(child.id()).unwrap();
        let status = child.wait().unwrap();
        assert!(!status.success());
    }

    #[cfg(unix)]
    #[test]
    fn test_terminate_missing_process_errors() {
        assert!(terminate_process(999_999_999).is_err());
    }
}
