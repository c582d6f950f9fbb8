//! PID file handling for instalogd.
//!
//! The file guards against two daemons sharing one data directory. A file
//! left behind by a process that no longer exists is replaced.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;

use anyhow::Result;

/// Write the current process PID to `path`.
///
/// # Security
///
/// - Uses `create_new(true)` to atomically create the file
/// - Verifies the created file is a regular file (rejects symlinks)
/// - Creates the parent directory with mode 0o700 and the file with 0o600
///
/// # Errors
///
/// Fails when another live process owns the file or it cannot be written.
pub fn write_pid_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            fs::DirBuilder::new().mode(0o700).recursive(true).create(parent)?;
        }
        #[cfg(not(unix))]
        {
            fs::create_dir_all(parent)?;
        }
    }

    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            let existing = fs::read_to_string(path).unwrap_or_else(|_| "unknown".to_owned());
            let existing = existing.trim();
            match existing.parse::<u32>() {
                Ok(pid) if !process_alive(pid) => {
                    tracing::warn!(pid, path = %path.display(), "replacing stale PID file");
                    fs::remove_file(path)?;
                    OpenOptions::new().write(true).create_new(true).open(path)?
                }
                _ => {
                    return Err(anyhow::anyhow!(
                        "PID file {} already exists with PID: {}. Is another instance running?",
                        path.display(),
                        existing
                    ));
                }
            }
        }
        Err(e) => return Err(e.into()),
    };

    if !file.metadata()?.is_file() {
        let _ = fs::remove_file(path);
        return Err(anyhow::anyhow!(
            "PID file {} is not a regular file (possible symlink attack)",
            path.display()
        ));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }

    let pid = std::process::id();
    writeln!(file, "{}", pid)?;
    tracing::info!(pid, path = %path.display(), "PID file written");
    Ok(())
}

/// Remove the PID file on shutdown. Logs instead of failing.
pub fn remove_pid_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        tracing::warn!(path = %path.display(), error = %e, "failed to remove PID file");
    } else {
        tracing::info!(path = %path.display(), "PID file removed");
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_pid_file_creates_parent_directory() {
        // Given: a path whose parent does not exist
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("run").join("instalogd.pid");

        // When
        write_pid_file(&pid_file).expect("write_pid_file should create the parent directory");

        // Then
        let content = fs::read_to_string(&pid_file).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());
    }

    #[test]
    fn live_owner_blocks_second_instance() {
        // Given: a PID file owned by this (live) process
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("instalogd.pid");
        fs::write(&pid_file, std::process::id().to_string()).unwrap();

        // When
        let err = write_pid_file(&pid_file).unwrap_err().to_string();

        // Then
        assert!(err.contains("already exists"), "got: {err}");
    }

    #[test]
    fn garbage_pid_file_is_not_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("instalogd.pid");
        fs::write(&pid_file, "not-a-pid").unwrap();

        assert!(write_pid_file(&pid_file).is_err());
        assert_eq!(fs::read_to_string(&pid_file).unwrap(), "not-a-pid");
    }

    #[cfg(unix)]
    #[test]
    fn stale_pid_file_is_replaced() {
        // Given: a PID file naming a process that has exited
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("instalogd.pid");
        fs::write(&pid_file, dead_pid.to_string()).unwrap();

        // When
        write_pid_file(&pid_file).expect("stale PID file should be replaced");

        // Then
        let content = fs::read_to_string(&pid_file).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());
    }

    #[test]
    fn remove_pid_file_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        remove_pid_file(&dir.path().join("missing.pid"));
    }
}
