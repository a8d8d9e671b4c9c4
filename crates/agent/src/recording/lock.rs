//! Ownership lock for a recordings directory.
//!
//! Only the agent that owns a directory may write to it or recover recordings
//! left open there. Ownership is a PID file, `agent.pid`, next to the
//! recordings. A file naming a process that is no longer running is stale and
//! is taken over.
//!
//! Readers (the CLI listing or replaying recordings) never take the lock.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use super::StoreError;

/// File name of the lock inside the locked directory.
pub const LOCK_FILE_NAME: &str = "agent.pid";

/// Held for as long as this process owns the directory. The PID file is
/// removed on drop.
#[derive(Debug)]
pub struct DirLock {
    path: PathBuf,
    pid: u32,
}

impl DirLock {
    /// Take ownership of `dir`.
    ///
    /// Fails with [`StoreError::Locked`] while another live process, or
    /// another owner in this process, holds it.
    pub fn acquire(dir: &Path) -> Result<Self, StoreError> {
        let path = dir.join(LOCK_FILE_NAME);
        let pid = std::process::id();
        let io_err = |source: std::io::Error| StoreError::Io {
            path: path.clone(),
            source,
        };

        // second pass only after removing a stale file
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    writeln!(file, "{pid}").map_err(io_err)?;
                    file.sync_all().map_err(io_err)?;
                    tracing::debug!(path = %path.display(), pid, "Acquired recordings lock");
                    return Ok(Self { path, pid });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(io_err(e)),
            }

            match read_owner(&path) {
                Some(owner) if is_process_running(owner) => {
                    return Err(StoreError::Locked { path, pid: owner });
                }
                owner => {
                    tracing::warn!(
                        path = %path.display(),
                        stale_pid = ?owner,
                        "Removing stale recordings lock"
                    );
                    match fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(e) => return Err(io_err(e)),
                    }
                }
            }
        }

        // someone else took it between our remove and create
        match read_owner(&path) {
            Some(owner) => Err(StoreError::Locked { path, pid: owner }),
            None => Err(io_err(std::io::Error::from(ErrorKind::AlreadyExists))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        // leave a file that was taken over by someone else alone
        if read_owner(&self.path) == Some(self.pid) {
            let _ = fs::remove_file(&self.path);
        }
    }
}

fn read_owner(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Whether a process with this pid exists.
fn is_process_running(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        Path::new(&format!("/proc/{pid}/stat")).exists()
    }

    #[cfg(not(target_os = "linux"))]
    {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        matches!(kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_writes_own_pid_and_drop_removes_it() {
        let dir = TempDir::new().unwrap();
        let lock = DirLock::acquire(dir.path()).unwrap();

        let written = fs::read_to_string(lock.path()).unwrap();
        assert_eq!(written.trim(), std::process::id().to_string());

        drop(lock);
        assert!(!dir.path().join(LOCK_FILE_NAME).exists());
    }

    #[test]
    fn test_second_owner_is_refused() {
        let dir = TempDir::new().unwrap();
        let _first = DirLock::acquire(dir.path()).unwrap();

        match DirLock::acquire(dir.path()) {
            Err(StoreError::Locked { pid, .. }) => assert_eq!(pid, std::process::id()),
            other => panic!("expected Locked, got {other:?}"),
        }
    }

    #[test]
    fn test_released_lock_can_be_taken_again() {
        let dir = TempDir::new().unwrap();
        drop(DirLock::acquire(dir.path()).unwrap());
        assert!(DirLock::acquire(dir.path()).is_ok());
    }

    #[test]
    fn test_stale_lock_is_taken_over() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LOCK_FILE_NAME);

        // above the kernel's pid_max, so never a running process
        fs::write(&path, "2147483647\n").unwrap();
        let lock = DirLock::acquire(dir.path()).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap().trim(),
            std::process::id().to_string()
        );
        drop(lock);

        fs::write(&path, "not a pid").unwrap();
        assert!(DirLock::acquire(dir.path()).is_ok());
    }

    #[test]
    fn test_is_process_running() {
        assert!(is_process_running(std::process::id()));
        assert!(!is_process_running(2_147_483_647));
    }
}
