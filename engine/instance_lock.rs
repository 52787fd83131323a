use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const LOCK_FILE_NAME: &str = "mapd_server_pid.lck";

#[derive(Debug, Error)]
pub enum InstanceLockError {
    #[error("Failed to open PID file {path}. {source}.")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Another MapD Server is using data directory {data_dir}.")]
    AlreadyRunning { data_dir: PathBuf },

    #[error("Failed to lock PID file {path}. {source}.")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write PID file {path}. {source}.")]
    WritePid {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Exclusive ownership of a data directory for the lifetime of the value.
///
/// The lock is an advisory `flock` on the lock file. The PID written into the
/// file is informational; exclusivity comes from the lock alone. Dropping the
/// value releases the lock and closes the descriptor.
pub struct InstanceLock {
    path: PathBuf,
    _file: Flock<File>,
}

impl InstanceLock {
    pub fn for_data_dir(data_dir: &Path) -> Result<Self, InstanceLockError> {
        Self::acquire(&data_dir.join(LOCK_FILE_NAME))
    }

    pub fn acquire(path: &Path) -> Result<Self, InstanceLockError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o644)
            .open(path)
            .map_err(|source| InstanceLockError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        let file = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(locked) => locked,
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => {
                let data_dir = path
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from("."));
                return Err(InstanceLockError::AlreadyRunning { data_dir });
            }
            Err((_, errno)) => {
                return Err(InstanceLockError::Lock {
                    path: path.to_path_buf(),
                    source: errno.into(),
                });
            }
        };

        let pid = std::process::id().to_string();
        let write_pid = || -> std::io::Result<()> {
            let mut handle: &File = &file;
            handle.set_len(0)?;
            handle.write_all(pid.as_bytes())?;
            handle.flush()
        };
        write_pid().map_err(|source| InstanceLockError::WritePid {
            path: path.to_path_buf(),
            source,
        })?;

        tracing::debug!("Acquired instance lock {} for pid {}", path.display(), pid);

        Ok(Self {
            path: path.to_path_buf(),
            _file: file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Debug for InstanceLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceLock")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        tracing::debug!("Releasing instance lock {}", self.path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_writes_current_pid() {
        let dir = tempfile::tempdir().unwrap();
        let lock = InstanceLock::for_data_dir(dir.path()).unwrap();

        let contents = std::fs::read_to_string(lock.path()).unwrap();
        assert_eq!(contents, std::process::id().to_string());
    }

    #[test]
    fn second_acquire_fails_and_leaves_pid_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOCK_FILE_NAME);
        let _held = InstanceLock::acquire(&path).unwrap();
        let before = std::fs::read(&path).unwrap();

        let err = InstanceLock::acquire(&path).unwrap_err();
        assert!(matches!(err, InstanceLockError::AlreadyRunning { .. }));
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[test]
    fn dropping_the_lock_allows_reacquire() {
        let dir = tempfile::tempdir().unwrap();
        let first = InstanceLock::for_data_dir(dir.path()).unwrap();
        drop(first);

        assert!(InstanceLock::for_data_dir(dir.path()).is_ok());
    }

    #[test]
    fn stale_pid_is_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOCK_FILE_NAME);
        std::fs::write(&path, "9999999999999").unwrap();

        let _lock = InstanceLock::acquire(&path).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            std::process::id().to_string()
        );
    }

    #[test]
    fn missing_directory_is_an_open_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent").join(LOCK_FILE_NAME);

        let err = InstanceLock::acquire(&path).unwrap_err();
        assert!(matches!(err, InstanceLockError::Open { .. }));
    }
}
