use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use thiserror::Error;
use tracing::{error, info, warn};

use super::lease::{Lease, LeaseError, LeaseStore, RenewOutcome};

#[derive(Debug, Error)]
pub enum LockError {
    /// Another live process on this host holds the lock file.
    #[error("poll lock file {path} is held by {holder}")]
    FileHeld { path: PathBuf, holder: String },
    /// The cluster lease belongs to someone else.
    #[error("poll lease {key} is held by another consumer")]
    Busy { key: String },
    #[error("poll lease {key} was lost")]
    Lost { key: String },
    #[error("lock file io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Lease(#[from] LeaseError),
}

/// key: poll-lock-file -> host-local exclusion, removed on drop
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self, LockError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        match Self::create(&path) {
            Ok(lock) => Ok(lock),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                let recorded = fs::read_to_string(&path).unwrap_or_default();
                let recorded = recorded.trim();
                match recorded.parse::<i32>() {
                    Ok(pid) if !pid_alive(pid) => {
                        warn!(path = %path.display(), pid, "removing stale poll lock file");
                        fs::remove_file(&path)?;
                        Self::create(&path).map_err(|err| match err.kind() {
                            ErrorKind::AlreadyExists => LockError::FileHeld {
                                path: path.clone(),
                                holder: "unknown".into(),
                            },
                            _ => LockError::Io(err),
                        })
                    }
                    _ => Err(LockError::FileHeld {
                        path,
                        holder: if recorded.is_empty() {
                            "unknown".into()
                        } else {
                            format!("pid {recorded}")
                        },
                    }),
                }
            }
            Err(err) => Err(LockError::Io(err)),
        }
    }

    fn create(path: &Path) -> std::io::Result<Self> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        writeln!(file, "{}", std::process::id())?;
        file.sync_all()?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != ErrorKind::NotFound {
                warn!(?err, path = %self.path.display(), "failed to remove poll lock file");
            }
        }
    }
}

/// EPERM means the pid exists under another user.
fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Both layers held by the current coordinator.
#[derive(Debug)]
pub struct LockHandle {
    file: FileLock,
    lease: Lease,
}

impl LockHandle {
    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    pub fn lock_file(&self) -> &Path {
        self.file.path()
    }
}

/// key: poll-lock -> file lock + cluster lease, both must succeed
#[derive(Clone)]
pub struct PollLock {
    lock_file: PathBuf,
    store: Arc<dyn LeaseStore>,
    key: String,
    ttl: Duration,
}

impl PollLock {
    pub fn new(
        lock_file: impl Into<PathBuf>,
        store: Arc<dyn LeaseStore>,
        key: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            lock_file: lock_file.into(),
            store,
            key: key.into(),
            ttl,
        }
    }

    pub async fn acquire(&self) -> Result<LockHandle, LockError> {
        let file = FileLock::acquire(&self.lock_file)?;
        let lease = Lease::new(self.key.clone(), self.ttl);
        // On any failure below `file` is dropped, which removes the lock file.
        if !self.store.try_acquire(&lease).await? {
            let holder = self.store.holder(&self.key).await.ok().flatten();
            error!(key = %self.key, ?holder, "poll lease already held elsewhere");
            return Err(LockError::Busy {
                key: self.key.clone(),
            });
        }
        info!(key = %self.key, token = %lease.token, "poll lock acquired");
        Ok(LockHandle { file, lease })
    }

    pub async fn renew(&self, handle: &LockHandle) -> Result<(), LockError> {
        match self.store.renew(&handle.lease).await? {
            RenewOutcome::Extended => Ok(()),
            RenewOutcome::Reclaimed => {
                warn!(key = %handle.lease.key, "poll lease had expired; reclaimed");
                Ok(())
            }
            RenewOutcome::Lost => Err(LockError::Lost {
                key: handle.lease.key.clone(),
            }),
        }
    }

    pub async fn release(&self, handle: LockHandle) {
        match self.store.release(&handle.lease).await {
            Ok(true) => info!(key = %handle.lease.key, "poll lease released"),
            Ok(false) => warn!(key = %handle.lease.key, "poll lease was no longer ours at release"),
            Err(err) => warn!(?err, key = %handle.lease.key, "failed to release poll lease"),
        }
        drop(handle);
    }
}
