//! Startup lock serializing generation takeovers.
//!
//! `flock(2)` locks belong to the open file description: unlocking through
//! any duplicate releases it, and it is only dropped implicitly once every
//! duplicate is closed. Forked workers close their copy first thing.
//! The lock file is never deleted.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("cannot open startup lock {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot lock {path}: {source}")]
    Flock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// An acquired startup lock. Released by [`StartupLock::release`] or on drop.
#[derive(Debug)]
pub struct StartupLock {
    file: Option<File>,
    path: PathBuf,
}

impl StartupLock {
    /// Block until the lock at `path` is ours.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        let file = open(path)?;
        match flock(&file, libc::LOCK_EX | libc::LOCK_NB) {
            Ok(()) => {}
            Err(e) if is_contended(&e) => {
                info!(path = %path.display(), "waiting for startup lock");
                flock(&file, libc::LOCK_EX).map_err(|source| LockError::Flock {
                    path: path.to_path_buf(),
                    source,
                })?;
            }
            Err(source) => {
                return Err(LockError::Flock {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
        info!(path = %path.display(), "acquired startup lock");
        Ok(Self {
            file: Some(file),
            path: path.to_path_buf(),
        })
    }

    /// Take the lock only if nobody holds it.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>, LockError> {
        let file = open(path)?;
        match flock(&file, libc::LOCK_EX | libc::LOCK_NB) {
            Ok(()) => Ok(Some(Self {
                file: Some(file),
                path: path.to_path_buf(),
            })),
            Err(e) if is_contended(&e) => Ok(None),
            Err(source) => Err(LockError::Flock {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Descriptor holding the lock, while held.
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.file.as_ref().map(|f| f.as_raw_fd())
    }

    pub fn release(mut self) {
        self.unlock();
    }

    fn unlock(&mut self) {
        if let Some(file) = self.file.take() {
            // Unlock explicitly: forked workers still hold duplicates of this
            // descriptor, so closing ours alone would keep the lock.
            let _ = flock(&file, libc::LOCK_UN);
            info!(path = %self.path.display(), "released startup lock");
        }
    }
}

impl Drop for StartupLock {
    fn drop(&mut self) {
        self.unlock();
    }
}

fn open(path: &Path) -> Result<File, LockError> {
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .map_err(|source| LockError::Open {
            path: path.to_path_buf(),
            source,
        })
}

fn flock(file: &File, operation: libc::c_int) -> io::Result<()> {
    loop {
        if unsafe { libc::flock(file.as_raw_fd(), operation) } == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn is_contended(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(code) if code == libc::EWOULDBLOCK || code == libc::EAGAIN || code == libc::EACCES)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_second_acquirer_blocks_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exchange.sock.lock");

        let first = StartupLock::acquire(&path).unwrap();
        assert!(StartupLock::try_acquire(&path).unwrap().is_none());

        let (tx, rx) = mpsc::channel();
        let contender_path = path.clone();
        let contender = thread::spawn(move || {
            let lock = StartupLock::acquire(&contender_path).unwrap();
            tx.send(()).unwrap();
            lock
        });

        assert!(
            rx.recv_timeout(Duration::from_millis(300)).is_err(),
            "second coordinator must not own the lock while the first holds it"
        );
        first.release();
        rx.recv_timeout(Duration::from_secs(5))
            .expect("second coordinator should acquire after release");

        let second = contender.join().unwrap();
        assert!(StartupLock::try_acquire(&path).unwrap().is_none());
        drop(second);
        assert!(StartupLock::try_acquire(&path).unwrap().is_some());
    }

    #[test]
    fn test_lock_file_survives_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.lock");
        StartupLock::acquire(&path).unwrap().release();
        assert!(path.exists());
    }
}
