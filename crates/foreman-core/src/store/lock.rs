//! Named advisory locks - flock(2) ベースのプロセス間ロック
//!
//! One lock file per resource under `<state_dir>/locks/`. The lock is held
//! for as long as the [`LockGuard`] lives, and the kernel drops it if the
//! holding process dies, so a crashed writer never wedges the fleet.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::LockError;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Hands out exclusive locks keyed by resource name.
///
/// Processes sharing a `dir` exclude each other per resource; distinct
/// resources never block one another.
#[derive(Debug, Clone)]
pub struct FileLockManager {
    dir: PathBuf,
    poll_interval: Duration,
}

impl FileLockManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Block (polling) until `resource` is ours or `timeout` elapses.
    pub fn acquire(&self, resource: &str, timeout: Duration) -> Result<LockGuard, LockError> {
        let io_err = |source| LockError::Io {
            resource: resource.to_string(),
            source,
        };
        fs::create_dir_all(&self.dir).map_err(io_err)?;
        let path = self.dir.join(lock_file_name(resource));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(io_err)?;

        let started = Instant::now();
        loop {
            match try_flock(&file) {
                Ok(true) => {
                    trace!(resource, waited_ms = started.elapsed().as_millis() as u64, "lock acquired");
                    return Ok(LockGuard {
                        file,
                        resource: resource.to_string(),
                    });
                }
                Ok(false) => {}
                Err(e) => return Err(io_err(e)),
            }
            let waited = started.elapsed();
            if waited >= timeout {
                return Err(LockError::Timeout {
                    resource: resource.to_string(),
                    waited,
                });
            }
            thread::sleep(self.poll_interval.min(timeout - waited));
        }
    }

    /// Run `f` with `resource` held. The lock is released when `f` returns
    /// or unwinds.
    pub fn with_lock<T>(
        &self,
        resource: &str,
        timeout: Duration,
        f: impl FnOnce() -> T,
    ) -> Result<T, LockError> {
        let _guard = self.acquire(resource, timeout)?;
        Ok(f())
    }
}

/// Ok(false) means someone else holds it.
fn try_flock(file: &File) -> io::Result<bool> {
    loop {
        // SAFETY: the fd is owned by `file` and open for the whole call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(code) if code == libc::EWOULDBLOCK || code == libc::EAGAIN => return Ok(false),
            _ => return Err(err),
        }
    }
}

/// Resource names become file names; anything outside `[A-Za-z0-9._-]` is
/// replaced so a name can never escape the lock directory.
fn lock_file_name(resource: &str) -> String {
    let safe: String = resource
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}.lock", safe.trim_start_matches('.'))
}

/// Exclusive hold on one resource. Dropping it unlocks.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    resource: String,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // SAFETY: same fd as acquired; closing the file would unlock anyway.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
        trace!(resource = %self.resource, "lock released");
    }
}
