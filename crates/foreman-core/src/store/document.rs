//! JSON documents with locked, atomic read-modify-write.
//!
//! # Design
//! - Readers never lock. Writes go to a temp file in the same directory,
//!   are fsynced, then renamed over the target, so a reader sees either the
//!   old document or the new one, never a torn one.
//! - Writers take the document's named lock, re-read, mutate, and write. If
//!   the file changed on disk while the lock was held (a writer that ignores
//!   the lock) the write is refused with `StaleRead` and the whole cycle is
//!   retried.
//! - A missing, empty, or unparseable document reads as the default value.
//!   Under the lock an unparseable file is set aside as `<name>.corrupt-<ts>`
//!   before being replaced.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::marker::PhantomData;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::queue::Backoff;
use crate::store::FileLockManager;

const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Identity of the file's current version. The rename in `write` always
/// produces a new inode, so any completed write changes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    ino: u64,
    len: u64,
    mtime: i64,
    mtime_nsec: i64,
}

fn fingerprint(path: &Path) -> Option<Fingerprint> {
    let meta = fs::metadata(path).ok()?;
    Some(Fingerprint {
        ino: meta.ino(),
        len: meta.len(),
        mtime: meta.mtime(),
        mtime_nsec: meta.mtime_nsec(),
    })
}

#[derive(Debug)]
enum ReadFailure {
    Io(io::Error),
    Parse(serde_json::Error),
}

impl std::fmt::Display for ReadFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadFailure::Io(e) => write!(f, "read failed: {e}"),
            ReadFailure::Parse(e) => write!(f, "invalid json: {e}"),
        }
    }
}

enum Attempt<E> {
    Store(StoreError),
    Mutator(E),
}

/// One JSON document guarded by one named lock.
pub struct JsonDocument<T> {
    path: PathBuf,
    resource: String,
    locks: Arc<FileLockManager>,
    lock_timeout: Duration,
    backoff: Backoff,
    max_attempts: u32,
    _doc: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for JsonDocument<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonDocument")
            .field("path", &self.path)
            .field("resource", &self.resource)
            .finish()
    }
}

impl<T> JsonDocument<T>
where
    T: Serialize + DeserializeOwned + Default + Clone + PartialEq,
{
    pub fn new(
        path: impl Into<PathBuf>,
        resource: impl Into<String>,
        locks: Arc<FileLockManager>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            path: path.into(),
            resource: resource.into(),
            locks,
            lock_timeout,
            backoff: Backoff::contention(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            _doc: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lock-free read of the last complete version.
    pub fn load(&self) -> T {
        match self.read_raw() {
            Ok(Some(doc)) => doc,
            Ok(None) => T::default(),
            Err(failure) => {
                warn!(path = %self.path.display(), reason = %failure, "unreadable document, using empty default");
                T::default()
            }
        }
    }

    /// Infallible mutation under the lock.
    pub fn save<R>(&self, mut mutate: impl FnMut(&mut T) -> R) -> Result<R, StoreError> {
        self.try_update(|doc| Ok::<R, StoreError>(mutate(doc)))
    }

    /// Read-modify-write under the lock.
    ///
    /// If `mutate` returns `Err`, nothing is written and the error is passed
    /// through. If the document is unchanged, nothing is written either.
    /// `mutate` may run more than once when a retryable failure occurs, each
    /// time on a freshly loaded document.
    pub fn try_update<R, E>(&self, mut mutate: impl FnMut(&mut T) -> Result<R, E>) -> Result<R, E>
    where
        E: From<StoreError>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt(&mut mutate) {
                Ok(out) => return Ok(out),
                Err(Attempt::Mutator(e)) => return Err(e),
                Err(Attempt::Store(e)) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.backoff.next_delay(attempt);
                    debug!(resource = %self.resource, attempt, error = %e, ?delay, "retrying document update");
                    thread::sleep(delay);
                }
                Err(Attempt::Store(e)) => return Err(e.into()),
            }
        }
    }

    fn attempt<R, E>(&self, mutate: &mut impl FnMut(&mut T) -> Result<R, E>) -> Result<R, Attempt<E>> {
        let _guard = self
            .locks
            .acquire(&self.resource, self.lock_timeout)
            .map_err(|e| Attempt::Store(e.into()))?;

        let (original, before) = self.load_locked();
        let mut doc = original.clone();
        let out = mutate(&mut doc).map_err(Attempt::Mutator)?;
        if doc == original {
            return Ok(out);
        }
        if fingerprint(&self.path) != before {
            return Err(Attempt::Store(StoreError::StaleRead {
                path: self.path.clone(),
            }));
        }
        self.write(&doc).map_err(Attempt::Store)?;
        Ok(out)
    }

    /// Load while holding the lock, setting aside a corrupt file.
    fn load_locked(&self) -> (T, Option<Fingerprint>) {
        let before = fingerprint(&self.path);
        match self.read_raw() {
            Ok(Some(doc)) => (doc, before),
            Ok(None) => (T::default(), before),
            Err(ReadFailure::Io(e)) => {
                warn!(path = %self.path.display(), error = %e, "unreadable document, using empty default");
                (T::default(), before)
            }
            Err(ReadFailure::Parse(reason)) => {
                let aside = self.corrupt_path();
                match fs::rename(&self.path, &aside) {
                    Ok(()) => {
                        warn!(path = %self.path.display(), moved_to = %aside.display(), %reason, "corrupt document set aside");
                        (T::default(), fingerprint(&self.path))
                    }
                    Err(e) => {
                        warn!(path = %self.path.display(), %reason, error = %e, "corrupt document could not be set aside");
                        (T::default(), before)
                    }
                }
            }
        }
    }

    /// `Ok(None)` for missing or blank files.
    fn read_raw(&self) -> Result<Option<T>, ReadFailure> {
        let bytes = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ReadFailure::Io(e)),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        serde_json::from_slice(&bytes).map(Some).map_err(ReadFailure::Parse)
    }

    fn corrupt_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.resource.clone());
        self.path
            .with_file_name(format!("{name}.corrupt-{}", Utc::now().format("%Y%m%dT%H%M%S%.3f")))
    }

    fn write(&self, doc: &T) -> Result<(), StoreError> {
        let write_err = |source| StoreError::Write {
            path: self.path.clone(),
            source,
        };
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(write_err)?;

        let mut tmp = NamedTempFile::new_in(&dir).map_err(write_err)?;
        {
            let mut out = BufWriter::new(tmp.as_file_mut());
            serde_json::to_writer_pretty(&mut out, doc).map_err(|e| write_err(io::Error::other(e)))?;
            out.write_all(b"\n").map_err(write_err)?;
            out.flush().map_err(write_err)?;
        }
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(&self.path).map_err(|e| write_err(e.error))?;
        File::open(&dir).and_then(|d| d.sync_all()).map_err(write_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use tempfile::tempdir;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Counter {
        value: u32,
        #[serde(default)]
        notes: Vec<String>,
    }

    fn doc(dir: &Path) -> JsonDocument<Counter> {
        let locks = Arc::new(FileLockManager::new(dir.join("locks")));
        JsonDocument::new(dir.join("counter.json"), "counter", locks, Duration::from_millis(200))
    }

    #[test]
    fn missing_and_empty_documents_read_as_default() {
        let dir = tempdir().unwrap();
        let d = doc(dir.path());
        assert_eq!(d.load(), Counter::default());

        fs::write(d.path(), "  \n").unwrap();
        assert_eq!(d.load(), Counter::default());
    }

    #[test]
    fn save_persists_and_load_sees_it() {
        let dir = tempdir().unwrap();
        let d = doc(dir.path());
        let v = d.save(|c| {
            c.value += 1;
            c.value
        })
        .unwrap();
        assert_eq!(v, 1);
        assert_eq!(d.load().value, 1);
    }

    #[test]
    fn stray_temp_file_from_a_crashed_writer_is_ignored() {
        let dir = tempdir().unwrap();
        let d = doc(dir.path());
        d.save(|c| c.value = 7).unwrap();
        fs::write(dir.path().join(".tmpXYZ123"), "{\"value\": 99").unwrap();

        assert_eq!(d.load().value, 7);
        d.save(|c| c.value += 1).unwrap();
        assert_eq!(d.load().value, 8);
    }

    #[test]
    fn panicking_mutator_leaves_the_document_intact() {
        let dir = tempdir().unwrap();
        let d = doc(dir.path());
        d.save(|c| c.value = 3).unwrap();

        let result = catch_unwind(AssertUnwindSafe(|| {
            let _ = d.save(|c| {
                c.value = 100;
                if c.value == 100 {
                    panic!("mutator blew up");
                }
            });
        }));
        assert!(result.is_err());
        assert_eq!(d.load().value, 3);
        // and the lock was released
        d.save(|c| c.value += 1).unwrap();
        assert_eq!(d.load().value, 4);
    }

    #[test]
    fn mutator_error_skips_the_write() {
        let dir = tempdir().unwrap();
        let d = doc(dir.path());
        d.save(|c| c.value = 1).unwrap();

        let err = d
            .try_update(|c| {
                c.value = 50;
                Err::<(), _>(StoreError::StaleRead { path: "unused".into() })
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::StaleRead { .. }));
        assert_eq!(d.load().value, 1);
    }

    #[test]
    fn failed_write_is_retried_then_surfaces_as_write_error() {
        let dir = tempdir().unwrap();
        let d = doc(dir.path());
        // a directory where the document should be makes the rename fail
        fs::create_dir(d.path()).unwrap();

        let mut calls = 0;
        let err = d
            .save(|c| {
                calls += 1;
                c.value = 1;
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::Write { .. }));
        assert_eq!(calls, DEFAULT_MAX_ATTEMPTS);
    }

    #[test]
    fn out_of_band_write_is_detected_and_retried() {
        let dir = tempdir().unwrap();
        let d = doc(dir.path());
        d.save(|c| c.value = 1).unwrap();

        let mut calls = 0;
        let path = d.path().to_path_buf();
        d.save(|c| {
            calls += 1;
            if calls == 1 {
                // someone writing without the lock
                fs::write(&path, r#"{"value": 40, "notes": ["rogue writer"]}"#).unwrap();
            }
            c.value += 1;
        })
        .unwrap();

        assert_eq!(calls, 2);
        let after = d.load();
        assert_eq!(after.value, 41);
        assert_eq!(after.notes, vec!["rogue writer".to_string()]);
    }

    #[test]
    fn corrupt_document_is_set_aside_on_write() {
        let dir = tempdir().unwrap();
        let d = doc(dir.path());
        fs::write(d.path(), "{not json").unwrap();
        assert_eq!(d.load(), Counter::default());

        d.save(|c| c.value = 2).unwrap();
        assert_eq!(d.load().value, 2);

        let aside: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with("counter.json.corrupt-"))
            .collect();
        assert_eq!(aside.len(), 1);
    }

    #[test]
    fn unchanged_document_is_not_rewritten() {
        let dir = tempdir().unwrap();
        let d = doc(dir.path());
        d.save(|c| c.value = 5).unwrap();
        let before = fingerprint(d.path());
        d.save(|c| c.value).unwrap();
        assert_eq!(fingerprint(d.path()), before);
    }
}
