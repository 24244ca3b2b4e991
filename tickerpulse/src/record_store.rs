//! File persistence for [`RefreshRecord`].
//!
//! The record is a two-line text file. Reads fail open: a missing or corrupt
//! file is reported as "no record". Writes go through a temporary file that is
//! renamed over the old one, and the read-modify-write cycle is guarded by a
//! sidecar `<file>.lock` created with create-new semantics.
//!
//! The lock file holds an owner token. A lock whose mtime is older than the
//! stale threshold may be taken over, so the holder must [`RecordGuard::touch`]
//! it while working; `save` and the release on drop only act while the token on
//! disk is still the guard's own.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::gate::RefreshRecord;

/// Shortest interval between lock refreshes.
const MIN_HEARTBEAT: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to read refresh record {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write refresh record {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("refresh record {path} is locked by another refresh")]
    Locked { path: PathBuf },
}

/// Location of the refresh record and its lock.
#[derive(Debug, Clone)]
pub struct RecordStore {
    path: PathBuf,
    lock_path: PathBuf,
    stale_after: Duration,
}

impl RecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_name = path.clone().into_os_string();
        lock_name.push(".lock");
        Self {
            path,
            lock_path: PathBuf::from(lock_name),
            stale_after: Duration::from_secs(300),
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// How often a guard holder should call [`RecordGuard::touch`] so the
    /// lock never looks stale while it is in use.
    pub fn heartbeat_period(&self) -> Duration {
        (self.stale_after / 3).max(MIN_HEARTBEAT)
    }

    /// Read the current record without taking the lock.
    pub async fn load(&self) -> Result<Option<RefreshRecord>, PersistenceError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(PersistenceError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let record = std::str::from_utf8(&bytes)
            .ok()
            .and_then(RefreshRecord::parse);
        if record.is_none() {
            warn!(path = %self.path.display(), "refresh record is corrupt, treating it as absent");
        }
        Ok(record)
    }

    /// [`RecordStore::load`], with read errors treated like a missing record.
    pub async fn load_or_absent(&self) -> Option<RefreshRecord> {
        absent_on_error(self.load().await)
    }

    /// Take the exclusive lock for a read-modify-write cycle. The lock is
    /// released when the returned guard is dropped.
    pub async fn lock(&self) -> Result<RecordGuard<'_>, PersistenceError> {
        tokio::fs::create_dir_all(parent_dir(&self.path))
            .await
            .map_err(|source| PersistenceError::Write {
                path: self.lock_path.clone(),
                source,
            })?;

        match self.try_create_lock().await {
            Ok(guard) => Ok(guard),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if self.lock_is_stale().await {
                    warn!(lock = %self.lock_path.display(), "breaking stale refresh lock");
                    if let Err(e) = tokio::fs::remove_file(&self.lock_path).await {
                        debug!(%e, "stale lock already gone");
                    }
                    self.try_create_lock().await.map_err(|e| self.lock_error(e))
                } else {
                    Err(PersistenceError::Locked {
                        path: self.path.clone(),
                    })
                }
            }
            Err(e) => Err(self.lock_error(e)),
        }
    }

    async fn try_create_lock(&self) -> io::Result<RecordGuard<'_>> {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
            .await?;
        let token = uuid::Uuid::new_v4().to_string();
        file.write_all(token.as_bytes()).await?;
        file.sync_all().await?;
        debug!(lock = %self.lock_path.display(), %token, "refresh lock acquired");
        Ok(RecordGuard { store: self, token })
    }

    async fn lock_is_stale(&self) -> bool {
        let modified = match tokio::fs::metadata(&self.lock_path).await {
            Ok(meta) => meta.modified().ok(),
            Err(_) => None,
        };
        modified
            .and_then(|m| SystemTime::now().duration_since(m).ok())
            .map(|age| age >= self.stale_after)
            .unwrap_or(false)
    }

    fn lock_error(&self, e: io::Error) -> PersistenceError {
        if e.kind() == io::ErrorKind::AlreadyExists {
            PersistenceError::Locked {
                path: self.path.clone(),
            }
        } else {
            PersistenceError::Write {
                path: self.lock_path.clone(),
                source: e,
            }
        }
    }
}

/// Exclusive access to the record for the lifetime of the guard.
#[derive(Debug)]
pub struct RecordGuard<'a> {
    store: &'a RecordStore,
    token: String,
}

impl RecordGuard<'_> {
    pub async fn load(&self) -> Result<Option<RefreshRecord>, PersistenceError> {
        self.store.load().await
    }

    /// Whether the lock file still carries this guard's token.
    pub async fn is_held(&self) -> bool {
        match tokio::fs::read_to_string(&self.store.lock_path).await {
            Ok(owner) => owner == self.token,
            Err(_) => false,
        }
    }

    /// Refresh the lock's mtime so it is not taken for stale.
    pub async fn touch(&self) -> Result<(), PersistenceError> {
        self.ensure_held().await?;
        tokio::fs::write(&self.store.lock_path, self.token.as_bytes())
            .await
            .map_err(|source| PersistenceError::Write {
                path: self.store.lock_path.clone(),
                source,
            })
    }

    /// Replace the record on disk. Refused with `Locked` once another
    /// refresh has taken the lock over.
    pub async fn save(&self, record: &RefreshRecord) -> Result<(), PersistenceError> {
        self.ensure_held().await?;

        let path = self.store.path.clone();
        let contents = record.to_file_contents();
        let target = path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&target, contents.as_bytes()))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
            .and_then(|written| written)
            .map_err(|source| PersistenceError::Write {
                path: path.clone(),
                source,
            })?;

        debug!(path = %path.display(), count = record.refresh_count, "refresh record saved");
        Ok(())
    }

    async fn ensure_held(&self) -> Result<(), PersistenceError> {
        if self.is_held().await {
            Ok(())
        } else {
            warn!(lock = %self.store.lock_path.display(), "refresh lock was taken over");
            Err(PersistenceError::Locked {
                path: self.store.path.clone(),
            })
        }
    }
}

impl Drop for RecordGuard<'_> {
    fn drop(&mut self) {
        let lock_path = &self.store.lock_path;
        // Leave a lock that another refresh has taken over.
        match std::fs::read_to_string(lock_path) {
            Ok(owner) if owner == self.token => {
                if let Err(e) = std::fs::remove_file(lock_path) {
                    warn!(lock = %lock_path.display(), %e, "failed to release refresh lock");
                }
            }
            Ok(_) => debug!(lock = %lock_path.display(), "refresh lock owned by another refresh, not released"),
            Err(e) => debug!(lock = %lock_path.display(), %e, "refresh lock already gone"),
        }
    }
}

/// Fail-open policy for record reads: an unreadable record counts as absent.
pub fn absent_on_error(loaded: Result<Option<RefreshRecord>, PersistenceError>) -> Option<RefreshRecord> {
    loaded.unwrap_or_else(|e| {
        warn!(%e, "could not read refresh record, treating it as absent");
        None
    })
}

fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    use std::io::Write;

    std::fs::create_dir_all(parent_dir(path))?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent_dir(path))?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}
