//! Per-file read offsets for incremental log tailing.
//!
//! The ledger maps absolute file paths to the byte offset already consumed.
//! It is persisted as a flat JSON object (`{"/var/log/app.log": 1024}`).
//!
//! Each path also gets its own lock. Holding it across "read offset, read
//! file, store new offset" keeps two triggers for the same file from racing.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use costpulse_core::error::{CostPulseError, Result};
use tracing::{debug, warn};

/// Persistent offset ledger with per-path locking.
#[derive(Debug, Default)]
pub struct TailTracker {
    ledger_path: Option<PathBuf>,
    offsets: Mutex<HashMap<PathBuf, u64>>,
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl TailTracker {
    /// A tracker that is never written to disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the ledger at `ledger_path`.
    ///
    /// A missing file gives an empty ledger. An unreadable or corrupt file is
    /// logged and also gives an empty ledger; dedup covers any re-read bytes.
    pub fn load(ledger_path: impl Into<PathBuf>) -> Self {
        let ledger_path = ledger_path.into();
        let offsets = match fs::read_to_string(&ledger_path) {
            Ok(content) if content.trim().is_empty() => HashMap::new(),
            Ok(content) => match serde_json::from_str::<BTreeMap<String, u64>>(&content) {
                Ok(map) => map
                    .into_iter()
                    .map(|(path, offset)| (PathBuf::from(path), offset))
                    .collect(),
                Err(e) => {
                    warn!(path = %ledger_path.display(), error = %e, "offset ledger is corrupt, starting empty");
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                warn!(path = %ledger_path.display(), error = %e, "failed to read offset ledger, starting empty");
                HashMap::new()
            }
        };

        debug!(files = offsets.len(), "offset ledger loaded");

        Self {
            ledger_path: Some(ledger_path),
            offsets: Mutex::new(offsets),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn ledger_path(&self) -> Option<&Path> {
        self.ledger_path.as_deref()
    }

    /// Stored offset for `path`, 0 if never seen.
    pub fn offset(&self, path: &Path) -> u64 {
        self.offsets()
            .get(&ledger_key(path))
            .copied()
            .unwrap_or(0)
    }

    pub fn set_offset(&self, path: &Path, offset: u64) {
        self.offsets().insert(ledger_key(path), offset);
    }

    /// Forget `path`, so the next read starts at 0.
    pub fn reset(&self, path: &Path) {
        let key = ledger_key(path);
        self.offsets().remove(&key);
        self.release_lock(&key);
    }

    /// Drop offsets and locks of files that no longer exist.
    ///
    /// Returns the number of paths forgotten.
    pub fn prune_missing(&self) -> usize {
        let missing: Vec<PathBuf> = {
            let offsets = self.offsets();
            let locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            offsets
                .keys()
                .chain(locks.keys())
                .filter(|path| !path.exists())
                .cloned()
                .collect::<HashSet<_>>()
                .into_iter()
                .collect()
        };

        for path in &missing {
            self.offsets().remove(path);
            self.release_lock(path);
        }

        if !missing.is_empty() {
            debug!(files = missing.len(), "forgot offsets of removed log files");
        }
        missing.len()
    }

    /// Number of files with a stored offset.
    pub fn len(&self) -> usize {
        self.offsets().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The lock serializing reads of `path`.
    pub fn path_lock(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(ledger_key(path)).or_default())
    }

    /// Write the ledger to disk. No-op for an in-memory tracker.
    pub fn save(&self) -> Result<()> {
        let Some(ledger_path) = &self.ledger_path else {
            return Ok(());
        };

        let snapshot: BTreeMap<String, u64> = self
            .offsets()
            .iter()
            .map(|(path, offset)| (path.to_string_lossy().into_owned(), *offset))
            .collect();

        let json = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| CostPulseError::json_parse("serialize offset ledger", e))?;

        if let Some(parent) = ledger_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| CostPulseError::io("create ledger directory", parent, e))?;
        }
        fs::write(ledger_path, json)
            .map_err(|e| CostPulseError::io("write offset ledger", ledger_path, e))?;

        debug!(files = snapshot.len(), "offset ledger saved");
        Ok(())
    }

    /// [`save`](Self::save), logging instead of returning the error.
    pub fn save_logged(&self) {
        if let Err(e) = self.save() {
            warn!(error = %e, "failed to save offset ledger, offsets kept in memory");
        }
    }

    /// Remove the lock for `key` unless a reader still holds it.
    fn release_lock(&self, key: &Path) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(key);
        }
    }

    /// Number of paths with a live lock entry.
    pub fn lock_count(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn offsets(&self) -> MutexGuard<'_, HashMap<PathBuf, u64>> {
        self.offsets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn ledger_key(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
