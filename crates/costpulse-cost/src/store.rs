//! Usage store backed by a single JSON document.
//!
//! The document holds the user's settings and the full usage history. Every
//! mutation rewrites it. A document that fails to parse is moved aside to
//! `costpulse_corrupt_<timestamp>.json` and the store starts fresh.
//!
//! Writes that fail are logged and the in-memory state stays authoritative
//! until the next successful write.

use std::collections::HashSet;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Local;
use costpulse_core::error::{CostPulseError, Result};
use costpulse_core::settings::AppSettings;
use costpulse_core::types::UsageRecord;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::pricing::PricingResolver;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Change notifications published by [`JsonUsageStore`].
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    EntryAdded(UsageRecord),
    EntryDeleted(Uuid),
    HistoryCleared,
    SettingsUpdated,
}

/// What ingestion sources need from the store.
pub trait UsageStore: Send + Sync {
    /// Price and append `record` unconditionally.
    fn add_entry(&self, record: UsageRecord) -> Result<UsageRecord>;

    /// Price and append `record` unless its content hash is already stored.
    ///
    /// The check and the append happen under one lock. Returns `None` for a
    /// duplicate. Records without a hash are always added.
    fn add_if_new(&self, record: UsageRecord) -> Result<Option<UsageRecord>>;

    /// True if a stored record carries `hash`.
    fn contains_hash(&self, hash: &str) -> bool;

    /// Snapshot of every stored record, oldest first.
    fn entries(&self) -> Vec<UsageRecord>;

    /// Directories configured for log ingestion.
    fn log_watch_paths(&self) -> Vec<PathBuf>;

    /// Resolver kept in sync with the stored pricing table.
    fn pricing(&self) -> Arc<PricingResolver>;
}

/// On-disk document layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DataDocument {
    pub settings: AppSettings,
    pub entries: Vec<UsageRecord>,
}

#[derive(Debug, Default)]
struct StoreState {
    document: DataDocument,
    hashes: HashSet<String>,
}

impl StoreState {
    fn new(document: DataDocument) -> Self {
        let hashes = document
            .entries
            .iter()
            .filter_map(|e| e.content_hash.clone())
            .collect();
        Self { document, hashes }
    }
}

/// [`UsageStore`] persisted as one JSON file.
#[derive(Debug)]
pub struct JsonUsageStore {
    path: Option<PathBuf>,
    state: Mutex<StoreState>,
    pricing: Arc<PricingResolver>,
    events: broadcast::Sender<StoreEvent>,
}

impl JsonUsageStore {
    /// Open the document at `path`, creating defaults if it does not exist.
    ///
    /// Default pricing models missing from the stored table are added and the
    /// document is saved once if anything changed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut document = load_document(&path)?;

        let added = document.settings.merge_default_pricing();
        let store = Self::build(Some(path), document);
        if !added.is_empty() {
            store.persist_logged(&store.lock());
        }

        Ok(store)
    }

    /// A store that never touches the disk.
    pub fn in_memory(settings: AppSettings) -> Self {
        Self::build(
            None,
            DataDocument {
                settings,
                entries: Vec::new(),
            },
        )
    }

    fn build(path: Option<PathBuf>, document: DataDocument) -> Self {
        let pricing = Arc::new(PricingResolver::new(
            document.settings.pricing_models.clone(),
        ));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        info!(
            entries = document.entries.len(),
            path = ?path,
            "usage store opened"
        );
        Self {
            path,
            state: Mutex::new(StoreState::new(document)),
            pricing,
            events,
        }
    }

    /// Path of the backing document, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub fn settings(&self) -> AppSettings {
        self.lock().document.settings.clone()
    }

    /// Replace the settings and push the new pricing table to the resolver.
    pub fn update_settings(&self, settings: AppSettings) -> Result<()> {
        settings.validate()?;
        {
            let mut state = self.lock();
            self.pricing.update_table(settings.pricing_models.clone());
            state.document.settings = settings;
            self.persist_logged(&state);
        }
        self.notify(StoreEvent::SettingsUpdated);
        Ok(())
    }

    /// Add a watch directory. Returns false if it was already configured.
    pub fn add_watch_path(&self, path: &Path) -> Result<bool> {
        let added = {
            let mut state = self.lock();
            let added = state.document.settings.add_watch_path(path);
            if added {
                self.persist_logged(&state);
            }
            added
        };
        if added {
            info!(path = %path.display(), "watch path added");
            self.notify(StoreEvent::SettingsUpdated);
        }
        Ok(added)
    }

    /// Remove a watch directory. Returns false if it was not configured.
    pub fn remove_watch_path(&self, path: &Path) -> Result<bool> {
        let removed = {
            let mut state = self.lock();
            let removed = state.document.settings.remove_watch_path(path);
            if removed {
                self.persist_logged(&state);
            }
            removed
        };
        if removed {
            info!(path = %path.display(), "watch path removed");
            self.notify(StoreEvent::SettingsUpdated);
        }
        Ok(removed)
    }

    /// Delete one record. Returns false if no record has `id`.
    pub fn delete_entry(&self, id: Uuid) -> Result<bool> {
        let removed = {
            let mut state = self.lock();
            let Some(index) = state.document.entries.iter().position(|e| e.id == id) else {
                return Ok(false);
            };
            let record = state.document.entries.remove(index);
            // Another record may share the hash.
            if let Some(hash) = record.content_hash {
                if !state
                    .document
                    .entries
                    .iter()
                    .any(|e| e.content_hash.as_deref() == Some(hash.as_str()))
                {
                    state.hashes.remove(&hash);
                }
            }
            self.persist_logged(&state);
            true
        };
        if removed {
            self.notify(StoreEvent::EntryDeleted(id));
        }
        Ok(removed)
    }

    /// Drop the whole usage history. Settings are kept.
    pub fn clear_history(&self) -> Result<()> {
        {
            let mut state = self.lock();
            let count = state.document.entries.len();
            state.document.entries.clear();
            state.hashes.clear();
            self.persist_logged(&state);
            info!(removed = count, "usage history cleared");
        }
        self.notify(StoreEvent::HistoryCleared);
        Ok(())
    }

    /// Write the document now, returning any error.
    pub fn save(&self) -> Result<()> {
        let state = self.lock();
        self.persist(&state)
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn price(&self, mut record: UsageRecord) -> UsageRecord {
        record.cost = self.pricing.price(
            record.model_name.trim(),
            record.input_tokens,
            record.output_tokens,
        );
        record
    }

    fn append(&self, state: &mut StoreState, record: UsageRecord) -> UsageRecord {
        let record = self.price(record);
        if let Some(hash) = &record.content_hash {
            state.hashes.insert(hash.clone());
        }
        state.document.entries.push(record.clone());
        self.persist_logged(state);
        debug!(
            provider = %record.provider,
            model = %record.model_name,
            input_tokens = record.input_tokens,
            output_tokens = record.output_tokens,
            cost = %record.cost,
            "usage record added"
        );
        record
    }

    fn notify(&self, event: StoreEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn persist_logged(&self, state: &StoreState) {
        if let Err(e) = self.persist(state) {
            error!(error = %e, "failed to save usage store, keeping in-memory state");
        }
    }

    fn persist(&self, state: &StoreState) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| CostPulseError::io("create data directory", parent, e))?;
        }

        let tmp = path.with_extension("json.tmp");
        let file =
            fs::File::create(&tmp).map_err(|e| CostPulseError::io("create data file", &tmp, e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &state.document)
            .map_err(|e| CostPulseError::json_parse("serialize data document", e))?;
        writer
            .flush()
            .map_err(|e| CostPulseError::io("write data file", &tmp, e))?;
        drop(writer);

        fs::rename(&tmp, path).map_err(|e| CostPulseError::io("replace data file", path, e))
    }
}

impl UsageStore for JsonUsageStore {
    fn add_entry(&self, record: UsageRecord) -> Result<UsageRecord> {
        let record = {
            let mut state = self.lock();
            self.append(&mut state, record)
        };
        self.notify(StoreEvent::EntryAdded(record.clone()));
        Ok(record)
    }

    fn add_if_new(&self, record: UsageRecord) -> Result<Option<UsageRecord>> {
        let record = {
            let mut state = self.lock();
            if let Some(hash) = &record.content_hash {
                if state.hashes.contains(hash) {
                    debug!(hash = %hash, "duplicate usage record skipped");
                    return Ok(None);
                }
            }
            self.append(&mut state, record)
        };
        self.notify(StoreEvent::EntryAdded(record.clone()));
        Ok(Some(record))
    }

    fn contains_hash(&self, hash: &str) -> bool {
        self.lock().hashes.contains(hash)
    }

    fn entries(&self) -> Vec<UsageRecord> {
        self.lock().document.entries.clone()
    }

    fn log_watch_paths(&self) -> Vec<PathBuf> {
        self.lock().document.settings.log_watch_paths.clone()
    }

    fn pricing(&self) -> Arc<PricingResolver> {
        Arc::clone(&self.pricing)
    }
}

/// Load the document, backing up and replacing it if it is corrupt.
fn load_document(path: &Path) -> Result<DataDocument> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "no data file, starting with defaults");
            return Ok(DataDocument::default());
        }
        Err(e) => return Err(CostPulseError::io("read data file", path, e)),
    };

    if content.trim().is_empty() {
        return Ok(DataDocument::default());
    }

    match serde_json::from_str::<DataDocument>(&content) {
        Ok(document) => Ok(document),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "data file is corrupt");
            let backup = corrupt_backup_path(path);
            match fs::rename(path, &backup) {
                Ok(()) => warn!(backup = %backup.display(), "corrupt data file moved aside"),
                Err(rename_err) => {
                    error!(error = %rename_err, "failed to back up corrupt data file")
                }
            }
            Ok(DataDocument::default())
        }
    }
}

fn corrupt_backup_path(path: &Path) -> PathBuf {
    let stamp = Local::now().format("%Y%m%d_%H%M%S");
    let name = format!("costpulse_corrupt_{stamp}.json");
    match path.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}
