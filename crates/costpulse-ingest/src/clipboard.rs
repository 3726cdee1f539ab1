//! Clipboard ingestion: capture usage JSON the user copies.
//!
//! Every tick the clipboard text is read and run through a cheap filter
//! before any parsing. Repeats of the same text are skipped through a
//! last-seen fingerprint that lives only in memory.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use costpulse_core::error::{CostPulseError, Result};
use costpulse_core::fingerprint::content_hash;
use costpulse_core::types::{CLIPBOARD_PROVIDER, UsageRecord};
use costpulse_cost::{TokenFields, USAGE_SHAPES, UsageStore};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

/// Default clipboard poll interval in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Provenance label for clipboard records.
pub const CLIPBOARD_LABEL: &str = "Auto-Import";

/// Substrings at least one of which must appear before parsing is attempted.
const USAGE_MARKERS: &[&str] = &["total_tokens", "prompt_tokens", "\"usage\""];

/// Source of clipboard text.
pub trait ClipboardReader: Send {
    /// Current text, or `None` if the clipboard holds no text.
    fn read_text(&mut self) -> Result<Option<String>>;
}

/// The host clipboard.
///
/// A fresh handle is opened for every read so nothing platform-specific is
/// held between ticks.
#[cfg(feature = "system-clipboard")]
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClipboard;

#[cfg(feature = "system-clipboard")]
impl ClipboardReader for SystemClipboard {
    fn read_text(&mut self) -> Result<Option<String>> {
        let mut clipboard =
            arboard::Clipboard::new().map_err(|e| CostPulseError::clipboard(e.to_string()))?;
        match clipboard.get_text() {
            Ok(text) => Ok(Some(text)),
            Err(arboard::Error::ContentNotAvailable) => Ok(None),
            Err(e) => Err(CostPulseError::clipboard(e.to_string())),
        }
    }
}

/// In-process clipboard. Clones share contents.
#[derive(Debug, Default, Clone)]
pub struct MemoryClipboard {
    text: Arc<Mutex<Option<String>>>,
    locked: Arc<AtomicBool>,
}

impl MemoryClipboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_text(text: impl Into<String>) -> Self {
        let clipboard = Self::new();
        clipboard.set_text(text);
        clipboard
    }

    pub fn set_text(&self, text: impl Into<String>) {
        *self.text.lock().unwrap_or_else(PoisonError::into_inner) = Some(text.into());
    }

    pub fn clear(&self) {
        *self.text.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Simulate another application holding the clipboard.
    pub fn set_locked(&self, locked: bool) {
        self.locked.store(locked, Ordering::SeqCst);
    }
}

impl ClipboardReader for MemoryClipboard {
    fn read_text(&mut self) -> Result<Option<String>> {
        if self.locked.load(Ordering::SeqCst) {
            return Err(CostPulseError::clipboard("clipboard is locked"));
        }
        Ok(self.text.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }
}

/// Configuration for the clipboard source.
#[derive(Debug, Clone)]
pub struct ClipboardConfig {
    /// Interval between clipboard reads
    pub poll_interval: Duration,
}

impl Default for ClipboardConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

impl ClipboardConfig {
    /// Set the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Cheap check run before parsing clipboard text.
pub fn looks_like_usage(text: &str) -> bool {
    text.trim_start().starts_with('{') && USAGE_MARKERS.iter().any(|m| text.contains(m))
}

/// Build a record from clipboard JSON.
///
/// The whole text must be one JSON value. Prompt or total tokens must
/// resolve and the total must be positive.
pub fn extract_clipboard_usage(text: &str) -> Option<UsageRecord> {
    let root: Value = match serde_json::from_str(text.trim()) {
        Ok(value) => value,
        Err(e) => {
            trace!(error = %e, "clipboard text is not valid JSON");
            return None;
        }
    };

    let fields = TokenFields::resolve(&root, USAGE_SHAPES);
    if fields.prompt_tokens.is_none() && fields.total_tokens.is_none() {
        return None;
    }

    let (input, output, total) = fields.counts();
    if total == 0 || (input == 0 && output == 0) {
        return None;
    }

    Some(
        UsageRecord::new(CLIPBOARD_PROVIDER, fields.model_or_unknown(), input, output)
            .with_label(CLIPBOARD_LABEL),
    )
}

/// Polls a clipboard and appends usage it finds to the store.
pub struct ClipboardSource<R> {
    reader: R,
    store: Arc<dyn UsageStore>,
    config: ClipboardConfig,
    last_hash: Option<String>,
}

impl<R: ClipboardReader + 'static> ClipboardSource<R> {
    pub fn new(reader: R, store: Arc<dyn UsageStore>) -> Self {
        Self {
            reader,
            store,
            config: ClipboardConfig::default(),
            last_hash: None,
        }
    }

    pub fn with_config(mut self, config: ClipboardConfig) -> Self {
        self.config = config;
        self
    }

    /// Fingerprint of the last text that passed the filter.
    pub fn last_hash(&self) -> Option<&str> {
        self.last_hash.as_deref()
    }

    /// Run one tick. Returns the stored record, if any.
    pub fn poll_once(&mut self) -> Option<UsageRecord> {
        let text = match self.reader.read_text() {
            Ok(Some(text)) => text,
            Ok(None) => return None,
            Err(e) => {
                debug!(error = %e, "clipboard unavailable, retrying next tick");
                return None;
            }
        };

        if text.trim().is_empty() {
            return None;
        }

        let hash = content_hash(&text);
        if self.last_hash.as_deref() == Some(hash.as_str()) {
            return None;
        }

        // Unrelated text leaves the fingerprint alone.
        if !looks_like_usage(&text) {
            return None;
        }
        self.last_hash = Some(hash);

        let record = extract_clipboard_usage(&text)?;
        match self.store.add_entry(record) {
            Ok(record) => {
                info!(
                    model = %record.model_name,
                    input_tokens = record.input_tokens,
                    output_tokens = record.output_tokens,
                    cost = %record.cost,
                    "usage imported from clipboard"
                );
                Some(record)
            }
            Err(e) => {
                warn!(error = %e, "failed to store clipboard usage");
                None
            }
        }
    }

    /// Poll on a Tokio interval until the handle is stopped.
    ///
    /// Each tick runs on the blocking pool, since both the clipboard read and
    /// the store write touch the OS.
    pub fn spawn(self) -> ClipboardHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        info!(poll_interval = ?self.config.poll_interval, "starting clipboard source");

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut source = self;
            loop {
                tokio::select! {
                    biased;
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        let tick = tokio::task::spawn_blocking(move || {
                            source.poll_once();
                            source
                        });
                        match tick.await {
                            Ok(returned) => source = returned,
                            Err(e) => {
                                error!(error = %e, "clipboard poll failed, stopping source");
                                break;
                            }
                        }
                    }
                }
            }
            debug!("clipboard source stopped");
        });

        ClipboardHandle { shutdown_tx, task }
    }
}

/// Handle to a running [`ClipboardSource`].
pub struct ClipboardHandle {
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ClipboardHandle {
    /// Stop polling and wait for the current tick to finish.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.task.await {
            warn!(error = %e, "clipboard task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use costpulse_core::AppSettings;
    use costpulse_cost::JsonUsageStore;

    const USAGE: &str = r#"{"model":"gpt-4","prompt_tokens":100,"completion_tokens":50,"total_tokens":150}"#;

    fn source(clipboard: &MemoryClipboard) -> (ClipboardSource<MemoryClipboard>, Arc<JsonUsageStore>) {
        let store = Arc::new(JsonUsageStore::in_memory(AppSettings::default()));
        (ClipboardSource::new(clipboard.clone(), store.clone()), store)
    }

    #[test]
    fn test_looks_like_usage() {
        assert!(looks_like_usage("  {\"usage\": {}}"));
        assert!(looks_like_usage("{\"total_tokens\": 1}"));
        assert!(!looks_like_usage("prompt_tokens {"));
        assert!(!looks_like_usage("{\"model\": \"gpt-4\"}"));
    }

    #[test]
    fn test_extract_clipboard_shapes() {
        let flat = extract_clipboard_usage(USAGE).unwrap();
        assert_eq!((flat.input_tokens, flat.output_tokens), (100, 50));
        assert_eq!(flat.provider, CLIPBOARD_PROVIDER);
        assert_eq!(flat.label.as_deref(), Some(CLIPBOARD_LABEL));
        assert!(flat.content_hash.is_none());

        let nested = extract_clipboard_usage(
            r#"{"model":"gpt-4o","usage":{"prompt_tokens":3,"completion_tokens":4}}"#,
        )
        .unwrap();
        assert_eq!((nested.input_tokens, nested.output_tokens), (3, 4));

        let anthropic = extract_clipboard_usage(
            r#"{"model":"claude-3-haiku","usage":{"input_tokens":7,"output_tokens":8}}"#,
        )
        .unwrap();
        assert_eq!((anthropic.input_tokens, anthropic.output_tokens), (7, 8));
    }

    #[test]
    fn test_extract_clipboard_rejects() {
        // Output alone is not enough on the clipboard path.
        assert!(extract_clipboard_usage(r#"{"completion_tokens": 5}"#).is_none());
        assert!(extract_clipboard_usage(r#"{"total_tokens": 0}"#).is_none());
        // Trailing text makes the whole value invalid.
        assert!(extract_clipboard_usage(r#"{"total_tokens": 5} thanks"#).is_none());
    }

    #[test]
    fn test_blank_model_becomes_unknown() {
        let record = extract_clipboard_usage(r#"{"model":"  ","total_tokens":10}"#).unwrap();
        assert_eq!(record.model_name, "Unknown");
    }

    #[test]
    fn test_same_text_is_imported_once() {
        let clipboard = MemoryClipboard::with_text(USAGE);
        let (mut source, store) = source(&clipboard);

        assert!(source.poll_once().is_some());
        assert!(source.poll_once().is_none());
        assert_eq!(store.entries().len(), 1);
        assert_eq!(store.entries()[0].cost, rust_decimal::Decimal::new(6, 3));
    }

    #[test]
    fn test_unrelated_text_does_not_update_fingerprint() {
        let clipboard = MemoryClipboard::with_text("hello world");
        let (mut source, _store) = source(&clipboard);

        assert!(source.poll_once().is_none());
        assert!(source.last_hash().is_none());

        clipboard.set_text(USAGE);
        assert!(source.poll_once().is_some());
        assert_eq!(source.last_hash(), Some(content_hash(USAGE).as_str()));
    }

    #[test]
    fn test_bad_json_is_fingerprinted_before_parse() {
        let bad = r#"{"total_tokens": 10,"#;
        let clipboard = MemoryClipboard::with_text(bad);
        let (mut source, store) = source(&clipboard);

        assert!(source.poll_once().is_none());
        assert_eq!(source.last_hash(), Some(content_hash(bad).as_str()));
        assert!(store.entries().is_empty());
    }

    #[test]
    fn test_recopy_after_other_text_is_recorded_again() {
        let clipboard = MemoryClipboard::with_text(USAGE);
        let (mut source, store) = source(&clipboard);

        source.poll_once();
        clipboard.set_text(r#"{"usage": {"input_tokens": 1, "output_tokens": 1}}"#);
        source.poll_once();
        clipboard.set_text(USAGE);
        source.poll_once();

        assert_eq!(store.entries().len(), 3);
    }

    #[test]
    fn test_locked_and_empty_clipboard_are_skipped() {
        let clipboard = MemoryClipboard::with_text(USAGE);
        let (mut source, store) = source(&clipboard);

        clipboard.set_locked(true);
        assert!(source.poll_once().is_none());

        clipboard.set_locked(false);
        clipboard.clear();
        assert!(source.poll_once().is_none());

        clipboard.set_text("   \n");
        assert!(source.poll_once().is_none());

        clipboard.set_text(USAGE);
        assert!(source.poll_once().is_some());
        assert_eq!(store.entries().len(), 1);
    }

    /// Reader that records the thread of every read.
    struct ThreadRecordingClipboard {
        inner: MemoryClipboard,
        threads: Arc<Mutex<Vec<std::thread::ThreadId>>>,
    }

    impl ClipboardReader for ThreadRecordingClipboard {
        fn read_text(&mut self) -> Result<Option<String>> {
            self.threads.lock().unwrap().push(std::thread::current().id());
            self.inner.read_text()
        }
    }

    #[tokio::test]
    async fn test_spawned_source_reads_off_the_runtime_thread() {
        let threads = Arc::new(Mutex::new(Vec::new()));
        let reader = ThreadRecordingClipboard {
            inner: MemoryClipboard::with_text(USAGE),
            threads: threads.clone(),
        };
        let store = Arc::new(JsonUsageStore::in_memory(AppSettings::default()));
        let handle = ClipboardSource::new(reader, store.clone())
            .with_config(ClipboardConfig::default().with_poll_interval(Duration::from_millis(10)))
            .spawn();

        tokio::time::sleep(Duration::from_millis(80)).await;
        handle.stop().await;

        let runtime_thread = std::thread::current().id();
        let threads = threads.lock().unwrap();
        assert!(!threads.is_empty());
        assert!(threads.iter().all(|id| *id != runtime_thread));
        assert_eq!(store.entries().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_source_polls_until_stopped() {
        let clipboard = MemoryClipboard::with_text(USAGE);
        let (source, store) = source(&clipboard);
        let handle = source
            .with_config(ClipboardConfig::default().with_poll_interval(Duration::from_millis(10)))
            .spawn();

        tokio::time::sleep(Duration::from_millis(35)).await;
        assert_eq!(store.entries().len(), 1);

        handle.stop().await;
        clipboard.set_text(r#"{"total_tokens": 99, "prompt_tokens": 9}"#);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.entries().len(), 1);
    }
}
