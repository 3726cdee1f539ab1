//! Passive ingestion of usage reports from application log files.
//!
//! ## Architecture
//!
//! - A `notify` debouncer watches every configured directory (non-recursive)
//!   and queues changed files on a channel
//! - A periodic rescan sweeps every eligible file as a backstop for missed
//!   notifications, re-reading the watch list from the store each time
//! - One worker task drains both sources, so file reads and offset updates
//!   happen off the notification thread
//! - Per-path locks in [`TailTracker`] keep overlapping triggers for the same
//!   file from double-advancing its offset; each rescan forgets files that
//!   have been deleted
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use costpulse_cost::JsonUsageStore;
//! use costpulse_ingest::{EngineConfig, LogIngestionEngine};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(JsonUsageStore::open("costpulse.json")?);
//!     let mut engine = LogIngestionEngine::new(store, EngineConfig::new("log_offsets.json"));
//!
//!     engine.start()?;
//!     tokio::signal::ctrl_c().await?;
//!     engine.stop().await;
//!     Ok(())
//! }
//! ```

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use costpulse_core::error::{CostPulseError, Result};
use costpulse_core::paths;
use costpulse_core::types::log_source_label;
use costpulse_cost::{UsageStore, extract_usage};
use notify::{EventKind, RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{DebounceEventResult, Debouncer, RecommendedCache, new_debouncer};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::tail::TailTracker;

/// Default interval between full rescans in seconds.
pub const DEFAULT_RESCAN_INTERVAL_SECS: u64 = 30;

/// Default delay before the first rescan in milliseconds.
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 1000;

/// Default debounce duration in milliseconds.
pub const DEFAULT_DEBOUNCE_MS: u64 = 100;

/// Default channel buffer size for change notifications.
pub const DEFAULT_CHANNEL_BUFFER: usize = 256;

/// File extensions read by the engine, compared ignoring case.
pub const ELIGIBLE_EXTENSIONS: &[&str] = &["log", "txt", "json", "jsonl"];

/// True if `path` has an eligible extension.
pub fn is_eligible(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| {
            ELIGIBLE_EXTENSIONS
                .iter()
                .any(|eligible| ext.eq_ignore_ascii_case(eligible))
        })
}

/// Configuration for the log ingestion engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Where the offset ledger lives; `None` keeps offsets in memory only
    pub offsets_path: Option<PathBuf>,

    /// Interval between full rescans
    pub rescan_interval: Duration,

    /// Delay before the first rescan after start
    pub initial_delay: Duration,

    /// Debounce duration for file system events
    pub debounce_duration: Duration,

    /// Channel buffer size for change notifications
    pub channel_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            offsets_path: None,
            rescan_interval: Duration::from_secs(DEFAULT_RESCAN_INTERVAL_SECS),
            initial_delay: Duration::from_millis(DEFAULT_INITIAL_DELAY_MS),
            debounce_duration: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            channel_buffer: DEFAULT_CHANNEL_BUFFER,
        }
    }
}

impl EngineConfig {
    /// Create a config persisting offsets at `offsets_path`.
    pub fn new(offsets_path: impl Into<PathBuf>) -> Self {
        Self {
            offsets_path: Some(offsets_path.into()),
            ..Default::default()
        }
    }

    /// Create a config using the ledger in the data directory.
    pub fn default_config() -> Result<Self> {
        Ok(Self::new(paths::offsets_file()?))
    }

    /// Set the rescan interval.
    pub fn with_rescan_interval(mut self, interval: Duration) -> Self {
        self.rescan_interval = interval;
        self
    }

    /// Set the delay before the first rescan.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the debounce duration.
    pub fn with_debounce(mut self, duration: Duration) -> Self {
        self.debounce_duration = duration;
        self
    }

    /// Set the channel buffer size.
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.channel_buffer = size;
        self
    }
}

/// The shared state every trigger works against.
#[derive(Clone)]
struct Ingestor {
    store: Arc<dyn UsageStore>,
    tracker: Arc<TailTracker>,
}

impl Ingestor {
    fn process_file(&self, path: &Path) -> usize {
        if !is_eligible(path) {
            return 0;
        }

        let lock = self.tracker.path_lock(path);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        match self.tail(path) {
            Ok(imported) => imported,
            Err(e) if e.is_transient() => {
                debug!(path = %path.display(), error = %e, "log file busy, retrying on next trigger");
                0
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read log file");
                0
            }
        }
    }

    /// Read everything past the stored offset. Caller holds the path lock.
    fn tail(&self, path: &Path) -> Result<usize> {
        // std opens with read/write/delete sharing on Windows, so appenders are never blocked.
        let file = File::open(path).map_err(|e| CostPulseError::io("open log file", path, e))?;
        let len = file
            .metadata()
            .map_err(|e| CostPulseError::io("stat log file", path, e))?
            .len();

        let stored = self.tracker.offset(path);
        let offset = if len < stored {
            info!(
                path = %path.display(),
                len,
                offset = stored,
                "log file truncated or rotated, reading from start"
            );
            0
        } else {
            stored
        };

        if len == offset {
            if offset != stored {
                self.tracker.set_offset(path, offset);
            }
            return Ok(0);
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let label = log_source_label(&file_name);

        let mut reader = BufReader::new(file);
        reader
            .seek(SeekFrom::Start(offset))
            .map_err(|e| CostPulseError::io("seek log file", path, e))?;

        // Only bytes up to the last newline count as consumed. A half-written
        // final line is left for the next trigger.
        let mut imported = 0;
        let mut consumed = offset;
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) => break,
                Ok(n) => {
                    if line.last() != Some(&b'\n') {
                        trace!(path = %path.display(), bytes = n, "partial line, waiting for the rest");
                        break;
                    }
                    consumed += n as u64;

                    let text = String::from_utf8_lossy(&line);
                    let Some(record) = extract_usage(&text, &label) else {
                        continue;
                    };
                    match self.store.add_if_new(record) {
                        Ok(Some(record)) => {
                            imported += 1;
                            debug!(
                                source = %label,
                                model = %record.model_name,
                                cost = %record.cost,
                                "usage imported from log"
                            );
                        }
                        Ok(None) => {}
                        Err(e) => warn!(source = %label, error = %e, "failed to store usage record"),
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "read error, keeping position");
                    break;
                }
            }
        }

        self.tracker.set_offset(path, consumed);

        if imported > 0 {
            info!(source = %label, imported, "imported usage records");
        }

        Ok(imported)
    }

    fn scan_all(&self) -> usize {
        let mut imported = 0;

        for dir in self.store.log_watch_paths() {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) => {
                    debug!(path = %dir.display(), error = %e, "skipping unreadable watch directory");
                    continue;
                }
            };

            let mut files: Vec<PathBuf> = entries
                .flatten()
                .map(|entry| entry.path())
                .filter(|path| path.is_file() && is_eligible(path))
                .collect();
            files.sort();

            for file in files {
                imported += self.process_file(&file);
            }
        }

        imported
    }
}

type FileDebouncer = Debouncer<RecommendedWatcher, RecommendedCache>;

/// Directory watches kept in step with the configured watch paths.
struct WatchSet {
    debouncer: FileDebouncer,
    watching: HashSet<PathBuf>,
    failed: HashSet<PathBuf>,
}

impl WatchSet {
    fn new(debounce: Duration, changes: mpsc::Sender<PathBuf>) -> Result<Self> {
        let debouncer = new_debouncer(debounce, None, move |result: DebounceEventResult| {
            match result {
                Ok(events) => {
                    for event in events {
                        if !matches!(event.event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                            continue;
                        }
                        for path in &event.event.paths {
                            if is_eligible(path) && changes.try_send(path.clone()).is_err() {
                                trace!(path = %path.display(), "change queue full or closed, rescan will catch up");
                            }
                        }
                    }
                }
                Err(errors) => {
                    for error in errors {
                        warn!("File watcher error: {:?}", error);
                    }
                }
            }
        })
        .map_err(|e| CostPulseError::WatcherInit {
            message: format!("Failed to create debouncer: {}", e),
        })?;

        Ok(Self {
            debouncer,
            watching: HashSet::new(),
            failed: HashSet::new(),
        })
    }

    /// Watch new directories and drop removed ones.
    ///
    /// A directory that cannot be watched is skipped with one warning and
    /// retried on the next call.
    fn reconcile(&mut self, desired: &[PathBuf]) {
        let removed: Vec<PathBuf> = self
            .watching
            .iter()
            .filter(|path| !desired.contains(path))
            .cloned()
            .collect();
        for path in removed {
            if let Err(e) = self.debouncer.unwatch(&path) {
                debug!(path = %path.display(), error = %e, "unwatch failed");
            }
            self.watching.remove(&path);
            info!(path = %path.display(), "stopped watching log directory");
        }
        self.failed.retain(|path| desired.contains(path));

        for path in desired {
            if self.watching.contains(path) {
                continue;
            }
            match self.debouncer.watch(path, RecursiveMode::NonRecursive) {
                Ok(()) => {
                    self.failed.remove(path);
                    self.watching.insert(path.clone());
                    info!(path = %path.display(), "watching log directory");
                }
                Err(e) => {
                    if self.failed.insert(path.clone()) {
                        let err = CostPulseError::WatchPath {
                            path: path.clone(),
                            message: e.to_string(),
                        };
                        warn!(error = %err, "skipping log directory");
                    }
                }
            }
        }
    }

    fn watched(&self) -> usize {
        self.watching.len()
    }
}

struct RunningEngine {
    shutdown_tx: oneshot::Sender<()>,
    worker: JoinHandle<()>,
}

/// Tails every eligible file in the configured directories into the store.
pub struct LogIngestionEngine {
    ingestor: Ingestor,
    config: EngineConfig,
    running: Option<RunningEngine>,
}

impl LogIngestionEngine {
    /// Create an engine, loading the offset ledger if one is configured.
    pub fn new(store: Arc<dyn UsageStore>, config: EngineConfig) -> Self {
        let tracker = match &config.offsets_path {
            Some(path) => TailTracker::load(path),
            None => TailTracker::in_memory(),
        };
        Self {
            ingestor: Ingestor {
                store,
                tracker: Arc::new(tracker),
            },
            config,
            running: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The offset ledger.
    pub fn tracker(&self) -> &TailTracker {
        &self.ingestor.tracker
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Read new content from one file. Returns the number of records imported.
    ///
    /// Ineligible files are ignored. Read failures are logged, never returned.
    pub fn process_file(&self, path: &Path) -> usize {
        self.ingestor.process_file(path)
    }

    /// Process every eligible file directly inside each watch directory.
    pub fn scan_all(&self) -> usize {
        self.ingestor.scan_all()
    }

    /// Start watching and rescanning. Must be called inside a Tokio runtime.
    ///
    /// Directories that cannot be watched are skipped; only a failure to
    /// create the watcher itself is returned.
    pub fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            debug!("log ingestion engine already running");
            return Ok(());
        }

        let (changes_tx, changes_rx) = mpsc::channel(self.config.channel_buffer);
        let mut watches = WatchSet::new(self.config.debounce_duration, changes_tx)?;
        watches.reconcile(&self.ingestor.store.log_watch_paths());

        info!(
            directories = watches.watched(),
            rescan_secs = self.config.rescan_interval.as_secs(),
            "starting log ingestion engine"
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let worker = tokio::spawn(run_worker(
            self.ingestor.clone(),
            watches,
            self.config.clone(),
            changes_rx,
            shutdown_rx,
        ));

        self.running = Some(RunningEngine {
            shutdown_tx,
            worker,
        });
        Ok(())
    }

    /// Stop the engine.
    ///
    /// When this returns the timer is cancelled, every watch is removed, no
    /// read is in progress, and the offset ledger has been saved.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        let _ = running.shutdown_tx.send(());
        if let Err(e) = running.worker.await {
            error!(error = %e, "log ingestion worker failed");
            self.ingestor.tracker.save_logged();
        }

        info!("log ingestion engine stopped");
    }
}

async fn run_worker(
    ingestor: Ingestor,
    mut watches: WatchSet,
    config: EngineConfig,
    mut changes: mpsc::Receiver<PathBuf>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut ticker =
        tokio::time::interval_at(Instant::now() + config.initial_delay, config.rescan_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => break,

            _ = ticker.tick() => {
                watches.reconcile(&ingestor.store.log_watch_paths());
                let imported = run_blocking(ingestor.clone(), |ingestor| {
                    let imported = ingestor.scan_all();
                    ingestor.tracker.prune_missing();
                    ingestor.tracker.save_logged();
                    imported
                })
                .await;
                debug!(imported, "rescan complete");
            }

            Some(path) = changes.recv() => {
                run_blocking(ingestor.clone(), move |ingestor| ingestor.process_file(&path)).await;
            }
        }
    }

    // Joins the debouncer thread, so no notification outlives the engine.
    if let Err(e) = tokio::task::spawn_blocking(move || watches.debouncer.stop()).await {
        error!(error = %e, "failed to stop file watcher");
    }
    changes.close();

    run_blocking(ingestor, |ingestor| {
        ingestor.tracker.save_logged();
        0
    })
    .await;
}

async fn run_blocking<F>(ingestor: Ingestor, work: F) -> usize
where
    F: FnOnce(&Ingestor) -> usize + Send + 'static,
{
    match tokio::task::spawn_blocking(move || work(&ingestor)).await {
        Ok(count) => count,
        Err(e) => {
            error!(error = %e, "ingestion task failed");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use costpulse_core::AppSettings;
    use costpulse_cost::JsonUsageStore;
    use std::io::Write;
    use tempfile::TempDir;

    const USAGE_LINE: &str = r#"{"model":"gpt-4","usage":{"prompt_tokens":10,"completion_tokens":20,"total_tokens":30}}"#;

    fn usage_line(prompt: u64) -> String {
        format!(r#"INFO {{"model":"gpt-4o","usage":{{"prompt_tokens":{prompt},"completion_tokens":5}}}}"#)
    }

    fn engine() -> (LogIngestionEngine, Arc<JsonUsageStore>) {
        let store = Arc::new(JsonUsageStore::in_memory(AppSettings::default()));
        let engine = LogIngestionEngine::new(store.clone(), EngineConfig::default());
        (engine, store)
    }

    fn append(path: &Path, lines: &[String]) {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
    }

    #[test]
    fn test_config_defaults_and_builders() {
        let config = EngineConfig::default();
        assert_eq!(config.rescan_interval, Duration::from_secs(30));
        assert_eq!(config.initial_delay, Duration::from_secs(1));
        assert_eq!(config.debounce_duration, Duration::from_millis(100));
        assert!(config.offsets_path.is_none());

        let config = EngineConfig::new("/tmp/offsets.json")
            .with_rescan_interval(Duration::from_secs(5))
            .with_buffer_size(8);
        assert_eq!(config.rescan_interval, Duration::from_secs(5));
        assert_eq!(config.channel_buffer, 8);
        assert_eq!(config.offsets_path, Some(PathBuf::from("/tmp/offsets.json")));
    }

    #[test]
    fn test_eligible_extensions() {
        assert!(is_eligible(Path::new("/a/app.log")));
        assert!(is_eligible(Path::new("/a/APP.LOG")));
        assert!(is_eligible(Path::new("/a/out.txt")));
        assert!(is_eligible(Path::new("/a/data.json")));
        assert!(is_eligible(Path::new("/a/events.JsonL")));
        assert!(!is_eligible(Path::new("/a/app.log.1")));
        assert!(!is_eligible(Path::new("/a/trace.csv")));
        assert!(!is_eligible(Path::new("/a/Makefile")));
    }

    #[test]
    fn test_incremental_tail_imports_only_new_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        let (engine, store) = engine();

        append(&path, &[usage_line(1), "noise".to_string(), usage_line(2)]);
        assert_eq!(engine.process_file(&path), 2);
        assert_eq!(engine.tracker().offset(&path), fs::metadata(&path).unwrap().len());

        // Nothing new: no-op.
        assert_eq!(engine.process_file(&path), 0);

        append(&path, &[usage_line(3)]);
        assert_eq!(engine.process_file(&path), 1);

        let inputs: Vec<u64> = store.entries().iter().map(|e| e.input_tokens).collect();
        assert_eq!(inputs, vec![1, 2, 3]);
        assert!(store.entries().iter().all(|e| e.provider == "Log: app.log"));
    }

    #[test]
    fn test_truncation_rereads_from_start() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        let (engine, store) = engine();

        append(&path, &[usage_line(1), usage_line(2), usage_line(3)]);
        assert_eq!(engine.process_file(&path), 3);

        // Rotate: the file is replaced with shorter content.
        fs::write(&path, format!("{}\n", usage_line(9))).unwrap();
        assert_eq!(engine.process_file(&path), 1);

        assert_eq!(store.entries().len(), 4);
        assert_eq!(store.entries()[3].input_tokens, 9);
    }

    #[test]
    fn test_reread_bytes_are_deduplicated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        let (engine, store) = engine();

        append(&path, &[USAGE_LINE.to_string()]);
        assert_eq!(engine.process_file(&path), 1);

        engine.tracker().reset(&path);
        assert_eq!(engine.process_file(&path), 0);
        assert_eq!(store.entries().len(), 1);
    }

    #[test]
    fn test_ineligible_and_missing_files_are_ignored() {
        let dir = TempDir::new().unwrap();
        let (engine, store) = engine();

        let csv = dir.path().join("usage.csv");
        append(&csv, &[USAGE_LINE.to_string()]);
        assert_eq!(engine.process_file(&csv), 0);
        assert_eq!(engine.process_file(&dir.path().join("missing.log")), 0);

        assert!(store.entries().is_empty());
        assert!(engine.tracker().is_empty());
    }

    #[test]
    fn test_invalid_utf8_does_not_stop_the_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bin.log");
        let (engine, store) = engine();

        let mut bytes = vec![0xff, 0xfe, b'\n'];
        bytes.extend_from_slice(usage_line(4).as_bytes());
        bytes.push(b'\n');
        fs::write(&path, bytes).unwrap();

        assert_eq!(engine.process_file(&path), 1);
        assert_eq!(store.entries()[0].input_tokens, 4);
    }

    #[test]
    fn test_line_written_in_two_flushes_is_imported_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        let (engine, store) = engine();

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .unwrap();
        write!(file, r#"INFO {{"model":"gpt-4","usage":{{"prompt_tokens":10,"#).unwrap();
        file.flush().unwrap();

        assert_eq!(engine.process_file(&path), 0);
        assert_eq!(engine.tracker().offset(&path), 0);

        writeln!(file, r#""completion_tokens":20,"total_tokens":30}}}}"#).unwrap();
        file.flush().unwrap();

        assert_eq!(engine.process_file(&path), 1);
        assert_eq!(store.entries().len(), 1);
        assert_eq!(store.entries()[0].input_tokens, 10);
        assert_eq!(store.entries()[0].output_tokens, 20);
        assert_eq!(engine.tracker().offset(&path), fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn test_partial_tail_after_complete_lines_keeps_line_boundary() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        let (engine, store) = engine();

        append(&path, &[usage_line(1)]);
        let boundary = fs::metadata(&path).unwrap().len();
        let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
        write!(file, "INFO {{\"model\":\"gpt-4o\"").unwrap();
        file.flush().unwrap();

        assert_eq!(engine.process_file(&path), 1);
        assert_eq!(engine.tracker().offset(&path), boundary);

        writeln!(file, r#","usage":{{"prompt_tokens":2,"completion_tokens":5}}}}"#).unwrap();
        assert_eq!(engine.process_file(&path), 1);
        let inputs: Vec<u64> = store.entries().iter().map(|e| e.input_tokens).collect();
        assert_eq!(inputs, vec![1, 2]);
    }

    #[test]
    fn test_scan_all_reads_top_level_eligible_files() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("nested");
        fs::create_dir(&nested).unwrap();

        append(&dir.path().join("a.log"), &[usage_line(1)]);
        append(&dir.path().join("b.jsonl"), &[usage_line(2)]);
        append(&dir.path().join("c.md"), &[usage_line(3)]);
        append(&nested.join("d.log"), &[usage_line(4)]);

        let store = Arc::new(JsonUsageStore::in_memory(AppSettings::default()));
        store.add_watch_path(dir.path()).unwrap();
        store.add_watch_path(&dir.path().join("does-not-exist")).unwrap();
        let engine = LogIngestionEngine::new(store.clone(), EngineConfig::default());

        assert_eq!(engine.scan_all(), 2);
        assert_eq!(engine.scan_all(), 0);
    }

    #[tokio::test]
    async fn test_start_stop_without_watch_paths() {
        let (mut engine, _store) = engine();
        engine.start().unwrap();
        assert!(engine.is_running());
        engine.stop().await;
        assert!(!engine.is_running());
        // Stopping twice is harmless.
        engine.stop().await;
    }
}
