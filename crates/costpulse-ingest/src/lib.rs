//! # costpulse-ingest
//!
//! Background sources feeding usage records into a [`costpulse_cost::UsageStore`].
//!
//! This crate provides:
//! - [`LogIngestionEngine`] - Tail log files in watched directories
//! - [`TailTracker`] - Persistent per-file read offsets
//! - [`ClipboardSource`] - Capture usage JSON copied to the clipboard
//!
//! Both sources swallow transient failures (locked files, busy clipboard)
//! and retry on their next trigger.

pub mod clipboard;
pub mod engine;
pub mod tail;

// Re-export main types
#[cfg(feature = "system-clipboard")]
pub use clipboard::SystemClipboard;
pub use clipboard::{
    ClipboardConfig, ClipboardHandle, ClipboardReader, ClipboardSource, MemoryClipboard,
    extract_clipboard_usage,
};
pub use engine::{EngineConfig, LogIngestionEngine, is_eligible};
pub use tail::TailTracker;
