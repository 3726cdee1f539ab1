//! # costpulse-core
//!
//! Core types, errors, and utilities for CostPulse.
//!
//! This crate provides:
//! - [`CostPulseError`] - Error type shared by every CostPulse crate
//! - [`logging`] - Tracing setup
//! - [`types`] - Usage records and pricing rates
//! - [`fingerprint`] - Content hashes used for deduplication
//! - [`settings`] - User settings stored in the data document
//! - [`paths`] - Data directory layout

pub mod error;
pub mod fingerprint;
pub mod logging;
pub mod paths;
pub mod settings;
pub mod types;

pub use error::{CostPulseError, Result};
pub use fingerprint::content_hash;
pub use logging::{LogGuard, init_logging};
pub use settings::AppSettings;
pub use types::{PricingRate, UsageRecord, default_pricing_table, format_cost};
