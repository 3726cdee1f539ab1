//! # costpulse-cost
//!
//! Usage extraction, pricing, and cost attribution for CostPulse.
//!
//! This crate provides:
//! - [`extract_usage`] - Pull a usage record out of a log line
//! - [`PricingResolver`] - Model pricing lookup with hot-swappable tables
//! - [`JsonUsageStore`] - Deduplicating usage store persisted as JSON
//! - [`TotalsCalculator`] - Session, daily, and monthly totals
//! - [`ManualEntry`] - Usage typed in by the user
//!
//! ## Supported Usage Formats
//!
//! - OpenAI flat: prompt_tokens, completion_tokens, total_tokens at the root
//! - OpenAI chat: the same fields nested in `usage`, model at the root
//! - Anthropic: usage.input_tokens, usage.output_tokens
//!
//! ## Example
//!
//! ```no_run
//! use costpulse_cost::{JsonUsageStore, UsageStore, extract_usage};
//!
//! fn main() -> anyhow::Result<()> {
//!     let store = JsonUsageStore::open("costpulse.json")?;
//!
//!     let line = r#"INFO {"model":"gpt-4o","usage":{"prompt_tokens":10,"completion_tokens":20}}"#;
//!     if let Some(record) = extract_usage(line, "Log: app.log") {
//!         store.add_if_new(record)?;
//!     }
//!
//!     println!("{} records", store.entries().len());
//!     Ok(())
//! }
//! ```

pub mod extractor;
pub mod manual;
pub mod pricing;
pub mod store;
pub mod totals;

// Re-export main types
pub use extractor::{TokenFields, USAGE_SHAPES, UsageShape, extract_usage};
pub use manual::{ManualEntry, infer_provider};
pub use pricing::{PricingResolver, PricingTable};
pub use store::{DataDocument, JsonUsageStore, StoreEvent, UsageStore};
pub use totals::{BudgetStatus, DailyCost, TotalsCalculator, TotalsSummary};
