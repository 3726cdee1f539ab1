//! Shared type definitions used across CostPulse crates.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Provider tag for records captured from the clipboard.
pub const CLIPBOARD_PROVIDER: &str = "Clipboard";

/// Model name used when a report carries no model.
pub const UNKNOWN_MODEL: &str = "Unknown";

/// Provider tag for log-derived records (`"Log: <filename>"`).
pub fn log_source_label(file_name: &str) -> String {
    format!("Log: {file_name}")
}

/// One observed unit of billable usage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Surrogate identifier
    pub id: Uuid,

    /// Ingestion time (not the time of the underlying request)
    pub timestamp: DateTime<Utc>,

    /// Free-text source tag ("Clipboard", "Log: app.log", "OpenAI", ...)
    pub provider: String,

    /// Model name as captured; trimmed only for the pricing lookup
    pub model_name: String,

    /// Prompt/input tokens
    pub input_tokens: u64,

    /// Completion/output tokens
    pub output_tokens: u64,

    /// Cost in the account currency, fixed once the store prices the record
    #[serde(default)]
    pub cost: Decimal,

    /// Fingerprint of the raw text this record came from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,

    /// Provenance note
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl UsageRecord {
    /// Create an unpriced record stamped with the current time.
    pub fn new(
        provider: impl Into<String>,
        model_name: impl Into<String>,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            provider: provider.into(),
            model_name: model_name.into(),
            input_tokens,
            output_tokens,
            cost: Decimal::ZERO,
            content_hash: None,
            label: None,
        }
    }

    /// Set the content fingerprint.
    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = Some(hash.into());
        self
    }

    /// Set the provenance label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Override the ingestion timestamp.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Input plus output tokens.
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }

    /// True when the record carries no usage at all.
    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0
    }

    /// Cost formatted for display, e.g. `$0.0123` or `$12.50`.
    pub fn formatted_cost(&self, currency: &str) -> String {
        format_cost(self.cost, currency)
    }
}

/// Format a cost: four decimals below one unit, two otherwise.
pub fn format_cost(cost: Decimal, currency: &str) -> String {
    if cost < Decimal::ONE {
        format!("{currency}{:.4}", cost)
    } else {
        format!("{currency}{:.2}", cost)
    }
}

/// Price of a model per million input/output tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingRate {
    /// Model name; lookups compare case-insensitively
    pub model_name: String,

    /// Price per million input tokens
    pub input_price_per_million: Decimal,

    /// Price per million output tokens
    pub output_price_per_million: Decimal,
}

impl PricingRate {
    /// Create a rate from prices per million tokens.
    pub fn new(model_name: impl Into<String>, input: Decimal, output: Decimal) -> Self {
        Self {
            model_name: model_name.into(),
            input_price_per_million: input,
            output_price_per_million: output,
        }
    }

    /// True if this rate is for `name`, ignoring ASCII case.
    pub fn matches(&self, name: &str) -> bool {
        self.model_name.eq_ignore_ascii_case(name)
    }
}

/// Pricing table shipped with a fresh install.
pub fn default_pricing_table() -> Vec<PricingRate> {
    vec![
        PricingRate::new("gpt-4", Decimal::new(3000, 2), Decimal::new(6000, 2)),
        PricingRate::new("gpt-4o", Decimal::new(500, 2), Decimal::new(1500, 2)),
        PricingRate::new("gpt-4o-mini", Decimal::new(15, 2), Decimal::new(60, 2)),
        PricingRate::new("claude-3-haiku", Decimal::new(25, 2), Decimal::new(125, 2)),
        PricingRate::new("gemini-1.5-pro", Decimal::new(350, 2), Decimal::new(1050, 2)),
    ]
}
