//! Usage record extraction from free-form text.
//!
//! Supports several JSON usage report shapes:
//! - Flat / OpenAI chat: `prompt_tokens`, `completion_tokens`, `total_tokens`, `model`
//! - Nested: the same fields inside a `usage` object, `model` at the root
//! - Alternate provider (Anthropic style): `usage.input_tokens`, `usage.output_tokens`
//!
//! Shapes are tried in order and a field resolved by an earlier shape is never
//! overwritten by a later one. New shapes go at the end of the list.

use costpulse_core::fingerprint::content_hash;
use costpulse_core::types::{UNKNOWN_MODEL, UsageRecord};
use serde_json::Value;
use tracing::trace;

/// A JSON usage report layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageShape {
    /// Token fields and `model` directly on the root object.
    Flat,
    /// Token fields inside a `usage` child object, `model` on the root.
    NestedUsage,
    /// `input_tokens` / `output_tokens` inside a `usage` child object.
    AlternateProvider,
}

/// Resolution order for every ingestion path.
pub const USAGE_SHAPES: &[UsageShape] = &[
    UsageShape::Flat,
    UsageShape::NestedUsage,
    UsageShape::AlternateProvider,
];

impl UsageShape {
    /// Fill the fields this shape knows about that are still unresolved.
    pub fn apply(&self, root: &Value, fields: &mut TokenFields) {
        match self {
            Self::Flat => {
                fill(&mut fields.prompt_tokens, token_field(root, "prompt_tokens"));
                fill(&mut fields.completion_tokens, token_field(root, "completion_tokens"));
                fill(&mut fields.total_tokens, token_field(root, "total_tokens"));
                fill(&mut fields.model, model_field(root));
            }
            Self::NestedUsage => {
                let Some(usage) = root.get("usage") else {
                    return;
                };
                fill(&mut fields.prompt_tokens, token_field(usage, "prompt_tokens"));
                fill(&mut fields.completion_tokens, token_field(usage, "completion_tokens"));
                fill(&mut fields.total_tokens, token_field(usage, "total_tokens"));
                fill(&mut fields.model, model_field(root));
            }
            Self::AlternateProvider => {
                let Some(usage) = root.get("usage") else {
                    return;
                };
                fill(&mut fields.prompt_tokens, token_field(usage, "input_tokens"));
                fill(&mut fields.completion_tokens, token_field(usage, "output_tokens"));
            }
        }
    }
}

/// Token counts and model name gathered from a usage report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenFields {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    pub model: Option<String>,
}

impl TokenFields {
    /// Run every shape in `shapes` against `root`, in order.
    pub fn resolve(root: &Value, shapes: &[UsageShape]) -> Self {
        let mut fields = Self::default();
        for shape in shapes {
            shape.apply(root, &mut fields);
        }
        fields
    }

    /// Final `(input, output, total)` counts with defaults applied.
    ///
    /// Missing prompt counts as 0. Missing output is derived from the total
    /// when one is known, otherwise 0. Missing total is prompt + output.
    pub fn counts(&self) -> (u64, u64, u64) {
        let input = self.prompt_tokens.unwrap_or(0);
        let output = match (self.completion_tokens, self.total_tokens) {
            (Some(output), _) => output,
            (None, Some(total)) => total.saturating_sub(input),
            (None, None) => 0,
        };
        let total = self
            .total_tokens
            .unwrap_or_else(|| input.saturating_add(output));
        (input, output, total)
    }

    /// Model name, or [`UNKNOWN_MODEL`] when absent or blank.
    pub fn model_or_unknown(&self) -> String {
        self.model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(UNKNOWN_MODEL)
            .to_string()
    }
}

fn fill<T>(slot: &mut Option<T>, value: Option<T>) {
    if slot.is_none() {
        *slot = value;
    }
}

fn token_field(value: &Value, key: &str) -> Option<u64> {
    value.get(key).and_then(Value::as_u64)
}

fn model_field(root: &Value) -> Option<String> {
    root.get("model").and_then(Value::as_str).map(str::to_string)
}

/// Extract a usage record from a log line.
///
/// Returns `None` for anything that is not a usage report: blank lines, lines
/// without the word "tokens", text without a `{...}` span, invalid JSON, JSON
/// without token fields, and zero-usage reports. Never panics.
///
/// The content hash covers only the JSON span, so the same report logged with
/// different prefixes (timestamps, levels) dedups to one record.
pub fn extract_usage(raw_text: &str, source_label: &str) -> Option<UsageRecord> {
    if raw_text.trim().is_empty() {
        return None;
    }

    if !raw_text.to_ascii_lowercase().contains("tokens") {
        return None;
    }

    let candidate = json_candidate(raw_text)?;

    let root: Value = match serde_json::from_str(candidate) {
        Ok(value) => value,
        Err(e) => {
            trace!(source = source_label, error = %e, "usage candidate is not valid JSON");
            return None;
        }
    };

    let fields = TokenFields::resolve(&root, USAGE_SHAPES);
    if fields.prompt_tokens.is_none()
        && fields.total_tokens.is_none()
        && fields.completion_tokens.is_none()
    {
        trace!(source = source_label, "JSON carries no token counts");
        return None;
    }

    let (input, output, total) = fields.counts();
    if total == 0 || (input == 0 && output == 0) {
        trace!(source = source_label, "zero-usage report discarded");
        return None;
    }

    Some(
        UsageRecord::new(source_label, fields.model_or_unknown(), input, output)
            .with_hash(content_hash(candidate))
            .with_label(source_label),
    )
}

/// The substring from the first `{` to the last `}`, if any.
pub fn json_candidate(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if start < end {
        Some(&text[start..=end])
    } else {
        None
    }
}
