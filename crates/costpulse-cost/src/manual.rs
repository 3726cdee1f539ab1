//! Manually entered usage.

use costpulse_core::error::{CostPulseError, Result};
use costpulse_core::types::UsageRecord;

/// Usage typed in by the user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManualEntry {
    /// Provider; inferred from the model name when empty
    pub provider: Option<String>,
    pub model_name: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub label: Option<String>,
}

impl ManualEntry {
    pub fn new(model_name: impl Into<String>, input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            model_name: model_name.into(),
            input_tokens,
            output_tokens,
            ..Default::default()
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Check the entry and turn it into an unpriced record.
    pub fn into_record(self) -> Result<UsageRecord> {
        let model = self.model_name.trim();
        if model.is_empty() {
            return Err(CostPulseError::invalid_entry("model name is required"));
        }
        if self.input_tokens == 0 && self.output_tokens == 0 {
            return Err(CostPulseError::invalid_entry(
                "at least one of input or output tokens must be non-zero",
            ));
        }

        let provider = self
            .provider
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| infer_provider(model).to_string());

        let record = UsageRecord::new(provider, model, self.input_tokens, self.output_tokens);
        Ok(match self.label {
            Some(label) if !label.trim().is_empty() => record.with_label(label),
            _ => record,
        })
    }
}

/// Guess the provider from a model name.
pub fn infer_provider(model_name: &str) -> &'static str {
    let lower = model_name.to_ascii_lowercase();
    if lower.contains("gpt") {
        "OpenAI"
    } else if lower.contains("claude") {
        "Anthropic"
    } else if lower.contains("gemini") {
        "Google"
    } else {
        "Unknown"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_provider() {
        assert_eq!(infer_provider("gpt-4o"), "OpenAI");
        assert_eq!(infer_provider("Claude-3-Haiku"), "Anthropic");
        assert_eq!(infer_provider("gemini-1.5-pro"), "Google");
        assert_eq!(infer_provider("llama-3"), "Unknown");
    }

    #[test]
    fn test_into_record() {
        let record = ManualEntry::new("  claude-3-haiku ", 100, 50)
            .with_label("batch job")
            .into_record()
            .unwrap();
        assert_eq!(record.provider, "Anthropic");
        assert_eq!(record.model_name, "claude-3-haiku");
        assert_eq!(record.label.as_deref(), Some("batch job"));
        assert!(record.content_hash.is_none());
    }

    #[test]
    fn test_explicit_provider_wins() {
        let record = ManualEntry::new("gpt-4", 1, 1)
            .with_provider("Azure")
            .into_record()
            .unwrap();
        assert_eq!(record.provider, "Azure");
    }

    #[test]
    fn test_rejects_empty_entries() {
        assert!(ManualEntry::new("", 1, 1).into_record().is_err());
        assert!(ManualEntry::new("gpt-4", 0, 0).into_record().is_err());
    }
}
