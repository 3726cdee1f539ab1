//! User settings stored inside the data document.

use std::path::{Path, PathBuf};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{CostPulseError, Result};
use crate::types::{PricingRate, default_pricing_table};

/// Application settings.
///
/// Unknown or missing fields fall back to their defaults so that older data
/// documents keep loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Daily spending budget in the account currency.
    pub daily_budget: Decimal,

    /// Currency symbol used for display.
    pub currency: String,

    /// Pricing table; replaced wholesale when settings change.
    pub pricing_models: Vec<PricingRate>,

    /// Directories tailed for usage reports.
    pub log_watch_paths: Vec<PathBuf>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            daily_budget: Decimal::new(1000, 2),
            currency: "$".to_string(),
            pricing_models: default_pricing_table(),
            log_watch_paths: Vec::new(),
        }
    }
}

impl AppSettings {
    /// Validate the settings.
    pub fn validate(&self) -> Result<()> {
        if self.daily_budget.is_sign_negative() {
            return Err(CostPulseError::SettingsInvalid {
                message: format!("daily_budget must be >= 0, got {}", self.daily_budget),
            });
        }

        for rate in &self.pricing_models {
            if rate.model_name.trim().is_empty() {
                return Err(CostPulseError::SettingsInvalid {
                    message: "pricing model with empty name".to_string(),
                });
            }
            if rate.input_price_per_million.is_sign_negative()
                || rate.output_price_per_million.is_sign_negative()
            {
                return Err(CostPulseError::SettingsInvalid {
                    message: format!("negative price for model '{}'", rate.model_name),
                });
            }
        }

        Ok(())
    }

    /// Append every default pricing model missing from the table.
    ///
    /// Returns the names that were added.
    pub fn merge_default_pricing(&mut self) -> Vec<String> {
        let mut added = Vec::new();
        for default in default_pricing_table() {
            if !self.pricing_models.iter().any(|p| p.matches(&default.model_name)) {
                info!(model = %default.model_name, "pricing model auto-migrated");
                added.push(default.model_name.clone());
                self.pricing_models.push(default);
            }
        }
        added
    }

    /// Add a watch directory. Returns false if it was already present.
    pub fn add_watch_path(&mut self, path: &Path) -> bool {
        if self.log_watch_paths.iter().any(|p| p == path) {
            return false;
        }
        self.log_watch_paths.push(path.to_path_buf());
        true
    }

    /// Remove a watch directory. Returns false if it was not present.
    pub fn remove_watch_path(&mut self, path: &Path) -> bool {
        let before = self.log_watch_paths.len();
        self.log_watch_paths.retain(|p| p != path);
        self.log_watch_paths.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = AppSettings::default();
        assert_eq!(settings.daily_budget, Decimal::new(10, 0));
        assert_eq!(settings.currency, "$");
        assert_eq!(settings.pricing_models.len(), 5);
        assert!(settings.log_watch_paths.is_empty());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_document_uses_defaults() {
        let settings: AppSettings = serde_json::from_str(r#"{"currency":"€"}"#).unwrap();
        assert_eq!(settings.currency, "€");
        assert_eq!(settings.pricing_models.len(), 5);
    }

    #[test]
    fn test_merge_default_pricing_is_case_insensitive() {
        let mut settings = AppSettings {
            pricing_models: vec![PricingRate::new("GPT-4", Decimal::new(1, 0), Decimal::new(2, 0))],
            ..Default::default()
        };

        let added = settings.merge_default_pricing();

        assert_eq!(added.len(), 4);
        assert!(!added.iter().any(|name| name == "gpt-4"));
        // The user's own gpt-4 price survives.
        let gpt4 = settings.pricing_models.iter().find(|p| p.matches("gpt-4")).unwrap();
        assert_eq!(gpt4.input_price_per_million, Decimal::new(1, 0));

        assert!(settings.merge_default_pricing().is_empty());
    }

    #[test]
    fn test_validate_rejects_negative_prices() {
        let settings = AppSettings {
            pricing_models: vec![PricingRate::new("x", Decimal::new(-1, 0), Decimal::ZERO)],
            ..Default::default()
        };
        let err = settings.validate().unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_watch_path_edits() {
        let mut settings = AppSettings::default();
        assert!(settings.add_watch_path(Path::new("/var/log/app")));
        assert!(!settings.add_watch_path(Path::new("/var/log/app")));
        assert!(settings.remove_watch_path(Path::new("/var/log/app")));
        assert!(!settings.remove_watch_path(Path::new("/var/log/app")));
    }
}
