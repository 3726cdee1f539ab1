//! Model pricing lookup and cost computation.
//!
//! The resolver holds an immutable pricing table behind an `Arc`. Lookups
//! clone the `Arc` and work on that snapshot, so a concurrent
//! [`PricingResolver::update_table`] never exposes a half-replaced table.

use std::sync::{Arc, PoisonError, RwLock};

use costpulse_core::types::PricingRate;
use rust_decimal::Decimal;
use tracing::{debug, info};

/// Fuzzy prefixes checked after an exact miss, most specific first.
const FAMILY_PREFIXES: &[&str] = &["gpt-4o", "gpt-4"];

const TOKENS_PER_UNIT: u64 = 1_000_000;

/// An immutable pricing table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PricingTable {
    rates: Vec<PricingRate>,
}

impl PricingTable {
    pub fn new(rates: Vec<PricingRate>) -> Self {
        Self { rates }
    }

    pub fn rates(&self) -> &[PricingRate] {
        &self.rates
    }

    /// Find the rate for `model_name`.
    ///
    /// The name is trimmed, then matched exactly ignoring case. On a miss, a
    /// lowercased name starting with `gpt-4o` resolves to the `gpt-4o` entry
    /// and one starting with `gpt-4` to the `gpt-4` entry.
    pub fn resolve(&self, model_name: &str) -> Option<&PricingRate> {
        let name = model_name.trim();
        if name.is_empty() {
            return None;
        }

        if let Some(rate) = self.rates.iter().find(|r| r.matches(name)) {
            return Some(rate);
        }

        let lower = name.to_ascii_lowercase();
        let family = FAMILY_PREFIXES
            .iter()
            .find(|prefix| lower.starts_with(*prefix))?;
        let rate = self.rates.iter().find(|r| r.matches(family));
        if rate.is_some() {
            debug!(model = name, family, "priced by model family");
        }
        rate
    }
}

/// Thread-safe pricing resolver with hot-swappable tables.
#[derive(Debug, Default)]
pub struct PricingResolver {
    table: RwLock<Arc<PricingTable>>,
}

impl PricingResolver {
    pub fn new(rates: Vec<PricingRate>) -> Self {
        Self {
            table: RwLock::new(Arc::new(PricingTable::new(rates))),
        }
    }

    /// The table currently in effect.
    pub fn snapshot(&self) -> Arc<PricingTable> {
        let guard = self.table.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    /// Replace the whole table. Lookups already in flight finish on the old one.
    pub fn update_table(&self, rates: Vec<PricingRate>) {
        let count = rates.len();
        let next = Arc::new(PricingTable::new(rates));
        let mut guard = self.table.write().unwrap_or_else(PoisonError::into_inner);
        *guard = next;
        info!(models = count, "pricing table updated");
    }

    /// Find the rate for `model_name`. See [`PricingTable::resolve`].
    pub fn resolve(&self, model_name: &str) -> Option<PricingRate> {
        self.snapshot().resolve(model_name).cloned()
    }

    /// Cost of a request at `rate`; zero when no rate is known.
    pub fn cost(input_tokens: u64, output_tokens: u64, rate: Option<&PricingRate>) -> Decimal {
        let Some(rate) = rate else {
            return Decimal::ZERO;
        };
        let per_unit = Decimal::from(TOKENS_PER_UNIT);
        Decimal::from(input_tokens) / per_unit * rate.input_price_per_million
            + Decimal::from(output_tokens) / per_unit * rate.output_price_per_million
    }

    /// Resolve and price in one step against a single snapshot.
    pub fn price(&self, model_name: &str, input_tokens: u64, output_tokens: u64) -> Decimal {
        let table = self.snapshot();
        let rate = table.resolve(model_name);
        if rate.is_none() {
            debug!(model = model_name, "no pricing for model, cost is zero");
        }
        Self::cost(input_tokens, output_tokens, rate)
    }
}
