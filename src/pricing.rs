use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Published API rates for one model, USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelRates {
    pub input: f64,
    pub output: f64,
    pub cache_write: f64,
    pub cache_read: f64,
}

impl ModelRates {
    pub const fn new(input: f64, output: f64, cache_write: f64, cache_read: f64) -> Self {
        Self {
            input,
            output,
            cache_write,
            cache_read,
        }
    }

    /// What the cache traffic alone costs at these rates.
    pub fn cache_cost(&self, cache_read_tokens: u64, cache_write_tokens: u64) -> f64 {
        (cache_read_tokens as f64 * self.cache_read + cache_write_tokens as f64 * self.cache_write)
            / 1_000_000.0
    }

    pub fn cost(&self, input: u64, output: u64, cache_read: u64, cache_write: u64) -> f64 {
        (input as f64 * self.input + output as f64 * self.output) / 1_000_000.0
            + self.cache_cost(cache_read, cache_write)
    }
}

/// Pluggable rate table. The rates are versioned outside this crate, so the
/// audit only ever asks through this trait.
pub trait PricingLookup: Send + Sync {
    fn rates(&self, model: &str) -> Option<ModelRates>;
}

/// In-process rate table keyed by normalized model id.
///
/// Lookup tries the exact id first, then the longest registered prefix, so
/// `claude-sonnet-4-5-20250929` resolves through `claude-sonnet-4-5`.
#[derive(Debug, Clone, Default)]
pub struct StaticPricing {
    table: HashMap<String, ModelRates>,
}

impl StaticPricing {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_rate(mut self, model: impl Into<String>, rates: ModelRates) -> Self {
        self.table.insert(model.into(), rates);
        self
    }

    pub fn insert(&mut self, model: impl Into<String>, rates: ModelRates) {
        self.table.insert(model.into(), rates);
    }

    /// Current Claude list prices.
    pub fn claude_defaults() -> Self {
        Self::empty()
            .with_rate("claude-opus-4-5", ModelRates::new(5.0, 25.0, 6.25, 0.50))
            .with_rate("claude-opus-4-1", ModelRates::new(15.0, 75.0, 18.75, 1.50))
            .with_rate("claude-opus-4", ModelRates::new(15.0, 75.0, 18.75, 1.50))
            .with_rate("claude-sonnet-4-5", ModelRates::new(3.0, 15.0, 3.75, 0.30))
            .with_rate("claude-sonnet-4", ModelRates::new(3.0, 15.0, 3.75, 0.30))
            .with_rate("claude-3-7-sonnet", ModelRates::new(3.0, 15.0, 3.75, 0.30))
            .with_rate("claude-3-5-sonnet", ModelRates::new(3.0, 15.0, 3.75, 0.30))
            .with_rate("claude-haiku-4-5", ModelRates::new(1.0, 5.0, 1.25, 0.10))
            .with_rate("claude-3-5-haiku", ModelRates::new(0.80, 4.0, 1.0, 0.08))
    }
}

impl PricingLookup for StaticPricing {
    fn rates(&self, model: &str) -> Option<ModelRates> {
        let model = normalize_model_id(model);
        if let Some(rates) = self.table.get(&model) {
            return Some(*rates);
        }
        self.table
            .iter()
            .filter(|(key, _)| model.starts_with(key.as_str()))
            .max_by_key(|(key, _)| key.len())
            .map(|(_, rates)| *rates)
    }
}

/// Lowercase and drop a trailing `-YYYYMMDD` release suffix so local and
/// external model ids compare equal.
pub fn normalize_model_id(model: &str) -> String {
    let model = model.trim().to_ascii_lowercase();
    if let Some((head, tail)) = model.rsplit_once('-') {
        if tail.len() == 8 && tail.bytes().all(|b| b.is_ascii_digit()) && !head.is_empty() {
            return head.to_string();
        }
    }
    model
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_model_id() {
        assert_eq!(normalize_model_id("claude-opus-4-5-20251101"), "claude-opus-4-5");
        assert_eq!(normalize_model_id("Claude-Sonnet-4-5"), "claude-sonnet-4-5");
        assert_eq!(normalize_model_id("unknown"), "unknown");
    }

    #[test]
    fn test_prefix_lookup_prefers_longest() {
        let pricing = StaticPricing::claude_defaults();
        let rates = pricing.rates("claude-opus-4-5-20251101").unwrap();
        assert_eq!(rates.input, 5.0);
        let rates = pricing.rates("claude-opus-4-1-20250805").unwrap();
        assert_eq!(rates.input, 15.0);
        assert!(pricing.rates("gpt-4o").is_none());
    }

    #[test]
    fn test_cache_cost() {
        let rates = ModelRates::new(3.0, 15.0, 3.75, 0.30);
        let cost = rates.cache_cost(1_000_000, 1_000_000);
        assert!((cost - 4.05).abs() < 1e-9);
    }
}
