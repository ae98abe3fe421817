//! Token pricing and cost arithmetic.
//!
//! All money is carried as integer micro-USD (`CostMicros`); 1 µUSD is the
//! smallest representable unit. Per-part costs round half-up, and a strictly
//! positive true cost never rounds down to zero (it floors to 1 µUSD instead),
//! so the spend ledger cannot silently lose tiny charges.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

pub const MICROS_PER_USD: u64 = 1_000_000;
const TOKENS_PER_MTOK: u128 = 1_000_000;

/// USD amount in integer micro-dollars.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct CostMicros(pub u64);

impl CostMicros {
    pub const ZERO: CostMicros = CostMicros(0);

    /// Convert a (config-supplied) USD amount, rounding half-up to µUSD.
    pub fn from_usd(usd: f64) -> Self {
        if usd <= 0.0 {
            return CostMicros(0);
        }
        CostMicros((usd * MICROS_PER_USD as f64).round() as u64)
    }

    pub fn as_usd(self) -> f64 {
        self.0 as f64 / MICROS_PER_USD as f64
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn saturating_sub(self, other: CostMicros) -> CostMicros {
        CostMicros(self.0.saturating_sub(other.0))
    }
}

impl Add for CostMicros {
    type Output = CostMicros;

    fn add(self, rhs: CostMicros) -> CostMicros {
        CostMicros(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for CostMicros {
    fn add_assign(&mut self, rhs: CostMicros) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl fmt::Display for CostMicros {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${:.6}", self.as_usd())
    }
}

/// One pricing-table entry; any field may be absent and fall through the
/// resolution chain below. Prices are USD per million tokens.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelRates {
    pub input_price: Option<f64>,
    pub output_price: Option<f64>,
    pub index_price: Option<f64>,
}

impl ModelRates {
    pub fn new(input: Option<f64>, output: Option<f64>, index: Option<f64>) -> Self {
        Self {
            input_price: input,
            output_price: output,
            index_price: index,
        }
    }
}

/// Whether each global price field was explicitly overridden at load time
/// (env var present, or its `_FILE` sibling present).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PriceOverrides {
    pub input: bool,
    pub output: bool,
    pub index: bool,
}

/// The three global fallback prices from settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GlobalPrices {
    pub input: f64,
    pub output: f64,
    pub index: f64,
}

/// Fully resolved USD-per-MTok rates for one model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedRates {
    pub input: f64,
    pub output: f64,
    pub index: f64,
}

/// Resolve per-model pricing: exact key, then the longest registered prefix
/// key (excluding the literal `default`), then the `default` entry. Each field
/// is then filled independently: a value on the matched entry wins; an absent
/// value falls back to the global setting when that field was explicitly
/// overridden, otherwise to the `default` entry, otherwise to the setting.
pub fn resolve_model_rates(
    table: &BTreeMap<String, ModelRates>,
    model: &str,
    overrides: PriceOverrides,
    global: GlobalPrices,
) -> ResolvedRates {
    let default_entry = table.get("default");

    let matched = table.get(model).or_else(|| {
        table
            .iter()
            .filter(|(key, _)| key.as_str() != "default" && model.starts_with(key.as_str()))
            .max_by_key(|(key, _)| key.len())
            .map(|(_, rates)| rates)
    });
    let matched = matched.or(default_entry);

    let field = |entry: fn(&ModelRates) -> Option<f64>, overridden: bool, setting: f64| -> f64 {
        if let Some(value) = matched.and_then(entry) {
            return value;
        }
        if overridden {
            return setting;
        }
        default_entry.and_then(entry).unwrap_or(setting)
    };

    ResolvedRates {
        input: field(|r| r.input_price, overrides.input, global.input),
        output: field(|r| r.output_price, overrides.output, global.output),
        index: field(|r| r.index_price, overrides.index, global.index),
    }
}

/// `tokens / 1e6 × price`, rounded half-up to µUSD, floored to 1 µUSD when the
/// true cost is strictly positive.
fn cost_for(tokens: u64, price_per_mtok_usd: f64) -> CostMicros {
    let price_micros = CostMicros::from_usd(price_per_mtok_usd).0 as u128;
    let numer = tokens as u128 * price_micros;
    if numer == 0 {
        return CostMicros::ZERO;
    }
    let rounded = (numer + TOKENS_PER_MTOK / 2) / TOKENS_PER_MTOK;
    CostMicros(rounded.max(1) as u64)
}

/// Cost of one chat turn: prompt and completion parts rounded independently;
/// the total is the sum of the two rounded parts, not a single rounding of the
/// exact sum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryCost {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub prompt_cost: CostMicros,
    pub completion_cost: CostMicros,
}

impl QueryCost {
    pub fn total(&self) -> CostMicros {
        self.prompt_cost + self.completion_cost
    }
}

pub fn calc_query_cost(rates: ResolvedRates, prompt_tokens: u64, completion_tokens: u64) -> QueryCost {
    QueryCost {
        prompt_tokens,
        completion_tokens,
        prompt_cost: cost_for(prompt_tokens, rates.input),
        completion_cost: cost_for(completion_tokens, rates.output),
    }
}

pub fn calc_index_cost(rates: ResolvedRates, tokens: u64) -> CostMicros {
    cost_for(tokens, rates.index)
}

/// Estimate tokens with light modality awareness. Images tokenize under a flat
/// ceiling; compressed speech runs roughly 10k tokens per MiB; everything else
/// uses the coarse 4-bytes-per-token text heuristic.
pub fn estimate_tokens_from_bytes(n_bytes: u64, mime_type: Option<&str>) -> u64 {
    if n_bytes == 0 {
        return 0;
    }
    if let Some(mime) = mime_type {
        let mime = mime.to_ascii_lowercase();
        if mime.starts_with("image/") {
            return 1200;
        }
        if mime.starts_with("audio/") {
            let per_mib = (n_bytes as f64 / (1024.0 * 1024.0)) * 10_000.0;
            return (per_mib as u64).max(1000);
        }
    }
    n_bytes / 4
}

/// Crude token estimate used for budgeting when the upstream SDK does not
/// provide usage metadata mid-stream. Deliberately coarse: it may under- or
/// over-count for non-ASCII or emoji-heavy content.
pub fn estimate_tokens_from_text(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    (text.len() as u64 / 4).max(1)
}

/// True when the default-model rates all resolve to positive prices; chat
/// requests are refused outright otherwise.
pub fn pricing_configured(
    table: &BTreeMap<String, ModelRates>,
    default_model: &str,
    overrides: PriceOverrides,
    global: GlobalPrices,
) -> bool {
    let rates = resolve_model_rates(table, default_model, overrides, global);
    rates.input > 0.0 && rates.output > 0.0 && rates.index > 0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> BTreeMap<String, ModelRates> {
        crate::config::default_model_pricing()
    }

    fn global() -> GlobalPrices {
        GlobalPrices {
            input: 0.30,
            output: 2.50,
            index: 0.0015,
        }
    }

    #[test]
    fn exact_match_wins() {
        let rates = resolve_model_rates(&table(), "gemini-2.5-pro", PriceOverrides::default(), global());
        assert_eq!(rates.input, 1.25);
        assert_eq!(rates.output, 10.0);
    }

    #[test]
    fn prefix_match_resolves_versioned_models() {
        // "gemini-2.5-pro-002" is absent; it must resolve through the
        // "gemini-2.5-pro" prefix entry, not "default".
        let rates = resolve_model_rates(
            &table(),
            "gemini-2.5-pro-002",
            PriceOverrides::default(),
            global(),
        );
        assert_eq!(rates.input, 1.25);
        assert_eq!(rates.output, 10.0);
    }

    #[test]
    fn longest_prefix_beats_shorter_prefix() {
        let mut table = BTreeMap::new();
        table.insert("gem".to_string(), ModelRates::new(Some(9.0), Some(9.0), None));
        table.insert(
            "gemini-2.5".to_string(),
            ModelRates::new(Some(1.0), Some(2.0), None),
        );
        table.insert(
            "default".to_string(),
            ModelRates::new(Some(0.5), Some(0.5), Some(0.001)),
        );
        let rates =
            resolve_model_rates(&table, "gemini-2.5-ultra", PriceOverrides::default(), global());
        assert_eq!(rates.input, 1.0);
        assert_eq!(rates.output, 2.0);
    }

    #[test]
    fn unknown_model_falls_back_to_default_entry() {
        let rates =
            resolve_model_rates(&table(), "claude-sonnet", PriceOverrides::default(), global());
        assert_eq!(rates.input, 0.30);
        assert_eq!(rates.output, 2.50);
    }

    #[test]
    fn absent_field_prefers_default_entry_without_override() {
        let mut table = BTreeMap::new();
        table.insert(
            "gemini-x".to_string(),
            ModelRates::new(Some(1.0), None, None),
        );
        table.insert(
            "default".to_string(),
            ModelRates::new(Some(0.5), Some(4.0), Some(0.002)),
        );
        let rates = resolve_model_rates(&table, "gemini-x", PriceOverrides::default(), global());
        assert_eq!(rates.input, 1.0);
        assert_eq!(rates.output, 4.0);
        assert_eq!(rates.index, 0.002);
    }

    #[test]
    fn explicit_override_beats_default_entry_for_absent_field() {
        let mut table = BTreeMap::new();
        table.insert(
            "gemini-x".to_string(),
            ModelRates::new(Some(1.0), None, None),
        );
        table.insert(
            "default".to_string(),
            ModelRates::new(Some(0.5), Some(4.0), Some(0.002)),
        );
        let overrides = PriceOverrides {
            output: true,
            ..PriceOverrides::default()
        };
        let rates = resolve_model_rates(&table, "gemini-x", overrides, global());
        // output_price is absent on the matched entry and overridden globally,
        // so the setting wins over the default entry's 4.0.
        assert_eq!(rates.output, 2.50);
        // index_price is absent and not overridden, so the default entry wins.
        assert_eq!(rates.index, 0.002);
    }

    #[test]
    fn override_never_shadows_matched_entry_value() {
        let overrides = PriceOverrides {
            input: true,
            output: true,
            index: true,
        };
        let rates = resolve_model_rates(&table(), "gemini-2.5-pro", overrides, global());
        assert_eq!(rates.input, 1.25);
        assert_eq!(rates.output, 10.0);
    }

    #[test]
    fn half_up_rounding() {
        // 1 token at $0.50/MTok = 0.5 µUSD, which rounds up to 1 µUSD.
        assert_eq!(cost_for(1, 0.5), CostMicros(1));
        // 1 token at $0.40/MTok = 0.4 µUSD, which rounds down but floors to 1.
        assert_eq!(cost_for(1, 0.4), CostMicros(1));
        assert_eq!(cost_for(0, 10.0), CostMicros::ZERO);
        assert_eq!(cost_for(1000, 0.0), CostMicros::ZERO);
    }

    #[test]
    fn positive_cost_never_rounds_to_zero() {
        // 250 tokens at the $0.0015/MTok index price is 0.375 µUSD; the floor
        // keeps it at 1 µUSD rather than losing it.
        let rates = resolve_model_rates(&table(), "INDEX", PriceOverrides::default(), global());
        let cost = calc_index_cost(rates, 250);
        assert_eq!(cost, CostMicros(1));
    }

    #[test]
    fn total_is_sum_of_rounded_parts() {
        let rates = ResolvedRates {
            input: 0.5,
            output: 0.5,
            index: 0.0,
        };
        let cost = calc_query_cost(rates, 1, 1);
        // Each part rounds 0.5 µUSD up to 1; the total is 2, not round(1.0).
        assert_eq!(cost.prompt_cost, CostMicros(1));
        assert_eq!(cost.completion_cost, CostMicros(1));
        assert_eq!(cost.total(), CostMicros(2));
    }

    #[test]
    fn token_estimates() {
        assert_eq!(estimate_tokens_from_bytes(0, None), 0);
        assert_eq!(estimate_tokens_from_bytes(1000, None), 250);
        assert_eq!(estimate_tokens_from_bytes(1000, Some("image/png")), 1200);
        assert_eq!(estimate_tokens_from_bytes(1000, Some("audio/mpeg")), 1000);
        assert_eq!(
            estimate_tokens_from_bytes(10 * 1024 * 1024, Some("audio/mpeg")),
            100_000
        );
        assert_eq!(estimate_tokens_from_text(""), 0);
        assert_eq!(estimate_tokens_from_text("ab"), 1);
        assert_eq!(estimate_tokens_from_text(&"x".repeat(400)), 100);
    }

    #[test]
    fn pricing_configured_requires_positive_rates() {
        assert!(pricing_configured(
            &table(),
            "gemini-2.5-flash",
            PriceOverrides::default(),
            global()
        ));
        let mut broken = BTreeMap::new();
        broken.insert(
            "default".to_string(),
            ModelRates::new(Some(1.0), Some(1.0), Some(0.0)),
        );
        assert!(!pricing_configured(
            &broken,
            "gemini-2.5-flash",
            PriceOverrides::default(),
            global()
        ));
    }
}
