// Contracts for the inputs the engine consumes but does not compute:
// regime classification, grid bounds and capital allocation

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use tracing::warn;

use crate::config::InstanceConfig;
use crate::core::constraints::{AllocationConstraints, DEFAULT_CATEGORY};
use crate::error::{TradingError, TradingResult};
use crate::types::{Regime, RegimeSignal};

/// Source of `(regime, probability, duration)` readings
pub trait RegimeSource: Send + Sync {
    fn current(&self) -> TradingResult<Option<RegimeSignal>>;
}

/// Regime written by an external classifier as JSON:
/// `{"regime": "BULL", "probability": 0.82, "duration_days": 3.5}`
pub struct RegimeFile {
    path: PathBuf,
}

#[derive(Deserialize)]
struct RegimeRecord {
    regime: Regime,
    probability: f64,
    #[serde(default)]
    duration_days: f64,
}

impl RegimeFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RegimeSource for RegimeFile {
    fn current(&self) -> TradingResult<Option<RegimeSignal>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(TradingError::FileRead(format!("{}: {}", self.path.display(), e))),
        };

        let record: RegimeRecord = serde_json::from_str(&content)
            .map_err(|e| TradingError::Internal(format!("regime file {}: {}", self.path.display(), e)))?;
        if !(0.0..=1.0).contains(&record.probability) {
            warn!("⚠️  Ignoring regime reading with probability {}", record.probability);
            return Ok(None);
        }
        Ok(Some(RegimeSignal::new(record.regime, record.probability, record.duration_days)))
    }
}

/// Grid bounds for a symbol around the current price
pub trait RangeCalculator: Send + Sync {
    fn bounds(&self, symbol: &str, current_price: f64) -> (f64, f64);
}

/// Fixed percentage band: `price * (1 ± pct/100)`
pub struct PercentRange {
    pct: f64,
}

impl PercentRange {
    pub fn new(pct: f64) -> Self {
        Self { pct }
    }
}

impl RangeCalculator for PercentRange {
    fn bounds(&self, _symbol: &str, current_price: f64) -> (f64, f64) {
        let half = current_price * self.pct / 100.0;
        (current_price - half, current_price + half)
    }
}

/// Target USD allocation per symbol of one instance
pub trait CapitalAllocator: Send + Sync {
    fn allocate(&self, instance: &InstanceConfig, capital: f64, constraints: &AllocationConstraints) -> BTreeMap<String, f64>;
}

/// Splits deployable capital by configured weights (equal when absent),
/// then caps each symbol at the active per-coin limit.
pub struct WeightedAllocator;

impl CapitalAllocator for WeightedAllocator {
    fn allocate(&self, instance: &InstanceConfig, capital: f64, constraints: &AllocationConstraints) -> BTreeMap<String, f64> {
        let deployable = capital * (1.0 - constraints.min_cash_reserve_pct / 100.0);
        let weight = |symbol: &String| instance.weights.get(symbol).copied().unwrap_or(1.0);
        let total_weight: f64 = instance.symbols.iter().map(weight).sum();

        instance
            .symbols
            .iter()
            .map(|symbol| {
                let share = if total_weight > 0.0 { weight(symbol) / total_weight } else { 0.0 };
                let category = instance.categories.get(symbol).map(String::as_str).unwrap_or(DEFAULT_CATEGORY);
                let cap = constraints.max_usd_for_coin(capital, category);
                (symbol.clone(), (deployable * share).min(cap))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn instance(symbols: &[&str]) -> InstanceConfig {
        InstanceConfig {
            id: "t".to_string(),
            capital: 1000.0,
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            weights: BTreeMap::new(),
            categories: BTreeMap::new(),
            bypass_drawdown_check: false,
            grid_count: None,
            range_pct: None,
        }
    }

    #[test]
    fn test_percent_range() {
        let (lower, upper) = PercentRange::new(5.0).bounds("XBTUSD", 100_000.0);
        assert!((lower - 95_000.0).abs() < 1e-6);
        assert!((upper - 105_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_weighted_allocation_respects_caps() {
        let small = AllocationConstraints::small_portfolio();
        let mut config = instance(&["XBTUSD", "ETHUSD"]);
        let even = WeightedAllocator.allocate(&config, 1000.0, &small);
        // Uncategorized symbols get the MID_CAP limit of 30%
        assert!((even["XBTUSD"] - 300.0).abs() < 1e-9);
        assert!((even["ETHUSD"] - 300.0).abs() < 1e-9);

        config.categories.insert("XBTUSD".to_string(), "LARGE_CAP".to_string());
        config.weights.insert("XBTUSD".to_string(), 3.0);
        config.weights.insert("ETHUSD".to_string(), 1.0);
        let skewed = WeightedAllocator.allocate(&config, 1000.0, &small);
        // 850 * 0.75 = 637.5, capped at 40%
        assert!((skewed["XBTUSD"] - 400.0).abs() < 1e-9);
        assert!((skewed["ETHUSD"] - 212.5).abs() < 1e-9);
    }

    #[test]
    fn test_regime_file() {
        let dir = TempDir::new().unwrap();
        let source = RegimeFile::new(dir.path().join("regime.json"));
        assert!(source.current().unwrap().is_none());

        fs::write(dir.path().join("regime.json"), r#"{"regime":"BEAR","probability":0.9,"duration_days":0}"#).unwrap();
        let signal = source.current().unwrap().unwrap();
        assert_eq!(signal.regime, Regime::Bear);
        assert!((signal.probability - 0.9).abs() < 1e-12);
    }
}
