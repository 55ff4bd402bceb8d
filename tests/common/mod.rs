// Common test utilities and helpers

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use hybrid_grid_bot::core::grid_engine::GridSpec;
use hybrid_grid_bot::core::instance::InstanceDeps;
use hybrid_grid_bot::core::risk_guard::{OrderIntent, PreTradeCheck, RiskVerdict};
use hybrid_grid_bot::{
    AlertLog, Config, InstanceConfig, PaperExchange, PercentRange, RegimeSignal, RegimeSource, TradingResult,
    WeightedAllocator,
};

pub const FEE_RATE: f64 = 0.001;

/// Fixed instant so schedules in tests are reproducible
pub fn t0() -> DateTime<Utc> {
    "2026-03-02T12:00:00Z".parse().expect("valid timestamp")
}

/// Paper account with 10k USD and the given markets, quoted in USD
pub fn paper_exchange(markets: &[(&str, f64)]) -> Arc<PaperExchange> {
    let paper = PaperExchange::new("USD", 10_000.0, FEE_RATE);
    for (symbol, price) in markets {
        let base = symbol.trim_end_matches("USD");
        paper.add_symbol(PaperExchange::default_symbol(symbol, base, "USD"), *price);
    }
    Arc::new(paper)
}

pub fn grid_spec(symbol: &str, capital: f64, grid_count: usize, lower: f64, upper: f64) -> GridSpec {
    GridSpec {
        symbol: symbol.to_string(),
        capital,
        grid_count,
        lower_bound: lower,
        upper_bound: upper,
    }
}

/// Risk check that lets every order through
pub struct AllowAll;

impl PreTradeCheck for AllowAll {
    fn check(&mut self, _intent: &OrderIntent) -> RiskVerdict {
        RiskVerdict::Allow
    }
}

/// Rejects every BUY, lets SELLs through
pub struct RejectBuys;

impl PreTradeCheck for RejectBuys {
    fn check(&mut self, intent: &OrderIntent) -> RiskVerdict {
        match intent.side {
            hybrid_grid_bot::Side::Buy => RiskVerdict::Reject("buys disabled".to_string()),
            hybrid_grid_bot::Side::Sell => RiskVerdict::Allow,
        }
    }
}

/// Instance config; XBTUSD and ETHUSD are filed as LARGE_CAP like the defaults
pub fn instance_config(id: &str, capital: f64, symbols: &[&str]) -> InstanceConfig {
    InstanceConfig {
        id: id.to_string(),
        capital,
        symbols: symbols.iter().map(|s| s.to_string()).collect(),
        weights: BTreeMap::new(),
        categories: symbols
            .iter()
            .filter(|s| matches!(**s, "XBTUSD" | "ETHUSD"))
            .map(|s| (s.to_string(), "LARGE_CAP".to_string()))
            .collect(),
        bypass_drawdown_check: true,
        grid_count: None,
        range_pct: None,
    }
}

/// Default settings with the given instances and state kept under `state_dir`
pub fn test_config(state_dir: &Path, instances: Vec<InstanceConfig>) -> Config {
    let mut config = Config::default();
    config.instances = instances;
    config.orchestrator.state_dir = state_dir.display().to_string();
    config.orchestrator.regime_file = state_dir.join("regime.json").display().to_string();
    config.grid.taker_fee_rate = FEE_RATE;
    config.exchange.fee_rate = FEE_RATE;
    config
}

pub fn deps(exchange: Arc<PaperExchange>, alerts: Arc<AlertLog>) -> InstanceDeps {
    InstanceDeps {
        exchange,
        notifier: alerts,
        ranges: Arc::new(PercentRange::new(5.0)),
        allocator: Arc::new(WeightedAllocator),
    }
}

/// Regime source the test can change between evaluations
#[derive(Default)]
pub struct ScriptedRegime {
    signal: Mutex<Option<RegimeSignal>>,
}

impl ScriptedRegime {
    pub fn set(&self, signal: Option<RegimeSignal>) {
        if let Ok(mut current) = self.signal.lock() {
            *current = signal;
        }
    }
}

impl RegimeSource for ScriptedRegime {
    fn current(&self) -> TradingResult<Option<RegimeSignal>> {
        Ok(self.signal.lock().map(|s| *s).unwrap_or(None))
    }
}

pub fn approx_eq(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}
