// Pre-trade risk pipeline consulted before every order placement

use std::collections::{BTreeMap, HashMap};
use tracing::{error, warn};

use super::constraints::{AllocationConstraints, DEFAULT_CATEGORY};
use crate::config::RiskConfig;
use crate::types::Side;

/// An order about to be sent to the exchange
#[derive(Debug, Clone, PartialEq)]
pub struct OrderIntent {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub price: f64,
}

impl OrderIntent {
    pub fn new(symbol: &str, side: Side, quantity: f64, price: f64) -> Self {
        Self { symbol: symbol.to_string(), side, quantity, price }
    }

    pub fn value(&self) -> f64 {
        self.quantity * self.price
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RiskVerdict {
    Allow,
    Reject(String),
    /// Circuit breaker: stop the instance, or every instance when catastrophic
    Halt { reason: String, catastrophic: bool },
}

impl RiskVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RiskVerdict::Allow)
    }
}

/// Narrow interface the order engines see
pub trait PreTradeCheck: Send {
    fn check(&mut self, intent: &OrderIntent) -> RiskVerdict;
}

/// Snapshot of the instance figures the checks read. `None` means the
/// source could not be read this tick.
#[derive(Debug, Clone)]
pub struct RiskContext {
    pub total_capital: f64,
    pub equity: Option<f64>,
    pub day_start_equity: Option<f64>,
    pub invested: f64,
    pub symbol_exposure: HashMap<String, f64>,
    pub position_caps: HashMap<String, f64>,
    pub categories: BTreeMap<String, String>,
    pub market_prices: HashMap<String, f64>,
    pub constraints: AllocationConstraints,
}

impl RiskContext {
    pub fn category(&self, symbol: &str) -> &str {
        self.categories.get(symbol).map(String::as_str).unwrap_or(DEFAULT_CATEGORY)
    }
}

enum CheckError {
    Violation(String),
    Unavailable(String),
}

type CheckResult = Result<(), CheckError>;

/// Per-instance guard. Holds only the last observed prices for the
/// circuit breaker; everything else is read from the context per call.
#[derive(Debug, Clone)]
pub struct RiskGuard {
    max_daily_loss_pct: f64,
    circuit_breaker_pct: f64,
    catastrophic_move_pct: f64,
    bypass_drawdown: bool,
    last_prices: HashMap<String, f64>,
    tripped: Option<String>,
    catastrophic: bool,
}

impl RiskGuard {
    pub fn new(config: &RiskConfig, bypass_drawdown: bool) -> Self {
        Self {
            max_daily_loss_pct: config.max_daily_loss_pct,
            circuit_breaker_pct: config.circuit_breaker_pct,
            catastrophic_move_pct: config.catastrophic_move_pct,
            bypass_drawdown,
            last_prices: HashMap::new(),
            tripped: None,
            catastrophic: false,
        }
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.is_some()
    }

    pub fn trip_reason(&self) -> Option<&str> {
        self.tripped.as_deref()
    }

    /// The trip was large enough to stop every instance
    pub fn is_catastrophic(&self) -> bool {
        self.catastrophic
    }

    /// Run the pipeline in order; first failure wins
    pub fn evaluate(&mut self, intent: &OrderIntent, ctx: &RiskContext) -> RiskVerdict {
        if let Some(reason) = &self.tripped {
            return RiskVerdict::Reject(format!("trading halted: {}", reason));
        }

        if !self.bypass_drawdown {
            if let Some(verdict) = self.settle("drawdown", intent, self.check_drawdown(ctx)) {
                return verdict;
            }
        }

        // Sells only reduce exposure
        if intent.side == Side::Buy {
            if let Some(verdict) = self.settle("max_position", intent, self.check_max_position(intent, ctx)) {
                return verdict;
            }
            if let Some(verdict) = self.settle("allocation", intent, self.check_allocation(intent, ctx)) {
                return verdict;
            }
        }

        match ctx.market_prices.get(&intent.symbol) {
            Some(&price) => self.check_price_move(&intent.symbol, price),
            None => {
                warn!(
                    "⚠️  Risk check 'circuit_breaker' unavailable for {} (no market price), allowing order",
                    intent.symbol
                );
                RiskVerdict::Allow
            }
        }
    }

    fn settle(&self, name: &str, intent: &OrderIntent, result: CheckResult) -> Option<RiskVerdict> {
        match result {
            Ok(()) => None,
            Err(CheckError::Violation(reason)) => {
                warn!("🛡️  {} {} {} rejected by {}: {}", intent.side, intent.quantity, intent.symbol, name, reason);
                Some(RiskVerdict::Reject(reason))
            }
            Err(CheckError::Unavailable(reason)) => {
                // Availability over strictness: a broken check never blocks trading
                warn!("⚠️  Risk check '{}' unavailable ({}), allowing {} {}", name, reason, intent.side, intent.symbol);
                None
            }
        }
    }

    fn check_drawdown(&self, ctx: &RiskContext) -> CheckResult {
        let (Some(equity), Some(day_start)) = (ctx.equity, ctx.day_start_equity) else {
            return Err(CheckError::Unavailable("equity not valued".to_string()));
        };
        if day_start <= 0.0 {
            return Err(CheckError::Unavailable("day start equity is zero".to_string()));
        }

        let loss_pct = (day_start - equity) / day_start * 100.0;
        if loss_pct > self.max_daily_loss_pct {
            return Err(CheckError::Violation(format!(
                "daily loss {:.1}% exceeds {:.1}% limit",
                loss_pct, self.max_daily_loss_pct
            )));
        }
        Ok(())
    }

    fn check_max_position(&self, intent: &OrderIntent, ctx: &RiskContext) -> CheckResult {
        let cap = ctx
            .position_caps
            .get(&intent.symbol)
            .copied()
            .ok_or_else(|| CheckError::Unavailable(format!("no position cap for {}", intent.symbol)))?;

        if intent.value() > cap * (1.0 + 1e-9) {
            return Err(CheckError::Violation(format!(
                "order value ${:.2} exceeds position cap ${:.2}",
                intent.value(),
                cap
            )));
        }
        Ok(())
    }

    fn check_allocation(&self, intent: &OrderIntent, ctx: &RiskContext) -> CheckResult {
        let value = intent.value();
        let constraints = &ctx.constraints;

        let available = constraints.available_capital(ctx.total_capital, ctx.invested);
        if value > available + 1e-9 {
            return Err(CheckError::Violation(format!(
                "order value ${:.2} exceeds available capital ${:.2} ({} reserve {:.0}%)",
                value, available, constraints.name, constraints.min_cash_reserve_pct
            )));
        }

        let category = ctx.category(&intent.symbol);
        let exposure = ctx.symbol_exposure.get(&intent.symbol).copied().unwrap_or(0.0);

        // Adding to a held symbol never opens a new position
        if exposure <= 0.0 {
            let open_positions = ctx.symbol_exposure.values().filter(|v| **v > 0.0).count();
            if open_positions >= constraints.max_open_positions {
                return Err(CheckError::Violation(format!(
                    "{} open positions already at {} limit of {}",
                    open_positions, constraints.name, constraints.max_open_positions
                )));
            }
        }

        let coin_cap = constraints.max_usd_for_coin(ctx.total_capital, category);
        if exposure + value > coin_cap + 1e-9 {
            return Err(CheckError::Violation(format!(
                "{} exposure ${:.2} would exceed {:.1}% cap ${:.2}",
                intent.symbol,
                exposure + value,
                constraints.max_pct_for_coin(category),
                coin_cap
            )));
        }

        let category_exposure: f64 = ctx
            .symbol_exposure
            .iter()
            .filter(|(symbol, _)| ctx.category(symbol) == category)
            .map(|(_, v)| *v)
            .sum();
        let category_cap = ctx.total_capital * constraints.category_cap_pct(category) / 100.0;
        if category_exposure + value > category_cap + 1e-9 {
            return Err(CheckError::Violation(format!(
                "category {} exposure ${:.2} would exceed cap ${:.2}",
                category,
                category_exposure + value,
                category_cap
            )));
        }

        Ok(())
    }

    /// Flash-crash protection. Compares against the previous observation
    /// of the same symbol and trips the guard on an abrupt move.
    pub fn check_price_move(&mut self, symbol: &str, price: f64) -> RiskVerdict {
        if let Some(reason) = &self.tripped {
            return RiskVerdict::Reject(format!("trading halted: {}", reason));
        }
        if price <= 0.0 {
            return RiskVerdict::Allow;
        }

        let previous = self.last_prices.insert(symbol.to_string(), price);
        let Some(previous) = previous.filter(|p| *p > 0.0) else {
            return RiskVerdict::Allow;
        };

        let move_pct = (price - previous).abs() / previous * 100.0;
        if move_pct <= self.circuit_breaker_pct {
            return RiskVerdict::Allow;
        }

        let catastrophic = move_pct > self.catastrophic_move_pct;
        let reason = format!(
            "{} moved {:.1}% ({:.8} -> {:.8}) between checks",
            symbol, move_pct, previous, price
        );
        error!("🛑 Circuit breaker tripped: {}", reason);
        self.tripped = Some(reason.clone());
        self.catastrophic = catastrophic;
        RiskVerdict::Halt { reason, catastrophic }
    }
}

/// Guard plus a context snapshot, handed to engines for one tick.
/// Allowed buys are added to the snapshot so later orders in the same
/// tick see the exposure they create.
pub struct RiskGate<'a> {
    guard: &'a mut RiskGuard,
    ctx: RiskContext,
}

impl<'a> RiskGate<'a> {
    pub fn new(guard: &'a mut RiskGuard, ctx: RiskContext) -> Self {
        Self { guard, ctx }
    }

    pub fn context(&self) -> &RiskContext {
        &self.ctx
    }
}

impl PreTradeCheck for RiskGate<'_> {
    fn check(&mut self, intent: &OrderIntent) -> RiskVerdict {
        let verdict = self.guard.evaluate(intent, &self.ctx);
        if verdict.is_allowed() && intent.side == Side::Buy {
            self.ctx.invested += intent.value();
            *self.ctx.symbol_exposure.entry(intent.symbol.clone()).or_insert(0.0) += intent.value();
        }
        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> RiskContext {
        RiskContext {
            total_capital: 1000.0,
            equity: Some(1000.0),
            day_start_equity: Some(1000.0),
            invested: 0.0,
            symbol_exposure: HashMap::new(),
            position_caps: HashMap::from([("XBTUSD".to_string(), 300.0)]),
            categories: BTreeMap::new(),
            market_prices: HashMap::from([("XBTUSD".to_string(), 100_000.0)]),
            constraints: AllocationConstraints::small_portfolio(),
        }
    }

    fn guard(bypass: bool) -> RiskGuard {
        RiskGuard::new(&RiskConfig::default(), bypass)
    }

    #[test]
    fn test_allows_order_within_limits() {
        let mut guard = guard(false);
        let intent = OrderIntent::new("XBTUSD", Side::Buy, 0.001, 99_000.0);
        assert_eq!(guard.evaluate(&intent, &context()), RiskVerdict::Allow);
    }

    #[test]
    fn test_drawdown_rejects_and_can_be_bypassed() {
        let mut ctx = context();
        ctx.equity = Some(850.0);
        let intent = OrderIntent::new("XBTUSD", Side::Buy, 0.001, 99_000.0);

        assert!(matches!(guard(false).evaluate(&intent, &ctx), RiskVerdict::Reject(_)));
        assert_eq!(guard(true).evaluate(&intent, &ctx), RiskVerdict::Allow);
    }

    #[test]
    fn test_position_cap_applies_to_buys_only() {
        let mut guard = guard(false);
        let big_buy = OrderIntent::new("XBTUSD", Side::Buy, 0.004, 99_000.0);
        let big_sell = OrderIntent::new("XBTUSD", Side::Sell, 0.004, 101_000.0);

        assert!(matches!(guard.evaluate(&big_buy, &context()), RiskVerdict::Reject(_)));
        assert_eq!(guard.evaluate(&big_sell, &context()), RiskVerdict::Allow);
    }

    #[test]
    fn test_cash_reserve_enforced() {
        let mut ctx = context();
        ctx.invested = 800.0;
        let intent = OrderIntent::new("XBTUSD", Side::Buy, 0.001, 99_000.0);
        let verdict = guard(false).evaluate(&intent, &ctx);
        assert!(matches!(verdict, RiskVerdict::Reject(reason) if reason.contains("available capital")));
    }

    #[test]
    fn test_open_position_limit() {
        let mut ctx = context();
        ctx.constraints.max_open_positions = 2;
        ctx.symbol_exposure = HashMap::from([
            ("ETHUSD".to_string(), 100.0),
            ("SOLUSD".to_string(), 100.0),
            ("ADAUSD".to_string(), 0.0),
        ]);
        ctx.invested = 200.0;

        let new_symbol = OrderIntent::new("XBTUSD", Side::Buy, 0.001, 99_000.0);
        let verdict = guard(false).evaluate(&new_symbol, &ctx);
        assert!(matches!(verdict, RiskVerdict::Reject(reason) if reason.contains("open positions")));

        // Topping up a symbol already held is still allowed
        let top_up = OrderIntent::new("ETHUSD", Side::Buy, 0.03, 3000.0);
        assert_eq!(guard(false).evaluate(&top_up, &ctx), RiskVerdict::Allow);

        // Sells are never limited
        let sell = OrderIntent::new("XBTUSD", Side::Sell, 0.001, 101_000.0);
        assert_eq!(guard(false).evaluate(&sell, &ctx), RiskVerdict::Allow);

        ctx.symbol_exposure.remove("SOLUSD");
        ctx.invested = 100.0;
        assert_eq!(guard(false).evaluate(&new_symbol, &ctx), RiskVerdict::Allow);
    }

    #[test]
    fn test_unavailable_inputs_degrade_to_allow() {
        let mut ctx = context();
        ctx.equity = None;
        ctx.position_caps.clear();
        ctx.market_prices.clear();
        let intent = OrderIntent::new("XBTUSD", Side::Buy, 0.001, 99_000.0);
        assert_eq!(guard(false).evaluate(&intent, &ctx), RiskVerdict::Allow);
    }

    #[test]
    fn test_circuit_breaker_trips_on_abrupt_move() {
        let mut guard = guard(false);
        assert_eq!(guard.check_price_move("XBTUSD", 100_000.0), RiskVerdict::Allow);
        assert_eq!(guard.check_price_move("XBTUSD", 95_000.0), RiskVerdict::Allow);

        match guard.check_price_move("XBTUSD", 84_000.0) {
            RiskVerdict::Halt { catastrophic, .. } => assert!(!catastrophic),
            other => panic!("expected halt, got {:?}", other),
        }
        assert!(guard.is_tripped());

        // Everything is rejected once tripped
        let intent = OrderIntent::new("XBTUSD", Side::Sell, 0.001, 84_000.0);
        assert!(matches!(guard.evaluate(&intent, &context()), RiskVerdict::Reject(_)));
    }

    #[test]
    fn test_catastrophic_move_flagged() {
        let mut guard = guard(false);
        guard.check_price_move("ETHUSD", 4000.0);
        assert!(matches!(
            guard.check_price_move("ETHUSD", 2000.0),
            RiskVerdict::Halt { catastrophic: true, .. }
        ));
    }

    #[test]
    fn test_gate_accumulates_exposure_within_tick() {
        let mut guard = guard(false);
        let mut gate = RiskGate::new(&mut guard, context());
        let intent = OrderIntent::new("XBTUSD", Side::Buy, 0.0015, 99_000.0);

        // 148.5 each; the MID_CAP per-coin cap of 30% ($300) stops the third
        assert!(gate.check(&intent).is_allowed());
        assert!(gate.check(&intent).is_allowed());
        assert!(!gate.check(&intent).is_allowed());
        assert!((gate.context().invested - 297.0).abs() < 1e-9);
    }
}
