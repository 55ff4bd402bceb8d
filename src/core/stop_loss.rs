// Stop-loss orders and their manager
//
// Triggering is two-phase: `update` only reports that the stop price was
// crossed. The stop stays armed until the caller confirms a successful
// sell, or re-arms it after a failed one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopType {
    Fixed,
    Trailing,
    Atr,
    BreakEven,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopLossOrder {
    pub id: String,
    pub symbol: String,
    pub entry_price: f64,
    pub stop_price: f64,
    pub quantity: f64,
    pub stop_type: StopType,
    pub stop_percentage: f64,
    pub trailing_distance: f64,
    pub atr_multiplier: f64,
    pub highest_price: f64,
    pub active: bool,
    pub triggered: bool,
    pub triggered_price: Option<f64>,
    pub triggered_at: Option<DateTime<Utc>>,
    pub result_pnl_pct: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl StopLossOrder {
    pub fn new(symbol: &str, entry_price: f64, quantity: f64, stop_type: StopType, stop_percentage: f64, trailing_distance: f64) -> Self {
        let stop_price = match stop_type {
            StopType::Trailing => entry_price * (1.0 - trailing_distance / 100.0),
            _ => entry_price * (1.0 - stop_percentage / 100.0),
        };

        Self {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            entry_price,
            stop_price,
            quantity,
            stop_type,
            stop_percentage,
            trailing_distance,
            atr_multiplier: 2.0,
            highest_price: entry_price,
            active: true,
            triggered: false,
            triggered_price: None,
            triggered_at: None,
            result_pnl_pct: None,
            created_at: Utc::now(),
        }
    }

    /// Move the stop with the market and report whether it was crossed.
    /// Never deactivates the stop.
    pub fn update(&mut self, price: f64, atr: Option<f64>) -> bool {
        if !self.active {
            return false;
        }

        match self.stop_type {
            StopType::Trailing => {
                if price > self.highest_price {
                    self.highest_price = price;
                    let candidate = price * (1.0 - self.trailing_distance / 100.0);
                    self.stop_price = self.stop_price.max(candidate);
                }
            }
            StopType::Atr => {
                if let Some(atr) = atr.filter(|a| *a > 0.0) {
                    let candidate = price - atr * self.atr_multiplier;
                    self.stop_price = self.stop_price.max(candidate);
                }
            }
            StopType::BreakEven => {
                let gain_pct = (price - self.entry_price) / self.entry_price * 100.0;
                if gain_pct >= self.stop_percentage {
                    self.stop_price = self.stop_price.max(self.entry_price);
                }
            }
            StopType::Fixed => {}
        }

        if price <= self.stop_price {
            self.triggered = true;
            self.triggered_price = Some(price);
            self.triggered_at = Some(Utc::now());
            return true;
        }
        false
    }

    /// Call only after the protective sell went through
    pub fn confirm_trigger(&mut self) {
        self.active = false;
        if let Some(price) = self.triggered_price {
            self.result_pnl_pct = Some((price - self.entry_price) / self.entry_price * 100.0);
        }
    }

    /// Re-arm after a failed sell
    pub fn reactivate(&mut self) {
        self.active = true;
        self.triggered = false;
        self.triggered_price = None;
        self.triggered_at = None;
    }

    /// Shrink the trailing distance; the stop only ever moves up
    pub fn tighten(&mut self, trailing_distance: f64) {
        if trailing_distance >= self.trailing_distance {
            return;
        }
        self.trailing_distance = trailing_distance;
        let candidate = self.highest_price * (1.0 - trailing_distance / 100.0);
        self.stop_price = self.stop_price.max(candidate);
    }

    pub fn distance_pct(&self) -> f64 {
        (self.entry_price - self.stop_price) / self.entry_price * 100.0
    }
}

/// All stops owned by one instance, plus a daily portfolio drawdown guard
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StopLossManager {
    stops: BTreeMap<String, StopLossOrder>,
    #[serde(default)]
    max_daily_drawdown_pct: f64,
    #[serde(default)]
    daily_start_value: f64,
    #[serde(default)]
    portfolio_stopped: bool,
}

impl StopLossManager {
    pub fn new(max_daily_drawdown_pct: f64) -> Self {
        Self {
            stops: BTreeMap::new(),
            max_daily_drawdown_pct,
            daily_start_value: 0.0,
            portfolio_stopped: false,
        }
    }

    pub fn create_stop(&mut self, symbol: &str, entry_price: f64, quantity: f64, stop_type: StopType, stop_percentage: f64, trailing_distance: Option<f64>) -> String {
        let trailing = trailing_distance.unwrap_or(stop_percentage);
        let stop = StopLossOrder::new(symbol, entry_price, quantity, stop_type, stop_percentage, trailing);
        let id = stop.id.clone();
        info!(
            "🛡️  Stop armed for {} {:.8} @ entry {:.8}, stop {:.8} ({:?})",
            symbol, quantity, entry_price, stop.stop_price, stop_type
        );
        self.stops.insert(id.clone(), stop);
        id
    }

    pub fn get(&self, id: &str) -> Option<&StopLossOrder> {
        self.stops.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut StopLossOrder> {
        self.stops.get_mut(id)
    }

    pub fn active_stops(&self) -> impl Iterator<Item = &StopLossOrder> {
        self.stops.values().filter(|s| s.active)
    }

    pub fn active_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.active_stops().map(|s| s.symbol.clone()).collect();
        symbols.dedup();
        symbols
    }

    /// Update every active stop. Returns the ids whose stop price was crossed.
    pub fn update_all(&mut self, prices: &HashMap<String, f64>, atrs: Option<&HashMap<String, f64>>) -> Vec<String> {
        let mut triggered = Vec::new();
        for (id, stop) in self.stops.iter_mut().filter(|(_, s)| s.active) {
            let Some(&price) = prices.get(&stop.symbol) else { continue };
            if price <= 0.0 {
                continue;
            }
            let atr = atrs.and_then(|a| a.get(&stop.symbol).copied());
            if stop.update(price, atr) {
                warn!("🛑 Stop {} triggered for {} at {:.8} (stop {:.8})", id, stop.symbol, price, stop.stop_price);
                triggered.push(id.clone());
            }
        }
        triggered
    }

    pub fn cancel_stop(&mut self, id: &str) -> bool {
        match self.stops.get_mut(id) {
            Some(stop) => {
                stop.active = false;
                true
            }
            None => false,
        }
    }

    /// Drop stops that are no longer armed
    pub fn prune_inactive(&mut self) {
        self.stops.retain(|_, s| s.active);
    }

    /// True when the portfolio lost more than the daily limit
    pub fn check_portfolio_drawdown(&mut self, current_value: f64) -> Option<String> {
        if self.daily_start_value <= 0.0 {
            self.daily_start_value = current_value;
            return None;
        }

        let drawdown = (current_value - self.daily_start_value) / self.daily_start_value * 100.0;
        if drawdown <= -self.max_daily_drawdown_pct {
            self.portfolio_stopped = true;
            return Some(format!(
                "portfolio drawdown {:.1}% reached the {:.1}% daily limit",
                drawdown, self.max_daily_drawdown_pct
            ));
        }
        None
    }

    pub fn reset_daily(&mut self, start_value: f64) {
        self.daily_start_value = start_value;
        self.portfolio_stopped = false;
    }

    pub fn is_portfolio_stopped(&self) -> bool {
        self.portfolio_stopped
    }

    pub fn len(&self) -> usize {
        self.stops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_stop_prices() {
        let fixed = StopLossOrder::new("XBTUSD", 100.0, 1.0, StopType::Fixed, 5.0, 3.0);
        assert!((fixed.stop_price - 95.0).abs() < 1e-9);

        let trailing = StopLossOrder::new("XBTUSD", 100.0, 1.0, StopType::Trailing, 5.0, 3.0);
        assert!((trailing.stop_price - 97.0).abs() < 1e-9);
    }

    #[test]
    fn test_trailing_stop_follows_new_highs_only() {
        let mut stop = StopLossOrder::new("XBTUSD", 100.0, 1.0, StopType::Trailing, 5.0, 7.0);
        assert!(!stop.update(120.0, None));
        assert!((stop.stop_price - 111.6).abs() < 1e-9);

        // A pullback does not lower the stop
        assert!(!stop.update(115.0, None));
        assert!((stop.stop_price - 111.6).abs() < 1e-9);

        assert!(stop.update(111.0, None));
        assert!(stop.active, "update must not deactivate");
        assert!(stop.triggered);
    }

    #[test]
    fn test_two_phase_trigger() {
        let mut stop = StopLossOrder::new("ETHUSD", 2000.0, 0.5, StopType::Fixed, 5.0, 3.0);
        assert!(stop.update(1890.0, None));

        stop.reactivate();
        assert!(stop.active && !stop.triggered);
        assert!(stop.update(1880.0, None));

        stop.confirm_trigger();
        assert!(!stop.active);
        assert!((stop.result_pnl_pct.unwrap() + 6.0).abs() < 1e-9);
        assert!(!stop.update(1000.0, None));
    }

    #[test]
    fn test_atr_and_break_even() {
        let mut atr = StopLossOrder::new("SOLUSD", 100.0, 1.0, StopType::Atr, 5.0, 3.0);
        atr.update(110.0, Some(2.0));
        assert!((atr.stop_price - 106.0).abs() < 1e-9);

        let mut be = StopLossOrder::new("SOLUSD", 100.0, 1.0, StopType::BreakEven, 5.0, 3.0);
        be.update(104.0, None);
        assert!((be.stop_price - 95.0).abs() < 1e-9);
        be.update(105.0, None);
        assert!((be.stop_price - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_tighten_only_moves_up() {
        let mut stop = StopLossOrder::new("XBTUSD", 100.0, 1.0, StopType::Trailing, 5.0, 7.0);
        stop.update(110.0, None);
        stop.tighten(3.0);
        assert!((stop.stop_price - 106.7).abs() < 1e-9);

        stop.tighten(5.0);
        assert!((stop.trailing_distance - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_manager_update_all_and_drawdown() {
        let mut manager = StopLossManager::new(10.0);
        let id = manager.create_stop("XBTUSD", 100.0, 1.0, StopType::Fixed, 5.0, None);
        manager.create_stop("ETHUSD", 50.0, 1.0, StopType::Fixed, 5.0, None);

        let prices = HashMap::from([("XBTUSD".to_string(), 94.0), ("ETHUSD".to_string(), 49.0)]);
        assert_eq!(manager.update_all(&prices, None), vec![id.clone()]);

        assert!(manager.cancel_stop(&id));
        manager.prune_inactive();
        assert_eq!(manager.len(), 1);

        assert!(manager.check_portfolio_drawdown(1000.0).is_none());
        assert!(manager.check_portfolio_drawdown(950.0).is_none());
        assert!(manager.check_portfolio_drawdown(890.0).is_some());
        assert!(manager.is_portfolio_stopped());
        manager.reset_daily(890.0);
        assert!(!manager.is_portfolio_stopped());
    }
}
