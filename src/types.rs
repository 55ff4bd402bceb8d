// Common types shared by the engine, the mode manager and the orchestrator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Relative tolerance used when matching a fill price to a grid level
pub const PRICE_TOLERANCE: f64 = 0.001;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Local view of an order's lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    Open,
    Partial,
    Filled,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradingMode {
    Hold,
    Grid,
    Cash,
}

impl fmt::Display for TradingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradingMode::Hold => write!(f, "HOLD"),
            TradingMode::Grid => write!(f, "GRID"),
            TradingMode::Cash => write!(f, "CASH"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Regime {
    Bull,
    Bear,
    Sideways,
    Transition,
}

impl Regime {
    /// Mode implied by a regime label. TRANSITION implies no change.
    pub fn target_mode(self) -> Option<TradingMode> {
        match self {
            Regime::Bull => Some(TradingMode::Hold),
            Regime::Sideways => Some(TradingMode::Grid),
            Regime::Bear => Some(TradingMode::Cash),
            Regime::Transition => None,
        }
    }
}

/// Output of the external regime classifier
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegimeSignal {
    pub regime: Regime,
    pub probability: f64,
    pub duration_days: f64,
}

impl RegimeSignal {
    pub fn new(regime: Regime, probability: f64, duration_days: f64) -> Self {
        Self { regime, probability, duration_days }
    }
}

/// One price point of a grid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridLevel {
    pub price: f64,
    pub side: Side,
    pub quantity: f64,
    pub order_id: Option<String>,
}

/// Locally tracked exchange order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub price: f64,
    /// Original quantity
    pub quantity: f64,
    pub status: OrderStatus,
    pub filled_quantity: f64,
    pub remaining_quantity: f64,
    pub created_at: DateTime<Utc>,
}

impl OrderRecord {
    pub fn new(order_id: String, symbol: String, side: Side, price: f64, quantity: f64, created_at: DateTime<Utc>) -> Self {
        Self {
            order_id,
            symbol,
            side,
            price,
            quantity,
            status: OrderStatus::Open,
            filled_quantity: 0.0,
            remaining_quantity: quantity,
            created_at,
        }
    }

    pub fn original_quantity(&self) -> f64 {
        self.quantity
    }

    /// Record the cumulative executed quantity reported by the exchange.
    /// Returns the newly filled delta. Keeps `filled + remaining == quantity`.
    pub fn apply_fill(&mut self, executed: f64) -> f64 {
        let executed = executed.clamp(0.0, self.quantity);
        let delta = (executed - self.filled_quantity).max(0.0);
        self.filled_quantity = executed.max(self.filled_quantity);
        self.remaining_quantity = self.quantity - self.filled_quantity;
        delta
    }

    pub fn is_live(&self) -> bool {
        matches!(self.status, OrderStatus::Open | OrderStatus::Partial)
    }

    pub fn notional(&self) -> f64 {
        self.price * self.quantity
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FollowUpAction {
    PlaceBuy,
    PlaceSell,
}

impl FollowUpAction {
    pub fn side(self) -> Side {
        match self {
            FollowUpAction::PlaceBuy => Side::Buy,
            FollowUpAction::PlaceSell => Side::Sell,
        }
    }
}

/// Counter-order owed after a fill, retried until placed or exhausted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingFollowUp {
    pub trigger_order_id: String,
    pub action: FollowUpAction,
    pub price: f64,
    pub quantity: f64,
    pub attempt_count: u32,
    pub next_retry_at: DateTime<Utc>,
    pub failed: bool,
}

/// Executed quantity reported back to the instance ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillEvent {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub price: f64,
    pub quantity: f64,
    /// True once the order reached a terminal state
    pub complete: bool,
}

impl FillEvent {
    pub fn notional(&self) -> f64 {
        self.price * self.quantity
    }
}

/// Relative price comparison, safe across assets of very different magnitude
pub fn prices_match(a: f64, b: f64, tolerance: f64) -> bool {
    if b == 0.0 {
        return a == 0.0;
    }
    ((a - b) / b).abs() < tolerance
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_fill_keeps_quantities_consistent() {
        let mut order = OrderRecord::new("1".into(), "BTCUSD".into(), Side::Buy, 100.0, 2.0, Utc::now());

        assert_eq!(order.apply_fill(0.5), 0.5);
        assert_eq!(order.filled_quantity + order.remaining_quantity, 2.0);

        // Exchange reports cumulative quantity, not deltas
        assert!((order.apply_fill(1.25) - 0.75).abs() < 1e-12);
        assert_eq!(order.filled_quantity + order.remaining_quantity, 2.0);

        // Over-reporting is clamped
        order.apply_fill(5.0);
        assert_eq!(order.filled_quantity, 2.0);
        assert_eq!(order.remaining_quantity, 0.0);
    }

    #[test]
    fn test_relative_price_match() {
        assert!(prices_match(100_050.0, 100_000.0, PRICE_TOLERANCE));
        assert!(!prices_match(100_200.0, 100_000.0, PRICE_TOLERANCE));
        // Same absolute gap means very different things for cheap assets
        assert!(!prices_match(0.55, 0.50, PRICE_TOLERANCE));
        assert!(prices_match(0.50004, 0.5, PRICE_TOLERANCE));
    }

    #[test]
    fn test_regime_mapping() {
        assert_eq!(Regime::Bull.target_mode(), Some(TradingMode::Hold));
        assert_eq!(Regime::Sideways.target_mode(), Some(TradingMode::Grid));
        assert_eq!(Regime::Bear.target_mode(), Some(TradingMode::Cash));
        assert_eq!(Regime::Transition.target_mode(), None);
    }
}
