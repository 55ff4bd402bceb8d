// Exchange client contract shared by every instance
//
// One client is constructed at startup and handed to each instance and
// engine as `Arc<dyn ExchangeClient>`.

pub mod feed;
pub mod guarded;
pub mod paper;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::types::Side;

pub use feed::{PriceFeed, RestTickerFeed};
pub use guarded::GuardedExchange;
pub use paper::PaperExchange;

/// Errors raised by an exchange client
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExchangeError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl ExchangeError {
    /// Network blips and rate limits; worth another attempt later
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExchangeError::RateLimited(_) | ExchangeError::Network(_) | ExchangeError::Timeout(_)
        )
    }
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Limit,
    Market,
}

/// Exchange-side order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExchangeOrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Expired,
    Rejected,
}

impl ExchangeOrderStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExchangeOrderStatus::New | ExchangeOrderStatus::PartiallyFilled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: f64,
    /// Required for limit orders
    pub price: Option<f64>,
}

impl OrderRequest {
    pub fn limit(symbol: &str, side: Side, quantity: f64, price: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Limit,
            quantity,
            price: Some(price),
        }
    }

    pub fn market(symbol: &str, side: Side, quantity: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub price: f64,
    pub quantity: f64,
    pub executed_quantity: f64,
    pub avg_fill_price: Option<f64>,
    pub status: ExchangeOrderStatus,
}

/// Trading rules for one symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub step_size: f64,
    pub tick_size: f64,
    pub min_qty: f64,
    pub min_notional: f64,
}

impl SymbolInfo {
    pub fn round_quantity(&self, quantity: f64) -> f64 {
        round_down_to_step(quantity, self.step_size)
    }

    pub fn round_price(&self, price: f64) -> f64 {
        round_down_to_step(price, self.tick_size)
    }

    /// True if the exchange would accept an order of this size
    pub fn meets_minimums(&self, quantity: f64, price: f64) -> bool {
        quantity >= self.min_qty && quantity > 0.0 && quantity * price >= self.min_notional
    }
}

/// Round down to an exchange increment. Never rounds up, so the result
/// never exceeds the input.
pub fn round_down_to_step(value: f64, step: f64) -> f64 {
    if step <= 0.0 || value <= 0.0 {
        return value.max(0.0);
    }
    // Guard against 0.998 / 0.001 == 997.9999999
    let units = (value / step + 1e-9).floor();
    let rounded = (units * step * 1e8).round() / 1e8;
    rounded.min(value)
}

#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<ExchangeOrder>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> ExchangeResult<()>;

    async fn get_order_status(&self, symbol: &str, order_id: &str) -> ExchangeResult<ExchangeOrder>;

    /// Open orders for one symbol, or for the whole account
    async fn get_open_orders(&self, symbol: Option<&str>) -> ExchangeResult<Vec<ExchangeOrder>>;

    /// Free balance of an asset
    async fn get_balance(&self, asset: &str) -> ExchangeResult<f64>;

    async fn get_price(&self, symbol: &str) -> ExchangeResult<f64>;

    async fn symbol_info(&self, symbol: &str) -> ExchangeResult<SymbolInfo>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_down_handles_float_noise() {
        assert_eq!(round_down_to_step(0.998, 0.001), 0.998);
        assert_eq!(round_down_to_step(0.9989, 0.001), 0.998);
        assert_eq!(round_down_to_step(1.0, 0.1), 1.0);
        assert_eq!(round_down_to_step(0.3, 0.1), 0.3);
    }

    #[test]
    fn test_round_down_never_exceeds_input() {
        for raw in [0.0001234, 0.1, 2.345678, 17.0, 0.998] {
            assert!(round_down_to_step(raw, 0.0001) <= raw);
        }
        assert_eq!(round_down_to_step(0.00009, 0.0001), 0.0);
    }

    #[test]
    fn test_minimums() {
        let info = SymbolInfo {
            symbol: "XBTUSD".to_string(),
            base_asset: "XBT".to_string(),
            quote_asset: "USD".to_string(),
            step_size: 0.00001,
            tick_size: 0.1,
            min_qty: 0.0001,
            min_notional: 5.0,
        };
        assert!(info.meets_minimums(0.001, 100_000.0));
        assert!(!info.meets_minimums(0.00004, 100_000.0));
        assert!(!info.meets_minimums(0.0001, 10_000.0));
    }

    #[test]
    fn test_transient_classification() {
        assert!(ExchangeError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!ExchangeError::InsufficientBalance("x".into()).is_transient());
        assert!(!ExchangeError::Rejected("x".into()).is_transient());
    }
}
