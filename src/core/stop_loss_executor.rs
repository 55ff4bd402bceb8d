// Balance-aware market sells for triggered stops and CASH exits

use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::StopLossConfig;
use crate::error::{TradingError, TradingResult};
use crate::exchange::{ExchangeClient, ExchangeError, OrderRequest, SymbolInfo};
use crate::notify::NotificationSink;
use crate::types::Side;

/// What actually left the account
#[derive(Debug, Clone, PartialEq)]
pub struct SellOutcome {
    pub quantity: f64,
    pub price: f64,
}

impl SellOutcome {
    fn nothing() -> Self {
        Self { quantity: 0.0, price: 0.0 }
    }

    pub fn is_empty(&self) -> bool {
        self.quantity <= 0.0
    }
}

#[derive(Debug, Clone)]
pub struct StopLossExecutor {
    max_attempts: u32,
    backoff: Vec<Duration>,
}

impl StopLossExecutor {
    pub fn new(max_attempts: u32, backoff: Vec<Duration>) -> Self {
        Self { max_attempts: max_attempts.max(1), backoff }
    }

    pub fn from_config(config: &StopLossConfig) -> Self {
        Self::new(
            config.max_sell_attempts,
            config.backoff_secs.iter().map(|s| Duration::from_secs(*s)).collect(),
        )
    }

    /// One try, no backoff
    pub fn single_attempt(&self) -> Self {
        Self::new(1, Vec::new())
    }

    fn delay_before(&self, attempt: u32) -> Duration {
        // attempt is 1-based; no wait before the first try
        if attempt <= 1 || self.backoff.is_empty() {
            return Duration::ZERO;
        }
        let idx = ((attempt - 2) as usize).min(self.backoff.len() - 1);
        self.backoff[idx]
    }

    /// Sell up to `intended_quantity` of the symbol's base asset at market.
    /// Never sells more than the balance queried just before the order.
    pub async fn execute_sell(
        &self,
        exchange: &dyn ExchangeClient,
        notifier: &dyn NotificationSink,
        symbol: &str,
        intended_quantity: f64,
        reason: &str,
    ) -> TradingResult<SellOutcome> {
        let info = exchange.symbol_info(symbol).await?;
        let market_price = exchange.get_price(symbol).await.ok();
        let mut quantity = self.sellable(exchange, &info, intended_quantity).await;
        let mut last_error: Option<ExchangeError> = None;

        for attempt in 1..=self.max_attempts {
            let wait = self.delay_before(attempt);
            if !wait.is_zero() {
                sleep(wait).await;
            }

            let below_notional = market_price.map_or(false, |p| quantity * p < info.min_notional);
            if quantity <= 0.0 || quantity < info.min_qty || below_notional {
                warn!("⚠️  Nothing sellable for {} ({}): balance below exchange minimum", symbol, reason);
                return Ok(SellOutcome::nothing());
            }

            match exchange.place_order(&OrderRequest::market(symbol, Side::Sell, quantity)).await {
                Ok(order) => {
                    let price = order.avg_fill_price.unwrap_or(order.price);
                    info!(
                        "✅ Sold {:.8} {} @ {:.8} ({}, attempt {}/{})",
                        order.executed_quantity, symbol, price, reason, attempt, self.max_attempts
                    );
                    return Ok(SellOutcome { quantity: order.executed_quantity, price });
                }
                Err(ExchangeError::InsufficientBalance(msg)) => {
                    warn!("⚠️  Insufficient balance selling {} {} ({}), re-querying", quantity, symbol, msg);
                    quantity = self.sellable(exchange, &info, quantity).await;
                    last_error = Some(ExchangeError::InsufficientBalance(msg));
                }
                Err(e) => {
                    warn!("⚠️  Sell attempt {}/{} for {} failed: {}", attempt, self.max_attempts, symbol, e);
                    last_error = Some(e);
                }
            }
        }

        let detail = format!(
            "{} {:.8} ({}) after {} attempts: {}",
            symbol,
            quantity,
            reason,
            self.max_attempts,
            last_error.map(|e| e.to_string()).unwrap_or_else(|| "unknown error".to_string())
        );
        error!("❌ Stop-loss sell exhausted: {}", detail);
        notifier.send(
            &format!("CRITICAL: stop-loss sell failed for {}. ACTION REQUIRED: Manual sell needed", detail),
            true,
        );
        Err(TradingError::StopLossExecutionFailure(detail))
    }

    /// min(intended, free balance) rounded down to the step size. A failed
    /// balance query falls back to the intended quantity.
    async fn sellable(&self, exchange: &dyn ExchangeClient, info: &SymbolInfo, intended: f64) -> f64 {
        let held = match exchange.get_balance(&info.base_asset).await {
            Ok(balance) => balance,
            Err(e) => {
                warn!("⚠️  Balance query for {} failed ({}), using intended quantity", info.base_asset, e);
                intended
            }
        };
        info.round_quantity(intended.min(held))
    }
}
