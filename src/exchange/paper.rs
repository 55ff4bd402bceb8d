// In-memory paper exchange with limit-order matching and fault injection

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    ExchangeClient, ExchangeError, ExchangeOrder, ExchangeOrderStatus, ExchangeResult, OrderRequest, OrderType,
    PriceFeed, SymbolInfo,
};
use crate::types::Side;

const EPSILON: f64 = 1e-9;

#[derive(Debug, Default)]
struct PaperState {
    free: HashMap<String, f64>,
    locked: HashMap<String, f64>,
    markets: HashMap<String, (SymbolInfo, f64)>,
    orders: HashMap<String, ExchangeOrder>,
    injected_order_failures: VecDeque<ExchangeError>,
    injected_balance_failures: VecDeque<ExchangeError>,
    cancel_count: usize,
}

impl PaperState {
    fn free(&self, asset: &str) -> f64 {
        self.free.get(asset).copied().unwrap_or(0.0)
    }

    fn credit(&mut self, asset: &str, amount: f64) {
        *self.free.entry(asset.to_string()).or_insert(0.0) += amount;
    }

    fn debit(&mut self, asset: &str, amount: f64) -> ExchangeResult<()> {
        let available = self.free(asset);
        if available + EPSILON < amount {
            return Err(ExchangeError::InsufficientBalance(format!(
                "{} available {:.8}, required {:.8}",
                asset, available, amount
            )));
        }
        self.free.insert(asset.to_string(), (available - amount).max(0.0));
        Ok(())
    }

    fn lock(&mut self, asset: &str, amount: f64) -> ExchangeResult<()> {
        self.debit(asset, amount)?;
        *self.locked.entry(asset.to_string()).or_insert(0.0) += amount;
        Ok(())
    }

    fn unlock(&mut self, asset: &str, amount: f64) {
        let locked = self.locked.entry(asset.to_string()).or_insert(0.0);
        *locked = (*locked - amount).max(0.0);
    }

    /// Move `quantity` of a resting order from locked funds into the fill
    fn settle_fill(&mut self, order_id: &str, quantity: f64, fee_rate: f64) {
        let Some(order) = self.orders.get(order_id).cloned() else { return };
        let Some((info, _)) = self.markets.get(&order.symbol).cloned() else { return };

        let quantity = quantity.min(order.quantity - order.executed_quantity).max(0.0);
        if quantity <= 0.0 {
            return;
        }

        match order.side {
            Side::Buy => {
                self.unlock(&info.quote_asset, order.price * quantity);
                self.credit(&info.base_asset, quantity * (1.0 - fee_rate));
            }
            Side::Sell => {
                self.unlock(&info.base_asset, quantity);
                self.credit(&info.quote_asset, order.price * quantity * (1.0 - fee_rate));
            }
        }

        if let Some(order) = self.orders.get_mut(order_id) {
            order.executed_quantity += quantity;
            order.avg_fill_price = Some(order.price);
            order.status = if order.executed_quantity + EPSILON >= order.quantity {
                ExchangeOrderStatus::Filled
            } else {
                ExchangeOrderStatus::PartiallyFilled
            };
        }
    }

    fn release_remaining(&mut self, order_id: &str) {
        let Some(order) = self.orders.get(order_id).cloned() else { return };
        let Some((info, _)) = self.markets.get(&order.symbol).cloned() else { return };
        let remaining = (order.quantity - order.executed_quantity).max(0.0);

        match order.side {
            Side::Buy => {
                self.unlock(&info.quote_asset, order.price * remaining);
                self.credit(&info.quote_asset, order.price * remaining);
            }
            Side::Sell => {
                self.unlock(&info.base_asset, remaining);
                self.credit(&info.base_asset, remaining);
            }
        }
    }

    /// Fill resting limit orders crossed by the new price
    fn match_orders(&mut self, symbol: &str, price: f64, fee_rate: f64) -> usize {
        let crossed: Vec<String> = self
            .orders
            .values()
            .filter(|o| o.symbol == symbol && !o.status.is_terminal())
            .filter(|o| match o.side {
                Side::Buy => price <= o.price,
                Side::Sell => price >= o.price,
            })
            .map(|o| o.order_id.clone())
            .collect();

        for order_id in &crossed {
            let remaining = self
                .orders
                .get(order_id)
                .map(|o| o.quantity - o.executed_quantity)
                .unwrap_or(0.0);
            self.settle_fill(order_id, remaining, fee_rate);
        }

        crossed.len()
    }
}

/// Simulated exchange account. BUY limits fill when price <= limit,
/// SELL limits when price >= limit; market orders fill immediately.
pub struct PaperExchange {
    state: Mutex<PaperState>,
    fee_rate: f64,
    feed: Option<Arc<dyn PriceFeed>>,
}

impl PaperExchange {
    pub fn new(quote_asset: &str, quote_balance: f64, fee_rate: f64) -> Self {
        let mut state = PaperState::default();
        state.free.insert(quote_asset.to_string(), quote_balance);

        Self {
            state: Mutex::new(state),
            fee_rate,
            feed: None,
        }
    }

    /// Refresh prices from a live feed whenever a price is requested
    pub fn with_price_feed(mut self, feed: Arc<dyn PriceFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    /// Typical spot-market rules for a symbol
    pub fn default_symbol(symbol: &str, base: &str, quote: &str) -> SymbolInfo {
        SymbolInfo {
            symbol: symbol.to_string(),
            base_asset: base.to_string(),
            quote_asset: quote.to_string(),
            step_size: 0.00001,
            tick_size: 0.01,
            min_qty: 0.00001,
            min_notional: 5.0,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, PaperState> {
        // A poisoned lock only means a panicking test thread; the data is still usable
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_symbol(&self, info: SymbolInfo, price: f64) {
        let mut state = self.lock_state();
        state.markets.insert(info.symbol.clone(), (info, price));
    }

    /// Move the market. Returns the number of orders that filled.
    pub fn set_price(&self, symbol: &str, price: f64) -> usize {
        let mut state = self.lock_state();
        if let Some(market) = state.markets.get_mut(symbol) {
            market.1 = price;
        }
        let filled = state.match_orders(symbol, price, self.fee_rate);
        if filled > 0 {
            debug!("📈 {} @ {:.8}: {} paper order(s) filled", symbol, price, filled);
        }
        filled
    }

    pub fn set_balance(&self, asset: &str, amount: f64) {
        self.lock_state().free.insert(asset.to_string(), amount);
    }

    /// The next `count` order placements fail with `error`
    pub fn fail_next_orders(&self, count: usize, error: ExchangeError) {
        let mut state = self.lock_state();
        for _ in 0..count {
            state.injected_order_failures.push_back(error.clone());
        }
    }

    /// The next balance query fails with `error`
    pub fn fail_next_balance(&self, error: ExchangeError) {
        self.lock_state().injected_balance_failures.push_back(error);
    }

    /// Execute part of a resting order without moving the market
    pub fn partial_fill(&self, order_id: &str, quantity: f64) {
        let mut state = self.lock_state();
        state.settle_fill(order_id, quantity, self.fee_rate);
    }

    /// Cancel on the exchange side (expiry, manual cancel in the UI)
    pub fn cancel_externally(&self, order_id: &str) {
        let mut state = self.lock_state();
        state.release_remaining(order_id);
        if let Some(order) = state.orders.get_mut(order_id) {
            order.status = ExchangeOrderStatus::Canceled;
        }
    }

    /// Forget an order entirely, as if the exchange purged it
    pub fn purge_order(&self, order_id: &str) {
        self.lock_state().orders.remove(order_id);
    }

    /// Rest a limit order without touching balances (left over by another process)
    pub fn insert_resting_order(&self, symbol: &str, side: Side, quantity: f64, price: f64) -> String {
        let order_id = Uuid::new_v4().to_string();
        let order = ExchangeOrder {
            order_id: order_id.clone(),
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Limit,
            price,
            quantity,
            executed_quantity: 0.0,
            avg_fill_price: None,
            status: ExchangeOrderStatus::New,
        };
        self.lock_state().orders.insert(order_id.clone(), order);
        order_id
    }

    pub fn order(&self, order_id: &str) -> Option<ExchangeOrder> {
        self.lock_state().orders.get(order_id).cloned()
    }

    pub fn open_orders_for(&self, symbol: &str) -> Vec<ExchangeOrder> {
        let state = self.lock_state();
        let mut orders: Vec<ExchangeOrder> = state
            .orders
            .values()
            .filter(|o| o.symbol == symbol && !o.status.is_terminal())
            .cloned()
            .collect();
        orders.sort_by(|a, b| a.price.total_cmp(&b.price));
        orders
    }

    pub fn cancel_count(&self) -> usize {
        self.lock_state().cancel_count
    }

    pub fn free_balance(&self, asset: &str) -> f64 {
        self.lock_state().free(asset)
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<ExchangeOrder> {
        let mut state = self.lock_state();

        if let Some(error) = state.injected_order_failures.pop_front() {
            warn!("🧪 Paper exchange injecting failure for {} {}: {}", request.side, request.symbol, error);
            return Err(error);
        }

        let (info, market_price) = state
            .markets
            .get(&request.symbol)
            .cloned()
            .ok_or_else(|| ExchangeError::NotFound(format!("unknown symbol {}", request.symbol)))?;

        let price = match request.order_type {
            OrderType::Limit => request
                .price
                .ok_or_else(|| ExchangeError::Rejected("limit order without price".to_string()))?,
            OrderType::Market => market_price,
        };

        if !info.meets_minimums(request.quantity, price) {
            return Err(ExchangeError::Rejected(format!(
                "{} {:.8} @ {:.8} below exchange minimums (min qty {}, min notional {})",
                request.symbol, request.quantity, price, info.min_qty, info.min_notional
            )));
        }

        let order_id = Uuid::new_v4().to_string();
        let mut order = ExchangeOrder {
            order_id: order_id.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            price,
            quantity: request.quantity,
            executed_quantity: 0.0,
            avg_fill_price: None,
            status: ExchangeOrderStatus::New,
        };

        match request.order_type {
            OrderType::Market => {
                match request.side {
                    Side::Buy => {
                        state.debit(&info.quote_asset, price * request.quantity)?;
                        state.credit(&info.base_asset, request.quantity * (1.0 - self.fee_rate));
                    }
                    Side::Sell => {
                        state.debit(&info.base_asset, request.quantity)?;
                        state.credit(&info.quote_asset, price * request.quantity * (1.0 - self.fee_rate));
                    }
                }
                order.executed_quantity = request.quantity;
                order.avg_fill_price = Some(price);
                order.status = ExchangeOrderStatus::Filled;
                state.orders.insert(order_id.clone(), order.clone());
                info!("📝 Paper market {} {:.8} {} @ {:.8}", request.side, request.quantity, request.symbol, price);
                Ok(order)
            }
            OrderType::Limit => {
                match request.side {
                    Side::Buy => state.lock(&info.quote_asset, price * request.quantity)?,
                    Side::Sell => state.lock(&info.base_asset, request.quantity)?,
                }
                state.orders.insert(order_id.clone(), order);

                // Marketable limits fill on arrival
                let crosses = match request.side {
                    Side::Buy => market_price <= price,
                    Side::Sell => market_price >= price,
                };
                if crosses {
                    let quantity = request.quantity;
                    state.settle_fill(&order_id, quantity, self.fee_rate);
                }

                state
                    .orders
                    .get(&order_id)
                    .cloned()
                    .ok_or_else(|| ExchangeError::NotFound(order_id.clone()))
            }
        }
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> ExchangeResult<()> {
        let mut state = self.lock_state();
        let status = state
            .orders
            .get(order_id)
            .map(|o| o.status)
            .ok_or_else(|| ExchangeError::NotFound(format!("order {}", order_id)))?;

        if status.is_terminal() {
            return Err(ExchangeError::Rejected(format!("order {} already {:?}", order_id, status)));
        }

        state.release_remaining(order_id);
        if let Some(order) = state.orders.get_mut(order_id) {
            order.status = ExchangeOrderStatus::Canceled;
        }
        state.cancel_count += 1;
        Ok(())
    }

    async fn get_order_status(&self, _symbol: &str, order_id: &str) -> ExchangeResult<ExchangeOrder> {
        self.lock_state()
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| ExchangeError::NotFound(format!("order {}", order_id)))
    }

    async fn get_open_orders(&self, symbol: Option<&str>) -> ExchangeResult<Vec<ExchangeOrder>> {
        let state = self.lock_state();
        Ok(state
            .orders
            .values()
            .filter(|o| !o.status.is_terminal())
            .filter(|o| symbol.map_or(true, |s| o.symbol == s))
            .cloned()
            .collect())
    }

    async fn get_balance(&self, asset: &str) -> ExchangeResult<f64> {
        let mut state = self.lock_state();
        if let Some(error) = state.injected_balance_failures.pop_front() {
            return Err(error);
        }
        Ok(state.free(asset))
    }

    async fn get_price(&self, symbol: &str) -> ExchangeResult<f64> {
        if let Some(feed) = &self.feed {
            let price = feed.latest_price(symbol).await?;
            self.set_price(symbol, price);
            return Ok(price);
        }

        self.lock_state()
            .markets
            .get(symbol)
            .map(|(_, price)| *price)
            .ok_or_else(|| ExchangeError::NotFound(format!("unknown symbol {}", symbol)))
    }

    async fn symbol_info(&self, symbol: &str) -> ExchangeResult<SymbolInfo> {
        self.lock_state()
            .markets
            .get(symbol)
            .map(|(info, _)| info.clone())
            .ok_or_else(|| ExchangeError::NotFound(format!("unknown symbol {}", symbol)))
    }
}
