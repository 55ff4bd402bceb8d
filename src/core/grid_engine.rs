// Grid order engine: one per symbol per instance
//
// Owns the grid levels, the locally tracked orders and the follow-up
// queue for its symbol. Every placement goes through the caller's
// `PreTradeCheck`; every exchange call goes through the shared client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, error, info, warn};

use super::followup::{FollowUpQueue, RetrySchedule};
use super::risk_guard::{OrderIntent, PreTradeCheck, RiskVerdict};
use crate::config::GridConfig;
use crate::error::{TradingError, TradingResult};
use crate::exchange::{
    ExchangeClient, ExchangeError, ExchangeOrder, ExchangeOrderStatus, ExchangeResult, OrderRequest, SymbolInfo,
};
use crate::notify::NotificationSink;
use crate::types::{prices_match, FillEvent, FollowUpAction, GridLevel, OrderRecord, OrderStatus, PendingFollowUp, Side};

/// `grid_count + 1` equally spaced prices from `lower` to `upper`
pub fn compute_grid_prices(lower: f64, upper: f64, grid_count: usize) -> Vec<f64> {
    if grid_count == 0 || lower <= 0.0 || upper <= lower {
        return Vec::new();
    }
    let spacing = (upper - lower) / grid_count as f64;
    (0..=grid_count).map(|i| lower + spacing * i as f64).collect()
}

/// What the engine was built for. A different symbol or capital means
/// the old grid must be torn down first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    pub symbol: String,
    pub capital: f64,
    pub grid_count: usize,
    pub lower_bound: f64,
    pub upper_bound: f64,
}

impl GridSpec {
    pub fn conflicts_with(&self, other: &GridSpec) -> bool {
        self.symbol != other.symbol || (self.capital - other.capital).abs() > 1e-9
    }
}

/// Runtime parameters, taken from `[grid]` rather than persisted
#[derive(Debug, Clone)]
pub struct EngineParams {
    pub fee_rate: f64,
    pub price_tolerance: f64,
    pub retry: RetrySchedule,
}

impl EngineParams {
    pub fn from_config(config: &GridConfig) -> Self {
        Self {
            fee_rate: config.taker_fee_rate,
            price_tolerance: config.price_tolerance,
            retry: RetrySchedule::from_config(config),
        }
    }
}

impl Default for EngineParams {
    fn default() -> Self {
        Self::from_config(&GridConfig::default())
    }
}

/// Persisted form of one engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridEngineState {
    pub spec: GridSpec,
    #[serde(default)]
    pub levels: Vec<GridLevel>,
    #[serde(default)]
    pub orders: BTreeMap<String, OrderRecord>,
    #[serde(default)]
    pub followups: FollowUpQueue,
    #[serde(default)]
    pub inventory: f64,
    #[serde(default)]
    pub halted: Option<String>,
    #[serde(default)]
    pub initialized: bool,
    /// Executions not yet booked by the owning instance
    #[serde(default)]
    pub unreported_fills: Vec<FillEvent>,
}

#[derive(Debug, Default)]
pub struct TickReport {
    /// Executions detected this tick, collected with `take_fills`
    pub fills: usize,
    pub placed: usize,
    pub exhausted: Vec<PendingFollowUp>,
    pub halted: Option<String>,
}

#[derive(Debug, Default)]
pub struct CancelSummary {
    pub canceled: usize,
    pub fills: usize,
}

enum FollowUpFailure {
    /// Counts as a failed attempt
    Retry(String),
    /// Can never succeed as specified; dropped with a warning
    Skip(String),
    Halt(String),
}

pub struct GridOrderEngine {
    spec: GridSpec,
    params: EngineParams,
    symbol_info: Option<SymbolInfo>,
    levels: Vec<GridLevel>,
    orders: BTreeMap<String, OrderRecord>,
    followups: FollowUpQueue,
    inventory: f64,
    halted: Option<String>,
    initialized: bool,
    unreported: Vec<FillEvent>,
}

impl GridOrderEngine {
    pub fn new(spec: GridSpec, params: EngineParams) -> Self {
        Self {
            spec,
            params,
            symbol_info: None,
            levels: Vec::new(),
            orders: BTreeMap::new(),
            followups: FollowUpQueue::new(),
            inventory: 0.0,
            halted: None,
            initialized: false,
            unreported: Vec::new(),
        }
    }

    pub fn from_state(state: GridEngineState, params: EngineParams) -> Self {
        Self {
            spec: state.spec,
            params,
            symbol_info: None,
            levels: state.levels,
            orders: state.orders,
            followups: state.followups,
            inventory: state.inventory,
            halted: state.halted,
            initialized: state.initialized,
            unreported: state.unreported_fills,
        }
    }

    pub fn to_state(&self) -> GridEngineState {
        GridEngineState {
            spec: self.spec.clone(),
            levels: self.levels.clone(),
            orders: self.orders.clone(),
            followups: self.followups.clone(),
            inventory: self.inventory,
            halted: self.halted.clone(),
            initialized: self.initialized,
            unreported_fills: self.unreported.clone(),
        }
    }

    pub fn spec(&self) -> &GridSpec {
        &self.spec
    }

    pub fn symbol(&self) -> &str {
        &self.spec.symbol
    }

    pub fn levels(&self) -> &[GridLevel] {
        &self.levels
    }

    pub fn orders(&self) -> impl Iterator<Item = &OrderRecord> {
        self.orders.values()
    }

    pub fn open_order_ids(&self) -> Vec<String> {
        self.orders.values().filter(|o| o.is_live()).map(|o| o.order_id.clone()).collect()
    }

    pub fn pending_followups(&self) -> &FollowUpQueue {
        &self.followups
    }

    pub fn inventory(&self) -> f64 {
        self.inventory
    }

    /// Move the band before the next `initialize`
    pub fn set_bounds(&mut self, lower_bound: f64, upper_bound: f64) {
        self.spec.lower_bound = lower_bound;
        self.spec.upper_bound = upper_bound;
    }

    pub fn set_inventory(&mut self, quantity: f64) {
        self.inventory = quantity.max(0.0);
    }

    pub fn halted(&self) -> Option<&str> {
        self.halted.as_deref()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Drain executions for the capital ledger
    pub fn take_fills(&mut self) -> Vec<FillEvent> {
        std::mem::take(&mut self.unreported)
    }

    /// Quote currency reserved by resting BUY orders
    pub fn committed_quote(&self) -> f64 {
        self.orders
            .values()
            .filter(|o| o.is_live() && o.side == Side::Buy)
            .map(|o| o.price * o.remaining_quantity)
            .sum()
    }

    async fn symbol_info(&mut self, exchange: &dyn ExchangeClient) -> ExchangeResult<SymbolInfo> {
        if let Some(info) = &self.symbol_info {
            return Ok(info.clone());
        }
        let info = exchange.symbol_info(&self.spec.symbol).await?;
        self.symbol_info = Some(info.clone());
        Ok(info)
    }

    /// Compute levels and place the opening orders: BUYs below the current
    /// price, SELLs above it only for inventory already held. Tracked orders
    /// from an earlier, aborted attempt are cancelled first.
    pub async fn initialize(
        &mut self,
        exchange: &dyn ExchangeClient,
        risk: &mut dyn PreTradeCheck,
        current_price: f64,
        now: DateTime<Utc>,
    ) -> TradingResult<usize> {
        if !self.orders.is_empty() {
            self.cancel_all(exchange).await?;
        }
        self.levels.clear();
        self.initialized = false;

        let info = self.symbol_info(exchange).await?;
        let prices = compute_grid_prices(self.spec.lower_bound, self.spec.upper_bound, self.spec.grid_count);
        if prices.is_empty() {
            return Err(TradingError::ConfigValidation(format!(
                "{}: invalid grid bounds [{}, {}] x {}",
                self.spec.symbol, self.spec.lower_bound, self.spec.upper_bound, self.spec.grid_count
            )));
        }

        let per_level_usd = self.spec.capital / self.spec.grid_count as f64;
        let mut skipped = 0;
        for (i, raw_price) in prices.iter().enumerate() {
            let price = info.round_price(*raw_price);
            let quantity = info.round_quantity(per_level_usd / price);
            if !info.meets_minimums(quantity, price) {
                warn!(
                    "⚠️  {} level {} skipped: {:.8} @ {:.2} below exchange minimums",
                    self.spec.symbol, i, quantity, price
                );
                skipped += 1;
                continue;
            }
            let side = if price < current_price { Side::Buy } else { Side::Sell };
            self.levels.push(GridLevel { price, side, quantity, order_id: None });
        }

        if self.levels.len() < 2 {
            warn!(
                "⚠️  {}: only {} valid grid levels ({} skipped), capital may be too small",
                self.spec.symbol,
                self.levels.len(),
                skipped
            );
        }

        let mut unallocated_inventory = self.inventory;
        let mut placed = 0;
        for idx in 0..self.levels.len() {
            let level = self.levels[idx].clone();
            if prices_match(level.price, current_price, self.params.price_tolerance) {
                debug!("{} level {:.2} sits on the current price, left empty", self.spec.symbol, level.price);
                continue;
            }

            let quantity = match level.side {
                Side::Buy => level.quantity,
                Side::Sell => {
                    let quantity = info.round_quantity(level.quantity.min(unallocated_inventory));
                    if !info.meets_minimums(quantity, level.price) {
                        continue;
                    }
                    quantity
                }
            };

            let intent = OrderIntent::new(&self.spec.symbol, level.side, quantity, level.price);
            match risk.check(&intent) {
                RiskVerdict::Allow => {}
                RiskVerdict::Reject(reason) => {
                    info!("⏭️  {} {} level {:.2} not placed: {}", self.spec.symbol, level.side, level.price, reason);
                    continue;
                }
                RiskVerdict::Halt { reason, .. } => return Err(TradingError::CircuitBreakerTripped(reason)),
            }

            let request = OrderRequest::limit(&self.spec.symbol, level.side, quantity, level.price);
            match exchange.place_order(&request).await {
                Ok(order) => {
                    self.track(&order, level.price, quantity, now);
                    self.levels[idx].order_id = Some(order.order_id.clone());
                    if level.side == Side::Sell {
                        unallocated_inventory -= quantity;
                    }
                    placed += 1;
                }
                Err(ExchangeError::Rejected(reason)) => {
                    warn!("⚠️  {} {} level {:.2} rejected, skipping: {}", self.spec.symbol, level.side, level.price, reason);
                }
                Err(e) => {
                    warn!("❌ {} grid initialization interrupted: {}", self.spec.symbol, e);
                    return Err(e.into());
                }
            }
        }

        self.initialized = true;
        info!(
            "🎯 {} grid ready: {} levels in [{:.2}, {:.2}], {} orders placed",
            self.spec.symbol,
            self.levels.len(),
            self.spec.lower_bound,
            self.spec.upper_bound,
            placed
        );
        Ok(placed)
    }

    fn track(&mut self, order: &ExchangeOrder, price: f64, quantity: f64, now: DateTime<Utc>) {
        let record = OrderRecord::new(
            order.order_id.clone(),
            self.spec.symbol.clone(),
            order.side,
            price,
            quantity,
            now,
        );
        self.orders.insert(order.order_id.clone(), record);
    }

    fn level_index(&self, price: f64) -> Option<usize> {
        self.levels
            .iter()
            .position(|l| prices_match(l.price, price, self.params.price_tolerance))
    }

    fn unlink_level(&mut self, order_id: &str) {
        for level in self.levels.iter_mut() {
            if level.order_id.as_deref() == Some(order_id) {
                level.order_id = None;
            }
        }
    }

    fn apply_inventory(&mut self, side: Side, delta: f64) {
        match side {
            Side::Buy => self.inventory += delta * (1.0 - self.params.fee_rate),
            Side::Sell => self.inventory = (self.inventory - delta).max(0.0),
        }
    }

    /// One engine cycle: due retries first, then fill detection, then the
    /// follow-ups those fills produced.
    pub async fn tick(
        &mut self,
        exchange: &dyn ExchangeClient,
        risk: &mut dyn PreTradeCheck,
        notifier: &dyn NotificationSink,
        now: DateTime<Utc>,
    ) -> TradingResult<TickReport> {
        let mut report = TickReport::default();
        if let Some(reason) = &self.halted {
            report.halted = Some(reason.clone());
            return Ok(report);
        }

        self.process_followups(exchange, risk, notifier, now, &mut report).await?;
        report.fills = self.reconcile(exchange, now).await?;
        self.process_followups(exchange, risk, notifier, now, &mut report).await?;

        report.halted = self.halted.clone();
        Ok(report)
    }

    /// Re-query every tracked order after a restart. Fills that happened
    /// while offline are queued, not placed: the first tick places them.
    pub async fn recover(&mut self, exchange: &dyn ExchangeClient, now: DateTime<Utc>) -> TradingResult<usize> {
        let tracked = self.open_order_ids().len();
        let fills = self.reconcile(exchange, now).await?;
        if fills > 0 || !self.followups.is_empty() {
            info!(
                "🔄 {} recovered {} tracked orders: {} fills while offline, {} follow-ups pending",
                self.spec.symbol,
                tracked,
                fills,
                self.followups.len()
            );
        }
        Ok(fills)
    }

    /// Compare tracked orders with the exchange. Returns newly executed
    /// quantities; full fills also queue their follow-up.
    async fn reconcile(&mut self, exchange: &dyn ExchangeClient, now: DateTime<Utc>) -> TradingResult<usize> {
        let mut fills = 0;
        let ids = self.open_order_ids();
        let mut failures = 0;
        let mut last_error = None;

        for order_id in &ids {
            let status = exchange.get_order_status(&self.spec.symbol, order_id).await;
            let remote = match status {
                Ok(remote) => remote,
                Err(ExchangeError::NotFound(_)) => {
                    warn!("⚠️  {} order {} unknown to the exchange, dropping it", self.spec.symbol, order_id);
                    self.orders.remove(order_id);
                    self.unlink_level(order_id);
                    continue;
                }
                Err(e) => {
                    debug!("{} status query for {} failed: {}", self.spec.symbol, order_id, e);
                    failures += 1;
                    last_error = Some(e);
                    continue;
                }
            };

            if let Some(fill) = self.apply_remote(order_id, &remote, now) {
                self.unreported.push(fill);
                fills += 1;
            }
        }

        if failures > 0 && failures == ids.len() {
            if let Some(e) = last_error {
                return Err(e.into());
            }
        }
        Ok(fills)
    }

    fn apply_remote(&mut self, order_id: &str, remote: &ExchangeOrder, now: DateTime<Utc>) -> Option<FillEvent> {
        let record = self.orders.get_mut(order_id)?;
        let delta = record.apply_fill(remote.executed_quantity);
        let side = record.side;
        let price = remote.avg_fill_price.unwrap_or(record.price);

        let complete = match remote.status {
            ExchangeOrderStatus::New => false,
            ExchangeOrderStatus::PartiallyFilled => {
                record.status = OrderStatus::Partial;
                false
            }
            ExchangeOrderStatus::Filled => {
                record.status = OrderStatus::Filled;
                true
            }
            ExchangeOrderStatus::Canceled | ExchangeOrderStatus::Expired | ExchangeOrderStatus::Rejected => {
                record.status = OrderStatus::Canceled;
                true
            }
        };

        if delta > 0.0 {
            self.apply_inventory(side, delta);
        }

        if complete {
            let Some(record) = self.orders.remove(order_id) else { return None };
            self.unlink_level(order_id);
            match record.status {
                OrderStatus::Filled => {
                    info!(
                        "💰 {} {} filled: {:.8} @ {:.2}",
                        self.spec.symbol, record.side, record.filled_quantity, record.price
                    );
                    self.queue_followup(&record, now);
                }
                _ if record.filled_quantity > 0.0 => warn!(
                    "⚠️  {} {} {} closed by the exchange after a partial fill of {:.8}, no follow-up",
                    self.spec.symbol, record.side, order_id, record.filled_quantity
                ),
                _ => warn!("⚠️  {} {} {} closed by the exchange unfilled", self.spec.symbol, record.side, order_id),
            }
        } else if delta > 0.0 {
            debug!("{} {} partially filled: +{:.8}", self.spec.symbol, order_id, delta);
        }

        (delta > 0.0).then(|| FillEvent {
            order_id: order_id.to_string(),
            symbol: self.spec.symbol.clone(),
            side,
            price,
            quantity: delta,
            complete,
        })
    }

    fn queue_followup(&mut self, filled: &OrderRecord, now: DateTime<Utc>) {
        let Some(idx) = self.level_index(filled.price) else {
            warn!("⚠️  {} fill @ {:.2} matches no grid level, no follow-up", self.spec.symbol, filled.price);
            return;
        };

        let (action, price, quantity) = match filled.side {
            Side::Buy => {
                let Some(next) = self.levels.get(idx + 1) else {
                    warn!("⚠️  {} BUY filled at the top level, no SELL above", self.spec.symbol);
                    return;
                };
                let after_fee = filled.filled_quantity * (1.0 - self.params.fee_rate);
                let quantity = self
                    .symbol_info
                    .as_ref()
                    .map(|info| info.round_quantity(after_fee))
                    .unwrap_or(after_fee);
                (FollowUpAction::PlaceSell, next.price, quantity)
            }
            Side::Sell => {
                if idx == 0 {
                    warn!("⚠️  {} SELL filled at the bottom level, no BUY below", self.spec.symbol);
                    return;
                }
                let below = &self.levels[idx - 1];
                (FollowUpAction::PlaceBuy, below.price, below.quantity)
            }
        };

        if self.followups.push(&filled.order_id, action, price, quantity, now) {
            info!("📋 {} queued {:?} {:.8} @ {:.2}", self.spec.symbol, action, quantity, price);
        }
    }

    async fn process_followups(
        &mut self,
        exchange: &dyn ExchangeClient,
        risk: &mut dyn PreTradeCheck,
        notifier: &dyn NotificationSink,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> TradingResult<()> {
        let mut due = self.followups.take_due(now).into_iter();

        while let Some(followup) = due.next() {
            if self.halted.is_some() {
                self.followups.requeue(followup);
                continue;
            }

            match self.place_followup(exchange, risk, &followup, now).await {
                Ok(()) => report.placed += 1,
                Err(FollowUpFailure::Skip(reason)) => {
                    warn!(
                        "⚠️  {} dropping {:?} @ {:.2}: {}",
                        self.spec.symbol, followup.action, followup.price, reason
                    );
                }
                Err(FollowUpFailure::Retry(reason)) => {
                    self.record_failure(followup, &reason, notifier, now, report);
                }
                Err(FollowUpFailure::Halt(reason)) => {
                    self.followups.requeue(followup);
                    for rest in due {
                        self.followups.requeue(rest);
                    }
                    return Err(TradingError::CircuitBreakerTripped(reason));
                }
            }
        }
        Ok(())
    }

    async fn place_followup(
        &mut self,
        exchange: &dyn ExchangeClient,
        risk: &mut dyn PreTradeCheck,
        followup: &PendingFollowUp,
        now: DateTime<Utc>,
    ) -> Result<(), FollowUpFailure> {
        let info = self
            .symbol_info(exchange)
            .await
            .map_err(|e| FollowUpFailure::Retry(e.to_string()))?;
        let side = followup.action.side();
        let price = info.round_price(followup.price);
        let mut quantity = info.round_quantity(followup.quantity);
        if !info.meets_minimums(quantity, price) {
            return Err(FollowUpFailure::Skip(format!("{:.8} @ {:.2} below exchange minimums", quantity, price)));
        }

        let intent = OrderIntent::new(&self.spec.symbol, side, quantity, price);
        match risk.check(&intent) {
            RiskVerdict::Allow => {}
            RiskVerdict::Reject(reason) => return Err(FollowUpFailure::Retry(format!("risk: {}", reason))),
            RiskVerdict::Halt { reason, .. } => return Err(FollowUpFailure::Halt(reason)),
        }

        let mut result = exchange.place_order(&OrderRequest::limit(&self.spec.symbol, side, quantity, price)).await;

        // The fee may have left slightly less than the fill; sell what is there
        let short_of_base = side == Side::Sell && matches!(result, Err(ExchangeError::InsufficientBalance(_)));
        if short_of_base {
            if let Ok(held) = exchange.get_balance(&info.base_asset).await {
                let reduced = info.round_quantity(quantity.min(held));
                if reduced < quantity && info.meets_minimums(reduced, price) {
                    warn!(
                        "⚠️  {} follow-up SELL reduced {:.8} -> {:.8} to match balance",
                        self.spec.symbol, quantity, reduced
                    );
                    quantity = reduced;
                    result = exchange
                        .place_order(&OrderRequest::limit(&self.spec.symbol, side, quantity, price))
                        .await;
                }
            }
        }

        match result {
            Ok(order) => {
                self.track(&order, price, quantity, now);
                if let Some(idx) = self.level_index(price) {
                    self.levels[idx].order_id = Some(order.order_id.clone());
                }
                info!(
                    "✅ {} follow-up {} {:.8} @ {:.2} placed (attempt {})",
                    self.spec.symbol,
                    side,
                    quantity,
                    price,
                    followup.attempt_count + 1
                );
                Ok(())
            }
            Err(e) => Err(FollowUpFailure::Retry(e.to_string())),
        }
    }

    fn record_failure(
        &mut self,
        mut followup: PendingFollowUp,
        reason: &str,
        notifier: &dyn NotificationSink,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) {
        followup.attempt_count += 1;
        let retry = &self.params.retry;

        if retry.is_exhausted(followup.attempt_count) {
            followup.failed = true;
            let message = format!(
                "{} follow-up {:?} {:.8} @ {:.2} (after {}) failed {} times, last error: {}. Position left unbalanced, symbol halted",
                self.spec.symbol,
                followup.action,
                followup.quantity,
                followup.price,
                followup.trigger_order_id,
                followup.attempt_count,
                reason
            );
            error!("❌ {}", message);
            notifier.send(&message, true);
            self.halted = Some(format!("follow-up exhausted after {} attempts", followup.attempt_count));
            report.exhausted.push(followup);
            return;
        }

        let delay = retry.delay_after(followup.attempt_count);
        followup.next_retry_at = now + delay;
        warn!(
            "⚠️  {} follow-up {:?} @ {:.2} failed (attempt {}/{}): {}. Retry in {} min",
            self.spec.symbol,
            followup.action,
            followup.price,
            followup.attempt_count,
            retry.max_attempts(),
            reason,
            delay.num_minutes()
        );
        self.followups.requeue(followup);
    }

    /// Cancel every live tracked order. Executions that raced the cancel
    /// are captured from the final order status.
    pub async fn cancel_all(&mut self, exchange: &dyn ExchangeClient) -> TradingResult<CancelSummary> {
        let mut summary = CancelSummary::default();
        let mut first_error = None;

        for order_id in self.open_order_ids() {
            match exchange.cancel_order(&self.spec.symbol, &order_id).await {
                Ok(()) => summary.canceled += 1,
                Err(ExchangeError::NotFound(_)) => {
                    self.orders.remove(&order_id);
                    self.unlink_level(&order_id);
                    continue;
                }
                Err(ExchangeError::Rejected(_)) => {}
                Err(e) => {
                    warn!("⚠️  Cancel of {} {} failed: {}", self.spec.symbol, order_id, e);
                    first_error.get_or_insert(e);
                    continue;
                }
            }

            match exchange.get_order_status(&self.spec.symbol, &order_id).await {
                Ok(remote) => {
                    if let Some(fill) = self.settle_cancelled(&order_id, &remote) {
                        self.unreported.push(fill);
                        summary.fills += 1;
                    }
                }
                Err(e) => {
                    debug!("{} final status for {} unavailable: {}", self.spec.symbol, order_id, e);
                    self.orders.remove(&order_id);
                    self.unlink_level(&order_id);
                }
            }
        }

        self.followups.clear();
        debug!("{} cancel_all: {} canceled", self.spec.symbol, summary.canceled);
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(summary),
        }
    }

    /// Record any execution and forget the order. A full fill during
    /// teardown does not queue a follow-up.
    fn settle_cancelled(&mut self, order_id: &str, remote: &ExchangeOrder) -> Option<FillEvent> {
        let mut record = self.orders.remove(order_id)?;
        self.unlink_level(order_id);
        let delta = record.apply_fill(remote.executed_quantity);
        if delta <= 0.0 {
            return None;
        }
        self.apply_inventory(record.side, delta);
        Some(FillEvent {
            order_id: order_id.to_string(),
            symbol: self.spec.symbol.clone(),
            side: record.side,
            price: remote.avg_fill_price.unwrap_or(record.price),
            quantity: delta,
            complete: true,
        })
    }

    /// Accept a new spec. On a symbol or capital change every order for the
    /// old symbol is cancelled first; if any cancel fails the new spec is
    /// refused and the engine is left as it was.
    pub async fn reinitialize(
        &mut self,
        spec: GridSpec,
        exchange: &dyn ExchangeClient,
        notifier: &dyn NotificationSink,
    ) -> TradingResult<CancelSummary> {
        if !self.spec.conflicts_with(&spec) {
            self.spec = spec;
            return Ok(CancelSummary::default());
        }

        warn!(
            "⚠️  {} configuration changed ({} ${:.2} -> {} ${:.2}), cancelling old orders",
            self.spec.symbol, self.spec.symbol, self.spec.capital, spec.symbol, spec.capital
        );

        let mut summary = self.cancel_all(exchange).await.map_err(|e| {
            TradingError::ConfigMismatch(format!("{}: tracked orders could not be cancelled: {}", self.spec.symbol, e))
        })?;

        // Orders this engine lost track of still lock capital on the exchange
        let leftovers = exchange.get_open_orders(Some(&self.spec.symbol)).await?;
        for order in leftovers {
            match exchange.cancel_order(&order.symbol, &order.order_id).await {
                Ok(()) => summary.canceled += 1,
                Err(ExchangeError::NotFound(_)) => {}
                Err(e) => {
                    return Err(TradingError::ConfigMismatch(format!(
                        "{}: order {} could not be cancelled: {}",
                        self.spec.symbol, order.order_id, e
                    )));
                }
            }
        }

        if spec.symbol != self.spec.symbol {
            if self.inventory > 0.0 {
                notifier.send(
                    &format!(
                        "{} grid reassigned to {}; {:.8} {} still held and no longer managed",
                        self.spec.symbol, spec.symbol, self.inventory, self.spec.symbol
                    ),
                    true,
                );
            }
            self.inventory = 0.0;
            self.symbol_info = None;
        }

        self.spec = spec;
        self.levels.clear();
        self.followups.clear();
        self.orders.clear();
        self.halted = None;
        self.initialized = false;
        info!("🔄 {} engine reset, {} orders cancelled", self.spec.symbol, summary.canceled);
        Ok(summary)
    }

    /// Tear down and rebuild around new bounds (GRID entry, rebalance).
    /// A halted engine is left untouched: only a restart clears the halt.
    pub async fn rebuild(
        &mut self,
        spec: GridSpec,
        exchange: &dyn ExchangeClient,
        risk: &mut dyn PreTradeCheck,
        notifier: &dyn NotificationSink,
        current_price: f64,
        now: DateTime<Utc>,
    ) -> TradingResult<(CancelSummary, usize)> {
        if let Some(reason) = &self.halted {
            warn!("⚠️  {} is halted ({}), not rebuilding", self.spec.symbol, reason);
            return Ok((CancelSummary::default(), 0));
        }

        let mut summary = self.reinitialize(spec.clone(), exchange, notifier).await?;
        let teardown = self.cancel_all(exchange).await?;
        summary.canceled += teardown.canceled;
        summary.fills += teardown.fills;
        self.spec = spec;
        let placed = self.initialize(exchange, risk, current_price, now).await?;
        Ok((summary, placed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_prices_are_evenly_spaced() {
        let prices = compute_grid_prices(95_000.0, 105_000.0, 4);
        assert_eq!(prices, vec![95_000.0, 97_500.0, 100_000.0, 102_500.0, 105_000.0]);

        for count in [1usize, 3, 7, 20] {
            let prices = compute_grid_prices(0.5, 0.9, count);
            assert_eq!(prices.len(), count + 1);
            let spacing = 0.4 / count as f64;
            for pair in prices.windows(2) {
                assert!(pair[1] > pair[0]);
                assert!((pair[1] - pair[0] - spacing).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_invalid_bounds_give_no_levels() {
        assert!(compute_grid_prices(100.0, 100.0, 5).is_empty());
        assert!(compute_grid_prices(100.0, 90.0, 5).is_empty());
        assert!(compute_grid_prices(90.0, 100.0, 0).is_empty());
    }

    #[test]
    fn test_spec_conflicts() {
        let spec = GridSpec {
            symbol: "XBTUSD".to_string(),
            capital: 500.0,
            grid_count: 4,
            lower_bound: 95_000.0,
            upper_bound: 105_000.0,
        };
        let mut moved = spec.clone();
        moved.lower_bound = 90_000.0;
        assert!(!spec.conflicts_with(&moved));

        let mut bigger = spec.clone();
        bigger.capital = 800.0;
        assert!(spec.conflicts_with(&bigger));
    }
}
