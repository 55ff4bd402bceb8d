// Strategy instance: one virtual capital slice running the HOLD / GRID /
// CASH state machine over its own symbols
//
// Shares the exchange client and notifier with every other instance;
// owns its mode manager, risk guard, stops, engines and capital ledger.

use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::constraints::AllocationConstraints;
use super::grid_engine::{EngineParams, GridOrderEngine, GridSpec};
use super::mode_manager::{ModeDecision, ModeManager, ModeTransition};
use super::persistence::{read_state, state_path, write_atomic, InstanceState, LedgerRecord, SymbolRecord};
use super::risk_guard::{OrderIntent, PreTradeCheck, RiskContext, RiskGate, RiskGuard, RiskVerdict};
use super::stop_loss::{StopLossManager, StopType};
use super::stop_loss_executor::StopLossExecutor;
use crate::collaborators::{CapitalAllocator, PercentRange, RangeCalculator};
use crate::config::{Config, InstanceConfig, StopLossConfig};
use crate::error::{TradingError, TradingResult};
use crate::exchange::{ExchangeClient, OrderRequest};
use crate::notify::{Muted, NotificationSink};
use crate::types::{FillEvent, RegimeSignal, Side, TradingMode};

/// Per-symbol position: a grid engine while in GRID, a held quantity
/// (with its stop) while in HOLD, nothing once CASH has sold out.
pub struct SymbolState {
    pub mode: TradingMode,
    pub engine: Option<GridOrderEngine>,
    pub held_quantity: f64,
    pub entry_price: Option<f64>,
    pub stop_loss_id: Option<String>,
    pub allocation_usd: f64,
    pub stopped_out: bool,
    /// A CASH exit exhausted its retries and the operator was alerted;
    /// cleared once the exit goes through. Not persisted.
    pub cash_exit_failed: bool,
}

impl SymbolState {
    fn new(mode: TradingMode, allocation_usd: f64) -> Self {
        Self {
            mode,
            engine: None,
            held_quantity: 0.0,
            entry_price: None,
            stop_loss_id: None,
            allocation_usd,
            stopped_out: false,
            cash_exit_failed: false,
        }
    }

    /// Base units owned, whether held directly or as grid inventory
    pub fn total_quantity(&self) -> f64 {
        self.held_quantity + self.engine.as_ref().map_or(0.0, |e| e.inventory())
    }

    /// Market value held plus quote reserved by resting BUYs
    pub fn exposure(&self, price: f64) -> f64 {
        self.total_quantity() * price + self.engine.as_ref().map_or(0.0, |e| e.committed_quote())
    }

    /// Capital actually deployed in the given mode
    fn realized_allocation(&self, mode: TradingMode, price: f64) -> f64 {
        match mode {
            TradingMode::Grid => self.engine.as_ref().map_or(self.allocation_usd, |e| e.spec().capital),
            TradingMode::Hold => self.held_quantity * price,
            TradingMode::Cash => 0.0,
        }
    }

    fn to_record(&self) -> SymbolRecord {
        SymbolRecord {
            mode: self.mode,
            engine: self.engine.as_ref().map(|e| e.to_state()),
            held_quantity: self.held_quantity,
            entry_price: self.entry_price,
            stop_loss_id: self.stop_loss_id.clone(),
            allocation_usd: self.allocation_usd,
            stopped_out: self.stopped_out,
        }
    }
}

/// Virtual cash account of one instance. Fills move value between cash
/// and the per-symbol holdings; equity is cash plus holdings at market.
#[derive(Debug, Clone, PartialEq)]
pub struct CapitalLedger {
    pub starting_capital: f64,
    pub cash: f64,
    pub fees_paid: f64,
    pub day_start_equity: Option<f64>,
    pub day: Option<NaiveDate>,
}

impl CapitalLedger {
    pub fn new(capital: f64) -> Self {
        Self {
            starting_capital: capital,
            cash: capital,
            fees_paid: 0.0,
            day_start_equity: None,
            day: None,
        }
    }

    pub fn from_record(record: LedgerRecord) -> Self {
        Self {
            starting_capital: record.starting_capital,
            cash: record.cash,
            fees_paid: record.fees_paid,
            day_start_equity: record.day_start_equity,
            day: record.day,
        }
    }

    pub fn to_record(&self) -> LedgerRecord {
        LedgerRecord {
            starting_capital: self.starting_capital,
            cash: self.cash,
            fees_paid: self.fees_paid,
            day_start_equity: self.day_start_equity,
            day: self.day,
        }
    }

    /// BUY fees are paid in base (the received quantity is already net),
    /// SELL fees in quote.
    pub fn record_fill(&mut self, fill: &FillEvent, fee_rate: f64) {
        let notional = fill.notional();
        match fill.side {
            Side::Buy => self.cash -= notional,
            Side::Sell => self.cash += notional * (1.0 - fee_rate),
        }
        self.fees_paid += notional * fee_rate;
    }

    pub fn equity(&self, symbols: &BTreeMap<String, SymbolState>, prices: &HashMap<String, f64>) -> f64 {
        self.cash
            + symbols
                .iter()
                .filter_map(|(symbol, state)| prices.get(symbol).map(|p| state.total_quantity() * p))
                .sum::<f64>()
    }

    /// Start a new trading day on the first observation after midnight UTC
    pub fn roll_day(&mut self, now: DateTime<Utc>, equity: f64) -> bool {
        let today = now.date_naive();
        if self.day == Some(today) {
            return false;
        }
        self.day = Some(today);
        self.day_start_equity = Some(equity);
        true
    }

    pub fn pnl(&self, equity: f64) -> f64 {
        equity - self.starting_capital
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstanceStatus {
    Running,
    Halted(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Continue,
    Halted(String),
    /// Catastrophic move: every instance must stop
    GlobalHalt(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebalanceDirection {
    Increase,
    Decrease,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RebalanceAction {
    pub symbol: String,
    pub direction: RebalanceDirection,
    pub from_usd: f64,
    pub to_usd: f64,
}

/// Shared services handed to every instance
#[derive(Clone)]
pub struct InstanceDeps {
    pub exchange: Arc<dyn ExchangeClient>,
    pub notifier: Arc<dyn NotificationSink>,
    pub ranges: Arc<dyn RangeCalculator>,
    pub allocator: Arc<dyn CapitalAllocator>,
}

/// Resolved per-instance settings (instance overrides applied)
#[derive(Debug, Clone)]
pub struct InstanceSettings {
    pub grid_count: usize,
    pub engine: EngineParams,
    pub stop_loss: StopLossConfig,
    pub tick_interval: Duration,
    pub max_consecutive_errors: u32,
    pub max_backoff: Duration,
    pub rebalance_drift_pct: f64,
}

impl InstanceSettings {
    pub fn from_config(config: &Config, instance: &InstanceConfig) -> Self {
        Self {
            grid_count: instance.grid_count.unwrap_or(config.grid.grid_count),
            engine: EngineParams::from_config(&config.grid),
            stop_loss: config.stop_loss.clone(),
            tick_interval: config.tick_interval(),
            max_consecutive_errors: config.orchestrator.max_consecutive_errors,
            max_backoff: Duration::from_secs(config.orchestrator.max_backoff_secs),
            rebalance_drift_pct: config.orchestrator.rebalance_drift_pct,
        }
    }

    fn fee_rate(&self) -> f64 {
        self.engine.fee_rate
    }
}

pub struct StrategyInstance {
    config: InstanceConfig,
    settings: InstanceSettings,
    deps: InstanceDeps,
    ranges: Arc<dyn RangeCalculator>,
    mode_manager: ModeManager,
    risk_guard: RiskGuard,
    stop_losses: StopLossManager,
    stop_executor: StopLossExecutor,
    symbols: BTreeMap<String, SymbolState>,
    ledger: CapitalLedger,
    status: InstanceStatus,
    consecutive_errors: u32,
    state_path: PathBuf,
    last_rebalance: Option<DateTime<Utc>>,
    /// Set when startup could not reconcile every saved symbol; the saved
    /// file then stays the only complete record and is never overwritten
    restore_incomplete: bool,
}

impl StrategyInstance {
    pub fn new(
        instance: InstanceConfig,
        config: &Config,
        deps: InstanceDeps,
        state_dir: impl AsRef<Path>,
        now: DateTime<Utc>,
    ) -> Self {
        let settings = InstanceSettings::from_config(config, &instance);
        let ranges: Arc<dyn RangeCalculator> = match instance.range_pct {
            Some(pct) => Arc::new(PercentRange::new(pct)),
            None => deps.ranges.clone(),
        };
        let mode_manager = ModeManager::new(&config.mode, now);
        let initial_mode = mode_manager.current_mode();
        let targets = deps.allocator.allocate(&instance, instance.capital, &mode_manager.constraints());
        let symbols = instance
            .symbols
            .iter()
            .map(|s| (s.clone(), SymbolState::new(initial_mode, targets.get(s).copied().unwrap_or(0.0))))
            .collect();

        Self {
            state_path: state_path(state_dir, &instance.id),
            risk_guard: RiskGuard::new(&config.risk, instance.bypass_drawdown_check),
            stop_losses: StopLossManager::new(config.stop_loss.max_daily_drawdown_pct),
            stop_executor: StopLossExecutor::from_config(&config.stop_loss),
            ledger: CapitalLedger::new(instance.capital),
            config: instance,
            settings,
            deps,
            ranges,
            mode_manager,
            symbols,
            status: InstanceStatus::Running,
            consecutive_errors: 0,
            last_rebalance: None,
            restore_incomplete: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    pub fn status(&self) -> &InstanceStatus {
        &self.status
    }

    pub fn is_halted(&self) -> bool {
        matches!(self.status, InstanceStatus::Halted(_))
    }

    pub fn mode(&self) -> TradingMode {
        self.mode_manager.current_mode()
    }

    pub fn mode_manager(&self) -> &ModeManager {
        &self.mode_manager
    }

    pub fn symbols(&self) -> &BTreeMap<String, SymbolState> {
        &self.symbols
    }

    pub fn ledger(&self) -> &CapitalLedger {
        &self.ledger
    }

    pub fn stop_losses(&self) -> &StopLossManager {
        &self.stop_losses
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn last_rebalance(&self) -> Option<DateTime<Utc>> {
        self.last_rebalance
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Every exchange order id this instance is tracking
    pub fn referenced_order_ids(&self) -> HashSet<String> {
        self.symbols
            .values()
            .filter_map(|s| s.engine.as_ref())
            .flat_map(|e| e.open_order_ids())
            .collect()
    }

    /// Load persisted state and reconcile it with the exchange. Corrupt
    /// state is reported and replaced by an empty start.
    pub async fn startup(&mut self, now: DateTime<Utc>) -> TradingResult<()> {
        match read_state::<InstanceState>(&self.state_path) {
            Ok(Some(state)) => self.restore(state, now).await?,
            Ok(None) => info!("🆕 [{}] No saved state, starting fresh", self.config.id),
            Err(TradingError::StateCorruption(detail)) => {
                error!("❌ [{}] Saved state unreadable: {}", self.config.id, detail);
                self.deps.notifier.send(
                    &format!(
                        "{}: saved state is corrupt ({}); starting with no tracked orders. Check the exchange for leftovers",
                        self.config.id, detail
                    ),
                    true,
                );
            }
            Err(e) => return Err(e),
        }
        self.persist(now)
    }

    async fn restore(&mut self, state: InstanceState, now: DateTime<Utc>) -> TradingResult<()> {
        let exchange = self.deps.exchange.clone();
        let notifier = self.deps.notifier.clone();

        let mode_config = self.mode_manager.config().clone();
        self.mode_manager = ModeManager::from_state(&mode_config, state.mode);
        self.stop_losses = state.stop_losses;
        self.last_rebalance = state.last_rebalance;
        self.ledger = CapitalLedger::from_record(state.ledger);
        if let Some(reason) = state.halted {
            warn!("⚠️  [{}] Was halted before restart ({}), resuming", self.config.id, reason);
        }

        let configured: HashSet<&String> = self.config.symbols.iter().collect();
        let saved: HashSet<&String> = state.symbols.keys().collect();
        let capital_changed = (self.ledger.starting_capital - self.config.capital).abs() > 1e-9;
        let config_changed = capital_changed || configured != saved;
        if capital_changed {
            warn!(
                "⚠️  [{}] Capital changed ${:.2} -> ${:.2}, adjusting cash",
                self.config.id, self.ledger.starting_capital, self.config.capital
            );
            self.ledger.cash += self.config.capital - self.ledger.starting_capital;
            self.ledger.starting_capital = self.config.capital;
        }

        let fresh = self
            .deps
            .allocator
            .allocate(&self.config, self.config.capital, &self.mode_manager.constraints());
        let params = self.settings.engine.clone();
        let fee_rate = self.settings.fee_rate();
        let mut first_error = None;

        for (symbol, record) in state.symbols {
            let Some(current) = self.symbols.get_mut(&symbol) else {
                Self::release_removed(&self.config.id, &symbol, record, &*exchange, &*notifier, params.clone()).await;
                continue;
            };

            current.held_quantity = record.held_quantity;
            current.entry_price = record.entry_price;
            current.stop_loss_id = record.stop_loss_id;
            current.stopped_out = record.stopped_out;
            current.allocation_usd = if config_changed {
                fresh.get(&symbol).copied().unwrap_or(0.0)
            } else {
                record.allocation_usd
            };

            let Some(engine_state) = record.engine else { continue };
            let mut engine = GridOrderEngine::from_state(engine_state, params.clone());
            let desired = GridSpec { capital: current.allocation_usd, ..engine.spec().clone() };

            let result = if engine.spec().conflicts_with(&desired) {
                engine.reinitialize(desired, &*exchange, &*notifier).await.map(|_| 0)
            } else {
                engine.recover(&*exchange, now).await
            };
            for fill in engine.take_fills() {
                self.ledger.record_fill(&fill, fee_rate);
            }
            // Kept even when unreconciled so its orders stay referenced
            current.engine = Some(engine);
            if let Err(e) = result {
                warn!("⚠️  [{}] {} could not be reconciled: {}", self.config.id, symbol, e);
                first_error.get_or_insert(e);
            }
        }

        let mode = self.mode_manager.current_mode();
        for state in self.symbols.values_mut() {
            state.mode = mode;
        }

        info!(
            "♻️  [{}] Restored: mode {}, {} symbols, cash ${:.2}, {} stops",
            self.config.id,
            mode,
            self.symbols.len(),
            self.ledger.cash,
            self.stop_losses.len()
        );

        match first_error {
            Some(e) => {
                self.restore_incomplete = true;
                Err(e)
            }
            None => Ok(()),
        }
    }

    /// A symbol dropped from the configuration: cancel what it left on
    /// the exchange and tell the operator about anything still held.
    async fn release_removed(
        instance_id: &str,
        symbol: &str,
        record: SymbolRecord,
        exchange: &dyn ExchangeClient,
        notifier: &dyn NotificationSink,
        params: EngineParams,
    ) {
        let mut held = record.held_quantity;
        if let Some(engine_state) = record.engine {
            let mut engine = GridOrderEngine::from_state(engine_state, params);
            if let Err(e) = engine.cancel_all(exchange).await {
                warn!("⚠️  [{}] Could not cancel orders of removed symbol {}: {}", instance_id, symbol, e);
            }
            held += engine.inventory();
        }
        warn!("⚠️  [{}] {} is no longer configured", instance_id, symbol);
        if held > 0.0 {
            notifier.send(
                &format!(
                    "{}: {} removed from configuration with {:.8} still held and no longer managed",
                    instance_id, symbol, held
                ),
                true,
            );
        }
    }

    /// Delay before the next tick: the tick interval, doubled per
    /// consecutive error up to the configured ceiling
    pub fn next_delay(&self) -> Duration {
        if self.consecutive_errors == 0 {
            return self.settings.tick_interval;
        }
        let exponent = (self.consecutive_errors - 1).min(16);
        self.settings
            .tick_interval
            .saturating_mul(1u32 << exponent)
            .min(self.settings.max_backoff)
    }

    /// One tick with error accounting. State is persisted afterwards
    /// whatever the result.
    pub async fn run_tick(&mut self, now: DateTime<Utc>) -> TickOutcome {
        if let InstanceStatus::Halted(reason) = &self.status {
            return TickOutcome::Halted(reason.clone());
        }

        let outcome = match self.tick(now).await {
            Ok(()) => {
                if self.consecutive_errors > 0 {
                    info!("✅ [{}] Recovered after {} failed ticks", self.config.id, self.consecutive_errors);
                }
                self.consecutive_errors = 0;
                TickOutcome::Continue
            }
            Err(TradingError::CircuitBreakerTripped(reason)) => {
                let catastrophic = self.risk_guard.is_catastrophic();
                self.halt(&format!("circuit breaker: {}", reason)).await;
                if catastrophic {
                    TickOutcome::GlobalHalt(reason)
                } else {
                    TickOutcome::Halted(reason)
                }
            }
            Err(e) => {
                self.consecutive_errors += 1;
                error!(
                    "❌ [{}] Tick failed ({}/{}, {}): {}",
                    self.config.id,
                    self.consecutive_errors,
                    self.settings.max_consecutive_errors,
                    e.category(),
                    e
                );
                if self.consecutive_errors >= self.settings.max_consecutive_errors {
                    let limit = TradingError::ConsecutiveErrorLimit(self.config.id.clone(), self.consecutive_errors);
                    self.halt(&limit.to_string()).await;
                    TickOutcome::Halted(limit.to_string())
                } else {
                    TickOutcome::Continue
                }
            }
        };

        if let Err(e) = self.persist(now) {
            error!("❌ [{}] Failed to persist state: {}", self.config.id, e);
        }
        outcome
    }

    /// Prices, circuit breaker, day roll, then the mode's per-symbol work
    pub async fn tick(&mut self, now: DateTime<Utc>) -> TradingResult<()> {
        let prices = self.fetch_prices().await?;

        for (symbol, price) in &prices {
            if let RiskVerdict::Halt { reason, .. } = self.risk_guard.check_price_move(symbol, *price) {
                return Err(TradingError::CircuitBreakerTripped(reason));
            }
        }

        let equity = self.ledger.equity(&self.symbols, &prices);
        if self.ledger.roll_day(now, equity) {
            debug!("[{}] New trading day, start equity ${:.2}", self.config.id, equity);
            self.stop_losses.reset_daily(equity);
        }

        self.dispatch(&prices, now).await
    }

    async fn fetch_prices(&self) -> TradingResult<HashMap<String, f64>> {
        let mut prices = HashMap::with_capacity(self.symbols.len());
        for symbol in self.symbols.keys() {
            let price = self.deps.exchange.get_price(symbol).await?;
            prices.insert(symbol.clone(), price);
        }
        Ok(prices)
    }

    fn risk_context(&self, prices: &HashMap<String, f64>, constraints: AllocationConstraints) -> RiskContext {
        let symbol_exposure: HashMap<String, f64> = self
            .symbols
            .iter()
            .map(|(symbol, state)| {
                let price = prices.get(symbol).copied().unwrap_or(0.0);
                (symbol.clone(), state.exposure(price))
            })
            .collect();
        let equity = self.ledger.equity(&self.symbols, prices);

        RiskContext {
            total_capital: if equity > 0.0 { equity } else { self.config.capital },
            equity: Some(equity),
            day_start_equity: self.ledger.day_start_equity,
            invested: symbol_exposure.values().sum(),
            symbol_exposure,
            position_caps: self.symbols.iter().map(|(s, st)| (s.clone(), st.allocation_usd)).collect(),
            categories: self.config.categories.clone(),
            market_prices: prices.clone(),
            constraints,
        }
    }

    /// Run the current mode's handler for every symbol. A circuit breaker
    /// stops the loop at once; other errors let the remaining symbols run.
    async fn dispatch(&mut self, prices: &HashMap<String, f64>, now: DateTime<Utc>) -> TradingResult<()> {
        let mode = self.mode_manager.current_mode();
        let constraints = self.mode_manager.constraints();
        let ctx = self.risk_context(prices, constraints.clone());
        let exchange = self.deps.exchange.clone();
        let notifier = self.deps.notifier.clone();
        let ranges = self.ranges.clone();

        let mut env = TickEnv {
            exchange: &*exchange,
            notifier: &*notifier,
            ranges: &*ranges,
            gate: RiskGate::new(&mut self.risk_guard, ctx),
            ledger: &mut self.ledger,
            stops: &mut self.stop_losses,
            executor: &self.stop_executor,
            settings: &self.settings,
            constraints,
            now,
        };

        let mut first_error = None;
        for (symbol, state) in self.symbols.iter_mut() {
            let Some(&price) = prices.get(symbol) else { continue };
            let result = match mode {
                TradingMode::Grid => env.run_grid(symbol, state, price).await,
                TradingMode::Hold => env.run_hold(symbol, state, price).await,
                TradingMode::Cash => env.run_cash(symbol, state, price).await,
            };
            state.mode = mode;

            match result {
                Ok(()) => {}
                Err(e @ TradingError::CircuitBreakerTripped(_)) => return Err(e),
                Err(e) => {
                    warn!("⚠️  [{}] {} {} handler failed: {}", self.config.id, symbol, mode, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Ask the mode manager for a decision and carry out any transition
    pub async fn evaluate_mode(
        &mut self,
        signal: Option<RegimeSignal>,
        now: DateTime<Utc>,
    ) -> TradingResult<Option<ModeTransition>> {
        if self.is_halted() {
            return Ok(None);
        }

        let transition = match self.mode_manager.evaluate(signal, now) {
            ModeDecision::Stay { reason } => {
                debug!("[{}] Staying in {}: {}", self.config.id, self.mode(), reason);
                return Ok(None);
            }
            ModeDecision::Switch(transition) => transition,
        };

        if transition.is_noop() {
            info!("🔒 [{}] {} ({}), no side effects", self.config.id, transition.to, transition.reason);
            self.persist(now)?;
            return Ok(Some(transition));
        }

        let result = self.apply_transition(&transition, now).await;
        self.persist(now)?;
        result.map(|_| Some(transition))
    }

    /// Side effects of a mode change. The handlers do the per-pair work:
    /// GRID entry cancels HOLD stops and seeds the grid with the held
    /// quantity, HOLD entry tears grids down into a held position, CASH
    /// tightens stops and sells out.
    async fn apply_transition(&mut self, transition: &ModeTransition, now: DateTime<Utc>) -> TradingResult<()> {
        let message = format!(
            "{}: mode {} -> {} ({}){}",
            self.config.id,
            transition.from,
            transition.to,
            transition.reason,
            if transition.safety_lock { ", SAFETY LOCK engaged" } else { "" }
        );
        self.deps.notifier.send(&message, transition.safety_lock || transition.emergency);

        let prices = self.fetch_prices().await?;
        let equity = self.ledger.equity(&self.symbols, &prices);
        let targets = self
            .deps
            .allocator
            .allocate(&self.config, equity, &self.mode_manager.constraints());

        for (symbol, state) in self.symbols.iter_mut() {
            state.stopped_out = false;
            state.cash_exit_failed = false;
            state.allocation_usd = targets.get(symbol).copied().unwrap_or(0.0);
        }

        self.dispatch(&prices, now).await
    }

    /// Stop-loss cycle: move every active stop with the market and sell
    /// the ones that were crossed. Returns the number of positions closed.
    pub async fn run_stop_losses(&mut self, now: DateTime<Utc>) -> TradingResult<usize> {
        if self.is_halted() || self.stop_losses.active_stops().next().is_none() {
            return Ok(0);
        }

        let mut prices = HashMap::new();
        for symbol in self.stop_losses.active_symbols() {
            match self.deps.exchange.get_price(&symbol).await {
                Ok(price) => {
                    prices.insert(symbol, price);
                }
                Err(e) => warn!("⚠️  [{}] No price for stop on {}: {}", self.config.id, symbol, e),
            }
        }

        let fee_rate = self.settings.fee_rate();
        let mut closed = 0;
        let mut first_error = None;

        for id in self.stop_losses.update_all(&prices, None) {
            let Some(stop) = self.stop_losses.get(&id).cloned() else { continue };
            let Some(state) = self.symbols.get_mut(&stop.symbol) else {
                self.stop_losses.cancel_stop(&id);
                continue;
            };

            let quantity = if state.held_quantity > 0.0 { state.held_quantity } else { stop.quantity };
            let reason = format!("stop {:.8} crossed", stop.stop_price);
            match self
                .stop_executor
                .execute_sell(&*self.deps.exchange, &*self.deps.notifier, &stop.symbol, quantity, &reason)
                .await
            {
                Ok(outcome) => {
                    if let Some(stop) = self.stop_losses.get_mut(&id) {
                        stop.confirm_trigger();
                    }
                    if !outcome.is_empty() {
                        self.ledger.record_fill(
                            &FillEvent {
                                order_id: id.clone(),
                                symbol: stop.symbol.clone(),
                                side: Side::Sell,
                                price: outcome.price,
                                quantity: outcome.quantity,
                                complete: true,
                            },
                            fee_rate,
                        );
                    }
                    state.held_quantity = 0.0;
                    state.entry_price = None;
                    state.stop_loss_id = None;
                    state.stopped_out = true;
                    closed += 1;
                    self.deps.notifier.send(
                        &format!(
                            "{}: stop-loss closed {} ({:.8} @ {:.8})",
                            self.config.id, stop.symbol, outcome.quantity, outcome.price
                        ),
                        false,
                    );
                }
                Err(e) => {
                    if let Some(stop) = self.stop_losses.get_mut(&id) {
                        stop.reactivate();
                    }
                    warn!("⚠️  [{}] Stop on {} re-armed after failed sell", self.config.id, stop.symbol);
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Ok(all_prices) = self.fetch_prices().await {
            let equity = self.ledger.equity(&self.symbols, &all_prices);
            let was_stopped = self.stop_losses.is_portfolio_stopped();
            if let Some(reason) = self.stop_losses.check_portfolio_drawdown(equity) {
                if !was_stopped {
                    self.deps.notifier.send(&format!("{}: {}, no new HOLD entries today", self.config.id, reason), true);
                }
            }
        }

        self.stop_losses.prune_inactive();
        self.persist(now)?;
        match first_error {
            Some(e) => Err(e),
            None => Ok(closed),
        }
    }

    /// Compare realized with target allocations and correct symbols that
    /// drifted by more than the threshold (percent of equity)
    pub async fn check_rebalance(&mut self, now: DateTime<Utc>) -> TradingResult<Vec<RebalanceAction>> {
        if self.is_halted() {
            return Ok(Vec::new());
        }

        let mode = self.mode_manager.current_mode();
        if mode == TradingMode::Cash {
            self.last_rebalance = Some(now);
            return Ok(Vec::new());
        }

        let prices = self.fetch_prices().await?;
        let equity = self.ledger.equity(&self.symbols, &prices);
        if equity <= 0.0 {
            return Ok(Vec::new());
        }
        let constraints = self.mode_manager.constraints();
        let targets = self.deps.allocator.allocate(&self.config, equity, &constraints);

        let actions: Vec<RebalanceAction> = self
            .symbols
            .iter()
            .filter(|(symbol, state)| match state.engine.as_ref().and_then(|e| e.halted()) {
                Some(reason) => {
                    debug!("[{}] {} halted ({}), left out of the rebalance", self.config.id, symbol, reason);
                    false
                }
                None => true,
            })
            .filter_map(|(symbol, state)| {
                let price = *prices.get(symbol)?;
                let target = *targets.get(symbol)?;
                let realized = state.realized_allocation(mode, price);
                let drift_pct = (target - realized).abs() / equity * 100.0;
                (drift_pct > self.settings.rebalance_drift_pct).then(|| RebalanceAction {
                    symbol: symbol.clone(),
                    direction: if target > realized { RebalanceDirection::Increase } else { RebalanceDirection::Decrease },
                    from_usd: realized,
                    to_usd: target,
                })
            })
            .collect();

        let mut first_error = None;
        if !actions.is_empty() {
            let ctx = self.risk_context(&prices, constraints.clone());
            let exchange = self.deps.exchange.clone();
            let notifier = self.deps.notifier.clone();
            let ranges = self.ranges.clone();
            let mut env = TickEnv {
                exchange: &*exchange,
                notifier: &*notifier,
                ranges: &*ranges,
                gate: RiskGate::new(&mut self.risk_guard, ctx),
                ledger: &mut self.ledger,
                stops: &mut self.stop_losses,
                executor: &self.stop_executor,
                settings: &self.settings,
                constraints,
                now,
            };

            for action in &actions {
                let (Some(state), Some(&price)) = (self.symbols.get_mut(&action.symbol), prices.get(&action.symbol)) else {
                    continue;
                };
                info!(
                    "⚖️  [{}] Rebalancing {} ${:.2} -> ${:.2}",
                    self.config.id, action.symbol, action.from_usd, action.to_usd
                );
                state.allocation_usd = action.to_usd;
                if let Err(e) = env.rebalance(&action.symbol, state, price, mode, action).await {
                    warn!("⚠️  [{}] Rebalance of {} failed: {}", self.config.id, action.symbol, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        self.last_rebalance = Some(now);
        self.persist(now)?;
        match first_error {
            Some(e) => Err(e),
            None => Ok(actions),
        }
    }

    /// Stop trading: cancel every grid order and alert. Held positions
    /// stay untouched for the operator.
    pub async fn halt(&mut self, reason: &str) {
        if self.is_halted() {
            return;
        }
        error!("🛑 [{}] Halting: {}", self.config.id, reason);
        self.status = InstanceStatus::Halted(reason.to_string());

        if self.restore_incomplete {
            self.deps.notifier.send(
                &format!(
                    "{} halted: {}. Saved state was not fully reconciled; orders left in place and the state file kept. Restart once the exchange is reachable",
                    self.config.id, reason
                ),
                true,
            );
            return;
        }

        let fee_rate = self.settings.fee_rate();
        for (symbol, state) in self.symbols.iter_mut() {
            let Some(engine) = state.engine.as_mut() else { continue };
            if let Err(e) = engine.cancel_all(&*self.deps.exchange).await {
                warn!("⚠️  [{}] Could not cancel {} orders while halting: {}", self.config.id, symbol, e);
            }
            for fill in engine.take_fills() {
                self.ledger.record_fill(&fill, fee_rate);
            }
        }

        self.deps.notifier.send(
            &format!("{} halted: {}. Open orders cancelled; fix the cause and restart", self.config.id, reason),
            true,
        );
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> InstanceState {
        InstanceState {
            instance_id: self.config.id.clone(),
            saved_at: now,
            mode: self.mode_manager.state().clone(),
            symbols: self.symbols.iter().map(|(s, st)| (s.clone(), st.to_record())).collect(),
            ledger: self.ledger.to_record(),
            stop_losses: self.stop_losses.clone(),
            halted: match &self.status {
                InstanceStatus::Halted(reason) => Some(reason.clone()),
                InstanceStatus::Running => None,
            },
            last_rebalance: self.last_rebalance,
        }
    }

    pub fn persist(&self, now: DateTime<Utc>) -> TradingResult<()> {
        if self.restore_incomplete {
            warn!("⚠️  [{}] Restore incomplete, keeping the saved state file", self.config.id);
            return Ok(());
        }
        write_atomic(&self.state_path, &self.snapshot(now))
    }
}

/// Borrowed view of one instance for a single dispatch pass
struct TickEnv<'a> {
    exchange: &'a dyn ExchangeClient,
    notifier: &'a dyn NotificationSink,
    ranges: &'a dyn RangeCalculator,
    gate: RiskGate<'a>,
    ledger: &'a mut CapitalLedger,
    stops: &'a mut StopLossManager,
    executor: &'a StopLossExecutor,
    settings: &'a InstanceSettings,
    constraints: AllocationConstraints,
    now: DateTime<Utc>,
}

impl TickEnv<'_> {
    fn book(&mut self, fills: &[FillEvent]) {
        for fill in fills {
            self.ledger.record_fill(fill, self.settings.fee_rate());
        }
    }

    async fn run_grid(&mut self, symbol: &str, state: &mut SymbolState, price: f64) -> TradingResult<()> {
        if let Some(stop_id) = state.stop_loss_id.take() {
            self.stops.cancel_stop(&stop_id);
        }

        let (lower, upper) = self.ranges.bounds(symbol, price);
        if state.engine.is_none() {
            let spec = GridSpec {
                symbol: symbol.to_string(),
                capital: state.allocation_usd,
                grid_count: self.settings.grid_count,
                lower_bound: lower,
                upper_bound: upper,
            };
            state.engine = Some(GridOrderEngine::new(spec, self.settings.engine.clone()));
        }
        let Some(engine) = state.engine.as_mut() else { return Ok(()) };

        if !engine.is_initialized() {
            if state.held_quantity > 0.0 {
                engine.set_inventory(engine.inventory() + state.held_quantity);
                state.held_quantity = 0.0;
                state.entry_price = None;
            }
            engine.set_bounds(lower, upper);
            let result = engine.initialize(self.exchange, &mut self.gate, price, self.now).await;
            let fills = engine.take_fills();
            self.book(&fills);
            result?;
        }

        let result = engine.tick(self.exchange, &mut self.gate, self.notifier, self.now).await;
        let fills = engine.take_fills();
        self.book(&fills);
        let report = result?;
        if report.placed > 0 || report.fills > 0 {
            debug!("{} tick: {} fills, {} follow-ups placed", symbol, report.fills, report.placed);
        }
        Ok(())
    }

    /// Cancel the grid and fold its inventory into the held position
    async fn teardown_engine(&mut self, symbol: &str, state: &mut SymbolState, price: f64) -> TradingResult<()> {
        let Some(mut engine) = state.engine.take() else { return Ok(()) };
        let result = engine.cancel_all(self.exchange).await;
        let fills = engine.take_fills();
        self.book(&fills);
        if let Err(e) = result {
            state.engine = Some(engine);
            return Err(e);
        }

        if engine.inventory() > 0.0 {
            state.held_quantity += engine.inventory();
            state.entry_price = state.entry_price.or(Some(price));
            info!("📦 {} grid closed, {:.8} carried over as held", symbol, engine.inventory());
        }
        Ok(())
    }

    async fn run_hold(&mut self, symbol: &str, state: &mut SymbolState, price: f64) -> TradingResult<()> {
        self.teardown_engine(symbol, state, price).await?;

        if state.stopped_out {
            debug!("{} stopped out, waiting for the next mode change", symbol);
        } else if self.stops.is_portfolio_stopped() {
            debug!("{} HOLD entry paused by the portfolio drawdown stop", symbol);
        } else if state.held_quantity * price < self.constraints.min_position_usd {
            let usd = state.allocation_usd;
            self.market_buy(symbol, state, price, usd).await?;
        }

        self.sync_stop(symbol, state, price);
        Ok(())
    }

    async fn run_cash(&mut self, symbol: &str, state: &mut SymbolState, price: f64) -> TradingResult<()> {
        self.teardown_engine(symbol, state, price).await?;
        if state.held_quantity <= 0.0 {
            return Ok(());
        }

        if let Some(stop) = state.stop_loss_id.as_deref().and_then(|id| self.stops.get_mut(id)) {
            stop.tighten(self.settings.stop_loss.cash_tighten_pct);
        }

        // After an alerted failure, later ticks try once and stay quiet
        let retrying = state.cash_exit_failed;
        let single_attempt;
        let (executor, notifier): (&StopLossExecutor, &dyn NotificationSink) = if retrying {
            single_attempt = self.executor.single_attempt();
            (&single_attempt, &Muted)
        } else {
            (self.executor, self.notifier)
        };

        match executor
            .execute_sell(self.exchange, notifier, symbol, state.held_quantity, "CASH exit")
            .await
        {
            Ok(outcome) => {
                if retrying {
                    state.cash_exit_failed = false;
                    self.notifier
                        .send(&format!("{} CASH exit completed after earlier failures", symbol), false);
                }
                if !outcome.is_empty() {
                    self.book(&[FillEvent {
                        order_id: format!("cash-exit-{}", symbol),
                        symbol: symbol.to_string(),
                        side: Side::Sell,
                        price: outcome.price,
                        quantity: outcome.quantity,
                        complete: true,
                    }]);
                }
                let residual = (state.held_quantity - outcome.quantity).max(0.0);
                if residual * price < self.constraints.min_position_usd {
                    state.held_quantity = 0.0;
                    state.entry_price = None;
                    if let Some(id) = state.stop_loss_id.take() {
                        self.stops.cancel_stop(&id);
                    }
                    info!("💵 {} moved to cash", symbol);
                } else {
                    state.held_quantity = residual;
                    self.sync_stop(symbol, state, price);
                }
                Ok(())
            }
            Err(TradingError::StopLossExecutionFailure(detail)) => {
                if retrying {
                    debug!("{} CASH exit still failing: {}", symbol, detail);
                } else {
                    state.cash_exit_failed = true;
                    warn!("⚠️  {} CASH exit incomplete, retrying each tick: {}", symbol, detail);
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Market BUY worth `usd`, checked by the risk gate first
    async fn market_buy(&mut self, symbol: &str, state: &mut SymbolState, price: f64, usd: f64) -> TradingResult<bool> {
        let info = self.exchange.symbol_info(symbol).await?;
        let quantity = info.round_quantity(usd / price);
        if !info.meets_minimums(quantity, price) {
            warn!("⚠️  {} buy of ${:.2} below exchange minimums, skipped", symbol, usd);
            return Ok(false);
        }

        match self.gate.check(&OrderIntent::new(symbol, Side::Buy, quantity, price)) {
            RiskVerdict::Allow => {}
            RiskVerdict::Reject(reason) => {
                info!("⏭️  {} buy not placed: {}", symbol, reason);
                return Ok(false);
            }
            RiskVerdict::Halt { reason, .. } => return Err(TradingError::CircuitBreakerTripped(reason)),
        }

        let order = self.exchange.place_order(&OrderRequest::market(symbol, Side::Buy, quantity)).await?;
        let fill_price = order.avg_fill_price.unwrap_or(price);
        self.book(&[FillEvent {
            order_id: order.order_id.clone(),
            symbol: symbol.to_string(),
            side: Side::Buy,
            price: fill_price,
            quantity: order.executed_quantity,
            complete: true,
        }]);

        let received = order.executed_quantity * (1.0 - self.settings.fee_rate());
        let held = state.held_quantity;
        state.entry_price = Some(match state.entry_price {
            Some(entry) if held > 0.0 => (entry * held + fill_price * received) / (held + received),
            _ => fill_price,
        });
        state.held_quantity = held + received;
        info!("🟢 {} bought {:.8} @ {:.8} (${:.2})", symbol, received, fill_price, usd);
        Ok(true)
    }

    /// Keep exactly one active trailing stop sized to the held quantity
    fn sync_stop(&mut self, symbol: &str, state: &mut SymbolState, price: f64) {
        if state.held_quantity <= 0.0 {
            if let Some(id) = state.stop_loss_id.take() {
                self.stops.cancel_stop(&id);
            }
            return;
        }

        let held = state.held_quantity;
        let armed = state
            .stop_loss_id
            .as_deref()
            .and_then(|id| self.stops.get_mut(id))
            .filter(|stop| stop.active);
        if let Some(stop) = armed {
            stop.quantity = held;
            return;
        }

        let pct = self.settings.stop_loss.hold_trailing_pct;
        let entry = state.entry_price.unwrap_or(price);
        let id = self
            .stops
            .create_stop(symbol, entry, state.held_quantity, StopType::Trailing, pct, Some(pct));
        state.stop_loss_id = Some(id);
    }

    async fn rebalance(
        &mut self,
        symbol: &str,
        state: &mut SymbolState,
        price: f64,
        mode: TradingMode,
        action: &RebalanceAction,
    ) -> TradingResult<()> {
        match mode {
            TradingMode::Grid => {
                let Some(engine) = state.engine.as_mut() else { return Ok(()) };
                let (lower, upper) = self.ranges.bounds(symbol, price);
                let spec = GridSpec {
                    capital: action.to_usd,
                    lower_bound: lower,
                    upper_bound: upper,
                    ..engine.spec().clone()
                };
                let result = engine
                    .rebuild(spec, self.exchange, &mut self.gate, self.notifier, price, self.now)
                    .await;
                let fills = engine.take_fills();
                self.book(&fills);
                result.map(|_| ())
            }
            TradingMode::Hold => {
                if action.direction == RebalanceDirection::Increase {
                    self.market_buy(symbol, state, price, action.to_usd - action.from_usd).await?;
                } else {
                    let quantity = (action.from_usd - action.to_usd) / price;
                    let outcome = self
                        .executor
                        .execute_sell(self.exchange, self.notifier, symbol, quantity, "rebalance")
                        .await?;
                    if !outcome.is_empty() {
                        self.book(&[FillEvent {
                            order_id: format!("rebalance-{}", symbol),
                            symbol: symbol.to_string(),
                            side: Side::Sell,
                            price: outcome.price,
                            quantity: outcome.quantity,
                            complete: true,
                        }]);
                        state.held_quantity = (state.held_quantity - outcome.quantity).max(0.0);
                    }
                }
                self.sync_stop(symbol, state, price);
                Ok(())
            }
            TradingMode::Cash => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(side: Side, price: f64, quantity: f64) -> FillEvent {
        FillEvent {
            order_id: "o".to_string(),
            symbol: "XBTUSD".to_string(),
            side,
            price,
            quantity,
            complete: true,
        }
    }

    #[test]
    fn test_ledger_books_fills_and_fees() {
        let mut ledger = CapitalLedger::new(1000.0);
        ledger.record_fill(&fill(Side::Buy, 100.0, 2.0), 0.001);
        assert!((ledger.cash - 800.0).abs() < 1e-9);

        ledger.record_fill(&fill(Side::Sell, 110.0, 1.0), 0.001);
        assert!((ledger.cash - (800.0 + 110.0 * 0.999)).abs() < 1e-9);
        assert!((ledger.fees_paid - (0.2 + 0.11)).abs() < 1e-9);
    }

    #[test]
    fn test_equity_counts_held_quantity() {
        let mut ledger = CapitalLedger::new(1000.0);
        ledger.record_fill(&fill(Side::Buy, 100.0, 2.0), 0.0);

        let mut symbols = BTreeMap::new();
        let mut state = SymbolState::new(TradingMode::Hold, 500.0);
        state.held_quantity = 2.0;
        symbols.insert("XBTUSD".to_string(), state);

        let prices = HashMap::from([("XBTUSD".to_string(), 120.0)]);
        assert!((ledger.equity(&symbols, &prices) - 1040.0).abs() < 1e-9);
        assert!((ledger.pnl(1040.0) - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_day_roll_once_per_day() {
        let mut ledger = CapitalLedger::new(1000.0);
        let morning = "2026-03-02T08:00:00Z".parse::<DateTime<Utc>>().unwrap();
        assert!(ledger.roll_day(morning, 1000.0));
        assert!(!ledger.roll_day(morning + chrono::Duration::hours(6), 950.0));
        assert_eq!(ledger.day_start_equity, Some(1000.0));
        assert!(ledger.roll_day(morning + chrono::Duration::hours(20), 900.0));
        assert_eq!(ledger.day_start_equity, Some(900.0));
    }
}
