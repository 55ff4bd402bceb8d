// Runs every strategy instance against the one shared exchange account
//
// Instances never share mutable state: each sits behind its own mutex,
// and symbols are partitioned up front so no two instances trade the same
// market. Maintenance jobs run on their own timers, each behind a
// non-blocking task lock.

use chrono::Utc;
use futures_util::future::join_all;
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{interval, interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::control::{ShutdownSignal, TaskLock};
use super::instance::{InstanceDeps, StrategyInstance, TickOutcome};
use crate::collaborators::RegimeSource;
use crate::config::{Config, InstanceConfig};
use crate::error::{TradingError, TradingResult};
use crate::exchange::ExchangeError;

/// Exclusive symbol -> instance assignment
#[derive(Debug, Clone, Default)]
pub struct SymbolPartition {
    owners: BTreeMap<String, String>,
}

impl SymbolPartition {
    pub fn build(instances: &[InstanceConfig]) -> TradingResult<Self> {
        let mut owners = BTreeMap::new();
        for instance in instances {
            for symbol in &instance.symbols {
                if let Some(first) = owners.insert(symbol.clone(), instance.id.clone()) {
                    if first != instance.id {
                        return Err(TradingError::SymbolConflict {
                            symbol: symbol.clone(),
                            first,
                            second: instance.id.clone(),
                        });
                    }
                }
            }
        }
        Ok(Self { owners })
    }

    pub fn owner(&self, symbol: &str) -> Option<&str> {
        self.owners.get(symbol).map(String::as_str)
    }

    pub fn symbols(&self) -> impl Iterator<Item = &String> {
        self.owners.keys()
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

pub type SharedInstance = Arc<Mutex<StrategyInstance>>;

struct MaintenanceLocks {
    stop_loss: TaskLock,
    mode_eval: TaskLock,
    reconcile: TaskLock,
    rebalance: TaskLock,
}

impl MaintenanceLocks {
    fn new() -> Self {
        Self {
            stop_loss: TaskLock::new("stop_loss"),
            mode_eval: TaskLock::new("mode_evaluation"),
            reconcile: TaskLock::new("reconcile"),
            rebalance: TaskLock::new("rebalance"),
        }
    }
}

pub struct InstanceOrchestrator {
    config: Config,
    partition: SymbolPartition,
    instances: Vec<SharedInstance>,
    deps: InstanceDeps,
    regime: Arc<dyn RegimeSource>,
    shutdown: ShutdownSignal,
    locks: MaintenanceLocks,
}

impl InstanceOrchestrator {
    /// Refuses configurations that assign a symbol to two instances
    pub fn new(config: Config, deps: InstanceDeps, regime: Arc<dyn RegimeSource>) -> TradingResult<Self> {
        let partition = SymbolPartition::build(&config.instances)?;
        let now = Utc::now();
        let instances = config
            .instances
            .iter()
            .map(|ic| {
                let instance = StrategyInstance::new(ic.clone(), &config, deps.clone(), &config.orchestrator.state_dir, now);
                Arc::new(Mutex::new(instance))
            })
            .collect();

        info!(
            "🧩 Orchestrator: {} instances over {} symbols",
            config.instances.len(),
            partition.len()
        );
        Ok(Self {
            config,
            partition,
            instances,
            deps,
            regime,
            shutdown: ShutdownSignal::new(),
            locks: MaintenanceLocks::new(),
        })
    }

    pub fn partition(&self) -> &SymbolPartition {
        &self.partition
    }

    pub fn instances(&self) -> &[SharedInstance] {
        &self.instances
    }

    pub async fn instance(&self, id: &str) -> Option<SharedInstance> {
        for instance in &self.instances {
            if instance.lock().await.id() == id {
                return Some(instance.clone());
            }
        }
        None
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Restore every instance, then sweep orphans once before any tick.
    /// An instance that cannot start is halted; the others carry on.
    pub async fn startup(&self) -> TradingResult<usize> {
        let now = Utc::now();
        for shared in &self.instances {
            let mut instance = shared.lock().await;
            if let Err(e) = instance.startup(now).await {
                error!("❌ [{}] Startup failed: {}", instance.id(), e);
                instance.halt(&format!("startup failed: {}", e)).await;
            }
        }

        let cancelled = self.reconcile_orphans().await?;
        info!("🚀 Startup complete, {} orphan orders cancelled", cancelled);
        Ok(cancelled)
    }

    /// Cancel every open exchange order that no instance tracks. The
    /// exchange list is read first; instances are locked afterwards so
    /// an order placed mid-sweep is already tracked by the time it is seen.
    pub async fn reconcile_orphans(&self) -> TradingResult<usize> {
        let open = self.deps.exchange.get_open_orders(None).await?;

        let mut referenced = HashSet::new();
        for shared in &self.instances {
            referenced.extend(shared.lock().await.referenced_order_ids());
        }

        let mut cancelled = 0;
        for order in open.iter().filter(|o| !referenced.contains(&o.order_id)) {
            match self.deps.exchange.cancel_order(&order.symbol, &order.order_id).await {
                Ok(()) => {
                    cancelled += 1;
                    warn!(
                        "🧹 Cancelled orphan {} {} {:.8} @ {:.8} ({})",
                        order.symbol, order.side, order.quantity, order.price, order.order_id
                    );
                }
                Err(ExchangeError::NotFound(_)) => {}
                Err(e) => warn!("⚠️  Could not cancel orphan {}: {}", order.order_id, e),
            }
        }

        debug!("Orphan sweep: {} open, {} referenced, {} cancelled", open.len(), referenced.len(), cancelled);
        Ok(cancelled)
    }

    /// Read the regime once and let every instance decide
    pub async fn evaluate_modes(&self) -> usize {
        let signal = match self.regime.current() {
            Ok(signal) => signal,
            Err(e) => {
                warn!("⚠️  Regime source unavailable ({}), keeping current modes", e);
                None
            }
        };

        let now = Utc::now();
        let mut switched = 0;
        for shared in &self.instances {
            let mut instance = shared.lock().await;
            match instance.evaluate_mode(signal, now).await {
                Ok(Some(_)) => switched += 1,
                Ok(None) => {}
                Err(e) => error!("❌ [{}] Mode transition failed: {}", instance.id(), e),
            }
        }
        switched
    }

    pub async fn run_stop_losses(&self) -> usize {
        let now = Utc::now();
        let mut closed = 0;
        for shared in &self.instances {
            let mut instance = shared.lock().await;
            match instance.run_stop_losses(now).await {
                Ok(n) => closed += n,
                Err(e) => error!("❌ [{}] Stop-loss cycle failed: {}", instance.id(), e),
            }
        }
        closed
    }

    pub async fn rebalance_all(&self) -> usize {
        let now = Utc::now();
        let mut adjusted = 0;
        for shared in &self.instances {
            let mut instance = shared.lock().await;
            match instance.check_rebalance(now).await {
                Ok(actions) => adjusted += actions.len(),
                Err(e) => error!("❌ [{}] Rebalance failed: {}", instance.id(), e),
            }
        }
        adjusted
    }

    pub async fn halt_all(&self, reason: &str) {
        error!("🛑 GLOBAL HALT: {}", reason);
        for shared in &self.instances {
            shared.lock().await.halt(&format!("global halt: {}", reason)).await;
        }
    }

    /// Tick every instance until shutdown (or until `run_for` elapses),
    /// with maintenance jobs alongside. Returns once every loop has
    /// finished its current tick and persisted.
    pub async fn run(self: Arc<Self>, run_for: Option<Duration>) {
        if let Some(limit) = run_for {
            let signal = self.shutdown.clone();
            tokio::spawn(async move {
                sleep(limit).await;
                info!("⏱️  Run time limit reached");
                signal.initiate_shutdown();
            });
        }

        let maintenance = tokio::spawn(self.clone().maintenance_loop());
        join_all(self.instances.iter().map(|shared| self.instance_loop(shared.clone()))).await;

        // Every loop ends on shutdown or halt; nothing left to maintain
        self.shutdown.initiate_shutdown();
        if let Err(e) = maintenance.await {
            warn!("⚠️  Maintenance loop ended abnormally: {}", e);
        }

        let now = Utc::now();
        for shared in &self.instances {
            let instance = shared.lock().await;
            if let Err(e) = instance.persist(now) {
                error!("❌ [{}] Final persist failed: {}", instance.id(), e);
            }
        }
        info!("🛑 Orchestrator stopped");
    }

    async fn instance_loop(&self, shared: SharedInstance) {
        loop {
            if self.shutdown.is_shutting_down() {
                break;
            }

            let (id, outcome, delay) = {
                let mut instance = shared.lock().await;
                let outcome = instance.run_tick(Utc::now()).await;
                (instance.id().to_string(), outcome, instance.next_delay())
            };

            match outcome {
                TickOutcome::Continue => {}
                TickOutcome::Halted(reason) => {
                    warn!("🛑 [{}] Loop stopped: {}", id, reason);
                    break;
                }
                TickOutcome::GlobalHalt(reason) => {
                    self.halt_all(&reason).await;
                    self.shutdown.initiate_shutdown();
                    break;
                }
            }

            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.shutdown.wait() => break,
            }
        }
    }

    async fn maintenance_loop(self: Arc<Self>) {
        let settings = &self.config.orchestrator;
        let mut stop_timer = interval(Duration::from_secs(settings.stop_loss_interval_secs.max(1)));
        let mut mode_timer = interval(Duration::from_secs(settings.mode_eval_interval_secs.max(1)));
        // Startup already swept and allocated; the first runs come one period later
        let reconcile_enabled = settings.reconcile_interval_hours > 0;
        let reconcile_period = Duration::from_secs(settings.reconcile_interval_hours.max(1) * 3600);
        let rebalance_period = Duration::from_secs(settings.rebalance_interval_hours.max(1) * 3600);
        let mut reconcile_timer = interval_at(Instant::now() + reconcile_period, reconcile_period);
        let mut rebalance_timer = interval_at(Instant::now() + rebalance_period, rebalance_period);
        for timer in [&mut stop_timer, &mut mode_timer, &mut reconcile_timer, &mut rebalance_timer] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        }

        loop {
            tokio::select! {
                _ = self.shutdown.wait() => break,
                _ = stop_timer.tick() => self.spawn_job(&self.locks.stop_loss, |o| async move {
                    o.run_stop_losses().await;
                }),
                _ = mode_timer.tick() => self.spawn_job(&self.locks.mode_eval, |o| async move {
                    o.evaluate_modes().await;
                }),
                _ = reconcile_timer.tick(), if reconcile_enabled => self.spawn_job(&self.locks.reconcile, |o| async move {
                    if let Err(e) = o.reconcile_orphans().await {
                        warn!("⚠️  Periodic reconciliation failed: {}", e);
                    }
                }),
                _ = rebalance_timer.tick() => self.spawn_job(&self.locks.rebalance, |o| async move {
                    let adjusted = o.rebalance_all().await;
                    if adjusted > 0 {
                        info!("⚖️  Rebalance adjusted {} symbols", adjusted);
                    }
                }),
            }
        }
        debug!("Maintenance loop stopped");
    }

    /// Run `job` in the background unless its previous run is still going
    fn spawn_job<F, Fut>(self: &Arc<Self>, lock: &TaskLock, job: F)
    where
        F: FnOnce(Arc<Self>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Some(guard) = lock.try_acquire() else { return };
        let name = lock.name().to_string();
        let run = job(self.clone());
        tokio::spawn(async move {
            debug!("Task '{}' started", name);
            run.await;
            drop(guard);
        });
    }
}
