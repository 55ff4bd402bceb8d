// Run and validate command implementations
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use hybrid_grid_bot::core::instance::InstanceDeps;
use hybrid_grid_bot::core::{InstanceOrchestrator, InstanceStatus, SymbolPartition};
use hybrid_grid_bot::exchange::{PriceFeed, RestTickerFeed};
use hybrid_grid_bot::{
    AlertLog, Config, ExchangeClient, GuardedExchange, PaperExchange, PercentRange, RegimeFile, TradingError,
    TradingResult, WeightedAllocator,
};

/// Preflight: configuration rules plus exclusive symbol assignment
pub fn validate(config: &Config) -> TradingResult<()> {
    let partition = SymbolPartition::build(&config.instances)?;

    info!("✅ Configuration valid");
    for instance in &config.instances {
        info!(
            "   {} ${:.2}: {} (grid {} levels, ±{:.1}%)",
            instance.id,
            instance.capital,
            instance.symbols.join(", "),
            instance.grid_count.unwrap_or(config.grid.grid_count),
            instance.range_pct.unwrap_or(config.grid.range_pct)
        );
    }
    info!("🧩 {} symbols, each owned by exactly one instance", partition.len());
    info!("🔀 Initial mode {}, switching {}", config.mode.initial_mode, if config.mode.enable_mode_switching { "enabled" } else { "disabled" });
    Ok(())
}

/// Session length for `--minutes`; rejected before anything touches the exchange
fn run_duration(minutes: Option<f64>) -> TradingResult<Option<Duration>> {
    let Some(m) = minutes else {
        return Ok(None);
    };
    if !m.is_finite() || m <= 0.0 {
        return Err(TradingError::ConfigValidation(format!(
            "--minutes must be a positive number, got {}",
            m
        )));
    }
    Duration::try_from_secs_f64(m * 60.0)
        .map(Some)
        .map_err(|e| TradingError::ConfigValidation(format!("--minutes {} is out of range: {}", m, e)))
}

/// Paper run: live public prices, simulated account
pub async fn run(config: Config, minutes: Option<f64>) -> TradingResult<()> {
    let run_for = run_duration(minutes)?;
    let partition = SymbolPartition::build(&config.instances)?;
    let quote = config.exchange.quote_asset.clone();

    info!("🧪 PAPER mode: simulated account, live prices from {}", config.exchange.price_feed_url);
    info!("💰 Paper balance: {:.2} {}", config.exchange.paper_balance, quote);

    let feed = Arc::new(RestTickerFeed::new(&config.exchange.price_feed_url, config.request_timeout())?);
    let paper = PaperExchange::new(&quote, config.exchange.paper_balance, config.exchange.fee_rate).with_price_feed(feed.clone());
    for symbol in partition.symbols() {
        let price = feed.latest_price(symbol).await?;
        let base = symbol.strip_suffix(quote.as_str()).unwrap_or(symbol);
        paper.add_symbol(PaperExchange::default_symbol(symbol, base, &quote), price);
        info!("📈 {} @ {:.8}", symbol, price);
    }

    let exchange: Arc<dyn ExchangeClient> = Arc::new(GuardedExchange::new(
        Arc::new(paper),
        config.exchange.rate_limit_calls,
        Duration::from_secs(config.exchange.rate_limit_window_secs),
        config.request_timeout(),
    ));
    let alerts = Arc::new(AlertLog::default());
    let deps = InstanceDeps {
        exchange,
        notifier: alerts.clone(),
        ranges: Arc::new(PercentRange::new(config.grid.range_pct)),
        allocator: Arc::new(WeightedAllocator),
    };
    let regime = Arc::new(RegimeFile::new(&config.orchestrator.regime_file));

    let orchestrator = Arc::new(InstanceOrchestrator::new(config, deps, regime)?);
    orchestrator.startup().await?;

    let shutdown = orchestrator.shutdown_signal();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("⌨️  Ctrl-C received, finishing current ticks");
            shutdown.initiate_shutdown();
        }
    });

    orchestrator.clone().run(run_for).await;

    info!("");
    info!("📊 Session summary");
    for shared in orchestrator.instances() {
        let instance = shared.lock().await;
        let status = match instance.status() {
            InstanceStatus::Running => "running".to_string(),
            InstanceStatus::Halted(reason) => format!("HALTED ({})", reason),
        };
        info!(
            "   {}: mode {}, cash ${:.2}, fees ${:.2}, {}",
            instance.id(),
            instance.mode(),
            instance.ledger().cash,
            instance.ledger().fees_paid,
            status
        );
    }

    let urgent = alerts.urgent_alerts();
    if !urgent.is_empty() {
        warn!("🚨 {} urgent alerts this session:", urgent.len());
        for alert in urgent {
            warn!("   [{}] {}", alert.timestamp.format("%H:%M:%S"), alert.message);
        }
    }
    Ok(())
}
