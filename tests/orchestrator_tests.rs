// Multi-instance orchestration: symbol exclusivity, orphan sweep, run loop

mod common;

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use common::*;
use hybrid_grid_bot::{AlertLog, InstanceOrchestrator, Regime, RegimeSignal, Side, TradingError, TradingMode};

#[test]
fn test_shared_symbol_refused_before_start() {
    let dir = TempDir::new().unwrap();
    let paper = paper_exchange(&[("XBTUSD", 100_000.0)]);
    let alerts = Arc::new(AlertLog::default());
    let config = test_config(
        dir.path(),
        vec![
            instance_config("alpha", 500.0, &["XBTUSD", "ETHUSD"]),
            instance_config("beta", 500.0, &["SOLUSD", "XBTUSD"]),
        ],
    );

    let result = InstanceOrchestrator::new(config, deps(paper, alerts), Arc::new(ScriptedRegime::default()));
    match result {
        Err(TradingError::SymbolConflict { symbol, first, second }) => {
            assert_eq!(symbol, "XBTUSD");
            assert_eq!(first, "alpha");
            assert_eq!(second, "beta");
        }
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("shared symbol accepted"),
    }
    // Nothing was persisted for either instance
    assert!(!dir.path().join("alpha.json").exists());
}

#[tokio::test]
async fn test_startup_cancels_orphans_once() {
    let dir = TempDir::new().unwrap();
    let paper = paper_exchange(&[("XBTUSD", 100_000.0), ("SOLUSD", 150.0)]);
    let alerts = Arc::new(AlertLog::default());
    let config = test_config(
        dir.path(),
        vec![
            instance_config("alpha", 1000.0, &["XBTUSD"]),
            instance_config("beta", 1000.0, &["SOLUSD"]),
        ],
    );

    // Left by a crashed run, and one on a market nobody manages
    paper.insert_resting_order("XBTUSD", Side::Buy, 0.001, 90_000.0);
    paper.insert_resting_order("DOGEUSD", Side::Sell, 100.0, 0.5);

    let orchestrator = InstanceOrchestrator::new(config, deps(paper.clone(), alerts), Arc::new(ScriptedRegime::default()))
        .unwrap();
    assert_eq!(orchestrator.partition().owner("SOLUSD"), Some("beta"));
    assert_eq!(orchestrator.startup().await.unwrap(), 2);
    assert_eq!(paper.cancel_count(), 2);

    // Grid orders placed afterwards are tracked and survive later sweeps
    for shared in orchestrator.instances() {
        shared.lock().await.run_tick(Utc::now()).await;
    }
    assert_eq!(paper.open_orders_for("XBTUSD").len(), 2);
    assert_eq!(orchestrator.reconcile_orphans().await.unwrap(), 0);
    assert_eq!(paper.cancel_count(), 2);
}

#[tokio::test]
async fn test_instances_keep_separate_ledgers() {
    let dir = TempDir::new().unwrap();
    let paper = paper_exchange(&[("XBTUSD", 100_000.0), ("SOLUSD", 150.0)]);
    let alerts = Arc::new(AlertLog::default());
    let config = test_config(
        dir.path(),
        vec![
            instance_config("alpha", 1000.0, &["XBTUSD"]),
            instance_config("beta", 600.0, &["SOLUSD"]),
        ],
    );
    let orchestrator = InstanceOrchestrator::new(config, deps(paper.clone(), alerts), Arc::new(ScriptedRegime::default()))
        .unwrap();
    orchestrator.startup().await.unwrap();
    for shared in orchestrator.instances() {
        shared.lock().await.run_tick(Utc::now()).await;
    }

    // Only alpha's BUY at 97500 fills
    paper.set_price("XBTUSD", 97_500.0);
    for shared in orchestrator.instances() {
        shared.lock().await.run_tick(Utc::now()).await;
    }

    let alpha = orchestrator.instance("alpha").await.unwrap();
    let beta = orchestrator.instance("beta").await.unwrap();
    assert!(alpha.lock().await.ledger().cash < 1000.0);
    assert!(approx_eq(beta.lock().await.ledger().cash, 600.0));
    assert!(orchestrator.instance("gamma").await.is_none());
}

#[tokio::test]
async fn test_mode_evaluation_reaches_every_instance() {
    let dir = TempDir::new().unwrap();
    let paper = paper_exchange(&[("XBTUSD", 100_000.0), ("SOLUSD", 150.0)]);
    let alerts = Arc::new(AlertLog::default());
    let regime = Arc::new(ScriptedRegime::default());
    let config = test_config(
        dir.path(),
        vec![
            instance_config("alpha", 1000.0, &["XBTUSD"]),
            instance_config("beta", 1000.0, &["SOLUSD"]),
        ],
    );
    let orchestrator = InstanceOrchestrator::new(config, deps(paper.clone(), alerts), regime.clone()).unwrap();
    orchestrator.startup().await.unwrap();

    assert_eq!(orchestrator.evaluate_modes().await, 0);

    regime.set(Some(RegimeSignal::new(Regime::Bear, 0.95, 0.0)));
    assert_eq!(orchestrator.evaluate_modes().await, 2);
    for shared in orchestrator.instances() {
        assert_eq!(shared.lock().await.mode(), TradingMode::Cash);
    }
}

#[tokio::test]
async fn test_halt_all_stops_every_instance() {
    let dir = TempDir::new().unwrap();
    let paper = paper_exchange(&[("XBTUSD", 100_000.0), ("SOLUSD", 150.0)]);
    let alerts = Arc::new(AlertLog::default());
    let config = test_config(
        dir.path(),
        vec![
            instance_config("alpha", 1000.0, &["XBTUSD"]),
            instance_config("beta", 1000.0, &["SOLUSD"]),
        ],
    );
    let orchestrator = InstanceOrchestrator::new(config, deps(paper.clone(), alerts.clone()), Arc::new(ScriptedRegime::default()))
        .unwrap();
    orchestrator.startup().await.unwrap();
    for shared in orchestrator.instances() {
        shared.lock().await.run_tick(Utc::now()).await;
    }

    orchestrator.halt_all("exchange maintenance").await;
    for shared in orchestrator.instances() {
        assert!(shared.lock().await.is_halted());
    }
    assert!(paper.open_orders_for("XBTUSD").is_empty());
    assert!(paper.open_orders_for("SOLUSD").is_empty());
    assert_eq!(alerts.urgent_alerts().len(), 2);
}

#[tokio::test]
async fn test_run_stops_on_time_limit_and_persists() {
    let dir = TempDir::new().unwrap();
    let paper = paper_exchange(&[("XBTUSD", 100_000.0)]);
    let alerts = Arc::new(AlertLog::default());
    let config = test_config(dir.path(), vec![instance_config("alpha", 1000.0, &["XBTUSD"])]);
    let orchestrator = Arc::new(
        InstanceOrchestrator::new(config, deps(paper.clone(), alerts), Arc::new(ScriptedRegime::default())).unwrap(),
    );
    orchestrator.startup().await.unwrap();

    let shutdown = orchestrator.shutdown_signal();
    orchestrator.clone().run(Some(Duration::from_millis(300))).await;

    assert!(shutdown.is_shutting_down());
    assert_eq!(paper.open_orders_for("XBTUSD").len(), 2);
    assert!(dir.path().join("alpha.json").exists());
}
