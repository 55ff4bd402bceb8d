// Grid order engine behaviour against the paper exchange

mod common;

use async_trait::async_trait;
use chrono::Duration;
use std::sync::Arc;

use common::*;
use hybrid_grid_bot::core::grid_engine::{EngineParams, GridOrderEngine};
use hybrid_grid_bot::exchange::{
    ExchangeClient, ExchangeError, ExchangeOrder, ExchangeResult, OrderRequest, SymbolInfo,
};
use hybrid_grid_bot::types::FollowUpAction;
use hybrid_grid_bot::{AlertLog, PaperExchange, Side, TradingError};

async fn ready_engine(paper: &PaperExchange) -> GridOrderEngine {
    let mut engine = GridOrderEngine::new(
        grid_spec("XBTUSD", 1000.0, 4, 95_000.0, 105_000.0),
        EngineParams::default(),
    );
    let placed = engine.initialize(paper, &mut AllowAll, 100_000.0, t0()).await.unwrap();
    assert_eq!(placed, 2);
    engine
}

fn order_at(engine: &GridOrderEngine, side: Side, price: f64) -> String {
    engine
        .orders()
        .find(|o| o.side == side && approx_eq(o.price, price))
        .map(|o| o.order_id.clone())
        .expect("tracked order at price")
}

#[tokio::test]
async fn test_initial_grid_places_buys_below_price_only() {
    let paper = paper_exchange(&[("XBTUSD", 100_000.0)]);
    let engine = ready_engine(&paper).await;

    let prices: Vec<f64> = engine.levels().iter().map(|l| l.price).collect();
    assert_eq!(prices, vec![95_000.0, 97_500.0, 100_000.0, 102_500.0, 105_000.0]);

    // No inventory: the SELL levels stay empty, the level at market too
    let open = paper.open_orders_for("XBTUSD");
    assert_eq!(open.len(), 2);
    assert!(open.iter().all(|o| o.side == Side::Buy));
    assert!(approx_eq(open[0].price, 95_000.0));
    assert!(approx_eq(open[1].price, 97_500.0));
    // $250 per level, rounded down to the step size
    assert!(approx_eq(open[1].quantity, 0.00256));
    assert!(engine.is_initialized());
}

#[tokio::test]
async fn test_inventory_seeds_sell_levels() {
    let paper = paper_exchange(&[("XBTUSD", 100_000.0)]);
    paper.set_balance("XBT", 0.01);

    let mut engine = GridOrderEngine::new(
        grid_spec("XBTUSD", 1000.0, 4, 95_000.0, 105_000.0),
        EngineParams::default(),
    );
    engine.set_inventory(0.003);
    let placed = engine.initialize(&*paper, &mut AllowAll, 100_000.0, t0()).await.unwrap();

    // Two BUYs, one full SELL at 102500 and what is left at 105000
    assert_eq!(placed, 4);
    let sells: Vec<_> = paper.open_orders_for("XBTUSD").into_iter().filter(|o| o.side == Side::Sell).collect();
    assert_eq!(sells.len(), 2);
    let sold: f64 = sells.iter().map(|o| o.quantity).sum();
    assert!(sold <= 0.003 + 1e-12);
}

#[tokio::test]
async fn test_buy_fill_queues_and_places_sell_one_level_up() {
    let paper = paper_exchange(&[("XBTUSD", 100_000.0)]);
    let alerts = AlertLog::default();
    let mut engine = ready_engine(&paper).await;
    let buy_id = order_at(&engine, Side::Buy, 97_500.0);

    assert_eq!(paper.set_price("XBTUSD", 97_500.0), 1);
    let report = engine
        .tick(&*paper, &mut AllowAll, &alerts, t0() + Duration::minutes(1))
        .await
        .unwrap();
    assert_eq!(report.fills, 1);
    assert_eq!(report.placed, 1);

    let fills = engine.take_fills();
    assert_eq!(fills.len(), 1);
    assert_eq!(fills[0].order_id, buy_id);
    assert!(fills[0].complete);

    let sell = paper
        .open_orders_for("XBTUSD")
        .into_iter()
        .find(|o| o.side == Side::Sell)
        .expect("follow-up SELL resting");
    assert!(approx_eq(sell.price, 100_000.0));
    // The fill minus the fee, rounded down
    assert!(approx_eq(sell.quantity, 0.00255));
    assert!(engine.pending_followups().is_empty());
}

#[tokio::test]
async fn test_sell_fill_rebuys_one_level_down() {
    let paper = paper_exchange(&[("XBTUSD", 100_000.0)]);
    let alerts = AlertLog::default();
    let mut engine = ready_engine(&paper).await;

    paper.set_price("XBTUSD", 97_500.0);
    engine.tick(&*paper, &mut AllowAll, &alerts, t0()).await.unwrap();
    paper.set_price("XBTUSD", 100_000.0);
    let report = engine.tick(&*paper, &mut AllowAll, &alerts, t0()).await.unwrap();
    assert_eq!(report.fills, 1);
    assert_eq!(report.placed, 1);

    let buys: Vec<f64> = paper
        .open_orders_for("XBTUSD")
        .into_iter()
        .filter(|o| o.side == Side::Buy)
        .map(|o| o.price)
        .collect();
    assert_eq!(buys, vec![95_000.0, 97_500.0]);
    // Only rounding dust from the SELL step size remains
    assert!(engine.inventory() < 0.00001);
}

#[tokio::test]
async fn test_followup_retries_then_halts_after_five_failures() {
    let paper = paper_exchange(&[("XBTUSD", 100_000.0)]);
    let alerts = AlertLog::default();
    let mut engine = ready_engine(&paper).await;

    paper.set_price("XBTUSD", 97_500.0);
    paper.fail_next_orders(5, ExchangeError::Network("connection reset".to_string()));

    let start = t0();
    let report = engine.tick(&*paper, &mut AllowAll, &alerts, start).await.unwrap();
    assert_eq!(report.fills, 1);
    assert_eq!(report.placed, 0);

    let pending = engine.pending_followups().iter().next().cloned().unwrap();
    assert_eq!(pending.action, FollowUpAction::PlaceSell);
    assert_eq!(pending.attempt_count, 1);
    assert_eq!(pending.next_retry_at, start + Duration::minutes(2));

    // Not due yet: no attempt is spent
    engine.tick(&*paper, &mut AllowAll, &alerts, start + Duration::minutes(1)).await.unwrap();
    assert_eq!(engine.pending_followups().iter().next().unwrap().attempt_count, 1);

    let mut at = start;
    for (attempt, delay) in [(2u32, 2i64), (3, 5), (4, 15)] {
        at = at + Duration::minutes(delay);
        engine.tick(&*paper, &mut AllowAll, &alerts, at).await.unwrap();
        let pending = engine.pending_followups().iter().next().unwrap();
        assert_eq!(pending.attempt_count, attempt);
    }
    assert_eq!(
        engine.pending_followups().iter().next().unwrap().next_retry_at,
        at + Duration::minutes(30)
    );
    assert!(alerts.urgent_alerts().is_empty());

    let report = engine
        .tick(&*paper, &mut AllowAll, &alerts, at + Duration::minutes(30))
        .await
        .unwrap();
    assert_eq!(report.exhausted.len(), 1);
    assert!(report.exhausted[0].failed);
    assert!(engine.pending_followups().is_empty());
    assert!(engine.halted().is_some());
    assert_eq!(alerts.urgent_alerts().len(), 1);

    // A halted engine does nothing further
    let report = engine.tick(&*paper, &mut AllowAll, &alerts, at + Duration::hours(2)).await.unwrap();
    assert!(report.halted.is_some());
    assert_eq!(report.placed, 0);
}

#[tokio::test]
async fn test_rebuild_keeps_exhausted_symbol_halted() {
    let paper = paper_exchange(&[("XBTUSD", 100_000.0)]);
    let alerts = AlertLog::default();
    let mut engine = ready_engine(&paper).await;

    paper.set_price("XBTUSD", 97_500.0);
    paper.fail_next_orders(5, ExchangeError::Network("connection reset".to_string()));
    let mut at = t0();
    engine.tick(&*paper, &mut AllowAll, &alerts, at).await.unwrap();
    for delay in [2i64, 5, 15, 30] {
        at = at + Duration::minutes(delay);
        engine.tick(&*paper, &mut AllowAll, &alerts, at).await.unwrap();
    }
    assert!(engine.halted().is_some());
    let resting = paper.open_orders_for("XBTUSD").len();

    // A rebalance with a new allocation must not lay a fresh grid
    let (summary, placed) = engine
        .rebuild(
            grid_spec("XBTUSD", 800.0, 4, 92_500.0, 102_500.0),
            &*paper,
            &mut AllowAll,
            &alerts,
            97_500.0,
            at + Duration::hours(1),
        )
        .await
        .unwrap();
    assert_eq!(placed, 0);
    assert_eq!(summary.canceled, 0);
    assert!(engine.halted().is_some());
    assert!(approx_eq(engine.spec().capital, 1000.0));
    assert_eq!(paper.open_orders_for("XBTUSD").len(), resting);
    assert_eq!(paper.cancel_count(), 0);
}

#[tokio::test]
async fn test_risk_rejection_counts_as_failed_attempt() {
    let paper = paper_exchange(&[("XBTUSD", 100_000.0)]);
    let alerts = AlertLog::default();
    let mut engine = ready_engine(&paper).await;

    paper.set_price("XBTUSD", 97_500.0);
    engine.tick(&*paper, &mut AllowAll, &alerts, t0()).await.unwrap();
    paper.set_price("XBTUSD", 100_000.0);

    // The SELL fills, its BUY follow-up is refused by the risk check
    let report = engine.tick(&*paper, &mut RejectBuys, &alerts, t0()).await.unwrap();
    assert_eq!(report.placed, 0);
    let pending = engine.pending_followups().iter().next().unwrap();
    assert_eq!(pending.action, FollowUpAction::PlaceBuy);
    assert_eq!(pending.attempt_count, 1);
}

#[tokio::test]
async fn test_sell_followup_shrinks_to_available_balance() {
    let paper = paper_exchange(&[("XBTUSD", 100_000.0)]);
    let alerts = AlertLog::default();
    let mut engine = ready_engine(&paper).await;

    paper.set_price("XBTUSD", 97_500.0);
    // Less base arrived than the engine expects
    paper.set_balance("XBT", 0.0025);
    let report = engine.tick(&*paper, &mut AllowAll, &alerts, t0()).await.unwrap();
    assert_eq!(report.placed, 1);

    let sell = paper
        .open_orders_for("XBTUSD")
        .into_iter()
        .find(|o| o.side == Side::Sell)
        .unwrap();
    assert!(approx_eq(sell.quantity, 0.0025));
}

#[tokio::test]
async fn test_partial_fill_then_external_cancel_books_fill_without_followup() {
    let paper = paper_exchange(&[("XBTUSD", 100_000.0)]);
    let alerts = AlertLog::default();
    let mut engine = ready_engine(&paper).await;
    let buy_id = order_at(&engine, Side::Buy, 95_000.0);

    paper.partial_fill(&buy_id, 0.001);
    let report = engine.tick(&*paper, &mut AllowAll, &alerts, t0()).await.unwrap();
    assert_eq!(report.fills, 1);
    let fills = engine.take_fills();
    assert!(approx_eq(fills[0].quantity, 0.001));
    assert!(!fills[0].complete);
    assert!(engine.pending_followups().is_empty());

    paper.cancel_externally(&buy_id);
    let report = engine.tick(&*paper, &mut AllowAll, &alerts, t0()).await.unwrap();
    assert_eq!(report.fills, 0);
    assert!(!engine.open_order_ids().contains(&buy_id));
    assert!(engine.pending_followups().is_empty());
    assert!(approx_eq(engine.inventory(), 0.001 * (1.0 - FEE_RATE)));
}

#[tokio::test]
async fn test_order_unknown_to_exchange_is_dropped() {
    let paper = paper_exchange(&[("XBTUSD", 100_000.0)]);
    let alerts = AlertLog::default();
    let mut engine = ready_engine(&paper).await;
    let buy_id = order_at(&engine, Side::Buy, 95_000.0);

    paper.purge_order(&buy_id);
    engine.tick(&*paper, &mut AllowAll, &alerts, t0()).await.unwrap();
    assert_eq!(engine.open_order_ids().len(), 1);
    assert!(engine.levels().iter().all(|l| l.order_id.as_deref() != Some(buy_id.as_str())));
}

#[tokio::test]
async fn test_recover_queues_fills_made_while_offline() {
    let paper = paper_exchange(&[("XBTUSD", 100_000.0)]);
    let alerts = AlertLog::default();
    let engine = ready_engine(&paper).await;
    let saved = engine.to_state();
    drop(engine);

    // Filled while the process was down
    paper.set_price("XBTUSD", 97_500.0);

    let mut engine = GridOrderEngine::from_state(saved, EngineParams::default());
    let fills = engine.recover(&*paper, t0() + Duration::hours(3)).await.unwrap();
    assert_eq!(fills, 1);
    assert_eq!(engine.pending_followups().len(), 1);
    assert!(paper.open_orders_for("XBTUSD").iter().all(|o| o.side == Side::Buy));

    let report = engine
        .tick(&*paper, &mut AllowAll, &alerts, t0() + Duration::hours(3))
        .await
        .unwrap();
    assert_eq!(report.placed, 1);
    assert!(paper.open_orders_for("XBTUSD").iter().any(|o| o.side == Side::Sell));
}

#[tokio::test]
async fn test_capital_change_cancels_every_order_for_the_symbol() {
    let paper = paper_exchange(&[("XBTUSD", 100_000.0)]);
    let alerts = AlertLog::default();
    let mut engine = ready_engine(&paper).await;
    // Left behind by an earlier run and no longer tracked
    paper.insert_resting_order("XBTUSD", Side::Buy, 0.001, 90_000.0);

    // Same symbol and capital: only the band moves, nothing is cancelled
    let moved = grid_spec("XBTUSD", 1000.0, 4, 96_000.0, 104_000.0);
    let summary = engine.reinitialize(moved, &*paper, &alerts).await.unwrap();
    assert_eq!(summary.canceled, 0);
    assert!(engine.is_initialized());

    let bigger = grid_spec("XBTUSD", 800.0, 4, 96_000.0, 104_000.0);
    let summary = engine.reinitialize(bigger, &*paper, &alerts).await.unwrap();
    assert_eq!(summary.canceled, 3);
    assert_eq!(paper.cancel_count(), 3);
    assert!(paper.open_orders_for("XBTUSD").is_empty());
    assert!(!engine.is_initialized());
    assert!(approx_eq(engine.spec().capital, 800.0));
}

/// Paper exchange whose cancels always time out
struct CancelsFail(Arc<PaperExchange>);

#[async_trait]
impl ExchangeClient for CancelsFail {
    async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<ExchangeOrder> {
        self.0.place_order(request).await
    }

    async fn cancel_order(&self, _symbol: &str, _order_id: &str) -> ExchangeResult<()> {
        Err(ExchangeError::Timeout(std::time::Duration::from_secs(10)))
    }

    async fn get_order_status(&self, symbol: &str, order_id: &str) -> ExchangeResult<ExchangeOrder> {
        self.0.get_order_status(symbol, order_id).await
    }

    async fn get_open_orders(&self, symbol: Option<&str>) -> ExchangeResult<Vec<ExchangeOrder>> {
        self.0.get_open_orders(symbol).await
    }

    async fn get_balance(&self, asset: &str) -> ExchangeResult<f64> {
        self.0.get_balance(asset).await
    }

    async fn get_price(&self, symbol: &str) -> ExchangeResult<f64> {
        self.0.get_price(symbol).await
    }

    async fn symbol_info(&self, symbol: &str) -> ExchangeResult<SymbolInfo> {
        self.0.symbol_info(symbol).await
    }
}

#[tokio::test]
async fn test_failed_cancel_refuses_new_spec() {
    let paper = paper_exchange(&[("XBTUSD", 100_000.0)]);
    let alerts = AlertLog::default();
    let mut engine = ready_engine(&paper).await;
    let flaky = CancelsFail(paper.clone());

    let err = engine
        .reinitialize(grid_spec("ETHUSD", 1000.0, 4, 3_000.0, 3_400.0), &flaky, &alerts)
        .await
        .unwrap_err();
    assert!(matches!(err, TradingError::ConfigMismatch(_)));
    assert_eq!(engine.symbol(), "XBTUSD");
    assert_eq!(paper.open_orders_for("XBTUSD").len(), 2);
}

#[tokio::test]
async fn test_symbol_change_resets_inventory_with_alert() {
    let paper = paper_exchange(&[("XBTUSD", 100_000.0), ("ETHUSD", 3_200.0)]);
    let alerts = AlertLog::default();
    let mut engine = ready_engine(&paper).await;
    paper.set_price("XBTUSD", 97_500.0);
    engine.tick(&*paper, &mut AllowAll, &alerts, t0()).await.unwrap();
    assert!(engine.inventory() > 0.0);

    engine
        .reinitialize(grid_spec("ETHUSD", 1000.0, 4, 3_000.0, 3_400.0), &*paper, &alerts)
        .await
        .unwrap();
    assert_eq!(engine.symbol(), "ETHUSD");
    assert_eq!(engine.inventory(), 0.0);
    assert!(paper.open_orders_for("XBTUSD").is_empty());
    assert_eq!(alerts.urgent_alerts().len(), 1);
}
