// Status command: reads persisted instance state, never the exchange
use tracing::{info, warn};

use hybrid_grid_bot::core::persistence::{read_state, state_path, InstanceState};
use hybrid_grid_bot::{Config, TradingResult};

pub fn show_status(config: &Config, detailed: bool) -> TradingResult<()> {
    info!("📊 Instance status ({})", config.orchestrator.state_dir);

    for instance in &config.instances {
        let path = state_path(&config.orchestrator.state_dir, &instance.id);
        let state = match read_state::<InstanceState>(&path) {
            Ok(Some(state)) => state,
            Ok(None) => {
                info!("   {}: no saved state yet", instance.id);
                continue;
            }
            Err(e) => {
                warn!("   {}: {}", instance.id, e);
                continue;
            }
        };

        let lock = if state.mode.lock_active { " 🔒 locked" } else { "" };
        info!(
            "   {}: mode {}{} since {}, cash ${:.2} of ${:.2}, saved {}",
            state.instance_id,
            state.mode.current_mode,
            lock,
            state.mode.entered_at.format("%Y-%m-%d %H:%M"),
            state.ledger.cash,
            state.ledger.starting_capital,
            state.saved_at.format("%Y-%m-%d %H:%M:%S")
        );
        if let Some(reason) = &state.halted {
            warn!("      🛑 halted: {}", reason);
        }

        for (symbol, record) in &state.symbols {
            let (orders, followups, inventory, halted) = record.engine.as_ref().map_or((0, 0, 0.0, None), |e| {
                (e.orders.len(), e.followups.len(), e.inventory, e.halted.clone())
            });
            info!(
                "      {} {}: alloc ${:.2}, held {:.8}, grid inventory {:.8}, {} orders, {} follow-ups{}",
                symbol,
                record.mode,
                record.allocation_usd,
                record.held_quantity,
                inventory,
                orders,
                followups,
                if record.stopped_out { ", stopped out" } else { "" }
            );
            if let Some(reason) = halted {
                warn!("      ⚠️  {} halted: {}", symbol, reason);
            }

            if detailed {
                if let Some(engine) = &record.engine {
                    for order in engine.orders.values() {
                        info!(
                            "         {} {} {:.8} @ {:.8} ({:?}, filled {:.8})",
                            order.order_id, order.side, order.quantity, order.price, order.status, order.filled_quantity
                        );
                    }
                    for followup in engine.followups.iter() {
                        info!(
                            "         pending {:?} {:.8} @ {:.8}, attempt {}, next {}",
                            followup.action,
                            followup.quantity,
                            followup.price,
                            followup.attempt_count,
                            followup.next_retry_at.format("%H:%M:%S")
                        );
                    }
                }
            }
        }

        if detailed {
            for stop in state.stop_losses.active_stops() {
                info!(
                    "      🛡️  {} stop {:.8} (entry {:.8}, {:?})",
                    stop.symbol, stop.stop_price, stop.entry_price, stop.stop_type
                );
            }
        }
    }
    Ok(())
}
