// Core trading logic modules

pub mod constraints;
pub mod control;
pub mod followup;
pub mod grid_engine;
pub mod instance;
pub mod mode_manager;
pub mod orchestrator;
pub mod persistence;
pub mod risk_guard;
pub mod stop_loss;
pub mod stop_loss_executor;

// Re-export commonly used types
pub use constraints::AllocationConstraints;
pub use control::{ShutdownSignal, TaskLock};
pub use followup::{FollowUpQueue, RetrySchedule};
pub use grid_engine::{compute_grid_prices, EngineParams, GridOrderEngine, GridSpec};
pub use instance::{CapitalLedger, InstanceDeps, InstanceStatus, StrategyInstance, SymbolState, TickOutcome};
pub use mode_manager::{ModeDecision, ModeManager, ModeState, ModeTransition};
pub use orchestrator::{InstanceOrchestrator, SymbolPartition};
pub use persistence::{read_state, write_atomic, InstanceState};
pub use risk_guard::{OrderIntent, PreTradeCheck, RiskContext, RiskGate, RiskGuard, RiskVerdict};
pub use stop_loss::{StopLossManager, StopLossOrder, StopType};
pub use stop_loss_executor::{SellOutcome, StopLossExecutor};
