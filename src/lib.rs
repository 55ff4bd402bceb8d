// Hybrid Grid Trading Bot Library
//
// Regime-adaptive HOLD / GRID / CASH execution engine running several
// independent strategy instances against one shared exchange account

pub mod collaborators;
pub mod config;
pub mod core;
pub mod error;    // Unified error handling
pub mod exchange; // Exchange contract, rate-limit guard, paper account
pub mod notify;
pub mod types;

// Re-export core trading types
pub use core::{GridOrderEngine, InstanceOrchestrator, ModeManager, StrategyInstance};

// Re-export error types
pub use error::{TradingError, TradingResult};

// Re-export configuration
pub use config::{Config, ConfigError, InstanceConfig};

// Re-export exchange types
pub use exchange::{ExchangeClient, ExchangeError, GuardedExchange, PaperExchange};

// Re-export collaborator contracts
pub use collaborators::{CapitalAllocator, PercentRange, RangeCalculator, RegimeFile, RegimeSource, WeightedAllocator};

pub use notify::{AlertLog, NotificationSink};
pub use types::{Regime, RegimeSignal, Side, TradingMode};
