//! Unified error handling for the hybrid grid bot
//!
//! Every subsystem reports failures through `TradingError`, so the
//! orchestrator can decide between retrying, skipping, halting and
//! raising an operator alert from one place.

use std::fmt;
use std::io;

use crate::config::ConfigError;
use crate::exchange::ExchangeError;

/// Main error type for the bot
#[derive(Debug)]
pub enum TradingError {
    // Configuration errors
    ConfigNotFound(String),
    ConfigParse(String),
    ConfigValidation(String),

    // Exchange errors (transient, insufficient balance, rejected)
    Exchange(ExchangeError),

    // State errors
    StateCorruption(String),
    ConfigMismatch(String),

    // Halt conditions
    ConsecutiveErrorLimit(String, u32), // (instance_id, errors)
    CircuitBreakerTripped(String),
    StopLossExecutionFailure(String),

    // Allocation errors
    SymbolConflict { symbol: String, first: String, second: String },

    // IO errors
    FileRead(String),
    FileWrite(String),

    // General errors
    Internal(String),
}

impl TradingError {
    /// Get a user-friendly error message with helpful context
    pub fn user_message(&self) -> String {
        match self {
            TradingError::ConfigNotFound(path) => {
                format!(
                    "Configuration file not found: {}\n\n\
                    💡 Quick fix:\n\
                    1. Run: grid-bot init\n\
                    2. Edit config.toml with your instances and symbols\n\
                    3. Run: grid-bot validate",
                    path
                )
            }
            TradingError::SymbolConflict { symbol, first, second } => {
                format!(
                    "Symbol {} is assigned to both '{}' and '{}'\n\n\
                    💡 Each symbol may belong to exactly one instance.\n\
                    Remove it from one of the [[instances]] entries.",
                    symbol, first, second
                )
            }
            TradingError::StopLossExecutionFailure(msg) => {
                format!(
                    "Stop-loss sell failed: {}\n\n\
                    🚨 ACTION REQUIRED: Manual sell needed.\n\
                    The position is still exposed on the exchange.",
                    msg
                )
            }
            TradingError::ConsecutiveErrorLimit(instance, count) => {
                format!(
                    "Instance '{}' stopped after {} consecutive errors\n\n\
                    💡 Check exchange connectivity and the instance log,\n\
                    then restart. Persisted state will be reconciled on start.",
                    instance, count
                )
            }
            TradingError::Exchange(ExchangeError::RateLimited(msg)) => {
                format!(
                    "Exchange rate limit exceeded: {}\n\n\
                    💡 Please wait before retrying\n\
                    Rate limits typically reset within 1-5 minutes",
                    msg
                )
            }
            _ => self.to_string(),
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            TradingError::Exchange(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            TradingError::ConfigNotFound(_)
            | TradingError::ConfigParse(_)
            | TradingError::ConfigValidation(_) => "config",

            TradingError::Exchange(_) => "exchange",

            TradingError::StateCorruption(_) | TradingError::ConfigMismatch(_) => "state",

            TradingError::ConsecutiveErrorLimit(_, _)
            | TradingError::CircuitBreakerTripped(_)
            | TradingError::StopLossExecutionFailure(_) => "halt",

            TradingError::SymbolConflict { .. } => "allocation",

            TradingError::FileRead(_) | TradingError::FileWrite(_) => "io",

            TradingError::Internal(_) => "internal",
        }
    }
}

impl fmt::Display for TradingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradingError::ConfigNotFound(path) => {
                write!(f, "Configuration file not found: {}", path)
            }
            TradingError::ConfigParse(msg) => {
                write!(f, "Configuration parse error: {}", msg)
            }
            TradingError::ConfigValidation(msg) => {
                write!(f, "Configuration validation error: {}", msg)
            }

            TradingError::Exchange(err) => {
                write!(f, "Exchange error: {}", err)
            }

            TradingError::StateCorruption(msg) => {
                write!(f, "State file corrupt: {}", msg)
            }
            TradingError::ConfigMismatch(msg) => {
                write!(f, "Configuration mismatch: {}", msg)
            }

            TradingError::ConsecutiveErrorLimit(instance, count) => {
                write!(f, "Instance {} hit {} consecutive errors", instance, count)
            }
            TradingError::CircuitBreakerTripped(msg) => {
                write!(f, "Circuit breaker tripped: {}", msg)
            }
            TradingError::StopLossExecutionFailure(msg) => {
                write!(f, "Stop-loss execution failed: {}", msg)
            }

            TradingError::SymbolConflict { symbol, first, second } => {
                write!(
                    f,
                    "Symbol exclusivity violation: {} assigned to both {} and {}",
                    symbol, first, second
                )
            }

            TradingError::FileRead(msg) => {
                write!(f, "File read error: {}", msg)
            }
            TradingError::FileWrite(msg) => {
                write!(f, "File write error: {}", msg)
            }

            TradingError::Internal(msg) => {
                write!(f, "Internal error: {}", msg)
            }
        }
    }
}

impl std::error::Error for TradingError {}

// Conversion implementations for common error types

impl From<ExchangeError> for TradingError {
    fn from(err: ExchangeError) -> Self {
        TradingError::Exchange(err)
    }
}

impl From<io::Error> for TradingError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
                TradingError::FileRead(err.to_string())
            }
            _ => TradingError::Internal(format!("IO error: {}", err)),
        }
    }
}

impl From<serde_json::Error> for TradingError {
    fn from(err: serde_json::Error) -> Self {
        TradingError::StateCorruption(format!("JSON error: {}", err))
    }
}

impl From<ConfigError> for TradingError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::FileRead(msg) => TradingError::ConfigNotFound(msg),
            ConfigError::FileWrite(msg) => TradingError::FileWrite(msg),
            ConfigError::Parse(msg) | ConfigError::Serialize(msg) => TradingError::ConfigParse(msg),
            ConfigError::Validation(msg) => TradingError::ConfigValidation(msg),
        }
    }
}

impl From<String> for TradingError {
    fn from(msg: String) -> Self {
        TradingError::Internal(msg)
    }
}

impl From<&str> for TradingError {
    fn from(msg: &str) -> Self {
        TradingError::Internal(msg.to_string())
    }
}

/// Result type alias using TradingError
pub type TradingResult<T> = Result<T, TradingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TradingError::ConfigNotFound("config.toml".to_string());
        assert!(err.to_string().contains("config.toml"));
    }

    #[test]
    fn test_error_category() {
        let err = TradingError::ConfigValidation("test".to_string());
        assert_eq!(err.category(), "config");

        let err = TradingError::CircuitBreakerTripped("BTCUSD".to_string());
        assert_eq!(err.category(), "halt");

        let err = TradingError::from(ExchangeError::Network("reset".to_string()));
        assert_eq!(err.category(), "exchange");
    }

    #[test]
    fn test_retryable() {
        let err = TradingError::Exchange(ExchangeError::RateLimited("429".to_string()));
        assert!(err.is_retryable());

        let err = TradingError::Exchange(ExchangeError::Rejected("min notional".to_string()));
        assert!(!err.is_retryable());

        let err = TradingError::StateCorruption("eof".to_string());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_stop_loss_failure_demands_manual_action() {
        let err = TradingError::StopLossExecutionFailure("ETHUSD 1.5".to_string());
        let msg = err.user_message();
        assert!(msg.contains("ACTION REQUIRED"));
        assert!(msg.contains("ETHUSD"));
    }

    #[test]
    fn test_symbol_conflict_message() {
        let err = TradingError::SymbolConflict {
            symbol: "SOLUSD".to_string(),
            first: "balanced".to_string(),
            second: "aggressive".to_string(),
        };
        assert!(err.to_string().contains("SOLUSD"));
        assert!(err.user_message().contains("exactly one instance"));
    }

    #[test]
    fn test_io_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "test");
        let trading_err: TradingError = io_err.into();
        assert!(matches!(trading_err, TradingError::FileRead(_)));
    }
}
