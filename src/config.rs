// Configuration management for the hybrid grid bot

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::types::TradingMode;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    #[serde(default = "default_quote_asset")]
    pub quote_asset: String,
    #[serde(default = "default_rate_limit_calls")]
    pub rate_limit_calls: u32,
    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_paper_balance")]
    pub paper_balance: f64,
    #[serde(default = "default_fee_rate")]
    pub fee_rate: f64,
    #[serde(default = "default_price_feed_url")]
    pub price_feed_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_stop_loss_interval_secs")]
    pub stop_loss_interval_secs: u64,
    #[serde(default = "default_mode_eval_interval_secs")]
    pub mode_eval_interval_secs: u64,
    /// Periodic orphan sweep, 0 disables it (startup sweep always runs)
    #[serde(default = "default_reconcile_interval_hours")]
    pub reconcile_interval_hours: u64,
    #[serde(default = "default_rebalance_interval_hours")]
    pub rebalance_interval_hours: u64,
    #[serde(default = "default_rebalance_drift_pct")]
    pub rebalance_drift_pct: f64,
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    #[serde(default = "default_regime_file")]
    pub regime_file: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConstraintPreset {
    /// Profile follows the active mode
    Mode,
    /// Small-portfolio caps while in GRID
    Small,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeConfig {
    #[serde(default = "default_initial_mode")]
    pub initial_mode: TradingMode,
    #[serde(default = "default_true")]
    pub enable_mode_switching: bool,
    #[serde(default = "default_min_regime_probability")]
    pub min_regime_probability: f64,
    #[serde(default = "default_min_regime_duration_days")]
    pub min_regime_duration_days: f64,
    #[serde(default = "default_cooldown_hours")]
    pub cooldown_hours: i64,
    #[serde(default = "default_emergency_bear_probability")]
    pub emergency_bear_probability: f64,
    #[serde(default = "default_max_transitions_in_window")]
    pub max_transitions_in_window: usize,
    #[serde(default = "default_transition_window_hours")]
    pub transition_window_hours: i64,
    #[serde(default = "default_lock_duration_days")]
    pub lock_duration_days: i64,
    #[serde(default = "default_constraint_preset")]
    pub constraint_preset: ConstraintPreset,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    #[serde(default = "default_grid_count")]
    pub grid_count: usize,
    #[serde(default = "default_range_pct")]
    pub range_pct: f64,
    #[serde(default = "default_price_tolerance")]
    pub price_tolerance: f64,
    #[serde(default = "default_fee_rate")]
    pub taker_fee_rate: f64,
    #[serde(default = "default_retry_delays_minutes")]
    pub retry_delays_minutes: Vec<i64>,
    #[serde(default = "default_max_followup_attempts")]
    pub max_followup_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_max_daily_loss_pct")]
    pub max_daily_loss_pct: f64,
    #[serde(default = "default_circuit_breaker_pct")]
    pub circuit_breaker_pct: f64,
    /// A move this large halts every instance, not just the one that saw it
    #[serde(default = "default_catastrophic_move_pct")]
    pub catastrophic_move_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopLossConfig {
    #[serde(default = "default_hold_trailing_pct")]
    pub hold_trailing_pct: f64,
    #[serde(default = "default_cash_tighten_pct")]
    pub cash_tighten_pct: f64,
    #[serde(default = "default_max_sell_attempts")]
    pub max_sell_attempts: u32,
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: Vec<u64>,
    #[serde(default = "default_max_daily_drawdown_pct")]
    pub max_daily_drawdown_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub id: String,
    pub capital: f64,
    pub symbols: Vec<String>,
    /// Relative weights per symbol, equal weights when empty
    #[serde(default)]
    pub weights: BTreeMap<String, f64>,
    /// Symbol categories used by the allocation constraints
    #[serde(default)]
    pub categories: BTreeMap<String, String>,
    /// Skip the drawdown check when the account is shared with siblings
    #[serde(default)]
    pub bypass_drawdown_check: bool,
    /// Override of the global grid count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grid_count: Option<usize>,
    /// Override of the global range percent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_pct: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub mode: ModeConfig,
    #[serde(default)]
    pub grid: GridConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub stop_loss: StopLossConfig,
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

// Default value functions
fn default_quote_asset() -> String {
    "USD".to_string()
}

fn default_rate_limit_calls() -> u32 {
    15
}

fn default_rate_limit_window_secs() -> u64 {
    1
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_paper_balance() -> f64 {
    10_000.0
}

fn default_fee_rate() -> f64 {
    0.001
}

fn default_price_feed_url() -> String {
    "https://api.kraken.com/0/public/Ticker".to_string()
}

fn default_tick_interval_secs() -> u64 {
    30
}

fn default_stop_loss_interval_secs() -> u64 {
    15
}

fn default_mode_eval_interval_secs() -> u64 {
    3600
}

fn default_reconcile_interval_hours() -> u64 {
    6
}

fn default_rebalance_interval_hours() -> u64 {
    6
}

fn default_rebalance_drift_pct() -> f64 {
    5.0
}

fn default_max_consecutive_errors() -> u32 {
    5
}

fn default_max_backoff_secs() -> u64 {
    300
}

fn default_state_dir() -> String {
    "state".to_string()
}

fn default_regime_file() -> String {
    "state/regime.json".to_string()
}

fn default_initial_mode() -> TradingMode {
    TradingMode::Grid
}

fn default_true() -> bool {
    true
}

fn default_min_regime_probability() -> f64 {
    0.75
}

fn default_min_regime_duration_days() -> f64 {
    2.0
}

fn default_cooldown_hours() -> i64 {
    24
}

fn default_emergency_bear_probability() -> f64 {
    0.85
}

fn default_max_transitions_in_window() -> usize {
    2
}

fn default_transition_window_hours() -> i64 {
    48
}

fn default_lock_duration_days() -> i64 {
    7
}

fn default_constraint_preset() -> ConstraintPreset {
    ConstraintPreset::Small
}

fn default_grid_count() -> usize {
    4
}

fn default_range_pct() -> f64 {
    5.0
}

fn default_price_tolerance() -> f64 {
    crate::types::PRICE_TOLERANCE
}

fn default_retry_delays_minutes() -> Vec<i64> {
    vec![2, 5, 15, 30, 60]
}

fn default_max_followup_attempts() -> u32 {
    5
}

fn default_max_daily_loss_pct() -> f64 {
    10.0
}

fn default_circuit_breaker_pct() -> f64 {
    10.0
}

fn default_catastrophic_move_pct() -> f64 {
    25.0
}

fn default_hold_trailing_pct() -> f64 {
    7.0
}

fn default_cash_tighten_pct() -> f64 {
    3.0
}

fn default_max_sell_attempts() -> u32 {
    3
}

fn default_backoff_secs() -> Vec<u64> {
    vec![2, 5, 10]
}

fn default_max_daily_drawdown_pct() -> f64 {
    10.0
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            quote_asset: default_quote_asset(),
            rate_limit_calls: default_rate_limit_calls(),
            rate_limit_window_secs: default_rate_limit_window_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            paper_balance: default_paper_balance(),
            fee_rate: default_fee_rate(),
            price_feed_url: default_price_feed_url(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            stop_loss_interval_secs: default_stop_loss_interval_secs(),
            mode_eval_interval_secs: default_mode_eval_interval_secs(),
            reconcile_interval_hours: default_reconcile_interval_hours(),
            rebalance_interval_hours: default_rebalance_interval_hours(),
            rebalance_drift_pct: default_rebalance_drift_pct(),
            max_consecutive_errors: default_max_consecutive_errors(),
            max_backoff_secs: default_max_backoff_secs(),
            state_dir: default_state_dir(),
            regime_file: default_regime_file(),
        }
    }
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self {
            initial_mode: default_initial_mode(),
            enable_mode_switching: true,
            min_regime_probability: default_min_regime_probability(),
            min_regime_duration_days: default_min_regime_duration_days(),
            cooldown_hours: default_cooldown_hours(),
            emergency_bear_probability: default_emergency_bear_probability(),
            max_transitions_in_window: default_max_transitions_in_window(),
            transition_window_hours: default_transition_window_hours(),
            lock_duration_days: default_lock_duration_days(),
            constraint_preset: default_constraint_preset(),
        }
    }
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            grid_count: default_grid_count(),
            range_pct: default_range_pct(),
            price_tolerance: default_price_tolerance(),
            taker_fee_rate: default_fee_rate(),
            retry_delays_minutes: default_retry_delays_minutes(),
            max_followup_attempts: default_max_followup_attempts(),
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_daily_loss_pct: default_max_daily_loss_pct(),
            circuit_breaker_pct: default_circuit_breaker_pct(),
            catastrophic_move_pct: default_catastrophic_move_pct(),
        }
    }
}

impl Default for StopLossConfig {
    fn default() -> Self {
        Self {
            hold_trailing_pct: default_hold_trailing_pct(),
            cash_tighten_pct: default_cash_tighten_pct(),
            max_sell_attempts: default_max_sell_attempts(),
            backoff_secs: default_backoff_secs(),
            max_daily_drawdown_pct: default_max_daily_drawdown_pct(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exchange: ExchangeConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            mode: ModeConfig::default(),
            grid: GridConfig::default(),
            risk: RiskConfig::default(),
            stop_loss: StopLossConfig::default(),
            instances: vec![
                InstanceConfig {
                    id: "balanced".to_string(),
                    capital: 1000.0,
                    symbols: vec!["XBTUSD".to_string(), "ETHUSD".to_string()],
                    weights: BTreeMap::new(),
                    categories: BTreeMap::from([
                        ("XBTUSD".to_string(), "LARGE_CAP".to_string()),
                        ("ETHUSD".to_string(), "LARGE_CAP".to_string()),
                    ]),
                    bypass_drawdown_check: true,
                    grid_count: None,
                    range_pct: None,
                },
                InstanceConfig {
                    id: "aggressive".to_string(),
                    capital: 1000.0,
                    symbols: vec!["SOLUSD".to_string()],
                    weights: BTreeMap::new(),
                    categories: BTreeMap::new(),
                    bypass_drawdown_check: true,
                    grid_count: Some(6),
                    range_pct: Some(8.0),
                },
            ],
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(e.to_string()))?;

        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialize(e.to_string()))?;

        fs::write(path, content)
            .map_err(|e| ConfigError::FileWrite(e.to_string()))?;

        Ok(())
    }

    /// Load configuration from file, or create default if file doesn't exist
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            let config = Self::default();
            config.to_file(&path)?;
            tracing::info!("📁 Created default config file: {}", path.as_ref().display());
            Ok(config)
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instances.is_empty() {
            return Err(ConfigError::Validation("at least one [[instances]] entry is required".to_string()));
        }

        for instance in &self.instances {
            if instance.id.trim().is_empty() {
                return Err(ConfigError::Validation("instance id must not be empty".to_string()));
            }
            if instance.capital <= 0.0 {
                return Err(ConfigError::Validation(format!("instance {}: capital must be positive", instance.id)));
            }
            if instance.symbols.is_empty() {
                return Err(ConfigError::Validation(format!("instance {}: symbols must not be empty", instance.id)));
            }
            if instance.weights.values().any(|w| *w < 0.0) {
                return Err(ConfigError::Validation(format!("instance {}: weights must be non-negative", instance.id)));
            }
            if let Some(unknown) = instance.weights.keys().find(|s| !instance.symbols.contains(s)) {
                return Err(ConfigError::Validation(format!(
                    "instance {}: weight given for unassigned symbol {}",
                    instance.id, unknown
                )));
            }
            if instance.grid_count == Some(0) {
                return Err(ConfigError::Validation(format!("instance {}: grid_count must be greater than 0", instance.id)));
            }
        }

        let mut ids: Vec<&str> = self.instances.iter().map(|i| i.id.as_str()).collect();
        ids.sort_unstable();
        if ids.windows(2).any(|w| w[0] == w[1]) {
            return Err(ConfigError::Validation("instance ids must be unique".to_string()));
        }

        if !(0.5..=1.0).contains(&self.mode.min_regime_probability) {
            return Err(ConfigError::Validation("min_regime_probability must be between 0.5 and 1.0".to_string()));
        }

        if !(0.0..=1.0).contains(&self.mode.emergency_bear_probability) {
            return Err(ConfigError::Validation("emergency_bear_probability must be between 0.0 and 1.0".to_string()));
        }

        if self.mode.min_regime_duration_days < 0.0 || self.mode.cooldown_hours < 0 {
            return Err(ConfigError::Validation("mode durations must be non-negative".to_string()));
        }

        if self.grid.grid_count == 0 {
            return Err(ConfigError::Validation("grid_count must be greater than 0".to_string()));
        }

        if self.grid.range_pct <= 0.0 || self.grid.range_pct >= 100.0 {
            return Err(ConfigError::Validation("range_pct must be between 0 and 100".to_string()));
        }

        if self.grid.retry_delays_minutes.is_empty() || self.grid.max_followup_attempts == 0 {
            return Err(ConfigError::Validation("follow-up retry schedule must not be empty".to_string()));
        }

        if self.stop_loss.max_sell_attempts == 0 {
            return Err(ConfigError::Validation("max_sell_attempts must be greater than 0".to_string()));
        }

        if self.risk.circuit_breaker_pct <= 0.0 || self.risk.catastrophic_move_pct < self.risk.circuit_breaker_pct {
            return Err(ConfigError::Validation(
                "catastrophic_move_pct must be at least circuit_breaker_pct (both positive)".to_string(),
            ));
        }

        if self.orchestrator.tick_interval_secs == 0 || self.orchestrator.max_consecutive_errors == 0 {
            return Err(ConfigError::Validation("tick interval and error limit must be positive".to_string()));
        }

        if self.exchange.rate_limit_calls == 0 {
            return Err(ConfigError::Validation("rate_limit_calls must be greater than 0".to_string()));
        }

        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.orchestrator.tick_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.exchange.request_timeout_secs)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(String),

    #[error("Failed to write config file: {0}")]
    FileWrite(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Failed to serialize config: {0}")]
    Serialize(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}
