// Allocation constraint profiles

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::ConstraintPreset;
use crate::types::TradingMode;

/// Category assumed for symbols without an explicit one
pub const DEFAULT_CATEGORY: &str = "MID_CAP";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationConstraints {
    pub name: String,
    pub max_per_coin_pct: f64,
    pub max_per_category_pct: f64,
    pub category_limits: BTreeMap<String, f64>,
    pub min_cash_reserve_pct: f64,
    pub max_open_positions: usize,
    pub max_total_exposure_pct: f64,
    pub min_position_usd: f64,
}

fn default_category_limits() -> BTreeMap<String, f64> {
    BTreeMap::from([
        ("LARGE_CAP".to_string(), 40.0),
        ("MID_CAP".to_string(), 30.0),
        ("L2".to_string(), 20.0),
        ("DEFI".to_string(), 20.0),
        ("AI".to_string(), 15.0),
        ("GAMING".to_string(), 10.0),
    ])
}

impl AllocationConstraints {
    pub fn conservative() -> Self {
        Self {
            name: "CONSERVATIVE".to_string(),
            max_per_coin_pct: 8.0,
            max_per_category_pct: 25.0,
            category_limits: default_category_limits(),
            min_cash_reserve_pct: 30.0,
            max_open_positions: 6,
            max_total_exposure_pct: 70.0,
            min_position_usd: 10.0,
        }
    }

    pub fn balanced() -> Self {
        Self {
            name: "BALANCED".to_string(),
            max_per_coin_pct: 10.0,
            max_per_category_pct: 30.0,
            category_limits: default_category_limits(),
            min_cash_reserve_pct: 20.0,
            max_open_positions: 10,
            max_total_exposure_pct: 80.0,
            min_position_usd: 10.0,
        }
    }

    pub fn aggressive() -> Self {
        Self {
            name: "AGGRESSIVE".to_string(),
            max_per_coin_pct: 15.0,
            max_per_category_pct: 40.0,
            category_limits: default_category_limits(),
            min_cash_reserve_pct: 10.0,
            max_open_positions: 15,
            max_total_exposure_pct: 90.0,
            min_position_usd: 10.0,
        }
    }

    /// Caps sized for portfolios of a few hundred dollars
    pub fn small_portfolio() -> Self {
        Self {
            name: "SMALL".to_string(),
            max_per_coin_pct: 40.0,
            max_per_category_pct: 50.0,
            category_limits: default_category_limits(),
            min_cash_reserve_pct: 15.0,
            max_open_positions: 8,
            max_total_exposure_pct: 85.0,
            min_position_usd: 10.0,
        }
    }

    /// Active profile for a mode
    pub fn for_mode(mode: TradingMode, preset: ConstraintPreset) -> Self {
        match mode {
            TradingMode::Hold => Self::aggressive(),
            TradingMode::Grid => match preset {
                ConstraintPreset::Small => Self::small_portfolio(),
                ConstraintPreset::Mode => Self::balanced(),
            },
            TradingMode::Cash => Self::conservative(),
        }
    }

    /// Largest share of capital (percent) one symbol may take
    pub fn max_pct_for_coin(&self, category: &str) -> f64 {
        let category_cap = self
            .category_limits
            .get(category)
            .copied()
            .unwrap_or(self.max_per_category_pct);
        self.max_per_coin_pct.min(category_cap)
    }

    pub fn max_usd_for_coin(&self, total_capital: f64, category: &str) -> f64 {
        total_capital * self.max_pct_for_coin(category) / 100.0
    }

    pub fn category_cap_pct(&self, category: &str) -> f64 {
        self.category_limits
            .get(category)
            .copied()
            .unwrap_or(self.max_per_category_pct)
    }

    /// Capital still deployable after the cash reserve and exposure cap
    pub fn available_capital(&self, total_capital: f64, invested: f64) -> f64 {
        let min_cash = total_capital * self.min_cash_reserve_pct / 100.0;
        let max_invested = total_capital * self.max_total_exposure_pct / 100.0;

        (total_capital - invested - min_cash)
            .min(max_invested - invested)
            .max(0.0)
    }
}
