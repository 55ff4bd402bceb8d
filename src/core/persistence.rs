// Per-instance state records, written with temp-file-then-rename

use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::grid_engine::GridEngineState;
use super::mode_manager::ModeState;
use super::stop_loss::StopLossManager;
use crate::error::{TradingError, TradingResult};
use crate::types::TradingMode;

/// Everything one instance needs to resume after a restart
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceState {
    pub instance_id: String,
    pub saved_at: DateTime<Utc>,
    pub mode: ModeState,
    #[serde(default)]
    pub symbols: BTreeMap<String, SymbolRecord>,
    pub ledger: LedgerRecord,
    #[serde(default)]
    pub stop_losses: StopLossManager,
    #[serde(default)]
    pub halted: Option<String>,
    #[serde(default)]
    pub last_rebalance: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolRecord {
    pub mode: TradingMode,
    #[serde(default)]
    pub engine: Option<GridEngineState>,
    #[serde(default)]
    pub held_quantity: f64,
    #[serde(default)]
    pub entry_price: Option<f64>,
    #[serde(default)]
    pub stop_loss_id: Option<String>,
    #[serde(default)]
    pub allocation_usd: f64,
    /// A stop closed the position; no re-entry until the next mode change
    #[serde(default)]
    pub stopped_out: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub starting_capital: f64,
    pub cash: f64,
    #[serde(default)]
    pub fees_paid: f64,
    #[serde(default)]
    pub day_start_equity: Option<f64>,
    #[serde(default)]
    pub day: Option<NaiveDate>,
}

/// `<state_dir>/<instance_id>.json`
pub fn state_path(state_dir: impl AsRef<Path>, instance_id: &str) -> PathBuf {
    state_dir.as_ref().join(format!("{}.json", instance_id))
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Serialize to a sibling temp file, flush it to disk, then rename over
/// the target. A crash at any point leaves either the old or the new file.
pub fn write_atomic<T: Serialize>(path: &Path, value: &T) -> TradingResult<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).map_err(|e| TradingError::FileWrite(format!("{}: {}", dir.display(), e)))?;
    }

    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| TradingError::Internal(format!("state serialization failed: {}", e)))?;
    let tmp = temp_path(path);

    let mut file = fs::File::create(&tmp).map_err(|e| TradingError::FileWrite(format!("{}: {}", tmp.display(), e)))?;
    file.write_all(&json)
        .and_then(|_| file.sync_all())
        .map_err(|e| TradingError::FileWrite(format!("{}: {}", tmp.display(), e)))?;
    drop(file);

    fs::rename(&tmp, path).map_err(|e| TradingError::FileWrite(format!("{} -> {}: {}", tmp.display(), path.display(), e)))?;
    debug!("💾 State written to {}", path.display());
    Ok(())
}

/// `Ok(None)` when no state was ever written; `StateCorruption` when the
/// file exists but does not parse.
pub fn read_state<T: DeserializeOwned>(path: &Path) -> TradingResult<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(TradingError::FileRead(format!("{}: {}", path.display(), e))),
    };

    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| TradingError::StateCorruption(format!("{}: {}", path.display(), e)))
}
