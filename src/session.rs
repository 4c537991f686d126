// =============================================================================
// Session persistence — JSON summary written on shutdown
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::info;

use crate::app_state::AppState;
use crate::position::{ClosedTrade, TradeStatistics};
use crate::trader::Trader;

#[derive(Debug, Serialize)]
pub struct SessionSummary {
    pub generated_at: String,
    pub mode: String,
    pub starting_balance: f64,
    pub final_balance: f64,
    pub total_pnl: f64,
    pub max_drawdown: f64,
    pub statistics: TradeStatistics,
    pub closed_trades: Vec<ClosedTrade>,
}

impl SessionSummary {
    pub fn from_state(state: &AppState) -> Self {
        let trader = &state.trader;
        let starting_balance = trader.starting_balance();
        let final_balance = trader.balance();
        Self {
            generated_at: Utc::now().to_rfc3339(),
            mode: state.mode.to_string(),
            starting_balance,
            final_balance,
            total_pnl: final_balance - starting_balance,
            max_drawdown: trader.max_drawdown(),
            statistics: trader.statistics(),
            closed_trades: trader.closed_trades(),
        }
    }
}

/// Write the session summary atomically (tmp + rename) under `path`.
pub fn save_session(state: &AppState, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let summary = SessionSummary::from_state(state);
    let content =
        serde_json::to_string_pretty(&summary).context("failed to serialise session summary")?;

    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &content)
        .with_context(|| format!("failed to write {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename into {}", path.display()))?;

    info!(path = %path.display(), "session summary saved");
    Ok(())
}

/// Timestamped session path under results/.
pub fn default_session_path() -> std::path::PathBuf {
    std::path::PathBuf::from(format!(
        "results/session_{}.json",
        Utc::now().format("%Y%m%d_%H%M%S")
    ))
}
