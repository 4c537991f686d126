// =============================================================================
// Bot Configuration — JSON-backed settings with atomic save
// =============================================================================
//
// Every tunable lives here. All fields carry serde defaults so that loading an
// older config file never breaks. Persistence uses tmp + rename so a crash
// mid-write cannot corrupt the file.
//
// The averaging distance is the only field mutated at runtime (GUI slider);
// callers go through `AppState`, which owns the config behind a RwLock.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::TradeMode;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_pairs() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "SOLUSDT".to_string(),
        "XRPUSDT".to_string(),
        "DOGEUSDT".to_string(),
    ]
}

fn default_starting_balance() -> f64 {
    1000.0
}

fn default_leverage_min() -> u32 {
    50
}

fn default_leverage_max() -> u32 {
    100
}

fn default_max_positions() -> u32 {
    10
}

fn default_position_size_percent() -> f64 {
    2.0
}

fn default_margin_type() -> String {
    "ISOLATED".to_string()
}

fn default_min_confidence() -> f64 {
    75.0
}

fn default_min_confidence_short() -> f64 {
    73.0
}

fn default_cooldown_seconds() -> f64 {
    45.0
}

fn default_tape_window_seconds() -> f64 {
    20.0
}

fn default_min_imbalance() -> f64 {
    0.65
}

fn default_large_order_threshold() -> f64 {
    5000.0
}

fn default_max_price_change_pct() -> f64 {
    0.2
}

fn default_strictness_percent() -> f64 {
    50.0
}

fn default_stop_loss_percent() -> f64 {
    0.5
}

fn default_take_profit_multiplier() -> f64 {
    2.0
}

fn default_averaging_distance_pct() -> f64 {
    0.5
}

fn default_averaging_max_count() -> u32 {
    50
}

fn default_stepped_stop_activation_pnl() -> f64 {
    20.0
}

fn default_protective_refresh_interval() -> f64 {
    10.0
}

fn default_order_cleanup_interval() -> f64 {
    15.0
}

fn default_balance_cache_ttl() -> f64 {
    10.0
}

fn default_maintenance_margin_rate() -> f64 {
    0.004
}

fn default_reset_trigger_roi_pct() -> f64 {
    1.5
}

fn default_log_level() -> String {
    "info".to_string()
}

// =============================================================================
// Sections
// =============================================================================

/// Exchange credentials and base-URL selection.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ApiConfig {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub secret: String,
    /// Use the UM-futures testnet base URLs instead of mainnet.
    #[serde(default)]
    pub testnet: bool,
}

/// Account sizing and leverage bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Simulator only; live mode reads the wallet from the exchange.
    #[serde(default = "default_starting_balance")]
    pub starting_balance: f64,

    /// Lower bound for the confidence-to-leverage interpolation.
    #[serde(default = "default_leverage_min")]
    pub leverage_min: u32,

    /// Upper bound for the confidence-to-leverage interpolation.
    #[serde(default = "default_leverage_max")]
    pub leverage_max: u32,

    /// Cap on concurrently open *unprotected* positions.
    #[serde(default = "default_max_positions")]
    pub max_positions: u32,

    /// Fraction of the leveraged balance committed per entry (percent).
    #[serde(default = "default_position_size_percent")]
    pub position_size_percent: f64,

    #[serde(default = "default_margin_type")]
    pub margin_type: String,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            starting_balance: default_starting_balance(),
            leverage_min: default_leverage_min(),
            leverage_max: default_leverage_max(),
            max_positions: default_max_positions(),
            position_size_percent: default_position_size_percent(),
            margin_type: default_margin_type(),
        }
    }
}

/// Signal analyser tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalConfig {
    /// Minimum confidence to act on a LONG signal (percent).
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    /// Minimum confidence to act on a SHORT signal (percent).
    #[serde(default = "default_min_confidence_short")]
    pub min_confidence_short: f64,

    /// Suppression window after a non-WAIT signal for the same symbol.
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: f64,

    /// Time window of the trade tape fed into the analyser.
    #[serde(default = "default_tape_window_seconds")]
    pub tape_window_seconds: f64,

    /// Bid/ask share above which the deep book must confirm for the bonus.
    #[serde(default = "default_min_imbalance")]
    pub min_imbalance: f64,

    /// Notional (USDT) above which a resting order counts as a wall.
    #[serde(default = "default_large_order_threshold")]
    pub large_order_threshold: f64,

    /// Reject entries whose price drifted more than this from the signal (percent).
    #[serde(default = "default_max_price_change_pct")]
    pub max_price_change_pct: f64,

    /// Strictness 1..=100 driving probability thresholds and entry tiers.
    #[serde(default = "default_strictness_percent")]
    pub strictness_percent: f64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            min_confidence_short: default_min_confidence_short(),
            cooldown_seconds: default_cooldown_seconds(),
            tape_window_seconds: default_tape_window_seconds(),
            min_imbalance: default_min_imbalance(),
            large_order_threshold: default_large_order_threshold(),
            max_price_change_pct: default_max_price_change_pct(),
            strictness_percent: default_strictness_percent(),
        }
    }
}

/// Eco-mode margin reset after a recovered averaging cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetMarginConfig {
    #[serde(default)]
    pub enabled: bool,
    /// ROI (percent) at which the position is reduced back to its initial size.
    #[serde(default = "default_reset_trigger_roi_pct")]
    pub trigger_roi_pct: f64,
}

impl Default for ResetMarginConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            trigger_roi_pct: default_reset_trigger_roi_pct(),
        }
    }
}

/// Risk-management policy: SL/TP geometry, averaging, trailing stop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Stop-loss distance from entry (percent of price).
    #[serde(default = "default_stop_loss_percent")]
    pub stop_loss_percent: f64,

    /// TP1 = SL distance x this multiplier; TP2 additionally x pi.
    #[serde(default = "default_take_profit_multiplier")]
    pub take_profit_multiplier: f64,

    #[serde(default = "default_true")]
    pub averaging_down_enabled: bool,

    /// Distance of the averaging order from liquidation (percent of liq price).
    /// Hot-reloadable via the GUI slider.
    #[serde(default = "default_averaging_distance_pct")]
    pub averaging_distance_from_liq_pct: f64,

    #[serde(default = "default_averaging_max_count")]
    pub averaging_max_count: u32,

    /// false: each averaging leg replicates the current size.
    /// true: legs double from the initial size (2^count multiplier).
    #[serde(default)]
    pub averaging_martingale_enabled: bool,

    /// Defer the first averaging order until the position is in loss.
    #[serde(default = "default_true")]
    pub averaging_require_negative_roi: bool,

    #[serde(default = "default_true")]
    pub stepped_stop_enabled: bool,

    /// ROI (percent) at which the trailing-stop ladder activates.
    #[serde(default = "default_stepped_stop_activation_pnl")]
    pub stepped_stop_activation_pnl: f64,

    /// Seconds between protection ticks (position refresh + regime sweep).
    #[serde(default = "default_protective_refresh_interval")]
    pub protective_refresh_interval: f64,

    /// Seconds between order-hygiene sweeps.
    #[serde(default = "default_order_cleanup_interval")]
    pub order_cleanup_interval: f64,

    /// Seconds the cached available balance stays valid.
    #[serde(default = "default_balance_cache_ttl")]
    pub balance_cache_ttl: f64,

    /// Maintenance-margin rate used in liquidation maths.
    #[serde(default = "default_maintenance_margin_rate")]
    pub maintenance_margin_rate: f64,

    #[serde(default)]
    pub reset_margin_after_averaging: ResetMarginConfig,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            stop_loss_percent: default_stop_loss_percent(),
            take_profit_multiplier: default_take_profit_multiplier(),
            averaging_down_enabled: true,
            averaging_distance_from_liq_pct: default_averaging_distance_pct(),
            averaging_max_count: default_averaging_max_count(),
            averaging_martingale_enabled: false,
            averaging_require_negative_roi: true,
            stepped_stop_enabled: true,
            stepped_stop_activation_pnl: default_stepped_stop_activation_pnl(),
            protective_refresh_interval: default_protective_refresh_interval(),
            order_cleanup_interval: default_order_cleanup_interval(),
            balance_cache_ttl: default_balance_cache_ttl(),
            maintenance_margin_rate: default_maintenance_margin_rate(),
            reset_margin_after_averaging: ResetMarginConfig::default(),
        }
    }
}

/// Shutdown behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BehaviorConfig {
    /// Close every open position when the bot stops.
    #[serde(default)]
    pub close_positions_on_stop: bool,
}

/// Startup hygiene.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Terminate duplicate bot processes found at startup instead of exiting.
    #[serde(default = "default_true")]
    pub auto_terminate_duplicates: bool,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            auto_terminate_duplicates: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Write the session JSON under results/ on shutdown.
    #[serde(default = "default_true")]
    pub save_session: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            save_session: true,
        }
    }
}

// =============================================================================
// BotConfig
// =============================================================================

/// Top-level configuration for the Pulse engine.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BotConfig {
    #[serde(default)]
    pub api: ApiConfig,

    /// paper_trading | live_trading.
    #[serde(default)]
    pub mode: TradeMode,

    /// Symbols to subscribe and trade.
    #[serde(default = "default_pairs")]
    pub pairs: Vec<String>,

    #[serde(default)]
    pub account: AccountConfig,

    #[serde(default)]
    pub signals: SignalConfig,

    #[serde(default)]
    pub risk: RiskConfig,

    #[serde(default)]
    pub bot_behavior: BehaviorConfig,

    #[serde(default)]
    pub safety: SafetyConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl BotConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            mode = %config.mode,
            pairs = ?config.pairs,
            "configuration loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration using an atomic tmp + rename write.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Credentials are mandatory in live mode; paper mode runs without them.
    pub fn validate(&self) -> Result<()> {
        if self.mode == TradeMode::LiveTrading
            && (self.api.key.is_empty() || self.api.secret.is_empty())
        {
            anyhow::bail!("live_trading mode requires api.key and api.secret");
        }
        if self.account.leverage_min == 0 || self.account.leverage_max < self.account.leverage_min {
            anyhow::bail!(
                "invalid leverage bounds: min={} max={}",
                self.account.leverage_min,
                self.account.leverage_max
            );
        }
        if self.pairs.is_empty() {
            anyhow::bail!("at least one trading pair must be configured");
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = BotConfig::default();
        assert_eq!(cfg.mode, TradeMode::PaperTrading);
        assert_eq!(cfg.account.leverage_min, 50);
        assert_eq!(cfg.account.leverage_max, 100);
        assert_eq!(cfg.account.max_positions, 10);
        assert!((cfg.risk.stop_loss_percent - 0.5).abs() < f64::EPSILON);
        assert!((cfg.risk.averaging_distance_from_liq_pct - 0.5).abs() < f64::EPSILON);
        assert!((cfg.risk.stepped_stop_activation_pnl - 20.0).abs() < f64::EPSILON);
        assert!((cfg.risk.maintenance_margin_rate - 0.004).abs() < f64::EPSILON);
        assert!(cfg.risk.averaging_require_negative_roi);
        assert!(!cfg.risk.averaging_martingale_enabled);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: BotConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.mode, TradeMode::PaperTrading);
        assert!(cfg.risk.averaging_down_enabled);
        assert!(cfg.risk.stepped_stop_enabled);
        assert_eq!(cfg.pairs.len(), 5);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "mode": "live_trading", "pairs": ["ETHUSDT"], "risk": { "stop_loss_percent": 0.8 } }"#;
        let cfg: BotConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.mode, TradeMode::LiveTrading);
        assert_eq!(cfg.pairs, vec!["ETHUSDT"]);
        assert!((cfg.risk.stop_loss_percent - 0.8).abs() < f64::EPSILON);
        assert!((cfg.risk.take_profit_multiplier - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = BotConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: BotConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.pairs, cfg2.pairs);
        assert_eq!(cfg.account.max_positions, cfg2.account.max_positions);
        assert_eq!(cfg.mode, cfg2.mode);
    }

    #[test]
    fn live_mode_requires_credentials() {
        let mut cfg = BotConfig::default();
        cfg.mode = TradeMode::LiveTrading;
        assert!(cfg.validate().is_err());

        cfg.api.key = "k".into();
        cfg.api.secret = "s".into();
        assert!(cfg.validate().is_ok());
    }
}
