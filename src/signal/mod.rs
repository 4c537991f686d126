// =============================================================================
// Signal pipeline — order-book and tape analysis
// =============================================================================

pub mod analyzer;
pub mod factors;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::Side;

pub use analyzer::{SignalAnalyzer, TradingStyle};
pub use factors::FactorScores;

/// Direction recommended by the analyser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
    Wait,
}

impl Direction {
    pub fn side(&self) -> Option<Side> {
        match self {
            Self::Long => Some(Side::Long),
            Self::Short => Some(Side::Short),
            Self::Wait => None,
        }
    }

    pub fn is_actionable(&self) -> bool {
        !matches!(self, Self::Wait)
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
            Self::Wait => write!(f, "WAIT"),
        }
    }
}

/// A complete trading signal for one symbol.
#[derive(Debug, Clone, Serialize)]
pub struct Signal {
    pub symbol: String,
    pub direction: Direction,
    /// 0..=100.
    pub confidence: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit_1: f64,
    pub take_profit_2: f64,
    pub risk_reward: f64,
    pub reasons: Vec<String>,
    pub factor_scores: FactorScores,
    pub timestamp: DateTime<Utc>,
}

impl Signal {
    pub fn wait(symbol: &str, reason: impl Into<String>) -> Self {
        Self {
            symbol: symbol.to_string(),
            direction: Direction::Wait,
            confidence: 0.0,
            entry_price: 0.0,
            stop_loss: 0.0,
            take_profit_1: 0.0,
            take_profit_2: 0.0,
            risk_reward: 0.0,
            reasons: vec![reason.into()],
            factor_scores: FactorScores::default(),
            timestamp: Utc::now(),
        }
    }

    /// Priority used by the supervisor to rank competing signals.
    pub fn priority(&self) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        let expected_move = (self.take_profit_1 - self.entry_price).abs() / self.entry_price;
        self.confidence * expected_move * 100.0
    }
}
