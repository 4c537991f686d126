// =============================================================================
// Exchange error taxonomy
// =============================================================================
//
// Recovery policy by kind:
//   Transport    — retry with bounded exponential backoff.
//   Protocol     — drop the frame / response, log at debug.
//   SequenceGap  — mark the book unsynced, throttled resync.
//   Business     — never retried automatically; logged and skipped. The one
//                  exception is "no need to change margin type", which callers
//                  treat as success via `is_margin_type_noop`.
//   Invariant    — cancel work for the affected symbol, re-fetch from exchange.
// =============================================================================

use thiserror::Error;

/// Binance error code returned when the margin type is already set.
const CODE_MARGIN_TYPE_NOOP: i64 = -4046;
/// Binance error code for cancelling an order that no longer exists.
const CODE_UNKNOWN_ORDER: i64 = -2011;

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("depth sequence gap: expected pu={expected}, got pu={got}")]
    SequenceGap { expected: u64, got: u64 },

    #[error("exchange rejected request (code {code}): {message}")]
    Business { code: i64, message: String },

    #[error("internal invariant violated: {0}")]
    Invariant(String),
}

impl ExchangeError {
    /// "No need to change margin type" — idempotent success, not a failure.
    pub fn is_margin_type_noop(&self) -> bool {
        matches!(self, Self::Business { code, .. } if *code == CODE_MARGIN_TYPE_NOOP)
    }

    /// The order was already gone when we tried to cancel it.
    pub fn is_unknown_order(&self) -> bool {
        matches!(self, Self::Business { code, .. } if *code == CODE_UNKNOWN_ORDER)
    }
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn margin_noop_is_recognised() {
        let err = ExchangeError::Business {
            code: -4046,
            message: "No need to change margin type.".into(),
        };
        assert!(err.is_margin_type_noop());
        assert!(!err.is_unknown_order());
    }

    #[test]
    fn unknown_order_is_recognised() {
        let err = ExchangeError::Business {
            code: -2011,
            message: "Unknown order sent.".into(),
        };
        assert!(err.is_unknown_order());
    }
}
