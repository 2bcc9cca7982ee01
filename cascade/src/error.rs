//! Error taxonomy for the cascade engine.
//!
//! | Error                 | Raised by            | Terminal |
//! |-----------------------|----------------------|----------|
//! | `RateLimited`         | token bucket         | yes      |
//! | `BudgetExceeded`      | budget governor      | yes      |
//! | `ProviderUnavailable` | provider ordering    | yes      |
//! | `ProviderError`       | one provider attempt | no       |
//! | `CascadeExhausted`    | scheduler            | yes      |
//!
//! Per-attempt failures ([`crate::providers::ProviderError`]) are absorbed by
//! the scheduler and only show up inside `AttemptRecord`s. Everything here is
//! `Clone` because a single outcome is broadcast to every coalesced caller.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::budget::WindowKind;
use crate::types::AttemptRecord;

/// Terminal outcome of a fetch that produced no result.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CascadeError {
    /// No rate-limit token was available. Backing off is the caller's job.
    #[error("rate limited: next token in {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Spending on any eligible provider would breach a window ceiling.
    #[error("budget exceeded: {window} limit reached")]
    BudgetExceeded { window: WindowKind },

    /// Every provider was filtered out before an attempt was made.
    #[error("no eligible provider: {reason}")]
    ProviderUnavailable { reason: String },

    /// Every attempted provider failed.
    #[error("cascade exhausted after {} attempt(s)", .attempts.len())]
    CascadeExhausted { attempts: Vec<AttemptRecord> },

    /// The executing task ended without publishing an outcome.
    #[error("execution interrupted: {reason}")]
    Interrupted { reason: String },
}

impl CascadeError {
    /// Stable label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::BudgetExceeded { .. } => "budget_exceeded",
            Self::ProviderUnavailable { .. } => "provider_unavailable",
            Self::CascadeExhausted { .. } => "cascade_exhausted",
            Self::Interrupted { .. } => "interrupted",
        }
    }

    /// Whether an identical call may succeed later without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::CascadeExhausted { .. } | Self::Interrupted { .. }
        )
    }

    /// Attempts made before the failure, if any.
    pub fn attempts(&self) -> &[AttemptRecord] {
        match self {
            Self::CascadeExhausted { attempts } => attempts,
            _ => &[],
        }
    }
}

/// Configuration rejected at load or construction time.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
}

pub type CascadeOutcome = Result<crate::types::CascadeResult, CascadeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_exceeded_names_window() {
        let err = CascadeError::BudgetExceeded {
            window: WindowKind::Monthly,
        };
        assert_eq!(err.to_string(), "budget exceeded: monthly limit reached");
        assert_eq!(err.kind(), "budget_exceeded");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_exhausted_carries_attempts() {
        let err = CascadeError::CascadeExhausted {
            attempts: vec![AttemptRecord {
                provider: "solver".into(),
                success: false,
                status_code: Some(503),
                cost: 0.0,
                duration_ms: 12,
                error: Some("HTTP 503".into()),
            }],
        };
        assert_eq!(err.attempts().len(), 1);
        assert_eq!(err.to_string(), "cascade exhausted after 1 attempt(s)");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_error_serde_tagged() {
        let err = CascadeError::RateLimited {
            retry_after_ms: 40,
        };
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"kind\":\"rate_limited\""));
        let parsed: CascadeError = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, err);
    }
}
