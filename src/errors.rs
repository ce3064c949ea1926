//! Error kinds for the quoting engine.
//!
//! Propagation policy:
//! - `VenueTransient` is retried inside the RPC layer; on exhaustion the
//!   containing job logs and moves to the next market.
//! - `BookUnsafe` is not an error upward: the cycle logs
//!   `SANITY_CHECK_FAILED` and skips the market.
//! - `DataDegraded` falls back to cached snapshots where safe and refuses
//!   destructive reconciliation.
//! - `Invariant` is fatal for the affected MM: log ERROR, pause it.
//! - `Config` at startup exits the process.

use thiserror::Error;

use crate::quoting::sanity::SanityReason;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Missing secrets, unparsable settings, invalid intervals.
    #[error("config error: {0}")]
    Config(String),

    /// Timeout, 5xx, rate-limited. Safe to retry.
    #[error("venue transient: {0}")]
    VenueTransient(String),

    /// Auth rejected, not found, 4xx. Retrying will not help.
    #[error("venue permanent: {0}")]
    VenuePermanent(String),

    /// A sanity-gate failure. Carries the specific reason code.
    #[error("book unsafe: {0}")]
    BookUnsafe(SanityReason),

    /// Positions feed returned none, push stream down, stale caches.
    #[error("data degraded: {0}")]
    DataDegraded(String),

    /// Negative inventory, missing token ids, broken bookkeeping.
    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),
}

impl EngineError {
    /// Whether the RPC layer may retry this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::VenueTransient(_))
    }

    /// Whether the error is fatal for the affected market maker.
    pub fn is_fatal_for_mm(&self) -> bool {
        matches!(self, EngineError::Invariant(_))
    }

    pub fn config(msg: impl Into<String>) -> Self {
        EngineError::Config(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        EngineError::VenueTransient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        EngineError::VenuePermanent(msg.into())
    }

    pub fn degraded(msg: impl Into<String>) -> Self {
        EngineError::DataDegraded(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        EngineError::Invariant(msg.into())
    }
}

/// Classify a reqwest failure into transient vs permanent.
pub fn classify_http(err: &reqwest::Error) -> EngineError {
    if err.is_timeout() || err.is_connect() {
        return EngineError::transient(err.to_string());
    }
    if let Some(status) = err.status() {
        if status.is_server_error() || status.as_u16() == 429 {
            return EngineError::transient(format!("http {status}"));
        }
        return EngineError::permanent(format!("http {status}"));
    }
    EngineError::transient(err.to_string())
}

/// Classify a bare HTTP status (for calls that inspect the response).
pub fn classify_status(status: reqwest::StatusCode, body: &str) -> EngineError {
    if status.is_server_error() || status.as_u16() == 429 {
        EngineError::transient(format!("http {status}: {body}"))
    } else if status.as_u16() == 404 {
        EngineError::permanent(format!("not found: {body}"))
    } else {
        EngineError::permanent(format!("http {status}: {body}"))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(EngineError::transient("timeout").is_transient());
        assert!(!EngineError::permanent("401").is_transient());
        assert!(!EngineError::invariant("negative inventory").is_transient());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(EngineError::invariant("yes_inventory < 0").is_fatal_for_mm());
        assert!(!EngineError::degraded("positions none").is_fatal_for_mm());
    }

    #[test]
    fn test_status_classification() {
        let s = reqwest::StatusCode::from_u16(503).unwrap();
        assert!(classify_status(s, "busy").is_transient());
        let s = reqwest::StatusCode::from_u16(401).unwrap();
        assert!(!classify_status(s, "bad key").is_transient());
    }
}
