use thiserror::Error;

/// Failure taxonomy surfaced by the public operations. Recompute-chain
/// internals swallow everything except `InvalidArgument` and `NotFound`;
/// see the tick engine for the propagation policy.
#[derive(Debug, Error)]
pub enum MarketError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("upstream unavailable: {0}")]
    Upstream(String),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("store failure: {0}")]
    Store(#[from] anyhow::Error),
}

impl MarketError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        MarketError::InvalidArgument(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        MarketError::NotFound(what.into())
    }
}

pub type MarketResult<T> = Result<T, MarketError>;
