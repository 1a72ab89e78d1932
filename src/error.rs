//! Error types shared across the library.

use thiserror::Error;

/// Errors surfaced by the feature builder and anomaly detector.
#[derive(Debug, Error)]
pub enum Error {
    /// The route map contained no (route, direction) entries at all, so there
    /// is nothing to monitor. Distinct from an empty snapshot, which is fine.
    #[error("route map is empty, no monitored keys can be derived")]
    EmptyRouteMap,

    /// A detector hyper-parameter failed validation at construction.
    #[error("invalid detector config: {0}")]
    InvalidConfig(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Persisted detector state could not be decoded. The caller must not
    /// continue with a partially reconstructed detector.
    #[error("failed to decode detector state: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
