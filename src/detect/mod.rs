//! Online anomaly detection over snapshot feature rows.

pub mod detector;
pub mod explain;
pub mod half_space;

pub use detector::{DetectorConfig, ScoreRow, StreamingAnomalyDetector};
pub use half_space::Scorable;
