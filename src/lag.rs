//! Adaptive lag tolerance for late-arriving feed rows.
//!
//! Feeds publish with variable delay, so the acceptance window for a
//! snapshot's rows widens to track recently observed lag: the 95th
//! percentile of the last hour of per-minute lags plus a small buffer,
//! never below a configured floor. Kept separate from the feature builder
//! so the policy is testable on its own.

use crate::rolling::RollingWindow;
use crate::stats::quantile;

/// Ignore implausible lags when adapting; a row more than this far behind
/// the snapshot is stale feed residue, not publication delay.
const MAX_TRACKED_LAG_SECS: i64 = 600;

#[derive(Debug, Clone)]
pub struct LagTracker {
    history: RollingWindow,
    floor_secs: i64,
    buffer_secs: i64,
    lag_quantile: f64,
}

impl LagTracker {
    pub fn new(floor_secs: i64, window_minutes: usize, lag_quantile: f64, buffer_secs: i64) -> Self {
        Self {
            history: RollingWindow::new(window_minutes),
            floor_secs,
            buffer_secs,
            lag_quantile,
        }
    }

    /// Records the worst observed publication lag for one snapshot minute.
    /// `snapshot_timestamps` are the `snapshot_timestamp` fields of the raw
    /// input rows; lags are measured against the nominal snapshot time `ts`.
    pub fn observe(&mut self, ts: i64, snapshot_timestamps: impl IntoIterator<Item = i64>) {
        let max_lag = snapshot_timestamps
            .into_iter()
            .map(|st| (ts - st).max(0))
            .filter(|lag| *lag <= MAX_TRACKED_LAG_SECS)
            .max();
        if let Some(lag) = max_lag {
            self.history.push(lag as f64);
        }
    }

    /// Current acceptance window in seconds: rows with
    /// `snapshot_timestamp >= ts - current_lag_secs()` are admitted.
    pub fn current_lag_secs(&self) -> i64 {
        if self.history.is_empty() {
            return self.floor_secs;
        }
        let p = quantile(&self.history.values(), self.lag_quantile);
        self.floor_secs.max(p.ceil() as i64 + self.buffer_secs)
    }
}
