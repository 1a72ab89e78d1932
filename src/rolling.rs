//! Per-key rolling history: bounded FIFO windows and the mutable state the
//! feature builder keeps for every monitored (station, direction) key.

use std::collections::VecDeque;

/// A fixed-capacity FIFO of recent values. Pushing beyond capacity evicts
/// the oldest entry.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    values: VecDeque<f64>,
    capacity: usize,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.values.len() == self.capacity
    }

    pub fn values(&self) -> Vec<f64> {
        self.values.iter().copied().collect()
    }
}

/// Rolling history for one (station, direction) key.
///
/// Exactly one instance exists per monitored key, owned by the feature
/// builder; it is mutated only for keys selected in the current snapshot and
/// lives for the process lifetime.
#[derive(Debug, Clone)]
pub struct RollingState {
    pub last_actual_arrival: Option<i64>,
    pub last_actual_departure: Option<i64>,
    pub last_sched_arrival: Option<f64>,
    pub last_arrival_delay: f64,
    pub last_departure_delay: f64,
    /// Trip seen at the most recent real observation, used to suppress
    /// duplicate emissions of the same trip across consecutive snapshots.
    pub last_trip_id: Option<String>,
    pub rolling_delay_5: RollingWindow,
    pub rolling_delay_15: RollingWindow,
    pub rolling_headway_60: RollingWindow,
    pub last_vehicle_ts: Option<i64>,
}

impl RollingState {
    pub fn new() -> Self {
        Self {
            last_actual_arrival: None,
            last_actual_departure: None,
            last_sched_arrival: None,
            last_arrival_delay: 0.0,
            last_departure_delay: 0.0,
            last_trip_id: None,
            rolling_delay_5: RollingWindow::new(5),
            rolling_delay_15: RollingWindow::new(15),
            rolling_headway_60: RollingWindow::new(60),
            last_vehicle_ts: None,
        }
    }

    /// Wholesale re-initialisation at a service-day boundary.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Whether this key has ever recorded a real arrival.
    pub fn has_observation(&self) -> bool {
        self.last_actual_arrival.is_some()
    }
}

impl Default for RollingState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_evicts_oldest() {
        let mut w = RollingWindow::new(3);
        for v in [1.0, 2.0, 3.0, 4.0] {
            w.push(v);
        }
        assert_eq!(w.values(), vec![2.0, 3.0, 4.0]);
        assert!(w.is_full());
    }

    #[test]
    fn test_window_not_full_below_capacity() {
        let mut w = RollingWindow::new(5);
        w.push(1.0);
        assert!(!w.is_full());
        assert_eq!(w.len(), 1);
    }

    #[test]
    fn test_state_reset_clears_everything() {
        let mut s = RollingState::new();
        s.last_actual_arrival = Some(1000);
        s.last_arrival_delay = 42.0;
        s.last_trip_id = Some("T1".to_string());
        s.rolling_delay_5.push(42.0);
        s.reset();
        assert!(!s.has_observation());
        assert_eq!(s.last_arrival_delay, 0.0);
        assert!(s.last_trip_id.is_none());
        assert!(s.rolling_delay_5.is_empty());
    }
}
