//! Per-minute snapshot feature engine.
//!
//! One call to [`SnapshotFeatureBuilder::build_snapshot_features`] turns the
//! trip-update and vehicle-position projections of a single snapshot minute
//! into exactly one [`FeatureRow`] per monitored (station, direction) key,
//! updating the per-key rolling state as it goes. Keys with no usable data
//! this minute get an explicit gap row so downstream consumers always see a
//! continuous per-key time series.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::lag::LagTracker;
use crate::rolling::RollingState;
use crate::service_day::{self, TimeFeatures};
use crate::stats::{mean, quantile, sample_stddev};
use crate::topology::{RouteMap, RouteTopology};

/// The unit of monitored state: a (stop_id, direction_id) pair.
pub type StationKey = (String, u8);

/// One stop-time projection from a trip-update feed entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TripUpdateRow {
    pub snapshot_timestamp: i64,
    pub trip_id: String,
    pub route_id: String,
    pub direction_id: u8,
    pub stop_id: String,
    pub arrival_time: i64,
    pub departure_time: i64,
    pub arrival_delay: f64,
    pub departure_delay: f64,
    pub stop_sequence: u32,
}

/// A confirmed vehicle observation at a station.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehiclePositionRow {
    pub snapshot_timestamp: i64,
    pub stop_id: String,
    pub direction_id: u8,
}

/// Tunables for the feature builder. Defaults match the monitored network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureConfig {
    /// Delays outside ±this bound are clipped before any computation, so one
    /// corrupt feed value cannot poison the rolling statistics.
    pub delay_cap_secs: f64,
    /// A "next arrival" more than this far ahead is not imminent and is dropped.
    pub max_future_secs: i64,
    /// Headways above this are overnight gaps, not service headways.
    pub max_headway_secs: f64,
    pub reset_at_hour: u32,
    /// Acceptance-window floors for late-arriving rows, per feed type.
    pub lag_tu_floor_secs: i64,
    pub lag_vp_floor_secs: i64,
    pub max_data_fresh_secs: i64,
    /// Slack on the past edge of the future-arrival filter, tolerating
    /// boundary rounding between feed and snapshot clocks.
    pub arrival_slack_secs: i64,
    pub lag_window_minutes: usize,
    pub lag_quantile: f64,
    pub lag_buffer_secs: i64,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            delay_cap_secs: 300.0,
            max_future_secs: 2 * 60 * 60,
            max_headway_secs: 3600.0,
            reset_at_hour: service_day::DEFAULT_RESET_AT_HOUR,
            lag_tu_floor_secs: 60,
            lag_vp_floor_secs: 30,
            max_data_fresh_secs: 24 * 3600,
            arrival_slack_secs: 1,
            lag_window_minutes: 60,
            lag_quantile: 0.95,
            lag_buffer_secs: 15,
        }
    }
}

/// One feature vector for one key in one snapshot.
///
/// The schema is fixed: `route_id` is always present (None unless the
/// snapshot spans several routes) and derived features are `None` on gap
/// rows. Identifier and context fields are always populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub snapshot_timestamp: i64,
    pub stop_id: String,
    pub direction_id: u8,
    pub route_id: Option<String>,

    pub arrival_delay_t: Option<f64>,
    pub departure_delay_t: Option<f64>,
    pub headway_t: Option<f64>,
    pub sched_headway_t: Option<f64>,
    pub rel_headway_t: Option<f64>,
    pub dwell_delta_t: Option<f64>,
    pub delay_arrival_grad_t: Option<f64>,
    pub delay_departure_grad_t: Option<f64>,
    pub upstream_delay_mean_2: Option<f64>,
    pub downstream_delay_max_2: Option<f64>,
    pub delay_mean_5: Option<f64>,
    pub delay_std_5: Option<f64>,
    pub delay_mean_15: Option<f64>,
    pub headway_p90_60: Option<f64>,

    pub sin_hour: f64,
    pub cos_hour: f64,
    pub day_type: u8,
    pub node_degree: u32,
    pub hub_flag: u8,
    pub is_train_present: u8,
    pub data_fresh_secs: i64,
}

impl FeatureRow {
    /// Numeric feature columns, i.e. everything except the identifier and
    /// time columns. Order matters: the detector locks this list on its
    /// first batch and feeds model vectors in this order.
    pub const FEATURE_NAMES: [&'static str; 21] = [
        "arrival_delay_t",
        "departure_delay_t",
        "headway_t",
        "sched_headway_t",
        "rel_headway_t",
        "dwell_delta_t",
        "delay_arrival_grad_t",
        "delay_departure_grad_t",
        "upstream_delay_mean_2",
        "downstream_delay_max_2",
        "delay_mean_5",
        "delay_std_5",
        "delay_mean_15",
        "headway_p90_60",
        "sin_hour",
        "cos_hour",
        "day_type",
        "node_degree",
        "hub_flag",
        "is_train_present",
        "data_fresh_secs",
    ];

    /// Looks up a numeric feature by column name. `None` means the value is
    /// missing for this row (a gap), not that the column is unknown.
    pub fn feature(&self, name: &str) -> Option<f64> {
        match name {
            "arrival_delay_t" => self.arrival_delay_t,
            "departure_delay_t" => self.departure_delay_t,
            "headway_t" => self.headway_t,
            "sched_headway_t" => self.sched_headway_t,
            "rel_headway_t" => self.rel_headway_t,
            "dwell_delta_t" => self.dwell_delta_t,
            "delay_arrival_grad_t" => self.delay_arrival_grad_t,
            "delay_departure_grad_t" => self.delay_departure_grad_t,
            "upstream_delay_mean_2" => self.upstream_delay_mean_2,
            "downstream_delay_max_2" => self.downstream_delay_max_2,
            "delay_mean_5" => self.delay_mean_5,
            "delay_std_5" => self.delay_std_5,
            "delay_mean_15" => self.delay_mean_15,
            "headway_p90_60" => self.headway_p90_60,
            "sin_hour" => Some(self.sin_hour),
            "cos_hour" => Some(self.cos_hour),
            "day_type" => Some(f64::from(self.day_type)),
            "node_degree" => Some(f64::from(self.node_degree)),
            "hub_flag" => Some(f64::from(self.hub_flag)),
            "is_train_present" => Some(f64::from(self.is_train_present)),
            "data_fresh_secs" => Some(self.data_fresh_secs as f64),
            _ => None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn gap(
        ts: i64,
        key: &StationKey,
        route_id: Option<String>,
        time: &TimeFeatures,
        node_degree: u32,
        hub_flag: u8,
        is_train_present: u8,
        data_fresh_secs: i64,
    ) -> Self {
        Self {
            snapshot_timestamp: ts,
            stop_id: key.0.clone(),
            direction_id: key.1,
            route_id,
            arrival_delay_t: None,
            departure_delay_t: None,
            headway_t: None,
            sched_headway_t: None,
            rel_headway_t: None,
            dwell_delta_t: None,
            delay_arrival_grad_t: None,
            delay_departure_grad_t: None,
            upstream_delay_mean_2: None,
            downstream_delay_max_2: None,
            delay_mean_5: None,
            delay_std_5: None,
            delay_mean_15: None,
            headway_p90_60: None,
            sin_hour: time.sin_hour,
            cos_hour: time.cos_hour,
            day_type: time.day_type,
            node_degree,
            hub_flag,
            is_train_present,
            data_fresh_secs,
        }
    }
}

/// Derives the route map from historical trip-update rows: stop lists
/// deduplicated and ordered by stop sequence number per (route, direction).
pub fn build_route_map(rows: &[TripUpdateRow]) -> RouteMap {
    let mut seen: BTreeSet<(String, u8, u32, String)> = BTreeSet::new();
    for r in rows {
        seen.insert((
            r.route_id.clone(),
            r.direction_id,
            r.stop_sequence,
            r.stop_id.clone(),
        ));
    }

    let mut map = RouteMap::new();
    for (route_id, direction_id, _seq, stop_id) in seen {
        let stops: &mut Vec<String> = map.entry((route_id, direction_id)).or_default();
        if !stops.contains(&stop_id) {
            stops.push(stop_id);
        }
    }
    map
}

/// Stateful builder that turns one snapshot minute into a feature table.
///
/// Snapshots must be fed in non-decreasing timestamp order; the rolling
/// state and service-day logic assume monotonic time. One builder instance
/// owns its state exclusively.
pub struct SnapshotFeatureBuilder {
    config: FeatureConfig,
    route_map: RouteMap,
    topology: RouteTopology,
    state: HashMap<StationKey, RollingState>,
    tu_lag: LagTracker,
    vp_lag: LagTracker,
}

impl SnapshotFeatureBuilder {
    pub fn new(route_map: RouteMap) -> Result<Self> {
        Self::with_config(route_map, FeatureConfig::default())
    }

    pub fn with_config(route_map: RouteMap, config: FeatureConfig) -> Result<Self> {
        if route_map.is_empty() {
            return Err(Error::EmptyRouteMap);
        }

        let topology = RouteTopology::from_route_map(&route_map);
        let mut state: HashMap<StationKey, RollingState> = HashMap::new();
        for ((_, direction_id), stops) in &route_map {
            for stop_id in stops {
                state
                    .entry((stop_id.clone(), *direction_id))
                    .or_insert_with(RollingState::new);
            }
        }

        let tu_lag = LagTracker::new(
            config.lag_tu_floor_secs,
            config.lag_window_minutes,
            config.lag_quantile,
            config.lag_buffer_secs,
        );
        let vp_lag = LagTracker::new(
            config.lag_vp_floor_secs,
            config.lag_window_minutes,
            config.lag_quantile,
            config.lag_buffer_secs,
        );

        Ok(Self {
            config,
            route_map,
            topology,
            state,
            tu_lag,
            vp_lag,
        })
    }

    /// Number of keys currently monitored (eager plus lazily admitted).
    pub fn monitored_keys(&self) -> usize {
        self.state.len()
    }

    /// Builds the feature table for one snapshot minute.
    ///
    /// Returns exactly one row per monitored key, sorted by key. Empty
    /// trip-update input yields all-gap rows.
    pub fn build_snapshot_features(
        &mut self,
        trip_updates: &[TripUpdateRow],
        vehicles: &[VehiclePositionRow],
        ts: i64,
    ) -> Vec<FeatureRow> {
        let time = service_day::time_features(ts);

        // Acceptance windows come from the lag history of earlier minutes;
        // this minute's observed lags only influence later snapshots.
        let tu_window = self.tu_lag.current_lag_secs();
        let vp_window = self.vp_lag.current_lag_secs();
        self.tu_lag
            .observe(ts, trip_updates.iter().map(|r| r.snapshot_timestamp));
        self.vp_lag
            .observe(ts, vehicles.iter().map(|r| r.snapshot_timestamp));

        // Lag-tolerant ingestion, then the future-arrival filter: the next
        // arrival at a key must be imminent or current, not stale and not
        // implausibly far out.
        let mut survivors: Vec<&TripUpdateRow> = trip_updates
            .iter()
            .filter(|r| r.snapshot_timestamp <= ts && r.snapshot_timestamp >= ts - tu_window)
            .filter(|r| {
                r.arrival_time >= ts - self.config.arrival_slack_secs
                    && r.arrival_time - ts <= self.config.max_future_secs
            })
            .collect();
        // Stable sort: ties keep input order.
        survivors.sort_by_key(|r| r.arrival_time);

        // Earliest surviving arrival per key is "the next train due".
        let mut selected: HashMap<StationKey, &TripUpdateRow> = HashMap::new();
        for row in &survivors {
            selected
                .entry((row.stop_id.clone(), row.direction_id))
                .or_insert(*row);
        }

        for key in selected.keys() {
            if !self.state.contains_key(key) {
                warn!(
                    stop_id = %key.0,
                    direction_id = key.1,
                    "station key not in route map, initialising rolling state lazily"
                );
                self.state.insert(key.clone(), RollingState::new());
            }
        }

        let vp_recent: Vec<&VehiclePositionRow> = vehicles
            .iter()
            .filter(|r| r.snapshot_timestamp <= ts && r.snapshot_timestamp >= ts - vp_window)
            .collect();

        let multi_route = selected
            .values()
            .map(|r| r.route_id.as_str())
            .collect::<HashSet<_>>()
            .len()
            > 1;

        let mut keys: Vec<StationKey> = self.state.keys().cloned().collect();
        keys.sort();

        let mut out = Vec::with_capacity(keys.len());
        for key in &keys {
            let row = selected.get(key).copied();
            out.push(self.build_row(key, row, &survivors, &vp_recent, ts, &time, multi_route));
        }
        out
    }

    #[allow(clippy::too_many_arguments)]
    fn build_row(
        &mut self,
        key: &StationKey,
        row: Option<&TripUpdateRow>,
        survivors: &[&TripUpdateRow],
        vp_recent: &[&VehiclePositionRow],
        ts: i64,
        time: &TimeFeatures,
        multi_route: bool,
    ) -> FeatureRow {
        let (is_present, data_fresh, vp_ts) = self.vehicle_presence(key, vp_recent, ts);
        let node_degree = self.topology.node_degree(&key.0) as u32;
        let hub_flag = u8::from(self.topology.is_hub(&key.0));

        let Some(row) = row else {
            return FeatureRow::gap(ts, key, None, time, node_degree, hub_flag, is_present, data_fresh);
        };

        let route_id = multi_route.then(|| row.route_id.clone());

        // Re-observing the same trip across snapshots is not a new arrival;
        // ditto an arrival pushed past the future cap.
        let is_duplicate = self
            .state
            .get(key)
            .is_some_and(|st| st.last_trip_id.as_deref() == Some(row.trip_id.as_str()))
            || row.arrival_time - ts > self.config.max_future_secs;
        if is_duplicate {
            return FeatureRow::gap(
                ts, key, route_id, time, node_degree, hub_flag, is_present, data_fresh,
            );
        }

        let crossed_day = self.state.get(key).is_some_and(|st| {
            service_day::is_new_service_day(
                st.last_actual_arrival,
                row.arrival_time,
                self.config.reset_at_hour,
            )
        });
        if crossed_day {
            debug!(stop_id = %key.0, direction_id = key.1, "service day boundary, resetting rolling state");
            if let Some(st) = self.state.get_mut(key) {
                st.reset();
            }
        }

        let cap = self.config.delay_cap_secs;
        let arrival_delay = row.arrival_delay.clamp(-cap, cap);
        let departure_delay = row.departure_delay.clamp(-cap, cap);
        let sched_arr = row.arrival_time as f64 - arrival_delay;
        let sched_dep = row.departure_time as f64 - departure_delay;
        let dwell = (row.departure_time - row.arrival_time) as f64;
        let dwell_delta = dwell - (sched_dep - sched_arr);

        let mut headway = None;
        let mut sched_headway = None;
        let mut rel_headway = None;
        let mut delay_arrival_grad = None;
        let mut delay_departure_grad = None;
        let mut delay_mean_5 = None;
        let mut delay_std_5 = None;
        let mut delay_mean_15 = None;
        let mut headway_p90_60 = None;

        if let Some(st) = self.state.get(key) {
            if let Some(last_arr) = st.last_actual_arrival {
                let h = (row.arrival_time - last_arr) as f64;
                if h > 0.0 && h <= self.config.max_headway_secs {
                    headway = Some(h);
                }
            }
            if let Some(last_sched) = st.last_sched_arrival {
                let sh = sched_arr - last_sched;
                if sh > 0.0 && sh <= self.config.max_headway_secs {
                    sched_headway = Some(sh);
                }
            }
            if let (Some(h), Some(sh)) = (headway, sched_headway) {
                if sh != 0.0 {
                    rel_headway = Some(h / sh);
                }
            }
            delay_arrival_grad = Some(arrival_delay - st.last_arrival_delay);
            delay_departure_grad = Some(departure_delay - st.last_departure_delay);

            // Delay means require a full window; the headway percentile uses
            // whatever has accumulated.
            if st.rolling_delay_5.is_full() {
                let v = st.rolling_delay_5.values();
                delay_mean_5 = Some(mean(&v));
                delay_std_5 = Some(sample_stddev(&v));
            }
            if st.rolling_delay_15.is_full() {
                delay_mean_15 = Some(mean(&st.rolling_delay_15.values()));
            }
            if !st.rolling_headway_60.is_empty() {
                headway_p90_60 = Some(quantile(&st.rolling_headway_60.values(), 0.9));
            }
        }

        let (upstream_delay_mean_2, downstream_delay_max_2) =
            self.neighbour_delays(key, row, survivors);

        let out = FeatureRow {
            snapshot_timestamp: ts,
            stop_id: key.0.clone(),
            direction_id: key.1,
            route_id,
            arrival_delay_t: Some(arrival_delay),
            departure_delay_t: Some(departure_delay),
            headway_t: headway,
            sched_headway_t: sched_headway,
            rel_headway_t: rel_headway,
            dwell_delta_t: Some(dwell_delta),
            delay_arrival_grad_t: delay_arrival_grad,
            delay_departure_grad_t: delay_departure_grad,
            upstream_delay_mean_2,
            downstream_delay_max_2,
            delay_mean_5,
            delay_std_5,
            delay_mean_15,
            headway_p90_60,
            sin_hour: time.sin_hour,
            cos_hour: time.cos_hour,
            day_type: time.day_type,
            node_degree,
            hub_flag,
            is_train_present: is_present,
            data_fresh_secs: data_fresh,
        };

        if let Some(st) = self.state.get_mut(key) {
            st.last_actual_arrival = Some(row.arrival_time);
            st.last_actual_departure = Some(row.departure_time);
            st.last_arrival_delay = arrival_delay;
            st.last_departure_delay = departure_delay;
            st.last_sched_arrival = Some(sched_arr);
            st.last_trip_id = Some(row.trip_id.clone());
            st.rolling_delay_5.push(arrival_delay);
            st.rolling_delay_15.push(arrival_delay);
            if let Some(h) = headway {
                st.rolling_headway_60.push(h);
            }
            if let Some(vts) = vp_ts {
                st.last_vehicle_ts = Some(vts);
            }
        }

        out
    }

    /// Mean of the last observed arrival delay at up to two preceding
    /// stations (from their rolling state), and max predicted delay for the
    /// same trip at up to two following stations (from this snapshot's
    /// surviving rows).
    fn neighbour_delays(
        &self,
        key: &StationKey,
        row: &TripUpdateRow,
        survivors: &[&TripUpdateRow],
    ) -> (Option<f64>, Option<f64>) {
        let route_key = (row.route_id.clone(), row.direction_id);
        let Some(stops) = self.route_map.get(&route_key) else {
            return (None, None);
        };
        let Some(idx) = stops.iter().position(|s| *s == key.0) else {
            return (None, None);
        };

        let mut upstream = Vec::new();
        for prev_stop in &stops[idx.saturating_sub(2)..idx] {
            if let Some(prev) = self.state.get(&(prev_stop.clone(), key.1)) {
                if prev.has_observation() {
                    upstream.push(prev.last_arrival_delay);
                }
            }
        }
        let upstream_mean = (!upstream.is_empty()).then(|| mean(&upstream));

        let cap = self.config.delay_cap_secs;
        let mut downstream_max: Option<f64> = None;
        for next_stop in stops.iter().skip(idx + 1).take(2) {
            let delay = survivors
                .iter()
                .find(|r| r.trip_id == row.trip_id && r.stop_id == *next_stop)
                .map(|r| r.arrival_delay.clamp(-cap, cap));
            if let Some(d) = delay {
                downstream_max = Some(downstream_max.map_or(d, |m| m.max(d)));
            }
        }

        (upstream_mean, downstream_max)
    }

    /// Vehicle presence and data freshness for one key: a recent vehicle
    /// position marks the train present; otherwise freshness decays from the
    /// last confirmed sighting, capped.
    fn vehicle_presence(
        &self,
        key: &StationKey,
        vp_recent: &[&VehiclePositionRow],
        ts: i64,
    ) -> (u8, i64, Option<i64>) {
        let latest = vp_recent
            .iter()
            .filter(|r| r.stop_id == key.0 && r.direction_id == key.1)
            .map(|r| r.snapshot_timestamp)
            .max();
        let cap = self.config.max_data_fresh_secs;

        match latest {
            Some(vts) => (1, (ts - vts).clamp(0, cap), Some(vts)),
            None => {
                let fresh = self
                    .state
                    .get(key)
                    .and_then(|st| st.last_vehicle_ts)
                    .map(|lts| (ts - lts).clamp(0, cap))
                    .unwrap_or(cap);
                (0, fresh, None)
            }
        }
    }
}
