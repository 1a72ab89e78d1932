//! Minimal row constructors shared by unit and integration tests.

use crate::features::{FeatureRow, TripUpdateRow, VehiclePositionRow};

/// A minimal trip-update row at stop "STOP" on route "R", direction 0.
pub fn fake_trip_update(snapshot_ts: i64, arrival_time: i64, trip_id: &str) -> TripUpdateRow {
    TripUpdateRow {
        snapshot_timestamp: snapshot_ts,
        trip_id: trip_id.to_string(),
        route_id: "R".to_string(),
        direction_id: 0,
        stop_id: "STOP".to_string(),
        arrival_time,
        departure_time: arrival_time + 30,
        arrival_delay: 0.0,
        departure_delay: 0.0,
        stop_sequence: 1,
    }
}

/// A minimal vehicle-position row, direction 0.
pub fn fake_vehicle_position(snapshot_ts: i64, stop_id: &str) -> VehiclePositionRow {
    VehiclePositionRow {
        snapshot_timestamp: snapshot_ts,
        stop_id: stop_id.to_string(),
        direction_id: 0,
    }
}

/// A feature row with enough non-zero signal to survive the detector's
/// degenerate-row filter.
pub fn fake_feature_row(ts: i64, stop_id: &str) -> FeatureRow {
    FeatureRow {
        snapshot_timestamp: ts,
        stop_id: stop_id.to_string(),
        direction_id: 0,
        route_id: None,
        arrival_delay_t: Some(12.0),
        departure_delay_t: Some(15.0),
        headway_t: Some(240.0),
        sched_headway_t: Some(240.0),
        rel_headway_t: Some(1.0),
        dwell_delta_t: Some(0.0),
        delay_arrival_grad_t: Some(2.0),
        delay_departure_grad_t: Some(3.0),
        upstream_delay_mean_2: None,
        downstream_delay_max_2: None,
        delay_mean_5: None,
        delay_std_5: None,
        delay_mean_15: None,
        headway_p90_60: Some(300.0),
        sin_hour: 0.5,
        cos_hour: 0.5f64.sqrt(),
        day_type: 0,
        node_degree: 1,
        hub_flag: 0,
        is_train_present: 1,
        data_fresh_secs: 10,
    }
}
