//! End-to-end scenarios: feature engine feeding the streaming detector.

use metro_disruptions::detect::{DetectorConfig, StreamingAnomalyDetector};
use metro_disruptions::features::SnapshotFeatureBuilder;
use metro_disruptions::testkit::{fake_trip_update, fake_vehicle_position};
use metro_disruptions::topology::RouteMap;

fn route_map_single() -> RouteMap {
    RouteMap::from([(("R".to_string(), 0), vec!["STOP".to_string()])])
}

#[test]
fn test_two_snapshot_scenario() {
    let mut builder = SnapshotFeatureBuilder::new(route_map_single()).unwrap();

    // First minute: a train is due in 10s and a vehicle is confirmed at the
    // platform. No prior arrival, so no headway yet.
    let ts = 1_000;
    let rows = builder.build_snapshot_features(
        &[fake_trip_update(ts, ts + 10, "T1")],
        &[fake_vehicle_position(ts, "STOP")],
        ts,
    );
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!((row.stop_id.as_str(), row.direction_id), ("STOP", 0));
    assert_eq!(row.is_train_present, 1);
    assert!(row.data_fresh_secs <= 60);
    assert!(row.headway_t.is_none());

    // Second minute: the next trip arrives 60s after the first.
    let ts2 = 1_060;
    let rows = builder.build_snapshot_features(
        &[fake_trip_update(ts2, ts2 + 10, "T2")],
        &[fake_vehicle_position(ts2, "STOP")],
        ts2,
    );
    assert_eq!(rows.len(), 1);
    let headway = rows[0].headway_t.expect("headway after second arrival");
    assert!((headway - 60.0).abs() < f64::EPSILON);
    assert!(headway <= 3600.0);
}

#[test]
fn test_features_flow_into_detector() {
    let mut builder = SnapshotFeatureBuilder::new(route_map_single()).unwrap();
    let config = DetectorConfig {
        n_trees: 10,
        height: 4,
        window_size: 5,
        ..DetectorConfig::default()
    };
    let mut detector = StreamingAnomalyDetector::new(config).unwrap();

    let mut total_scored = 0;
    for minute in 0..8 {
        let ts = 1_000 + minute * 60;
        let trip = format!("T{minute}");
        let features = builder.build_snapshot_features(
            &[fake_trip_update(ts, ts + 30, &trip)],
            &[fake_vehicle_position(ts, "STOP")],
            ts,
        );
        assert_eq!(features.len(), 1);

        let scores = detector.score_and_update(&features, false);
        total_scored += scores.len();
        for score in &scores {
            assert_eq!(score.stop_id, "STOP");
            assert!((0.0..=1.0).contains(&score.anomaly_score));
        }
    }
    // Time features are always non-zero, so every row survives the
    // degenerate-row filter.
    assert_eq!(total_scored, 8);
    assert_eq!(detector.observations(), 8);
}

#[test]
fn test_gap_minutes_keep_series_continuous() {
    let map = RouteMap::from([(
        ("R".to_string(), 0),
        vec!["A".to_string(), "B".to_string()],
    )]);
    let mut builder = SnapshotFeatureBuilder::new(map).unwrap();

    // A quiet minute still yields one row per monitored key.
    let rows = builder.build_snapshot_features(&[], &[], 2_000);
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.arrival_delay_t.is_none()));

    // A busy minute for one key leaves the other as a gap row.
    let ts = 2_060;
    let mut tu = fake_trip_update(ts, ts + 20, "T1");
    tu.stop_id = "A".to_string();
    let rows = builder.build_snapshot_features(&[tu], &[], ts);
    assert_eq!(rows.len(), 2);
    let a = rows.iter().find(|r| r.stop_id == "A").unwrap();
    let b = rows.iter().find(|r| r.stop_id == "B").unwrap();
    assert!(a.arrival_delay_t.is_some());
    assert!(b.arrival_delay_t.is_none());
}
