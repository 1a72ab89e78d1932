//! CLI entry point for the metro disruptions engine.
//!
//! Provides subcommands for generating per-minute station features from
//! snapshot CSVs and for scoring feature tables with the streaming anomaly
//! detector.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::path::Path;
use tracing::{info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use metro_disruptions::detect::{DetectorConfig, StreamingAnomalyDetector};
use metro_disruptions::features::{
    FeatureRow, SnapshotFeatureBuilder, TripUpdateRow, VehiclePositionRow, build_route_map,
};
use metro_disruptions::output::{append_rows, read_rows};

#[derive(Parser)]
#[command(name = "metro_disruptions")]
#[command(about = "Station-level disruption features and anomaly scores from GTFS-RT snapshots", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build per-minute station feature rows from snapshot CSVs
    GenerateFeatures {
        /// Directory containing trip_updates_<ts>.csv / vehicle_positions_<ts>.csv files
        #[arg(value_name = "SNAPSHOTS_DIR")]
        snapshots_dir: String,

        /// CSV file to append feature rows to
        #[arg(short, long, default_value = "features.csv")]
        output: String,
    },
    /// Score a feature CSV with the streaming anomaly detector
    DetectAnomalies {
        /// Feature CSV produced by generate-features
        #[arg(value_name = "FEATURES_CSV")]
        features: String,

        /// CSV file to append score rows to
        #[arg(short, long, default_value = "scores.csv")]
        output: String,

        /// Resume from a previously saved detector state
        #[arg(long)]
        state: Option<String>,

        /// Save detector state here after scoring
        #[arg(long)]
        save_state: Option<String>,

        /// JSON detector config (ignored when --state is given)
        #[arg(short, long)]
        config: Option<String>,

        /// Emit top-3 feature attributions per score row
        #[arg(long, default_value_t = false)]
        explain: bool,
    },
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path = std::env::var("LOG_FILE_PATH")
        .unwrap_or_else(|_| "logs/metro_disruptions.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("metro_disruptions.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::GenerateFeatures {
            snapshots_dir,
            output,
        } => generate_features(&snapshots_dir, &output)?,
        Commands::DetectAnomalies {
            features,
            output,
            state,
            save_state,
            config,
            explain,
        } => detect_anomalies(&features, &output, state, save_state, config, explain)?,
    }

    Ok(())
}

/// Discovers snapshot minutes by scanning for trip_updates_<ts>.csv files.
fn discover_snapshot_minutes(dir: &str) -> Result<Vec<i64>> {
    let mut minutes = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("reading {dir}"))? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(ts) = name
            .strip_prefix("trip_updates_")
            .and_then(|rest| rest.strip_suffix(".csv"))
        {
            match ts.parse::<i64>() {
                Ok(ts) => minutes.push(ts),
                Err(_) => warn!(file = name, "ignoring file with unparseable timestamp"),
            }
        }
    }
    minutes.sort_unstable();
    Ok(minutes)
}

#[tracing::instrument(skip_all, fields(snapshots_dir, output))]
fn generate_features(snapshots_dir: &str, output: &str) -> Result<()> {
    let minutes = discover_snapshot_minutes(snapshots_dir)?;
    info!(snapshot_count = minutes.len(), "snapshot minutes discovered");

    // The route map comes from the full history of trip-update rows.
    let mut by_minute: BTreeMap<i64, Vec<TripUpdateRow>> = BTreeMap::new();
    for ts in &minutes {
        let path = format!("{snapshots_dir}/trip_updates_{ts}.csv");
        by_minute.insert(*ts, read_rows(&path)?);
    }
    let all_rows: Vec<TripUpdateRow> = by_minute.values().flatten().cloned().collect();
    let route_map = build_route_map(&all_rows);
    info!(routes = route_map.len(), "route map built");

    let mut builder = SnapshotFeatureBuilder::new(route_map)?;

    for (ts, trip_updates) in &by_minute {
        let vp_path = format!("{snapshots_dir}/vehicle_positions_{ts}.csv");
        let vehicles: Vec<VehiclePositionRow> = if Path::new(&vp_path).exists() {
            read_rows(&vp_path)?
        } else {
            Vec::new()
        };

        let features = builder.build_snapshot_features(trip_updates, &vehicles, *ts);
        append_rows(output, &features)?;
        info!(ts, rows = features.len(), "snapshot features written");
    }

    info!(output, "feature generation complete");
    Ok(())
}

#[tracing::instrument(skip_all, fields(features, output, explain))]
fn detect_anomalies(
    features: &str,
    output: &str,
    state: Option<String>,
    save_state: Option<String>,
    config: Option<String>,
    explain: bool,
) -> Result<()> {
    let mut detector = match (&state, &config) {
        (Some(state_path), _) => {
            info!(state = state_path, "resuming detector from saved state");
            StreamingAnomalyDetector::load(state_path)?
        }
        (None, Some(config_path)) => StreamingAnomalyDetector::from_config_file(config_path)?,
        (None, None) => StreamingAnomalyDetector::new(DetectorConfig::default())?,
    };

    let rows: Vec<FeatureRow> = read_rows(features)?;
    let mut batches: BTreeMap<i64, Vec<FeatureRow>> = BTreeMap::new();
    for row in rows {
        batches.entry(row.snapshot_timestamp).or_default().push(row);
    }

    let mut flagged = 0usize;
    for (ts, batch) in &batches {
        let scores = detector.score_and_update(batch, explain);
        flagged += scores.iter().filter(|s| s.anomaly_flag == 1).count();
        append_rows(output, &scores)?;
        info!(ts, scored = scores.len(), "snapshot batch scored");
    }

    if let Some(path) = save_state {
        detector.save(&path)?;
        info!(state = path, "detector state saved");
    }

    info!(
        minutes = batches.len(),
        flagged, output, "anomaly detection complete"
    );
    Ok(())
}
