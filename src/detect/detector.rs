//! Streaming anomaly detector over snapshot feature rows.
//!
//! Scores arrive one batch (one snapshot minute) at a time. Every row is
//! scored against the model as it was *before* the row, then the model
//! absorbs it, so no row is ever judged with information derived from
//! itself. Flags only fire once a full score window exists; a service-day
//! boundary resets the model, the score window and the counter.

use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::path::Path;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::features::FeatureRow;
use crate::service_day;
use crate::stats::quantile;

use super::explain::top_n_ablation;
use super::half_space::{HalfSpacePipeline, Scorable};

fn default_denylist() -> BTreeSet<String> {
    // Station identifiers with persistent feed artifacts.
    BTreeSet::from(["204472".to_string(), "2155270".to_string()])
}

/// Hyper-parameters for [`StreamingAnomalyDetector`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    pub n_trees: usize,
    pub height: usize,
    /// Mass cutoff below which a tree traversal stops early while scoring.
    pub subsample_size: usize,
    /// Memory of both the model's mass windows and the external score deque.
    pub window_size: usize,
    pub threshold_quantile: f64,
    /// Consumed by the offline tuning harness; validated but unused online.
    pub warmup_days: u32,
    /// Pins the random tree construction so persisted detectors reproduce.
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_denylist")]
    pub denylist: BTreeSet<String>,
}

fn default_seed() -> u64 {
    42
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            n_trees: 100,
            height: 10,
            subsample_size: 256,
            window_size: 10_000,
            threshold_quantile: 0.97,
            warmup_days: 4,
            seed: default_seed(),
            denylist: default_denylist(),
        }
    }
}

impl DetectorConfig {
    fn validate(&self) -> Result<()> {
        if self.n_trees == 0 {
            return Err(Error::InvalidConfig("n_trees must be positive".into()));
        }
        if self.height == 0 {
            return Err(Error::InvalidConfig("height must be positive".into()));
        }
        if self.subsample_size == 0 {
            return Err(Error::InvalidConfig(
                "subsample_size must be positive".into(),
            ));
        }
        if self.window_size == 0 {
            return Err(Error::InvalidConfig("window_size must be positive".into()));
        }
        if !(self.threshold_quantile > 0.0 && self.threshold_quantile < 1.0) {
            return Err(Error::InvalidConfig(
                "threshold_quantile must be in (0, 1)".into(),
            ));
        }
        if self.warmup_days == 0 {
            return Err(Error::InvalidConfig("warmup_days must be positive".into()));
        }
        Ok(())
    }
}

/// One scored feature row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRow {
    pub ts: i64,
    pub stop_id: String,
    pub direction_id: u8,
    pub anomaly_score: f64,
    pub anomaly_flag: u8,
    /// Top-3 ablation attribution as JSON, when explanations are requested.
    pub explanation: Option<String>,
}

/// Everything needed to continue scoring identically after a restart.
#[derive(Serialize, Deserialize)]
struct PersistedState {
    config: DetectorConfig,
    model: Option<HalfSpacePipeline>,
    scores: Vec<f64>,
    n_obs: usize,
    current_service_day: Option<NaiveDate>,
    feature_cols: Option<Vec<String>>,
}

/// Online isolation-style detector with adaptive quantile thresholding.
pub struct StreamingAnomalyDetector {
    config: DetectorConfig,
    model: Option<HalfSpacePipeline>,
    scores: VecDeque<f64>,
    n_obs: usize,
    current_service_day: Option<NaiveDate>,
    feature_cols: Option<Vec<String>>,
}

impl StreamingAnomalyDetector {
    pub fn new(config: DetectorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            scores: VecDeque::with_capacity(config.window_size),
            model: None,
            n_obs: 0,
            current_service_day: None,
            feature_cols: None,
            config,
        })
    }

    /// Builds a detector from a JSON config file.
    pub fn from_config_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = fs::read(path)?;
        let config: DetectorConfig = serde_json::from_slice(&raw)?;
        Self::new(config)
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Observations scored since the last service-day reset.
    pub fn observations(&self) -> usize {
        self.n_obs
    }

    fn build_model(&self, n_features: usize) -> HalfSpacePipeline {
        HalfSpacePipeline::new(
            n_features,
            self.config.n_trees,
            self.config.height,
            self.config.window_size,
            self.config.subsample_size,
            self.config.seed,
        )
    }

    fn maybe_reset(&mut self, ts: i64) {
        let sd = service_day::service_day(ts, service_day::DEFAULT_RESET_AT_HOUR);
        match self.current_service_day {
            None => self.current_service_day = Some(sd),
            Some(current) if current != sd => {
                info!(%sd, "service day boundary reached, resetting detector state");
                self.model = self
                    .feature_cols
                    .as_ref()
                    .map(|cols| self.build_model(cols.len()));
                self.scores.clear();
                self.n_obs = 0;
                self.current_service_day = Some(sd);
            }
            Some(_) => {}
        }
    }

    /// Scores one snapshot batch in document order and absorbs each row into
    /// the model after scoring it. Rows for denylisted stations and rows
    /// whose numeric feature vector is entirely zero are dropped.
    pub fn score_and_update(&mut self, batch: &[FeatureRow], explain: bool) -> Vec<ScoreRow> {
        let Some(first) = batch.first() else {
            return Vec::new();
        };
        let ts = first.snapshot_timestamp;
        self.maybe_reset(ts);

        let surviving: Vec<&FeatureRow> = batch
            .iter()
            .filter(|row| !self.config.denylist.contains(&row.stop_id))
            .collect();
        if surviving.is_empty() {
            return Vec::new();
        }

        let cols: Vec<String> = match &self.feature_cols {
            Some(cols) => cols.clone(),
            None => FeatureRow::FEATURE_NAMES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        };

        // Missing values fill with zero; a vector with no signal at all is a
        // placeholder, not an observation.
        let vectors: Vec<(&FeatureRow, Vec<f64>)> = surviving
            .into_iter()
            .filter_map(|row| {
                let x: Vec<f64> = cols
                    .iter()
                    .map(|c| row.feature(c).unwrap_or(0.0))
                    .collect();
                (x.iter().map(|v| v.abs()).sum::<f64>() != 0.0).then_some((row, x))
            })
            .collect();
        if vectors.is_empty() {
            return Vec::new();
        }

        // Lock the feature columns on the first non-empty batch ever; this
        // set is used for every subsequent batch.
        if self.feature_cols.is_none() {
            debug!(n_features = cols.len(), "locking feature columns");
            self.model = Some(self.build_model(cols.len()));
            self.feature_cols = Some(cols.clone());
        }

        let mut out = Vec::with_capacity(vectors.len());
        for (row, x) in vectors {
            let Some(model) = self.model.as_mut() else {
                break;
            };

            let score = model.score(&x);
            if self.scores.len() == self.config.window_size {
                self.scores.pop_front();
            }
            self.scores.push_back(score);
            self.n_obs += 1;

            let mut flag = 0;
            if self.n_obs >= self.config.window_size {
                let window: Vec<f64> = self.scores.iter().copied().collect();
                let threshold = quantile(&window, self.config.threshold_quantile);
                if score > threshold {
                    flag = 1;
                }
            }

            let explanation = if explain {
                serde_json::to_string(&top_n_ablation(&*model, &cols, &x, 3)).ok()
            } else {
                None
            };

            model.learn(&x);

            out.push(ScoreRow {
                ts,
                stop_id: row.stop_id.clone(),
                direction_id: row.direction_id,
                anomaly_score: score,
                anomaly_flag: flag,
                explanation,
            });
        }
        out
    }

    /// Persists the full detector state atomically (temp file + rename).
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let state = PersistedState {
            config: self.config.clone(),
            model: self.model.clone(),
            scores: self.scores.iter().copied().collect(),
            n_obs: self.n_obs,
            current_service_day: self.current_service_day,
            feature_cols: self.feature_cols.clone(),
        };
        let bytes = serde_json::to_vec(&state)?;

        let path = path.as_ref();
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;
        debug!(path = %path.display(), "detector state saved");
        Ok(())
    }

    /// Restores a detector that continues scoring exactly where the saved
    /// one left off. Any decode failure is fatal; the caller must not
    /// proceed with a partially reconstructed detector.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = fs::read(path)?;
        let state: PersistedState = serde_json::from_slice(&raw)?;
        state.config.validate()?;

        let mut scores = VecDeque::with_capacity(state.config.window_size);
        scores.extend(state.scores);

        Ok(Self {
            config: state.config,
            model: state.model,
            scores,
            n_obs: state.n_obs,
            current_service_day: state.current_service_day,
            feature_cols: state.feature_cols,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::fake_feature_row;
    use std::env;

    fn small_config(window_size: usize) -> DetectorConfig {
        DetectorConfig {
            n_trees: 10,
            height: 4,
            window_size,
            ..DetectorConfig::default()
        }
    }

    fn batch(ts: i64, stop_ids: &[&str]) -> Vec<FeatureRow> {
        stop_ids.iter().map(|s| fake_feature_row(ts, s)).collect()
    }

    #[test]
    fn test_invalid_config_rejected() {
        for config in [
            DetectorConfig {
                window_size: 0,
                ..DetectorConfig::default()
            },
            DetectorConfig {
                n_trees: 0,
                ..DetectorConfig::default()
            },
            DetectorConfig {
                threshold_quantile: 1.5,
                ..DetectorConfig::default()
            },
        ] {
            assert!(matches!(
                StreamingAnomalyDetector::new(config),
                Err(Error::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn test_denylisted_stations_dropped() {
        let mut det = StreamingAnomalyDetector::new(small_config(100)).unwrap();
        let out = det.score_and_update(&batch(0, &["1", "204472", "2"]), false);
        let stops: Vec<&str> = out.iter().map(|r| r.stop_id.as_str()).collect();
        assert_eq!(stops, vec!["1", "2"]);
    }

    #[test]
    fn test_all_zero_vector_dropped() {
        let mut det = StreamingAnomalyDetector::new(small_config(100)).unwrap();
        let mut row = fake_feature_row(0, "1");
        row.arrival_delay_t = None;
        row.departure_delay_t = None;
        row.headway_t = None;
        row.sched_headway_t = None;
        row.rel_headway_t = None;
        row.dwell_delta_t = None;
        row.delay_arrival_grad_t = None;
        row.delay_departure_grad_t = None;
        row.headway_p90_60 = None;
        row.sin_hour = 0.0;
        row.cos_hour = 0.0;
        row.node_degree = 0;
        row.is_train_present = 0;
        row.data_fresh_secs = 0;
        let out = det.score_and_update(&[row], false);
        assert!(out.is_empty());
    }

    #[test]
    fn test_warmup_never_flags() {
        let mut det = StreamingAnomalyDetector::new(small_config(10)).unwrap();
        let out = det.score_and_update(&batch(0, &["1"; 10]), false);
        assert_eq!(out.len(), 10);
        assert!(out.iter().all(|r| r.anomaly_flag == 0));
    }

    #[test]
    fn test_empty_batch_is_empty_output() {
        let mut det = StreamingAnomalyDetector::new(small_config(10)).unwrap();
        assert!(det.score_and_update(&[], false).is_empty());
    }

    #[test]
    fn test_service_day_reset_clears_counter() {
        let mut det = StreamingAnomalyDetector::new(small_config(5)).unwrap();

        // 2024-05-03 02:00 Sydney: before the reset hour, so still the
        // previous service day.
        det.score_and_update(&batch(1_714_665_600, &["1"]), false);
        assert_eq!(det.observations(), 1);

        // 03:10 Sydney the same morning crosses into a new service day.
        det.score_and_update(&batch(1_714_669_800, &["1"]), false);
        assert_eq!(det.observations(), 1);

        // 03:05 Sydney the next day resets again.
        det.score_and_update(&batch(1_714_755_900, &["1"]), false);
        assert_eq!(det.observations(), 1);
    }

    #[test]
    fn test_save_load_scores_identically() {
        let path = format!(
            "{}/metro_disruptions_detector_roundtrip.json",
            env::temp_dir().display()
        );
        let _ = std::fs::remove_file(&path);

        let mut det = StreamingAnomalyDetector::new(small_config(5)).unwrap();
        det.score_and_update(&batch(0, &["1", "2", "3"]), false);
        det.save(&path).unwrap();

        let mut restored = StreamingAnomalyDetector::load(&path).unwrap();
        let next = batch(60, &["1", "2", "3"]);
        let out1 = det.score_and_update(&next, true);
        let out2 = restored.score_and_update(&next, true);
        assert_eq!(out1, out2);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_load_garbage_fails() {
        let path = format!(
            "{}/metro_disruptions_detector_garbage.json",
            env::temp_dir().display()
        );
        std::fs::write(&path, b"not json at all").unwrap();
        assert!(StreamingAnomalyDetector::load(&path).is_err());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_explanations_emitted_when_requested() {
        let mut det = StreamingAnomalyDetector::new(small_config(100)).unwrap();
        let out = det.score_and_update(&batch(0, &["1"]), true);
        let payload = out[0].explanation.as_ref().unwrap();
        let parsed: Vec<(String, f64)> = serde_json::from_str(payload).unwrap();
        assert_eq!(parsed.len(), 3);
    }
}
