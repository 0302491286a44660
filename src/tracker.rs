//! Metrics record sinks

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use crate::config::TrainConfig;
use crate::metrics::{DensityHistogram, EvalMetrics};

/// Receives one metrics record per evaluation.
pub trait MetricsSink {
    fn log(&mut self, step: usize, metrics: &EvalMetrics) -> Result<()>;

    /// Called once after the last step.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Discards every record (`log_metrics=false`).
#[derive(Debug, Default)]
pub struct NullTracker;

impl MetricsSink for NullTracker {
    fn log(&mut self, _step: usize, _metrics: &EvalMetrics) -> Result<()> {
        Ok(())
    }
}

/// Run name of the form `sae_<dataset>_<unix seconds>`.
pub fn run_name(dataset: &str) -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("sae_{dataset}_{secs}")
}

/// One line of `metrics.jsonl`.
#[derive(Serialize)]
struct MetricsRecord<'a> {
    step: usize,
    #[serde(rename = "losses/reconst_nll")]
    reconst_nll: f32,
    #[serde(rename = "losses/autoencoder_loss")]
    autoencoder_loss: f32,
    #[serde(rename = "losses/mse_loss")]
    mse_loss: f32,
    #[serde(rename = "losses/l1_loss")]
    l1_loss: f32,
    #[serde(rename = "losses/feature_activation_sparsity")]
    feature_activation_sparsity: f32,
    #[serde(rename = "losses/nll_score")]
    nll_score: f32,
    #[serde(rename = "debug/mean_dictionary_vector_length")]
    mean_dictionary_vector_length: f32,
    #[serde(rename = "feature_density/min_log_feat_density")]
    min_log_feat_density: f32,
    #[serde(rename = "feature_density/num_alive_neurons")]
    num_alive_neurons: usize,
    #[serde(rename = "feature_density/num_dead_neurons")]
    num_dead_neurons: usize,
    #[serde(rename = "feature_density/histogram")]
    histogram: &'a DensityHistogram,
}

impl<'a> MetricsRecord<'a> {
    fn new(step: usize, m: &'a EvalMetrics) -> Self {
        Self {
            step,
            reconst_nll: m.reconst_nll,
            autoencoder_loss: m.autoencoder_loss,
            mse_loss: m.mse_loss,
            l1_loss: m.l1_loss,
            feature_activation_sparsity: m.feature_activation_sparsity,
            nll_score: m.nll_score,
            mean_dictionary_vector_length: m.mean_dictionary_vector_length,
            min_log_feat_density: m.density.min_log_density,
            num_alive_neurons: m.density.num_alive,
            num_dead_neurons: m.density.num_dead,
            histogram: &m.histogram,
        }
    }
}

/// Appends records to `<out_dir>/<run_name>/metrics.jsonl`.
pub struct JsonlTracker {
    run_dir: PathBuf,
    writer: BufWriter<File>,
    records: usize,
}

impl JsonlTracker {
    /// Create the run directory and write the resolved configuration next to
    /// the metrics file.
    pub fn create(out_dir: &Path, run_name: &str, config: &TrainConfig) -> Result<Self> {
        let run_dir = out_dir.join(run_name);
        fs::create_dir_all(&run_dir)
            .with_context(|| format!("Failed to create run directory {}", run_dir.display()))?;

        let config_path = run_dir.join("config.json");
        let config_json = serde_json::to_string_pretty(config)?;
        fs::write(&config_path, config_json)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;

        let metrics_path = run_dir.join("metrics.jsonl");
        let file = File::create(&metrics_path)
            .with_context(|| format!("Failed to create {}", metrics_path.display()))?;
        info!("Logging metrics to {}", metrics_path.display());

        Ok(Self {
            run_dir,
            writer: BufWriter::new(file),
            records: 0,
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Records written so far
    pub fn records(&self) -> usize {
        self.records
    }
}

impl MetricsSink for JsonlTracker {
    fn log(&mut self, step: usize, metrics: &EvalMetrics) -> Result<()> {
        serde_json::to_writer(&mut self.writer, &MetricsRecord::new(step, metrics))?;
        self.writer.write_all(b"\n")?;
        // Keep the file current for anyone tailing it during a long run.
        self.writer.flush()?;
        self.records += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.writer.flush()?;
        info!(
            "Wrote {} metrics records to {}",
            self.records,
            self.run_dir.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::FeatureDensity;

    fn sample_metrics() -> EvalMetrics {
        let density = FeatureDensity::from_counts(&[4.0, 0.0, 1.0], 10);
        let histogram = DensityHistogram::new(&density.log_densities, 3);
        EvalMetrics {
            reconst_nll: 3.5,
            autoencoder_loss: 0.25,
            mse_loss: 0.2,
            l1_loss: 16.0,
            feature_activation_sparsity: 1.5,
            nll_score: 0.75,
            mean_dictionary_vector_length: 1.0,
            density,
            histogram,
        }
    }

    #[test]
    fn test_jsonl_tracker_writes_records() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrainConfig::default();
        let mut tracker = JsonlTracker::create(dir.path(), "run", &config).unwrap();
        tracker.log(0, &sample_metrics()).unwrap();
        tracker.log(500, &sample_metrics()).unwrap();
        tracker.finish().unwrap();
        assert_eq!(tracker.records(), 2);

        let text = fs::read_to_string(dir.path().join("run/metrics.jsonl")).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["step"], 500);
        assert_eq!(lines[0]["feature_density/num_alive_neurons"], 2);
        assert_eq!(lines[0]["feature_density/num_dead_neurons"], 1);
        assert_eq!(lines[0]["feature_density/histogram"]["counts"].as_array().unwrap().len(), 3);
        assert!((lines[0]["losses/nll_score"].as_f64().unwrap() - 0.75).abs() < 1e-6);

        let config_json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join("run/config.json")).unwrap())
                .unwrap();
        assert_eq!(config_json["seed"], 1442);
    }

    #[test]
    fn test_run_name_prefix() {
        assert!(run_name("openwebtext").starts_with("sae_openwebtext_"));
    }

    #[test]
    fn test_null_tracker() {
        let mut sink = NullTracker;
        sink.log(0, &sample_metrics()).unwrap();
        sink.finish().unwrap();
    }
}
