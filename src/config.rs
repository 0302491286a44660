//! Training configuration
//!
//! A single flat record assembled once at startup from three layers,
//! last writer wins:
//!
//! 1. built-in defaults ([`TrainConfig::default`])
//! 2. a JSON config file (flat object of option names to values)
//! 3. `key=value` command-line overrides
//!
//! Every layer goes through [`TrainConfig::set`], so unknown option names and
//! values of the wrong type are rejected the same way everywhere.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use candle_core::Device;
use serde::Serialize;
use tracing::{debug, info};

/// Configuration for a sparse autoencoder training run
#[derive(Debug, Clone, Serialize)]
pub struct TrainConfig {
    /// `auto`, `cpu`, `cuda`, `cuda:N` or `metal`
    pub device: String,
    /// Seed for autoencoder init and evaluation sampling
    pub seed: u64,
    /// Dataset name, used for the corpus path and the run name
    pub dataset: String,
    /// Local checkpoint directory or HuggingFace repo id of the base model
    pub model_dir: String,
    /// Directory holding `sae_data_<i>.safetensors` partitions
    pub activations_dir: PathBuf,
    /// Root of tokenized corpora (`<data_dir>/<dataset>/<split>.bin`)
    pub data_dir: PathBuf,
    /// Corpus split that evaluation contexts are drawn from
    pub eval_split: String,
    /// Block whose MLP the activations were captured from
    pub mlp_layer: usize,
    /// Sparsity coefficient λ
    pub l1_coeff: f64,
    pub learning_rate: f64,
    /// Contexts per base-model forward pass
    pub gpt_batch_size: usize,
    /// Activations per autoencoder step
    pub batch_size: usize,
    /// Dictionary size m
    pub n_features: usize,
    /// Held-out contexts in the evaluation cache
    pub eval_contexts: usize,
    /// Token positions per context used for feature density statistics
    pub eval_context_tokens: usize,
    /// Evaluate every E steps
    pub eval_interval: usize,
    /// Renormalize decoder columns every K steps
    pub renorm_interval: usize,
    /// Bins of the log-density histogram
    pub density_hist_bins: usize,
    /// Write metric records to `<out_dir>/<run>/metrics.jsonl`
    pub log_metrics: bool,
    pub out_dir: PathBuf,
    /// Persist the final autoencoder as safetensors
    pub save_sae: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            device: "auto".to_string(),
            seed: 1442,
            dataset: "openwebtext".to_string(),
            model_dir: "out".to_string(),
            activations_dir: PathBuf::from("sae_data"),
            data_dir: PathBuf::from("data"),
            eval_split: "val".to_string(),
            mlp_layer: 0,
            l1_coeff: 3e-3,
            learning_rate: 3e-4,
            gpt_batch_size: 16,
            batch_size: 8192,
            n_features: 4096,
            eval_contexts: 10_000,
            eval_context_tokens: 10,
            eval_interval: 500,
            renorm_interval: 1000,
            density_hist_bins: 50,
            log_metrics: true,
            out_dir: PathBuf::from("out-sae"),
            save_sae: false,
        }
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse::<T>()
        .with_context(|| format!("Invalid value {value:?} for option '{key}'"))
}

impl TrainConfig {
    /// Build a configuration from defaults, an optional JSON file and
    /// `key=value` overrides, then validate it.
    pub fn load(file: Option<&Path>, overrides: &[String]) -> Result<Self> {
        let mut config = Self::default();
        if let Some(path) = file {
            config.apply_file(path)?;
        }
        config.apply_overrides(overrides)?;
        config.validate()?;
        Ok(config)
    }

    /// Set one option from its string form.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "device" => self.device = value.to_string(),
            "seed" => self.seed = parse(key, value)?,
            "dataset" => self.dataset = value.to_string(),
            "model_dir" => self.model_dir = value.to_string(),
            "activations_dir" => self.activations_dir = PathBuf::from(value),
            "data_dir" => self.data_dir = PathBuf::from(value),
            "eval_split" => self.eval_split = value.to_string(),
            "mlp_layer" => self.mlp_layer = parse(key, value)?,
            "l1_coeff" => self.l1_coeff = parse(key, value)?,
            "learning_rate" => self.learning_rate = parse(key, value)?,
            "gpt_batch_size" => self.gpt_batch_size = parse(key, value)?,
            "batch_size" => self.batch_size = parse(key, value)?,
            "n_features" => self.n_features = parse(key, value)?,
            "eval_contexts" => self.eval_contexts = parse(key, value)?,
            "eval_context_tokens" => self.eval_context_tokens = parse(key, value)?,
            "eval_interval" => self.eval_interval = parse(key, value)?,
            "renorm_interval" => self.renorm_interval = parse(key, value)?,
            "density_hist_bins" => self.density_hist_bins = parse(key, value)?,
            "log_metrics" => self.log_metrics = parse(key, value)?,
            "out_dir" => self.out_dir = PathBuf::from(value),
            "save_sae" => self.save_sae = parse(key, value)?,
            other => anyhow::bail!("Unknown config option '{other}'"),
        }
        Ok(())
    }

    /// Apply overrides from a flat JSON object.
    pub fn apply_file(&mut self, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let entries: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&text)
            .with_context(|| format!("Config file {} is not a JSON object", path.display()))?;

        info!("Overriding config with {}", path.display());
        for (key, value) in entries {
            let value = match value {
                serde_json::Value::String(s) => s,
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::Bool(b) => b.to_string(),
                other => anyhow::bail!("Option '{key}' must be a scalar, got {other}"),
            };
            self.set(&key, &value)
                .with_context(|| format!("In config file {}", path.display()))?;
        }
        Ok(())
    }

    /// Apply `key=value` (or `--key=value`) command-line overrides in order.
    pub fn apply_overrides(&mut self, overrides: &[String]) -> Result<()> {
        for arg in overrides {
            let arg = arg.trim_start_matches("--");
            let (key, value) = arg
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("Override '{arg}' is not of the form key=value"))?;
            debug!("Overriding {key} = {value}");
            self.set(key, value)?;
        }
        Ok(())
    }

    /// Check the invariants the training loop relies on.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.batch_size > 0, "batch_size must be positive");
        anyhow::ensure!(self.gpt_batch_size > 0, "gpt_batch_size must be positive");
        anyhow::ensure!(self.n_features > 0, "n_features must be positive");
        anyhow::ensure!(self.eval_interval > 0, "eval_interval must be positive");
        anyhow::ensure!(self.renorm_interval > 0, "renorm_interval must be positive");
        anyhow::ensure!(
            self.eval_context_tokens > 0,
            "eval_context_tokens must be positive"
        );
        anyhow::ensure!(self.density_hist_bins > 0, "density_hist_bins must be positive");
        anyhow::ensure!(
            self.eval_contexts >= self.gpt_batch_size,
            "eval_contexts ({}) must be at least gpt_batch_size ({})",
            self.eval_contexts,
            self.gpt_batch_size
        );
        anyhow::ensure!(self.l1_coeff >= 0.0, "l1_coeff must be non-negative");
        anyhow::ensure!(self.learning_rate > 0.0, "learning_rate must be positive");
        Ok(())
    }

    /// Path of the token corpus used for evaluation contexts.
    pub fn corpus_path(&self) -> PathBuf {
        self.data_dir
            .join(&self.dataset)
            .join(format!("{}.bin", self.eval_split))
    }

    /// Resolve the configured device.
    pub fn device(&self) -> Result<Device> {
        let device = match self.device.as_str() {
            "auto" => match Device::cuda_if_available(0) {
                Ok(dev) if dev.is_cuda() => {
                    info!("Using CUDA device");
                    dev
                }
                _ => {
                    info!("CUDA not available, using CPU");
                    Device::Cpu
                }
            },
            "cpu" => Device::Cpu,
            "metal" => Device::new_metal(0).context("Failed to open Metal device")?,
            name if name.starts_with("cuda") => {
                let ordinal = match name.strip_prefix("cuda:") {
                    Some(n) => parse("device", n)?,
                    None if name == "cuda" => 0,
                    None => anyhow::bail!("Unknown device '{name}'"),
                };
                Device::new_cuda(ordinal)
                    .with_context(|| format!("Failed to open CUDA device {ordinal}"))?
            }
            other => anyhow::bail!("Unknown device '{other}'"),
        };
        Ok(device)
    }
}
