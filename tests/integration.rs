//! Integration tests for sae-rs
//!
//! Note: Tests marked with #[ignore] require a nanoGPT checkpoint and corpus.
//! Run them explicitly with: cargo test --ignored

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use sae_rs::{
    build_eval_cache, partition_file_name, ActivationStream, JsonlTracker, NanoGpt, NullTracker,
    SafetensorsPartitions, ScoringModel, SublayerCapture, TokenCorpus, TrainConfig, Trainer,
    PARTITION_TENSOR,
};
use tempfile::{NamedTempFile, TempDir};

const WIDTH: usize = 8;

/// Model whose MLP activations equal its residual stream, so substituting a
/// reconstruction costs exactly its mean squared error on top of `FULL_LOSS`.
struct MirrorModel {
    device: Device,
}

const FULL_LOSS: f32 = 2.0;
const ABLATED_LOSS: f32 = 3.0;

impl ScoringModel for MirrorModel {
    fn block_size(&self) -> usize {
        4
    }

    fn d_mlp(&self) -> usize {
        WIDTH
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn forward_with_and_without_mlp(
        &self,
        inputs: &Tensor,
        _targets: &Tensor,
    ) -> Result<SublayerCapture> {
        let ramp = Tensor::arange(1u32, WIDTH as u32 + 1, &self.device)?.to_dtype(DType::F32)?;
        let acts = (inputs
            .to_dtype(DType::F32)?
            .unsqueeze(2)?
            .broadcast_mul(&ramp)?
            / 100.0)?;
        Ok(SublayerCapture {
            residuals: acts.clone(),
            activations: acts,
            loss: FULL_LOSS,
            ablated_loss: ABLATED_LOSS,
        })
    }

    fn loss_from_mlp_acts(
        &self,
        residuals: &Tensor,
        mlp_acts: &Tensor,
        _targets: &Tensor,
    ) -> Result<f32> {
        let mse = (mlp_acts - residuals)?.sqr()?.mean_all()?.to_scalar::<f32>()?;
        Ok(FULL_LOSS + mse)
    }
}

fn write_partitions(dir: &Path, rows: &[usize]) {
    let device = Device::Cpu;
    let mut start = 0u32;
    for (i, &r) in rows.iter().enumerate() {
        // Row values encode their global example index.
        let ids = Tensor::arange(start, start + r as u32, &device)
            .unwrap()
            .to_dtype(DType::F32)
            .unwrap();
        let t = ids
            .unsqueeze(1)
            .unwrap()
            .broadcast_as((r, WIDTH))
            .unwrap()
            .contiguous()
            .unwrap()
            .to_dtype(DType::F16)
            .unwrap();
        let tensors = HashMap::from([(PARTITION_TENSOR.to_string(), t)]);
        candle_core::safetensors::save(&tensors, dir.join(partition_file_name(i))).unwrap();
        start += r as u32;
    }
}

fn corpus_file() -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    for t in 0..400u16 {
        file.write_all(&(t % 97).to_le_bytes()).unwrap();
    }
    file.flush().unwrap();
    file
}

fn test_config() -> TrainConfig {
    TrainConfig {
        batch_size: 64,
        n_features: 16,
        gpt_batch_size: 4,
        eval_contexts: 8,
        eval_context_tokens: 3,
        eval_interval: 2,
        renorm_interval: 1,
        density_hist_bins: 5,
        ..TrainConfig::default()
    }
}

fn build_trainer(
    data_dir: &TempDir,
    rows: &[usize],
    config: TrainConfig,
) -> Trainer<SafetensorsPartitions, MirrorModel> {
    write_partitions(data_dir.path(), rows);
    let partitions = SafetensorsPartitions::open(data_dir.path()).unwrap();
    let stream = ActivationStream::new(partitions, config.batch_size).unwrap();

    let model = MirrorModel {
        device: Device::Cpu,
    };
    let corpus_file = corpus_file();
    let corpus = TokenCorpus::open(corpus_file.path()).unwrap();
    let mut rng = StdRng::seed_from_u64(config.seed);
    let cache = build_eval_cache(&model, &corpus, &config, &mut rng).unwrap();

    Trainer::new(config, stream, model, cache, Box::new(NullTracker)).unwrap()
}

/// Two partitions of 100, batch 64: three steps, one boundary crossing.
#[test]
fn test_training_across_partition_boundary() {
    let dir = TempDir::new().unwrap();
    let mut trainer = build_trainer(&dir, &[100, 100], test_config());
    let summary = trainer.run().unwrap();

    assert_eq!(summary.steps, 3);
    assert_eq!(summary.examples_seen, 192);
    assert_eq!(summary.partition_crossings, 1);
    assert_eq!(summary.evaluations, 2);
    assert!(!summary.no_steps);

    let cursor = trainer.stream().cursor();
    assert_eq!(cursor.partition, 1);
    assert_eq!(cursor.consumed, 192);
    assert_eq!(cursor.offset(), 92);
}

/// Fewer examples than one batch: the loop body never runs.
#[test]
fn test_zero_steps_leaves_parameters_untouched() {
    let dir = TempDir::new().unwrap();
    let mut trainer = build_trainer(&dir, &[50], test_config());
    let before: Vec<f32> = trainer
        .sae()
        .decoder_weight()
        .flatten_all()
        .unwrap()
        .to_vec1()
        .unwrap();

    let summary = trainer.run().unwrap();
    assert!(summary.no_steps);
    assert_eq!(summary.steps, 0);
    assert_eq!(summary.examples_seen, 0);
    assert!(summary.last_metrics.is_none());

    let after: Vec<f32> = trainer
        .sae()
        .decoder_weight()
        .flatten_all()
        .unwrap()
        .to_vec1()
        .unwrap();
    assert_eq!(before, after);
}

#[test]
fn test_evaluation_metrics_are_consistent() {
    let dir = TempDir::new().unwrap();
    let mut trainer = build_trainer(&dir, &[128, 64], test_config());
    let summary = trainer.run().unwrap();
    let metrics = summary.last_metrics.unwrap();

    // Renormalized every step.
    assert!((metrics.mean_dictionary_vector_length - 1.0).abs() < 1e-3);

    // Reconstruction loss is FULL_LOSS plus the autoencoder's MSE and the
    // ablation gap is 1.0, so the normalized score is 1 - mse.
    assert!((metrics.reconst_nll - FULL_LOSS - metrics.mse_loss).abs() < 1e-4);
    assert!((metrics.nll_score - (1.0 - metrics.mse_loss)).abs() < 1e-4);

    assert_eq!(metrics.density.num_alive + metrics.density.num_dead, 16);
    assert!(metrics.density.log_densities.iter().all(|&d| d <= 0.0));
    assert_eq!(metrics.histogram.total(), metrics.density.num_alive);
    if metrics.density.num_alive == 0 {
        assert_eq!(metrics.density.min_log_density, -100.0);
    }
}

#[test]
fn test_short_final_partition_is_dropped() {
    // 100 + 100 + 30 = 230 examples: three full batches of 64, 38 left over.
    let dir = TempDir::new().unwrap();
    let mut trainer = build_trainer(&dir, &[100, 100, 30], test_config());
    assert_eq!(trainer.stream().total_examples(), 230);
    let summary = trainer.run().unwrap();
    assert_eq!(summary.steps, 3);
    assert_eq!(trainer.stream().cursor().partition, 1);
}

#[test]
fn test_jsonl_tracker_records_each_evaluation() {
    let data_dir = TempDir::new().unwrap();
    let out_dir = TempDir::new().unwrap();
    let config = test_config();
    write_partitions(data_dir.path(), &[100, 100]);

    let model = MirrorModel {
        device: Device::Cpu,
    };
    let corpus_file = corpus_file();
    let corpus = TokenCorpus::open(corpus_file.path()).unwrap();
    let mut rng = StdRng::seed_from_u64(config.seed);
    let cache = build_eval_cache(&model, &corpus, &config, &mut rng).unwrap();
    let stream = ActivationStream::new(
        SafetensorsPartitions::open(data_dir.path()).unwrap(),
        config.batch_size,
    )
    .unwrap();
    let sink = JsonlTracker::create(out_dir.path(), "sae_test", &config).unwrap();

    let mut trainer = Trainer::new(config, stream, model, cache, Box::new(sink)).unwrap();
    trainer.run().unwrap();

    let text = std::fs::read_to_string(out_dir.path().join("sae_test/metrics.jsonl")).unwrap();
    let steps: Vec<u64> = text
        .lines()
        .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["step"].as_u64().unwrap())
        .collect();
    assert_eq!(steps, vec![0, 2]);
}

#[test]
fn test_config_overrides_reach_trainer() {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, r#"{{"batch_size": 32, "n_features": 24}}"#).unwrap();
    file.flush().unwrap();

    let config = TrainConfig::load(
        Some(file.path()),
        &[
            "n_features=16".to_string(),
            "gpt_batch_size=4".to_string(),
            "eval_contexts=8".to_string(),
        ],
    )
    .unwrap();
    assert_eq!(config.batch_size, 32);
    assert_eq!(config.n_features, 16);

    let dir = TempDir::new().unwrap();
    let mut trainer = build_trainer(&dir, &[100], config);
    assert_eq!(trainer.sae().n_features(), 16);
    assert_eq!(trainer.run().unwrap().steps, 3);
}

/// Real nanoGPT checkpoint: capture and rescoring agree.
#[test]
#[ignore = "requires a nanoGPT checkpoint in ./out and data/openwebtext/val.bin"]
fn test_real_model_eval_cache() {
    let config = TrainConfig {
        eval_contexts: 16,
        ..TrainConfig::default()
    };
    let device = Device::Cpu;
    let model = NanoGpt::load(&config.model_dir, config.mlp_layer, &device).unwrap();
    let corpus = TokenCorpus::open(&config.corpus_path()).unwrap();
    let mut rng = StdRng::seed_from_u64(config.seed);
    let cache = build_eval_cache(&model, &corpus, &config, &mut rng).unwrap();

    assert_eq!(cache.d_mlp().unwrap(), model.d_mlp());
    assert!(cache.ablated_loss() > cache.full_loss());

    let batch = cache.batch(0, &device).unwrap();
    let rescored = model
        .loss_from_mlp_acts(&batch.residuals, &batch.activations, &batch.targets)
        .unwrap();
    // Cached activations are F16, so only approximately the full loss.
    assert!((rescored - cache.full_loss()).abs() < 0.1);
}
