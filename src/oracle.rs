//! Evaluation oracle
//!
//! The base language model is only used as a scoring oracle. Anything that
//! implements [`ScoringModel`] can fix the evaluation baseline:
//!
//! - [`ScoringModel::forward_with_and_without_mlp`] returns the instrumented
//!   sublayer's input and activations together with the ordinary loss and the
//!   loss with the sublayer's contribution zeroed.
//! - [`ScoringModel::loss_from_mlp_acts`] scores a substitute set of
//!   activations (the autoencoder's reconstruction).

use anyhow::Result;
use candle_core::{Device, Tensor};
use rand::Rng;
use tracing::{info, warn};

use crate::cache::{slice_rows, EvalCache};
use crate::config::TrainConfig;
use crate::corpus::TokenCorpus;

/// Output of one instrumented forward pass.
pub struct SublayerCapture {
    /// Sublayer input, `[batch, seq, d_model]`
    pub residuals: Tensor,
    /// Sublayer activations, `[batch, seq, d_mlp]`
    pub activations: Tensor,
    /// Ordinary next-token loss
    pub loss: f32,
    /// Loss with the sublayer's output zeroed
    pub ablated_loss: f32,
}

/// Base model interface needed by the evaluation pipeline.
pub trait ScoringModel {
    /// Context window length
    fn block_size(&self) -> usize;
    /// Width of the instrumented activations
    fn d_mlp(&self) -> usize;
    fn device(&self) -> &Device;

    /// Run `inputs` (`[batch, seq]` token ids) and capture the sublayer.
    fn forward_with_and_without_mlp(&self, inputs: &Tensor, targets: &Tensor)
        -> Result<SublayerCapture>;

    /// Loss obtained when the sublayer outputs `mlp_acts` on top of `residuals`.
    fn loss_from_mlp_acts(&self, residuals: &Tensor, mlp_acts: &Tensor, targets: &Tensor)
        -> Result<f32>;
}

/// Sample held-out contexts from `corpus`, run them through `model` and
/// cache everything later evaluations need.
///
/// The context count is rounded down to a multiple of `gpt_batch_size`.
pub fn build_eval_cache<M: ScoringModel, R: Rng>(
    model: &M,
    corpus: &TokenCorpus,
    config: &TrainConfig,
    rng: &mut R,
) -> Result<EvalCache> {
    let batch_size = config.gpt_batch_size;
    let n_batches = config.eval_contexts / batch_size;
    anyhow::ensure!(
        n_batches > 0,
        "eval_contexts ({}) smaller than gpt_batch_size ({batch_size})",
        config.eval_contexts
    );
    let n_contexts = n_batches * batch_size;
    if n_contexts != config.eval_contexts {
        warn!(
            "Using {n_contexts} of {} evaluation contexts (multiple of gpt_batch_size={batch_size})",
            config.eval_contexts
        );
    }

    let contexts = corpus.sample_contexts(
        n_contexts,
        model.block_size(),
        config.eval_context_tokens,
        rng,
    )?;
    info!(
        "Sampled {n_contexts} evaluation contexts of {} tokens",
        model.block_size()
    );

    let mut residuals = Vec::with_capacity(n_batches);
    let mut activations = Vec::with_capacity(n_batches);
    let mut full_loss = 0.0f64;
    let mut ablated_loss = 0.0f64;

    for iter in 0..n_batches {
        if iter % 50 == 0 {
            info!("Computing evaluation activations: batch {iter}/{n_batches}");
        }
        let x = slice_rows(&contexts.inputs, iter, batch_size)?.to_device(model.device())?;
        let y = slice_rows(&contexts.targets, iter, batch_size)?.to_device(model.device())?;

        let capture = model.forward_with_and_without_mlp(&x, &y)?;
        residuals.push(
            capture
                .residuals
                .to_dtype(candle_core::DType::F16)?
                .to_device(&Device::Cpu)?,
        );
        activations.push(
            capture
                .activations
                .to_dtype(candle_core::DType::F16)?
                .to_device(&Device::Cpu)?,
        );
        full_loss += f64::from(capture.loss);
        ablated_loss += f64::from(capture.ablated_loss);
    }

    let full_loss = (full_loss / n_batches as f64) as f32;
    let ablated_loss = (ablated_loss / n_batches as f64) as f32;
    info!(
        "Full model loss {full_loss:.4}, MLP-ablated loss {ablated_loss:.4} on evaluation data"
    );

    let residuals = Tensor::cat(&residuals, 0)?;
    let activations = Tensor::cat(&activations, 0)?;
    // The sampled inputs are dropped here; only targets are still needed.
    EvalCache::new(
        residuals,
        activations,
        contexts.targets,
        contexts.selected_positions,
        full_loss,
        ablated_loss,
        batch_size,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::io::Write;

    /// Model whose activations are the token ids and whose loss counts calls.
    struct EchoModel {
        device: Device,
        calls: std::cell::Cell<usize>,
    }

    impl ScoringModel for EchoModel {
        fn block_size(&self) -> usize {
            4
        }

        fn d_mlp(&self) -> usize {
            1
        }

        fn device(&self) -> &Device {
            &self.device
        }

        fn forward_with_and_without_mlp(
            &self,
            inputs: &Tensor,
            _targets: &Tensor,
        ) -> Result<SublayerCapture> {
            let n = self.calls.get();
            self.calls.set(n + 1);
            let acts = inputs.to_dtype(DType::F32)?.unsqueeze(2)?;
            Ok(SublayerCapture {
                residuals: acts.clone(),
                activations: acts,
                loss: n as f32,
                ablated_loss: 10.0,
            })
        }

        fn loss_from_mlp_acts(&self, _r: &Tensor, _a: &Tensor, _t: &Tensor) -> Result<f32> {
            Ok(0.0)
        }
    }

    #[test]
    fn test_build_eval_cache_averages_losses() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for t in 0u16..200 {
            file.write_all(&t.to_le_bytes()).unwrap();
        }
        file.flush().unwrap();
        let corpus = TokenCorpus::open(file.path()).unwrap();

        let mut config = TrainConfig::default();
        config.eval_contexts = 10;
        config.gpt_batch_size = 4;
        config.eval_context_tokens = 3;

        let model = EchoModel {
            device: Device::Cpu,
            calls: std::cell::Cell::new(0),
        };
        let mut rng = StdRng::seed_from_u64(1442);
        let cache = build_eval_cache(&model, &corpus, &config, &mut rng).unwrap();

        // 10 contexts round down to 2 batches of 4.
        assert_eq!(model.calls.get(), 2);
        assert_eq!(cache.n_contexts(), 8);
        assert_eq!(cache.n_batches(), 2);
        assert_eq!(cache.eval_tokens(), 24);
        assert!((cache.full_loss() - 0.5).abs() < 1e-6);
        assert!((cache.ablated_loss() - 10.0).abs() < 1e-6);
        assert_eq!(cache.d_mlp().unwrap(), 1);

        // Cached activations are the inputs, whose targets are input + 1.
        let batch = cache.batch(0, &Device::Cpu).unwrap();
        let acts: Vec<f32> = batch.activations.flatten_all().unwrap().to_vec1().unwrap();
        let targets: Vec<u32> = batch.targets.flatten_all().unwrap().to_vec1().unwrap();
        for (a, t) in acts.iter().zip(&targets) {
            assert_eq!(*a as u32 + 1, *t);
        }
    }
}
