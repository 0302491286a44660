//! Training loop
//!
//! One step per batch of the activation stream:
//!
//! 1. fetch batch `step` and move it to the compute device
//! 2. forward, backward (a fresh gradient store per step)
//! 3. project the decoder gradient orthogonal to the decoder columns
//! 4. Adam update
//! 5. every `renorm_interval` steps, renormalize the decoder columns
//! 6. every `eval_interval` steps, run a full evaluation pass and log it
//!
//! Steps 1-3 are [`Trainer::gradients`], 4-5 are [`Trainer::apply_update`].
//!
//! Steps run in order, single-threaded. The batch and all tensors derived
//! from it live in a block scope and are released before evaluation.

use std::time::Instant;

use anyhow::{Context, Result};
use candle_core::backprop::GradStore;
use candle_core::Device;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use tracing::{info, warn};

use crate::cache::EvalCache;
use crate::config::TrainConfig;
use crate::metrics::{evaluate, EvalMetrics};
use crate::oracle::ScoringModel;
use crate::sae::SparseAutoencoder;
use crate::shards::{ActivationStream, PartitionSource};
use crate::tracker::MetricsSink;

/// What a finished run reports.
#[derive(Debug, Clone)]
pub struct TrainSummary {
    pub steps: usize,
    pub examples_seen: usize,
    pub evaluations: usize,
    pub partition_crossings: usize,
    pub last_metrics: Option<EvalMetrics>,
    /// Fewer than one batch of examples was available
    pub no_steps: bool,
}

/// Owns the autoencoder, its optimizer and everything a run reads from.
pub struct Trainer<S: PartitionSource, M: ScoringModel> {
    config: TrainConfig,
    sae: SparseAutoencoder,
    optimizer: AdamW,
    stream: ActivationStream<S>,
    model: M,
    cache: EvalCache,
    sink: Box<dyn MetricsSink>,
    device: Device,
}

impl<S: PartitionSource, M: ScoringModel> Trainer<S, M> {
    /// Build the autoencoder and its optimizer.
    ///
    /// The stream width, the cached activation width and the model's MLP
    /// width must all agree.
    pub fn new(
        config: TrainConfig,
        stream: ActivationStream<S>,
        model: M,
        cache: EvalCache,
        sink: Box<dyn MetricsSink>,
    ) -> Result<Self> {
        let n_inputs = stream.width();
        anyhow::ensure!(
            n_inputs == model.d_mlp(),
            "Activation partitions have width {n_inputs}, model MLP width is {}",
            model.d_mlp()
        );
        anyhow::ensure!(
            cache.d_mlp()? == n_inputs,
            "Evaluation cache width {} does not match activation width {n_inputs}",
            cache.d_mlp()?
        );
        anyhow::ensure!(
            stream.batch_size() == config.batch_size,
            "Stream batch size {} does not match configured batch_size {}",
            stream.batch_size(),
            config.batch_size
        );

        let device = model.device().clone();
        // candle's CPU generator cannot be seeded; accelerators can.
        if !device.is_cpu() {
            device.set_seed(config.seed)?;
        }
        let sae = SparseAutoencoder::new(n_inputs, config.n_features, config.l1_coeff, &device)?;
        let params = ParamsAdamW {
            lr: config.learning_rate,
            weight_decay: 0.0,
            ..Default::default()
        };
        let optimizer = AdamW::new(sae.vars(), params)?;
        info!(
            "Autoencoder: n={n_inputs}, m={}, l1_coeff={}, lr={}",
            config.n_features, config.l1_coeff, config.learning_rate
        );

        Ok(Self {
            config,
            sae,
            optimizer,
            stream,
            model,
            cache,
            sink,
            device,
        })
    }

    pub fn sae(&self) -> &SparseAutoencoder {
        &self.sae
    }

    pub fn stream(&self) -> &ActivationStream<S> {
        &self.stream
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    /// Train over every full batch of the stream.
    pub fn run(&mut self) -> Result<TrainSummary> {
        let total_steps = self.stream.total_steps();
        let batch_size = self.config.batch_size;
        println!(
            "Approximate number of training examples: {}",
            self.stream.total_examples()
        );
        let no_steps = total_steps == 0;
        if no_steps {
            println!("No training steps: fewer than batch_size={batch_size} examples available");
            warn!("Autoencoder parameters are left at their initial values");
        }

        let start_time = Instant::now();
        let mut evaluations = 0;
        let mut last_metrics = None;

        for step in 0..total_steps {
            {
                let grads = self
                    .gradients(step)
                    .with_context(|| format!("Training step {step} failed"))?;
                self.apply_update(step, &grads)?;
            }

            if step % self.config.eval_interval == 0 {
                let start_logging_time = Instant::now();
                let metrics = evaluate(
                    &self.sae,
                    &self.cache,
                    &self.model,
                    self.config.density_hist_bins,
                )
                .with_context(|| format!("Evaluation at step {step} failed"))?;
                println!(
                    "batch: {step}/{total_steps}, time per step: {:.2}, logging time = {:.2}",
                    start_time.elapsed().as_secs_f64() / (step + 1) as f64,
                    start_logging_time.elapsed().as_secs_f64()
                );
                println!(
                    "  loss {:.4} (mse {:.4}, l1 {:.2}), reconst nll {:.4}, score {:.3}, alive {} / dead {}",
                    metrics.autoencoder_loss,
                    metrics.mse_loss,
                    metrics.l1_loss,
                    metrics.reconst_nll,
                    metrics.nll_score,
                    metrics.density.num_alive,
                    metrics.density.num_dead
                );
                self.sink.log(step, &metrics)?;
                evaluations += 1;
                last_metrics = Some(metrics);
            }
        }

        let examples_seen = total_steps * batch_size;
        println!("Exited loop after training on {examples_seen} examples");
        self.sink.finish()?;

        Ok(TrainSummary {
            steps: total_steps,
            examples_seen,
            evaluations,
            partition_crossings: self.stream.crossings(),
            last_metrics,
            no_steps,
        })
    }

    /// Gradients for batch `step`, with the decoder gradient already
    /// projected orthogonal to the decoder columns. The batch is dropped on
    /// return.
    pub fn gradients(&mut self, step: usize) -> Result<GradStore> {
        let batch = self.stream.next_batch(step)?.to_device(&self.device)?;
        let out = self.sae.reconstruct(&batch)?;
        let mut grads = out.loss.backward()?;
        self.sae.project_decoder_grad(&mut grads)?;
        Ok(grads)
    }

    /// Adam update, then decoder renormalization when `step` is a multiple
    /// of `renorm_interval`. Returns whether the decoder was renormalized.
    pub fn apply_update(&mut self, step: usize, grads: &GradStore) -> Result<bool> {
        self.optimizer.step(grads)?;
        let renormalize = step % self.config.renorm_interval == 0;
        if renormalize {
            self.sae.renormalize_decoder()?;
        }
        Ok(renormalize)
    }
}
