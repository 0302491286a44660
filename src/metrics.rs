//! Evaluation pass over the cached held-out activations
//!
//! Runs the autoencoder over every cached sub-batch, accumulates its losses,
//! rescoring the base model with the reconstruction in place of the true
//! activations, and counts per-feature activations at the pre-selected token
//! positions for the density statistics.

use anyhow::Result;
use candle_core::{DType, Tensor};
use serde::Serialize;
use tracing::debug;

use crate::cache::EvalCache;
use crate::oracle::ScoringModel;
use crate::sae::SparseAutoencoder;

/// Reported as the minimum log density when no feature fired.
pub const NO_ALIVE_FEATURES_LOG_DENSITY: f32 = -100.0;

/// Aggregated results of one evaluation pass.
#[derive(Debug, Clone)]
pub struct EvalMetrics {
    /// Base model loss with the reconstruction substituted for the activations
    pub reconst_nll: f32,
    pub autoencoder_loss: f32,
    pub mse_loss: f32,
    pub l1_loss: f32,
    /// Mean number of active features per token
    pub feature_activation_sparsity: f32,
    /// Fraction of the ablation loss gap recovered by the reconstruction
    pub nll_score: f32,
    /// Mean L2 norm of the decoder columns
    pub mean_dictionary_vector_length: f32,
    pub density: FeatureDensity,
    pub histogram: DensityHistogram,
}

/// Normalized reconstruction score.
///
/// 1.0 when the reconstruction scores like the intact model, 0.0 when it is
/// no better than ablating the sublayer.
pub fn normalized_score(full_loss: f32, reconst_loss: f32, ablated_loss: f32) -> f32 {
    (ablated_loss - reconst_loss) / (ablated_loss - full_loss)
}

/// Running per-feature activation counts at the selected token positions.
pub struct FeatureCounter {
    counts: Vec<f64>,
}

impl FeatureCounter {
    pub fn new(n_features: usize) -> Self {
        Self {
            counts: vec![0.0; n_features],
        }
    }

    /// Add the activations of one sub-batch.
    ///
    /// `codes` is `[contexts * seq_len, m]` with context `i`, position `p` at
    /// row `i * seq_len + p`.
    pub fn update(
        &mut self,
        codes: &Tensor,
        seq_len: usize,
        selected_positions: &[Vec<usize>],
    ) -> Result<()> {
        let (rows, m) = codes.dims2()?;
        anyhow::ensure!(
            m == self.counts.len(),
            "Code width {m} does not match {} counted features",
            self.counts.len()
        );

        let mut index = Vec::new();
        for (i, positions) in selected_positions.iter().enumerate() {
            for &p in positions {
                let row = i * seq_len + p;
                anyhow::ensure!(row < rows, "Selected position {p} outside context {i}");
                index.push(row as u32);
            }
        }
        if index.is_empty() {
            return Ok(());
        }

        let len = index.len();
        let index = Tensor::from_vec(index, len, codes.device())?;
        let selected = codes.index_select(&index, 0)?;
        let fired: Vec<f32> = selected
            .ne(0f32)?
            .to_dtype(DType::F32)?
            .sum(0)?
            .to_vec1()?;
        for (count, f) in self.counts.iter_mut().zip(fired) {
            *count += f64::from(f);
        }
        Ok(())
    }

    pub fn counts(&self) -> &[f64] {
        &self.counts
    }

    /// Density statistics over `eval_tokens` scored positions.
    pub fn density(&self, eval_tokens: usize) -> FeatureDensity {
        FeatureDensity::from_counts(&self.counts, eval_tokens)
    }
}

/// Log-scale activation densities of the features that fired at least once.
#[derive(Debug, Clone, Serialize)]
pub struct FeatureDensity {
    /// `log10(count / eval_tokens)` of every alive feature, in feature order
    pub log_densities: Vec<f32>,
    pub num_alive: usize,
    pub num_dead: usize,
    /// Smallest log density, or [`NO_ALIVE_FEATURES_LOG_DENSITY`]
    pub min_log_density: f32,
}

impl FeatureDensity {
    pub fn from_counts(counts: &[f64], eval_tokens: usize) -> Self {
        let total = eval_tokens.max(1) as f64;
        let log_densities: Vec<f32> = counts
            .iter()
            .filter(|&&c| c > 0.0)
            .map(|&c| (c / total).log10() as f32)
            .collect();
        let num_alive = log_densities.len();
        let min_log_density = log_densities
            .iter()
            .copied()
            .reduce(f32::min)
            .unwrap_or(NO_ALIVE_FEATURES_LOG_DENSITY);
        Self {
            num_alive,
            num_dead: counts.len() - num_alive,
            min_log_density,
            log_densities,
        }
    }
}

/// Equal-width count histogram; `edges` has one more entry than `counts`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DensityHistogram {
    pub edges: Vec<f32>,
    pub counts: Vec<usize>,
}

impl DensityHistogram {
    /// Bin `values` into `bins` equal-width bins spanning their range.
    ///
    /// A degenerate range `v..v` is widened to `v - 0.5..v + 0.5`. The last
    /// bin is closed on the right.
    pub fn new(values: &[f32], bins: usize) -> Self {
        if values.is_empty() || bins == 0 {
            return Self::default();
        }
        let mut lo = values.iter().copied().fold(f32::INFINITY, f32::min);
        let mut hi = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        if lo == hi {
            lo -= 0.5;
            hi += 0.5;
        }
        let width = (hi - lo) / bins as f32;
        let edges: Vec<f32> = (0..=bins).map(|i| lo + width * i as f32).collect();

        let mut counts = vec![0usize; bins];
        for &v in values {
            let bin = (((v - lo) / width) as usize).min(bins - 1);
            counts[bin] += 1;
        }
        Self { edges, counts }
    }

    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }
}

/// Full evaluation pass of `sae` over `cache`, rescoring with `model`.
pub fn evaluate<M: ScoringModel>(
    sae: &SparseAutoencoder,
    cache: &EvalCache,
    model: &M,
    hist_bins: usize,
) -> Result<EvalMetrics> {
    let n_batches = cache.n_batches();
    anyhow::ensure!(n_batches > 0, "Evaluation cache is empty");

    let mut counter = FeatureCounter::new(sae.n_features());
    let mut reconst_nll = 0.0f64;
    let mut autoencoder_loss = 0.0f64;
    let mut mse_loss = 0.0f64;
    let mut l1_loss = 0.0f64;
    let mut sparsity = 0.0f64;

    for iter in 0..n_batches {
        // Everything allocated for this sub-batch is dropped at the end of the iteration.
        let batch = cache.batch(iter, model.device())?;
        let (b, seq_len, n) = batch.activations.dims3()?;
        let acts = batch.activations.reshape((b * seq_len, n))?;

        let out = sae.reconstruct(&acts)?;
        autoencoder_loss += f64::from(out.loss.to_scalar::<f32>()?);
        mse_loss += f64::from(out.mse.to_scalar::<f32>()?);
        l1_loss += f64::from(out.l1.to_scalar::<f32>()?);

        let active = out.codes.ne(0f32)?.to_dtype(DType::F32)?;
        sparsity += f64::from(active.sum(1)?.mean_all()?.to_scalar::<f32>()?);
        counter.update(&out.codes, seq_len, batch.selected_positions)?;

        let reconstruction = out.reconstruction.detach().reshape((b, seq_len, n))?;
        reconst_nll +=
            f64::from(model.loss_from_mlp_acts(&batch.residuals, &reconstruction, &batch.targets)?);
    }

    let mean = |total: f64| (total / n_batches as f64) as f32;
    let reconst_nll = mean(reconst_nll);
    let density = counter.density(cache.eval_tokens());
    let histogram = DensityHistogram::new(&density.log_densities, hist_bins);
    debug!(
        "Evaluation pass: {n_batches} batches, {} alive / {} dead features",
        density.num_alive, density.num_dead
    );

    Ok(EvalMetrics {
        reconst_nll,
        autoencoder_loss: mean(autoencoder_loss),
        mse_loss: mean(mse_loss),
        l1_loss: mean(l1_loss),
        feature_activation_sparsity: mean(sparsity),
        nll_score: normalized_score(cache.full_loss(), reconst_nll, cache.ablated_loss()),
        mean_dictionary_vector_length: sae.mean_feature_norm()?,
        density,
        histogram,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_normalized_score_endpoints() {
        assert!((normalized_score(3.0, 3.0, 5.0) - 1.0).abs() < 1e-6);
        assert!(normalized_score(3.0, 5.0, 5.0).abs() < 1e-6);
        assert!((normalized_score(3.0, 4.0, 5.0) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_feature_counter_uses_selected_positions_only() {
        // Two contexts of three positions, four features.
        let codes = Tensor::new(
            &[
                [1.0f32, 0.0, 0.0, 0.0],
                [0.0, 2.0, 0.0, 0.0],
                [0.0, 0.0, 3.0, 0.0],
                [1.0, 1.0, 0.0, 0.0],
                [0.0, 0.0, 0.0, 0.0],
                [0.0, 0.0, 5.0, 0.0],
            ],
            &Device::Cpu,
        )
        .unwrap();
        let mut counter = FeatureCounter::new(4);
        counter
            .update(&codes, 3, &[vec![0, 1], vec![0, 2]])
            .unwrap();
        assert_eq!(counter.counts(), &[2.0, 2.0, 1.0, 0.0]);

        let density = counter.density(4);
        assert_eq!(density.num_alive, 3);
        assert_eq!(density.num_dead, 1);
        assert!((density.log_densities[0] - 0.5f32.log10()).abs() < 1e-6);
        assert!((density.min_log_density - 0.25f32.log10()).abs() < 1e-6);
    }

    #[test]
    fn test_feature_counter_rejects_out_of_range_position() {
        let codes = Tensor::zeros((4, 2), DType::F32, &Device::Cpu).unwrap();
        let mut counter = FeatureCounter::new(2);
        assert!(counter.update(&codes, 2, &[vec![0], vec![2]]).is_err());
    }

    #[test]
    fn test_density_never_exceeds_one() {
        let density = FeatureDensity::from_counts(&[10.0, 3.0, 0.0], 10);
        assert!(density.log_densities.iter().all(|&d| d <= 0.0));
        assert_eq!(density.num_alive + density.num_dead, 3);
    }

    #[test]
    fn test_no_alive_features() {
        let density = FeatureDensity::from_counts(&[0.0; 5], 10);
        assert_eq!(density.num_alive, 0);
        assert_eq!(density.num_dead, 5);
        assert_eq!(density.min_log_density, NO_ALIVE_FEATURES_LOG_DENSITY);
        let hist = DensityHistogram::new(&density.log_densities, 10);
        assert!(hist.counts.is_empty());
    }

    #[test]
    fn test_histogram_bins() {
        let hist = DensityHistogram::new(&[-3.0, -2.5, -2.0, -1.0, -1.0], 4);
        assert_eq!(hist.edges.len(), 5);
        assert_eq!(hist.total(), 5);
        assert_eq!(hist.counts, vec![1, 1, 1, 2]);
        assert!((hist.edges[0] + 3.0).abs() < 1e-6);
        assert!((hist.edges[4] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_histogram_single_value() {
        let hist = DensityHistogram::new(&[-2.0, -2.0], 2);
        assert_eq!(hist.counts, vec![0, 2]);
        assert!((hist.edges[0] + 2.5).abs() < 1e-6);
    }
}
