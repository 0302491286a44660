//! Evaluation cache: held-out activations and baseline losses
//!
//! Built once before training by [`crate::oracle::build_eval_cache`] and
//! read-only afterwards. Residual streams and MLP activations are stored on
//! the CPU in F16 to bound memory; sub-batches are moved to the compute
//! device one at a time.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};

/// Held-out contexts run through the base model, plus the two baseline losses.
#[derive(Debug)]
pub struct EvalCache {
    /// Sublayer inputs, `[n_contexts, block_size, d_model]` (F16, CPU)
    residuals: Tensor,
    /// Sublayer activations, `[n_contexts, block_size, d_mlp]` (F16, CPU)
    activations: Tensor,
    /// Next-token targets, `[n_contexts, block_size]` (U32, CPU)
    targets: Tensor,
    /// Per-context positions used for feature density statistics
    selected_positions: Vec<Vec<usize>>,
    /// Mean base-model loss over all sub-batches
    full_loss: f32,
    /// Mean loss with the sublayer's contribution zeroed
    ablated_loss: f32,
    /// Contexts per sub-batch
    batch_size: usize,
}

/// One sub-batch of the cache, moved to the compute device.
pub struct EvalBatch<'a> {
    pub residuals: Tensor,
    pub activations: Tensor,
    pub targets: Tensor,
    pub selected_positions: &'a [Vec<usize>],
}

impl EvalCache {
    /// Assemble a cache; all tensors must agree on the context count.
    pub fn new(
        residuals: Tensor,
        activations: Tensor,
        targets: Tensor,
        selected_positions: Vec<Vec<usize>>,
        full_loss: f32,
        ablated_loss: f32,
        batch_size: usize,
    ) -> Result<Self> {
        let n_contexts = targets.dim(0)?;
        anyhow::ensure!(batch_size > 0, "Evaluation batch size must be positive");
        anyhow::ensure!(
            residuals.dim(0)? == n_contexts
                && activations.dim(0)? == n_contexts
                && selected_positions.len() == n_contexts,
            "Evaluation cache parts disagree on context count ({n_contexts} targets)"
        );
        anyhow::ensure!(
            n_contexts % batch_size == 0,
            "{n_contexts} evaluation contexts do not split into batches of {batch_size}"
        );
        Ok(Self {
            residuals: residuals.to_dtype(DType::F16)?,
            activations: activations.to_dtype(DType::F16)?,
            targets,
            selected_positions,
            full_loss,
            ablated_loss,
            batch_size,
        })
    }

    pub fn n_contexts(&self) -> usize {
        self.selected_positions.len()
    }

    /// Number of sub-batches in one evaluation pass
    pub fn n_batches(&self) -> usize {
        self.n_contexts() / self.batch_size
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Width of the cached activations
    pub fn d_mlp(&self) -> Result<usize> {
        Ok(self.activations.dim(2)?)
    }

    pub fn full_loss(&self) -> f32 {
        self.full_loss
    }

    pub fn ablated_loss(&self) -> f32 {
        self.ablated_loss
    }

    /// Token positions scored for feature density in one pass
    pub fn eval_tokens(&self) -> usize {
        self.selected_positions.iter().map(Vec::len).sum()
    }

    /// Estimate memory usage in bytes
    ///
    /// Returns the total memory used by the cached tensors.
    pub fn memory_usage(&self) -> usize {
        [&self.residuals, &self.activations, &self.targets]
            .iter()
            .map(|t| t.elem_count() * t.dtype().size_in_bytes())
            .sum()
    }

    /// Sub-batch `iter`, converted to F32 on `device`.
    pub fn batch(&self, iter: usize, device: &Device) -> Result<EvalBatch<'_>> {
        anyhow::ensure!(
            iter < self.n_batches(),
            "Evaluation batch {iter} out of range ({} batches)",
            self.n_batches()
        );
        let start = iter * self.batch_size;
        Ok(EvalBatch {
            residuals: slice_rows(&self.residuals, iter, self.batch_size)?
                .to_dtype(DType::F32)?
                .to_device(device)?,
            activations: slice_rows(&self.activations, iter, self.batch_size)?
                .to_dtype(DType::F32)?
                .to_device(device)?,
            targets: slice_rows(&self.targets, iter, self.batch_size)?.to_device(device)?,
            selected_positions: &self.selected_positions[start..start + self.batch_size],
        })
    }
}

/// Rows `[iter * batch_size, (iter + 1) * batch_size)` of `t`.
pub fn slice_rows(t: &Tensor, iter: usize, batch_size: usize) -> Result<Tensor> {
    Ok(t.narrow(0, iter * batch_size, batch_size)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_cache() -> EvalCache {
        let device = Device::Cpu;
        let residuals = Tensor::randn(0.0f32, 1.0, (4, 3, 5), &device).unwrap();
        let activations = Tensor::randn(0.0f32, 1.0, (4, 3, 6), &device).unwrap();
        let targets = Tensor::zeros((4, 3), DType::U32, &device).unwrap();
        let positions = vec![vec![0, 2]; 4];
        EvalCache::new(residuals, activations, targets, positions, 2.5, 3.0, 2).unwrap()
    }

    #[test]
    fn test_cache_basic() {
        let cache = small_cache();
        assert_eq!(cache.n_contexts(), 4);
        assert_eq!(cache.n_batches(), 2);
        assert_eq!(cache.d_mlp().unwrap(), 6);
        assert_eq!(cache.eval_tokens(), 8);
        assert_eq!(cache.full_loss(), 2.5);
        assert_eq!(cache.ablated_loss(), 3.0);
        // F16 residuals and activations, U32 targets.
        assert_eq!(cache.memory_usage(), 60 * 2 + 72 * 2 + 12 * 4);
    }

    #[test]
    fn test_cache_batch_slicing() {
        let cache = small_cache();
        let batch = cache.batch(1, &Device::Cpu).unwrap();
        assert_eq!(batch.residuals.dims(), &[2, 3, 5]);
        assert_eq!(batch.activations.dims(), &[2, 3, 6]);
        assert_eq!(batch.activations.dtype(), DType::F32);
        assert_eq!(batch.targets.dims(), &[2, 3]);
        assert_eq!(batch.selected_positions.len(), 2);
        assert!(cache.batch(2, &Device::Cpu).is_err());
    }

    #[test]
    fn test_slice_rows() {
        let t = Tensor::arange(0u32, 6, &Device::Cpu).unwrap();
        let s: Vec<u32> = slice_rows(&t, 1, 2).unwrap().to_vec1().unwrap();
        assert_eq!(s, vec![2, 3]);
    }

    #[test]
    fn test_cache_rejects_ragged_batches() {
        let device = Device::Cpu;
        let residuals = Tensor::zeros((3, 2, 2), DType::F32, &device).unwrap();
        let activations = Tensor::zeros((3, 2, 2), DType::F32, &device).unwrap();
        let targets = Tensor::zeros((3, 2), DType::U32, &device).unwrap();
        let result = EvalCache::new(
            residuals,
            activations,
            targets,
            vec![vec![0]; 3],
            1.0,
            2.0,
            2,
        );
        assert!(result.is_err());
    }
}
