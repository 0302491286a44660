//! Token corpus for drawing held-out evaluation contexts

use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use memmap2::Mmap;
use rand::Rng;
use tracing::info;

/// Read-only memory map of a flat `u16` little-endian token file.
pub struct TokenCorpus {
    mmap: Mmap,
}

/// Randomly placed context windows with next-token targets.
#[derive(Debug)]
pub struct EvalContexts {
    /// Token ids, `[n_contexts, block_size]` (U32)
    pub inputs: Tensor,
    /// Inputs shifted left by one, `[n_contexts, block_size]` (U32)
    pub targets: Tensor,
    /// Positions within each context used for feature density statistics
    pub selected_positions: Vec<Vec<usize>>,
}

impl EvalContexts {
    pub fn len(&self) -> usize {
        self.selected_positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.selected_positions.is_empty()
    }
}

impl TokenCorpus {
    /// Map a token file
    pub fn open(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open token corpus {}", path.display()))?;
        // SAFETY: the corpus is opened read-only and never written during a run.
        let mmap = unsafe { Mmap::map(&file) }
            .with_context(|| format!("Failed to map token corpus {}", path.display()))?;
        anyhow::ensure!(
            mmap.len() % 2 == 0,
            "Token corpus {} has odd byte length {}",
            path.display(),
            mmap.len()
        );
        info!("Mapped {} tokens from {}", mmap.len() / 2, path.display());
        Ok(Self { mmap })
    }

    /// Number of tokens
    pub fn len(&self) -> usize {
        self.mmap.len() / 2
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Token at position `i`
    pub fn token(&self, i: usize) -> u32 {
        u32::from(u16::from_le_bytes([self.mmap[2 * i], self.mmap[2 * i + 1]]))
    }

    /// Sample `n_contexts` windows of `block_size` tokens plus their targets,
    /// and `tokens_per_context` positions inside each window.
    pub fn sample_contexts<R: Rng>(
        &self,
        n_contexts: usize,
        block_size: usize,
        tokens_per_context: usize,
        rng: &mut R,
    ) -> Result<EvalContexts> {
        anyhow::ensure!(block_size > 0, "block_size must be positive");
        anyhow::ensure!(
            self.len() > block_size,
            "Corpus has {} tokens, need more than block_size={block_size}",
            self.len()
        );

        let mut inputs = Vec::with_capacity(n_contexts * block_size);
        let mut targets = Vec::with_capacity(n_contexts * block_size);
        for _ in 0..n_contexts {
            let start = rng.gen_range(0..self.len() - block_size);
            inputs.extend((start..start + block_size).map(|i| self.token(i)));
            targets.extend((start + 1..start + 1 + block_size).map(|i| self.token(i)));
        }

        let selected_positions: Vec<Vec<usize>> = (0..n_contexts)
            .map(|_| {
                (0..tokens_per_context)
                    .map(|_| rng.gen_range(0..block_size))
                    .collect()
            })
            .collect();

        let device = Device::Cpu;
        Ok(EvalContexts {
            inputs: Tensor::from_vec(inputs, (n_contexts, block_size), &device)?,
            targets: Tensor::from_vec(targets, (n_contexts, block_size), &device)?,
            selected_positions,
        })
    }
}
