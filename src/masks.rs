//! Causal attention masks for the base model
//!
//! The evaluation oracle runs thousands of forward passes with the same
//! context length, so masks are cached by `(seq_len, device, dtype)` and
//! handed out as shallow clones (Arc bump, no data copy).

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};

type CausalMaskCache = LazyLock<Mutex<HashMap<(usize, usize, DType), Tensor>>>;

static CAUSAL_MASK_CACHE: CausalMaskCache = LazyLock::new(|| Mutex::new(HashMap::new()));

/// Assumes a single device per backend type.
fn device_id(device: &Device) -> usize {
    match device {
        Device::Cpu => 0,
        Device::Cuda(_) => 1,
        Device::Metal(_) => 2,
    }
}

/// Additive causal mask of shape `[1, 1, seq_len, seq_len]`:
/// `0.0` where `j <= i`, `-inf` above the diagonal.
///
/// ```text
/// [[[[0, -inf, -inf],
///    [0,    0, -inf],
///    [0,    0,    0]]]]
/// ```
pub fn create_causal_mask(seq_len: usize, device: &Device, dtype: DType) -> Result<Tensor> {
    let cache_key = (seq_len, device_id(device), dtype);

    {
        let cache = CAUSAL_MASK_CACHE
            .lock()
            .map_err(|_| anyhow::anyhow!("causal mask cache poisoned"))?;
        if let Some(cached) = cache.get(&cache_key) {
            return Ok(cached.clone());
        }
    }

    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j <= i { 0.0 } else { f32::NEG_INFINITY }))
        .collect();
    let mask_tensor = Tensor::from_vec(mask, (1, 1, seq_len, seq_len), device)?.to_dtype(dtype)?;

    CAUSAL_MASK_CACHE
        .lock()
        .map_err(|_| anyhow::anyhow!("causal mask cache poisoned"))?
        .insert(cache_key, mask_tensor.clone());

    Ok(mask_tensor)
}

/// Drop all cached masks
pub fn clear_mask_caches() {
    if let Ok(mut cache) = CAUSAL_MASK_CACHE.lock() {
        cache.clear();
    }
}

/// Number of cached masks
pub fn mask_cache_size() -> usize {
    CAUSAL_MASK_CACHE.lock().map(|c| c.len()).unwrap_or(0)
}
