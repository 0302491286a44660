//! Sparse autoencoder over MLP activations
//!
//! ```text
//! x     = acts - b_dec
//! f     = ReLU(W_enc @ x + b_enc)          codes,          [batch, m]
//! x_hat = W_dec @ f + b_dec                reconstruction, [batch, n]
//! loss  = mean((x_hat - acts)^2) + λ * sum(|f|)
//! ```
//!
//! `W_dec` has shape `[n, m]`: column `j` is the dictionary vector of
//! feature `j`. Columns start at unit norm and are renormalized by the
//! training loop every few steps. Between renormalizations the decoder
//! gradient has its component along each column removed
//! ([`project_out_parallel`]), so gradient descent only rotates features.

use std::path::Path;

use anyhow::{Context, Result};
use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Init, VarBuilder, VarMap};

/// Floor for column norms when normalizing, matches `F.normalize`.
const NORM_EPS: f64 = 1e-12;

/// Result of one autoencoder forward pass.
pub struct SaeOutput {
    /// `mse + λ * l1`, scalar
    pub loss: Tensor,
    /// Mean squared reconstruction error, scalar
    pub mse: Tensor,
    /// Sum of code magnitudes over the whole batch (not averaged), scalar
    pub l1: Tensor,
    /// Sparse codes, `[batch, m]`
    pub codes: Tensor,
    /// Reconstructed activations, `[batch, n]`
    pub reconstruction: Tensor,
}

/// Two-layer ReLU autoencoder with an L1 sparsity penalty.
///
/// Parameters live in a [`VarMap`] under `W_enc`, `b_enc`, `W_dec` and
/// `b_dec`; the struct keeps handles on the same variables.
pub struct SparseAutoencoder {
    varmap: VarMap,
    w_enc: Var, // [m, n]
    b_enc: Var, // [m]
    w_dec: Var, // [n, m]
    b_dec: Var, // [n]
    l1_coeff: f64,
    n_inputs: usize,
    n_features: usize,
}

impl SparseAutoencoder {
    /// Create an autoencoder mapping `n_inputs` activations to `n_features` codes.
    ///
    /// Weights are drawn from `U(-1/sqrt(fan_in), 1/sqrt(fan_in))`, biases
    /// start at zero, decoder columns are then scaled to unit norm.
    pub fn new(n_inputs: usize, n_features: usize, l1_coeff: f64, device: &Device) -> Result<Self> {
        anyhow::ensure!(
            n_inputs > 0 && n_features > 0,
            "Autoencoder dimensions must be positive (n={n_inputs}, m={n_features})"
        );

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let enc_bound = 1.0 / (n_inputs as f64).sqrt();
        let dec_bound = 1.0 / (n_features as f64).sqrt();
        vb.get_with_hints(
            (n_features, n_inputs),
            "W_enc",
            Init::Uniform {
                lo: -enc_bound,
                up: enc_bound,
            },
        )?;
        vb.get_with_hints(n_features, "b_enc", Init::Const(0.0))?;
        vb.get_with_hints(
            (n_inputs, n_features),
            "W_dec",
            Init::Uniform {
                lo: -dec_bound,
                up: dec_bound,
            },
        )?;
        vb.get_with_hints(n_inputs, "b_dec", Init::Const(0.0))?;

        let (w_enc, b_enc, w_dec, b_dec) = {
            let vars = varmap
                .data()
                .lock()
                .map_err(|_| anyhow::anyhow!("autoencoder parameters poisoned"))?;
            let var = |name: &str| -> Result<Var> {
                vars.get(name)
                    .cloned()
                    .ok_or_else(|| anyhow::anyhow!("Parameter {name} was not created"))
            };
            (var("W_enc")?, var("b_enc")?, var("W_dec")?, var("b_dec")?)
        };

        let sae = Self {
            varmap,
            w_enc,
            b_enc,
            w_dec,
            b_dec,
            l1_coeff,
            n_inputs,
            n_features,
        };
        sae.renormalize_decoder()?;
        Ok(sae)
    }

    /// Input width n.
    pub fn n_inputs(&self) -> usize {
        self.n_inputs
    }

    /// Dictionary size m.
    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn l1_coeff(&self) -> f64 {
        self.l1_coeff
    }

    /// All trainable parameters, for the optimizer.
    pub fn vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Encoder weight `[m, n]`.
    pub fn encoder_weight(&self) -> &Tensor {
        self.w_enc.as_tensor()
    }

    pub fn encoder_bias(&self) -> &Tensor {
        self.b_enc.as_tensor()
    }

    /// Decoder weight `[n, m]`.
    pub fn decoder_weight(&self) -> &Tensor {
        self.w_dec.as_tensor()
    }

    pub fn decoder_bias(&self) -> &Tensor {
        self.b_dec.as_tensor()
    }

    /// Encode and reconstruct a batch of activations `[batch, n]` (F32).
    pub fn reconstruct(&self, acts: &Tensor) -> Result<SaeOutput> {
        let (_, width) = acts
            .dims2()
            .context("Autoencoder input must be a [batch, n] matrix")?;
        anyhow::ensure!(
            width == self.n_inputs,
            "Autoencoder input width {width} does not match n={}",
            self.n_inputs
        );

        let x = acts.broadcast_sub(self.b_dec.as_tensor())?;
        let codes = x
            .matmul(&self.w_enc.as_tensor().t()?)?
            .broadcast_add(self.b_enc.as_tensor())?
            .relu()?;
        let reconstruction = codes
            .matmul(&self.w_dec.as_tensor().t()?)?
            .broadcast_add(self.b_dec.as_tensor())?;

        let mse = (&reconstruction - acts)?.sqr()?.mean_all()?;
        let l1 = codes.abs()?.sum_all()?;
        let loss = (&mse + (&l1 * self.l1_coeff)?)?;

        Ok(SaeOutput {
            loss,
            mse,
            l1,
            codes,
            reconstruction,
        })
    }

    /// Replace the decoder weight gradient by its component orthogonal to
    /// each decoder column. Optimizer state is not touched.
    pub fn project_decoder_grad(&self, grads: &mut GradStore) -> Result<()> {
        let weight = self.w_dec.as_tensor();
        if let Some(grad) = grads.remove(weight) {
            let projected = project_out_parallel(&grad, &weight.detach())?;
            grads.insert(weight, projected);
        }
        Ok(())
    }

    /// Scale every decoder column back to unit L2 norm.
    pub fn renormalize_decoder(&self) -> Result<()> {
        let normalized = normalize_columns(&self.w_dec.as_tensor().detach())?;
        self.w_dec.set(&normalized)?;
        Ok(())
    }

    /// Mean L2 norm of the decoder columns.
    pub fn mean_feature_norm(&self) -> Result<f32> {
        let norms = column_norms(&self.w_dec.as_tensor().detach())?;
        Ok(norms.mean_all()?.to_scalar::<f32>()?)
    }

    /// Write the parameters to a safetensors file.
    pub fn save(&self, path: &Path) -> Result<()> {
        self.varmap
            .save(path)
            .with_context(|| format!("Failed to write autoencoder to {}", path.display()))?;
        Ok(())
    }
}

/// L2 norm of each column of a `[n, m]` matrix, shape `[1, m]`.
fn column_norms(weight: &Tensor) -> Result<Tensor> {
    Ok(weight.sqr()?.sum_keepdim(0)?.sqrt()?)
}

/// Scale each column of `weight` to unit L2 norm.
pub fn normalize_columns(weight: &Tensor) -> Result<Tensor> {
    let norms = column_norms(weight)?.maximum(NORM_EPS)?;
    Ok(weight.broadcast_div(&norms)?)
}

/// Remove from each column of `grad` its projection onto the matching
/// (normalized) column of `weight`:
///
/// ```text
/// g_j <- g_j - (g_j · ŵ_j) ŵ_j
/// ```
pub fn project_out_parallel(grad: &Tensor, weight: &Tensor) -> Result<Tensor> {
    anyhow::ensure!(
        grad.dims() == weight.dims(),
        "Gradient shape {:?} does not match weight shape {:?}",
        grad.dims(),
        weight.dims()
    );
    let unit = normalize_columns(weight)?;
    let along = (grad * &unit)?.sum_keepdim(0)?;
    let parallel = unit.broadcast_mul(&along)?;
    Ok((grad - parallel)?)
}
