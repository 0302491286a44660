//! GPT-2 style base model with MLP capture and ablation
//!
//! Follows the nanoGPT layout (pre-LayerNorm blocks, learned positions,
//! GELU MLP of width `4 * n_embd`, LM head tied to the token embedding)
//! and exposes the instrumented forward passes the evaluation oracle needs:
//!
//! ```text
//! h    = blocks[..L](embed(x)),  then h += attn_L(ln_1(h))
//! res  = h                                   captured residual
//! acts = GELU(c_fc(ln_2(res)))               captured MLP activations
//! full    = tail(res + c_proj(acts))
//! ablated = tail(res)                        MLP contribution removed
//! ```
//!
//! where `tail` runs blocks `L+1..`, the final LayerNorm and the LM head.
//!
//! Weight names match nanoGPT checkpoints exported to safetensors
//! (`transformer.wte.weight`, `transformer.h.{i}.attn.c_attn.weight`, ...).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{embedding, linear_b, Embedding, LayerNorm, Linear, VarBuilder};
use hf_hub::{api::sync::Api, Repo, RepoType};
use serde::Deserialize;
use tracing::info;

use crate::masks::create_causal_mask;
use crate::oracle::{ScoringModel, SublayerCapture};

const LN_EPS: f64 = 1e-5;

/// Model arguments as saved with nanoGPT checkpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct GptConfig {
    pub n_layer: usize,
    pub n_head: usize,
    pub n_embd: usize,
    pub block_size: usize,
    pub vocab_size: usize,
    #[serde(default = "default_bias")]
    pub bias: bool,
}

fn default_bias() -> bool {
    true
}

/// `config.json` is either the model arguments or `{"model_args": {...}}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum ConfigFile {
    Wrapped { model_args: GptConfig },
    Bare(GptConfig),
}

impl GptConfig {
    /// Width of the MLP hidden layer
    pub fn d_mlp(&self) -> usize {
        4 * self.n_embd
    }
}

fn layer_norm(size: usize, bias: bool, vb: VarBuilder) -> Result<LayerNorm> {
    let weight = vb.get_with_hints(size, "weight", candle_nn::Init::Const(1.0))?;
    if bias {
        let b = vb.get_with_hints(size, "bias", candle_nn::Init::Const(0.0))?;
        Ok(LayerNorm::new(weight, b, LN_EPS))
    } else {
        Ok(LayerNorm::new_no_bias(weight, LN_EPS))
    }
}

struct CausalSelfAttention {
    c_attn: Linear,
    c_proj: Linear,
    n_head: usize,
    n_embd: usize,
}

impl CausalSelfAttention {
    fn load(vb: VarBuilder, config: &GptConfig) -> Result<Self> {
        let c_attn = linear_b(config.n_embd, 3 * config.n_embd, config.bias, vb.pp("c_attn"))?;
        let c_proj = linear_b(config.n_embd, config.n_embd, config.bias, vb.pp("c_proj"))?;
        Ok(Self {
            c_attn,
            c_proj,
            n_head: config.n_head,
            n_embd: config.n_embd,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b, seq_len, _) = x.dims3()?;
        let head_dim = self.n_embd / self.n_head;

        let qkv = self.c_attn.forward(x)?;
        let split = |i: usize| -> Result<Tensor> {
            Ok(qkv
                .narrow(D::Minus1, i * self.n_embd, self.n_embd)?
                .reshape((b, seq_len, self.n_head, head_dim))?
                .transpose(1, 2)?
                .contiguous()?)
        };
        let q = split(0)?;
        let k = split(1)?;
        let v = split(2)?;

        let scale = 1.0 / (head_dim as f64).sqrt();
        let attn_weights = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;
        let mask = create_causal_mask(seq_len, x.device(), x.dtype())?;
        let attn_weights = attn_weights.broadcast_add(&mask)?;
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;

        let y = attn_weights
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, seq_len, self.n_embd))?;
        Ok(self.c_proj.forward(&y)?)
    }
}

struct Mlp {
    c_fc: Linear,
    c_proj: Linear,
}

impl Mlp {
    fn load(vb: VarBuilder, config: &GptConfig) -> Result<Self> {
        Ok(Self {
            c_fc: linear_b(config.n_embd, config.d_mlp(), config.bias, vb.pp("c_fc"))?,
            c_proj: linear_b(config.d_mlp(), config.n_embd, config.bias, vb.pp("c_proj"))?,
        })
    }

    /// Hidden activations after GELU
    fn activations(&self, x: &Tensor) -> Result<Tensor> {
        Ok(self.c_fc.forward(x)?.gelu_erf()?)
    }

    /// Project hidden activations back to the residual stream
    fn project(&self, acts: &Tensor) -> Result<Tensor> {
        Ok(self.c_proj.forward(acts)?)
    }
}

struct Block {
    ln_1: LayerNorm,
    attn: CausalSelfAttention,
    ln_2: LayerNorm,
    mlp: Mlp,
}

impl Block {
    fn load(vb: VarBuilder, config: &GptConfig) -> Result<Self> {
        Ok(Self {
            ln_1: layer_norm(config.n_embd, config.bias, vb.pp("ln_1"))?,
            attn: CausalSelfAttention::load(vb.pp("attn"), config)?,
            ln_2: layer_norm(config.n_embd, config.bias, vb.pp("ln_2"))?,
            mlp: Mlp::load(vb.pp("mlp"), config)?,
        })
    }

    /// Residual stream after the attention sublayer (the MLP input stream)
    fn attend(&self, x: &Tensor) -> Result<Tensor> {
        Ok((x + self.attn.forward(&self.ln_1.forward(x)?)?)?)
    }

    fn mlp_activations(&self, residual: &Tensor) -> Result<Tensor> {
        self.mlp.activations(&self.ln_2.forward(residual)?)
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.attend(x)?;
        let acts = self.mlp_activations(&h)?;
        Ok((&h + self.mlp.project(&acts)?)?)
    }
}

/// nanoGPT decoder instrumented at the MLP of block `mlp_layer`.
pub struct NanoGpt {
    wte: Embedding,
    wpe: Embedding,
    blocks: Vec<Block>,
    ln_f: LayerNorm,
    lm_head: Linear,
    config: GptConfig,
    mlp_layer: usize,
    device: Device,
}

impl NanoGpt {
    /// Build from a `VarBuilder` rooted at the checkpoint's top level.
    pub fn new(config: GptConfig, mlp_layer: usize, vb: VarBuilder) -> Result<Self> {
        anyhow::ensure!(
            mlp_layer < config.n_layer,
            "mlp_layer {mlp_layer} out of range (model has {} layers)",
            config.n_layer
        );
        anyhow::ensure!(
            config.n_embd % config.n_head == 0,
            "n_embd {} not divisible by n_head {}",
            config.n_embd,
            config.n_head
        );

        let vb_t = vb.pp("transformer");
        let wte = embedding(config.vocab_size, config.n_embd, vb_t.pp("wte"))?;
        let wpe = embedding(config.block_size, config.n_embd, vb_t.pp("wpe"))?;

        let mut blocks = Vec::with_capacity(config.n_layer);
        for i in 0..config.n_layer {
            blocks.push(Block::load(vb_t.pp(format!("h.{i}")), &config)?);
        }
        let ln_f = layer_norm(config.n_embd, config.bias, vb_t.pp("ln_f"))?;
        // Tied to the token embedding.
        let lm_head = Linear::new(wte.embeddings().clone(), None);

        Ok(Self {
            wte,
            wpe,
            blocks,
            ln_f,
            lm_head,
            config,
            mlp_layer,
            device: vb.device().clone(),
        })
    }

    /// Load from a local checkpoint directory (`config.json` +
    /// `model.safetensors`) or, failing that, a HuggingFace repo id.
    pub fn load(model_dir: &str, mlp_layer: usize, device: &Device) -> Result<Self> {
        let (config_path, weights_path) = resolve_checkpoint(model_dir)?;

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        let config = match serde_json::from_str::<ConfigFile>(&config_str)
            .with_context(|| format!("Malformed model config {}", config_path.display()))?
        {
            ConfigFile::Wrapped { model_args } => model_args,
            ConfigFile::Bare(config) => config,
        };
        info!(
            "Model config: {} layers, {} heads, {} embd, block size {}, vocab {}",
            config.n_layer, config.n_head, config.n_embd, config.block_size, config.vocab_size
        );

        // SAFETY: the checkpoint is not modified while the model is alive.
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights_path], DType::F32, device)?
        };
        let model = Self::new(config, mlp_layer, vb)?;
        info!(
            "Model loaded, instrumenting MLP of layer {mlp_layer} (d_mlp={})",
            model.config.d_mlp()
        );
        Ok(model)
    }

    pub fn config(&self) -> &GptConfig {
        &self.config
    }

    /// Token + position embeddings for `[batch, seq]` ids
    fn embed(&self, input_ids: &Tensor) -> Result<Tensor> {
        let (_, seq_len) = input_ids.dims2()?;
        anyhow::ensure!(
            seq_len <= self.config.block_size,
            "Sequence length {seq_len} exceeds block size {}",
            self.config.block_size
        );
        let positions = Tensor::arange(0u32, seq_len as u32, input_ids.device())?;
        let tok = self.wte.forward(input_ids)?;
        let pos = self.wpe.forward(&positions)?;
        Ok(tok.broadcast_add(&pos)?)
    }

    /// Residual stream entering the instrumented MLP.
    fn residual_at_mlp(&self, input_ids: &Tensor) -> Result<Tensor> {
        let mut hidden = self.embed(input_ids)?;
        for block in &self.blocks[..self.mlp_layer] {
            hidden = block.forward(&hidden)?;
        }
        self.blocks[self.mlp_layer].attend(&hidden)
    }

    /// Remaining blocks, final norm, LM head and mean cross-entropy.
    fn loss_after_mlp(&self, hidden: &Tensor, targets: &Tensor) -> Result<f32> {
        let mut hidden = hidden.clone();
        for block in &self.blocks[self.mlp_layer + 1..] {
            hidden = block.forward(&hidden)?;
        }
        let logits = self.lm_head.forward(&self.ln_f.forward(&hidden)?)?;
        let (b, seq_len, vocab) = logits.dims3()?;
        let loss = candle_nn::loss::cross_entropy(
            &logits.reshape((b * seq_len, vocab))?,
            &targets.reshape(b * seq_len)?,
        )?;
        Ok(loss.to_dtype(DType::F32)?.to_scalar::<f32>()?)
    }

    /// Plain forward loss
    pub fn loss(&self, input_ids: &Tensor, targets: &Tensor) -> Result<f32> {
        let residual = self.residual_at_mlp(input_ids)?;
        let block = &self.blocks[self.mlp_layer];
        let acts = block.mlp_activations(&residual)?;
        self.loss_after_mlp(&(&residual + block.mlp.project(&acts)?)?, targets)
    }
}

impl ScoringModel for NanoGpt {
    fn block_size(&self) -> usize {
        self.config.block_size
    }

    fn d_mlp(&self) -> usize {
        self.config.d_mlp()
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn forward_with_and_without_mlp(
        &self,
        inputs: &Tensor,
        targets: &Tensor,
    ) -> Result<SublayerCapture> {
        let residuals = self.residual_at_mlp(inputs)?;
        let block = &self.blocks[self.mlp_layer];
        let activations = block.mlp_activations(&residuals)?;

        let full = (&residuals + block.mlp.project(&activations)?)?;
        let loss = self.loss_after_mlp(&full, targets)?;
        let ablated_loss = self.loss_after_mlp(&residuals, targets)?;

        Ok(SublayerCapture {
            residuals,
            activations,
            loss,
            ablated_loss,
        })
    }

    fn loss_from_mlp_acts(
        &self,
        residuals: &Tensor,
        mlp_acts: &Tensor,
        targets: &Tensor,
    ) -> Result<f32> {
        let block = &self.blocks[self.mlp_layer];
        let hidden = (residuals + block.mlp.project(mlp_acts)?)?;
        self.loss_after_mlp(&hidden, targets)
    }
}

/// Local `(config.json, model.safetensors)` paths, downloading from the
/// HuggingFace hub when `model_dir` is not a directory.
fn resolve_checkpoint(model_dir: &str) -> Result<(PathBuf, PathBuf)> {
    let local = Path::new(model_dir);
    if local.is_dir() {
        let config = local.join("config.json");
        let weights = local.join("model.safetensors");
        anyhow::ensure!(
            config.is_file() && weights.is_file(),
            "{} must contain config.json and model.safetensors",
            local.display()
        );
        return Ok((config, weights));
    }

    info!("{model_dir} is not a local directory, fetching from HuggingFace");
    let api = Api::new().context("Failed to create HuggingFace API")?;
    let repo = api.repo(Repo::new(model_dir.to_string(), RepoType::Model));
    let config = repo
        .get("config.json")
        .context("Failed to download config.json")?;
    let weights = repo
        .get("model.safetensors")
        .context("Failed to download model.safetensors")?;
    Ok((config, weights))
}
