// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::many_single_char_names)] // x, y, i, j standard in math
#![allow(clippy::similar_names)] // related variables like `w_enc`/`w_dec`
#![allow(clippy::module_name_repetitions)] // SaeOutput in sae.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility
#![allow(clippy::cast_sign_loss)] // f64→usize when value is known positive

//! sae-rs: sparse autoencoders over transformer MLP activations
//!
//! Trains a sparse dictionary on MLP activations precomputed into on-disk
//! partitions, and periodically scores it by substituting its
//! reconstructions back into the language model that produced them.
//!
//! ## Architecture
//!
//! - `config`: Training configuration (defaults, JSON file, `key=value` overrides)
//! - `sae`: Sparse autoencoder, decoder gradient projection and renormalization
//! - `shards`: Sequential batches over activation partitions, one resident at a time
//! - `corpus`: Memory-mapped token corpus and evaluation context sampling
//! - `gpt`: GPT-2 style base model with MLP capture and ablation
//! - `masks`: Cached causal attention masks
//! - `oracle`: `ScoringModel` trait and evaluation cache construction
//! - `cache`: Held-out activations and baseline losses
//! - `memory`: Process and tensor memory reporting
//! - `metrics`: Evaluation pass, normalized score and feature density
//! - `tracker`: Metrics record sinks
//! - `trainer`: Training loop

pub mod cache;
pub mod config;
pub mod corpus;
pub mod gpt;
pub mod masks;
pub mod memory;
pub mod metrics;
pub mod oracle;
pub mod sae;
pub mod shards;
pub mod tracker;
pub mod trainer;

pub use cache::{EvalBatch, EvalCache};
pub use config::TrainConfig;
pub use corpus::{EvalContexts, TokenCorpus};
pub use gpt::{GptConfig, NanoGpt};
pub use masks::{clear_mask_caches, create_causal_mask, mask_cache_size};
pub use metrics::{
    evaluate, normalized_score, DensityHistogram, EvalMetrics, FeatureCounter, FeatureDensity,
};
pub use oracle::{build_eval_cache, ScoringModel, SublayerCapture};
pub use sae::{normalize_columns, project_out_parallel, SaeOutput, SparseAutoencoder};
pub use shards::{
    partition_file_name, ActivationStream, BatchPlan, PartitionSource, SafetensorsPartitions,
    ShardCursor, PARTITION_TENSOR,
};
pub use tracker::{run_name, JsonlTracker, MetricsSink, NullTracker};
pub use trainer::{TrainSummary, Trainer};
