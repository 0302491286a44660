//! sae-rs CLI: train a sparse autoencoder on precomputed MLP activations

use anyhow::{Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use sae_rs::{
    build_eval_cache, memory, run_name, ActivationStream, JsonlTracker, MetricsSink, NanoGpt,
    NullTracker, SafetensorsPartitions, TokenCorpus, TrainConfig, Trainer,
};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "sae-rs")]
#[command(about = "Train a sparse autoencoder on transformer MLP activations")]
#[command(version)]
struct Cli {
    /// JSON file of option overrides, applied before command-line overrides
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Option overrides as `key=value` (e.g. `batch_size=4096 l1_coeff=1e-3`)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    overrides: Vec<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = TrainConfig::load(cli.config.as_deref(), &cli.overrides)?;
    let run_name = run_name(&config.dataset);

    println!("=== sae-rs: sparse autoencoder training ===");
    println!("Run:         {run_name}");
    println!("Model:       {} (MLP layer {})", config.model_dir, config.mlp_layer);
    println!("Activations: {}", config.activations_dir.display());
    println!("Eval corpus: {}", config.corpus_path().display());

    let device = config.device()?;
    let mut rng = StdRng::seed_from_u64(config.seed);

    // Training data
    let partitions = SafetensorsPartitions::open(&config.activations_dir)?;
    let stream = ActivationStream::new(partitions, config.batch_size)?;
    println!(
        "Loaded the first partition of data from {}",
        config.activations_dir.display()
    );
    info!(
        "Memory after loading the first partition: {}",
        memory::describe(stream.memory_usage())
    );

    // Evaluation baseline
    info!("Loading base model...");
    let model = NanoGpt::load(&config.model_dir, config.mlp_layer, &device)?;
    let corpus = TokenCorpus::open(&config.corpus_path())?;
    let cache = build_eval_cache(&model, &corpus, &config, &mut rng)?;
    drop(corpus);
    println!(
        "The full transformer loss and MLP ablated loss on the evaluation data are {:.2}, {:.2}",
        cache.full_loss(),
        cache.ablated_loss()
    );
    info!(
        "Memory after building the evaluation cache: {}",
        memory::describe(stream.memory_usage() + cache.memory_usage())
    );

    let sink: Box<dyn MetricsSink> = if config.log_metrics {
        Box::new(JsonlTracker::create(&config.out_dir, &run_name, &config)?)
    } else {
        Box::new(NullTracker)
    };

    let save_path = config
        .save_sae
        .then(|| config.out_dir.join(&run_name).join("sae.safetensors"));

    let mut trainer = Trainer::new(config, stream, model, cache, sink)?;
    let summary = trainer.run()?;
    info!(
        "Finished {} steps, {} evaluations, {} partition crossings",
        summary.steps, summary.evaluations, summary.partition_crossings
    );

    if let Some(path) = save_path {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        trainer.sae().save(&path)?;
        println!("Saved autoencoder to {}", path.display());
    }

    Ok(())
}
