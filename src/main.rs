use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use caption_vae::data::{DataProvider, ManifestProvider};
use caption_vae::model::{ExtractorConfig, LatentDecoder, LatentDecoderConfig, PooledExtractor};
use caption_vae::train::{RunMode, TrainingConfiguration};
use caption_vae::GreedyInference;

/// Trains a latent-variable image caption generator or captions images
/// with a trained checkpoint.
#[derive(Parser, Debug)]
#[command(name = "caption-vae", version, about)]
struct Cli {
    /// Log filter used when RUST_LOG is unset (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the epoch loop, validating and checkpointing after every epoch
    Train {
        #[command(flatten)]
        run: RunArgs,

        /// Resume from the named checkpoint instead of loading pretrained weights
        #[arg(long)]
        restore: bool,

        /// Override the configured epoch count
        #[arg(long)]
        epochs: Option<usize>,
    },

    /// Restore a checkpoint and caption the validation and test splits
    Infer {
        #[command(flatten)]
        run: RunArgs,

        /// Override the configured caption output directory
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// JSON run configuration; omitted options take their defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// JSON dataset manifest
    #[arg(short, long)]
    manifest: PathBuf,

    /// Checkpoint name override
    #[arg(long)]
    checkpoint: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let (run_args, config) = match cli.command {
        Command::Train { run, restore, epochs } => {
            let mut config = load_config(&run)?;
            config.mode = RunMode::Training;
            if restore {
                config.restore = true;
                config.load_pretrained = false;
            }
            if let Some(epochs) = epochs {
                config.num_epochs = epochs;
            }
            (run, config)
        }
        Command::Infer { run, output_dir } => {
            let mut config = load_config(&run)?;
            config.mode = RunMode::Inference;
            if let Some(dir) = output_dir {
                config.output_dir = dir;
            }
            (run, config)
        }
    };

    let mut provider = ManifestProvider::open(
        &run_args.manifest,
        config.image_size,
        config.cnn_feature_size,
        config.seed,
    )
    .with_context(|| format!("loading manifest '{}'", run_args.manifest.display()))?;

    let extractor = PooledExtractor::new(ExtractorConfig::from_training(&config), config.seed);
    let decoder = LatentDecoder::new(
        LatentDecoderConfig::from_training(&config, provider.dictionary().vocab_size()),
        config.seed.wrapping_add(1),
    );
    let mut inference = GreedyInference::from_training(&config);

    let outcome = caption_vae::run(
        config,
        Box::new(extractor),
        Box::new(decoder),
        &mut provider,
        &mut inference,
    )
    .context("run failed")?;

    if let Some(report) = &outcome.training {
        if let Some(last) = report.last() {
            println!(
                "trained {} epoch(s): global step {}, train loss {:.4}, val loss {}",
                report.epochs.len(),
                outcome.state.global_step,
                last.train_loss,
                last.val_loss.map_or_else(|| "n/a".to_string(), |v| format!("{v:.4}")),
            );
        }
    }
    if let Some(report) = &outcome.inference {
        for path in &report.files {
            println!("wrote {}", path.display());
        }
    }
    Ok(())
}

fn load_config(args: &RunArgs) -> anyhow::Result<TrainingConfiguration> {
    let mut config = match &args.config {
        Some(path) => TrainingConfiguration::load_json(path)
            .with_context(|| format!("loading config '{}'", path.display()))?,
        None => TrainingConfiguration::default(),
    };
    if let Some(name) = &args.checkpoint {
        config.checkpoint = name.clone();
    }
    Ok(config)
}
