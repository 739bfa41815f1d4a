//! Train the flow-warping try-on network from a YAML config

use anyhow::Result;
use clap::Parser;
use log::info;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Train the virtual try-on network", long_about = None)]
struct Args {
    /// Path to YAML config
    config: PathBuf,

    /// Dataset root containing `<mode>_pairs.txt`
    #[arg(long)]
    data_root: Option<PathBuf>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    learning_rate: Option<f64>,

    /// cpu, cuda, cuda:<n> or metal
    #[arg(long)]
    device: Option<String>,

    /// Checkpoint directory
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    vtontrain::logging::init_logger();
    let args = Args::parse();

    if !args.config.exists() {
        anyhow::bail!("Config file not found: {}", args.config.display());
    }
    info!("Starting trainer with config: {}", args.config.display());

    let mut config = vtontrain::load_config(&args.config)?;
    if let Some(root) = args.data_root {
        config.data.root = root;
    }
    if let Some(epochs) = args.epochs {
        config.train.epochs = epochs;
    }
    if let Some(batch_size) = args.batch_size {
        config.train.batch_size = batch_size;
    }
    if let Some(lr) = args.learning_rate {
        config.train.learning_rate = lr;
    }
    if let Some(device) = args.device {
        config.device = device;
    }
    if let Some(dir) = args.output_dir {
        config.save.output_dir = dir;
    }

    let history = vtontrain::run_training(config)?;
    if let Some(last) = history.last() {
        info!("Training completed successfully, final average loss {:.4}", last);
    } else {
        info!("Training completed successfully");
    }
    Ok(())
}
