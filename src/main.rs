use anyhow::Context;
use clap::Parser;
use std::collections::HashSet;
use std::io::IsTerminal;
use std::path::PathBuf;

use histopatch::{BatchDriver, ChannelCode, DatasetCatalog, ExtractConfig, ExtractPolicy};

#[derive(Parser)]
#[command(name = "histopatch")]
#[command(about = "Extract multi-task training patches from whole-mount histology images")]
struct Cli {
    /// Dataset config (YAML)
    #[arg(long, value_name = "FILE")]
    config: PathBuf,

    /// Root directory for extracted patches
    #[arg(long, value_name = "DIR")]
    save_root: PathBuf,

    /// Datasets to extract, in order
    #[arg(long = "dataset", value_name = "NAME", default_values = ["gland", "lumen", "nuclei"])]
    datasets: Vec<String>,

    /// Annotation types to composite, in channel order
    #[arg(long = "ann-type", value_name = "TYPE", default_values = ["Gland", "Lumen", "Nuclei"])]
    ann_types: Vec<String>,

    /// Annotation channel codes to keep (INST, TYPE)
    #[arg(long = "channel", value_name = "CODE", default_values = ["INST", "TYPE"])]
    channels: Vec<ChannelCode>,

    /// Patch edge length in pixels
    #[arg(long, default_value_t = 996)]
    win: usize,

    /// Stride between window origins in pixels
    #[arg(long, default_value_t = 448)]
    step: usize,

    /// Window placement policy (valid, mirror)
    #[arg(long, default_value_t = ExtractPolicy::Valid)]
    policy: ExtractPolicy,

    /// Worker threads; 1 processes files sequentially
    #[arg(long, default_value_t = 1)]
    workers: usize,

    /// Only process these basenames (repeatable), e.g. to resume an interrupted run
    #[arg(long, value_name = "BASENAME")]
    only: Vec<String>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .init();

    let catalog = DatasetCatalog::load(&args.config)
        .with_context(|| format!("Failed to load dataset config {:?}", args.config))?;

    let config = ExtractConfig {
        save_root: args.save_root,
        datasets: args.datasets,
        ann_types: args.ann_types,
        channels: args.channels,
        win: args.win,
        step: args.step,
        policy: args.policy,
        workers: args.workers,
        only: (!args.only.is_empty()).then(|| args.only.into_iter().collect::<HashSet<_>>()),
    };

    let driver = BatchDriver::new(&catalog, &config)
        .with_context(|| {
            format!(
                "Invalid extraction setup (datasets defined in config: {:?})",
                catalog.names().collect::<Vec<_>>()
            )
        })?
        .with_progress(std::io::stderr().is_terminal());

    let summary = driver.run().context("Patch extraction aborted")?;

    println!("\n=== Patch Extraction Results ===");
    println!("{summary}");

    Ok(())
}
