//! Convert Weight Archives Between Naming Dialects
//!
//! Archives are JSON files mapping names to `{shape, data}` arrays. This
//! tool renames them between the module paths used by this crate and the
//! graph runtime's scoped names, checking every name against the declared
//! mapping first.
//!
//! ## Usage
//!
//! ```bash
//! # Write a freshly initialized model in the graph runtime's naming
//! cargo run --example convert_weights -- export --out graph.json --seed 7
//!
//! # Rename an archive in either direction
//! cargo run --example convert_weights -- to-local --input graph.json --out local.json
//! cargo run --example convert_weights -- to-remote --input local.json --out graph.json
//!
//! # Show every array and its counterpart name
//! cargo run --example convert_weights -- inspect --input graph.json
//! ```

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use orsino::{Direction, Module, NamedArrays, Transformer, TransformerConfig, WeightBridge};
use tracing::info;

#[derive(Parser)]
#[command(name = "convert_weights", about = "Rename weight archives between naming dialects")]
struct Args {
    /// Model configuration as JSON (defaults to the base geometry over 128 symbols)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Initialize a model and write it in the graph runtime's naming
    Export {
        #[arg(long)]
        out: String,
        #[arg(long, default_value = "0")]
        seed: u64,
    },
    /// Graph runtime names to module paths
    ToLocal(Io),
    /// Module paths to graph runtime names
    ToRemote(Io),
    /// List the arrays of an archive in either dialect
    Inspect {
        #[arg(long)]
        input: String,
    },
}

#[derive(ClapArgs)]
struct Io {
    #[arg(long)]
    input: String,
    #[arg(long)]
    out: String,
}

fn load(path: &str) -> Result<NamedArrays> {
    NamedArrays::load_json(path).with_context(|| format!("loading {}", path))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("orsino=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => TransformerConfig::from_json_file(path)
            .with_context(|| format!("reading config {}", path))?,
        None => TransformerConfig::base(128, 128),
    };
    let bridge = WeightBridge::for_config(&config)?;

    match args.command {
        Command::Export { out, seed } => {
            config.seed = seed;
            let model = Transformer::new(config)?;
            bridge.export_from(&model)?.save_json(&out)?;
            info!(parameters = model.parameter_count(), path = %out, "exported model");
        }
        Command::ToLocal(io) => {
            bridge
                .convert(&load(&io.input)?, Direction::RemoteToLocal)?
                .save_json(&io.out)?;
        }
        Command::ToRemote(io) => {
            bridge
                .convert(&load(&io.input)?, Direction::LocalToRemote)?
                .save_json(&io.out)?;
        }
        Command::Inspect { input } => {
            let archive = load(&input)?;
            for (name, array) in archive.iter() {
                let other = bridge
                    .to_local(name)
                    .or_else(|| bridge.to_remote(name))
                    .unwrap_or("-");
                println!("{:<48} {:<16} {}", name, format!("{:?}", array.shape), other);
            }
            println!("{} arrays, {} values", archive.len(), archive.total_elements());
        }
    }

    Ok(())
}
