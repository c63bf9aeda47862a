//! Greedy Translation with Ported Weights
//!
//! Builds a transformer (the "base" geometry over a 128-symbol ASCII
//! vocabulary by default), optionally loads weights exported by the graph
//! runtime, and greedily decodes each input sentence.
//!
//! Text is tokenized one character per id: id = ASCII code, right-padded to
//! `max_seq_length`. Ids 1, 2 and 3 are reserved for start, end and padding.
//!
//! ## Usage
//!
//! ```bash
//! # Random weights, just to exercise the pipeline
//! cargo run --release --example generate -- "Hi, how is it going?"
//!
//! # Weights in the graph runtime's naming
//! cargo run --release --example generate -- \
//!     --weights transformer-graph.json "I like chocolate."
//!
//! # Per-step decoding logs
//! RUST_LOG=orsino=debug cargo run --example generate -- --config tiny.json "abc"
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use orsino::{Module, NamedArrays, SpecialTokens, Transformer, TransformerConfig, WeightBridge};
use tracing::info;

const VOCAB_SIZE: usize = 128;
const TOKENS: SpecialTokens = SpecialTokens {
    start: 1,
    end: 2,
    src_pad: 3,
    tgt_pad: 3,
};

#[derive(Parser)]
#[command(name = "generate", about = "Greedy decoding with an encoder-decoder transformer")]
struct Args {
    /// Sentences to translate
    #[arg(required = true)]
    text: Vec<String>,

    /// Model configuration as JSON (defaults to the base geometry)
    #[arg(long)]
    config: Option<String>,

    /// Weight archive in the graph runtime's naming
    #[arg(long)]
    weights: Option<String>,

    /// Initialization seed when no weights are given
    #[arg(long, default_value = "0")]
    seed: u64,
}

fn tokenize(text: &str, max_seq_length: usize) -> Result<Vec<usize>> {
    let mut tokens = vec![TOKENS.src_pad; max_seq_length];
    for (slot, c) in tokens.iter_mut().zip(text.chars()) {
        let id = c as usize;
        if id >= VOCAB_SIZE {
            bail!("character {:?} is outside the ASCII vocabulary", c);
        }
        *slot = id;
    }
    Ok(tokens)
}

fn detokenize(tokens: &[usize]) -> String {
    tokens
        .iter()
        .filter(|&&t| t != TOKENS.end && t != TOKENS.tgt_pad)
        .filter_map(|&t| char::from_u32(t as u32))
        .collect()
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
        None => TransformerConfig::base(VOCAB_SIZE, VOCAB_SIZE),
    };
    config.seed = args.seed;

    let mut model = Transformer::new(config.clone())?;
    if let Some(path) = &args.weights {
        let archive = NamedArrays::load_json(path).with_context(|| format!("loading {}", path))?;
        let copied = WeightBridge::for_config(&config)?.import_into(&archive, &mut model)?;
        info!(arrays = copied, parameters = model.parameter_count(), "weights loaded");
    }

    for text in &args.text {
        let src = tokenize(text, config.max_seq_length)?;
        let generation = model.generate(&src, TOKENS)?;
        println!("src: {}", text);
        println!("out: {}", detokenize(&generation.tokens));
        if generation.is_truncated() {
            println!("     (truncated after {} tokens)", generation.steps);
        }
    }

    Ok(())
}
