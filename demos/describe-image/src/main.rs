//! Feed an image and a prompt through the bridge and report the chunk layout
//!
//! Loads a vision model and its projector, tokenizes the prompt around the
//! image, evaluates every chunk and prints where the next token would go.

use std::num::NonZeroU32;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use mtmd_bridge::config::DEFAULT_MEDIA_MARKER;
use mtmd_bridge::llama::{LlamaContextParams, LlamaEngine};
use mtmd_bridge::{Bridge, ProjectorParams, Verbosity};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Command line arguments for the describe-image demo
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the main model file (GGUF format)
    #[arg(short, long)]
    model: PathBuf,

    /// Path to the multimodal projector file (mmproj GGUF)
    #[arg(short = 'p', long)]
    mmproj: PathBuf,

    /// Path to the image file to process
    #[arg(short, long)]
    image: PathBuf,

    /// Prompt text (use <__media__> as placeholder for image)
    #[arg(short = 't', long, default_value = "Describe this image in detail: <__media__>")]
    prompt: String,

    /// Number of threads for the text model
    #[arg(long, default_value_t = 4)]
    threads: i32,

    /// Projector threads; defaults to one less than the available cores, at most 4
    #[arg(long)]
    mmproj_threads: Option<i32>,

    /// Context size
    #[arg(short = 'c', long, default_value_t = 2048)]
    ctx_size: u32,

    /// Maximum entries per decode call
    #[arg(short = 'b', long, default_value_t = 512)]
    batch_size: u32,

    /// Number of GPU layers
    #[arg(short = 'g', long, default_value_t = 0)]
    n_gpu_layers: i32,

    /// Run the projector on the CPU
    #[arg(long)]
    cpu_projector: bool,

    /// Let the engine log at info level
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    if !args.prompt.contains(DEFAULT_MEDIA_MARKER) {
        anyhow::bail!("prompt must contain {DEFAULT_MEDIA_MARKER}");
    }

    let mut params = ProjectorParams::default()
        .with_use_gpu(!args.cpu_projector)
        .with_verbosity(if args.verbose { Verbosity::Info } else { Verbosity::Error });
    if let Some(n) = args.mmproj_threads {
        params = params.with_n_threads(n);
    }

    let engine = LlamaEngine::init()?;
    let model = engine
        .load_model(&args.model, args.n_gpu_layers)
        .with_context(|| format!("unable to load model {}", args.model.display()))?;
    let context = engine.new_context(
        &model,
        &LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(args.ctx_size))
            .with_n_batch(args.batch_size)
            .with_n_threads(args.threads),
    )?;

    let bridge = Bridge::new(engine, params);
    let model = bridge.register_model(model);
    let context = bridge.register_context(context);
    let projector = bridge
        .load_projector(model, &args.mmproj)
        .with_context(|| format!("unable to load projector {}", args.mmproj.display()))?;

    let image = image::open(&args.image)
        .with_context(|| format!("unable to open image {}", args.image.display()))?
        .to_rgba8();
    let bitmap = bridge.bitmap_from_image(&image)?;
    info!(width = image.width(), height = image.height(), "image loaded");

    let chunks = bridge.tokenize(projector, &args.prompt, &[bitmap])?;
    println!("prompt split into {} chunks", bridge.chunk_count(chunks));

    let n_past = bridge.eval_chunks(projector, context, chunks, 0, args.batch_size as usize)?;
    println!("evaluated; next position is {n_past}");

    bridge.release_chunks(chunks);
    bridge.release_bitmap(bitmap);
    bridge.release_projector(projector);
    bridge.release_context(context);
    bridge.release_model(model);

    Ok(())
}
