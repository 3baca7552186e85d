//! CNNMRF style transfer
//!
//! Renders the content image in the style of the style image.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --release --bin synthesize -- style.jpg content.jpg --output outputs/
//!
//! # Settings from a JSON file, with command line overrides
//! cargo run --release --bin synthesize -- style.jpg content.jpg --config run.json --iterations 200
//! ```
//!
//! Set `RUST_LOG=debug` to see the per-pass matching statistics.

use std::{fs, path::PathBuf, time::Instant};

use anyhow::{Context, Result};
use backbones::{BackboneType, BackboneWrapper};
use clap::{Parser, ValueEnum};
use cnnmrf_demos::{
    create_device,
    imaging::{denormalize, load_image, normalize, save_image},
    synthesize, SelectedBackend, SelectedDevice, SynthesisConfig, BACKEND_NAME,
};
use tracing_subscriber::EnvFilter;

#[derive(ValueEnum, Clone, Copy, Debug)]
enum BackboneArg {
    Vgg16,
    Vgg19,
    Vgg19Blocks,
}

impl From<BackboneArg> for BackboneType {
    fn from(arg: BackboneArg) -> Self {
        match arg {
            BackboneArg::Vgg16 => Self::Vgg16,
            BackboneArg::Vgg19 => Self::Vgg19,
            BackboneArg::Vgg19Blocks => Self::Vgg19Blocks,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the style image
    style: PathBuf,

    /// Path to the content image
    content: PathBuf,

    /// Output directory for results
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Feature extractor
    #[arg(long, value_enum)]
    backbone: Option<BackboneArg>,

    /// Torchvision checkpoint for the backbone (needs the `pretrained` feature)
    #[arg(short, long)]
    weights: Option<PathBuf>,

    /// Longer side of the images at the finest level
    #[arg(long)]
    max_size: Option<u32>,

    /// Number of pyramid levels
    #[arg(long)]
    num_res: Option<usize>,

    /// Optimizer steps per level
    #[arg(long)]
    iterations: Option<usize>,

    /// Adam learning rate
    #[arg(long)]
    learning_rate: Option<f64>,

    /// Weight of the content loss
    #[arg(long)]
    content_weight: Option<f64>,

    /// Weight of the style loss
    #[arg(long)]
    style_weight: Option<f64>,

    /// Weight of the total-variation loss
    #[arg(long)]
    tv_weight: Option<f64>,

    /// Style patches correlated per convolution call
    #[arg(long)]
    gpu_chunk_size: Option<usize>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    config.validate()?;

    fs::create_dir_all(&config.output_path).with_context(|| {
        format!(
            "Failed to create output directory: {}",
            config.output_path.display()
        )
    })?;

    let device = create_device();
    tracing::info!(backend = BACKEND_NAME, backbone = ?config.backbone, "starting synthesis");

    let style = normalize(load_image::<SelectedBackend, _>(
        &args.style,
        Some(config.max_size),
        &device,
    )?);
    let content = normalize(load_image::<SelectedBackend, _>(
        &args.content,
        Some(config.max_size),
        &device,
    )?);
    let backbone = load_backbone(&config, &device)?;

    let start = Instant::now();
    let output_path = config.output_path.clone();
    let result = synthesize(&config, backbone, style, content, |level, synthesis| {
        let path = output_path.join(format!("level_{level}.png"));
        save_image(denormalize(synthesis), &path)?;
        tracing::info!(level, path = %path.display(), "saved intermediate result");
        Ok(())
    })?;

    let path = config.output_path.join("result.png");
    save_image(denormalize(result), &path)?;
    tracing::info!(
        elapsed = ?start.elapsed(),
        path = %path.display(),
        "synthesis finished"
    );

    Ok(())
}

fn load_config(args: &Args) -> Result<SynthesisConfig> {
    let mut config = if let Some(config_path) = &args.config {
        let config_str = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;
        serde_json::from_str::<SynthesisConfig>(&config_str)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?
    } else {
        SynthesisConfig::default()
    };

    // Apply command line overrides
    if let Some(output) = &args.output {
        config.output_path.clone_from(output);
    }
    if let Some(backbone) = args.backbone {
        config.backbone = backbone.into();
    }
    if args.weights.is_some() {
        config.weights.clone_from(&args.weights);
    }
    if let Some(max_size) = args.max_size {
        config.max_size = max_size;
    }
    if let Some(num_res) = args.num_res {
        config.num_res = num_res;
    }
    if let Some(iterations) = args.iterations {
        config.iterations = iterations;
    }
    if let Some(learning_rate) = args.learning_rate {
        config.learning_rate = learning_rate;
    }
    if let Some(weight) = args.content_weight {
        config.model.content_weight = weight;
    }
    if let Some(weight) = args.style_weight {
        config.model.style_weight = weight;
    }
    if let Some(weight) = args.tv_weight {
        config.model.tv_weight = weight;
    }
    if let Some(chunk_size) = args.gpu_chunk_size {
        config.model.gpu_chunk_size = chunk_size;
    }

    Ok(config)
}

fn load_backbone(
    config: &SynthesisConfig,
    device: &SelectedDevice,
) -> Result<BackboneWrapper<SelectedBackend>> {
    match &config.weights {
        #[cfg(feature = "pretrained")]
        Some(weights) => {
            tracing::info!(weights = %weights.display(), "loading backbone weights");
            backbones::create_pretrained_backbone(&config.backbone, weights, device).map_err(
                |e| anyhow::anyhow!("Failed to load weights from {}: {e:?}", weights.display()),
            )
        }
        #[cfg(not(feature = "pretrained"))]
        Some(weights) => anyhow::bail!(
            "Cannot load {}: rebuild with the `pretrained` feature",
            weights.display()
        ),
        None => {
            tracing::warn!("no backbone weights given, features come from a random network");
            Ok(backbones::create_backbone(&config.backbone, device))
        }
    }
}
