use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::Parser;
use log::info;
use std::path::PathBuf;

use infusion::config::{load_config, InfusionConfig};
use infusion::models::{ConceptInjection, LinearProjectionBuilder, PerBlock, SpatialTransformer};

/// Build a freshly initialised SpatialTransformer and run one forward pass
#[derive(Parser, Debug)]
#[command(name = "spatial_probe")]
struct Args {
    /// YAML config with `spatial` and `attention` sections
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long, default_value_t = 2)]
    batch: usize,

    #[arg(long, default_value_t = 16)]
    size: usize,

    /// Number of context tokens
    #[arg(long, default_value_t = 77)]
    tokens: usize,
}

fn main() -> Result<()> {
    infusion::logging::init_logger();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => {
            info!("Loading config: {}", path.display());
            load_config(path)?
        }
        None => InfusionConfig::default(),
    };
    info!(
        "Spatial transformer: {} channels, {} heads x {}, depth {}, attention {}",
        config.spatial.in_channels,
        config.spatial.n_heads,
        config.spatial.d_head,
        config.spatial.depth,
        config.attention.mode.as_str()
    );

    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let transformer = SpatialTransformer::new(
        vb,
        config.spatial.clone(),
        &config.attention,
        &LinearProjectionBuilder,
    )?;

    let xs = Tensor::randn(
        0f32,
        1f32,
        (args.batch, config.spatial.in_channels, args.size, args.size),
        &device,
    )?;
    let context = match config.spatial.context_dim.as_ref() {
        Some(dims) => {
            let contexts = (0..transformer.depth())
                .map(|index| {
                    dims.for_block(index)
                        .map(|dim| Tensor::randn(0f32, 1f32, (args.batch, args.tokens, dim), &device))
                        .transpose()
                })
                .collect::<candle_core::Result<Vec<_>>>()?;
            PerBlock::each(contexts)
        }
        None => PerBlock::none(),
    };

    let ys = transformer.forward(&xs, &context, &PerBlock::none(), &ConceptInjection::default())?;
    let deviation = (&ys - &xs)?.abs()?.max_all()?.to_scalar::<f32>()?;
    info!("Output shape: {:?}", ys.dims());
    info!("Max deviation from input: {:.6}", deviation);

    Ok(())
}
