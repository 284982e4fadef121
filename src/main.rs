//! Shaderchain: render one frame of a YAML-described shader chain.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use shaderchain::config::ChainConfig;
use shaderchain::gpu::{GpuContext, ResourceManager, WgpuBackend};
use shaderchain::pipeline::{CommandSource, ExecuteShader, FrameSource};
use tracing::info;

/// Apply a chain of GPU shaders to still images.
#[derive(Parser, Debug)]
#[command(name = "shaderchain")]
#[command(about = "Render a YAML-described shader chain to an image file")]
struct Args {
    /// Chain description (YAML)
    #[arg(short, long)]
    config: PathBuf,

    /// Image file to write; the format follows the extension
    #[arg(short, long)]
    output: PathBuf,

    /// Frame number to request
    #[arg(long, default_value = "0")]
    frame: u64,

    /// Override the configured texture pool capacity
    #[arg(long)]
    pool_capacity: Option<usize>,

    /// Print the recorded commands before rendering
    #[arg(long)]
    dump_commands: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let mut config = ChainConfig::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    if let Some(capacity) = args.pool_capacity {
        config.gpu.pool_capacity = capacity;
        config.validate().context("invalid --pool-capacity")?;
    }

    let chain = config.build_chain()?;
    if args.dump_commands {
        for command in chain.command_log().descriptors()? {
            println!(
                "[{}] {} inputs={:?} -> {} ({}x{})",
                command.sequence_index,
                command.shader,
                command.bound_inputs().map(|(_, clip)| clip.0).collect::<Vec<_>>(),
                command.output,
                command.output_width,
                command.output_height
            );
        }
    }

    let context = GpuContext::shared(config.gpu.options())?;
    let backend = WgpuBackend::new(context, config.precision);
    let resources = Arc::new(Mutex::new(ResourceManager::new(backend, config.gpu.pool())));

    let node = ExecuteShader::new(&chain, config.open_inputs()?, resources, config.precision)?
        .with_device_retries(config.device_retries);
    let output_info = node.info();
    info!(
        commands = node.plan().commands().len(),
        width = output_info.width,
        height = output_info.height,
        "rendering frame {}",
        args.frame
    );

    let frame = node.get_frame(args.frame)?;
    shaderchain::input::save_frame(&frame, &args.output)
        .with_context(|| format!("failed to write {}", args.output.display()))?;
    info!("wrote {}", args.output.display());

    Ok(())
}
