use anyhow::Result;
use clap::Parser;
use dragan_burn::utils::compile_frames_to_gif;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Compile per-epoch sample grids into an animated GIF")]
struct Args {
    /// Directory holding `sample_*.png` frames, usually `<run>/samples`.
    #[arg(long)]
    sample_dir: PathBuf,
    #[arg(long)]
    output: PathBuf,
    /// Resize factor applied to every frame.
    #[arg(long, default_value_t = 0.33)]
    scale: f32,
    /// Frame delay in hundredths of a second.
    #[arg(long, default_value_t = 10)]
    delay: u16,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let frames = compile_frames_to_gif(&args.sample_dir, &args.output, args.scale, args.delay)?;
    tracing::info!(frames, path = %args.output.display(), "wrote gif");
    Ok(())
}
