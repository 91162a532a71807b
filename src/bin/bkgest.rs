//! Grid-based background estimation over a FITS image or cube.
//!
//! Reads an image (optionally with a single-plane bad-pixel mask), runs the
//! configured global and/or local background passes, and writes the
//! background, scale, and background-subtracted products as FITS files.

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;

use photpipe::background::estimate_background;
use photpipe::config::{BackgroundConfig, OperationMode, OutputSelection, PlaneSelection};
use photpipe::io::{read_image_cube, read_mask_plane, write_cube};

#[derive(Parser, Debug)]
#[command(
    name = "bkgest",
    about = "Robust grid-based background estimation for FITS images"
)]
struct Args {
    /// Input FITS image (2-D) or cube (3-D).
    #[arg(long)]
    input: PathBuf,

    /// Optional single-plane bad-pixel mask FITS file.
    #[arg(long)]
    mask: Option<PathBuf>,

    /// Output path for the background image.
    #[arg(long, default_value = "background.fits")]
    background_out: PathBuf,

    /// Output path for the local scale image.
    #[arg(long)]
    scale_out: Option<PathBuf>,

    /// Output path for the background-subtracted image.
    #[arg(long, default_value = "subtracted.fits")]
    subtracted_out: PathBuf,

    /// Optional TOML file supplying the full background configuration;
    /// overrides the individual flags below.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Square local-statistics window, in pixels (odd, > 1).
    #[arg(long, default_value_t = 65)]
    window: usize,

    /// Target grid node spacing, in pixels.
    #[arg(long, default_value_t = 64)]
    grid_spacing: usize,

    /// Local bad-pixel tolerance, percent of window area.
    #[arg(long, default_value_t = 50)]
    local_tolerance: u8,

    /// Global bad-pixel tolerance, percent of frame area.
    #[arg(long, default_value_t = 50)]
    global_tolerance: u8,

    /// Values at or below this threshold count as bad pixels.
    #[arg(long, default_value_t = -1.0e9, allow_hyphen_values = true)]
    pothole: f64,

    /// Mask bits that flag a pixel bad; 0 disables mask filtering.
    #[arg(long, default_value_t = 0)]
    mask_bits: i32,

    /// Which statistic passes to run.
    #[arg(long, value_enum, default_value = "both")]
    operation: OperationMode,

    /// Which output images to produce.
    #[arg(long, value_enum, default_value = "both")]
    output: OutputSelection,

    /// Which frames of a cube to process.
    #[arg(long, value_enum, default_value = "all")]
    plane: PlaneSelection,
}

impl Args {
    fn background_config(&self) -> Result<BackgroundConfig> {
        if let Some(path) = &self.config {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            return toml::from_str(&text)
                .with_context(|| format!("parsing config file {}", path.display()));
        }
        Ok(BackgroundConfig {
            window: self.window,
            grid_spacing: self.grid_spacing,
            local_tolerance_percent: self.local_tolerance,
            global_tolerance_percent: self.global_tolerance,
            pothole: self.pothole,
            mask_bits: self.mask_bits,
            operation: self.operation,
            output: self.output,
            plane: self.plane,
        })
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = args.background_config()?;

    let image = read_image_cube(&args.input)
        .with_context(|| format!("reading input image {}", args.input.display()))?;
    info!(
        "input: {} frame(s), {}x{}",
        image.frames(),
        image.height(),
        image.width()
    );

    let mask = match &args.mask {
        Some(path) => Some(
            read_mask_plane(path, config.mask_bits)
                .with_context(|| format!("reading mask {}", path.display()))?,
        ),
        None => None,
    };

    let products =
        estimate_background(&image, mask.as_ref(), &config).context("background estimation")?;

    for (idx, stats) in products.frame_stats.iter().enumerate() {
        info!(
            "frame {idx}: global mean {:.6}, scale {:.6}, {} bad pixel(s){}",
            stats.clipped_mean,
            stats.scale,
            stats.bad_pixels,
            if stats.too_many_bad_pixels {
                " [exceeded tolerance]"
            } else {
                ""
            }
        );
    }

    if config.output.wants_background() {
        if let Some(background) = &products.background {
            write_cube(&background.view(), "BACKGROUND", &args.background_out)
                .with_context(|| format!("writing {}", args.background_out.display()))?;
            info!("wrote background to {}", args.background_out.display());
        }
        if let (Some(path), Some(scale)) = (&args.scale_out, &products.scale) {
            write_cube(&scale.view(), "SCALE", path)
                .with_context(|| format!("writing {}", path.display()))?;
            info!("wrote scale image to {}", path.display());
        }
    }

    if let Some(subtracted) = &products.subtracted {
        write_cube(&subtracted.view(), "SUBTRACTED", &args.subtracted_out)
            .with_context(|| format!("writing {}", args.subtracted_out.display()))?;
        info!("wrote subtracted image to {}", args.subtracted_out.display());
    }

    Ok(())
}
