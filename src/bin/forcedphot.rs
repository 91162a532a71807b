//! Forced PSF and aperture photometry across difference-image epochs.
//!
//! Reads an epoch list (`image gain` per line), an alert-position list
//! (`alert epoch pid ra dec x y` per line, one row per compute unit), and a
//! PSF stamp per epoch, measures every (alert, epoch) unit in parallel, and
//! writes the results table.

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;
use ndarray::Array2;
use std::path::{Path, PathBuf};

use photpipe::config::{PhotometryConfig, UpsampleMethod};
use photpipe::io::{read_alert_list, read_epoch_list, read_image_cube, write_results_table};
use photpipe::photometry::{prepare_fine_psf, PhotometryBatch};

#[derive(Parser, Debug)]
#[command(
    name = "forcedphot",
    about = "Forced PSF-fit and aperture photometry on difference images"
)]
struct Args {
    /// Epoch list file: one 'image_path gain' pair per line.
    #[arg(long)]
    image_list: PathBuf,

    /// Alert-position list file: 'alert epoch pid ra dec x y' per line.
    #[arg(long)]
    alert_list: PathBuf,

    /// Output results table.
    #[arg(long, default_value = "forcedphot.txt")]
    output: PathBuf,

    /// Substring of each image filename replaced to form its PSF filename.
    #[arg(long, default_value = "scimrefdiffimg")]
    psf_from: String,

    /// Replacement substring for PSF filenames.
    #[arg(long, default_value = "diffimgpsf")]
    psf_to: String,

    /// Worker thread count.
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Optional TOML file supplying the full photometry configuration;
    /// overrides the individual flags below.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Native stamp side length, in pixels.
    #[arg(long, default_value_t = 25)]
    stamp_size: usize,

    /// Integer upsampling factor.
    #[arg(long, default_value_t = 5)]
    upsample_factor: usize,

    /// Stamp upsampling method.
    #[arg(long, value_enum, default_value = "rebin")]
    upsample_method: UpsampleMethod,

    /// Fixed aperture diameter, in native pixels.
    #[arg(long, default_value_t = 9.0)]
    aperture_diameter: f64,

    /// Multiplier applied to flux uncertainties.
    #[arg(long, default_value_t = 1.0)]
    correction_factor: f64,

    /// Maximum tolerable bad-pixel fraction per stamp.
    #[arg(long, default_value_t = 0.2)]
    max_bad_pixel_fraction: f64,
}

impl Args {
    fn photometry_config(&self) -> Result<PhotometryConfig> {
        if let Some(path) = &self.config {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            return toml::from_str(&text)
                .with_context(|| format!("parsing config file {}", path.display()));
        }
        Ok(PhotometryConfig {
            stamp_size: self.stamp_size,
            upsample_factor: self.upsample_factor,
            upsample_method: self.upsample_method,
            aperture_diameter: self.aperture_diameter,
            correction_factor: self.correction_factor,
            max_bad_pixel_fraction: self.max_bad_pixel_fraction,
            ..PhotometryConfig::default()
        })
    }

    fn psf_path(&self, image_path: &Path) -> PathBuf {
        let name = image_path.to_string_lossy();
        PathBuf::from(name.replace(&self.psf_from, &self.psf_to))
    }
}

fn read_frame(path: &Path) -> Result<Array2<f64>> {
    let cube = read_image_cube(path)
        .with_context(|| format!("reading image {}", path.display()))?;
    Ok(cube.frame(0).to_owned())
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = args.photometry_config()?;

    let epochs = read_epoch_list(&args.image_list)
        .with_context(|| format!("reading epoch list {}", args.image_list.display()))?;
    if epochs.is_empty() {
        bail!("epoch list {} is empty", args.image_list.display());
    }
    info!("{} epoch(s) listed", epochs.len());

    let records = read_alert_list(&args.alert_list, epochs.len())
        .with_context(|| format!("reading alert list {}", args.alert_list.display()))?;
    info!(
        "{} compute unit(s) over {} alert(s)",
        records.len(),
        records.len() / epochs.len()
    );

    let gains: Vec<f64> = epochs.iter().map(|e| e.gain).collect();
    config.validate(epochs.len(), &gains)?;

    let mut frames = Vec::with_capacity(epochs.len());
    let mut fine_psfs = Vec::with_capacity(epochs.len());
    for entry in &epochs {
        frames.push(read_frame(&entry.image_path)?);

        let psf_path = args.psf_path(&entry.image_path);
        let psf = read_frame(&psf_path)?;
        if psf.dim() != (config.stamp_size, config.stamp_size) {
            bail!(
                "PSF stamp {} is {:?}, expected {}x{}",
                psf_path.display(),
                psf.dim(),
                config.stamp_size,
                config.stamp_size
            );
        }
        fine_psfs.push(prepare_fine_psf(&psf.view(), config.upsample_factor));
    }

    let positions: Vec<(f64, f64)> = records.iter().map(|r| (r.x, r.y)).collect();
    let batch = PhotometryBatch {
        epochs: &frames,
        fine_psfs: &fine_psfs,
        gains: &gains,
        positions: &positions,
        config: &config,
    };

    let outcomes = batch.measure_all(args.threads);
    let failures = outcomes.iter().filter(|o| o.is_err()).count();
    info!(
        "measured {} unit(s), {} failed",
        outcomes.len(),
        failures
    );

    write_results_table(&args.output, &records, &outcomes)
        .with_context(|| format!("writing results table {}", args.output.display()))?;
    info!("wrote results to {}", args.output.display());

    Ok(())
}
