//! Per-epoch forced PSF-fit and aperture photometry.
//!
//! One compute unit measures one (alert, epoch) pair: the native data stamp
//! is upsampled flux-conservingly, recentered onto the fractional target
//! position, background-subtracted from an annulus estimate, and reduced to
//! a PSF-weighted flux with propagated variance, plus a fixed-aperture flux
//! with a curve-of-growth correction. Failures are per-unit: they never
//! abort sibling units.

use log::{debug, warn};
use ndarray::ArrayView2;
use thiserror::Error;

use crate::algo::stats::{is_invalid, median, scale};
use crate::config::PhotometryConfig;
use crate::photometry::psf::weight_map;
use crate::photometry::resample::{flux_conserving_upsample, recenter};

/// Why a single compute unit produced no measurement.
#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum UnitError {
    /// The stamp position fell outside the source frame during extraction.
    #[error("stamp position is off the source image")]
    OffImage,
    /// Bad-pixel fraction of the upsampled stamp exceeded the maximum.
    #[error("bad-pixel fraction {fraction:.4} exceeds maximum {maximum:.4}")]
    ExcessiveBadPixels { fraction: f64, maximum: f64 },
    /// Too few finite annulus pixels for a background estimate.
    #[error("only {found} background pixels, need at least {required}")]
    InsufficientBackground { found: usize, required: usize },
}

impl UnitError {
    /// Legacy status code for the results table.
    pub fn status_code(self) -> i32 {
        match self {
            UnitError::OffImage => 61,
            UnitError::ExcessiveBadPixels { .. } => 55,
            UnitError::InsufficientBackground { .. } => 54,
        }
    }
}

/// Non-fatal degradation attached to an otherwise valid measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnitWarning {
    /// Bad pixels present in the upsampled stamp, below the hard maximum.
    DegradedBadPixels { fraction: f64 },
}

impl UnitWarning {
    /// Legacy status code for the results table.
    pub fn status_code(self) -> i32 {
        match self {
            UnitWarning::DegradedBadPixels { .. } => 56,
        }
    }
}

/// A completed forced-photometry measurement for one (alert, epoch) unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FluxMeasurement {
    /// PSF-fit flux, in detector units.
    pub flux: f64,
    /// PSF-fit flux uncertainty, correction factor applied.
    pub flux_uncertainty: f64,
    /// PSF-fit signal-to-noise ratio.
    pub snr: f64,
    /// Reduced chi-square of the PSF fit.
    pub chi_square: f64,
    /// Fixed-aperture flux, curve-of-growth corrected.
    pub aperture_flux: f64,
    /// Aperture flux uncertainty.
    pub aperture_flux_uncertainty: f64,
    /// Aperture signal-to-noise ratio.
    pub aperture_snr: f64,
    /// Curve-of-growth correction factor applied to the aperture sums.
    pub aperture_correction: f64,
    /// Soft warning, when the unit was degraded but measurable.
    pub warning: Option<UnitWarning>,
}

/// Outcome of one compute unit.
pub type UnitOutcome = Result<FluxMeasurement, UnitError>;

/// Measure one (alert, epoch) compute unit.
///
/// `stamp` is the native difference-image cutout, `fine_psf` the upsampled
/// unit-normalized PSF for the epoch, `(x_pos, y_pos)` the fractional target
/// position in native pixels, `off_image` the precomputed extraction flag.
pub fn measure_unit(
    stamp: &ArrayView2<'_, f64>,
    fine_psf: &ArrayView2<'_, f64>,
    x_pos: f64,
    y_pos: f64,
    off_image: bool,
    gain: f64,
    config: &PhotometryConfig,
) -> UnitOutcome {
    if off_image {
        return Err(UnitError::OffImage);
    }

    let factor = config.upsample_factor;
    let fine_area_per_native = (factor * factor) as f64;
    let stamp_size = config.stamp_size;
    let fine_size = config.fine_size();

    // Flux-conserving upsample, then recenter onto the target position.
    let (fine, upsample_stats) =
        flux_conserving_upsample(stamp, factor, config.upsample_method);
    let mut data = recenter(&fine.view(), x_pos, y_pos, factor);

    let mut warning = None;
    if upsample_stats.bad_pixels > 0 {
        if upsample_stats.bad_fraction > config.max_bad_pixel_fraction {
            warn!(
                "bad-pixel fraction {:.4} over maximum {:.4}; unit skipped",
                upsample_stats.bad_fraction, config.max_bad_pixel_fraction
            );
            return Err(UnitError::ExcessiveBadPixels {
                fraction: upsample_stats.bad_fraction,
                maximum: config.max_bad_pixel_fraction,
            });
        }
        warn!(
            "bad-pixel fraction {:.4} within maximum {:.4}; photometry may be impacted",
            upsample_stats.bad_fraction, config.max_bad_pixel_fraction
        );
        warning = Some(UnitWarning::DegradedBadPixels {
            fraction: upsample_stats.bad_fraction,
        });
    }

    let weights = weight_map(fine_psf);

    // Robust background and dispersion from the native-stamp annulus outside
    // the central source region.
    let annulus_center = (0.5 * stamp_size as f64) as isize;
    let mut annulus = Vec::new();
    for row in 0..stamp_size {
        let dy = (row as isize - annulus_center) as f64;
        for col in 0..stamp_size {
            let dx = (col as isize - annulus_center) as f64;
            if (dx * dx + dy * dy).sqrt() >= config.annulus_inner_radius {
                let value = stamp[[row, col]];
                if !is_invalid(value) {
                    annulus.push(value);
                }
            }
        }
    }
    if annulus.len() < config.min_background_pixels {
        return Err(UnitError::InsufficientBackground {
            found: annulus.len(),
            required: config.min_background_pixels,
        });
    }

    let annulus_scale = scale(&annulus);
    let background = median(&annulus) / fine_area_per_native;
    debug!(
        "annulus: {} pixels, scale {:.4}, fine background {:.6}",
        annulus.len(),
        annulus_scale,
        background
    );

    data.mapv_inplace(|v| if is_invalid(v) { v } else { v - background });

    // PSF-fit flux over valid pixels.
    let mut flux = 0.0;
    for (&d, &w) in data.iter().zip(weights.iter()) {
        if !is_invalid(d) {
            flux += d * w;
        }
    }

    // Variance per fine pixel: shot noise on non-negative data plus the
    // annulus dispersion scaled to fine-pixel units. Invalid data pixels
    // propagate NaN variance.
    let variance = data.mapv(|d| {
        if is_invalid(d) {
            f64::NAN
        } else {
            d.max(0.0) / gain + annulus_scale * annulus_scale / fine_area_per_native
        }
    });

    let mut weighted_variance = 0.0;
    for (&var, &w) in variance.iter().zip(weights.iter()) {
        if !is_invalid(var) {
            weighted_variance += var * w * w;
        }
    }
    let flux_uncertainty = config.correction_factor * weighted_variance.sqrt();
    let snr = flux / flux_uncertainty;

    // Reduced chi-square against the unit-normalized fine PSF.
    let mut chi_square = 0.0;
    for ((&d, &psf), &var) in data.iter().zip(fine_psf.iter()).zip(variance.iter()) {
        if !is_invalid(var) && var != 0.0 && !is_invalid(d) {
            let residual = d - flux * psf;
            chi_square += residual * residual / var;
        }
    }
    chi_square /= (stamp_size * stamp_size - 1) as f64;

    // Fixed-aperture photometry on the fine grid, centered on the stamp
    // center (not the recentered target), with a curve-of-growth correction
    // from the unit PSF.
    let aperture_radius = 0.5 * config.aperture_diameter * factor as f64;
    let fine_center = (0.5 * fine_size as f64) as isize;

    let mut psf_in_aperture = 0.0;
    let mut pixel_sum = 0.0;
    let mut variance_sum = 0.0;
    for row in 0..fine_size {
        let dy = (row as isize - fine_center) as f64;
        for col in 0..fine_size {
            let dx = (col as isize - fine_center) as f64;
            if (dx * dx + dy * dy).sqrt() <= aperture_radius {
                psf_in_aperture += fine_psf[[row, col]];
                let d = data[[row, col]];
                if !is_invalid(d) {
                    pixel_sum += d;
                    variance_sum += variance[[row, col]];
                }
            }
        }
    }

    let aperture_correction = 1.0 / psf_in_aperture;
    let aperture_flux = aperture_correction * pixel_sum;
    let aperture_flux_uncertainty =
        aperture_correction * config.correction_factor * variance_sum.sqrt();
    let aperture_snr = aperture_flux / aperture_flux_uncertainty;

    Ok(FluxMeasurement {
        flux,
        flux_uncertainty,
        snr,
        chi_square,
        aperture_flux,
        aperture_flux_uncertainty,
        aperture_snr,
        aperture_correction,
        warning,
    })
}
