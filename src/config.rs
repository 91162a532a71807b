//! Immutable run configuration for both pipelines.
//!
//! The original tooling threaded status/verbosity flags through every call;
//! here each pipeline takes an explicit config struct validated up front.
//! Validation failures are fatal and abort before any pixel is processed.

use clap::ValueEnum;
use serde::Deserialize;
use thiserror::Error;

/// Fatal configuration errors, reported once before processing.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("window size {0} must be odd")]
    WindowNotOdd(usize),
    #[error("window size {0} must be greater than 1")]
    WindowTooSmall(usize),
    #[error("grid spacing {0} must be greater than 1 for local statistics")]
    GridSpacingTooSmall(usize),
    #[error("bad-pixel tolerance {0}% must be in 0..=99")]
    ToleranceOutOfRange(u8),
    #[error("window area {area} does not exceed the local bad-pixel tolerance count {tolerance}")]
    WindowWithinTolerance { area: usize, tolerance: usize },
    #[error("window size {window} overhangs a {height}x{width} image")]
    WindowLargerThanImage {
        window: usize,
        height: usize,
        width: usize,
    },
    #[error("image area {area} does not exceed the global bad-pixel tolerance count {tolerance}")]
    ImageWithinTolerance { area: usize, tolerance: usize },
    #[error("stamp size {0} must be at least 2")]
    StampTooSmall(usize),
    #[error("upsample factor {0} must be at least 1")]
    UpsampleFactorTooSmall(usize),
    #[error("max bad-pixel fraction {0} must be in [0, 1]")]
    BadPixelFractionOutOfRange(f64),
    #[error("gain table has {gains} entries for {epochs} epochs")]
    GainCountMismatch { gains: usize, epochs: usize },
}

/// Which background statistic passes to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationMode {
    /// Local grid statistics only; undersampled nodes fall back to NaN.
    Local,
    /// Whole-frame statistics only.
    Global,
    /// Both; undersampled local nodes fall back to the global value.
    Both,
}

impl OperationMode {
    pub fn runs_local(self) -> bool {
        matches!(self, OperationMode::Local | OperationMode::Both)
    }

    pub fn runs_global(self) -> bool {
        matches!(self, OperationMode::Global | OperationMode::Both)
    }
}

/// Which output images to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputSelection {
    Background,
    Subtracted,
    Both,
    None,
}

impl OutputSelection {
    pub fn wants_background(self) -> bool {
        matches!(self, OutputSelection::Background | OutputSelection::Both)
    }

    pub fn wants_subtracted(self) -> bool {
        matches!(self, OutputSelection::Subtracted | OutputSelection::Both)
    }
}

/// Which frames of the input cube to process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaneSelection {
    All,
    First,
    Last,
}

/// Upsampling method for photometry stamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsampleMethod {
    /// Nearest-neighbor block replication.
    Rebin,
    /// Bilinear interpolation over the coarse stamp grid.
    Bilinear,
}

/// Background-estimation configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BackgroundConfig {
    /// Square local-statistics window, in pixels; must be odd and > 1.
    pub window: usize,
    /// Target grid node spacing, in pixels; must be > 1 for local passes.
    pub grid_spacing: usize,
    /// Local bad-pixel tolerance, percent of window area (0..=99).
    pub local_tolerance_percent: u8,
    /// Global bad-pixel tolerance, percent of frame area (0..=99).
    pub global_tolerance_percent: u8,
    /// Values at or below this threshold are treated as bad pixels.
    pub pothole: f64,
    /// Mask bits that flag a pixel bad; 0 disables mask filtering.
    pub mask_bits: i32,
    pub operation: OperationMode,
    pub output: OutputSelection,
    pub plane: PlaneSelection,
}

impl BackgroundConfig {
    /// Local bad-pixel count threshold: `percent * window^2 / 100`, truncated.
    pub fn local_tolerance_count(&self) -> usize {
        self.local_tolerance_percent as usize * self.window * self.window / 100
    }

    /// Global bad-pixel count threshold: `percent * H * W / 100`, truncated.
    pub fn global_tolerance_count(&self, height: usize, width: usize) -> usize {
        self.global_tolerance_percent as usize * height * width / 100
    }

    /// Validate against the image dimensions before any processing.
    pub fn validate(&self, height: usize, width: usize) -> Result<(), ConfigError> {
        if self.local_tolerance_percent > 99 {
            return Err(ConfigError::ToleranceOutOfRange(self.local_tolerance_percent));
        }
        if self.global_tolerance_percent > 99 {
            return Err(ConfigError::ToleranceOutOfRange(
                self.global_tolerance_percent,
            ));
        }
        if self.operation.runs_global() {
            let area = height * width;
            let tolerance = self.global_tolerance_count(height, width);
            if area <= tolerance {
                return Err(ConfigError::ImageWithinTolerance { area, tolerance });
            }
        }
        if self.operation.runs_local() {
            if self.window % 2 != 1 {
                return Err(ConfigError::WindowNotOdd(self.window));
            }
            if self.window <= 1 {
                return Err(ConfigError::WindowTooSmall(self.window));
            }
            if self.grid_spacing <= 1 {
                return Err(ConfigError::GridSpacingTooSmall(self.grid_spacing));
            }
            // Mirror reflection at the edges only covers a half-window that
            // fits inside the frame.
            let half = (self.window - 1) / 2;
            if half > height.min(width).saturating_sub(1) {
                return Err(ConfigError::WindowLargerThanImage {
                    window: self.window,
                    height,
                    width,
                });
            }
            let area = self.window * self.window;
            let tolerance = self.local_tolerance_count();
            if area <= tolerance {
                return Err(ConfigError::WindowWithinTolerance { area, tolerance });
            }
        }
        Ok(())
    }
}

/// Forced-photometry configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PhotometryConfig {
    /// Side length of the native (non-upsampled) stamp, in pixels.
    pub stamp_size: usize,
    /// Integer upsampling factor for the fine grid.
    pub upsample_factor: usize,
    /// Upsampling method for data stamps.
    pub upsample_method: UpsampleMethod,
    /// Fixed aperture diameter, in native pixels.
    pub aperture_diameter: f64,
    /// Multiplier applied to flux uncertainties.
    pub correction_factor: f64,
    /// Maximum tolerable fraction of bad pixels in an upsampled stamp.
    pub max_bad_pixel_fraction: f64,
    /// Central exclusion radius of the background annulus, native pixels.
    pub annulus_inner_radius: f64,
    /// Minimum number of finite annulus pixels required per unit.
    pub min_background_pixels: usize,
}

impl PhotometryConfig {
    pub fn fine_size(&self) -> usize {
        self.stamp_size * self.upsample_factor
    }

    pub fn validate(&self, num_epochs: usize, gains: &[f64]) -> Result<(), ConfigError> {
        if self.stamp_size < 2 {
            return Err(ConfigError::StampTooSmall(self.stamp_size));
        }
        if self.upsample_factor < 1 {
            return Err(ConfigError::UpsampleFactorTooSmall(self.upsample_factor));
        }
        if !(0.0..=1.0).contains(&self.max_bad_pixel_fraction) {
            return Err(ConfigError::BadPixelFractionOutOfRange(
                self.max_bad_pixel_fraction,
            ));
        }
        if gains.len() != num_epochs {
            return Err(ConfigError::GainCountMismatch {
                gains: gains.len(),
                epochs: num_epochs,
            });
        }
        Ok(())
    }
}

impl Default for PhotometryConfig {
    fn default() -> Self {
        Self {
            stamp_size: 25,
            upsample_factor: 5,
            upsample_method: UpsampleMethod::Rebin,
            aperture_diameter: 9.0,
            correction_factor: 1.0,
            max_bad_pixel_fraction: 0.2,
            annulus_inner_radius: 5.0,
            min_background_pixels: 100,
        }
    }
}
