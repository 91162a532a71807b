//! Coarse sampling grid and windowed sample collection.
//!
//! The background estimator computes robust statistics at sparse grid nodes
//! and reconstructs the full image from them. The grid pins its last node to
//! the last pixel index rather than an even step, so the final cell on each
//! axis is narrower than the rest. That irregular cell is load-bearing: the
//! reconstruction lookup and all downstream products assume it.

use ndarray::ArrayView2;

use crate::algo::stats::is_invalid;
use crate::image_proc::cube::{reflect_index, MaskPlane};

/// Round half away from zero, matching the grid layout the products were
/// calibrated against.
#[inline]
pub fn nint(value: f64) -> i64 {
    if value >= 0.0 {
        (value + 0.5) as i64
    } else {
        (value - 0.5) as i64
    }
}

/// Node positions of the background sampling grid over one image frame.
#[derive(Debug, Clone)]
pub struct SampleGrid {
    /// Column pixel positions of the grid nodes, last pinned to `width - 1`.
    pub gx: Vec<usize>,
    /// Row pixel positions of the grid nodes, last pinned to `height - 1`.
    pub gy: Vec<usize>,
}

impl SampleGrid {
    /// Build the grid for an image of `height x width` with target node
    /// spacing `spacing`.
    ///
    /// Column count is `round(width / spacing) + 1`; positions are
    /// `j * spacing` except the last, which is forced to `width - 1`. Rows
    /// follow the same pattern with `height - 1`.
    pub fn new(height: usize, width: usize, spacing: usize) -> Self {
        let px = nint(width as f64 / spacing as f64).max(1) as usize;
        let py = nint(height as f64 / spacing as f64).max(1) as usize;
        let sx = px + 1;
        let sy = py + 1;

        let mut gx: Vec<usize> = (0..sx).map(|j| j * spacing).collect();
        gx[sx - 1] = width - 1;
        let mut gy: Vec<usize> = (0..sy).map(|i| i * spacing).collect();
        gy[sy - 1] = height - 1;

        Self { gx, gy }
    }

    pub fn cols(&self) -> usize {
        self.gx.len()
    }

    pub fn rows(&self) -> usize {
        self.gy.len()
    }

    /// Node coordinates as f64, for the bilinear reconstructor.
    pub fn coords_f64(&self) -> (Vec<f64>, Vec<f64>) {
        (
            self.gx.iter().map(|&v| v as f64).collect(),
            self.gy.iter().map(|&v| v as f64).collect(),
        )
    }
}

/// A windowed, bad-pixel-filtered sample gathered around one pixel.
#[derive(Debug, Clone)]
pub struct WindowSample {
    /// Valid pixel values in row-major window scan order.
    pub values: Vec<f64>,
    /// Number of window pixels rejected as bad.
    pub bad_pixels: usize,
}

/// Collect the `(2*half + 1)^2` window around `(center_row, center_col)`.
///
/// Out-of-bounds offsets are mirrored by whole-array reflection, so near-edge
/// windows borrow pixels from across the image. A pixel is bad if masked
/// (when a mask is supplied), else if non-finite, else if at or below the
/// pothole threshold.
pub fn sample_window(
    frame: &ArrayView2<'_, f64>,
    mask: Option<&MaskPlane>,
    center_row: usize,
    center_col: usize,
    half: usize,
    pothole: f64,
) -> WindowSample {
    let (height, width) = frame.dim();
    let half = half as isize;

    let mut values = Vec::with_capacity(((2 * half + 1) * (2 * half + 1)) as usize);
    let mut bad_pixels = 0usize;

    for di in -half..=half {
        let row = reflect_index(center_row as isize + di, height);
        for dj in -half..=half {
            let col = reflect_index(center_col as isize + dj, width);

            if let Some(mask) = mask {
                if mask.is_masked(row, col) {
                    bad_pixels += 1;
                    continue;
                }
            }

            let value = frame[[row, col]];
            if is_invalid(value) {
                bad_pixels += 1;
                continue;
            }
            if value <= pothole {
                bad_pixels += 1;
                continue;
            }
            values.push(value);
        }
    }

    WindowSample { values, bad_pixels }
}

/// Collect every valid pixel of a whole frame for global statistics.
pub fn sample_frame(
    frame: &ArrayView2<'_, f64>,
    mask: Option<&MaskPlane>,
    pothole: f64,
) -> WindowSample {
    let (height, width) = frame.dim();
    let mut values = Vec::with_capacity(height * width);
    let mut bad_pixels = 0usize;

    for row in 0..height {
        for col in 0..width {
            if let Some(mask) = mask {
                if mask.is_masked(row, col) {
                    bad_pixels += 1;
                    continue;
                }
            }
            let value = frame[[row, col]];
            if is_invalid(value) {
                bad_pixels += 1;
                continue;
            }
            if value <= pothole {
                bad_pixels += 1;
                continue;
            }
            values.push(value);
        }
    }

    WindowSample { values, bad_pixels }
}
