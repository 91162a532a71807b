//! Flux-conserving stamp upsampling and sub-pixel recentering.
//!
//! Neither nearest-neighbor replication nor bilinear interpolation preserves
//! total flux by itself, so the upsampler shifts the stamp non-negative,
//! resamples, and rescales by the ratio of the original to the resampled sum
//! before restoring the offset. The round trip keeps the summed stamp flux
//! unchanged to floating-point precision.

use ndarray::{Array2, ArrayView2};

use crate::algo::bilinear::GridReconstructor;
use crate::algo::stats::is_invalid;
use crate::config::UpsampleMethod;
use crate::image_proc::sampler::nint;

/// Lookup tolerance for fractional upsampling grids.
const FINE_GRID_TOL: f64 = 1e-6;

/// Bad-pixel bookkeeping from one upsampling pass.
#[derive(Debug, Clone, Copy)]
pub struct UpsampleStats {
    /// Non-finite pixels in the upsampled stamp.
    pub bad_pixels: usize,
    /// Bad fraction of the upsampled stamp.
    pub bad_fraction: f64,
}

/// Nearest-neighbor block replication by an integer factor.
pub fn rebin(stamp: &ArrayView2<'_, f64>, factor: usize) -> Array2<f64> {
    let (rows, cols) = stamp.dim();
    let mut out = Array2::zeros((rows * factor, cols * factor));
    for fine_row in 0..rows * factor {
        for fine_col in 0..cols * factor {
            out[[fine_row, fine_col]] = stamp[[fine_row / factor, fine_col / factor]];
        }
    }
    out
}

/// Bilinear interpolation of a coarse stamp onto the fine grid.
///
/// The coarse nodes are spread across the full fine extent (node `j` at
/// `j * (fine - 1) / (coarse - 1)`), and the lookup carries a small tolerance
/// so fine pixels landing exactly on a node resolve to it.
pub fn bilinear_upsample(stamp: &ArrayView2<'_, f64>, factor: usize) -> Array2<f64> {
    let (rows, cols) = stamp.dim();
    let fine_rows = rows * factor;
    let fine_cols = cols * factor;

    let gx: Vec<f64> = (0..cols)
        .map(|j| j as f64 * (fine_cols - 1) as f64 / (cols - 1) as f64)
        .collect();
    let gy: Vec<f64> = (0..rows)
        .map(|i| i as f64 * (fine_rows - 1) as f64 / (rows - 1) as f64)
        .collect();

    let recon = GridReconstructor::new(stamp.view(), &gx, &gy, FINE_GRID_TOL)
        .expect("stamp grid coordinates match stamp shape");

    let mut out = Array2::zeros((fine_rows, fine_cols));
    for row in 0..fine_rows {
        for col in 0..fine_cols {
            out[[row, col]] = recon.value_at(row as f64, col as f64);
        }
    }
    out
}

/// Upsample a data stamp by an integer factor, conserving total flux.
///
/// The stamp is shifted by its finite minimum so every value is
/// non-negative, resampled, then every fine pixel becomes
/// `(v + min) * orig_sum / new_sum`. Non-finite pixels ride through the
/// arithmetic and stay non-finite.
pub fn flux_conserving_upsample(
    stamp: &ArrayView2<'_, f64>,
    factor: usize,
    method: UpsampleMethod,
) -> (Array2<f64>, UpsampleStats) {
    let mut orig_min = f64::MAX;
    for &v in stamp.iter() {
        if !is_invalid(v) && v < orig_min {
            orig_min = v;
        }
    }
    if orig_min == f64::MAX {
        orig_min = 0.0;
    }

    let shifted = stamp.mapv(|v| v - orig_min);
    let orig_sum: f64 = shifted.iter().filter(|v| !is_invalid(**v)).sum();

    let mut fine = match method {
        UpsampleMethod::Rebin => rebin(&shifted.view(), factor),
        UpsampleMethod::Bilinear => bilinear_upsample(&shifted.view(), factor),
    };

    let mut bad_pixels = 0usize;
    let mut new_sum = 0.0;
    for &v in fine.iter() {
        if is_invalid(v) {
            bad_pixels += 1;
        } else {
            new_sum += v;
        }
    }

    // A constant stamp resamples to all zeros after the shift; the rescale
    // ratio then takes its rebin limit of 1 / factor^2.
    let ratio = if new_sum != 0.0 {
        orig_sum / new_sum
    } else {
        1.0 / (factor * factor) as f64
    };

    fine.mapv_inplace(|v| (v + orig_min) * ratio);

    let bad_fraction = bad_pixels as f64 / fine.len() as f64;
    (
        fine,
        UpsampleStats {
            bad_pixels,
            bad_fraction,
        },
    )
}

/// Translate the fine stamp by the integer fine-pixel shift that moves the
/// fractional target position onto its nearest native pixel.
///
/// Pixels shifted in from off the edge are zero-filled.
pub fn recenter(
    fine: &ArrayView2<'_, f64>,
    x_pos: f64,
    y_pos: f64,
    factor: usize,
) -> Array2<f64> {
    let x_nearest = nint(x_pos) as f64;
    let y_nearest = nint(y_pos) as f64;
    let x_shift = nint((x_nearest - x_pos) * factor as f64) as isize;
    let y_shift = nint((y_nearest - y_pos) * factor as f64) as isize;

    let (rows, cols) = fine.dim();
    let mut out = Array2::zeros((rows, cols));
    for row in 0..rows as isize {
        let src_row = row - y_shift;
        for col in 0..cols as isize {
            let src_col = col - x_shift;
            out[[row as usize, col as usize]] =
                if src_row < 0 || src_row >= rows as isize || src_col < 0 || src_col >= cols as isize
                {
                    0.0
                } else {
                    fine[[src_row as usize, src_col as usize]]
                };
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array2;

    #[test]
    fn rebin_replicates_blocks() {
        let mut stamp = Array2::zeros((2, 2));
        stamp[[0, 0]] = 1.0;
        stamp[[0, 1]] = 2.0;
        stamp[[1, 0]] = 3.0;
        stamp[[1, 1]] = 4.0;
        let fine = rebin(&stamp.view(), 3);
        assert_eq!(fine.dim(), (6, 6));
        assert_eq!(fine[[0, 0]], 1.0);
        assert_eq!(fine[[2, 2]], 1.0);
        assert_eq!(fine[[0, 3]], 2.0);
        assert_eq!(fine[[5, 5]], 4.0);
    }

    #[test]
    fn upsample_conserves_total_flux() {
        let mut stamp = Array2::zeros((5, 5));
        for (idx, v) in stamp.iter_mut().enumerate() {
            *v = (idx % 7) as f64;
        }
        let total: f64 = stamp.sum();

        for method in [UpsampleMethod::Rebin, UpsampleMethod::Bilinear] {
            let (fine, stats) = flux_conserving_upsample(&stamp.view(), 5, method);
            assert_eq!(stats.bad_pixels, 0);
            assert_relative_eq!(fine.sum(), total, epsilon = 1e-9);
        }
    }

    #[test]
    fn rebin_upsample_conserves_flux_with_negative_values() {
        let mut stamp = Array2::zeros((5, 5));
        for (idx, v) in stamp.iter_mut().enumerate() {
            *v = (idx % 7) as f64 - 2.0;
        }
        let total: f64 = stamp.sum();
        let (fine, _) = flux_conserving_upsample(&stamp.view(), 4, UpsampleMethod::Rebin);
        assert_relative_eq!(fine.sum(), total, epsilon = 1e-9);
    }

    #[test]
    fn upsample_of_constant_stamp_conserves_flux() {
        let stamp = Array2::from_elem((4, 4), 3.0);
        let (fine, _) = flux_conserving_upsample(&stamp.view(), 2, UpsampleMethod::Rebin);
        assert_relative_eq!(fine.sum(), stamp.sum(), epsilon = 1e-9);
    }

    #[test]
    fn upsample_counts_bad_pixels() {
        let mut stamp = Array2::from_elem((4, 4), 1.0);
        stamp[[1, 1]] = f64::NAN;
        let (fine, stats) = flux_conserving_upsample(&stamp.view(), 2, UpsampleMethod::Rebin);
        // One bad native pixel replicates to factor^2 bad fine pixels.
        assert_eq!(stats.bad_pixels, 4);
        assert_relative_eq!(stats.bad_fraction, 4.0 / 64.0);
        assert!(fine[[2, 2]].is_nan());
    }

    #[test]
    fn bilinear_upsample_hits_nodes_exactly() {
        let mut stamp = Array2::zeros((3, 3));
        for (idx, v) in stamp.iter_mut().enumerate() {
            *v = idx as f64;
        }
        let fine = bilinear_upsample(&stamp.view(), 3);
        assert_eq!(fine.dim(), (9, 9));
        // Node (0,0) maps to fine (0,0); node (2,2) maps to fine (8,8).
        assert_relative_eq!(fine[[0, 0]], stamp[[0, 0]], epsilon = 1e-9);
        assert_relative_eq!(fine[[8, 8]], stamp[[2, 2]], epsilon = 1e-9);
        assert_relative_eq!(fine[[4, 4]], stamp[[1, 1]], epsilon = 1e-9);
    }

    #[test]
    fn recenter_shifts_by_fine_pixels() {
        let mut fine = Array2::zeros((10, 10));
        fine[[5, 5]] = 1.0;
        // Target at x = 4.8: nearest native pixel 5, shift = +0.2 native
        // = +1 fine pixel at factor 5.
        let out = recenter(&fine.view(), 4.8, 5.0, 5);
        assert_eq!(out[[5, 6]], 1.0);
        assert_eq!(out[[5, 5]], 0.0);
    }

    #[test]
    fn recenter_zero_fills_the_edge() {
        let fine = Array2::from_elem((4, 4), 7.0);
        let out = recenter(&fine.view(), 0.0 - 0.4, 0.0, 2);
        // x shift = nint(0.4 * 2) = 1 fine pixel right... source column -1
        // is off grid for column 0.
        assert_eq!(out[[0, 0]], 0.0);
        assert_eq!(out[[0, 1]], 7.0);
    }

    #[test]
    fn integer_position_needs_no_shift() {
        let mut fine = Array2::zeros((6, 6));
        fine[[3, 2]] = 9.0;
        let out = recenter(&fine.view(), 7.0, 11.0, 3);
        assert_eq!(out, fine);
    }
}
