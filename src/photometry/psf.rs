//! Fine-grid PSF preparation and weight-map normalization.
//!
//! Each epoch supplies a native-resolution PSF stamp. The engine works on a
//! fine grid, so the stamp is clamped non-negative, bilinearly upsampled, and
//! renormalized to unit sum. For flux extraction the unit PSF is converted to
//! an optimal weight map whose squared weights sum to one over valid pixels.

use ndarray::{Array2, ArrayView2};

use crate::algo::stats::is_invalid;
use crate::photometry::resample::bilinear_upsample;

/// Upsample a native PSF stamp to the fine grid and normalize it to unit sum.
///
/// Negative stamp values are clamped to zero before interpolation; they are
/// fit artifacts, not flux.
pub fn prepare_fine_psf(stamp: &ArrayView2<'_, f64>, factor: usize) -> Array2<f64> {
    let clamped = stamp.mapv(|v| if v < 0.0 { 0.0 } else { v });
    let mut fine = bilinear_upsample(&clamped.view(), factor);

    let sum: f64 = fine.iter().filter(|v| !is_invalid(**v)).sum();
    if sum != 0.0 {
        fine.mapv_inplace(|v| v / sum);
    }
    fine
}

/// Convert a unit-normalized fine PSF into a flux-extraction weight map.
///
/// Weights are `psf / sum(psf^2)` with the squared sum taken over valid
/// pixels only; a non-finite PSF pixel contributes zero weight. With these
/// weights, `sum(data * weight)` recovers the flux of a source matching the
/// PSF shape.
pub fn weight_map(fine_psf: &ArrayView2<'_, f64>) -> Array2<f64> {
    let mut squared_sum = 0.0;
    for &v in fine_psf.iter() {
        if !is_invalid(v) {
            squared_sum += v * v;
        }
    }

    fine_psf.mapv(|v| {
        if is_invalid(v) || squared_sum == 0.0 {
            0.0
        } else {
            v / squared_sum
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array2;

    fn gaussian_stamp(size: usize, sigma: f64) -> Array2<f64> {
        let center = (size / 2) as f64;
        Array2::from_shape_fn((size, size), |(row, col)| {
            let dy = row as f64 - center;
            let dx = col as f64 - center;
            (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp()
        })
    }

    #[test]
    fn fine_psf_sums_to_one() {
        let stamp = gaussian_stamp(25, 2.0);
        let fine = prepare_fine_psf(&stamp.view(), 5);
        assert_eq!(fine.dim(), (125, 125));
        assert_relative_eq!(fine.sum(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn negative_stamp_values_are_clamped() {
        let mut stamp = gaussian_stamp(9, 1.5);
        stamp[[0, 0]] = -0.3;
        let fine = prepare_fine_psf(&stamp.view(), 3);
        assert!(fine.iter().all(|&v| v >= 0.0));
        assert_relative_eq!(fine.sum(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn weight_map_squared_weights_extract_unit_flux() {
        let stamp = gaussian_stamp(25, 2.0);
        let fine = prepare_fine_psf(&stamp.view(), 5);
        let weights = weight_map(&fine.view());

        // A source exactly matching the PSF with amplitude A has
        // sum(A * psf * weight) = A * sum(psf^2) / sum(psf^2) = A.
        let amplitude = 1234.5;
        let flux: f64 = fine
            .iter()
            .zip(weights.iter())
            .map(|(&p, &w)| amplitude * p * w)
            .sum();
        assert_relative_eq!(flux, amplitude, epsilon = 1e-6);
    }

    #[test]
    fn invalid_psf_pixels_get_zero_weight() {
        let mut fine = gaussian_stamp(15, 2.0);
        fine[[3, 4]] = f64::NAN;
        fine[[10, 2]] = f64::INFINITY;
        let weights = weight_map(&fine.view());
        assert_eq!(weights[[3, 4]], 0.0);
        assert_eq!(weights[[10, 2]], 0.0);
        assert!(weights.iter().all(|v| v.is_finite()));
    }
}
