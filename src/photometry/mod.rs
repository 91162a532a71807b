//! Forced PSF and aperture photometry over an alert/epoch batch.

pub mod engine;
pub mod partition;
pub mod psf;
pub mod resample;

pub use engine::{measure_unit, FluxMeasurement, UnitError, UnitOutcome, UnitWarning};
pub use partition::{partition, run_partitioned};
pub use psf::{prepare_fine_psf, weight_map};
pub use resample::{flux_conserving_upsample, recenter, UpsampleStats};

use log::info;
use ndarray::{s, Array2, ArrayView2};

use crate::config::PhotometryConfig;
use crate::image_proc::sampler::nint;

/// Cut a square stamp centered on the nearest native pixel to `(x, y)`.
///
/// Returns `None` when any part of the stamp falls outside the frame; the
/// unit is then off-image.
pub fn extract_stamp(
    frame: &ArrayView2<'_, f64>,
    x: f64,
    y: f64,
    stamp_size: usize,
) -> Option<Array2<f64>> {
    let (height, width) = frame.dim();
    let half = (stamp_size / 2) as i64;
    let col = nint(x);
    let row = nint(y);
    if row - half < 0
        || col - half < 0
        || row + half >= height as i64
        || col + half >= width as i64
    {
        return None;
    }
    let r0 = (row - half) as usize;
    let c0 = (col - half) as usize;
    Some(
        frame
            .slice(s![r0..r0 + stamp_size, c0..c0 + stamp_size])
            .to_owned(),
    )
}

/// Everything one photometry batch shares across workers.
///
/// Epoch frames, per-epoch unit-normalized fine PSFs, per-epoch gains, and
/// one target position per compute unit in native pixel coordinates.
/// Compute unit `(alert, epoch)` owns slot `alert * num_epochs + epoch`, and
/// `positions` is indexed by slot: the target drifts between epochs, so each
/// unit carries its own position.
pub struct PhotometryBatch<'a> {
    pub epochs: &'a [Array2<f64>],
    pub fine_psfs: &'a [Array2<f64>],
    pub gains: &'a [f64],
    pub positions: &'a [(f64, f64)],
    pub config: &'a PhotometryConfig,
}

impl PhotometryBatch<'_> {
    pub fn num_units(&self) -> usize {
        self.positions.len()
    }

    pub fn num_alerts(&self) -> usize {
        self.positions.len() / self.epochs.len()
    }

    fn measure_slot(&self, slot: usize) -> UnitOutcome {
        let num_epochs = self.epochs.len();
        let epoch = slot % num_epochs;
        let (x, y) = self.positions[slot];

        let stamp = extract_stamp(&self.epochs[epoch].view(), x, y, self.config.stamp_size)
            .ok_or(UnitError::OffImage)?;

        measure_unit(
            &stamp.view(),
            &self.fine_psfs[epoch].view(),
            x,
            y,
            false,
            self.gains[epoch],
            self.config,
        )
    }

    /// Measure every (alert, epoch) unit across `threads` workers.
    pub fn measure_all(&self, threads: usize) -> Vec<UnitOutcome> {
        let n = self.num_units();
        info!(
            "measuring {} units ({} alerts x {} epochs) on {} threads",
            n,
            self.num_alerts(),
            self.epochs.len(),
            threads.max(1)
        );
        let mut outcomes = vec![Err(UnitError::OffImage); n];
        run_partitioned(&mut outcomes, threads, |slot| self.measure_slot(slot));
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn stamp_is_centered_on_the_nearest_pixel() {
        let frame = Array2::from_shape_fn((50, 50), |(r, c)| (r * 50 + c) as f64);
        let stamp = extract_stamp(&frame.view(), 20.3, 30.7, 5).unwrap();
        assert_eq!(stamp.dim(), (5, 5));
        // Center lands on native pixel (31, 20).
        assert_eq!(stamp[[2, 2]], frame[[31, 20]]);
    }

    #[test]
    fn stamp_touching_the_edge_is_off_image() {
        let frame = Array2::<f64>::zeros((50, 50));
        assert!(extract_stamp(&frame.view(), 1.0, 25.0, 5).is_none());
        assert!(extract_stamp(&frame.view(), 25.0, 48.0, 5).is_none());
        assert!(extract_stamp(&frame.view(), 2.0, 25.0, 5).is_some());
    }
}
