//! Grid-based robust background estimation over an image cube.
//!
//! For each selected frame the pipeline can compute a whole-frame clipped
//! mean and robust scale (global pass), a coarse grid of windowed local
//! statistics reconstructed to full resolution by bilinear interpolation
//! (local pass), and a background-subtracted image. Excessive bad pixels
//! degrade a frame or node to NaN (or the global fallback) and never abort
//! the batch; only malformed configuration aborts, before any pixel is
//! touched.

use log::{debug, info, warn};
use ndarray::{Array2, Array3, ArrayView2, Axis};
use rayon::prelude::*;
use thiserror::Error;

use crate::algo::bilinear::{GridReconstructor, ReconstructError};
use crate::algo::stats::{clipped_mean, is_invalid, scale};
use crate::config::{BackgroundConfig, ConfigError};
use crate::image_proc::{sample_frame, sample_window, ImageCube, MaskPlane, SampleGrid};

/// Sigma threshold used for every clipped-mean computation in this pipeline.
const CLIP_SIGMA: f64 = 2.5;

/// Row-chunk size for parallel surface reconstruction.
const RECONSTRUCT_CHUNK_ROWS: usize = 64;

/// Fatal background-estimation errors.
#[derive(Error, Debug)]
pub enum BackgroundError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("mask plane is {mask:?} but image frames are {image:?}")]
    MaskShapeMismatch {
        mask: (usize, usize),
        image: (usize, usize),
    },
    #[error(transparent)]
    Reconstruct(#[from] ReconstructError),
}

/// Per-frame global statistics.
#[derive(Debug, Clone, Copy)]
pub struct FrameStats {
    /// Global clipped mean (NaN when the frame had too many bad pixels).
    pub clipped_mean: f64,
    /// Global robust scale (NaN when the frame had too many bad pixels).
    pub scale: f64,
    /// Bad pixels counted over the whole frame.
    pub bad_pixels: usize,
    /// Set when the frame exceeded the global bad-pixel tolerance.
    pub too_many_bad_pixels: bool,
}

/// Everything the pipeline produces for the caller to write out.
///
/// Arrays are sized for the *selected* frames, which is 1 when the plane
/// selection restricts processing to the first or last frame.
#[derive(Debug)]
pub struct BackgroundProducts {
    /// Full-resolution local background image, present when the local pass ran.
    pub background: Option<Array3<f64>>,
    /// Full-resolution local scale image, present when the local pass ran.
    pub scale: Option<Array3<f64>>,
    /// Background-subtracted image, present when requested.
    pub subtracted: Option<Array3<f64>>,
    /// Per-frame global statistics, present when the global pass ran.
    pub frame_stats: Vec<FrameStats>,
}

/// Run the background-estimation pipeline over an image cube.
pub fn estimate_background(
    image: &ImageCube,
    mask: Option<&MaskPlane>,
    config: &BackgroundConfig,
) -> Result<BackgroundProducts, BackgroundError> {
    let height = image.height();
    let width = image.width();

    config.validate(height, width)?;
    if let Some(mask) = mask {
        if mask.dim() != (height, width) {
            return Err(BackgroundError::MaskShapeMismatch {
                mask: mask.dim(),
                image: (height, width),
            });
        }
    }

    let selected = image.selected_frames(config.plane);
    let frames_out = selected.len();
    debug!(
        "background estimation over {frames_out} of {} frame(s), {height}x{width}",
        image.frames()
    );

    let mut frame_stats = Vec::new();
    if config.operation.runs_global() {
        frame_stats = global_pass(image, mask, config, selected.clone());
    }

    let mut background = None;
    let mut scale_image = None;
    if config.operation.runs_local() {
        let (bkg, scl) = local_pass(image, mask, config, selected.clone(), &frame_stats)?;
        background = Some(bkg);
        scale_image = Some(scl);
    }

    let subtracted = if config.output.wants_subtracted() {
        Some(subtract(image, selected, background.as_ref(), &frame_stats))
    } else {
        None
    };

    Ok(BackgroundProducts {
        background,
        scale: scale_image,
        subtracted,
        frame_stats,
    })
}

/// Whole-frame clipped mean and scale for each selected frame.
fn global_pass(
    image: &ImageCube,
    mask: Option<&MaskPlane>,
    config: &BackgroundConfig,
    selected: std::ops::Range<usize>,
) -> Vec<FrameStats> {
    let tolerance = config.global_tolerance_count(image.height(), image.width());
    info!("global clipped-mean pass, bad-pixel tolerance {tolerance}");

    selected
        .map(|frame_idx| {
            let frame = image.frame(frame_idx);
            let sample = sample_frame(&frame, mask, config.pothole);

            if sample.bad_pixels > tolerance {
                warn!(
                    "frame {frame_idx}: {} bad pixels exceed global tolerance {tolerance}",
                    sample.bad_pixels
                );
                return FrameStats {
                    clipped_mean: f64::NAN,
                    scale: f64::NAN,
                    bad_pixels: sample.bad_pixels,
                    too_many_bad_pixels: true,
                };
            }

            let clipped = clipped_mean(&sample.values, CLIP_SIGMA);
            let frame_scale = scale(&sample.values);
            debug!(
                "frame {frame_idx}: global mean {:.6}, scale {:.6}, {} bad pixels",
                clipped.mean, frame_scale, sample.bad_pixels
            );
            FrameStats {
                clipped_mean: clipped.mean,
                scale: frame_scale,
                bad_pixels: sample.bad_pixels,
                too_many_bad_pixels: false,
            }
        })
        .collect()
}

/// Value assigned to a grid node whose window exceeded the bad-pixel
/// tolerance: the frame's global statistic when the global pass ran, NaN
/// otherwise.
fn node_fallback(frame_stats: &[FrameStats], out_idx: usize, use_scale: bool) -> f64 {
    match frame_stats.get(out_idx) {
        Some(stats) if use_scale => stats.scale,
        Some(stats) => stats.clipped_mean,
        None => f64::NAN,
    }
}

/// Local grid statistics and full-resolution reconstruction for each frame.
fn local_pass(
    image: &ImageCube,
    mask: Option<&MaskPlane>,
    config: &BackgroundConfig,
    selected: std::ops::Range<usize>,
    frame_stats: &[FrameStats],
) -> Result<(Array3<f64>, Array3<f64>), BackgroundError> {
    let height = image.height();
    let width = image.width();
    let half = (config.window - 1) / 2;
    let tolerance = config.local_tolerance_count();

    let grid = SampleGrid::new(height, width, config.grid_spacing);
    let (gx, gy) = grid.coords_f64();
    info!(
        "local pass: window {}, {}x{} grid nodes, bad-pixel tolerance {tolerance}",
        config.window,
        grid.rows(),
        grid.cols()
    );

    let frames_out = selected.len();
    let mut background = Array3::zeros((frames_out, height, width));
    let mut scale_image = Array3::zeros((frames_out, height, width));

    for (out_idx, frame_idx) in selected.enumerate() {
        let frame = image.frame(frame_idx);

        let mut mean_grid = Array2::zeros((grid.rows(), grid.cols()));
        let mut scale_grid = Array2::zeros((grid.rows(), grid.cols()));

        for (i, &row) in grid.gy.iter().enumerate() {
            for (j, &col) in grid.gx.iter().enumerate() {
                let sample = sample_window(&frame, mask, row, col, half, config.pothole);

                if sample.bad_pixels > tolerance {
                    // Plenty of NaNs are expected in real data; this degrades
                    // the node, it is not an error.
                    mean_grid[[i, j]] = node_fallback(frame_stats, out_idx, false);
                    scale_grid[[i, j]] = node_fallback(frame_stats, out_idx, true);
                } else {
                    mean_grid[[i, j]] = clipped_mean(&sample.values, CLIP_SIGMA).mean;
                    scale_grid[[i, j]] = scale(&sample.values);
                }
            }
        }

        reconstruct_into(
            &mut background.index_axis_mut(Axis(0), out_idx).view_mut(),
            &mean_grid,
            &gx,
            &gy,
        )?;
        reconstruct_into(
            &mut scale_image.index_axis_mut(Axis(0), out_idx).view_mut(),
            &scale_grid,
            &gx,
            &gy,
        )?;
    }

    Ok((background, scale_image))
}

/// Fill a full-resolution surface from a coarse grid.
///
/// Every pixel is derived through the bilinear formula, exact grid-node
/// pixels included; node values are never copied across directly. Row chunks
/// are reconstructed in parallel; each chunk writes a disjoint slice, so the
/// result is independent of scheduling.
fn reconstruct_into(
    out: &mut ndarray::ArrayViewMut2<'_, f64>,
    grid: &Array2<f64>,
    gx: &[f64],
    gy: &[f64],
) -> Result<(), ReconstructError> {
    let recon = GridReconstructor::new(grid.view(), gx, gy, 0.0)?;
    out.axis_chunks_iter_mut(Axis(0), RECONSTRUCT_CHUNK_ROWS)
        .into_par_iter()
        .enumerate()
        .for_each(|(chunk_idx, mut chunk)| {
            let row_offset = chunk_idx * RECONSTRUCT_CHUNK_ROWS;
            for (local_row, mut row_view) in chunk.axis_iter_mut(Axis(0)).enumerate() {
                let row = (row_offset + local_row) as f64;
                for (col, value) in row_view.iter_mut().enumerate() {
                    *value = recon.value_at(row, col as f64);
                }
            }
        });
    Ok(())
}

/// Background-subtracted image.
///
/// An invalid input pixel yields NaN regardless of background validity. When
/// the local pass ran, its reconstruction is the background (NaN background
/// also yields NaN); otherwise the frame's global mean is subtracted.
fn subtract(
    image: &ImageCube,
    selected: std::ops::Range<usize>,
    background: Option<&Array3<f64>>,
    frame_stats: &[FrameStats],
) -> Array3<f64> {
    let height = image.height();
    let width = image.width();
    let frames_out = selected.len();
    let mut out = Array3::zeros((frames_out, height, width));

    info!("computing background-subtracted image");

    for (out_idx, frame_idx) in selected.enumerate() {
        let frame = image.frame(frame_idx);
        let local: Option<ArrayView2<'_, f64>> =
            background.map(|cube| cube.index_axis(Axis(0), out_idx));

        for row in 0..height {
            for col in 0..width {
                let input = frame[[row, col]];
                out[[out_idx, row, col]] = if is_invalid(input) {
                    f64::NAN
                } else if let Some(local) = local.as_ref() {
                    let bkg = local[[row, col]];
                    if is_invalid(bkg) {
                        f64::NAN
                    } else {
                        input - bkg
                    }
                } else {
                    input - node_fallback(frame_stats, out_idx, false)
                };
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OperationMode, OutputSelection, PlaneSelection};
    use approx::assert_relative_eq;
    use ndarray::Array3;

    fn config() -> BackgroundConfig {
        BackgroundConfig {
            window: 7,
            grid_spacing: 16,
            local_tolerance_percent: 50,
            global_tolerance_percent: 50,
            pothole: -1e9,
            mask_bits: 0,
            operation: OperationMode::Both,
            output: OutputSelection::Both,
            plane: PlaneSelection::All,
        }
    }

    fn uniform_cube(frames: usize, size: usize, value: f64) -> ImageCube {
        ImageCube::new(Array3::from_elem((frames, size, size), value))
    }

    #[test]
    fn uniform_image_yields_exact_global_stats() {
        let image = uniform_cube(1, 64, 100.0);
        let products = estimate_background(&image, None, &config()).unwrap();

        let stats = &products.frame_stats[0];
        assert_eq!(stats.clipped_mean, 100.0);
        assert_eq!(stats.scale, 0.0);
        assert_eq!(stats.bad_pixels, 0);
        assert!(!stats.too_many_bad_pixels);
    }

    #[test]
    fn uniform_image_reconstructs_flat_background() {
        let image = uniform_cube(1, 64, 100.0);
        let products = estimate_background(&image, None, &config()).unwrap();

        let background = products.background.unwrap();
        for &v in background.iter() {
            assert_relative_eq!(v, 100.0, epsilon = 1e-9);
        }
        let subtracted = products.subtracted.unwrap();
        for &v in subtracted.iter() {
            assert_relative_eq!(v, 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn single_nan_is_excluded_from_the_node_sample() {
        let mut data = Array3::from_elem((1, 64, 64), 100.0);
        data[[0, 17, 17]] = f64::NAN;
        let image = ImageCube::new(data);
        let products = estimate_background(&image, None, &config()).unwrap();

        // Node (1,1) sits at pixel (16,16); its 7x7 window contains the NaN
        // but must still report a finite mean from the remaining 48 pixels.
        let background = products.background.unwrap();
        assert_relative_eq!(background[[0, 16, 16]], 100.0, epsilon = 1e-9);
    }

    #[test]
    fn invalid_input_pixel_subtracts_to_nan() {
        let mut data = Array3::from_elem((1, 64, 64), 100.0);
        data[[0, 5, 9]] = f64::NAN;
        data[[0, 6, 9]] = f64::INFINITY;
        let image = ImageCube::new(data);
        let products = estimate_background(&image, None, &config()).unwrap();

        let subtracted = products.subtracted.unwrap();
        assert!(subtracted[[0, 5, 9]].is_nan());
        assert!(subtracted[[0, 6, 9]].is_nan());
        assert_relative_eq!(subtracted[[0, 5, 10]], 0.0, epsilon = 1e-9);
    }

    #[test]
    fn global_only_subtracts_the_frame_mean() {
        let mut cfg = config();
        cfg.operation = OperationMode::Global;
        let image = uniform_cube(2, 32, 50.0);
        let products = estimate_background(&image, None, &cfg).unwrap();

        assert!(products.background.is_none());
        let subtracted = products.subtracted.unwrap();
        assert_eq!(subtracted.dim(), (2, 32, 32));
        for &v in subtracted.iter() {
            assert_relative_eq!(v, 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn plane_selection_sizes_outputs_for_one_frame() {
        let mut cfg = config();
        cfg.plane = PlaneSelection::Last;
        let mut data = Array3::from_elem((3, 32, 32), 10.0);
        data.index_axis_mut(Axis(0), 2).fill(20.0);
        let image = ImageCube::new(data);
        let products = estimate_background(&image, None, &cfg).unwrap();

        assert_eq!(products.frame_stats.len(), 1);
        assert_relative_eq!(products.frame_stats[0].clipped_mean, 20.0);
        assert_eq!(products.subtracted.unwrap().dim(), (1, 32, 32));
    }

    #[test]
    fn masked_region_falls_back_to_global_value() {
        let mut data = Array3::from_elem((1, 64, 64), 100.0);
        // Corrupt a whole window's worth of pixels around node (16, 16); the
        // mask marks them all bad, so the node exceeds tolerance.
        for row in 12..21 {
            for col in 12..21 {
                data[[0, row, col]] = 1e9;
            }
        }
        let mut mask_data = Array2::zeros((64, 64));
        for row in 12..21 {
            for col in 12..21 {
                mask_data[[row, col]] = 1;
            }
        }
        let image = ImageCube::new(data);
        let mask = MaskPlane::new(mask_data, 1);

        let products = estimate_background(&image, Some(&mask), &config()).unwrap();
        let background = products.background.unwrap();
        // Fallback is the global clipped mean; the corrupted values are
        // masked out of the global sample too, so the node reads ~100.
        assert_relative_eq!(background[[0, 16, 16]], 100.0, epsilon = 1e-6);
    }

    #[test]
    fn even_window_aborts_before_processing() {
        let mut cfg = config();
        cfg.window = 6;
        let image = uniform_cube(1, 32, 1.0);
        assert!(matches!(
            estimate_background(&image, None, &cfg),
            Err(BackgroundError::Config(ConfigError::WindowNotOdd(6)))
        ));
    }

    #[test]
    fn window_overhanging_the_image_aborts_before_processing() {
        let mut cfg = config();
        cfg.window = 65;
        let image = uniform_cube(1, 32, 1.0);
        assert!(matches!(
            estimate_background(&image, None, &cfg),
            Err(BackgroundError::Config(
                ConfigError::WindowLargerThanImage { window: 65, .. }
            ))
        ));
    }

    #[test]
    fn mask_shape_mismatch_is_fatal() {
        let image = uniform_cube(1, 32, 1.0);
        let mask = MaskPlane::new(Array2::zeros((16, 16)), 1);
        assert!(matches!(
            estimate_background(&image, Some(&mask), &config()),
            Err(BackgroundError::MaskShapeMismatch { .. })
        ));
    }
}
