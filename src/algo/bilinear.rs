//! Bilinear reconstruction of full-resolution surfaces from coarse grids.
//!
//! The grids produced by the background estimator (and the photometry
//! upsampler) pin their last node to the last pixel index, so the final cell
//! on each axis is narrower than the rest. The neighbor lookup here replicates
//! the exact rule the downstream products were calibrated against: a linear
//! scan for the first node coordinate at or beyond the target, with index 0
//! clamped to 1 so the left/top edge never divides by a zero-width cell.

use ndarray::{Array2, ArrayView2};
use thiserror::Error;

/// Errors from coarse-grid reconstruction setup.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReconstructError {
    /// Grid shape does not match the coordinate vectors.
    #[error("grid shape {shape:?} does not match coordinates (x: {x_len}, y: {y_len})")]
    DimensionMismatch {
        shape: (usize, usize),
        x_len: usize,
        y_len: usize,
    },
    /// Fewer than two nodes on an axis; no cell exists to interpolate in.
    #[error("{axis} axis has {len} grid nodes, need at least 2")]
    TooFewNodes { axis: &'static str, len: usize },
}

/// Bilinear reconstructor over a coarse grid with explicit node coordinates.
///
/// `grid` is indexed `[row_node, col_node]`; `gx`/`gy` hold the pixel
/// coordinates of the column/row nodes in ascending order.
#[derive(Debug, Clone)]
pub struct GridReconstructor<'a> {
    grid: ArrayView2<'a, f64>,
    gx: &'a [f64],
    gy: &'a [f64],
    /// Lookup tolerance; 0 for integer-pinned grids, small positive for
    /// fractional node coordinates.
    tol: f64,
}

impl<'a> GridReconstructor<'a> {
    pub fn new(
        grid: ArrayView2<'a, f64>,
        gx: &'a [f64],
        gy: &'a [f64],
        tol: f64,
    ) -> Result<Self, ReconstructError> {
        let (sy, sx) = grid.dim();
        if sx != gx.len() || sy != gy.len() {
            return Err(ReconstructError::DimensionMismatch {
                shape: (sy, sx),
                x_len: gx.len(),
                y_len: gy.len(),
            });
        }
        if gx.len() < 2 {
            return Err(ReconstructError::TooFewNodes {
                axis: "x",
                len: gx.len(),
            });
        }
        if gy.len() < 2 {
            return Err(ReconstructError::TooFewNodes {
                axis: "y",
                len: gy.len(),
            });
        }
        Ok(Self { grid, gx, gy, tol })
    }

    /// Upper-neighbor index for `target` on `coords`.
    ///
    /// First index whose coordinate is `>= target - tol`, scanning from 0.
    /// Index 0 (whether matched there or never matched) is clamped to 1; the
    /// caller always gets a usable `[idx - 1, idx]` cell.
    fn upper_index(coords: &[f64], target: f64, tol: f64) -> usize {
        let mut upper = 0;
        for (idx, &coord) in coords.iter().enumerate() {
            if coord >= target - tol {
                upper = idx;
                break;
            }
        }
        if upper == 0 {
            upper = 1;
        }
        upper
    }

    /// Reconstruct the surface value at one pixel.
    ///
    /// At an exact node coordinate the fractions evaluate to 0 or 1 and the
    /// node's own value comes back (within floating-point error).
    pub fn value_at(&self, row: f64, col: f64) -> f64 {
        let jp1 = Self::upper_index(self.gx, col, self.tol);
        let ip1 = Self::upper_index(self.gy, row, self.tol);
        let j = jp1 - 1;
        let i = ip1 - 1;

        let x = self.gx[j];
        let xp1 = self.gx[jp1];
        let y = self.gy[i];
        let yp1 = self.gy[ip1];

        let map_ij = self.grid[[i, j]];
        let map_ip1_j = self.grid[[ip1, j]];
        let map_i_jp1 = self.grid[[i, jp1]];
        let map_ip1_jp1 = self.grid[[ip1, jp1]];

        let t = (col - x) / (xp1 - x);
        let u = (row - y) / (yp1 - y);

        // The corner/weight pairing is load-bearing; swapping corners
        // corrupts output without raising any error.
        (1.0 - t) * (1.0 - u) * map_ij
            + t * (1.0 - u) * map_i_jp1
            + t * u * map_ip1_jp1
            + (1.0 - t) * u * map_ip1_j
    }

    /// Reconstruct a full-resolution surface, one value per pixel.
    pub fn surface(&self, height: usize, width: usize) -> Array2<f64> {
        let mut out = Array2::zeros((height, width));
        for row in 0..height {
            for col in 0..width {
                out[[row, col]] = self.value_at(row as f64, col as f64);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn pinned_grid() -> (Array2<f64>, Vec<f64>, Vec<f64>) {
        // 3x3 grid over a 10x10 image with spacing 4: nodes at 0, 4, 9.
        let coords = vec![0.0, 4.0, 9.0];
        let mut grid = Array2::zeros((3, 3));
        for (i, &y) in coords.iter().enumerate() {
            for (j, &x) in coords.iter().enumerate() {
                grid[[i, j]] = 2.0 * x + 3.0 * y;
            }
        }
        (grid, coords.clone(), coords)
    }

    #[test]
    fn exact_nodes_reproduce_grid_values() {
        let (grid, gx, gy) = pinned_grid();
        let recon = GridReconstructor::new(grid.view(), &gx, &gy, 0.0).unwrap();
        for &y in &gy {
            for &x in &gx {
                assert_relative_eq!(recon.value_at(y, x), 2.0 * x + 3.0 * y, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn planar_data_is_interpolated_exactly() {
        let (grid, gx, gy) = pinned_grid();
        let recon = GridReconstructor::new(grid.view(), &gx, &gy, 0.0).unwrap();
        // Bilinear interpolation is exact for planes, irregular last cell
        // included.
        for row in 0..10 {
            for col in 0..10 {
                assert_relative_eq!(
                    recon.value_at(row as f64, col as f64),
                    2.0 * col as f64 + 3.0 * row as f64,
                    epsilon = 1e-10
                );
            }
        }
    }

    #[test]
    fn edge_clamp_uses_the_first_cell() {
        let (grid, gx, gy) = pinned_grid();
        let recon = GridReconstructor::new(grid.view(), &gx, &gy, 0.0).unwrap();
        // Target at (0, 0): both lookups match index 0 and clamp to 1, so the
        // first cell interpolates with t = u = 0 and returns the corner node.
        assert_relative_eq!(recon.value_at(0.0, 0.0), grid[[0, 0]], epsilon = 1e-12);
    }

    #[test]
    fn corner_weight_pairing_is_not_swapped() {
        // Asymmetric 2x2 grid; the value at (0.25 of the cell each way) pins
        // the exact corner/weight association.
        let grid = array![[1.0, 2.0], [4.0, 8.0]];
        let gx = vec![0.0, 1.0];
        let gy = vec![0.0, 1.0];
        let recon = GridReconstructor::new(grid.view(), &gx, &gy, 0.0).unwrap();
        let t = 0.25;
        let u = 0.75;
        let expected = (1.0 - t) * (1.0 - u) * 1.0 + t * (1.0 - u) * 2.0 + t * u * 8.0
            + (1.0 - t) * u * 4.0;
        assert_relative_eq!(recon.value_at(u, t), expected, epsilon = 1e-12);
    }

    #[test]
    fn dimension_mismatch_is_reported() {
        let grid = Array2::<f64>::zeros((2, 3));
        let gx = vec![0.0, 1.0];
        let gy = vec![0.0, 1.0];
        assert!(matches!(
            GridReconstructor::new(grid.view(), &gx, &gy, 0.0),
            Err(ReconstructError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn single_node_axis_is_rejected() {
        let grid = Array2::<f64>::zeros((1, 2));
        let gx = vec![0.0, 1.0];
        let gy = vec![0.0];
        assert!(matches!(
            GridReconstructor::new(grid.view(), &gx, &gy, 0.0),
            Err(ReconstructError::TooFewNodes { axis: "y", .. })
        ));
    }
}
