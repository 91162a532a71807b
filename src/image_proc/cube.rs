//! Owned image and mask containers with `(frame, row, col)` indexing.
//!
//! The pipelines never touch flattened offsets: every pixel access goes
//! through bounds-checked ndarray indexing on these types. Images are read
//! once, held immutable through a run, and dropped after the derived products
//! exist.

use ndarray::{Array2, Array3, ArrayView2};

use crate::algo::stats::is_invalid;
use crate::config::PlaneSelection;

/// A 2-D image or 3-D cube of f64 samples, indexed `[frame][row][col]`.
#[derive(Debug, Clone)]
pub struct ImageCube {
    data: Array3<f64>,
}

impl ImageCube {
    pub fn new(data: Array3<f64>) -> Self {
        Self { data }
    }

    /// Build a single-frame cube from a 2-D array.
    pub fn from_frame(frame: Array2<f64>) -> Self {
        let (h, w) = frame.dim();
        Self {
            data: frame.into_shape_with_order((1, h, w)).expect("same length"),
        }
    }

    pub fn frames(&self) -> usize {
        self.data.dim().0
    }

    pub fn height(&self) -> usize {
        self.data.dim().1
    }

    pub fn width(&self) -> usize {
        self.data.dim().2
    }

    #[inline]
    pub fn get(&self, frame: usize, row: usize, col: usize) -> f64 {
        self.data[[frame, row, col]]
    }

    pub fn frame(&self, frame: usize) -> ArrayView2<'_, f64> {
        self.data.index_axis(ndarray::Axis(0), frame)
    }

    /// Frame index range selected by the data-plane configuration.
    ///
    /// Restricting to one plane means downstream products are sized for a
    /// single frame, not the original frame count.
    pub fn selected_frames(&self, plane: PlaneSelection) -> std::ops::Range<usize> {
        match plane {
            PlaneSelection::All => 0..self.frames(),
            PlaneSelection::First => 0..1,
            PlaneSelection::Last => self.frames() - 1..self.frames(),
        }
    }
}

/// A single-plane mask of integer flag words.
///
/// A pixel is bad via mask when `(mask & mask_bits) != 0`. The same plane
/// applies to every frame of the image cube.
#[derive(Debug, Clone)]
pub struct MaskPlane {
    data: Array2<i32>,
    mask_bits: i32,
}

impl MaskPlane {
    pub fn new(data: Array2<i32>, mask_bits: i32) -> Self {
        Self { data, mask_bits }
    }

    pub fn dim(&self) -> (usize, usize) {
        self.data.dim()
    }

    #[inline]
    pub fn is_masked(&self, row: usize, col: usize) -> bool {
        (self.data[[row, col]] & self.mask_bits) != 0
    }
}

/// Mirror an index into `[0, len)` by whole-array reflection.
///
/// Below zero reflects to `-idx`; at or above `len` reflects to
/// `2 * len - idx - 2`. Near-edge windows borrow from across the image rather
/// than from a padded copy.
#[inline]
pub fn reflect_index(idx: isize, len: usize) -> usize {
    let len = len as isize;
    let reflected = if idx < 0 {
        -idx
    } else if idx >= len {
        2 * len - idx - 2
    } else {
        idx
    };
    reflected as usize
}

/// Classify one pixel against mask, finiteness, and the pothole threshold.
///
/// Order matters: a masked pixel is bad regardless of its value; an unmasked
/// non-finite pixel is bad; an unmasked finite pixel at or below the pothole
/// threshold is bad.
#[inline]
pub fn pixel_is_bad(value: f64, masked: bool, pothole: f64) -> bool {
    if masked {
        return true;
    }
    if is_invalid(value) {
        return true;
    }
    value <= pothole
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn reflection_matches_the_mirror_formulas() {
        // 5-wide axis: -1 -> 1, -2 -> 2, 5 -> 3, 6 -> 2.
        assert_eq!(reflect_index(-1, 5), 1);
        assert_eq!(reflect_index(-2, 5), 2);
        assert_eq!(reflect_index(5, 5), 3);
        assert_eq!(reflect_index(6, 5), 2);
        assert_eq!(reflect_index(0, 5), 0);
        assert_eq!(reflect_index(4, 5), 4);
    }

    #[test]
    fn plane_selection_ranges() {
        let cube = ImageCube::new(Array3::zeros((4, 8, 8)));
        assert_eq!(cube.selected_frames(PlaneSelection::All), 0..4);
        assert_eq!(cube.selected_frames(PlaneSelection::First), 0..1);
        assert_eq!(cube.selected_frames(PlaneSelection::Last), 3..4);
    }

    #[test]
    fn bad_pixel_classification_order() {
        let pothole = -1000.0;
        assert!(pixel_is_bad(123.0, true, pothole));
        assert!(pixel_is_bad(f64::NAN, false, pothole));
        assert!(pixel_is_bad(f64::INFINITY, false, pothole));
        assert!(pixel_is_bad(-2000.0, false, pothole));
        assert!(!pixel_is_bad(0.0, false, pothole));
        assert!(!pixel_is_bad(123.0, false, pothole));
    }

    #[test]
    fn mask_bits_select_flagged_pixels() {
        let mut mask = Array2::zeros((2, 2));
        mask[[0, 1]] = 0b0100;
        mask[[1, 0]] = 0b0010;
        let plane = MaskPlane::new(mask, 0b0100);
        assert!(plane.is_masked(0, 1));
        assert!(!plane.is_masked(1, 0));
        assert!(!plane.is_masked(0, 0));
    }
}
