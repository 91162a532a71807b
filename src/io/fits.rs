//! FITS reading and writing for image cubes, masks, and derived products.
//!
//! Images arrive as the first image HDU of a FITS file, either a single 2-D
//! plane or a 3-D cube. Masks must be a single plane. Output products are
//! written as named image extensions.

use fitsio::hdu::HduInfo;
use fitsio::images::{ImageDescription, ImageType};
use fitsio::FitsFile;
use ndarray::{Array2, Array3, ArrayView2, ArrayView3};
use std::path::Path;
use thiserror::Error;

use crate::image_proc::{ImageCube, MaskPlane};

/// Errors from FITS file operations.
#[derive(Error, Debug)]
pub enum FitsError {
    #[error("FITS I/O error: {0}")]
    FitsIo(#[from] fitsio::errors::Error),
    #[error("no 2-D or 3-D image HDU found in {path}")]
    NoImageData { path: String },
    #[error("mask in {path} has {planes} data planes, expected exactly 1")]
    TooManyDataPlanes { path: String, planes: usize },
    #[error("image data in {path} does not match its declared dimensions")]
    ShapeMismatch { path: String },
}

struct RawImage {
    data: Vec<f64>,
    /// Row-major shape: `[height, width]` or `[frames, height, width]`.
    shape: Vec<usize>,
}

/// Read the first 2-D or 3-D image HDU. The primary HDU may be an empty
/// placeholder, so the scan walks forward until image data appears.
fn read_first_image<P: AsRef<Path>>(path: P) -> Result<RawImage, FitsError> {
    let display = path.as_ref().display().to_string();
    let mut fptr = FitsFile::open(&path)?;

    let mut hdu_idx = 0;
    while let Ok(hdu) = fptr.hdu(hdu_idx) {
        if let HduInfo::ImageInfo { shape, .. } = &hdu.info {
            if shape.len() == 2 || shape.len() == 3 {
                let shape = shape.clone();
                let data: Vec<f64> = hdu.read_image(&mut fptr)?;
                if data.len() != shape.iter().product::<usize>() {
                    return Err(FitsError::ShapeMismatch { path: display });
                }
                return Ok(RawImage { data, shape });
            }
        }
        hdu_idx += 1;
    }
    Err(FitsError::NoImageData { path: display })
}

/// Read a FITS file as an image cube.
///
/// A 2-D image becomes a single-frame cube; a 3-D image keeps its plane
/// count.
pub fn read_image_cube<P: AsRef<Path>>(path: P) -> Result<ImageCube, FitsError> {
    let display = path.as_ref().display().to_string();
    let raw = read_first_image(&path)?;
    match raw.shape.as_slice() {
        [height, width] => {
            let frame = Array2::from_shape_vec((*height, *width), raw.data)
                .map_err(|_| FitsError::ShapeMismatch { path: display })?;
            Ok(ImageCube::from_frame(frame))
        }
        [frames, height, width] => {
            let cube = Array3::from_shape_vec((*frames, *height, *width), raw.data)
                .map_err(|_| FitsError::ShapeMismatch { path: display })?;
            Ok(ImageCube::new(cube))
        }
        _ => unreachable!("axis count checked while reading"),
    }
}

/// Read a mask file as a single plane of integer flag words.
///
/// A 3-D mask with more than one plane is rejected; the one plane applies to
/// every frame of the image it accompanies.
pub fn read_mask_plane<P: AsRef<Path>>(path: P, mask_bits: i32) -> Result<MaskPlane, FitsError> {
    let display = path.as_ref().display().to_string();
    let raw = read_first_image(&path)?;
    let (height, width) = match raw.shape.as_slice() {
        [height, width] => (*height, *width),
        [frames, height, width] => {
            if *frames != 1 {
                return Err(FitsError::TooManyDataPlanes {
                    path: display,
                    planes: *frames,
                });
            }
            (*height, *width)
        }
        _ => unreachable!("axis count checked while reading"),
    };

    let words: Vec<i32> = raw.data.iter().map(|&v| v as i32).collect();
    let plane = Array2::from_shape_vec((height, width), words)
        .map_err(|_| FitsError::ShapeMismatch { path: display })?;
    Ok(MaskPlane::new(plane, mask_bits))
}

/// Write a 2-D image as a named f64 extension of a new FITS file.
pub fn write_image<P: AsRef<Path>>(
    image: &ArrayView2<'_, f64>,
    name: &str,
    path: P,
) -> Result<(), FitsError> {
    let mut fptr = FitsFile::create(&path).overwrite().open()?;
    let (height, width) = image.dim();
    let dimensions = [height, width];
    let description = ImageDescription {
        data_type: ImageType::Double,
        dimensions: &dimensions,
    };
    let hdu = fptr.create_image(name.to_string(), &description)?;
    let flat: Vec<f64> = image.iter().copied().collect();
    hdu.write_image(&mut fptr, &flat)?;
    Ok(())
}

/// Write a 3-D cube as a named f64 extension of a new FITS file.
pub fn write_cube<P: AsRef<Path>>(
    cube: &ArrayView3<'_, f64>,
    name: &str,
    path: P,
) -> Result<(), FitsError> {
    let mut fptr = FitsFile::create(&path).overwrite().open()?;
    let (frames, height, width) = cube.dim();
    let dimensions = [frames, height, width];
    let description = ImageDescription {
        data_type: ImageType::Double,
        dimensions: &dimensions,
    };
    let hdu = fptr.create_image(name.to_string(), &description)?;
    let flat: Vec<f64> = cube.iter().copied().collect();
    hdu.write_image(&mut fptr, &flat)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{Array2, Array3};
    use tempfile::tempdir;

    #[test]
    fn image_roundtrip_preserves_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("frame.fits");

        let mut image = Array2::zeros((7, 9));
        image[[0, 0]] = 1.25;
        image[[3, 4]] = -17.5;
        image[[6, 8]] = 1e6;

        write_image(&image.view(), "IMAGE", &path).unwrap();
        let cube = read_image_cube(&path).unwrap();

        assert_eq!(cube.frames(), 1);
        assert_eq!((cube.height(), cube.width()), (7, 9));
        assert_relative_eq!(cube.get(0, 0, 0), 1.25);
        assert_relative_eq!(cube.get(0, 3, 4), -17.5);
        assert_relative_eq!(cube.get(0, 6, 8), 1e6);
    }

    #[test]
    fn cube_roundtrip_preserves_frame_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cube.fits");

        let cube = Array3::from_shape_fn((3, 4, 5), |(f, r, c)| (f * 100 + r * 10 + c) as f64);
        write_cube(&cube.view(), "CUBE", &path).unwrap();
        let read = read_image_cube(&path).unwrap();

        assert_eq!(read.frames(), 3);
        assert_eq!((read.height(), read.width()), (4, 5));
        assert_relative_eq!(read.get(2, 3, 4), 234.0);
        assert_relative_eq!(read.get(0, 1, 2), 12.0);
    }

    #[test]
    fn single_plane_mask_is_accepted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mask.fits");

        let mut mask = Array2::zeros((6, 6));
        mask[[2, 3]] = 4.0;
        write_image(&mask.view(), "MASK", &path).unwrap();

        let plane = read_mask_plane(&path, 0b0100).unwrap();
        assert_eq!(plane.dim(), (6, 6));
        assert!(plane.is_masked(2, 3));
        assert!(!plane.is_masked(0, 0));
    }

    #[test]
    fn multi_plane_mask_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mask3d.fits");

        let cube = Array3::<f64>::zeros((2, 6, 6));
        write_cube(&cube.view(), "MASK", &path).unwrap();

        let err = read_mask_plane(&path, 1).unwrap_err();
        assert!(matches!(
            err,
            FitsError::TooManyDataPlanes { planes: 2, .. }
        ));
    }
}
