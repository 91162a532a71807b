//! Background estimation and forced photometry for astronomical image data.
//!
//! Two pipelines share this crate:
//!
//! - [`background`]: grid-based robust background estimation over FITS image
//!   cubes, with sigma-clipped statistics sampled on a coarse grid and
//!   bilinearly reconstructed at full resolution.
//! - [`photometry`]: forced PSF-fit and aperture photometry of transient
//!   candidates across difference-image epochs, parallelized over a flat
//!   batch of (alert, epoch) compute units.
//!
//! The `bkgest` and `forcedphot` binaries wrap one pipeline each.

pub mod algo;
pub mod background;
pub mod config;
pub mod image_proc;
pub mod io;
pub mod photometry;
