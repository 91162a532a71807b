//! Image containers and pixel-sampling utilities.

pub mod cube;
pub mod sampler;

pub use cube::{ImageCube, MaskPlane};
pub use sampler::{sample_frame, sample_window, SampleGrid, WindowSample};
