//! Numerical building blocks shared by the pipelines.

pub mod bilinear;
pub mod stats;
