//! FITS and plain-text I/O for the pipelines.

pub mod fits;
pub mod tables;

pub use fits::{read_image_cube, read_mask_plane, write_cube, write_image, FitsError};
pub use tables::{
    read_alert_list, read_epoch_list, write_results_table, AlertRecord, EpochEntry, TableError,
};
