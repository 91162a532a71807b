//! Plain-text list and table formats for the forced-photometry batch.
//!
//! Three whitespace-delimited formats: the epoch list (`image gain` per
//! line), the alert-position list (`alert epoch pid ra dec x y` per line,
//! one row per compute unit in slot order), and the results table with the
//! legacy column header and status codes.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::photometry::{UnitError, UnitOutcome};

/// Flux columns of a failed unit carry this sentinel in the results table.
const MISSING_VALUE: f64 = -99999.0;

/// Errors from list and table parsing.
#[derive(Error, Debug)]
pub enum TableError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}:{line}: malformed record: {message}")]
    MalformedRecord {
        path: String,
        line: usize,
        message: String,
    },
    #[error("alert list has {rows} rows, not a multiple of {epochs} epochs")]
    RaggedAlertList { rows: usize, epochs: usize },
}

/// One epoch of the batch: a difference-image path and its detector gain.
#[derive(Debug, Clone)]
pub struct EpochEntry {
    pub image_path: PathBuf,
    pub gain: f64,
}

/// One compute unit from the alert-position list.
///
/// `alert` and `epoch` are the indices from the list; `x` and `y` are the
/// target position in zero-based native pixel coordinates on that epoch's
/// frame.
#[derive(Debug, Clone)]
pub struct AlertRecord {
    pub alert: usize,
    pub epoch: usize,
    pub pid: i64,
    pub ra: f64,
    pub dec: f64,
    pub x: f64,
    pub y: f64,
}

fn io_err(path: &Path, source: std::io::Error) -> TableError {
    TableError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn malformed(path: &Path, line: usize, message: impl Into<String>) -> TableError {
    TableError::MalformedRecord {
        path: path.display().to_string(),
        line,
        message: message.into(),
    }
}

/// Read the epoch list: one `image_path gain` pair per non-empty line.
pub fn read_epoch_list<P: AsRef<Path>>(path: P) -> Result<Vec<EpochEntry>, TableError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| io_err(path, e))?;
    let mut entries = Vec::new();

    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| io_err(path, e))?;
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }
        if fields.len() != 2 {
            return Err(malformed(
                path,
                idx + 1,
                format!("expected 'image gain', got {} fields", fields.len()),
            ));
        }
        let gain: f64 = fields[1]
            .parse()
            .map_err(|_| malformed(path, idx + 1, format!("bad gain '{}'", fields[1])))?;
        entries.push(EpochEntry {
            image_path: PathBuf::from(fields[0]),
            gain,
        });
    }
    Ok(entries)
}

/// Read the alert-position list: `alert epoch pid ra dec x y` per line.
///
/// Rows must arrive in slot order (`alert * num_epochs + epoch`) and the row
/// count must be a whole multiple of `num_epochs`.
pub fn read_alert_list<P: AsRef<Path>>(
    path: P,
    num_epochs: usize,
) -> Result<Vec<AlertRecord>, TableError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| io_err(path, e))?;
    let mut records = Vec::new();

    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| io_err(path, e))?;
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }
        if fields.len() != 7 {
            return Err(malformed(
                path,
                idx + 1,
                format!("expected 'alert epoch pid ra dec x y', got {} fields", fields.len()),
            ));
        }
        let parse_int = |field: &str| -> Result<i64, TableError> {
            field
                .parse()
                .map_err(|_| malformed(path, idx + 1, format!("bad integer '{field}'")))
        };
        let parse_float = |field: &str| -> Result<f64, TableError> {
            field
                .parse()
                .map_err(|_| malformed(path, idx + 1, format!("bad number '{field}'")))
        };
        records.push(AlertRecord {
            alert: parse_int(fields[0])? as usize,
            epoch: parse_int(fields[1])? as usize,
            pid: parse_int(fields[2])?,
            ra: parse_float(fields[3])?,
            dec: parse_float(fields[4])?,
            x: parse_float(fields[5])?,
            y: parse_float(fields[6])?,
        });
    }

    if num_epochs == 0 || records.len() % num_epochs != 0 {
        return Err(TableError::RaggedAlertList {
            rows: records.len(),
            epochs: num_epochs,
        });
    }
    Ok(records)
}

fn status_codes(outcome: &UnitOutcome) -> (i32, i32) {
    match outcome {
        Err(UnitError::OffImage) => (61, 0),
        Err(err) => (0, err.status_code()),
        Ok(result) => (0, result.warning.map_or(0, |w| w.status_code())),
    }
}

/// Write the per-unit results table.
///
/// `records` and `outcomes` are both in slot order. Failed units keep their
/// row with sentinel flux values; the two trailing status columns carry the
/// off-image code and the photometry error or warning code.
pub fn write_results_table<P: AsRef<Path>>(
    path: P,
    records: &[AlertRecord],
    outcomes: &[UnitOutcome],
) -> Result<(), TableError> {
    let path = path.as_ref();
    let file = File::create(path).map_err(|e| io_err(path, e))?;
    let mut out = BufWriter::new(file);

    let write = |out: &mut BufWriter<File>, text: String| -> Result<(), TableError> {
        out.write_all(text.as_bytes()).map_err(|e| io_err(path, e))
    };

    write(
        &mut out,
        "c k pid forcPhotFlux forcPhotFluxUnc forcPhotFluxSnr forcPhotFluxChisq \
         forcPhotApFlux forcPhotApFluxUnc forcPhotApFluxSnr forcPhotApFluxCorr \
         errstatus0 errstatus2\n"
            .to_string(),
    )?;

    for (record, outcome) in records.iter().zip(outcomes.iter()) {
        let (status0, status2) = status_codes(outcome);
        let values = match outcome {
            Ok(r) => [
                r.flux,
                r.flux_uncertainty,
                r.snr,
                r.chi_square,
                r.aperture_flux,
                r.aperture_flux_uncertainty,
                r.aperture_snr,
                r.aperture_correction,
            ],
            Err(_) => [MISSING_VALUE; 8],
        };
        write(
            &mut out,
            format!(
                "{} {} {} {:.6} {:.6} {:.6} {:.6} {:.6} {:.6} {:.6} {:.6} {} {}\n",
                record.alert,
                record.epoch,
                record.pid,
                values[0],
                values[1],
                values[2],
                values[3],
                values[4],
                values[5],
                values[6],
                values[7],
                status0,
                status2
            ),
        )?;
    }
    out.flush().map_err(|e| io_err(path, e))
}
