//! Data writers for tab-delimited coordinate and filament files.
//!
//! This module provides:
//! - [`CoordinateWriter`], a scoped writer for one per-micrograph coordinate file
//! - [`write_filaments_csv`] for exporting resampled filament points

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::processors::fitting::Filament;

/// Header of every per-micrograph coordinate file.
pub const COORDINATE_HEADER: [&str; 3] = ["x_coord", "y_coord", "score"];

/// Header of the filament export.
pub const FILAMENT_HEADER: [&str; 3] = ["label", "x", "y"];

/// Errors that can occur during write operations.
#[derive(Error, Debug)]
pub enum WriteError {
    /// Failed to create parent directories.
    #[error("failed to create parent directories for '{path}': {source}")]
    CreateDirectory {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to create or open file for writing.
    #[error("failed to create file '{path}': {source}")]
    CreateFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to write data to file.
    #[error("failed to write to file '{path}': {source}")]
    WriteFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// CSV writing error.
    #[error("CSV write error for '{path}': {source}")]
    CsvError {
        path: String,
        #[source]
        source: csv::Error,
    },
}

/// Result type for write operations.
pub type Result<T> = std::result::Result<T, WriteError>;

/// Creates parent directories for a file path if they don't exist.
pub(crate) fn ensure_parent_dirs(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| WriteError::CreateDirectory {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
    }
    Ok(())
}

/// Creates a tab-delimited CSV writer for the given path.
fn create_tsv_writer(path: &Path) -> Result<csv::Writer<BufWriter<File>>> {
    ensure_parent_dirs(path)?;
    let file = File::create(path).map_err(|e| WriteError::CreateFile {
        path: path.display().to_string(),
        source: e,
    })?;
    Ok(csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(BufWriter::new(file)))
}

/// Scoped writer for one per-micrograph coordinate file.
///
/// The header is written on creation. Call [`CoordinateWriter::finish`] to
/// flush and close the file; dropping the writer without finishing still
/// closes it but discards any flush error.
pub struct CoordinateWriter {
    path: PathBuf,
    writer: csv::Writer<BufWriter<File>>,
    rows: usize,
}

impl CoordinateWriter {
    /// Create (or truncate) `path` and write the coordinate header.
    pub fn create(path: &Path) -> Result<Self> {
        let mut writer = create_tsv_writer(path)?;
        writer
            .write_record(COORDINATE_HEADER)
            .map_err(|e| WriteError::CsvError {
                path: path.display().to_string(),
                source: e,
            })?;

        Ok(Self {
            path: path.to_path_buf(),
            writer,
            rows: 0,
        })
    }

    /// Append one particle row. Values are written exactly as given.
    pub fn write_row(&mut self, x: &str, y: &str, score: &str) -> Result<()> {
        self.writer
            .write_record([x, y, score])
            .map_err(|e| WriteError::CsvError {
                path: self.path.display().to_string(),
                source: e,
            })?;
        self.rows += 1;
        Ok(())
    }

    /// Path of the file being written.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of data rows written so far.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Flush and close the file, returning the number of data rows written.
    pub fn finish(mut self) -> Result<usize> {
        self.writer.flush().map_err(|e| WriteError::WriteFile {
            path: self.path.display().to_string(),
            source: e,
        })?;
        Ok(self.rows)
    }
}

/// Write resampled filament points to a tab-delimited file.
///
/// Creates a file with headers `label\tx\ty` and one row per resampled point,
/// grouped by filament in the given order.
///
/// # Arguments
///
/// * `path` - Output file path (parent directories will be created if needed)
/// * `filaments` - Traced filaments
///
/// # Errors
///
/// Returns an error if:
/// - Parent directories cannot be created
/// - File cannot be created or written to
pub fn write_filaments_csv(path: &Path, filaments: &[Filament]) -> Result<()> {
    let mut csv_writer = create_tsv_writer(path)?;
    let path_str = path.display().to_string();

    csv_writer
        .write_record(FILAMENT_HEADER)
        .map_err(|e| WriteError::CsvError {
            path: path_str.clone(),
            source: e,
        })?;

    for filament in filaments {
        for (x, y) in filament.x.iter().zip(filament.y.iter()) {
            csv_writer
                .write_record(&[
                    filament.label.to_string(),
                    format!("{:.3}", x),
                    format!("{:.3}", y),
                ])
                .map_err(|e| WriteError::CsvError {
                    path: path_str.clone(),
                    source: e,
                })?;
        }
    }

    csv_writer.flush().map_err(|e| WriteError::WriteFile {
        path: path_str,
        source: e,
    })?;

    Ok(())
}
