//! Split a combined particle-pick export into per-micrograph coordinate files.
//!
//! The input is tab-delimited with a header row and columns
//! `title, x, y, score, ...`, grouped by title (e.g. the Topaz `extract`
//! output, where the title is the micrograph name). Each contiguous run of
//! rows sharing a title is written to `<title>.txt` in the output directory
//! with the header `x_coord\ty_coord\tscore`.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use csv::ReaderBuilder;
use thiserror::Error;

use crate::core::writers::{CoordinateWriter, WriteError};

/// Errors that can occur while splitting an export.
#[derive(Debug, Error)]
pub enum SplitError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error("line {line}: expected at least 4 columns, found {found}")]
    MalformedRow { line: u64, found: usize },

    #[error("line {line}: invalid {column} value '{value}'")]
    InvalidNumber {
        line: u64,
        column: &'static str,
        value: String,
    },

    #[error("line {line}: title '{title}' cannot be used as a file name")]
    InvalidTitle { line: u64, title: String },
}

/// Result type for splitting operations.
pub type Result<T> = std::result::Result<T, SplitError>;

/// Outcome of a split run.
#[derive(Debug, Clone, Default)]
pub struct SplitSummary {
    /// Distinct files written, in the order they were first opened.
    pub files: Vec<PathBuf>,
    /// Number of data rows copied.
    pub rows: usize,
}

/// Output file currently receiving rows.
struct OpenGroup {
    title: String,
    writer: CoordinateWriter,
}

impl OpenGroup {
    fn close(self) -> Result<()> {
        let rows = self.writer.finish()?;
        log::debug!("{}: wrote {} rows", self.title, rows);
        Ok(())
    }
}

fn validate_title(title: &str, line: u64) -> Result<()> {
    let invalid = title.is_empty()
        || title == "."
        || title == ".."
        || title.contains('/')
        || title.contains('\\');
    if invalid {
        return Err(SplitError::InvalidTitle {
            line,
            title: title.to_string(),
        });
    }
    Ok(())
}

fn validate_number(value: &str, column: &'static str, line: u64) -> Result<()> {
    value
        .trim()
        .parse::<f64>()
        .map(|_| ())
        .map_err(|_| SplitError::InvalidNumber {
            line,
            column,
            value: value.to_string(),
        })
}

/// Split a combined coordinate export into one file per title.
///
/// The header line is skipped. Whenever the title column changes, the open
/// output file is flushed and closed and `<title>.txt` is created in
/// `output_dir`. The x, y and score fields are copied verbatim. A title that
/// reappears after a different title reopens (and overwrites) its file.
///
/// # Arguments
///
/// * `input` - Tab-delimited export with columns `title, x, y, score, ...`
/// * `output_dir` - Directory receiving the per-title files (created if missing)
///
/// # Returns
///
/// A `SplitSummary` listing the files written and the number of rows copied.
///
/// # Errors
///
/// Returns an error if the input cannot be read, a row has fewer than four
/// columns or a non-numeric coordinate/score, a title is not a valid file
/// name, or an output file cannot be written.
pub fn split_coordinates<P: AsRef<Path>, Q: AsRef<Path>>(
    input: P,
    output_dir: Q,
) -> Result<SplitSummary> {
    let input = input.as_ref();
    let output_dir = output_dir.as_ref();

    fs::create_dir_all(output_dir)?;

    let file = File::open(input)?;
    let mut reader = ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .flexible(true)
        .from_reader(BufReader::new(file));

    let mut summary = SplitSummary::default();
    let mut seen: HashSet<String> = HashSet::new();
    let mut current: Option<OpenGroup> = None;

    for result in reader.records() {
        let record = result?;
        let line = record.position().map_or(0, |p| p.line());

        if record.len() < 4 {
            return Err(SplitError::MalformedRow {
                line,
                found: record.len(),
            });
        }

        let title = record[0].trim();
        let (x, y, score) = (record[1].trim(), record[2].trim(), record[3].trim());
        validate_number(x, "x", line)?;
        validate_number(y, "y", line)?;
        validate_number(score, "score", line)?;

        let same_group = current.as_ref().map_or(false, |g| g.title == title);
        if !same_group {
            if let Some(group) = current.take() {
                group.close()?;
            }

            validate_title(title, line)?;
            let path = output_dir.join(format!("{}.txt", title));
            if seen.insert(title.to_string()) {
                summary.files.push(path.clone());
            } else {
                log::warn!(
                    "line {}: title '{}' reappears after another title, overwriting {}",
                    line,
                    title,
                    path.display()
                );
            }

            current = Some(OpenGroup {
                title: title.to_string(),
                writer: CoordinateWriter::create(&path)?,
            });
        }

        if let Some(group) = current.as_mut() {
            group.writer.write_row(x, y, score)?;
        }
        summary.rows += 1;
    }

    if let Some(group) = current.take() {
        group.close()?;
    }

    log::info!(
        "{}: split {} rows into {} files",
        input.display(),
        summary.rows,
        summary.files.len()
    );

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{tempdir, NamedTempFile};

    fn export(lines: &[&str]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "image_name\tx_coord\ty_coord\tscore").unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        file.flush().unwrap();
        file
    }

    fn data_lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_split_two_titles() {
        let input = export(&["A\t1\t2\t-1.0", "A\t3\t4\t-2.0", "B\t5\t6\t0.5"]);
        let out = tempdir().unwrap();

        let summary = split_coordinates(input.path(), out.path()).unwrap();

        assert_eq!(summary.rows, 3);
        assert_eq!(
            summary.files,
            vec![out.path().join("A.txt"), out.path().join("B.txt")]
        );
        assert_eq!(
            data_lines(&out.path().join("A.txt")),
            vec!["x_coord\ty_coord\tscore", "1\t2\t-1.0", "3\t4\t-2.0"]
        );
        assert_eq!(
            data_lines(&out.path().join("B.txt")),
            vec!["x_coord\ty_coord\tscore", "5\t6\t0.5"]
        );
    }

    #[test]
    fn test_split_preserves_text_and_ignores_extra_columns() {
        let input = export(&["mic\t1.50\t2.000\t-0.10\textra", "mic\t7\t8\t9"]);
        let out = tempdir().unwrap();

        split_coordinates(input.path(), out.path()).unwrap();

        assert_eq!(
            data_lines(&out.path().join("mic.txt")),
            vec!["x_coord\ty_coord\tscore", "1.50\t2.000\t-0.10", "7\t8\t9"]
        );
    }

    #[test]
    fn test_non_contiguous_title_overwrites() {
        let input = export(&["A\t1\t1\t0", "B\t2\t2\t0", "A\t3\t3\t0"]);
        let out = tempdir().unwrap();

        let summary = split_coordinates(input.path(), out.path()).unwrap();

        assert_eq!(summary.files.len(), 2);
        assert_eq!(summary.rows, 3);
        assert_eq!(
            data_lines(&out.path().join("A.txt")),
            vec!["x_coord\ty_coord\tscore", "3\t3\t0"]
        );
    }

    #[test]
    fn test_creates_output_directory() {
        let input = export(&["A\t1\t1\t0"]);
        let out = tempdir().unwrap();
        let nested = out.path().join("helix").join("coords");

        split_coordinates(input.path(), &nested).unwrap();

        assert!(nested.join("A.txt").exists());
    }

    #[test]
    fn test_short_row_is_error() {
        let input = export(&["A\t1\t2\t0", "A\t1\t2"]);
        let out = tempdir().unwrap();

        match split_coordinates(input.path(), out.path()) {
            Err(SplitError::MalformedRow { line, found }) => {
                assert_eq!(line, 3);
                assert_eq!(found, 3);
            }
            other => panic!("Expected MalformedRow, got {:?}", other),
        }
    }

    #[test]
    fn test_non_numeric_score_is_error() {
        let input = export(&["A\t1\t2\thigh"]);
        let out = tempdir().unwrap();

        let err = split_coordinates(input.path(), out.path()).unwrap_err();
        assert!(matches!(
            err,
            SplitError::InvalidNumber { column: "score", .. }
        ));
    }

    #[test]
    fn test_path_like_title_is_rejected() {
        let input = export(&["../escape\t1\t2\t0"]);
        let out = tempdir().unwrap();

        let err = split_coordinates(input.path(), out.path()).unwrap_err();
        assert!(matches!(err, SplitError::InvalidTitle { .. }));
    }

    #[test]
    fn test_header_only_writes_nothing() {
        let input = export(&[]);
        let out = tempdir().unwrap();

        let summary = split_coordinates(input.path(), out.path()).unwrap();

        assert_eq!(summary.rows, 0);
        assert!(summary.files.is_empty());
        assert_eq!(fs::read_dir(out.path()).unwrap().count(), 0);
    }
}
