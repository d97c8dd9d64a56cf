//! Loaders for per-micrograph particle coordinate files.
//!
//! A coordinate file is tab-delimited with a header row containing at least
//! the `x_coord`, `y_coord` and `score` columns, as written by the splitter:
//!
//! ```text
//! x_coord	y_coord	score
//! 1021	388	-1.73
//! ```
//!
//! A directory of such files is loaded into a [`FileLibrary`], keyed by file
//! name, after dropping rows whose score falls below a threshold.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use csv::ReaderBuilder;
use thiserror::Error;

/// Column holding the particle x coordinate.
pub const X_COLUMN: &str = "x_coord";

/// Column holding the particle y coordinate.
pub const Y_COLUMN: &str = "y_coord";

/// Column holding the picker confidence score.
pub const SCORE_COLUMN: &str = "score";

/// Errors that can occur during file loading.
#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Directory not found: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("Missing required columns in {path}: {columns}")]
    MissingColumns { path: PathBuf, columns: String },

    #[error("Parse error: {0}")]
    ParseError(String),
}

/// Result type for loader operations.
pub type Result<T> = std::result::Result<T, LoaderError>;

/// One picked particle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoordinateRecord {
    pub x: f64,
    pub y: f64,
    pub score: f64,
}

/// Index-aligned x/y coordinate arrays for one micrograph.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoordinateSet {
    /// X coordinates of all particles.
    pub x: Vec<f64>,
    /// Y coordinates of all particles.
    pub y: Vec<f64>,
}

impl CoordinateSet {
    /// Creates a new empty coordinate set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new coordinate set with pre-allocated capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            x: Vec::with_capacity(capacity),
            y: Vec::with_capacity(capacity),
        }
    }

    /// Builds a coordinate set from `[x, y]` pairs.
    pub fn from_points(points: &[[f64; 2]]) -> Self {
        let mut set = Self::with_capacity(points.len());
        for p in points {
            set.push(p[0], p[1]);
        }
        set
    }

    /// Returns the number of particles.
    #[inline]
    pub fn len(&self) -> usize {
        self.x.len()
    }

    /// Returns true if there are no particles.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// Adds a particle.
    #[inline]
    pub fn push(&mut self, x: f64, y: f64) {
        self.x.push(x);
        self.y.push(y);
    }

    /// Stacks the arrays into an N x 2 list of `[x, y]` points.
    pub fn to_points(&self) -> Vec<[f64; 2]> {
        self.x
            .iter()
            .zip(self.y.iter())
            .map(|(&x, &y)| [x, y])
            .collect()
    }
}

/// Mapping from file name to the coordinates retained from that file.
pub type FileLibrary = BTreeMap<String, CoordinateSet>;

/// Read every record of a coordinate file, without score filtering.
pub fn read_coordinate_records<P: AsRef<Path>>(path: P) -> Result<Vec<CoordinateRecord>> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let mut reader = ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .flexible(true)
        .from_reader(BufReader::new(file));

    let headers = reader.headers()?.clone();
    let col_map: HashMap<&str, usize> = headers
        .iter()
        .enumerate()
        .map(|(i, name)| (name.trim(), i))
        .collect();

    let missing: Vec<&str> = [X_COLUMN, Y_COLUMN, SCORE_COLUMN]
        .into_iter()
        .filter(|c| !col_map.contains_key(c))
        .collect();
    if !missing.is_empty() {
        return Err(LoaderError::MissingColumns {
            path: path.to_path_buf(),
            columns: missing.join(", "),
        });
    }

    let x_idx = col_map[X_COLUMN];
    let y_idx = col_map[Y_COLUMN];
    let score_idx = col_map[SCORE_COLUMN];

    let mut records = Vec::new();
    for result in reader.records() {
        let record = result?;
        if record.iter().all(|field| field.trim().is_empty()) {
            continue;
        }

        let line = record.position().map_or(0, |p| p.line());
        let parse = |idx: usize, name: &str| -> Result<f64> {
            let raw = record.get(idx).unwrap_or("").trim();
            raw.parse::<f64>().map_err(|_| {
                LoaderError::ParseError(format!(
                    "{}:{}: invalid {} value '{}'",
                    path.display(),
                    line,
                    name,
                    raw
                ))
            })
        };

        records.push(CoordinateRecord {
            x: parse(x_idx, X_COLUMN)?,
            y: parse(y_idx, Y_COLUMN)?,
            score: parse(score_idx, SCORE_COLUMN)?,
        });
    }

    Ok(records)
}

/// Load one coordinate file, dropping rows whose score is below `threshold`.
///
/// # Arguments
///
/// * `path` - Path to a tab-delimited coordinate file
/// * `threshold` - Minimum score to keep; rows with `score < threshold` are dropped
///
/// # Returns
///
/// A `CoordinateSet` with the retained x/y values in file order. A file whose
/// rows are all below the threshold yields an empty set.
///
/// # Errors
///
/// Returns an error if the file cannot be read, lacks a required column, or
/// contains a non-numeric coordinate or score.
pub fn load_coordinate_file<P: AsRef<Path>>(path: P, threshold: f64) -> Result<CoordinateSet> {
    let records = read_coordinate_records(path)?;

    let mut coords = CoordinateSet::with_capacity(records.len());
    for record in records.iter().filter(|r| r.score >= threshold) {
        coords.push(record.x, record.y);
    }

    Ok(coords)
}

/// Whether a directory entry should be loaded as a coordinate file.
///
/// Accepts regular files with the given extension (case-insensitive) whose
/// name does not start with a dot.
pub fn is_coordinate_file(path: &Path, extension: &str) -> bool {
    let hidden = path
        .file_name()
        .and_then(|n| n.to_str())
        .map_or(true, |n| n.starts_with('.'));

    !hidden
        && path.is_file()
        && path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case(extension))
            .unwrap_or(false)
}

/// Load every coordinate file in a directory into a file library.
///
/// # Arguments
///
/// * `dir` - Directory containing per-micrograph coordinate files
/// * `threshold` - Minimum score to keep (default in config: -2.5)
/// * `extension` - Extension identifying coordinate files (e.g. `txt`)
///
/// # Returns
///
/// A `FileLibrary` keyed by file name (including extension), sorted
/// lexicographically.
///
/// # Errors
///
/// Returns an error if the directory does not exist or any coordinate file
/// fails to load.
pub fn load_file_library<P: AsRef<Path>>(
    dir: P,
    threshold: f64,
    extension: &str,
) -> Result<FileLibrary> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Err(LoaderError::DirectoryNotFound(dir.to_path_buf()));
    }

    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| is_coordinate_file(path, extension))
        .collect();
    paths.sort();

    let mut library = FileLibrary::new();
    for path in paths {
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => {
                log::warn!("Skipping non UTF-8 file name: {}", path.display());
                continue;
            }
        };

        let coords = load_coordinate_file(&path, threshold)?;
        log::debug!("{}: {} particles retained", name, coords.len());
        library.insert(name, coords);
    }

    log::info!(
        "Loaded {} coordinate files from {}",
        library.len(),
        dir.display()
    );

    Ok(library)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{tempdir, NamedTempFile};

    fn write_coordinate_file(path: &Path, rows: &[(f64, f64, f64)]) {
        let mut file = File::create(path).unwrap();
        writeln!(file, "x_coord\ty_coord\tscore").unwrap();
        for (x, y, s) in rows {
            writeln!(file, "{}\t{}\t{}", x, y, s).unwrap();
        }
    }

    #[test]
    fn test_coordinate_set_operations() {
        let mut coords = CoordinateSet::new();
        assert!(coords.is_empty());

        coords.push(1.0, 2.0);
        coords.push(3.0, 4.0);

        assert_eq!(coords.len(), 2);
        assert_eq!(coords.to_points(), vec![[1.0, 2.0], [3.0, 4.0]]);
        assert_eq!(CoordinateSet::from_points(&coords.to_points()), coords);
    }

    #[test]
    fn test_threshold_drops_low_scores() -> Result<()> {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "x_coord\ty_coord\tscore").unwrap();
        writeln!(file, "10\t11\t-3.0").unwrap();
        writeln!(file, "20\t21\t-2.0").unwrap();
        writeln!(file, "30\t31\t-1.0").unwrap();
        file.flush().unwrap();

        let coords = load_coordinate_file(file.path(), -2.5)?;
        assert_eq!(coords.x, vec![20.0, 30.0]);
        assert_eq!(coords.y, vec![21.0, 31.0]);

        Ok(())
    }

    #[test]
    fn test_score_equal_to_threshold_is_kept() -> Result<()> {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "x_coord\ty_coord\tscore").unwrap();
        writeln!(file, "1\t2\t-2.5").unwrap();
        writeln!(file, "3\t4\t-2.5000001").unwrap();
        file.flush().unwrap();

        let coords = load_coordinate_file(file.path(), -2.5)?;
        assert_eq!(coords.len(), 1);
        assert_eq!(coords.x[0], 1.0);

        Ok(())
    }

    #[test]
    fn test_columns_located_by_header() -> Result<()> {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "score\ty_coord\tx_coord").unwrap();
        writeln!(file, "0.5\t7\t9").unwrap();
        file.flush().unwrap();

        let coords = load_coordinate_file(file.path(), -2.5)?;
        assert_eq!(coords.x, vec![9.0]);
        assert_eq!(coords.y, vec![7.0]);

        Ok(())
    }

    #[test]
    fn test_missing_column_is_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "x_coord\ty_coord").unwrap();
        writeln!(file, "1\t2").unwrap();
        file.flush().unwrap();

        match load_coordinate_file(file.path(), -2.5) {
            Err(LoaderError::MissingColumns { columns, .. }) => assert_eq!(columns, "score"),
            other => panic!("Expected MissingColumns, got {:?}", other),
        }
    }

    #[test]
    fn test_non_numeric_value_is_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "x_coord\ty_coord\tscore").unwrap();
        writeln!(file, "1\tabc\t0.1").unwrap();
        file.flush().unwrap();

        let err = load_coordinate_file(file.path(), -2.5).unwrap_err();
        assert!(matches!(err, LoaderError::ParseError(_)));
        assert!(err.to_string().contains(":2:"));
    }

    #[test]
    fn test_parse_error_line_counts_blank_lines() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "x_coord\ty_coord\tscore").unwrap();
        writeln!(file, "1\t2\t0.1").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "3\tnan?\t0.1").unwrap();
        file.flush().unwrap();

        let err = load_coordinate_file(file.path(), -2.5).unwrap_err();
        assert!(err.to_string().contains(":4: invalid y_coord"));
    }

    #[test]
    fn test_load_file_library_filters_entries() -> Result<()> {
        let dir = tempdir().unwrap();
        write_coordinate_file(&dir.path().join("b.txt"), &[(1.0, 1.0, 0.0), (2.0, 2.0, -5.0)]);
        write_coordinate_file(&dir.path().join("a.txt"), &[(5.0, 6.0, -1.0)]);
        write_coordinate_file(&dir.path().join(".DS_Store.txt"), &[(9.0, 9.0, 0.0)]);
        fs::write(dir.path().join("notes.md"), "not coordinates").unwrap();
        fs::create_dir(dir.path().join("nested.txt")).unwrap();

        let library = load_file_library(dir.path(), -2.5, "txt")?;

        let names: Vec<&String> = library.keys().collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
        assert_eq!(library["a.txt"].x, vec![5.0]);
        assert_eq!(library["b.txt"].x, vec![1.0]);

        Ok(())
    }

    #[test]
    fn test_load_file_library_missing_directory() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope");

        let result = load_file_library(&missing, -2.5, "txt");
        assert!(matches!(result, Err(LoaderError::DirectoryNotFound(_))));
    }
}
