//! Command-line interface for the filament pipeline.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::config::{ClusteringConfig, FittingConfig};
use crate::core::loaders::{self, CoordinateSet};
use crate::visualization::Figure;
use crate::PipelineConfig;

#[derive(Parser)]
#[command(name = "filament-pipeline")]
#[command(about = "Particle coordinate clustering and filament tracing", version)]
pub struct Cli {
    /// Path to YAML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Split a combined pick export into one coordinate file per micrograph
    Split {
        /// Tab-delimited export with columns title, x, y, score
        input: PathBuf,
        /// Directory receiving <title>.txt files
        output_dir: PathBuf,
    },

    /// Load a directory of coordinate files and report retained particles
    Load {
        /// Directory containing coordinate files
        directory: PathBuf,
        /// Minimum particle score
        #[arg(short, long, allow_negative_numbers = true)]
        threshold: Option<f64>,
    },

    /// Plot the raw coordinates of one micrograph
    Show {
        /// Directory containing coordinate files
        directory: PathBuf,
        /// Coordinate file name within the directory
        file: String,
        /// Output image (defaults to <file stem>.png next to the input)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Minimum particle score
        #[arg(short, long, allow_negative_numbers = true)]
        threshold: Option<f64>,
    },

    /// Run DBSCAN on one micrograph and plot the clusters
    Cluster {
        /// Directory containing coordinate files
        directory: PathBuf,
        /// Coordinate file name within the directory
        file: String,
        /// Output image (defaults to <file stem>_clusters.png next to the input)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Minimum particle score
        #[arg(short, long, allow_negative_numbers = true)]
        threshold: Option<f64>,
        /// Neighborhood radius
        #[arg(long)]
        eps: Option<f64>,
        /// Minimum neighborhood size for a core point
        #[arg(long)]
        min_samples: Option<usize>,
    },

    /// Cluster, fit and resample filaments for one or all micrographs
    Trace {
        /// Directory containing coordinate files
        directory: PathBuf,
        /// Only trace this coordinate file
        #[arg(short, long)]
        file: Option<String>,
        /// Output directory for figures (defaults to the input directory)
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
        /// Minimum particle score
        #[arg(short, long, allow_negative_numbers = true)]
        threshold: Option<f64>,
        /// Neighborhood radius
        #[arg(long)]
        eps: Option<f64>,
        /// Minimum neighborhood size for a core point
        #[arg(long)]
        min_samples: Option<usize>,
        /// Arc-length spacing between resampled points
        #[arg(long)]
        spacing: Option<f64>,
        /// Do not fit a curve through the noise points
        #[arg(long)]
        skip_noise: bool,
        /// Also write resampled points to <file stem>_filaments.tsv
        #[arg(long)]
        export: bool,
    },
}

/// Create a spinner for indeterminate operations
fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

/// Create a progress bar over `len` micrographs
fn create_progress(len: usize) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    pb
}

/// Print a summary box
fn print_summary(title: &str, items: &[(&str, String)]) {
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║ {:<60} ║", title);
    println!("╠══════════════════════════════════════════════════════════════╣");
    for (key, value) in items {
        let display_value = if value.chars().count() > 37 {
            let head: String = value.chars().take(34).collect();
            format!("{}...", head)
        } else {
            value.clone()
        };
        println!("║ {:<20}: {:<37} ║", key, display_value);
    }
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
}

pub fn run() {
    let cli = Cli::parse();

    // Initialize logging based on verbosity (must come first)
    env_logger::Builder::new()
        .filter_level(match cli.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        })
        .format_timestamp_secs()
        .init();

    let config = match &cli.config {
        Some(path) => match PipelineConfig::from_yaml(path) {
            Ok(cfg) => {
                info!("Loaded config from: {}", path.display());
                cfg
            }
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}, using defaults",
                    path.display(),
                    e
                );
                PipelineConfig::default()
            }
        },
        None => PipelineConfig::default(),
    };

    let result = match cli.command {
        Commands::Split { input, output_dir } => cmd_split(&input, &output_dir),
        Commands::Load {
            directory,
            threshold,
        } => cmd_load(&directory, threshold, &config),
        Commands::Show {
            directory,
            file,
            output,
            threshold,
        } => cmd_show(&directory, &file, output, threshold, &config),
        Commands::Cluster {
            directory,
            file,
            output,
            threshold,
            eps,
            min_samples,
        } => {
            let clustering = clustering_overrides(&config.clustering, eps, min_samples);
            cmd_cluster(&directory, &file, output, threshold, &clustering, &config)
        }
        Commands::Trace {
            directory,
            file,
            output_dir,
            threshold,
            eps,
            min_samples,
            spacing,
            skip_noise,
            export,
        } => {
            let clustering = clustering_overrides(&config.clustering, eps, min_samples);
            let fitting = FittingConfig {
                spacing: spacing.unwrap_or(config.fitting.spacing),
                fit_noise: config.fitting.fit_noise && !skip_noise,
                ..config.fitting.clone()
            };
            let options = TraceOptions {
                file,
                output_dir,
                threshold,
                export,
            };
            cmd_trace(&directory, &options, &clustering, &fitting, &config)
        }
    };

    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn clustering_overrides(
    base: &ClusteringConfig,
    eps: Option<f64>,
    min_samples: Option<usize>,
) -> ClusteringConfig {
    ClusteringConfig {
        eps: eps.unwrap_or(base.eps),
        min_samples: min_samples.unwrap_or(base.min_samples),
    }
}

fn file_stem(file: &str) -> String {
    Path::new(file)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| file.to_string())
}

fn load_one(directory: &Path, file: &str, threshold: f64) -> Result<CoordinateSet> {
    let path = directory.join(file);
    loaders::load_coordinate_file(&path, threshold)
        .with_context(|| format!("failed to load {}", path.display()))
}

fn cmd_split(input: &Path, output_dir: &Path) -> Result<()> {
    use crate::processors::splitting;

    let start = Instant::now();
    let spinner = create_spinner("Splitting coordinate export...");

    let summary = splitting::split_coordinates(input, output_dir);
    spinner.finish_and_clear();
    let summary = summary.with_context(|| format!("failed to split {}", input.display()))?;

    print_summary(
        "Split Complete",
        &[
            ("Input file", input.display().to_string()),
            ("Output directory", output_dir.display().to_string()),
            ("Files written", summary.files.len().to_string()),
            ("Rows copied", summary.rows.to_string()),
            ("Duration", format!("{:.2?}", start.elapsed())),
        ],
    );
    Ok(())
}

fn cmd_load(directory: &Path, threshold: Option<f64>, config: &PipelineConfig) -> Result<()> {
    let start = Instant::now();
    let threshold = threshold.unwrap_or(config.loading.score_threshold);

    let spinner = create_spinner("Loading coordinate files...");
    let library = loaders::load_file_library(directory, threshold, &config.loading.extension);
    spinner.finish_and_clear();
    let library =
        library.with_context(|| format!("failed to load {}", directory.display()))?;

    for (name, coords) in &library {
        println!("{:<40} {:>8} particles", name, coords.len());
    }

    let total: usize = library.values().map(CoordinateSet::len).sum();
    print_summary(
        "Load Complete",
        &[
            ("Directory", directory.display().to_string()),
            ("Files", library.len().to_string()),
            ("Particles retained", total.to_string()),
            ("Score threshold", threshold.to_string()),
            ("Duration", format!("{:.2?}", start.elapsed())),
        ],
    );
    Ok(())
}

fn cmd_show(
    directory: &Path,
    file: &str,
    output: Option<PathBuf>,
    threshold: Option<f64>,
    config: &PipelineConfig,
) -> Result<()> {
    use crate::visualization;

    let start = Instant::now();
    let threshold = threshold.unwrap_or(config.loading.score_threshold);
    let output_path =
        output.unwrap_or_else(|| directory.join(format!("{}.png", file_stem(file))));

    let coords = load_one(directory, file, threshold)?;
    visualization::plot_coordinates(&output_path, &coords, file, &config.plot)
        .with_context(|| format!("failed to plot {}", file))?;

    print_summary(
        "Visualization Complete",
        &[
            ("Input file", file.to_string()),
            ("Output image", output_path.display().to_string()),
            ("Particles", coords.len().to_string()),
            ("Duration", format!("{:.2?}", start.elapsed())),
        ],
    );
    Ok(())
}

fn cmd_cluster(
    directory: &Path,
    file: &str,
    output: Option<PathBuf>,
    threshold: Option<f64>,
    clustering: &ClusteringConfig,
    config: &PipelineConfig,
) -> Result<()> {
    use crate::processors::clustering;

    let start = Instant::now();
    let threshold = threshold.unwrap_or(config.loading.score_threshold);
    let output_path =
        output.unwrap_or_else(|| directory.join(format!("{}_clusters.png", file_stem(file))));

    let coords = load_one(directory, file, threshold)?;

    let spinner = create_spinner("Clustering particles...");
    let mut figure = Figure::new();
    let clusters = clustering::dbscan_fit(&coords, clustering, &mut figure);
    let saved = figure.save(&output_path, &config.plot);
    spinner.finish_and_clear();
    saved.with_context(|| format!("failed to save {}", output_path.display()))?;

    let noise = clusters
        .iter()
        .filter(|c| c.is_noise())
        .map(|c| c.len())
        .sum::<usize>();
    let cluster_count = clusters.iter().filter(|c| !c.is_noise()).count();

    print_summary(
        "Clustering Complete",
        &[
            ("Input file", file.to_string()),
            ("Output image", output_path.display().to_string()),
            ("Particles", coords.len().to_string()),
            ("Clusters found", cluster_count.to_string()),
            ("Noise points", noise.to_string()),
            ("eps", clustering.eps.to_string()),
            ("min_samples", clustering.min_samples.to_string()),
            ("Duration", format!("{:.2?}", start.elapsed())),
        ],
    );
    Ok(())
}

struct TraceOptions {
    file: Option<String>,
    output_dir: Option<PathBuf>,
    threshold: Option<f64>,
    export: bool,
}

/// Cluster and trace one micrograph, returning the number of filaments.
fn trace_one(
    name: &str,
    coords: &CoordinateSet,
    output_dir: &Path,
    export: bool,
    clustering: &ClusteringConfig,
    fitting: &FittingConfig,
    config: &PipelineConfig,
) -> Result<usize> {
    use crate::core::writers;
    use crate::processors::{clustering as dbscan, fitting as fit};

    let stem = file_stem(name);
    let image_path = output_dir.join(format!("{}_filaments.png", stem));

    let mut figure = Figure::new();
    let clusters = dbscan::dbscan_fit(coords, clustering, &mut figure);
    let filaments = fit::filament_fit(&clusters, fitting, &mut figure, &image_path, &config.plot)?;

    if export {
        let export_path = output_dir.join(format!("{}_filaments.tsv", stem));
        writers::write_filaments_csv(&export_path, &filaments)?;
        info!("Filaments -> {}", export_path.display());
    }

    Ok(filaments.len())
}

fn cmd_trace(
    directory: &Path,
    options: &TraceOptions,
    clustering: &ClusteringConfig,
    fitting: &FittingConfig,
    config: &PipelineConfig,
) -> Result<()> {
    let start = Instant::now();
    let threshold = options
        .threshold
        .unwrap_or(config.loading.score_threshold);
    let output_dir = options
        .output_dir
        .clone()
        .unwrap_or_else(|| directory.to_path_buf());

    let mut library =
        loaders::load_file_library(directory, threshold, &config.loading.extension)
            .with_context(|| format!("failed to load {}", directory.display()))?;

    if let Some(file) = &options.file {
        let coords = library
            .remove(file)
            .ok_or_else(|| anyhow!("no coordinate file named {} in {}", file, directory.display()))?;
        library.clear();
        library.insert(file.clone(), coords);
    }

    if library.is_empty() {
        bail!("no coordinate files found in {}", directory.display());
    }

    let progress = create_progress(library.len());
    let mut filament_count = 0usize;
    let mut failures = 0usize;

    for (name, coords) in &library {
        progress.set_message(name.clone());
        match trace_one(
            name,
            coords,
            &output_dir,
            options.export,
            clustering,
            fitting,
            config,
        ) {
            Ok(n) => filament_count += n,
            Err(e) => {
                failures += 1;
                progress.suspend(|| error!("{}: {:#}", name, e));
            }
        }
        progress.inc(1);
    }
    progress.finish_and_clear();

    print_summary(
        "Filament Tracing Complete",
        &[
            ("Input directory", directory.display().to_string()),
            ("Output directory", output_dir.display().to_string()),
            ("Micrographs", library.len().to_string()),
            ("Failed", failures.to_string()),
            ("Filaments traced", filament_count.to_string()),
            ("Spacing", fitting.spacing.to_string()),
            ("Duration", format!("{:.2?}", start.elapsed())),
        ],
    );

    if failures > 0 {
        bail!("{} of {} micrographs failed", failures, library.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_trace_with_negative_threshold() {
        let cli = Cli::try_parse_from([
            "filament-pipeline",
            "trace",
            "coords",
            "--threshold",
            "-3.5",
            "--skip-noise",
            "--spacing",
            "40",
        ])
        .unwrap();

        match cli.command {
            Commands::Trace {
                threshold,
                skip_noise,
                spacing,
                file,
                ..
            } => {
                assert_eq!(threshold, Some(-3.5));
                assert!(skip_noise);
                assert_eq!(spacing, Some(40.0));
                assert!(file.is_none());
            }
            _ => panic!("Expected trace command"),
        }
    }

    #[test]
    fn test_clustering_overrides() {
        let base = ClusteringConfig::default();
        let merged = clustering_overrides(&base, Some(20.0), None);
        assert_eq!(merged.eps, 20.0);
        assert_eq!(merged.min_samples, base.min_samples);
    }

    #[test]
    fn test_trace_one_writes_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let mut coords = CoordinateSet::new();
        for i in 0..30 {
            let x = 100.0 + i as f64 * 6.0;
            coords.push(x, 0.001 * x * x + 50.0);
        }

        let mut config = PipelineConfig::default();
        config.plot.show_title = false;
        config.plot.show_axes = false;
        config.plot.width = 300;
        config.plot.height = 300;

        let n = trace_one(
            "mic_007.txt",
            &coords,
            dir.path(),
            true,
            &config.clustering,
            &config.fitting,
            &config,
        )
        .unwrap();

        assert_eq!(n, 1);
        assert!(dir.path().join("mic_007_filaments.png").exists());
        assert!(dir.path().join("mic_007_filaments.tsv").exists());
    }

    #[test]
    fn test_export_does_not_break_next_load() {
        use crate::core::writers::CoordinateWriter;

        let dir = tempfile::tempdir().unwrap();
        let mut writer = CoordinateWriter::create(&dir.path().join("mic_001.txt")).unwrap();
        let mut coords = CoordinateSet::new();
        for i in 0..30 {
            let x = 200.0 + i as f64 * 5.0;
            let y = 0.5 * x + 10.0;
            writer
                .write_row(&x.to_string(), &y.to_string(), "-1.0")
                .unwrap();
            coords.push(x, y);
        }
        writer.finish().unwrap();

        let mut config = PipelineConfig::default();
        config.plot.show_title = false;
        config.plot.show_axes = false;
        config.plot.width = 300;
        config.plot.height = 300;

        trace_one(
            "mic_001.txt",
            &coords,
            dir.path(),
            true,
            &config.clustering,
            &config.fitting,
            &config,
        )
        .unwrap();

        let library = loaders::load_file_library(dir.path(), -2.5, "txt").unwrap();
        assert_eq!(library.keys().collect::<Vec<_>>(), vec!["mic_001.txt"]);
        assert_eq!(library["mic_001.txt"].len(), 30);
    }

    #[test]
    fn test_trace_one_empty_micrograph() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PipelineConfig::default();
        config.plot.show_title = false;
        config.plot.show_axes = false;
        config.plot.width = 200;
        config.plot.height = 200;

        let n = trace_one(
            "empty.txt",
            &CoordinateSet::new(),
            dir.path(),
            false,
            &config.clustering,
            &config.fitting,
            &config,
        )
        .unwrap();

        assert_eq!(n, 0);
        assert!(dir.path().join("empty_filaments.png").exists());
    }
}
