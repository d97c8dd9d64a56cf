//! Particle coordinate pipeline for filament picking in cryo-EM micrographs.
//!
//! This crate provides tools for:
//! - Splitting a combined particle-pick export into per-micrograph files
//! - Loading per-micrograph coordinates with a score threshold
//! - DBSCAN clustering of particle coordinates (parallelized)
//! - RANSAC polynomial filament fits resampled at a fixed arc-length spacing
//! - Scatter plot rendering of clusters and filaments
//!
//! # Example
//!
//! ```no_run
//! use filament_pipeline::config::PipelineConfig;
//! use filament_pipeline::core::loaders::load_coordinate_file;
//! use filament_pipeline::processors::{clustering::dbscan_fit, fitting::filament_fit};
//! use filament_pipeline::visualization::Figure;
//! use std::path::Path;
//!
//! let config = PipelineConfig::default();
//! let coords = load_coordinate_file("coords/mic_001.txt", -2.5).unwrap();
//! let mut figure = Figure::new();
//! let clusters = dbscan_fit(&coords, &config.clustering, &mut figure);
//! filament_fit(&clusters, &config.fitting, &mut figure, Path::new("mic_001.png"), &config.plot).unwrap();
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod processors;
pub mod visualization;

pub use config::{ClusteringConfig, FittingConfig, LoaderConfig, PipelineConfig, PlotConfig};
pub use core::loaders::{CoordinateSet, FileLibrary};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
