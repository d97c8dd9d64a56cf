//! Configuration types for the filament pipeline.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Configuration for loading per-micrograph coordinate files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Rows with a score strictly below this value are dropped
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f64,

    /// File extension identifying coordinate files (without the dot)
    #[serde(default = "default_extension")]
    pub extension: String,
}

fn default_score_threshold() -> f64 {
    -2.5
}

fn default_extension() -> String {
    "txt".to_string()
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            score_threshold: default_score_threshold(),
            extension: default_extension(),
        }
    }
}

/// Configuration for DBSCAN clustering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusteringConfig {
    /// Neighborhood radius
    #[serde(default = "default_eps")]
    pub eps: f64,

    /// Minimum neighborhood size (point itself included) for a core point
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
}

fn default_eps() -> f64 {
    15.0
}

fn default_min_samples() -> usize {
    5
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            eps: default_eps(),
            min_samples: default_min_samples(),
        }
    }
}

/// Configuration for RANSAC polynomial filament fitting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FittingConfig {
    /// Polynomial degree of the fitted curve
    #[serde(default = "default_degree")]
    pub degree: usize,

    /// Arc-length spacing between resampled points
    #[serde(default = "default_spacing")]
    pub spacing: f64,

    /// Number of RANSAC trials
    #[serde(default = "default_max_trials")]
    pub max_trials: usize,

    /// Inlier residual threshold; median absolute deviation of y when unset
    #[serde(default)]
    pub residual_threshold: Option<f64>,

    /// RNG seed for minimal-sample selection
    #[serde(default)]
    pub seed: u64,

    /// Fit a curve through the noise cluster as well
    #[serde(default = "default_fit_noise")]
    pub fit_noise: bool,
}

fn default_degree() -> usize {
    2
}

fn default_spacing() -> f64 {
    60.218
}

fn default_max_trials() -> usize {
    100
}

fn default_fit_noise() -> bool {
    true
}

impl Default for FittingConfig {
    fn default() -> Self {
        Self {
            degree: default_degree(),
            spacing: default_spacing(),
            max_trials: default_max_trials(),
            residual_threshold: None,
            seed: 0,
            fit_noise: default_fit_noise(),
        }
    }
}

/// Configuration for rendered figures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlotConfig {
    /// Image width in pixels
    #[serde(default = "default_plot_size")]
    pub width: u32,

    /// Image height in pixels
    #[serde(default = "default_plot_size")]
    pub height: u32,

    /// Draw the figure title (needs a system font)
    #[serde(default = "default_true")]
    pub show_title: bool,

    /// Draw axes with tick labels (needs a system font)
    #[serde(default = "default_true")]
    pub show_axes: bool,
}

fn default_plot_size() -> u32 {
    1200
}

fn default_true() -> bool {
    true
}

impl Default for PlotConfig {
    fn default() -> Self {
        Self {
            width: default_plot_size(),
            height: default_plot_size(),
            show_title: true,
            show_axes: true,
        }
    }
}

/// Main pipeline configuration combining all sub-configs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub loading: LoaderConfig,

    #[serde(default)]
    pub clustering: ClusteringConfig,

    #[serde(default)]
    pub fitting: FittingConfig,

    #[serde(default)]
    pub plot: PlotConfig,
}

impl PipelineConfig {
    /// Load configuration from a YAML file.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: PipelineConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<(), Box<dyn std::error::Error>> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
