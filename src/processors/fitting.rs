//! Filament tracing: robust polynomial fits through particle clusters.
//!
//! Each cluster gets a low-degree polynomial `y = f(x)` fitted with RANSAC
//! (minimal samples, consensus by inlier count, least-squares refit on the
//! inliers). The fitted curve is then resampled at a fixed arc-length
//! spacing, which for helical filaments is the helical rise between boxed
//! segments.
//!
//! Curve fitting sits behind the [`CurveFitter`] trait (points in,
//! [`CurveFit`] out).

use std::path::Path;

use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::SeedableRng;
use thiserror::Error;

use crate::config::{FittingConfig, PlotConfig};
use crate::processors::clustering::Cluster;
use crate::visualization::{Figure, MarkerStyle, VisualizationError, FILAMENT_COLOR};

/// Number of Simpson segments used to tabulate arc length.
const ARC_SEGMENTS: usize = 2048;

/// Marker radius of resampled filament points.
const FILAMENT_MARKER_RADIUS: u32 = 4;

/// Floor on the RANSAC residual threshold so exact fits stay inliers.
const MIN_RESIDUAL_THRESHOLD: f64 = 1e-9;

/// Errors that can occur while fitting filaments.
#[derive(Debug, Error)]
pub enum FitError {
    #[error("need at least {needed} points for a degree {degree} fit, got {found}")]
    TooFewPoints {
        degree: usize,
        needed: usize,
        found: usize,
    },

    #[error("need at least {needed} distinct x values, got {found}")]
    TooFewDistinctX { needed: usize, found: usize },

    #[error("least squares solve failed: {0}")]
    Solve(String),

    #[error("no consensus set found after {trials} RANSAC trials")]
    NoConsensus { trials: usize },

    #[error("arc-length spacing must be positive and finite, got {0}")]
    InvalidSpacing(f64),

    #[error("cluster {label}: {source}")]
    Cluster {
        label: i32,
        #[source]
        source: Box<FitError>,
    },

    #[error(transparent)]
    Visualization(#[from] VisualizationError),
}

/// Result type for fitting operations.
pub type Result<T> = std::result::Result<T, FitError>;

/// Polynomial in a centred and scaled x domain.
///
/// `f(x) = sum_j c_j * t^j` with `t = (x - shift) / scale`, which keeps the
/// least-squares system well conditioned for micrograph-sized coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct PolynomialModel {
    coefficients: Vec<f64>,
    shift: f64,
    scale: f64,
}

impl PolynomialModel {
    /// Least-squares fit of a degree-`degree` polynomial through `(xs, ys)`.
    ///
    /// # Errors
    ///
    /// Returns an error if there are fewer than `degree + 1` points or
    /// distinct x values, or the SVD solve fails.
    pub fn fit_least_squares(xs: &[f64], ys: &[f64], degree: usize) -> Result<Self> {
        let n = xs.len().min(ys.len());
        let needed = degree + 1;
        if n < needed {
            return Err(FitError::TooFewPoints {
                degree,
                needed,
                found: n,
            });
        }

        let distinct = count_distinct(&xs[..n]);
        if distinct < needed {
            return Err(FitError::TooFewDistinctX {
                needed,
                found: distinct,
            });
        }

        let shift = xs[..n].iter().sum::<f64>() / n as f64;
        let spread = xs[..n]
            .iter()
            .map(|x| (x - shift).abs())
            .fold(0.0, f64::max);
        let scale = if spread > 0.0 { spread } else { 1.0 };

        let a = DMatrix::<f64>::from_fn(n, needed, |i, j| ((xs[i] - shift) / scale).powi(j as i32));
        let b = DVector::<f64>::from_column_slice(&ys[..n]);

        let solution = a
            .svd(true, true)
            .solve(&b, 1e-12)
            .map_err(|e| FitError::Solve(e.to_string()))?;

        Ok(Self {
            coefficients: solution.iter().copied().collect(),
            shift,
            scale,
        })
    }

    /// Polynomial degree.
    pub fn degree(&self) -> usize {
        self.coefficients.len().saturating_sub(1)
    }

    /// Coefficients in the scaled domain, lowest power first.
    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    /// Evaluate the model at `x`.
    pub fn predict(&self, x: f64) -> f64 {
        let t = (x - self.shift) / self.scale;
        self.coefficients
            .iter()
            .rev()
            .fold(0.0, |acc, &c| acc * t + c)
    }

    /// Evaluate the model at every x.
    pub fn predict_many(&self, xs: &[f64]) -> Vec<f64> {
        xs.iter().map(|&x| self.predict(x)).collect()
    }

    /// First derivative `df/dx` at `x`.
    pub fn derivative(&self, x: f64) -> f64 {
        let t = (x - self.shift) / self.scale;
        let dt = self
            .coefficients
            .iter()
            .enumerate()
            .skip(1)
            .rev()
            .fold(0.0, |acc, (j, &c)| acc * t + j as f64 * c);
        dt / self.scale
    }
}

fn count_distinct(values: &[f64]) -> usize {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    sorted.dedup();
    sorted.len()
}

fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Median absolute deviation of `values` from their median.
pub fn median_absolute_deviation(values: &[f64]) -> f64 {
    let m = median(values);
    let deviations: Vec<f64> = values.iter().map(|v| (v - m).abs()).collect();
    median(&deviations)
}

/// A fitted curve and the points that support it.
#[derive(Debug, Clone)]
pub struct CurveFit {
    pub model: PolynomialModel,
    /// Inlier flag per input point.
    pub inlier_mask: Vec<bool>,
    /// Smallest inlier x.
    pub x_min: f64,
    /// Largest inlier x.
    pub x_max: f64,
    /// Root mean square residual over the inliers.
    pub rmse: f64,
}

impl CurveFit {
    pub fn n_inliers(&self) -> usize {
        self.inlier_mask.iter().filter(|&&m| m).count()
    }
}

/// A curve fitting capability: points in, curve out.
pub trait CurveFitter {
    fn fit(&self, points: &[[f64; 2]]) -> Result<CurveFit>;
}

/// RANSAC polynomial regression.
#[derive(Debug, Clone)]
pub struct RansacPolyFitter {
    config: FittingConfig,
}

impl RansacPolyFitter {
    pub fn new(config: FittingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FittingConfig {
        &self.config
    }
}

impl CurveFitter for RansacPolyFitter {
    /// Fit `y = f(x)` robustly.
    ///
    /// Each trial fits an exact polynomial through `degree + 1` random points
    /// and counts the points within the residual threshold. The trial with
    /// the most inliers wins, ties going to the smaller inlier residual sum;
    /// the final model is a least-squares refit on its inliers.
    fn fit(&self, points: &[[f64; 2]]) -> Result<CurveFit> {
        let degree = self.config.degree;
        let needed = degree + 1;
        let n = points.len();
        if n < needed {
            return Err(FitError::TooFewPoints {
                degree,
                needed,
                found: n,
            });
        }

        let xs: Vec<f64> = points.iter().map(|p| p[0]).collect();
        let ys: Vec<f64> = points.iter().map(|p| p[1]).collect();

        let distinct = count_distinct(&xs);
        if distinct < needed {
            return Err(FitError::TooFewDistinctX {
                needed,
                found: distinct,
            });
        }

        let threshold = self
            .config
            .residual_threshold
            .unwrap_or_else(|| median_absolute_deviation(&ys))
            .max(MIN_RESIDUAL_THRESHOLD);

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut best: Option<(usize, f64, Vec<bool>)> = None;

        for _ in 0..self.config.max_trials {
            let sample = rand::seq::index::sample(&mut rng, n, needed);
            let sample_x: Vec<f64> = sample.iter().map(|i| xs[i]).collect();
            let sample_y: Vec<f64> = sample.iter().map(|i| ys[i]).collect();

            let candidate = match PolynomialModel::fit_least_squares(&sample_x, &sample_y, degree) {
                Ok(model) => model,
                Err(_) => continue,
            };

            let residuals: Vec<f64> = xs
                .iter()
                .zip(ys.iter())
                .map(|(&x, &y)| (y - candidate.predict(x)).abs())
                .collect();
            let mask: Vec<bool> = residuals.iter().map(|&r| r <= threshold).collect();
            let count = mask.iter().filter(|&&m| m).count();
            let residual_sum: f64 = residuals
                .iter()
                .zip(mask.iter())
                .filter(|(_, &m)| m)
                .map(|(r, _)| r)
                .sum();

            let better = match &best {
                None => true,
                Some((best_count, best_sum, _)) => {
                    count > *best_count || (count == *best_count && residual_sum < *best_sum)
                }
            };
            if better {
                best = Some((count, residual_sum, mask));
            }
        }

        let (_, _, inlier_mask) = best.ok_or(FitError::NoConsensus {
            trials: self.config.max_trials,
        })?;

        let (inlier_x, inlier_y): (Vec<f64>, Vec<f64>) = xs
            .iter()
            .zip(ys.iter())
            .zip(inlier_mask.iter())
            .filter(|(_, &m)| m)
            .map(|((&x, &y), _)| (x, y))
            .unzip();

        let model = PolynomialModel::fit_least_squares(&inlier_x, &inlier_y, degree)?;

        let x_min = inlier_x.iter().copied().fold(f64::INFINITY, f64::min);
        let x_max = inlier_x.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let sq_sum: f64 = inlier_x
            .iter()
            .zip(inlier_y.iter())
            .map(|(&x, &y)| (y - model.predict(x)).powi(2))
            .sum();
        let rmse = (sq_sum / inlier_x.len() as f64).sqrt();

        Ok(CurveFit {
            model,
            inlier_mask,
            x_min,
            x_max,
            rmse,
        })
    }
}

/// Cumulative arc length of a fitted curve over `[x_start, x_end]`.
#[derive(Debug, Clone)]
pub struct ArcLength {
    pub x_start: f64,
    pub x_end: f64,
    /// Total arc length.
    pub total: f64,
    /// `(x, cumulative arc length)` at each segment boundary.
    table: Vec<(f64, f64)>,
}

impl ArcLength {
    /// Arc length of the curve fitted in `fit`, over its inlier x range.
    pub fn of_fit(fit: &CurveFit) -> Self {
        arc_length(&fit.model, fit.x_min, fit.x_max)
    }

    /// The x position at arc length `s` from the start (clamped to the range).
    pub fn x_at(&self, s: f64) -> f64 {
        if s <= 0.0 {
            return self.x_start;
        }
        if s >= self.total {
            return self.x_end;
        }

        let idx = self.table.partition_point(|&(_, c)| c < s);
        let (x1, s1) = self.table[idx];
        let (x0, s0) = self.table[idx - 1];
        if s1 - s0 <= 0.0 {
            return x0;
        }
        x0 + (x1 - x0) * (s - s0) / (s1 - s0)
    }
}

/// Tabulate the arc length of `model` over `[x_start, x_end]` with
/// composite Simpson integration of `sqrt(1 + f'(x)^2)`.
pub fn arc_length(model: &PolynomialModel, x_start: f64, x_end: f64) -> ArcLength {
    if !(x_end > x_start) {
        return ArcLength {
            x_start,
            x_end: x_start,
            total: 0.0,
            table: vec![(x_start, 0.0)],
        };
    }

    let speed = |x: f64| (1.0 + model.derivative(x).powi(2)).sqrt();
    let h = (x_end - x_start) / ARC_SEGMENTS as f64;

    let mut table = Vec::with_capacity(ARC_SEGMENTS + 1);
    table.push((x_start, 0.0));
    let mut cumulative = 0.0;
    for k in 0..ARC_SEGMENTS {
        let a = x_start + k as f64 * h;
        let b = if k + 1 == ARC_SEGMENTS { x_end } else { a + h };
        cumulative += (b - a) / 6.0 * (speed(a) + 4.0 * speed(0.5 * (a + b)) + speed(b));
        table.push((b, cumulative));
    }

    ArcLength {
        x_start,
        x_end,
        total: cumulative,
        table,
    }
}

/// X positions at arc lengths `0, step, 2 * step, ...` up to the total.
///
/// # Errors
///
/// Returns `FitError::InvalidSpacing` if `step` is not positive and finite.
pub fn spacing(arc: &ArcLength, step: f64) -> Result<Vec<f64>> {
    if !(step > 0.0) || !step.is_finite() {
        return Err(FitError::InvalidSpacing(step));
    }

    let count = (arc.total / step).floor() as usize;
    Ok((0..=count).map(|k| arc.x_at(k as f64 * step)).collect())
}

/// A traced filament: fitted curve plus evenly resampled points.
#[derive(Debug, Clone)]
pub struct Filament {
    /// Label of the cluster the filament was traced through.
    pub label: i32,
    pub fit: CurveFit,
    pub arc_length: ArcLength,
    /// Resampled x positions.
    pub x: Vec<f64>,
    /// Model predictions at `x`.
    pub y: Vec<f64>,
}

impl Filament {
    /// Number of resampled points.
    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }
}

/// Fit one cluster and resample the curve every `step` units of arc length.
pub fn trace_filament<F: CurveFitter + ?Sized>(
    cluster: &Cluster,
    fitter: &F,
    step: f64,
) -> Result<Filament> {
    let fit = fitter.fit(&cluster.points)?;
    let arc = ArcLength::of_fit(&fit);
    let x = spacing(&arc, step)?;
    let y = fit.model.predict_many(&x);

    log::debug!(
        "cluster {}: {} of {} inliers, rmse {:.3}, arc length {:.1}, {} segments",
        cluster.label,
        fit.n_inliers(),
        cluster.len(),
        fit.rmse,
        arc.total,
        x.len()
    );

    Ok(Filament {
        label: cluster.label,
        fit,
        arc_length: arc,
        x,
        y,
    })
}

/// Trace every cluster, optionally skipping the noise cluster.
///
/// # Errors
///
/// The first cluster that cannot be fitted aborts the run with
/// `FitError::Cluster` naming its label.
pub fn trace_filaments<F: CurveFitter + ?Sized>(
    clusters: &[Cluster],
    fitter: &F,
    step: f64,
    fit_noise: bool,
) -> Result<Vec<Filament>> {
    clusters
        .iter()
        .filter(|cluster| fit_noise || !cluster.is_noise())
        .map(|cluster| {
            trace_filament(cluster, fitter, step).map_err(|e| FitError::Cluster {
                label: cluster.label,
                source: Box::new(e),
            })
        })
        .collect()
}

/// Overlay resampled filament points on a figure.
pub fn draw_filaments(figure: &mut Figure, filaments: &[Filament]) {
    let style = MarkerStyle::new(FILAMENT_COLOR, FILAMENT_MARKER_RADIUS);
    for filament in filaments {
        figure.scatter_xy(&filament.x, &filament.y, style);
    }
}

/// Fit a filament through every cluster, overlay the resampled curves on the
/// figure, and save the figure.
///
/// # Arguments
///
/// * `clusters` - Clusters from the cluster engine
/// * `config` - Fitting configuration (degree, spacing, RANSAC parameters)
/// * `figure` - Figure holding the cluster plot
/// * `save_path` - Output image path; the extension selects the format
/// * `plot_config` - Image size and decorations
///
/// # Returns
///
/// The traced filaments, in cluster order.
///
/// # Errors
///
/// Returns an error if any cluster cannot be fitted or the figure cannot be
/// saved.
pub fn filament_fit(
    clusters: &[Cluster],
    config: &FittingConfig,
    figure: &mut Figure,
    save_path: &Path,
    plot_config: &PlotConfig,
) -> Result<Vec<Filament>> {
    let fitter = RansacPolyFitter::new(config.clone());
    let filaments = trace_filaments(clusters, &fitter, config.spacing, config.fit_noise)?;

    draw_filaments(figure, &filaments);
    figure.save(save_path, plot_config)?;

    log::info!(
        "Traced {} filaments, {} resampled points",
        filaments.len(),
        filaments.iter().map(Filament::len).sum::<usize>()
    );

    Ok(filaments)
}
