//! Scatter plot figures for particle coordinates, clusters and filaments.
//!
//! A [`Figure`] is an owned scene: a stack of scatter layers plus an optional
//! title. The cluster engine and the filament fitter draw onto the same
//! figure, which is rendered once with plotters. The backend follows the
//! output extension: `.svg` uses `SVGBackend`, anything else goes through
//! `BitMapBackend` (PNG, JPEG, BMP, ...).

use std::fs;
use std::path::Path;

use plotters::coord::Shift;
use plotters::prelude::*;
use plotters_bitmap::BitMapBackend;
use thiserror::Error;

use crate::config::PlotConfig;
use crate::core::loaders::CoordinateSet;

/// Errors that can occur during visualization.
#[derive(Error, Debug)]
pub enum VisualizationError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Plotting error: {0}")]
    PlottingError(String),
}

/// Result type for visualization operations.
pub type Result<T> = std::result::Result<T, VisualizationError>;

/// Axis range of a figure with no finite points.
const EMPTY_BOUNDS: (f64, f64, f64, f64) = (0.0, 1.0, 0.0, 1.0);

/// Color of resampled filament points.
pub const FILAMENT_COLOR: RGBColor = RGBColor(128, 0, 128);

/// Default color for raw coordinate plots (cornflower blue).
pub const COORDINATE_COLOR: RGBColor = RGBColor(100, 149, 237);

/// Anchor colors of the diverging Spectral colormap, from 0.0 to 1.0.
const SPECTRAL: [(u8, u8, u8); 11] = [
    (158, 1, 66),
    (213, 62, 79),
    (244, 109, 67),
    (253, 174, 97),
    (254, 224, 139),
    (255, 255, 191),
    (230, 245, 152),
    (171, 221, 164),
    (102, 194, 165),
    (50, 136, 189),
    (94, 79, 162),
];

/// Sample the Spectral colormap at `t` in `[0, 1]` (clamped).
pub fn spectral(t: f64) -> RGBColor {
    let t = if t.is_nan() { 0.0 } else { t.clamp(0.0, 1.0) };
    let scaled = t * (SPECTRAL.len() - 1) as f64;
    let lo = scaled.floor() as usize;
    let hi = (lo + 1).min(SPECTRAL.len() - 1);
    let frac = scaled - lo as f64;

    let lerp = |a: u8, b: u8| (a as f64 + (b as f64 - a as f64) * frac).round() as u8;
    let (a, b) = (SPECTRAL[lo], SPECTRAL[hi]);
    RGBColor(lerp(a.0, b.0), lerp(a.1, b.1), lerp(a.2, b.2))
}

/// Marker appearance for one scatter layer.
#[derive(Debug, Clone, Copy)]
pub struct MarkerStyle {
    pub fill: RGBColor,
    pub radius: u32,
    pub edge: Option<RGBColor>,
}

impl MarkerStyle {
    pub fn new(fill: RGBColor, radius: u32) -> Self {
        Self {
            fill,
            radius,
            edge: None,
        }
    }

    /// Outline every marker with `edge`.
    pub fn with_edge(mut self, edge: RGBColor) -> Self {
        self.edge = Some(edge);
        self
    }
}

#[derive(Debug, Clone)]
struct Layer {
    points: Vec<(f64, f64)>,
    style: MarkerStyle,
}

/// A scatter plot scene, drawn in layer order.
#[derive(Debug, Clone, Default)]
pub struct Figure {
    title: Option<String>,
    layers: Vec<Layer>,
}

impl Figure {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_title(&mut self, title: impl Into<String>) {
        self.title = Some(title.into());
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    /// Add a layer of `[x, y]` points. Empty slices add nothing.
    pub fn scatter(&mut self, points: &[[f64; 2]], style: MarkerStyle) {
        if points.is_empty() {
            return;
        }
        self.layers.push(Layer {
            points: points.iter().map(|p| (p[0], p[1])).collect(),
            style,
        });
    }

    /// Add a layer from index-aligned x and y arrays.
    pub fn scatter_xy(&mut self, x: &[f64], y: &[f64], style: MarkerStyle) {
        let points: Vec<[f64; 2]> = x.iter().zip(y.iter()).map(|(&x, &y)| [x, y]).collect();
        self.scatter(&points, style);
    }

    /// Total number of points over all layers.
    pub fn point_count(&self) -> usize {
        self.layers.iter().map(|l| l.points.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Bounds `(x_min, x_max, y_min, y_max)` over all finite points.
    pub fn bounds(&self) -> Option<(f64, f64, f64, f64)> {
        compute_bounds(self.layers.iter().flat_map(|l| l.points.iter().copied()))
    }

    /// Render the figure to `output_path`.
    ///
    /// A figure without points is still written, with unit axes.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created or the
    /// backend fails to draw or encode the image.
    pub fn save(&self, output_path: &Path, config: &PlotConfig) -> Result<()> {
        if let Some(parent) = output_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let size = (config.width, config.height);
        let is_svg = output_path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("svg"))
            .unwrap_or(false);

        if is_svg {
            self.render(SVGBackend::new(output_path, size).into_drawing_area(), config)
        } else {
            self.render(BitMapBackend::new(output_path, size).into_drawing_area(), config)
        }?;

        log::info!("Figure -> {}", output_path.display());
        Ok(())
    }

    fn render<DB: DrawingBackend>(
        &self,
        root: DrawingArea<DB, Shift>,
        config: &PlotConfig,
    ) -> Result<()> {
        let (x_min, x_max, y_min, y_max) = self.bounds().unwrap_or(EMPTY_BOUNDS);
        let x_padding = (x_max - x_min) * 0.05;
        let y_padding = (y_max - y_min) * 0.05;

        root.fill(&WHITE).map_err(plotting_error)?;

        let mut builder = ChartBuilder::on(&root);
        builder.margin(10);
        if config.show_title {
            if let Some(title) = &self.title {
                builder.caption(title, ("sans-serif", 24));
            }
        }
        if config.show_axes {
            builder.x_label_area_size(40).y_label_area_size(60);
        }

        let mut chart = builder
            .build_cartesian_2d(
                (x_min - x_padding)..(x_max + x_padding),
                (y_min - y_padding)..(y_max + y_padding),
            )
            .map_err(plotting_error)?;

        if config.show_axes {
            chart
                .configure_mesh()
                .disable_x_mesh()
                .disable_y_mesh()
                .draw()
                .map_err(plotting_error)?;
        }

        for layer in &self.layers {
            let radius = layer.style.radius;
            let fill = layer.style.fill.filled();
            chart
                .draw_series(
                    layer
                        .points
                        .iter()
                        .map(|&(x, y)| Circle::new((x, y), radius, fill)),
                )
                .map_err(plotting_error)?;

            if let Some(edge) = layer.style.edge {
                let stroke = edge.stroke_width(1);
                chart
                    .draw_series(
                        layer
                            .points
                            .iter()
                            .map(|&(x, y)| Circle::new((x, y), radius, stroke)),
                    )
                    .map_err(plotting_error)?;
            }
        }

        root.present().map_err(plotting_error)?;

        Ok(())
    }
}

fn plotting_error<E: std::fmt::Display>(e: E) -> VisualizationError {
    VisualizationError::PlottingError(e.to_string())
}

/// Compute the bounds (min/max) for x and y, widening degenerate ranges.
fn compute_bounds<I>(points: I) -> Option<(f64, f64, f64, f64)>
where
    I: IntoIterator<Item = (f64, f64)>,
{
    let mut x_min = f64::MAX;
    let mut x_max = f64::MIN;
    let mut y_min = f64::MAX;
    let mut y_max = f64::MIN;
    let mut any = false;

    for (x, y) in points {
        if !x.is_finite() || !y.is_finite() {
            continue;
        }
        any = true;
        x_min = x_min.min(x);
        x_max = x_max.max(x);
        y_min = y_min.min(y);
        y_max = y_max.max(y);
    }

    if !any {
        return None;
    }

    if (x_max - x_min).abs() < f64::EPSILON {
        x_min -= 1.0;
        x_max += 1.0;
    }
    if (y_max - y_min).abs() < f64::EPSILON {
        y_min -= 1.0;
        y_max += 1.0;
    }

    Some((x_min, x_max, y_min, y_max))
}

/// Plot the raw coordinates of one micrograph as a scatter plot.
///
/// # Arguments
///
/// * `output_path` - Image path; the extension selects the format
/// * `coords` - Coordinates to draw
/// * `title` - Figure title (drawn when `config.show_title` is set)
/// * `config` - Plot size and decorations
pub fn plot_coordinates(
    output_path: &Path,
    coords: &CoordinateSet,
    title: &str,
    config: &PlotConfig,
) -> Result<()> {
    let mut figure = Figure::new();
    figure.set_title(title);
    figure.scatter_xy(&coords.x, &coords.y, MarkerStyle::new(COORDINATE_COLOR, 2));
    figure.save(output_path, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    // No text: test machines may have no fonts installed
    fn bare_config() -> PlotConfig {
        PlotConfig {
            width: 200,
            height: 150,
            show_title: false,
            show_axes: false,
        }
    }

    #[test]
    fn test_spectral_endpoints_and_clamping() {
        assert_eq!(spectral(0.0), RGBColor(158, 1, 66));
        assert_eq!(spectral(1.0), RGBColor(94, 79, 162));
        assert_eq!(spectral(0.5), RGBColor(255, 255, 191));
        assert_eq!(spectral(-3.0), spectral(0.0));
        assert_eq!(spectral(7.0), spectral(1.0));
    }

    #[test]
    fn test_scatter_skips_empty_layers() {
        let mut figure = Figure::new();
        figure.scatter(&[], MarkerStyle::new(BLACK, 3));
        assert!(figure.is_empty());

        figure.scatter_xy(&[1.0, 2.0], &[3.0, 4.0], MarkerStyle::new(BLACK, 3));
        assert_eq!(figure.point_count(), 2);
    }

    #[test]
    fn test_bounds_widen_degenerate_range() {
        let mut figure = Figure::new();
        figure.scatter(&[[5.0, 1.0], [5.0, 9.0]], MarkerStyle::new(BLACK, 3));

        assert_eq!(figure.bounds(), Some((4.0, 6.0, 1.0, 9.0)));
    }

    #[test]
    fn test_save_empty_figure() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.png");

        Figure::new().save(&path, &bare_config()).unwrap();
        assert!(fs::metadata(&path).unwrap().len() > 0);
    }

    #[test]
    fn test_save_png_and_svg() {
        let dir = tempdir().unwrap();
        let mut figure = Figure::new();
        figure.scatter(
            &[[0.0, 0.0], [10.0, 5.0], [20.0, 7.0]],
            MarkerStyle::new(spectral(0.2), 4).with_edge(BLACK),
        );

        let png = dir.path().join("plots").join("figure.png");
        figure.save(&png, &bare_config()).unwrap();
        assert!(fs::metadata(&png).unwrap().len() > 0);

        let svg = dir.path().join("figure.svg");
        figure.save(&svg, &bare_config()).unwrap();
        assert!(fs::read_to_string(&svg).unwrap().contains("<svg"));
    }

    #[test]
    fn test_plot_coordinates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("coords.png");
        let coords = CoordinateSet::from_points(&[[1.0, 2.0], [3.0, 4.0]]);

        plot_coordinates(&path, &coords, "mic_001", &bare_config()).unwrap();
        assert!(path.exists());

        let empty_path = dir.path().join("empty.png");
        plot_coordinates(&empty_path, &CoordinateSet::new(), "none", &bare_config()).unwrap();
        assert!(empty_path.exists());
    }
}
