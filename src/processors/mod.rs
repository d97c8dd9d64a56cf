//! Data processing modules.

pub mod clustering;
pub mod fitting;
pub mod splitting;

// Re-export key types for convenience
pub use clustering::{dbscan, dbscan_fit, partition, Cluster, Clusterer, Dbscan, Labeling, NOISE_LABEL};
pub use fitting::{
    arc_length, filament_fit, spacing, trace_filament, ArcLength, CurveFit, CurveFitter,
    FitError, Filament, PolynomialModel, RansacPolyFitter,
};
pub use splitting::{split_coordinates, SplitError, SplitSummary};
