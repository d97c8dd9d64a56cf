//! DBSCAN clustering of particle coordinates.
//!
//! This module implements a parallelized DBSCAN using:
//! - `kiddo` KD-tree for radius neighbor queries
//! - `rayon` for parallel neighbor finding and core point identification
//! - Atomic union-find for lock-free merging of core points
//!
//! The clustering step sits behind the [`Clusterer`] trait (points in,
//! [`Labeling`] out) so the pipeline does not depend on one algorithm.
//!
//! # Example
//!
//! ```no_run
//! use filament_pipeline::processors::clustering::{dbscan, partition};
//!
//! let points = vec![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [500.0, 500.0]];
//! let labeling = dbscan(&points, 15.0, 3);
//! let clusters = partition(&points, &labeling);
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use kiddo::immutable::float::kdtree::ImmutableKdTree;
use kiddo::SquaredEuclidean;
use rayon::prelude::*;

use crate::config::ClusteringConfig;
use crate::core::loaders::CoordinateSet;
use crate::visualization::{spectral, Figure, MarkerStyle};
use plotters::style::{RGBColor, BLACK};

/// Label reserved for noise points.
pub const NOISE_LABEL: i32 = -1;

/// Marker radius for core points.
const CORE_MARKER_RADIUS: u32 = 7;

/// Marker radius for border and noise points.
const BORDER_MARKER_RADIUS: u32 = 3;

/// Atomic Union-Find data structure for lock-free parallel cluster merging.
///
/// Roots are merged with compare-and-swap so several threads can union
/// core points at once.
pub struct AtomicUnionFind {
    parent: Vec<AtomicUsize>,
}

impl AtomicUnionFind {
    /// Create a new union-find structure where each element is its own parent.
    #[inline]
    pub fn new(size: usize) -> Self {
        let parent = (0..size).map(AtomicUsize::new).collect();
        Self { parent }
    }

    /// Find the root of the set containing `x`, halving the path as it goes.
    #[inline]
    pub fn find(&self, mut x: usize) -> usize {
        loop {
            let p = self.parent[x].load(Ordering::Relaxed);
            if p == x {
                return x;
            }
            let gp = self.parent[p].load(Ordering::Relaxed);
            if gp != p {
                // Losing this race is fine, another thread compressed it
                let _ = self.parent[x].compare_exchange_weak(
                    p,
                    gp,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                );
            }
            x = p;
        }
    }

    /// Union the sets containing `x` and `y`.
    ///
    /// Returns true if a merge occurred, false if they were already joined.
    #[inline]
    pub fn union(&self, x: usize, y: usize) -> bool {
        loop {
            let root_x = self.find(x);
            let root_y = self.find(y);

            if root_x == root_y {
                return false;
            }

            let (small, large) = if root_x < root_y {
                (root_x, root_y)
            } else {
                (root_y, root_x)
            };

            if self.parent[small]
                .compare_exchange_weak(small, large, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }
}

/// Per-point output of a clusterer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Labeling {
    /// Cluster label per point; [`NOISE_LABEL`] for noise.
    pub labels: Vec<i32>,
    /// Whether each point is a core point.
    pub core_mask: Vec<bool>,
}

impl Labeling {
    /// Number of clusters, ignoring noise.
    pub fn n_clusters(&self) -> usize {
        let mut seen: Vec<i32> = self
            .labels
            .iter()
            .copied()
            .filter(|&l| l != NOISE_LABEL)
            .collect();
        seen.sort_unstable();
        seen.dedup();
        seen.len()
    }

    /// Number of points labeled as noise.
    pub fn n_noise(&self) -> usize {
        self.labels.iter().filter(|&&l| l == NOISE_LABEL).count()
    }
}

/// Points sharing one label.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    /// Cluster label, or [`NOISE_LABEL`].
    pub label: i32,
    /// Core points first, then border points, each in input order.
    pub points: Vec<[f64; 2]>,
    /// Number of leading entries of `points` that are core points.
    pub core_count: usize,
}

impl Cluster {
    #[inline]
    pub fn is_noise(&self) -> bool {
        self.label == NOISE_LABEL
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Core points of the cluster.
    pub fn core(&self) -> &[[f64; 2]] {
        &self.points[..self.core_count]
    }

    /// Border (non-core) points of the cluster.
    pub fn border(&self) -> &[[f64; 2]] {
        &self.points[self.core_count..]
    }
}

/// A density-based clustering capability: points in, labeling out.
pub trait Clusterer {
    fn cluster(&self, points: &[[f64; 2]]) -> Labeling;
}

/// DBSCAN parameters.
#[derive(Debug, Clone, Copy)]
pub struct Dbscan {
    pub eps: f64,
    pub min_samples: usize,
}

impl From<&ClusteringConfig> for Dbscan {
    fn from(config: &ClusteringConfig) -> Self {
        Self {
            eps: config.eps,
            min_samples: config.min_samples,
        }
    }
}

impl Clusterer for Dbscan {
    fn cluster(&self, points: &[[f64; 2]]) -> Labeling {
        dbscan(points, self.eps, self.min_samples)
    }
}

/// DBSCAN clustering of 2D points.
///
/// A core point has at least `min_samples` points (itself included) within
/// `eps`. Core points within `eps` of each other share a cluster; a non-core
/// point within `eps` of a core point joins that core point's cluster;
/// everything else is noise.
///
/// # Algorithm (Parallelized)
///
/// 1. **Build KD-tree** over all points using kiddo
/// 2. **Parallel neighbor finding** with radius queries
/// 3. **Core point identification** from neighbor counts
/// 4. **Lock-free cluster formation**: union every core point with its core
///    neighbors
/// 5. **Label assignment**: clusters are numbered from 0 in order of their
///    first core point; border points take the cluster of their nearest core
///    neighbor; the rest get [`NOISE_LABEL`]
///
/// # Arguments
///
/// * `points` - N x 2 coordinates
/// * `eps` - Neighborhood radius
/// * `min_samples` - Minimum neighborhood size for a core point
pub fn dbscan(points: &[[f64; 2]], eps: f64, min_samples: usize) -> Labeling {
    let n = points.len();
    if n == 0 {
        return Labeling::default();
    }

    let tree: ImmutableKdTree<f64, u64, 2, 32> = ImmutableKdTree::new_from_slice(points);
    let eps_sq = eps * eps;
    // `within` excludes points at exactly the query radius
    let query_radius = eps_sq * (1.0 + 1e-9) + f64::MIN_POSITIVE;

    // Neighbors come back sorted by distance, so the first core neighbor of
    // a border point is its nearest one
    let neighbors: Vec<Vec<usize>> = points
        .par_iter()
        .map(|point| {
            tree.within::<SquaredEuclidean>(point, query_radius)
                .iter()
                .filter(|nn| nn.distance <= eps_sq)
                .map(|nn| nn.item as usize)
                .collect()
        })
        .collect();

    let core_mask: Vec<bool> = neighbors
        .par_iter()
        .map(|neigh| neigh.len() >= min_samples)
        .collect();

    let uf = AtomicUnionFind::new(n);
    (0..n).into_par_iter().for_each(|i| {
        if core_mask[i] {
            for &j in &neighbors[i] {
                if core_mask[j] {
                    uf.union(i, j);
                }
            }
        }
    });

    let mut root_to_cluster: HashMap<usize, i32> = HashMap::new();
    let mut next_cluster_id: i32 = 0;
    for i in (0..n).filter(|&i| core_mask[i]) {
        root_to_cluster.entry(uf.find(i)).or_insert_with(|| {
            let id = next_cluster_id;
            next_cluster_id += 1;
            id
        });
    }

    let labels = (0..n)
        .map(|i| {
            if core_mask[i] {
                root_to_cluster[&uf.find(i)]
            } else {
                neighbors[i]
                    .iter()
                    .find(|&&j| core_mask[j])
                    .map_or(NOISE_LABEL, |&j| root_to_cluster[&uf.find(j)])
            }
        })
        .collect();

    Labeling { labels, core_mask }
}

/// Group points by label.
///
/// Clusters are ordered by ascending label with the noise cluster (if any)
/// last. Every input point appears in exactly one cluster.
pub fn partition(points: &[[f64; 2]], labeling: &Labeling) -> Vec<Cluster> {
    // label -> (core, border)
    let mut groups: BTreeMap<i32, (Vec<[f64; 2]>, Vec<[f64; 2]>)> = BTreeMap::new();
    for ((point, &label), &is_core) in points
        .iter()
        .zip(labeling.labels.iter())
        .zip(labeling.core_mask.iter())
    {
        let (core, border) = groups.entry(label).or_default();
        if is_core {
            core.push(*point);
        } else {
            border.push(*point);
        }
    }

    let noise = groups.remove(&NOISE_LABEL);
    groups
        .into_iter()
        .chain(noise.map(|group| (NOISE_LABEL, group)))
        .map(|(label, (mut core, border))| {
            let core_count = core.len();
            core.extend(border);
            Cluster {
                label,
                points: core,
                core_count,
            }
        })
        .collect()
}

/// Color of each cluster: evenly spaced samples of the Spectral colormap over
/// the label set, black for noise.
pub fn cluster_colors(clusters: &[Cluster]) -> Vec<RGBColor> {
    let n = clusters.len();
    clusters
        .iter()
        .enumerate()
        .map(|(i, cluster)| {
            if cluster.is_noise() {
                BLACK
            } else if n <= 1 {
                spectral(0.0)
            } else {
                spectral(i as f64 / (n - 1) as f64)
            }
        })
        .collect()
}

/// Draw clusters onto a figure: core points as large markers, border points
/// as small markers, all with a black edge.
pub fn draw_clusters(figure: &mut Figure, clusters: &[Cluster]) {
    for (cluster, color) in clusters.iter().zip(cluster_colors(clusters)) {
        let core = MarkerStyle::new(color, CORE_MARKER_RADIUS).with_edge(BLACK);
        let border = MarkerStyle::new(color, BORDER_MARKER_RADIUS).with_edge(BLACK);
        figure.scatter(cluster.core(), core);
        figure.scatter(cluster.border(), border);
    }
}

/// Cluster one coordinate set with any clusterer and draw the result.
///
/// Returns the clusters in [`partition`] order. Cluster and noise counts are
/// logged and used for the figure title.
pub fn cluster_and_plot<C: Clusterer + ?Sized>(
    coords: &CoordinateSet,
    clusterer: &C,
    figure: &mut Figure,
) -> Vec<Cluster> {
    let points = coords.to_points();
    let labeling = clusterer.cluster(&points);

    let n_clusters = labeling.n_clusters();
    let n_noise = labeling.n_noise();
    log::info!(
        "Estimated number of clusters: {}, noise points: {}",
        n_clusters,
        n_noise
    );

    let clusters = partition(&points, &labeling);
    for cluster in &clusters {
        log::debug!(
            "cluster {}: {} points ({} core)",
            cluster.label,
            cluster.len(),
            cluster.core_count
        );
    }

    draw_clusters(figure, &clusters);
    figure.set_title(format!("Estimated number of clusters: {}", n_clusters));

    clusters
}

/// Run DBSCAN on one coordinate set and draw the labeled scatter plot.
///
/// # Arguments
///
/// * `coords` - Coordinates of one micrograph
/// * `config` - Clustering configuration (eps, min_samples)
/// * `figure` - Figure receiving the scatter layers and title
///
/// # Returns
///
/// Per-cluster point lists, noise included under [`NOISE_LABEL`].
pub fn dbscan_fit(
    coords: &CoordinateSet,
    config: &ClusteringConfig,
    figure: &mut Figure,
) -> Vec<Cluster> {
    cluster_and_plot(coords, &Dbscan::from(config), figure)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_with_outlier() -> Vec<[f64; 2]> {
        vec![[0.0, 0.0], [1.0, 0.0], [2.0, 0.0], [3.0, 0.0], [50.0, 50.0]]
    }

    #[test]
    fn test_atomic_union_find_basic() {
        let uf = AtomicUnionFind::new(5);

        assert_eq!(uf.find(0), 0);
        assert_eq!(uf.find(4), 4);

        assert!(uf.union(0, 1));
        assert_eq!(uf.find(0), uf.find(1));

        assert!(uf.union(2, 3));
        assert_ne!(uf.find(0), uf.find(2));

        assert!(uf.union(1, 2));
        assert_eq!(uf.find(0), uf.find(3));
        assert!(!uf.union(0, 3));
    }

    #[test]
    fn test_dbscan_two_clusters() {
        let points = vec![
            [0.0, 0.0],
            [1.0, 0.0],
            [0.0, 1.0],
            [1.0, 1.0],
            [100.0, 100.0],
            [101.0, 100.0],
            [100.0, 101.0],
            [101.0, 101.0],
        ];

        let labeling = dbscan(&points, 5.0, 2);

        assert_eq!(labeling.labels, vec![0, 0, 0, 0, 1, 1, 1, 1]);
        assert_eq!(labeling.n_clusters(), 2);
        assert_eq!(labeling.n_noise(), 0);
    }

    #[test]
    fn test_dbscan_core_border_noise() {
        let labeling = dbscan(&line_with_outlier(), 1.5, 3);

        assert_eq!(labeling.labels, vec![0, 0, 0, 0, NOISE_LABEL]);
        assert_eq!(labeling.core_mask, vec![false, true, true, false, false]);
        assert_eq!(labeling.n_clusters(), 1);
        assert_eq!(labeling.n_noise(), 1);
    }

    #[test]
    fn test_dbscan_min_samples_one_makes_every_point_core() {
        let labeling = dbscan(&line_with_outlier(), 1.5, 1);

        assert!(labeling.core_mask.iter().all(|&c| c));
        assert_eq!(labeling.labels, vec![0, 0, 0, 0, 1]);
    }

    #[test]
    fn test_dbscan_empty_and_single() {
        assert!(dbscan(&[], 15.0, 5).labels.is_empty());

        let single = dbscan(&[[3.0, 4.0]], 15.0, 2);
        assert_eq!(single.labels, vec![NOISE_LABEL]);
    }

    #[test]
    fn test_dbscan_neighbor_at_exactly_eps() {
        let labeling = dbscan(&[[0.0, 0.0], [9.0, 12.0]], 15.0, 2);

        assert_eq!(labeling.labels, vec![0, 0]);
        assert_eq!(labeling.core_mask, vec![true, true]);
    }

    #[test]
    fn test_dbscan_points_sharing_an_axis_value() {
        // Vertical filament: every pick has the same x
        let points: Vec<[f64; 2]> = (0..40).map(|i| [512.0, i as f64 * 4.0]).collect();

        let labeling = dbscan(&points, 15.0, 5);

        assert!(labeling.labels.iter().all(|&l| l == 0));
        assert_eq!(labeling.n_clusters(), 1);
        assert!(!labeling.core_mask[0]);
        assert!(labeling.core_mask[1]);
    }

    #[test]
    fn test_dbscan_repeated_points() {
        let mut points: Vec<[f64; 2]> = vec![[100.0, 100.0]; 20];
        points.extend((0..50).map(|i| [i as f64 * 4.0, 300.0]));

        let labeling = dbscan(&points, 15.0, 5);

        assert!(labeling.labels[..20].iter().all(|&l| l == 0));
        assert!(labeling.labels[20..].iter().all(|&l| l == 1));
        assert_eq!(labeling.n_noise(), 0);

        let stacked = vec![[7.0, 7.0]; 200];
        let labeling = dbscan(&stacked, 15.0, 5);
        assert!(labeling.labels.iter().all(|&l| l == 0));
    }

    #[test]
    fn test_partition_orders_core_then_border_noise_last() {
        let points = line_with_outlier();
        let clusters = partition(&points, &dbscan(&points, 1.5, 3));

        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].label, 0);
        assert_eq!(clusters[0].core(), &[[1.0, 0.0], [2.0, 0.0]]);
        assert_eq!(clusters[0].border(), &[[0.0, 0.0], [3.0, 0.0]]);
        assert!(clusters[1].is_noise());
        assert_eq!(clusters[1].points, vec![[50.0, 50.0]]);
        assert_eq!(clusters[1].core_count, 0);
    }

    #[test]
    fn test_partition_interleaved_labels() {
        let points = vec![[0.0, 0.0], [1.0, 1.0], [2.0, 2.0], [3.0, 3.0], [4.0, 4.0]];
        let labeling = Labeling {
            labels: vec![1, NOISE_LABEL, 0, 1, 0],
            core_mask: vec![false, false, true, true, true],
        };

        let clusters = partition(&points, &labeling);

        let labels: Vec<i32> = clusters.iter().map(|c| c.label).collect();
        assert_eq!(labels, vec![0, 1, NOISE_LABEL]);
        assert_eq!(clusters[0].points, vec![[2.0, 2.0], [4.0, 4.0]]);
        assert_eq!(clusters[1].core(), &[[3.0, 3.0]]);
        assert_eq!(clusters[1].border(), &[[0.0, 0.0]]);
        assert_eq!(clusters[2].points, vec![[1.0, 1.0]]);
    }

    #[test]
    fn test_partition_covers_every_point_once() {
        let mut points = Vec::new();
        for i in 0..30 {
            let t = i as f64;
            points.push([t * 4.0, 10.0 + (t * 0.7).sin()]);
            points.push([t * 4.0, 300.0 + t]);
            points.push([1000.0 + t * 97.0, -500.0 - t * 53.0]);
        }

        let labeling = dbscan(&points, 15.0, 5);
        let clusters = partition(&points, &labeling);

        let total: usize = clusters.iter().map(|c| c.len()).sum();
        assert_eq!(total, points.len());

        let mut flattened: Vec<[f64; 2]> =
            clusters.iter().flat_map(|c| c.points.iter().copied()).collect();
        let mut expected = points.clone();
        let key = |p: &[f64; 2]| (p[0].to_bits(), p[1].to_bits());
        flattened.sort_by_key(key);
        expected.sort_by_key(key);
        assert_eq!(flattened, expected);

        assert!(clusters.iter().any(|c| c.is_noise()));
        assert_eq!(labeling.n_clusters(), 2);
    }

    #[test]
    fn test_cluster_colors_noise_black() {
        let points = line_with_outlier();
        let clusters = partition(&points, &dbscan(&points, 1.5, 3));

        let colors = cluster_colors(&clusters);
        assert_eq!(colors[0], spectral(0.0));
        assert_eq!(colors[1], BLACK);
    }

    #[test]
    fn test_dbscan_fit_draws_layers_and_title() {
        let coords = CoordinateSet::from_points(&line_with_outlier());
        let config = ClusteringConfig {
            eps: 1.5,
            min_samples: 3,
        };
        let mut figure = Figure::new();

        let clusters = dbscan_fit(&coords, &config, &mut figure);

        assert_eq!(clusters.len(), 2);
        assert_eq!(figure.title(), Some("Estimated number of clusters: 1"));
        assert_eq!(figure.point_count(), 5);
    }
}
