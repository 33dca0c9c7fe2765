//! Prototypes: parametric summaries of accepted clusters.
//!
//! A prototype describes a cluster as a product of per-dimension
//! distributions. Spherical prototypes share a single variance across all
//! dimensions, elliptical prototypes carry one per dimension, and mixed
//! prototypes additionally let individual dimensions fall back to uniform
//! or range-wide random models when a normal fit is rejected.

use crate::param::ParamDesc;

use super::stats::Statistics;
use super::tree::{ClusterId, ClusterNode};

/// Variance floor applied to every stored variance, standing in for a
/// variance of zero when all samples in a dimension are identical.
/// Corresponds to a minimum standard deviation of 0.2% of a unit range.
pub const MIN_VARIANCE: f32 = 0.000004;

/// Requested (and resulting) prototype shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtoStyle {
    /// One shared variance across all dimensions.
    Spherical,
    /// An independent variance per dimension.
    Elliptical,
    /// Per-dimension distributions, not necessarily normal.
    Mixed,
    /// Try spherical, then elliptical, then mixed; keep the first fit.
    Automatic,
}

/// Per-dimension probability model within a mixed prototype.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Distribution {
    /// Gaussian about the cluster mean.
    Normal,
    /// Uniform over the window the samples actually occupy.
    Uniform,
    /// Uniform over the dimension's entire legal range.
    Random,
}

/// Variance, magnitude, and weight storage for a prototype.
#[derive(Clone, Debug)]
pub(crate) enum Variance {
    Spherical {
        variance: f32,
        magnitude: f32,
        weight: f32,
    },
    Elliptical {
        variance: Vec<f32>,
        magnitude: Vec<f32>,
        weight: Vec<f32>,
    },
}

/// Parametric description of one cluster.
#[derive(Clone, Debug)]
pub struct Prototype {
    style: ProtoStyle,
    significant: bool,
    num_samples: u32,
    cluster: ClusterId,
    mean: Vec<f32>,
    /// Per-dimension models; empty unless the style is mixed.
    distrib: Vec<Distribution>,
    variance: Variance,
    total_magnitude: f32,
    log_magnitude: f32,
}

impl Prototype {
    /// Spherical prototype: the shared variance is the cluster's average
    /// (geometric-mean) variance, floored at [`MIN_VARIANCE`].
    pub(crate) fn spherical(cluster: ClusterId, node: &ClusterNode, stats: &Statistics) -> Self {
        let dims = node.mean.len();
        let variance = stats.avg_variance.max(MIN_VARIANCE);
        let magnitude = 1.0 / (2.0 * std::f32::consts::PI * variance).sqrt();
        let total_magnitude = magnitude.powi(dims as i32);
        Self {
            style: ProtoStyle::Spherical,
            significant: true,
            num_samples: node.sample_count,
            cluster,
            mean: node.mean.clone(),
            distrib: Vec::new(),
            variance: Variance::Spherical {
                variance,
                magnitude,
                weight: 1.0 / variance,
            },
            total_magnitude,
            log_magnitude: total_magnitude.ln(),
        }
    }

    /// Elliptical prototype: per-dimension variances from the covariance
    /// diagonal, each floored at [`MIN_VARIANCE`].
    pub(crate) fn elliptical(cluster: ClusterId, node: &ClusterNode, stats: &Statistics) -> Self {
        let dims = node.mean.len();
        let mut variance = Vec::with_capacity(dims);
        let mut magnitude = Vec::with_capacity(dims);
        let mut weight = Vec::with_capacity(dims);
        let mut total_magnitude = 1.0f32;
        for i in 0..dims {
            let v = stats.covariance[i * dims + i].max(MIN_VARIANCE);
            let m = 1.0 / (2.0 * std::f32::consts::PI * v).sqrt();
            variance.push(v);
            magnitude.push(m);
            weight.push(1.0 / v);
            total_magnitude *= m;
        }
        Self {
            style: ProtoStyle::Elliptical,
            significant: true,
            num_samples: node.sample_count,
            cluster,
            mean: node.mean.clone(),
            distrib: Vec::new(),
            variance: Variance::Elliptical {
                variance,
                magnitude,
                weight,
            },
            total_magnitude,
            log_magnitude: total_magnitude.ln(),
        }
    }

    /// Mixed prototype: starts as an elliptical prototype with every
    /// dimension assumed normal; dimensions are re-modeled individually by
    /// [`make_dim_random`](Self::make_dim_random) and
    /// [`make_dim_uniform`](Self::make_dim_uniform) as fitting proceeds.
    pub(crate) fn mixed(cluster: ClusterId, node: &ClusterNode, stats: &Statistics) -> Self {
        let mut proto = Self::elliptical(cluster, node, stats);
        proto.style = ProtoStyle::Mixed;
        proto.distrib = vec![Distribution::Normal; node.mean.len()];
        proto
    }

    /// Re-model dimension `i` as uniform over the dimension's entire range.
    pub(crate) fn make_dim_random(&mut self, i: usize, desc: &ParamDesc) {
        self.distrib[i] = Distribution::Random;
        self.mean[i] = desc.mid_range;
        if let Variance::Elliptical {
            variance,
            magnitude,
            ..
        } = &mut self.variance
        {
            variance[i] = desc.half_range;
            // Swap this dimension's magnitude out of the running product.
            self.total_magnitude /= magnitude[i];
            magnitude[i] = 1.0 / desc.range;
            self.total_magnitude *= magnitude[i];
        }
        self.log_magnitude = self.total_magnitude.ln();
        // The weight is irrelevant for random dimensions and left untouched.
    }

    /// Re-model dimension `i` as uniform over the window the cluster's
    /// samples actually occupy.
    pub(crate) fn make_dim_uniform(&mut self, i: usize, cluster_mean: f32, stats: &Statistics) {
        self.distrib[i] = Distribution::Uniform;
        self.mean[i] = cluster_mean + (stats.min[i] + stats.max[i]) / 2.0;
        if let Variance::Elliptical {
            variance,
            magnitude,
            ..
        } = &mut self.variance
        {
            variance[i] = ((stats.max[i] - stats.min[i]) / 2.0).max(MIN_VARIANCE);
            self.total_magnitude /= magnitude[i];
            magnitude[i] = 1.0 / (2.0 * variance[i]);
            self.total_magnitude *= magnitude[i];
        }
        self.log_magnitude = self.total_magnitude.ln();
    }

    pub(crate) fn set_significant(&mut self, significant: bool) {
        self.significant = significant;
    }

    /// Shape of this prototype (never `Automatic`).
    pub fn style(&self) -> ProtoStyle {
        self.style
    }

    /// Whether the prototype rests on enough samples to be statistically
    /// meaningful. Degenerate clusters produce insignificant prototypes.
    pub fn significant(&self) -> bool {
        self.significant
    }

    /// Number of samples in the summarized cluster.
    pub fn num_samples(&self) -> u32 {
        self.num_samples
    }

    /// The summarized cluster, valid while the originating
    /// [`Clusterer`](super::Clusterer) is alive.
    pub fn cluster(&self) -> ClusterId {
        self.cluster
    }

    /// Mean in one dimension.
    pub fn mean(&self, dim: usize) -> f32 {
        self.mean[dim]
    }

    /// Full mean vector.
    pub fn means(&self) -> &[f32] {
        &self.mean
    }

    /// Variance in one dimension (the shared variance for spherical
    /// prototypes).
    pub fn variance(&self, dim: usize) -> f32 {
        match &self.variance {
            Variance::Spherical { variance, .. } => *variance,
            Variance::Elliptical { variance, .. } => variance[dim],
        }
    }

    /// Standard deviation in one dimension.
    ///
    /// For uniform and random dimensions of a mixed prototype the stored
    /// variance field already holds the half-width of the modeled range and
    /// is returned as-is.
    pub fn standard_deviation(&self, dim: usize) -> f32 {
        match &self.variance {
            Variance::Spherical { variance, .. } => variance.sqrt(),
            Variance::Elliptical { variance, .. } => match self.distribution(dim) {
                Distribution::Normal => variance[dim].sqrt(),
                Distribution::Uniform | Distribution::Random => variance[dim],
            },
        }
    }

    /// Per-dimension model; `Normal` for non-mixed prototypes.
    pub fn distribution(&self, dim: usize) -> Distribution {
        self.distrib.get(dim).copied().unwrap_or(Distribution::Normal)
    }

    /// Weight (`1/variance`) in one dimension. Meaningful for normal
    /// dimensions; uniform and random dimensions retain their pre-mutation
    /// value.
    pub fn weight(&self, dim: usize) -> f32 {
        match &self.variance {
            Variance::Spherical { weight, .. } => *weight,
            Variance::Elliptical { weight, .. } => weight[dim],
        }
    }

    /// Product of all per-dimension magnitudes.
    pub fn total_magnitude(&self) -> f32 {
        self.total_magnitude
    }

    /// Natural log of [`total_magnitude`](Self::total_magnitude).
    pub fn log_magnitude(&self) -> f32 {
        self.log_magnitude
    }
}
