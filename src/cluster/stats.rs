//! Per-cluster statistics: covariance, deviation ranges, independence test.

use crate::param::ParamDesc;

use super::tree::{ClusterId, ClusterNode, SampleWalk};

/// Covariance and deviation ranges for the samples of one cluster.
///
/// Deviations are measured from the cluster mean with circular wrap applied,
/// so an incremental accumulation over raw values would not work here; the
/// cluster's samples are walked directly instead.
pub(crate) struct Statistics {
    /// Geometric mean of the diagonal variances.
    pub(crate) avg_variance: f32,
    /// Row-major `n x n` covariance matrix.
    pub(crate) covariance: Vec<f32>,
    /// Largest negative deviation from the mean, per dimension.
    pub(crate) min: Vec<f32>,
    /// Largest positive deviation from the mean, per dimension.
    pub(crate) max: Vec<f32>,
}

pub(crate) fn compute_statistics(
    desc: &[ParamDesc],
    nodes: &[ClusterNode],
    cluster: ClusterId,
) -> Statistics {
    let n = desc.len();
    let mut covariance = vec![0.0f32; n * n];
    let mut min = vec![0.0f32; n];
    let mut max = vec![0.0f32; n];
    let mut deviation = vec![0.0f32; n];

    let cluster_mean = &nodes[cluster].mean;
    for sample in SampleWalk::new(nodes, cluster) {
        let sample_mean = &nodes[sample].mean;
        for i in 0..n {
            let mut d = sample_mean[i] - cluster_mean[i];
            if desc[i].circular {
                if d > desc[i].half_range {
                    d -= desc[i].range;
                }
                if d < -desc[i].half_range {
                    d += desc[i].range;
                }
            }
            if d < min[i] {
                min[i] = d;
            }
            if d > max[i] {
                max[i] = d;
            }
            deviation[i] = d;
        }
        for i in 0..n {
            for j in 0..n {
                covariance[i * n + j] += deviation[i] * deviation[j];
            }
        }
    }

    // Bessel correction, guarded so a single-sample cluster divides by 1.
    let adjusted = nodes[cluster].sample_count.saturating_sub(1).max(1) as f32;
    let mut avg_variance = 1.0f32;
    for i in 0..n {
        for j in 0..n {
            covariance[i * n + j] /= adjusted;
            if i == j {
                avg_variance *= covariance[i * n + j];
            }
        }
    }
    avg_variance = avg_variance.powf(1.0 / n as f32);

    Statistics {
        avg_variance,
        covariance,
        min,
        max,
    }
}

/// Whether all essential dimensions are pairwise independent.
///
/// The correlation coefficient is `sqrt(sqrt(cov_ij^2 / (var_ii * var_jj)))`,
/// or 0 when either variance is 0. The double square root is intentional;
/// the `independence` threshold is calibrated against it.
pub(crate) fn independent(desc: &[ParamDesc], covariance: &[f32], independence: f32) -> bool {
    let n = desc.len();
    for i in 0..n {
        if desc[i].non_essential {
            continue;
        }
        for j in (i + 1)..n {
            if desc[j].non_essential {
                continue;
            }
            let var_ii = covariance[i * n + i];
            let var_jj = covariance[j * n + j];
            let cov_ij = covariance[i * n + j];
            let coefficient = if var_ii == 0.0 || var_jj == 0.0 {
                0.0
            } else {
                (cov_ij * cov_ij / (var_ii * var_jj)).sqrt().sqrt()
            };
            if coefficient > independence {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::super::tree::ClusterNode;
    use super::*;

    fn two_sample_cluster(a: Vec<f32>, b: Vec<f32>) -> (Vec<ClusterNode>, ClusterId) {
        let dims = a.len();
        let mean: Vec<f32> = (0..dims).map(|i| (a[i] + b[i]) / 2.0).collect();
        let nodes = vec![
            ClusterNode::leaf(a, 0),
            ClusterNode::leaf(b, 1),
            ClusterNode::merged(mean, 2, 0, 1),
        ];
        (nodes, 2)
    }

    #[test]
    fn test_variance_of_two_samples() {
        let desc = vec![ParamDesc::linear(0.0, 1.0)];
        let (nodes, root) = two_sample_cluster(vec![0.4], vec![0.6]);
        let stats = compute_statistics(&desc, &nodes, root);
        // Deviations are +-0.1; Bessel-corrected variance = 2 * 0.01 / 1.
        assert!((stats.covariance[0] - 0.02).abs() < 1e-6);
        assert!((stats.min[0] + 0.1).abs() < 1e-6);
        assert!((stats.max[0] - 0.1).abs() < 1e-6);
        assert!((stats.avg_variance - 0.02).abs() < 1e-6);
    }

    #[test]
    fn test_single_sample_divides_by_one() {
        let desc = vec![ParamDesc::linear(0.0, 1.0)];
        let nodes = vec![ClusterNode::leaf(vec![0.3], 0)];
        let stats = compute_statistics(&desc, &nodes, 0);
        assert_eq!(stats.covariance[0], 0.0);
        assert_eq!(stats.avg_variance, 0.0);
    }

    #[test]
    fn test_circular_deviation_wraps() {
        let desc = vec![ParamDesc::circular(0.0, 360.0)];
        // Mean 0, samples at 358 and 2: wrapped deviations are -2 and +2.
        let nodes = vec![
            ClusterNode::leaf(vec![358.0], 0),
            ClusterNode::leaf(vec![2.0], 1),
            ClusterNode::merged(vec![0.0], 2, 0, 1),
        ];
        let stats = compute_statistics(&desc, &nodes, 2);
        assert!((stats.min[0] + 2.0).abs() < 1e-4);
        assert!((stats.max[0] - 2.0).abs() < 1e-4);
        assert!((stats.covariance[0] - 8.0).abs() < 1e-3);
    }

    #[test]
    fn test_avg_variance_is_geometric_mean() {
        let desc = vec![ParamDesc::linear(0.0, 1.0), ParamDesc::linear(0.0, 1.0)];
        let (nodes, root) = two_sample_cluster(vec![0.4, 0.3], vec![0.6, 0.7]);
        let stats = compute_statistics(&desc, &nodes, root);
        let expected = (stats.covariance[0] * stats.covariance[3]).sqrt();
        assert!((stats.avg_variance - expected).abs() < 1e-6);
    }

    #[test]
    fn test_independent_perfect_correlation_rejected() {
        let desc = vec![ParamDesc::linear(0.0, 1.0), ParamDesc::linear(0.0, 1.0)];
        let (nodes, root) = two_sample_cluster(vec![0.4, 0.4], vec![0.6, 0.6]);
        let stats = compute_statistics(&desc, &nodes, root);
        // Two perfectly correlated dimensions: coefficient is 1.
        assert!(!independent(&desc, &stats.covariance, 0.9));
        assert!(independent(&desc, &stats.covariance, 1.0));
    }

    #[test]
    fn test_independent_zero_variance_passes() {
        let desc = vec![ParamDesc::linear(0.0, 1.0), ParamDesc::linear(0.0, 1.0)];
        let (nodes, root) = two_sample_cluster(vec![0.5, 0.4], vec![0.5, 0.6]);
        let stats = compute_statistics(&desc, &nodes, root);
        assert!(independent(&desc, &stats.covariance, 0.1));
    }

    #[test]
    fn test_independent_skips_non_essential() {
        let desc = vec![
            ParamDesc::linear(0.0, 1.0),
            ParamDesc::linear(0.0, 1.0).non_essential(),
        ];
        let (nodes, root) = two_sample_cluster(vec![0.4, 0.4], vec![0.6, 0.6]);
        let stats = compute_statistics(&desc, &nodes, root);
        // The correlated pair involves a non-essential dimension.
        assert!(independent(&desc, &stats.covariance, 0.1));
    }
}
