//! Histogram buckets for chi-squared goodness-of-fit testing.
//!
//! A [`Buckets`] structure bins one dimension of a cluster's samples into
//! B cells chosen so that each cell holds approximately equal probability
//! mass under the target distribution, then compares observed and expected
//! counts with a chi-squared test. Cell assignment goes through a fixed
//! 1024-entry table mapping a "normalized" integer coordinate onto one of
//! the B cells; samples are normalized into that coordinate space per
//! distribution and clipped at the edges.
//!
//! Construction is the expensive part (table layout plus a chi-squared
//! inversion), so used structures are pooled per distribution and recycled:
//! a recycled histogram only needs its expected counts rescaled to the new
//! sample count, its threshold recomputed if the confidence changed, and
//! its observed counts zeroed.

use crate::param::ParamDesc;

use super::chi2::ChiCache;
use super::proto::Distribution;
use super::tree::{ClusterId, ClusterNode, SampleWalk};

/// Size of the normalized-coordinate lookup table. Always even.
pub(crate) const BUCKET_TABLE_SIZE: usize = 1024;

/// Number of standard deviations of the discrete normal distribution mapped
/// onto the lookup table; coordinates beyond that are clipped.
const NORMAL_EXTENT: f64 = 3.0;

const SQRT_2PI: f64 = 2.506628275;

// The discrete normal distribution underlying the lookup table: the table
// midpoint is the mean and the table spans +-NORMAL_EXTENT standard
// deviations.
const NORMAL_MEAN: f64 = (BUCKET_TABLE_SIZE / 2) as f64;
const NORMAL_STD_DEV: f64 = BUCKET_TABLE_SIZE as f64 / (2.0 * NORMAL_EXTENT);
const NORMAL_VARIANCE: f64 =
    (BUCKET_TABLE_SIZE * BUCKET_TABLE_SIZE) as f64 / (4.0 * NORMAL_EXTENT * NORMAL_EXTENT);
const NORMAL_MAGNITUDE: f64 = (2.0 * NORMAL_EXTENT) / (SQRT_2PI * BUCKET_TABLE_SIZE as f64);

/// Smallest and largest usable histogram sizes.
const MIN_BUCKETS: u16 = 5;
const MAX_BUCKETS: u16 = 39;

// Bucket-count selection by sample count (piecewise-linear between rows).
const COUNT_TABLE: [u32; 8] = [25, 200, 400, 600, 800, 1000, 1500, 2000];
const BUCKETS_TABLE: [u16; 8] = [MIN_BUCKETS, 16, 20, 24, 27, 30, 35, MAX_BUCKETS];

impl Distribution {
    /// Probability density over the discrete table coordinate.
    fn density(self, x: i32) -> f64 {
        match self {
            Distribution::Normal => {
                let distance = x as f64 - NORMAL_MEAN;
                NORMAL_MAGNITUDE * (-0.5 * distance * distance / NORMAL_VARIANCE).exp()
            }
            // Random shares the uniform density; the two differ only in the
            // parameters tested against (see the prototype fitting code).
            Distribution::Uniform | Distribution::Random => {
                if (0..=BUCKET_TABLE_SIZE as i32).contains(&x) {
                    1.0 / BUCKET_TABLE_SIZE as f64
                } else {
                    0.0
                }
            }
        }
    }

    /// Histogram cells consumed by the fitted parameters of this
    /// distribution, deducted from the degrees of freedom.
    fn degree_offset(self) -> u16 {
        match self {
            Distribution::Normal => 3,
            Distribution::Uniform => 3,
            Distribution::Random => 1,
        }
    }
}

/// Histogram for testing one dimension against a target distribution.
pub(crate) struct Buckets {
    pub(crate) distribution: Distribution,
    pub(crate) sample_count: u32,
    pub(crate) confidence: f64,
    /// Chi-squared test threshold for the current confidence.
    pub(crate) chi_squared: f64,
    /// Normalized coordinate -> cell index.
    bucket: Vec<u16>,
    /// Observed frequency per cell.
    pub(crate) count: Vec<u32>,
    /// Expected frequency per cell.
    pub(crate) expected: Vec<f32>,
}

impl Buckets {
    pub(crate) fn num_buckets(&self) -> usize {
        self.count.len()
    }

    /// Chi-squared goodness-of-fit: passes iff the accumulated statistic
    /// stays within the threshold.
    pub(crate) fn distribution_ok(&self) -> bool {
        let mut total = 0.0f32;
        for (&count, &expected) in self.count.iter().zip(self.expected.iter()) {
            let difference = count as f32 - expected;
            total += difference * difference / expected;
        }
        f64::from(total) <= self.chi_squared
    }

    fn reset_counts(&mut self) {
        for count in &mut self.count {
            *count = 0;
        }
    }

    /// Rescale expected counts to a new sample count.
    fn adjust(&mut self, new_sample_count: u32) {
        let factor = (f64::from(new_sample_count) / f64::from(self.sample_count)) as f32;
        for expected in &mut self.expected {
            *expected *= factor;
        }
        self.sample_count = new_sample_count;
    }
}

/// Optimum histogram size for a chi-squared test on `sample_count` samples,
/// interpolated (truncating) from the Bendat & Piersol table.
pub(crate) fn optimum_number_of_buckets(sample_count: u32) -> u16 {
    if sample_count < COUNT_TABLE[0] {
        return BUCKETS_TABLE[0];
    }
    for next in 1..COUNT_TABLE.len() {
        let last = next - 1;
        if sample_count <= COUNT_TABLE[next] {
            let slope = f32::from(BUCKETS_TABLE[next] - BUCKETS_TABLE[last])
                / (COUNT_TABLE[next] - COUNT_TABLE[last]) as f32;
            return (BUCKETS_TABLE[last] as f32
                + slope * (sample_count - COUNT_TABLE[last]) as f32) as u16;
        }
    }
    BUCKETS_TABLE[BUCKETS_TABLE.len() - 1]
}

/// Degrees of freedom for a test with the given histogram size, rounded up
/// to the next even number (which keeps the threshold series computable and
/// errs on the lenient side).
pub(crate) fn degrees_of_freedom(distribution: Distribution, histogram_buckets: u16) -> u16 {
    let adjusted = histogram_buckets - distribution.degree_offset();
    if adjusted % 2 == 1 {
        adjusted + 1
    } else {
        adjusted
    }
}

/// Per-distribution pool of recycled histograms plus the chi-squared memo.
pub(crate) struct BucketCache {
    pools: [Vec<Buckets>; 3],
    chi: ChiCache,
}

impl BucketCache {
    pub(crate) fn new() -> Self {
        Self {
            pools: [Vec::new(), Vec::new(), Vec::new()],
            chi: ChiCache::new(),
        }
    }

    /// Fetch a histogram for the given distribution, reusing a pooled one
    /// with a matching cell count when available.
    pub(crate) fn checkout(
        &mut self,
        distribution: Distribution,
        sample_count: u32,
        confidence: f64,
    ) -> Buckets {
        let desired = optimum_number_of_buckets(sample_count) as usize;
        let position = self.pools[distribution as usize]
            .iter()
            .position(|b| b.num_buckets() == desired);
        let Some(position) = position else {
            return self.make_buckets(distribution, sample_count, confidence);
        };

        let mut buckets = self.pools[distribution as usize].remove(position);
        if buckets.sample_count != sample_count {
            buckets.adjust(sample_count);
        }
        if buckets.confidence != confidence {
            buckets.confidence = confidence;
            buckets.chi_squared = self.chi.chi_squared(
                degrees_of_freedom(distribution, buckets.num_buckets() as u16),
                confidence,
            );
        }
        buckets.reset_counts();
        buckets
    }

    /// Return a histogram to its distribution's pool for later reuse.
    pub(crate) fn release(&mut self, buckets: Buckets) {
        self.pools[buckets.distribution as usize].push(buckets);
    }

    /// Build a histogram from scratch: pick the cell count, lay out the
    /// lookup table so cells carry near-equal probability mass, and
    /// integrate the density (trapezoidal, step 1) into expected counts.
    ///
    /// All supported distributions are symmetric about the table midpoint,
    /// so only the upper half is integrated; the table is then mirrored and
    /// the expected counts of mirrored cell pairs are combined.
    fn make_buckets(
        &mut self,
        distribution: Distribution,
        sample_count: u32,
        confidence: f64,
    ) -> Buckets {
        let num_buckets = optimum_number_of_buckets(sample_count) as usize;
        let chi_squared = self.chi.chi_squared(
            degrees_of_freedom(distribution, num_buckets as u16),
            confidence,
        );
        let mut buckets = Buckets {
            distribution,
            sample_count,
            confidence,
            chi_squared,
            bucket: vec![0; BUCKET_TABLE_SIZE],
            count: vec![0; num_buckets],
            expected: vec![0.0; num_buckets],
        };

        let bucket_probability = 1.0 / num_buckets as f64;
        let mut current_bucket = num_buckets / 2;
        let mut next_boundary = if num_buckets % 2 == 1 {
            bucket_probability / 2.0
        } else {
            bucket_probability
        };

        let mut probability = 0.0f64;
        let mut last_density = distribution.density((BUCKET_TABLE_SIZE / 2) as i32);
        for i in BUCKET_TABLE_SIZE / 2..BUCKET_TABLE_SIZE {
            let density = distribution.density(i as i32 + 1);
            let delta = integral(last_density, density, 1.0);
            probability += delta;
            if probability > next_boundary {
                if current_bucket < num_buckets - 1 {
                    current_bucket += 1;
                }
                next_boundary += bucket_probability;
            }
            buckets.bucket[i] = current_bucket as u16;
            buckets.expected[current_bucket] += (delta * f64::from(sample_count)) as f32;
            last_density = density;
        }
        // Leftover tail mass lands in the outermost cell reached.
        buckets.expected[current_bucket] += ((0.5 - probability) * f64::from(sample_count)) as f32;

        // Mirror the table into the lower half.
        let (mut i, mut j) = (0, BUCKET_TABLE_SIZE - 1);
        while i < j {
            buckets.bucket[i] = (num_buckets - 1) as u16 - buckets.bucket[j];
            i += 1;
            j -= 1;
        }

        // Fold the upper-half expected counts onto their mirror cells.
        let (mut i, mut j) = (0, num_buckets - 1);
        while i <= j {
            buckets.expected[i] += buckets.expected[j];
            i += 1;
            if j == 0 {
                break;
            }
            j -= 1;
        }

        buckets
    }
}

/// Trapezoidal approximation of an integral over a small x step.
fn integral(f1: f64, f2: f64, dx: f64) -> f64 {
    (f1 + f2) * dx / 2.0
}

/// Count one dimension of a cluster's samples into histogram cells.
///
/// For a normal target, `mean`/`std_dev` have their usual meanings; for
/// uniform and random targets they are the center and half-width of the
/// range. A zero standard deviation cannot be normalized, so a
/// pseudo-analysis applies instead: samples above the mean go to the last
/// cell, below it to the first, and exact matches round-robin across all
/// cells.
pub(crate) fn fill_buckets(
    buckets: &mut Buckets,
    nodes: &[ClusterNode],
    cluster: ClusterId,
    dim: usize,
    desc: &ParamDesc,
    mean: f32,
    std_dev: f32,
) {
    buckets.reset_counts();

    if std_dev == 0.0 {
        let mut i = 0;
        for sample in SampleWalk::new(nodes, cluster) {
            let value = nodes[sample].mean[dim];
            let cell = if value > mean {
                buckets.num_buckets() - 1
            } else if value < mean {
                0
            } else {
                i
            };
            buckets.count[cell] += 1;
            i += 1;
            if i >= buckets.num_buckets() {
                i = 0;
            }
        }
        return;
    }

    for sample in SampleWalk::new(nodes, cluster) {
        let value = nodes[sample].mean[dim];
        let slot = match buckets.distribution {
            Distribution::Normal => normal_bucket(desc, value, mean, std_dev),
            Distribution::Uniform | Distribution::Random => {
                uniform_bucket(desc, value, mean, std_dev)
            }
        };
        let cell = buckets.bucket[slot] as usize;
        buckets.count[cell] += 1;
    }
}

/// Normalize a sample value onto the discrete normal distribution's
/// coordinate space, clipping at the table edges.
fn normal_bucket(desc: &ParamDesc, mut x: f32, mean: f32, std_dev: f32) -> usize {
    if desc.circular {
        if x - mean > desc.half_range {
            x -= desc.range;
        } else if x - mean < -desc.half_range {
            x += desc.range;
        }
    }

    let coordinate = f64::from((x - mean) / std_dev) * NORMAL_STD_DEV + NORMAL_MEAN;
    clip_coordinate(coordinate)
}

/// Normalize a sample value onto the discrete uniform distribution's
/// coordinate space, clipping at the table edges.
fn uniform_bucket(desc: &ParamDesc, mut x: f32, mean: f32, std_dev: f32) -> usize {
    if desc.circular {
        if x - mean > desc.half_range {
            x -= desc.range;
        } else if x - mean < -desc.half_range {
            x += desc.range;
        }
    }

    let coordinate = f64::from((x - mean) / (2.0 * std_dev)) * BUCKET_TABLE_SIZE as f64
        + BUCKET_TABLE_SIZE as f64 / 2.0;
    clip_coordinate(coordinate)
}

fn clip_coordinate(coordinate: f64) -> usize {
    if coordinate < 0.0 {
        0
    } else if coordinate > (BUCKET_TABLE_SIZE - 1) as f64 {
        BUCKET_TABLE_SIZE - 1
    } else {
        coordinate.floor() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::super::tree::ClusterNode;
    use super::*;

    #[test]
    fn test_bucket_count_selection() {
        assert_eq!(optimum_number_of_buckets(0), 5);
        assert_eq!(optimum_number_of_buckets(24), 5);
        assert_eq!(optimum_number_of_buckets(200), 16);
        assert_eq!(optimum_number_of_buckets(1000), 30);
        assert_eq!(optimum_number_of_buckets(2000), 39);
        assert_eq!(optimum_number_of_buckets(100_000), 39);
        // Interpolated, truncating: 5 + 11/175 * 75 = 9.71 -> 9.
        assert_eq!(optimum_number_of_buckets(100), 9);
    }

    #[test]
    fn test_degrees_of_freedom_rounds_up_to_even() {
        assert_eq!(degrees_of_freedom(Distribution::Normal, 5), 2);
        assert_eq!(degrees_of_freedom(Distribution::Normal, 16), 14);
        assert_eq!(degrees_of_freedom(Distribution::Uniform, 16), 14);
        assert_eq!(degrees_of_freedom(Distribution::Random, 5), 4);
        assert_eq!(degrees_of_freedom(Distribution::Random, 16), 16);
    }

    #[test]
    fn test_expected_counts_sum_to_sample_count() {
        let mut cache = BucketCache::new();
        for distribution in [
            Distribution::Normal,
            Distribution::Uniform,
            Distribution::Random,
        ] {
            let buckets = cache.checkout(distribution, 300, 0.05);
            let total: f32 = buckets.expected.iter().sum();
            assert!(
                (total - 300.0).abs() < 1.0,
                "{distribution:?}: expected mass {total}"
            );
            // Every cell must carry some expected mass.
            assert!(buckets.expected.iter().all(|&e| e > 0.0));
            cache.release(buckets);
        }
    }

    #[test]
    fn test_uniform_cells_have_equal_mass() {
        let mut cache = BucketCache::new();
        let buckets = cache.checkout(Distribution::Uniform, 200, 0.05);
        let per_cell = 200.0 / buckets.num_buckets() as f32;
        for &expected in &buckets.expected {
            assert!((expected - per_cell).abs() < 1.0, "cell mass {expected}");
        }
    }

    #[test]
    fn test_checkout_release_round_trip() {
        let mut cache = BucketCache::new();
        let mut first = cache.checkout(Distribution::Normal, 100, 0.05);
        let expected_before: Vec<f32> = first.expected.clone();
        first.count[0] = 42;
        cache.release(first);

        // Same arguments: the pooled histogram comes back zeroed, with the
        // expected counts untouched.
        let second = cache.checkout(Distribution::Normal, 100, 0.05);
        assert!(second.count.iter().all(|&c| c == 0));
        assert_eq!(second.expected, expected_before);
    }

    #[test]
    fn test_checkout_rescales_expected_counts() {
        let mut cache = BucketCache::new();
        let first = cache.checkout(Distribution::Normal, 100, 0.05);
        let expected_before: Vec<f32> = first.expected.clone();
        cache.release(first);

        // 120 samples still map to the same cell count as 100.
        let second = cache.checkout(Distribution::Normal, 120, 0.05);
        assert_eq!(second.sample_count, 120);
        for (&before, &after) in expected_before.iter().zip(second.expected.iter()) {
            assert!((after - before * 1.2).abs() < 1e-3);
        }
    }

    #[test]
    fn test_checkout_recomputes_threshold_on_confidence_change() {
        let mut cache = BucketCache::new();
        let first = cache.checkout(Distribution::Normal, 100, 0.05);
        let loose = first.chi_squared;
        cache.release(first);

        let second = cache.checkout(Distribution::Normal, 100, 0.001);
        // Smaller alpha pushes the threshold further into the tail.
        assert!(second.chi_squared > loose);
    }

    fn leaf_cluster(values: &[f32]) -> (Vec<ClusterNode>, ClusterId) {
        let mut nodes: Vec<ClusterNode> = values
            .iter()
            .enumerate()
            .map(|(i, &v)| ClusterNode::leaf(vec![v], i as u32))
            .collect();
        let mean = values.iter().sum::<f32>() / values.len() as f32;
        let mut top = 0;
        for i in 1..values.len() {
            let count = (i + 1) as u32;
            nodes.push(ClusterNode::merged(vec![mean], count, top, i));
            top = nodes.len() - 1;
        }
        (nodes, top)
    }

    #[test]
    fn test_fill_buckets_counts_all_samples() {
        let desc = ParamDesc::linear(0.0, 1.0);
        let values: Vec<f32> = (0..40).map(|i| 0.3 + 0.01 * i as f32).collect();
        let (nodes, root) = leaf_cluster(&values);

        let mut cache = BucketCache::new();
        let mut buckets = cache.checkout(Distribution::Normal, 40, 0.05);
        fill_buckets(&mut buckets, &nodes, root, 0, &desc, 0.5, 0.12);
        let total: u32 = buckets.count.iter().sum();
        assert_eq!(total, 40);
    }

    #[test]
    fn test_fill_buckets_zero_stddev_round_robin() {
        let desc = ParamDesc::linear(0.0, 1.0);
        // Ten samples exactly at the mean: the round-robin pseudo-analysis
        // spreads them evenly across the five cells.
        let (nodes, root) = leaf_cluster(&[0.5; 10]);

        let mut cache = BucketCache::new();
        let mut buckets = cache.checkout(Distribution::Normal, 10, 0.05);
        fill_buckets(&mut buckets, &nodes, root, 0, &desc, 0.5, 0.0);
        assert_eq!(buckets.count, vec![2, 2, 2, 2, 2]);
    }

    #[test]
    fn test_fill_buckets_zero_stddev_outliers_go_to_edges() {
        let desc = ParamDesc::linear(0.0, 1.0);
        let (nodes, root) = leaf_cluster(&[0.4, 0.4, 0.6, 0.6, 0.6]);

        let mut cache = BucketCache::new();
        let mut buckets = cache.checkout(Distribution::Normal, 5, 0.05);
        fill_buckets(&mut buckets, &nodes, root, 0, &desc, 0.5, 0.0);
        assert_eq!(buckets.count[0], 2);
        assert_eq!(buckets.count[4], 3);
    }

    #[test]
    fn test_gof_accepts_matching_normal_data() {
        let desc = ParamDesc::linear(0.0, 1.0);
        // Bell-shaped layout around 0.5: sum of three low-discrepancy
        // uniforms, so the shape is deterministic.
        let mut values = Vec::new();
        for i in 0..50 {
            let u1 = (i as f32 + 0.5) / 50.0;
            let u2 = (i as f32 * 0.618_034).fract();
            let u3 = (i as f32 * 0.414_214).fract();
            let z = (u1 + u2 + u3 - 1.5) * 2.0;
            values.push(0.5 + 0.1 * z);
        }
        let (nodes, root) = leaf_cluster(&values);

        let mut cache = BucketCache::new();
        let mut buckets = cache.checkout(Distribution::Normal, 50, 0.001);
        fill_buckets(&mut buckets, &nodes, root, 0, &desc, 0.5, 0.1);
        assert!(buckets.distribution_ok());
    }

    #[test]
    fn test_gof_rejects_two_point_data_as_normal() {
        let desc = ParamDesc::linear(0.0, 1.0);
        let mut values = vec![0.1; 25];
        values.extend(vec![0.9; 25]);
        let (nodes, root) = leaf_cluster(&values);

        let mut cache = BucketCache::new();
        let mut buckets = cache.checkout(Distribution::Normal, 50, 0.05);
        fill_buckets(&mut buckets, &nodes, root, 0, &desc, 0.5, 0.4);
        assert!(!buckets.distribution_ok());
    }
}
