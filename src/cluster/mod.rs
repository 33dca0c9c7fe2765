//! Agglomerative clustering and prototype extraction.
//!
//! The engine runs in two phases:
//!
//! 1. **Tree construction** (bottom-up). Every sample sits in a k-d tree
//!    keyed by its feature vector. Each sample and its nearest neighbor
//!    form a potential merge, prioritized by distance in a min-heap.
//!    Popping the heap repeatedly merges the closest pair into a new
//!    cluster whose mean replaces both members in the k-d tree, until a
//!    single root remains. Heap entries are never retracted; entries whose
//!    participants were absorbed by an earlier, shorter merge are detected
//!    at pop time and either skipped (stale main cluster) or refreshed with
//!    a newly computed nearest neighbor (stale neighbor).
//!
//! 2. **Prototype extraction** (top-down). Starting from the root, each
//!    cluster is either summarized by a parametric prototype or split into
//!    its children for another attempt. A cluster is summarized only if it
//!    does not lump together too many samples of the same source character,
//!    its dimensions are pairwise independent, and every essential
//!    dimension passes a chi-squared goodness-of-fit test against the
//!    requested distribution shape. Clusters with too few samples for the
//!    tests produce prototypes marked insignificant.
//!
//! The tree is built once per clusterer; re-invoking
//! [`Clusterer::cluster_samples`] with a different configuration re-derives
//! prototypes from the existing tree without re-clustering.

mod buckets;
mod chi2;
mod proto;
mod stats;
mod tree;

pub use proto::{Distribution, ProtoStyle, Prototype, MIN_VARIANCE};
pub use tree::{ClusterId, ClusterNode, Samples};

use crate::error::{Error, Result};
use crate::heap::MinHeap;
use crate::kdtree::{KdTree, Visit};
use crate::param::ParamDesc;

use buckets::{fill_buckets, BucketCache, Buckets};
use stats::{compute_statistics, independent, Statistics};
use tree::{merge_means, SampleWalk};

/// Parameters controlling prototype extraction.
#[derive(Clone, Copy, Debug)]
pub struct ClusterConfig {
    /// Desired prototype shape, or [`ProtoStyle::Automatic`] to take the
    /// first of spherical / elliptical / mixed that fits.
    pub proto_style: ProtoStyle,
    /// Minimum cluster size for a significant prototype, as a fraction of
    /// the number of distinct source characters.
    pub min_samples: f32,
    /// Maximum tolerated fraction of samples whose source character
    /// already contributed another sample to the same cluster, in `[0, 1]`.
    pub max_illegal: f32,
    /// Maximum tolerated correlation coefficient between two dimensions,
    /// in `[0, 1]`.
    pub independence: f32,
    /// Probability of a Type I error in the goodness-of-fit tests.
    pub confidence: f64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            proto_style: ProtoStyle::Elliptical,
            min_samples: 0.025,
            max_illegal: 0.05,
            independence: 0.8,
            confidence: 0.001,
        }
    }
}

/// A sample and its nearest neighbor, queued as a potential merge.
#[derive(Clone, Copy)]
struct PotentialPair {
    cluster: ClusterId,
    neighbor: ClusterId,
}

/// Clustering session: owns the samples, the cluster tree, and the caches
/// used by prototype extraction.
pub struct Clusterer {
    desc: Vec<ParamDesc>,
    nodes: Vec<ClusterNode>,
    root: Option<ClusterId>,
    /// Present until tree construction consumes it.
    index: Option<KdTree>,
    num_samples: u32,
    /// One greater than the largest char id seen.
    num_char: u32,
    cache: BucketCache,
}

impl Clusterer {
    /// Create a clusterer for the feature space described by `desc`.
    pub fn new(desc: Vec<ParamDesc>) -> Self {
        let index = KdTree::new(desc.clone());
        Self {
            desc,
            nodes: Vec::new(),
            root: None,
            index: Some(index),
            num_samples: 0,
            num_char: 0,
            cache: BucketCache::new(),
        }
    }

    /// Dimensionality of the feature space.
    pub fn dimension(&self) -> usize {
        self.desc.len()
    }

    /// Number of samples added so far.
    pub fn num_samples(&self) -> u32 {
        self.num_samples
    }

    /// One greater than the largest char id seen so far.
    pub fn num_char(&self) -> u32 {
        self.num_char
    }

    /// Root of the cluster tree, once [`cluster_samples`](Self::cluster_samples)
    /// has built it.
    pub fn root(&self) -> Option<ClusterId> {
        self.root
    }

    /// Look up a cluster node by id.
    pub fn node(&self, id: ClusterId) -> Option<&ClusterNode> {
        self.nodes.get(id)
    }

    /// Iterate over the leaf samples under `cluster`, leftmost first.
    pub fn samples(&self, cluster: ClusterId) -> Samples<'_> {
        Samples {
            walk: SampleWalk::new(&self.nodes, cluster),
        }
    }

    /// Add one sample with the id of the source character it came from.
    ///
    /// Fails with [`Error::AlreadyClustered`] once the cluster tree has
    /// been built: the tree cannot absorb new samples incrementally.
    pub fn add_sample(&mut self, features: &[f32], char_id: u32) -> Result<ClusterId> {
        if self.root.is_some() {
            return Err(Error::AlreadyClustered);
        }
        if features.len() != self.desc.len() {
            return Err(Error::DimensionMismatch {
                expected: self.desc.len(),
                found: features.len(),
            });
        }

        let id = self.nodes.len();
        self.nodes.push(ClusterNode::leaf(features.to_vec(), char_id));
        self.num_samples += 1;
        if let Some(index) = self.index.as_mut() {
            index.insert(features, id);
        }
        if char_id >= self.num_char {
            self.num_char = char_id + 1;
        }
        Ok(id)
    }

    /// Cluster the samples and return prototypes for the resulting tree.
    ///
    /// The tree is built on the first call; later calls only rerun
    /// prototype extraction, so the same sample set can be summarized under
    /// several configurations.
    pub fn cluster_samples(&mut self, config: &ClusterConfig) -> Vec<Prototype> {
        if self.num_samples == 0 {
            return Vec::new();
        }
        if self.root.is_none() {
            self.create_cluster_tree();
        }
        // The previous prototype list is gone; release its cluster marks.
        for node in &mut self.nodes {
            node.prototype = false;
        }
        self.compute_prototypes(config)
    }

    /// Bottom-up construction of the cluster tree (phase 1).
    fn create_cluster_tree(&mut self) {
        let Some(mut index) = self.index.take() else {
            return;
        };

        // Seed: every entry pairs up with its current nearest neighbor.
        let mut heap = MinHeap::with_capacity(self.num_samples as usize);
        index.walk(|payload, visit| {
            if matches!(visit, Visit::Preorder | Visit::Leaf) {
                if let Some((neighbor, distance)) = nearest_neighbor(&index, &self.nodes, payload)
                {
                    heap.push(
                        distance,
                        PotentialPair {
                            cluster: payload,
                            neighbor,
                        },
                    );
                }
            }
        });

        // Always merge the closest pair first. The stale-pair check must
        // come before the stale-neighbor check.
        while let Some((_, mut pair)) = heap.pop() {
            if self.nodes[pair.cluster].clustered {
                continue;
            } else if self.nodes[pair.neighbor].clustered {
                if let Some((neighbor, distance)) =
                    nearest_neighbor(&index, &self.nodes, pair.cluster)
                {
                    pair.neighbor = neighbor;
                    heap.push(distance, pair);
                }
            } else {
                let merged = self.merge_pair(&mut index, pair.cluster, pair.neighbor);
                if let Some((neighbor, distance)) = nearest_neighbor(&index, &self.nodes, merged) {
                    heap.push(
                        distance,
                        PotentialPair {
                            cluster: merged,
                            neighbor,
                        },
                    );
                }
            }
        }

        // The sole surviving index entry is the root; the index itself is
        // no longer needed and is dropped here.
        debug_assert_eq!(index.len(), 1);
        self.root = index.root_payload();
    }

    /// Merge two clusters into a new one, replacing them in the index.
    fn merge_pair(&mut self, index: &mut KdTree, left: ClusterId, right: ClusterId) -> ClusterId {
        let mean = merge_means(
            &self.desc,
            self.nodes[left].sample_count,
            &self.nodes[left].mean,
            self.nodes[right].sample_count,
            &self.nodes[right].mean,
        );
        let count = self.nodes[left].sample_count + self.nodes[right].sample_count;

        self.nodes[left].clustered = true;
        self.nodes[right].clustered = true;
        let removed = index.remove(&self.nodes[left].mean, left);
        debug_assert!(removed);
        let removed = index.remove(&self.nodes[right].mean, right);
        debug_assert!(removed);

        let id = self.nodes.len();
        self.nodes.push(ClusterNode::merged(mean, count, left, right));
        index.insert(&self.nodes[id].mean, id);
        id
    }

    /// Top-down prototype extraction (phase 2).
    fn compute_prototypes(&mut self, config: &ClusterConfig) -> Vec<Prototype> {
        let mut prototypes = Vec::new();
        let mut stack: Vec<ClusterId> = Vec::new();
        if let Some(root) = self.root {
            stack.push(root);
        }
        while let Some(cluster) = stack.pop() {
            match self.make_prototype(cluster, config) {
                Some(proto) => {
                    self.nodes[cluster].prototype = true;
                    prototypes.push(proto);
                }
                None => {
                    // Split and analyze the children, left one first.
                    let node = &self.nodes[cluster];
                    if let (Some(left), Some(right)) = (node.left, node.right) {
                        stack.push(right);
                        stack.push(left);
                    }
                }
            }
        }
        prototypes
    }

    /// Try to summarize one cluster under the configured constraints.
    fn make_prototype(&mut self, cluster: ClusterId, config: &ClusterConfig) -> Option<Prototype> {
        // A cluster fed by repeat samples of the same characters must be
        // split, not summarized.
        if self.multiple_char_samples(cluster, config.max_illegal) {
            return None;
        }

        let statistics = compute_statistics(&self.desc, &self.nodes, cluster);

        // Degenerate guard: too few samples to test hypotheses about the
        // underlying distribution. Summarize anyway, flagged insignificant.
        let min_samples = ((config.min_samples * self.num_char as f32) as i64).max(1);
        if i64::from(self.nodes[cluster].sample_count) < min_samples {
            let node = &self.nodes[cluster];
            let mut proto = match config.proto_style {
                ProtoStyle::Spherical => Prototype::spherical(cluster, node, &statistics),
                ProtoStyle::Elliptical | ProtoStyle::Automatic => {
                    Prototype::elliptical(cluster, node, &statistics)
                }
                ProtoStyle::Mixed => Prototype::mixed(cluster, node, &statistics),
            };
            proto.set_significant(false);
            return Some(proto);
        }

        if !independent(&self.desc, &statistics.covariance, config.independence) {
            return None;
        }

        let sample_count = self.nodes[cluster].sample_count;
        let mut normal = self
            .cache
            .checkout(Distribution::Normal, sample_count, config.confidence);
        let proto = match config.proto_style {
            ProtoStyle::Spherical => self.make_spherical(cluster, &statistics, &mut normal),
            ProtoStyle::Elliptical => self.make_elliptical(cluster, &statistics, &mut normal),
            ProtoStyle::Mixed => {
                self.make_mixed(cluster, &statistics, &mut normal, config.confidence)
            }
            ProtoStyle::Automatic => self
                .make_spherical(cluster, &statistics, &mut normal)
                .or_else(|| self.make_elliptical(cluster, &statistics, &mut normal))
                .or_else(|| self.make_mixed(cluster, &statistics, &mut normal, config.confidence)),
        };
        self.cache.release(normal);
        proto
    }

    /// Test every essential dimension against a normal distribution with
    /// the cluster's average variance.
    fn make_spherical(
        &self,
        cluster: ClusterId,
        statistics: &Statistics,
        buckets: &mut Buckets,
    ) -> Option<Prototype> {
        let std_dev = statistics.avg_variance.sqrt();
        for i in 0..self.desc.len() {
            if self.desc[i].non_essential {
                continue;
            }
            fill_buckets(
                buckets,
                &self.nodes,
                cluster,
                i,
                &self.desc[i],
                self.nodes[cluster].mean[i],
                std_dev,
            );
            if !buckets.distribution_ok() {
                return None;
            }
        }
        Some(Prototype::spherical(
            cluster,
            &self.nodes[cluster],
            statistics,
        ))
    }

    /// Test every essential dimension against a normal distribution with
    /// that dimension's own variance.
    fn make_elliptical(
        &self,
        cluster: ClusterId,
        statistics: &Statistics,
        buckets: &mut Buckets,
    ) -> Option<Prototype> {
        let dims = self.desc.len();
        for i in 0..dims {
            if self.desc[i].non_essential {
                continue;
            }
            fill_buckets(
                buckets,
                &self.nodes,
                cluster,
                i,
                &self.desc[i],
                self.nodes[cluster].mean[i],
                statistics.covariance[i * dims + i].sqrt(),
            );
            if !buckets.distribution_ok() {
                return None;
            }
        }
        Some(Prototype::elliptical(
            cluster,
            &self.nodes[cluster],
            statistics,
        ))
    }

    /// Fit each essential dimension with the first of normal, random, or
    /// uniform that passes; discard the prototype if a dimension fits none.
    ///
    /// The random and uniform histograms are only fetched if some dimension
    /// actually needs them, and go back to the pool on every exit path.
    fn make_mixed(
        &mut self,
        cluster: ClusterId,
        statistics: &Statistics,
        normal: &mut Buckets,
        confidence: f64,
    ) -> Option<Prototype> {
        let sample_count = self.nodes[cluster].sample_count;
        let mut proto = Prototype::mixed(cluster, &self.nodes[cluster], statistics);
        let mut random: Option<Buckets> = None;
        let mut uniform: Option<Buckets> = None;
        let mut failed = false;

        for i in 0..self.desc.len() {
            if self.desc[i].non_essential {
                continue;
            }

            fill_buckets(
                normal,
                &self.nodes,
                cluster,
                i,
                &self.desc[i],
                proto.mean(i),
                proto.variance(i).sqrt(),
            );
            if normal.distribution_ok() {
                continue;
            }

            let buckets = random.get_or_insert_with(|| {
                self.cache
                    .checkout(Distribution::Random, sample_count, confidence)
            });
            proto.make_dim_random(i, &self.desc[i]);
            fill_buckets(
                buckets,
                &self.nodes,
                cluster,
                i,
                &self.desc[i],
                proto.mean(i),
                proto.variance(i),
            );
            if buckets.distribution_ok() {
                continue;
            }

            let buckets = uniform.get_or_insert_with(|| {
                self.cache
                    .checkout(Distribution::Uniform, sample_count, confidence)
            });
            proto.make_dim_uniform(i, self.nodes[cluster].mean[i], statistics);
            fill_buckets(
                buckets,
                &self.nodes,
                cluster,
                i,
                &self.desc[i],
                proto.mean(i),
                proto.variance(i),
            );
            if buckets.distribution_ok() {
                continue;
            }

            failed = true;
            break;
        }

        if let Some(buckets) = uniform {
            self.cache.release(buckets);
        }
        if let Some(buckets) = random {
            self.cache.release(buckets);
        }
        if failed {
            None
        } else {
            Some(proto)
        }
    }

    /// Estimate, while walking the cluster's samples, the fraction of
    /// characters contributing more than one sample; `true` as soon as the
    /// running estimate exceeds `max_illegal`.
    fn multiple_char_samples(&self, cluster: ClusterId, max_illegal: f32) -> bool {
        #[derive(Clone, Copy, PartialEq)]
        enum Flag {
            Unseen,
            Seen,
            Illegal,
        }

        let mut flags = vec![Flag::Unseen; self.num_char as usize];
        let mut char_count = self.nodes[cluster].sample_count as i32;
        let mut illegal_count = 0i32;

        for sample in SampleWalk::new(&self.nodes, cluster) {
            let Some(char_id) = self.nodes[sample].char_id else {
                continue;
            };
            let flag = &mut flags[char_id as usize];
            match *flag {
                Flag::Unseen => *flag = Flag::Seen,
                Flag::Seen | Flag::Illegal => {
                    if *flag == Flag::Seen {
                        illegal_count += 1;
                        *flag = Flag::Illegal;
                    }
                    char_count -= 1;
                    if illegal_count as f32 / char_count as f32 > max_illegal {
                        return true;
                    }
                }
            }
        }
        false
    }
}

/// Nearest neighbor of `cluster` in the index, excluding itself.
///
/// Asks for two neighbors since the cluster's own entry is among them.
fn nearest_neighbor(
    index: &KdTree,
    nodes: &[ClusterNode],
    cluster: ClusterId,
) -> Option<(ClusterId, f32)> {
    index
        .k_nearest(&nodes[cluster].mean, 2, f32::MAX)
        .into_iter()
        .find(|&(payload, _)| payload != cluster)
}
