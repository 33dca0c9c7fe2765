//! K-d tree over feature vectors with circular-dimension support.
//!
//! Stores `(key, payload)` pairs and supports insertion, removal, a full
//! walk with visit-kind reporting, and bounded k-nearest-neighbor search.
//! The distance metric is squared Euclidean with a per-dimension circular
//! correction: on a circular dimension, a coordinate difference larger than
//! half the range is replaced by `range - |difference|`.
//!
//! Two properties matter for correctness here:
//!
//! - Tree ordering uses raw coordinate comparisons (ties descend right), so
//!   lookup paths are reproducible for removal even with duplicate keys.
//! - On a circular split dimension, the distance from the query to the
//!   splitting plane is not a lower bound for points on the far side (they
//!   may be closer via wraparound), so search never prunes that branch.

use crate::param::ParamDesc;

/// How a node is being reported during a tree walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Visit {
    /// An interior node, reported before its children.
    Preorder,
    /// An interior node, reported after both children.
    Postorder,
    /// A node with no children.
    Leaf,
}

struct KdNode {
    key: Vec<f32>,
    payload: usize,
    left: Option<usize>,
    right: Option<usize>,
}

/// K-d tree keyed by feature vectors, carrying `usize` payloads.
pub(crate) struct KdTree {
    desc: Vec<ParamDesc>,
    nodes: Vec<KdNode>,
    free: Vec<usize>,
    root: Option<usize>,
    len: usize,
}

impl KdTree {
    pub(crate) fn new(desc: Vec<ParamDesc>) -> Self {
        Self {
            desc,
            nodes: Vec::new(),
            free: Vec::new(),
            root: None,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Payload at the tree root (after clustering completes this is the
    /// sole remaining entry).
    pub(crate) fn root_payload(&self) -> Option<usize> {
        self.root.map(|r| self.nodes[r].payload)
    }

    /// Squared Euclidean distance between two keys, with circular wrap.
    pub(crate) fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        self.desc
            .iter()
            .zip(a.iter().zip(b.iter()))
            .map(|(desc, (x, y))| {
                let mut diff = (x - y).abs();
                if desc.circular && diff > desc.half_range {
                    diff = desc.range - diff;
                }
                diff * diff
            })
            .sum()
    }

    pub(crate) fn insert(&mut self, key: &[f32], payload: usize) {
        self.insert_owned(key.to_vec(), payload);
    }

    fn insert_owned(&mut self, key: Vec<f32>, payload: usize) {
        let idx = self.alloc(key, payload);
        self.len += 1;

        let Some(mut cur) = self.root else {
            self.root = Some(idx);
            return;
        };
        let mut dim = 0;
        loop {
            let go_left = self.nodes[idx].key[dim] < self.nodes[cur].key[dim];
            let child = if go_left {
                self.nodes[cur].left
            } else {
                self.nodes[cur].right
            };
            match child {
                Some(c) => {
                    cur = c;
                    dim = (dim + 1) % self.desc.len();
                }
                None => {
                    if go_left {
                        self.nodes[cur].left = Some(idx);
                    } else {
                        self.nodes[cur].right = Some(idx);
                    }
                    return;
                }
            }
        }
    }

    /// Remove the entry matching both `key` and `payload`.
    ///
    /// The removed node's subtree is re-inserted entry by entry, which keeps
    /// the ordering invariant without any rebalancing machinery. Returns
    /// `false` if no such entry exists.
    pub(crate) fn remove(&mut self, key: &[f32], payload: usize) -> bool {
        let Some(mut cur) = self.root else {
            return false;
        };
        let mut parent: Option<(usize, bool)> = None;
        let mut dim = 0;
        loop {
            let node = &self.nodes[cur];
            if node.payload == payload && node.key.as_slice() == key {
                break;
            }
            let go_left = key[dim] < node.key[dim];
            let child = if go_left { node.left } else { node.right };
            match child {
                Some(c) => {
                    parent = Some((cur, go_left));
                    cur = c;
                    dim = (dim + 1) % self.desc.len();
                }
                None => return false,
            }
        }

        // Gather every descendant of the doomed node.
        let mut ids = Vec::new();
        let mut stack: Vec<usize> = Vec::new();
        stack.extend(self.nodes[cur].left);
        stack.extend(self.nodes[cur].right);
        while let Some(i) = stack.pop() {
            stack.extend(self.nodes[i].left);
            stack.extend(self.nodes[i].right);
            ids.push(i);
        }

        match parent {
            Some((p, true)) => self.nodes[p].left = None,
            Some((p, false)) => self.nodes[p].right = None,
            None => self.root = None,
        }
        self.free.push(cur);
        self.len -= 1 + ids.len();

        for id in ids {
            let key = std::mem::take(&mut self.nodes[id].key);
            let payload = self.nodes[id].payload;
            self.free.push(id);
            self.insert_owned(key, payload);
        }
        true
    }

    /// Visit every node, reporting interior nodes before their children
    /// (`Preorder`) and after them (`Postorder`), and childless nodes as
    /// `Leaf`. Uses an explicit stack; input trees can be deep.
    pub(crate) fn walk<F: FnMut(usize, Visit)>(&self, mut visitor: F) {
        let mut stack: Vec<(usize, u8)> = Vec::new();
        if let Some(root) = self.root {
            stack.push((root, 0));
        }
        while let Some((idx, stage)) = stack.pop() {
            let node = &self.nodes[idx];
            match stage {
                0 => {
                    if node.left.is_none() && node.right.is_none() {
                        visitor(node.payload, Visit::Leaf);
                    } else {
                        visitor(node.payload, Visit::Preorder);
                        stack.push((idx, 1));
                        if let Some(l) = node.left {
                            stack.push((l, 0));
                        }
                    }
                }
                1 => {
                    stack.push((idx, 2));
                    if let Some(r) = node.right {
                        stack.push((r, 0));
                    }
                }
                _ => visitor(node.payload, Visit::Postorder),
            }
        }
    }

    /// Find up to `k` entries nearest to `query`, each strictly closer than
    /// `max_distance` (squared), sorted by ascending distance.
    pub(crate) fn k_nearest(
        &self,
        query: &[f32],
        k: usize,
        max_distance: f32,
    ) -> Vec<(usize, f32)> {
        let mut results: Vec<(usize, f32)> = Vec::with_capacity(k + 1);
        if let Some(root) = self.root {
            self.search(root, 0, query, k, max_distance, &mut results);
        }
        results
    }

    fn search(
        &self,
        idx: usize,
        dim: usize,
        query: &[f32],
        k: usize,
        max_distance: f32,
        results: &mut Vec<(usize, f32)>,
    ) {
        let node = &self.nodes[idx];
        let dist = self.distance(query, &node.key);
        let worst = if results.len() < k {
            max_distance
        } else {
            results[results.len() - 1].1
        };
        if dist < worst {
            let pos = results.partition_point(|r| r.1 <= dist);
            results.insert(pos, (node.payload, dist));
            results.truncate(k);
        }

        let diff = query[dim] - node.key[dim];
        let (near, far) = if diff < 0.0 {
            (node.left, node.right)
        } else {
            (node.right, node.left)
        };
        let next_dim = (dim + 1) % self.desc.len();

        if let Some(n) = near {
            self.search(n, next_dim, query, k, max_distance, results);
        }
        if let Some(f) = far {
            let worst = if results.len() < k {
                max_distance
            } else {
                results[results.len() - 1].1
            };
            if self.desc[dim].circular || diff * diff < worst {
                self.search(f, next_dim, query, k, max_distance, results);
            }
        }
    }

    fn alloc(&mut self, key: Vec<f32>, payload: usize) -> usize {
        let node = KdNode {
            key,
            payload,
            left: None,
            right: None,
        };
        match self.free.pop() {
            Some(i) => {
                self.nodes[i] = node;
                i
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }
}
