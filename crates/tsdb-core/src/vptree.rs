//! Vantage-point tree over an arbitrary distance function.

use std::collections::HashSet;

use rand::Rng;

#[derive(Debug, Clone, PartialEq)]
pub enum VpNode {
    Leaf(Vec<String>),
    Split {
        vantage: String,
        median: f64,
        left: Box<VpNode>,
        right: Box<VpNode>,
    },
}

/// Immutable once built. Queries return the keys of one leaf as a candidate
/// set; callers still need an exact pass over it.
#[derive(Debug, Clone)]
pub struct VpTree {
    root: VpNode,
    len: usize,
}

impl VpTree {
    /// `dist(vp, keys)` returns the distance from `vp` to each of `keys`,
    /// in order.
    pub fn build<F, R>(keys: Vec<String>, vantage_points: Vec<String>, mut dist: F, rng: &mut R) -> Self
    where
        F: FnMut(&str, &[String]) -> Vec<f64>,
        R: Rng + ?Sized,
    {
        let len = keys.len();
        let vps: HashSet<String> = vantage_points.into_iter().collect();
        let vps: Vec<String> = keys.iter().filter(|k| vps.contains(*k)).cloned().collect();
        let root = build_node(keys, vps, &mut dist, rng);
        Self { root, len }
    }

    pub fn root(&self) -> &VpNode {
        &self.root
    }

    /// Number of keys the tree was built over.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Descends by comparing the query's distance to each vantage point with
    /// the node's median and returns the leaf reached.
    pub fn close_subset<F>(&self, mut dist_to_query: F) -> &[String]
    where
        F: FnMut(&str) -> f64,
    {
        let mut node = &self.root;
        loop {
            match node {
                VpNode::Leaf(keys) => return keys,
                VpNode::Split {
                    vantage,
                    median,
                    left,
                    right,
                } => {
                    node = if dist_to_query(vantage) < *median {
                        &**left
                    } else {
                        &**right
                    };
                }
            }
        }
    }

    pub fn depth(&self) -> usize {
        fn walk(n: &VpNode) -> usize {
            match n {
                VpNode::Leaf(_) => 0,
                VpNode::Split { left, right, .. } => 1 + walk(left).max(walk(right)),
            }
        }
        walk(&self.root)
    }
}

fn build_node<F, R>(keys: Vec<String>, vps: Vec<String>, dist: &mut F, rng: &mut R) -> VpNode
where
    F: FnMut(&str, &[String]) -> Vec<f64>,
    R: Rng + ?Sized,
{
    if vps.is_empty() || keys.is_empty() {
        return VpNode::Leaf(keys);
    }
    let vantage = vps[rng.gen_range(0..vps.len())].clone();
    let distances = dist(&vantage, &keys);
    let median = median(&distances);

    let mut left = Vec::new();
    let mut right = Vec::new();
    for (key, d) in keys.into_iter().zip(distances) {
        if d < median {
            left.push(key);
        } else {
            right.push(key);
        }
    }
    let remaining: HashSet<&String> = vps.iter().filter(|v| **v != vantage).collect();
    let left_vps = left.iter().filter(|k| remaining.contains(k)).cloned().collect();
    let right_vps = right.iter().filter(|k| remaining.contains(k)).cloned().collect();

    VpNode::Split {
        left: Box::new(build_node(left, left_vps, dist, rng)),
        right: Box::new(build_node(right, right_vps, dist, rng)),
        vantage,
        median,
    }
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}
