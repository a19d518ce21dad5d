//! Hierarchical density-based clustering.
//!
//! Builds the mutual-reachability minimum spanning tree, condenses the single-linkage
//! hierarchy by minimum cluster size and selects clusters by excess of mass. Points
//! outside every selected cluster are labelled [`NOISE_TOPIC`].

use std::collections::BTreeMap;

use tracing::debug;

use crate::models::NOISE_TOPIC;

/// Labels and soft membership of every point.
#[derive(Debug, Clone, PartialEq)]
pub struct Clustering {
    /// Cluster id per point, `NOISE_TOPIC` for noise
    pub labels: Vec<i32>,

    /// Membership strength in `[0, 1]` per point; zero for noise
    pub probabilities: Vec<f64>,
}

impl Clustering {
    fn noise(n: usize) -> Self {
        Self {
            labels: vec![NOISE_TOPIC; n],
            probabilities: vec![0.0; n],
        }
    }

    /// Number of clusters found.
    pub fn cluster_count(&self) -> usize {
        self.labels
            .iter()
            .filter(|&&l| l != NOISE_TOPIC)
            .max()
            .map(|&l| l as usize + 1)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy)]
struct CondensedEdge {
    parent: usize,
    child: usize,
    lambda: f64,
    size: usize,
}

fn euclidean(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum::<f64>().sqrt()
}

fn lambda_of(distance: f64) -> f64 {
    1.0 / distance.max(1e-12)
}

/// Cluster `points`.
///
/// # Arguments
/// * `points` - Rows of equal length
/// * `min_cluster_size` - Smallest group reported as a cluster
/// * `min_samples` - Neighbour rank used for core distances
///
/// Cluster ids are numbered from 0 by descending size, ties broken by the lowest
/// member index.
pub fn hdbscan(points: &[Vec<f64>], min_cluster_size: usize, min_samples: usize) -> Clustering {
    let n = points.len();
    let min_cluster_size = min_cluster_size.max(2);
    if n < min_cluster_size {
        debug!(points = n, min_cluster_size, "Too few points to cluster");
        return Clustering::noise(n);
    }

    let core = core_distances(points, min_samples);
    let mst = minimum_spanning_tree(points, &core);
    let (children, merge_distance) = single_linkage(n, mst);
    let condensed = condense(n, &children, &merge_distance, min_cluster_size);
    let selected = select_clusters(n, &condensed);

    let clustering = label_points(n, &condensed, &selected);
    debug!(
        points = n,
        clusters = clustering.cluster_count(),
        noise = clustering.labels.iter().filter(|&&l| l == NOISE_TOPIC).count(),
        "Clustered points"
    );
    clustering
}

/// Distance from each point to its `min_samples`-th nearest other point.
fn core_distances(points: &[Vec<f64>], min_samples: usize) -> Vec<f64> {
    let n = points.len();
    let rank = min_samples.max(1).min(n.saturating_sub(1));
    if rank == 0 {
        return vec![0.0; n];
    }
    points
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let mut distances: Vec<f64> = points
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, q)| euclidean(p, q))
                .collect();
            distances.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            distances[rank - 1]
        })
        .collect()
}

/// Prim's algorithm over the dense mutual-reachability graph.
fn minimum_spanning_tree(points: &[Vec<f64>], core: &[f64]) -> Vec<(usize, usize, f64)> {
    let n = points.len();
    let mut in_tree = vec![false; n];
    let mut best = vec![f64::INFINITY; n];
    let mut from = vec![0usize; n];
    let mut edges = Vec::with_capacity(n.saturating_sub(1));

    let mut current = 0;
    in_tree[0] = true;
    for _ in 1..n {
        for j in 0..n {
            if in_tree[j] {
                continue;
            }
            let reach = euclidean(&points[current], &points[j])
                .max(core[current])
                .max(core[j]);
            if reach < best[j] {
                best[j] = reach;
                from[j] = current;
            }
        }
        let next = (0..n)
            .filter(|&j| !in_tree[j])
            .min_by(|&a, &b| best[a].partial_cmp(&best[b]).unwrap_or(std::cmp::Ordering::Equal));
        let Some(next) = next else { break };
        in_tree[next] = true;
        edges.push((from[next], next, best[next]));
        current = next;
    }
    edges
}

fn find(parent: &mut [usize], mut x: usize) -> usize {
    while parent[x] != x {
        parent[x] = parent[parent[x]];
        x = parent[x];
    }
    x
}

/// Single-linkage dendrogram. Leaves are `0..n`; merge `m` creates node `n + m`.
fn single_linkage(n: usize, mut mst: Vec<(usize, usize, f64)>) -> (Vec<(usize, usize)>, Vec<f64>) {
    mst.sort_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal));

    let mut parent: Vec<usize> = (0..2 * n).collect();
    // Dendrogram node currently representing each union-find root.
    let mut node_of: Vec<usize> = (0..2 * n).collect();
    let mut children = Vec::with_capacity(n.saturating_sub(1));
    let mut distances = Vec::with_capacity(n.saturating_sub(1));

    for (a, b, distance) in mst {
        let ra = find(&mut parent, a);
        let rb = find(&mut parent, b);
        if ra == rb {
            continue;
        }
        let node = n + children.len();
        children.push((node_of[ra], node_of[rb]));
        distances.push(distance);
        parent[rb] = ra;
        node_of[ra] = node;
    }
    (children, distances)
}

fn leaves_under(n: usize, children: &[(usize, usize)], node: usize) -> Vec<usize> {
    let mut leaves = Vec::new();
    let mut stack = vec![node];
    while let Some(current) = stack.pop() {
        if current < n {
            leaves.push(current);
        } else {
            let (left, right) = children[current - n];
            stack.push(right);
            stack.push(left);
        }
    }
    leaves
}

/// Collapse the dendrogram so only splits into two groups of at least
/// `min_cluster_size` create new clusters. Cluster labels start at `n` (the root).
fn condense(
    n: usize,
    children: &[(usize, usize)],
    merge_distance: &[f64],
    min_cluster_size: usize,
) -> Vec<CondensedEdge> {
    let mut sizes = vec![1usize; n + children.len()];
    for (m, &(left, right)) in children.iter().enumerate() {
        sizes[n + m] = sizes[left] + sizes[right];
    }

    let mut edges = Vec::new();
    let Some(root) = (n + children.len()).checked_sub(1).filter(|&r| r >= n) else {
        return edges;
    };

    let mut next_label = n + 1;
    let mut stack = vec![(root, n)];
    while let Some((node, label)) = stack.pop() {
        if node < n {
            continue;
        }
        let (left, right) = children[node - n];
        let lambda = lambda_of(merge_distance[node - n]);
        let left_big = sizes[left] >= min_cluster_size;
        let right_big = sizes[right] >= min_cluster_size;

        match (left_big, right_big) {
            (true, true) => {
                for child in [left, right] {
                    edges.push(CondensedEdge {
                        parent: label,
                        child: next_label,
                        lambda,
                        size: sizes[child],
                    });
                    stack.push((child, next_label));
                    next_label += 1;
                }
            }
            (false, false) => {
                for child in [left, right] {
                    for leaf in leaves_under(n, children, child) {
                        edges.push(CondensedEdge {
                            parent: label,
                            child: leaf,
                            lambda,
                            size: 1,
                        });
                    }
                }
            }
            (true, false) | (false, true) => {
                let (keep, drop) = if left_big { (left, right) } else { (right, left) };
                for leaf in leaves_under(n, children, drop) {
                    edges.push(CondensedEdge {
                        parent: label,
                        child: leaf,
                        lambda,
                        size: 1,
                    });
                }
                if keep < n {
                    edges.push(CondensedEdge {
                        parent: label,
                        child: keep,
                        lambda,
                        size: 1,
                    });
                } else {
                    stack.push((keep, label));
                }
            }
        }
    }
    edges
}

/// Excess-of-mass selection. The root is never selected.
fn select_clusters(n: usize, condensed: &[CondensedEdge]) -> Vec<usize> {
    let mut birth: BTreeMap<usize, f64> = BTreeMap::new();
    birth.insert(n, 0.0);
    let mut cluster_children: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for edge in condensed.iter().filter(|e| e.child >= n) {
        birth.insert(edge.child, edge.lambda);
        cluster_children.entry(edge.parent).or_default().push(edge.child);
    }

    let mut stability: BTreeMap<usize, f64> = birth.keys().map(|&c| (c, 0.0)).collect();
    for edge in condensed {
        let born = birth.get(&edge.parent).copied().unwrap_or(0.0);
        if let Some(s) = stability.get_mut(&edge.parent) {
            *s += (edge.lambda - born) * edge.size as f64;
        }
    }

    let mut selected: BTreeMap<usize, bool> = birth.keys().map(|&c| (c, c != n)).collect();
    // Child labels are always greater than their parent's.
    let clusters: Vec<usize> = birth.keys().rev().copied().filter(|&c| c != n).collect();
    for cluster in clusters {
        let subtree: f64 = cluster_children
            .get(&cluster)
            .map(|kids| kids.iter().filter_map(|k| stability.get(k)).sum())
            .unwrap_or(0.0);
        let own = stability.get(&cluster).copied().unwrap_or(0.0);
        if subtree > own {
            selected.insert(cluster, false);
            stability.insert(cluster, subtree);
        } else {
            let mut stack = cluster_children.get(&cluster).cloned().unwrap_or_default();
            while let Some(descendant) = stack.pop() {
                selected.insert(descendant, false);
                if let Some(kids) = cluster_children.get(&descendant) {
                    stack.extend(kids);
                }
            }
        }
    }

    selected
        .into_iter()
        .filter_map(|(c, is_selected)| is_selected.then_some(c))
        .collect()
}

fn label_points(n: usize, condensed: &[CondensedEdge], selected: &[usize]) -> Clustering {
    let mut cluster_parent: BTreeMap<usize, usize> = BTreeMap::new();
    let mut point_edge: Vec<Option<(usize, f64)>> = vec![None; n];
    for edge in condensed {
        if edge.child >= n {
            cluster_parent.insert(edge.child, edge.parent);
        } else {
            point_edge[edge.child] = Some((edge.parent, edge.lambda));
        }
    }

    let owner = |mut cluster: usize| -> Option<usize> {
        while cluster != n {
            if selected.contains(&cluster) {
                return Some(cluster);
            }
            cluster = *cluster_parent.get(&cluster)?;
        }
        None
    };

    let assignment: Vec<Option<(usize, f64)>> = point_edge
        .iter()
        .map(|edge| edge.and_then(|(parent, lambda)| owner(parent).map(|c| (c, lambda))))
        .collect();

    // Renumber by descending size, ties by first member.
    let mut stats: BTreeMap<usize, (usize, usize, f64)> = BTreeMap::new();
    for (point, a) in assignment.iter().enumerate() {
        if let Some((cluster, lambda)) = a {
            let entry = stats.entry(*cluster).or_insert((0, point, 0.0));
            entry.0 += 1;
            entry.2 = entry.2.max(*lambda);
        }
    }
    let mut order: Vec<(usize, usize, usize)> =
        stats.iter().map(|(&c, &(size, first, _))| (c, size, first)).collect();
    order.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
    let ids: BTreeMap<usize, i32> = order
        .iter()
        .enumerate()
        .map(|(id, &(c, _, _))| (c, id as i32))
        .collect();

    let mut clustering = Clustering::noise(n);
    for (point, a) in assignment.into_iter().enumerate() {
        let Some((cluster, lambda)) = a else { continue };
        let max_lambda = stats.get(&cluster).map(|s| s.2).unwrap_or(0.0);
        clustering.labels[point] = ids.get(&cluster).copied().unwrap_or(NOISE_TOPIC);
        clustering.probabilities[point] = if max_lambda > 0.0 {
            lambda.min(max_lambda) / max_lambda
        } else {
            1.0
        };
    }
    clustering
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(cx: f64, cy: f64, count: usize) -> Vec<Vec<f64>> {
        (0..count)
            .map(|i| vec![cx + 0.1 * (i % 3) as f64, cy + 0.1 * (i / 3) as f64])
            .collect()
    }

    #[test]
    fn test_two_blobs() {
        let mut points = blob(0.0, 0.0, 6);
        points.extend(blob(10.0, 10.0, 4));
        let clustering = hdbscan(&points, 3, 1);

        assert_eq!(clustering.cluster_count(), 2);
        // Larger blob gets id 0.
        assert!(clustering.labels[..6].iter().all(|&l| l == 0));
        assert!(clustering.labels[6..].iter().all(|&l| l == 1));
    }

    #[test]
    fn test_far_outlier_is_noise() {
        let mut points = blob(0.0, 0.0, 5);
        points.extend(blob(10.0, 10.0, 5));
        points.push(vec![100.0, -100.0]);
        let clustering = hdbscan(&points, 3, 1);

        assert_eq!(clustering.labels[10], NOISE_TOPIC);
        assert_eq!(clustering.probabilities[10], 0.0);
        assert_eq!(clustering.cluster_count(), 2);
    }

    #[test]
    fn test_too_few_points_all_noise() {
        let clustering = hdbscan(&blob(0.0, 0.0, 2), 3, 1);
        assert_eq!(clustering.labels, vec![NOISE_TOPIC; 2]);
        assert_eq!(clustering.cluster_count(), 0);
    }

    #[test]
    fn test_probabilities_in_unit_interval() {
        let mut points = blob(0.0, 0.0, 6);
        points.extend(blob(5.0, 5.0, 6));
        points.push(vec![2.5, 2.5]);
        let clustering = hdbscan(&points, 3, 1);

        for (label, p) in clustering.labels.iter().zip(&clustering.probabilities) {
            assert!((0.0..=1.0).contains(p));
            if *label == NOISE_TOPIC {
                assert_eq!(*p, 0.0);
            }
        }
        assert!(clustering.probabilities.iter().any(|&p| p == 1.0));
    }

    #[test]
    fn test_deterministic() {
        let mut points = blob(0.0, 0.0, 6);
        points.extend(blob(10.0, 0.0, 6));
        assert_eq!(hdbscan(&points, 3, 2), hdbscan(&points, 3, 2));
    }

    #[test]
    fn test_mst_spans_all_points() {
        let points = blob(0.0, 0.0, 7);
        let core = core_distances(&points, 1);
        assert_eq!(minimum_spanning_tree(&points, &core).len(), 6);
    }
}
