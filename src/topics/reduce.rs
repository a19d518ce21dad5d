//! Neighbour-graph layout that shrinks document vectors before clustering.
//!
//! Documents are linked to their nearest neighbours under cosine distance, the
//! links are turned into fuzzy membership weights, and a low-dimensional layout
//! is optimised so linked documents attract and random pairs repel.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::models::Vector;

/// Layout curve parameters for zero minimum distance and unit spread.
const CURVE_A: f64 = 1.929;
const CURVE_B: f64 = 0.7915;

const NEGATIVE_SAMPLES: f64 = 5.0;
const GRADIENT_CLIP: f64 = 4.0;
const BANDWIDTH_ITERATIONS: usize = 64;
const BANDWIDTH_TOLERANCE: f64 = 1e-5;
const MIN_BANDWIDTH_SCALE: f64 = 1e-3;
const INIT_RANGE: f64 = 10.0;

/// Corpora smaller than this are passed through unchanged.
pub const MIN_DOCUMENTS: usize = 3;

/// Parameters of one reduction.
#[derive(Debug, Clone, Copy)]
pub struct ReductionParams {
    pub n_neighbors: usize,
    pub n_components: usize,
    pub epochs: usize,
    pub seed: u64,
}

/// Reduce `vectors` to `n_components` dimensions.
///
/// Small corpora, and inputs already at or below the target dimension, are returned
/// unchanged (as `f64`). The result is deterministic for a given seed.
pub fn reduce(vectors: &[Vector], params: &ReductionParams) -> Vec<Vec<f64>> {
    let n = vectors.len();
    let source_dim = vectors.first().map(Vec::len).unwrap_or(0);
    let k = params.n_neighbors.min(n.saturating_sub(1));

    if n < MIN_DOCUMENTS || k == 0 || params.n_components == 0 || source_dim <= params.n_components {
        debug!(documents = n, source_dim, "Skipping reduction");
        return vectors
            .iter()
            .map(|v| v.iter().map(|&x| f64::from(x)).collect())
            .collect();
    }

    let neighbours = nearest_neighbours(vectors, k);
    let graph = fuzzy_graph(&neighbours, k);
    debug!(documents = n, neighbours = k, edges = graph.len(), "Built neighbour graph");

    optimize_layout(n, &graph, params)
}

fn unit(vector: &[f32]) -> Vec<f64> {
    let norm = vector.iter().map(|&x| f64::from(x).powi(2)).sum::<f64>().sqrt();
    if norm == 0.0 {
        return vec![0.0; vector.len()];
    }
    vector.iter().map(|&x| f64::from(x) / norm).collect()
}

/// `k` nearest neighbours of every point by cosine distance, nearest first.
fn nearest_neighbours(vectors: &[Vector], k: usize) -> Vec<Vec<(usize, f64)>> {
    let units: Vec<Vec<f64>> = vectors.iter().map(|v| unit(v)).collect();
    units
        .iter()
        .enumerate()
        .map(|(i, a)| {
            let mut row: Vec<(usize, f64)> = units
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(j, b)| {
                    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
                    (j, (1.0 - dot).max(0.0))
                })
                .collect();
            row.sort_by(|x, y| x.1.partial_cmp(&y.1).unwrap_or(std::cmp::Ordering::Equal));
            row.truncate(k);
            row
        })
        .collect()
}

/// Symmetric fuzzy edge weights `(i, j, w)` with `i < j`.
fn fuzzy_graph(neighbours: &[Vec<(usize, f64)>], k: usize) -> Vec<(usize, usize, f64)> {
    let target = (k as f64).log2();
    let mean_distance = {
        let all: Vec<f64> = neighbours.iter().flatten().map(|(_, d)| *d).collect();
        if all.is_empty() {
            0.0
        } else {
            all.iter().sum::<f64>() / all.len() as f64
        }
    };

    let mut directed: HashMap<(usize, usize), f64> = HashMap::new();
    for (i, row) in neighbours.iter().enumerate() {
        let rho = row
            .iter()
            .map(|(_, d)| *d)
            .find(|d| *d > 0.0)
            .unwrap_or(0.0);
        let sigma = bandwidth(row, rho, target, mean_distance);
        for &(j, d) in row {
            let weight = (-(d - rho).max(0.0) / sigma).exp();
            directed.insert((i, j), weight);
        }
    }

    let mut pairs: Vec<(usize, usize)> = directed
        .keys()
        .map(|&(i, j)| if i < j { (i, j) } else { (j, i) })
        .collect();
    pairs.sort_unstable();
    pairs.dedup();

    pairs
        .into_iter()
        .filter_map(|(i, j)| {
            let a = directed.get(&(i, j)).copied().unwrap_or(0.0);
            let b = directed.get(&(j, i)).copied().unwrap_or(0.0);
            let w = a + b - a * b;
            (w > 0.0).then_some((i, j, w))
        })
        .collect()
}

/// Binary search for the kernel width that makes a row's weights sum to `target`.
fn bandwidth(row: &[(usize, f64)], rho: f64, target: f64, mean_distance: f64) -> f64 {
    let mut lo = 0.0;
    let mut hi = f64::INFINITY;
    let mut mid = 1.0;

    for _ in 0..BANDWIDTH_ITERATIONS {
        let total: f64 = row
            .iter()
            .map(|(_, d)| (-(d - rho).max(0.0) / mid).exp())
            .sum();
        if (total - target).abs() < BANDWIDTH_TOLERANCE {
            break;
        }
        if total > target {
            hi = mid;
            mid = (lo + hi) / 2.0;
        } else {
            lo = mid;
            mid = if hi.is_infinite() { mid * 2.0 } else { (lo + hi) / 2.0 };
        }
    }

    let row_mean = if row.is_empty() {
        0.0
    } else {
        row.iter().map(|(_, d)| d).sum::<f64>() / row.len() as f64
    };
    let floor = if rho > 0.0 {
        MIN_BANDWIDTH_SCALE * row_mean
    } else {
        MIN_BANDWIDTH_SCALE * mean_distance
    };
    mid.max(floor).max(f64::MIN_POSITIVE)
}

fn clip(value: f64) -> f64 {
    value.clamp(-GRADIENT_CLIP, GRADIENT_CLIP)
}

fn squared_distance(layout: &[f64], dim: usize, a: usize, b: usize) -> f64 {
    (0..dim)
        .map(|d| (layout[a * dim + d] - layout[b * dim + d]).powi(2))
        .sum()
}

/// Stochastic gradient layout over the fuzzy graph.
fn optimize_layout(n: usize, graph: &[(usize, usize, f64)], params: &ReductionParams) -> Vec<Vec<f64>> {
    let dim = params.n_components;
    let epochs = params.epochs.max(1);
    let mut rng = StdRng::seed_from_u64(params.seed);

    let mut layout: Vec<f64> = (0..n * dim)
        .map(|_| rng.gen_range(-INIT_RANGE..INIT_RANGE))
        .collect();

    let max_weight = graph.iter().map(|e| e.2).fold(0.0, f64::max);
    // Each undirected edge is sampled in both directions.
    let mut edges: Vec<(usize, usize, f64)> = Vec::with_capacity(graph.len() * 2);
    for &(i, j, w) in graph {
        if w < max_weight / epochs as f64 {
            continue;
        }
        let every = max_weight / w;
        edges.push((i, j, every));
        edges.push((j, i, every));
    }

    let mut next_sample: Vec<f64> = edges.iter().map(|e| e.2).collect();
    let negative_every: Vec<f64> = edges.iter().map(|e| e.2 / NEGATIVE_SAMPLES).collect();
    let mut next_negative: Vec<f64> = negative_every.clone();

    for epoch in 0..epochs {
        let alpha = 1.0 - epoch as f64 / epochs as f64;
        let now = epoch as f64;

        for (e, &(head, tail, every)) in edges.iter().enumerate() {
            if next_sample[e] > now {
                continue;
            }

            let dist2 = squared_distance(&layout, dim, head, tail);
            let coeff = if dist2 > 0.0 {
                -2.0 * CURVE_A * CURVE_B * dist2.powf(CURVE_B - 1.0)
                    / (CURVE_A * dist2.powf(CURVE_B) + 1.0)
            } else {
                0.0
            };
            for d in 0..dim {
                let delta = layout[head * dim + d] - layout[tail * dim + d];
                let grad = clip(coeff * delta) * alpha;
                layout[head * dim + d] += grad;
                layout[tail * dim + d] -= grad;
            }
            next_sample[e] += every;

            let negatives = ((now - next_negative[e]) / negative_every[e]).max(0.0) as usize;
            for _ in 0..negatives {
                let other = rng.gen_range(0..n);
                if other == head {
                    continue;
                }
                let dist2 = squared_distance(&layout, dim, head, other);
                let coeff = if dist2 > 0.0 {
                    2.0 * CURVE_B / ((0.001 + dist2) * (CURVE_A * dist2.powf(CURVE_B) + 1.0))
                } else {
                    0.0
                };
                for d in 0..dim {
                    let delta = layout[head * dim + d] - layout[other * dim + d];
                    let grad = if coeff > 0.0 { clip(coeff * delta) } else { GRADIENT_CLIP };
                    layout[head * dim + d] += grad * alpha;
                }
            }
            next_negative[e] += negatives as f64 * negative_every[e];
        }
    }

    layout.chunks(dim).map(<[f64]>::to_vec).collect()
}
