//! Density-based clustering of feedback embeddings
//!
//! The aggregator consolidates raw feedbacks whose embeddings lie close
//! together. Clusters are grown greedily under a pairwise radius bound:
//! every member stays within `epsilon` cosine distance of every other
//! member, so an aggregate's provenance always satisfies the pairwise
//! distance invariant. Points that cannot reach `min_size` companions are
//! noise and stay unclustered.

use crate::search::cosine_distance;
use std::collections::HashSet;
use uuid::Uuid;

/// Default cosine-distance threshold for cluster membership
pub const DEFAULT_CLUSTER_EPSILON: f64 = 0.2;

/// Cluster the given embeddings; returns index sets, densest seeds first
///
/// A returned cluster has at least `min_size` members and all pairwise
/// cosine distances `<= epsilon`.
pub fn cluster_embeddings(
    embeddings: &[Vec<f32>],
    epsilon: f64,
    min_size: usize,
) -> Vec<Vec<usize>> {
    let n = embeddings.len();
    if n == 0 || min_size == 0 {
        return Vec::new();
    }

    // Precompute the neighbor sets once; n is bounded by the raw-feedback
    // count of a single (agent_version, feedback_name) pair
    let mut neighbors: Vec<Vec<usize>> = vec![Vec::new(); n];
    for i in 0..n {
        for j in (i + 1)..n {
            if cosine_distance(&embeddings[i], &embeddings[j]) <= epsilon {
                neighbors[i].push(j);
                neighbors[j].push(i);
            }
        }
    }

    // Seed from the densest unassigned point so dominant clusters form first
    let mut seeds: Vec<usize> = (0..n).collect();
    seeds.sort_by_key(|&i| std::cmp::Reverse(neighbors[i].len()));

    let mut assigned = vec![false; n];
    let mut clusters = Vec::new();

    for &seed in &seeds {
        if assigned[seed] || neighbors[seed].len() + 1 < min_size {
            continue;
        }

        let mut members = vec![seed];
        // Closest-first growth keeps the cluster tight around the seed
        let mut candidates: Vec<usize> = neighbors[seed]
            .iter()
            .copied()
            .filter(|&c| !assigned[c])
            .collect();
        candidates.sort_by(|&a, &b| {
            cosine_distance(&embeddings[seed], &embeddings[a])
                .partial_cmp(&cosine_distance(&embeddings[seed], &embeddings[b]))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        for candidate in candidates {
            let fits = members
                .iter()
                .all(|&m| cosine_distance(&embeddings[candidate], &embeddings[m]) <= epsilon);
            if fits {
                members.push(candidate);
            }
        }

        if members.len() >= min_size {
            for &m in &members {
                assigned[m] = true;
            }
            members.sort_unstable();
            clusters.push(members);
        }
    }

    clusters
}

/// Arithmetic mean of the member embeddings
pub fn centroid(embeddings: &[Vec<f32>], members: &[usize]) -> Vec<f32> {
    let Some(&first) = members.first() else {
        return Vec::new();
    };
    let dim = embeddings[first].len();
    let mut sum = vec![0.0f32; dim];
    for &m in members {
        for (acc, v) in sum.iter_mut().zip(&embeddings[m]) {
            *acc += v;
        }
    }
    let count = members.len() as f32;
    for v in &mut sum {
        *v /= count;
    }
    sum
}

/// Jaccard index between two id sets
pub fn jaccard_index(a: &HashSet<Uuid>, b: &HashSet<Uuid>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    intersection / union
}

/// Fraction of `prev` members that survive into `new`
pub fn overlap_fraction(prev: &HashSet<Uuid>, new: &HashSet<Uuid>) -> f64 {
    if prev.is_empty() {
        return 0.0;
    }
    prev.intersection(new).count() as f64 / prev.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(angle: f64) -> Vec<f32> {
        vec![angle.cos() as f32, angle.sin() as f32]
    }

    #[test]
    fn test_identical_points_cluster() {
        let embeddings = vec![unit(0.0), unit(0.0), unit(0.0)];
        let clusters = cluster_embeddings(&embeddings, 0.2, 3);
        assert_eq!(clusters, vec![vec![0, 1, 2]]);
    }

    #[test]
    fn test_distant_points_are_noise() {
        // Orthogonal vectors have cosine distance 1.0
        let embeddings = vec![unit(0.0), unit(std::f64::consts::FRAC_PI_2), unit(std::f64::consts::PI)];
        assert!(cluster_embeddings(&embeddings, 0.2, 2).is_empty());
    }

    #[test]
    fn test_two_separate_clusters() {
        let tight_a = vec![unit(0.00), unit(0.05), unit(0.10)];
        let tight_b = vec![unit(2.00), unit(2.05), unit(2.10)];
        let mut embeddings = tight_a;
        embeddings.extend(tight_b);
        let mut clusters = cluster_embeddings(&embeddings, 0.2, 3);
        clusters.sort();
        assert_eq!(clusters, vec![vec![0, 1, 2], vec![3, 4, 5]]);
    }

    #[test]
    fn test_below_min_size_excluded() {
        let embeddings = vec![unit(0.0), unit(0.02)];
        assert!(cluster_embeddings(&embeddings, 0.2, 3).is_empty());
    }

    #[test]
    fn test_pairwise_radius_holds() {
        // A chain where the ends exceed epsilon: 0.0, 0.45, 0.9 radians.
        // Transitive expansion would join all three; the pairwise bound
        // must not.
        let embeddings = vec![unit(0.0), unit(0.45), unit(0.9)];
        let clusters = cluster_embeddings(&embeddings, 0.15, 2);
        for cluster in &clusters {
            for (idx, &a) in cluster.iter().enumerate() {
                for &b in &cluster[idx + 1..] {
                    assert!(cosine_distance(&embeddings[a], &embeddings[b]) <= 0.15);
                }
            }
        }
    }

    #[test]
    fn test_centroid_of_identical_points() {
        let embeddings = vec![vec![1.0, 0.0], vec![1.0, 0.0]];
        assert_eq!(centroid(&embeddings, &[0, 1]), vec![1.0, 0.0]);
    }

    #[test]
    fn test_jaccard_and_overlap() {
        let a: HashSet<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        let mut b = a.clone();
        let extra = Uuid::new_v4();
        b.insert(extra);
        assert!((jaccard_index(&a, &b) - 0.8).abs() < 1e-9);
        assert!((overlap_fraction(&a, &b) - 1.0).abs() < 1e-9);

        let disjoint: HashSet<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        assert_eq!(jaccard_index(&a, &disjoint), 0.0);
        assert_eq!(overlap_fraction(&a, &disjoint), 0.0);
    }
}
