// ============================================================================
// BITONIC SORT — scalar reference for the GPU distance sort
// ============================================================================
//
// Runs the exact compare-exchange schedule the compute kernel runs.  Within
// a step the acting threads form disjoint blocks of `2 * step_size`, so each
// block is a rayon task.  Used by the CPU backend and to cross-check the GPU.

use rayon::prelude::*;

use crate::model::SortOrder;

/// Distance-ordered view of a point batch.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SortedByDistance {
    pub distances: Vec<f64>,
    /// Original position of each sorted entry.
    pub indices: Vec<u32>,
}

/// Input length rounded up to the power of two the network works on.
pub fn padded_len(n: usize) -> usize {
    n.max(1).next_power_of_two()
}

/// Value given to padding slots so they sort to the tail.
pub fn sentinel(order: SortOrder) -> f64 {
    match order {
        SortOrder::Ascending => f64::INFINITY,
        SortOrder::Descending => f64::NEG_INFINITY,
    }
}

/// The `(stage_size, step_size)` pairs of the network, in execution order.
/// `log2(padded)` stages; stage `s` runs steps `s..=0`.
pub fn schedule(padded: usize) -> Vec<(u32, u32)> {
    let stages = padded.trailing_zeros();
    let mut out = Vec::new();
    for stage in 0..stages {
        let stage_size = 2u32 << stage;
        for step in (0..=stage).rev() {
            out.push((stage_size, 1u32 << step));
        }
    }
    out
}

/// `true` when `(da, ia)` belongs before `(db, ib)` in the final order.
/// Ties break on the original index, which keeps the result stable.
fn precedes(da: f64, ia: u32, db: f64, ib: u32, order: SortOrder) -> bool {
    if da != db {
        match order {
            SortOrder::Ascending => da < db,
            SortOrder::Descending => da > db,
        }
    } else {
        ia < ib
    }
}

/// Sort distances with the bitonic network; returns sorted distances and
/// the original index of each, trimmed back to the input length.
pub fn bitonic_sort(distances: &[f64], order: SortOrder) -> SortedByDistance {
    let n = distances.len();
    if n == 0 {
        return SortedByDistance::default();
    }
    let padded = padded_len(n);
    let pad = sentinel(order);

    let mut keys: Vec<f64> = distances
        .iter()
        .map(|&d| if d.is_nan() { pad } else { d })
        .collect();
    keys.resize(padded, pad);
    let mut tags: Vec<u32> = (0..padded as u32).collect();

    for (stage_size, step_size) in schedule(padded) {
        let stage_size = stage_size as usize;
        let step_size = step_size as usize;
        let block = 2 * step_size;
        keys.par_chunks_mut(block)
            .zip(tags.par_chunks_mut(block))
            .enumerate()
            .for_each(|(b, (k, t))| {
                // Every i in the block shares i / stage_size, since block divides stage_size.
                let forward = (b * block / stage_size) % 2 == 0;
                for i in 0..step_size {
                    let partner = i + step_size;
                    let ordered = precedes(k[i], t[i], k[partner], t[partner], order);
                    if ordered != forward {
                        k.swap(i, partner);
                        t.swap(i, partner);
                    }
                }
            });
    }

    keys.truncate(n);
    tags.truncate(n);
    SortedByDistance {
        distances: keys,
        indices: tags,
    }
}

/// Order `points` by Euclidean distance from `center`.
pub fn sort_by_distance(points: &[(f64, f64)], center: (f64, f64), order: SortOrder) -> SortedByDistance {
    let distances: Vec<f64> = points
        .iter()
        .map(|&(x, y)| (x - center.0).hypot(y - center.1))
        .collect();
    bitonic_sort(&distances, order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_permutation(indices: &[u32], n: usize) -> bool {
        let mut seen = vec![false; n];
        for &i in indices {
            let i = i as usize;
            if i >= n || seen[i] {
                return false;
            }
            seen[i] = true;
        }
        indices.len() == n
    }

    fn pseudo_random(n: usize, seed: u64) -> Vec<f64> {
        let mut s = seed;
        (0..n)
            .map(|_| {
                s ^= s << 13;
                s ^= s >> 7;
                s ^= s << 17;
                (s % 10_000) as f64 / 37.0
            })
            .collect()
    }

    #[test]
    fn schedule_shape() {
        assert_eq!(schedule(1), vec![]);
        assert_eq!(schedule(4), vec![(2, 1), (4, 2), (4, 1)]);
        // log2(N) * (log2(N) + 1) / 2 steps.
        assert_eq!(schedule(1024).len(), 55);
    }

    #[test]
    fn sorts_ascending_and_permutes_indices() {
        for &n in &[1usize, 2, 3, 7, 8, 100, 513] {
            let input = pseudo_random(n, 0x9E37_79B9 + n as u64);
            let out = bitonic_sort(&input, SortOrder::Ascending);
            assert_eq!(out.distances.len(), n);
            assert!(out.distances.windows(2).all(|w| w[0] <= w[1]), "n={}", n);
            assert!(is_permutation(&out.indices, n));
            for (d, &i) in out.distances.iter().zip(&out.indices) {
                assert_eq!(*d, input[i as usize]);
            }
        }
    }

    #[test]
    fn sorts_descending() {
        let input = pseudo_random(77, 42);
        let out = bitonic_sort(&input, SortOrder::Descending);
        assert!(out.distances.windows(2).all(|w| w[0] >= w[1]));
        assert!(is_permutation(&out.indices, 77));
    }

    #[test]
    fn sorted_input_is_left_in_place() {
        let input: Vec<f64> = (0..37).map(|i| (i / 3) as f64).collect();
        let out = bitonic_sort(&input, SortOrder::Ascending);
        assert_eq!(out.distances, input);
        assert_eq!(out.indices, (0..37).collect::<Vec<u32>>());
    }

    #[test]
    fn padding_never_leaks_into_output() {
        let out = bitonic_sort(&[3.0, 1.0, 2.0], SortOrder::Ascending);
        assert_eq!(out.distances, vec![1.0, 2.0, 3.0]);
        assert_eq!(out.indices, vec![1, 2, 0]);
        assert!(bitonic_sort(&[], SortOrder::Ascending).indices.is_empty());
    }

    #[test]
    fn points_sorted_from_center() {
        let points = [(10.0, 0.0), (1.0, 1.0), (-3.0, 4.0)];
        let out = sort_by_distance(&points, (0.0, 0.0), SortOrder::Ascending);
        assert_eq!(out.indices, vec![1, 2, 0]);
        assert_eq!(out.distances[1], 5.0);
        let shifted = sort_by_distance(&points, (10.0, 0.0), SortOrder::Ascending);
        assert_eq!(shifted.indices[0], 0);
    }
}
