#![allow(clippy::needless_range_loop)] // I want these loops!

pub mod bounding_box;
pub mod descriptor;
pub mod dist;
pub mod error;
pub mod exhaustive;
pub mod kd_forest;
pub mod kd_tree;
pub mod query;
pub mod synthetic;

use rayon::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thousands::Separable;

use crate::descriptor::*;
use crate::error::Result;
use crate::kd_forest::*;
use crate::query::*;

/// Commonly used types in one import
pub mod prelude {
    pub use crate::bounding_box::BoundingBox;
    pub use crate::descriptor::{DescriptorAssociation, U8Descriptor, DESCRIPTOR_DIM};
    pub use crate::error::{KdForestError, Result};
    pub use crate::kd_forest::{KdForest, KdForestParams};
    pub use crate::kd_tree::{KdTree, NodeKind};
    pub use crate::query::{Neighbour, Query2NnMatch};
}

///////////////
// KD forest //
///////////////

/// Build a randomised k-d forest
///
/// ### Params
///
/// * `descriptors` - The 128-byte descriptors to index
/// * `image_indexes` - Image index per descriptor
/// * `tree_count` - Number of trees to build
/// * `leaf_size` - Maximum number of descriptors per leaf
/// * `seed` - Random seed for reproducibility
/// * `verbose` - Print build statistics
///
/// ### Return
///
/// The `KdForest`, or an error if the arguments are inconsistent.
pub fn build_kd_forest<'a>(
    descriptors: &'a [U8Descriptor],
    image_indexes: &[u16],
    tree_count: usize,
    leaf_size: usize,
    seed: u64,
    verbose: bool,
) -> Result<KdForest<'a>> {
    let start = Instant::now();
    let forest = KdForest::build(descriptors, image_indexes, tree_count, leaf_size, seed)?;

    if verbose {
        let nodes: u32 = forest.trees().iter().map(|t| t.node_count()).sum();
        println!(
            " Built {} trees over {} descriptors ({} nodes, {} bytes) in {:.2?}.",
            forest.tree_count(),
            forest.descriptor_count().separate_with_underscores(),
            nodes.separate_with_underscores(),
            forest.memory_usage_bytes().separate_with_underscores(),
            start.elapsed()
        );
    }

    Ok(forest)
}

/// Helper function to query a given k-d forest for the two nearest
/// neighbours of every query descriptor
///
/// ### Params
///
/// * `forest` - The built forest
/// * `queries` - The query descriptors
/// * `max_candidates` - Distinct descriptors each query may score. Use a
///   value at least as large as the descriptor count for exact results.
/// * `verbose` - Print progress information
///
/// ### Returns
///
/// One `Query2NnMatch` per query, in query order
pub fn query_kd_forest_2nn(
    forest: &KdForest,
    queries: &[U8Descriptor],
    max_candidates: usize,
    verbose: bool,
) -> Vec<Query2NnMatch> {
    if !verbose {
        return forest.query_2nn(queries, max_candidates);
    }

    let n_queries = queries.len();
    let counter = Arc::new(AtomicUsize::new(0));

    queries
        .par_iter()
        .enumerate()
        .map(|(query_index, query)| {
            let (best, second) = forest.query_2nn_single(query, max_candidates);
            let count = counter.fetch_add(1, Ordering::Relaxed) + 1;
            if count.is_multiple_of(100_000) {
                println!(
                    " Processed {} / {} queries.",
                    count.separate_with_underscores(),
                    n_queries.separate_with_underscores()
                );
            }
            Query2NnMatch {
                query_index,
                best,
                second,
            }
        })
        .collect()
}

/// Build a forest from a parameter set and return the matches passing the
/// ratio test
///
/// Convenience wrapper for matching the descriptors of one image against
/// an indexed set in a single call.
///
/// ### Params
///
/// * `descriptors` - The descriptors to index
/// * `image_indexes` - Image index per descriptor
/// * `queries` - The query descriptors
/// * `params` - Forest parameters
/// * `ratio` - Lowe ratio threshold on the non-squared distances
///
/// ### Returns
///
/// The matches whose best neighbour passes the ratio test
pub fn match_descriptors(
    descriptors: &[U8Descriptor],
    image_indexes: &[u16],
    queries: &[U8Descriptor],
    params: &KdForestParams,
    ratio: f64,
) -> Result<Vec<Query2NnMatch>> {
    let forest = KdForest::with_params(descriptors, image_indexes, params)?;
    Ok(forest
        .query_2nn(queries, params.max_candidates)
        .into_iter()
        .filter(|m| m.passes_ratio_test(ratio))
        .collect())
}

///////////
// Tests //
///////////

#[cfg(test)]
mod integration_tests {
    use super::*;
    use crate::exhaustive::exhaustive_query_2nn;
    use crate::synthetic::*;

    fn recall_at_1(approx: &[Query2NnMatch], truth: &[Query2NnMatch]) -> f64 {
        let hits = approx
            .iter()
            .zip(truth)
            .filter(|(a, t)| {
                a.best.map(|nb| nb.association.global_index)
                    == t.best.map(|nb| nb.association.global_index)
            })
            .count();
        hits as f64 / truth.len() as f64
    }

    #[test]
    fn test_build_and_query_helpers() {
        let (descriptors, image_indexes) = generate_clustered_descriptors(2000, 40, 10, 42);
        let forest = build_kd_forest(&descriptors, &image_indexes, 4, 8, 42, false).unwrap();

        let queries = &descriptors[..100];
        let results = query_kd_forest_2nn(&forest, queries, 200, false);
        assert_eq!(results.len(), 100);
        for (i, m) in results.iter().enumerate() {
            assert_eq!(m.query_index, i);
            // indexed queries find themselves
            let best = m.best.unwrap();
            assert_eq!(best.distance, 0);
            assert_eq!(best.association.global_index as usize, i);
        }
    }

    #[test]
    fn test_verbose_matches_quiet() {
        let (descriptors, image_indexes) = generate_random_descriptors(500, 4, 3);
        let forest = build_kd_forest(&descriptors, &image_indexes, 3, 8, 1, true).unwrap();
        let queries = generate_random_descriptors(50, 1, 9).0;

        let quiet = query_kd_forest_2nn(&forest, &queries, 100, false);
        let loud = query_kd_forest_2nn(&forest, &queries, 100, true);
        assert_eq!(quiet, loud);
    }

    #[test]
    fn test_exact_budget_matches_exhaustive() {
        let (descriptors, image_indexes) = generate_random_descriptors(800, 8, 11);
        let queries = generate_random_descriptors(60, 1, 12).0;

        let forest = build_kd_forest(&descriptors, &image_indexes, 4, 8, 5, false).unwrap();
        let approx = query_kd_forest_2nn(&forest, &queries, descriptors.len(), false);
        let truth = exhaustive_query_2nn(&descriptors, &queries);

        for (a, t) in approx.iter().zip(&truth) {
            assert_eq!(a.best.map(|nb| nb.key()), t.best.map(|nb| nb.key()));
            assert_eq!(a.second.map(|nb| nb.key()), t.second.map(|nb| nb.key()));
        }
    }

    #[test]
    fn test_full_budget_exact_for_any_tree_count() {
        let (descriptors, image_indexes) = generate_clustered_descriptors(3000, 30, 20, 7);
        let (queries, _) = generate_clustered_descriptors(200, 30, 20, 8);
        let truth = exhaustive_query_2nn(&descriptors, &queries);

        let few = build_kd_forest(&descriptors, &image_indexes, 1, 8, 3, false).unwrap();
        let many = build_kd_forest(&descriptors, &image_indexes, 8, 8, 3, false).unwrap();

        let budget = descriptors.len();
        let recall_few = recall_at_1(&query_kd_forest_2nn(&few, &queries, budget, false), &truth);
        let recall_many = recall_at_1(&query_kd_forest_2nn(&many, &queries, budget, false), &truth);

        assert_eq!(recall_few, 1.0);
        assert_eq!(recall_many, 1.0);
    }

    #[test]
    fn test_match_descriptors_ratio_filter() {
        let (descriptors, image_indexes) = generate_clustered_descriptors(1000, 10, 6, 21);
        let queries = descriptors[..20].to_vec();
        let params = KdForestParams::default();

        let matches = match_descriptors(&descriptors, &image_indexes, &queries, &params, 0.8).unwrap();
        // exact self matches have distance 0 and always pass
        assert_eq!(matches.len(), 20);
        for m in &matches {
            assert_eq!(m.best.unwrap().distance, 0);
        }
    }

    #[test]
    fn test_helpers_propagate_errors() {
        let (descriptors, image_indexes) = generate_random_descriptors(10, 1, 1);
        assert!(build_kd_forest(&descriptors, &image_indexes[..3], 2, 8, 1, false).is_err());
        assert!(build_kd_forest(&descriptors, &image_indexes, 0, 8, 1, false).is_err());
    }
}
