use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use rustc_hash::FxHashSet;

use crate::descriptor::*;
use crate::error::{KdForestError, Result};
use crate::exhaustive::exhaustive_2nn;
use crate::kd_tree::KdTree;

////////////
// Consts //
////////////

/// Default number of trees per forest
pub const DEFAULT_TREE_COUNT: usize = 4;

/// Default maximum number of associations per leaf
pub const DEFAULT_LEAF_SIZE: usize = 8;

/// Default number of distinct candidates a query may score
pub const DEFAULT_MAX_CANDIDATES: usize = 200;

/// Default random seed
pub const DEFAULT_SEED: u64 = 42;

////////////
// Params //
////////////

/// Build and query knobs of the forest
///
/// ### Fields
///
/// * `tree_count` - Number of independently randomised trees
/// * `leaf_size` - Maximum number of associations per leaf
/// * `max_candidates` - Distinct descriptors a query may score before it
///   stops
/// * `seed` - Master seed; per-tree seeds are derived from it
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KdForestParams {
    pub tree_count: usize,
    pub leaf_size: usize,
    pub max_candidates: usize,
    pub seed: u64,
}

impl Default for KdForestParams {
    fn default() -> Self {
        Self {
            tree_count: DEFAULT_TREE_COUNT,
            leaf_size: DEFAULT_LEAF_SIZE,
            max_candidates: DEFAULT_MAX_CANDIDATES,
            seed: DEFAULT_SEED,
        }
    }
}

//////////////
// KdForest //
//////////////

/// Randomised k-d forest over borrowed 128-byte descriptors
///
/// All trees index the same descriptor slice; they only differ in the
/// random choice of split dimensions. More trees give better recall for the
/// same candidate budget at the cost of memory and build time.
///
/// ### Fields
///
/// * `trees` - The independently built trees
/// * `descriptors` - Borrowed descriptor data shared by every tree
pub struct KdForest<'a> {
    trees: Vec<KdTree<'a>>,
    descriptors: &'a [U8Descriptor],
}

impl<'a> KdForest<'a> {
    //////////////////////
    // Index generation //
    //////////////////////

    /// Build a forest
    ///
    /// Per-tree seeds are drawn from a master `StdRng` seeded with `seed`,
    /// then the trees are built in parallel. The result does not depend on
    /// the order in which the trees finish.
    ///
    /// ### Params
    ///
    /// * `descriptors` - Descriptors to index
    /// * `image_indexes` - Image index per descriptor
    /// * `tree_count` - Number of trees to build
    /// * `leaf_size` - Maximum number of associations per leaf
    /// * `seed` - Random seed for reproducibility
    ///
    /// ### Returns
    ///
    /// The forest, or an error if the arguments are inconsistent
    pub fn build(
        descriptors: &'a [U8Descriptor],
        image_indexes: &[u16],
        tree_count: usize,
        leaf_size: usize,
        seed: u64,
    ) -> Result<Self> {
        if tree_count == 0 {
            return Err(KdForestError::ZeroTreeCount);
        }
        if leaf_size == 0 {
            return Err(KdForestError::ZeroLeafSize);
        }
        if descriptors.len() != image_indexes.len() {
            return Err(KdForestError::LengthMismatch {
                descriptors: descriptors.len(),
                image_indexes: image_indexes.len(),
            });
        }

        let list = associations_from_image_indexes(image_indexes)?;

        let mut rng = StdRng::seed_from_u64(seed);
        let seeds: Vec<u64> = (0..tree_count).map(|_| rng.random()).collect();

        let trees = seeds
            .into_par_iter()
            .map(|tree_seed| {
                let mut tree_rng = StdRng::seed_from_u64(tree_seed);
                KdTree::build_with_associations(descriptors, list.clone(), leaf_size, &mut tree_rng)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(KdForest { trees, descriptors })
    }

    /// Build a forest from a parameter set
    pub fn with_params(
        descriptors: &'a [U8Descriptor],
        image_indexes: &[u16],
        params: &KdForestParams,
    ) -> Result<Self> {
        Self::build(
            descriptors,
            image_indexes,
            params.tree_count,
            params.leaf_size,
            params.seed,
        )
    }

    ///////////////
    // Accessors //
    ///////////////

    #[inline(always)]
    pub fn trees(&self) -> &[KdTree<'a>] {
        &self.trees
    }

    #[inline(always)]
    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }

    #[inline(always)]
    pub fn descriptors(&self) -> &'a [U8Descriptor] {
        self.descriptors
    }

    #[inline(always)]
    pub fn descriptor_count(&self) -> usize {
        self.descriptors.len()
    }

    /// Returns the size of the index in bytes, excluding the borrowed
    /// descriptors
    pub fn memory_usage_bytes(&self) -> usize {
        std::mem::size_of_val(self)
            + self
                .trees
                .iter()
                .map(|t| t.memory_usage_bytes())
                .sum::<usize>()
    }

    ////////////////
    // Validation //
    ////////////////

    /// Recall of the forest query against exhaustive search
    ///
    /// Samples indexed descriptors, queries each of them through the forest
    /// and by brute force, and compares the returned global indices.
    ///
    /// ### Params
    ///
    /// * `max_candidates` - Candidate budget for the forest queries
    /// * `seed` - Seed for sampling the queries
    /// * `no_samples` - Optional number of samples. Otherwise defaults to
    ///   `1000` or n, whichever is smaller.
    ///
    /// ### Returns
    ///
    /// `(recall@1, recall@2)`
    pub fn validate_index(
        &self,
        max_candidates: usize,
        seed: u64,
        no_samples: Option<usize>,
    ) -> (f64, f64) {
        let n = self.descriptor_count();
        let no_samples = no_samples.unwrap_or(1000).min(n);
        if no_samples == 0 {
            return (0.0, 0.0);
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let query_indices: Vec<usize> = (0..no_samples).map(|_| rng.random_range(0..n)).collect();

        let (hits_1, hits_2, total_2) = query_indices
            .par_iter()
            .map(|&idx| {
                let query = &self.descriptors[idx];
                let approx = self.query_2nn_single(query, max_candidates);
                let truth = exhaustive_2nn(self.descriptors, query);

                let approx_set: FxHashSet<u32> = [approx.0, approx.1]
                    .iter()
                    .flatten()
                    .map(|nb| nb.association.global_index)
                    .collect();
                let true_ids: Vec<u32> = [truth.0, truth.1]
                    .iter()
                    .flatten()
                    .map(|nb| nb.association.global_index)
                    .collect();

                let hit_1 = match (approx.0, truth.0) {
                    (Some(a), Some(t)) => (a.association.global_index == t.association.global_index) as usize,
                    _ => 0,
                };
                let hit_2 = true_ids.iter().filter(|id| approx_set.contains(id)).count();

                (hit_1, hit_2, true_ids.len())
            })
            .reduce(|| (0, 0, 0), |a, b| (a.0 + b.0, a.1 + b.1, a.2 + b.2));

        let recall_1 = hits_1 as f64 / no_samples as f64;
        let recall_2 = if total_2 == 0 {
            0.0
        } else {
            hits_2 as f64 / total_2 as f64
        };
        (recall_1, recall_2)
    }
}

///////////
// Tests //
///////////
