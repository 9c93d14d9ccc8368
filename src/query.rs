use rayon::prelude::*;
use rustc_hash::FxHashSet;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::descriptor::*;
use crate::dist::{l2_distance_squared, l2_distance_squared_bb};
use crate::kd_forest::KdForest;
use crate::kd_tree::NodeKind;

/////////////
// Helpers //
/////////////

/// Frontier entry of the best-first search
///
/// Ordered so that `BinaryHeap` pops the smallest lower bound first; ties
/// go to the lower tree and then the lower node index.
///
/// ### Fields
///
/// * `lower_bound` - Squared L2 lower bound from the query to the node box
/// * `tree_idx` - Tree the node belongs to
/// * `node_idx` - Node within that tree
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FrontierEntry {
    lower_bound: u32,
    tree_idx: u32,
    node_idx: u32,
}

impl FrontierEntry {
    #[inline(always)]
    fn key(&self) -> (u32, u32, u32) {
        (self.lower_bound, self.tree_idx, self.node_idx)
    }
}

impl PartialOrd for FrontierEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Reversed so the max-heap behaves as a min-heap
impl Ord for FrontierEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}

///////////////
// Neighbour //
///////////////

/// A matched descriptor and its exact squared L2 distance to the query
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Neighbour {
    pub association: DescriptorAssociation,
    pub distance: u32,
}

impl Neighbour {
    /// Ordering key: distance first, smaller global index on ties
    #[inline(always)]
    pub fn key(&self) -> (u32, u32) {
        (self.distance, self.association.global_index)
    }
}

/// Running best-two tracker over distinct descriptors
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Top2 {
    pub best: Option<Neighbour>,
    pub second: Option<Neighbour>,
}

impl Top2 {
    /// Offer a candidate; callers guarantee it is not already held
    #[inline]
    pub fn insert(&mut self, cand: Neighbour) {
        match self.best {
            Some(best) if cand.key() >= best.key() => match self.second {
                Some(second) if cand.key() >= second.key() => {}
                _ => self.second = Some(cand),
            },
            _ => {
                self.second = self.best;
                self.best = Some(cand);
            }
        }
    }

    /// Whether nothing at `lower_bound` or beyond can enter the top two
    ///
    /// Equal distances can still win through the index tie-break, so only a
    /// strictly larger bound prunes.
    #[inline(always)]
    pub fn prunes(&self, lower_bound: u32) -> bool {
        self.second.is_some_and(|s| lower_bound > s.distance)
    }

    pub fn into_pair(self) -> (Option<Neighbour>, Option<Neighbour>) {
        (self.best, self.second)
    }
}

///////////////////
// Query2NnMatch //
///////////////////

/// Result of a 2-NN query
///
/// `None` marks a neighbour that was not found, either because fewer than
/// two descriptors are indexed or because the candidate budget ran out.
///
/// ### Fields
///
/// * `query_index` - Position of the query in the batch
/// * `best` - Closest descriptor found
/// * `second` - Second closest descriptor found, distinct from `best`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Query2NnMatch {
    pub query_index: usize,
    pub best: Option<Neighbour>,
    pub second: Option<Neighbour>,
}

impl Query2NnMatch {
    /// Lowe's ratio test on the two returned distances
    ///
    /// Distances are squared, so the comparison is
    /// `best < ratio^2 * second`. A match without a second neighbour has
    /// nothing to be confused with and passes; a query without any match
    /// fails.
    ///
    /// ### Params
    ///
    /// * `ratio` - Maximum ratio of the (non-squared) distances, typically
    ///   0.6 - 0.8
    pub fn passes_ratio_test(&self, ratio: f64) -> bool {
        match (self.best, self.second) {
            (Some(best), Some(second)) => {
                (best.distance as f64) < ratio * ratio * second.distance as f64
            }
            (Some(_), None) => true,
            _ => false,
        }
    }
}

///////////
// Query //
///////////

impl<'a> KdForest<'a> {
    /// Approximate 2-NN search for a single query
    ///
    /// Best-first search over all trees at once. The frontier starts with
    /// every root and always expands the node whose bounding box is closest
    /// to the query. Leaves are scanned exhaustively; a descriptor already
    /// scored through another tree is skipped. The search stops when the
    /// frontier is empty, when `max_candidates` distinct descriptors were
    /// scored, or when no remaining box can beat the current second best.
    ///
    /// ### Params
    ///
    /// * `query` - Query descriptor
    /// * `max_candidates` - Distinct descriptors to score at most
    ///
    /// ### Returns
    ///
    /// `(best, second)`
    pub fn query_2nn_single(
        &self,
        query: &U8Descriptor,
        max_candidates: usize,
    ) -> (Option<Neighbour>, Option<Neighbour>) {
        let mut top2 = Top2::default();
        if max_candidates == 0 {
            return top2.into_pair();
        }

        let descriptors = self.descriptors();
        let mut seen: FxHashSet<u32> = FxHashSet::with_capacity_and_hasher(
            max_candidates.min(descriptors.len()),
            Default::default(),
        );
        let mut frontier = BinaryHeap::with_capacity(64);
        let mut visited = 0;

        for (tree_idx, tree) in self.trees().iter().enumerate() {
            frontier.push(FrontierEntry {
                lower_bound: l2_distance_squared_bb(query, tree.bb(tree.root())),
                tree_idx: tree_idx as u32,
                node_idx: tree.root(),
            });
        }

        while let Some(entry) = frontier.pop() {
            if top2.prunes(entry.lower_bound) {
                break;
            }

            let tree = &self.trees()[entry.tree_idx as usize];

            match tree.node(entry.node_idx) {
                NodeKind::Split { right, .. } => {
                    for child in [entry.node_idx + 1, right] {
                        let lower_bound = l2_distance_squared_bb(query, tree.bb(child));
                        if !top2.prunes(lower_bound) {
                            frontier.push(FrontierEntry {
                                lower_bound,
                                tree_idx: entry.tree_idx,
                                node_idx: child,
                            });
                        }
                    }
                }
                NodeKind::Leaf { .. } => {
                    for assoc in tree.list(entry.node_idx) {
                        if !seen.insert(assoc.global_index) {
                            continue;
                        }

                        let desc = &descriptors[assoc.global_index as usize];
                        top2.insert(Neighbour {
                            association: *assoc,
                            distance: l2_distance_squared(query, desc),
                        });

                        visited += 1;
                        if visited >= max_candidates {
                            return top2.into_pair();
                        }
                    }
                }
            }
        }

        top2.into_pair()
    }

    /// Approximate 2-NN search for a batch of queries, in parallel
    ///
    /// ### Params
    ///
    /// * `queries` - Query descriptors
    /// * `max_candidates` - Distinct descriptors each query may score
    ///
    /// ### Returns
    ///
    /// One match per query, in query order
    pub fn query_2nn(&self, queries: &[U8Descriptor], max_candidates: usize) -> Vec<Query2NnMatch> {
        queries
            .par_iter()
            .enumerate()
            .map(|(query_index, query)| {
                let (best, second) = self.query_2nn_single(query, max_candidates);
                Query2NnMatch {
                    query_index,
                    best,
                    second,
                }
            })
            .collect()
    }
}

/// Approximate 2-NN search of a query batch against a forest
///
/// ### Params
///
/// * `forest` - The built forest
/// * `max_candidates` - Distinct descriptors each query may score
/// * `queries` - Query descriptors
///
/// ### Returns
///
/// One match per query, in query order
pub fn query_2nn(
    forest: &KdForest,
    max_candidates: usize,
    queries: &[U8Descriptor],
) -> Vec<Query2NnMatch> {
    forest.query_2nn(queries, max_candidates)
}

///////////
// Tests //
///////////
