use rayon::prelude::*;

use crate::descriptor::*;
use crate::dist::l2_distance_squared;
use crate::query::{Neighbour, Query2NnMatch, Top2};

/// Brute-force 2-NN of a single query
///
/// Ground truth for the forest query: scores every descriptor and applies
/// the same tie-break (smaller global index wins on equal distance).
/// Associations carry image index 0 and local index 0 since only the
/// descriptors are known here.
///
/// ### Params
///
/// * `descriptors` - Descriptor set to search
/// * `query` - Query descriptor
///
/// ### Returns
///
/// `(best, second)`
pub fn exhaustive_2nn(
    descriptors: &[U8Descriptor],
    query: &U8Descriptor,
) -> (Option<Neighbour>, Option<Neighbour>) {
    exhaustive_2nn_with_images(descriptors, None, query)
}

/// Brute-force 2-NN of a single query with full provenance
///
/// ### Params
///
/// * `descriptors` - Descriptor set to search
/// * `associations` - Optional association per descriptor, copied into the
///   result
/// * `query` - Query descriptor
///
/// ### Returns
///
/// `(best, second)`
pub fn exhaustive_2nn_with_images(
    descriptors: &[U8Descriptor],
    associations: Option<&[DescriptorAssociation]>,
    query: &U8Descriptor,
) -> (Option<Neighbour>, Option<Neighbour>) {
    let mut top2 = Top2::default();

    for (i, desc) in descriptors.iter().enumerate() {
        let association = match associations {
            Some(list) => list[i],
            None => DescriptorAssociation {
                global_index: i as u32,
                ..Default::default()
            },
        };
        top2.insert(Neighbour {
            association,
            distance: l2_distance_squared(query, desc),
        });
    }

    top2.into_pair()
}

/// Brute-force 2-NN of a query batch, in parallel
///
/// ### Params
///
/// * `descriptors` - Descriptor set to search
/// * `queries` - Query descriptors
///
/// ### Returns
///
/// One match per query, in query order
pub fn exhaustive_query_2nn(
    descriptors: &[U8Descriptor],
    queries: &[U8Descriptor],
) -> Vec<Query2NnMatch> {
    queries
        .par_iter()
        .enumerate()
        .map(|(query_index, query)| {
            let (best, second) = exhaustive_2nn(descriptors, query);
            Query2NnMatch {
                query_index,
                best,
                second,
            }
        })
        .collect()
}

///////////
// Tests //
///////////
