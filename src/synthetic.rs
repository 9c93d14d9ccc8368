use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::descriptor::U8Descriptor;

/// Generate uniformly random descriptors
///
/// ### Params
///
/// * `n_samples` - Number of descriptors
/// * `n_images` - Images to spread the descriptors over (round robin)
/// * `seed` - Random seed for reproducibility
///
/// ### Returns
///
/// `(descriptors, image_indexes)`
pub fn generate_random_descriptors(
    n_samples: usize,
    n_images: usize,
    seed: u64,
) -> (Vec<U8Descriptor>, Vec<u16>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let n_images = n_images.max(1);

    let descriptors = (0..n_samples)
        .map(|_| {
            let mut desc = U8Descriptor::default();
            rng.fill(&mut desc.features[..]);
            desc
        })
        .collect();
    let image_indexes = (0..n_samples).map(|i| (i % n_images) as u16).collect();

    (descriptors, image_indexes)
}

/// Generate descriptors with cluster structure
///
/// Mimics features of a scene seen from several views: every cluster has a
/// random centre and its members deviate by at most `cluster_spread` per
/// dimension. Each cluster is assigned to its own image.
///
/// ### Params
///
/// * `n_samples` - Number of descriptors
/// * `n_clusters` - Number of distinct clusters
/// * `cluster_spread` - Maximum per-dimension deviation from the centre
/// * `seed` - Random seed for reproducibility
///
/// ### Returns
///
/// `(descriptors, image_indexes)`
pub fn generate_clustered_descriptors(
    n_samples: usize,
    n_clusters: usize,
    cluster_spread: u8,
    seed: u64,
) -> (Vec<U8Descriptor>, Vec<u16>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let n_clusters = n_clusters.max(1);

    let centres: Vec<U8Descriptor> = (0..n_clusters)
        .map(|_| {
            let mut centre = U8Descriptor::default();
            rng.fill(&mut centre.features[..]);
            centre
        })
        .collect();

    let spread = cluster_spread as i16;
    let mut descriptors = Vec::with_capacity(n_samples);
    let mut image_indexes = Vec::with_capacity(n_samples);

    for i in 0..n_samples {
        let cluster_idx = i % n_clusters;
        let centre = &centres[cluster_idx];

        let mut desc = U8Descriptor::default();
        for (out, &c) in desc.features.iter_mut().zip(centre.features.iter()) {
            let noise: i16 = rng.random_range(-spread..=spread);
            *out = (c as i16 + noise).clamp(0, 255) as u8;
        }

        descriptors.push(desc);
        image_indexes.push(cluster_idx as u16);
    }

    (descriptors, image_indexes)
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_descriptors_shape() {
        let (descs, images) = generate_random_descriptors(10, 3, 1);
        assert_eq!(descs.len(), 10);
        assert_eq!(images, vec![0, 1, 2, 0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn test_clustered_descriptors_spread() {
        let (descs, images) = generate_clustered_descriptors(40, 4, 5, 1);
        assert_eq!(descs.len(), 40);
        for i in 4..40 {
            assert_eq!(images[i], images[i % 4]);
            // members of one cluster differ by at most twice the spread
            let a = &descs[i];
            let b = &descs[i % 4];
            for d in 0..128 {
                assert!(a[d].abs_diff(b[d]) <= 10);
            }
        }
    }

    #[test]
    fn test_generation_reproducible() {
        let (a, _) = generate_clustered_descriptors(20, 2, 8, 9);
        let (b, _) = generate_clustered_descriptors(20, 2, 8, 9);
        assert_eq!(a, b);
    }
}
