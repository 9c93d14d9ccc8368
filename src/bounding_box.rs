use bytemuck::{Pod, Zeroable};

use crate::descriptor::*;
use crate::dist::union;

/////////////////
// BoundingBox //
/////////////////

/// Per-dimension min/max envelope over a set of descriptors
///
/// Every descriptor of the covered set satisfies `min[d] <= x[d] <= max[d]`
/// for all dimensions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct BoundingBox {
    pub min: U8Descriptor,
    pub max: U8Descriptor,
}

const _: () = assert!(std::mem::size_of::<BoundingBox>() == 256);

impl BoundingBox {
    /// Degenerate box containing a single descriptor
    #[inline]
    pub fn from_point(desc: &U8Descriptor) -> Self {
        Self {
            min: *desc,
            max: *desc,
        }
    }

    /// Box covering the descriptors referenced by an association range
    ///
    /// ### Params
    ///
    /// * `descriptors` - The full descriptor set
    /// * `list` - Associations whose descriptors to cover
    ///
    /// ### Returns
    ///
    /// The envelope; all-zero for an empty range
    pub fn from_associations(
        descriptors: &[U8Descriptor],
        list: &[DescriptorAssociation],
    ) -> Self {
        let Some((first, rest)) = list.split_first() else {
            return Self::default();
        };

        let mut bb = Self::from_point(&descriptors[first.global_index as usize]);
        for assoc in rest {
            let point = Self::from_point(&descriptors[assoc.global_index as usize]);
            bb = union(&bb, &point);
        }
        bb
    }

    /// Whether a descriptor lies inside the box on every dimension
    pub fn contains(&self, desc: &U8Descriptor) -> bool {
        (0..DESCRIPTOR_DIM).all(|d| self.min[d] <= desc[d] && desc[d] <= self.max[d])
    }

    /// Whether another box lies entirely inside this one
    pub fn contains_box(&self, other: &BoundingBox) -> bool {
        self.contains(&other.min) && self.contains(&other.max)
    }

    /// Whether `min <= max` holds on every dimension
    pub fn is_valid(&self) -> bool {
        (0..DESCRIPTOR_DIM).all(|d| self.min[d] <= self.max[d])
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_descriptor(rng: &mut StdRng) -> U8Descriptor {
        let mut d = U8Descriptor::default();
        rng.fill(&mut d.features[..]);
        d
    }

    #[test]
    fn test_bounding_box_covers_range() {
        let mut rng = StdRng::seed_from_u64(42);
        let descriptors: Vec<U8Descriptor> = (0..50).map(|_| random_descriptor(&mut rng)).collect();
        let list = associations_from_image_indexes(&vec![0; 50]).unwrap();

        let bb = BoundingBox::from_associations(&descriptors, &list[10..30]);
        assert!(bb.is_valid());
        for assoc in &list[10..30] {
            assert!(bb.contains(&descriptors[assoc.global_index as usize]));
        }
    }

    #[test]
    fn test_bounding_box_is_tight() {
        let a = U8Descriptor::splat(10);
        let mut b = U8Descriptor::splat(20);
        b.features[5] = 3;
        let descriptors = vec![a, b];
        let list = associations_from_image_indexes(&[0, 0]).unwrap();

        let bb = BoundingBox::from_associations(&descriptors, &list);
        assert_eq!(bb.min[0], 10);
        assert_eq!(bb.max[0], 20);
        assert_eq!(bb.min[5], 3);
        assert_eq!(bb.max[5], 10);
    }

    #[test]
    fn test_bounding_box_empty() {
        let bb = BoundingBox::from_associations(&[], &[]);
        assert_eq!(bb, BoundingBox::default());
        assert!(bb.is_valid());
    }

    #[test]
    fn test_contains_rejects_outside() {
        let bb = BoundingBox {
            min: U8Descriptor::splat(10),
            max: U8Descriptor::splat(20),
        };
        assert!(bb.contains(&U8Descriptor::splat(15)));
        let mut outside = U8Descriptor::splat(15);
        outside.features[64] = 21;
        assert!(!bb.contains(&outside));
    }
}
