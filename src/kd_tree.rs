use bytemuck::{Pod, Zeroable};
use rand::Rng;
use std::cmp::Reverse;
use tracing::debug;

use crate::bounding_box::BoundingBox;
use crate::descriptor::*;
use crate::error::{KdForestError, Result};

////////////
// Consts //
////////////

/// Number of highest-variance dimensions to randomly split against
pub const SPLIT_DIMENSION_COUNT: usize = 5;

/// Leaf flag in the node header; the remaining 31 bits hold an index
const LEAF_FLAG: u32 = 1 << 31;

//////////
// Node //
//////////

/// Packed 8-byte tree node
///
/// Internal nodes store the right child in `header` and the split
/// dimension/value in the low two bytes of `payload`; the left child is
/// always the next node. Leaves set the top bit of `header`, keep the list
/// start in the remaining bits and the exclusive list end in `payload`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Pod, Zeroable)]
#[repr(C)]
pub struct KdNode {
    header: u32,
    payload: u32,
}

const _: () = assert!(std::mem::size_of::<KdNode>() == 8);

/// Decoded view of a [`KdNode`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    /// Internal node; left child is `self + 1`
    Split { dim: u8, val: u8, right: u32 },
    /// Terminal node covering `list[start..end]`
    Leaf { start: u32, end: u32 },
}

impl KdNode {
    #[inline]
    fn leaf(start: u32, end: u32) -> Self {
        Self {
            header: start | LEAF_FLAG,
            payload: end,
        }
    }

    #[inline]
    fn split(dim: u8, val: u8, right: u32) -> Self {
        Self {
            header: right,
            payload: dim as u32 | (val as u32) << 8,
        }
    }

    #[inline(always)]
    pub fn is_leaf(&self) -> bool {
        self.header & LEAF_FLAG != 0
    }

    /// Right child for internal nodes, list start for leaves
    #[inline(always)]
    pub fn index(&self) -> u32 {
        self.header & !LEAF_FLAG
    }

    #[inline]
    pub fn kind(&self) -> NodeKind {
        if self.is_leaf() {
            NodeKind::Leaf {
                start: self.index(),
                end: self.payload,
            }
        } else {
            NodeKind::Split {
                dim: self.payload as u8,
                val: (self.payload >> 8) as u8,
                right: self.index(),
            }
        }
    }
}

/////////////////////
// Split selection //
/////////////////////

/// Candidate split dimensions of a range and their mean values
///
/// ### Fields
///
/// * `dims` - Dimensions sorted by decreasing variance
/// * `means` - Floor of the mean value on each dimension in `dims`
/// * `len` - Number of valid entries; dimensions without variance are
///   dropped
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SplitDimensions {
    pub dims: [u8; SPLIT_DIMENSION_COUNT],
    pub means: [u8; SPLIT_DIMENSION_COUNT],
    pub len: usize,
}

/// Find the highest-variance dimensions over an association range
///
/// Variances are compared exactly as `n * sum(x^2) - sum(x)^2`; ties go to
/// the lower dimension.
///
/// ### Params
///
/// * `descriptors` - The full descriptor set
/// * `list` - Associations of the range to split
///
/// ### Returns
///
/// Up to `SPLIT_DIMENSION_COUNT` dimensions with non-zero variance
pub fn split_dimensions(
    descriptors: &[U8Descriptor],
    list: &[DescriptorAssociation],
) -> SplitDimensions {
    let mut sum = [0u64; DESCRIPTOR_DIM];
    let mut sum_sq = [0u64; DESCRIPTOR_DIM];

    for assoc in list {
        let desc = &descriptors[assoc.global_index as usize];
        for d in 0..DESCRIPTOR_DIM {
            let v = desc[d] as u64;
            sum[d] += v;
            sum_sq[d] += v * v;
        }
    }

    let n = list.len() as u128;
    let mut ranked: Vec<(u128, usize)> = (0..DESCRIPTOR_DIM)
        .map(|d| {
            let s = sum[d] as u128;
            (n * sum_sq[d] as u128 - s * s, d)
        })
        .collect();
    ranked.sort_unstable_by_key(|&(var, d)| (Reverse(var), d));

    let mut out = SplitDimensions::default();
    for &(var, d) in ranked.iter().take(SPLIT_DIMENSION_COUNT) {
        if var == 0 {
            break;
        }
        out.dims[out.len] = d as u8;
        out.means[out.len] = (sum[d] / list.len() as u64) as u8;
        out.len += 1;
    }
    out
}

////////////
// KdTree //
////////////

/// Randomised k-d tree over borrowed 128-byte descriptors
///
/// Node 0 is the root. Nodes are laid out in build (pre-)order, so the
/// left child of an internal node is always the node that follows it.
///
/// ### Fields
///
/// * `descriptors` - Borrowed descriptor data; must outlive the tree
/// * `nodes` - Packed nodes
/// * `bb` - Bounding box per node, leaves included
/// * `list` - Leaf contents; each leaf owns a contiguous range
/// * `leaf_size` - Maximum number of associations per leaf
pub struct KdTree<'a> {
    descriptors: &'a [U8Descriptor],
    nodes: Vec<KdNode>,
    bb: Vec<BoundingBox>,
    list: Vec<DescriptorAssociation>,
    leaf_size: usize,
}

impl<'a> KdTree<'a> {
    //////////////////////
    // Index generation //
    //////////////////////

    /// Build a tree
    ///
    /// ### Params
    ///
    /// * `descriptors` - Descriptors to index
    /// * `image_indexes` - Image index per descriptor
    /// * `leaf_size` - Maximum number of associations per leaf
    /// * `rng` - Random source for split-dimension selection
    ///
    /// ### Returns
    ///
    /// The built tree, or an error if the arguments are inconsistent
    pub fn build<R>(
        descriptors: &'a [U8Descriptor],
        image_indexes: &[u16],
        leaf_size: usize,
        rng: &mut R,
    ) -> Result<Self>
    where
        R: Rng + ?Sized,
    {
        if descriptors.len() != image_indexes.len() {
            return Err(KdForestError::LengthMismatch {
                descriptors: descriptors.len(),
                image_indexes: image_indexes.len(),
            });
        }
        let list = associations_from_image_indexes(image_indexes)?;
        Self::build_with_associations(descriptors, list, leaf_size, rng)
    }

    /// Build a tree from a prepared association list
    ///
    /// Used by the forest so the list is generated only once.
    pub(crate) fn build_with_associations<R>(
        descriptors: &'a [U8Descriptor],
        list: Vec<DescriptorAssociation>,
        leaf_size: usize,
        rng: &mut R,
    ) -> Result<Self>
    where
        R: Rng + ?Sized,
    {
        if leaf_size == 0 {
            return Err(KdForestError::ZeroLeafSize);
        }

        let n = list.len();
        let expected_nodes = 2 * n.div_ceil(leaf_size) + 1;
        let mut tree = KdTree {
            descriptors,
            nodes: Vec::with_capacity(expected_nodes),
            bb: Vec::with_capacity(expected_nodes),
            list,
            leaf_size,
        };

        tree.build_node(0, n as u32, rng);

        debug!(
            descriptors = n,
            nodes = tree.node_count(),
            leaves = tree.leaf_count(),
            depth = tree.depth(),
            "built kd-tree"
        );

        Ok(tree)
    }

    /// Recursively build the node covering `list[lelem..relem]`
    ///
    /// ### Returns
    ///
    /// Index of the created node
    fn build_node<R>(&mut self, lelem: u32, relem: u32, rng: &mut R) -> u32
    where
        R: Rng + ?Sized,
    {
        let descriptors = self.descriptors;
        let range = &self.list[lelem as usize..relem as usize];

        let node_idx = self.nodes.len() as u32;
        self.bb
            .push(BoundingBox::from_associations(descriptors, range));
        self.nodes.push(KdNode::leaf(lelem, relem));

        if range.len() <= self.leaf_size {
            return node_idx;
        }

        let split = split_dimensions(descriptors, range);
        if split.len == 0 {
            // every descriptor in the range is identical
            return node_idx;
        }

        let choice = rng.random_range(0..split.len);
        let (dim, val) = (split.dims[choice], split.means[choice]);
        let mid = self.partition(lelem, relem, dim, val);

        let left = self.build_node(lelem, mid, rng);
        debug_assert_eq!(left, node_idx + 1);
        let right = self.build_node(mid, relem, rng);

        self.nodes[node_idx as usize] = KdNode::split(dim, val, right);
        node_idx
    }

    /// Partition `list[lelem..relem]` in place around a split value
    ///
    /// Associations with `value <= val` on `dim` end up first.
    ///
    /// ### Returns
    ///
    /// Index of the first association of the upper part
    fn partition(&mut self, lelem: u32, relem: u32, dim: u8, val: u8) -> u32 {
        let descriptors = self.descriptors;
        let slice = &mut self.list[lelem as usize..relem as usize];

        let mut i = 0;
        let mut j = slice.len();
        while i < j {
            if descriptors[slice[i].global_index as usize][dim as usize] <= val {
                i += 1;
            } else {
                j -= 1;
                slice.swap(i, j);
            }
        }

        lelem + i as u32
    }

    ///////////////
    // Accessors //
    ///////////////

    #[inline(always)]
    pub fn root(&self) -> u32 {
        0
    }

    #[inline(always)]
    pub fn node_count(&self) -> u32 {
        self.nodes.len() as u32
    }

    #[inline(always)]
    pub fn node(&self, n: u32) -> NodeKind {
        self.nodes[n as usize].kind()
    }

    #[inline(always)]
    pub fn is_leaf(&self, n: u32) -> bool {
        self.nodes[n as usize].is_leaf()
    }

    /// Left child of an internal node; panics on leaves
    #[inline(always)]
    pub fn left(&self, n: u32) -> u32 {
        assert!(!self.is_leaf(n), "left() called on leaf node {}", n);
        n + 1
    }

    /// Right child of an internal node; panics on leaves
    #[inline(always)]
    pub fn right(&self, n: u32) -> u32 {
        assert!(!self.is_leaf(n), "right() called on leaf node {}", n);
        self.nodes[n as usize].index()
    }

    /// Split dimension of an internal node; panics on leaves
    pub fn dim(&self, n: u32) -> u8 {
        match self.node(n) {
            NodeKind::Split { dim, .. } => dim,
            NodeKind::Leaf { .. } => panic!("dim() called on leaf node {}", n),
        }
    }

    /// Split value of an internal node; panics on leaves
    pub fn val(&self, n: u32) -> u8 {
        match self.node(n) {
            NodeKind::Split { val, .. } => val,
            NodeKind::Leaf { .. } => panic!("val() called on leaf node {}", n),
        }
    }

    #[inline(always)]
    pub fn bb(&self, n: u32) -> &BoundingBox {
        &self.bb[n as usize]
    }

    /// Associations stored in a leaf; panics on internal nodes
    #[inline]
    pub fn list(&self, n: u32) -> &[DescriptorAssociation] {
        match self.node(n) {
            NodeKind::Leaf { start, end } => {
                assert!(
                    start <= end && end as usize <= self.list.len(),
                    "corrupt leaf range {}..{} at node {}",
                    start,
                    end,
                    n
                );
                &self.list[start as usize..end as usize]
            }
            NodeKind::Split { .. } => panic!("list() called on internal node {}", n),
        }
    }

    #[inline(always)]
    pub fn descriptors(&self) -> &'a [U8Descriptor] {
        self.descriptors
    }

    #[inline(always)]
    pub fn descriptor_count(&self) -> usize {
        self.descriptors.len()
    }

    pub fn leaf_size(&self) -> usize {
        self.leaf_size
    }

    /// Number of leaf nodes
    pub fn leaf_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_leaf()).count()
    }

    /// Length of the longest root-to-leaf path, counted in edges
    pub fn depth(&self) -> usize {
        let mut max_depth = 0;
        let mut stack = vec![(self.root(), 0usize)];
        while let Some((n, depth)) = stack.pop() {
            max_depth = max_depth.max(depth);
            if let NodeKind::Split { right, .. } = self.node(n) {
                stack.push((n + 1, depth + 1));
                stack.push((right, depth + 1));
            }
        }
        max_depth
    }

    /// Returns the size of the tree in bytes, excluding the borrowed
    /// descriptors
    pub fn memory_usage_bytes(&self) -> usize {
        std::mem::size_of_val(self)
            + self.nodes.capacity() * std::mem::size_of::<KdNode>()
            + self.bb.capacity() * std::mem::size_of::<BoundingBox>()
            + self.list.capacity() * std::mem::size_of::<DescriptorAssociation>()
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::generate_random_descriptors;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// Walk the tree and check the structural invariants
    ///
    /// Returns the global indices found in the leaves, in leaf order.
    fn check_structure(tree: &KdTree) -> Vec<u32> {
        let mut seen_nodes = vec![false; tree.node_count() as usize];
        let mut leaf_items = Vec::new();
        let mut stack = vec![tree.root()];

        while let Some(n) = stack.pop() {
            assert!(!seen_nodes[n as usize], "node {} reached twice", n);
            seen_nodes[n as usize] = true;

            let bb = tree.bb(n);
            assert!(bb.is_valid());

            match tree.node(n) {
                NodeKind::Leaf { .. } => {
                    for assoc in tree.list(n) {
                        let desc = &tree.descriptors()[assoc.global_index as usize];
                        assert!(bb.contains(desc));
                        leaf_items.push(assoc.global_index);
                    }
                }
                NodeKind::Split { dim, val, right } => {
                    assert_eq!(tree.left(n), n + 1);
                    assert_eq!(tree.right(n), right);
                    assert!(right > n + 1);
                    assert!((dim as usize) < DESCRIPTOR_DIM);
                    assert!(bb.contains_box(tree.bb(n + 1)));
                    assert!(bb.contains_box(tree.bb(right)));

                    // left subtree holds <= val, right subtree > val
                    assert!(tree.bb(n + 1).max[dim as usize] <= val);
                    assert!(tree.bb(right).min[dim as usize] > val);

                    stack.push(right);
                    stack.push(n + 1);
                }
            }
        }

        assert!(seen_nodes.iter().all(|&s| s), "unreachable nodes");
        leaf_items
    }

    #[test]
    fn test_kd_node_packing() {
        let leaf = KdNode::leaf(12, 40);
        assert!(leaf.is_leaf());
        assert_eq!(leaf.kind(), NodeKind::Leaf { start: 12, end: 40 });

        let split = KdNode::split(127, 255, (1 << 31) - 1);
        assert!(!split.is_leaf());
        assert_eq!(
            split.kind(),
            NodeKind::Split {
                dim: 127,
                val: 255,
                right: (1 << 31) - 1
            }
        );
    }

    #[test]
    fn test_build_structure_invariants() {
        let (descriptors, image_indexes) = generate_random_descriptors(1000, 10, 42);
        let mut rng = StdRng::seed_from_u64(42);
        let tree = KdTree::build(&descriptors, &image_indexes, 8, &mut rng).unwrap();

        assert!(!tree.is_leaf(tree.root()));
        let mut items = check_structure(&tree);
        items.sort_unstable();
        let expected: Vec<u32> = (0..1000).collect();
        assert_eq!(items, expected);

        for n in 0..tree.node_count() {
            if tree.is_leaf(n) {
                assert!(tree.list(n).len() <= 8);
                assert!(!tree.list(n).is_empty());
            }
        }
    }

    #[test]
    fn test_build_deterministic() {
        let (descriptors, image_indexes) = generate_random_descriptors(500, 4, 1);

        let mut rng1 = StdRng::seed_from_u64(99);
        let mut rng2 = StdRng::seed_from_u64(99);
        let t1 = KdTree::build(&descriptors, &image_indexes, 4, &mut rng1).unwrap();
        let t2 = KdTree::build(&descriptors, &image_indexes, 4, &mut rng2).unwrap();

        assert_eq!(t1.nodes, t2.nodes);
        assert_eq!(t1.bb, t2.bb);
        assert_eq!(t1.list, t2.list);
    }

    #[test]
    fn test_different_seeds_differ() {
        let (descriptors, image_indexes) = generate_random_descriptors(500, 4, 1);

        let mut rng1 = StdRng::seed_from_u64(1);
        let mut rng2 = StdRng::seed_from_u64(2);
        let t1 = KdTree::build(&descriptors, &image_indexes, 4, &mut rng1).unwrap();
        let t2 = KdTree::build(&descriptors, &image_indexes, 4, &mut rng2).unwrap();

        assert_ne!(t1.nodes, t2.nodes);
    }

    #[test]
    fn test_build_empty() {
        let mut rng = StdRng::seed_from_u64(0);
        let tree = KdTree::build(&[], &[], 8, &mut rng).unwrap();
        assert_eq!(tree.node_count(), 1);
        assert!(tree.is_leaf(0));
        assert!(tree.list(0).is_empty());
    }

    #[test]
    fn test_build_single() {
        let descriptors = vec![U8Descriptor::splat(3)];
        let mut rng = StdRng::seed_from_u64(0);
        let tree = KdTree::build(&descriptors, &[4], 8, &mut rng).unwrap();

        assert_eq!(tree.node_count(), 1);
        assert!(tree.is_leaf(0));
        let list = tree.list(0);
        assert_eq!(list.len(), 1);
        assert_eq!(
            list[0],
            DescriptorAssociation {
                global_index: 0,
                image_index: 4,
                local_index: 0
            }
        );
    }

    #[test]
    fn test_build_identical_descriptors_terminates() {
        let descriptors = vec![U8Descriptor::splat(77); 100];
        let image_indexes = vec![0u16; 100];
        let mut rng = StdRng::seed_from_u64(0);
        let tree = KdTree::build(&descriptors, &image_indexes, 4, &mut rng).unwrap();

        // no dimension has variance, so the root stays a leaf
        assert_eq!(tree.node_count(), 1);
        assert_eq!(tree.list(0).len(), 100);
    }

    #[test]
    fn test_build_two_distinct_values() {
        let mut descriptors = vec![U8Descriptor::splat(0); 20];
        for d in descriptors.iter_mut().skip(10) {
            d.features[3] = 200;
        }
        let image_indexes = vec![0u16; 20];
        let mut rng = StdRng::seed_from_u64(0);
        let tree = KdTree::build(&descriptors, &image_indexes, 4, &mut rng).unwrap();

        assert_eq!(tree.dim(0), 3);
        assert_eq!(tree.val(0), 100);
        check_structure(&tree);
    }

    #[test]
    fn test_build_rejects_bad_input() {
        let descriptors = vec![U8Descriptor::splat(0); 3];
        let mut rng = StdRng::seed_from_u64(0);

        assert_eq!(
            KdTree::build(&descriptors, &[0, 0], 8, &mut rng).err(),
            Some(KdForestError::LengthMismatch {
                descriptors: 3,
                image_indexes: 2
            })
        );
        assert_eq!(
            KdTree::build(&descriptors, &[0, 0, 0], 0, &mut rng).err(),
            Some(KdForestError::ZeroLeafSize)
        );
    }

    #[test]
    fn test_split_dimensions_ranking() {
        let mut descriptors = vec![U8Descriptor::splat(50); 4];
        // dim 9 has the largest spread, then dim 2, then dim 100
        let values = [(9, [0, 255, 0, 255]), (2, [0, 100, 0, 100]), (100, [10, 20, 10, 20])];
        for (dim, vals) in values {
            for (d, v) in descriptors.iter_mut().zip(vals) {
                d.features[dim] = v;
            }
        }
        let list = associations_from_image_indexes(&[0; 4]).unwrap();
        let split = split_dimensions(&descriptors, &list);

        assert_eq!(split.len, 3);
        assert_eq!(&split.dims[..3], &[9, 2, 100]);
        assert_eq!(&split.means[..3], &[127, 50, 15]);
    }

    #[test]
    #[should_panic(expected = "called on leaf")]
    fn test_left_on_leaf_panics() {
        let descriptors = vec![U8Descriptor::splat(3)];
        let mut rng = StdRng::seed_from_u64(0);
        let tree = KdTree::build(&descriptors, &[0], 8, &mut rng).unwrap();
        tree.left(0);
    }

    #[test]
    #[should_panic(expected = "called on internal")]
    fn test_list_on_internal_panics() {
        let (descriptors, image_indexes) = generate_random_descriptors(100, 1, 3);
        let mut rng = StdRng::seed_from_u64(0);
        let tree = KdTree::build(&descriptors, &image_indexes, 8, &mut rng).unwrap();
        tree.list(0);
    }

    #[test]
    #[should_panic]
    fn test_node_out_of_range_panics() {
        let descriptors = vec![U8Descriptor::splat(3)];
        let mut rng = StdRng::seed_from_u64(0);
        let tree = KdTree::build(&descriptors, &[0], 8, &mut rng).unwrap();
        tree.is_leaf(5);
    }
}
