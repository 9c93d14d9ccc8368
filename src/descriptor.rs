use bytemuck::{Pod, PodCastError, Zeroable};
use std::ops::Index;

use crate::error::{KdForestError, Result};

////////////
// Consts //
////////////

/// Number of byte dimensions in a descriptor
pub const DESCRIPTOR_DIM: usize = 128;

/// Width of one SIMD lane group in bytes (256 bit)
pub const SIMD_LANE_BYTES: usize = 32;

/// Number of 256-bit groups per descriptor
pub const SIMD_LANES_PER_DESCRIPTOR: usize = DESCRIPTOR_DIM / SIMD_LANE_BYTES;

/// Largest descriptor count for which node ids (up to two per descriptor)
/// still fit the 31-bit node offsets
pub const MAX_DESCRIPTORS: usize = (1 << 30) - 1;

/// Largest number of descriptors a single image may contribute
pub const MAX_DESCRIPTORS_PER_IMAGE: usize = u16::MAX as usize + 1;

//////////////////
// U8Descriptor //
//////////////////

/// 128-dimensional unsigned byte descriptor
///
/// Aligned to 32 bytes so that every descriptor splits into four aligned
/// 256-bit loads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Pod, Zeroable)]
#[repr(C, align(32))]
pub struct U8Descriptor {
    pub features: [u8; DESCRIPTOR_DIM],
}

const _: () = assert!(std::mem::size_of::<U8Descriptor>() == 128);
const _: () = assert!(std::mem::align_of::<U8Descriptor>() >= 32);

impl U8Descriptor {
    /// Wrap a raw byte array
    pub const fn new(features: [u8; DESCRIPTOR_DIM]) -> Self {
        Self { features }
    }

    /// Descriptor with every dimension set to `value`
    pub const fn splat(value: u8) -> Self {
        Self {
            features: [value; DESCRIPTOR_DIM],
        }
    }

    /// Copy a descriptor out of a slice
    ///
    /// ### Params
    ///
    /// * `slice` - Exactly `DESCRIPTOR_DIM` bytes
    ///
    /// ### Returns
    ///
    /// `None` if the slice has the wrong length
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let features: [u8; DESCRIPTOR_DIM] = slice.try_into().ok()?;
        Some(Self { features })
    }

    /// The raw bytes
    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8; DESCRIPTOR_DIM] {
        &self.features
    }
}

impl Default for U8Descriptor {
    fn default() -> Self {
        Self::splat(0)
    }
}

impl Index<usize> for U8Descriptor {
    type Output = u8;

    #[inline(always)]
    fn index(&self, dim: usize) -> &u8 {
        &self.features[dim]
    }
}

///////////////////////////
// DescriptorAssociation //
///////////////////////////

/// Provenance of one indexed descriptor
///
/// ### Fields
///
/// * `global_index` - Position in the descriptor slice handed to the index
/// * `image_index` - Image the descriptor was extracted from
/// * `local_index` - Ordinal of the descriptor within its image
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
#[repr(C)]
pub struct DescriptorAssociation {
    pub global_index: u32,
    pub image_index: u16,
    pub local_index: u16,
}

const _: () = assert!(std::mem::size_of::<DescriptorAssociation>() == 8);

/// Generate the association list for a descriptor set
///
/// Local indices count the descriptors of each image in input order.
///
/// ### Params
///
/// * `image_indexes` - Image index per descriptor
///
/// ### Returns
///
/// One association per descriptor, in input order
pub fn associations_from_image_indexes(
    image_indexes: &[u16],
) -> Result<Vec<DescriptorAssociation>> {
    if image_indexes.len() > MAX_DESCRIPTORS {
        return Err(KdForestError::TooManyDescriptors {
            count: image_indexes.len(),
            max: MAX_DESCRIPTORS,
        });
    }

    let mut per_image = vec![0usize; MAX_DESCRIPTORS_PER_IMAGE];
    let mut list = Vec::with_capacity(image_indexes.len());

    for (i, &image_index) in image_indexes.iter().enumerate() {
        let local = per_image[image_index as usize];
        if local >= MAX_DESCRIPTORS_PER_IMAGE {
            return Err(KdForestError::TooManyDescriptorsInImage {
                image_index,
                max: MAX_DESCRIPTORS_PER_IMAGE,
            });
        }
        per_image[image_index as usize] += 1;

        list.push(DescriptorAssociation {
            global_index: i as u32,
            image_index,
            local_index: local as u16,
        });
    }

    Ok(list)
}

///////////////////
// Byte boundary //
///////////////////

/// View a raw byte buffer as descriptors without copying
///
/// ### Params
///
/// * `bytes` - Concatenated descriptors; must be 32-byte aligned and a
///   multiple of 128 bytes long
///
/// ### Returns
///
/// Borrowed descriptor slice
pub fn descriptors_from_bytes(bytes: &[u8]) -> Result<&[U8Descriptor]> {
    bytemuck::try_cast_slice(bytes).map_err(|e| {
        let reason = match e {
            PodCastError::TargetAlignmentGreaterAndInputNotAligned => "buffer not 32-byte aligned",
            PodCastError::OutputSliceWouldHaveSlop => "length not a multiple of 128",
            PodCastError::SizeMismatch => "size mismatch",
            PodCastError::AlignmentMismatch => "alignment mismatch",
        };
        KdForestError::InvalidDescriptorBytes {
            len: bytes.len(),
            reason: reason.to_string(),
        }
    })
}

/// Copy a raw byte buffer of arbitrary alignment into descriptors
///
/// ### Params
///
/// * `bytes` - Concatenated descriptors; length must be a multiple of 128
///
/// ### Returns
///
/// Owned, aligned descriptors
pub fn descriptors_from_bytes_copied(bytes: &[u8]) -> Result<Vec<U8Descriptor>> {
    if !bytes.len().is_multiple_of(DESCRIPTOR_DIM) {
        return Err(KdForestError::InvalidDescriptorBytes {
            len: bytes.len(),
            reason: "length not a multiple of 128".to_string(),
        });
    }

    Ok(bytes
        .chunks_exact(DESCRIPTOR_DIM)
        .map(|chunk| {
            let mut desc = U8Descriptor::default();
            desc.features.copy_from_slice(chunk);
            desc
        })
        .collect())
}

///////////
// Tests //
///////////
