//! Error types for building and querying the forest.
//!
//! Contract violations (accessing split data of a leaf, node ids out of
//! range) panic instead; only caller-supplied arguments are checked here.

use thiserror::Error;

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, KdForestError>;

/// Errors raised when the input handed to the index is unusable
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KdForestError {
    /// Leaf size of zero would never terminate the recursion
    #[error("leaf size must be at least 1")]
    ZeroLeafSize,

    /// A forest needs at least one tree
    #[error("tree count must be at least 1")]
    ZeroTreeCount,

    /// Descriptor and image index slices differ in length
    #[error("got {descriptors} descriptors but {image_indexes} image indexes")]
    LengthMismatch {
        descriptors: usize,
        image_indexes: usize,
    },

    /// Node and list offsets are stored in 31 bits
    #[error("{count} descriptors exceed the maximum of {max}")]
    TooManyDescriptors { count: usize, max: usize },

    /// Local indices are stored as u16
    #[error("image {image_index} holds more than {max} descriptors")]
    TooManyDescriptorsInImage { image_index: u16, max: usize },

    /// Raw byte buffer cannot be viewed as descriptors
    #[error("cannot view {len} bytes as descriptors: {reason}")]
    InvalidDescriptorBytes { len: usize, reason: String },

    /// The vectorised kernel disagrees with the scalar reference
    #[error("SIMD kernel mismatch on trial {trial}: simd = {simd}, scalar = {scalar}")]
    KernelMismatch { trial: usize, simd: u32, scalar: u32 },
}
