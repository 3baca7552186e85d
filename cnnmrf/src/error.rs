use thiserror::Error;

/// The error type for `CNNMRF-Burn` operations.
///
/// All of these are structural problems with the configuration or the tensors
/// handed in; none of them is transient, so callers are expected to abort the
/// synthesis run rather than retry.
#[derive(Error, Debug)]
pub enum CnnMrfError {
    /// Error for when an invalid model configuration is provided.
    /// This covers layer indices beyond the backbone depth, duplicate indices
    /// and zero-sized patches, strides or chunks.
    #[error("Invalid model configuration: {reason}")]
    InvalidConfiguration {
        /// The reason why the configuration is invalid.
        reason: String,
    },

    /// Error for when a feature map is too small for a single patch.
    #[error(
        "No {patch_size}x{patch_size} patch with stride {stride} fits a {height}x{width} feature map"
    )]
    EmptyPatchSet {
        /// Height of the feature map.
        height: usize,
        /// Width of the feature map.
        width: usize,
        /// Side length of a patch.
        patch_size: usize,
        /// Stride between patches.
        stride: usize,
    },

    /// Error for when a matching chunk would exceed the response budget.
    #[error("Resource exhausted: {reason}")]
    ResourceExhausted {
        /// Description of the allocation that does not fit.
        reason: String,
    },

    /// Error for when two tensors that must agree in shape do not.
    #[error("Shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch {
        /// The expected tensor shape.
        expected: String,
        /// The actual tensor shape.
        actual: String,
    },
}

/// A specialized `Result` type for `CNNMRF-Burn` operations.
pub type CnnMrfResult<T> = Result<T, CnnMrfError>;
