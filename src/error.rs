//! Error types for waveform_pca.

use thiserror::Error;

/// Result type alias for waveform_pca operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for model fitting, projection, and extraction.
///
/// All variants surface unmodified to the caller; none are retried
/// internally. They indicate a precondition the caller must fix
/// (re-run fitting, supply correctly shaped data, pick a valid mode).
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid fitting configuration (bad mode/shape combination,
    /// non-positive or oversized component count).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Projections or models requested before a run completed for the
    /// current parameters.
    #[error("not fitted: {0}")]
    NotFitted(&'static str),

    /// A new-waveform batch disagrees with the data used at fit time.
    #[error("shape mismatch in {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// No unit contributed any sampled waveform; nothing to fit.
    #[error("no sampled waveforms available to fit")]
    InsufficientData,

    /// An operation was invoked outside its supported preconditions
    /// (multi-segment spike train, unsupported mode, unknown unit).
    #[error("precondition violated: {0}")]
    Precondition(String),

    /// Storage-layer failure (missing file, unreadable array).
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Model encode/decode failure.
    #[error("model serialization failed: {0}")]
    Serialization(String),

    /// Eigendecomposition or other linear-algebra failure.
    #[error("linear algebra failure: {0}")]
    Linalg(String),
}
