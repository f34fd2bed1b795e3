//! Error types for the bridge

use std::ffi::NulError;
use std::path::PathBuf;
use thiserror::Error;

/// Engine code reported when a batch still holds image placeholder slots at
/// decode time.
pub const EVAL_UNFILLED_PLACEHOLDERS: i32 = -100;

/// Engine code reported when the tokenizer produced a chunk kind the bridge
/// cannot feed to the decoder (e.g. audio).
pub const TOKENIZE_UNSUPPORTED_CHUNK: i32 = -101;

/// Engine code reported when the encoder output does not hold
/// `n_tokens * n_embd` floats.
pub const EVAL_EMBEDDING_MISMATCH: i32 = -102;

/// Engine code reported when the prompt cannot be passed to the tokenizer
/// (interior NUL byte).
pub const TOKENIZE_INVALID_TEXT: i32 = -103;

/// Errors raised while reading pixels out of a platform image
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ImageAccessError {
    /// The platform could not report the image geometry
    #[error("Failed to get image info (code {code})")]
    InfoUnavailable { code: i32 },

    /// The platform refused to grant pixel access
    #[error("Failed to lock image pixels (code {code})")]
    LockFailed { code: i32 },

    /// Width or height is zero
    #[error("Invalid image dimensions: {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    /// Pixel format has no RGB conversion
    #[error("Unsupported pixel format: {format}")]
    UnsupportedFormat { format: i32 },

    /// Buffer length does not fit the reported geometry
    #[error("Pixel buffer holds {actual} bytes, geometry needs {expected}")]
    BufferSize { expected: usize, actual: usize },
}

/// Errors that can occur in bridge operations
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Platform image could not be read
    #[error("Image access failed: {0}")]
    ImageAccess(#[from] ImageAccessError),

    /// Projector or model weights missing, corrupt or incompatible
    #[error("Failed to load {}: {reason}", path.display())]
    Load { path: PathBuf, reason: String },

    /// Prompt/bitmap mismatch or tokenizer failure
    #[error("Tokenization failed with code {code}")]
    Tokenization { code: i32 },

    /// Chunk index outside the sequence
    #[error("Chunk index {index} out of range for {len} chunks")]
    Index { index: usize, len: usize },

    /// Vision encode or decoder forward pass failed
    #[error("Evaluation failed with code {code}")]
    Eval { code: i32 },

    /// Native engine object could not be created
    #[error("Failed to initialize {what}")]
    InitializationFailed { what: &'static str },

    /// Batch cannot take the requested entries
    #[error("Batch capacity {capacity} exceeded")]
    BatchFull { capacity: usize },

    /// Handle unknown, released, or of another kind
    #[error("Invalid {kind} handle: {handle}")]
    InvalidHandle { kind: &'static str, handle: u64 },

    /// Operation not allowed in the chunk sequence's current state
    #[error("Chunk sequence is {state}")]
    InvalidState { state: &'static str },

    /// Argument rejected before reaching the engine
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// String conversion error
    #[error("Failed to convert C string: {0}")]
    StringConversion(#[from] NulError),
}

impl BridgeError {
    /// The originating numeric code, when the failure came from the engine
    /// or platform.
    #[must_use]
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Tokenization { code } | Self::Eval { code } => Some(*code),
            Self::ImageAccess(
                ImageAccessError::InfoUnavailable { code } | ImageAccessError::LockFailed { code },
            ) => Some(*code),
            _ => None,
        }
    }
}
