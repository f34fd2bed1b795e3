//! Token, position and sequence id types shared by the pipeline.

use std::fmt;

/// Position of a token in a sequence's context window.
pub type LlamaPos = i32;

/// Id of a sequence inside an inference context.
pub type LlamaSeqId = i32;

/// A vocabulary token id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct LlamaToken(pub i32);

impl LlamaToken {
    /// Sentinel for a batch slot whose embedding is computed outside the
    /// vocabulary (an image token). Never a valid vocabulary id.
    pub const EMBEDDING_PLACEHOLDER: Self = Self(-1);

    /// Create a new token from an i32.
    #[must_use]
    pub const fn new(token_id: i32) -> Self {
        Self(token_id)
    }

    /// Whether this is the external-embedding placeholder.
    #[must_use]
    pub const fn is_placeholder(self) -> bool {
        self.0 == Self::EMBEDDING_PLACEHOLDER.0
    }
}

impl fmt::Display for LlamaToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
