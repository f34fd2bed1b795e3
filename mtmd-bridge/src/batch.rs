//! Inference batches and per-chunk batch assembly.
//!
//! [`add_chunk`] is the manual path: it expands one chunk into batch entries
//! at caller-chosen positions. Image chunks only reserve slots filled with
//! [`LlamaToken::EMBEDDING_PLACEHOLDER`]; nothing here runs the vision
//! encoder, so such a batch must not be decoded as-is. The whole-sequence
//! path is [`crate::eval::ChunkEvaluator`].

use tracing::{debug, warn};

use crate::chunks::{Chunk, ChunkSequence};
use crate::error::BridgeError;
use crate::eval::advance_by_index;
use crate::token::{LlamaPos, LlamaSeqId, LlamaToken};

/// Sequence id used by the manual assembly path.
pub const DEFAULT_SEQ_ID: LlamaSeqId = 0;

/// One staged token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchEntry {
    /// Vocabulary id, or the embedding placeholder
    pub token: LlamaToken,
    /// Position in the context window
    pub pos: LlamaPos,
    /// Sequence this entry belongs to
    pub seq_id: LlamaSeqId,
    /// Whether logits are computed for this entry
    pub logits: bool,
}

/// A bounded staging buffer of tokens submitted together to the decoder.
#[derive(Debug, Clone)]
pub struct Batch {
    entries: Vec<BatchEntry>,
    capacity: usize,
}

impl Batch {
    /// Create a batch holding at most `capacity` entries
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Add a token to the batch
    ///
    /// # Errors
    /// [`BridgeError::BatchFull`] when the batch is at capacity.
    pub fn add(
        &mut self,
        token: LlamaToken,
        pos: LlamaPos,
        seq_id: LlamaSeqId,
        logits: bool,
    ) -> Result<(), BridgeError> {
        if self.entries.len() >= self.capacity {
            return Err(BridgeError::BatchFull {
                capacity: self.capacity,
            });
        }
        self.entries.push(BatchEntry {
            token,
            pos,
            seq_id,
            logits,
        });
        Ok(())
    }

    /// Request logits for the last entry only
    pub fn set_last_logits(&mut self) {
        let last = self.entries.len().checked_sub(1);
        for (i, entry) in self.entries.iter_mut().enumerate() {
            entry.logits = Some(i) == last;
        }
    }

    /// Remove every entry, keeping the capacity
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of staged entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is staged
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of entries
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free slots left
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.capacity - self.entries.len()
    }

    /// Staged entries in insertion order
    #[must_use]
    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    /// Number of entries still holding the embedding placeholder
    #[must_use]
    pub fn placeholder_count(&self) -> usize {
        self.entries.iter().filter(|e| e.token.is_placeholder()).count()
    }
}

/// Append chunk `index` of `chunks` to `batch`, starting at `pos_offset`.
///
/// Text chunks add one entry per token; image chunks add one placeholder
/// entry per image token slot. Entries use sequence 0 and request no logits.
/// Nothing is appended unless the whole chunk fits.
///
/// Returns the number of entries added, which is the amount to advance the
/// caller's position by.
///
/// # Errors
/// [`BridgeError::Index`] for an index outside `[0, len)`,
/// [`BridgeError::InvalidArgument`] for a negative offset or one whose
/// positions would overflow, and [`BridgeError::BatchFull`] when the chunk
/// does not fit.
pub fn add_chunk<I>(
    batch: &mut Batch,
    chunks: &ChunkSequence<I>,
    index: usize,
    pos_offset: LlamaPos,
) -> Result<usize, BridgeError> {
    let chunk = chunks.get(index).ok_or(BridgeError::Index {
        index,
        len: chunks.len(),
    })?;

    if pos_offset < 0 {
        return Err(BridgeError::InvalidArgument("position must not be negative"));
    }
    let n_tokens = chunk.n_tokens();
    advance_by_index(pos_offset, n_tokens)?;
    if n_tokens > batch.remaining() {
        return Err(BridgeError::BatchFull {
            capacity: batch.capacity(),
        });
    }

    match chunk {
        Chunk::Text(text) => {
            for (pos, &token) in (pos_offset..).zip(&text.tokens) {
                batch.add(token, pos, DEFAULT_SEQ_ID, false)?;
            }
        }
        Chunk::Image(image) => {
            warn!(
                index,
                n_tokens = image.n_tokens,
                "image chunk staged as placeholders; embeddings must be injected before decode"
            );
            for pos in (pos_offset..).take(image.n_tokens) {
                batch.add(LlamaToken::EMBEDDING_PLACEHOLDER, pos, DEFAULT_SEQ_ID, false)?;
            }
        }
    }

    debug!(index, n_tokens, pos_offset, "chunk added to batch");
    Ok(n_tokens)
}
