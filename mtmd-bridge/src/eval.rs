//! Whole-sequence chunk evaluation.
//!
//! [`ChunkEvaluator::eval`] feeds every chunk of a sequence to the decoder in
//! order: text as vocabulary ids, images as encoder embeddings. It returns
//! the position right after the last chunk, which is where the next call for
//! the same sequence must start.

use std::ops::Range;

use tracing::{debug, error, info};

use crate::batch::Batch;
use crate::chunks::{Chunk, ChunkSequence, ImageChunk};
use crate::engine::{DecodeInput, Decoder, EmbeddingBatch, Projector};
use crate::error::{BridgeError, EVAL_EMBEDDING_MISMATCH};
use crate::token::{LlamaPos, LlamaSeqId, LlamaToken};

/// Position components per token for M-RoPE models.
const MROPE_COMPONENTS: usize = 4;

/// Drives a [`Projector`] and a [`Decoder`] across a [`ChunkSequence`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkEvaluator {
    n_batch: usize,
    seq_id: LlamaSeqId,
    logits_last: bool,
}

impl ChunkEvaluator {
    /// Evaluator submitting at most `n_batch` entries per decode, on
    /// sequence 0, with logits for the final token.
    #[must_use]
    pub fn new(n_batch: usize) -> Self {
        Self {
            n_batch,
            seq_id: 0,
            logits_last: true,
        }
    }

    /// Set the target sequence
    #[must_use]
    pub fn with_seq_id(mut self, seq_id: LlamaSeqId) -> Self {
        self.seq_id = seq_id;
        self
    }

    /// Set whether logits are requested for the final token of the final chunk
    #[must_use]
    pub fn with_logits_last(mut self, logits_last: bool) -> Self {
        self.logits_last = logits_last;
        self
    }

    /// Evaluate `chunks` starting at `n_past` and return the new position.
    ///
    /// On error the decoder may hold part of the sequence; the returned
    /// position is lost and the sequence cannot be resumed.
    ///
    /// # Errors
    /// [`BridgeError::InvalidArgument`] for a zero batch size and
    /// [`BridgeError::Eval`] with the engine code for any encode or decode
    /// failure.
    pub fn eval<P, D>(
        &self,
        projector: &mut P,
        decoder: &mut D,
        chunks: &ChunkSequence<P::ImageTokens>,
        n_past: LlamaPos,
    ) -> Result<LlamaPos, BridgeError>
    where
        P: Projector,
        D: Decoder,
    {
        if self.n_batch == 0 {
            return Err(BridgeError::InvalidArgument("batch capacity must be positive"));
        }

        let start = n_past;
        let mut n_past = n_past;
        let n_chunks = chunks.len();
        for (i, chunk) in chunks.iter().enumerate() {
            let logits_last = self.logits_last && i + 1 == n_chunks;
            n_past = match chunk {
                Chunk::Text(text) => self.eval_text(decoder, &text.tokens, n_past, logits_last)?,
                Chunk::Image(image) => {
                    self.eval_image(projector, decoder, image, n_past, logits_last)?
                }
            };
        }

        info!(n_chunks, start, n_past, seq_id = self.seq_id, "chunks evaluated");
        Ok(n_past)
    }

    fn eval_text<D: Decoder>(
        &self,
        decoder: &mut D,
        tokens: &[LlamaToken],
        mut n_past: LlamaPos,
        logits_last: bool,
    ) -> Result<LlamaPos, BridgeError> {
        let mut batch = Batch::new(self.n_batch);
        let n_pieces = tokens.len().div_ceil(self.n_batch);

        for (i, piece) in tokens.chunks(self.n_batch).enumerate() {
            batch.clear();
            for &token in piece {
                batch.add(token, n_past, self.seq_id, false)?;
                n_past = advance(n_past, 1)?;
            }
            if logits_last && i + 1 == n_pieces {
                batch.set_last_logits();
            }

            debug!(n_tokens = batch.len(), n_past, "decoding text batch");
            decoder.decode(DecodeInput::Tokens(&batch)).map_err(|code| {
                error!(code, n_past, "text decode failed");
                BridgeError::Eval { code }
            })?;
        }

        Ok(n_past)
    }

    fn eval_image<P: Projector, D: Decoder>(
        &self,
        projector: &mut P,
        decoder: &mut D,
        image: &ImageChunk<P::ImageTokens>,
        n_past: LlamaPos,
        logits_last: bool,
    ) -> Result<LlamaPos, BridgeError> {
        let embd = projector.encode(image).map_err(|code| {
            error!(code, n_tokens = image.n_tokens, "image encode failed");
            BridgeError::Eval { code }
        })?;

        let n_embd = projector.n_embd();
        if n_embd == 0 || embd.len() != image.n_tokens * n_embd {
            error!(
                len = embd.len(),
                n_tokens = image.n_tokens,
                n_embd,
                "encoder output size mismatch"
            );
            return Err(BridgeError::Eval {
                code: EVAL_EMBEDDING_MISMATCH,
            });
        }

        let non_causal = projector.uses_non_causal();
        if non_causal {
            decoder.set_causal_attention(false);
        }
        let result = self.decode_embeddings(
            decoder,
            image,
            &embd,
            n_embd,
            n_past,
            projector.uses_mrope(),
            logits_last,
        );
        if non_causal {
            decoder.set_causal_attention(true);
        }
        result?;

        advance(n_past, image.n_pos)
    }

    #[allow(clippy::too_many_arguments)]
    fn decode_embeddings<I, D: Decoder>(
        &self,
        decoder: &mut D,
        image: &ImageChunk<I>,
        embd: &[f32],
        n_embd: usize,
        n_past: LlamaPos,
        mrope: bool,
        logits_last: bool,
    ) -> Result<(), BridgeError> {
        let n_tokens = image.n_tokens;
        let mut start = 0;
        while start < n_tokens {
            let end = (start + self.n_batch).min(n_tokens);
            let positions = image_positions(n_past, image.nx, start..end, mrope)?;

            debug!(start, end, n_past, mrope, "decoding image batch");
            let input = DecodeInput::Embeddings(EmbeddingBatch {
                embd: &embd[start * n_embd..end * n_embd],
                n_embd,
                positions: &positions,
                seq_id: self.seq_id,
                logits_last: logits_last && end == n_tokens,
            });
            decoder.decode(input).map_err(|code| {
                error!(code, start, n_past, "image decode failed");
                BridgeError::Eval { code }
            })?;

            start = end;
        }
        Ok(())
    }
}

/// Positions for image tokens `range` of an image starting at `pos_0`.
///
/// Plain models get consecutive positions. M-RoPE models get four
/// component-major planes: temporal (`pos_0`), row, column, and an unused
/// zero plane.
pub(crate) fn image_positions(
    pos_0: LlamaPos,
    nx: usize,
    range: Range<usize>,
    mrope: bool,
) -> Result<Vec<LlamaPos>, BridgeError> {
    if !mrope {
        return range.map(|i| advance_by_index(pos_0, i)).collect();
    }

    let nx = nx.max(1);
    let len = range.len();
    let mut positions = vec![0; len * MROPE_COMPONENTS];
    for (j, i) in range.enumerate() {
        positions[j] = pos_0;
        positions[j + len] = advance_by_index(pos_0, i / nx)?;
        positions[j + 2 * len] = advance_by_index(pos_0, i % nx)?;
    }
    Ok(positions)
}

fn advance(pos: LlamaPos, by: LlamaPos) -> Result<LlamaPos, BridgeError> {
    pos.checked_add(by)
        .ok_or(BridgeError::InvalidArgument("position overflow"))
}

pub(crate) fn advance_by_index(pos: LlamaPos, by: usize) -> Result<LlamaPos, BridgeError> {
    let by = LlamaPos::try_from(by).map_err(|_| BridgeError::InvalidArgument("position overflow"))?;
    advance(pos, by)
}
