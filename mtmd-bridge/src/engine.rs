//! Seams to the inference engine.
//!
//! The bridge never touches vision or transformer math itself. It drives a
//! [`Projector`] (tokenizer plus vision encoder) and a [`Decoder`] (the text
//! model's context), both supplied by an [`Engine`]. The `llama` feature
//! provides the llama.cpp implementation.

use std::path::Path;

use crate::batch::Batch;
use crate::bitmap::Bitmap;
use crate::chunks::{ChunkSequence, ImageChunk, InputText};
use crate::config::ResolvedParams;
use crate::error::BridgeError;
use crate::token::{LlamaPos, LlamaSeqId};

/// Vision projector bound to a text model.
pub trait Projector {
    /// Engine handle to a preprocessed image inside a chunk
    type ImageTokens: Send + 'static;

    /// Split `text` at media markers and tokenize it, pairing markers with
    /// `bitmaps` left to right.
    ///
    /// # Errors
    /// The engine's numeric code: 1 when the bitmap count does not match the
    /// markers, 2 when image preprocessing fails.
    fn tokenize(
        &mut self,
        text: &InputText,
        bitmaps: &[&Bitmap],
    ) -> Result<ChunkSequence<Self::ImageTokens>, i32>;

    /// Run the vision encoder, returning `n_tokens * n_embd` floats.
    ///
    /// # Errors
    /// The engine's numeric code.
    fn encode(&mut self, image: &ImageChunk<Self::ImageTokens>) -> Result<Vec<f32>, i32>;

    /// Width of one embedding
    fn n_embd(&self) -> usize;

    /// Whether image embeddings are decoded with non-causal attention
    fn uses_non_causal(&self) -> bool;

    /// Whether the text model uses M-RoPE (4 position components per token)
    fn uses_mrope(&self) -> bool;
}

/// Embedding-valued batch for image tokens.
#[derive(Debug, Clone, Copy)]
pub struct EmbeddingBatch<'a> {
    /// `n_tokens * n_embd` floats, token-major
    pub embd: &'a [f32],
    /// Width of one embedding
    pub n_embd: usize,
    /// One position per token, or `4 * n_tokens` laid out component-major
    /// for M-RoPE
    pub positions: &'a [LlamaPos],
    /// Sequence the embeddings belong to
    pub seq_id: LlamaSeqId,
    /// Whether logits are requested for the final entry
    pub logits_last: bool,
}

impl EmbeddingBatch<'_> {
    /// Number of embeddings in the batch
    #[must_use]
    pub fn n_tokens(&self) -> usize {
        self.embd.len().checked_div(self.n_embd).unwrap_or(0)
    }

    /// Position components per token (1, or 4 for M-RoPE)
    #[must_use]
    pub fn n_pos_per_embd(&self) -> usize {
        self.positions.len().checked_div(self.n_tokens()).unwrap_or(1)
    }
}

/// What a single decode call submits.
#[derive(Debug, Clone, Copy)]
pub enum DecodeInput<'a> {
    /// Vocabulary ids
    Tokens(&'a Batch),
    /// Externally computed embeddings
    Embeddings(EmbeddingBatch<'a>),
}

/// A text model context that consumes batches.
pub trait Decoder {
    /// Run one forward pass over `input`.
    ///
    /// # Errors
    /// The engine's numeric code (e.g. 1 when no KV slot is left).
    fn decode(&mut self, input: DecodeInput<'_>) -> Result<(), i32>;

    /// Toggle causal attention for subsequent decodes
    fn set_causal_attention(&mut self, causal: bool);
}

/// Factory tying model, context and projector types together.
pub trait Engine: Send + Sync + 'static {
    /// Loaded text model
    type Model: Send + 'static;
    /// Inference context over a model
    type Context: Decoder + Send + 'static;
    /// Vision projector over a model
    type Projector: Projector + Send + 'static;

    /// Load projector weights from `path` for `model`.
    ///
    /// # Errors
    /// [`BridgeError::Load`] when the weights are missing, corrupt or do not
    /// match the model.
    fn load_projector(
        &self,
        model: &Self::Model,
        path: &Path,
        params: &ResolvedParams,
    ) -> Result<Self::Projector, BridgeError>;
}

/// Image-token handle type of an engine's projector
pub type ImageTokensOf<E> = <<E as Engine>::Projector as Projector>::ImageTokens;
