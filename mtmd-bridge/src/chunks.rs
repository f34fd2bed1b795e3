//! Input chunks produced by mixed text and image tokenization

use crate::token::{LlamaPos, LlamaToken};

/// Text input configuration
#[derive(Debug, Clone)]
pub struct InputText {
    /// The text content
    pub text: String,
    /// Whether to add special tokens
    pub add_special: bool,
    /// Whether to parse special tokens (media markers included)
    pub parse_special: bool,
}

impl InputText {
    /// Create a new text input with default settings
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            add_special: true,
            parse_special: true,
        }
    }

    /// Set whether to add special tokens
    #[must_use]
    pub fn with_add_special(mut self, add: bool) -> Self {
        self.add_special = add;
        self
    }

    /// Set whether to parse special tokens
    #[must_use]
    pub fn with_parse_special(mut self, parse: bool) -> Self {
        self.parse_special = parse;
        self
    }
}

/// Type of input chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkType {
    /// Run of vocabulary tokens
    Text,
    /// Block of image embedding slots
    Image,
}

/// A run of text tokens
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    /// Tokens in prompt order
    pub tokens: Vec<LlamaToken>,
}

/// A block of image tokens.
///
/// `tokens` is the engine's opaque handle to the preprocessed image; the
/// counts are what the encoder will produce for it.
#[derive(Debug)]
pub struct ImageChunk<I> {
    /// Number of embedding slots the encoder produces
    pub n_tokens: usize,
    /// Number of positions consumed in the context window; differs from
    /// `n_tokens` only for M-RoPE projectors
    pub n_pos: LlamaPos,
    /// Width of the token grid
    pub nx: usize,
    /// Height of the token grid
    pub ny: usize,
    /// Engine-owned image tokens
    pub tokens: I,
}

/// A single chunk of input
#[derive(Debug)]
pub enum Chunk<I> {
    /// Text tokens
    Text(TextChunk),
    /// Image tokens
    Image(ImageChunk<I>),
}

impl<I> Chunk<I> {
    /// Get the type of this chunk
    pub fn chunk_type(&self) -> ChunkType {
        match self {
            Self::Text(_) => ChunkType::Text,
            Self::Image(_) => ChunkType::Image,
        }
    }

    /// Get the total number of tokens in this chunk
    pub fn n_tokens(&self) -> usize {
        match self {
            Self::Text(text) => text.tokens.len(),
            Self::Image(image) => image.n_tokens,
        }
    }

    /// Number of positions this chunk advances the sequence by
    pub fn n_pos(&self) -> LlamaPos {
        match self {
            Self::Text(text) => LlamaPos::try_from(text.tokens.len()).unwrap_or(LlamaPos::MAX),
            Self::Image(image) => image.n_pos,
        }
    }

    /// Get the tokens for a text chunk
    pub fn text_tokens(&self) -> Option<&[LlamaToken]> {
        match self {
            Self::Text(text) => Some(&text.tokens),
            Self::Image(_) => None,
        }
    }
}

/// Ordered chunks from one tokenization call
#[derive(Debug)]
pub struct ChunkSequence<I> {
    chunks: Vec<Chunk<I>>,
}

impl<I> ChunkSequence<I> {
    /// Wrap chunks already in prompt order
    pub fn new(chunks: Vec<Chunk<I>>) -> Self {
        Self { chunks }
    }

    /// Get the number of chunks
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Check if the sequence is empty
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Get a chunk by index
    pub fn get(&self, index: usize) -> Option<&Chunk<I>> {
        self.chunks.get(index)
    }

    /// Iterate over all chunks
    pub fn iter(&self) -> std::slice::Iter<'_, Chunk<I>> {
        self.chunks.iter()
    }

    /// Total number of tokens across all chunks
    pub fn total_tokens(&self) -> usize {
        self.chunks.iter().map(Chunk::n_tokens).sum()
    }

    /// Total position count across all chunks
    pub fn total_positions(&self) -> LlamaPos {
        self.chunks.iter().map(Chunk::n_pos).sum()
    }

    /// Move every chunk of `other` onto the end of this sequence
    pub fn append(&mut self, other: ChunkSequence<I>) {
        self.chunks.extend(other.chunks);
    }
}

impl<'a, I> IntoIterator for &'a ChunkSequence<I> {
    type Item = &'a Chunk<I>;
    type IntoIter = std::slice::Iter<'a, Chunk<I>>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
