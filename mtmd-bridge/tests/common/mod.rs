//! Deterministic in-process engine for integration tests.
//!
//! The fake tokenizer maps every whitespace-separated word to one token and
//! every media marker to an image chunk of `ceil(w/16) * ceil(h/16)` tokens.
//! The fake context records every decode call.

#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex};

use mtmd_bridge::chunks::{Chunk, ChunkSequence, ImageChunk, InputText, TextChunk};
use mtmd_bridge::{
    Bitmap, Bridge, BridgeError, DecodeInput, Decoder, Engine, Handle, LlamaPos, LlamaSeqId,
    LlamaToken, Projector, ProjectorParams, ResolvedParams,
};

pub const BOS: LlamaToken = LlamaToken(1);
pub const PATCH: u32 = 16;
pub const N_EMBD: usize = 8;
pub const MARKER: &str = "<__media__>";

/// Code returned when the number of markers does not match the bitmaps
pub const COUNT_MISMATCH: i32 = 1;
/// Code returned when the context window is exhausted
pub const NO_KV_SLOT: i32 = 1;

#[derive(Debug, Clone, Default)]
pub struct FakeEngine {
    pub mrope: bool,
    pub non_causal: bool,
    pub fail_encode: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct FakeModel {
    pub n_embd: usize,
}

impl Default for FakeModel {
    fn default() -> Self {
        Self { n_embd: N_EMBD }
    }
}

impl Engine for FakeEngine {
    type Model = FakeModel;
    type Context = FakeContext;
    type Projector = FakeProjector;

    fn load_projector(
        &self,
        model: &FakeModel,
        path: &Path,
        params: &ResolvedParams,
    ) -> Result<FakeProjector, BridgeError> {
        if path.extension().and_then(|e| e.to_str()) != Some("gguf") {
            return Err(BridgeError::Load {
                path: path.to_path_buf(),
                reason: "not a gguf file".to_string(),
            });
        }
        Ok(FakeProjector {
            marker: params.media_marker.clone(),
            n_embd: model.n_embd,
            mrope: self.mrope,
            non_causal: self.non_causal,
            fail_encode: self.fail_encode,
            encoded: 0,
        })
    }
}

/// Preprocessed image: the grid plus the first pixel byte as fill value
#[derive(Debug)]
pub struct FakeImage {
    pub fill: f32,
}

#[derive(Debug)]
pub struct FakeProjector {
    pub marker: String,
    pub n_embd: usize,
    pub mrope: bool,
    pub non_causal: bool,
    pub fail_encode: Option<i32>,
    pub encoded: usize,
}

impl FakeProjector {
    pub fn new(engine: &FakeEngine) -> Self {
        let params = ProjectorParams::default().resolve(4);
        engine
            .load_projector(&FakeModel::default(), Path::new("mmproj.gguf"), &params)
            .expect("fake projector always loads")
    }
}

/// Token count the fake projector declares for an image of this size
pub fn declared_tokens(width: u32, height: u32) -> (usize, usize) {
    (width.div_ceil(PATCH) as usize, height.div_ceil(PATCH) as usize)
}

fn word_token(word: &str) -> LlamaToken {
    let sum: i32 = word.bytes().map(i32::from).sum();
    LlamaToken(100 + sum)
}

impl Projector for FakeProjector {
    type ImageTokens = FakeImage;

    fn tokenize(
        &mut self,
        text: &InputText,
        bitmaps: &[&Bitmap],
    ) -> Result<ChunkSequence<FakeImage>, i32> {
        let segments: Vec<&str> = text.text.split(self.marker.as_str()).collect();
        if segments.len() - 1 != bitmaps.len() {
            return Err(COUNT_MISMATCH);
        }

        let mut chunks = Vec::new();
        let mut pending: Vec<LlamaToken> = Vec::new();
        if text.add_special {
            pending.push(BOS);
        }

        for (i, segment) in segments.iter().enumerate() {
            pending.extend(segment.split_whitespace().map(word_token));
            if let Some(bitmap) = bitmaps.get(i) {
                if !pending.is_empty() {
                    chunks.push(Chunk::Text(TextChunk {
                        tokens: std::mem::take(&mut pending),
                    }));
                }
                let (nx, ny) = declared_tokens(bitmap.width(), bitmap.height());
                let n_tokens = nx * ny;
                let n_pos = if self.mrope { nx.max(ny) } else { n_tokens };
                chunks.push(Chunk::Image(ImageChunk {
                    n_tokens,
                    n_pos: LlamaPos::try_from(n_pos).expect("small test images"),
                    nx,
                    ny,
                    tokens: FakeImage {
                        fill: f32::from(bitmap.data()[0]),
                    },
                }));
            }
        }
        if !pending.is_empty() {
            chunks.push(Chunk::Text(TextChunk { tokens: pending }));
        }

        Ok(ChunkSequence::new(chunks))
    }

    fn encode(&mut self, image: &ImageChunk<FakeImage>) -> Result<Vec<f32>, i32> {
        if let Some(code) = self.fail_encode {
            return Err(code);
        }
        self.encoded += 1;
        Ok(vec![image.tokens.fill; image.n_tokens * self.n_embd])
    }

    fn n_embd(&self) -> usize {
        self.n_embd
    }

    fn uses_non_causal(&self) -> bool {
        self.non_causal
    }

    fn uses_mrope(&self) -> bool {
        self.mrope
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodeCall {
    Tokens {
        tokens: Vec<LlamaToken>,
        positions: Vec<LlamaPos>,
        seq_ids: Vec<LlamaSeqId>,
        logits: Vec<bool>,
    },
    Embeddings {
        n_tokens: usize,
        positions: Vec<LlamaPos>,
        logits_last: bool,
        causal: bool,
    },
}

impl DecodeCall {
    pub fn n_tokens(&self) -> usize {
        match self {
            Self::Tokens { tokens, .. } => tokens.len(),
            Self::Embeddings { n_tokens, .. } => *n_tokens,
        }
    }

    /// Whether any entry requested logits
    pub fn wants_logits(&self) -> bool {
        match self {
            Self::Tokens { logits, .. } => logits.iter().any(|&l| l),
            Self::Embeddings { logits_last, .. } => *logits_last,
        }
    }
}

#[derive(Debug)]
pub struct DecodeLog {
    pub calls: Vec<DecodeCall>,
    pub causal: bool,
    pub used: usize,
}

impl Default for DecodeLog {
    fn default() -> Self {
        Self {
            calls: Vec::new(),
            causal: true,
            used: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FakeContext {
    pub n_ctx: usize,
    pub log: Arc<Mutex<DecodeLog>>,
}

impl FakeContext {
    pub fn new(n_ctx: usize) -> Self {
        Self {
            n_ctx,
            log: Arc::default(),
        }
    }

    pub fn calls(&self) -> Vec<DecodeCall> {
        self.log.lock().unwrap().calls.clone()
    }

    pub fn causal(&self) -> bool {
        self.log.lock().unwrap().causal
    }

    /// Text tokens decoded, in submission order
    pub fn decoded_tokens(&self) -> Vec<(LlamaToken, LlamaPos)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                DecodeCall::Tokens {
                    tokens, positions, ..
                } => Some(tokens.into_iter().zip(positions)),
                DecodeCall::Embeddings { .. } => None,
            })
            .flatten()
            .collect()
    }
}

impl Decoder for FakeContext {
    fn decode(&mut self, input: DecodeInput<'_>) -> Result<(), i32> {
        let mut log = self.log.lock().unwrap();
        let call = match input {
            DecodeInput::Tokens(batch) => DecodeCall::Tokens {
                tokens: batch.entries().iter().map(|e| e.token).collect(),
                positions: batch.entries().iter().map(|e| e.pos).collect(),
                seq_ids: batch.entries().iter().map(|e| e.seq_id).collect(),
                logits: batch.entries().iter().map(|e| e.logits).collect(),
            },
            DecodeInput::Embeddings(batch) => DecodeCall::Embeddings {
                n_tokens: batch.n_tokens(),
                positions: batch.positions.to_vec(),
                logits_last: batch.logits_last,
                causal: log.causal,
            },
        };

        if log.used + call.n_tokens() > self.n_ctx {
            return Err(NO_KV_SLOT);
        }
        log.used += call.n_tokens();
        log.calls.push(call);
        Ok(())
    }

    fn set_causal_attention(&mut self, causal: bool) {
        self.log.lock().unwrap().causal = causal;
    }
}

/// Solid RGB bitmap
pub fn solid_bitmap(width: u32, height: u32, value: u8) -> Bitmap {
    let len = (width * height * 3) as usize;
    Bitmap::from_rgb(width, height, vec![value; len]).unwrap()
}

/// Bridge with one model, one context and one projector already loaded
pub struct Fixture {
    pub bridge: Bridge<FakeEngine>,
    pub context: FakeContext,
    pub model: Handle,
    pub context_handle: Handle,
    pub projector: Handle,
}

impl Fixture {
    pub fn new(engine: FakeEngine, n_ctx: usize) -> Self {
        let bridge = Bridge::new(engine, ProjectorParams::default());
        let model = bridge.register_model(FakeModel::default());
        let context = FakeContext::new(n_ctx);
        let context_handle = bridge.register_context(context.clone());
        let projector = bridge.load_projector(model, "mmproj.gguf").unwrap();
        Self {
            bridge,
            context,
            model,
            context_handle,
            projector,
        }
    }
}
