//! Bridge between a managed host application and the llama.cpp multimodal
//! chunk pipeline.
//!
//! The pipeline turns a platform image plus a prompt into a position-correct
//! stream for an autoregressive decoder:
//!
//! 1. [`pixels::extract_rgb`] copies a platform image into an RGB [`Bitmap`].
//! 2. [`engine::Projector::tokenize`] splits the prompt at media markers into a
//!    [`ChunkSequence`] of text runs and image blocks.
//! 3. Either [`batch::add_chunk`] stages one chunk at an explicit position
//!    (manual path), or [`ChunkEvaluator::eval`] feeds the whole sequence and
//!    returns the next free position (production path).
//!
//! Hosts reach all of this through [`Bridge`], which keeps every resource in
//! a handle table and hands out opaque integer [`Handle`]s.
//!
//! # Features
//!
//! - `llama`: llama.cpp / libmtmd implementation of the engine seams.
//! - `jni`: Android exports for `android.llama.cpp.LLamaAndroid` (Android
//!   targets only).

pub mod batch;
pub mod bitmap;
pub mod bridge;
pub mod chunks;
pub mod config;
pub mod engine;
pub mod error;
pub mod eval;
pub mod handles;
pub mod pixels;
pub mod token;

#[cfg(feature = "llama")]
pub mod llama;

#[cfg(all(feature = "jni", target_os = "android"))]
mod android;

pub use batch::{Batch, BatchEntry};
pub use bitmap::Bitmap;
pub use bridge::{Bridge, TurnState};
pub use chunks::{Chunk, ChunkSequence, ChunkType, ImageChunk, InputText, TextChunk};
pub use config::{ProjectorParams, ResolvedParams, Verbosity};
pub use engine::{DecodeInput, Decoder, EmbeddingBatch, Engine, Projector};
pub use error::{BridgeError, ImageAccessError};
pub use eval::ChunkEvaluator;
pub use handles::Handle;
pub use pixels::{ImageInfo, ImageSource, PixelFormat};
pub use token::{LlamaPos, LlamaSeqId, LlamaToken};
