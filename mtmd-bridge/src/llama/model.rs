//! Text model and inference context

use std::ffi::CString;
use std::num::NonZeroU32;
use std::path::Path;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use llama_cpp_sys_4 as sys;

use crate::batch::Batch;
use crate::engine::{DecodeInput, Decoder, EmbeddingBatch};
use crate::error::BridgeError;

/// A loaded text model
#[derive(Debug)]
pub struct LlamaModel {
    ptr: NonNull<sys::llama_model>,
}

impl LlamaModel {
    /// Load a GGUF model, offloading `n_gpu_layers` layers to the accelerator
    ///
    /// # Errors
    /// [`BridgeError::Load`] when the file cannot be loaded.
    pub fn load_from_file(path: impl AsRef<Path>, n_gpu_layers: i32) -> Result<Self, BridgeError> {
        let path = path.as_ref();
        let c_path = path_to_cstring(path)?;

        let mut params = unsafe { sys::llama_model_default_params() };
        params.n_gpu_layers = n_gpu_layers;

        let model = unsafe {
            // Safety: c_path outlives the call and params is a valid struct
            sys::llama_model_load_from_file(c_path.as_ptr(), params)
        };

        NonNull::new(model)
            .map(|ptr| Self { ptr })
            .ok_or_else(|| BridgeError::Load {
                path: path.to_path_buf(),
                reason: "model could not be loaded".to_string(),
            })
    }

    /// Width of the model's input embeddings
    #[must_use]
    pub fn n_embd(&self) -> usize {
        let n_embd = unsafe { sys::llama_model_n_embd(self.ptr.as_ptr()) };
        usize::try_from(n_embd).unwrap_or(0)
    }

    /// Get the raw pointer for FFI calls
    pub(crate) fn as_ptr(&self) -> NonNull<sys::llama_model> {
        self.ptr
    }
}

impl Drop for LlamaModel {
    fn drop(&mut self) {
        unsafe {
            sys::llama_model_free(self.ptr.as_ptr());
        }
    }
}

// Safety: the model is immutable after load and llama.cpp allows sharing it
unsafe impl Send for LlamaModel {}
// Safety: see above
unsafe impl Sync for LlamaModel {}

/// Parameters for creating an inference context
#[derive(Debug, Clone)]
pub struct LlamaContextParams {
    /// Context window size; `None` uses the model's training size
    pub n_ctx: Option<NonZeroU32>,
    /// Maximum entries per decode call
    pub n_batch: u32,
    /// Threads used for generation and batch processing
    pub n_threads: i32,
}

impl Default for LlamaContextParams {
    fn default() -> Self {
        Self {
            n_ctx: NonZeroU32::new(2048),
            n_batch: 512,
            n_threads: 4,
        }
    }
}

impl LlamaContextParams {
    /// Set the context window size
    #[must_use]
    pub fn with_n_ctx(mut self, n_ctx: Option<NonZeroU32>) -> Self {
        self.n_ctx = n_ctx;
        self
    }

    /// Set the batch size
    #[must_use]
    pub fn with_n_batch(mut self, n_batch: u32) -> Self {
        self.n_batch = n_batch;
        self
    }

    /// Set the thread count
    #[must_use]
    pub fn with_n_threads(mut self, n_threads: i32) -> Self {
        self.n_threads = n_threads;
        self
    }
}

/// Inference context over a [`LlamaModel`]
#[derive(Debug)]
pub struct LlamaContext {
    ptr: NonNull<sys::llama_context>,
    /// Keep a reference to the model to ensure it outlives the context
    _model: Arc<LlamaModel>,
}

impl LlamaContext {
    /// Create a context for `model`
    ///
    /// # Errors
    /// [`BridgeError::InitializationFailed`] when llama.cpp refuses the
    /// parameters (e.g. not enough memory for the KV cache).
    pub fn new(model: Arc<LlamaModel>, params: &LlamaContextParams) -> Result<Self, BridgeError> {
        let mut sys_params = unsafe { sys::llama_context_default_params() };
        sys_params.n_ctx = params.n_ctx.map_or(0, NonZeroU32::get);
        sys_params.n_batch = params.n_batch;
        sys_params.n_threads = params.n_threads;
        sys_params.n_threads_batch = params.n_threads;

        let ctx = unsafe {
            // Safety: the model pointer is valid as long as the Arc keeps it alive
            sys::llama_init_from_model(model.as_ptr().as_ptr(), sys_params)
        };

        NonNull::new(ctx)
            .map(|ptr| Self { ptr, _model: model })
            .ok_or(BridgeError::InitializationFailed { what: "llama context" })
    }
}

impl Decoder for LlamaContext {
    fn decode(&mut self, input: DecodeInput<'_>) -> Result<(), i32> {
        let mut native = match input {
            DecodeInput::Tokens(batch) => NativeBatch::from_tokens(batch),
            DecodeInput::Embeddings(batch) => NativeBatch::from_embeddings(&batch),
        };

        let ret = unsafe {
            // Safety: every array in the batch lives in `native` or in `input`
            // until llama_decode returns, and llama.cpp does not write to them
            sys::llama_decode(self.ptr.as_ptr(), native.as_sys())
        };

        if ret == 0 {
            Ok(())
        } else {
            Err(ret)
        }
    }

    fn set_causal_attention(&mut self, causal: bool) {
        unsafe { sys::llama_set_causal_attn(self.ptr.as_ptr(), causal) }
    }
}

impl Drop for LlamaContext {
    fn drop(&mut self) {
        unsafe {
            sys::llama_free(self.ptr.as_ptr());
        }
    }
}

// Safety: the context is only used through `&mut` and the bridge serializes access
unsafe impl Send for LlamaContext {}

/// Backing storage for a `llama_batch` built from bridge types.
struct NativeBatch {
    n_tokens: i32,
    tokens: Vec<sys::llama_token>,
    embd: *const f32,
    pos: Vec<sys::llama_pos>,
    embd_pos: *const sys::llama_pos,
    n_seq_id: Vec<i32>,
    seq_id: Vec<sys::llama_seq_id>,
    seq_ptrs: Vec<*mut sys::llama_seq_id>,
    logits: Vec<i8>,
}

impl NativeBatch {
    fn from_tokens(batch: &Batch) -> Self {
        let entries = batch.entries();
        Self {
            n_tokens: i32::try_from(entries.len()).unwrap_or(i32::MAX),
            tokens: entries.iter().map(|e| e.token.0).collect(),
            embd: ptr::null(),
            pos: entries.iter().map(|e| e.pos).collect(),
            embd_pos: ptr::null(),
            n_seq_id: vec![1; entries.len()],
            seq_id: entries.iter().map(|e| e.seq_id).collect(),
            seq_ptrs: Vec::new(),
            logits: entries.iter().map(|e| i8::from(e.logits)).collect(),
        }
    }

    fn from_embeddings(batch: &EmbeddingBatch<'_>) -> Self {
        let n = batch.n_tokens();
        let mut logits = vec![0; n];
        if batch.logits_last {
            if let Some(last) = logits.last_mut() {
                *last = 1;
            }
        }
        Self {
            n_tokens: i32::try_from(n).unwrap_or(i32::MAX),
            tokens: Vec::new(),
            embd: batch.embd.as_ptr(),
            pos: Vec::new(),
            embd_pos: batch.positions.as_ptr(),
            n_seq_id: vec![1; n],
            seq_id: vec![batch.seq_id; n],
            seq_ptrs: Vec::new(),
            logits,
        }
    }

    fn as_sys(&mut self) -> sys::llama_batch {
        self.seq_ptrs = self.seq_id.iter_mut().map(ptr::from_mut).collect();
        let (token, pos) = if self.embd.is_null() {
            (self.tokens.as_mut_ptr(), self.pos.as_mut_ptr())
        } else {
            (ptr::null_mut(), self.embd_pos.cast_mut())
        };

        sys::llama_batch {
            n_tokens: self.n_tokens,
            token,
            embd: self.embd.cast_mut(),
            pos,
            n_seq_id: self.n_seq_id.as_mut_ptr(),
            seq_id: self.seq_ptrs.as_mut_ptr(),
            logits: self.logits.as_mut_ptr(),
        }
    }
}

pub(crate) fn path_to_cstring(path: &Path) -> Result<CString, BridgeError> {
    let path_str = path.to_str().ok_or_else(|| BridgeError::Load {
        path: path.to_path_buf(),
        reason: "path is not valid UTF-8".to_string(),
    })?;
    Ok(CString::new(path_str)?)
}
