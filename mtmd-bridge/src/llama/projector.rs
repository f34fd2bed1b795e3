//! libmtmd vision projector

use std::ffi::CString;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::Arc;

use llama_cpp_sys_4 as sys;
use tracing::{debug, warn};

use super::model::{path_to_cstring, LlamaModel};
use crate::bitmap::Bitmap;
use crate::chunks::{Chunk, ChunkSequence, ImageChunk, InputText, TextChunk};
use crate::config::ResolvedParams;
use crate::engine::Projector;
use crate::error::{
    BridgeError, EVAL_EMBEDDING_MISMATCH, TOKENIZE_INVALID_TEXT, TOKENIZE_UNSUPPORTED_CHUNK,
};
use crate::token::{LlamaPos, LlamaToken};

/// `mtmd_tokenize` code for a bitmap that failed preprocessing
const PREPROCESS_FAILED: i32 = 2;

/// Vision projector loaded from an mmproj file
#[derive(Debug)]
pub struct MtmdProjector {
    ptr: NonNull<sys::mtmd_context>,
    n_embd: usize,
    /// Keep a reference to the model to ensure it outlives the projector
    _model: Arc<LlamaModel>,
}

impl MtmdProjector {
    /// Load projector weights from `path` for `model`
    ///
    /// # Errors
    /// [`BridgeError::Load`] when the file cannot be loaded or the projector
    /// has no vision encoder.
    pub fn new_from_file(
        path: &Path,
        model: Arc<LlamaModel>,
        params: &ResolvedParams,
    ) -> Result<Self, BridgeError> {
        let c_path = path_to_cstring(path)?;

        let mut sys_params = unsafe {
            // Safety: mtmd_context_params_default returns a valid struct
            sys::mtmd_context_params_default()
        };

        sys_params.use_gpu = params.use_gpu;
        sys_params.print_timings = params.print_timings;
        sys_params.n_threads = params.n_threads;
        sys_params.verbosity = params.verbosity.ggml_level() as sys::ggml_log_level;

        // Store CString to keep it alive during the call
        let c_marker = CString::new(params.media_marker.as_str())?;
        sys_params.media_marker = c_marker.as_ptr();

        let ctx = unsafe {
            // Safety: c_path and c_marker outlive the call and the model
            // pointer is valid as long as the Arc keeps it alive
            sys::mtmd_init_from_file(c_path.as_ptr(), model.as_ptr().as_ptr(), sys_params)
        };

        let Some(ptr) = NonNull::new(ctx) else {
            return Err(BridgeError::Load {
                path: path.to_path_buf(),
                reason: "projector could not be loaded".to_string(),
            });
        };

        let n_embd = model.n_embd();
        let projector = Self {
            ptr,
            n_embd,
            _model: model,
        };

        if !projector.supports_vision() {
            return Err(BridgeError::Load {
                path: path.to_path_buf(),
                reason: "projector has no vision encoder".to_string(),
            });
        }

        debug!(
            path = %path.display(),
            n_embd,
            non_causal = projector.uses_non_causal(),
            mrope = projector.uses_mrope(),
            "projector loaded"
        );
        Ok(projector)
    }

    /// Check if the model supports vision input
    #[must_use]
    pub fn supports_vision(&self) -> bool {
        unsafe { sys::mtmd_support_vision(self.ptr.as_ptr()) }
    }

    fn convert_chunks(chunks: &NativeChunks) -> Result<ChunkSequence<OwnedChunk>, i32> {
        let n_chunks = unsafe { sys::mtmd_input_chunks_size(chunks.ptr.as_ptr()) };
        let mut out = Vec::with_capacity(n_chunks);

        for i in 0..n_chunks {
            let chunk = unsafe { sys::mtmd_input_chunks_get(chunks.ptr.as_ptr(), i) };
            if chunk.is_null() {
                return Err(TOKENIZE_UNSUPPORTED_CHUNK);
            }

            let chunk_type = unsafe { sys::mtmd_input_chunk_get_type(chunk) };
            match chunk_type {
                sys::mtmd_input_chunk_type_MTMD_INPUT_CHUNK_TYPE_TEXT => {
                    out.push(Chunk::Text(TextChunk {
                        tokens: text_tokens(chunk),
                    }));
                }
                sys::mtmd_input_chunk_type_MTMD_INPUT_CHUNK_TYPE_IMAGE => {
                    out.push(Chunk::Image(image_chunk(chunk)?));
                }
                other => {
                    warn!(chunk_type = other, index = i, "unsupported chunk type");
                    return Err(TOKENIZE_UNSUPPORTED_CHUNK);
                }
            }
        }

        Ok(ChunkSequence::new(out))
    }
}

impl Projector for MtmdProjector {
    type ImageTokens = OwnedChunk;

    fn tokenize(
        &mut self,
        text: &InputText,
        bitmaps: &[&Bitmap],
    ) -> Result<ChunkSequence<OwnedChunk>, i32> {
        let c_text = CString::new(text.text.as_str()).map_err(|_| TOKENIZE_INVALID_TEXT)?;
        let sys_text = sys::mtmd_input_text {
            text: c_text.as_ptr(),
            add_special: text.add_special,
            parse_special: text.parse_special,
        };

        let native_bitmaps = bitmaps
            .iter()
            .map(|bitmap| NativeBitmap::new(bitmap))
            .collect::<Result<Vec<_>, _>>()?;
        let bitmap_ptrs: Vec<*const sys::mtmd_bitmap> = native_bitmaps
            .iter()
            .map(|b| b.ptr.as_ptr().cast_const())
            .collect();

        let chunks = NativeChunks::new()?;
        let result = unsafe {
            // Safety: the text, bitmaps and output list all outlive the call
            sys::mtmd_tokenize(
                self.ptr.as_ptr(),
                chunks.ptr.as_ptr(),
                &sys_text,
                bitmap_ptrs.as_ptr(),
                bitmap_ptrs.len(),
            )
        };
        if result != 0 {
            return Err(result);
        }

        Self::convert_chunks(&chunks)
    }

    fn encode(&mut self, image: &ImageChunk<OwnedChunk>) -> Result<Vec<f32>, i32> {
        let result = unsafe {
            sys::mtmd_encode_chunk(self.ptr.as_ptr(), image.tokens.ptr.as_ptr())
        };
        if result != 0 {
            return Err(result);
        }

        let ptr = unsafe { sys::mtmd_get_output_embd(self.ptr.as_ptr()) };
        if ptr.is_null() {
            return Err(EVAL_EMBEDDING_MISMATCH);
        }

        let len = image.n_tokens * self.n_embd;
        let embd = unsafe {
            // Safety: after a successful encode the output buffer holds
            // n_tokens * n_embd floats
            std::slice::from_raw_parts(ptr, len)
        };
        Ok(embd.to_vec())
    }

    fn n_embd(&self) -> usize {
        self.n_embd
    }

    fn uses_non_causal(&self) -> bool {
        unsafe { sys::mtmd_decode_use_non_causal(self.ptr.as_ptr()) }
    }

    fn uses_mrope(&self) -> bool {
        unsafe { sys::mtmd_decode_use_mrope(self.ptr.as_ptr()) }
    }
}

impl Drop for MtmdProjector {
    fn drop(&mut self) {
        unsafe {
            sys::mtmd_free(self.ptr.as_ptr());
        }
    }
}

// Safety: the projector is only used through `&mut` and the bridge serializes access
unsafe impl Send for MtmdProjector {}

/// Copy of an image chunk that outlives the list it came from
#[derive(Debug)]
pub struct OwnedChunk {
    ptr: NonNull<sys::mtmd_input_chunk>,
}

impl Drop for OwnedChunk {
    fn drop(&mut self) {
        unsafe {
            sys::mtmd_input_chunk_free(self.ptr.as_ptr());
        }
    }
}

// Safety: an owned chunk is immutable and not tied to a thread
unsafe impl Send for OwnedChunk {}

struct NativeChunks {
    ptr: NonNull<sys::mtmd_input_chunks>,
}

impl NativeChunks {
    fn new() -> Result<Self, i32> {
        let ptr = unsafe { sys::mtmd_input_chunks_init() };
        NonNull::new(ptr)
            .map(|ptr| Self { ptr })
            .ok_or(TOKENIZE_UNSUPPORTED_CHUNK)
    }
}

impl Drop for NativeChunks {
    fn drop(&mut self) {
        unsafe {
            sys::mtmd_input_chunks_free(self.ptr.as_ptr());
        }
    }
}

struct NativeBitmap {
    ptr: NonNull<sys::mtmd_bitmap>,
}

impl NativeBitmap {
    fn new(bitmap: &Bitmap) -> Result<Self, i32> {
        let ptr = unsafe {
            // Safety: data is width * height * 3 bytes, checked at construction
            sys::mtmd_bitmap_init(bitmap.width(), bitmap.height(), bitmap.data().as_ptr())
        };
        let native = NonNull::new(ptr).map(|ptr| Self { ptr }).ok_or(PREPROCESS_FAILED)?;

        if let Some(id) = bitmap.id() {
            let c_id = CString::new(id).map_err(|_| TOKENIZE_INVALID_TEXT)?;
            unsafe { sys::mtmd_bitmap_set_id(native.ptr.as_ptr(), c_id.as_ptr()) };
        }
        Ok(native)
    }
}

impl Drop for NativeBitmap {
    fn drop(&mut self) {
        unsafe {
            sys::mtmd_bitmap_free(self.ptr.as_ptr());
        }
    }
}

fn text_tokens(chunk: *const sys::mtmd_input_chunk) -> Vec<LlamaToken> {
    let mut n_tokens = 0;
    let tokens_ptr = unsafe { sys::mtmd_input_chunk_get_tokens_text(chunk, &mut n_tokens) };
    if tokens_ptr.is_null() || n_tokens == 0 {
        return Vec::new();
    }
    unsafe { std::slice::from_raw_parts(tokens_ptr, n_tokens) }
        .iter()
        .map(|&t| LlamaToken(t))
        .collect()
}

fn image_chunk(chunk: *const sys::mtmd_input_chunk) -> Result<ImageChunk<OwnedChunk>, i32> {
    let n_tokens = unsafe { sys::mtmd_input_chunk_get_n_tokens(chunk) };
    let n_pos: LlamaPos = unsafe { sys::mtmd_input_chunk_get_n_pos(chunk) };

    let image_tokens = unsafe { sys::mtmd_input_chunk_get_tokens_image(chunk) };
    let (nx, ny) = if image_tokens.is_null() {
        (n_tokens, 1)
    } else {
        unsafe {
            (
                sys::mtmd_image_tokens_get_nx(image_tokens),
                sys::mtmd_image_tokens_get_ny(image_tokens),
            )
        }
    };

    let copy = unsafe { sys::mtmd_input_chunk_copy(chunk) };
    let ptr = NonNull::new(copy).ok_or(TOKENIZE_UNSUPPORTED_CHUNK)?;

    Ok(ImageChunk {
        n_tokens,
        n_pos,
        nx,
        ny,
        tokens: OwnedChunk { ptr },
    })
}
