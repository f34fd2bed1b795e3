//! llama.cpp and libmtmd implementation of the engine seams.
//!
//! [`LlamaEngine`] owns the llama.cpp backend. Models are shared through an
//! `Arc` so that contexts and projectors created from them keep the weights
//! alive after the host releases the model handle.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use llama_cpp_sys_4 as sys;
use tracing::info;

use crate::config::ResolvedParams;
use crate::engine::Engine;
use crate::error::BridgeError;

mod model;
mod projector;

pub use model::{LlamaContext, LlamaContextParams, LlamaModel};
pub use projector::{MtmdProjector, OwnedChunk};

static BACKEND_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Owner of the process-wide llama.cpp backend
#[derive(Debug)]
pub struct LlamaEngine {
    _private: (),
}

impl LlamaEngine {
    /// Initialize the backend
    ///
    /// # Errors
    /// [`BridgeError::InitializationFailed`] when an engine already exists.
    pub fn init() -> Result<Self, BridgeError> {
        if BACKEND_INITIALIZED
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(BridgeError::InitializationFailed {
                what: "llama backend (already initialized)",
            });
        }
        unsafe { sys::llama_backend_init() };
        info!("llama backend initialized");
        Ok(Self { _private: () })
    }

    /// Load a text model
    ///
    /// # Errors
    /// [`BridgeError::Load`] when the file cannot be loaded.
    pub fn load_model(
        &self,
        path: impl AsRef<Path>,
        n_gpu_layers: i32,
    ) -> Result<Arc<LlamaModel>, BridgeError> {
        LlamaModel::load_from_file(path, n_gpu_layers).map(Arc::new)
    }

    /// Create an inference context for `model`
    ///
    /// # Errors
    /// [`BridgeError::InitializationFailed`] when llama.cpp refuses the
    /// parameters.
    pub fn new_context(
        &self,
        model: &Arc<LlamaModel>,
        params: &LlamaContextParams,
    ) -> Result<LlamaContext, BridgeError> {
        LlamaContext::new(Arc::clone(model), params)
    }
}

impl Engine for LlamaEngine {
    type Model = Arc<LlamaModel>;
    type Context = LlamaContext;
    type Projector = MtmdProjector;

    fn load_projector(
        &self,
        model: &Arc<LlamaModel>,
        path: &Path,
        params: &ResolvedParams,
    ) -> Result<MtmdProjector, BridgeError> {
        MtmdProjector::new_from_file(path, Arc::clone(model), params)
    }
}

impl Drop for LlamaEngine {
    fn drop(&mut self) {
        unsafe { sys::llama_backend_free() };
        BACKEND_INITIALIZED.store(false, Ordering::SeqCst);
    }
}
