//! Handle-based operations exposed to the host application.
//!
//! A [`Bridge`] owns one handle table per resource kind. Every operation
//! takes and returns [`Handle`]s; every handle obtained must be released
//! once with the matching `release_*` call. Releasing twice is a logged no-op.
//!
//! Each chunk sequence moves through `Tokenized → Evaluated` (or `Failed`).
//! Only a `Tokenized` sequence may be evaluated, so no token is decoded twice
//! and a failed sequence is never continued. The next turn starts at the
//! position returned by [`Bridge::eval_chunks`].

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tracing::{error, info};

use crate::batch::{self, Batch};
use crate::bitmap::Bitmap;
use crate::chunks::{ChunkSequence, InputText};
use crate::config::{available_cores, ProjectorParams};
use crate::engine::{DecodeInput, Decoder, Engine, ImageTokensOf, Projector};
use crate::error::{BridgeError, EVAL_UNFILLED_PLACEHOLDERS};
use crate::eval::ChunkEvaluator;
use crate::handles::{lock, Handle, HandleTable};
use crate::pixels::{extract_rgb, ImageSource};
use crate::token::LlamaPos;

/// Lifecycle of a tokenized turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    /// Produced by tokenization, not yet evaluated
    Tokenized,
    /// Evaluated successfully
    Evaluated,
    /// Evaluation failed; the sequence's position state is lost
    Failed,
}

impl TurnState {
    fn as_str(self) -> &'static str {
        match self {
            Self::Tokenized => "tokenized",
            Self::Evaluated => "already evaluated",
            Self::Failed => "failed",
        }
    }
}

struct Turn<I> {
    chunks: ChunkSequence<I>,
    state: TurnState,
}

/// Handle tables plus the engine they belong to.
///
/// Fields drop in declaration order, so every resource is freed before the
/// engine that created it.
pub struct Bridge<E: Engine> {
    chunks: HandleTable<Turn<ImageTokensOf<E>>>,
    batches: HandleTable<Batch>,
    bitmaps: HandleTable<Arc<Bitmap>>,
    projectors: HandleTable<E::Projector>,
    contexts: HandleTable<E::Context>,
    models: HandleTable<E::Model>,
    params: ProjectorParams,
    engine: E,
}

impl<E: Engine> Bridge<E> {
    /// Bridge over `engine`, loading projectors with `params`
    pub fn new(engine: E, params: ProjectorParams) -> Self {
        Self {
            engine,
            params,
            models: HandleTable::new("model"),
            contexts: HandleTable::new("context"),
            projectors: HandleTable::new("projector"),
            bitmaps: HandleTable::new("bitmap"),
            chunks: HandleTable::new("chunks"),
            batches: HandleTable::new("batch"),
        }
    }

    /// The engine
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Projector parameters used by [`Bridge::load_projector`]
    pub fn params(&self) -> &ProjectorParams {
        &self.params
    }

    /// Take ownership of a loaded text model
    pub fn register_model(&self, model: E::Model) -> Handle {
        let handle = self.models.insert(model);
        info!(%handle, "model registered");
        handle
    }

    /// Release a text model. Projectors and contexts created from it keep it
    /// alive until they are released too.
    pub fn release_model(&self, model: Handle) -> bool {
        self.models.remove(model)
    }

    /// Run `f` on the model behind `model`
    ///
    /// # Errors
    /// [`BridgeError::InvalidHandle`] for an unknown model.
    pub fn with_model<R>(&self, model: Handle, f: impl FnOnce(&E::Model) -> R) -> Result<R, BridgeError> {
        let model = self.models.get(model)?;
        let model = lock(&model);
        Ok(f(&model))
    }

    /// Take ownership of an inference context
    pub fn register_context(&self, context: E::Context) -> Handle {
        let handle = self.contexts.insert(context);
        info!(%handle, "context registered");
        handle
    }

    /// Release an inference context
    pub fn release_context(&self, context: Handle) -> bool {
        self.contexts.remove(context)
    }

    /// Load projector weights at `path` for `model`.
    ///
    /// # Errors
    /// [`BridgeError::InvalidHandle`] for an unknown model and
    /// [`BridgeError::Load`] when the engine rejects the weights.
    pub fn load_projector(&self, model: Handle, path: impl AsRef<Path>) -> Result<Handle, BridgeError> {
        let path = path.as_ref();
        let model = self.models.get(model)?;
        let resolved = self.params.resolve(available_cores());

        let projector = self
            .engine
            .load_projector(&lock(&model), path, &resolved)
            .inspect_err(|e| error!(path = %path.display(), error = %e, "failed to load projector"))?;

        let handle = self.projectors.insert(projector);
        info!(
            %handle,
            path = %path.display(),
            use_gpu = resolved.use_gpu,
            n_threads = resolved.n_threads,
            "projector loaded"
        );
        Ok(handle)
    }

    /// Release a projector
    pub fn release_projector(&self, projector: Handle) -> bool {
        self.projectors.remove(projector)
    }

    /// Copy a platform image into a new RGB bitmap.
    ///
    /// # Errors
    /// [`BridgeError::ImageAccess`] when the platform refuses access or
    /// reports an unusable geometry.
    pub fn bitmap_from_image<S>(&self, image: &S) -> Result<Handle, BridgeError>
    where
        S: ImageSource + ?Sized,
    {
        let bitmap = extract_rgb(image).inspect_err(|e| {
            error!(code = ?e.code(), error = %e, "failed to read image pixels");
        })?;
        Ok(self.insert_bitmap(bitmap))
    }

    /// Take ownership of an already decoded bitmap
    pub fn insert_bitmap(&self, bitmap: Bitmap) -> Handle {
        let (width, height) = (bitmap.width(), bitmap.height());
        let handle = self.bitmaps.insert(Arc::new(bitmap));
        info!(%handle, width, height, "bitmap created");
        handle
    }

    /// Release a bitmap
    pub fn release_bitmap(&self, bitmap: Handle) -> bool {
        self.bitmaps.remove(bitmap)
    }

    /// Tokenize `prompt`, replacing its media markers with `bitmaps` in order.
    ///
    /// Bitmaps are read, not consumed. On failure no chunk handle exists.
    ///
    /// # Errors
    /// [`BridgeError::InvalidHandle`] for unknown handles and
    /// [`BridgeError::Tokenization`] with the engine code otherwise.
    pub fn tokenize(&self, projector: Handle, prompt: &str, bitmaps: &[Handle]) -> Result<Handle, BridgeError> {
        let projector = self.projectors.get(projector)?;
        let bitmaps = bitmaps
            .iter()
            .map(|&h| {
                let shared = self.bitmaps.get(h)?;
                let bitmap = Arc::clone(&lock(&shared));
                Ok(bitmap)
            })
            .collect::<Result<Vec<_>, BridgeError>>()?;
        let refs: Vec<&Bitmap> = bitmaps.iter().map(AsRef::as_ref).collect();

        let chunks = lock(&projector)
            .tokenize(&InputText::new(prompt), &refs)
            .map_err(|code| {
                error!(code, n_bitmaps = refs.len(), "tokenization failed");
                BridgeError::Tokenization { code }
            })?;

        let (n_chunks, n_tokens) = (chunks.len(), chunks.total_tokens());
        let handle = self.chunks.insert(Turn {
            chunks,
            state: TurnState::Tokenized,
        });
        info!(%handle, n_chunks, n_tokens, "prompt tokenized");
        Ok(handle)
    }

    /// Release a chunk sequence
    pub fn release_chunks(&self, chunks: Handle) -> bool {
        self.chunks.remove(chunks)
    }

    /// Number of chunks in a sequence, 0 for an unknown handle
    pub fn chunk_count(&self, chunks: Handle) -> u32 {
        self.chunks
            .get(chunks)
            .map(|turn| u32::try_from(lock(&turn).chunks.len()).unwrap_or(u32::MAX))
            .unwrap_or(0)
    }

    /// Lifecycle state of a chunk sequence
    pub fn chunk_state(&self, chunks: Handle) -> Option<TurnState> {
        self.chunks.get(chunks).ok().map(|turn| lock(&turn).state)
    }

    /// Create an empty batch of `capacity` entries.
    ///
    /// # Errors
    /// [`BridgeError::InvalidArgument`] for a zero capacity.
    pub fn new_batch(&self, capacity: usize) -> Result<Handle, BridgeError> {
        if capacity == 0 {
            return Err(BridgeError::InvalidArgument("batch capacity must be positive"));
        }
        let handle = self.batches.insert(Batch::new(capacity));
        info!(%handle, capacity, "batch created");
        Ok(handle)
    }

    /// Release a batch
    pub fn release_batch(&self, batch: Handle) -> bool {
        self.batches.remove(batch)
    }

    /// Number of staged entries in a batch.
    ///
    /// # Errors
    /// [`BridgeError::InvalidHandle`] for an unknown batch.
    pub fn batch_len(&self, batch: Handle) -> Result<usize, BridgeError> {
        let batch = self.batches.get(batch)?;
        let len = lock(&batch).len();
        Ok(len)
    }

    /// Append chunk `index` to `batch` at `position_offset`; see
    /// [`batch::add_chunk`]. Returns the number of entries added.
    ///
    /// # Errors
    /// [`BridgeError::InvalidHandle`], [`BridgeError::Index`],
    /// [`BridgeError::InvalidArgument`] for an unusable offset, or
    /// [`BridgeError::BatchFull`].
    pub fn add_chunk_to_batch(
        &self,
        batch: Handle,
        chunks: Handle,
        index: usize,
        position_offset: LlamaPos,
    ) -> Result<usize, BridgeError> {
        let batch = self.batches.get(batch)?;
        let turn = self.chunks.get(chunks)?;
        let mut batch = lock(&batch);
        let turn = lock(&turn);

        batch::add_chunk(&mut batch, &turn.chunks, index, position_offset)
            .inspect_err(|e| error!(index, error = %e, "failed to add chunk to batch"))
    }

    /// Submit a manually assembled batch to `context`, clearing it on
    /// success.
    ///
    /// # Errors
    /// [`BridgeError::Eval`] with [`EVAL_UNFILLED_PLACEHOLDERS`] when image
    /// slots were never filled, or with the engine code when decoding fails.
    pub fn decode_batch(&self, context: Handle, batch: Handle) -> Result<(), BridgeError> {
        let context = self.contexts.get(context)?;
        let batch = self.batches.get(batch)?;
        let mut context = lock(&context);
        let mut batch = lock(&batch);

        if batch.is_empty() {
            return Err(BridgeError::InvalidArgument("batch is empty"));
        }
        let placeholders = batch.placeholder_count();
        if placeholders > 0 {
            error!(placeholders, "batch holds image placeholders without embeddings");
            return Err(BridgeError::Eval {
                code: EVAL_UNFILLED_PLACEHOLDERS,
            });
        }

        context.decode(DecodeInput::Tokens(&batch)).map_err(|code| {
            error!(code, n_tokens = batch.len(), "batch decode failed");
            BridgeError::Eval { code }
        })?;
        batch.clear();
        Ok(())
    }

    /// Evaluate every chunk of `chunks` into `context` starting at
    /// `base_position`, in pieces of at most `batch_capacity` entries, and
    /// return the position the next turn must start from.
    ///
    /// # Errors
    /// [`BridgeError::InvalidArgument`] for a negative position or zero
    /// capacity, [`BridgeError::InvalidState`] when the sequence was already
    /// evaluated or failed, and [`BridgeError::Eval`] when the engine fails;
    /// after that the sequence is `Failed` and must be discarded.
    pub fn eval_chunks(
        &self,
        projector: Handle,
        context: Handle,
        chunks: Handle,
        base_position: LlamaPos,
        batch_capacity: usize,
    ) -> Result<LlamaPos, BridgeError> {
        if base_position < 0 {
            return Err(BridgeError::InvalidArgument("position must not be negative"));
        }
        if batch_capacity == 0 {
            return Err(BridgeError::InvalidArgument("batch capacity must be positive"));
        }

        let projector = self.projectors.get(projector)?;
        let context = self.contexts.get(context)?;
        let turn = self.chunks.get(chunks)?;
        let mut projector = lock(&projector);
        let mut context = lock(&context);
        let mut turn = lock(&turn);

        if turn.state != TurnState::Tokenized {
            return Err(BridgeError::InvalidState {
                state: turn.state.as_str(),
            });
        }

        let result = ChunkEvaluator::new(batch_capacity).eval(
            &mut *projector,
            &mut *context,
            &turn.chunks,
            base_position,
        );
        match result {
            Ok(new_position) => {
                turn.state = TurnState::Evaluated;
                info!(%chunks, base_position, new_position, "turn evaluated");
                Ok(new_position)
            }
            Err(e) => {
                turn.state = TurnState::Failed;
                error!(%chunks, code = ?e.code(), error = %e, "turn evaluation failed");
                Err(e)
            }
        }
    }
}

impl<E: Engine> fmt::Debug for Bridge<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("params", &self.params)
            .field("models", &self.models)
            .field("contexts", &self.contexts)
            .field("projectors", &self.projectors)
            .field("bitmaps", &self.bitmaps)
            .field("chunks", &self.chunks)
            .field("batches", &self.batches)
            .finish_non_exhaustive()
    }
}
