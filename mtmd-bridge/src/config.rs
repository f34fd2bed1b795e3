//! Projector configuration and its resolution into engine parameters.
//!
//! All load-time tuning happens in [`ProjectorParams::resolve`], which is
//! pure so it can be tested without an engine.

use std::num::NonZeroUsize;

/// Upper bound on projector threads; the vision encoder stops scaling
/// beyond this on mobile SoCs.
pub const MAX_PROJECTOR_THREADS: i32 = 4;

/// Default media marker recognised inside prompt text.
pub const DEFAULT_MEDIA_MARKER: &str = "<__media__>";

/// Log level handed to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Verbosity {
    /// Silence the engine
    None,
    /// Everything, including debug output
    Debug,
    /// Informational and above
    Info,
    /// Warnings and errors
    Warn,
    /// Errors only
    #[default]
    Error,
}

impl Verbosity {
    /// Numeric ggml log level for this verbosity.
    #[must_use]
    pub const fn ggml_level(self) -> i32 {
        match self {
            Self::None => 0,
            Self::Debug => 1,
            Self::Info => 2,
            Self::Warn => 3,
            Self::Error => 4,
        }
    }
}

/// Parameters for loading a projector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectorParams {
    /// Enable the accelerator backend; the engine falls back to CPU when no
    /// device is available
    pub use_gpu: bool,
    /// Explicit thread count; `None` resolves from the available cores
    pub n_threads: Option<i32>,
    /// Engine log level
    pub verbosity: Verbosity,
    /// Whether the engine prints encode timings
    pub print_timings: bool,
    /// Media marker in text (defaults to `<__media__>`)
    pub media_marker: Option<String>,
}

impl Default for ProjectorParams {
    fn default() -> Self {
        Self {
            use_gpu: true,
            n_threads: None,
            verbosity: Verbosity::Error,
            print_timings: false,
            media_marker: None,
        }
    }
}

impl ProjectorParams {
    /// Set whether to use the accelerator backend
    #[must_use]
    pub fn with_use_gpu(mut self, use_gpu: bool) -> Self {
        self.use_gpu = use_gpu;
        self
    }

    /// Pin the thread count instead of deriving it from the core count
    #[must_use]
    pub fn with_n_threads(mut self, n_threads: i32) -> Self {
        self.n_threads = Some(n_threads);
        self
    }

    /// Set the engine log level
    #[must_use]
    pub fn with_verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// Set whether the engine prints timings
    #[must_use]
    pub fn with_print_timings(mut self, print_timings: bool) -> Self {
        self.print_timings = print_timings;
        self
    }

    /// Set the media marker
    #[must_use]
    pub fn with_media_marker(mut self, marker: impl Into<String>) -> Self {
        self.media_marker = Some(marker.into());
        self
    }

    /// Resolve into the concrete values passed to the engine.
    ///
    /// An explicit thread count is clamped to at least 1; otherwise it comes
    /// from [`resolve_thread_count`].
    #[must_use]
    pub fn resolve(&self, available_cores: usize) -> ResolvedParams {
        let n_threads = match self.n_threads {
            Some(n) => n.max(1),
            None => resolve_thread_count(available_cores),
        };

        ResolvedParams {
            use_gpu: self.use_gpu,
            n_threads,
            verbosity: self.verbosity,
            print_timings: self.print_timings,
            media_marker: self
                .media_marker
                .clone()
                .unwrap_or_else(|| DEFAULT_MEDIA_MARKER.to_string()),
        }
    }
}

/// Fully resolved projector parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedParams {
    /// Enable the accelerator backend
    pub use_gpu: bool,
    /// Projector thread count, always >= 1
    pub n_threads: i32,
    /// Engine log level
    pub verbosity: Verbosity,
    /// Whether the engine prints timings
    pub print_timings: bool,
    /// Media marker recognised in prompts
    pub media_marker: String,
}

/// Thread count for the projector: one core is left to the host UI thread,
/// and the result is clamped to `1..=MAX_PROJECTOR_THREADS`.
///
/// `min(MAX_PROJECTOR_THREADS, max(1, cores - 1))`
#[must_use]
pub fn resolve_thread_count(available_cores: usize) -> i32 {
    let spare = i32::try_from(available_cores.saturating_sub(1)).unwrap_or(i32::MAX);
    spare.clamp(1, MAX_PROJECTOR_THREADS)
}

/// Number of cores the process may use, 1 if it cannot be determined.
#[must_use]
pub fn available_cores() -> usize {
    std::thread::available_parallelism().map_or(1, NonZeroUsize::get)
}
