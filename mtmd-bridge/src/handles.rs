//! Opaque integer handles over owned resources.
//!
//! Every resource crossing the host boundary lives in a [`HandleTable`] and
//! is named by a [`Handle`]. Ids come from one process-wide counter and are
//! never reused, so a released handle, or a handle of another kind, is
//! reported as [`BridgeError::InvalidHandle`] instead of being reinterpreted.

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::error::BridgeError;

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Opaque, process-unique id of a bridge resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(NonZeroU64);

impl Handle {
    fn next() -> Self {
        let id = NEXT_HANDLE.fetch_add(1, Ordering::Relaxed);
        // the counter starts at 1 and would need 2^64 allocations to wrap
        Self(NonZeroU64::new(id).unwrap_or(NonZeroU64::MIN))
    }

    /// Handle from a host integer; 0 and negative values are "no handle"
    #[must_use]
    pub fn from_raw(raw: i64) -> Option<Self> {
        u64::try_from(raw).ok().and_then(NonZeroU64::new).map(Self)
    }

    /// Host integer for this handle
    #[must_use]
    pub fn into_raw(self) -> i64 {
        i64::try_from(self.0.get()).unwrap_or(i64::MAX)
    }

    /// The id as an unsigned integer
    #[must_use]
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Shared, individually locked resource.
pub type Shared<T> = Arc<Mutex<T>>;

/// Lock a resource, recovering the data if a previous holder panicked.
pub fn lock<T>(shared: &Mutex<T>) -> MutexGuard<'_, T> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mapping from handle to owned resource of one kind.
///
/// Lookups hand out an `Arc`, so releasing a handle while another call is
/// using the resource defers the drop until that call finishes.
pub struct HandleTable<T> {
    kind: &'static str,
    entries: Mutex<HashMap<Handle, Shared<T>>>,
}

impl<T> HandleTable<T> {
    /// Empty table for resources of `kind` (used in errors and logs)
    #[must_use]
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Take ownership of `value` and return its new handle
    pub fn insert(&self, value: T) -> Handle {
        let handle = Handle::next();
        lock(&self.entries).insert(handle, Arc::new(Mutex::new(value)));
        debug!(kind = self.kind, %handle, "handle created");
        handle
    }

    /// Resource behind `handle`
    ///
    /// # Errors
    /// [`BridgeError::InvalidHandle`] when the handle is unknown here.
    pub fn get(&self, handle: Handle) -> Result<Shared<T>, BridgeError> {
        lock(&self.entries)
            .get(&handle)
            .cloned()
            .ok_or(BridgeError::InvalidHandle {
                kind: self.kind,
                handle: handle.get(),
            })
    }

    /// Erase `handle`. Returns `false`, and does nothing else, when it was
    /// already released or never existed.
    pub fn remove(&self, handle: Handle) -> bool {
        // drop the resource outside the table lock
        let removed = lock(&self.entries).remove(&handle);
        match removed {
            Some(_) => {
                debug!(kind = self.kind, %handle, "handle released");
                true
            }
            None => {
                warn!(kind = self.kind, %handle, "release of unknown handle ignored");
                false
            }
        }
    }

    /// Whether `handle` is live in this table
    pub fn contains(&self, handle: Handle) -> bool {
        lock(&self.entries).contains_key(&handle)
    }

    /// Number of live handles
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    /// Whether no handle is live
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Kind name of this table
    pub fn kind(&self) -> &'static str {
        self.kind
    }
}

impl<T> fmt::Debug for HandleTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleTable")
            .field("kind", &self.kind)
            .field("len", &self.len())
            .finish()
    }
}
