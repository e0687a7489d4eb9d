//! Shared execution context, reference-counted across connections.
//!
//! One connection's device loss must not tear down another connection's
//! live resources: each translator holds a strong reference to the current
//! [`SharedContext`], and the registry recreates the context lazily when
//! the previous one was invalidated. The registry itself holds only a weak
//! reference, so dropping the last connection releases the context.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// An opaque execution context generation. Executors are rebound to a new
/// generation after device loss.
#[derive(Debug)]
pub struct SharedContext {
    generation: u64,
}

impl SharedContext {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Process-wide registry with lazy creation and explicit invalidation.
#[derive(Debug, Default)]
pub struct ContextRegistry {
    slot: Mutex<Weak<SharedContext>>,
    generation: AtomicU64,
}

impl ContextRegistry {
    pub fn new() -> ContextRegistry {
        ContextRegistry::default()
    }

    /// Current context, creating a new generation if none is live.
    pub fn acquire(&self) -> Arc<SharedContext> {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(context) = slot.upgrade() {
            return context;
        }
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let context = Arc::new(SharedContext { generation });
        *slot = Arc::downgrade(&context);
        context
    }

    /// Invalidate the current context after device loss. Existing strong
    /// references stay valid (their resources are rehomed individually);
    /// the next [`acquire`](Self::acquire) creates a fresh generation.
    pub fn invalidate(&self) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Weak::new();
    }
}
