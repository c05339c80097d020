//! Task spawning abstraction.
//!
//! The Babbler dispatch loop hands each inbound request to its own task so a
//! slow content provider never stalls the loop. [`TaskSpawner`] keeps that
//! code independent of how the host runs its tasks.

use std::future::Future;

/// Abstraction for spawning background tasks.
///
/// Spawned tasks are fire-and-forget: the spawner offers no way to cancel or
/// join them, and they keep running when the spawner is dropped.
///
/// # Example
///
/// ```ignore
/// let session = BabblerSession::new(media, babbler, source, options);
/// let dispatch = session.spawn_dispatch(TokioSpawner::current());
/// ```
pub trait TaskSpawner: Send + Sync {
    /// Spawns a future as a background task.
    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static;
}

/// Tokio-based spawner.
#[derive(Clone)]
pub struct TokioSpawner {
    handle: tokio::runtime::Handle,
}

impl TokioSpawner {
    /// Creates a new `TokioSpawner` with the given runtime handle.
    #[must_use]
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Creates a new `TokioSpawner` using the current runtime's handle.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime context.
    #[must_use]
    pub fn current() -> Self {
        Self {
            handle: tokio::runtime::Handle::current(),
        }
    }
}

impl TaskSpawner for TokioSpawner {
    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(future);
    }
}
