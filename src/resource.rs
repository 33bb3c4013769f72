use crate::time::Instant;
use std::{borrow::Cow, future::Future, time::Duration};

#[derive(Debug, Clone, thiserror::Error)]
pub enum PoolError<E: Clone> {
    #[error("pool is shut down")]
    Shutdown,
    #[error("timed out waiting for a resource")]
    Timeout,
    #[error("too many waiting acquires")]
    QueueFull,
    #[error("allocation failed: {0}")]
    Allocation(E),
    #[error("reset failed: {0}")]
    Reset(E),
    #[error("{0}")]
    Other(Cow<'static, str>),
}

pub type PoolResult<T, E> = Result<T, PoolError<E>>;

/// The set of callbacks the pool drives to manage one kind of resource.
///
/// The pool never inspects [`ResourceManager::Resource`]; it only moves it
/// between the idle store and borrowers, and hands it to the callbacks
/// below at the right points of the lifecycle.
pub trait ResourceManager: Send + Sync + 'static {
    /// The type of resource managed by this pool.
    type Resource: Send + 'static;
    /// The type of error produced by the callbacks. The error must be
    /// `Clone`able as it may be returned through multiple channels.
    type Error: Into<Box<dyn std::error::Error + Send + Sync>>
        + Clone
        + std::fmt::Debug
        + Send
        + 'static;

    /// Allocate one new resource. Must not block the caller; yields one
    /// value or fails. The pool performs no retries of its own.
    fn allocate(&self)
        -> impl Future<Output = Result<Self::Resource, Self::Error>> + Send + 'static;

    /// Reset a resource before it is recycled into the idle store. An error
    /// here routes the resource to [`ResourceManager::destroy`] and surfaces
    /// to the releasing caller.
    fn reset<'a>(
        &'a self,
        resource: &'a mut Self::Resource,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

    /// Tear a resource down. Errors are logged and swallowed; destruction
    /// is considered irreversible regardless of the outcome.
    fn destroy(&self, resource: Self::Resource)
        -> impl Future<Output = Result<(), Self::Error>> + Send + 'static;

    /// Decide whether a resource is unfit for further use. Evaluated
    /// synchronously on release (before recycling) and again when an idle
    /// resource is about to be handed to a borrower.
    fn should_evict(&self, resource: &Self::Resource, meta: &PooledMeta) -> bool {
        let _ = (resource, meta);
        false
    }
}

/// Per-resource bookkeeping carried alongside the resource itself for as
/// long as it lives in the pool.
#[derive(Debug, Clone, Copy)]
pub struct PooledMeta {
    pub(crate) allocated_at: Instant,
    pub(crate) released_at: Instant,
    pub(crate) acquired_at: Instant,
    pub(crate) acquire_count: u64,
}

impl PooledMeta {
    pub(crate) fn new() -> Self {
        let now = Instant::now();
        Self {
            allocated_at: now,
            released_at: now,
            acquired_at: now,
            acquire_count: 0,
        }
    }

    /// When the underlying resource was allocated.
    #[inline(always)]
    pub fn allocated_at(&self) -> Instant {
        self.allocated_at
    }

    /// How long the resource has been sitting idle since its last release.
    /// Only meaningful while the resource is in the idle store.
    #[inline(always)]
    pub fn idle_since(&self) -> Duration {
        self.released_at.elapsed()
    }

    /// How many times the resource has been handed to a borrower.
    #[inline(always)]
    pub fn acquire_count(&self) -> u64 {
        self.acquire_count
    }
}

/// One live resource plus its metadata. Slots move between the idle store
/// and pool handles; the slot owns the resource exclusively wherever it is.
pub(crate) struct Slot<M: ResourceManager> {
    pub(crate) resource: M::Resource,
    pub(crate) meta: PooledMeta,
}

impl<M: ResourceManager> Slot<M> {
    pub(crate) fn new(resource: M::Resource) -> Self {
        Self {
            resource,
            meta: PooledMeta::new(),
        }
    }
}

impl<M: ResourceManager> std::fmt::Debug for Slot<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "Slot(acquires={}, idle={:?})",
            self.meta.acquire_count,
            self.meta.idle_since()
        ))
    }
}

/// Opt-in executor for resource delivery. When configured, a matched
/// resource is handed to its borrower from a task scheduled here rather
/// than inline on whichever thread ran the matching round.
pub trait AcquireExecutor: Send + Sync + 'static {
    fn execute(&self, task: Box<dyn FnOnce() + Send + 'static>);
}
