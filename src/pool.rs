use crate::{
    metrics::{MetricVariant, MetricsAccum, PoolMetrics},
    permits::AllocationStrategy,
    resource::{AcquireExecutor, PoolError, PoolResult, PooledMeta, ResourceManager, Slot},
    time::Instant,
    waitqueue::{BorrowerState, PendingBorrower, PendingOrdering, PendingStore},
};
use consume_on_drop::{Consume, ConsumeOnDrop};
use crossbeam_queue::SegQueue;
use futures::future::join_all;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::oneshot;
use tracing::{error, trace, warn};

#[derive(derive_more::Debug, smart_default::SmartDefault)]
pub struct PoolConfig {
    /// The discipline for picking which waiting borrower is served next.
    pub ordering: PendingOrdering,
    /// Cap on concurrently waiting acquires; `None` means unlimited.
    pub max_waiters: Option<usize>,
    /// Optional executor that resources are delivered on. Without one,
    /// delivery happens inline on whichever thread ran the matching round.
    #[debug(skip)]
    pub acquire_executor: Option<Arc<dyn AcquireExecutor>>,
}

impl PoolConfig {
    pub fn assert_valid(&self) {
        if let Some(max_waiters) = self.max_waiters {
            assert!(max_waiters > 0);
        }
    }
}

struct HandleInner<M: ResourceManager> {
    slot: Slot<M>,
    pool: Arc<Pool<M>>,
}

impl<M: ResourceManager> Consume for HandleInner<M> {
    fn consume(self) {
        let Self { slot, pool } = self;
        // A dropped handle still runs the full release pipeline; the
        // outcome has nowhere to surface.
        tokio::spawn(async move {
            let _ = pool.release_slot(slot).await;
        });
    }
}

/// An exclusively-owned live resource checked out of a [`Pool`].
///
/// Dropping the handle releases the resource back through the regular
/// release pipeline on a spawned task (and therefore requires a runtime);
/// use [`PoolHandle::release`] to observe reset failures, or
/// [`PoolHandle::invalidate`] to take the resource out of circulation.
pub struct PoolHandle<M: ResourceManager> {
    inner: ConsumeOnDrop<HandleInner<M>>,
}

impl<M: ResourceManager> PoolHandle<M> {
    pub(crate) fn new(slot: Slot<M>, pool: Arc<Pool<M>>) -> Self {
        Self {
            inner: ConsumeOnDrop::new(HandleInner { slot, pool }),
        }
    }

    pub(crate) fn into_slot(self) -> Slot<M> {
        ConsumeOnDrop::into_inner(self.inner).slot
    }

    /// Return the resource to the pool: reset it, re-check eviction, then
    /// recycle or destroy. A reset failure destroys the resource and is
    /// returned here.
    pub async fn release(self) -> PoolResult<(), M::Error> {
        let HandleInner { slot, pool } = ConsumeOnDrop::into_inner(self.inner);
        pool.release_slot(slot).await
    }

    /// Take the resource out of circulation immediately. The destroy
    /// handler's outcome is not surfaced.
    pub async fn invalidate(self) {
        let HandleInner { slot, pool } = ConsumeOnDrop::into_inner(self.inner);
        pool.invalidate_slot(slot).await
    }

    /// Bookkeeping for this resource: allocation time, idle time, number
    /// of acquisitions.
    #[inline(always)]
    pub fn meta(&self) -> &PooledMeta {
        &self.inner.slot.meta
    }

    /// How many times this resource has been handed out, this checkout
    /// included.
    #[inline(always)]
    pub fn acquire_count(&self) -> u64 {
        self.inner.slot.meta.acquire_count
    }
}

impl<M: ResourceManager> std::ops::Deref for PoolHandle<M> {
    type Target = M::Resource;
    fn deref(&self) -> &Self::Target {
        &self.inner.slot.resource
    }
}

impl<M: ResourceManager> std::ops::DerefMut for PoolHandle<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner.slot.resource
    }
}

impl<M: ResourceManager> std::fmt::Debug for PoolHandle<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("PoolHandle({:?})", self.inner.slot))
    }
}

/// An asynchronous object pool.
///
/// Borrowers queue in a pending store; idle resources queue in an idle
/// store; a serialised, non-blocking matching core pairs them up and
/// triggers allocations when the permit strategy allows. The pool never
/// inspects the resources themselves; all lifecycle work is delegated to
/// the [`ResourceManager`].
pub struct Pool<M: ResourceManager> {
    pub(crate) manager: M,
    pub(crate) config: PoolConfig,
    pub(crate) strategy: Box<dyn AllocationStrategy>,
    pub(crate) idle: SegQueue<Slot<M>>,
    pub(crate) pending: PendingStore<M>,
    /// Shadow of `idle.len()`, maintained separately so the matching round
    /// reads a plain atomic instead of walking the queue.
    pub(crate) idle_count: AtomicUsize,
    pub(crate) pending_count: AtomicUsize,
    pub(crate) acquired_count: AtomicUsize,
    /// Work-in-progress counter serialising the matching core.
    pub(crate) wip: AtomicUsize,
    pub(crate) disposed: AtomicBool,
    pub(crate) metrics: MetricsAccum,
}

impl<M: ResourceManager> std::fmt::Debug for Pool<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "Pool(idle={}, acquired={}, pending={})",
            self.idle_size(),
            self.acquired_size(),
            self.pending_size()
        ))
    }
}

impl<M: ResourceManager> Pool<M> {
    pub fn new(config: PoolConfig, manager: M, strategy: impl AllocationStrategy) -> Arc<Self> {
        config.assert_valid();
        Arc::new(Self {
            pending: PendingStore::new(config.ordering),
            config,
            manager,
            strategy: Box::new(strategy),
            idle: SegQueue::new(),
            idle_count: AtomicUsize::new(0),
            pending_count: AtomicUsize::new(0),
            acquired_count: AtomicUsize::new(0),
            wip: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
            metrics: MetricsAccum::default(),
        })
    }

    /// The manager this pool was built with.
    pub fn manager(&self) -> &M {
        &self.manager
    }

    /// Acquire a resource, waiting as long as it takes. The returned
    /// [`PoolHandle`] owns the resource until it is released, invalidated
    /// or dropped.
    pub async fn acquire(self: &Arc<Self>) -> PoolResult<PoolHandle<M>, M::Error> {
        self.acquire_inner(None).await
    }

    /// Acquire a resource, failing with [`PoolError::Timeout`] if none
    /// arrives within `timeout`. A zero timeout waits indefinitely.
    pub async fn acquire_timeout(
        self: &Arc<Self>,
        timeout: Duration,
    ) -> PoolResult<PoolHandle<M>, M::Error> {
        let timeout = (!timeout.is_zero()).then_some(timeout);
        self.acquire_inner(timeout).await
    }

    async fn acquire_inner(
        self: &Arc<Self>,
        timeout: Option<Duration>,
    ) -> PoolResult<PoolHandle<M>, M::Error> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(PoolError::Shutdown);
        }
        if let Some(max_waiters) = self.config.max_waiters {
            if self.pending_count.load(Ordering::Acquire) >= max_waiters {
                return Err(PoolError::QueueFull);
            }
        }

        let (sink, mut receiver) = oneshot::channel();
        let borrower = PendingBorrower::new(sink);
        self.pending_count.fetch_add(1, Ordering::AcqRel);
        self.metrics.admit(MetricVariant::Waiting);
        self.pending.offer(&borrower);

        // Close the race with a concurrent shutdown: the disposal sweep may
        // or may not have seen our registration.
        if self.disposed.load(Ordering::Acquire)
            && self.settle_borrower(&borrower, BorrowerState::Cancelled)
        {
            return Err(PoolError::Shutdown);
        }

        self.drain();

        // If this future goes away while we wait, the borrower must not be
        // served later; the delivery side rechecks the state under CAS.
        let _cancel = scopeguard::guard(borrower.clone(), |borrower| {
            if self.settle_borrower(&borrower, BorrowerState::Cancelled) {
                trace!("acquire cancelled while waiting");
            }
        });

        match timeout {
            None => match (&mut receiver).await {
                Ok(outcome) => outcome,
                Err(_) => Err(PoolError::Other("acquire sink dropped".into())),
            },
            Some(timeout) => match tokio::time::timeout(timeout, &mut receiver).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => Err(PoolError::Other("acquire sink dropped".into())),
                Err(_elapsed) => {
                    if self.settle_borrower(&borrower, BorrowerState::Cancelled) {
                        trace!("acquire timed out");
                        Err(PoolError::Timeout)
                    } else {
                        // Delivery won the race at the deadline; prefer the
                        // resource if it is already in the channel.
                        match receiver.try_recv() {
                            Ok(outcome) => outcome,
                            Err(_) => Err(PoolError::Timeout),
                        }
                    }
                }
            },
        }
    }

    /// Pre-allocate up to the strategy's minimum, concurrently. Returns the
    /// number of resources actually created; partial failure is not fatal.
    pub async fn warmup(self: &Arc<Self>) -> usize {
        let minimum = self.strategy.min_permits();
        if minimum == 0 || self.disposed.load(Ordering::Acquire) {
            return 0;
        }
        let granted = self.strategy.try_get(minimum);
        trace!("warming up {granted} resources");
        let allocations = (0..granted).map(|_| {
            self.metrics.admit(MetricVariant::Allocating);
            let pool = self.clone();
            async move {
                let started = Instant::now();
                match pool.manager.allocate().await {
                    Ok(resource) => {
                        pool.metrics.transition(
                            MetricVariant::Allocating,
                            MetricVariant::Idle,
                            started.elapsed(),
                        );
                        pool.idle.push(Slot::new(resource));
                        pool.idle_count.fetch_add(1, Ordering::AcqRel);
                        pool.drain();
                        true
                    }
                    Err(error) => {
                        warn!("warmup allocation failed: {error:?}");
                        pool.metrics
                            .retire(MetricVariant::Allocating, started.elapsed());
                        pool.metrics.tally(MetricVariant::Failed);
                        pool.strategy.give_back(1);
                        false
                    }
                }
            }
        });
        join_all(allocations)
            .await
            .into_iter()
            .filter(|created| *created)
            .count()
    }

    /// Shut the pool down: fail everything still waiting, destroy
    /// everything idle. Resources currently acquired stay valid and are
    /// destroyed when they come back. Repeated calls wait for the same
    /// teardown.
    pub async fn shutdown(self: &Arc<Self>) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            trace!("pool shutting down");
        }
        // The actual teardown happens inside the serialised drain section,
        // which fails waiters inline and spawns a destroy task per idle
        // slot; all we do here is wait for those to run dry.
        self.drain();
        while self.idle_count.load(Ordering::Acquire) > 0
            || self.metrics.current(MetricVariant::Destroying) > 0
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Resources currently available for reuse.
    pub fn idle_size(&self) -> usize {
        self.idle_count.load(Ordering::Acquire)
    }

    /// Resources currently checked out.
    pub fn acquired_size(&self) -> usize {
        self.acquired_count.load(Ordering::Acquire)
    }

    /// Borrowers currently waiting.
    pub fn pending_size(&self) -> usize {
        self.pending_count.load(Ordering::Acquire)
    }

    /// Retrieve the current pool metrics snapshot.
    pub fn metrics(&self) -> PoolMetrics {
        self.metrics.summary()
    }

    /// The release pipeline: reset, re-check eviction, then recycle or
    /// destroy. The acquisition ends here exactly once, whichever path the
    /// resource takes.
    pub(crate) async fn release_slot(self: &Arc<Self>, mut slot: Slot<M>) -> PoolResult<(), M::Error> {
        self.acquired_count.fetch_sub(1, Ordering::AcqRel);
        let held_for = slot.meta.acquired_at.elapsed();
        if self.disposed.load(Ordering::Acquire) {
            // Releases after shutdown go straight down.
            self.metrics.transition(
                MetricVariant::Acquired,
                MetricVariant::Destroying,
                held_for,
            );
            self.destroy_slot(slot).await;
            return Ok(());
        }
        self.metrics
            .transition(MetricVariant::Acquired, MetricVariant::Resetting, held_for);
        let started = Instant::now();
        match self.manager.reset(&mut slot.resource).await {
            Ok(()) => {
                slot.meta.released_at = Instant::now();
                if self.disposed.load(Ordering::Acquire)
                    || self.manager.should_evict(&slot.resource, &slot.meta)
                {
                    trace!("evicting on release");
                    self.metrics.transition(
                        MetricVariant::Resetting,
                        MetricVariant::Destroying,
                        started.elapsed(),
                    );
                    self.destroy_slot(slot).await;
                } else {
                    self.metrics.transition(
                        MetricVariant::Resetting,
                        MetricVariant::Idle,
                        started.elapsed(),
                    );
                    self.idle.push(slot);
                    self.idle_count.fetch_add(1, Ordering::AcqRel);
                    self.drain();
                }
                Ok(())
            }
            Err(reset_error) => {
                warn!("reset failed, destroying the resource: {reset_error:?}");
                self.metrics.transition(
                    MetricVariant::Resetting,
                    MetricVariant::Destroying,
                    started.elapsed(),
                );
                self.destroy_slot(slot).await;
                Err(PoolError::Reset(reset_error))
            }
        }
    }

    pub(crate) async fn invalidate_slot(self: &Arc<Self>, slot: Slot<M>) {
        self.acquired_count.fetch_sub(1, Ordering::AcqRel);
        self.metrics.transition(
            MetricVariant::Acquired,
            MetricVariant::Destroying,
            slot.meta.acquired_at.elapsed(),
        );
        self.destroy_slot(slot).await;
    }

    /// The destroy pipeline. Callers must already have transitioned the
    /// slot's metrics into `Destroying`.
    pub(crate) async fn destroy_slot(self: &Arc<Self>, slot: Slot<M>) {
        let started = Instant::now();
        if let Err(destroy_error) = self.manager.destroy(slot.resource).await {
            error!("destroy handler failed (ignored): {destroy_error:?}");
            self.metrics.tally(MetricVariant::Failed);
        }
        self.metrics
            .retire(MetricVariant::Destroying, started.elapsed());
        self.metrics.tally(MetricVariant::Destroyed);
        self.strategy.give_back(1);
        self.drain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::BasicManager;
    use crate::{Bounded, Unbounded};
    use anyhow::Result;
    use itertools::Itertools;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use test_log::test;
    use tokio::task::JoinHandle;

    fn spawn_acquire(
        pool: &Arc<Pool<BasicManager>>,
    ) -> JoinHandle<PoolResult<PoolHandle<BasicManager>, String>> {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await })
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[test(tokio::test(flavor = "current_thread", start_paused = true))]
    async fn delivers_fifo_with_bounded_two() -> Result<()> {
        let pool = Pool::new(
            PoolConfig::default(),
            BasicManager::no_delay(),
            Bounded::new(2),
        );
        let first = pool.acquire().await?;
        let second = pool.acquire().await?;
        assert_eq!(*first, 0);
        assert_eq!(*second, 1);

        let third = spawn_acquire(&pool);
        settle().await;
        let fourth = spawn_acquire(&pool);
        settle().await;
        assert_eq!(pool.pending_size(), 2);

        first.release().await?;
        let third = third.await??;
        assert_eq!(*third, 0);

        second.invalidate().await;
        let fourth = fourth.await??;
        assert_eq!(*fourth, 2);

        assert_eq!(pool.acquired_size(), 2);
        assert_eq!(pool.idle_size(), 0);
        Ok(())
    }

    #[test(tokio::test(flavor = "current_thread", start_paused = true))]
    async fn acquire_times_out_while_waiting() -> Result<()> {
        let pool = Pool::new(
            PoolConfig::default(),
            BasicManager::no_delay(),
            Bounded::new(1),
        );
        let holder = pool.acquire().await?;
        let error = pool
            .acquire_timeout(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(error, PoolError::Timeout));

        holder.release().await?;
        assert_eq!(pool.idle_size(), 1);
        assert_eq!(pool.pending_size(), 0);
        Ok(())
    }

    #[test(tokio::test(flavor = "current_thread", start_paused = true))]
    async fn zero_timeout_waits_indefinitely() -> Result<()> {
        let pool = Pool::new(
            PoolConfig::default(),
            BasicManager::no_delay(),
            Bounded::new(1),
        );
        let holder = pool.acquire().await?;
        let waiter = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire_timeout(Duration::ZERO).await }
        });
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!waiter.is_finished());

        holder.release().await?;
        let handle = waiter.await??;
        assert_eq!(*handle, 0);
        Ok(())
    }

    #[test(tokio::test(flavor = "current_thread", start_paused = true))]
    async fn stale_idle_resource_is_evicted_on_acquire() -> Result<()> {
        let pool = Pool::new(
            PoolConfig::default(),
            BasicManager::no_delay(),
            Bounded::new(1),
        );
        pool.manager.set_idle_ttl(Duration::from_millis(100));

        let handle = pool.acquire().await?;
        let stale = *handle;
        handle.release().await?;
        assert_eq!(pool.idle_size(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        let fresh = pool.acquire().await?;
        assert_ne!(*fresh, stale);
        assert_eq!(pool.manager.destroyed(), vec![stale]);
        Ok(())
    }

    #[test(tokio::test(flavor = "current_thread", start_paused = true))]
    async fn shutdown_fails_waiters_and_destroys_on_release() -> Result<()> {
        let pool = Pool::new(
            PoolConfig::default(),
            BasicManager::no_delay(),
            Bounded::new(1),
        );
        let holder = pool.acquire().await?;
        let second = spawn_acquire(&pool);
        settle().await;
        let third = spawn_acquire(&pool);
        settle().await;

        pool.shutdown().await;
        assert!(matches!(second.await?, Err(PoolError::Shutdown)));
        assert!(matches!(third.await?, Err(PoolError::Shutdown)));

        holder.release().await?;
        assert_eq!(pool.manager.destroy_count(), 1);
        assert_eq!(pool.idle_size(), 0);
        assert_eq!(pool.acquired_size(), 0);
        Ok(())
    }

    #[test(tokio::test(flavor = "current_thread", start_paused = true))]
    async fn reset_failure_surfaces_and_reallocates() -> Result<()> {
        let pool = Pool::new(
            PoolConfig::default(),
            BasicManager::no_delay(),
            Bounded::new(1),
        );
        let holder = pool.acquire().await?;
        let broken = *holder;
        let waiter = spawn_acquire(&pool);
        settle().await;

        pool.manager.fail_next_reset();
        let error = holder.release().await.unwrap_err();
        assert!(matches!(error, PoolError::Reset(_)));

        let handle = waiter.await??;
        assert_ne!(*handle, broken);
        assert_eq!(pool.manager.destroyed(), vec![broken]);
        assert_eq!(pool.acquired_size(), 1);
        Ok(())
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn concurrent_release_storm_quiesces() -> Result<()> {
        let pool = Pool::new(
            PoolConfig::default(),
            BasicManager::no_delay(),
            Bounded::new(64),
        );
        let mut handles = vec![];
        for _ in 0..64 {
            handles.push(pool.acquire().await?);
        }
        let releases = handles
            .into_iter()
            .map(|handle| tokio::spawn(async move { handle.release().await }))
            .collect_vec();
        for release in releases {
            release.await??;
        }
        assert_eq!(pool.idle_size(), 64);
        assert_eq!(pool.acquired_size(), 0);
        assert_eq!(pool.pending_size(), 0);
        assert_eq!(pool.wip.load(Ordering::Acquire), 0);
        Ok(())
    }

    #[test(tokio::test(flavor = "current_thread", start_paused = true))]
    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(5)]
    async fn bounded_caps_concurrent_acquires(#[case] max: usize) -> Result<()> {
        let pool = Pool::new(
            PoolConfig::default(),
            BasicManager::with_allocate_delay(Duration::from_millis(10)),
            Bounded::new(max),
        );
        let mut waiters = vec![];
        for _ in 0..max + 1 {
            waiters.push(spawn_acquire(&pool));
            settle().await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.acquired_size(), max);
        assert_eq!(pool.pending_size(), 1);

        let straggler = waiters.pop().unwrap();
        let mut handles = vec![];
        for waiter in waiters {
            handles.push(waiter.await??);
        }
        handles.remove(0).release().await?;
        let handle = straggler.await??;
        assert_eq!(*handle, 0);
        assert_eq!(pool.acquired_size(), max);
        Ok(())
    }

    #[test(tokio::test(flavor = "current_thread", start_paused = true))]
    async fn always_evicting_churns() -> Result<()> {
        let pool = Pool::new(
            PoolConfig::default(),
            BasicManager::no_delay(),
            Bounded::new(2),
        );
        pool.manager.evict_everything();

        let handle = pool.acquire().await?;
        let first = *handle;
        handle.release().await?;
        assert_eq!(pool.idle_size(), 0);
        assert_eq!(pool.manager.destroyed(), vec![first]);

        let handle = pool.acquire().await?;
        assert_ne!(*handle, first);
        handle.release().await?;
        assert_eq!(pool.manager.destroy_count(), 2);
        Ok(())
    }

    #[test(tokio::test(flavor = "current_thread", start_paused = true))]
    async fn release_restores_the_observable_state() -> Result<()> {
        let pool = Pool::new(
            PoolConfig::default(),
            BasicManager::no_delay(),
            Bounded::new(3),
        );
        pool.acquire().await?.release().await?;
        let before = (pool.idle_size(), pool.acquired_size(), pool.strategy.estimate());

        let handle = pool.acquire().await?;
        handle.release().await?;
        let after = (pool.idle_size(), pool.acquired_size(), pool.strategy.estimate());
        assert_eq!(before, after);
        assert_eq!(pool.metrics().entered[MetricVariant::Destroyed], 0);
        Ok(())
    }

    #[test(tokio::test(flavor = "current_thread", start_paused = true))]
    async fn warmup_fills_to_minimum_and_shutdown_destroys() -> Result<()> {
        let pool = Pool::new(
            PoolConfig::default(),
            BasicManager::no_delay(),
            Bounded::new(5).with_min(3),
        );
        assert_eq!(pool.warmup().await, 3);
        assert_eq!(pool.idle_size(), 3);

        pool.shutdown().await;
        assert_eq!(pool.manager.destroy_count(), 3);
        assert_eq!(pool.idle_size(), 0);
        Ok(())
    }

    #[test(tokio::test(flavor = "current_thread", start_paused = true))]
    async fn warmup_tolerates_partial_failure() -> Result<()> {
        let pool = Pool::new(
            PoolConfig::default(),
            BasicManager::no_delay(),
            Bounded::new(5).with_min(2),
        );
        pool.manager.fail_next_allocate();
        assert_eq!(pool.warmup().await, 1);
        assert_eq!(pool.idle_size(), 1);
        Ok(())
    }

    #[test(tokio::test(flavor = "current_thread", start_paused = true))]
    async fn lifo_serves_newest_waiter_first() -> Result<()> {
        let config = PoolConfig {
            ordering: PendingOrdering::Lifo,
            ..Default::default()
        };
        let pool = Pool::new(config, BasicManager::no_delay(), Bounded::new(1));
        let holder = pool.acquire().await?;
        let oldest = spawn_acquire(&pool);
        settle().await;
        let middle = spawn_acquire(&pool);
        settle().await;
        let newest = spawn_acquire(&pool);
        settle().await;

        holder.release().await?;
        newest.await??.release().await?;
        middle.await??.release().await?;
        oldest.await??.release().await?;
        Ok(())
    }

    #[test(tokio::test(flavor = "current_thread", start_paused = true))]
    async fn affinity_store_serves_same_thread_fifo() -> Result<()> {
        let config = PoolConfig {
            ordering: PendingOrdering::Affinity,
            ..Default::default()
        };
        let pool = Pool::new(config, BasicManager::no_delay(), Bounded::new(1));
        let holder = pool.acquire().await?;
        let first = spawn_acquire(&pool);
        settle().await;
        let second = spawn_acquire(&pool);
        settle().await;

        holder.release().await?;
        first.await??.release().await?;
        second.await??.release().await?;
        Ok(())
    }

    #[test(tokio::test(flavor = "current_thread", start_paused = true))]
    async fn max_waiters_rejects_excess_registrations() -> Result<()> {
        let config = PoolConfig {
            max_waiters: Some(1),
            ..Default::default()
        };
        let pool = Pool::new(config, BasicManager::no_delay(), Bounded::new(1));
        let holder = pool.acquire().await?;
        let waiter = spawn_acquire(&pool);
        settle().await;

        let error = pool.acquire().await.unwrap_err();
        assert!(matches!(error, PoolError::QueueFull));

        holder.release().await?;
        waiter.await??.release().await?;
        Ok(())
    }

    #[test(tokio::test(flavor = "current_thread", start_paused = true))]
    async fn shutdown_is_idempotent_and_fails_new_acquires() -> Result<()> {
        let pool = Pool::new(
            PoolConfig::default(),
            BasicManager::no_delay(),
            Bounded::new(1),
        );
        pool.shutdown().await;
        pool.shutdown().await;
        let error = pool.acquire().await.unwrap_err();
        assert!(matches!(error, PoolError::Shutdown));
        Ok(())
    }

    #[test(tokio::test(flavor = "current_thread", start_paused = true))]
    async fn cancelled_waiter_does_not_leak_the_resource() -> Result<()> {
        let pool = Pool::new(
            PoolConfig::default(),
            BasicManager::no_delay(),
            Bounded::new(1),
        );
        let holder = pool.acquire().await?;
        let waiter = spawn_acquire(&pool);
        settle().await;
        assert_eq!(pool.pending_size(), 1);

        waiter.abort();
        settle().await;
        assert_eq!(pool.pending_size(), 0);

        holder.release().await?;
        assert_eq!(pool.idle_size(), 1);
        assert_eq!(pool.acquired_size(), 0);
        Ok(())
    }

    #[test(tokio::test(flavor = "current_thread", start_paused = true))]
    async fn allocation_failure_surfaces_and_returns_the_permit() -> Result<()> {
        let pool = Pool::new(
            PoolConfig::default(),
            BasicManager::no_delay(),
            Bounded::new(1),
        );
        pool.manager.fail_next_allocate();
        let error = pool.acquire().await.unwrap_err();
        assert!(matches!(error, PoolError::Allocation(_)));
        assert_eq!(pool.acquired_size(), 0);

        let handle = pool.acquire().await?;
        assert_eq!(*handle, 1);
        Ok(())
    }

    #[test(tokio::test(flavor = "current_thread", start_paused = true))]
    async fn destroy_failure_is_swallowed() -> Result<()> {
        let pool = Pool::new(
            PoolConfig::default(),
            BasicManager::no_delay(),
            Bounded::new(1),
        );
        let handle = pool.acquire().await?;
        pool.manager.fail_next_destroy();
        handle.invalidate().await;
        assert_eq!(pool.manager.destroy_count(), 1);

        let handle = pool.acquire().await?;
        assert_eq!(*handle, 1);
        Ok(())
    }

    #[test(tokio::test(flavor = "current_thread", start_paused = true))]
    async fn dropping_a_handle_releases_it() -> Result<()> {
        let pool = Pool::new(
            PoolConfig::default(),
            BasicManager::no_delay(),
            Bounded::new(1),
        );
        let handle = pool.acquire().await?;
        drop(handle);
        settle().await;
        assert_eq!(pool.idle_size(), 1);
        assert_eq!(pool.acquired_size(), 0);
        Ok(())
    }

    #[test(tokio::test(flavor = "current_thread", start_paused = true))]
    async fn configured_executor_performs_delivery() -> Result<()> {
        #[derive(Default)]
        struct CountingExecutor {
            deliveries: AtomicUsize,
        }
        impl AcquireExecutor for CountingExecutor {
            fn execute(&self, task: Box<dyn FnOnce() + Send + 'static>) {
                self.deliveries.fetch_add(1, Ordering::SeqCst);
                task();
            }
        }

        let executor = Arc::new(CountingExecutor::default());
        let executor_dyn: Arc<dyn AcquireExecutor> = executor.clone();
        let config = PoolConfig {
            acquire_executor: Some(executor_dyn),
            ..Default::default()
        };
        let pool = Pool::new(config, BasicManager::no_delay(), Unbounded);
        let handle = pool.acquire().await?;
        assert_eq!(executor.deliveries.load(Ordering::SeqCst), 1);
        handle.release().await?;
        Ok(())
    }

    #[test(tokio::test(flavor = "current_thread", start_paused = true))]
    async fn metrics_track_the_lifecycle() -> Result<()> {
        let pool = Pool::new(
            PoolConfig::default(),
            BasicManager::no_delay(),
            Bounded::new(2),
        );
        let handle = pool.acquire().await?;
        assert_eq!(pool.metrics().current[MetricVariant::Acquired], 1);

        handle.release().await?;
        let metrics = pool.metrics();
        assert_eq!(metrics.current[MetricVariant::Acquired], 0);
        assert_eq!(metrics.current[MetricVariant::Idle], 1);
        assert_eq!(metrics.entered[MetricVariant::Acquired], 1);
        assert_eq!(metrics.live, 1);
        Ok(())
    }

    #[test(tokio::test(flavor = "current_thread", start_paused = true))]
    async fn sequential_churn_keeps_the_accounts() -> Result<()> {
        let pool = Pool::new(
            PoolConfig::default(),
            BasicManager::no_delay(),
            Bounded::new(4),
        );
        for round in 0..32 {
            let first = pool.acquire().await?;
            let second = pool.acquire().await?;
            if round % 3 == 0 {
                second.invalidate().await;
            } else {
                second.release().await?;
            }
            first.release().await?;
        }
        assert_eq!(pool.acquired_size(), 0);
        assert_eq!(pool.idle_size() + pool.strategy.estimate(), 4);

        pool.shutdown().await;
        assert_eq!(pool.idle_size(), 0);
        assert_eq!(pool.acquired_size(), 0);
        Ok(())
    }
}
