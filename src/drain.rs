//! The serialised matching core: binds idle resources to pending borrowers,
//! triggers allocations, and enforces eviction on the acquire path.
//!
//! Any call site that produces work (a borrower registering, a resource
//! coming back, a destroy completing) calls [`Pool::drain`]. Whoever bumps
//! the work-in-progress counter from zero owns the matching loop; everyone
//! else leaves their increment behind and returns immediately. The owner
//! re-reads the shared state on every round, so concurrent producers' work
//! is always covered without a lock and without blocking.

use crate::{
    metrics::MetricVariant,
    pool::{Pool, PoolHandle},
    resource::{PoolError, ResourceManager, Slot},
    time::Instant,
    waitqueue::{BorrowerState, PendingBorrower},
};
use std::sync::{atomic::Ordering, Arc};
use tracing::{trace, warn};

impl<M: ResourceManager> Pool<M> {
    /// Enter the serialised matching section.
    pub(crate) fn drain(self: &Arc<Self>) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        loop {
            self.drain_once();
            if self.wip.fetch_sub(1, Ordering::AcqRel) == 1 {
                break;
            }
        }
    }

    /// One matching round: keep pairing resources and borrowers until no
    /// further progress can be made from the state visible right now.
    fn drain_once(self: &Arc<Self>) {
        loop {
            if self.disposed.load(Ordering::Acquire) {
                self.drain_shutdown();
                return;
            }
            if self.pending_count.load(Ordering::Acquire) == 0 {
                return;
            }
            let progressed = if self.idle_count.load(Ordering::Acquire) > 0 {
                self.serve_from_idle()
            } else if self.strategy.estimate() > 0 {
                self.serve_by_allocating()
            } else {
                return;
            };
            if !progressed {
                return;
            }
        }
    }

    /// Hand an idle resource to a waiting borrower, evicting it instead if
    /// it went stale while sitting in the store.
    fn serve_from_idle(self: &Arc<Self>) -> bool {
        let Some(mut slot) = self.idle.pop() else {
            return false;
        };
        self.idle_count.fetch_sub(1, Ordering::AcqRel);

        // Second chance: the release-path check can't see staleness that
        // develops while the resource sits idle.
        if self.manager.should_evict(&slot.resource, &slot.meta) {
            trace!("evicting idle resource after {:?}", slot.meta.idle_since());
            self.metrics.transition(
                MetricVariant::Idle,
                MetricVariant::Destroying,
                slot.meta.idle_since(),
            );
            self.spawn_destroy(slot);
            return true;
        }

        loop {
            let Some(borrower) = self.pending.poll() else {
                // The pending count ran ahead of the store; put the slot
                // back and let the offering side's drain tick pick it up.
                self.idle.push(slot);
                self.idle_count.fetch_add(1, Ordering::AcqRel);
                return false;
            };
            if !self.settle_borrower(&borrower, BorrowerState::Delivered) {
                // Lazily-removed cancellation.
                continue;
            }
            self.acquired_count.fetch_add(1, Ordering::AcqRel);
            let idle_for = slot.meta.idle_since();
            slot.meta.acquire_count += 1;
            slot.meta.acquired_at = Instant::now();
            self.metrics
                .transition(MetricVariant::Idle, MetricVariant::Acquired, idle_for);
            trace!("delivering idle resource (idle for {idle_for:?})");
            self.deliver(borrower, PoolHandle::new(slot, self.clone()));
            return true;
        }
    }

    /// No idle resources: claim capacity and allocate for the next borrower.
    fn serve_by_allocating(self: &Arc<Self>) -> bool {
        let Some(borrower) = self.pending.poll() else {
            return false;
        };
        // Claim the acquisition before the allocator runs so another round
        // can't start a second allocation for the same pending slot.
        self.acquired_count.fetch_add(1, Ordering::AcqRel);
        let granted = self.strategy.try_get(1);
        if granted == 0 {
            self.acquired_count.fetch_sub(1, Ordering::AcqRel);
            if borrower.is_waiting() {
                // The estimate was stale; the borrower keeps its place.
                self.pending.offer_first(borrower);
                return false;
            }
            return true;
        }
        if !borrower.is_waiting() {
            self.acquired_count.fetch_sub(1, Ordering::AcqRel);
            self.strategy.give_back(granted);
            return true;
        }
        trace!("allocating for a waiting borrower");
        self.spawn_allocation(borrower);
        // A strategy may grant more than asked to warm the pool up; surplus
        // permits become idle resources.
        for _ in 1..granted {
            self.spawn_warm_allocation();
        }
        true
    }

    fn spawn_allocation(self: &Arc<Self>, borrower: Arc<PendingBorrower<M>>) {
        self.metrics.admit(MetricVariant::Allocating);
        let pool = self.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            match pool.manager.allocate().await {
                Ok(resource) => {
                    let mut slot = Slot::new(resource);
                    if pool.settle_borrower(&borrower, BorrowerState::Delivered) {
                        slot.meta.acquire_count = 1;
                        slot.meta.acquired_at = Instant::now();
                        pool.metrics.transition(
                            MetricVariant::Allocating,
                            MetricVariant::Acquired,
                            started.elapsed(),
                        );
                        pool.deliver(borrower, PoolHandle::new(slot, pool.clone()));
                    } else {
                        // The borrower went away while we were allocating;
                        // the fresh resource is kept.
                        pool.acquired_count.fetch_sub(1, Ordering::AcqRel);
                        pool.metrics.transition(
                            MetricVariant::Allocating,
                            MetricVariant::Idle,
                            started.elapsed(),
                        );
                        pool.idle.push(slot);
                        pool.idle_count.fetch_add(1, Ordering::AcqRel);
                        pool.drain();
                    }
                }
                Err(error) => {
                    warn!("allocation failed: {error:?}");
                    pool.metrics
                        .retire(MetricVariant::Allocating, started.elapsed());
                    pool.metrics.tally(MetricVariant::Failed);
                    pool.acquired_count.fetch_sub(1, Ordering::AcqRel);
                    pool.strategy.give_back(1);
                    if pool.settle_borrower(&borrower, BorrowerState::Failed) {
                        if let Some(sink) = borrower.take_sink() {
                            let _ = sink.send(Err(PoolError::Allocation(error)));
                        }
                    }
                    pool.drain();
                }
            }
        });
    }

    /// Allocation that was granted beyond the borrower that triggered it;
    /// successes land in the idle store.
    fn spawn_warm_allocation(self: &Arc<Self>) {
        self.metrics.admit(MetricVariant::Allocating);
        let pool = self.clone();
        tokio::spawn(async move {
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
                }
                Err(error) => {
                    warn!("warm allocation failed: {error:?}");
                    pool.metrics
                        .retire(MetricVariant::Allocating, started.elapsed());
                    pool.metrics.tally(MetricVariant::Failed);
                    pool.strategy.give_back(1);
                }
            }
        });
    }

    /// Settle a borrower out of `Waiting` and, on success, retire its
    /// pending-side accounting. Exactly one caller wins per borrower.
    pub(crate) fn settle_borrower(
        &self,
        borrower: &PendingBorrower<M>,
        to: BorrowerState,
    ) -> bool {
        if !borrower.settle(to) {
            return false;
        }
        self.pending_count.fetch_sub(1, Ordering::AcqRel);
        self.metrics
            .retire(MetricVariant::Waiting, borrower.subscribed_at.elapsed());
        true
    }

    /// Complete delivery, hopping through the acquisition executor when one
    /// is configured. The borrower must already be settled as `Delivered`.
    pub(crate) fn deliver(
        self: &Arc<Self>,
        borrower: Arc<PendingBorrower<M>>,
        handle: PoolHandle<M>,
    ) {
        if let Some(executor) = self.config.acquire_executor.clone() {
            let pool = self.clone();
            executor.execute(Box::new(move || pool.deliver_inline(borrower, handle)));
        } else {
            self.deliver_inline(borrower, handle);
        }
    }

    fn deliver_inline(self: &Arc<Self>, borrower: Arc<PendingBorrower<M>>, handle: PoolHandle<M>) {
        let Some(sink) = borrower.take_sink() else {
            self.reclaim(handle);
            return;
        };
        if let Err(rejected) = sink.send(Ok(handle)) {
            trace!("borrower went away before delivery; reclaiming");
            if let Ok(handle) = rejected {
                self.reclaim(handle);
            }
        }
    }

    /// Un-acquire a handle whose borrower vanished between settle and send.
    fn reclaim(self: &Arc<Self>, handle: PoolHandle<M>) {
        let mut slot = handle.into_slot();
        self.acquired_count.fetch_sub(1, Ordering::AcqRel);
        slot.meta.acquire_count -= 1;
        slot.meta.released_at = Instant::now();
        self.metrics.transition(
            MetricVariant::Acquired,
            MetricVariant::Idle,
            slot.meta.acquired_at.elapsed(),
        );
        self.idle.push(slot);
        self.idle_count.fetch_add(1, Ordering::AcqRel);
        self.drain();
    }

    /// Post-disposal rounds: fail whatever is still waiting and tear down
    /// whatever is still idle.
    fn drain_shutdown(self: &Arc<Self>) {
        while let Some(borrower) = self.pending.poll() {
            if self.settle_borrower(&borrower, BorrowerState::Failed) {
                if let Some(sink) = borrower.take_sink() {
                    let _ = sink.send(Err(PoolError::Shutdown));
                }
            }
        }
        while let Some(slot) = self.idle.pop() {
            // Move the slot into `Destroying` before dropping the idle
            // count, so shutdown's quiescence wait always sees it in at
            // least one counter.
            self.metrics.transition(
                MetricVariant::Idle,
                MetricVariant::Destroying,
                slot.meta.idle_since(),
            );
            self.idle_count.fetch_sub(1, Ordering::AcqRel);
            self.spawn_destroy(slot);
        }
    }

    pub(crate) fn spawn_destroy(self: &Arc<Self>, slot: Slot<M>) {
        let pool = self.clone();
        tokio::spawn(async move { pool.destroy_slot(slot).await });
    }
}
