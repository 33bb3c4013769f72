use crate::{
    pool::PoolHandle,
    resource::{PoolResult, ResourceManager},
    time::Instant,
};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, Mutex,
    },
    thread::ThreadId,
};
use tokio::sync::oneshot;

/// The discipline for picking which waiting borrower is served next.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PendingOrdering {
    /// First come, first served (queue-style pool).
    #[default]
    Fifo,
    /// Most recent borrower first.
    Lifo,
    /// Prefer borrowers that subscribed on the thread currently running the
    /// matching round, falling back to any other waiting borrower.
    Affinity,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum BorrowerState {
    Waiting = 0,
    Delivered = 1,
    Cancelled = 2,
    Failed = 3,
}

pub(crate) type Sink<M> =
    oneshot::Sender<PoolResult<PoolHandle<M>, <M as ResourceManager>::Error>>;

/// One registered acquire. The borrower sits in a pending store until the
/// drain core matches it with a resource, its deadline fires, or its
/// acquire future goes away; whichever happens first wins the state CAS and
/// the others become no-ops.
pub(crate) struct PendingBorrower<M: ResourceManager> {
    state: AtomicU8,
    sink: Mutex<Option<Sink<M>>>,
    pub(crate) subscribed_at: Instant,
    pub(crate) thread: ThreadId,
}

impl<M: ResourceManager> PendingBorrower<M> {
    pub fn new(sink: Sink<M>) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(BorrowerState::Waiting as u8),
            sink: Mutex::new(Some(sink)),
            subscribed_at: Instant::now(),
            thread: std::thread::current().id(),
        })
    }

    /// One-shot transition out of `Waiting`. Returns false if another party
    /// settled this borrower first.
    pub fn settle(&self, to: BorrowerState) -> bool {
        debug_assert!(to != BorrowerState::Waiting);
        self.state
            .compare_exchange(
                BorrowerState::Waiting as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    #[inline(always)]
    pub fn is_waiting(&self) -> bool {
        self.state.load(Ordering::Acquire) == BorrowerState::Waiting as u8
    }

    pub fn take_sink(&self) -> Option<Sink<M>> {
        self.sink.lock().unwrap().take()
    }
}

impl<M: ResourceManager> std::fmt::Debug for PendingBorrower<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "PendingBorrower(waiting={}, for={:?})",
            self.is_waiting(),
            self.subscribed_at.elapsed()
        ))
    }
}

/// Store of borrowers awaiting a resource. Offers may come from any thread;
/// only the serialised drain section polls. Settled borrowers may linger
/// (lazy removal): pollers must recheck borrower state after every poll.
pub(crate) enum PendingStore<M: ResourceManager> {
    Ordered {
        lifo: bool,
        queue: Mutex<VecDeque<Arc<PendingBorrower<M>>>>,
    },
    Affinity {
        queues: Mutex<HashMap<ThreadId, VecDeque<Arc<PendingBorrower<M>>>>>,
    },
}

impl<M: ResourceManager> PendingStore<M> {
    pub fn new(ordering: PendingOrdering) -> Self {
        match ordering {
            PendingOrdering::Fifo => Self::Ordered {
                lifo: false,
                queue: Mutex::default(),
            },
            PendingOrdering::Lifo => Self::Ordered {
                lifo: true,
                queue: Mutex::default(),
            },
            PendingOrdering::Affinity => Self::Affinity {
                queues: Mutex::default(),
            },
        }
    }

    pub fn offer(&self, borrower: &Arc<PendingBorrower<M>>) {
        match self {
            Self::Ordered { queue, .. } => queue.lock().unwrap().push_back(borrower.clone()),
            Self::Affinity { queues } => queues
                .lock()
                .unwrap()
                .entry(borrower.thread)
                .or_default()
                .push_back(borrower.clone()),
        }
    }

    /// Re-insert at the head after a failed permit race, so the borrower
    /// keeps its place in line.
    pub fn offer_first(&self, borrower: Arc<PendingBorrower<M>>) {
        match self {
            Self::Ordered { queue, .. } => queue.lock().unwrap().push_front(borrower),
            Self::Affinity { queues } => queues
                .lock()
                .unwrap()
                .entry(borrower.thread)
                .or_default()
                .push_front(borrower),
        }
    }

    pub fn poll(&self) -> Option<Arc<PendingBorrower<M>>> {
        match self {
            Self::Ordered { lifo, queue } => {
                let mut queue = queue.lock().unwrap();
                if *lifo {
                    queue.pop_back()
                } else {
                    queue.pop_front()
                }
            }
            Self::Affinity { queues } => {
                let mut queues = queues.lock().unwrap();
                let current = std::thread::current().id();
                if let Some(own) = queues.get_mut(&current) {
                    if let Some(borrower) = own.pop_front() {
                        return Some(borrower);
                    }
                }
                // Slow path: any other thread's borrower will do.
                queues.values_mut().find_map(VecDeque::pop_front)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::BasicManager;

    fn borrower() -> Arc<PendingBorrower<BasicManager>> {
        let (sink, _receiver) = oneshot::channel();
        PendingBorrower::new(sink)
    }

    #[test]
    fn settle_is_one_shot() {
        let b = borrower();
        assert!(b.is_waiting());
        assert!(b.settle(BorrowerState::Delivered));
        assert!(!b.settle(BorrowerState::Cancelled));
        assert!(!b.is_waiting());
    }

    #[test]
    fn fifo_polls_in_offer_order() {
        let store = PendingStore::new(PendingOrdering::Fifo);
        let (b1, b2) = (borrower(), borrower());
        store.offer(&b1);
        store.offer(&b2);
        assert!(Arc::ptr_eq(&store.poll().unwrap(), &b1));
        assert!(Arc::ptr_eq(&store.poll().unwrap(), &b2));
        assert!(store.poll().is_none());
    }

    #[test]
    fn lifo_polls_newest_first() {
        let store = PendingStore::new(PendingOrdering::Lifo);
        let (b1, b2) = (borrower(), borrower());
        store.offer(&b1);
        store.offer(&b2);
        assert!(Arc::ptr_eq(&store.poll().unwrap(), &b2));
        assert!(Arc::ptr_eq(&store.poll().unwrap(), &b1));
    }

    #[test]
    fn offer_first_restores_head() {
        let store = PendingStore::new(PendingOrdering::Fifo);
        let (b1, b2) = (borrower(), borrower());
        store.offer(&b1);
        store.offer(&b2);
        let polled = store.poll().unwrap();
        store.offer_first(polled);
        assert!(Arc::ptr_eq(&store.poll().unwrap(), &b1));
    }

    #[test]
    fn affinity_prefers_own_thread() {
        let store = PendingStore::new(PendingOrdering::Affinity);
        let remote = std::thread::spawn(|| {
            let (sink, _receiver) = oneshot::channel();
            PendingBorrower::<BasicManager>::new(sink)
        })
        .join()
        .unwrap();
        let local = borrower();
        store.offer(&remote);
        store.offer(&local);
        assert_ne!(remote.thread, local.thread);
        assert!(Arc::ptr_eq(&store.poll().unwrap(), &local));
        // Fallback: the remote-keyed borrower is still reachable.
        assert!(Arc::ptr_eq(&store.poll().unwrap(), &remote));
        assert!(store.poll().is_none());
    }
}
