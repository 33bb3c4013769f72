use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::sync::Mutex;
use std::time::Duration;
use strum::EnumCount;
use strum::IntoEnumIterator;

/// The observable states a resource (or borrower, for `Waiting`) can be in.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, strum::EnumCount, strum::EnumIter, strum::AsRefStr,
)]
pub enum MetricVariant {
    Allocating,
    Idle,
    Acquired,
    Resetting,
    Destroying,
    Failed,
    Destroyed,
    Waiting,
}

const DWELL_WINDOW: usize = 32;

/// Rolling average over the last [`DWELL_WINDOW`] dwell times in one state,
/// in milliseconds. Underfilled windows average over what has been seen so
/// far; times past `u32::MAX` milliseconds saturate.
#[derive(Debug, Default, PartialEq)]
struct DwellAverage {
    samples: [u32; DWELL_WINDOW],
    cursor: usize,
    seen: usize,
    sum: u64,
}

impl DwellAverage {
    fn record(&mut self, time: Duration) {
        let millis = time.as_millis().min(u32::MAX as u128) as u32;
        let evicted = std::mem::replace(&mut self.samples[self.cursor], millis);
        self.sum = self.sum + millis as u64 - evicted as u64;
        self.cursor = (self.cursor + 1) % DWELL_WINDOW;
        self.seen = (self.seen + 1).min(DWELL_WINDOW);
    }

    fn average(&self) -> u32 {
        if self.seen == 0 {
            0
        } else {
            (self.sum / self.seen as u64) as u32
        }
    }
}

/// One value per [`MetricVariant`].
#[derive(Default, Clone, Copy, PartialEq, Eq)]
pub struct ByState<T>([T; MetricVariant::COUNT]);

impl<T> std::ops::Index<MetricVariant> for ByState<T> {
    type Output = T;
    fn index(&self, state: MetricVariant) -> &T {
        &self.0[state as usize]
    }
}

impl<T> std::ops::IndexMut<MetricVariant> for ByState<T> {
    fn index_mut(&mut self, state: MetricVariant) -> &mut T {
        &mut self.0[state as usize]
    }
}

/// Serialises as a map keyed by state name rather than a bare array, so
/// snapshots stay readable if the variant set ever changes shape.
impl<T: Serialize> Serialize for ByState<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(MetricVariant::COUNT))?;
        for state in MetricVariant::iter() {
            map.serialize_entry(state.as_ref(), &self[state])?;
        }
        map.end()
    }
}

impl<T: std::fmt::Debug + Default + PartialEq> std::fmt::Debug for ByState<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for state in MetricVariant::iter() {
            if self[state] != T::default() {
                map.entry(&state.as_ref(), &self[state]);
            }
        }
        map.finish()
    }
}

/// Point-in-time summary of the pool's accounting.
#[derive(Default, Serialize)]
pub struct PoolMetrics {
    /// Entries currently in each state.
    pub current: ByState<usize>,
    /// All-time number of entries into each state.
    pub entered: ByState<usize>,
    /// High-water mark per state.
    pub peak: ByState<usize>,
    /// Rolling average dwell time per state, in milliseconds.
    pub avg_dwell_ms: ByState<u32>,
    /// Resources currently tracked by the pool (everything but `Waiting`).
    pub live: usize,
    /// High-water mark of `live`.
    pub live_peak: usize,
}

impl std::fmt::Debug for PoolMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("PoolMetrics (live={}) {{\n", self.live))?;
        for state in MetricVariant::iter() {
            f.write_fmt(format_args!(
                "    {state:?}: {} (peak={}, avg={}ms)\n",
                self.current[state], self.peak[state], self.avg_dwell_ms[state]
            ))?;
        }
        f.write_str("}")
    }
}

#[derive(Debug, Default)]
struct Counters {
    current: ByState<usize>,
    entered: ByState<usize>,
    peak: ByState<usize>,
    dwell: ByState<DwellAverage>,
    live: usize,
    live_peak: usize,
}

impl Counters {
    /// An entry shows up in `to`, from outside or from another state.
    fn arrive(&mut self, to: MetricVariant) {
        self.current[to] += 1;
        self.peak[to] = self.peak[to].max(self.current[to]);
        self.entered[to] += 1;
    }

    /// An entry leaves `from` after dwelling in it for `time`.
    fn depart(&mut self, from: MetricVariant, time: Duration) {
        self.current[from] -= 1;
        self.dwell[from].record(time);
    }

    /// Waiting borrowers are not resources; they never count as live.
    fn track(&mut self, state: MetricVariant) {
        if state != MetricVariant::Waiting {
            self.live += 1;
            self.live_peak = self.live_peak.max(self.live);
        }
    }

    fn untrack(&mut self, state: MetricVariant) {
        if state != MetricVariant::Waiting {
            self.live -= 1;
        }
    }
}

/// Metrics accumulator. Updated from any thread that drives a lifecycle
/// transition; the lock is held only for the few arithmetic operations.
#[derive(Debug, Default)]
pub(crate) struct MetricsAccum {
    counters: Mutex<Counters>,
}

impl MetricsAccum {
    /// Entries currently in `state`.
    #[inline]
    pub fn current(&self, state: MetricVariant) -> usize {
        self.counters.lock().unwrap().current[state]
    }

    /// A new entry appeared in `to`.
    #[inline]
    pub fn admit(&self, to: MetricVariant) {
        let mut lock = self.counters.lock().unwrap();
        lock.arrive(to);
        lock.track(to);
    }

    /// An entry moved between states, after spending `time` in `from`.
    #[inline]
    pub fn transition(&self, from: MetricVariant, to: MetricVariant, time: Duration) {
        let mut lock = self.counters.lock().unwrap();
        lock.depart(from, time);
        lock.arrive(to);
    }

    /// An entry left the pool entirely, after spending `time` in `from`.
    #[inline]
    pub fn retire(&self, from: MetricVariant, time: Duration) {
        let mut lock = self.counters.lock().unwrap();
        lock.depart(from, time);
        lock.untrack(from);
    }

    /// Count an all-time event against `state` without a live entry, e.g.
    /// a swallowed handler failure.
    #[inline]
    pub fn tally(&self, state: MetricVariant) {
        self.counters.lock().unwrap().entered[state] += 1;
    }

    pub fn summary(&self) -> PoolMetrics {
        let lock = self.counters.lock().unwrap();
        let mut avg_dwell_ms = ByState::default();
        for state in MetricVariant::iter() {
            avg_dwell_ms[state] = lock.dwell[state].average();
        }
        PoolMetrics {
            current: lock.current,
            entered: lock.entered,
            peak: lock.peak,
            avg_dwell_ms,
            live: lock.live,
            live_peak: lock.live_peak,
        }
    }
}
