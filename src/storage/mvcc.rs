//! Logical time and reader tracking.
//!
//! The [`Clock`] hands out one timestamp per committed write transaction.
//! Versions carry [`PENDING_TS`] until their transaction commits and stamps
//! them, so a reader at time `t` sees exactly the transactions committed at
//! or before `t`. The [`ReaderRegistry`] tracks long-lived snapshots; the
//! oldest registered snapshot bounds how much merged history may be
//! reclaimed.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::types::Timestamp;

/// Timestamp carried by versions whose transaction has not committed.
pub const PENDING_TS: Timestamp = u64::MAX;

/// Database-wide logical clock.
pub struct Clock {
    now: AtomicU64,
    gate: RwLock<()>,
}

impl Clock {
    /// Creates a clock whose current time is `start`.
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: AtomicU64::new(start),
            gate: RwLock::new(()),
        }
    }

    /// Latest timestamp handed out.
    pub fn now(&self) -> Timestamp {
        self.now.load(Ordering::Acquire)
    }

    /// Moves the clock forward to at least `ts`.
    pub fn advance_to(&self, ts: Timestamp) {
        self.now.fetch_max(ts, Ordering::AcqRel);
    }

    /// Ticks the clock and runs `stamp` with the new commit timestamp.
    ///
    /// Readers asking for [`Clock::stable_now`] wait until `stamp` returns,
    /// so no reader observes a commit half-stamped.
    pub fn commit<R>(&self, stamp: impl FnOnce(Timestamp) -> R) -> R {
        let _gate = self.gate.read();
        let ts = self.now.fetch_add(1, Ordering::AcqRel) + 1;
        stamp(ts)
    }

    /// Current time once every commit at or before it has finished stamping.
    pub fn stable_now(&self) -> Timestamp {
        let _gate = self.gate.write();
        self.now()
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clock").field("now", &self.now()).finish()
    }
}

/// Registry of active snapshots, keyed by their read timestamp.
#[derive(Default)]
pub struct ReaderRegistry {
    floor: Mutex<BTreeMap<Timestamp, u32>>,
}

impl ReaderRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a snapshot at the clock's stable time.
    pub fn register(self: &Arc<Self>, clock: &Clock) -> Snapshot {
        let mut floor = self.floor.lock();
        let ts = clock.stable_now();
        *floor.entry(ts).or_insert(0) += 1;
        Snapshot {
            ts,
            registry: self.clone(),
        }
    }

    fn release(&self, ts: Timestamp) {
        let mut floor = self.floor.lock();
        if let Some(count) = floor.get_mut(&ts) {
            *count -= 1;
            if *count == 0 {
                floor.remove(&ts);
            }
        }
    }

    /// Oldest registered snapshot time, if any.
    pub fn oldest(&self) -> Option<Timestamp> {
        self.floor.lock().keys().next().copied()
    }

    /// Timestamp below which no registered snapshot reads.
    ///
    /// Computed under the registry lock so a snapshot registered afterwards
    /// always reads at or above the returned value.
    pub fn horizon(&self, clock: &Clock) -> Timestamp {
        let floor = self.floor.lock();
        match floor.keys().next() {
            Some(&oldest) => oldest.min(clock.now()),
            None => clock.now(),
        }
    }

    /// Number of registered snapshots.
    pub fn len(&self) -> usize {
        self.floor.lock().values().map(|&n| n as usize).sum()
    }

    /// True when no snapshot is registered.
    pub fn is_empty(&self) -> bool {
        self.floor.lock().is_empty()
    }
}

/// Registered read view; merged history it may need is retained until it
/// is dropped.
pub struct Snapshot {
    ts: Timestamp,
    registry: Arc<ReaderRegistry>,
}

impl Snapshot {
    /// Read timestamp of this snapshot.
    pub fn ts(&self) -> Timestamp {
        self.ts
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot").field("ts", &self.ts).finish()
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.registry.release(self.ts);
    }
}
