#![forbid(unsafe_code)]

//! Per-record reader/writer lock table.
//!
//! Entries are created lazily on first use and dropped as soon as no guard
//! or waiter references them. Acquisition waits at most the given timeout;
//! a timeout surfaces as [`LStoreError::LockTimeout`] so the caller can
//! abort and release everything it holds.
//!
//! A shared holder may upgrade in place. The shared lock stays held while
//! the upgrade waits, and new readers queue behind a pending upgrade. Only
//! one holder may wait to upgrade a record at a time; a second upgrader
//! fails at once since neither could ever proceed.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::types::{LStoreError, Result, Rid};

/// Requested access to a record.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LockMode {
    /// Shared access for reads.
    Shared,
    /// Exclusive access for writes.
    Exclusive,
}

#[derive(Default)]
struct LockState {
    readers: usize,
    writer: bool,
    upgrading: bool,
}

impl LockState {
    fn grants(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::Shared => !self.writer && !self.upgrading,
            LockMode::Exclusive => !self.writer && self.readers == 0,
        }
    }
}

#[derive(Default)]
struct RecordLock {
    state: Mutex<LockState>,
    released: Condvar,
}

impl RecordLock {
    fn acquire(&self, mode: LockMode, deadline: Instant) -> bool {
        let mut state = self.state.lock();
        loop {
            if state.grants(mode) {
                match mode {
                    LockMode::Shared => state.readers += 1,
                    LockMode::Exclusive => state.writer = true,
                }
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            self.released.wait_until(&mut state, deadline);
        }
    }

    /// Caller holds one shared lock.
    fn upgrade(&self, deadline: Instant) -> bool {
        let mut state = self.state.lock();
        if state.upgrading {
            return false;
        }
        state.upgrading = true;
        loop {
            if state.readers == 1 {
                state.readers = 0;
                state.writer = true;
                state.upgrading = false;
                return true;
            }
            if Instant::now() >= deadline {
                state.upgrading = false;
                self.released.notify_all();
                return false;
            }
            self.released.wait_until(&mut state, deadline);
        }
    }

    fn release(&self, mode: LockMode) {
        let mut state = self.state.lock();
        match mode {
            LockMode::Shared => state.readers -= 1,
            LockMode::Exclusive => state.writer = false,
        }
        drop(state);
        self.released.notify_all();
    }
}

struct LockTable {
    entries: Mutex<HashMap<Rid, Arc<RecordLock>>>,
}

impl LockTable {
    fn entry(&self, rid: Rid) -> Arc<RecordLock> {
        self.entries.lock().entry(rid).or_default().clone()
    }

    fn prune(&self, rid: Rid) {
        let mut entries = self.entries.lock();
        if let Some(lock) = entries.get(&rid) {
            if Arc::strong_count(lock) == 1 {
                entries.remove(&rid);
            }
        }
    }
}

/// Lock table shared by every transaction on a table.
#[derive(Clone)]
pub struct LockManager {
    table: Arc<LockTable>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    /// Creates an empty lock table.
    pub fn new() -> Self {
        Self {
            table: Arc::new(LockTable {
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Acquires `rid` in `mode`, waiting at most `timeout`.
    pub fn acquire(&self, rid: Rid, mode: LockMode, timeout: Duration) -> Result<LockGuard> {
        let lock = self.table.entry(rid);
        if lock.acquire(mode, Instant::now() + timeout) {
            return Ok(LockGuard {
                rid,
                mode,
                held: Some(lock),
                table: self.table.clone(),
            });
        }
        drop(lock);
        self.table.prune(rid);
        debug!(rid = rid.0, ?mode, "lock.timeout");
        Err(LStoreError::LockTimeout { rid })
    }

    /// Attempts `mode` on `rid` without waiting.
    pub fn try_acquire(&self, rid: Rid, mode: LockMode) -> Result<LockGuard> {
        self.acquire(rid, mode, Duration::ZERO)
    }

    /// Number of records with a live lock entry.
    pub fn len(&self) -> usize {
        self.table.entries.lock().len()
    }

    /// True when no record is locked or awaited.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Held record lock; released on drop.
pub struct LockGuard {
    rid: Rid,
    mode: LockMode,
    held: Option<Arc<RecordLock>>,
    table: Arc<LockTable>,
}

impl LockGuard {
    /// Locked record.
    pub fn rid(&self) -> Rid {
        self.rid
    }

    /// Mode currently held.
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Converts a shared lock into an exclusive one.
    ///
    /// The shared lock is kept while waiting. On timeout, or when another
    /// holder is already upgrading the same record, the guard still holds
    /// the shared lock and [`LStoreError::LockTimeout`] is returned.
    pub fn upgrade(&mut self, timeout: Duration) -> Result<()> {
        if self.mode == LockMode::Exclusive {
            return Ok(());
        }
        let lock = self
            .held
            .as_ref()
            .ok_or(LStoreError::Invalid("lock guard already released"))?;
        if lock.upgrade(Instant::now() + timeout) {
            self.mode = LockMode::Exclusive;
            return Ok(());
        }
        debug!(rid = self.rid.0, "lock.upgrade_timeout");
        Err(LStoreError::LockTimeout { rid: self.rid })
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("rid", &self.rid)
            .field("mode", &self.mode)
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(lock) = self.held.take() {
            lock.release(self.mode);
        }
        self.table.prune(self.rid);
    }
}
