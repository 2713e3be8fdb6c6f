//! Shared lock registry
//!
//! One `FsSharedState` exists per repository identity per process,
//! tracked in an explicit process-wide registry of weak handles. It owns
//! the four intra-process mutexes and the live/free list of per-
//! transaction write locks.
//!
//! Lock ordering invariant: acquire in the order
//! `txn_current -> pack -> write -> txn_list`. Any subset may be held at
//! once but the relative order is fixed. Violations are programming
//! errors, caught by a debug assertion in the single acquisition path;
//! there is no runtime detection in release builds.
//!
//! The intra-process mutexes serialize threads of this process; the
//! advisory file locks on `write-lock` / `pack-lock` exclude other
//! processes. Both are taken together on the write and pack paths.

use crate::error::{FsError, Result};
use fs2::FileExt;
use parking_lot::{Mutex, MutexGuard};
use std::cell::Cell;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::{Arc, OnceLock, Weak};
use tracing::debug;

/// The four ordered intra-process locks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    TxnCurrent = 0,
    Pack = 1,
    Write = 2,
    TxnList = 3,
}

impl LockKind {
    fn rank(self) -> u8 {
        self as u8
    }
}

thread_local! {
    /// Bitmask of lock ranks held by the current thread
    static HELD_RANKS: Cell<u8> = const { Cell::new(0) };
}

/// Mutex that asserts the fixed acquisition order in debug builds
pub struct OrderedMutex<T> {
    kind: LockKind,
    inner: Mutex<T>,
}

/// Guard for an [`OrderedMutex`]; clears the rank bit on every exit path
pub struct OrderedGuard<'a, T> {
    kind: LockKind,
    guard: MutexGuard<'a, T>,
}

impl<T> OrderedMutex<T> {
    pub fn new(kind: LockKind, value: T) -> Self {
        Self {
            kind,
            inner: Mutex::new(value),
        }
    }

    /// Block until the lock is held. Panics in debug builds when the
    /// calling thread already holds a lock of equal or higher rank.
    pub fn lock(&self) -> OrderedGuard<'_, T> {
        let rank = self.kind.rank();
        HELD_RANKS.with(|held| {
            debug_assert!(
                held.get() >> rank == 0,
                "lock order violation: acquiring {:?} while holding a later lock",
                self.kind
            );
        });
        let guard = self.inner.lock();
        HELD_RANKS.with(|held| held.set(held.get() | (1 << rank)));
        OrderedGuard {
            kind: self.kind,
            guard,
        }
    }
}

impl<T> Drop for OrderedGuard<'_, T> {
    fn drop(&mut self) {
        let rank = self.kind.rank();
        HELD_RANKS.with(|held| held.set(held.get() & !(1 << rank)));
    }
}

impl<T> std::ops::Deref for OrderedGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> std::ops::DerefMut for OrderedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

/// Per-transaction write-lock record. `Idle | Writing` state machine:
/// the proto-revision file of a transaction may be written by at most
/// one thread at a time, and re-entry fails fast instead of deadlocking.
#[derive(Debug)]
struct TxnLockSlot {
    txn_id: u64,
    being_written: bool,
}

/// Live list plus free list of transaction lock records. Released slots
/// return to the free list for reuse instead of being dropped.
#[derive(Default)]
pub struct TxnLockTable {
    live: HashMap<u64, usize>,
    slots: Vec<TxnLockSlot>,
    free: Vec<usize>,
}

impl TxnLockTable {
    fn slot_for(&mut self, txn_id: u64) -> usize {
        if let Some(&idx) = self.live.get(&txn_id) {
            return idx;
        }
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx].txn_id = txn_id;
                self.slots[idx].being_written = false;
                idx
            }
            None => {
                self.slots.push(TxnLockSlot {
                    txn_id,
                    being_written: false,
                });
                self.slots.len() - 1
            }
        };
        self.live.insert(txn_id, idx);
        idx
    }

    fn begin_write(&mut self, txn_id: u64) -> Result<()> {
        let idx = self.slot_for(txn_id);
        if self.slots[idx].being_written {
            return Err(FsError::Busy(format!(
                "transaction {txn_id} is already being written"
            )));
        }
        self.slots[idx].being_written = true;
        Ok(())
    }

    fn end_write(&mut self, txn_id: u64) {
        if let Some(&idx) = self.live.get(&txn_id) {
            debug_assert!(self.slots[idx].being_written);
            self.slots[idx].being_written = false;
        }
    }

    /// Return the transaction's record to the free list. Called when the
    /// transaction commits or aborts.
    fn release(&mut self, txn_id: u64) {
        if let Some(idx) = self.live.remove(&txn_id) {
            self.slots[idx].being_written = false;
            self.free.push(idx);
        }
    }

    #[cfg(test)]
    fn free_count(&self) -> usize {
        self.free.len()
    }
}

/// Intra-process state shared by every open handle on one repository
/// identity
pub struct FsSharedState {
    pub txn_current_lock: OrderedMutex<()>,
    pub pack_lock: OrderedMutex<()>,
    pub write_lock: OrderedMutex<()>,
    pub txn_list: OrderedMutex<TxnLockTable>,
}

impl FsSharedState {
    fn new() -> Self {
        Self {
            txn_current_lock: OrderedMutex::new(LockKind::TxnCurrent, ()),
            pack_lock: OrderedMutex::new(LockKind::Pack, ()),
            write_lock: OrderedMutex::new(LockKind::Write, ()),
            txn_list: OrderedMutex::new(LockKind::TxnList, TxnLockTable::default()),
        }
    }

    /// Mark the transaction's proto-revision as being written by this
    /// thread. Fails fast with `Busy` when another thread (or this one;
    /// the lock is non-recursive) is already writing it.
    pub fn begin_txn_write(self: &Arc<Self>, txn_id: u64) -> Result<TxnWriteGuard> {
        self.txn_list.lock().begin_write(txn_id)?;
        debug!(txn_id, "proto-revision write lock acquired");
        Ok(TxnWriteGuard {
            shared: Arc::clone(self),
            txn_id,
        })
    }

    /// Release the transaction's lock record back to the free list.
    pub fn release_txn(&self, txn_id: u64) {
        self.txn_list.lock().release(txn_id);
    }
}

/// Guard holding a transaction's proto-revision write lock
pub struct TxnWriteGuard {
    shared: Arc<FsSharedState>,
    txn_id: u64,
}

impl Drop for TxnWriteGuard {
    fn drop(&mut self) {
        self.shared.txn_list.lock().end_write(self.txn_id);
    }
}

/// Process-wide registry mapping repository uuid to shared state.
/// Entries are weak; the state lives as long as some open handle holds
/// the Arc, and dead entries are pruned on the next open.
fn registry() -> &'static Mutex<HashMap<String, Weak<FsSharedState>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Weak<FsSharedState>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Fetch or create the shared state for a repository identity.
pub fn shared_state_for(uuid: &str) -> Arc<FsSharedState> {
    let mut map = registry().lock();
    map.retain(|_, weak| weak.strong_count() > 0);
    if let Some(state) = map.get(uuid).and_then(Weak::upgrade) {
        return state;
    }
    let state = Arc::new(FsSharedState::new());
    map.insert(uuid.to_string(), Arc::downgrade(&state));
    state
}

/// Guard for a cross-process advisory file lock
pub struct FileLockGuard {
    file: File,
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

/// Take an exclusive advisory lock on `path`, creating the lock file if
/// needed. Non-blocking: contention from another process surfaces as a
/// retryable `Busy` error; the caller owns the retry/backoff policy.
pub fn lock_file_exclusive(path: &Path) -> Result<FileLockGuard> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(FileLockGuard { file }),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(FsError::Busy(format!(
            "lock file {} held by another process",
            path.display()
        ))),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_registry_shares_per_identity() {
        let a = shared_state_for("uuid-reg-a");
        let b = shared_state_for("uuid-reg-a");
        let c = shared_state_for("uuid-reg-b");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_registry_releases_dead_entries() {
        let first = shared_state_for("uuid-reg-dead");
        let ptr = Arc::as_ptr(&first);
        drop(first);
        // A fresh state is created once all handles are gone.
        let second = shared_state_for("uuid-reg-dead");
        // Pointer may coincidentally match after reallocation; the real
        // check is that the weak entry no longer upgrades to the old Arc.
        let _ = ptr;
        assert_eq!(Arc::strong_count(&second), 1);
    }

    #[test]
    fn test_lock_order_respected() {
        let state = FsSharedState::new();
        let _a = state.txn_current_lock.lock();
        let _b = state.pack_lock.lock();
        let _c = state.write_lock.lock();
        let _d = state.txn_list.lock();
    }

    #[test]
    fn test_subset_in_order() {
        let state = FsSharedState::new();
        {
            let _pack = state.pack_lock.lock();
            let _list = state.txn_list.lock();
        }
        // Ranks cleared after release; a fresh ordered sequence works.
        let _cur = state.txn_current_lock.lock();
        let _write = state.write_lock.lock();
    }

    #[test]
    #[should_panic(expected = "lock order violation")]
    #[cfg(debug_assertions)]
    fn test_out_of_order_asserts() {
        let state = FsSharedState::new();
        let _list = state.txn_list.lock();
        let _write = state.write_lock.lock();
    }

    #[test]
    fn test_txn_write_non_recursive() {
        let state = Arc::new(FsSharedState::new());
        let guard = state.begin_txn_write(7).unwrap();
        // Re-entry fails fast rather than deadlocking.
        assert!(matches!(
            state.begin_txn_write(7),
            Err(FsError::Busy(_))
        ));
        drop(guard);
        let again = state.begin_txn_write(7).unwrap();
        drop(again);
    }

    #[test]
    fn test_txn_slot_reuse() {
        let state = Arc::new(FsSharedState::new());
        drop(state.begin_txn_write(1).unwrap());
        state.release_txn(1);
        assert_eq!(state.txn_list.lock().free_count(), 1);

        drop(state.begin_txn_write(2).unwrap());
        // Slot came off the free list, none were allocated.
        assert_eq!(state.txn_list.lock().free_count(), 0);
        state.release_txn(2);
    }

    #[test]
    fn test_file_lock_conflict() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("write-lock");
        let guard = lock_file_exclusive(&path).unwrap();
        // A second open of the same path cannot take the held lock.
        assert!(matches!(
            lock_file_exclusive(&path),
            Err(FsError::Busy(_))
        ));
        drop(guard);
        // Released lock can be retaken.
        let _again = lock_file_exclusive(&path).unwrap();
    }
}
