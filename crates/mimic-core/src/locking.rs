// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Process-local advisory byte-range locks.
//!
//! Locks are per-path interval lists. Intervals are half-open; an end of
//! zero or below means "to EOF" and is widened for overlap checks. There
//! is no remote coordination — these locks only arbitrate between local
//! processes going through this mount.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::{FsError, FsResult};

/// Periodic wake so a blocked waiter can observe cancellation.
const WAIT_SLICE: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockKind {
    Shared,
    Exclusive,
}

/// One active lock.
#[derive(Clone, Debug)]
pub struct LockInfo {
    pub owner: Vec<u8>,
    pub start: i64,
    pub end: i64,
    pub kind: LockKind,
    pub pid: i32,
}

#[derive(Debug, Default)]
struct LockList {
    locks: Mutex<Vec<LockInfo>>,
    cond: Condvar,
}

/// Cooperative cancellation flag observed by `acquire_wait`.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Treats any non-positive end as "to EOF".
fn overlap(a_start: i64, a_end: i64, b_start: i64, b_end: i64) -> bool {
    let a_end = if a_end <= 0 { i64::MAX } else { a_end };
    let b_end = if b_end <= 0 { i64::MAX } else { b_end };
    a_start < b_end && b_start < a_end
}

#[derive(Debug, Default)]
pub struct LockManager {
    table: Mutex<HashMap<String, Arc<LockList>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn list_for(&self, path: &str) -> Arc<LockList> {
        let mut table = self.table.lock().unwrap();
        Arc::clone(table.entry(path.to_string()).or_default())
    }

    /// Non-blocking acquire. Shared locks coexist; anything overlapping an
    /// exclusive lock (or an exclusive request overlapping anything)
    /// fails `WouldBlock`.
    pub fn try_acquire(
        &self,
        path: &str,
        owner: &[u8],
        start: i64,
        end: i64,
        kind: LockKind,
    ) -> FsResult<()> {
        let list = self.list_for(path);
        let mut locks = list.locks.lock().unwrap();
        Self::acquire_locked(&mut locks, owner, start, end, kind)
    }

    fn acquire_locked(
        locks: &mut Vec<LockInfo>,
        owner: &[u8],
        start: i64,
        end: i64,
        kind: LockKind,
    ) -> FsResult<()> {
        for e in locks.iter() {
            if overlap(start, end, e.start, e.end)
                && (e.kind == LockKind::Exclusive || kind == LockKind::Exclusive)
            {
                return Err(FsError::WouldBlock);
            }
        }
        locks.push(LockInfo {
            owner: owner.to_vec(),
            start,
            end,
            kind,
            pid: -1,
        });
        Ok(())
    }

    /// Blocking acquire. Waits on the path's condvar, waking at least
    /// every `WAIT_SLICE` to observe `cancel`.
    pub fn acquire_wait(
        &self,
        cancel: &CancelToken,
        path: &str,
        owner: &[u8],
        start: i64,
        end: i64,
        kind: LockKind,
    ) -> FsResult<()> {
        let list = self.list_for(path);
        let mut locks = list.locks.lock().unwrap();
        loop {
            if cancel.is_cancelled() {
                return Err(FsError::Cancelled);
            }
            match Self::acquire_locked(&mut locks, owner, start, end, kind) {
                Ok(()) => return Ok(()),
                Err(FsError::WouldBlock) => {
                    let (guard, _timeout) =
                        list.cond.wait_timeout(locks, WAIT_SLICE).unwrap();
                    locks = guard;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Removes every lock whose owner matches and whose range overlaps.
    /// Fails `NotOwner` when nothing matched. Wakes all waiters.
    pub fn release(&self, path: &str, owner: &[u8], start: i64, end: i64) -> FsResult<()> {
        let list = self.list_for(path);
        let mut locks = list.locks.lock().unwrap();
        let before = locks.len();
        locks.retain(|e| !(e.owner == owner && overlap(start, end, e.start, e.end)));
        if locks.len() == before {
            return Err(FsError::NotOwner);
        }
        list.cond.notify_all();
        Ok(())
    }

    /// First lock overlapping the range, if any.
    pub fn query(&self, path: &str, start: i64, end: i64) -> Option<LockInfo> {
        let list = self.list_for(path);
        let locks = list.locks.lock().unwrap();
        locks.iter().find(|e| overlap(start, end, e.start, e.end)).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn non_overlapping_locks_coexist() {
        let lm = LockManager::new();
        lm.try_acquire("/f", b"a", 0, 10, LockKind::Exclusive).unwrap();
        lm.try_acquire("/f", b"b", 10, 20, LockKind::Exclusive).unwrap();
        lm.try_acquire("/g", b"c", 0, 10, LockKind::Exclusive).unwrap();
    }

    #[test]
    fn shared_with_shared_is_allowed() {
        let lm = LockManager::new();
        lm.try_acquire("/f", b"a", 0, 10, LockKind::Shared).unwrap();
        lm.try_acquire("/f", b"b", 5, 15, LockKind::Shared).unwrap();
        assert!(matches!(
            lm.try_acquire("/f", b"c", 5, 6, LockKind::Exclusive),
            Err(FsError::WouldBlock)
        ));
    }

    #[test]
    fn exclusive_conflicts_with_everything() {
        let lm = LockManager::new();
        lm.try_acquire("/f", b"a", 0, 10, LockKind::Exclusive).unwrap();
        assert!(matches!(
            lm.try_acquire("/f", b"b", 5, 15, LockKind::Shared),
            Err(FsError::WouldBlock)
        ));
        assert!(matches!(
            lm.try_acquire("/f", b"b", 5, 15, LockKind::Exclusive),
            Err(FsError::WouldBlock)
        ));
    }

    #[test]
    fn zero_end_means_to_eof() {
        let lm = LockManager::new();
        lm.try_acquire("/f", b"a", 100, 0, LockKind::Exclusive).unwrap();
        assert!(matches!(
            lm.try_acquire("/f", b"b", 1_000_000, 1_000_001, LockKind::Shared),
            Err(FsError::WouldBlock)
        ));
        // below the open-ended lock's start is fine
        lm.try_acquire("/f", b"b", 0, 100, LockKind::Exclusive).unwrap();
    }

    #[test]
    fn release_requires_matching_owner() {
        let lm = LockManager::new();
        lm.try_acquire("/f", b"a", 0, 10, LockKind::Exclusive).unwrap();
        assert!(matches!(
            lm.release("/f", b"b", 0, 10),
            Err(FsError::NotOwner)
        ));
        lm.release("/f", b"a", 0, 10).unwrap();
        lm.try_acquire("/f", b"b", 0, 10, LockKind::Exclusive).unwrap();
    }

    #[test]
    fn query_reports_first_overlap() {
        let lm = LockManager::new();
        lm.try_acquire("/f", b"a", 10, 20, LockKind::Shared).unwrap();
        let info = lm.query("/f", 15, 16).expect("overlap expected");
        assert_eq!(info.owner, b"a");
        assert_eq!(info.kind, LockKind::Shared);
        assert!(lm.query("/f", 30, 40).is_none());
    }

    #[test]
    fn acquire_wait_unblocks_on_release() {
        let lm = Arc::new(LockManager::new());
        lm.try_acquire("/f", b"a", 0, 10, LockKind::Exclusive).unwrap();

        let lm2 = Arc::clone(&lm);
        let waiter = thread::spawn(move || {
            let cancel = CancelToken::new();
            lm2.acquire_wait(&cancel, "/f", b"b", 0, 10, LockKind::Exclusive)
        });

        thread::sleep(Duration::from_millis(50));
        lm.release("/f", b"a", 0, 10).unwrap();
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn acquire_wait_observes_cancellation() {
        let lm = Arc::new(LockManager::new());
        lm.try_acquire("/f", b"a", 0, 10, LockKind::Exclusive).unwrap();

        let cancel = CancelToken::new();
        let cancel2 = cancel.clone();
        let lm2 = Arc::clone(&lm);
        let waiter = thread::spawn(move || {
            lm2.acquire_wait(&cancel2, "/f", b"b", 0, 10, LockKind::Exclusive)
        });

        thread::sleep(Duration::from_millis(50));
        cancel.cancel();
        // nudge the condvar so the waiter re-checks promptly
        let _ = lm.release("/f", b"a", 0, 10);
        let start = Instant::now();
        let result = waiter.join().unwrap();
        // release freed the range, so either outcome must come back fast;
        // with the range still free the acquire now succeeds before the
        // cancellation check only if the wake beat the flag — both are
        // prompt, neither waits out the full slice
        assert!(start.elapsed() < WAIT_SLICE);
        match result {
            Ok(()) | Err(FsError::Cancelled) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }
}
