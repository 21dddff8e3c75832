//! Vnode collaborator
//!
//! The engine treats the filesystem node layer as an external collaborator:
//! it only needs reference acquisition that can fail on a dead node, a
//! little metadata for status queries, and the advisory byte-range lock
//! engine used by the POSIX/OFD/flock surface.
//!
//! Advisory locks are keyed by a [`LockOwner`]: POSIX locks belong to the
//! process, OFD and flock-style locks belong to the open-file-description
//! (file object) itself, which is what lets them survive dup and fork.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

use crate::error::{Error, Result};
use crate::sync::WaitQueue;

/// Metadata surfaced through file-status queries
#[derive(Debug, Clone, Copy, Default)]
pub struct VnodeMeta {
    pub ino: u64,
    pub size: u64,
    pub mode: u32,
    pub nlink: u32,
}

/// Identity owning an advisory lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOwner {
    /// POSIX-style: owned by the process
    Process(u32),
    /// OFD/flock-style: owned by the open-file-description
    OpenFile(u64),
}

/// Half-open byte range `[start, end)`; `end == u64::MAX` means to EOF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRange {
    pub start: u64,
    pub end: u64,
}

impl LockRange {
    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// The whole file, the range used by flock-style locks.
    pub const WHOLE: LockRange = LockRange::new(0, u64::MAX);

    fn overlaps(&self, other: &LockRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

/// How a lock request waits on a conflict
#[derive(Debug, Clone, Copy)]
pub enum LockWait {
    /// Fail with `WouldBlock` on conflict
    NonBlocking,
    /// Wait until the conflicting lock is released
    Blocking,
    /// Wait with a spin budget; `TimedOut` when it runs out
    Budget(u64),
}

/// One advisory lock on record
#[derive(Debug, Clone, Copy)]
struct LockRecord {
    owner: LockOwner,
    range: LockRange,
    exclusive: bool,
}

/// A conflicting lock reported by `lock_test`
#[derive(Debug, Clone, Copy)]
pub struct LockConflict {
    pub owner: LockOwner,
    pub range: LockRange,
    pub exclusive: bool,
}

/// Filesystem node stub with advisory lock state
pub struct Vnode {
    id: u64,
    meta: Mutex<VnodeMeta>,
    dead: AtomicBool,
    locks: Mutex<Vec<LockRecord>>,
    lock_wait: WaitQueue,
}

impl Vnode {
    pub fn new(id: u64, meta: VnodeMeta) -> Arc<Self> {
        Arc::new(Self {
            id,
            meta: Mutex::new(meta),
            dead: AtomicBool::new(false),
            locks: Mutex::new(Vec::new()),
            lock_wait: WaitQueue::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn meta(&self) -> VnodeMeta {
        *self.meta.lock()
    }

    pub fn set_meta(&self, meta: VnodeMeta) {
        *self.meta.lock() = meta;
    }

    /// Mark the node dead (recycled / forcibly unmounted). One-way.
    pub fn make_dead(&self) {
        self.dead.store(true, Ordering::Release);
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    /// Acquire a fresh reference, failing on a dead node. This is the only
    /// way a table may re-point its directory fields at a vnode.
    pub fn try_ref(self: &Arc<Self>) -> Option<Arc<Self>> {
        if self.is_dead() {
            None
        } else {
            Some(Arc::clone(self))
        }
    }

    fn find_conflict(records: &[LockRecord], owner: LockOwner, range: LockRange, exclusive: bool) -> Option<LockConflict> {
        records
            .iter()
            .find(|rec| {
                rec.owner != owner
                    && rec.range.overlaps(&range)
                    && (exclusive || rec.exclusive)
            })
            .map(|rec| LockConflict {
                owner: rec.owner,
                range: rec.range,
                exclusive: rec.exclusive,
            })
    }

    /// Remove `range` from every record held by `owner`, splitting records
    /// that straddle the boundary.
    fn carve(records: &mut Vec<LockRecord>, owner: LockOwner, range: LockRange) {
        let mut i = 0;
        while i < records.len() {
            let rec = records[i];
            if rec.owner != owner || !rec.range.overlaps(&range) {
                i += 1;
                continue;
            }
            let left = LockRange::new(rec.range.start, rec.range.end.min(range.start));
            let right = LockRange::new(rec.range.start.max(range.end), rec.range.end);
            records.swap_remove(i);
            if !left.is_empty() {
                records.push(LockRecord { range: left, ..rec });
            }
            if !right.is_empty() {
                records.push(LockRecord { range: right, ..rec });
            }
            // swap_remove reordered the tail; rescan from the same index
        }
    }

    /// Acquire an advisory lock on `range`.
    ///
    /// A request by the same owner over an already-held range replaces the
    /// held portion (POSIX upgrade/downgrade semantics).
    pub fn lock_set(&self, owner: LockOwner, range: LockRange, exclusive: bool, wait: LockWait) -> Result<()> {
        if range.is_empty() {
            return Err(Error::InvalidArgument);
        }
        loop {
            let mut records = self.locks.lock();
            if Self::find_conflict(&records, owner, range, exclusive).is_none() {
                Self::carve(&mut records, owner, range);
                records.push(LockRecord { owner, range, exclusive });
                return Ok(());
            }
            let token = self.lock_wait.prepare();
            drop(records);
            match wait {
                LockWait::NonBlocking => return Err(Error::WouldBlock),
                LockWait::Blocking => self.lock_wait.wait(token),
                LockWait::Budget(budget) => {
                    if !self.lock_wait.wait_budget(token, budget) {
                        return Err(Error::TimedOut);
                    }
                }
            }
        }
    }

    /// Release `owner`'s locks over `range`.
    pub fn lock_clear(&self, owner: LockOwner, range: LockRange) {
        let mut records = self.locks.lock();
        Self::carve(&mut records, owner, range);
        drop(records);
        self.lock_wait.notify_all();
    }

    /// Release every lock held by `owner` (unlock-on-close).
    pub fn lock_clear_all(&self, owner: LockOwner) {
        let mut records = self.locks.lock();
        records.retain(|rec| rec.owner != owner);
        drop(records);
        self.lock_wait.notify_all();
    }

    /// Would `owner` be able to take this lock? Returns the first
    /// conflicting record if not (F_GETLK).
    pub fn lock_test(&self, owner: LockOwner, range: LockRange, exclusive: bool) -> Option<LockConflict> {
        let records = self.locks.lock();
        Self::find_conflict(&records, owner, range, exclusive)
    }

    /// Re-key every lock held by `from` to `to` (exec handoff).
    pub fn lock_transfer(&self, from: LockOwner, to: LockOwner) {
        let mut records = self.locks.lock();
        for rec in records.iter_mut() {
            if rec.owner == from {
                rec.owner = to;
            }
        }
    }

    pub fn owner_has_locks(&self, owner: LockOwner) -> bool {
        self.locks.lock().iter().any(|rec| rec.owner == owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vn() -> Arc<Vnode> {
        Vnode::new(7, VnodeMeta::default())
    }

    const P1: LockOwner = LockOwner::Process(100);
    const P2: LockOwner = LockOwner::Process(200);
    const OFD: LockOwner = LockOwner::OpenFile(42);

    #[test]
    fn exclusive_locks_conflict_across_owners() {
        let vp = vn();
        vp.lock_set(P1, LockRange::new(0, 100), true, LockWait::NonBlocking).unwrap();
        assert_eq!(
            vp.lock_set(P2, LockRange::new(50, 150), true, LockWait::NonBlocking),
            Err(Error::WouldBlock)
        );
        // Disjoint range is fine.
        vp.lock_set(P2, LockRange::new(100, 150), true, LockWait::NonBlocking).unwrap();
    }

    #[test]
    fn shared_locks_coexist() {
        let vp = vn();
        vp.lock_set(P1, LockRange::new(0, 100), false, LockWait::NonBlocking).unwrap();
        vp.lock_set(P2, LockRange::new(0, 100), false, LockWait::NonBlocking).unwrap();
        // Upgrading to exclusive now conflicts.
        assert_eq!(
            vp.lock_set(P1, LockRange::new(0, 100), true, LockWait::NonBlocking),
            Err(Error::WouldBlock)
        );
    }

    #[test]
    fn same_owner_replaces_held_range() {
        let vp = vn();
        vp.lock_set(P1, LockRange::new(0, 100), true, LockWait::NonBlocking).unwrap();
        vp.lock_set(P1, LockRange::new(20, 40), false, LockWait::NonBlocking).unwrap();
        // The carved middle is now shared; P2 can share it but not the edges.
        vp.lock_set(P2, LockRange::new(20, 40), false, LockWait::NonBlocking).unwrap();
        assert_eq!(
            vp.lock_set(P2, LockRange::new(0, 20), false, LockWait::NonBlocking),
            Err(Error::WouldBlock)
        );
    }

    #[test]
    fn unlock_splits_records() {
        let vp = vn();
        vp.lock_set(P1, LockRange::new(0, 100), true, LockWait::NonBlocking).unwrap();
        vp.lock_clear(P1, LockRange::new(40, 60));
        vp.lock_set(P2, LockRange::new(40, 60), true, LockWait::NonBlocking).unwrap();
        assert!(vp.lock_test(P2, LockRange::new(0, 40), true).is_some());
        assert!(vp.lock_test(P2, LockRange::new(60, 100), true).is_some());
    }

    #[test]
    fn ofd_owner_is_distinct_from_process() {
        let vp = vn();
        vp.lock_set(OFD, LockRange::WHOLE, true, LockWait::NonBlocking).unwrap();
        assert!(vp.lock_test(P1, LockRange::new(0, 1), false).is_some());
        vp.lock_clear_all(P1);
        // Clearing the process owner leaves the OFD lock in place.
        assert!(vp.owner_has_locks(OFD));
    }

    #[test]
    fn transfer_rekeys_owner() {
        let vp = vn();
        vp.lock_set(P1, LockRange::new(0, 10), true, LockWait::NonBlocking).unwrap();
        vp.lock_transfer(P1, P2);
        assert!(!vp.owner_has_locks(P1));
        assert!(vp.owner_has_locks(P2));
    }

    #[test]
    fn dead_vnode_refuses_references() {
        let vp = vn();
        assert!(vp.try_ref().is_some());
        vp.make_dead();
        assert!(vp.try_ref().is_none());
    }

    #[test]
    fn budget_wait_times_out() {
        let vp = vn();
        vp.lock_set(P1, LockRange::WHOLE, true, LockWait::NonBlocking).unwrap();
        assert_eq!(
            vp.lock_set(P2, LockRange::WHOLE, true, LockWait::Budget(256)),
            Err(Error::TimedOut)
        );
    }
}
