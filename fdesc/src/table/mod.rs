//! Descriptor table
//!
//! One [`FdTable`] per process: a growable array of slots indexed by
//! descriptor number, the two cursors that keep allocation O(small)
//! (`freefile`, the lowest possibly-free index, and `afterlast`, one past
//! the highest in-use index), working-directory references, and the
//! per-table event registry.
//!
//! Every slot is in exactly one state. `Reserved` pins an index between
//! allocation and publication so the table lock can be dropped while the
//! file object is built; `Closing` pins it while a close drains concurrent
//! users. Code that needs to drop the table lock mid-operation passes the
//! guard in and gets it back, so the relock is visible at the call site.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::{Mutex, MutexGuard, RwLock};

use crate::error::{Error, Result};
use crate::events::KnoteRegistry;
use crate::file::handle::FileHandle;
use crate::sync::WaitQueue;
use crate::vnode::Vnode;

pub mod close;
pub mod lifecycle;

/// Initial slot count; tables at or below this size are allocated in one
/// piece at fork.
pub const NDFILE: usize = 25;
/// Growth quantum once a table outgrows the initial allocation.
pub const NDEXTENT: usize = 50;

/// What occupies one slot
pub enum SlotState {
    Empty,
    /// Index held between allocation and publication
    Reserved,
    /// Live descriptor
    Occupied(Arc<FileHandle>),
    /// A close is draining this descriptor; lookups that tolerate it may
    /// still see the handle
    Closing(Arc<FileHandle>),
}

/// Externally visible slot classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Empty,
    Reserved,
    Occupied,
    Closing,
}

/// One table slot
pub struct Slot {
    pub(crate) state: SlotState,
    /// Someone is waiting for this index to leave `Reserved`
    pub(crate) wanted: bool,
    /// Marked for inheritance across exec
    pub(crate) inherit: bool,
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            state: SlotState::Empty,
            wanted: false,
            inherit: false,
        }
    }
}

impl Slot {
    pub(crate) fn kind(&self) -> SlotKind {
        match self.state {
            SlotState::Empty => SlotKind::Empty,
            SlotState::Reserved => SlotKind::Reserved,
            SlotState::Occupied(_) => SlotKind::Occupied,
            SlotState::Closing(_) => SlotKind::Closing,
        }
    }
}

/// Mutable table state, all behind one mutex
pub struct TableState {
    pub(crate) slots: Vec<Slot>,
    /// Lowest index that may be free; nothing below it is
    pub(crate) freefile: usize,
    /// One past the highest non-empty slot
    pub(crate) afterlast: usize,
    /// Occupied plus Closing slots
    pub(crate) open_count: usize,
    /// A closer is parked on the drain queue
    pub(crate) drain_waiters: bool,
}

/// Directory references carried by the table
#[derive(Default)]
pub struct Dirs {
    pub cwd: Option<Arc<Vnode>>,
    pub root: Option<Arc<Vnode>>,
}

/// Per-process descriptor table
pub struct FdTable {
    pub(crate) state: Mutex<TableState>,
    /// Woken when a Reserved slot is published or released
    pub(crate) resv_wait: WaitQueue,
    /// Woken when a pinned handle drops back to its baseline
    pub(crate) drain_wait: WaitQueue,
    pub(crate) dirs: RwLock<Dirs>,
    pub(crate) knotes: Mutex<KnoteRegistry>,
    /// Per-process descriptor limit (RLIMIT_NOFILE analogue)
    limit: AtomicUsize,
}

impl FdTable {
    pub fn new(limit: usize) -> Self {
        Self {
            state: Mutex::new(TableState {
                slots: Vec::new(),
                freefile: 0,
                afterlast: 0,
                open_count: 0,
                drain_waiters: false,
            }),
            resv_wait: WaitQueue::new(),
            drain_wait: WaitQueue::new(),
            dirs: RwLock::new(Dirs::default()),
            knotes: Mutex::new(KnoteRegistry::new()),
            limit: AtomicUsize::new(limit),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, TableState> {
        self.state.lock()
    }

    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Relaxed)
    }

    /// Lower or raise the per-process limit. Existing descriptors above a
    /// lowered limit stay valid; only new allocations see the cap.
    pub fn set_limit(&self, limit: usize) {
        self.limit.store(limit.max(1), Ordering::Relaxed);
    }

    pub fn dirs(&self) -> &RwLock<Dirs> {
        &self.dirs
    }

    pub fn knotes(&self) -> &Mutex<KnoteRegistry> {
        &self.knotes
    }

    /// Find the lowest free index at or above `want` and reserve it,
    /// growing the slot array as needed.
    ///
    /// Growth allocates with the table lock dropped; if another thread grew
    /// the table meanwhile the fresh storage is discarded and the scan
    /// retried. Failure never mutates table capacity.
    pub(crate) fn fdalloc<'a>(
        &'a self,
        mut st: MutexGuard<'a, TableState>,
        want: usize,
    ) -> (MutexGuard<'a, TableState>, Result<usize>) {
        let lim = self.limit();
        loop {
            let last = st.slots.len().min(lim);
            let mut i = want.max(st.freefile);
            while i < last {
                if matches!(st.slots[i].state, SlotState::Empty) {
                    st.slots[i].state = SlotState::Reserved;
                    if i >= st.afterlast {
                        st.afterlast = i + 1;
                    }
                    if i == st.freefile {
                        st.freefile = i + 1;
                    }
                    return (st, Ok(i));
                }
                i += 1;
            }

            // No space in the current array. Expand?
            let cur = st.slots.len();
            if cur >= lim {
                return (st, Err(Error::TooManyOpenFiles));
            }
            let grown_to = if cur < NDEXTENT { NDEXTENT } else { cur * 2 };
            let numfiles = grown_to.min(lim);

            // Allocate replacement storage with the lock dropped.
            drop(st);
            let mut grown: Vec<Slot> = Vec::new();
            if grown.try_reserve_exact(numfiles).is_err() {
                return (self.state.lock(), Err(Error::OutOfMemory));
            }
            st = self.state.lock();
            if st.slots.len() >= numfiles {
                // Lost the growth race; ours is discarded, rescan.
                continue;
            }
            grown.extend(st.slots.drain(..));
            grown.resize_with(numfiles, Slot::default);
            st.slots = grown;
            log::debug!("fd table grown to {} slots", numfiles);
        }
    }

    /// Reserve a specific index (dup2 target path). The index must name an
    /// Empty slot within the current array.
    pub(crate) fn reservefd(&self, st: &mut TableState, fd: usize) {
        assert!(
            matches!(st.slots[fd].state, SlotState::Empty),
            "reserving a non-empty slot"
        );
        st.slots[fd].state = SlotState::Reserved;
        if fd >= st.afterlast {
            st.afterlast = fd + 1;
        }
        if fd == st.freefile {
            st.freefile = fd + 1;
        }
    }

    /// Return a Reserved or just-emptied index to the free pool, then pull
    /// `afterlast` back over any trailing run of Empty slots.
    pub(crate) fn fdrelse(&self, st: &mut TableState, fd: usize) {
        if fd < st.freefile {
            st.freefile = fd;
        }
        assert!(fd < st.afterlast, "releasing an index past afterlast");
        self.clearfd(st, fd);
        while st.afterlast > 0
            && matches!(st.slots[st.afterlast - 1].state, SlotState::Empty)
        {
            st.afterlast -= 1;
        }
    }

    fn clearfd(&self, st: &mut TableState, fd: usize) {
        let slot = &mut st.slots[fd];
        slot.state = SlotState::Empty;
        slot.inherit = false;
        if slot.wanted {
            slot.wanted = false;
            self.resv_wait.notify_all();
        }
    }

    /// Install a handle into its Reserved slot and wake anyone waiting for
    /// the reservation to resolve.
    pub(crate) fn publish(&self, st: &mut TableState, fd: usize, fp: Arc<FileHandle>) {
        let slot = &mut st.slots[fd];
        assert!(
            matches!(slot.state, SlotState::Reserved),
            "publishing into a slot that was not reserved"
        );
        slot.state = SlotState::Occupied(fp);
        st.open_count += 1;
        if slot.wanted {
            slot.wanted = false;
            self.resv_wait.notify_all();
        }
    }

    /// Wait for `fd` to leave the Reserved state.
    pub(crate) fn waitfd<'a>(
        &'a self,
        mut st: MutexGuard<'a, TableState>,
        fd: usize,
    ) -> MutexGuard<'a, TableState> {
        st.slots[fd].wanted = true;
        let token = self.resv_wait.prepare();
        drop(st);
        self.resv_wait.wait(token);
        self.state.lock()
    }

    /// Borrow the handle at `fd` without pinning. Only a live descriptor
    /// qualifies.
    pub(crate) fn fp_get_noref<'a>(
        &self,
        st: &'a TableState,
        fd: usize,
    ) -> Result<&'a Arc<FileHandle>> {
        match st.slots.get(fd).map(|s| &s.state) {
            Some(SlotState::Occupied(fp)) => Ok(fp),
            _ => Err(Error::BadFileDescriptor),
        }
    }

    /// Like `fp_get_noref` but tolerates a descriptor mid-close. Callers
    /// on this path are already inside an operation, so the handle must be
    /// pinned above its baseline.
    pub(crate) fn fp_get_noref_with_closing<'a>(
        &self,
        st: &'a TableState,
        fd: usize,
    ) -> Result<&'a Arc<FileHandle>> {
        match st.slots.get(fd).map(|s| &s.state) {
            Some(SlotState::Occupied(fp)) => Ok(fp),
            Some(SlotState::Closing(fp)) => {
                assert!(fp.iocount() > 1, "closing descriptor without a user");
                Ok(fp)
            }
            _ => Err(Error::BadFileDescriptor),
        }
    }

    /// Look up `fd` and pin it for an operation about to run without the
    /// table lock.
    pub fn fp_lookup(&self, fd: usize) -> Result<Arc<FileHandle>> {
        let st = self.lock();
        let fp = self.fp_get_noref(&st, fd)?;
        fp.pin();
        Ok(Arc::clone(fp))
    }

    /// Typed variant of [`FdTable::fp_lookup`]: the descriptor must refer
    /// to a file object of `ftype`, otherwise `err` is returned so each
    /// call site keeps its own errno convention.
    pub fn fp_lookup_ftype(
        &self,
        fd: usize,
        ftype: crate::file::FileType,
        err: Error,
    ) -> Result<Arc<FileHandle>> {
        let st = self.lock();
        let fp = self.fp_get_noref(&st, fd)?;
        if fp.object().ftype() != ftype {
            return Err(err);
        }
        fp.pin();
        Ok(Arc::clone(fp))
    }

    /// Drop an operation's pin on `fd`; wakes a draining closer when the
    /// handle falls back to its baseline.
    ///
    /// The slot is resolved through the closing-tolerant lookup: an
    /// outstanding pin keeps a concurrent close parked in its drain loop,
    /// so the slot is still Occupied or Closing here.
    pub fn fp_drop(&self, fd: usize, fp: &Arc<FileHandle>) {
        let mut st = self.lock();
        match self.fp_get_noref_with_closing(&st, fd) {
            Ok(slot_fp) => {
                debug_assert!(
                    Arc::ptr_eq(slot_fp, fp),
                    "pin dropped against the wrong descriptor"
                );
            }
            Err(_) => panic!("dropping a pin on descriptor {} with no handle", fd),
        }
        self.fp_drop_locked(&mut st, fp);
    }

    pub(crate) fn fp_drop_locked(&self, st: &mut TableState, fp: &Arc<FileHandle>) {
        if fp.unpin() == 1 && st.drain_waiters {
            st.drain_waiters = false;
            self.drain_wait.notify_all();
        }
    }

    /// Mark or unmark `fd` for inheritance across an exec whose image
    /// defaults to close-on-exec (spawn file actions).
    pub fn mark_inherit(&self, fd: usize, on: bool) -> Result<()> {
        let mut st = self.lock();
        match st.slots.get(fd).map(Slot::kind) {
            Some(SlotKind::Occupied) => {
                st.slots[fd].inherit = on;
                Ok(())
            }
            _ => Err(Error::BadFileDescriptor),
        }
    }

    pub fn slot_kind(&self, fd: usize) -> SlotKind {
        let st = self.lock();
        st.slots.get(fd).map_or(SlotKind::Empty, Slot::kind)
    }

    pub fn afterlast(&self) -> usize {
        self.lock().afterlast
    }

    pub fn freefile(&self) -> usize {
        self.lock().freefile
    }

    pub fn open_count(&self) -> usize {
        self.lock().open_count
    }

    pub fn capacity(&self) -> usize {
        self.lock().slots.len()
    }

    /// Every live descriptor number, ascending.
    pub fn list_fds(&self) -> Vec<usize> {
        let st = self.lock();
        let mut fds = Vec::new();
        let mut cursor = 0;
        while let Some(fd) = Self::next_occupied(&st, cursor) {
            fds.push(fd);
            cursor = fd + 1;
        }
        fds
    }

    /// Could `n` more descriptors be allocated right now? Counts growth
    /// headroom up to the limit plus free settled slots in the current
    /// array. Advisory: the answer can be stale by the time the caller
    /// acts on it.
    pub fn available(&self, n: usize) -> bool {
        let st = self.lock();
        self.available_locked(&st, n)
    }

    pub(crate) fn available_locked(&self, st: &TableState, n: usize) -> bool {
        let lim = self.limit();
        let mut need = n;
        if need == 0 {
            return true;
        }
        if st.slots.len() < lim {
            let headroom = lim - st.slots.len();
            if headroom >= need {
                return true;
            }
            need -= headroom;
        }
        for slot in &st.slots[st.freefile..st.slots.len().min(lim)] {
            if matches!(slot.state, SlotState::Empty) {
                need -= 1;
                if need == 0 {
                    return true;
                }
            }
        }
        false
    }

    /// Lowest live descriptor at or above `from`, if any.
    pub(crate) fn next_occupied(st: &TableState, from: usize) -> Option<usize> {
        (from..st.afterlast).find(|&fd| matches!(st.slots[fd].state, SlotState::Occupied(_)))
    }

    /// Highest live descriptor strictly below `below`, if any.
    pub(crate) fn prev_occupied(st: &TableState, below: usize) -> Option<usize> {
        st.slots[..below.min(st.afterlast)]
            .iter()
            .rposition(|s| matches!(s.state, SlotState::Occupied(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::tests_support::bare_object;
    use static_assertions::const_assert;

    // The initial fork allocation must fit inside one growth quantum.
    const_assert!(NDFILE < NDEXTENT);

    fn reserve(table: &FdTable, want: usize) -> usize {
        let st = table.lock();
        let (_st, r) = table.fdalloc(st, want);
        r.unwrap()
    }

    fn occupy(table: &FdTable, want: usize) -> usize {
        let fd = reserve(table, want);
        let mut st = table.lock();
        table.publish(&mut st, fd, FileHandle::new(bare_object()));
        fd
    }

    #[test]
    fn allocation_is_lowest_free() {
        let table = FdTable::new(256);
        assert_eq!(occupy(&table, 0), 0);
        assert_eq!(occupy(&table, 0), 1);
        assert_eq!(occupy(&table, 0), 2);
        assert_eq!(table.afterlast(), 3);
        assert_eq!(table.freefile(), 3);
    }

    #[test]
    fn want_skips_lower_indices_without_moving_freefile() {
        let table = FdTable::new(256);
        assert_eq!(occupy(&table, 10), 10);
        assert_eq!(table.freefile(), 0);
        assert_eq!(table.afterlast(), 11);
        assert_eq!(occupy(&table, 0), 0);
    }

    #[test]
    fn growth_is_ndextent_then_doubling() {
        let table = FdTable::new(1024);
        occupy(&table, 0);
        assert_eq!(table.capacity(), NDEXTENT);
        occupy(&table, NDEXTENT);
        assert_eq!(table.capacity(), NDEXTENT * 2);
        occupy(&table, NDEXTENT * 2);
        assert_eq!(table.capacity(), NDEXTENT * 4);
    }

    #[test]
    fn limit_failure_does_not_grow_the_table() {
        let table = FdTable::new(4);
        for i in 0..4 {
            assert_eq!(occupy(&table, 0), i);
        }
        let cap = table.capacity();
        let st = table.lock();
        let (st, r) = table.fdalloc(st, 0);
        assert_eq!(r, Err(Error::TooManyOpenFiles));
        assert_eq!(st.slots.len(), cap);
    }

    #[test]
    fn reserved_slot_is_not_allocatable() {
        let table = FdTable::new(64);
        let fd = reserve(&table, 0);
        assert_eq!(fd, 0);
        assert_eq!(table.slot_kind(0), SlotKind::Reserved);
        assert_eq!(reserve(&table, 0), 1);
    }

    #[test]
    fn fdrelse_shrinks_afterlast_over_trailing_empties() {
        let table = FdTable::new(64);
        let a = reserve(&table, 0);
        let b = reserve(&table, 0);
        let c = reserve(&table, 0);
        assert_eq!((a, b, c), (0, 1, 2));
        let mut st = table.lock();
        table.fdrelse(&mut st, 2);
        table.fdrelse(&mut st, 1);
        assert_eq!(st.afterlast, 1);
        assert_eq!(st.freefile, 1);
        table.fdrelse(&mut st, 0);
        assert_eq!(st.afterlast, 0);
        assert_eq!(st.freefile, 0);
    }

    #[test]
    fn lookup_pins_and_drop_unpins() {
        let table = FdTable::new(64);
        let fd = occupy(&table, 0);
        let fp = table.fp_lookup(fd).unwrap();
        assert_eq!(fp.iocount(), 2);
        table.fp_drop(fd, &fp);
        assert_eq!(fp.iocount(), 1);
        assert!(matches!(table.fp_lookup(99), Err(Error::BadFileDescriptor)));
    }

    #[test]
    fn typed_lookup_returns_the_callers_error() {
        use crate::file::FileType;
        let table = FdTable::new(64);
        let fd = occupy(&table, 0);
        let fp = table
            .fp_lookup_ftype(fd, FileType::Pipe, Error::InvalidArgument)
            .unwrap();
        table.fp_drop(fd, &fp);
        assert!(matches!(
            table.fp_lookup_ftype(fd, FileType::Socket, Error::NotSupported),
            Err(Error::NotSupported)
        ));
        assert_eq!(fp.iocount(), 1);
    }

    #[test]
    fn available_counts_headroom_and_holes() {
        let table = FdTable::new(8);
        assert!(table.available(8));
        assert!(!table.available(9));
        for _ in 0..6 {
            occupy(&table, 0);
        }
        // Array grew to the limit; only the two empty slots remain.
        assert!(table.available(2));
        assert!(!table.available(3));
        let resv = reserve(&table, 0);
        assert_eq!(resv, 6);
        assert!(table.available(1));
        assert!(!table.available(2));
    }

    #[test]
    fn occupied_iteration_skips_holes_and_reservations() {
        let table = FdTable::new(64);
        assert_eq!(occupy(&table, 0), 0);
        assert_eq!(reserve(&table, 0), 1);
        assert_eq!(occupy(&table, 0), 2);
        let st = table.lock();
        assert_eq!(FdTable::next_occupied(&st, 0), Some(0));
        assert_eq!(FdTable::next_occupied(&st, 1), Some(2));
        assert_eq!(FdTable::next_occupied(&st, 3), None);
        assert_eq!(FdTable::prev_occupied(&st, st.afterlast), Some(2));
        assert_eq!(FdTable::prev_occupied(&st, 2), Some(0));
        assert_eq!(FdTable::prev_occupied(&st, 0), None);
    }

    #[test]
    fn open_count_tracks_published_slots() {
        let table = FdTable::new(64);
        occupy(&table, 0);
        occupy(&table, 0);
        assert_eq!(table.open_count(), 2);
        assert_eq!(table.list_fds(), [0, 1]);
    }
}
