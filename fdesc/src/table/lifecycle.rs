//! Table lifecycle: fork inheritance, exec reshaping, exit teardown

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::{Mutex, RwLock};

use crate::cred::Credential;
use crate::error::{Error, Result};
use crate::events::KnoteRegistry;
use crate::file::handle::{FileHandle, HandleFlags};
use crate::policy::SecurityPolicy;
use crate::sync::WaitQueue;
use crate::table::{Dirs, FdTable, Slot, SlotState, TableState, NDEXTENT, NDFILE};
use crate::vnode::LockOwner;

impl FdTable {
    /// Build a child table inheriting this one's descriptors.
    ///
    /// Confined objects never cross; close-on-fork entries are skipped on a
    /// plain fork, close-on-exec entries on the exec variant. Reserved and
    /// Closing slots are transient and the child simply does not see them.
    ///
    /// Directory references are re-acquired, not copied: a dead root is a
    /// hard failure since the child would otherwise escape its chroot, a
    /// dead working directory just leaves the child without one.
    pub fn fork_table(&self, in_exec: bool) -> Result<FdTable> {
        let (cwd, root) = {
            let dirs = self.dirs.read();
            let root = match &dirs.root {
                Some(r) => match r.try_ref() {
                    Some(r) => Some(r),
                    None => {
                        log::warn!("fork: root directory is dead, refusing inheritance");
                        return Err(Error::PermissionDenied);
                    }
                },
                None => None,
            };
            let cwd = dirs.cwd.as_ref().and_then(|c| c.try_ref());
            (cwd, root)
        };

        // Size the child to cover the parent's in-use range, allocating
        // with the parent unlocked and retrying if it grew meanwhile.
        let mut st = self.lock();
        let mut slots: Vec<Slot>;
        loop {
            let afterlast = st.afterlast;
            let want = if afterlast <= NDFILE {
                NDFILE
            } else {
                afterlast.div_ceil(NDEXTENT) * NDEXTENT
            };
            drop(st);
            slots = Vec::new();
            if slots.try_reserve_exact(want).is_err() {
                return Err(Error::OutOfMemory);
            }
            slots.resize_with(want, Slot::default);
            st = self.lock();
            if st.afterlast <= want {
                break;
            }
        }

        let mut open_count = 0;
        let mut afterlast = 0;
        let mut cursor = 0;
        while let Some(fd) = FdTable::next_occupied(&st, cursor) {
            cursor = fd + 1;
            let SlotState::Occupied(fp) = &st.slots[fd].state else {
                unreachable!("next_occupied returned a non-live slot");
            };
            let fg = fp.object();
            if fg.is_confined() {
                continue;
            }
            let flags = fp.flags();
            if !in_exec && flags.contains(HandleFlags::CLOFORK) {
                continue;
            }
            if in_exec && flags.contains(HandleFlags::CLOEXEC) {
                continue;
            }
            fg.retain();
            let child_fp = FileHandle::with_flags(
                Arc::clone(fg),
                flags & (HandleFlags::CLOEXEC | HandleFlags::CLOFORK),
            );
            slots[fd].state = SlotState::Occupied(child_fp);
            slots[fd].inherit = st.slots[fd].inherit;
            open_count += 1;
            afterlast = fd + 1;
        }
        let limit = self.limit();
        drop(st);

        let freefile = slots[..afterlast]
            .iter()
            .position(|s| matches!(s.state, SlotState::Empty))
            .unwrap_or(afterlast);

        let child = FdTable {
            state: Mutex::new(TableState {
                slots,
                freefile,
                afterlast,
                open_count,
                drain_waiters: false,
            }),
            resv_wait: WaitQueue::new(),
            drain_wait: WaitQueue::new(),
            dirs: RwLock::new(Dirs { cwd, root }),
            knotes: Mutex::new(KnoteRegistry::new()),
            limit: core::sync::atomic::AtomicUsize::new(limit),
        };
        Ok(child)
    }

    /// Reshape the table across exec.
    ///
    /// Walks descending so afterlast tightens as entries close. An entry
    /// closes if it is marked close-on-exec, if the image defaults to
    /// close-on-exec and the entry lacks an inherit mark, or if policy
    /// vetoes inheritance. Surviving vnode-backed entries have their
    /// process-owned advisory locks re-keyed to the new image's owner.
    ///
    /// Exec is single-threaded in the process; a slot still in flux here
    /// is a table corruption and fatal.
    pub fn exec_reshape(
        &self,
        cred: &Credential,
        policy: &dyn SecurityPolicy,
        cloexec_default: bool,
        old_owner: LockOwner,
        new_owner: LockOwner,
    ) -> Result<()> {
        let mut st = self.lock();
        for (fd, slot) in st.slots[..st.afterlast].iter().enumerate() {
            assert!(
                !matches!(slot.state, SlotState::Reserved | SlotState::Closing(_)) && !slot.wanted,
                "exec: descriptor {} in flux",
                fd
            );
        }
        let mut below = st.afterlast;
        while let Some(fd) = FdTable::prev_occupied(&st, below) {
            below = fd;
            let SlotState::Occupied(fp) = &st.slots[fd].state else {
                unreachable!("prev_occupied returned a non-live slot");
            };
            let fg = Arc::clone(fp.object());
            let close_it = fp.flags().contains(HandleFlags::CLOEXEC)
                || (cloexec_default && !st.slots[fd].inherit)
                || policy.check_inherit(cred, &fg).is_err();

            if close_it {
                if let Err(e) = self.close_and_unlock(st, cred, policy, fd, false, None) {
                    log::warn!("exec: close of descriptor {} failed: {}", fd, e);
                }
                st = self.lock();
            } else if let Some(vp) = fg.vnode() {
                let vp = Arc::clone(vp);
                drop(st);
                vp.lock_transfer(old_owner, new_owner);
                st = self.lock();
            }
        }
        Ok(())
    }

    /// Tear the table down at process exit: detach every event filter,
    /// close every live descriptor, drop the directory references.
    ///
    /// A Reserved slot here means some thread is still mid-allocation
    /// while the process exits, which is fatal.
    pub fn invalidate(
        &self,
        cred: &Credential,
        policy: &dyn SecurityPolicy,
        posix_unlock: Option<LockOwner>,
    ) -> Result<()> {
        // Table before knotes, the same order the close path takes them in.
        {
            let st = self.lock();
            let mut knotes = self.knotes.lock();
            for fd in 0..st.afterlast {
                let _ = knotes.fdclose(fd);
            }
        }

        let mut st = self.lock();
        loop {
            for (fd, slot) in st.slots[..st.afterlast].iter().enumerate() {
                if matches!(slot.state, SlotState::Reserved | SlotState::Closing(_)) {
                    panic!("exit: descriptor {} in flux", fd);
                }
            }
            let Some(fd) = FdTable::prev_occupied(&st, st.afterlast) else {
                break;
            };
            if let Err(e) = self.close_and_unlock(st, cred, policy, fd, false, posix_unlock) {
                log::warn!("exit: close of descriptor {} failed: {}", fd, e);
            }
            st = self.lock();
        }
        debug_assert_eq!(st.open_count, 0);
        st.slots.clear();
        st.freefile = 0;
        st.afterlast = 0;
        drop(st);

        *self.dirs.write() = Dirs::default();
        debug_assert!(self.knotes.lock().is_empty());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::tests_support::bare_object;
    use crate::policy::PermitAll;
    use crate::table::SlotKind;
    use crate::vnode::{Vnode, VnodeMeta};

    fn occupy_with(table: &FdTable, flags: HandleFlags) -> usize {
        let st = table.lock();
        let (mut st, r) = table.fdalloc(st, 0);
        let fd = r.unwrap();
        table.publish(&mut st, fd, FileHandle::with_flags(bare_object(), flags));
        fd
    }

    #[test]
    fn fork_skips_cloexec_only_on_exec() {
        let parent = FdTable::new(256);
        let plain = occupy_with(&parent, HandleFlags::empty());
        let cx = occupy_with(&parent, HandleFlags::CLOEXEC);
        let cf = occupy_with(&parent, HandleFlags::CLOFORK);

        let child = parent.fork_table(false).unwrap();
        assert_eq!(child.slot_kind(plain), SlotKind::Occupied);
        assert_eq!(child.slot_kind(cx), SlotKind::Occupied);
        assert_eq!(child.slot_kind(cf), SlotKind::Empty);

        let execed = parent.fork_table(true).unwrap();
        assert_eq!(execed.slot_kind(plain), SlotKind::Occupied);
        assert_eq!(execed.slot_kind(cx), SlotKind::Empty);
        assert_eq!(execed.slot_kind(cf), SlotKind::Occupied);
    }

    #[test]
    fn fork_never_copies_confined_objects() {
        let parent = FdTable::new(256);
        let fd = occupy_with(&parent, HandleFlags::empty());
        {
            let st = parent.lock();
            parent.fp_get_noref(&st, fd).unwrap().object().confine();
        }
        let child = parent.fork_table(false).unwrap();
        assert_eq!(child.slot_kind(fd), SlotKind::Empty);
        assert_eq!(child.open_count(), 0);
    }

    #[test]
    fn fork_tightens_cursors_past_skipped_entries() {
        let parent = FdTable::new(256);
        occupy_with(&parent, HandleFlags::empty());
        occupy_with(&parent, HandleFlags::CLOFORK);
        let top = occupy_with(&parent, HandleFlags::CLOFORK);
        assert_eq!(top, 2);
        let child = parent.fork_table(false).unwrap();
        assert_eq!(child.afterlast(), 1);
        assert_eq!(child.freefile(), 1);
        assert_eq!(child.open_count(), 1);
    }

    #[test]
    fn fork_with_dead_root_fails() {
        let parent = FdTable::new(256);
        let root = Vnode::new(1, VnodeMeta::default());
        parent.dirs().write().root = Some(Arc::clone(&root));
        root.make_dead();
        assert!(matches!(
            parent.fork_table(false),
            Err(Error::PermissionDenied)
        ));
    }

    #[test]
    fn fork_with_dead_cwd_detaches_it() {
        let parent = FdTable::new(256);
        let cwd = Vnode::new(2, VnodeMeta::default());
        parent.dirs().write().cwd = Some(Arc::clone(&cwd));
        cwd.make_dead();
        let child = parent.fork_table(false).unwrap();
        assert!(child.dirs().read().cwd.is_none());
    }

    #[test]
    fn exec_default_close_spares_inherit_marked_entries() {
        let cred = Credential::kernel();
        let table = FdTable::new(256);
        let kept = occupy_with(&table, HandleFlags::empty());
        let dropped = occupy_with(&table, HandleFlags::empty());
        {
            let mut st = table.lock();
            st.slots[kept].inherit = true;
        }
        table
            .exec_reshape(
                &cred,
                &PermitAll,
                true,
                LockOwner::Process(1),
                LockOwner::Process(2),
            )
            .unwrap();
        assert_eq!(table.slot_kind(kept), SlotKind::Occupied);
        assert_eq!(table.slot_kind(dropped), SlotKind::Empty);
    }

    #[test]
    fn invalidate_closes_everything_and_drops_dirs() {
        let cred = Credential::kernel();
        let table = FdTable::new(256);
        occupy_with(&table, HandleFlags::empty());
        occupy_with(&table, HandleFlags::empty());
        table.dirs().write().cwd = Some(Vnode::new(3, VnodeMeta::default()));
        table.knotes().lock().attach(0, 99);
        table.invalidate(&cred, &PermitAll, None).unwrap();
        assert_eq!(table.open_count(), 0);
        assert_eq!(table.afterlast(), 0);
        assert!(table.dirs().read().cwd.is_none());
        assert!(table.knotes().lock().is_empty());
    }
}
