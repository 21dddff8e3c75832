//! Duplication finish and the close path
//!
//! Closing a descriptor is two-phase. First the slot is flipped from
//! `Occupied` to `Closing`, which keeps the index pinned and fails any new
//! lookup. Then the closer drains: it repeatedly pokes the file object's
//! drain hook, wakes select parkers, and sleeps until every concurrent
//! operation has dropped its pin. Only then is the slot finalized and the
//! shared object's reference released, so the type-specific close callback
//! never races an in-flight read.

use alloc::sync::Arc;
use spin::MutexGuard;

use crate::cred::Credential;
use crate::error::{Error, Result};
use crate::events;
use crate::file::handle::{FileHandle, HandleFlags, VFlags};
use crate::file;
use crate::policy::SecurityPolicy;
use crate::table::{FdTable, SlotState, TableState};
use crate::vnode::LockOwner;

impl FdTable {
    /// Second half of every dup-family operation: `new` is already
    /// Reserved, build a handle sharing `old`'s file object and publish it.
    ///
    /// Failure releases the reservation and leaves the table exactly as it
    /// was before the reservation was taken.
    pub(crate) fn finishdup<'a>(
        &'a self,
        mut st: MutexGuard<'a, TableState>,
        cred: &Credential,
        policy: &dyn SecurityPolicy,
        old: usize,
        new: usize,
        flags: HandleFlags,
    ) -> (MutexGuard<'a, TableState>, Result<usize>) {
        let fg = match self.fp_get_noref(&st, old) {
            Ok(ofp) => Arc::clone(ofp.object()),
            Err(e) => {
                self.fdrelse(&mut st, new);
                return (st, Err(e));
            }
        };
        if let Err(e) = policy.check_dup(cred, &fg, new) {
            self.fdrelse(&mut st, new);
            return (st, Err(e));
        }

        fg.retain();
        drop(st);
        let nfp = FileHandle::with_flags(fg, flags & (HandleFlags::CLOEXEC | HandleFlags::CLOFORK));
        st = self.lock();

        debug_assert!(new < st.afterlast);
        self.publish(&mut st, new, nfp);
        (st, Ok(new))
    }

    /// Wait out every operation still pinning `fp`.
    ///
    /// The drain mark makes select parkers bail with `Interrupted` when
    /// woken; the drain hook unblocks threads parked inside the object's
    /// own operations.
    pub(crate) fn fileproc_drain<'a>(
        &'a self,
        mut st: MutexGuard<'a, TableState>,
        fp: &Arc<FileHandle>,
    ) -> MutexGuard<'a, TableState> {
        fp.set_vflags(VFlags::DRAIN);
        while fp.iocount() > 1 {
            let token = self.drain_wait.prepare();
            st.drain_waiters = true;
            drop(st);

            // Errors here only mean the type has no drain hook.
            let _ = fp.object().ops().drain(fp.object());
            if fp.flags().contains(HandleFlags::INSELECT) {
                fp.select_queue().notify_all();
            }
            if fp.flags().contains(HandleFlags::SELCONFLICT) {
                events::select_conflict_queue().notify_all();
            }

            self.drain_wait.wait(token);
            st = self.lock();
        }
        fp.clear_flags(HandleFlags::SELCONFLICT);
        st
    }

    /// Close descriptor `fd`, consuming the table lock.
    ///
    /// `keep_reserved` is the dup2-overwrite variant: the index stays
    /// Reserved for the caller instead of returning to the free pool.
    /// `posix_unlock` names the process lock owner whose POSIX advisory
    /// locks die with this close, if it holds any.
    pub(crate) fn close_and_unlock<'a>(
        &'a self,
        mut st: MutexGuard<'a, TableState>,
        cred: &Credential,
        policy: &dyn SecurityPolicy,
        fd: usize,
        keep_reserved: bool,
        posix_unlock: Option<LockOwner>,
    ) -> Result<()> {
        let fp = {
            let slot = &mut st.slots[fd];
            match core::mem::replace(&mut slot.state, SlotState::Empty) {
                SlotState::Occupied(fp) => {
                    slot.state = SlotState::Closing(Arc::clone(&fp));
                    fp
                }
                other => {
                    slot.state = other;
                    panic!("close: descriptor {} in flux", fd);
                }
            }
        };
        let fg = Arc::clone(fp.object());

        // Close-notification and async-I/O cancellation run unlocked; the
        // Closing state keeps the slot pinned meanwhile.
        if fp.flags().contains(HandleFlags::AIOISSUED) || fg.vnode().is_some() {
            drop(st);
            policy.notify_close(cred, &fg);
            fp.clear_flags(HandleFlags::AIOISSUED);
            st = self.lock();
        }

        // Event filters detach before the drain so none of them observes a
        // half-dead descriptor.
        let _idents = self.knotes.lock().fdclose(fd);

        st = self.fileproc_drain(st, &fp);

        st.open_count -= 1;
        if keep_reserved {
            let slot = &mut st.slots[fd];
            slot.state = SlotState::Reserved;
            slot.inherit = false;
        } else {
            self.fdrelse(&mut st, fd);
        }
        drop(st);

        debug_assert_eq!(fp.iocount(), 1);
        drop(fp);

        file::drop_ref(&fg, posix_unlock)
    }

    /// Guard-aware close entry: resolves the descriptor, rejects a guarded
    /// close, then runs the two-phase close.
    pub(crate) fn close_fd(
        &self,
        cred: &Credential,
        policy: &dyn SecurityPolicy,
        fd: usize,
        posix_unlock: Option<LockOwner>,
    ) -> Result<()> {
        let st = self.lock();
        let fp = self.fp_get_noref(&st, fd)?;
        if fp.is_guarded(crate::file::handle::GuardAttrs::CLOSE) {
            return Err(Error::PermissionDenied);
        }
        self.close_and_unlock(st, cred, policy, fd, false, posix_unlock)
    }
}
