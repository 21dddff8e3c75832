//! Event registrations
//!
//! Two event surfaces hang off descriptors and both must be torn down in a
//! specific order when a descriptor closes:
//!
//! * knote registrations (kevent-style filters attached to an fd) are
//!   detached before the close starts draining, so no filter observes a
//!   half-dead descriptor;
//! * select parkers are woken during the drain so they re-examine the
//!   handle, notice the drain mark, and bail out with `Interrupted`.
//!
//! When several threads select on the same handle at once they collide on
//! the single per-handle wait set. The losers fall back to a shared
//! conflict queue; a drain broadcasts on that too.

use alloc::sync::Arc;
use alloc::vec::Vec;
use hashbrown::HashMap;

use crate::error::{Error, Result};
use crate::file::handle::{FileHandle, HandleFlags, VFlags};
use crate::sync::WaitQueue;

/// Wait queue shared by every selecting thread that lost the race for a
/// handle's private wait set.
static SELECT_CONFLICT: WaitQueue = WaitQueue::new();

pub fn select_conflict_queue() -> &'static WaitQueue {
    &SELECT_CONFLICT
}

/// Per-table registry of kevent-style filter registrations, keyed by fd.
///
/// The engine only tracks identities; filter evaluation lives with the
/// event subsystem proper.
#[derive(Default)]
pub struct KnoteRegistry {
    by_fd: HashMap<usize, Vec<u64>>,
}

impl KnoteRegistry {
    pub fn new() -> Self {
        Self {
            by_fd: HashMap::new(),
        }
    }

    pub fn attach(&mut self, fd: usize, ident: u64) {
        self.by_fd.entry(fd).or_default().push(ident);
    }

    pub fn detach(&mut self, fd: usize, ident: u64) -> bool {
        let Some(idents) = self.by_fd.get_mut(&fd) else {
            return false;
        };
        let Some(pos) = idents.iter().position(|&i| i == ident) else {
            return false;
        };
        idents.swap_remove(pos);
        if idents.is_empty() {
            self.by_fd.remove(&fd);
        }
        true
    }

    /// Rip out every registration on `fd`, returning the identities so the
    /// caller can notify their filters. Runs before the close drains.
    pub fn fdclose(&mut self, fd: usize) -> Vec<u64> {
        self.by_fd.remove(&fd).unwrap_or_default()
    }

    pub fn registered(&self, fd: usize) -> usize {
        self.by_fd.get(&fd).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.by_fd.is_empty()
    }
}

/// Record a thread entering select on `fp`.
///
/// Returns the queue the thread must park on: the handle's private wait
/// set when this thread won it, the shared conflict queue otherwise.
pub fn select_begin<'a>(fp: &'a Arc<FileHandle>) -> &'a WaitQueue {
    let mut wset = fp.wset().lock();
    if fp.flags().contains(HandleFlags::INSELECT) && wset.is_some() {
        // Someone else owns the wait set; collide.
        fp.set_flags(HandleFlags::SELCONFLICT);
        return &SELECT_CONFLICT;
    }
    fp.set_flags(HandleFlags::INSELECT);
    *wset = Some(());
    fp.select_queue()
}

/// Park until woken. A drain in progress interrupts the wait; the check
/// runs on both sides of the park because the drain mark can land between
/// the caller's readiness poll and the park itself.
pub fn select_wait(fp: &Arc<FileHandle>, queue: &WaitQueue, token: u64) -> Result<()> {
    if fp.vflags().contains(VFlags::DRAIN) {
        return Err(Error::Interrupted);
    }
    queue.wait(token);
    if fp.vflags().contains(VFlags::DRAIN) {
        return Err(Error::Interrupted);
    }
    Ok(())
}

/// Leave select. Only the wait-set owner releases it; a conflict-queue
/// selector leaves the owner's registration alone (the conflict mark is
/// cleared by the next drain).
pub fn select_end(fp: &Arc<FileHandle>, queue: &WaitQueue) {
    if !core::ptr::eq(queue, fp.select_queue()) {
        return;
    }
    let mut wset = fp.wset().lock();
    *wset = None;
    fp.clear_flags(HandleFlags::INSELECT);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn knote_attach_detach() {
        let mut reg = KnoteRegistry::new();
        reg.attach(3, 10);
        reg.attach(3, 11);
        reg.attach(5, 12);
        assert_eq!(reg.registered(3), 2);
        assert!(reg.detach(3, 10));
        assert!(!reg.detach(3, 10));
        assert_eq!(reg.registered(3), 1);
    }

    #[test]
    fn fdclose_drains_every_registration() {
        let mut reg = KnoteRegistry::new();
        reg.attach(4, 1);
        reg.attach(4, 2);
        let mut idents = reg.fdclose(4);
        idents.sort_unstable();
        assert_eq!(idents, [1, 2]);
        assert_eq!(reg.registered(4), 0);
        assert!(reg.is_empty());
        assert!(reg.fdclose(4).is_empty());
    }

    #[test]
    fn second_selector_falls_back_to_conflict_queue() {
        let fp = FileHandle::new(crate::file::tests_support::bare_object());
        let q1 = select_begin(&fp);
        assert!(core::ptr::eq(q1, fp.select_queue()));
        let q2 = select_begin(&fp);
        assert!(core::ptr::eq(q2, &SELECT_CONFLICT));
        assert!(fp.flags().contains(HandleFlags::SELCONFLICT));
        // The conflict selector leaving does not release the owner's set.
        select_end(&fp, &SELECT_CONFLICT);
        assert!(fp.flags().contains(HandleFlags::INSELECT));
        select_end(&fp, q1);
        assert!(!fp.flags().contains(HandleFlags::INSELECT));
    }

    #[test]
    fn drain_mark_interrupts_select() {
        let fp = FileHandle::new(crate::file::tests_support::bare_object());
        let queue = select_begin(&fp);
        let token = queue.prepare();
        fp.set_vflags(VFlags::DRAIN);
        queue.notify_all();
        assert_eq!(select_wait(&fp, queue, token), Err(Error::Interrupted));
        select_end(&fp, queue);
    }
}
