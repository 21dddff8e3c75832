//! Per-descriptor handles
//!
//! A [`FileHandle`] is the per-slot view of a shared [`FileObject`]: it
//! carries the flags that belong to one descriptor (close-on-exec and
//! friends), the optional close guard, and the in-use count that lets a
//! close wait out concurrent I/O instead of yanking state from under it.
//!
//! The in-use count starts at 1; that baseline reference belongs to the
//! table slot itself. Each operation pins the handle before dropping the
//! table lock and unpins afterwards, so a count above 1 means someone is
//! inside an operation right now.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

use crate::error::{Error, Result};
use crate::file::FileObject;
use crate::sync::WaitQueue;

bitflags::bitflags! {
    /// Per-descriptor flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HandleFlags: u32 {
        /// Close on exec
        const CLOEXEC     = 1 << 0;
        /// Do not copy into a forked child
        const CLOFORK     = 1 << 1;
        /// A thread is selecting on this handle
        const INSELECT    = 1 << 2;
        /// Multiple selectors collided on the wait set
        const SELCONFLICT = 1 << 3;
        /// Async I/O was issued through this descriptor
        const AIOISSUED   = 1 << 4;
    }
}

bitflags::bitflags! {
    /// Volatile flags, never copied by dup or fork
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VFlags: u32 {
        /// A close is draining this handle
        const DRAIN = 1 << 0;
    }
}

bitflags::bitflags! {
    /// Operations a guard forbids on its descriptor
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GuardAttrs: u32 {
        const CLOSE      = 1 << 0;
        const DUP        = 1 << 1;
        const FILEPORT   = 1 << 2;
        /// Forbid clearing close-on-exec
        const NOCLOEXEC  = 1 << 3;
    }
}

/// Guard installed on a descriptor; operations it names fail until the
/// holder removes it with the matching identifier.
#[derive(Debug, Clone, Copy)]
pub struct GuardedHandle {
    pub id: u64,
    pub attrs: GuardAttrs,
}

/// Per-descriptor state referencing a shared file object
pub struct FileHandle {
    glob: Arc<FileObject>,
    flags: AtomicU32,
    vflags: AtomicU32,
    guard: Mutex<Option<GuardedHandle>>,
    /// 1 == only the table slot references this handle
    iocount: AtomicU32,
    /// Ownership marker for the select wait set
    wset: Mutex<Option<()>>,
    select_wait: WaitQueue,
}

impl FileHandle {
    pub fn new(glob: Arc<FileObject>) -> Arc<Self> {
        Self::with_flags(glob, HandleFlags::empty())
    }

    pub fn with_flags(glob: Arc<FileObject>, flags: HandleFlags) -> Arc<Self> {
        Arc::new(Self {
            glob,
            flags: AtomicU32::new(flags.bits()),
            vflags: AtomicU32::new(0),
            guard: Mutex::new(None),
            iocount: AtomicU32::new(1),
            wset: Mutex::new(None),
            select_wait: WaitQueue::new(),
        })
    }

    pub fn object(&self) -> &Arc<FileObject> {
        &self.glob
    }

    pub fn flags(&self) -> HandleFlags {
        HandleFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed))
    }

    pub fn set_flags(&self, flags: HandleFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::Relaxed);
    }

    pub fn clear_flags(&self, flags: HandleFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::Relaxed);
    }

    pub fn vflags(&self) -> VFlags {
        VFlags::from_bits_truncate(self.vflags.load(Ordering::Acquire))
    }

    pub fn set_vflags(&self, flags: VFlags) {
        self.vflags.fetch_or(flags.bits(), Ordering::Release);
    }

    /// Take an in-use reference. Callers hold the table lock when pinning.
    pub fn pin(&self) {
        let prev = self.iocount.fetch_add(1, Ordering::Acquire);
        debug_assert!(prev >= 1, "pin on a freed handle");
    }

    /// Drop an in-use reference. Returns the count after the drop so the
    /// caller can wake a draining closer when it reaches the baseline.
    pub fn unpin(&self) -> u32 {
        let prev = self.iocount.fetch_sub(1, Ordering::Release);
        assert!(prev >= 1, "unpin without a matching pin");
        prev - 1
    }

    pub fn iocount(&self) -> u32 {
        self.iocount.load(Ordering::Acquire)
    }

    pub(crate) fn wset(&self) -> &Mutex<Option<()>> {
        &self.wset
    }

    pub fn select_queue(&self) -> &WaitQueue {
        &self.select_wait
    }

    pub fn guard(&self) -> Option<GuardedHandle> {
        *self.guard.lock()
    }

    /// Install a guard on an unguarded handle.
    pub fn set_guard(&self, guard: GuardedHandle) -> Result<()> {
        let mut slot = self.guard.lock();
        if slot.is_some() {
            return Err(Error::InvalidArgument);
        }
        *slot = Some(guard);
        Ok(())
    }

    /// Remove a guard; the identifier must match the one that installed it.
    pub fn clear_guard(&self, id: u64) -> Result<()> {
        let mut slot = self.guard.lock();
        match *slot {
            Some(g) if g.id == id => {
                *slot = None;
                Ok(())
            }
            _ => Err(Error::InvalidArgument),
        }
    }

    /// Does a guard forbid any of `attrs` on this descriptor?
    pub fn is_guarded(&self, attrs: GuardAttrs) -> bool {
        self.guard
            .lock()
            .map_or(false, |g| g.attrs.intersects(attrs))
    }
}
