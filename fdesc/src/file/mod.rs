//! File objects
//!
//! A [`FileObject`] is the shared representation of one open-file instance:
//! type tag, operations vtable, status flags, offset cursor, owning
//! credential, and the opaque type-specific payload. Every descriptor that
//! duplicates the same open instance (dup, dup2, fork, fileport reimport)
//! points at the same object.
//!
//! The object carries its own strong reference count with explicit
//! release-was-last semantics: the last releaser runs the type-specific
//! close operation exactly once, see [`drop_ref`]. Handles additionally
//! hold an `Arc` so memory reclamation is never manual.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::any::Any;
use core::sync::atomic::{fence, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use spin::Mutex;

use crate::cred::Credential;
use crate::error::{Error, Result};
use crate::vnode::{LockOwner, Vnode, VnodeMeta};

pub mod handle;

pub use handle::{FileHandle, GuardAttrs, GuardedHandle, HandleFlags};

/// Actual number of open file objects, system-wide.
static NFILES: AtomicUsize = AtomicUsize::new(0);

/// System-wide open file limit.
static MAXFILES: AtomicUsize = AtomicUsize::new(usize::MAX);

/// File object identity source (also keys OFD-style lock ownership).
static NEXT_FG_ID: AtomicU64 = AtomicU64::new(1);

pub fn open_file_count() -> usize {
    NFILES.load(Ordering::Relaxed)
}

pub fn set_max_files(limit: usize) {
    MAXFILES.store(limit, Ordering::Relaxed);
}

pub fn max_files() -> usize {
    MAXFILES.load(Ordering::Relaxed)
}

/// ioctl: set/clear non-blocking I/O
pub const FIONBIO: u64 = 0x8004_667e;
/// ioctl: set/clear async I/O notification
pub const FIOASYNC: u64 = 0x8004_667d;

/// File object type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// Freshly allocated, not yet initialized
    Uninitialized,
    Vnode,
    Socket,
    Pipe,
    PosixShm,
    EventQueue,
    NetPolicy,
}

bitflags::bitflags! {
    /// Status flags (the open-mode half is fixed at initialization, the
    /// fcntl half is mutated atomically by F_SETFL).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileFlags: u32 {
        const READ        = 1 << 0;
        const WRITE       = 1 << 1;
        const NONBLOCK    = 1 << 2;
        const APPEND      = 1 << 3;
        const ASYNC       = 1 << 4;
        const EVENT_ONLY  = 1 << 5;
        const WAS_WRITTEN = 1 << 6;
        const WAS_LOCKED  = 1 << 7;
    }
}

impl FileFlags {
    /// The subset F_SETFL may change.
    pub const FCNTL_MASK: FileFlags = FileFlags::NONBLOCK
        .union(FileFlags::APPEND)
        .union(FileFlags::ASYNC);
}

bitflags::bitflags! {
    /// Lifetime flags, guarded by the object's own mutex so flag toggles
    /// never contend with the table lock.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LifeFlags: u32 {
        /// Never transferable across a trust boundary. One-way.
        const CONFINED    = 1 << 0;
        /// Holds an OFD-style advisory lock
        const HAS_OFDLOCK = 1 << 1;
        /// Was exported through a fileport at least once
        const PORTMADE    = 1 << 2;
        /// Suppress SIGPIPE-style delivery for this object
        const NOSIGPIPE   = 1 << 3;
    }
}

/// Snapshot returned by file-status queries
#[derive(Debug, Clone, Copy)]
pub struct FileStat {
    pub ftype: FileType,
    pub flags: FileFlags,
    pub offset: u64,
    pub meta: Option<VnodeMeta>,
}

/// Select dispatch selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectWhich {
    Read,
    Write,
    Except,
}

/// Opaque payload, keyed by the type tag stored alongside it.
pub enum FileData {
    /// Uninitialized
    None,
    /// Vnode-backed (regular files, directories, devices)
    Vnode(Arc<Vnode>),
    /// Payload owned by another subsystem (socket, pipe, shm, ...)
    Opaque(Box<dyn Any + Send + Sync>),
}

/// Type-specific operations.
///
/// Every operation has a "no" default returning a fixed error, so a file
/// type only implements what it supports and every call site can dispatch
/// unconditionally.
pub trait FileOps: Send + Sync {
    fn read(&self, _fg: &FileObject, _buf: &mut [u8]) -> Result<usize> {
        Err(Error::NoSuchDevice)
    }

    fn write(&self, _fg: &FileObject, _buf: &[u8]) -> Result<usize> {
        Err(Error::NoSuchDevice)
    }

    fn ioctl(&self, _fg: &FileObject, _cmd: u64, _arg: &mut u64) -> Result<()> {
        Err(Error::NotATty)
    }

    fn select(&self, _fg: &FileObject, _which: SelectWhich) -> Result<bool> {
        Err(Error::NotSupported)
    }

    /// Proactively unblock anyone parked inside this object's operations.
    /// Invoked repeatedly while a close drains concurrent users.
    fn drain(&self, _fg: &FileObject) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn kqfilter(&self, _fg: &FileObject, _ident: u64) -> Result<bool> {
        Err(Error::NotSupported)
    }

    /// Last-reference close. Runs exactly once per object.
    fn close(&self, _fg: &FileObject) -> Result<()> {
        Ok(())
    }
}

/// Operations installed at allocation time so `ops()` never dangles.
pub struct NullOps;

impl FileOps for NullOps {}

/// Shared open-file state (one per open instance)
pub struct FileObject {
    id: u64,
    ftype: FileType,
    ops: Box<dyn FileOps>,
    flag: AtomicU32,
    lflags: Mutex<LifeFlags>,
    offset: AtomicU64,
    cred: Arc<Credential>,
    data: FileData,
    /// Strong references from handles and exported ports.
    count: AtomicU32,
}

impl FileObject {
    /// Allocate a minimally initialized object: uninitialized type tag,
    /// null ops, no payload, one reference (the caller's).
    pub fn new(cred: Arc<Credential>) -> Self {
        NFILES.fetch_add(1, Ordering::Relaxed);
        Self {
            id: NEXT_FG_ID.fetch_add(1, Ordering::Relaxed),
            ftype: FileType::Uninitialized,
            ops: Box::new(NullOps),
            flag: AtomicU32::new(0),
            lflags: Mutex::new(LifeFlags::empty()),
            offset: AtomicU64::new(0),
            cred,
            data: FileData::None,
            count: AtomicU32::new(1),
        }
    }

    /// Install type tag, operations and payload. Only callable while the
    /// object is still exclusively owned (pre-publication).
    pub fn initialize(&mut self, ftype: FileType, ops: Box<dyn FileOps>, data: FileData) {
        debug_assert!(
            matches!(
                (ftype, &data),
                (FileType::Vnode, FileData::Vnode(_))
                    | (FileType::Uninitialized, FileData::None)
                    | (
                        FileType::Socket
                            | FileType::Pipe
                            | FileType::PosixShm
                            | FileType::EventQueue
                            | FileType::NetPolicy,
                        FileData::Opaque(_) | FileData::None
                    )
            ),
            "payload does not match type tag"
        );
        self.ftype = ftype;
        self.ops = ops;
        self.data = data;
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn ftype(&self) -> FileType {
        self.ftype
    }

    pub fn ops(&self) -> &dyn FileOps {
        &*self.ops
    }

    pub fn cred(&self) -> &Arc<Credential> {
        &self.cred
    }

    pub fn data(&self) -> &FileData {
        &self.data
    }

    /// Vnode payload, when the type tag says there is one.
    pub fn vnode(&self) -> Option<&Arc<Vnode>> {
        match &self.data {
            FileData::Vnode(vp) => Some(vp),
            _ => None,
        }
    }

    pub fn flags(&self) -> FileFlags {
        FileFlags::from_bits_truncate(self.flag.load(Ordering::Relaxed))
    }

    pub fn set_flags(&self, flags: FileFlags) {
        self.flag.fetch_or(flags.bits(), Ordering::Relaxed);
    }

    pub fn clear_flags(&self, flags: FileFlags) {
        self.flag.fetch_and(!flags.bits(), Ordering::Relaxed);
    }

    /// Replace the fcntl-settable subset, leaving open-mode bits alone.
    pub fn replace_fcntl_flags(&self, new: FileFlags) -> FileFlags {
        let masked = (new & FileFlags::FCNTL_MASK).bits();
        let mut cur = self.flag.load(Ordering::Relaxed);
        loop {
            let next = (cur & !FileFlags::FCNTL_MASK.bits()) | masked;
            match self.flag.compare_exchange_weak(cur, next, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return FileFlags::from_bits_truncate(next),
                Err(observed) => cur = observed,
            }
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::Relaxed)
    }

    pub fn set_offset(&self, off: u64) {
        self.offset.store(off, Ordering::Relaxed);
    }

    pub fn life_flags(&self) -> LifeFlags {
        *self.lflags.lock()
    }

    /// Confine the object: never again exportable or inheritable across a
    /// trust boundary. One-way by design; there is no clearing API.
    pub fn confine(&self) {
        self.lflags.lock().insert(LifeFlags::CONFINED);
    }

    pub fn is_confined(&self) -> bool {
        self.lflags.lock().contains(LifeFlags::CONFINED)
    }

    pub(crate) fn mark_portmade(&self) {
        self.lflags.lock().insert(LifeFlags::PORTMADE);
    }

    pub(crate) fn mark_ofd_lock(&self) {
        self.lflags.lock().insert(LifeFlags::HAS_OFDLOCK);
    }

    pub fn set_nosigpipe(&self, on: bool) {
        let mut lf = self.lflags.lock();
        if on {
            lf.insert(LifeFlags::NOSIGPIPE);
        } else {
            lf.remove(LifeFlags::NOSIGPIPE);
        }
    }

    /// May this object be exported as a transferable capability?
    pub fn sendable(&self) -> bool {
        match self.ftype {
            FileType::Vnode
            | FileType::Socket
            | FileType::Pipe
            | FileType::PosixShm
            | FileType::NetPolicy => !self.is_confined(),
            FileType::Uninitialized | FileType::EventQueue => false,
        }
    }

    /// Take a strong reference on behalf of a new handle or port.
    pub fn retain(&self) {
        let prev = self.count.fetch_add(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "retain on a dead file object");
    }

    pub fn ref_count(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Drop for FileObject {
    fn drop(&mut self) {
        NFILES.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Release one strong reference on `fg`.
///
/// POSIX advisory-lock semantics dictate that any release performed by a
/// process holding POSIX locks drops all of that process's locks on the
/// underlying vnode first, which is why callers pass their lock owner in.
/// If this was the last reference, open-file-description locks are released
/// and the type-specific close operation runs, exactly once.
pub fn drop_ref(fg: &Arc<FileObject>, posix_unlock: Option<LockOwner>) -> Result<()> {
    if let (Some(owner), Some(vp)) = (posix_unlock, fg.vnode()) {
        if !vp.is_dead() {
            vp.lock_clear_all(owner);
        }
    }

    if fg.count.fetch_sub(1, Ordering::Release) != 1 {
        return Ok(());
    }
    fence(Ordering::Acquire);

    if let Some(vp) = fg.vnode() {
        let lf = fg.life_flags();
        if lf.contains(LifeFlags::HAS_OFDLOCK) || fg.flags().contains(FileFlags::WAS_LOCKED) {
            vp.lock_clear_all(LockOwner::OpenFile(fg.id()));
        }
    }

    // ops is always initialized, dispatch unconditionally
    fg.ops().close(fg)
}
