//! Process-level descriptor operations
//!
//! A [`Process`] ties a descriptor table to an identity: the pid that owns
//! POSIX advisory locks, the credential stamped onto new file objects, and
//! the security policy consulted at every decision point. The methods here
//! are the syscall-shaped surface; they do the guard and policy checks and
//! the lock choreography, then lean on the table engine for the slot
//! mechanics.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::cred::Credential;
use crate::error::{Error, Result};
use crate::events;
use crate::file::handle::{FileHandle, GuardAttrs, GuardedHandle, HandleFlags};
use crate::file::{self, FileFlags, FileObject, FileStat, FileType, SelectWhich, FIOASYNC, FIONBIO};
use crate::policy::SecurityPolicy;
use crate::port::FileportSpace;
use crate::table::{FdTable, SlotKind};
use crate::vnode::{LockConflict, LockOwner, LockRange, LockWait, Vnode};

/// fcntl command numbers, used to identify the operation to policy hooks.
pub mod cmd {
    pub const F_DUPFD: u64 = 0;
    pub const F_GETFD: u64 = 1;
    pub const F_SETFD: u64 = 2;
    pub const F_GETFL: u64 = 3;
    pub const F_SETFL: u64 = 4;
    pub const F_GETLK: u64 = 7;
    pub const F_SETLK: u64 = 8;
    pub const F_SETLKW: u64 = 9;
    pub const F_DUPFD_CLOEXEC: u64 = 67;
    pub const F_OFD_SETLK: u64 = 90;
    pub const F_OFD_SETLKW: u64 = 91;
    pub const F_OFD_GETLK: u64 = 92;
}

/// flock-style whole-file lock request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlockOp {
    Shared,
    Exclusive,
    Unlock,
}

/// A process as the descriptor engine sees it
pub struct Process {
    pid: u32,
    cred: Arc<Credential>,
    policy: Arc<dyn SecurityPolicy>,
    fd: FdTable,
    /// Set once this process takes a POSIX advisory lock; a set flag makes
    /// every close sweep the process's locks off the vnode.
    ladvlock: AtomicBool,
}

impl Process {
    pub fn new(
        pid: u32,
        cred: Arc<Credential>,
        policy: Arc<dyn SecurityPolicy>,
        limit: usize,
    ) -> Self {
        Self {
            pid,
            cred,
            policy,
            fd: FdTable::new(limit),
            ladvlock: AtomicBool::new(false),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn cred(&self) -> &Arc<Credential> {
        &self.cred
    }

    pub fn table(&self) -> &FdTable {
        &self.fd
    }

    fn posix_owner(&self) -> Option<LockOwner> {
        if self.ladvlock.load(Ordering::Relaxed) {
            Some(LockOwner::Process(self.pid))
        } else {
            None
        }
    }

    /// Allocate a descriptor and a fresh file object in one motion.
    ///
    /// The slot is reserved first, then the object is built by `init` with
    /// the table unlocked, then the pair is published. On any failure the
    /// reservation is returned and the table is untouched.
    pub fn open_with<F>(&self, hflags: HandleFlags, init: F) -> Result<usize>
    where
        F: FnOnce(&mut FileObject) -> Result<()>,
    {
        self.policy.check_create(&self.cred)?;
        if file::open_file_count() >= file::max_files() {
            log::warn!("open: system file table is full");
            return Err(Error::FileTableFull);
        }

        let st = self.fd.lock();
        let (st, r) = self.fd.fdalloc(st, 0);
        let fd = r?;
        drop(st);

        let mut fg = FileObject::new(Arc::clone(&self.cred));
        if let Err(e) = init(&mut fg) {
            let mut st = self.fd.lock();
            self.fd.fdrelse(&mut st, fd);
            return Err(e);
        }
        let fp = FileHandle::with_flags(Arc::new(fg), hflags);

        let mut st = self.fd.lock();
        self.fd.publish(&mut st, fd, fp);
        Ok(fd)
    }

    /// dup: lowest free descriptor, close-on-exec cleared on the copy.
    pub fn dup(&self, old: usize) -> Result<usize> {
        let st = self.fd.lock();
        let fp = Arc::clone(self.fd.fp_get_noref(&st, old)?);
        fp.pin();
        if fp.is_guarded(GuardAttrs::DUP) {
            let mut st = st;
            self.fd.fp_drop_locked(&mut st, &fp);
            return Err(Error::PermissionDenied);
        }
        let (mut st, r) = self.fd.fdalloc(st, 0);
        let new = match r {
            Ok(new) => new,
            Err(e) => {
                self.fd.fp_drop_locked(&mut st, &fp);
                return Err(e);
            }
        };
        let (mut st, r) =
            self.fd
                .finishdup(st, &self.cred, &*self.policy, old, new, HandleFlags::empty());
        self.fd.fp_drop_locked(&mut st, &fp);
        r
    }

    /// F_DUPFD / F_DUPFD_CLOEXEC: lowest free descriptor at or above `min`.
    pub fn dup_min(&self, old: usize, min: usize, cloexec: bool) -> Result<usize> {
        if min >= self.fd.limit() {
            return Err(Error::InvalidArgument);
        }
        let st = self.fd.lock();
        let fp = Arc::clone(self.fd.fp_get_noref(&st, old)?);
        fp.pin();
        if fp.is_guarded(GuardAttrs::DUP) {
            let mut st = st;
            self.fd.fp_drop_locked(&mut st, &fp);
            return Err(Error::PermissionDenied);
        }
        let (mut st, r) = self.fd.fdalloc(st, min);
        let new = match r {
            Ok(new) => new,
            Err(e) => {
                self.fd.fp_drop_locked(&mut st, &fp);
                return Err(e);
            }
        };
        let flags = if cloexec {
            HandleFlags::CLOEXEC
        } else {
            HandleFlags::empty()
        };
        let (mut st, r) = self
            .fd
            .finishdup(st, &self.cred, &*self.policy, old, new, flags);
        self.fd.fp_drop_locked(&mut st, &fp);
        r
    }

    /// dup2: duplicate `old` onto the exact descriptor `new`, closing
    /// whatever lives there first.
    ///
    /// The target can be in motion (reserved by another allocation, or
    /// mid-close), so the whole acquisition restarts from scratch after
    /// every wait. `old == new` is a validity check and nothing more.
    pub fn dup2(&self, old: usize, new: usize) -> Result<usize> {
        let mut st = self.fd.lock();
        loop {
            let fp = Arc::clone(self.fd.fp_get_noref(&st, old)?);
            fp.pin();
            if fp.is_guarded(GuardAttrs::DUP) {
                self.fd.fp_drop_locked(&mut st, &fp);
                return Err(Error::PermissionDenied);
            }
            if new >= self.fd.limit() {
                self.fd.fp_drop_locked(&mut st, &fp);
                return Err(Error::BadFileDescriptor);
            }
            if old == new {
                self.fd.fp_drop_locked(&mut st, &fp);
                return Ok(new);
            }

            // Acquire the target index as a reservation.
            let mut reserved = false;
            if new >= st.slots.len() {
                let (st2, r) = self.fd.fdalloc(st, new);
                st = st2;
                match r {
                    Err(e) => {
                        self.fd.fp_drop_locked(&mut st, &fp);
                        return Err(e);
                    }
                    Ok(i) if i == new => reserved = true,
                    Ok(i) => self.fd.fdrelse(&mut st, i),
                }
            }
            if !reserved {
                match st.slots[new].kind() {
                    SlotKind::Reserved | SlotKind::Closing => {
                        // Someone else owns the index right now; wait for
                        // it to settle and start over.
                        self.fd.fp_drop_locked(&mut st, &fp);
                        st = self.fd.waitfd(st, new);
                        continue;
                    }
                    SlotKind::Occupied => {
                        let nfp = self.fd.fp_get_noref(&st, new)?;
                        if nfp.is_guarded(GuardAttrs::CLOSE) {
                            self.fd.fp_drop_locked(&mut st, &fp);
                            return Err(Error::PermissionDenied);
                        }
                        // Close the incumbent, keeping the index reserved
                        // for us across the drain.
                        if let Err(e) = self.fd.close_and_unlock(
                            st,
                            &self.cred,
                            &*self.policy,
                            new,
                            true,
                            self.posix_owner(),
                        ) {
                            log::warn!("dup2: close of descriptor {} failed: {}", new, e);
                        }
                        st = self.fd.lock();
                        debug_assert_eq!(st.slots[new].kind(), SlotKind::Reserved);
                    }
                    SlotKind::Empty => self.fd.reservefd(&mut st, new),
                }
            }

            let (mut st2, r) =
                self.fd
                    .finishdup(st, &self.cred, &*self.policy, old, new, HandleFlags::empty());
            self.fd.fp_drop_locked(&mut st2, &fp);
            return r;
        }
    }

    /// close: two-phase, waits out concurrent users of the descriptor.
    pub fn close(&self, fd: usize) -> Result<()> {
        self.fd
            .close_fd(&self.cred, &*self.policy, fd, self.posix_owner())
    }

    /// F_GETFD
    pub fn fd_flags(&self, fd: usize) -> Result<HandleFlags> {
        let st = self.fd.lock();
        let fp = self.fd.fp_get_noref(&st, fd)?;
        Ok(fp.flags() & (HandleFlags::CLOEXEC | HandleFlags::CLOFORK))
    }

    /// F_SETFD: replace the close-on-exec and close-on-fork marks.
    pub fn set_fd_flags(&self, fd: usize, flags: HandleFlags) -> Result<()> {
        let st = self.fd.lock();
        let fp = self.fd.fp_get_noref(&st, fd)?;
        self.policy
            .check_fcntl(&self.cred, fp.object(), cmd::F_SETFD)?;
        if !flags.contains(HandleFlags::CLOEXEC) && fp.is_guarded(GuardAttrs::NOCLOEXEC) {
            return Err(Error::PermissionDenied);
        }
        let marks = HandleFlags::CLOEXEC | HandleFlags::CLOFORK;
        fp.clear_flags(marks);
        fp.set_flags(flags & marks);
        Ok(())
    }

    /// F_GETFL
    pub fn status_flags(&self, fd: usize) -> Result<FileFlags> {
        let st = self.fd.lock();
        let fp = self.fd.fp_get_noref(&st, fd)?;
        Ok(fp.object().flags())
    }

    /// F_SETFL: replace the fcntl-settable status flags, pushing the
    /// non-blocking and async marks down to the object.
    ///
    /// The object is told about both marks via its control operation; if
    /// either push fails the flag word is restored, including undoing a
    /// non-blocking change that had already been applied.
    pub fn set_status_flags(&self, fd: usize, new: FileFlags) -> Result<()> {
        let fp = self.fd.fp_lookup(fd)?;
        let r = self.set_status_flags_inner(&fp, new);
        self.fd.fp_drop(fd, &fp);
        r
    }

    fn set_status_flags_inner(&self, fp: &Arc<FileHandle>, new: FileFlags) -> Result<()> {
        let fg = fp.object();
        self.policy.check_fcntl(&self.cred, fg, cmd::F_SETFL)?;
        let prev = fg.flags();
        let applied = fg.replace_fcntl_flags(new);

        let mut nb = u64::from(applied.contains(FileFlags::NONBLOCK));
        if let Err(e) = fg.ops().ioctl(fg, FIONBIO, &mut nb) {
            fg.replace_fcntl_flags(prev);
            return Err(e);
        }
        let mut asy = u64::from(applied.contains(FileFlags::ASYNC));
        if let Err(e) = fg.ops().ioctl(fg, FIOASYNC, &mut asy) {
            let mut undo = u64::from(prev.contains(FileFlags::NONBLOCK));
            let _ = fg.ops().ioctl(fg, FIONBIO, &mut undo);
            fg.replace_fcntl_flags(prev);
            return Err(e);
        }
        Ok(())
    }

    /// fcntl commands without a dedicated entry point go straight to the
    /// object's control operation, policy hook first.
    pub fn fcntl_passthrough(&self, fd: usize, cmd: u64, arg: &mut u64) -> Result<()> {
        let fp = self.fd.fp_lookup(fd)?;
        let fg = fp.object();
        let r = self
            .policy
            .check_fcntl(&self.cred, fg, cmd)
            .and_then(|()| fg.ops().ioctl(fg, cmd, arg));
        self.fd.fp_drop(fd, &fp);
        r
    }

    /// Dispatch a control operation, table unlocked for the duration.
    pub fn ioctl(&self, fd: usize, cmd: u64, arg: &mut u64) -> Result<()> {
        let fp = self.fd.fp_lookup(fd)?;
        let fg = fp.object();
        let r = fg.ops().ioctl(fg, cmd, arg);
        if r.is_ok() {
            // Keep the cached status flags coherent with the object.
            match cmd {
                FIONBIO if *arg != 0 => fg.set_flags(FileFlags::NONBLOCK),
                FIONBIO => fg.clear_flags(FileFlags::NONBLOCK),
                FIOASYNC if *arg != 0 => fg.set_flags(FileFlags::ASYNC),
                FIOASYNC => fg.clear_flags(FileFlags::ASYNC),
                _ => {}
            }
        }
        self.fd.fp_drop(fd, &fp);
        r
    }

    pub fn read(&self, fd: usize, buf: &mut [u8]) -> Result<usize> {
        let fp = self.fd.fp_lookup(fd)?;
        let fg = fp.object();
        let r = if fg.flags().contains(FileFlags::READ) {
            fg.ops().read(fg, buf)
        } else {
            Err(Error::BadFileDescriptor)
        };
        self.fd.fp_drop(fd, &fp);
        r
    }

    pub fn write(&self, fd: usize, buf: &[u8]) -> Result<usize> {
        let fp = self.fd.fp_lookup(fd)?;
        let fg = fp.object();
        let r = if fg.flags().contains(FileFlags::WRITE) {
            let r = fg.ops().write(fg, buf);
            if r.is_ok() {
                fg.set_flags(FileFlags::WAS_WRITTEN);
            }
            r
        } else {
            Err(Error::BadFileDescriptor)
        };
        self.fd.fp_drop(fd, &fp);
        r
    }

    pub fn fstat(&self, fd: usize) -> Result<FileStat> {
        let fp = self.fd.fp_lookup(fd)?;
        let fg = fp.object();
        let stat = FileStat {
            ftype: fg.ftype(),
            flags: fg.flags(),
            offset: fg.offset(),
            meta: fg.vnode().map(|vp| vp.meta()),
        };
        self.fd.fp_drop(fd, &fp);
        Ok(stat)
    }

    /// Park until the object reports readiness for `which`. A close racing
    /// this select interrupts it.
    pub fn select(&self, fd: usize, which: SelectWhich) -> Result<bool> {
        let fp = self.fd.fp_lookup(fd)?;
        let queue = events::select_begin(&fp);
        let r = loop {
            let token = queue.prepare();
            match fp.object().ops().select(fp.object(), which) {
                Ok(true) => break Ok(true),
                Ok(false) => {
                    if let Err(e) = events::select_wait(&fp, queue, token) {
                        break Err(e);
                    }
                }
                Err(e) => break Err(e),
            }
        };
        events::select_end(&fp, queue);
        self.fd.fp_drop(fd, &fp);
        r
    }

    fn locked_vnode(&self, fp: &Arc<FileHandle>) -> Result<Arc<Vnode>> {
        match fp.object().vnode() {
            Some(vp) if !vp.is_dead() => Ok(Arc::clone(vp)),
            _ => Err(Error::BadFileDescriptor),
        }
    }

    fn range_owner(&self, fg: &FileObject, ofd: bool) -> LockOwner {
        if ofd {
            LockOwner::OpenFile(fg.id())
        } else {
            LockOwner::Process(self.pid)
        }
    }

    /// F_SETLK / F_SETLKW and their OFD variants.
    pub fn lock_range(
        &self,
        fd: usize,
        range: LockRange,
        exclusive: bool,
        wait: LockWait,
        ofd: bool,
    ) -> Result<()> {
        let fp = self.fd.fp_lookup(fd)?;
        let r = (|| {
            let vp = self.locked_vnode(&fp)?;
            let fg = fp.object();
            self.policy.check_lock(&self.cred, fg, range, exclusive)?;
            let owner = self.range_owner(fg, ofd);
            vp.lock_set(owner, range, exclusive, wait)?;
            if ofd {
                fg.mark_ofd_lock();
            } else {
                self.ladvlock.store(true, Ordering::Relaxed);
            }
            Ok(())
        })();
        self.fd.fp_drop(fd, &fp);
        r
    }

    /// F_UNLCK over `range`.
    pub fn unlock_range(&self, fd: usize, range: LockRange, ofd: bool) -> Result<()> {
        let fp = self.fd.fp_lookup(fd)?;
        let r = (|| {
            let vp = self.locked_vnode(&fp)?;
            let owner = self.range_owner(fp.object(), ofd);
            vp.lock_clear(owner, range);
            Ok(())
        })();
        self.fd.fp_drop(fd, &fp);
        r
    }

    /// F_GETLK: report the first conflicting lock, if any.
    pub fn test_range(
        &self,
        fd: usize,
        range: LockRange,
        exclusive: bool,
        ofd: bool,
    ) -> Result<Option<LockConflict>> {
        let fp = self.fd.fp_lookup(fd)?;
        let r = (|| {
            let vp = self.locked_vnode(&fp)?;
            let owner = self.range_owner(fp.object(), ofd);
            Ok(vp.lock_test(owner, range, exclusive))
        })();
        self.fd.fp_drop(fd, &fp);
        r
    }

    /// flock: whole-file lock owned by the open-file-description, so it
    /// rides along with dup and fork.
    pub fn flock(&self, fd: usize, op: FlockOp, nonblocking: bool) -> Result<()> {
        let fp = self.fd.fp_lookup(fd)?;
        let r = (|| {
            let vp = self.locked_vnode(&fp)?;
            let fg = fp.object();
            let owner = LockOwner::OpenFile(fg.id());
            match op {
                FlockOp::Unlock => {
                    vp.lock_clear(owner, LockRange::WHOLE);
                    fg.clear_flags(FileFlags::WAS_LOCKED);
                    Ok(())
                }
                FlockOp::Shared | FlockOp::Exclusive => {
                    let exclusive = op == FlockOp::Exclusive;
                    self.policy
                        .check_lock(&self.cred, fg, LockRange::WHOLE, exclusive)?;
                    let wait = if nonblocking {
                        LockWait::NonBlocking
                    } else {
                        LockWait::Blocking
                    };
                    vp.lock_set(owner, LockRange::WHOLE, exclusive, wait)?;
                    fg.set_flags(FileFlags::WAS_LOCKED);
                    Ok(())
                }
            }
        })();
        self.fd.fp_drop(fd, &fp);
        r
    }

    /// Install a close/dup/export guard on an unguarded descriptor.
    /// Guarding forces close-on-exec when the guard forbids clearing it.
    pub fn guard_fd(&self, fd: usize, guard: GuardedHandle) -> Result<()> {
        let st = self.fd.lock();
        let fp = self.fd.fp_get_noref(&st, fd)?;
        fp.set_guard(guard)?;
        if guard.attrs.contains(GuardAttrs::NOCLOEXEC) {
            fp.set_flags(HandleFlags::CLOEXEC);
        }
        Ok(())
    }

    pub fn unguard_fd(&self, fd: usize, id: u64) -> Result<()> {
        let st = self.fd.lock();
        let fp = self.fd.fp_get_noref(&st, fd)?;
        fp.clear_guard(id)
    }

    /// Confine the file object behind `fd`: it will never again cross a
    /// fork, exec inheritance, or fileport export. Irreversible.
    pub fn confine(&self, fd: usize) -> Result<()> {
        let st = self.fd.lock();
        let fp = self.fd.fp_get_noref(&st, fd)?;
        fp.object().confine();
        Ok(())
    }

    /// Export `fd`'s file object as a fileport capability.
    pub fn fileport_makeport(&self, fd: usize, space: &FileportSpace) -> Result<u32> {
        let st = self.fd.lock();
        let fp = self.fd.fp_get_noref(&st, fd)?;
        if fp.is_guarded(GuardAttrs::FILEPORT) {
            return Err(Error::PermissionDenied);
        }
        let fg = Arc::clone(fp.object());
        if !fg.sendable() {
            return Err(Error::InvalidArgument);
        }
        fg.retain();
        fg.mark_portmade();
        drop(st);
        Ok(space.install(fg))
    }

    /// Redeem a fileport into a fresh descriptor. The import lands with
    /// close-on-exec set; the receiver opts in to inheritance explicitly.
    pub fn fileport_makefd(&self, space: &FileportSpace, name: u32) -> Result<usize> {
        let fg = space.take(name)?;
        let st = self.fd.lock();
        let (st, r) = self.fd.fdalloc(st, 0);
        let fd = match r {
            Ok(fd) => fd,
            Err(e) => {
                drop(st);
                // Hand the donated reference back to its object.
                let _ = file::drop_ref(&fg, None);
                return Err(e);
            }
        };
        drop(st);
        let fp = FileHandle::with_flags(fg, HandleFlags::CLOEXEC);
        let mut st = self.fd.lock();
        self.fd.publish(&mut st, fd, fp);
        Ok(fd)
    }

    /// Attach a kevent-style filter registration to `fd`.
    pub fn knote_attach(&self, fd: usize, ident: u64) -> Result<()> {
        let st = self.fd.lock();
        self.fd.fp_get_noref(&st, fd)?;
        self.fd.knotes().lock().attach(fd, ident);
        Ok(())
    }

    pub fn knote_detach(&self, fd: usize, ident: u64) -> bool {
        self.fd.knotes().lock().detach(fd, ident)
    }

    pub fn set_cwd(&self, vp: &Arc<Vnode>) -> Result<()> {
        let vp = vp.try_ref().ok_or(Error::BadFileDescriptor)?;
        self.fd.dirs().write().cwd = Some(vp);
        Ok(())
    }

    pub fn chroot(&self, vp: &Arc<Vnode>) -> Result<()> {
        let vp = vp.try_ref().ok_or(Error::BadFileDescriptor)?;
        self.fd.dirs().write().root = Some(vp);
        Ok(())
    }

    /// fork: the child inherits every descriptor except confined,
    /// close-on-fork and in-flux entries.
    pub fn fork(&self, child_pid: u32) -> Result<Process> {
        let fd = self.fd.fork_table(false)?;
        Ok(Process {
            pid: child_pid,
            cred: Arc::clone(&self.cred),
            policy: Arc::clone(&self.policy),
            fd,
            ladvlock: AtomicBool::new(false),
        })
    }

    /// exec: build the post-exec image of this process.
    ///
    /// Close-on-exec and policy-vetoed entries are dropped; surviving
    /// vnode entries carry their POSIX locks over to the new image's
    /// identity.
    pub fn exec(&self, new_pid: u32, cloexec_default: bool) -> Result<Process> {
        let fd = self.fd.fork_table(true)?;
        fd.exec_reshape(
            &self.cred,
            &*self.policy,
            cloexec_default,
            LockOwner::Process(self.pid),
            LockOwner::Process(new_pid),
        )?;
        Ok(Process {
            pid: new_pid,
            cred: Arc::clone(&self.cred),
            policy: Arc::clone(&self.policy),
            fd,
            ladvlock: AtomicBool::new(self.ladvlock.load(Ordering::Relaxed)),
        })
    }

    /// Process exit: close everything, releasing this process's POSIX
    /// locks along the way.
    pub fn exit(&self) -> Result<()> {
        self.fd
            .invalidate(&self.cred, &*self.policy, self.posix_owner())
    }
}
