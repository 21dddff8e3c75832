//! Descriptor inheritance across fork and exec.

use std::sync::Arc;

use fdesc::file::{FileData, FileObject};
use fdesc::proc::Process;
use fdesc::{
    Credential, Error, FileFlags, FileOps, FileType, HandleFlags, PermitAll, Result,
    SecurityPolicy, SlotKind, Vnode, VnodeMeta,
};

struct PlainOps;
impl FileOps for PlainOps {}

fn new_proc(pid: u32) -> Process {
    Process::new(pid, Arc::new(Credential::default()), Arc::new(PermitAll), 256)
}

fn open_flags(p: &Process, flags: HandleFlags) -> usize {
    p.open_with(flags, |fg| {
        fg.initialize(FileType::Pipe, Box::new(PlainOps), FileData::None);
        fg.set_flags(FileFlags::READ);
        Ok(())
    })
    .unwrap()
}

#[test]
fn fork_inherits_all_but_marked_and_confined() {
    let p = new_proc(1);
    // N = 9 descriptors: M = 3 close-on-fork, K = 2 confined.
    let n = 9;
    let mut fds = Vec::new();
    for i in 0..n {
        let flags = if i % 3 == 1 {
            HandleFlags::CLOFORK
        } else {
            HandleFlags::empty()
        };
        fds.push(open_flags(&p, flags));
    }
    p.confine(fds[0]).unwrap();
    p.confine(fds[6]).unwrap();

    let child = p.fork(2).unwrap();
    assert_eq!(child.table().open_count(), n - 3 - 2);
    // The parent's table is untouched.
    assert_eq!(p.table().open_count(), n);
    assert_eq!(child.table().slot_kind(fds[0]), SlotKind::Empty);
    assert_eq!(child.table().slot_kind(fds[2]), SlotKind::Occupied);
}

#[test]
fn exec_applies_cloexec_and_default_close() {
    let p = new_proc(3);
    let inherited = open_flags(&p, HandleFlags::empty());
    let cloexec = open_flags(&p, HandleFlags::CLOEXEC);
    let marked = open_flags(&p, HandleFlags::empty());
    p.table().mark_inherit(marked, true).unwrap();

    // Default-close image: only the inherit-marked entry survives.
    let strict = p.exec(4, true).unwrap();
    assert_eq!(strict.table().slot_kind(inherited), SlotKind::Empty);
    assert_eq!(strict.table().slot_kind(cloexec), SlotKind::Empty);
    assert_eq!(strict.table().slot_kind(marked), SlotKind::Occupied);

    // Permissive image: everything but close-on-exec survives.
    let lax = p.exec(5, false).unwrap();
    assert_eq!(lax.table().slot_kind(inherited), SlotKind::Occupied);
    assert_eq!(lax.table().slot_kind(cloexec), SlotKind::Empty);
    assert_eq!(lax.table().slot_kind(marked), SlotKind::Occupied);
}

#[test]
fn policy_veto_closes_on_exec() {
    struct VetoSockets;
    impl SecurityPolicy for VetoSockets {
        fn check_inherit(&self, _cred: &Credential, fg: &FileObject) -> Result<()> {
            if fg.ftype() == FileType::Socket {
                Err(Error::PermissionDenied)
            } else {
                Ok(())
            }
        }
    }
    let p = Process::new(6, Arc::new(Credential::default()), Arc::new(VetoSockets), 256);
    let pipe = open_flags(&p, HandleFlags::empty());
    let sock = p
        .open_with(HandleFlags::empty(), |fg| {
            fg.initialize(FileType::Socket, Box::new(PlainOps), FileData::None);
            Ok(())
        })
        .unwrap();
    let execed = p.exec(7, false).unwrap();
    assert_eq!(execed.table().slot_kind(pipe), SlotKind::Occupied);
    assert_eq!(execed.table().slot_kind(sock), SlotKind::Empty);
}

#[test]
fn dead_root_blocks_fork() {
    let p = new_proc(8);
    let root = Vnode::new(1, VnodeMeta::default());
    p.chroot(&root).unwrap();
    assert!(p.fork(9).is_ok());
    root.make_dead();
    assert!(matches!(p.fork(10), Err(Error::PermissionDenied)));
}

#[test]
fn fork_reref_cwd_or_detach() {
    let p = new_proc(11);
    let cwd = Vnode::new(2, VnodeMeta::default());
    p.set_cwd(&cwd).unwrap();
    let child = p.fork(12).unwrap();
    assert!(child.table().dirs().read().cwd.is_some());
    cwd.make_dead();
    let orphan = p.fork(13).unwrap();
    assert!(orphan.table().dirs().read().cwd.is_none());
}

#[test]
fn fork_then_independent_tables() {
    let p = new_proc(14);
    let fd = open_flags(&p, HandleFlags::empty());
    let child = p.fork(15).unwrap();
    // Closing in the child leaves the parent's descriptor alive.
    child.close(fd).unwrap();
    assert_eq!(child.table().slot_kind(fd), SlotKind::Empty);
    assert_eq!(p.table().slot_kind(fd), SlotKind::Occupied);
    // And vice versa for fresh opens.
    let next = open_flags(&child, HandleFlags::empty());
    assert_eq!(next, fd);
    assert_eq!(p.table().open_count(), 1);
}
