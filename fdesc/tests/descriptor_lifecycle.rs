//! End-to-end descriptor lifecycle scenarios against a single process.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use fdesc::file::{FileData, FileObject};
use fdesc::proc::Process;
use fdesc::{
    Credential, Error, FileFlags, FileOps, FileType, HandleFlags, PermitAll, Result,
};

struct CountingOps {
    closes: Arc<AtomicUsize>,
}

impl FileOps for CountingOps {
    fn read(&self, _fg: &FileObject, buf: &mut [u8]) -> Result<usize> {
        Ok(buf.len())
    }

    fn close(&self, _fg: &FileObject) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn new_proc(limit: usize) -> Process {
    Process::new(500, Arc::new(Credential::default()), Arc::new(PermitAll), limit)
}

fn open_counted(p: &Process, closes: &Arc<AtomicUsize>) -> usize {
    let closes = Arc::clone(closes);
    p.open_with(HandleFlags::empty(), move |fg| {
        fg.initialize(FileType::Pipe, Box::new(CountingOps { closes }), FileData::None);
        fg.set_flags(FileFlags::READ | FileFlags::WRITE);
        Ok(())
    })
    .unwrap()
}

#[test]
fn three_slot_scenario() {
    let closes = Arc::new(AtomicUsize::new(0));
    let p = new_proc(64);

    // Three opens land on 0, 1, 2.
    let fds: Vec<usize> = (0..3).map(|_| open_counted(&p, &closes)).collect();
    assert_eq!(fds, [0, 1, 2]);

    // Closing the middle one frees exactly that index, and the next open
    // reuses it.
    p.close(1).unwrap();
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert_eq!(open_counted(&p, &closes), 1);

    // dup2 onto a distant target extends the table.
    assert_eq!(p.dup2(0, 5).unwrap(), 5);
    assert_eq!(p.table().afterlast(), 6);

    // Closing the original leaves the duplicate fully usable.
    p.close(0).unwrap();
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert_eq!(p.read(5, &mut [0u8; 8]).unwrap(), 8);
    assert!(matches!(p.read(0, &mut [0u8; 8]), Err(Error::BadFileDescriptor)));

    // Teardown closes the shared object once per description.
    p.exit().unwrap();
    assert_eq!(closes.load(Ordering::SeqCst), 4);
}

#[test]
fn close_tightens_afterlast_and_freefile() {
    let closes = Arc::new(AtomicUsize::new(0));
    let p = new_proc(64);
    for _ in 0..5 {
        open_counted(&p, &closes);
    }
    assert_eq!(p.table().afterlast(), 5);

    p.close(4).unwrap();
    assert_eq!(p.table().afterlast(), 4);
    p.close(3).unwrap();
    assert_eq!(p.table().afterlast(), 3);
    p.close(0).unwrap();
    assert_eq!(p.table().freefile(), 0);
    assert_eq!(p.table().afterlast(), 3);
    assert_eq!(p.table().list_fds(), [1, 2]);
}

#[test]
fn descriptor_limit_is_exact_and_stable() {
    let closes = Arc::new(AtomicUsize::new(0));
    let p = new_proc(8);
    for _ in 0..8 {
        open_counted(&p, &closes);
    }
    let r = p.open_with(HandleFlags::empty(), |_| Ok(()));
    assert_eq!(r, Err(Error::TooManyOpenFiles));
    // Freeing one slot makes exactly one allocation possible again.
    p.close(3).unwrap();
    assert_eq!(open_counted(&p, &closes), 3);
    assert_eq!(
        p.open_with(HandleFlags::empty(), |_| Ok(())),
        Err(Error::TooManyOpenFiles)
    );
}

#[test]
fn dup_clears_descriptor_flags_on_the_copy() {
    let closes = Arc::new(AtomicUsize::new(0));
    let p = new_proc(64);
    let fd = open_counted(&p, &closes);
    p.set_fd_flags(fd, HandleFlags::CLOEXEC).unwrap();
    let copy = p.dup(fd).unwrap();
    assert!(p.fd_flags(fd).unwrap().contains(HandleFlags::CLOEXEC));
    assert!(p.fd_flags(copy).unwrap().is_empty());
}

mod shrink_property {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        // Whatever subset of descriptors gets closed, afterlast stays the
        // tight bound and freefile never overshoots the lowest hole.
        #[test]
        fn cursors_stay_tight(keep in proptest::collection::vec(any::<bool>(), 1..24)) {
            let closes = Arc::new(AtomicUsize::new(0));
            let p = new_proc(64);
            for _ in 0..keep.len() {
                open_counted(&p, &closes);
            }
            for (fd, keep_it) in keep.iter().enumerate() {
                if !keep_it {
                    p.close(fd).unwrap();
                }
            }
            let highest = keep.iter().rposition(|&k| k);
            let expected_afterlast = highest.map_or(0, |h| h + 1);
            prop_assert_eq!(p.table().afterlast(), expected_afterlast);

            let lowest_free = keep.iter().position(|&k| !k).unwrap_or(keep.len());
            prop_assert!(p.table().freefile() <= lowest_free);
            // And the next allocation really is the lowest free index.
            let next = open_counted(&p, &closes);
            prop_assert_eq!(next, lowest_free.min(keep.len()));
        }
    }
}
