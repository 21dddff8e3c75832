//! # fdesc
//!
//! Per-process file descriptor tables and the shared open-file objects
//! behind them: allocation, duplication, two-phase close with drain,
//! inheritance across fork and exec, advisory locks, close guards, and
//! fileport capability transport.
//!
//! The crate is `no_std` with `alloc`; hosting code supplies the file
//! types themselves by implementing [`file::FileOps`] and plugging policy
//! decisions in through [`policy::SecurityPolicy`].

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod cred;
pub mod error;
pub mod events;
pub mod file;
pub mod policy;
pub mod port;
pub mod proc;
pub mod sync;
pub mod table;
pub mod vnode;

pub use cred::Credential;
pub use error::{Error, Result};
pub use file::{
    FileFlags, FileHandle, FileObject, FileOps, FileStat, FileType, GuardAttrs, GuardedHandle,
    HandleFlags, LifeFlags, SelectWhich,
};
pub use policy::{PermitAll, SecurityPolicy};
pub use port::FileportSpace;
pub use proc::{FlockOp, Process};
pub use table::{FdTable, SlotKind};
pub use vnode::{LockConflict, LockOwner, LockRange, LockWait, Vnode, VnodeMeta};
