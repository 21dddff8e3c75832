//! Security policy hooks
//!
//! Authorization decisions are delegated to an external policy object at
//! the same points the table engine would otherwise hard-code them: object
//! creation, duplication, inheritance across exec, fcntl-style control, and
//! advisory lock requests. A veto surfaces to the caller as
//! `Error::PermissionDenied`-class failures with the table left unchanged.

use crate::cred::Credential;
use crate::error::Result;
use crate::file::FileObject;
use crate::vnode::LockRange;

/// Authorization hooks consulted by the descriptor engine.
///
/// Every hook defaults to permit so a policy only overrides the decisions
/// it cares about.
pub trait SecurityPolicy: Send + Sync {
    /// New file object about to be created
    fn check_create(&self, _cred: &Credential) -> Result<()> {
        Ok(())
    }

    /// `old` is being duplicated into descriptor `new_fd`
    fn check_dup(&self, _cred: &Credential, _fg: &FileObject, _new_fd: usize) -> Result<()> {
        Ok(())
    }

    /// Descriptor considered for inheritance across exec
    fn check_inherit(&self, _cred: &Credential, _fg: &FileObject) -> Result<()> {
        Ok(())
    }

    /// Control operation (fcntl-style) on an open file
    fn check_fcntl(&self, _cred: &Credential, _fg: &FileObject, _cmd: u64) -> Result<()> {
        Ok(())
    }

    /// Advisory lock request
    fn check_lock(
        &self,
        _cred: &Credential,
        _fg: &FileObject,
        _range: LockRange,
        _exclusive: bool,
    ) -> Result<()> {
        Ok(())
    }

    /// Close notification; fired before drain for vnode-backed objects.
    /// Purely informational, the close proceeds regardless.
    fn notify_close(&self, _cred: &Credential, _fg: &FileObject) {}
}

/// Policy that permits everything
#[derive(Debug, Default, Clone, Copy)]
pub struct PermitAll;

impl SecurityPolicy for PermitAll {}
