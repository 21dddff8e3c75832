//! Credentials
//!
//! Reference-counted identity attached to every file object at creation.
//! Shared by `Arc`; the engine never mutates a credential after it is built.

/// Owning identity for a process or file object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credential {
    pub uid: u32,
    pub gid: u32,
    pub euid: u32,
    pub egid: u32,
}

impl Credential {
    pub const fn new(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            euid: uid,
            egid: gid,
        }
    }

    /// The kernel's own credential
    pub const fn kernel() -> Self {
        Self::new(0, 0)
    }

    pub const fn is_root(&self) -> bool {
        self.euid == 0
    }
}

impl Default for Credential {
    fn default() -> Self {
        Self::new(1000, 1000)
    }
}
