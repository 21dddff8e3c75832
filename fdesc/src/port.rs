//! Fileports
//!
//! A fileport packages a file object as a transferable capability: export
//! donates a strong reference keyed by a port name, import takes the
//! reference back and binds it to a fresh descriptor in the receiving
//! table. The space is process-agnostic, so a name minted by one process
//! can be redeemed by another.

use alloc::sync::Arc;
use hashbrown::HashMap;
use spin::Mutex;

use crate::error::{Error, Result};
use crate::file::{self, FileObject};

struct PortSpaceState {
    ports: HashMap<u32, Arc<FileObject>>,
    next: u32,
}

/// Registry of exported file objects
pub struct FileportSpace {
    state: Mutex<PortSpaceState>,
}

impl FileportSpace {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PortSpaceState {
                ports: HashMap::new(),
                next: 1,
            }),
        }
    }

    /// Register an exported object under a fresh port name. The caller has
    /// already taken the strong reference being donated.
    pub fn install(&self, fg: Arc<FileObject>) -> u32 {
        let mut st = self.state.lock();
        let name = st.next;
        st.next += 1;
        st.ports.insert(name, fg);
        name
    }

    /// Redeem a port name, taking over its donated reference.
    pub fn take(&self, name: u32) -> Result<Arc<FileObject>> {
        self.state
            .lock()
            .ports
            .remove(&name)
            .ok_or(Error::InvalidArgument)
    }

    /// Peek without consuming (diagnostics only).
    pub fn contains(&self, name: u32) -> bool {
        self.state.lock().ports.contains_key(&name)
    }

    /// Destroy a port that will never be redeemed, releasing the donated
    /// reference. POSIX lock cleanup does not apply: a port holds no
    /// process identity.
    pub fn destroy(&self, name: u32) -> Result<()> {
        let fg = self.take(name)?;
        file::drop_ref(&fg, None)
    }

    pub fn len(&self) -> usize {
        self.state.lock().ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().ports.is_empty()
    }
}

impl Default for FileportSpace {
    fn default() -> Self {
        Self::new()
    }
}
