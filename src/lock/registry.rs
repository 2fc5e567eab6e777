//! Read-only descriptor registry
//!
//! Descriptors attached read-only are recorded here; lock tables built for
//! them are bypass tables so a strictly read-only attach never takes OS locks.

use std::collections::HashSet;
use std::os::unix::io::RawFd;

use parking_lot::Mutex;

/// Set of descriptors opened without write access
#[derive(Debug, Default)]
pub struct ReadOnlyRegistry {
    fds: Mutex<HashSet<RawFd>>,
}

impl ReadOnlyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, fd: RawFd) {
        self.fds.lock().insert(fd);
    }

    pub fn unregister(&self, fd: RawFd) {
        self.fds.lock().remove(&fd);
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.fds.lock().contains(&fd)
    }

    pub fn len(&self) -> usize {
        self.fds.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
