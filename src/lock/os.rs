//! OS record locks
//!
//! Thin wrapper over `fcntl` byte-range locks. On Linux open-file-description
//! locks are used so that the lock belongs to the descriptor held by the lock
//! table rather than to the whole process.

use std::io;
use std::os::unix::io::RawFd;

/// Lock request sent to the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OsLockKind {
    Read,
    Write,
    Unlock,
}

#[cfg(target_os = "linux")]
const SET_LOCK: libc::c_int = libc::F_OFD_SETLK;
#[cfg(target_os = "linux")]
const SET_LOCK_WAIT: libc::c_int = libc::F_OFD_SETLKW;

#[cfg(not(target_os = "linux"))]
const SET_LOCK: libc::c_int = libc::F_SETLK;
#[cfg(not(target_os = "linux"))]
const SET_LOCK_WAIT: libc::c_int = libc::F_SETLKW;

/// Apply a lock of `kind` on `[offset, offset + len)` (`len == 0` means to EOF
/// and beyond).
///
/// Returns `Ok(false)` when `blocking` is false and another descriptor holds
/// a conflicting lock.
pub(crate) fn set_lock(
    fd: RawFd,
    offset: u64,
    len: u64,
    kind: OsLockKind,
    blocking: bool,
) -> io::Result<bool> {
    // SAFETY: flock is a plain C struct; all-zero is a valid initial value.
    let mut request: libc::flock = unsafe { std::mem::zeroed() };
    request.l_type = match kind {
        OsLockKind::Read => libc::F_RDLCK,
        OsLockKind::Write => libc::F_WRLCK,
        OsLockKind::Unlock => libc::F_UNLCK,
    } as libc::c_short;
    request.l_whence = libc::SEEK_SET as libc::c_short;
    request.l_start = offset as libc::off_t;
    request.l_len = len as libc::off_t;
    // OFD locks require l_pid == 0
    request.l_pid = 0;

    let cmd = if blocking { SET_LOCK_WAIT } else { SET_LOCK };

    loop {
        // SAFETY: fd is a descriptor owned by the caller and request outlives
        // the call.
        let rc = unsafe { libc::fcntl(fd, cmd, &mut request as *mut libc::flock) };
        if rc == 0 {
            return Ok(true);
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(code) if !blocking && (code == libc::EAGAIN || code == libc::EACCES) => {
                return Ok(false)
            }
            _ => return Err(err),
        }
    }
}

/// Size of a system memory page
pub(crate) fn system_page_size() -> u64 {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as u64
    }
}
