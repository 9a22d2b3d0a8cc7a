//! Socket and pipe fixtures for unit tests.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

pub(crate) fn socketpair(ty: libc::c_int) -> (OwnedFd, OwnedFd) {
    let mut fds = [0_i32; 2];
    // SAFETY: `fds` points to 2 valid i32 slots.
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, ty, 0, fds.as_mut_ptr()) };
    assert_eq!(rc, 0, "socketpair failed: {}", io::Error::last_os_error());
    // SAFETY: ownership transferred from raw fds created by socketpair.
    let a = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    // SAFETY: ownership transferred from raw fds created by socketpair.
    let b = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    (a, b)
}

/// Returns `(read_end, write_end)`.
pub(crate) fn pipe() -> (OwnedFd, OwnedFd) {
    let mut fds = [0_i32; 2];
    // SAFETY: `fds` points to 2 valid i32 slots.
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(rc, 0, "pipe failed: {}", io::Error::last_os_error());
    // SAFETY: ownership transferred from raw fds created by pipe.
    let read_end = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    // SAFETY: ownership transferred from raw fds created by pipe.
    let write_end = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    (read_end, write_end)
}

pub(crate) fn set_nonblocking(fd: &OwnedFd) {
    let raw = fd.as_raw_fd();
    // SAFETY: fcntl on an fd this test owns.
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    assert!(flags >= 0, "F_GETFL failed: {}", io::Error::last_os_error());
    // SAFETY: as above.
    let rc = unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    assert_eq!(rc, 0, "F_SETFL failed: {}", io::Error::last_os_error());
}
