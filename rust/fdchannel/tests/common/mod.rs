#![allow(dead_code)]

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub fn socketpair(ty: libc::c_int) -> (OwnedFd, OwnedFd) {
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

/// Returns `(read_end, write_end)`, read end non-blocking.
pub fn pipe() -> (OwnedFd, OwnedFd) {
    let mut fds = [0_i32; 2];
    // SAFETY: `fds` points to 2 valid i32 slots.
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(rc, 0, "pipe failed: {}", io::Error::last_os_error());
    // SAFETY: ownership transferred from raw fds created by pipe.
    let read_end = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    // SAFETY: ownership transferred from raw fds created by pipe.
    let write_end = unsafe { OwnedFd::from_raw_fd(fds[1]) };

    // SAFETY: fcntl on an fd this test owns.
    let flags = unsafe { libc::fcntl(read_end.as_raw_fd(), libc::F_GETFL) };
    // SAFETY: as above.
    let rc = unsafe { libc::fcntl(read_end.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) };
    assert_eq!(rc, 0, "F_SETFL failed: {}", io::Error::last_os_error());

    (read_end, write_end)
}

/// `Some(0)` once every write end of the pipe is closed, `None` while one
/// is still open somewhere.
pub fn pipe_eof(read_end: &OwnedFd) -> Option<usize> {
    let mut byte = [0u8; 1];
    // SAFETY: reading into a 1-byte stack buffer.
    let n = unsafe { libc::read(read_end.as_raw_fd(), byte.as_mut_ptr().cast(), 1) };
    if n < 0 {
        let err = io::Error::last_os_error();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock, "pipe read failed: {err}");
        return None;
    }
    Some(n as usize)
}

/// The descriptor number the next `open` would get.
pub fn lowest_free_fd() -> RawFd {
    let probe = std::fs::File::open("/dev/null").expect("open /dev/null");
    probe.as_raw_fd()
}
