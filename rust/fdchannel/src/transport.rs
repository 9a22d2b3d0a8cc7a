//! The socket seam: one `sendmsg` or `recvmsg` per call.
//!
//! [`RawTransport`] is implemented for the standard descriptor and Unix
//! socket types. Channel operations only talk to the socket through it, so a
//! test double can count transport calls or hand back crafted control data.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixDatagram, UnixStream};

use crate::ancillary::ControlBuffer;

/// Socket type as reported by `SO_TYPE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Stream,
    SeqPacket,
    Datagram,
    Other(i32),
}

impl SocketKind {
    pub fn from_raw(ty: libc::c_int) -> Self {
        match ty {
            libc::SOCK_STREAM => SocketKind::Stream,
            libc::SOCK_SEQPACKET => SocketKind::SeqPacket,
            libc::SOCK_DGRAM => SocketKind::Datagram,
            other => SocketKind::Other(other),
        }
    }

    /// Byte streams have no message boundaries: a zero-length read means the
    /// peer shut down, and ancillary data needs at least one payload byte to
    /// ride on.
    pub fn is_stream(self) -> bool {
        self == SocketKind::Stream
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendFlags {
    /// Report a closed peer as `EPIPE` instead of raising `SIGPIPE`.
    pub no_sigpipe: bool,
}

impl Default for SendFlags {
    fn default() -> Self {
        Self { no_sigpipe: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvFlags {
    /// Mark received descriptors close-on-exec, where the platform allows it
    /// atomically.
    pub cloexec: bool,
}

impl Default for RecvFlags {
    fn default() -> Self {
        Self { cloexec: true }
    }
}

/// What one `recvmsg` produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecvMeta {
    /// Payload bytes written to the buffer.
    pub len: usize,
    /// Control bytes written to the control buffer.
    pub control_len: usize,
    /// `MSG_TRUNC`: the message had more payload than the buffer held.
    pub payload_truncated: bool,
    /// `MSG_CTRUNC`: control data did not fit the control buffer.
    pub control_truncated: bool,
}

/// A connected local socket that can carry control messages.
pub trait RawTransport {
    /// Send `payload` and the records in `control` in one call.
    ///
    /// An empty `control` sends no control section.
    fn send_msg(
        &self,
        payload: &[u8],
        control: &ControlBuffer,
        flags: SendFlags,
    ) -> io::Result<usize>;

    /// Receive into `payload`, with the whole capacity of `control`
    /// available for control data. Implementations set the control length.
    fn recv_msg(
        &self,
        payload: &mut [u8],
        control: &mut ControlBuffer,
        flags: RecvFlags,
    ) -> io::Result<RecvMeta>;

    fn socket_kind(&self) -> io::Result<SocketKind>;
}

impl<T: RawTransport + ?Sized> RawTransport for &T {
    fn send_msg(
        &self,
        payload: &[u8],
        control: &ControlBuffer,
        flags: SendFlags,
    ) -> io::Result<usize> {
        (**self).send_msg(payload, control, flags)
    }

    fn recv_msg(
        &self,
        payload: &mut [u8],
        control: &mut ControlBuffer,
        flags: RecvFlags,
    ) -> io::Result<RecvMeta> {
        (**self).recv_msg(payload, control, flags)
    }

    fn socket_kind(&self) -> io::Result<SocketKind> {
        (**self).socket_kind()
    }
}

macro_rules! impl_raw_transport {
    ($($ty:ty),* $(,)?) => {
        $(
            impl RawTransport for $ty {
                fn send_msg(
                    &self,
                    payload: &[u8],
                    control: &ControlBuffer,
                    flags: SendFlags,
                ) -> io::Result<usize> {
                    sendmsg_fd(self.as_fd(), payload, control, flags)
                }

                fn recv_msg(
                    &self,
                    payload: &mut [u8],
                    control: &mut ControlBuffer,
                    flags: RecvFlags,
                ) -> io::Result<RecvMeta> {
                    recvmsg_fd(self.as_fd(), payload, control, flags)
                }

                fn socket_kind(&self) -> io::Result<SocketKind> {
                    socket_kind_fd(self.as_fd())
                }
            }
        )*
    };
}

impl_raw_transport!(BorrowedFd<'_>, OwnedFd, UnixStream, UnixDatagram);

/// Query `SO_TYPE` for a socket.
pub fn socket_kind_fd(fd: BorrowedFd<'_>) -> io::Result<SocketKind> {
    let mut ty: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: getsockopt writes at most `len` bytes into `ty`.
    let rc = unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_TYPE,
            (&mut ty as *mut libc::c_int).cast(),
            &mut len,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(SocketKind::from_raw(ty))
}

fn sendmsg_fd(
    fd: BorrowedFd<'_>,
    payload: &[u8],
    control: &ControlBuffer,
    flags: SendFlags,
) -> io::Result<usize> {
    let raw = fd.as_raw_fd();
    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };

    // SAFETY: zeroed msghdr is valid before assigning pointers.
    let mut msghdr: libc::msghdr = unsafe { std::mem::zeroed() };
    if !payload.is_empty() {
        msghdr.msg_iov = &mut iov;
        msghdr.msg_iovlen = 1;
    }
    if !control.is_empty() {
        msghdr.msg_control = control.as_bytes().as_ptr() as *mut libc::c_void;
        msghdr.msg_controllen = control.len() as _;
    }

    let mut send_flags = 0;
    if flags.no_sigpipe {
        #[cfg(target_vendor = "apple")]
        ensure_socket_no_sigpipe(raw)?;
        send_flags |= NOSIGNAL;
    }

    // SAFETY: msghdr points to live iov/control buffers; sendmsg only reads them.
    let n = unsafe { libc::sendmsg(raw, &msghdr, send_flags) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
const NOSIGNAL: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
const NOSIGNAL: libc::c_int = 0;

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
const CMSG_CLOEXEC: libc::c_int = libc::MSG_CMSG_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
const CMSG_CLOEXEC: libc::c_int = 0;

#[cfg(target_vendor = "apple")]
fn ensure_socket_no_sigpipe(fd: RawFd) -> io::Result<()> {
    let one: libc::c_int = 1;
    // SAFETY: setsockopt reads `one` for the provided length.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_NOSIGPIPE,
            (&one as *const libc::c_int).cast(),
            std::mem::size_of_val(&one) as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn recvmsg_fd(
    fd: BorrowedFd<'_>,
    payload: &mut [u8],
    control: &mut ControlBuffer,
    flags: RecvFlags,
) -> io::Result<RecvMeta> {
    let raw: RawFd = fd.as_raw_fd();
    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr().cast(),
        iov_len: payload.len(),
    };

    control.clear();
    let control_bytes = control.as_mut_bytes();

    // SAFETY: zeroed msghdr is valid before assigning pointers.
    let mut msghdr: libc::msghdr = unsafe { std::mem::zeroed() };
    msghdr.msg_iov = &mut iov;
    msghdr.msg_iovlen = 1;
    if !control_bytes.is_empty() {
        msghdr.msg_control = control_bytes.as_mut_ptr().cast();
        msghdr.msg_controllen = control_bytes.len() as _;
    }

    let recv_flags = if flags.cloexec { CMSG_CLOEXEC } else { 0 };

    // SAFETY: msghdr points to live iov/control buffers owned by this frame.
    let n = unsafe { libc::recvmsg(raw, &mut msghdr, recv_flags) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let meta = RecvMeta {
        len: n as usize,
        control_len: msghdr.msg_controllen as usize,
        payload_truncated: (msghdr.msg_flags & libc::MSG_TRUNC) != 0,
        control_truncated: (msghdr.msg_flags & libc::MSG_CTRUNC) != 0,
    };
    control.set_len(meta.control_len);
    Ok(meta)
}
