//! Async descriptor passing over tokio Unix sockets.
//!
//! Each operation waits for readiness, then runs the blocking-free channel
//! operation on the non-blocking socket, retrying only on would-block.

use std::io::{self, ErrorKind};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use tokio::io::Interest;
use tokio::net::{UnixDatagram, UnixStream};

use crate::channel::{ChannelConfig, Received, recv_message, send_message};
use crate::error::ChannelError;
use crate::transport::SocketKind;

/// A tokio socket that descriptors can be passed over.
pub trait AsyncFdSocket: AsFd {
    const KIND: SocketKind;

    fn ready_for(&self, interest: Interest) -> impl Future<Output = io::Result<()>> + Send;

    fn try_io_with<R>(
        &self,
        interest: Interest,
        f: impl FnOnce() -> io::Result<R>,
    ) -> io::Result<R>;
}

impl AsyncFdSocket for UnixStream {
    const KIND: SocketKind = SocketKind::Stream;

    async fn ready_for(&self, interest: Interest) -> io::Result<()> {
        self.ready(interest).await.map(|_| ())
    }

    fn try_io_with<R>(
        &self,
        interest: Interest,
        f: impl FnOnce() -> io::Result<R>,
    ) -> io::Result<R> {
        self.try_io(interest, f)
    }
}

impl AsyncFdSocket for UnixDatagram {
    const KIND: SocketKind = SocketKind::Datagram;

    async fn ready_for(&self, interest: Interest) -> io::Result<()> {
        self.ready(interest).await.map(|_| ())
    }

    fn try_io_with<R>(
        &self,
        interest: Interest,
        f: impl FnOnce() -> io::Result<R>,
    ) -> io::Result<R> {
        self.try_io(interest, f)
    }
}

/// Surface would-block as an `io::Error` so tokio clears readiness; every
/// other outcome passes through untouched.
fn readiness<R>(result: Result<R, ChannelError>) -> io::Result<Result<R, ChannelError>> {
    match result {
        Err(ChannelError::Io(err)) if err.kind() == ErrorKind::WouldBlock => Err(err),
        other => Ok(other),
    }
}

async fn drive<S, R>(
    socket: &S,
    interest: Interest,
    mut op: impl FnMut() -> Result<R, ChannelError>,
) -> Result<R, ChannelError>
where
    S: AsyncFdSocket,
{
    loop {
        socket.ready_for(interest).await?;
        match socket.try_io_with(interest, || readiness(op())) {
            Ok(result) => return result,
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Async [`send_with_fds`](crate::send_with_fds).
pub async fn send_with_fds_async<S: AsyncFdSocket>(
    socket: &S,
    payload: &[u8],
    fds: &[BorrowedFd<'_>],
) -> Result<usize, ChannelError> {
    let config = ChannelConfig::default();
    drive(socket, Interest::WRITABLE, || {
        send_message(&socket.as_fd(), payload, fds, &config, Some(S::KIND))
    })
    .await
}

/// Async [`recv_with_fds`](crate::recv_with_fds).
pub async fn recv_with_fds_async<S: AsyncFdSocket>(
    socket: &S,
    buf: &mut [u8],
    max_fds: usize,
) -> Result<Received, ChannelError> {
    let config = ChannelConfig::default();
    drive(socket, Interest::READABLE, || {
        recv_message(&socket.as_fd(), &mut buf[..], max_fds, &config, Some(S::KIND))
    })
    .await
}

/// Send `payload` with at most one descriptor.
///
/// The descriptor remains valid in the sender after this call.
pub async fn send_fd_async<S: AsyncFdSocket>(
    socket: &S,
    payload: &[u8],
    fd: Option<BorrowedFd<'_>>,
) -> Result<usize, ChannelError> {
    send_with_fds_async(socket, payload, fd.as_slice()).await
}

/// Receive one message and at most one descriptor.
///
/// The returned descriptor is owned by the caller.
pub async fn recv_fd_async<S: AsyncFdSocket>(
    socket: &S,
    buf: &mut [u8],
) -> Result<(usize, Option<OwnedFd>), ChannelError> {
    match recv_with_fds_async(socket, buf, 1).await? {
        Received::Message { len, fds } => Ok((len, fds.into_iter().next())),
        Received::Closed => Err(ChannelError::Io(io::Error::new(
            ErrorKind::UnexpectedEof,
            "peer closed",
        ))),
    }
}
