//! Send and receive a payload together with file descriptors.
//!
//! Each operation performs exactly one `sendmsg` or `recvmsg`; nothing is
//! buffered between calls. [`send_all_with_fds`] is the one exception and
//! loops on purpose, attaching the descriptors to its first call only.

use std::io::{self, ErrorKind};
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};

use crate::ancillary::{AncillaryBlock, ControlBuffer, MAX_HANDLES};
use crate::error::ChannelError;
use crate::transport::{RawTransport, RecvFlags, SendFlags, SocketKind};

/// Per-channel settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Most descriptors a send may carry and a receive may accept.
    /// Never above [`MAX_HANDLES`].
    pub max_fds: usize,
    /// Ask the kernel to mark received descriptors close-on-exec.
    pub cloexec: bool,
    /// Turn `SIGPIPE` on a closed peer into an `EPIPE` error.
    pub no_sigpipe: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_fds: MAX_HANDLES,
            cloexec: true,
            no_sigpipe: true,
        }
    }
}

impl ChannelConfig {
    pub fn with_max_fds(mut self, max_fds: usize) -> Self {
        self.max_fds = max_fds.min(MAX_HANDLES);
        self
    }

    pub fn with_cloexec(mut self, cloexec: bool) -> Self {
        self.cloexec = cloexec;
        self
    }

    pub fn with_no_sigpipe(mut self, no_sigpipe: bool) -> Self {
        self.no_sigpipe = no_sigpipe;
        self
    }

    fn send_flags(&self) -> SendFlags {
        SendFlags {
            no_sigpipe: self.no_sigpipe,
        }
    }

    fn recv_flags(&self) -> RecvFlags {
        RecvFlags {
            cloexec: self.cloexec,
        }
    }

    fn ceiling(&self) -> usize {
        self.max_fds.min(MAX_HANDLES)
    }
}

/// Outcome of a receive.
#[derive(Debug)]
pub enum Received {
    /// One message: `len` payload bytes (possibly zero on record sockets)
    /// and the descriptors accepted from it. The caller owns `fds`.
    Message { len: usize, fds: Vec<OwnedFd> },
    /// Zero-length read on a byte stream: the peer shut down its side.
    Closed,
}

impl Received {
    pub fn is_closed(&self) -> bool {
        matches!(self, Received::Closed)
    }

    /// Payload bytes received; zero for [`Received::Closed`].
    pub fn bytes(&self) -> usize {
        match self {
            Received::Message { len, .. } => *len,
            Received::Closed => 0,
        }
    }

    pub fn fds(&self) -> &[OwnedFd] {
        match self {
            Received::Message { fds, .. } => fds,
            Received::Closed => &[],
        }
    }

    pub fn into_fds(self) -> Vec<OwnedFd> {
        match self {
            Received::Message { fds, .. } => fds,
            Received::Closed => Vec::new(),
        }
    }
}

/// Send `payload` and `fds` in a single `sendmsg`.
///
/// Returns how many payload bytes the kernel accepted; on a stream socket
/// that may be fewer than `payload.len()`, and the rest is the caller's to
/// send (without the descriptors, which went out with the first byte).
/// The caller keeps its own descriptors: the peer receives duplicates.
pub fn send_with_fds<T: RawTransport + ?Sized>(
    transport: &T,
    payload: &[u8],
    fds: &[BorrowedFd<'_>],
) -> Result<usize, ChannelError> {
    send_message(transport, payload, fds, &ChannelConfig::default(), None)
}

/// Receive one message into `buf`, accepting at most `max_fds` descriptors.
///
/// Control space for [`MAX_HANDLES`] descriptors is always reserved, so a
/// peer sending more than `max_fds` is detected rather than truncated by the
/// kernel. Descriptors past `max_fds` are closed before this returns.
pub fn recv_with_fds<T: RawTransport + ?Sized>(
    transport: &T,
    buf: &mut [u8],
    max_fds: usize,
) -> Result<Received, ChannelError> {
    recv_message(transport, buf, max_fds, &ChannelConfig::default(), None)
}

/// Send the whole payload, with `fds` attached to the first chunk only.
///
/// `EINTR` is retried. Once the first chunk is out, any failure is reported
/// as [`ChannelError::Partial`] with the byte count already delivered, so
/// the descriptors are never sent twice.
pub fn send_all_with_fds<T: RawTransport + ?Sized>(
    transport: &T,
    payload: &[u8],
    fds: &[BorrowedFd<'_>],
) -> Result<usize, ChannelError> {
    send_all_message(transport, payload, fds, &ChannelConfig::default(), None)
}

/// Send `payload` with at most one descriptor.
pub fn send_fd<T: RawTransport + ?Sized>(
    transport: &T,
    payload: &[u8],
    fd: Option<BorrowedFd<'_>>,
) -> Result<usize, ChannelError> {
    send_with_fds(transport, payload, fd.as_slice())
}

/// Receive one message and at most one descriptor.
///
/// A shut-down stream peer is reported as `UnexpectedEof`.
pub fn recv_fd<T: RawTransport + ?Sized>(
    transport: &T,
    buf: &mut [u8],
) -> Result<(usize, Option<OwnedFd>), ChannelError> {
    match recv_with_fds(transport, buf, 1)? {
        Received::Message { len, fds } => Ok((len, fds.into_iter().next())),
        Received::Closed => Err(ChannelError::Io(io::Error::new(
            ErrorKind::UnexpectedEof,
            "peer closed",
        ))),
    }
}

/// A socket paired with its configuration and cached socket type.
#[derive(Debug)]
pub struct FdChannel<T> {
    transport: T,
    config: ChannelConfig,
    kind: SocketKind,
}

impl<T: RawTransport> FdChannel<T> {
    pub fn new(transport: T) -> Result<Self, ChannelError> {
        Self::with_config(transport, ChannelConfig::default())
    }

    pub fn with_config(transport: T, config: ChannelConfig) -> Result<Self, ChannelError> {
        let kind = transport.socket_kind()?;
        Ok(Self {
            transport,
            config,
            kind,
        })
    }

    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn get_ref(&self) -> &T {
        &self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    /// See [`send_with_fds`].
    pub fn send(&self, payload: &[u8], fds: &[BorrowedFd<'_>]) -> Result<usize, ChannelError> {
        send_message(&self.transport, payload, fds, &self.config, Some(self.kind))
    }

    /// See [`send_all_with_fds`].
    pub fn send_all(
        &self,
        payload: &[u8],
        fds: &[BorrowedFd<'_>],
    ) -> Result<usize, ChannelError> {
        send_all_message(&self.transport, payload, fds, &self.config, Some(self.kind))
    }

    /// See [`recv_with_fds`]. `max_fds` is further capped by the config.
    pub fn recv(&self, buf: &mut [u8], max_fds: usize) -> Result<Received, ChannelError> {
        recv_message(&self.transport, buf, max_fds, &self.config, Some(self.kind))
    }
}

fn kind_of<T: RawTransport + ?Sized>(
    transport: &T,
    cached: Option<SocketKind>,
) -> io::Result<SocketKind> {
    match cached {
        Some(kind) => Ok(kind),
        None => transport.socket_kind(),
    }
}

pub(crate) fn send_message<T: RawTransport + ?Sized>(
    transport: &T,
    payload: &[u8],
    fds: &[BorrowedFd<'_>],
    config: &ChannelConfig,
    kind: Option<SocketKind>,
) -> Result<usize, ChannelError> {
    let max = config.ceiling();
    if fds.len() > max {
        return Err(ChannelError::TooManyHandles {
            count: fds.len(),
            max,
        });
    }
    if !fds.is_empty() && payload.is_empty() && kind_of(transport, kind)?.is_stream() {
        return Err(ChannelError::EmptyStreamPayload { fds: fds.len() });
    }

    let block = AncillaryBlock::from_borrowed(fds)?;
    if block.is_empty() {
        trace!(len = payload.len(), "not passing fds");
    }
    for fd in block.fds() {
        trace!(fd = *fd, "passing fd");
    }

    let control = block.to_wire();
    let sent = transport.send_msg(payload, &control, config.send_flags())?;
    Ok(sent)
}

pub(crate) fn send_all_message<T: RawTransport + ?Sized>(
    transport: &T,
    payload: &[u8],
    fds: &[BorrowedFd<'_>],
    config: &ChannelConfig,
    kind: Option<SocketKind>,
) -> Result<usize, ChannelError> {
    let mut sent = loop {
        match send_message(transport, payload, fds, config, kind) {
            Err(ChannelError::Io(err)) if err.kind() == ErrorKind::Interrupted => continue,
            other => break other?,
        }
    };

    if sent == 0 && !payload.is_empty() {
        return Err(ChannelError::Io(io::Error::new(
            ErrorKind::WriteZero,
            "sendmsg wrote zero bytes",
        )));
    }

    let empty = ControlBuffer::empty();
    while sent < payload.len() {
        match transport.send_msg(&payload[sent..], &empty, config.send_flags()) {
            Ok(0) => {
                return Err(ChannelError::Partial {
                    sent,
                    source: io::Error::new(ErrorKind::WriteZero, "sendmsg wrote zero bytes"),
                });
            }
            Ok(n) => sent += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(source) => return Err(ChannelError::Partial { sent, source }),
        }
    }

    Ok(sent)
}

pub(crate) fn recv_message<T: RawTransport + ?Sized>(
    transport: &T,
    buf: &mut [u8],
    max_fds: usize,
    config: &ChannelConfig,
    kind: Option<SocketKind>,
) -> Result<Received, ChannelError> {
    let accept = max_fds.min(config.ceiling());
    let mut control = ControlBuffer::for_fds(MAX_HANDLES);
    let meta = transport.recv_msg(buf, &mut control, config.recv_flags())?;

    let decoded = AncillaryBlock::from_wire(control.as_bytes());

    if meta.payload_truncated || meta.control_truncated {
        let arrived = match decoded {
            Ok(block) => block,
            Err(failure) => failure.stranded,
        };
        warn!(
            payload = meta.payload_truncated,
            control = meta.control_truncated,
            dropped_fds = arrived.len(),
            "message truncated"
        );
        // SAFETY: these descriptors were installed by this recvmsg and
        // nothing else refers to them; dropping closes them.
        drop(unsafe { arrived.into_owned() });
        return Err(ChannelError::Truncated {
            payload: meta.payload_truncated,
            control: meta.control_truncated,
        });
    }

    let block = match decoded {
        Ok(block) => block,
        Err(failure) => {
            warn!(
                error = %failure.error,
                dropped_fds = failure.stranded.len(),
                "rejecting control message"
            );
            // SAFETY: as above, stranded descriptors came from this recvmsg.
            drop(unsafe { failure.stranded.into_owned() });
            return Err(failure.error);
        }
    };

    if block.is_empty() {
        if meta.len == 0 && kind_of(transport, kind)?.is_stream() {
            debug!("peer closed stream");
            return Ok(Received::Closed);
        }
        debug!(len = meta.len, "no fds in message");
        return Ok(Received::Message {
            len: meta.len,
            fds: Vec::new(),
        });
    }

    // SAFETY: the kernel installed these descriptors for this recvmsg.
    let mut fds = unsafe { block.into_owned() };
    let surplus = fds.split_off(accept.min(fds.len()));
    for fd in &fds {
        trace!(fd = fd.as_raw_fd(), "received fd");
    }
    for fd in surplus {
        debug!(fd = fd.as_raw_fd(), "dropping surplus fd");
        drop(fd);
    }

    Ok(Received::Message { len: meta.len, fds })
}
