//! Error type for channel operations.

use std::fmt;
use std::io::{self, ErrorKind};

/// Broad category of a [`ChannelError`].
///
/// Callers pick a recovery policy per class: retry on would-block, tear the
/// connection down on truncation or type confusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The call was rejected before touching the socket.
    CallerContract,
    /// `sendmsg`/`recvmsg` failed.
    Transport,
    /// Payload or control data did not fit the receive buffers.
    Truncation,
    /// The peer sent control data that is not a well-formed `SCM_RIGHTS` record.
    TypeConfusion,
}

#[derive(Debug)]
pub enum ChannelError {
    /// More descriptors than the channel ceiling.
    TooManyHandles { count: usize, max: usize },
    /// Descriptors with an empty payload on a byte-stream socket. The kernel
    /// only delivers ancillary data together with at least one payload byte
    /// there, so the descriptors would be dropped silently.
    EmptyStreamPayload { fds: usize },
    Io(io::Error),
    /// `send_all_with_fds` failed after `sent` payload bytes (and every
    /// descriptor) were already handed to the kernel.
    Partial { sent: usize, source: io::Error },
    Truncated { payload: bool, control: bool },
    UnexpectedControl { level: i32, ty: i32 },
    MalformedControl(&'static str),
}

impl ChannelError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ChannelError::TooManyHandles { .. } | ChannelError::EmptyStreamPayload { .. } => {
                ErrorClass::CallerContract
            }
            ChannelError::Io(_) | ChannelError::Partial { .. } => ErrorClass::Transport,
            ChannelError::Truncated { .. } => ErrorClass::Truncation,
            ChannelError::UnexpectedControl { .. } | ChannelError::MalformedControl(_) => {
                ErrorClass::TypeConfusion
            }
        }
    }

    /// The underlying OS error, for transport failures.
    pub fn io_error(&self) -> Option<&io::Error> {
        match self {
            ChannelError::Io(err) | ChannelError::Partial { source: err, .. } => Some(err),
            _ => None,
        }
    }

    /// Non-blocking socket had nothing to read or no room to write.
    pub fn is_would_block(&self) -> bool {
        self.io_error()
            .is_some_and(|err| err.kind() == ErrorKind::WouldBlock)
    }

    /// The peer is gone (`EPIPE`, `ECONNRESET`, `ENOTCONN`).
    pub fn is_peer_closed(&self) -> bool {
        self.io_error().is_some_and(|err| {
            matches!(
                err.kind(),
                ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::NotConnected
            )
        })
    }

    /// Whether the connection should be torn down.
    ///
    /// Caller-contract errors only fail the call. Would-block and `EINTR` are
    /// retryable; every other transport error, truncation and type confusion
    /// are fatal to the connection.
    pub fn is_fatal(&self) -> bool {
        match self.class() {
            ErrorClass::CallerContract => false,
            ErrorClass::Transport => !self.io_error().is_some_and(|err| {
                matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted)
            }),
            ErrorClass::Truncation | ErrorClass::TypeConfusion => true,
        }
    }
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::TooManyHandles { count, max } => {
                write!(f, "too many file descriptors: {count} (max {max})")
            }
            ChannelError::EmptyStreamPayload { fds } => write!(
                f,
                "cannot pass {fds} file descriptor(s) with an empty payload on a stream socket"
            ),
            ChannelError::Io(err) => write!(f, "io error: {err}"),
            ChannelError::Partial { sent, source } => {
                write!(f, "send failed after {sent} bytes: {source}")
            }
            ChannelError::Truncated { payload, control } => match (payload, control) {
                (true, true) => write!(f, "payload and control message truncated"),
                (true, false) => write!(f, "payload truncated"),
                _ => write!(f, "control message truncated"),
            },
            ChannelError::UnexpectedControl { level, ty } => {
                write!(f, "unexpected control message: level {level}, type {ty}")
            }
            ChannelError::MalformedControl(reason) => {
                write!(f, "malformed control message: {reason}")
            }
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChannelError::Io(err) | ChannelError::Partial { source: err, .. } => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for ChannelError {
    fn from(value: io::Error) -> Self {
        ChannelError::Io(value)
    }
}

impl From<ChannelError> for io::Error {
    fn from(value: ChannelError) -> Self {
        match value {
            ChannelError::Io(err) => err,
            ChannelError::Partial { source, .. } => source,
            other => {
                let kind = match other.class() {
                    ErrorClass::CallerContract => ErrorKind::InvalidInput,
                    _ => ErrorKind::InvalidData,
                };
                io::Error::new(kind, other)
            }
        }
    }
}
