//! Pass file descriptors between processes over Unix domain sockets.
//!
//! A descriptor is a process-local integer; to hand the underlying file,
//! socket or pipe to another process, the kernel duplicates it into the
//! receiver when it travels as an `SCM_RIGHTS` control message alongside
//! ordinary payload bytes. This crate wraps that mechanism:
//!
//! - [`send_with_fds`] sends a payload and zero or more descriptors in one
//!   `sendmsg`. The caller keeps its descriptors.
//! - [`recv_with_fds`] receives a payload and up to `max_fds` descriptors in
//!   one `recvmsg`, returning them as [`OwnedFd`](std::os::fd::OwnedFd).
//!   Any descriptors past `max_fds` are closed before it returns.
//! - Truncation, foreign control messages and transport failures come back
//!   as distinct [`ChannelError`] variants; nothing terminates the process.
//!
//! # Usage
//!
//! ```no_run
//! use std::os::fd::AsFd;
//! use std::os::unix::net::UnixStream;
//!
//! use fdchannel::{Received, recv_with_fds, send_with_fds};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let (parent, child) = UnixStream::pair()?;
//! let log = std::fs::File::create("/tmp/child.log")?;
//!
//! send_with_fds(&parent, b"log", &[log.as_fd()])?;
//!
//! let mut buf = [0u8; 16];
//! match recv_with_fds(&child, &mut buf, 1)? {
//!     Received::Message { len, fds } => {
//!         assert_eq!(&buf[..len], b"log");
//!         let _log = std::fs::File::from(fds.into_iter().next().unwrap());
//!     }
//!     Received::Closed => {}
//! }
//! # Ok(())
//! # }
//! ```
//!
//! With the `tokio` feature, [`async_io`] provides the same operations for
//! `tokio::net::UnixStream` and `tokio::net::UnixDatagram`.

#![cfg(unix)]

#[macro_use]
mod macros;

pub mod ancillary;
mod channel;
mod error;
pub mod transport;

#[cfg(feature = "tokio")]
pub mod async_io;

#[cfg(test)]
mod test_util;

pub use ancillary::{AncillaryBlock, ControlBuffer, MAX_HANDLES};
pub use channel::{
    ChannelConfig, FdChannel, Received, recv_fd, recv_with_fds, send_all_with_fds, send_fd,
    send_with_fds,
};
pub use error::{ChannelError, ErrorClass};
pub use transport::{RawTransport, RecvFlags, RecvMeta, SendFlags, SocketKind};
