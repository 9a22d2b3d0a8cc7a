//! `SCM_RIGHTS` control-message encoding.
//!
//! A descriptor block travels as one control record: a `cmsghdr`
//! (`cmsg_len`, `cmsg_level`, `cmsg_type`) followed by a packed array of
//! native `c_int` descriptors. [`AncillaryBlock::to_wire`] and
//! [`AncillaryBlock::from_wire`] convert between that layout and a typed
//! list of descriptors. Headers are copied in and out with unaligned
//! reads/writes and every length is checked against the buffer, so nothing
//! depends on how a struct happens to overlay the bytes.

use std::mem;
use std::os::fd::{BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

use crate::error::ChannelError;

/// Most descriptors a single message may carry.
///
/// This is an implementation ceiling that sizes the receive-side control
/// buffer, not a protocol limit. Both peers bound it independently; a peer
/// that sends more makes the receiver report truncation.
pub const MAX_HANDLES: usize = 128;

const FD_SIZE: usize = mem::size_of::<RawFd>();

/// `CMSG_LEN(0)`: header length including the padding before the data.
#[allow(unused_unsafe)]
fn header_len() -> usize {
    // SAFETY: CMSG_LEN is pure arithmetic.
    unsafe { libc::CMSG_LEN(0) as usize }
}

#[allow(unused_unsafe)]
fn record_len(data_len: usize) -> usize {
    // SAFETY: CMSG_LEN is pure arithmetic.
    unsafe { libc::CMSG_LEN(data_len as u32) as usize }
}

#[allow(unused_unsafe)]
fn record_space(data_len: usize) -> usize {
    // SAFETY: CMSG_SPACE is pure arithmetic.
    unsafe { libc::CMSG_SPACE(data_len as u32) as usize }
}

/// Bytes of control space needed for `fd_count` descriptors in one record.
#[must_use]
pub fn ancillary_space_for_fds(fd_count: usize) -> usize {
    if fd_count == 0 {
        0
    } else {
        record_space(fd_count * FD_SIZE)
    }
}

/// Control-message buffer aligned for `cmsghdr`.
///
/// Backed by `u64` words so the start of the buffer satisfies the kernel's
/// alignment requirement on every supported target.
#[derive(Debug, Clone)]
pub struct ControlBuffer {
    words: Vec<u64>,
    len: usize,
}

impl ControlBuffer {
    /// A buffer with no capacity; passing it sends no control data.
    pub fn empty() -> Self {
        Self {
            words: Vec::new(),
            len: 0,
        }
    }

    /// A zeroed buffer with room for at least `bytes` bytes.
    pub fn with_space(bytes: usize) -> Self {
        let words = bytes.div_ceil(mem::size_of::<u64>());
        Self {
            words: vec![0; words],
            len: 0,
        }
    }

    /// A buffer sized for one `SCM_RIGHTS` record of `fd_count` descriptors.
    pub fn for_fds(fd_count: usize) -> Self {
        Self::with_space(ancillary_space_for_fds(fd_count))
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.words.len() * mem::size_of::<u64>()
    }

    /// Bytes of valid control data.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The valid control data.
    pub fn as_bytes(&self) -> &[u8] {
        &self.storage()[..self.len]
    }

    /// The whole buffer, for a transport to fill on receive.
    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        let cap = self.capacity();
        // SAFETY: `u64` has no padding and every byte pattern is valid, so
        // the words may be viewed and written as `cap` bytes.
        unsafe { std::slice::from_raw_parts_mut(self.words.as_mut_ptr().cast::<u8>(), cap) }
    }

    /// Record how many bytes a receive wrote. Clamped to the capacity.
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.capacity());
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Append one control record.
    ///
    /// Returns `false` without writing anything if the record does not fit.
    /// Besides building `SCM_RIGHTS` records this lets callers craft other
    /// record types, e.g. to exercise a receiver's validation.
    pub fn push_record(&mut self, level: i32, ty: i32, data: &[u8]) -> bool {
        let space = record_space(data.len());
        if self.len + space > self.capacity() {
            return false;
        }

        let offset = self.len;
        let hdr_len = header_len();
        // SAFETY: an all-zero cmsghdr is valid; some libcs have private
        // padding fields, so it cannot be built with a struct literal.
        let mut header: libc::cmsghdr = unsafe { mem::zeroed() };
        header.cmsg_len = record_len(data.len()) as _;
        header.cmsg_level = level;
        header.cmsg_type = ty;

        let bytes = self.as_mut_bytes();
        // SAFETY: `offset + space <= capacity` and `space >= size_of::<cmsghdr>()`.
        unsafe {
            ptr::write_unaligned(bytes.as_mut_ptr().add(offset).cast::<libc::cmsghdr>(), header);
        }
        bytes[offset + hdr_len..offset + hdr_len + data.len()].copy_from_slice(data);

        self.len += space;
        true
    }

    fn storage(&self) -> &[u8] {
        // SAFETY: see `as_mut_bytes`.
        unsafe { std::slice::from_raw_parts(self.words.as_ptr().cast::<u8>(), self.capacity()) }
    }
}

/// A decoded or to-be-encoded list of descriptors for one message.
///
/// Holds raw descriptor numbers only: building a block from borrowed
/// descriptors does not take ownership of them, and a block decoded from
/// received control data must be turned into owned descriptors with
/// [`AncillaryBlock::into_owned`] (or closed) by whoever received it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AncillaryBlock {
    fds: Vec<RawFd>,
}

/// Control data that failed validation.
///
/// `stranded` holds descriptors from every `SCM_RIGHTS` record that could
/// be walked, before or after the bad one. The kernel already installed
/// them in this process, so the receiver must close them.
#[derive(Debug)]
pub struct DecodeFailure {
    pub error: ChannelError,
    pub stranded: AncillaryBlock,
}

impl AncillaryBlock {
    /// Build a block from raw descriptors, enforcing [`MAX_HANDLES`].
    pub fn new(fds: Vec<RawFd>) -> Result<Self, ChannelError> {
        if fds.len() > MAX_HANDLES {
            return Err(ChannelError::TooManyHandles {
                count: fds.len(),
                max: MAX_HANDLES,
            });
        }
        Ok(Self { fds })
    }

    pub fn from_borrowed(fds: &[BorrowedFd<'_>]) -> Result<Self, ChannelError> {
        use std::os::fd::AsRawFd;
        Self::new(fds.iter().map(|fd| fd.as_raw_fd()).collect())
    }

    pub fn fds(&self) -> &[RawFd] {
        &self.fds
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Encode as a single `SOL_SOCKET`/`SCM_RIGHTS` record.
    ///
    /// An empty block encodes to an empty buffer: no control section at
    /// all, never a zero-length record.
    pub fn to_wire(&self) -> ControlBuffer {
        if self.fds.is_empty() {
            return ControlBuffer::empty();
        }

        let mut data = Vec::with_capacity(self.fds.len() * FD_SIZE);
        for fd in &self.fds {
            data.extend_from_slice(&fd.to_ne_bytes());
        }

        let mut buf = ControlBuffer::for_fds(self.fds.len());
        let pushed = buf.push_record(libc::SOL_SOCKET, libc::SCM_RIGHTS, &data);
        debug_assert!(pushed, "buffer sized with CMSG_SPACE");
        buf
    }

    /// Decode received control data.
    ///
    /// Every record must be `SOL_SOCKET`/`SCM_RIGHTS` with a length that
    /// covers its header and fits in `bytes`. Descriptors from all records
    /// are concatenated in arrival order.
    ///
    /// A record of the wrong level or type does not stop the walk: rights
    /// records after it were installed by the kernel too, so their
    /// descriptors still end up in [`DecodeFailure::stranded`]. Only a
    /// record with an unusable length ends the walk. The first error seen is
    /// the one reported.
    pub fn from_wire(bytes: &[u8]) -> Result<Self, DecodeFailure> {
        let hdr_len = header_len();
        let mut fds = Vec::new();
        let mut first_error: Option<ChannelError> = None;
        let mut offset = 0;

        while offset < bytes.len() {
            let remaining = bytes.len() - offset;
            if remaining < mem::size_of::<libc::cmsghdr>() {
                first_error.get_or_insert(ChannelError::MalformedControl("short control header"));
                break;
            }

            // SAFETY: at least size_of::<cmsghdr>() bytes remain at `offset`.
            let header: libc::cmsghdr = unsafe {
                ptr::read_unaligned(bytes.as_ptr().add(offset).cast::<libc::cmsghdr>())
            };

            let cmsg_len = header.cmsg_len as usize;
            if cmsg_len < hdr_len {
                first_error.get_or_insert(ChannelError::MalformedControl(
                    "record shorter than its header",
                ));
                break;
            }
            if cmsg_len > remaining {
                first_error.get_or_insert(ChannelError::MalformedControl(
                    "record overruns control data",
                ));
                break;
            }

            let data = &bytes[offset + hdr_len..offset + cmsg_len];
            offset += record_space(data.len());

            if header.cmsg_level != libc::SOL_SOCKET || header.cmsg_type != libc::SCM_RIGHTS {
                first_error.get_or_insert(ChannelError::UnexpectedControl {
                    level: header.cmsg_level,
                    ty: header.cmsg_type,
                });
                continue;
            }

            if data.len() % FD_SIZE != 0 {
                first_error.get_or_insert(ChannelError::MalformedControl(
                    "partial descriptor in rights record",
                ));
                continue;
            }
            for chunk in data.chunks_exact(FD_SIZE) {
                let mut raw = [0u8; FD_SIZE];
                raw.copy_from_slice(chunk);
                fds.push(RawFd::from_ne_bytes(raw));
            }
        }

        match first_error {
            None => Ok(Self { fds }),
            Some(error) => Err(DecodeFailure {
                error,
                stranded: AncillaryBlock { fds },
            }),
        }
    }

    /// Take ownership of the descriptors.
    ///
    /// # Safety
    /// The descriptors must be open and owned by nothing else, which holds
    /// for a block decoded from control data this process just received.
    pub unsafe fn into_owned(self) -> Vec<OwnedFd> {
        self.fds
            .into_iter()
            // SAFETY: guaranteed by the caller.
            .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) })
            .collect()
    }
}
