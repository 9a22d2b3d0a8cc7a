//! Descriptor transfer over real socketpairs.

mod common;

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::AsFd;
use std::os::unix::net::{UnixDatagram, UnixStream};

use common::{init_tracing, pipe, pipe_eof, socketpair};
use fdchannel::{
    ChannelError, ErrorClass, FdChannel, MAX_HANDLES, Received, SocketKind, recv_with_fds,
    send_all_with_fds, send_with_fds,
};

fn read_back(file: &File) -> String {
    let mut file = file.try_clone().unwrap();
    file.seek(SeekFrom::Start(0)).unwrap();
    let mut contents = String::new();
    file.read_to_string(&mut contents).unwrap();
    contents
}

#[test]
fn payload_only_round_trip_on_every_socket_type() {
    init_tracing();
    for ty in [libc::SOCK_STREAM, libc::SOCK_SEQPACKET, libc::SOCK_DGRAM] {
        let (a, b) = socketpair(ty);
        let mut buf = [0u8; 32];
        for len in 1..=buf.len() {
            let payload = vec![len as u8; len];
            assert_eq!(send_with_fds(&a, &payload, &[]).unwrap(), len);

            let got = recv_with_fds(&b, &mut buf, 0).unwrap();
            assert_eq!(got.bytes(), len, "socket type {ty}");
            assert!(got.fds().is_empty());
            assert_eq!(&buf[..len], &payload[..]);
        }
    }
}

#[test]
fn handle_written_through_by_receiver_is_visible_to_sender() {
    init_tracing();
    let (parent, child) = UnixStream::pair().unwrap();
    let file = tempfile::tempfile().unwrap();

    send_with_fds(&parent, b"1", &[file.as_fd()]).unwrap();

    let mut buf = [0u8; 16];
    let Received::Message { len, fds } = recv_with_fds(&child, &mut buf, 1).unwrap() else {
        panic!("expected a message");
    };
    assert_eq!(&buf[..len], b"1");

    let mut received = File::from(fds.into_iter().next().unwrap());
    received.write_all(b"hello, world\n").unwrap();
    drop(received);

    assert_eq!(read_back(&file), "hello, world\n");
}

#[test]
fn many_handles_arrive_in_order() {
    init_tracing();
    let (a, b) = socketpair(libc::SOCK_SEQPACKET);
    let files: Vec<File> = (0..MAX_HANDLES)
        .map(|_| tempfile::tempfile().unwrap())
        .collect();
    let borrowed: Vec<_> = files.iter().map(|f| f.as_fd()).collect();

    send_with_fds(&a, b"all", &borrowed).unwrap();

    let mut buf = [0u8; 8];
    let fds = recv_with_fds(&b, &mut buf, MAX_HANDLES).unwrap().into_fds();
    assert_eq!(fds.len(), MAX_HANDLES);

    for (n, fd) in fds.into_iter().enumerate() {
        let mut received = File::from(fd);
        write!(received, "{n}").unwrap();
    }
    for (n, file) in files.iter().enumerate() {
        assert_eq!(read_back(file), n.to_string());
    }
}

#[test]
fn surplus_handles_are_closed_and_accepted_ones_stay_open() {
    init_tracing();
    let (a, b) = socketpair(libc::SOCK_STREAM);
    let pipes: Vec<_> = (0..5).map(|_| pipe()).collect();

    {
        let write_ends: Vec<_> = pipes.iter().map(|(_, w)| w.as_fd()).collect();
        send_with_fds(&a, b"p", &write_ends).unwrap();
    }
    let read_ends: Vec<_> = pipes.into_iter().map(|(r, _w)| r).collect();

    let mut buf = [0u8; 4];
    let got = recv_with_fds(&b, &mut buf, 2).unwrap();
    assert_eq!(got.fds().len(), 2);

    // Only the receiver's accepted copies keep the first two pipes open.
    assert_eq!(pipe_eof(&read_ends[0]), None);
    assert_eq!(pipe_eof(&read_ends[1]), None);
    for read_end in &read_ends[2..] {
        assert_eq!(pipe_eof(read_end), Some(0));
    }

    drop(got);
    assert_eq!(pipe_eof(&read_ends[0]), Some(0));
    assert_eq!(pipe_eof(&read_ends[1]), Some(0));
}

#[test]
fn zero_max_handles_closes_everything() {
    init_tracing();
    let (a, b) = UnixDatagram::pair().unwrap();
    let (read_end, write_end) = pipe();

    send_with_fds(&a, b"d", &[write_end.as_fd()]).unwrap();
    drop(write_end);

    let mut buf = [0u8; 4];
    let got = recv_with_fds(&b, &mut buf, 0).unwrap();
    assert_eq!(got.bytes(), 1);
    assert!(got.fds().is_empty());
    assert_eq!(pipe_eof(&read_end), Some(0));
}

#[test]
fn empty_payload_handle_payload_only_and_end_of_channel_are_distinct() {
    init_tracing();
    let (a, b) = socketpair(libc::SOCK_SEQPACKET);
    let file = tempfile::tempfile().unwrap();
    let mut buf = [0u8; 4];

    send_with_fds(&a, &[], &[file.as_fd()]).unwrap();
    send_with_fds(&a, b"1", &[]).unwrap();

    let with_handle = recv_with_fds(&b, &mut buf, 1).unwrap();
    assert_eq!((with_handle.bytes(), with_handle.fds().len()), (0, 1));

    let with_byte = recv_with_fds(&b, &mut buf, 1).unwrap();
    assert_eq!((with_byte.bytes(), with_byte.fds().len()), (1, 0));

    let (s, r) = UnixStream::pair().unwrap();
    drop(s);
    assert!(recv_with_fds(&r, &mut buf, 1).unwrap().is_closed());
}

#[test]
fn ceiling_is_enforced_before_sending() {
    let (a, b) = UnixDatagram::pair().unwrap();
    b.set_nonblocking(true).unwrap();
    let file = tempfile::tempfile().unwrap();
    let borrowed = vec![file.as_fd(); MAX_HANDLES + 1];

    let err = send_with_fds(&a, b"x", &borrowed).unwrap_err();
    assert_eq!(err.class(), ErrorClass::CallerContract);
    assert!(!err.is_fatal());

    // Nothing reached the peer.
    let mut buf = [0u8; 4];
    let err = recv_with_fds(&b, &mut buf, 1).unwrap_err();
    assert!(err.is_would_block());
}

#[test]
fn truncated_message_is_fatal() {
    init_tracing();
    let (a, b) = socketpair(libc::SOCK_DGRAM);
    let (read_end, write_end) = pipe();

    send_with_fds(&a, &[1u8; 100], &[write_end.as_fd()]).unwrap();
    drop(write_end);

    let mut buf = [0u8; 10];
    let err = recv_with_fds(&b, &mut buf, 1).unwrap_err();
    assert_eq!(err.class(), ErrorClass::Truncation);
    assert!(err.is_fatal());
    assert_eq!(pipe_eof(&read_end), Some(0));
}

#[cfg(any(target_os = "linux", target_os = "android"))]
#[test]
fn credentials_ahead_of_rights_do_not_leak_handles() {
    use std::os::fd::AsRawFd;

    init_tracing();
    let (a, b) = socketpair(libc::SOCK_SEQPACKET);
    let one: libc::c_int = 1;
    // SAFETY: setsockopt reads `one` for the provided length.
    let rc = unsafe {
        libc::setsockopt(
            b.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PASSCRED,
            (&one as *const libc::c_int).cast(),
            std::mem::size_of_val(&one) as libc::socklen_t,
        )
    };
    assert_eq!(rc, 0, "SO_PASSCRED: {}", std::io::Error::last_os_error());

    let (read_end, write_end) = pipe();
    send_with_fds(&a, b"c", &[write_end.as_fd()]).unwrap();
    drop(write_end);

    let mut buf = [0u8; 4];
    let err = recv_with_fds(&b, &mut buf, 1).unwrap_err();
    assert!(matches!(
        err,
        ChannelError::UnexpectedControl { level, ty }
            if level == libc::SOL_SOCKET && ty == libc::SCM_CREDENTIALS
    ));
    assert_eq!(err.class(), ErrorClass::TypeConfusion);
    assert_eq!(pipe_eof(&read_end), Some(0));
}

#[test]
fn send_all_delivers_large_payload_and_handles_once() {
    init_tracing();
    let (a, b) = UnixStream::pair().unwrap();
    let file = tempfile::tempfile().unwrap();
    let payload: Vec<u8> = (0..4 * 1024 * 1024).map(|i| (i % 251) as u8).collect();

    let reader = std::thread::spawn(move || {
        let mut received = Vec::new();
        let mut fds = Vec::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match recv_with_fds(&b, &mut buf, 4).unwrap() {
                Received::Message { len, fds: mut got } => {
                    received.extend_from_slice(&buf[..len]);
                    fds.append(&mut got);
                }
                Received::Closed => break,
            }
        }
        (received, fds)
    });

    let sent = send_all_with_fds(&a, &payload, &[file.as_fd()]).unwrap();
    assert_eq!(sent, payload.len());
    drop(a);

    let (received, fds) = reader.join().unwrap();
    assert_eq!(received, payload);
    assert_eq!(fds.len(), 1);
}

#[test]
fn channel_caches_socket_kind() {
    let (a, b) = UnixDatagram::pair().unwrap();
    let sender = FdChannel::new(a).unwrap();
    let receiver = FdChannel::new(b).unwrap();
    assert_eq!(sender.kind(), SocketKind::Datagram);

    sender.send(&[], &[]).unwrap();
    let mut buf = [0u8; 4];
    let got = receiver.recv(&mut buf, 1).unwrap();
    assert!(!got.is_closed());
    assert_eq!(got.bytes(), 0);

    let stream = FdChannel::new(UnixStream::pair().unwrap().0).unwrap();
    let file = tempfile::tempfile().unwrap();
    let err = stream.send(&[], &[file.as_fd()]).unwrap_err();
    assert!(matches!(err, ChannelError::EmptyStreamPayload { fds: 1 }));
}
