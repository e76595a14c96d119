//! Passing file descriptors over a unix socket with SCM_RIGHTS.

use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use tokio::io::Interest;
use tokio::net::UnixStream;

/// Descriptors sent per build: stdout, stderr, status.
pub const BUILD_FDS: usize = 3;

/// Send `fds` with a one-byte payload.
pub async fn send_fds(stream: &UnixStream, fds: &[RawFd]) -> io::Result<()> {
    let sock = stream.as_raw_fd();
    let payload = [1u8];
    stream
        .async_io(Interest::WRITABLE, || {
            let iov = [IoSlice::new(&payload)];
            let cmsgs = [ControlMessage::ScmRights(fds)];
            sendmsg::<()>(sock, &iov, &cmsgs, MsgFlags::MSG_NOSIGNAL, None)?;
            Ok(())
        })
        .await
}

/// Receive exactly `count` descriptors sent by [`send_fds`].
pub async fn recv_fds(stream: &UnixStream, count: usize) -> io::Result<Vec<OwnedFd>> {
    let sock = stream.as_raw_fd();
    let raw = stream
        .async_io(Interest::READABLE, || {
            let mut payload = [0u8; 1];
            let mut iov = [IoSliceMut::new(&mut payload)];
            let mut cmsg = nix::cmsg_space!([RawFd; BUILD_FDS]);
            let msg = recvmsg::<()>(
                sock,
                &mut iov,
                Some(cmsg.as_mut_slice()),
                MsgFlags::MSG_CMSG_CLOEXEC,
            )?;
            if msg.bytes == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "descriptor socket closed",
                ));
            }
            let mut fds = Vec::new();
            for c in msg.cmsgs()? {
                if let ControlMessageOwned::ScmRights(received) = c {
                    fds.extend(received);
                }
            }
            Ok(fds)
        })
        .await?;

    // SAFETY: the kernel installed these descriptors in this process for us;
    // nothing else refers to them.
    let owned: Vec<OwnedFd> = raw
        .into_iter()
        .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) })
        .collect();
    if owned.len() != count {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("expected {count} descriptors, received {}", owned.len()),
        ));
    }
    Ok(owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::fd::AsFd;

    #[tokio::test]
    async fn descriptors_arrive_usable() {
        let (a, b) = super::super::socket_pair().unwrap();
        let a = super::super::unix_stream(a).unwrap();
        let b = super::super::unix_stream(b).unwrap();

        let (r1, w1) = nix::unistd::pipe().unwrap();
        let (r2, _w2) = nix::unistd::pipe().unwrap();
        let (r3, _w3) = nix::unistd::pipe().unwrap();
        send_fds(
            &a,
            &[
                r1.as_fd().as_raw_fd(),
                r2.as_fd().as_raw_fd(),
                r3.as_fd().as_raw_fd(),
            ],
        )
        .await
        .unwrap();
        drop(r1);

        let mut fds = recv_fds(&b, BUILD_FDS).await.unwrap();
        let mut w1 = std::fs::File::from(w1);
        w1.write_all(b"hi").unwrap();
        drop(w1);
        let mut got = String::new();
        std::fs::File::from(fds.remove(0))
            .read_to_string(&mut got)
            .unwrap();
        assert_eq!(got, "hi");
    }
}
