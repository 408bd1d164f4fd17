//! Discovery of the control socket among the descriptors inherited from the parent.

use nix::fcntl::{fcntl, FcntlArg};
use socket2::{SockRef, Type};
use std::{
    io,
    os::{
        fd::{BorrowedFd, FromRawFd, OwnedFd, RawFd},
        unix::net::UnixStream,
    },
};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("no inherited stream socket among descriptors {0:?}")]
    NoControlSocket(Vec<RawFd>),
    #[error("expected exactly one inherited stream socket, found {}: {found:?}", found.len())]
    MultipleControlSockets { found: Vec<RawFd> },
    #[error("failed to configure control socket: {0}")]
    Configure(#[source] io::Error),
    #[error("liveness interval must be greater than zero")]
    ZeroLivenessInterval,
    #[error("session deadline must be greater than zero")]
    ZeroSessionDeadline,
    #[error("{setting} of {secs}s cannot be scheduled")]
    DurationOutOfRange { setting: &'static str, secs: u64 },
}

/// Parse a comma separated descriptor list such as `3,4`.
/// # Errors
/// Returns an error string naming the first entry that is not a descriptor number.
pub fn parse_fd_list(raw: &str) -> Result<Vec<RawFd>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry
                .parse::<RawFd>()
                .ok()
                .filter(|fd| *fd >= 0)
                .ok_or_else(|| format!("invalid descriptor: {entry}"))
        })
        .collect()
}

fn is_stream_socket(fd: RawFd) -> bool {
    if fcntl(fd, FcntlArg::F_GETFD).is_err() {
        return false;
    }
    // SAFETY: F_GETFD just confirmed `fd` is open, and the borrow does not
    // outlive this function.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    SockRef::from(&borrowed)
        .r#type()
        .is_ok_and(|kind| kind == Type::STREAM)
}

/// The candidates that are open stream sockets, deduplicated and sorted.
#[must_use]
pub fn stream_sockets(candidates: &[RawFd]) -> Vec<RawFd> {
    let mut unique = candidates.to_vec();
    unique.sort_unstable();
    unique.dedup();
    unique
        .into_iter()
        .filter(|fd| {
            let stream = is_stream_socket(*fd);
            if !stream {
                debug!(fd, "ignoring inherited descriptor that is not a stream socket");
            }
            stream
        })
        .collect()
}

/// Take ownership of the single inherited stream socket.
///
/// The check happens before any descriptor is adopted, so on error nothing
/// is closed.
/// # Errors
/// Returns an error if zero or more than one stream socket was inherited.
pub fn adopt_control_socket(candidates: &[RawFd]) -> Result<UnixStream, StartupError> {
    let found = stream_sockets(candidates);
    let fd = match found.as_slice() {
        [] => return Err(StartupError::NoControlSocket(candidates.to_vec())),
        [fd] => *fd,
        _ => return Err(StartupError::MultipleControlSockets { found }),
    };

    // SAFETY: the parent handed this descriptor to us for exclusive use and no
    // other object in this process has adopted it.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    let stream = UnixStream::from(owned);
    stream
        .set_nonblocking(true)
        .map_err(StartupError::Configure)?;
    debug!(fd, "adopted control socket");
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        net::UdpSocket,
        os::fd::{AsRawFd, IntoRawFd},
    };

    #[test]
    fn parse_fd_list_accepts_commas_and_spaces() {
        assert_eq!(parse_fd_list("3, 4,,5"), Ok(vec![3, 4, 5]));
        assert_eq!(parse_fd_list(""), Ok(Vec::new()));
        assert!(parse_fd_list("3,x").is_err());
        assert!(parse_fd_list("-1").is_err());
    }

    #[test]
    fn zero_stream_sockets_is_fatal() -> io::Result<()> {
        let udp = UdpSocket::bind("127.0.0.1:0")?;
        let result = adopt_control_socket(&[udp.as_raw_fd(), 1_000_000]);
        assert!(matches!(result, Err(StartupError::NoControlSocket(_))));

        assert!(matches!(
            adopt_control_socket(&[]),
            Err(StartupError::NoControlSocket(_))
        ));
        Ok(())
    }

    #[test]
    fn two_stream_sockets_is_fatal() -> io::Result<()> {
        let (a, b) = UnixStream::pair()?;
        let result = adopt_control_socket(&[a.as_raw_fd(), b.as_raw_fd()]);
        match result {
            Err(StartupError::MultipleControlSockets { found }) => assert_eq!(found.len(), 2),
            other => panic!("expected MultipleControlSockets, got {other:?}"),
        }
        // nothing was adopted, both ends are still ours and open
        assert!(is_stream_socket(a.as_raw_fd()));
        assert!(is_stream_socket(b.as_raw_fd()));
        Ok(())
    }

    #[test]
    fn exactly_one_stream_socket_is_adopted() -> io::Result<()> {
        let (a, _b) = UnixStream::pair()?;
        let udp = UdpSocket::bind("127.0.0.1:0")?;
        let raw = a.into_raw_fd();

        let stream = adopt_control_socket(&[udp.as_raw_fd(), raw, raw])
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
        assert_eq!(stream.as_raw_fd(), raw);
        Ok(())
    }
}
