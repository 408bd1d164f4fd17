use serde::{Deserialize, Serialize};
use socket2::{Domain, SockAddr, Socket};
use std::{
    io,
    os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd},
};
use tokio::time::Instant;

/// The connection under authentication, handed over by the parent.
///
/// Besides the socket itself it carries the per-socket deadline the event
/// loop uses to abandon stalled peers.
#[derive(Debug)]
pub struct PeerSocket {
    socket: Socket,
    deadline: Option<Instant>,
}

/// Connection state handed back to the parent next to the descriptor, so it
/// can rebuild its own connection object around it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub domain: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline_remaining_ms: Option<u64>,
    pub authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

impl PeerSocket {
    /// Take ownership of a received descriptor and switch it to non-blocking mode.
    /// # Errors
    /// Returns an error if the descriptor cannot be made non-blocking.
    pub fn from_fd(fd: OwnedFd) -> io::Result<Self> {
        let socket = Socket::from(fd);
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            deadline: None,
        })
    }

    #[must_use]
    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn set_deadline(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    #[must_use]
    pub fn connection_state(&self, method: Option<&str>) -> ConnectionState {
        let local = self.socket.local_addr().ok();
        let peer = self.socket.peer_addr().ok();
        let domain = local
            .as_ref()
            .or(peer.as_ref())
            .map_or("unknown", |addr| domain_name(addr.domain()));

        ConnectionState {
            domain: domain.to_string(),
            local_address: local.as_ref().and_then(render_address),
            peer_address: peer.as_ref().and_then(render_address),
            deadline_remaining_ms: self.deadline.map(|deadline| {
                let remaining = deadline.saturating_duration_since(Instant::now());
                u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX)
            }),
            authenticated: method.is_some(),
            method: method.map(ToString::to_string),
        }
    }

    /// Freeze the connection state into the opaque string sent to the parent.
    /// # Errors
    /// Returns an error if the state cannot be serialized.
    pub fn serialize_state(&self, method: Option<&str>) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.connection_state(method))
    }
}

fn domain_name(domain: Domain) -> &'static str {
    if domain == Domain::IPV4 {
        "inet"
    } else if domain == Domain::IPV6 {
        "inet6"
    } else if domain == Domain::UNIX {
        "unix"
    } else {
        "unknown"
    }
}

fn render_address(addr: &SockAddr) -> Option<String> {
    addr.as_socket().map(|socket_addr| socket_addr.to_string())
}

impl AsRawFd for PeerSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

impl AsFd for PeerSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }
}

impl From<PeerSocket> for OwnedFd {
    fn from(peer: PeerSocket) -> Self {
        peer.socket.into()
    }
}
