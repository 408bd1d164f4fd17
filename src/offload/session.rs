//! Parked handshakes waiting for peer input.

use std::{
    collections::HashMap,
    io,
    os::fd::{AsRawFd, RawFd},
    time::Duration,
};
use tokio::{
    io::{unix::AsyncFd, Interest},
    task::JoinSet,
    time::{sleep_until, Instant},
};
use tracing::{debug, info_span, warn, Instrument};

use super::{
    error_stack::ErrorStack, fatal, key::KeyMaterial, peer::PeerSocket, request::AuthResult,
};
use crate::handshake::{Handshake, StepContext, StepOutcome};

/// Error-stack code for a session abandoned at its deadline.
pub const CODE_DEADLINE_EXPIRED: i32 = 1100;

pub const DEFAULT_SESSION_DEADLINE: Duration = Duration::from_secs(120);

/// A handshake that did not finish in its first step.
///
/// Owns the error stack and key material until it finishes; the key is
/// dropped right after the last step and the stack moves into the result.
pub struct AuthSession {
    correlation_id: i64,
    handshake: Box<dyn Handshake>,
    error_stack: ErrorStack,
    key_material: Option<KeyMaterial>,
    socket: AsyncFd<PeerSocket>,
    deadline: Instant,
}

impl AuthSession {
    /// Register the peer socket for readiness, setting `default_deadline`
    /// from now unless the socket already carries one.
    /// # Errors
    /// Returns an error if the deadline cannot be represented or the socket
    /// cannot be registered with the runtime.
    pub fn new(
        correlation_id: i64,
        handshake: Box<dyn Handshake>,
        error_stack: ErrorStack,
        key_material: Option<KeyMaterial>,
        mut peer_socket: PeerSocket,
        default_deadline: Duration,
    ) -> io::Result<Self> {
        let deadline = match peer_socket.deadline() {
            Some(deadline) => deadline,
            None => {
                let deadline = Instant::now().checked_add(default_deadline).ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("session deadline of {}s cannot be scheduled", default_deadline.as_secs()),
                    )
                })?;
                peer_socket.set_deadline(deadline);
                deadline
            }
        };
        let socket = AsyncFd::with_interest(peer_socket, Interest::READABLE)?;
        Ok(Self {
            correlation_id,
            handshake,
            error_stack,
            key_material,
            socket,
            deadline,
        })
    }

    #[must_use]
    pub fn correlation_id(&self) -> i64 {
        self.correlation_id
    }

    #[cfg(test)]
    fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Resume the handshake on every readiness edge until it finishes or the
    /// deadline passes.
    pub async fn run(self) -> AuthResult {
        let AuthSession {
            correlation_id,
            mut handshake,
            mut error_stack,
            key_material,
            socket,
            deadline,
        } = self;

        let outcome = loop {
            tokio::select! {
                () = sleep_until(deadline) => {
                    error_stack.push(CODE_DEADLINE_EXPIRED, "handshake deadline expired");
                    break StepOutcome::Failure;
                }
                ready = socket.readable() => {
                    let mut guard = match ready {
                        Ok(guard) => guard,
                        Err(err) => {
                            warn!("peer socket readiness failed: {err}");
                            error_stack.push(crate::handshake::CODE_IO, err.to_string());
                            break StepOutcome::Failure;
                        }
                    };
                    if guard.get_inner().is_expired() {
                        error_stack.push(CODE_DEADLINE_EXPIRED, "handshake deadline expired");
                        break StepOutcome::Failure;
                    }
                    let outcome = handshake.step(
                        guard.get_inner(),
                        StepContext {
                            key_material: key_material.as_ref(),
                            methods: None,
                            timeout: None,
                            errors: &mut error_stack,
                        },
                    );
                    if outcome.is_finished() {
                        break outcome;
                    }
                    // the step drained the socket
                    guard.clear_ready();
                }
            }
        };
        drop(key_material);

        let peer_socket = socket.into_inner();
        match outcome {
            StepOutcome::Success { method } => {
                debug!(method = ?method, "handshake succeeded");
                AuthResult::success(correlation_id, method, error_stack, peer_socket)
            }
            StepOutcome::Failure | StepOutcome::Incomplete => {
                debug!(errors = error_stack.len(), "handshake failed");
                AuthResult::failure(correlation_id, error_stack, peer_socket)
            }
        }
    }
}

/// In-flight sessions keyed by peer socket.
///
/// Removal from the table is the only way a session ends; a session whose
/// task completed is taken out by [`SessionTable::next_finished`].
#[derive(Default)]
pub struct SessionTable {
    tasks: JoinSet<AuthResult>,
    registered: HashMap<RawFd, i64>,
}

impl SessionTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn(&mut self, session: AuthSession) {
        let fd = session.socket.as_raw_fd();
        let correlation_id = session.correlation_id();
        if let Some(previous) = self.registered.insert(fd, correlation_id) {
            fatal(format!(
                "peer socket {fd} already has a session (request {previous})"
            ));
        }
        let span = info_span!("auth_session", correlation_id);
        self.tasks.spawn(session.run().instrument(span));
    }

    /// Wait for the next session to finish. Cancel safe.
    pub async fn next_finished(&mut self) -> Option<AuthResult> {
        match self.tasks.join_next().await? {
            Ok(result) => {
                self.deregister(result.peer_socket.as_raw_fd());
                Some(result)
            }
            Err(err) => fatal(format!("authentication session task failed: {err}")),
        }
    }

    /// Returns `true` if the socket was still registered.
    pub fn deregister(&mut self, fd: RawFd) -> bool {
        self.registered.remove(&fd).is_some()
    }

    #[cfg(test)]
    fn is_registered(&self, fd: RawFd) -> bool {
        self.registered.contains_key(&fd)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        io::Write,
        os::{fd::OwnedFd, unix::net::UnixStream},
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };

    /// Incomplete until a byte arrives; counts its invocations.
    struct WaitForByte {
        steps: Arc<AtomicUsize>,
    }

    impl Handshake for WaitForByte {
        fn step(&mut self, peer: &PeerSocket, ctx: StepContext<'_>) -> StepOutcome {
            use std::io::Read;
            self.steps.fetch_add(1, Ordering::SeqCst);
            let mut buf = [0u8; 16];
            let mut socket = peer.socket();
            match socket.read(&mut buf) {
                Ok(n) if n > 0 => StepOutcome::Success {
                    method: Some("BYTE".to_string()),
                },
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => StepOutcome::Incomplete,
                _ => {
                    ctx.errors.push(1, "closed");
                    StepOutcome::Failure
                }
            }
        }
    }

    fn session(
        deadline: Duration,
    ) -> io::Result<(AuthSession, UnixStream, Arc<AtomicUsize>)> {
        let (worker_end, client) = UnixStream::pair()?;
        let steps = Arc::new(AtomicUsize::new(0));
        let session = AuthSession::new(
            5,
            Box::new(WaitForByte {
                steps: Arc::clone(&steps),
            }),
            ErrorStack::new("test"),
            Some(KeyMaterial::new("psk", vec![1, 2, 3])),
            PeerSocket::from_fd(OwnedFd::from(worker_end))?,
            deadline,
        )?;
        Ok((session, client, steps))
    }

    #[tokio::test]
    async fn resumes_on_readiness() -> io::Result<()> {
        let (session, mut client, steps) = session(Duration::from_secs(30))?;
        let mut table = SessionTable::new();
        table.spawn(session);
        assert_eq!(table.len(), 1);

        client.write_all(b"x")?;
        let result = table.next_finished().await.expect("one session");
        assert!(result.succeeded);
        assert_eq!(result.method_used.as_deref(), Some("BYTE"));
        assert_eq!(result.correlation_id, 5);
        assert!(steps.load(Ordering::SeqCst) >= 1);
        assert!(!table.is_registered(result.peer_socket.as_raw_fd()));
        assert!(table.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn deadline_expiry_fails_without_stepping() -> io::Result<()> {
        let (session, _client, steps) = session(Duration::from_millis(50))?;
        let mut table = SessionTable::new();
        table.spawn(session);

        let result = table.next_finished().await.expect("one session");
        assert!(!result.succeeded);
        assert!(result.method_used.is_none());
        assert_eq!(
            result.error_stack.entries().last().map(|entry| entry.code),
            Some(CODE_DEADLINE_EXPIRED)
        );
        assert_eq!(steps.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn existing_socket_deadline_is_kept() -> io::Result<()> {
        let (worker_end, _client) = UnixStream::pair()?;
        let mut peer = PeerSocket::from_fd(OwnedFd::from(worker_end))?;
        let preset = Instant::now() + Duration::from_secs(5);
        peer.set_deadline(preset);

        let session = AuthSession::new(
            1,
            Box::new(WaitForByte {
                steps: Arc::new(AtomicUsize::new(0)),
            }),
            ErrorStack::new("test"),
            None,
            peer,
            Duration::from_secs(600),
        )?;
        assert_eq!(session.deadline(), preset);
        Ok(())
    }

    #[tokio::test]
    async fn unschedulable_deadline_is_an_error() -> io::Result<()> {
        let (worker_end, _client) = UnixStream::pair()?;
        let result = AuthSession::new(
            2,
            Box::new(WaitForByte {
                steps: Arc::new(AtomicUsize::new(0)),
            }),
            ErrorStack::new("test"),
            None,
            PeerSocket::from_fd(OwnedFd::from(worker_end))?,
            Duration::from_secs(u64::MAX),
        );
        assert!(matches!(result, Err(err) if err.kind() == io::ErrorKind::InvalidInput));
        Ok(())
    }
}
