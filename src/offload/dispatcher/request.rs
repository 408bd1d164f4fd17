use std::os::fd::OwnedFd;
use tracing::{debug, info_span, warn, Instrument};

use super::Dispatcher;
use crate::{
    handshake::{StepContext, StepOutcome},
    offload::{
        codec::RequestRecord,
        fatal,
        key::KeyMaterial,
        peer::PeerSocket,
        request::{AuthRequest, AuthResult, RejectedRequest},
        session::AuthSession,
    },
};

impl Dispatcher {
    pub(super) async fn handle_request(&mut self, record: RequestRecord, descriptor: OwnedFd) {
        let span = info_span!("auth_request", correlation_id = record.id);
        self.first_step(record, descriptor).instrument(span).await;
    }

    /// Run the first handshake step inline; park the request as a session
    /// only if the handshake needs more peer input.
    async fn first_step(&mut self, record: RequestRecord, descriptor: OwnedFd) {
        let peer_socket = match PeerSocket::from_fd(descriptor) {
            Ok(peer) => peer,
            Err(err) => {
                warn!("unusable peer descriptor, draining sessions: {err}");
                self.state.abandon_control_channel();
                return;
            }
        };

        let request = match AuthRequest::from_record(record, peer_socket, &self.config.subsystem) {
            Ok(request) => request,
            Err(rejected) => {
                let RejectedRequest { reason, result } = *rejected;
                warn!("rejecting request: {reason}");
                self.send_result(result).await;
                return;
            }
        };

        let AuthRequest {
            correlation_id,
            auth_methods,
            handshake_timeout,
            key_material,
            mut error_stack,
            peer_socket,
        } = request;
        debug!(
            methods = ?auth_methods,
            timeout_secs = handshake_timeout.as_secs(),
            key_protocol = ?key_material.as_ref().map(KeyMaterial::protocol),
            "first handshake step"
        );

        let mut handshake = self.provider.create();
        let outcome = handshake.step(
            &peer_socket,
            StepContext {
                key_material: key_material.as_ref(),
                methods: Some(&auth_methods),
                timeout: Some(handshake_timeout),
                errors: &mut error_stack,
            },
        );

        match outcome {
            StepOutcome::Incomplete => {
                self.state.session_started();
                match AuthSession::new(
                    correlation_id,
                    handshake,
                    error_stack,
                    key_material,
                    peer_socket,
                    self.config.session_deadline,
                ) {
                    Ok(session) => {
                        debug!(
                            active_sessions = self.state.active_sessions(),
                            "handshake parked until the peer answers"
                        );
                        self.sessions.spawn(session);
                    }
                    Err(err) => fatal(format!(
                        "failed to register session for request {correlation_id}: {err}"
                    )),
                }
            }
            StepOutcome::Success { method } => {
                drop(key_material);
                let result = AuthResult::success(correlation_id, method, error_stack, peer_socket);
                self.send_result(result).await;
            }
            StepOutcome::Failure => {
                drop(key_material);
                let result = AuthResult::failure(correlation_id, error_stack, peer_socket);
                self.send_result(result).await;
            }
        }
    }
}
