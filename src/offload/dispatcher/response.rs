use bytes::BytesMut;
use std::os::fd::AsRawFd;
use tracing::{debug, info, warn};

use super::Dispatcher;
use crate::offload::{
    channel::ChannelError,
    codec::{self, Opcode, ResultRecord, STATUS_FAILURE, STATUS_SUCCESS},
    peer::PeerSocket,
    request::AuthResult,
};

impl Dispatcher {
    /// Hand the result and the peer descriptor back to the parent.
    ///
    /// Any write failure means the parent is gone: the peer socket is
    /// dropped without a reply and the worker starts draining.
    pub(super) async fn send_result(&mut self, result: AuthResult) {
        let AuthResult {
            correlation_id,
            succeeded,
            method_used,
            error_stack,
            peer_socket,
        } = result;

        if !self.state.control_registered() {
            debug!(correlation_id, "control channel is gone, dropping peer without a reply");
            return;
        }

        let mut preamble = BytesMut::new();
        codec::put_int(&mut preamble, Opcode::Handle as i64);
        codec::put_eom(&mut preamble);
        if let Err(err) = self.channel.send(&preamble).await {
            self.channel_lost(correlation_id, &err);
            return;
        }

        if self.sessions.deregister(peer_socket.as_raw_fd()) {
            debug!(correlation_id, "peer socket was still registered");
        }

        let connection_state = peer_socket
            .serialize_state(method_used.as_deref())
            .unwrap_or_else(|err| {
                warn!(correlation_id, "failed to serialize connection state: {err}");
                String::new()
            });
        let record = ResultRecord {
            method_used,
            status: if succeeded { STATUS_SUCCESS } else { STATUS_FAILURE },
            id: correlation_id,
            error_stack: error_stack.into_entries(),
            connection_state,
        };

        if let Err(err) = self.send_body(&record, &peer_socket).await {
            self.channel_lost(correlation_id, &err);
            return;
        }
        info!(
            correlation_id,
            status = record.status,
            method = ?record.method_used,
            errors = record.error_stack.len(),
            "result handed back"
        );
    }

    async fn send_body(&self, record: &ResultRecord, peer: &PeerSocket) -> Result<(), ChannelError> {
        let mut body = BytesMut::new();
        codec::put_record(&mut body, record)?;
        self.channel.send(&body).await?;
        self.channel.send_descriptor(peer).await?;
        let mut tail = BytesMut::new();
        codec::put_eom(&mut tail);
        self.channel.send(&tail).await
    }

    fn channel_lost(&mut self, correlation_id: i64, err: &ChannelError) {
        warn!(correlation_id, "failed to send result, draining sessions: {err}");
        self.state.abandon_control_channel();
    }
}
