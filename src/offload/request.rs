use std::time::Duration;
use thiserror::Error;

use super::{
    codec::RequestRecord,
    error_stack::ErrorStack,
    key::{KeyError, KeyMaterial},
    peer::PeerSocket,
};

/// Error-stack code for a request whose attributes cannot be used.
pub const CODE_INVALID_REQUEST: i32 = 1000;

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("negative AuthTimeout {0}")]
    NegativeTimeout(i64),
    #[error("invalid key info: {0}")]
    Key(#[from] KeyError),
}

/// A decoded `HANDLE` request, ready for its first handshake step.
#[derive(Debug)]
pub struct AuthRequest {
    pub correlation_id: i64,
    pub auth_methods: Vec<String>,
    pub handshake_timeout: Duration,
    pub key_material: Option<KeyMaterial>,
    pub error_stack: ErrorStack,
    pub peer_socket: PeerSocket,
}

/// A request rejected before any handshake step; still answered with a
/// failure so the parent gets its descriptor back.
#[derive(Debug)]
pub struct RejectedRequest {
    pub reason: RequestError,
    pub result: AuthResult,
}

impl AuthRequest {
    /// # Errors
    /// Returns the failure result to send if the timeout or key info is invalid.
    pub fn from_record(
        record: RequestRecord,
        peer_socket: PeerSocket,
        subsystem: &str,
    ) -> Result<Self, Box<RejectedRequest>> {
        let RequestRecord {
            id,
            auth_methods,
            auth_timeout,
            key_info_protocol,
            key_info_data,
            error_stack,
        } = record;
        let mut error_stack = ErrorStack::seeded(subsystem, error_stack);

        let parsed = u64::try_from(auth_timeout)
            .map_err(|_| RequestError::NegativeTimeout(auth_timeout))
            .and_then(|seconds| {
                let key_material = key_info_protocol
                    .as_deref()
                    .map(|protocol| KeyMaterial::from_record(protocol, key_info_data.as_deref()))
                    .transpose()?;
                Ok((Duration::from_secs(seconds), key_material))
            });

        match parsed {
            Ok((handshake_timeout, key_material)) => Ok(Self {
                correlation_id: id,
                auth_methods: parse_methods(&auth_methods),
                handshake_timeout,
                key_material,
                error_stack,
                peer_socket,
            }),
            Err(reason) => {
                error_stack.push(CODE_INVALID_REQUEST, reason.to_string());
                Err(Box::new(RejectedRequest {
                    reason,
                    result: AuthResult::failure(id, error_stack, peer_socket),
                }))
            }
        }
    }
}

/// `AuthMethods` is comma separated; order is preserved and blanks dropped.
#[must_use]
pub fn parse_methods(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|method| !method.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Outcome of one request, consumed by response assembly.
#[derive(Debug)]
pub struct AuthResult {
    pub correlation_id: i64,
    pub succeeded: bool,
    pub method_used: Option<String>,
    pub error_stack: ErrorStack,
    pub peer_socket: PeerSocket,
}

impl AuthResult {
    #[must_use]
    pub fn success(
        correlation_id: i64,
        method_used: Option<String>,
        error_stack: ErrorStack,
        peer_socket: PeerSocket,
    ) -> Self {
        Self {
            correlation_id,
            succeeded: true,
            method_used,
            error_stack,
            peer_socket,
        }
    }

    #[must_use]
    pub fn failure(correlation_id: i64, error_stack: ErrorStack, peer_socket: PeerSocket) -> Self {
        Self {
            correlation_id,
            succeeded: false,
            method_used: None,
            error_stack,
            peer_socket,
        }
    }
}
