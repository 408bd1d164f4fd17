//! Pluggable authentication handshakes.
//!
//! A handshake is driven one step at a time over the non-blocking peer
//! socket. A step that cannot finish with the input available so far reports
//! [`StepOutcome::Incomplete`] after reading everything the socket had, so the
//! caller can wait for the next readiness edge before stepping again.

pub mod line;

pub use self::line::LineHandshakeProvider;

use std::time::Duration;

use crate::offload::{ErrorStack, KeyMaterial, PeerSocket};

pub const CODE_NO_COMMON_METHOD: i32 = 1001;
pub const CODE_PROTOCOL: i32 = 1002;
pub const CODE_PEER_CLOSED: i32 = 1003;
pub const CODE_TIMEOUT: i32 = 1004;
pub const CODE_KEY_REQUIRED: i32 = 1005;
pub const CODE_BAD_RESPONSE: i32 = 1006;
pub const CODE_IO: i32 = 1007;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Incomplete,
    Success { method: Option<String> },
    Failure,
}

impl StepOutcome {
    #[must_use]
    pub fn is_finished(&self) -> bool {
        !matches!(self, StepOutcome::Incomplete)
    }
}

/// Inputs of one step.
///
/// `methods` and `timeout` are only passed on the first step; a continued
/// handshake keeps what it was started with.
pub struct StepContext<'a> {
    pub key_material: Option<&'a KeyMaterial>,
    pub methods: Option<&'a [String]>,
    pub timeout: Option<Duration>,
    pub errors: &'a mut ErrorStack,
}

pub trait Handshake: Send {
    fn step(&mut self, peer: &PeerSocket, ctx: StepContext<'_>) -> StepOutcome;
}

/// Creates one handshake per request.
pub trait HandshakeProvider: Send + Sync {
    fn create(&self) -> Box<dyn Handshake>;
}
