//! Line oriented handshake.
//!
//! ```text
//! worker: AUTH CLAIMTOBE,SHAREDKEY
//! peer:   METHOD SHAREDKEY
//! worker: CHALLENGE <base64 nonce>
//! peer:   RESPONSE <base64 sha256(key || nonce)>
//! worker: OK SHAREDKEY
//! ```
//!
//! `CLAIMTOBE <user>` trusts the peer's claim and is meant for local and
//! test deployments.

use base64ct::{Base64, Encoding};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::{
    io::{self, Read, Write},
    time::{Duration, Instant},
};
use subtle::ConstantTimeEq;
use tracing::{debug, trace};

use super::{
    Handshake, HandshakeProvider, StepContext, StepOutcome, CODE_BAD_RESPONSE, CODE_IO,
    CODE_KEY_REQUIRED, CODE_NO_COMMON_METHOD, CODE_PEER_CLOSED, CODE_PROTOCOL, CODE_TIMEOUT,
};
use crate::offload::{ErrorStack, KeyMaterial, PeerSocket};

pub const METHOD_CLAIMTOBE: &str = "CLAIMTOBE";
pub const METHOD_SHAREDKEY: &str = "SHAREDKEY";

const SUPPORTED_METHODS: [&str; 2] = [METHOD_CLAIMTOBE, METHOD_SHAREDKEY];
const NONCE_LEN: usize = 32;
const MAX_LINE: usize = 1024;
const MAX_BUFFERED: usize = 4 * MAX_LINE;

#[derive(Debug, Default, Clone, Copy)]
pub struct LineHandshakeProvider;

impl HandshakeProvider for LineHandshakeProvider {
    fn create(&self) -> Box<dyn Handshake> {
        Box::new(LineHandshake::new())
    }
}

enum Phase {
    Start,
    AwaitMethod,
    AwaitResponse { nonce: [u8; NONCE_LEN] },
    Done,
}

pub struct LineHandshake {
    phase: Phase,
    offered: Vec<&'static str>,
    started: Option<Instant>,
    timeout: Option<Duration>,
    inbound: Vec<u8>,
}

impl LineHandshake {
    #[must_use]
    pub fn new() -> Self {
        Self {
            phase: Phase::Start,
            offered: Vec::new(),
            started: None,
            timeout: None,
            inbound: Vec::new(),
        }
    }

    fn advance(
        &mut self,
        peer: &PeerSocket,
        key_material: Option<&KeyMaterial>,
        methods: Option<&[String]>,
        timeout: Option<Duration>,
        errors: &mut ErrorStack,
    ) -> StepOutcome {
        match self.phase {
            Phase::Done => {
                errors.push(CODE_PROTOCOL, "handshake already finished");
                return StepOutcome::Failure;
            }
            Phase::Start => {
                self.started = Some(Instant::now());
                // zero means the parent set no pacing of its own
                self.timeout = timeout.filter(|limit| !limit.is_zero());
                self.offered = offered_methods(methods.unwrap_or_default());
                if self.offered.is_empty() {
                    errors.push(
                        CODE_NO_COMMON_METHOD,
                        format!("none of the requested methods {methods:?} is supported"),
                    );
                    return deny(peer);
                }
                if let Err(err) = send_line(peer, &format!("AUTH {}", self.offered.join(","))) {
                    errors.push(CODE_IO, format!("failed to offer methods: {err}"));
                    return StepOutcome::Failure;
                }
                self.phase = Phase::AwaitMethod;
            }
            Phase::AwaitMethod | Phase::AwaitResponse { .. } => {}
        }

        if self.timed_out() {
            errors.push(CODE_TIMEOUT, "handshake timed out");
            return deny(peer);
        }

        let eof = match self.fill(peer) {
            Ok(eof) => eof,
            Err(err) => {
                errors.push(CODE_IO, format!("failed to read from peer: {err}"));
                return StepOutcome::Failure;
            }
        };

        while let Some(line) = self.next_line() {
            trace!(line = %line, "handshake line");
            match self.on_line(&line, peer, key_material, errors) {
                StepOutcome::Incomplete => {}
                finished => return finished,
            }
        }

        if self.inbound.len() > MAX_LINE {
            errors.push(CODE_PROTOCOL, "handshake line too long");
            return deny(peer);
        }
        if eof {
            errors.push(CODE_PEER_CLOSED, "peer closed the connection during the handshake");
            return StepOutcome::Failure;
        }
        StepOutcome::Incomplete
    }

    fn on_line(
        &mut self,
        line: &str,
        peer: &PeerSocket,
        key_material: Option<&KeyMaterial>,
        errors: &mut ErrorStack,
    ) -> StepOutcome {
        match self.phase {
            Phase::AwaitMethod => self.on_method(line, peer, key_material, errors),
            Phase::AwaitResponse { nonce } => on_response(line, &nonce, peer, key_material, errors),
            Phase::Start | Phase::Done => {
                errors.push(CODE_PROTOCOL, format!("unexpected line {line:?}"));
                deny(peer)
            }
        }
    }

    fn on_method(
        &mut self,
        line: &str,
        peer: &PeerSocket,
        key_material: Option<&KeyMaterial>,
        errors: &mut ErrorStack,
    ) -> StepOutcome {
        let mut parts = line.splitn(3, ' ');
        let (Some("METHOD"), Some(name)) = (parts.next(), parts.next()) else {
            errors.push(CODE_PROTOCOL, format!("expected METHOD, got {line:?}"));
            return deny(peer);
        };
        let argument = parts.next().map(str::trim).filter(|arg| !arg.is_empty());

        let Some(method) = self
            .offered
            .iter()
            .copied()
            .find(|offered| offered.eq_ignore_ascii_case(name))
        else {
            errors.push(CODE_PROTOCOL, format!("method {name} was not offered"));
            return deny(peer);
        };

        if method == METHOD_CLAIMTOBE {
            let Some(user) = argument else {
                errors.push(CODE_PROTOCOL, "CLAIMTOBE requires a user name");
                return deny(peer);
            };
            debug!(user, "peer claimed its identity");
            return accept(peer, method, errors);
        }

        if key_material.is_none() {
            errors.push(CODE_KEY_REQUIRED, "SHAREDKEY requires key material");
            return deny(peer);
        }
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        if let Err(err) = send_line(peer, &format!("CHALLENGE {}", Base64::encode_string(&nonce))) {
            errors.push(CODE_IO, format!("failed to send challenge: {err}"));
            return StepOutcome::Failure;
        }
        self.phase = Phase::AwaitResponse { nonce };
        StepOutcome::Incomplete
    }

    fn timed_out(&self) -> bool {
        self.started
            .zip(self.timeout)
            .is_some_and(|(started, limit)| started.elapsed() > limit)
    }

    /// Read everything the socket has. Returns `true` on end of stream.
    fn fill(&mut self, peer: &PeerSocket) -> io::Result<bool> {
        let mut reader = peer.socket();
        let mut chunk = [0u8; 512];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => return Ok(true),
                Ok(read) => {
                    self.inbound.extend_from_slice(&chunk[..read]);
                    if self.inbound.len() > MAX_BUFFERED {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "peer sent more than a handshake needs",
                        ));
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
    }

    fn next_line(&mut self) -> Option<String> {
        let end = self.inbound.iter().position(|byte| *byte == b'\n')?;
        let raw: Vec<u8> = self.inbound.drain(..=end).collect();
        let line = String::from_utf8_lossy(&raw[..end]);
        Some(line.trim_end_matches('\r').to_string())
    }
}

impl Default for LineHandshake {
    fn default() -> Self {
        Self::new()
    }
}

impl Handshake for LineHandshake {
    fn step(&mut self, peer: &PeerSocket, ctx: StepContext<'_>) -> StepOutcome {
        let StepContext {
            key_material,
            methods,
            timeout,
            errors,
        } = ctx;
        let outcome = self.advance(peer, key_material, methods, timeout, errors);
        if outcome.is_finished() {
            self.phase = Phase::Done;
        }
        outcome
    }
}

fn on_response(
    line: &str,
    nonce: &[u8; NONCE_LEN],
    peer: &PeerSocket,
    key_material: Option<&KeyMaterial>,
    errors: &mut ErrorStack,
) -> StepOutcome {
    let Some(encoded) = line.strip_prefix("RESPONSE ") else {
        errors.push(CODE_PROTOCOL, format!("expected RESPONSE, got {line:?}"));
        return deny(peer);
    };
    let Some(key) = key_material else {
        errors.push(CODE_KEY_REQUIRED, "SHAREDKEY requires key material");
        return deny(peer);
    };

    let expected = Sha256::new()
        .chain_update(key.expose())
        .chain_update(nonce)
        .finalize();
    match Base64::decode_vec(encoded.trim()) {
        Ok(answer) if bool::from(answer.as_slice().ct_eq(expected.as_slice())) => {
            accept(peer, METHOD_SHAREDKEY, errors)
        }
        _ => {
            errors.push(CODE_BAD_RESPONSE, "shared key response does not match");
            deny(peer)
        }
    }
}

/// Requested methods this handshake supports, in request order.
fn offered_methods(requested: &[String]) -> Vec<&'static str> {
    let mut offered = Vec::new();
    for name in requested {
        if let Some(method) = SUPPORTED_METHODS
            .iter()
            .copied()
            .find(|method| method.eq_ignore_ascii_case(name))
        {
            if !offered.contains(&method) {
                offered.push(method);
            }
        }
    }
    offered
}

fn accept(peer: &PeerSocket, method: &str, errors: &mut ErrorStack) -> StepOutcome {
    match send_line(peer, &format!("OK {method}")) {
        Ok(()) => StepOutcome::Success {
            method: Some(method.to_string()),
        },
        Err(err) => {
            errors.push(CODE_IO, format!("failed to confirm {method}: {err}"));
            StepOutcome::Failure
        }
    }
}

fn deny(peer: &PeerSocket) -> StepOutcome {
    if let Err(err) = send_line(peer, "DENIED") {
        debug!("failed to notify peer of denial: {err}");
    }
    StepOutcome::Failure
}

fn send_line(peer: &PeerSocket, line: &str) -> io::Result<()> {
    let mut writer = peer.socket();
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\n")
}
