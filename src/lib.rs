//! # auth-offload (Authentication Offload Worker)
//!
//! `auth-offload` is a short-lived helper process spawned by a parent daemon to
//! run network authentication handshakes on its behalf, so the parent's own
//! event loop never blocks on a slow, multi-round security exchange.
//!
//! ## Control Channel
//!
//! The parent hands the worker exactly one pre-connected stream socket. Over it
//! the parent sends `ALIVE` keepalives, a `STOP` request, and `HANDLE` work
//! requests that carry an authentication request record plus the descriptor of
//! the peer connection to authenticate. The worker answers every `HANDLE` with
//! a result record and hands the (now authenticated or rejected) descriptor
//! back.
//!
//! ## Sessions
//!
//! Each request gets one handshake step immediately. A handshake that cannot
//! finish in that step becomes a session: it is resumed whenever the peer
//! socket is readable and is abandoned with a failure once its deadline
//! passes.
//!
//! ## Shutdown
//!
//! A liveness timer exits the process only when a stop was requested (`STOP`,
//! control channel loss, or keepalive starvation) *and* no session is still in
//! flight, so work already accepted always gets its answer.

pub mod cli;
pub mod handshake;
pub mod offload;

/// Name and version reported in the startup log.
pub const WORKER_IDENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
