//! Authentication offload worker core.
//!
//! Flow Overview:
//! - `inherit` locates the single control socket handed down by the parent.
//! - `channel` reads and writes the framed control protocol (`codec`),
//!   including descriptor transfer.
//! - `dispatcher` turns control messages into actions, runs the first
//!   handshake step of every request and parks unfinished ones as sessions.
//! - `session` resumes a parked handshake on socket readiness until it
//!   finishes or its deadline passes.
//! - `liveness` decides on every timer tick whether the worker may exit.

pub mod channel;
pub mod codec;
pub mod dispatcher;
pub mod error_stack;
pub mod inherit;
pub mod key;
pub mod liveness;
pub mod peer;
pub mod request;
pub mod session;
pub mod state;

pub use self::channel::{ChannelError, ControlChannel};
pub use self::dispatcher::{Dispatcher, WorkerConfig};
pub use self::error_stack::{ErrorEntry, ErrorStack};
pub use self::key::KeyMaterial;
pub use self::peer::PeerSocket;
pub use self::state::DispatcherState;

use std::fmt::Display;
use tracing::error;

/// Exit code after an explicit `STOP` (or control channel loss with no
/// keepalive starvation).
pub const EXIT_STOPPED: i32 = 0;

/// Exit code after the parent stopped sending keepalives.
pub const EXIT_KEEPALIVE_TIMEOUT: i32 = 1;

/// Abort the process on an unrecoverable configuration or protocol error.
///
/// The worker has no other way to reach its parent once its own setup or the
/// control channel framing can no longer be trusted.
pub fn fatal(message: impl Display) -> ! {
    error!("fatal: {message}");
    std::process::abort()
}
