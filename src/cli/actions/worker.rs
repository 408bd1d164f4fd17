use crate::{
    handshake::LineHandshakeProvider,
    offload::{
        dispatcher::SubsystemType, fatal, inherit, ControlChannel, Dispatcher, WorkerConfig,
    },
    WORKER_IDENT,
};
use anyhow::{Context, Result};
use std::{os::fd::RawFd, sync::Arc, time::Duration};
use tracing::{info, info_span, Instrument};
use ulid::Ulid;

#[derive(Debug)]
pub struct Args {
    pub subsystem: String,
    pub subsystem_type: SubsystemType,
    pub inherit_fds: Vec<RawFd>,
    pub liveness_interval: Duration,
    pub session_deadline: Duration,
    pub max_record_bytes: usize,
}

impl Args {
    #[must_use]
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::new(self.subsystem.clone())
            .with_subsystem_type(self.subsystem_type)
            .with_liveness_interval(self.liveness_interval)
            .with_session_deadline(self.session_deadline)
            .with_max_record_bytes(self.max_record_bytes)
    }
}

/// Execute the worker action.
///
/// Startup problems (no usable control socket, zero timer period) abort the
/// process; the parent treats a crashed worker as a failed one.
/// # Errors
/// Returns an error if the control socket cannot be registered with the runtime.
pub async fn execute(args: Args) -> Result<i32> {
    let config = args.worker_config();
    if let Err(err) = config.validate() {
        fatal(err);
    }

    let stream = match inherit::adopt_control_socket(&args.inherit_fds) {
        Ok(stream) => stream,
        Err(err) => fatal(err),
    };
    let channel = ControlChannel::new(stream, config.max_record_bytes())
        .context("failed to register the control socket")?;

    let worker_id = Ulid::new();
    let span = info_span!(
        "worker",
        %worker_id,
        subsystem = %config.subsystem(),
        subsystem_type = %config.subsystem_type()
    );
    info!(parent: &span, version = WORKER_IDENT, pid = std::process::id(), "control socket adopted");

    let dispatcher = Dispatcher::new(channel, Arc::new(LineHandshakeProvider), config);
    match dispatcher.run().instrument(span).await {
        Ok(code) => Ok(code),
        Err(err) => fatal(err),
    }
}
