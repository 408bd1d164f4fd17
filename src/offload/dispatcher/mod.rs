//! Control message dispatch and the worker event loop.
//!
//! The dispatcher owns everything process-wide: the control channel, the
//! session table and [`DispatcherState`]. It waits on three sources at once
//! (liveness timer, finished sessions, control messages) and handles each
//! event to completion before waiting again, so state is never shared.

mod request;
mod response;

use std::{fmt, str::FromStr, sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::{
    channel::{ChannelError, ControlChannel},
    codec::{ControlMessage, DEFAULT_MAX_RECORD_BYTES},
    fatal,
    inherit::StartupError,
    liveness::{self, LivenessTimer, TickOutcome, DEFAULT_LIVENESS_INTERVAL},
    request::AuthResult,
    session::{SessionTable, DEFAULT_SESSION_DEADLINE},
    state::DispatcherState,
    EXIT_STOPPED,
};
use crate::handshake::HandshakeProvider;

/// How the parent classifies this worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubsystemType {
    #[default]
    Daemon,
    Tool,
    Client,
}

impl fmt::Display for SubsystemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubsystemType::Daemon => write!(f, "DAEMON"),
            SubsystemType::Tool => write!(f, "TOOL"),
            SubsystemType::Client => write!(f, "CLIENT"),
        }
    }
}

impl FromStr for SubsystemType {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_uppercase().as_str() {
            "DAEMON" => Ok(SubsystemType::Daemon),
            "TOOL" => Ok(SubsystemType::Tool),
            "CLIENT" => Ok(SubsystemType::Client),
            _ => Err(format!("unknown subsystem type: {raw}")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    subsystem: String,
    subsystem_type: SubsystemType,
    liveness_interval: Duration,
    session_deadline: Duration,
    max_record_bytes: usize,
}

impl WorkerConfig {
    #[must_use]
    pub fn new(subsystem: impl Into<String>) -> Self {
        Self {
            subsystem: subsystem.into(),
            subsystem_type: SubsystemType::default(),
            liveness_interval: DEFAULT_LIVENESS_INTERVAL,
            session_deadline: DEFAULT_SESSION_DEADLINE,
            max_record_bytes: DEFAULT_MAX_RECORD_BYTES,
        }
    }

    #[must_use]
    pub fn with_subsystem_type(mut self, subsystem_type: SubsystemType) -> Self {
        self.subsystem_type = subsystem_type;
        self
    }

    #[must_use]
    pub fn with_liveness_interval(mut self, interval: Duration) -> Self {
        self.liveness_interval = interval;
        self
    }

    #[must_use]
    pub fn with_session_deadline(mut self, deadline: Duration) -> Self {
        self.session_deadline = deadline;
        self
    }

    #[must_use]
    pub fn with_max_record_bytes(mut self, max: usize) -> Self {
        self.max_record_bytes = max;
        self
    }

    #[must_use]
    pub fn subsystem(&self) -> &str {
        &self.subsystem
    }

    #[must_use]
    pub fn subsystem_type(&self) -> SubsystemType {
        self.subsystem_type
    }

    #[must_use]
    pub fn liveness_interval(&self) -> Duration {
        self.liveness_interval
    }

    #[must_use]
    pub fn session_deadline(&self) -> Duration {
        self.session_deadline
    }

    #[must_use]
    pub fn max_record_bytes(&self) -> usize {
        self.max_record_bytes
    }

    /// # Errors
    /// Returns an error if the liveness interval or session deadline is zero
    /// or too large to schedule.
    pub fn validate(&self) -> Result<(), StartupError> {
        if self.liveness_interval.is_zero() {
            return Err(StartupError::ZeroLivenessInterval);
        }
        if self.session_deadline.is_zero() {
            return Err(StartupError::ZeroSessionDeadline);
        }
        for (setting, period) in [
            ("liveness interval", self.liveness_interval),
            ("session deadline", self.session_deadline),
        ] {
            if !schedulable(period) {
                return Err(StartupError::DurationOutOfRange {
                    setting,
                    secs: period.as_secs(),
                });
            }
        }
        Ok(())
    }
}

/// Timer deadlines up to two periods ahead must be representable.
fn schedulable(period: Duration) -> bool {
    period
        .checked_mul(2)
        .and_then(|ahead| Instant::now().checked_add(ahead))
        .is_some()
}

pub struct Dispatcher {
    state: DispatcherState,
    channel: ControlChannel,
    sessions: SessionTable,
    provider: Arc<dyn HandshakeProvider>,
    config: WorkerConfig,
    timer: Option<LivenessTimer>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        channel: ControlChannel,
        provider: Arc<dyn HandshakeProvider>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            state: DispatcherState::new(),
            channel,
            sessions: SessionTable::new(),
            provider,
            config,
            timer: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> &DispatcherState {
        &self.state
    }

    #[must_use]
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// One-time setup: validate the configuration and register the liveness
    /// timer. Calling it again is a no-op.
    /// # Errors
    /// Returns an error if the configuration is invalid or the timer cannot be registered.
    pub fn start(&mut self) -> Result<(), StartupError> {
        if self.state.is_initialized() {
            debug!("dispatcher already started");
            return Ok(());
        }
        self.config.validate()?;
        self.timer = Some(LivenessTimer::register(self.config.liveness_interval)?);
        self.state.initialize();

        info!(
            subsystem = %self.config.subsystem,
            subsystem_type = %self.config.subsystem_type,
            liveness_interval_secs = self.config.liveness_interval.as_secs(),
            session_deadline_secs = self.config.session_deadline.as_secs(),
            "authentication offload worker started"
        );
        Ok(())
    }

    /// Serve the control channel until the liveness timer decides to exit.
    ///
    /// Returns the process exit code.
    /// # Errors
    /// Returns an error if startup fails.
    pub async fn run(mut self) -> Result<i32, StartupError> {
        self.start()?;
        let mut timer = match self.timer.take() {
            Some(timer) => timer,
            None => LivenessTimer::register(self.config.liveness_interval)?,
        };

        loop {
            tokio::select! {
                () = timer.tick() => {
                    if let TickOutcome::Exit(code) = liveness::evaluate(&mut self.state) {
                        return Ok(code);
                    }
                }
                Some(result) = self.sessions.next_finished(), if !self.sessions.is_empty() => {
                    self.finish_session(result).await;
                }
                message = self.channel.next_message(), if self.state.control_registered() => {
                    self.on_control_message(message).await;
                }
            }
        }
    }

    async fn on_control_message(&mut self, message: Result<ControlMessage, ChannelError>) {
        match message {
            Ok(ControlMessage::Alive) => {
                trace!("ALIVE");
                self.state.record_keepalive();
            }
            Ok(ControlMessage::Stop) => {
                info!(
                    active_sessions = self.state.active_sessions(),
                    "STOP received, draining sessions"
                );
                self.state.request_stop(EXIT_STOPPED);
            }
            Ok(ControlMessage::Handle {
                request,
                descriptor,
            }) => self.handle_request(request, descriptor).await,
            Err(err) if err.is_desync() => {
                fatal(format!("control channel desynchronized: {err}"));
            }
            Err(err) => {
                warn!(
                    active_sessions = self.state.active_sessions(),
                    "control channel unusable, draining sessions: {err}"
                );
                self.state.abandon_control_channel();
            }
        }
    }

    async fn finish_session(&mut self, result: AuthResult) {
        self.state.session_finished();
        debug!(
            correlation_id = result.correlation_id,
            succeeded = result.succeeded,
            active_sessions = self.state.active_sessions(),
            "session finished"
        );
        self.send_result(result).await;
    }
}
