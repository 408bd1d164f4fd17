use super::EXIT_STOPPED;

/// Process-wide dispatcher bookkeeping.
///
/// Only the dispatcher mutates this, always from the single runtime thread.
#[derive(Debug)]
pub struct DispatcherState {
    initialized: bool,
    control_registered: bool,
    keepalive_count: u64,
    active_sessions: usize,
    stop_requested: bool,
    stop_exit_code: i32,
}

impl DispatcherState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            initialized: false,
            control_registered: false,
            keepalive_count: 0,
            active_sessions: 0,
            stop_requested: false,
            stop_exit_code: EXIT_STOPPED,
        }
    }

    /// Mark one-time setup as done. Returns `false` if it already was.
    pub fn initialize(&mut self) -> bool {
        if self.initialized {
            return false;
        }
        self.initialized = true;
        self.control_registered = true;
        true
    }

    pub fn record_keepalive(&mut self) {
        self.keepalive_count = self.keepalive_count.saturating_add(1);
    }

    pub fn request_stop(&mut self, exit_code: i32) {
        self.stop_requested = true;
        self.stop_exit_code = exit_code;
    }

    /// The parent is unreachable: stop reading the control channel and exit
    /// once in-flight sessions have drained.
    pub fn abandon_control_channel(&mut self) {
        self.stop_requested = true;
        self.control_registered = false;
    }

    pub fn session_started(&mut self) {
        self.active_sessions += 1;
    }

    pub fn session_finished(&mut self) {
        debug_assert!(self.active_sessions > 0, "session accounting underflow");
        self.active_sessions = self.active_sessions.saturating_sub(1);
    }

    pub(crate) fn reset_keepalives(&mut self) {
        self.keepalive_count = 0;
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    #[must_use]
    pub fn control_registered(&self) -> bool {
        self.control_registered
    }

    #[must_use]
    pub fn keepalive_count(&self) -> u64 {
        self.keepalive_count
    }

    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.active_sessions
    }

    #[must_use]
    pub fn stop_requested(&self) -> bool {
        self.stop_requested
    }

    #[must_use]
    pub fn stop_exit_code(&self) -> i32 {
        self.stop_exit_code
    }
}

impl Default for DispatcherState {
    fn default() -> Self {
        Self::new()
    }
}
