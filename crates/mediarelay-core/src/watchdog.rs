//! Run-time deadline that stops the relay unless the right connections
//! come up in time.

use crate::config::TimeoutMode;
use mediarelay_transport::Role;
use std::time::{Duration, Instant};
use tracing::info;

/// Deadline checked once per loop iteration.
#[derive(Debug, Clone)]
pub struct Watchdog {
    timeout: Option<Duration>,
    mode: TimeoutMode,
    deadline: Option<Instant>,
    source_connected: bool,
    target_connected: bool,
    quiet: bool,
}

impl Watchdog {
    /// Arm at `now` when a timeout is configured.
    #[must_use]
    pub fn new(timeout: Option<Duration>, mode: TimeoutMode, quiet: bool, now: Instant) -> Self {
        let mut watchdog = Self {
            timeout,
            mode,
            deadline: None,
            source_connected: false,
            target_connected: false,
            quiet,
        };
        watchdog.arm(now);
        watchdog
    }

    fn arm(&mut self, now: Instant) {
        let Some(timeout) = self.timeout else {
            return;
        };
        self.deadline = Some(now + timeout);
        if !self.quiet {
            info!("TIMEOUT: will interrupt after {}s", timeout.as_secs_f64());
        }
    }

    fn connected(&mut self, role: Role) -> &mut bool {
        match role {
            Role::Source => &mut self.source_connected,
            Role::Target => &mut self.target_connected,
        }
    }

    fn all_governed_connected(&self) -> bool {
        let source = !self.mode.governs(Role::Source) || self.source_connected;
        let target = !self.mode.governs(Role::Target) || self.target_connected;
        self.mode != TimeoutMode::Overall && source && target
    }

    /// `role` is connected; cancels the deadline once every governed role is.
    pub fn on_connected(&mut self, role: Role) {
        if !self.mode.governs(role) {
            return;
        }
        *self.connected(role) = true;
        if self.deadline.is_some() && self.all_governed_connected() {
            self.deadline = None;
            if !self.quiet {
                info!("TIMEOUT: cancel");
            }
        }
    }

    /// `role` lost its connection; re-arms a cancelled deadline.
    pub fn on_lost(&mut self, role: Role, now: Instant) {
        if !self.mode.governs(role) {
            return;
        }
        *self.connected(role) = false;
        if self.deadline.is_none() {
            self.arm(now);
        }
    }

    /// Whether the deadline has passed
    #[must_use]
    pub fn expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }

    /// Whether a deadline is pending
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }
}
