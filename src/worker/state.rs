//! Connection state owned by the worker controller.
//!
//! State machine:
//! `Disconnected -> Connecting -> ChannelsOpening -> Ready`,
//! `Ready -> Closing -> Disconnected` on a requested shutdown and
//! `Ready -> Reconnecting -> Connecting` on an unexpected loss.

use std::fmt;
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    Connecting,
    ChannelsOpening,
    Ready,
    Closing,
    Reconnecting,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Disconnected => "disconnected",
            Phase::Connecting => "connecting",
            Phase::ChannelsOpening => "channels-opening",
            Phase::Ready => "ready",
            Phase::Closing => "closing",
            Phase::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// Linear backoff between connection attempts.
///
/// Each failure first grows the delay by one step (capped at `max`) and then
/// waits that long, so the first retry already waits one step. The delay only
/// goes back to zero once a connection reaches [`Phase::Ready`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    step: Duration,
    max: Duration,
    delay: Duration,
}

impl ReconnectPolicy {
    pub fn new(step: Duration, max: Duration) -> Self {
        Self {
            step,
            max,
            delay: Duration::ZERO,
        }
    }

    /// Registers one more consecutive failure and returns how long to wait.
    pub fn next_delay(&mut self) -> Duration {
        self.delay = (self.delay + self.step).min(self.max);
        self.delay
    }

    pub fn reset(&mut self) {
        self.delay = Duration::ZERO;
    }

    pub fn current(&self) -> Duration {
        self.delay
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

/// Per-connection state. Only the controller mutates it; everybody else
/// observes the phase through [`ConnectionState::subscribe`].
pub(crate) struct ConnectionState {
    phase: watch::Sender<Phase>,
    pub(crate) backoff: ReconnectPolicy,
}

impl ConnectionState {
    pub(crate) fn new(backoff: ReconnectPolicy) -> Self {
        let (phase, _) = watch::channel(Phase::Disconnected);
        Self { phase, backoff }
    }

    pub(crate) fn set_phase(&self, next: Phase) {
        let previous = self.phase.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "worker phase changed");
        }
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }
}
