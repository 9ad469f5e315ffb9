//! Typing presence debouncer.
//!
//! Turns raw keystroke events into discrete "typing started" / "typing
//! stopped" signals. The machine has two states:
//!
//! ```text
//!            input / Started                 input (re-arm)
//!   Idle ───────────────────────▶ Typing ◀───────────────┐
//!    ▲                              │  └─────────────────┘
//!    └──── deadline or send / Stopped
//! ```
//!
//! Time is passed in by the caller, so the transitions are pure. The chat
//! coordinator sleeps until [`TypingDebouncer::deadline`] and then calls
//! [`TypingDebouncer::on_deadline`].

use std::time::Duration;

use tokio::time::Instant;

/// Default quiet period after the last keystroke before "stopped" is sent.
pub const DEFAULT_QUIET_PERIOD: Duration = Duration::from_millis(2000);

/// A transition that must be signalled to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingChange {
    /// The local user started a burst of input.
    Started,
    /// The burst ended (quiet period elapsed or message sent).
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Typing { deadline: Instant },
}

/// Two-state debouncer for local typing presence.
#[derive(Debug, Clone)]
pub struct TypingDebouncer {
    quiet_period: Duration,
    state: State,
}

impl Default for TypingDebouncer {
    fn default() -> Self {
        Self::new(DEFAULT_QUIET_PERIOD)
    }
}

impl TypingDebouncer {
    /// Creates an idle debouncer with the given quiet period.
    #[must_use]
    pub const fn new(quiet_period: Duration) -> Self {
        Self {
            quiet_period,
            state: State::Idle,
        }
    }

    /// Handles a keystroke or input change at `now`.
    ///
    /// Returns [`TypingChange::Started`] only for the first keystroke of a
    /// burst; later keystrokes just push the deadline out.
    pub fn on_input(&mut self, now: Instant) -> Option<TypingChange> {
        let deadline = now + self.quiet_period;
        match self.state {
            State::Idle => {
                self.state = State::Typing { deadline };
                Some(TypingChange::Started)
            }
            State::Typing { .. } => {
                self.state = State::Typing { deadline };
                None
            }
        }
    }

    /// Handles an explicit send/submit.
    ///
    /// Stops a burst immediately and cancels the pending deadline.
    pub fn on_send(&mut self) -> Option<TypingChange> {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Typing { .. } => Some(TypingChange::Stopped),
            State::Idle => None,
        }
    }

    /// Handles the quiet-period timer.
    ///
    /// Emits [`TypingChange::Stopped`] only if a burst is active and its
    /// deadline has passed; early or stale wake-ups are ignored.
    pub fn on_deadline(&mut self, now: Instant) -> Option<TypingChange> {
        match self.state {
            State::Typing { deadline } if now >= deadline => {
                self.state = State::Idle;
                Some(TypingChange::Stopped)
            }
            _ => None,
        }
    }

    /// Drops any active burst without emitting anything.
    ///
    /// Used when the connection drops and there is nothing left to signal.
    pub fn reset(&mut self) {
        self.state = State::Idle;
    }

    /// When the current burst will end if no more input arrives.
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        match self.state {
            State::Typing { deadline } => Some(deadline),
            State::Idle => None,
        }
    }

    /// Whether a burst is currently active.
    #[must_use]
    pub const fn is_typing(&self) -> bool {
        matches!(self.state, State::Typing { .. })
    }

    /// The configured quiet period.
    #[must_use]
    pub const fn quiet_period(&self) -> Duration {
        self.quiet_period
    }
}
