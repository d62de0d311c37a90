//! Two-state readiness flag shared between the SSH listener and health probes.
//!
//! `Closed` means the listener is accepting traffic. Transitions are
//! compare-and-swap only, so a flip succeeds exactly once per prior state.

use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CircuitState {
    Open = 0,
    Closed = 1,
}

impl CircuitState {
    fn from_raw(raw: u8) -> Self {
        if raw == CircuitState::Closed as u8 {
            CircuitState::Closed
        } else {
            CircuitState::Open
        }
    }
}

#[derive(Debug)]
pub struct Circuit {
    state: AtomicU8,
}

impl Circuit {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(CircuitState::Open as u8),
        }
    }

    /// Point-in-time read; callers needing certainty must poll.
    pub fn state(&self) -> CircuitState {
        CircuitState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    /// `Open -> Closed`. Returns whether this call performed the transition.
    pub fn close(&self) -> bool {
        self.transition(CircuitState::Open, CircuitState::Closed)
    }

    /// `Closed -> Open`. Returns whether this call performed the transition.
    pub fn open(&self) -> bool {
        self.transition(CircuitState::Closed, CircuitState::Open)
    }

    fn transition(&self, from: CircuitState, to: CircuitState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for Circuit {
    fn default() -> Self {
        Self::new()
    }
}
