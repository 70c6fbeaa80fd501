//! One-time switch activation gate.
//!
//! NIC notifications may arrive while the registry is still being populated
//! from the fabric's enumeration. They block here until the switch is
//! activated, activation fails, or the wait policy expires.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Result, VportError};

/// Published activation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActivationState {
    #[default]
    Pending,
    Activated,
    Failed,
}

/// Readiness flag plus failure channel.
#[derive(Debug, Default)]
pub struct ActivationGate {
    state: Mutex<ActivationState>,
    cond: Condvar,
}

impl ActivationGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ActivationState {
        *self.state.lock()
    }

    pub fn is_activated(&self) -> bool {
        self.state() == ActivationState::Activated
    }

    /// Mark the switch active and release all waiters.
    ///
    /// A gate that already failed stays failed.
    pub fn activate(&self) -> bool {
        self.publish(ActivationState::Activated)
    }

    /// Mark activation as permanently failed and release all waiters.
    pub fn fail(&self) -> bool {
        self.publish(ActivationState::Failed)
    }

    fn publish(&self, next: ActivationState) -> bool {
        let mut state = self.state.lock();
        if *state != ActivationState::Pending {
            return *state == next;
        }
        *state = next;
        self.cond.notify_all();
        true
    }

    /// Block until the gate leaves `Pending` or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while *state == ActivationState::Pending {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        match *state {
            ActivationState::Activated => Ok(()),
            ActivationState::Failed => Err(VportError::ActivationFailed),
            ActivationState::Pending => Err(VportError::NotActivated(timeout.as_millis() as u64)),
        }
    }
}
