//! Procedure Gate
//!
//! The transport accepts one group-wide start, stop or update procedure at a
//! time. The gate is a binary permit held from submission until the transport's
//! completion callback, plus a single deferred-retry marker: a start requested
//! while the permit is held is remembered once, and repeated requests coalesce
//! into that one marker.

use crate::UnicastError;
use core::cell::Cell;
use embassy_sync::{
    blocking_mutex::{Mutex, raw::CriticalSectionRawMutex},
    signal::Signal,
};
use embassy_time::{Duration, Instant, with_deadline};

/// Procedure currently holding the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Procedure {
    /// Group start (QoS, enable, start)
    Start,
    /// Group stop, optionally releasing streams
    Stop,
    /// Metadata update
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct GateState {
    held: Option<Procedure>,
    retry_pending: bool,
}

/// Single-slot permit for transport procedures
pub struct ProcedureGate {
    state: Mutex<CriticalSectionRawMutex, Cell<GateState>>,
    released: Signal<CriticalSectionRawMutex, ()>,
}

impl ProcedureGate {
    /// Create a free gate
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(Cell::new(GateState {
                held: None,
                retry_pending: false,
            })),
            released: Signal::new(),
        }
    }

    /// Take the permit if it is free
    pub fn try_acquire(&self, procedure: Procedure) -> bool {
        self.state.lock(|cell| {
            let mut state = cell.get();
            if state.held.is_some() {
                return false;
            }
            state.held = Some(procedure);
            cell.set(state);
            true
        })
    }

    /// Take the permit, waiting for a release for at most `timeout`
    ///
    /// # Errors
    /// Returns `UnicastError::GateTimeout` if the permit stayed held for the whole budget.
    pub async fn acquire(&self, procedure: Procedure, timeout: Duration) -> Result<(), UnicastError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_acquire(procedure) {
                return Ok(());
            }
            if with_deadline(deadline, self.released.wait()).await.is_err() {
                warn!("[PROCEDURE] Gate still held by {:?}", self.holder());
                return Err(UnicastError::GateTimeout);
            }
        }
    }

    /// Release the permit; returns whether a deferred retry was pending
    ///
    /// The retry marker is consumed by this call.
    pub fn release(&self) -> bool {
        let retry = self.state.lock(|cell| {
            let state = cell.get();
            cell.set(GateState::default());
            state.retry_pending
        });
        self.released.signal(());
        retry
    }

    /// Pass a held permit on to another procedure without releasing it
    ///
    /// Returns `false` if the permit was not held.
    pub fn hand_over(&self, procedure: Procedure) -> bool {
        self.state.lock(|cell| {
            let mut state = cell.get();
            let Some(previous) = state.held else {
                return false;
            };
            debug!("[PROCEDURE] Gate handed from {:?} to {:?}", previous, procedure);
            state.held = Some(procedure);
            cell.set(state);
            true
        })
    }

    /// Remember that a start must be retried once the permit is released
    pub fn defer_retry(&self) {
        self.state.lock(|cell| {
            let mut state = cell.get();
            if state.retry_pending {
                debug!("[PROCEDURE] Retry already pending, coalescing");
            }
            state.retry_pending = true;
            cell.set(state);
        });
    }

    /// Procedure holding the permit, if any
    #[must_use]
    pub fn holder(&self) -> Option<Procedure> {
        self.state.lock(|cell| cell.get().held)
    }

    /// Whether a deferred retry is pending
    #[must_use]
    pub fn retry_pending(&self) -> bool {
        self.state.lock(|cell| cell.get().retry_pending)
    }
}

impl Default for ProcedureGate {
    fn default() -> Self {
        Self::new()
    }
}
