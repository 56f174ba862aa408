//! Lifecycle states shared by workers and the service supervisor.
//!
//! Both layers run the same state machine:
//!
//! 1. `Stopped` until someone starts them
//! 2. `Starting` while the background task spins up
//! 3. `Started` for the lifetime of the receive loop
//! 4. `Stopping` once shutdown is requested
//! 5. back to `Stopped`, or `Disposed` once torn down for good
//!
//! Transitions are claimed via compare-and-swap on an atomic cell, so exactly
//! one caller wins a given transition even when lifecycle calls race the
//! background task itself.

use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};
use strum::{Display, FromRepr};

/// Lifecycle state of a worker or of the whole service.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, FromRepr, Default,
)]
#[repr(u8)]
pub enum Status {
    /// Not running. The initial state, and the resting state after a stop.
    #[default]
    Stopped = 0,
    /// A start call won the transition and is bringing the loop up.
    Starting = 1,
    /// The receive loop is running.
    Started = 2,
    /// Shutdown requested; the loop drains its in-flight message and exits.
    Stopping = 3,
    /// Terminal. Every lifecycle call except another dispose is rejected.
    Disposed = 4,
}

/// Atomic holder for a [`Status`] with compare-and-swap transitions.
///
/// The background task and external lifecycle callers race on this cell;
/// plain reads or lock-guarded fields are not enough, every mutation goes
/// through an atomic operation.
#[derive(Debug)]
pub(crate) struct StatusCell(AtomicU8);

impl StatusCell {
    pub(crate) fn new(initial: Status) -> Self {
        Self(AtomicU8::new(initial as u8))
    }

    pub(crate) fn get(&self) -> Status {
        Status::from_repr(self.0.load(Ordering::Acquire)).unwrap_or(Status::Disposed)
    }

    /// Attempts the `from -> to` transition. Returns whether this caller won.
    pub(crate) fn transition(&self, from: Status, to: Status) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Unconditionally moves to `to`, returning the previous state.
    pub(crate) fn swap(&self, to: Status) -> Status {
        Status::from_repr(self.0.swap(to as u8, Ordering::AcqRel)).unwrap_or(Status::Disposed)
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new(Status::Stopped)
    }
}
