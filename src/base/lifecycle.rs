//! Client lifecycle state.
//!
//! `Unconfigured → Ready → ShuttingDown → Closed`. Transitions only move
//! forward; shutdown may be requested any number of times.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// The state of a client instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientState {
    /// Transport not built yet.
    #[default]
    Unconfigured,
    /// Accepting calls.
    Ready,
    /// Pooled resources are being released.
    ShuttingDown,
    /// Terminal.
    Closed,
}

impl ClientState {
    fn as_u8(self) -> u8 {
        match self {
            ClientState::Unconfigured => 0,
            ClientState::Ready => 1,
            ClientState::ShuttingDown => 2,
            ClientState::Closed => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => ClientState::Unconfigured,
            1 => ClientState::Ready,
            2 => ClientState::ShuttingDown,
            _ => ClientState::Closed,
        }
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientState::Unconfigured => "unconfigured",
            ClientState::Ready => "ready",
            ClientState::ShuttingDown => "shutting down",
            ClientState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Atomic holder of a [`ClientState`].
#[derive(Debug, Default)]
pub struct Lifecycle {
    state: AtomicU8,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ClientState {
        ClientState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// `Unconfigured → Ready`. Returns false if the guard already left
    /// `Unconfigured`.
    pub fn mark_ready(&self) -> bool {
        self.transition(ClientState::Unconfigured, ClientState::Ready)
    }

    /// Succeeds only in `Ready`; otherwise returns the state that blocks the call.
    pub fn ensure_ready(&self) -> Result<(), ClientState> {
        match self.state() {
            ClientState::Ready => Ok(()),
            other => Err(other),
        }
    }

    /// Run `teardown` exactly once, on the first call made while `Ready`.
    ///
    /// Returns true if this call performed the shutdown. Later calls, and calls
    /// on a guard that never became ready, do nothing.
    pub fn shutdown_with<F: FnOnce()>(&self, teardown: F) -> bool {
        if !self.transition(ClientState::Ready, ClientState::ShuttingDown) {
            return false;
        }
        teardown();
        self.state.store(ClientState::Closed.as_u8(), Ordering::Release);
        true
    }

    fn transition(&self, from: ClientState, to: ClientState) -> bool {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
