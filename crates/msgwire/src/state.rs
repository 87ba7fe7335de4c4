// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection state machine.
//!
//! State is split in two:
//! - [`LifeState`] is shared by every thread holding the connection and only
//!   moves forward. Its single `Open -> Closing` transition is compare-and-swap
//!   guarded, so the close sequence runs at most once.
//! - [`Phase`] and [`Readiness`] are owned by the I/O processor and describe
//!   socket progress.
//!
//! ```text
//!   Opening --------> Connecting (outbound) ---+
//!      |                                       |
//!      +--> Handshaking (TLS) <----------------+
//!      |         |                             |
//!      v         v                             |
//!   Connected <-----------------------------------+
//!      |
//!      | close()
//!      v
//!   ShuttingDown { force: false } --(sledgehammer)--> ShuttingDown { force: true }
//!      |                                                   |
//!      v                                                   v
//!   Disconnected <-----------------------------------------+
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

// ============================================================================
// Shared life state
// ============================================================================

/// Coarse lifecycle visible to all threads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LifeState {
    /// Accepted, protocol not yet selected
    Opening = 0,
    /// Protocol selected, traffic flowing
    Open = 1,
    /// Close requested, draining
    Closing = 2,
    /// Socket released
    Closed = 3,
}

impl LifeState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => LifeState::Opening,
            1 => LifeState::Open,
            2 => LifeState::Closing,
            _ => LifeState::Closed,
        }
    }

    /// Whether the connection still accepts work.
    pub fn is_live(self) -> bool {
        matches!(self, LifeState::Opening | LifeState::Open)
    }
}

impl fmt::Display for LifeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifeState::Opening => "Opening",
            LifeState::Open => "Open",
            LifeState::Closing => "Closing",
            LifeState::Closed => "Closed",
        };
        write!(f, "{}", s)
    }
}

/// Atomic cell holding a [`LifeState`].
#[derive(Debug)]
pub struct AtomicLifeState(AtomicU8);

impl AtomicLifeState {
    /// Start in `Opening`.
    pub fn new() -> Self {
        Self(AtomicU8::new(LifeState::Opening as u8))
    }

    /// Current state.
    pub fn load(&self) -> LifeState {
        LifeState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// `Opening -> Open`. Fails if a close already started.
    pub fn open(&self) -> bool {
        self.0
            .compare_exchange(
                LifeState::Opening as u8,
                LifeState::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// `Opening | Open -> Closing`.
    ///
    /// Returns `true` for exactly one caller per connection.
    pub fn begin_close(&self) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if !LifeState::from_u8(current).is_live() {
                return false;
            }
            match self.0.compare_exchange_weak(
                current,
                LifeState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Terminal transition, taken once the socket is released.
    pub fn set_closed(&self) {
        self.0.store(LifeState::Closed as u8, Ordering::Release);
    }
}

impl Default for AtomicLifeState {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Processor-owned phase
// ============================================================================

/// Socket progress as seen by the owning I/O processor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for handshake bytes
    Opening,
    /// Outbound connect in progress
    Connecting,
    /// TLS handshake in progress
    Handshaking,
    /// Steady state
    Connected,
    /// Draining the send queue before release
    ShuttingDown {
        /// Drain abandoned, release immediately
        force: bool,
    },
    /// Socket released; no further system calls
    Disconnected,
}

impl Phase {
    /// Whether inbound data is still processed.
    pub fn reads_allowed(self) -> bool {
        matches!(
            self,
            Phase::Opening | Phase::Handshaking | Phase::Connected
        )
    }

    /// Whether the socket may still be used.
    pub fn has_socket(self) -> bool {
        !matches!(self, Phase::Disconnected)
    }

    /// Whether shutdown has started.
    pub fn is_shutting_down(self) -> bool {
        matches!(self, Phase::ShuttingDown { .. })
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Opening => write!(f, "Opening"),
            Phase::Connecting => write!(f, "Connecting"),
            Phase::Handshaking => write!(f, "Handshaking"),
            Phase::Connected => write!(f, "Connected"),
            Phase::ShuttingDown { force: false } => write!(f, "ShuttingDown"),
            Phase::ShuttingDown { force: true } => write!(f, "ShutdownForce"),
            Phase::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// Readiness flags maintained by the reactor and the state machine.
///
/// `read_wants_write` records that a TLS read could not progress until the
/// socket becomes writable (and `write_wants_read` the reverse), so the
/// blocked direction is retried on the other direction's event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Readiness {
    /// Socket reported readable and no read has hit would-block since
    pub can_read: bool,
    /// Socket reported writable and no write has hit would-block since
    pub can_write: bool,
    /// Read path blocked on a pending write
    pub read_wants_write: bool,
    /// Write path blocked on a pending read
    pub write_wants_read: bool,
}

impl Readiness {
    /// Apply a readiness event from the multiplexer.
    pub fn on_event(&mut self, readable: bool, writable: bool) {
        if readable {
            self.can_read = true;
            if self.write_wants_read {
                self.write_wants_read = false;
                self.can_write = true;
            }
        }
        if writable {
            self.can_write = true;
            if self.read_wants_write {
                self.read_wants_write = false;
                self.can_read = true;
            }
        }
    }

    /// A read returned would-block.
    pub fn read_blocked(&mut self) {
        self.can_read = false;
    }

    /// A write returned would-block.
    pub fn write_blocked(&mut self) {
        self.can_write = false;
    }

    /// The read path needs the socket to become writable first.
    pub fn read_blocked_on_write(&mut self) {
        self.can_read = false;
        self.read_wants_write = true;
    }

    /// The write path needs inbound data first.
    pub fn write_blocked_on_read(&mut self) {
        self.can_write = false;
        self.write_wants_read = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_life_state_forward_only() {
        let state = AtomicLifeState::new();
        assert_eq!(state.load(), LifeState::Opening);
        assert!(state.open());
        assert!(!state.open());
        assert!(state.begin_close());
        assert_eq!(state.load(), LifeState::Closing);
        assert!(!state.begin_close());
        state.set_closed();
        assert!(!state.begin_close());
        assert_eq!(state.load(), LifeState::Closed);
    }

    #[test]
    fn test_close_from_opening() {
        let state = AtomicLifeState::new();
        assert!(state.begin_close());
        assert!(!state.open());
    }

    #[test]
    fn test_concurrent_close_single_winner() {
        for _ in 0..50 {
            let state = Arc::new(AtomicLifeState::new());
            state.open();
            let winners = Arc::new(AtomicUsize::new(0));
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let state = Arc::clone(&state);
                    let winners = Arc::clone(&winners);
                    thread::spawn(move || {
                        if state.begin_close() {
                            winners.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        }
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
            assert_eq!(winners.load(std::sync::atomic::Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_phase_predicates() {
        assert!(Phase::Connected.reads_allowed());
        assert!(!Phase::ShuttingDown { force: false }.reads_allowed());
        assert!(!Phase::Disconnected.has_socket());
        assert!(Phase::ShuttingDown { force: true }.is_shutting_down());
        assert_eq!(Phase::ShuttingDown { force: true }.to_string(), "ShutdownForce");
    }

    #[test]
    fn test_readiness_cross_direction() {
        let mut r = Readiness::default();
        r.on_event(true, false);
        assert!(r.can_read);
        r.read_blocked_on_write();
        assert!(!r.can_read);
        r.on_event(false, true);
        assert!(r.can_read);
        assert!(r.can_write);
        assert!(!r.read_wants_write);

        r.write_blocked_on_read();
        assert!(!r.can_write);
        r.on_event(true, false);
        assert!(r.can_write);
    }
}
