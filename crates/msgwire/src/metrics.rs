// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Endpoint and connection statistics.
//!
//! Counters are plain atomics updated with relaxed ordering from whichever
//! thread observes the event; readers take a [`snapshot`](EndpointStats::snapshot).
//!
//! # Example
//!
//! ```
//! use msgwire::metrics::EndpointStats;
//!
//! let stats = EndpointStats::new();
//! stats.record_connect();
//! stats.record_read(128, 1);
//!
//! let snapshot = stats.snapshot();
//! assert_eq!(snapshot.connect_active, 1);
//! assert_eq!(snapshot.read_bytes, 128);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use parking_lot::Mutex;

// ============================================================================
// Endpoint statistics
// ============================================================================

/// Live statistics block of an endpoint.
#[derive(Debug)]
pub struct EndpointStats {
    /// Currently open connections
    connect_active: AtomicU64,

    /// Connections accepted since start
    connect_count: AtomicU64,

    /// Connections refused or failed before becoming useful
    bad_connect_count: AtomicU64,

    /// Accept calls that failed
    accept_errors: AtomicU64,

    read_bytes: AtomicU64,
    read_msgs: AtomicU64,
    write_bytes: AtomicU64,
    write_msgs: AtomicU64,
    lost_msgs: AtomicU64,

    reset_time: Mutex<SystemTime>,
}

impl EndpointStats {
    /// Create a zeroed statistics block.
    pub fn new() -> Self {
        Self {
            connect_active: AtomicU64::new(0),
            connect_count: AtomicU64::new(0),
            bad_connect_count: AtomicU64::new(0),
            accept_errors: AtomicU64::new(0),
            read_bytes: AtomicU64::new(0),
            read_msgs: AtomicU64::new(0),
            write_bytes: AtomicU64::new(0),
            write_msgs: AtomicU64::new(0),
            lost_msgs: AtomicU64::new(0),
            reset_time: Mutex::new(SystemTime::now()),
        }
    }

    // ========================================================================
    // Connection recording
    // ========================================================================

    /// Record an accepted connection.
    pub fn record_connect(&self) {
        self.connect_count.fetch_add(1, Ordering::Relaxed);
        self.connect_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection fully closed.
    pub fn record_disconnect(&self) {
        // Saturating: a reset between connect and disconnect must not wrap
        let _ = self
            .connect_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    /// Record a refused or failed connection.
    pub fn record_bad_connect(&self) {
        self.bad_connect_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed accept call.
    pub fn record_accept_error(&self) {
        self.accept_errors.fetch_add(1, Ordering::Relaxed);
    }

    // ========================================================================
    // Traffic recording
    // ========================================================================

    /// Record inbound bytes and frames.
    pub fn record_read(&self, bytes: u64, msgs: u64) {
        self.read_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.read_msgs.fetch_add(msgs, Ordering::Relaxed);
    }

    /// Record outbound bytes and messages.
    pub fn record_write(&self, bytes: u64, msgs: u64) {
        self.write_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.write_msgs.fetch_add(msgs, Ordering::Relaxed);
    }

    /// Record messages discarded because their connection went away.
    pub fn record_lost(&self, msgs: u64) {
        self.lost_msgs.fetch_add(msgs, Ordering::Relaxed);
    }

    /// Currently open connections.
    pub fn active(&self) -> u64 {
        self.connect_active.load(Ordering::Relaxed)
    }

    /// Zero the traffic and connection-count counters (active count is kept).
    pub fn reset(&self) {
        self.connect_count.store(0, Ordering::Relaxed);
        self.bad_connect_count.store(0, Ordering::Relaxed);
        self.accept_errors.store(0, Ordering::Relaxed);
        self.read_bytes.store(0, Ordering::Relaxed);
        self.read_msgs.store(0, Ordering::Relaxed);
        self.write_bytes.store(0, Ordering::Relaxed);
        self.write_msgs.store(0, Ordering::Relaxed);
        self.lost_msgs.store(0, Ordering::Relaxed);
        *self.reset_time.lock() = SystemTime::now();
    }

    /// Take a snapshot of current values.
    pub fn snapshot(&self) -> EndpointStatsSnapshot {
        EndpointStatsSnapshot {
            connect_active: self.connect_active.load(Ordering::Relaxed),
            connect_count: self.connect_count.load(Ordering::Relaxed),
            bad_connect_count: self.bad_connect_count.load(Ordering::Relaxed),
            accept_errors: self.accept_errors.load(Ordering::Relaxed),
            read_bytes: self.read_bytes.load(Ordering::Relaxed),
            read_msgs: self.read_msgs.load(Ordering::Relaxed),
            write_bytes: self.write_bytes.load(Ordering::Relaxed),
            write_msgs: self.write_msgs.load(Ordering::Relaxed),
            lost_msgs: self.lost_msgs.load(Ordering::Relaxed),
            reset_time: *self.reset_time.lock(),
        }
    }
}

impl Default for EndpointStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`EndpointStats`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointStatsSnapshot {
    /// Currently open connections
    pub connect_active: u64,
    /// Connections accepted since reset
    pub connect_count: u64,
    /// Refused or failed connections since reset
    pub bad_connect_count: u64,
    /// Failed accept calls since reset
    pub accept_errors: u64,
    /// Inbound bytes
    pub read_bytes: u64,
    /// Inbound frames
    pub read_msgs: u64,
    /// Outbound bytes
    pub write_bytes: u64,
    /// Outbound messages
    pub write_msgs: u64,
    /// Discarded messages
    pub lost_msgs: u64,
    /// Last reset
    pub reset_time: SystemTime,
}

// ============================================================================
// Connection counters
// ============================================================================

/// Per-connection traffic counters.
#[derive(Debug, Default)]
pub struct ConnectionCounters {
    read_bytes: AtomicU64,
    read_msgs: AtomicU64,
    write_bytes: AtomicU64,
    write_msgs: AtomicU64,
    lost_msgs: AtomicU64,
    rcvbuf_grows: AtomicU64,
}

impl ConnectionCounters {
    /// Record inbound bytes (frames are counted separately).
    pub fn record_read_bytes(&self, bytes: usize) {
        self.read_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record one inbound frame.
    pub fn record_read_msg(&self) {
        self.read_msgs.fetch_add(1, Ordering::Relaxed);
    }

    /// Record outbound bytes written to the socket.
    pub fn record_write_bytes(&self, bytes: usize) {
        self.write_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record one queued outbound message.
    pub fn record_write_msg(&self) {
        self.write_msgs.fetch_add(1, Ordering::Relaxed);
    }

    /// Record discarded messages.
    pub fn record_lost(&self, msgs: u64) {
        self.lost_msgs.fetch_add(msgs, Ordering::Relaxed);
    }

    /// Record one SO_RCVBUF increase.
    pub fn record_rcvbuf_grow(&self) {
        self.rcvbuf_grows.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a snapshot.
    pub fn snapshot(&self) -> ConnectionCountersSnapshot {
        ConnectionCountersSnapshot {
            read_bytes: self.read_bytes.load(Ordering::Relaxed),
            read_msgs: self.read_msgs.load(Ordering::Relaxed),
            write_bytes: self.write_bytes.load(Ordering::Relaxed),
            write_msgs: self.write_msgs.load(Ordering::Relaxed),
            lost_msgs: self.lost_msgs.load(Ordering::Relaxed),
            rcvbuf_grows: self.rcvbuf_grows.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ConnectionCounters`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnectionCountersSnapshot {
    /// Inbound bytes
    pub read_bytes: u64,
    /// Inbound frames
    pub read_msgs: u64,
    /// Outbound bytes
    pub write_bytes: u64,
    /// Outbound messages
    pub write_msgs: u64,
    /// Discarded messages
    pub lost_msgs: u64,
    /// Receive buffer increases
    pub rcvbuf_grows: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_and_disconnect() {
        let stats = EndpointStats::new();
        stats.record_connect();
        stats.record_connect();
        stats.record_disconnect();
        let s = stats.snapshot();
        assert_eq!(s.connect_count, 2);
        assert_eq!(s.connect_active, 1);
    }

    #[test]
    fn test_disconnect_saturates() {
        let stats = EndpointStats::new();
        stats.record_disconnect();
        assert_eq!(stats.active(), 0);
    }

    #[test]
    fn test_reset_keeps_active() {
        let stats = EndpointStats::new();
        stats.record_connect();
        stats.record_bad_connect();
        stats.record_write(10, 1);
        stats.reset();
        let s = stats.snapshot();
        assert_eq!(s.connect_active, 1);
        assert_eq!(s.bad_connect_count, 0);
        assert_eq!(s.write_bytes, 0);
    }

    #[test]
    fn test_connection_counters() {
        let c = ConnectionCounters::default();
        c.record_read_bytes(100);
        c.record_read_msg();
        c.record_write_bytes(40);
        c.record_write_msg();
        c.record_lost(2);
        c.record_rcvbuf_grow();
        let s = c.snapshot();
        assert_eq!(s.read_bytes, 100);
        assert_eq!(s.read_msgs, 1);
        assert_eq!(s.write_bytes, 40);
        assert_eq!(s.write_msgs, 1);
        assert_eq!(s.lost_msgs, 2);
        assert_eq!(s.rcvbuf_grows, 1);
    }
}
