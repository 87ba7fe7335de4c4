// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Upper-layer protocol interface.

use std::sync::Arc;

use crate::connection::Connection;
use crate::error::ReasonCode;

/// Receiver of framed payloads.
///
/// Every callback for a given connection runs on that connection's I/O
/// processor thread, except [`on_closing`](Self::on_closing) which runs on
/// whichever thread won the close, and [`on_expire`](Self::on_expire) which
/// runs on the delivery thread.
pub trait ProtocolHandler: Send + Sync {
    /// A framer was selected for `conn`. `Err` closes the connection.
    fn on_connection(&self, conn: &Arc<Connection>, family: &str) -> Result<(), ReasonCode> {
        let _ = (conn, family);
        Ok(())
    }

    /// One complete frame, in arrival order. `Err` closes the connection.
    fn receive(&self, conn: &Arc<Connection>, payload: &[u8], kind: u32)
        -> Result<(), ReasonCode>;

    /// A suspended connection drained its send queue.
    fn on_resume(&self, conn: &Arc<Connection>) {
        let _ = conn;
    }

    /// The connection started closing.
    fn on_closing(&self, conn: &Arc<Connection>, reason: ReasonCode) {
        let _ = (conn, reason);
    }

    /// The connection's deadline passed. Return `true` when handled;
    /// `false` closes it with [`ReasonCode::ConnectionExpired`].
    fn on_expire(&self, conn: &Arc<Connection>) -> bool {
        let _ = conn;
        false
    }
}
