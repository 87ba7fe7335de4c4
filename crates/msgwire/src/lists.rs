// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Active and closed connection lists.
//!
//! Every connection sits in exactly one of the two lists. Released
//! connections wait on the closed list until no deferred work references
//! them and they have survived one full sweep.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::connection::Connection;

struct Closed {
    conn: Arc<Connection>,
    sweeps: u32,
}

#[derive(Default)]
struct Inner {
    active: HashMap<u64, Arc<Connection>>,
    closed: Vec<Closed>,
}

/// Global connection lists.
#[derive(Default)]
pub(crate) struct ConnectionLists {
    inner: Mutex<Inner>,
}

impl ConnectionLists {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self, conn: Arc<Connection>) {
        self.inner.lock().active.insert(conn.id(), conn);
    }

    /// Move connection `id` from the active list to the closed list.
    pub(crate) fn move_to_closed(&self, id: u64) {
        let mut inner = self.inner.lock();
        if let Some(conn) = inner.active.remove(&id) {
            inner.closed.push(Closed { conn, sweeps: 0 });
        }
    }

    pub(crate) fn snapshot_active(&self) -> Vec<Arc<Connection>> {
        self.inner.lock().active.values().cloned().collect()
    }

    pub(crate) fn active_len(&self) -> usize {
        self.inner.lock().active.len()
    }

    pub(crate) fn closed_len(&self) -> usize {
        self.inner.lock().closed.len()
    }

    /// Reclaim closed connections that are idle and were seen on an
    /// earlier sweep. Returns the reclaimed connections.
    pub(crate) fn sweep(&self) -> Vec<Arc<Connection>> {
        let mut inner = self.inner.lock();
        let mut reclaimed = Vec::new();
        inner.closed.retain_mut(|entry| {
            if entry.sweeps >= 1 && entry.conn.work_count() == 0 {
                reclaimed.push(entry.conn.clone());
                false
            } else {
                entry.sweeps += 1;
                true
            }
        });
        reclaimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::test_connection;
    use crate::processor::tests::test_processor;

    #[test]
    fn test_sweep_hysteresis_and_work_gate() {
        let proc = test_processor(64, 1024);
        let lists = ConnectionLists::new();
        let a = test_connection(1, proc.clone(), None, 128);
        let b = test_connection(2, proc, None, 128);
        lists.add(a.clone());
        lists.add(b.clone());
        b.add_work_ref();

        lists.move_to_closed(1);
        lists.move_to_closed(2);
        assert_eq!(lists.active_len(), 0);
        assert!(lists.sweep().is_empty(), "first sweep only marks");

        let reclaimed = lists.sweep();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id(), 1);
        assert_eq!(lists.closed_len(), 1);

        b.release_work_ref();
        assert_eq!(lists.sweep().len(), 1);
        assert_eq!(lists.closed_len(), 0);
    }

    #[test]
    fn test_move_unknown_is_noop() {
        let lists = ConnectionLists::new();
        lists.move_to_closed(99);
        assert_eq!(lists.closed_len(), 0);
    }
}
