// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Monitoring registry.
//!
//! Maps small integer ids to live connections for statistics and admin
//! actions. Id 0 is reserved for "not registered". Freed ids go through a
//! FIFO and are only handed out again once more than `free_limit` ids are
//! waiting, so a monitor holding a stale id does not silently observe a
//! different connection.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::connection::Connection;
use crate::state::LifeState;

struct Slots {
    entries: Vec<Option<Arc<Connection>>>,
    free: VecDeque<u32>,
    count: usize,
}

/// Indexed table of registered connections.
pub struct MonitorRegistry {
    inner: Mutex<Slots>,
    capacity: u32,
    free_limit: u32,
}

impl MonitorRegistry {
    /// Ids `1..capacity` are usable.
    pub fn new(capacity: u32, free_limit: u32) -> Self {
        Self {
            inner: Mutex::new(Slots {
                entries: vec![None],
                free: VecDeque::new(),
                count: 0,
            }),
            capacity: capacity.max(2),
            free_limit,
        }
    }

    /// Register without waiting on the lock.
    ///
    /// `None` means the lock was contended; `Some(false)` means the
    /// connection is already closed or the table is full.
    pub(crate) fn try_add(&self, conn: &Arc<Connection>) -> Option<bool> {
        let mut slots = self.inner.try_lock()?;
        Some(self.insert(&mut slots, conn))
    }

    pub(crate) fn add(&self, conn: &Arc<Connection>) -> bool {
        let mut slots = self.inner.lock();
        self.insert(&mut slots, conn)
    }

    fn insert(&self, slots: &mut Slots, conn: &Arc<Connection>) -> bool {
        if conn.state() == LifeState::Closed || conn.monitor_id() != 0 {
            return false;
        }
        let id = if slots.free.len() > self.free_limit as usize {
            slots.free.pop_front()
        } else if (slots.entries.len() as u32) < self.capacity {
            slots.entries.push(None);
            Some(slots.entries.len() as u32 - 1)
        } else {
            None
        };
        let Some(id) = id else {
            log::debug!("[msgwire] Monitoring table full, connection {} not registered", conn.id());
            return false;
        };
        slots.entries[id as usize] = Some(conn.clone());
        slots.count += 1;
        conn.set_monitor_id(id);
        true
    }

    /// Free the connection's slot, if it holds one.
    pub(crate) fn remove(&self, conn: &Connection) {
        let mut slots = self.inner.lock();
        let id = conn.monitor_id();
        if id == 0 {
            return;
        }
        let owned = slots
            .entries
            .get(id as usize)
            .and_then(|e| e.as_ref())
            .is_some_and(|c| c.id() == conn.id());
        if owned {
            slots.entries[id as usize] = None;
            slots.free.push_back(id);
            slots.count -= 1;
        }
        conn.set_monitor_id(0);
    }

    /// Connection registered under `id`.
    pub fn get(&self, id: u32) -> Option<Arc<Connection>> {
        self.inner
            .lock()
            .entries
            .get(id as usize)
            .and_then(|e| e.clone())
    }

    /// Registered connections.
    pub fn len(&self) -> usize {
        self.inner.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All registered connections matching `filter`.
    pub(crate) fn select<F>(&self, filter: F) -> Vec<Arc<Connection>>
    where
        F: Fn(&Connection) -> bool,
    {
        let slots = self.inner.lock();
        slots
            .entries
            .iter()
            .flatten()
            .filter(|c| filter(c))
            .cloned()
            .collect()
    }

    /// Up to `max` matching connections with id `>= position`.
    ///
    /// Returns the page and the position to continue from, 0 once the end
    /// of the table is reached.
    pub(crate) fn page<F>(&self, position: u32, max: usize, filter: F) -> (Vec<Arc<Connection>>, u32)
    where
        F: Fn(&Connection) -> bool,
    {
        let slots = self.inner.lock();
        let mut out = Vec::new();
        let start = position.max(1) as usize;
        for (idx, entry) in slots.entries.iter().enumerate().skip(start) {
            let Some(conn) = entry else { continue };
            if !filter(conn) {
                continue;
            }
            if out.len() == max {
                return (out, idx as u32);
            }
            out.push(conn.clone());
        }
        (out, 0)
    }
}
