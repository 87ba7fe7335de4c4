// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Serialized delivery thread for deferred per-connection work.
//!
//! Admin closes, expirations and contended monitor registrations run here
//! rather than on the calling thread. Each queued item holds a work
//! reference on its connection, which keeps the cleanup sweep from
//! reclaiming it until the item is finished.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};

use crate::connection::Connection;

/// How often rescheduled work is retried.
const RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Result of one delivery attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Finished
    Done,
    /// Run again later, unless the connection closed meanwhile
    Reschedule,
    /// Run again later even if the connection closed
    RescheduleEvenIfClosed,
}

/// Deferred work body.
pub type DeliveryWork = Box<dyn FnMut(&Arc<Connection>) -> Delivery + Send>;

struct Item {
    conn: Arc<Connection>,
    work: DeliveryWork,
}

impl Item {
    fn new(conn: Arc<Connection>, work: DeliveryWork) -> Self {
        conn.add_work_ref();
        Self { conn, work }
    }
}

impl Drop for Item {
    fn drop(&mut self) {
        self.conn.release_work_ref();
    }
}

enum Msg {
    Work(Item),
    Stop,
}

/// Producer side of the delivery thread.
pub(crate) struct DeliveryQueue {
    tx: Sender<Msg>,
}

impl DeliveryQueue {
    pub(crate) fn new() -> (Self, DeliveryWorker) {
        let (tx, rx) = channel::unbounded();
        (Self { tx }, DeliveryWorker { rx })
    }

    /// Queue `work` for `conn`. Returns `false` once the thread stopped.
    pub(crate) fn add(&self, conn: Arc<Connection>, work: DeliveryWork) -> bool {
        self.tx.send(Msg::Work(Item::new(conn, work))).is_ok()
    }

    pub(crate) fn stop(&self) {
        let _ = self.tx.send(Msg::Stop);
    }
}

/// Consumer side, moved onto the delivery thread.
pub(crate) struct DeliveryWorker {
    rx: Receiver<Msg>,
}

impl DeliveryWorker {
    pub(crate) fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("msgwire-delivery".to_string())
            .spawn(move || self.run())
    }

    fn run(self) {
        let ticker = channel::tick(RETRY_INTERVAL);
        let mut pending: Vec<Item> = Vec::new();
        log::debug!("[msgwire-delivery] Delivery thread started");
        loop {
            crossbeam::select! {
                recv(self.rx) -> msg => match msg {
                    Ok(Msg::Work(item)) => {
                        if let Some(again) = execute(item) {
                            pending.push(again);
                        }
                    }
                    Ok(Msg::Stop) | Err(_) => break,
                },
                recv(ticker) -> _ => {
                    if !pending.is_empty() {
                        for item in std::mem::take(&mut pending) {
                            if let Some(again) = execute(item) {
                                pending.push(again);
                            }
                        }
                    }
                }
            }
        }
        if !pending.is_empty() {
            log::debug!("[msgwire-delivery] Dropping {} pending items", pending.len());
        }
        log::debug!("[msgwire-delivery] Delivery thread stopped");
    }
}

/// Run one attempt. Returns the item if it must run again.
fn execute(mut item: Item) -> Option<Item> {
    match (item.work)(&item.conn) {
        Delivery::Done => None,
        Delivery::Reschedule if item.conn.state().is_live() => Some(item),
        Delivery::Reschedule => None,
        Delivery::RescheduleEvenIfClosed => Some(item),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::test_connection;
    use crate::error::ReasonCode;
    use crate::processor::tests::test_processor;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    fn wait_for(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_work_ref_held_until_done() {
        let (queue, worker) = DeliveryQueue::new();
        let handle = worker.spawn().expect("spawn");
        let conn = test_connection(1, test_processor(64, 1024), None, 128);
        let runs = Arc::new(AtomicU32::new(0));

        let r = runs.clone();
        queue.add(
            conn.clone(),
            Box::new(move |_| {
                if r.fetch_add(1, Ordering::SeqCst) < 2 {
                    Delivery::Reschedule
                } else {
                    Delivery::Done
                }
            }),
        );
        assert!(wait_for(|| runs.load(Ordering::SeqCst) == 3));
        assert!(wait_for(|| conn.work_count() == 0));

        queue.stop();
        handle.join().expect("join");
    }

    #[test]
    fn test_reschedule_dropped_after_close() {
        let (queue, worker) = DeliveryQueue::new();
        let handle = worker.spawn().expect("spawn");
        let conn = test_connection(2, test_processor(64, 1024), None, 128);
        let runs = Arc::new(AtomicU32::new(0));

        let r = runs.clone();
        queue.add(
            conn.clone(),
            Box::new(move |c| {
                r.fetch_add(1, Ordering::SeqCst);
                c.close(ReasonCode::ForcedDisconnect, false, None);
                Delivery::Reschedule
            }),
        );
        assert!(wait_for(|| conn.work_count() == 0));
        thread::sleep(RETRY_INTERVAL * 5);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        queue.stop();
        handle.join().expect("join");
    }

    #[test]
    fn test_even_if_closed_keeps_running() {
        let (queue, worker) = DeliveryQueue::new();
        let handle = worker.spawn().expect("spawn");
        let conn = test_connection(3, test_processor(64, 1024), None, 128);
        conn.close(ReasonCode::ForcedDisconnect, false, None);
        let runs = Arc::new(AtomicU32::new(0));

        let r = runs.clone();
        queue.add(
            conn.clone(),
            Box::new(move |_| {
                if r.fetch_add(1, Ordering::SeqCst) == 0 {
                    Delivery::RescheduleEvenIfClosed
                } else {
                    Delivery::Done
                }
            }),
        );
        assert!(wait_for(|| runs.load(Ordering::SeqCst) == 2));
        assert!(wait_for(|| conn.work_count() == 0));

        queue.stop();
        handle.join().expect("join");
    }
}
