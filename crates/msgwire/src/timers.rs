// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Periodic engine timers, all driven from one thread:
//!
//! | Timer    | Action                                                      |
//! |----------|-------------------------------------------------------------|
//! | sledge   | shutdown escalation tick to every processor                 |
//! | cleanup  | reclaim idle closed connections                             |
//! | ddos     | close inbound connections that never delivered a frame      |
//! | expire   | schedule closes for connections past their deadline         |
//! | rcvbuf   | ask processors to grow receive buffers of busy connections  |

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam::channel::{self, Receiver, Sender};

use crate::delivery::Delivery;
use crate::error::ReasonCode;
use crate::processor::Job;
use crate::transport::Core;

/// Stop handle for the timer thread.
pub(crate) struct TimerHandle {
    tx: Sender<()>,
}

impl TimerHandle {
    pub(crate) fn stop(&self) {
        let _ = self.tx.send(());
    }
}

pub(crate) fn spawn(core: Arc<Core>) -> std::io::Result<(TimerHandle, JoinHandle<()>)> {
    let (tx, rx) = channel::bounded(1);
    let handle = thread::Builder::new()
        .name("msgwire-timers".to_string())
        .spawn(move || run(&core, &rx))?;
    Ok((TimerHandle { tx }, handle))
}

fn run(core: &Core, stop: &Receiver<()>) {
    let cfg = &core.config;
    let sledge = channel::tick(cfg.sledge_interval());
    let cleanup = channel::tick(cfg.cleanup_interval());
    let ddos = channel::tick(cfg.ddos_interval());
    let expire = channel::tick(cfg.expire_interval());
    let rcvbuf = channel::tick(cfg.rcvbuf_check_interval());

    log::debug!("[msgwire-timers] Timer thread started");
    loop {
        crossbeam::select! {
            recv(stop) -> _ => break,
            recv(sledge) -> _ => broadcast(core, || Job::Tick),
            recv(cleanup) -> _ => cleanup_closed(core),
            recv(ddos) -> _ => close_silent(core),
            recv(expire) -> _ => expire_connections(core),
            recv(rcvbuf) -> _ => broadcast(core, || Job::GrowBuffers),
        }
    }
    log::debug!("[msgwire-timers] Timer thread stopped");
}

fn broadcast(core: &Core, job: impl Fn() -> Job) {
    for processor in &core.processors {
        processor.post(job());
    }
}

fn cleanup_closed(core: &Core) {
    let reclaimed = core.lists.sweep();
    if !reclaimed.is_empty() {
        log::trace!("[msgwire-timers] Reclaimed {} closed connections", reclaimed.len());
    }
}

/// First-packet timer: inbound connections that have not delivered a
/// frame within `first_packet_timeout`.
fn close_silent(core: &Core) {
    let limit = core.config.first_packet_timeout();
    let now = Instant::now();
    for conn in core.lists.snapshot_active() {
        if conn.is_outgoing() || conn.is_ready() || !conn.state().is_live() {
            continue;
        }
        if now.duration_since(conn.connected_at()) >= limit {
            conn.close(ReasonCode::NoFirstPacket, false, None);
        }
    }
}

fn expire_connections(core: &Core) {
    let now = Instant::now();
    let due = core
        .registry
        .select(|c| c.state().is_live() && c.expire_at().is_some_and(|at| at <= now));
    for conn in due {
        conn.set_expire(None);
        core.delivery.add(
            conn,
            Box::new(|c| {
                if !c.handler().on_expire(c) {
                    c.close(ReasonCode::ConnectionExpired, true, None);
                }
                Delivery::Done
            }),
        );
    }
}
