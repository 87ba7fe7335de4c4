// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Readiness multiplexer.
//!
//! A single thread waits on a mio [`Poll`] for all connection sockets and
//! turns each event into a [`Job::Ready`] for the processor that owns the
//! socket. Registration is edge-triggered for both directions; processors
//! track the "still readable / still writable" state themselves.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use dashmap::DashMap;
use mio::event::Source;
use mio::{Events, Interest, Poll, Registry, Token, Waker};

use crate::processor::Job;
use crate::transport::Core;

const WAKE_TOKEN: Token = Token(usize::MAX);
const POLL_TIMEOUT: Duration = Duration::from_millis(250);
const EVENT_CAPACITY: usize = 1024;

/// Registration handle shared with processors.
pub(crate) struct ReadinessShared {
    registry: Registry,
    owners: DashMap<u64, usize>,
    waker: Waker,
    running: AtomicBool,
}

impl ReadinessShared {
    /// Create the poll instance. The thread is started with [`spawn`].
    pub(crate) fn new() -> io::Result<(Self, Poll)> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        Ok((
            Self {
                registry,
                owners: DashMap::new(),
                waker,
                running: AtomicBool::new(true),
            },
            poll,
        ))
    }

    /// Watch `source` for connection `id`, owned by processor `owner`.
    pub(crate) fn register<S: Source>(&self, source: &mut S, id: u64, owner: usize) -> io::Result<()> {
        self.owners.insert(id, owner);
        let res = self.registry.register(
            source,
            Token(id as usize),
            Interest::READABLE | Interest::WRITABLE,
        );
        if res.is_err() {
            self.owners.remove(&id);
        }
        res
    }

    pub(crate) fn deregister<S: Source>(&self, source: &mut S, id: u64) {
        if let Err(e) = self.registry.deregister(source) {
            log::debug!("[msgwire-poll] deregister {} failed: {}", id, e);
        }
        self.owners.remove(&id);
    }

    /// Number of watched sockets.
    pub(crate) fn watched(&self) -> usize {
        self.owners.len()
    }

    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            log::warn!("[msgwire-poll] wake failed: {}", e);
        }
    }
}

/// Start the multiplexer thread.
pub(crate) fn spawn(mut poll: Poll, core: Arc<Core>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("msgwire-poll".to_string())
        .spawn(move || {
            let mut events = Events::with_capacity(EVENT_CAPACITY);
            log::debug!("[msgwire-poll] Readiness thread started");
            while core.readiness.running.load(Ordering::Acquire) {
                if let Err(e) = poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                    if e.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    log::error!("[msgwire-poll] poll failed: {}", e);
                    break;
                }
                for event in events.iter() {
                    if event.token() == WAKE_TOKEN {
                        continue;
                    }
                    let id = event.token().0 as u64;
                    let Some(owner) = core.readiness.owners.get(&id).map(|o| *o) else {
                        continue;
                    };
                    let readable = event.is_readable() || event.is_read_closed() || event.is_error();
                    let writable = event.is_writable() || event.is_write_closed();
                    if let Some(processor) = core.processors.get(owner) {
                        processor.post(Job::Ready {
                            id,
                            readable,
                            writable,
                        });
                    }
                }
            }
            log::debug!("[msgwire-poll] Readiness thread stopped");
        })
}
