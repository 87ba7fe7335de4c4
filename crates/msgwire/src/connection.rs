// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared connection object.
//!
//! A [`Connection`] is held by the owning I/O processor, the connection
//! lists, the monitoring registry and any upper-layer code that kept an
//! `Arc`. Socket, TLS session and read accumulation live on the processor;
//! this object carries what other threads may touch:
//!
//! - the [`LifeState`] word (CAS-guarded close)
//! - the outbound queue and async job list behind one short lock
//! - identity, counters and the monitoring slot
//!
//! Cross-thread effects on socket state always go through a job posted to
//! the owning processor.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Instant, SystemTime};

use parking_lot::{Mutex, RwLock};

use crate::admin::ClientSets;
use crate::buffer::{OutBuffer, SendQueue};
use crate::config::EndpointConfig;
use crate::endpoint::Endpoint;
use crate::error::{ReasonCode, SendStatus};
use crate::framer::{FrameLimits, Framer, MAX_FRAME_HEADER};
use crate::handler::ProtocolHandler;
use crate::metrics::{ConnectionCounters, ConnectionCountersSnapshot};
use crate::processor::{Job, ProcessorShared};
use crate::state::{AtomicLifeState, LifeState};

/// Closure run on the owning processor thread.
pub type AsyncJob = Box<dyn FnOnce(&Arc<Connection>) + Send>;

/// Emit a connection record at `info`, or `debug` for quiet connections.
macro_rules! conn_record {
    ($quiet:expr, $($arg:tt)+) => {
        if $quiet {
            log::debug!($($arg)+);
        } else {
            log::info!($($arg)+);
        }
    };
}
pub(crate) use conn_record;

/// Flags for [`Connection::send`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SendFlags(u32);

impl SendFlags {
    /// No flags.
    pub const NONE: SendFlags = SendFlags(0);
    /// Payload already carries its frame header.
    pub const HAS_FRAME: SendFlags = SendFlags(1);

    pub fn contains(self, other: SendFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for SendFlags {
    type Output = SendFlags;

    fn bitor(self, rhs: SendFlags) -> SendFlags {
        SendFlags(self.0 | rhs.0)
    }
}

/// Identity strings set by the protocol layer and the TLS handshake.
#[derive(Clone, Debug, Default)]
struct Identity {
    client_id: Option<String>,
    user_id: Option<String>,
    cert_name: Option<String>,
    protocol: Option<String>,
}

pub(crate) struct Outbound {
    pub(crate) queue: SendQueue,
    pub(crate) jobs: Vec<AsyncJob>,
}

/// Everything needed to build a [`Connection`].
pub(crate) struct ConnectionParams {
    pub id: u64,
    pub endpoint: Arc<Endpoint>,
    pub peer: SocketAddr,
    pub local: Option<SocketAddr>,
    pub outgoing: bool,
    pub processor: Arc<ProcessorShared>,
    pub handler: Arc<dyn ProtocolHandler>,
    pub client_sets: Arc<ClientSets>,
    pub suspend_limit: usize,
    pub quiet: bool,
    pub framer: Option<Arc<dyn Framer>>,
}

/// One client or server connection.
pub struct Connection {
    id: u64,
    me: Weak<Connection>,
    endpoint: Arc<Endpoint>,
    config: Arc<EndpointConfig>,
    peer: SocketAddr,
    local: Option<SocketAddr>,
    outgoing: bool,
    quiet: bool,

    life: AtomicLifeState,
    processor: Arc<ProcessorShared>,
    handler: Arc<dyn ProtocolHandler>,
    client_sets: Arc<ClientSets>,

    outbound: Mutex<Outbound>,
    suspended: AtomicBool,
    suspend_limit: usize,

    work_count: AtomicU32,
    monitor_id: AtomicU32,
    ready: AtomicBool,
    client_checked: AtomicBool,
    admin_closed: AtomicBool,

    identity: RwLock<Identity>,
    framer: RwLock<Option<Arc<dyn Framer>>>,
    peer_cert: RwLock<Option<Vec<u8>>>,
    expire_at: Mutex<Option<Instant>>,
    close_reason: Mutex<Option<ReasonCode>>,

    connected_at: Instant,
    connect_time: SystemTime,
    counters: ConnectionCounters,
}

impl Connection {
    pub(crate) fn new(p: ConnectionParams) -> Arc<Self> {
        let config = p.endpoint.config();
        let protocol = p.framer.as_ref().map(|f| f.family().to_string());
        Arc::new_cyclic(|me| Connection {
            id: p.id,
            me: me.clone(),
            endpoint: p.endpoint,
            config,
            peer: p.peer,
            local: p.local,
            outgoing: p.outgoing,
            quiet: p.quiet,
            life: AtomicLifeState::new(),
            processor: p.processor,
            handler: p.handler,
            client_sets: p.client_sets,
            outbound: Mutex::new(Outbound {
                queue: SendQueue::new(),
                jobs: Vec::new(),
            }),
            suspended: AtomicBool::new(false),
            suspend_limit: p.suspend_limit,
            work_count: AtomicU32::new(0),
            monitor_id: AtomicU32::new(0),
            ready: AtomicBool::new(false),
            client_checked: AtomicBool::new(false),
            admin_closed: AtomicBool::new(false),
            identity: RwLock::new(Identity {
                protocol,
                ..Default::default()
            }),
            framer: RwLock::new(p.framer),
            peer_cert: RwLock::new(None),
            expire_at: Mutex::new(None),
            close_reason: Mutex::new(None),
            connected_at: Instant::now(),
            connect_time: SystemTime::now(),
            counters: ConnectionCounters::default(),
        })
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    /// Engine-wide connection id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    /// Endpoint configuration as of connection creation.
    pub fn endpoint_config(&self) -> &EndpointConfig {
        &self.config
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    pub fn is_outgoing(&self) -> bool {
        self.outgoing
    }

    pub fn state(&self) -> LifeState {
        self.life.load()
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    /// Queued outbound buffers.
    pub fn send_queue_len(&self) -> usize {
        self.outbound.lock().queue.len()
    }

    pub fn client_id(&self) -> Option<String> {
        self.identity.read().client_id.clone()
    }

    pub fn user_id(&self) -> Option<String> {
        self.identity.read().user_id.clone()
    }

    /// Common name of the verified peer certificate.
    pub fn cert_name(&self) -> Option<String> {
        self.identity.read().cert_name.clone()
    }

    /// Protocol family of the selected framer.
    pub fn protocol(&self) -> Option<String> {
        self.identity.read().protocol.clone()
    }

    /// Whether the first frame has been delivered.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Monitoring slot (0 while unregistered).
    pub fn monitor_id(&self) -> u32 {
        self.monitor_id.load(Ordering::Acquire)
    }

    pub fn counters(&self) -> ConnectionCountersSnapshot {
        self.counters.snapshot()
    }

    /// Why the connection is closing, once it is.
    pub fn close_reason(&self) -> Option<ReasonCode> {
        *self.close_reason.lock()
    }

    pub fn connect_time(&self) -> SystemTime {
        self.connect_time
    }

    pub fn peer_certificate(&self) -> Option<Vec<u8>> {
        self.peer_cert.read().clone()
    }

    // ------------------------------------------------------------------------
    // Protocol layer calls
    // ------------------------------------------------------------------------

    /// Queue `payload` for sending, framed with `kind` unless
    /// [`SendFlags::HAS_FRAME`] is set.
    ///
    /// `Suspend` still queues the data; the caller should stop producing
    /// until [`ProtocolHandler::on_resume`] is called.
    pub fn send(&self, payload: &[u8], kind: u32, flags: SendFlags) -> SendStatus {
        if !self.life.load().is_live() {
            return SendStatus::Closed;
        }
        let Some(framer) = self.framer.read().clone() else {
            return SendStatus::BadState;
        };
        if payload.len() > self.config.max_send_size {
            return SendStatus::Alloc;
        }

        let mut header = [0u8; MAX_FRAME_HEADER];
        let hlen = if flags.contains(SendFlags::HAS_FRAME) {
            0
        } else {
            match framer.add_frame(&mut header, payload.len(), kind) {
                Ok(n) => n,
                Err(_) => return SendStatus::Alloc,
            }
        };

        let (was_empty, forced, queued) = {
            let mut out = self.outbound.lock();
            let was_empty = out.queue.is_empty();
            let forced = out
                .queue
                .append(self.processor.pool(), &[&header[..hlen], payload]);
            (was_empty, forced, out.queue.len())
        };
        self.counters.record_write_msg();
        self.endpoint.stats().record_write(0, 1);

        if was_empty {
            self.processor.post(Job::DataAvailable(self.id));
        }
        if forced || queued > self.suspend_limit {
            if !self.suspended.swap(true, Ordering::AcqRel) {
                log::debug!(
                    "[msgwire] Connection {} suspended (queued={}, forced={})",
                    self.id,
                    queued,
                    forced
                );
            }
            return SendStatus::Suspend;
        }
        // Stays suspended until the queue drains, even for tail appends.
        if self.suspended.load(Ordering::Acquire) {
            return SendStatus::Suspend;
        }
        SendStatus::Ok
    }

    /// Start closing. Returns `false` if the connection was already closing.
    ///
    /// `clean` drains queued output first; otherwise the socket is dropped
    /// on the next processor pass.
    pub fn close(&self, reason: ReasonCode, clean: bool, message: Option<&str>) -> bool {
        if !self.life.begin_close() {
            return false;
        }
        *self.close_reason.lock() = Some(reason);

        let ident = self.identity.read().clone();
        conn_record!(
            self.quiet,
            "[msgwire] Close connection: id={} endpoint={} peer={} client={} protocol={} reason={} \"{}\"",
            self.id,
            self.endpoint.name(),
            self.peer,
            ident.client_id.as_deref().unwrap_or("-"),
            ident.protocol.as_deref().unwrap_or("-"),
            reason,
            message.unwrap_or_else(|| reason.message())
        );

        if !self.outgoing && !self.is_ready() && reason.is_failure() {
            self.endpoint.stats().record_bad_connect();
        }

        if let Some(me) = self.me.upgrade() {
            self.handler.on_closing(&me, reason);
        }
        let job = if clean {
            Job::Shutdown(self.id)
        } else {
            Job::ShutdownForce(self.id)
        };
        self.processor.post(job);
        true
    }

    /// Run `job` on the owning processor thread.
    ///
    /// Returns `false` if the connection is already closing.
    pub fn submit_async_job<F>(&self, job: F) -> bool
    where
        F: FnOnce(&Arc<Connection>) + Send + 'static,
    {
        if !self.life.load().is_live() {
            return false;
        }
        let first = {
            let mut out = self.outbound.lock();
            out.jobs.push(Box::new(job));
            out.jobs.len() == 1
        };
        if first {
            self.processor.post(Job::Async(self.id));
        }
        true
    }

    /// Check the client identity against disabled client sets.
    ///
    /// Marks the connection as checked, so later set disables will find it.
    pub fn client_allowed(&self) -> Result<(), ReasonCode> {
        self.client_checked.store(true, Ordering::Release);
        let client_id = self.client_id();
        match self.client_sets.check(client_id.as_deref().unwrap_or("")) {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }

    pub fn set_client_id(&self, client_id: impl Into<String>) {
        self.identity.write().client_id = Some(client_id.into());
    }

    pub fn set_user_id(&self, user_id: impl Into<String>) {
        self.identity.write().user_id = Some(user_id.into());
    }

    /// Log the connection as established at the protocol level.
    pub fn connection_ready(&self) {
        let ident = self.identity.read().clone();
        conn_record!(
            self.quiet,
            "[msgwire] Connection ready: id={} endpoint={} peer={} client={} user={} protocol={} cert={}",
            self.id,
            self.endpoint.name(),
            self.peer,
            ident.client_id.as_deref().unwrap_or("-"),
            ident.user_id.as_deref().unwrap_or("-"),
            ident.protocol.as_deref().unwrap_or("-"),
            ident.cert_name.as_deref().unwrap_or("-")
        );
    }

    /// Set or clear the expiration deadline. Returns the previous one.
    pub fn set_expire(&self, deadline: Option<Instant>) -> Option<Instant> {
        std::mem::replace(&mut *self.expire_at.lock(), deadline)
    }

    /// Current expiration deadline.
    pub fn expire_at(&self) -> Option<Instant> {
        *self.expire_at.lock()
    }

    // ------------------------------------------------------------------------
    // Engine internals
    // ------------------------------------------------------------------------

    pub(crate) fn life(&self) -> &AtomicLifeState {
        &self.life
    }

    pub(crate) fn is_quiet(&self) -> bool {
        self.quiet
    }

    pub(crate) fn handler(&self) -> &Arc<dyn ProtocolHandler> {
        &self.handler
    }

    pub(crate) fn processor(&self) -> &Arc<ProcessorShared> {
        &self.processor
    }

    pub(crate) fn connected_at(&self) -> Instant {
        self.connected_at
    }

    pub(crate) fn framer(&self) -> Option<Arc<dyn Framer>> {
        self.framer.read().clone()
    }

    pub(crate) fn set_framer(&self, framer: Arc<dyn Framer>) {
        self.identity.write().protocol = Some(framer.family().to_string());
        *self.framer.write() = Some(framer);
    }

    pub(crate) fn set_peer_cert(&self, der: Vec<u8>, cert_name: Option<String>) {
        self.identity.write().cert_name = cert_name;
        *self.peer_cert.write() = Some(der);
    }

    /// Returns `true` the first time.
    pub(crate) fn mark_ready(&self) -> bool {
        !self.ready.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_client_checked(&self) -> bool {
        self.client_checked.load(Ordering::Acquire)
    }

    pub(crate) fn is_admin_closed(&self) -> bool {
        self.admin_closed.load(Ordering::Acquire)
    }

    /// Returns `true` if this call set the flag.
    pub(crate) fn mark_admin_closed(&self) -> bool {
        !self.admin_closed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn set_monitor_id(&self, id: u32) {
        self.monitor_id.store(id, Ordering::Release);
    }

    pub(crate) fn work_count(&self) -> u32 {
        self.work_count.load(Ordering::Acquire)
    }

    pub(crate) fn add_work_ref(&self) {
        self.work_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release_work_ref(&self) {
        self.work_count.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn counters_mut(&self) -> &ConnectionCounters {
        &self.counters
    }

    pub(crate) fn frame_limits(&self, first_packet_max: usize) -> FrameLimits {
        FrameLimits {
            max_message_size: self.config.max_message_size,
            first_packet_max,
            first_exchange_done: false,
        }
    }

    /// Next buffer to write, if any.
    pub(crate) fn pop_outbound(&self) -> Option<OutBuffer> {
        self.outbound.lock().queue.pop_front()
    }

    /// Clear the suspended flag if nothing is left to write.
    ///
    /// Returns `true` when the connection was suspended and is now resumed.
    pub(crate) fn try_resume(&self) -> bool {
        let out = self.outbound.lock();
        out.queue.is_empty() && self.suspended.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn has_outbound(&self) -> bool {
        !self.outbound.lock().queue.is_empty()
    }

    pub(crate) fn take_jobs(&self) -> Vec<AsyncJob> {
        std::mem::take(&mut self.outbound.lock().jobs)
    }

    /// Drop queued output. Returns the number of buffers discarded.
    pub(crate) fn release_outbound(&self) -> usize {
        let mut out = self.outbound.lock();
        let n = out.queue.len();
        out.queue.release(self.processor.pool());
        out.jobs.clear();
        n
    }

    pub(crate) fn snapshot(&self) -> ConnectionSnapshot {
        let ident = self.identity.read().clone();
        ConnectionSnapshot {
            id: self.id,
            monitor_id: self.monitor_id(),
            endpoint: self.endpoint.name().to_string(),
            protocol: ident.protocol,
            client_id: ident.client_id,
            user_id: ident.user_id,
            cert_name: ident.cert_name,
            peer: self.peer,
            outgoing: self.outgoing,
            state: self.state(),
            ready: self.is_ready(),
            suspended: self.is_suspended(),
            send_queue: self.send_queue_len(),
            counters: self.counters(),
            connect_time: self.connect_time,
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint.name())
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Owned monitoring view of a connection.
#[derive(Clone, Debug)]
pub struct ConnectionSnapshot {
    pub id: u64,
    pub monitor_id: u32,
    pub endpoint: String,
    pub protocol: Option<String>,
    pub client_id: Option<String>,
    pub user_id: Option<String>,
    pub cert_name: Option<String>,
    pub peer: SocketAddr,
    pub outgoing: bool,
    pub state: LifeState,
    pub ready: bool,
    pub suspended: bool,
    /// Queued outbound buffers
    pub send_queue: usize,
    pub counters: ConnectionCountersSnapshot,
    pub connect_time: SystemTime,
}
