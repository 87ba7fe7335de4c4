// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! I/O processor threads.
//!
//! Each processor owns a set of connections and is the only thread that
//! touches their sockets, TLS sessions and read accumulation. Work arrives
//! as [`Job`]s on a double-buffered list: producers push under a short lock,
//! the worker swaps the whole list out and drains it without the lock.
//!
//! # Per-connection pass
//!
//! ```text
//! connect check -> TLS handshake -> read + frame -> async jobs -> write
//!       ^                |               |
//!       +--- repeat while the phase changes (StartTls, handshake done)
//!                                                  -> shutdown completion
//! ```
//!
//! Writes keep a single buffer in flight so output reaches the socket in
//! enqueue order.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use mio::net::TcpStream;
use parking_lot::{Condvar, Mutex};
use socket2::SockRef;

use crate::buffer::{BufferPool, OutBuffer};
use crate::config::TlsMode;
use crate::connection::{conn_record, Connection};
use crate::error::ReasonCode;
use crate::framer::{Assembler, FrameLimits, Framer, HandshakeContext, Recognition};
use crate::state::{Phase, Readiness};
use crate::tls::{peer_identity, TlsSession};
use crate::transport::Core;

/// Handshake bytes kept while no recognizer has decided.
const MAX_HANDSHAKE_PREFIX: usize = 4096;

/// Phase transitions followed within one pass.
const MAX_PHASE_STEPS: usize = 4;

// ============================================================================
// Jobs
// ============================================================================

/// Unit of work for a processor.
pub(crate) enum Job {
    /// Take ownership of a new connection
    New(Box<NewConnection>),
    /// Readiness event from the multiplexer
    Ready { id: u64, readable: bool, writable: bool },
    /// Send queue went from empty to non-empty
    DataAvailable(u64),
    /// Async jobs queued on the connection
    Async(u64),
    /// Graceful close requested
    Shutdown(u64),
    /// Immediate close requested
    ShutdownForce(u64),
    /// Shutdown escalation tick
    Tick,
    /// Grow receive buffers of busy connections
    GrowBuffers,
    /// Release every connection and exit
    Stop,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Job::New(n) => write!(f, "New({})", n.conn.id()),
            Job::Ready {
                id,
                readable,
                writable,
            } => write!(f, "Ready({}, r={}, w={})", id, readable, writable),
            Job::DataAvailable(id) => write!(f, "DataAvailable({})", id),
            Job::Async(id) => write!(f, "Async({})", id),
            Job::Shutdown(id) => write!(f, "Shutdown({})", id),
            Job::ShutdownForce(id) => write!(f, "ShutdownForce({})", id),
            Job::Tick => write!(f, "Tick"),
            Job::GrowBuffers => write!(f, "GrowBuffers"),
            Job::Stop => write!(f, "Stop"),
        }
    }
}

/// A socket handed to a processor.
pub(crate) struct NewConnection {
    pub conn: Arc<Connection>,
    pub socket: TcpStream,
    /// Client session for outbound TLS
    pub client_tls: Option<TlsSession>,
}

/// Processor state reachable from other threads.
pub struct ProcessorShared {
    index: usize,
    admin: bool,
    jobs: Mutex<Vec<Job>>,
    cond: Condvar,
    pool: BufferPool,
}

impl ProcessorShared {
    pub(crate) fn new(index: usize, admin: bool, buffer_size: usize, pool_bytes: u64) -> Self {
        Self {
            index,
            admin,
            jobs: Mutex::new(Vec::new()),
            cond: Condvar::new(),
            pool: BufferPool::new(buffer_size, pool_bytes),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Whether this processor serves admin endpoints.
    pub fn is_admin(&self) -> bool {
        self.admin
    }

    /// Outbound buffer pool.
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Enqueue a job and wake the worker.
    pub(crate) fn post(&self, job: Job) {
        let mut jobs = self.jobs.lock();
        jobs.push(job);
        if jobs.len() == 1 {
            self.cond.notify_one();
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_jobs(&self) -> usize {
        self.jobs.lock().len()
    }
}

// ============================================================================
// Worker
// ============================================================================

/// Processor thread state.
pub(crate) struct Processor {
    shared: Arc<ProcessorShared>,
    core: Arc<Core>,
    conns: HashMap<u64, IoConnection>,
    scratch: Vec<u8>,
    batch: Vec<Job>,
}

impl Processor {
    /// Spawn the worker thread for `shared`.
    pub(crate) fn spawn(shared: Arc<ProcessorShared>, core: Arc<Core>) -> io::Result<JoinHandle<()>> {
        let name = if shared.admin {
            "msgwire-iop-admin".to_string()
        } else {
            format!("msgwire-iop-{}", shared.index)
        };
        let scratch = vec![0u8; core.config.effective_buffer_size()];
        let worker = Processor {
            shared,
            core,
            conns: HashMap::new(),
            scratch,
            batch: Vec::new(),
        };
        thread::Builder::new().name(name).spawn(move || worker.run())
    }

    fn run(mut self) {
        log::debug!("[msgwire-iop] Processor {} started", self.shared.index);
        let mut running = true;
        while running {
            {
                let mut jobs = self.shared.jobs.lock();
                while jobs.is_empty() {
                    self.shared.cond.wait(&mut jobs);
                }
                std::mem::swap(&mut *jobs, &mut self.batch);
            }
            let mut batch = std::mem::take(&mut self.batch);
            for job in batch.drain(..) {
                if !self.handle(job) {
                    running = false;
                }
            }
            self.batch = batch;
        }
        self.teardown();
        log::debug!("[msgwire-iop] Processor {} stopped", self.shared.index);
    }

    fn handle(&mut self, job: Job) -> bool {
        #[cfg(feature = "trace")]
        log::trace!("[msgwire-iop] {} {:?}", self.shared.index, job);

        match job {
            Job::New(new) => self.adopt(*new),
            Job::Ready {
                id,
                readable,
                writable,
            } => {
                if let Some(io) = self.conns.get_mut(&id) {
                    io.ready.on_event(readable, writable);
                    self.drive(id);
                }
            }
            Job::DataAvailable(id) | Job::Async(id) => self.drive(id),
            Job::Shutdown(id) => {
                if let Some(io) = self.conns.get_mut(&id) {
                    if !io.phase.is_shutting_down() {
                        io.phase = Phase::ShuttingDown { force: false };
                    }
                    self.drive(id);
                }
            }
            Job::ShutdownForce(id) => {
                if let Some(io) = self.conns.get_mut(&id) {
                    io.phase = Phase::ShuttingDown { force: true };
                    self.drive(id);
                }
            }
            Job::Tick => self.sledge(),
            Job::GrowBuffers => self.grow_buffers(),
            Job::Stop => return false,
        }
        true
    }

    /// Run one pass over connection `id`.
    fn drive(&mut self, id: u64) {
        let finished = match self.conns.get_mut(&id) {
            Some(io) => io.step(&self.core, &mut self.scratch) == Step::Finish,
            None => return,
        };
        if finished {
            if let Some(io) = self.conns.remove(&id) {
                self.finish(io);
            }
        }
    }

    fn adopt(&mut self, new: NewConnection) {
        let NewConnection {
            conn,
            mut socket,
            client_tls,
        } = new;
        let id = conn.id();
        let config = conn.endpoint_config();

        self.core.lists.add(conn.clone());
        self.core.register_monitor(&conn);
        conn.endpoint().stats().record_connect();
        conn_record!(
            conn.is_quiet(),
            "[msgwire] Create connection: id={} endpoint={} peer={} outgoing={}",
            id,
            conn.endpoint().name(),
            conn.peer_addr(),
            conn.is_outgoing()
        );

        let registered = self
            .core
            .readiness
            .register(&mut socket, id, self.shared.index);

        let mut limits = conn.frame_limits(self.core.config.first_packet_max);
        limits.first_exchange_done = conn.is_outgoing();
        let mut io = IoConnection {
            conn: conn.clone(),
            socket,
            tls: None,
            framer: conn.framer(),
            phase: Phase::Opening,
            ready: Readiness::default(),
            assembler: Assembler::new(),
            limits,
            in_flight: None,
            sledge: 0,
            handshake_failed: false,
            rcv_full: false,
        };

        if let Err(e) = registered {
            log::warn!("[msgwire-iop] Cannot register connection {}: {}", id, e);
            io.fail(ReasonCode::SocketError);
        } else if conn.is_outgoing() {
            io.tls = client_tls;
            io.phase = Phase::Connecting;
        } else if config.tls == TlsMode::Required {
            match conn.endpoint().tls().map(|ctx| ctx.new_session()) {
                Some(Ok(session)) => {
                    io.tls = Some(session);
                    io.phase = Phase::Handshaking;
                }
                Some(Err(e)) => {
                    log::warn!("[msgwire-iop] TLS session for {} failed: {}", id, e);
                    io.fail(ReasonCode::ServerUnavailable);
                }
                None => io.fail(ReasonCode::ServerUnavailable),
            }
        }
        if !conn.state().is_live() && !io.phase.is_shutting_down() {
            io.phase = Phase::ShuttingDown { force: true };
        }

        self.conns.insert(id, io);
        self.drive(id);
    }

    /// Release the socket and hand the connection to the closed list.
    fn finish(&mut self, mut io: IoConnection) {
        let conn = io.conn.clone();
        let id = conn.id();
        conn.close(ReasonCode::ServerTerminating, false, None);

        if let Some(tls) = io.tls.as_mut() {
            if !io.handshake_failed && !tls.is_handshaking() {
                tls.send_close_notify();
                let _ = tls.write_tls(&mut io.socket);
            }
        }
        self.core.readiness.deregister(&mut io.socket, id);
        let _ = io.socket.shutdown(Shutdown::Both);
        io.phase = Phase::Disconnected;
        drop(io.socket);
        conn.life().set_closed();

        let pool = conn.processor().pool();
        if let Some(buf) = io.in_flight.take() {
            pool.put(buf);
        }
        let dropped = conn.release_outbound() as u64;
        if dropped > 0 {
            conn.counters_mut().record_lost(dropped);
            conn.endpoint().stats().record_lost(dropped);
        }

        conn.endpoint().stats().record_disconnect();
        self.core.release_active(&conn);
        self.core.registry.remove(&conn);
        self.core.lists.move_to_closed(id);
        log::debug!(
            "[msgwire-iop] Connection {} released ({})",
            id,
            conn.close_reason().unwrap_or(ReasonCode::ServerTerminating)
        );
    }

    fn sledge(&mut self) {
        let limit = self.core.config.sledge_ticks;
        let draining: Vec<u64> = self
            .conns
            .iter()
            .filter(|(_, io)| io.phase == Phase::ShuttingDown { force: false })
            .map(|(id, _)| *id)
            .collect();
        for id in draining {
            if let Some(io) = self.conns.get_mut(&id) {
                io.sledge = io.sledge.saturating_add(1);
                if io.sledge >= limit {
                    log::debug!("[msgwire-iop] Connection {} shutdown forced", id);
                    io.phase = Phase::ShuttingDown { force: true };
                }
            }
            self.drive(id);
        }
    }

    fn grow_buffers(&mut self) {
        let max = self.core.config.max_recv_buffer;
        for (id, io) in self.conns.iter_mut() {
            if !std::mem::take(&mut io.rcv_full) {
                continue;
            }
            let sock = SockRef::from(&io.socket);
            let current = sock.recv_buffer_size().unwrap_or(0);
            let target = current.saturating_mul(2).min(max);
            if target > current && sock.set_recv_buffer_size(target).is_ok() {
                io.conn.counters_mut().record_rcvbuf_grow();
                log::debug!("[msgwire-iop] Connection {} SO_RCVBUF {} -> {}", id, current, target);
            }
        }
    }

    fn teardown(&mut self) {
        let ids: Vec<u64> = self.conns.keys().copied().collect();
        for id in ids {
            if let Some(io) = self.conns.remove(&id) {
                self.finish(io);
            }
        }
    }
}

// ============================================================================
// Per-connection I/O state
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Step {
    Keep,
    Finish,
}

/// Processor-owned side of a connection.
struct IoConnection {
    conn: Arc<Connection>,
    socket: TcpStream,
    tls: Option<TlsSession>,
    framer: Option<Arc<dyn Framer>>,
    phase: Phase,
    ready: Readiness,
    assembler: Assembler,
    limits: FrameLimits,
    in_flight: Option<OutBuffer>,
    sledge: u8,
    handshake_failed: bool,
    rcv_full: bool,
}

fn tls_reason(err: &rustls::Error) -> ReasonCode {
    match err {
        rustls::Error::InvalidCertificate(_) | rustls::Error::NoCertificatesPresented => {
            ReasonCode::CertificateInvalid
        }
        _ => ReasonCode::TlsHandshakeFailed,
    }
}

/// Push pending ciphertext. Returns `false` if the socket would block.
fn flush_tls(
    tls: &mut TlsSession,
    socket: &mut TcpStream,
    ready: &mut Readiness,
) -> Result<bool, ReasonCode> {
    while tls.wants_write() {
        match tls.write_tls(socket) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                ready.write_blocked();
                return Ok(false);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(_) => return Err(ReasonCode::SocketError),
        }
    }
    Ok(true)
}

impl IoConnection {
    /// Start the close sequence from the processor side.
    fn fail(&mut self, reason: ReasonCode) {
        if self.conn.close(reason, false, None) {
            self.phase = Phase::ShuttingDown { force: true };
        } else if !self.phase.is_shutting_down() {
            self.phase = Phase::ShuttingDown { force: false };
        }
    }

    fn step(&mut self, core: &Core, scratch: &mut [u8]) -> Step {
        if !self.phase.is_shutting_down() && !self.conn.state().is_live() {
            self.phase = Phase::ShuttingDown { force: false };
        }

        for _ in 0..MAX_PHASE_STEPS {
            let before = self.phase;
            let progress = match self.phase {
                Phase::Connecting => self.check_connect(),
                Phase::Handshaking => self.handshake(),
                _ => Ok(()),
            };
            let progress = progress.and_then(|()| match self.phase {
                Phase::Opening | Phase::Connected => self.read(core, scratch),
                _ => Ok(()),
            });
            if let Err(reason) = progress {
                if reason == ReasonCode::TlsHandshakeFailed || reason == ReasonCode::CertificateInvalid
                {
                    self.handshake_failed = true;
                }
                self.fail(reason);
            }
            if self.phase == before {
                break;
            }
        }

        if self.phase.has_socket() {
            for job in self.conn.take_jobs() {
                job(&self.conn);
            }
        }

        if let Err(reason) = self.write(core) {
            self.fail(reason);
        }

        match self.phase {
            Phase::ShuttingDown { force: true } => Step::Finish,
            Phase::ShuttingDown { force: false } if self.drained() => Step::Finish,
            _ => Step::Keep,
        }
    }

    fn drained(&self) -> bool {
        self.in_flight.is_none()
            && !self.conn.has_outbound()
            && !self.tls.as_ref().is_some_and(|t| t.wants_write())
    }

    // ------------------------------------------------------------------------
    // Connect / handshake
    // ------------------------------------------------------------------------

    fn check_connect(&mut self) -> Result<(), ReasonCode> {
        if !self.ready.can_write && !self.ready.can_read {
            return Ok(());
        }
        match self.socket.take_error() {
            Ok(None) => {}
            Ok(Some(e)) | Err(e) => {
                log::warn!(
                    "[msgwire-iop] Connect to {} failed: {}",
                    self.conn.peer_addr(),
                    e
                );
                return Err(ReasonCode::ConnectFailed);
            }
        }
        match self.socket.peer_addr() {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotConnected => return Ok(()),
            Err(_) => return Err(ReasonCode::ConnectFailed),
        }
        log::debug!(
            "[msgwire-iop] Connection {} connected to {}",
            self.conn.id(),
            self.conn.peer_addr()
        );
        if self.tls.is_some() {
            self.phase = Phase::Handshaking;
            Ok(())
        } else {
            self.enter_connected()
        }
    }

    /// Outbound connections have their framer fixed up front.
    fn enter_connected(&mut self) -> Result<(), ReasonCode> {
        let Some(framer) = self.framer.clone() else {
            return Err(ReasonCode::UnknownProtocol);
        };
        self.phase = Phase::Connected;
        self.conn.life().open();
        self.conn.handler().on_connection(&self.conn, framer.family())
    }

    fn handshake(&mut self) -> Result<(), ReasonCode> {
        let Some(tls) = self.tls.as_mut() else {
            return Err(ReasonCode::ServerUnavailable);
        };

        while self.ready.can_read && tls.is_handshaking() {
            match tls.read_tls(&mut self.socket) {
                Ok(0) => return Err(ReasonCode::TlsHandshakeFailed),
                Ok(_) => {
                    if let Err(e) = tls.process_new_packets() {
                        log::warn!(
                            "[msgwire-iop] TLS handshake with {} failed: {}",
                            self.conn.peer_addr(),
                            e
                        );
                        // Deliver the alert if the socket takes it.
                        let _ = flush_tls(tls, &mut self.socket, &mut self.ready);
                        return Err(tls_reason(&e));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.ready.read_blocked(),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => return Err(ReasonCode::TlsHandshakeFailed),
            }
        }
        if !flush_tls(tls, &mut self.socket, &mut self.ready)? && tls.is_handshaking() {
            return Ok(());
        }
        if tls.is_handshaking() {
            return Ok(());
        }

        if let Some(der) = tls.peer_certificate() {
            let revoked = self
                .conn
                .endpoint()
                .tls()
                .is_some_and(|ctx| ctx.is_revoked(&der));
            if revoked {
                return Err(ReasonCode::CertificateInvalid);
            }
            let name = peer_identity(&der);
            self.conn.set_peer_cert(der, name);
        }
        log::debug!(
            "[msgwire-iop] Connection {} TLS established (cert={})",
            self.conn.id(),
            self.conn.cert_name().as_deref().unwrap_or("-")
        );

        if self.conn.is_outgoing() {
            self.enter_connected()
        } else {
            self.phase = Phase::Opening;
            Ok(())
        }
    }

    // ------------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------------

    fn read(&mut self, core: &Core, scratch: &mut [u8]) -> Result<(), ReasonCode> {
        while matches!(self.phase, Phase::Opening | Phase::Connected) {
            let n = match self.tls.as_mut() {
                Some(tls) => match tls.read_plain(scratch) {
                    Ok(0) => return Err(ReasonCode::ClosedByPeer),
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        if !self.ready.can_read {
                            return Ok(());
                        }
                        match tls.read_tls(&mut self.socket) {
                            Ok(0) => return Err(ReasonCode::ClosedByPeer),
                            Ok(m) => {
                                self.rcv_full |= m >= scratch.len();
                                tls.process_new_packets().map_err(|e| tls_reason(&e))?;
                                if !flush_tls(tls, &mut self.socket, &mut self.ready)? {
                                    self.ready.read_blocked_on_write();
                                }
                            }
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                                self.ready.read_blocked();
                            }
                            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                            Err(_) => return Err(ReasonCode::SocketError),
                        }
                        continue;
                    }
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                        return Err(ReasonCode::ClosedByPeer)
                    }
                    Err(_) => return Err(ReasonCode::SocketError),
                },
                None => {
                    if !self.ready.can_read {
                        return Ok(());
                    }
                    match self.socket.read(scratch) {
                        Ok(0) => return Err(ReasonCode::ClosedByPeer),
                        Ok(n) => n,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            self.ready.read_blocked();
                            return Ok(());
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(_) => return Err(ReasonCode::SocketError),
                    }
                }
            };

            // A full scratch read, plain or decrypted, marks the socket busy.
            self.rcv_full |= n == scratch.len();
            self.conn.counters_mut().record_read_bytes(n);
            self.conn.endpoint().stats().record_read(n as u64, 0);
            match self.phase {
                Phase::Opening => self.recognize(core, &scratch[..n])?,
                _ => self.dispatch(&scratch[..n])?,
            }
        }
        Ok(())
    }

    /// Run the recognizer chain over the handshake prefix.
    fn recognize(&mut self, core: &Core, data: &[u8]) -> Result<(), ReasonCode> {
        self.assembler.stash(data);
        let config = self.conn.endpoint_config();
        let ctx = HandshakeContext {
            tls: config.tls,
            tls_active: self.tls.is_some(),
            internal: config.is_internal(),
        };
        match core.chain.recognize(self.assembler.buffered(), &ctx) {
            Recognition::Recognized(framer) => {
                let family = framer.family().to_string();
                if !config.allows_protocol(&family) {
                    log::debug!(
                        "[msgwire-iop] Connection {} protocol {} not allowed on {}",
                        self.conn.id(),
                        family,
                        config.name
                    );
                    return Err(ReasonCode::ProtocolNotAllowed);
                }
                self.conn.set_framer(framer.clone());
                self.framer = Some(framer);
                self.phase = Phase::Connected;
                self.conn.life().open();
                log::debug!(
                    "[msgwire-iop] Connection {} speaks {}",
                    self.conn.id(),
                    family
                );
                self.conn.handler().on_connection(&self.conn, &family)?;
                self.dispatch(&[])
            }
            Recognition::StartTls => {
                let Some(ctx) = self.conn.endpoint().tls() else {
                    return Err(ReasonCode::ServerUnavailable);
                };
                let mut session = ctx.new_session().map_err(|e| {
                    log::warn!("[msgwire-iop] TLS session failed: {}", e);
                    ReasonCode::ServerUnavailable
                })?;
                let prefix = self.assembler.take();
                session.replay(&prefix).map_err(|e| tls_reason(&e))?;
                self.tls = Some(session);
                self.phase = Phase::Handshaking;
                Ok(())
            }
            Recognition::NeedMore(_) if self.assembler.buffered().len() < MAX_HANDSHAKE_PREFIX => {
                Ok(())
            }
            Recognition::NeedMore(_) | Recognition::NotMatched => Err(ReasonCode::UnknownProtocol),
        }
    }

    /// Frame `data` and hand complete payloads to the protocol handler.
    fn dispatch(&mut self, data: &[u8]) -> Result<(), ReasonCode> {
        let Some(framer) = self.framer.clone() else {
            return Ok(());
        };
        let conn = &self.conn;
        let mut delivered = 0u64;
        let result = self
            .assembler
            .push(framer.as_ref(), data, &mut self.limits, |payload, kind| {
                if !conn.state().is_live() {
                    return Err(ReasonCode::ProtocolClose);
                }
                conn.counters_mut().record_read_msg();
                delivered += 1;
                conn.mark_ready();
                conn.handler().receive(conn, payload, kind).inspect_err(|reason| {
                    conn.close(*reason, true, None);
                })
            });
        conn.endpoint().stats().record_read(0, delivered);
        result
    }

    // ------------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------------

    fn write(&mut self, core: &Core) -> Result<(), ReasonCode> {
        if !matches!(self.phase, Phase::Connected | Phase::ShuttingDown { .. }) {
            return Ok(());
        }
        if let Some(tls) = self.tls.as_mut() {
            if self.ready.can_write && !flush_tls(tls, &mut self.socket, &mut self.ready)? {
                return Ok(());
            }
        }

        while self.ready.can_write {
            if self.in_flight.is_none() {
                self.in_flight = self.conn.pop_outbound();
            }
            let Some(buf) = self.in_flight.as_mut() else {
                break;
            };
            let written = match self.tls.as_mut() {
                Some(tls) => tls.write_plain(buf.pending()),
                None => self.socket.write(buf.pending()),
            };
            match written {
                Ok(0) => break,
                Ok(n) => {
                    buf.consume(n);
                    self.conn.counters_mut().record_write_bytes(n);
                    self.conn.endpoint().stats().record_write(n as u64, 0);
                    if buf.is_empty() {
                        if let Some(done) = self.in_flight.take() {
                            self.conn.processor().pool().put(done);
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.ready.write_blocked();
                    self.grow_send_buffer(core);
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => return Err(ReasonCode::SocketError),
            }
            if let Some(tls) = self.tls.as_mut() {
                if !flush_tls(tls, &mut self.socket, &mut self.ready)? {
                    break;
                }
            }
        }

        if self.in_flight.is_none() && self.conn.try_resume() {
            log::debug!("[msgwire-iop] Connection {} resumed", self.conn.id());
            self.conn.handler().on_resume(&self.conn);
        }
        Ok(())
    }

    fn grow_send_buffer(&self, core: &Core) {
        let max = core.config.max_send_buffer;
        let sock = SockRef::from(&self.socket);
        let current = sock.send_buffer_size().unwrap_or(max);
        if current < max {
            let _ = sock.set_send_buffer_size(current.saturating_mul(2).min(max));
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn test_processor(buffer_size: usize, pool_bytes: u64) -> Arc<ProcessorShared> {
        Arc::new(ProcessorShared::new(0, false, buffer_size, pool_bytes))
    }

    #[test]
    fn test_post_wakes_on_first_job_only() {
        let shared = test_processor(64, 1024);
        shared.post(Job::Tick);
        shared.post(Job::GrowBuffers);
        assert_eq!(shared.pending_jobs(), 2);
    }

    #[test]
    fn test_tls_reason_mapping() {
        assert_eq!(
            tls_reason(&rustls::Error::NoCertificatesPresented),
            ReasonCode::CertificateInvalid
        );
        assert_eq!(
            tls_reason(&rustls::Error::HandshakeNotComplete),
            ReasonCode::TlsHandshakeFailed
        );
    }

    #[test]
    fn test_job_debug() {
        assert_eq!(format!("{:?}", Job::Shutdown(4)), "Shutdown(4)");
        assert_eq!(
            format!(
                "{:?}",
                Job::Ready {
                    id: 1,
                    readable: true,
                    writable: false
                }
            ),
            "Ready(1, r=true, w=false)"
        );
    }
}
