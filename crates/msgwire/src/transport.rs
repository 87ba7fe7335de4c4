// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Engine facade.
//!
//! # Threads
//!
//! ```text
//! +-------------------------------------------------------------------+
//! |                            Transport                              |
//! |                                                                   |
//! |  msgwire-acceptor ----> Core::spawn_connection ----+              |
//! |                                                    v              |
//! |  msgwire-poll --- Job::Ready ---> msgwire-iop-0 .. msgwire-iop-N  |
//! |                                   msgwire-iop-admin               |
//! |  msgwire-timers --- Tick / GrowBuffers / sweeps                   |
//! |  msgwire-delivery --- admin closes, expirations                   |
//! +-------------------------------------------------------------------+
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use msgwire::{Connection, EndpointConfig, ProtocolHandler, ReasonCode, SendFlags};
//! use msgwire::{Transport, TransportConfig};
//!
//! struct Echo;
//!
//! impl ProtocolHandler for Echo {
//!     fn receive(&self, conn: &Arc<Connection>, payload: &[u8], kind: u32) -> Result<(), ReasonCode> {
//!         conn.send(payload, kind, SendFlags::NONE);
//!         Ok(())
//!     }
//! }
//!
//! let transport = Transport::start(TransportConfig::default(), Arc::new(Echo))?;
//! transport.make_endpoint(EndpointConfig::new("rpc", 7000).with_protocols(&["rpc"]))?;
//! # Ok::<(), msgwire::TransportError>(())
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use parking_lot::{Mutex, RwLock};

use crate::acceptor::{bind_listener, Acceptor, AcceptorHandle};
use crate::admin::{ClientSets, ConnectionQuery, ConnectionSelector};
use crate::config::{EndpointConfig, SecurityProfile, TransportConfig};
use crate::connection::{Connection, ConnectionParams, ConnectionSnapshot};
use crate::delivery::{Delivery, DeliveryQueue};
use crate::endpoint::{Endpoint, EndpointSnapshot, OUTGOING_ENDPOINT};
use crate::error::{ReasonCode, Result, TransportError};
use crate::framer::{Framer, FramerChain, Recognizer};
use crate::handler::ProtocolHandler;
use crate::lists::ConnectionLists;
use crate::pattern::NoLogRanges;
use crate::processor::{Job, NewConnection, Processor, ProcessorShared};
use crate::readiness::{self, ReadinessShared};
use crate::registry::MonitorRegistry;
use crate::timers::{self, TimerHandle};
use crate::tls::{ClientTls, TlsContext, TlsSession};

const CLOSE_ALL_STEP: Duration = Duration::from_secs(1);
const CLOSE_ALL_POLL: Duration = Duration::from_millis(20);

// ============================================================================
// Shared engine state
// ============================================================================

/// State shared by every engine thread.
pub(crate) struct Core {
    pub(crate) config: TransportConfig,
    pub(crate) handler: Arc<dyn ProtocolHandler>,
    pub(crate) chain: FramerChain,
    /// Regular processors followed by the admin processor
    pub(crate) processors: Vec<Arc<ProcessorShared>>,
    pub(crate) readiness: ReadinessShared,
    pub(crate) registry: Arc<MonitorRegistry>,
    pub(crate) lists: ConnectionLists,
    pub(crate) delivery: DeliveryQueue,
    pub(crate) endpoints: RwLock<HashMap<String, Arc<Endpoint>>>,
    pub(crate) profiles: RwLock<HashMap<String, Arc<TlsContext>>>,
    pub(crate) client_sets: Arc<ClientSets>,
    /// Inbound non-admin connections, checked against the ceiling
    pub(crate) active: AtomicUsize,
    pub(crate) nolog: NoLogRanges,
    next_id: AtomicU64,
}

impl Core {
    fn processor_for(&self, id: u64, admin: bool) -> Arc<ProcessorShared> {
        let regular = self.processors.len() - 1;
        let index = if admin { regular } else { (id % regular as u64) as usize };
        self.processors[index].clone()
    }

    /// Create a connection for `socket` and hand it to its processor.
    pub(crate) fn spawn_connection(
        &self,
        endpoint: Arc<Endpoint>,
        socket: TcpStream,
        peer: SocketAddr,
        outgoing: bool,
        handler: Arc<dyn ProtocolHandler>,
        framer: Option<Arc<dyn Framer>>,
        client_tls: Option<TlsSession>,
    ) -> Arc<Connection> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let admin = endpoint.is_admin();
        let conn = Connection::new(ConnectionParams {
            id,
            local: socket.local_addr().ok(),
            processor: self.processor_for(id, admin),
            quiet: admin || self.nolog.contains(peer.ip()),
            endpoint,
            peer,
            outgoing,
            handler,
            client_sets: self.client_sets.clone(),
            suspend_limit: self.config.suspend_queue_limit,
            framer,
        });
        conn.processor().post(Job::New(Box::new(NewConnection {
            conn: conn.clone(),
            socket,
            client_tls,
        })));
        conn
    }

    /// Register `conn` for monitoring, deferring to the delivery thread if
    /// the registry is busy.
    pub(crate) fn register_monitor(&self, conn: &Arc<Connection>) {
        if self.registry.try_add(conn).is_some() {
            return;
        }
        let registry = self.registry.clone();
        self.delivery.add(
            conn.clone(),
            Box::new(move |c| match registry.try_add(c) {
                Some(_) => Delivery::Done,
                None => Delivery::RescheduleEvenIfClosed,
            }),
        );
    }

    /// Give back the ceiling slot taken at accept time.
    pub(crate) fn release_active(&self, conn: &Connection) {
        if !conn.is_outgoing() && !conn.endpoint_config().admin {
            self.active.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn endpoint(&self, name: &str) -> Option<Arc<Endpoint>> {
        self.endpoints.read().get(name).cloned()
    }

    fn tls_for(&self, config: &EndpointConfig) -> Result<Option<Arc<TlsContext>>> {
        if !config.tls.needs_context() {
            return Ok(None);
        }
        let name = config.security_profile.as_deref().unwrap_or_default();
        self.profiles
            .read()
            .get(name)
            .cloned()
            .map(Some)
            .ok_or_else(|| TransportError::UnknownSecurityProfile(name.to_string()))
    }

    /// Inbound connections still holding a socket.
    fn pending(&self, include_admin: bool) -> Vec<Arc<Connection>> {
        self.lists
            .snapshot_active()
            .into_iter()
            .filter(|c| include_admin || !c.endpoint_config().admin)
            .collect()
    }
}

// ============================================================================
// Outbound options
// ============================================================================

/// Parameters for [`Transport::connect`].
#[derive(Clone)]
pub struct OutboundOptions {
    /// Owning endpoint, defaults to the internal outgoing endpoint
    pub endpoint: Option<String>,
    /// Wire format used on the connection
    pub framer: Arc<dyn Framer>,
    /// Handler replacing the engine-wide one for this connection
    pub handler: Option<Arc<dyn ProtocolHandler>>,
    /// Client TLS configuration and the server name to verify
    pub tls: Option<(ClientTls, String)>,
}

impl OutboundOptions {
    pub fn new(framer: Arc<dyn Framer>) -> Self {
        Self {
            endpoint: None,
            framer,
            handler: None,
            tls: None,
        }
    }

    pub fn with_endpoint(mut self, name: impl Into<String>) -> Self {
        self.endpoint = Some(name.into());
        self
    }

    pub fn with_handler(mut self, handler: Arc<dyn ProtocolHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_tls(mut self, client: ClientTls, server_name: impl Into<String>) -> Self {
        self.tls = Some((client, server_name.into()));
        self
    }
}

// ============================================================================
// Transport
// ============================================================================

/// The running engine.
pub struct Transport {
    core: Arc<Core>,
    acceptor: AcceptorHandle,
    timers: Mutex<Option<TimerHandle>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    services: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Transport {
    /// Validate `config` and start every engine thread.
    pub fn start(config: TransportConfig, handler: Arc<dyn ProtocolHandler>) -> Result<Self> {
        config.validate().map_err(TransportError::InvalidConfig)?;

        let (readiness, poll) = ReadinessShared::new()?;
        let buffer_size = config.effective_buffer_size();
        let pool_bytes = config.pool_bytes_per_processor();
        let regular = config.io_processors.max(1);
        let processors: Vec<Arc<ProcessorShared>> = (0..=regular)
            .map(|i| Arc::new(ProcessorShared::new(i, i == regular, buffer_size, pool_bytes)))
            .collect();
        let (delivery, delivery_worker) = DeliveryQueue::new();
        let (acceptor, acceptor_handle) = Acceptor::new()?;

        let outgoing = Arc::new(Endpoint::new(EndpointConfig::new(OUTGOING_ENDPOINT, 0), None));
        let mut endpoints = HashMap::new();
        endpoints.insert(OUTGOING_ENDPOINT.to_string(), outgoing);

        let core = Arc::new(Core {
            handler,
            chain: FramerChain::new(),
            processors,
            readiness,
            registry: Arc::new(MonitorRegistry::new(
                config.monitor_capacity,
                config.effective_free_limit(),
            )),
            lists: ConnectionLists::new(),
            delivery,
            endpoints: RwLock::new(endpoints),
            profiles: RwLock::new(HashMap::new()),
            client_sets: Arc::new(ClientSets::new()),
            active: AtomicUsize::new(0),
            nolog: NoLogRanges::parse(&config.nolog),
            next_id: AtomicU64::new(1),
            config,
        });

        let transport = Transport {
            core: core.clone(),
            acceptor: acceptor_handle,
            timers: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            services: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        };

        // From here on a failure drops `transport`, which stops what started.
        for shared in &core.processors {
            let handle = Processor::spawn(shared.clone(), core.clone())?;
            transport.workers.lock().push(handle);
        }
        {
            let mut services = transport.services.lock();
            services.push(readiness::spawn(poll, core.clone())?);
            services.push(delivery_worker.spawn()?);
            services.push(acceptor.spawn(core.clone())?);
            let (timer, handle) = timers::spawn(core.clone())?;
            *transport.timers.lock() = Some(timer);
            services.push(handle);
        }

        log::info!(
            "[msgwire] Transport started: {} I/O processors, buffer={} B, pool={} B/processor, max connections={}",
            regular,
            buffer_size,
            pool_bytes,
            core.config.active_connections_max
        );
        Ok(transport)
    }

    pub fn config(&self) -> &TransportConfig {
        &self.core.config
    }

    /// Add a recognizer consulted after the built-in ones and before the
    /// legacy fallback.
    pub fn register_recognizer(&self, recognizer: Arc<dyn Recognizer>) {
        self.core.chain.register(recognizer);
    }

    // ------------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------------

    /// Create or replace a security profile.
    ///
    /// Endpoints using it switch to the new context for new connections.
    pub fn make_security_profile(&self, profile: SecurityProfile) -> Result<()> {
        let ctx = Arc::new(TlsContext::from_profile(&profile)?);
        self.core
            .profiles
            .write()
            .insert(profile.name.clone(), ctx.clone());
        for ep in self.core.endpoints.read().values() {
            if ep.config().security_profile.as_deref() == Some(profile.name.as_str()) {
                ep.set_tls(Some(ctx.clone()));
            }
        }
        log::info!("[msgwire] Security profile {} updated", profile.name);
        Ok(())
    }

    /// Create an endpoint or update an existing one.
    ///
    /// Address, port, TLS and admin changes restart the listener; other
    /// changes apply live. Disabling closes the endpoint's connections.
    pub fn make_endpoint(&self, config: EndpointConfig) -> Result<Arc<Endpoint>> {
        config.validate().map_err(TransportError::InvalidConfig)?;
        if config.name == OUTGOING_ENDPOINT {
            return Err(TransportError::InvalidConfig("endpoint name is reserved"));
        }
        let tls = self.core.tls_for(&config)?;
        let name = config.name.clone();

        let Some(ep) = self.core.endpoint(&name) else {
            let enabled = config.enabled;
            let listener = if enabled {
                Some(bind_listener(&config)?)
            } else {
                None
            };
            let ep = Arc::new(Endpoint::new(config, tls));
            self.core.endpoints.write().insert(name.clone(), ep.clone());
            if let Some(listener) = listener {
                self.acceptor.add(ep.clone(), listener)?;
            }
            log::info!("[msgwire] Endpoint {} created (enabled={})", name, enabled);
            return Ok(ep);
        };

        let old = ep.config();
        let restart = old.needs_restart(&config);
        let enabled = config.enabled;
        ep.set_tls(tls);
        ep.set_config(config.clone());

        if !enabled {
            if old.enabled {
                self.acceptor.remove(&name)?;
                self.core.close_endpoint(&name, ReasonCode::EndpointDisabled);
            }
        } else if restart || !old.enabled {
            if old.enabled {
                self.acceptor.remove(&name)?;
            }
            let listener = bind_listener(&config)?;
            self.acceptor.add(ep.clone(), listener)?;
        }
        log::info!(
            "[msgwire] Endpoint {} updated (enabled={}, restarted={})",
            name,
            enabled,
            enabled && (restart || !old.enabled)
        );
        Ok(ep)
    }

    /// Remove an endpoint and close its connections.
    pub fn stop_endpoint(&self, name: &str) -> Result<usize> {
        if name == OUTGOING_ENDPOINT || self.core.endpoint(name).is_none() {
            return Err(TransportError::UnknownEndpoint(name.to_string()));
        }
        self.acceptor.remove(name)?;
        let closed = self.core.close_endpoint(name, ReasonCode::EndpointDisabled);
        self.core.endpoints.write().remove(name);
        log::info!("[msgwire] Endpoint {} stopped", name);
        Ok(closed)
    }

    pub fn endpoint(&self, name: &str) -> Option<Arc<Endpoint>> {
        self.core.endpoint(name)
    }

    // ------------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------------

    /// Open an outbound connection to `addr`.
    ///
    /// Returns as soon as the connect is started; failures close the
    /// connection with [`ReasonCode::ConnectFailed`].
    pub fn connect(&self, addr: SocketAddr, options: OutboundOptions) -> Result<Arc<Connection>> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(TransportError::Stopped);
        }
        let name = options.endpoint.as_deref().unwrap_or(OUTGOING_ENDPOINT);
        let endpoint = self
            .core
            .endpoint(name)
            .ok_or_else(|| TransportError::UnknownEndpoint(name.to_string()))?;
        let client_tls = match &options.tls {
            Some((client, server_name)) => Some(client.new_session(server_name)?),
            None => None,
        };
        let socket = TcpStream::connect(addr)?;
        if let Err(e) = socket.set_nodelay(endpoint.config().nodelay) {
            log::debug!("[msgwire] set_nodelay failed for {}: {}", addr, e);
        }
        let handler = options
            .handler
            .unwrap_or_else(|| self.core.handler.clone());
        Ok(self.core.spawn_connection(
            endpoint,
            socket,
            addr,
            true,
            handler,
            Some(options.framer),
            client_tls,
        ))
    }

    /// Queue deferred work for `conn` on the delivery thread.
    pub fn add_work<F>(&self, conn: &Arc<Connection>, work: F) -> bool
    where
        F: FnMut(&Arc<Connection>) -> Delivery + Send + 'static,
    {
        self.core.delivery.add(conn.clone(), Box::new(work))
    }

    /// Connection registered under monitoring id `id`.
    pub fn connection(&self, id: u32) -> Option<Arc<Connection>> {
        self.core.registry.get(id)
    }

    /// Active connections summed over all endpoints.
    pub fn active_connections(&self) -> u64 {
        self.core
            .endpoints
            .read()
            .values()
            .map(|ep| ep.stats().active())
            .sum()
    }

    // ------------------------------------------------------------------------
    // Administration
    // ------------------------------------------------------------------------

    /// Close every connection on endpoints matching `pattern`.
    pub fn disconnect_endpoint(&self, pattern: &str) -> usize {
        self.core
            .disconnect_endpoint(pattern, ReasonCode::ForcedDisconnect)
    }

    /// Forced disconnect of the selected connections. `None` selects every
    /// connection with a client id.
    pub fn close_connections(&self, selector: Option<&ConnectionSelector>) -> usize {
        self.core.close_connections(selector)
    }

    /// Disable the client set `pattern` and wait for its connections to go.
    pub fn disable_client_set(&self, pattern: &str) -> Result<()> {
        self.core
            .disable_client_set(pattern, ReasonCode::ClientSetDisabled)
    }

    pub fn enable_client_set(&self, pattern: &str) -> bool {
        self.core.enable_client_set(pattern)
    }

    /// Close connections of an already disabled set without changing it.
    pub fn close_client_set(&self, pattern: &str) -> Result<()> {
        self.core
            .close_client_set(pattern, ReasonCode::ClientSetDisabled)
    }

    /// Close connections on `endpoint` whose certificate is now revoked.
    pub fn revoke_connections(&self, endpoint: &str) -> Result<usize> {
        self.core.revoke_connections(endpoint)
    }

    /// One page of connection snapshots and the position to continue from
    /// (0 at the end).
    pub fn connection_monitor(
        &self,
        query: &ConnectionQuery,
        position: u32,
        max: usize,
    ) -> (Vec<ConnectionSnapshot>, u32) {
        self.core.connection_monitor(query, position, max)
    }

    pub fn endpoint_monitor(&self, pattern: &str) -> Vec<EndpointSnapshot> {
        self.core.endpoint_monitor(pattern)
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    /// Close connections with [`ReasonCode::ServerTerminating`] and wait for
    /// them to drain. Returns the number still open when the wait ended.
    pub fn close_all_connections(&self, include_admin: bool) -> usize {
        let targets = self.core.pending(include_admin);
        if targets.is_empty() {
            return 0;
        }
        log::info!("[msgwire] Closing {} connections", targets.len());
        for conn in &targets {
            conn.close(ReasonCode::ServerTerminating, true, None);
        }

        let deadline = Instant::now() + self.core.config.close_all_wait();
        let mut last = targets.len();
        let mut stalls = 0;
        let mut next_check = Instant::now() + CLOSE_ALL_STEP;
        loop {
            let remaining = self.core.pending(include_admin).len();
            if remaining == 0 {
                return 0;
            }
            let now = Instant::now();
            if now >= deadline {
                last = remaining;
                break;
            }
            if now >= next_check {
                next_check = now + CLOSE_ALL_STEP;
                if remaining >= last {
                    stalls += 1;
                    if stalls >= 2 {
                        last = remaining;
                        break;
                    }
                } else {
                    stalls = 0;
                }
                last = remaining;
            }
            thread::sleep(CLOSE_ALL_POLL);
        }
        for conn in self.core.pending(include_admin) {
            log::warn!(
                "[msgwire] Connection {} ({}) still open at shutdown",
                conn.id(),
                conn.peer_addr()
            );
        }
        last
    }

    /// Stop listeners, drain connections and join every engine thread.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!("[msgwire] Transport shutting down");
        self.acceptor.stop();
        self.close_all_connections(true);

        if let Some(timer) = self.timers.lock().take() {
            timer.stop();
        }
        for processor in &self.core.processors {
            processor.post(Job::Stop);
        }
        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
        self.core.delivery.stop();
        self.core.readiness.stop();
        for handle in self.services.lock().drain(..) {
            let _ = handle.join();
        }
        log::info!("[msgwire] Transport stopped");
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("processors", &(self.core.processors.len() - 1))
            .field("endpoints", &self.core.endpoints.read().len())
            .field("watched", &self.core.readiness.watched())
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish()
    }
}
