// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Listener sockets and the acceptor thread.
//!
//! ```text
//! +-------------------- msgwire-acceptor --------------------+
//! |  mio::Poll: listener tokens + command waker               |
//! |     |                                                      |
//! |     +-> accept (up to accept_batch per listener per pass)  |
//! |            -> capacity check -> Core::spawn_connection     |
//! +------------------------------------------------------------+
//! ```
//!
//! Listeners that still had pending connections after a full batch stay in
//! a backlog set and are served again on the next pass without waiting on
//! a readiness event.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use socket2::{Domain, Protocol, Socket, Type};

use crate::config::EndpointConfig;
use crate::endpoint::Endpoint;
use crate::error::{ReasonCode, Result, TransportError};
use crate::transport::Core;

const WAKE_TOKEN: Token = Token(usize::MAX);
const POLL_TIMEOUT: Duration = Duration::from_millis(500);
const REMOVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Bind a non-blocking listener for `config`.
pub(crate) fn bind_listener(config: &EndpointConfig) -> Result<TcpListener> {
    let addr = config.bind_addr();
    let bind_err = |source: io::Error| TransportError::Bind { addr, source };

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket
        .listen(config.backlog.min(i32::MAX as u32) as i32)
        .map_err(bind_err)?;

    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener))
}

enum Command {
    Add(Arc<Endpoint>, TcpListener),
    Remove(String, Sender<()>),
    Stop,
}

/// Control side of the acceptor thread.
pub(crate) struct AcceptorHandle {
    tx: Sender<Command>,
    waker: Waker,
}

impl AcceptorHandle {
    fn send(&self, cmd: Command) -> Result<()> {
        self.tx.send(cmd).map_err(|_| TransportError::Stopped)?;
        self.waker.wake()?;
        Ok(())
    }

    /// Start accepting on `listener` for `endpoint`.
    pub(crate) fn add(&self, endpoint: Arc<Endpoint>, listener: TcpListener) -> Result<()> {
        self.send(Command::Add(endpoint, listener))
    }

    /// Stop accepting for `name` and close its listener.
    ///
    /// Returns once the acceptor has dropped the socket.
    pub(crate) fn remove(&self, name: &str) -> Result<()> {
        let (reply_tx, reply_rx) = channel::bounded(1);
        self.send(Command::Remove(name.to_string(), reply_tx))?;
        reply_rx
            .recv_timeout(REMOVE_TIMEOUT)
            .map_err(|_| TransportError::TimedOut)
    }

    pub(crate) fn stop(&self) {
        let _ = self.send(Command::Stop);
    }
}

struct Listener {
    endpoint: Arc<Endpoint>,
    socket: TcpListener,
}

/// Acceptor thread state.
pub(crate) struct Acceptor {
    poll: Poll,
    rx: Receiver<Command>,
    listeners: HashMap<Token, Listener>,
    backlog: HashSet<Token>,
    next_token: usize,
}

impl Acceptor {
    pub(crate) fn new() -> io::Result<(Self, AcceptorHandle)> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        let (tx, rx) = channel::unbounded();
        Ok((
            Self {
                poll,
                rx,
                listeners: HashMap::new(),
                backlog: HashSet::new(),
                next_token: 0,
            },
            AcceptorHandle { tx, waker },
        ))
    }

    pub(crate) fn spawn(self, core: Arc<Core>) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("msgwire-acceptor".to_string())
            .spawn(move || self.run(&core))
    }

    fn run(mut self, core: &Core) {
        let mut events = Events::with_capacity(64);
        log::debug!("[msgwire-acceptor] Acceptor thread started");
        'outer: loop {
            let timeout = if self.backlog.is_empty() {
                POLL_TIMEOUT
            } else {
                Duration::ZERO
            };
            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("[msgwire-acceptor] poll failed: {}", e);
                break;
            }
            for event in events.iter() {
                if event.token() == WAKE_TOKEN {
                    if !self.handle_commands() {
                        break 'outer;
                    }
                } else {
                    self.backlog.insert(event.token());
                }
            }

            let ready: Vec<Token> = self.backlog.iter().copied().collect();
            for token in ready {
                if self.accept_batch(token, core) {
                    self.backlog.remove(&token);
                }
            }
        }
        for (_, listener) in self.listeners.drain() {
            listener.endpoint.set_local_addr(None);
        }
        log::debug!("[msgwire-acceptor] Acceptor thread stopped");
    }

    /// Returns `false` on stop.
    fn handle_commands(&mut self) -> bool {
        while let Ok(cmd) = self.rx.try_recv() {
            match cmd {
                Command::Add(endpoint, mut socket) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    if let Err(e) = self
                        .poll
                        .registry()
                        .register(&mut socket, token, Interest::READABLE)
                    {
                        log::warn!(
                            "[msgwire-acceptor] Cannot watch listener {}: {}",
                            endpoint.name(),
                            e
                        );
                        continue;
                    }
                    endpoint.set_local_addr(socket.local_addr().ok());
                    log::info!(
                        "[msgwire-acceptor] Listening on {} for endpoint {}",
                        endpoint
                            .local_addr()
                            .map_or_else(|| "?".to_string(), |a| a.to_string()),
                        endpoint.name()
                    );
                    // Connections may already be waiting.
                    self.backlog.insert(token);
                    self.listeners.insert(token, Listener { endpoint, socket });
                }
                Command::Remove(name, reply) => {
                    let tokens: Vec<Token> = self
                        .listeners
                        .iter()
                        .filter(|(_, l)| l.endpoint.name() == name)
                        .map(|(t, _)| *t)
                        .collect();
                    for token in tokens {
                        if let Some(mut listener) = self.listeners.remove(&token) {
                            let _ = self.poll.registry().deregister(&mut listener.socket);
                            listener.endpoint.set_local_addr(None);
                            log::info!("[msgwire-acceptor] Stopped listening for endpoint {}", name);
                        }
                        self.backlog.remove(&token);
                    }
                    let _ = reply.send(());
                }
                Command::Stop => return false,
            }
        }
        true
    }

    /// Accept up to one batch from `token`. Returns `true` once the
    /// listener has nothing pending.
    fn accept_batch(&mut self, token: Token, core: &Core) -> bool {
        let Some(listener) = self.listeners.get(&token) else {
            return true;
        };
        for _ in 0..core.config.accept_batch.max(1) {
            match listener.socket.accept() {
                Ok((stream, peer)) => admit(core, &listener.endpoint, stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    listener.endpoint.stats().record_accept_error();
                    log::warn!(
                        "[msgwire-acceptor] Accept failed on {}: {}",
                        listener.endpoint.name(),
                        e
                    );
                    return true;
                }
            }
        }
        false
    }
}

/// Apply the connection ceiling and hand the socket to a processor.
fn admit(core: &Core, endpoint: &Arc<Endpoint>, stream: TcpStream, peer: SocketAddr) {
    let config = endpoint.config();
    if !config.enabled {
        return;
    }
    if !config.admin {
        let active = core.active.fetch_add(1, Ordering::AcqRel) + 1;
        if active > core.config.active_connections_max {
            core.active.fetch_sub(1, Ordering::AcqRel);
            endpoint.stats().record_bad_connect();
            let quiet = core.nolog.contains(peer.ip());
            crate::connection::conn_record!(
                quiet,
                "[msgwire-acceptor] Connection from {} to {} rejected: reason={} \"{}\"",
                peer,
                endpoint.name(),
                ReasonCode::ServerCapacity,
                ReasonCode::ServerCapacity.message()
            );
            return;
        }
    }
    if let Err(e) = stream.set_nodelay(config.nodelay) {
        log::debug!("[msgwire-acceptor] set_nodelay failed for {}: {}", peer, e);
    }
    core.spawn_connection(
        endpoint.clone(),
        stream,
        peer,
        false,
        core.handler.clone(),
        None,
        None,
    );
}
