// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared helpers for the loopback integration tests.

#![allow(dead_code)]

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use msgwire::{
    Connection, EndpointConfig, ProtocolHandler, ReasonCode, SendFlags, Transport, TransportConfig,
};
use parking_lot::Mutex;

pub const WAIT: Duration = Duration::from_secs(5);

/// Handler recording everything it sees.
#[derive(Default)]
pub struct TestHandler {
    /// (connection id, payload, kind)
    pub frames: Mutex<Vec<(u64, Vec<u8>, u32)>>,
    /// (connection id, family)
    pub families: Mutex<Vec<(u64, String)>>,
    /// (connection id, reason)
    pub closed: Mutex<Vec<(u64, ReasonCode)>>,
    pub resumed: AtomicUsize,
    /// Send every frame back
    pub echo: bool,
    /// First frame of a connection carries its client id
    pub identify: bool,
}

impl TestHandler {
    pub fn echo() -> Arc<Self> {
        Arc::new(Self {
            echo: true,
            ..Default::default()
        })
    }

    pub fn identifying() -> Arc<Self> {
        Arc::new(Self {
            echo: true,
            identify: true,
            ..Default::default()
        })
    }

    pub fn frame_count(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn reason_for(&self, id: u64) -> Option<ReasonCode> {
        self.closed
            .lock()
            .iter()
            .find(|(cid, _)| *cid == id)
            .map(|(_, r)| *r)
    }
}

impl ProtocolHandler for TestHandler {
    fn on_connection(&self, conn: &Arc<Connection>, family: &str) -> Result<(), ReasonCode> {
        self.families.lock().push((conn.id(), family.to_string()));
        Ok(())
    }

    fn receive(&self, conn: &Arc<Connection>, payload: &[u8], kind: u32) -> Result<(), ReasonCode> {
        if self.identify && conn.client_id().is_none() {
            conn.set_client_id(String::from_utf8_lossy(payload).into_owned());
            conn.client_allowed()?;
            conn.connection_ready();
        }
        self.frames.lock().push((conn.id(), payload.to_vec(), kind));
        if self.echo {
            conn.send(payload, kind, SendFlags::NONE);
        }
        Ok(())
    }

    fn on_resume(&self, _conn: &Arc<Connection>) {
        self.resumed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_closing(&self, conn: &Arc<Connection>, reason: ReasonCode) {
        self.closed.lock().push((conn.id(), reason));
    }
}

/// Small engine suitable for tests.
pub fn test_config() -> TransportConfig {
    TransportConfig::default()
        .with_io_processors(2)
        .with_close_all_wait(Duration::from_secs(5))
}

pub fn start(config: TransportConfig, handler: Arc<TestHandler>) -> Transport {
    Transport::start(config, handler).expect("transport start")
}

/// Create `config` on 127.0.0.1 and wait for its listener.
pub fn listen(transport: &Transport, config: EndpointConfig) -> SocketAddr {
    let ep = transport
        .make_endpoint(config.with_interface(Ipv4Addr::LOCALHOST.into()))
        .expect("make endpoint");
    assert!(wait_for(|| ep.local_addr().is_some()), "listener did not start");
    ep.local_addr().expect("local addr")
}

pub fn wait_for(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

pub fn client(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).expect("connect");
    stream.set_read_timeout(Some(WAIT)).expect("timeout");
    stream.set_nodelay(true).expect("nodelay");
    stream
}

/// `[u32 BE len(kind + payload)][kind][payload]`
pub fn rpc_frame(kind: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = ((payload.len() + 1) as u32).to_be_bytes().to_vec();
    out.push(kind);
    out.extend_from_slice(payload);
    out
}

pub fn read_rpc(stream: &mut impl Read) -> io::Result<(u8, Vec<u8>)> {
    let mut header = [0u8; 5];
    stream.read_exact(&mut header)?;
    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let mut payload = vec![0u8; len.saturating_sub(1)];
    stream.read_exact(&mut payload)?;
    Ok((header[4], payload))
}

/// Send one rpc frame and read the echo.
pub fn rpc_roundtrip(stream: &mut (impl Read + Write), kind: u8, payload: &[u8]) -> io::Result<(u8, Vec<u8>)> {
    stream.write_all(&rpc_frame(kind, payload))?;
    stream.flush()?;
    read_rpc(stream)
}

/// Whether the peer closed `stream` within the read timeout.
pub fn wait_closed(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 1024];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return true,
            Ok(_) => continue,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return false
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => return true,
        }
    }
}
