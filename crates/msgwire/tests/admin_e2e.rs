// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Administrative actions against live loopback connections.

mod common;

use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use common::*;
use msgwire::{ConnectionSelector, EndpointConfig, ReasonCode, TransportError};

fn identified(addr: SocketAddr, client_id: &str) -> TcpStream {
    let mut stream = client(addr);
    rpc_roundtrip(&mut stream, 1, client_id.as_bytes()).expect("identify");
    stream
}

#[test]
fn test_client_set_disable_and_enable() {
    let handler = TestHandler::identifying();
    let transport = start(
        test_config().with_client_set_wait(Duration::from_secs(5)),
        handler.clone(),
    );
    let addr = listen(&transport, EndpointConfig::new("rpc", 0));

    let mut bad1 = identified(addr, "bad-1");
    let mut bad2 = identified(addr, "bad-2");
    let mut ok1 = identified(addr, "ok-1");

    transport.disable_client_set("^bad-.*").expect("disable");
    assert!(wait_closed(&mut bad1));
    assert!(wait_closed(&mut bad2));
    assert_eq!(
        rpc_roundtrip(&mut ok1, 2, b"still here").expect("ok-1").1,
        b"still here"
    );

    let mut bad3 = client(addr);
    bad3.write_all(&rpc_frame(1, b"bad-3")).expect("write");
    assert!(wait_closed(&mut bad3));
    assert!(handler
        .closed
        .lock()
        .iter()
        .any(|(_, r)| *r == ReasonCode::ClientSetDisabled));

    assert!(transport.enable_client_set("^bad-.*"));
    assert!(!transport.enable_client_set("^bad-.*"));
    let mut bad4 = identified(addr, "bad-4");
    assert_eq!(rpc_roundtrip(&mut bad4, 2, b"back").expect("bad-4").1, b"back");
}

#[test]
fn test_client_set_rejects_bad_pattern() {
    let transport = start(test_config(), TestHandler::identifying());
    assert!(matches!(
        transport.disable_client_set("(unclosed"),
        Err(TransportError::ClientSetNotValid(_))
    ));
}

#[test]
fn test_close_connections_by_client_id() {
    let handler = TestHandler::identifying();
    let transport = start(test_config(), handler.clone());
    let addr = listen(&transport, EndpointConfig::new("rpc", 0));

    let mut a = identified(addr, "sensor-a");
    let mut b = identified(addr, "sensor-b");
    let mut other = identified(addr, "gateway");

    let selector = ConnectionSelector::client_id("sensor-*");
    assert_eq!(transport.close_connections(Some(&selector)), 2);
    assert!(wait_closed(&mut a));
    assert!(wait_closed(&mut b));
    assert_eq!(rpc_roundtrip(&mut other, 1, b"ping").expect("gateway").1, b"ping");
    assert!(wait_for(|| handler.closed.lock().len() == 2));
    assert!(handler
        .closed
        .lock()
        .iter()
        .all(|(_, r)| *r == ReasonCode::ForcedDisconnect));
}

#[test]
fn test_disconnect_endpoint() {
    let handler = TestHandler::echo();
    let transport = start(test_config(), handler);
    let a_addr = listen(&transport, EndpointConfig::new("alpha", 0));
    let b_addr = listen(&transport, EndpointConfig::new("beta", 0));

    let mut a = client(a_addr);
    rpc_roundtrip(&mut a, 1, b"a").expect("alpha");
    let mut b = client(b_addr);
    rpc_roundtrip(&mut b, 1, b"b").expect("beta");

    assert_eq!(transport.disconnect_endpoint("al*"), 1);
    assert!(wait_closed(&mut a));
    assert_eq!(rpc_roundtrip(&mut b, 1, b"b2").expect("beta").1, b"b2");
}

#[test]
fn test_endpoint_disable_closes_and_refuses() {
    let handler = TestHandler::echo();
    let transport = start(test_config(), handler.clone());
    let config = EndpointConfig::new("rpc", 0);
    let addr = listen(&transport, config.clone());

    let mut stream = client(addr);
    rpc_roundtrip(&mut stream, 1, b"x").expect("echo");

    transport
        .make_endpoint(config.with_enabled(false))
        .expect("disable endpoint");
    assert!(wait_closed(&mut stream));
    assert!(wait_for(|| handler.closed.lock().len() == 1));
    assert_eq!(handler.closed.lock()[0].1, ReasonCode::EndpointDisabled);
    assert!(TcpStream::connect(addr).is_err());
}

#[test]
fn test_stop_endpoint() {
    let transport = start(test_config(), TestHandler::echo());
    let addr = listen(&transport, EndpointConfig::new("rpc", 0));
    let mut stream = client(addr);
    rpc_roundtrip(&mut stream, 1, b"x").expect("echo");

    assert_eq!(transport.stop_endpoint("rpc").expect("stop"), 1);
    assert!(wait_closed(&mut stream));
    assert!(transport.endpoint("rpc").is_none());
    assert!(matches!(
        transport.stop_endpoint("rpc"),
        Err(TransportError::UnknownEndpoint(_))
    ));
}

#[test]
fn test_stop_endpoint_uses_exact_name() {
    let handler = TestHandler::echo();
    let transport = start(test_config(), handler.clone());
    let star_addr = listen(&transport, EndpointConfig::new("a*", 0));
    let plain_addr = listen(&transport, EndpointConfig::new("ab", 0));

    let mut star = client(star_addr);
    rpc_roundtrip(&mut star, 1, b"s").expect("a*");
    let mut plain = client(plain_addr);
    rpc_roundtrip(&mut plain, 1, b"p").expect("ab");

    assert_eq!(transport.stop_endpoint("a*").expect("stop"), 1);
    assert!(wait_closed(&mut star));
    assert_eq!(rpc_roundtrip(&mut plain, 2, b"p2").expect("ab").1, b"p2");
    assert_eq!(handler.closed.lock().len(), 1);
}

#[test]
fn test_reserved_endpoint_name() {
    let transport = start(test_config(), TestHandler::echo());
    assert!(matches!(
        transport.make_endpoint(EndpointConfig::new(msgwire::OUTGOING_ENDPOINT, 0)),
        Err(TransportError::InvalidConfig(_))
    ));
}
