// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Loopback tests for the accept, recognize, frame and send paths.

mod common;

use std::io::Write;
use std::net::TcpListener;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::*;
use msgwire::framer::RpcFramer;
use msgwire::{
    ConnectionQuery, EndpointConfig, OutboundOptions, ReasonCode, SendFlags, SendStatus,
    OUTGOING_ENDPOINT,
};

#[test]
fn test_rpc_echo() {
    let handler = TestHandler::echo();
    let transport = start(test_config(), handler.clone());
    let addr = listen(&transport, EndpointConfig::new("rpc", 0));

    let mut stream = client(addr);
    for i in 0..3u8 {
        let (kind, payload) = rpc_roundtrip(&mut stream, i + 1, &[i; 100]).expect("echo");
        assert_eq!(kind, i + 1);
        assert_eq!(payload, vec![i; 100]);
    }
    assert_eq!(handler.families.lock()[0].1, "rpc");

    let ep = transport.endpoint("rpc").expect("endpoint");
    assert!(wait_for(|| ep.stats().snapshot().read_msgs == 3));
    let stats = ep.stats().snapshot();
    assert_eq!(stats.connect_count, 1);
    assert_eq!(stats.write_msgs, 3);
}

#[test]
fn test_mqtt_split_reads() {
    let handler = Arc::new(TestHandler::default());
    let transport = start(test_config(), handler.clone());
    let addr = listen(&transport, EndpointConfig::new("mqtt", 0));

    let body: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
    let mut frame = vec![0x10, 0xC8, 0x01];
    frame.extend_from_slice(&body);

    let mut stream = client(addr);
    for byte in &frame {
        stream.write_all(std::slice::from_ref(byte)).expect("write");
        stream.flush().expect("flush");
        thread::sleep(Duration::from_micros(200));
    }

    assert!(wait_for(|| handler.frame_count() == 1));
    thread::sleep(Duration::from_millis(50));
    let frames = handler.frames.lock();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].1, body);
    assert_eq!(frames[0].2, 0x10);
    assert_eq!(handler.families.lock()[0].1, "mqtt");
}

#[test]
fn test_http_request_recognized() {
    let handler = Arc::new(TestHandler::default());
    let transport = start(test_config(), handler.clone());
    let addr = listen(&transport, EndpointConfig::new("web", 0));

    let mut stream = client(addr);
    stream
        .write_all(b"POST /ws HTTP/1.1\r\nHost: x\r\nContent-Length: 4\r\n\r\nping")
        .expect("write");
    assert!(wait_for(|| handler.frame_count() == 1));
    assert_eq!(handler.families.lock()[0].1, "http");
}

#[test]
fn test_unknown_protocol_closed() {
    let handler = Arc::new(TestHandler::default());
    let transport = start(test_config(), handler.clone());
    let addr = listen(&transport, EndpointConfig::new("plain", 0));

    let mut stream = client(addr);
    stream.write_all(b"\xAB\xCDjunk-bytes").expect("write");
    assert!(wait_closed(&mut stream));

    let ep = transport.endpoint("plain").expect("endpoint");
    assert!(wait_for(|| ep.stats().snapshot().bad_connect_count == 1));
    assert!(handler.families.lock().is_empty());
}

#[test]
fn test_protocol_not_allowed() {
    let handler = Arc::new(TestHandler::default());
    let transport = start(test_config(), handler.clone());
    let addr = listen(
        &transport,
        EndpointConfig::new("mqtt-only", 0).with_protocols(&["mqtt"]),
    );

    let mut stream = client(addr);
    stream.write_all(&rpc_frame(1, b"hello")).expect("write");
    assert!(wait_closed(&mut stream));
    assert!(wait_for(|| !handler.closed.lock().is_empty()));
    assert_eq!(handler.closed.lock()[0].1, ReasonCode::ProtocolNotAllowed);
}

#[test]
fn test_first_packet_limit() {
    let handler = Arc::new(TestHandler::default());
    let transport = start(test_config().with_first_packet_max(1024), handler.clone());
    let addr = listen(&transport, EndpointConfig::new("rpc", 0));

    let mut stream = client(addr);
    // Only the header is needed for the length check.
    stream.write_all(&rpc_frame(1, &[0u8; 4096])[..5]).expect("write");
    assert!(wait_closed(&mut stream));
    assert!(wait_for(|| !handler.closed.lock().is_empty()));
    assert_eq!(handler.closed.lock()[0].1, ReasonCode::FirstPacketTooLarge);
    assert_eq!(handler.frame_count(), 0);
}

#[test]
fn test_capacity_ceiling() {
    let handler = Arc::new(TestHandler::default());
    let transport = start(test_config().with_active_connections_max(100), handler);
    let addr = listen(&transport, EndpointConfig::new("capped", 0));
    let ep = transport.endpoint("capped").expect("endpoint");

    let clients: Vec<_> = (0..150).map(|_| client(addr)).collect();
    assert!(wait_for(|| {
        let s = ep.stats().snapshot();
        s.connect_count == 100 && s.bad_connect_count == 50
    }));
    assert_eq!(ep.stats().snapshot().connect_active, 100);
    drop(clients);
}

#[test]
fn test_close_all_connections() {
    let handler = TestHandler::echo();
    let transport = start(test_config(), handler.clone());
    let addr = listen(&transport, EndpointConfig::new("rpc", 0));

    let mut streams: Vec<_> = (0..3).map(|_| client(addr)).collect();
    for s in &mut streams {
        rpc_roundtrip(s, 1, b"hi").expect("echo");
    }

    assert_eq!(transport.close_all_connections(false), 0);
    for s in &mut streams {
        assert!(wait_closed(s));
    }
    let closed = handler.closed.lock();
    assert_eq!(closed.len(), 3);
    assert!(closed.iter().all(|(_, r)| *r == ReasonCode::ServerTerminating));
}

#[test]
fn test_outbound_connect() {
    let server = TestHandler::echo();
    let transport = start(test_config(), server);
    let addr = listen(&transport, EndpointConfig::new("rpc", 0));

    let recorder = Arc::new(TestHandler::default());
    let conn = transport
        .connect(
            addr,
            OutboundOptions::new(Arc::new(RpcFramer::new())).with_handler(recorder.clone()),
        )
        .expect("connect");
    assert!(conn.is_outgoing());
    assert_eq!(conn.endpoint().name(), OUTGOING_ENDPOINT);

    assert_eq!(conn.send(b"hello", 7, SendFlags::NONE), SendStatus::Ok);
    assert!(wait_for(|| recorder.frame_count() == 1));
    let frames = recorder.frames.lock();
    assert_eq!(frames[0].1, b"hello");
    assert_eq!(frames[0].2, 7);
    assert_eq!(recorder.families.lock()[0].1, "rpc");
}

#[test]
fn test_outbound_connect_refused() {
    let transport = start(test_config(), Arc::new(TestHandler::default()));
    let addr = {
        let probe = TcpListener::bind("127.0.0.1:0").expect("bind");
        probe.local_addr().expect("addr")
    };

    let recorder = Arc::new(TestHandler::default());
    let conn = transport
        .connect(
            addr,
            OutboundOptions::new(Arc::new(RpcFramer::new())).with_handler(recorder.clone()),
        )
        .expect("connect");
    assert!(wait_for(|| recorder.reason_for(conn.id()).is_some()));
    assert_eq!(recorder.reason_for(conn.id()), Some(ReasonCode::ConnectFailed));
}

#[test]
fn test_suspend_and_resume() {
    let mut config = test_config();
    config.suspend_queue_limit = 4;
    let transport = start(config, Arc::new(TestHandler::default()));

    let peer = TcpListener::bind("127.0.0.1:0").expect("bind");
    let recorder = Arc::new(TestHandler::default());
    let conn = transport
        .connect(
            peer.local_addr().expect("addr"),
            OutboundOptions::new(Arc::new(RpcFramer::new())).with_handler(recorder.clone()),
        )
        .expect("connect");

    let payload = vec![0x5Au8; 64 * 1024];
    assert_eq!(conn.send(&payload, 1, SendFlags::NONE), SendStatus::Suspend);
    assert!(conn.is_suspended());

    let (mut accepted, _) = peer.accept().expect("accept");
    accepted.set_read_timeout(Some(WAIT)).expect("timeout");
    let (kind, body) = read_rpc(&mut accepted).expect("frame");
    assert_eq!(kind, 1);
    assert_eq!(body.len(), payload.len());

    assert!(wait_for(|| recorder.resumed.load(Ordering::SeqCst) == 1));
    assert!(!conn.is_suspended());
}

#[test]
fn test_monitoring_views() {
    let handler = TestHandler::identifying();
    let transport = start(test_config(), handler);
    let addr = listen(&transport, EndpointConfig::new("rpc", 0));

    let mut stream = client(addr);
    rpc_roundtrip(&mut stream, 1, b"dev-1").expect("echo");

    let (page, next) = transport.connection_monitor(&ConnectionQuery::default(), 0, 10);
    assert_eq!(next, 0);
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].client_id.as_deref(), Some("dev-1"));
    assert_eq!(page[0].protocol.as_deref(), Some("rpc"));
    assert_eq!(page[0].endpoint, "rpc");
    assert!(page[0].ready);

    let endpoints = transport.endpoint_monitor("*");
    assert_eq!(endpoints.len(), 1, "internal endpoints are hidden");
    assert_eq!(endpoints[0].stats.connect_active, 1);
    assert_eq!(transport.active_connections(), 1);
}

#[test]
fn test_shutdown_closes_clients() {
    let handler = TestHandler::echo();
    let transport = start(test_config(), handler);
    let addr = listen(&transport, EndpointConfig::new("rpc", 0));
    let mut stream = client(addr);
    rpc_roundtrip(&mut stream, 1, b"x").expect("echo");

    drop(transport);
    assert!(wait_closed(&mut stream));
}
