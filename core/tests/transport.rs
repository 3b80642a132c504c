/*
 * transport.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * Integration tests for the selector-loop transport: callback serialization,
 * write ordering, close semantics, peer disconnect.
 */

mod support;

use std::time::Duration;

use bytes::BytesMut;
use staffetta_core::endpoint::{self, ConnectionHandler, Endpoint, EndpointOptions};
use staffetta_core::error::Error;
use staffetta_core::{Reactor, ReactorConfig};
use support::{events, spawn_server, Events};

#[derive(Clone, Copy, PartialEq)]
enum OnConnect {
    SendHello,
    Close,
    Nothing,
}

struct Recorder {
    events: Events,
    on_connect: OnConnect,
}

impl Recorder {
    fn new(events: Events, on_connect: OnConnect) -> Self {
        Self { events, on_connect }
    }
}

impl ConnectionHandler for Recorder {
    fn connected(&mut self, endpoint: &mut Endpoint) {
        self.events.emit("connected");
        match self.on_connect {
            OnConnect::SendHello => endpoint.send("hello\r\n"),
            OnConnect::Close => endpoint.close(),
            OnConnect::Nothing => {}
        }
    }

    fn receive(&mut self, _endpoint: &mut Endpoint, buf: &mut BytesMut) {
        let data = buf.split();
        self.events
            .emit(format!("receive {}", String::from_utf8_lossy(&data)));
    }

    fn disconnected(&mut self) {
        self.events.emit("disconnected");
    }

    fn error(&mut self, error: Error) {
        self.events.emit(format!("error {}", error));
    }
}

#[test]
fn round_trip_and_peer_close() {
    let (port, server) = spawn_server(|mut conn| {
        conn.expect("hello");
        conn.send("world");
        // Closing the socket ends the script.
    });
    let reactor = Reactor::start(ReactorConfig::default().with_loops(1));
    let (events, log) = events();
    let _handle = endpoint::connect(
        &reactor.next_loop(),
        "127.0.0.1",
        port,
        EndpointOptions::default(),
        Recorder::new(events, OnConnect::SendHello),
    )
    .unwrap();

    log.expect("connected");
    log.expect("receive world\r\n");
    log.expect("disconnected");
    server.join().unwrap();
    reactor.stop();
}

#[test]
fn sends_preserve_fifo_order() {
    let (port, server) = spawn_server(|mut conn| {
        for i in 0..20 {
            conn.expect(&format!("chunk-{}", i));
        }
        conn.send("done");
    });
    let reactor = Reactor::start(ReactorConfig::default().with_loops(1));
    let (events, log) = events();
    let handle = endpoint::connect(
        &reactor.next_loop(),
        "127.0.0.1",
        port,
        EndpointOptions::default(),
        Recorder::new(events, OnConnect::Nothing),
    )
    .unwrap();
    log.expect("connected");
    for i in 0..20 {
        handle
            .send(format!("chunk-{}\r\n", i).into_bytes())
            .unwrap();
    }
    log.expect("receive done\r\n");
    server.join().unwrap();
    reactor.stop();
}

#[test]
fn no_callbacks_after_close() {
    let (port, server) = spawn_server(|mut conn| {
        // Write immediately; the client closed in connected() and must not
        // surface this data.
        conn.send_raw(b"late data\r\n");
        conn.wait_close();
    });
    let reactor = Reactor::start(ReactorConfig::default().with_loops(1));
    let (events, log) = events();
    let _handle = endpoint::connect(
        &reactor.next_loop(),
        "127.0.0.1",
        port,
        EndpointOptions::default(),
        Recorder::new(events, OnConnect::Close),
    )
    .unwrap();
    log.expect("connected");
    log.expect_quiet(Duration::from_millis(500));
    server.join().unwrap();
    reactor.stop();
}

#[test]
fn connect_failure_surfaces_error() {
    // Bind-then-drop to obtain a port with no listener.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let reactor = Reactor::start(ReactorConfig::default().with_loops(1));
    let (events, log) = events();
    let _handle = endpoint::connect(
        &reactor.next_loop(),
        "127.0.0.1",
        port,
        EndpointOptions::default(),
        Recorder::new(events, OnConnect::Nothing),
    )
    .unwrap();
    let event = log.next();
    assert!(event.starts_with("error "), "got {:?}", event);
    reactor.stop();
}

#[test]
fn handler_sends_order_before_handle_sends() {
    // The connected callback runs before any handle-queued command is
    // processed, so its bytes reach the wire first.
    let (port, server) = spawn_server(|mut conn| {
        conn.expect("hello");
        conn.expect("via-handle");
        conn.send("done");
    });
    let reactor = Reactor::start(ReactorConfig::default().with_loops(1));
    let (events, log) = events();
    let handle = endpoint::connect(
        &reactor.next_loop(),
        "127.0.0.1",
        port,
        EndpointOptions::default(),
        Recorder::new(events, OnConnect::SendHello),
    )
    .unwrap();
    handle.send(&b"via-handle\r\n"[..]).unwrap();
    log.expect("connected");
    log.expect("receive done\r\n");
    server.join().unwrap();
    reactor.stop();
}
