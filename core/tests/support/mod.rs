/*
 * mod.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * Test support: scripted single-connection servers for driving the protocol
 * clients, with optional TLS upgrade using a self-signed certificate.
 */

#![allow(dead_code)]

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig, ServerConnection, StreamOwned};

/// One scripted connection. Reads are line-oriented (CRLF) unless a byte
/// count is requested; writes always terminate with CRLF unless raw.
pub struct Conn<S: Read + Write> {
    reader: BufReader<S>,
}

impl<S: Read + Write> Conn<S> {
    pub fn new(stream: S) -> Self {
        Self {
            reader: BufReader::new(stream),
        }
    }

    pub fn send(&mut self, line: &str) {
        let w = self.reader.get_mut();
        w.write_all(line.as_bytes()).unwrap();
        w.write_all(b"\r\n").unwrap();
        w.flush().unwrap();
    }

    pub fn send_raw(&mut self, bytes: &[u8]) {
        let w = self.reader.get_mut();
        w.write_all(bytes).unwrap();
        w.flush().unwrap();
    }

    pub fn read_line(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).unwrap();
        line.trim_end_matches(['\r', '\n']).to_string()
    }

    pub fn expect(&mut self, exact: &str) {
        let line = self.read_line();
        assert_eq!(line, exact, "server expected {:?}", exact);
    }

    pub fn expect_prefix(&mut self, prefix: &str) -> String {
        let line = self.read_line();
        assert!(
            line.starts_with(prefix),
            "server expected prefix {:?}, got {:?}",
            prefix,
            line
        );
        line
    }

    /// Read one tagged IMAP command; returns (tag, rest).
    pub fn expect_tagged(&mut self, command_prefix: &str) -> String {
        let line = self.read_line();
        let (tag, rest) = line.split_once(' ').expect("tagged command");
        assert!(
            rest.starts_with(command_prefix),
            "server expected command {:?}, got {:?}",
            command_prefix,
            rest
        );
        tag.to_string()
    }

    pub fn read_exact_bytes(&mut self, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        self.reader.read_exact(&mut buf).unwrap();
        buf
    }

    pub fn into_inner(self) -> S {
        self.reader.into_inner()
    }

    /// Drain until the peer closes, ignoring whatever arrives.
    pub fn wait_close(&mut self) {
        let mut buf = [0u8; 256];
        loop {
            match self.reader.read(&mut buf) {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        }
    }
}

/// Bind an ephemeral port and run the script against the first connection.
pub fn spawn_server(
    script: impl FnOnce(Conn<TcpStream>) + Send + 'static,
) -> (u16, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        script(Conn::new(stream));
    });
    (port, handle)
}

/// Self-signed certificate for `localhost` plus the matching client config.
pub struct TestTls {
    pub cert: CertificateDer<'static>,
    pub key: PrivateKeyDer<'static>,
}

pub fn self_signed() -> TestTls {
    let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert = generated.cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        generated.key_pair.serialize_der(),
    ));
    TestTls { cert, key }
}

pub fn client_tls_config(cert: &CertificateDer<'static>) -> Arc<ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots.add(cert.clone()).unwrap();
    Arc::new(
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

/// Server-side TLS over an accepted socket (blocking; the handshake completes
/// on first read/write).
pub fn accept_tls(
    stream: TcpStream,
    tls: TestTls,
) -> Conn<StreamOwned<ServerConnection, TcpStream>> {
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![tls.cert], tls.key)
        .unwrap();
    let conn = ServerConnection::new(Arc::new(config)).unwrap();
    Conn::new(StreamOwned::new(conn, stream))
}

/// Ordered event log fed from client callbacks on the loop thread.
#[derive(Clone)]
pub struct Events(Sender<String>);

impl Events {
    pub fn emit(&self, event: impl Into<String>) {
        let _ = self.0.send(event.into());
    }
}

pub fn events() -> (Events, EventLog) {
    let (tx, rx) = channel();
    (Events(tx), EventLog(rx))
}

pub struct EventLog(Receiver<String>);

impl EventLog {
    /// Next event, with a generous timeout.
    pub fn next(&self) -> String {
        self.0
            .recv_timeout(Duration::from_secs(10))
            .expect("timed out waiting for client event")
    }

    pub fn expect(&self, event: &str) {
        assert_eq!(self.next(), event);
    }

    /// Assert nothing further arrives within a short window.
    pub fn expect_quiet(&self, window: Duration) {
        if let Ok(event) = self.0.recv_timeout(window) {
            panic!("unexpected event: {:?}", event);
        }
    }
}
