/*
 * endpoint.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Staffetta, a non-blocking network protocol framework.
 *
 * Staffetta is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Staffetta is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Staffetta.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Per-connection transport handle: buffered sends, readiness-driven reads,
//! TLS upgrade, handler dispatch.
//!
//! An endpoint is driven by a task pinned to its selector loop. Readiness is
//! consumed with `try_read`/`try_write`; TLS traffic flows through a rustls
//! engine the endpoint drives itself (unwrap ciphertext on read, wrap
//! plaintext on flush, explicit handshake state). The protocol handler runs
//! inline on the loop thread: after `close` is requested no further handler
//! callback is invoked.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::mem;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection};
use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::error::Error;
use crate::net::{self, TlsInfo};
use crate::reactor::LoopHandle;

/// Protocol handler bound to one endpoint. All methods run serially on the
/// endpoint's loop thread.
pub trait ConnectionHandler: Send + 'static {
    /// Transport ready: TCP connected and, for implicit TLS, the handshake
    /// complete.
    fn connected(&mut self, endpoint: &mut Endpoint);

    /// Inbound bytes. Consume what can be parsed; leftovers stay in `buf`
    /// until the next read.
    fn receive(&mut self, endpoint: &mut Endpoint, buf: &mut BytesMut);

    /// A TLS handshake initiated by `start_tls` (or implicit TLS) completed.
    fn security_established(&mut self, endpoint: &mut Endpoint, info: &TlsInfo) {
        let _ = (endpoint, info);
    }

    /// The peer closed the stream.
    fn disconnected(&mut self);

    /// Transport failure; the endpoint closes after this returns.
    fn error(&mut self, error: Error);
}

/// Per-endpoint options.
#[derive(Clone, Default)]
pub struct EndpointOptions {
    /// Handshake immediately after the TCP connect, before `connected`.
    pub implicit_tls: bool,
    /// TLS server name; defaults to the connect host.
    pub server_name: Option<String>,
    /// TLS configuration; defaults to [`net::default_client_config`].
    pub tls_config: Option<Arc<ClientConfig>>,
    /// Read refill size; 0 means the 8 KiB default.
    pub read_buffer_size: usize,
}

enum TlsChannel {
    Plaintext,
    Handshaking(Box<ClientConnection>),
    Encrypted(Box<ClientConnection>),
    Shutdown,
}

/// One bidirectional byte stream bound to a selector loop.
pub struct Endpoint {
    stream: TcpStream,
    tls: TlsChannel,
    write_queue: VecDeque<Bytes>,
    queued: usize,
    remote_address: SocketAddr,
    host: String,
    server_name: String,
    tls_config: Arc<ClientConfig>,
    loop_handle: LoopHandle,
    close_requested: bool,
}

impl Endpoint {
    /// Queue bytes for transmission. Queued chunks reach the wire in FIFO
    /// order; the loop flushes them as the socket accepts writes.
    pub fn send(&mut self, data: impl Into<Bytes>) {
        if self.close_requested {
            return;
        }
        let data = data.into();
        if data.is_empty() {
            return;
        }
        self.queued += data.len();
        self.write_queue.push_back(data);
    }

    /// Begin a TLS handshake on this plaintext connection. Completion is
    /// reported through `security_established`.
    pub fn start_tls(&mut self) -> Result<(), Error> {
        match self.tls {
            TlsChannel::Plaintext => {
                let name = ServerName::try_from(self.server_name.clone())
                    .map_err(|_| Error::protocol("invalid TLS server name"))?;
                let conn = ClientConnection::new(self.tls_config.clone(), name)
                    .map_err(|e| Error::transport(e.to_string()))?;
                self.tls = TlsChannel::Handshaking(Box::new(conn));
                Ok(())
            }
            _ => Err(Error::protocol("TLS already negotiated on this endpoint")),
        }
    }

    /// Request close. Idempotent; pending writes are drained best-effort, a
    /// TLS close_notify is sent when encrypted, and no further handler
    /// callback fires once the current one returns.
    pub fn close(&mut self) {
        self.close_requested = true;
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.remote_address
    }

    /// Host this endpoint was connected to (also the default TLS name).
    pub fn peer_host(&self) -> &str {
        &self.host
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self.tls, TlsChannel::Encrypted(_))
    }

    /// Bytes accepted by `send` but not yet written to the socket. Callers can
    /// use this to apply backpressure to large transfers.
    pub fn queued_bytes(&self) -> usize {
        self.queued
    }

    pub fn loop_handle(&self) -> &LoopHandle {
        &self.loop_handle
    }

    pub(crate) fn close_requested(&self) -> bool {
        self.close_requested
    }

    fn interest(&self) -> Interest {
        let mut interest = Interest::READABLE;
        let wants_write = match &self.tls {
            TlsChannel::Plaintext => !self.write_queue.is_empty(),
            TlsChannel::Handshaking(conn) => conn.wants_write(),
            TlsChannel::Encrypted(conn) => conn.wants_write() || !self.write_queue.is_empty(),
            TlsChannel::Shutdown => false,
        };
        if wants_write {
            interest = interest.add(Interest::WRITABLE);
        }
        interest
    }

    /// Flush as much outbound data as the socket accepts right now.
    fn flush(&mut self) -> io::Result<()> {
        match &mut self.tls {
            TlsChannel::Plaintext => {
                while let Some(front) = self.write_queue.front_mut() {
                    match self.stream.try_write(&front[..]) {
                        Ok(n) => {
                            self.queued -= n;
                            if n == front.len() {
                                self.write_queue.pop_front();
                            } else {
                                front.advance(n);
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) => return Err(e),
                    }
                }
                Ok(())
            }
            TlsChannel::Handshaking(conn) => write_tls(conn, &self.stream),
            TlsChannel::Encrypted(conn) => {
                while let Some(front) = self.write_queue.pop_front() {
                    self.queued -= front.len();
                    conn.writer().write_all(&front[..])?;
                }
                write_tls(conn, &self.stream)
            }
            TlsChannel::Shutdown => Ok(()),
        }
    }

    /// Read as much as the socket offers into `inbuf`, unwrapping TLS records
    /// when encrypted.
    fn fill(&mut self, inbuf: &mut BytesMut, refill: usize) -> io::Result<ReadOutcome> {
        let mut outcome = ReadOutcome::default();
        match &mut self.tls {
            TlsChannel::Plaintext => loop {
                inbuf.reserve(refill);
                match self.stream.try_read_buf(inbuf) {
                    Ok(0) => {
                        outcome.eof = true;
                        break;
                    }
                    Ok(_) => outcome.produced = true,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(e),
                }
            },
            TlsChannel::Handshaking(conn) | TlsChannel::Encrypted(conn) => loop {
                match conn.read_tls(&mut SockRead(&self.stream)) {
                    Ok(0) => {
                        outcome.eof = true;
                        break;
                    }
                    Ok(_) => {
                        let state = conn
                            .process_new_packets()
                            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                        let mut to_read = state.plaintext_bytes_to_read();
                        while to_read > 0 {
                            let mut tmp = [0u8; 4096];
                            let take = to_read.min(tmp.len());
                            let n = conn.reader().read(&mut tmp[..take])?;
                            if n == 0 {
                                break;
                            }
                            inbuf.extend_from_slice(&tmp[..n]);
                            outcome.produced = true;
                            to_read -= n;
                        }
                        if state.peer_has_closed() {
                            outcome.eof = true;
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(e),
                }
            },
            TlsChannel::Shutdown => {}
        }
        // Promote a finished handshake. The client handshake completes while
        // processing the server's final flight, i.e. on the read path.
        if let TlsChannel::Handshaking(conn) = &self.tls {
            if !conn.is_handshaking() {
                let info = TlsInfo {
                    protocol: conn.protocol_version().map(|v| format!("{:?}", v)),
                    cipher_suite: conn
                        .negotiated_cipher_suite()
                        .map(|c| format!("{:?}", c.suite())),
                    alpn: conn.alpn_protocol().map(|p| p.to_vec()),
                };
                if let TlsChannel::Handshaking(conn) =
                    mem::replace(&mut self.tls, TlsChannel::Plaintext)
                {
                    self.tls = TlsChannel::Encrypted(conn);
                }
                outcome.established = Some(info);
            }
        }
        Ok(outcome)
    }

    /// Best-effort drain and TLS shutdown; the socket closes when dropped.
    fn shutdown(&mut self) {
        let _ = self.flush();
        if let TlsChannel::Encrypted(conn) = &mut self.tls {
            conn.send_close_notify();
            let _ = write_tls(conn, &self.stream);
        }
        self.tls = TlsChannel::Shutdown;
    }
}

#[derive(Default)]
struct ReadOutcome {
    produced: bool,
    eof: bool,
    established: Option<TlsInfo>,
}

fn write_tls(conn: &mut ClientConnection, stream: &TcpStream) -> io::Result<()> {
    while conn.wants_write() {
        match conn.write_tls(&mut SockWrite(stream)) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Non-blocking `io::Read` over the socket for `rustls::read_tls`.
struct SockRead<'a>(&'a TcpStream);

impl Read for SockRead<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.try_read(buf)
    }
}

/// Non-blocking `io::Write` over the socket for `rustls::write_tls`.
struct SockWrite<'a>(&'a TcpStream);

impl Write for SockWrite<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.try_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

enum Command<H> {
    Send(Bytes),
    Run(Box<dyn FnOnce(&mut H, &mut Endpoint) + Send>),
    Close,
}

/// Thread-safe handle to an endpoint. Cloneable; dropping every handle closes
/// the endpoint.
pub struct EndpointHandle<H: ConnectionHandler> {
    tx: mpsc::UnboundedSender<Command<H>>,
}

impl<H: ConnectionHandler> Clone for EndpointHandle<H> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<H: ConnectionHandler> EndpointHandle<H> {
    /// Queue bytes for transmission, from any thread.
    pub fn send(&self, data: impl Into<Bytes>) -> Result<(), Error> {
        self.tx
            .send(Command::Send(data.into()))
            .map_err(|_| Error::transport("endpoint closed"))
    }

    /// Run a closure against the handler and endpoint on the loop thread.
    pub fn run(
        &self,
        f: impl FnOnce(&mut H, &mut Endpoint) + Send + 'static,
    ) -> Result<(), Error> {
        self.tx
            .send(Command::Run(Box::new(f)))
            .map_err(|_| Error::transport("endpoint closed"))
    }

    /// Request close. Idempotent; enqueued onto the loop when called from
    /// another thread.
    pub fn close(&self) {
        let _ = self.tx.send(Command::Close);
    }
}

/// Open an outbound connection on the given loop. The handler is moved to the
/// loop thread; `connected` fires there once the transport is ready.
pub fn connect<H: ConnectionHandler>(
    loop_handle: &LoopHandle,
    host: &str,
    port: u16,
    options: EndpointOptions,
    handler: H,
) -> Result<EndpointHandle<H>, Error> {
    let (tx, rx) = mpsc::unbounded_channel();
    let lh = loop_handle.clone();
    let host = host.to_string();
    loop_handle.execute(move || {
        tokio::task::spawn_local(drive(lh, host, port, options, handler, rx));
    })?;
    Ok(EndpointHandle { tx })
}

enum DriveEvent<H> {
    Command(Option<Command<H>>),
    Io(io::Result<tokio::io::Ready>),
}

/// Invoke a handler callback; a panic is caught, logged, and closes the
/// endpoint so the loop itself survives.
macro_rules! dispatch {
    ($ep:expr, $call:expr) => {
        if std::panic::catch_unwind(AssertUnwindSafe(|| $call)).is_err() {
            tracing::error!("connection handler panicked; closing endpoint");
            $ep.close_requested = true;
        }
    };
}

async fn drive<H: ConnectionHandler>(
    loop_handle: LoopHandle,
    host: String,
    port: u16,
    options: EndpointOptions,
    mut handler: H,
    mut rx: mpsc::UnboundedReceiver<Command<H>>,
) {
    let stream = match TcpStream::connect((host.as_str(), port)).await {
        Ok(s) => s,
        Err(e) => {
            handler.error(Error::transport(format!("connect {}:{}: {}", host, port, e)));
            return;
        }
    };
    let remote_address = match stream.peer_addr() {
        Ok(a) => a,
        Err(e) => {
            handler.error(Error::from(e));
            return;
        }
    };
    let refill = if options.read_buffer_size == 0 {
        8192
    } else {
        options.read_buffer_size
    };
    let server_name = options
        .server_name
        .clone()
        .unwrap_or_else(|| host.clone());
    let tls_config = options
        .tls_config
        .clone()
        .unwrap_or_else(net::default_client_config);

    let mut ep = Endpoint {
        stream,
        tls: TlsChannel::Plaintext,
        write_queue: VecDeque::new(),
        queued: 0,
        remote_address,
        host,
        server_name,
        tls_config,
        loop_handle,
        close_requested: false,
    };
    let mut inbuf = BytesMut::with_capacity(refill);
    let mut announced_connected = false;

    if options.implicit_tls {
        if let Err(e) = ep.start_tls() {
            handler.error(e);
            return;
        }
    } else {
        announced_connected = true;
        dispatch!(ep, handler.connected(&mut ep));
    }

    loop {
        if ep.close_requested {
            break;
        }
        let interest = ep.interest();
        let event = {
            let ready = ep.stream.ready(interest);
            tokio::pin!(ready);
            tokio::select! {
                biased;
                cmd = rx.recv() => DriveEvent::Command(cmd),
                r = &mut ready => DriveEvent::Io(r),
            }
        };
        match event {
            DriveEvent::Command(None) | DriveEvent::Command(Some(Command::Close)) => {
                ep.close_requested = true;
            }
            DriveEvent::Command(Some(Command::Send(data))) => {
                ep.send(data);
            }
            DriveEvent::Command(Some(Command::Run(f))) => {
                dispatch!(ep, f(&mut handler, &mut ep));
            }
            DriveEvent::Io(Err(e)) => {
                dispatch!(ep, handler.error(Error::from(e)));
                ep.close_requested = true;
            }
            DriveEvent::Io(Ok(ready)) => {
                if ready.is_writable() {
                    if let Err(e) = ep.flush() {
                        dispatch!(ep, handler.error(Error::from(e)));
                        ep.close_requested = true;
                        continue;
                    }
                }
                if ready.is_readable() {
                    let outcome = match ep.fill(&mut inbuf, refill) {
                        Ok(o) => o,
                        Err(e) => {
                            dispatch!(ep, handler.error(Error::from(e)));
                            ep.close_requested = true;
                            continue;
                        }
                    };
                    if let Some(info) = outcome.established {
                        dispatch!(ep, handler.security_established(&mut ep, &info));
                        if !announced_connected && !ep.close_requested {
                            announced_connected = true;
                            dispatch!(ep, handler.connected(&mut ep));
                        }
                    }
                    if outcome.produced && !inbuf.is_empty() && !ep.close_requested {
                        dispatch!(ep, handler.receive(&mut ep, &mut inbuf));
                    }
                    if outcome.eof && !ep.close_requested {
                        if matches!(ep.tls, TlsChannel::Handshaking(_)) {
                            dispatch!(
                                ep,
                                handler.error(Error::transport(
                                    "connection closed during TLS handshake"
                                ))
                            );
                        } else {
                            dispatch!(ep, handler.disconnected());
                        }
                        ep.close_requested = true;
                    }
                }
            }
        }
    }
    ep.shutdown();
    tracing::debug!(peer = %ep.remote_address, "endpoint closed");
}
