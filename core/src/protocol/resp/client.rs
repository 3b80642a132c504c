/*
 * client.rs
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

//! RESP client. Requests pipeline freely: one reply callback is queued per
//! command and replies dispatch in send order. After SUBSCRIBE the connection
//! is in reception mode: pushed arrays route to the message handler until
//! unsubscription depletes the count.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{Buf, BytesMut};

use crate::endpoint::{self, ConnectionHandler, Endpoint, EndpointHandle, EndpointOptions};
use crate::error::Error;
use crate::reactor::LoopHandle;

use super::codec;
use super::{MessageHandler, ReplyHandler, RespConnectionHandler, RespError, RespValue};

/// Options for [`connect`].
#[derive(Clone, Default)]
pub struct RespClientOptions {
    /// Handshake before any command (TLS-fronted Redis).
    pub implicit_tls: bool,
    /// TLS configuration override.
    pub tls_config: Option<Arc<rustls::ClientConfig>>,
    /// TLS server name override (defaults to the connect host).
    pub server_name: Option<String>,
}

/// RESP protocol handler bound to one endpoint.
pub struct RespClient {
    delegate: Option<Box<dyn RespConnectionHandler>>,
    pending: VecDeque<Box<dyn ReplyHandler>>,
    message_handler: Option<Box<dyn MessageHandler>>,
    subscriptions: i64,
    failed: bool,
}

impl RespClient {
    fn new(delegate: Box<dyn RespConnectionHandler>) -> Self {
        Self {
            delegate: Some(delegate),
            pending: VecDeque::new(),
            message_handler: None,
            subscriptions: 0,
            failed: false,
        }
    }

    fn fail(&mut self, endpoint: &mut Endpoint, error: Error) {
        self.failed = true;
        self.pending.clear();
        if let Some(mut d) = self.delegate.take() {
            d.error(error);
            self.delegate = Some(d);
        }
        endpoint.close();
    }

    fn dispatch(&mut self, endpoint: &mut Endpoint, value: RespValue) {
        // Pushed pub/sub arrays exist only once a message handler was
        // registered; everything else correlates FIFO with the pipeline.
        if self.message_handler.is_some() {
            if let Some(kind) = push_kind(&value) {
                self.dispatch_push(kind, &value);
                return;
            }
        }
        let Some(mut handler) = self.pending.pop_front() else {
            tracing::warn!("RESP reply with no request outstanding; ignoring");
            return;
        };
        let mut session = RespSession {
            client: &mut *self,
            endpoint: &mut *endpoint,
        };
        match &value {
            RespValue::Error(message) => {
                let error = RespError {
                    message: message.clone(),
                };
                handler.handle_error(&mut session, &error);
            }
            other => handler.handle_reply(&mut session, other),
        }
    }

    fn dispatch_push(&mut self, kind: PushKind, value: &RespValue) {
        let RespValue::Array(items) = value else {
            return;
        };
        let Some(handler) = self.message_handler.as_mut() else {
            tracing::warn!("pub/sub traffic with no message handler; dropping");
            return;
        };
        match kind {
            PushKind::Message => {
                if let (Some(channel), Some(payload)) =
                    (items.get(1).and_then(|v| v.as_str()), items.get(2))
                {
                    handler.handle_message(channel, payload.as_bytes().unwrap_or_default());
                }
            }
            PushKind::PMessage => {
                if let (Some(pattern), Some(channel), Some(payload)) = (
                    items.get(1).and_then(|v| v.as_str()),
                    items.get(2).and_then(|v| v.as_str()),
                    items.get(3),
                ) {
                    handler.handle_pmessage(
                        pattern,
                        channel,
                        payload.as_bytes().unwrap_or_default(),
                    );
                }
            }
            PushKind::Subscribe => {
                let channel = items.get(1).and_then(|v| v.as_str()).unwrap_or("");
                let count = items.get(2).and_then(|v| v.as_integer()).unwrap_or(0);
                self.subscriptions = count;
                handler.handle_subscribed(channel, count);
            }
            PushKind::Unsubscribe => {
                let channel = items.get(1).and_then(|v| v.as_str()).unwrap_or("");
                let count = items.get(2).and_then(|v| v.as_integer()).unwrap_or(0);
                self.subscriptions = count;
                handler.handle_unsubscribed(channel, count);
                if count == 0 {
                    self.message_handler = None;
                }
            }
        }
    }
}

#[derive(Clone, Copy)]
enum PushKind {
    Message,
    PMessage,
    Subscribe,
    Unsubscribe,
}

/// Classify pushed pub/sub arrays by their first element.
fn push_kind(value: &RespValue) -> Option<PushKind> {
    let RespValue::Array(items) = value else {
        return None;
    };
    let first = items.first()?.as_str()?;
    match first.to_lowercase().as_str() {
        "message" => Some(PushKind::Message),
        "pmessage" => Some(PushKind::PMessage),
        "subscribe" | "psubscribe" => Some(PushKind::Subscribe),
        "unsubscribe" | "punsubscribe" => Some(PushKind::Unsubscribe),
        _ => None,
    }
}

impl ConnectionHandler for RespClient {
    fn connected(&mut self, endpoint: &mut Endpoint) {
        if let Some(mut d) = self.delegate.take() {
            let mut session = RespSession {
                client: &mut *self,
                endpoint: &mut *endpoint,
            };
            d.connected(&mut session);
            self.delegate = Some(d);
        }
    }

    fn receive(&mut self, endpoint: &mut Endpoint, buf: &mut BytesMut) {
        while !self.failed && !endpoint.close_requested() {
            match codec::try_parse(&buf[..]) {
                Ok(Some((value, consumed))) => {
                    buf.advance(consumed);
                    self.dispatch(endpoint, value);
                }
                Ok(None) => return,
                Err(e) => {
                    self.fail(endpoint, e);
                    return;
                }
            }
        }
    }

    fn disconnected(&mut self) {
        if let Some(mut d) = self.delegate.take() {
            d.disconnected();
            self.delegate = Some(d);
        }
    }

    fn error(&mut self, error: Error) {
        self.failed = true;
        if let Some(mut d) = self.delegate.take() {
            d.error(error);
            self.delegate = Some(d);
        }
    }
}

/// Borrowed view of the client and its endpoint, handed to reply callbacks.
pub struct RespSession<'a> {
    client: &'a mut RespClient,
    endpoint: &'a mut Endpoint,
}

impl RespSession<'_> {
    pub fn endpoint(&mut self) -> &mut Endpoint {
        self.endpoint
    }

    /// Active subscription count; non-zero means reception mode.
    pub fn subscriptions(&self) -> i64 {
        self.client.subscriptions
    }

    /// Issue a command; the reply handler joins the FIFO pipeline queue.
    pub fn command(&mut self, args: &[&[u8]], handler: impl ReplyHandler) -> Result<(), Error> {
        if args.is_empty() {
            return Err(Error::protocol("empty RESP command"));
        }
        if self.client.subscriptions > 0 {
            return Err(Error::protocol(
                "connection is subscribed; only subscription commands are legal",
            ));
        }
        self.endpoint.send(codec::encode_command(args));
        self.client.pending.push_back(Box::new(handler));
        Ok(())
    }

    /// SUBSCRIBE. The message handler receives pushed traffic for the life
    /// of the subscription; confirmations do not consume pipeline callbacks.
    pub fn subscribe(
        &mut self,
        channels: &[&str],
        handler: impl MessageHandler,
    ) -> Result<(), Error> {
        self.enter_subscription("SUBSCRIBE", channels, Some(Box::new(handler)))
    }

    /// PSUBSCRIBE with pattern channels.
    pub fn psubscribe(
        &mut self,
        patterns: &[&str],
        handler: impl MessageHandler,
    ) -> Result<(), Error> {
        self.enter_subscription("PSUBSCRIBE", patterns, Some(Box::new(handler)))
    }

    /// UNSUBSCRIBE (all channels when empty).
    pub fn unsubscribe(&mut self, channels: &[&str]) -> Result<(), Error> {
        self.enter_subscription("UNSUBSCRIBE", channels, None)
    }

    /// PUNSUBSCRIBE (all patterns when empty).
    pub fn punsubscribe(&mut self, patterns: &[&str]) -> Result<(), Error> {
        self.enter_subscription("PUNSUBSCRIBE", patterns, None)
    }

    fn enter_subscription(
        &mut self,
        verb: &str,
        channels: &[&str],
        handler: Option<Box<dyn MessageHandler>>,
    ) -> Result<(), Error> {
        let mut args: Vec<&[u8]> = Vec::with_capacity(channels.len() + 1);
        args.push(verb.as_bytes());
        for c in channels {
            args.push(c.as_bytes());
        }
        if let Some(handler) = handler {
            self.client.message_handler = Some(handler);
        }
        self.endpoint.send(codec::encode_command(&args));
        Ok(())
    }

    /// Close the transport.
    pub fn close(&mut self) {
        self.endpoint.close();
    }
}

/// Thread-safe handle to a connected RESP client.
pub struct RespClientHandle {
    endpoint: EndpointHandle<RespClient>,
}

impl Clone for RespClientHandle {
    fn clone(&self) -> Self {
        Self {
            endpoint: self.endpoint.clone(),
        }
    }
}

impl RespClientHandle {
    /// Run a closure against the session on the connection's loop thread.
    pub fn run(
        &self,
        f: impl FnOnce(&mut RespSession<'_>) + Send + 'static,
    ) -> Result<(), Error> {
        self.endpoint.run(move |client, endpoint| {
            let mut session = RespSession { client, endpoint };
            f(&mut session);
        })
    }

    pub fn close(&self) {
        self.endpoint.close();
    }
}

/// Connect a RESP client on the given loop. The delegate's `connected` fires
/// on the loop thread once the transport is ready.
pub fn connect(
    loop_handle: &LoopHandle,
    host: &str,
    port: u16,
    options: RespClientOptions,
    delegate: impl RespConnectionHandler,
) -> Result<RespClientHandle, Error> {
    let client = RespClient::new(Box::new(delegate));
    let endpoint_options = EndpointOptions {
        implicit_tls: options.implicit_tls,
        server_name: options.server_name,
        tls_config: options.tls_config,
        read_buffer_size: 0,
    };
    let endpoint = endpoint::connect(loop_handle, host, port, endpoint_options, client)?;
    Ok(RespClientHandle { endpoint })
}
