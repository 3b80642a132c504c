/*
 * mod.rs
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

//! RESP (Redis wire format) client: five-prefix codec, request pipelining
//! with FIFO reply correlation, and pub/sub reception mode.

mod client;
mod codec;

pub use client::{connect, RespClient, RespClientHandle, RespClientOptions, RespSession};
pub use codec::encode_command;

use bytes::Bytes;

use crate::error::{Error, ErrorKind};

/// One RESP2 value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// `+OK\r\n`
    Simple(String),
    /// `-ERR message\r\n`
    Error(String),
    /// `:42\r\n`
    Integer(i64),
    /// `$N\r\n<bytes>\r\n`
    Bulk(Bytes),
    /// `$-1\r\n` or `*-1\r\n`
    Null,
    /// `*N\r\n<items>`
    Array(Vec<RespValue>),
}

impl RespValue {
    /// Textual view of simple strings and bulk payloads.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RespValue::Simple(s) => Some(s),
            RespValue::Bulk(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespValue::Simple(s) => Some(s.as_bytes()),
            RespValue::Bulk(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RespValue::Integer(n) => Some(*n),
            _ => None,
        }
    }
}

/// An `-ERR`-class reply, classified for retry decisions.
#[derive(Debug, Clone)]
pub struct RespError {
    pub message: String,
}

impl RespError {
    /// `-BUSY`, `-LOADING` and `-TRYAGAIN` are transient server conditions;
    /// everything else is handled per request.
    pub fn kind(&self) -> ErrorKind {
        let upper = self.message.to_uppercase();
        if upper.starts_with("BUSY") || upper.starts_with("LOADING") || upper.starts_with("TRYAGAIN")
        {
            ErrorKind::Temporary
        } else {
            ErrorKind::Permanent
        }
    }
}

/// Connection-level delegate.
pub trait RespConnectionHandler: Send + 'static {
    /// Transport ready; commands may be issued.
    fn connected(&mut self, session: &mut RespSession<'_>);

    /// Transport or protocol failure; the connection closes after this.
    fn error(&mut self, error: Error);

    /// Peer closed the stream.
    fn disconnected(&mut self) {}
}

/// Per-request reply callback, matched to requests in send order.
pub trait ReplyHandler: Send + 'static {
    fn handle_reply(&mut self, session: &mut RespSession<'_>, value: &RespValue);

    fn handle_error(&mut self, session: &mut RespSession<'_>, error: &RespError);
}

/// Receiver for pub/sub traffic while the connection is subscribed.
pub trait MessageHandler: Send + 'static {
    fn handle_message(&mut self, channel: &str, payload: &[u8]);

    fn handle_pmessage(&mut self, pattern: &str, channel: &str, payload: &[u8]) {
        let _ = pattern;
        self.handle_message(channel, payload);
    }

    /// Subscription confirmed; `count` is the active subscription count.
    fn handle_subscribed(&mut self, channel: &str, count: i64) {
        let _ = (channel, count);
    }

    /// Unsubscription confirmed; at count zero the connection leaves
    /// reception mode.
    fn handle_unsubscribed(&mut self, channel: &str, count: i64) {
        let _ = (channel, count);
    }
}
