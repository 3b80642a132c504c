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

//! SMTP submission/relay client (RFC 5321): greeting, EHLO/HELO, STARTTLS,
//! AUTH, envelope, DATA with dot stuffing or BDAT chunking, QUIT.
//!
//! The client is a push state machine bound to an endpoint. Every command
//! takes a typed reply handler; at most one reply callback is outstanding
//! (BDAT chunk acknowledgements excepted, which are consumed in order).

pub mod dot_stuffer;

mod client;

pub use client::{connect, SmtpClient, SmtpClientHandle, SmtpClientOptions, SmtpSession};

use crate::error::Error;
use crate::net::TlsInfo;

/// Parsed SMTP reply: three-digit code plus the text of each line.
#[derive(Debug, Clone)]
pub struct SmtpReply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl SmtpReply {
    /// Text of the final reply line.
    pub fn message(&self) -> &str {
        self.lines.last().map(|s| s.as_str()).unwrap_or("")
    }

    pub fn is_positive(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }

    pub fn is_transient(&self) -> bool {
        (400..500).contains(&self.code)
    }

    pub fn is_permanent(&self) -> bool {
        self.code >= 500
    }

    /// Queue identifier from acceptance text of the form "... queued as ID".
    pub fn queue_id(&self) -> Option<&str> {
        let msg = self.message();
        msg.find("queued as ").map(|i| msg[i + 10..].trim())
    }
}

/// EHLO capability set.
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    pub starttls: bool,
    pub pipelining: bool,
    pub chunking: bool,
    pub smtputf8: bool,
    pub eight_bit_mime: bool,
    pub dsn: bool,
    pub enhanced_status_codes: bool,
    /// Advertised maximum message size, when the SIZE parameter was given.
    pub size: Option<u64>,
    /// Advertised AUTH mechanisms, uppercased.
    pub auth: Vec<String>,
    /// Unrecognized capability lines, verbatim.
    pub other: Vec<String>,
}

impl Capabilities {
    pub fn supports_auth(&self, mechanism: &str) -> bool {
        self.auth.iter().any(|m| m == mechanism)
    }

    /// Parse EHLO reply lines (the greeting text line excluded).
    pub fn parse(lines: &[String]) -> Self {
        let mut caps = Self::default();
        for line in lines {
            let upper = line.to_uppercase();
            if upper == "STARTTLS" {
                caps.starttls = true;
            } else if upper == "PIPELINING" {
                caps.pipelining = true;
            } else if upper == "CHUNKING" {
                caps.chunking = true;
            } else if upper == "SMTPUTF8" {
                caps.smtputf8 = true;
            } else if upper == "8BITMIME" {
                caps.eight_bit_mime = true;
            } else if upper == "DSN" {
                caps.dsn = true;
            } else if upper == "ENHANCEDSTATUSCODES" {
                caps.enhanced_status_codes = true;
            } else if let Some(rest) = upper.strip_prefix("SIZE") {
                caps.size = rest.trim().parse().ok();
            } else if let Some(rest) = upper.strip_prefix("AUTH ") {
                caps.auth
                    .extend(rest.split_whitespace().map(|m| m.to_string()));
            } else if !upper.is_empty() {
                caps.other.push(line.clone());
            }
        }
        caps
    }
}

/// MAIL FROM parameters.
#[derive(Debug, Clone, Default)]
pub struct MailParams {
    pub size: Option<u64>,
    pub smtputf8: bool,
}

/// Connection-level delegate: greeting, terminal conditions.
pub trait SmtpConnectionHandler: Send + 'static {
    /// Server greeting received (usually 220; callers must check the code).
    fn greeting(&mut self, session: &mut SmtpSession<'_>, reply: &SmtpReply);

    /// 421 received: the server is closing; the connection closes after this.
    fn service_closing(&mut self, reply: &SmtpReply) {
        let _ = reply;
    }

    /// Transport or protocol failure; the connection closes after this.
    fn error(&mut self, error: Error);

    /// Peer closed the stream (normal after QUIT).
    fn disconnected(&mut self) {}
}

/// Reply handler for EHLO and HELO.
pub trait EhloHandler: Send + 'static {
    fn handle_capabilities(
        &mut self,
        session: &mut SmtpSession<'_>,
        capabilities: &Capabilities,
        reply: &SmtpReply,
    );

    /// EHLO refused. A 502 here is the cue to retry with HELO.
    fn handle_rejected(&mut self, session: &mut SmtpSession<'_>, reply: &SmtpReply);
}

/// Reply handler for STARTTLS.
pub trait StartTlsHandler: Send + 'static {
    /// The handshake completed; capabilities were cleared, re-issue EHLO.
    fn handle_tls_established(&mut self, session: &mut SmtpSession<'_>, info: &TlsInfo);

    fn handle_rejected(&mut self, session: &mut SmtpSession<'_>, reply: &SmtpReply);
}

/// Reply handler for AUTH.
pub trait AuthHandler: Send + 'static {
    fn handle_authenticated(&mut self, session: &mut SmtpSession<'_>, reply: &SmtpReply);

    /// 535 bad credentials or other permanent refusal (e.g. 504).
    fn handle_rejected(&mut self, session: &mut SmtpSession<'_>, reply: &SmtpReply);

    /// 454 or other transient refusal.
    fn handle_temporary_failure(&mut self, session: &mut SmtpSession<'_>, reply: &SmtpReply);
}

/// Reply handler for MAIL FROM.
pub trait MailFromHandler: Send + 'static {
    fn handle_sender_accepted(&mut self, session: &mut SmtpSession<'_>, reply: &SmtpReply);

    fn handle_sender_rejected(&mut self, session: &mut SmtpSession<'_>, reply: &SmtpReply);

    fn handle_temporary_failure(&mut self, session: &mut SmtpSession<'_>, reply: &SmtpReply);
}

/// Reply handler for RCPT TO.
pub trait RcptToHandler: Send + 'static {
    fn handle_recipient_accepted(
        &mut self,
        session: &mut SmtpSession<'_>,
        recipient: &str,
        reply: &SmtpReply,
    );

    fn handle_recipient_rejected(
        &mut self,
        session: &mut SmtpSession<'_>,
        recipient: &str,
        reply: &SmtpReply,
    );

    fn handle_temporary_failure(
        &mut self,
        session: &mut SmtpSession<'_>,
        recipient: &str,
        reply: &SmtpReply,
    );
}

/// Reply handler for the DATA command.
pub trait DataHandler: Send + 'static {
    /// 354 received: stream the body with `write_body`, then `end_message`.
    fn handle_ready(&mut self, session: &mut SmtpSession<'_>);

    fn handle_rejected(&mut self, session: &mut SmtpSession<'_>, reply: &SmtpReply);

    fn handle_temporary_failure(&mut self, session: &mut SmtpSession<'_>, reply: &SmtpReply);
}

/// Final-disposition handler for a message transfer (DATA terminator or the
/// BDAT LAST chunk).
pub trait MessageHandler: Send + 'static {
    fn handle_message_accepted(
        &mut self,
        session: &mut SmtpSession<'_>,
        queue_id: Option<&str>,
        reply: &SmtpReply,
    );

    fn handle_message_rejected(&mut self, session: &mut SmtpSession<'_>, reply: &SmtpReply);

    fn handle_temporary_failure(&mut self, session: &mut SmtpSession<'_>, reply: &SmtpReply);
}

/// Generic single-reply handler (RSET, NOOP, QUIT).
pub trait ReplyHandler: Send + 'static {
    fn handle_reply(&mut self, session: &mut SmtpSession<'_>, reply: &SmtpReply);
}
