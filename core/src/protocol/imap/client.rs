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

//! IMAP client state machine.
//!
//! Reply lines are routed by their first token: `+` continuations feed the
//! in-flight command (SASL exchange, APPEND body, IDLE entry), `*` untagged
//! data is routed by keyword (or message number plus keyword), and a tagged
//! line completes the outstanding command; a tag that does not match the
//! current one is logged and ignored. A `{N}` at the end of a FETCH line
//! switches the parser into literal mode: exactly N octets stream to the
//! fetch handler before line parsing resumes. Literals on other responses
//! are folded into the logical line and parsed normally.

use std::mem;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, FixedOffset};

use crate::endpoint::{self, ConnectionHandler, Endpoint, EndpointHandle, EndpointOptions};
use crate::error::Error;
use crate::net::TlsInfo;
use crate::parse::{LineParser, LineSink, LiteralSink, LiteralTracker};
use crate::reactor::LoopHandle;
use crate::sasl::SaslClient;

use super::tags::TagGenerator;
use super::{
    parse_list_entry, parse_paren_list, parse_response_code, quote_string, AppendHandler,
    CommandHandler, FetchHandler, FetchItem, GreetingKind, IdleHandler, ImapConnectionHandler,
    ImapGreeting, ImapReply, ListHandler, LoginHandler, MailboxEvent, MailboxInfo, ResponseCode,
    SearchHandler, SelectHandler, StartTlsHandler, Status, StatusHandler,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Connecting,
    Greeting,
    Open,
    Closed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Base {
    NotAuthenticated,
    Authenticated,
    Selected,
}

enum InFlight {
    None,
    StartTls(Box<dyn StartTlsHandler>),
    Login(Box<dyn LoginHandler>),
    Authenticate {
        handler: Box<dyn LoginHandler>,
        mechanism: Box<dyn SaslClient>,
        initial_sent: bool,
        aborted: bool,
    },
    Select {
        handler: Box<dyn SelectHandler>,
        info: MailboxInfo,
        examine: bool,
    },
    List(Box<dyn ListHandler>),
    Status(Box<dyn StatusHandler>),
    Search(Box<dyn SearchHandler>),
    Fetch(Box<dyn FetchHandler>),
    Idle {
        handler: Box<dyn IdleHandler>,
        active: bool,
    },
    Append {
        handler: Box<dyn AppendHandler>,
        body: Option<Bytes>,
    },
    CloseMailbox(Box<dyn CommandHandler>),
    Logout(Box<dyn CommandHandler>),
    Command(Box<dyn CommandHandler>),
}

struct FetchLiteral {
    tracker: LiteralTracker,
    message: u32,
}

struct AccLiteral {
    line: Vec<u8>,
    remaining: usize,
}

/// Options for [`connect`].
#[derive(Clone, Default)]
pub struct ImapClientOptions {
    /// Handshake before the greeting (IMAPS, port 993).
    pub implicit_tls: bool,
    /// TLS configuration override.
    pub tls_config: Option<Arc<rustls::ClientConfig>>,
    /// TLS server name override (defaults to the connect host).
    pub server_name: Option<String>,
}

/// IMAP protocol handler bound to one endpoint.
pub struct ImapClient {
    delegate: Option<Box<dyn ImapConnectionHandler>>,
    state: ConnState,
    base: Base,
    saved_base: Base,
    was_selected: bool,
    tags: TagGenerator,
    current_tag: Option<String>,
    in_flight: InFlight,
    literal: Option<FetchLiteral>,
    accumulating: Option<AccLiteral>,
    current_fetch: Option<u32>,
    fetch_depth: i32,
    capabilities: Vec<String>,
    mailbox: Option<MailboxInfo>,
}

impl ImapClient {
    fn new(delegate: Box<dyn ImapConnectionHandler>) -> Self {
        Self {
            delegate: Some(delegate),
            state: ConnState::Connecting,
            base: Base::NotAuthenticated,
            saved_base: Base::NotAuthenticated,
            was_selected: false,
            tags: TagGenerator::new(),
            current_tag: None,
            in_flight: InFlight::None,
            literal: None,
            accumulating: None,
            current_fetch: None,
            fetch_depth: 0,
            capabilities: Vec::new(),
            mailbox: None,
        }
    }

    fn fail(&mut self, endpoint: &mut Endpoint, error: Error) {
        self.state = ConnState::Failed;
        self.in_flight = InFlight::None;
        if let Some(mut d) = self.delegate.take() {
            d.error(error);
            self.delegate = Some(d);
        }
        endpoint.close();
    }

    fn closed(&self) -> bool {
        matches!(self.state, ConnState::Closed | ConnState::Failed)
    }

    /// One physical line, CRLF stripped. Folds pending literal accumulation
    /// into a logical line, detects `{N}` markers, and routes.
    fn handle_raw_line(&mut self, endpoint: &mut Endpoint, raw: &[u8]) {
        let line: Vec<u8> = match self.accumulating.take() {
            Some(acc) => {
                let mut full = acc.line;
                full.extend_from_slice(raw);
                full
            }
            None => raw.to_vec(),
        };
        let text = String::from_utf8_lossy(&line).into_owned();

        // Continuation fragment of a FETCH response already in progress.
        if self.current_fetch.is_some() && matches!(self.in_flight, InFlight::Fetch(_)) {
            let message = self.current_fetch.unwrap();
            self.fetch_fragment(endpoint, &text, message, false);
            return;
        }

        // New untagged FETCH while a FETCH command is in flight: may stream.
        if matches!(self.in_flight, InFlight::Fetch(_)) {
            if let Some((message, rest)) = untagged_fetch(&text) {
                self.current_fetch = Some(message);
                self.fetch_depth = 0;
                let rest = rest.to_string();
                self.fetch_fragment(endpoint, &rest, message, true);
                return;
            }
        }

        // Literals elsewhere are folded into the logical line.
        if let Some((prefix, size)) = split_literal_marker(&text) {
            self.accumulating = Some(AccLiteral {
                line: prefix.as_bytes().to_vec(),
                remaining: size,
            });
            return;
        }

        self.handle_line(endpoint, &text);
    }

    fn handle_line(&mut self, endpoint: &mut Endpoint, text: &str) {
        if self.state == ConnState::Greeting {
            self.handle_greeting(endpoint, text);
            return;
        }
        if let Some(rest) = text.strip_prefix('+') {
            self.continuation(endpoint, rest.trim_start());
        } else if let Some(rest) = text.strip_prefix("* ") {
            self.untagged(endpoint, rest);
        } else if !text.is_empty() {
            self.tagged(endpoint, text);
        }
    }

    fn handle_greeting(&mut self, endpoint: &mut Endpoint, text: &str) {
        let Some(rest) = text.strip_prefix("* ") else {
            self.fail(
                endpoint,
                Error::protocol(format!("malformed IMAP greeting: {:?}", text)),
            );
            return;
        };
        let mut parts = rest.splitn(2, ' ');
        let kind = match parts.next().unwrap_or("").to_uppercase().as_str() {
            "OK" => GreetingKind::Ok,
            "PREAUTH" => GreetingKind::Preauth,
            "BYE" => GreetingKind::Bye,
            other => {
                self.fail(
                    endpoint,
                    Error::protocol(format!("unexpected greeting status: {:?}", other)),
                );
                return;
            }
        };
        let (code, greeting_text) = parse_response_code(parts.next().unwrap_or(""));
        let capabilities = match code {
            Some(ResponseCode::Capability(caps)) => {
                self.capabilities = caps.clone();
                Some(caps)
            }
            _ => None,
        };
        self.state = ConnState::Open;
        self.base = if kind == GreetingKind::Preauth {
            Base::Authenticated
        } else {
            Base::NotAuthenticated
        };
        let greeting = ImapGreeting {
            kind,
            text: greeting_text,
            capabilities,
        };
        if let Some(mut d) = self.delegate.take() {
            let mut session = ImapSession {
                client: &mut *self,
                endpoint: &mut *endpoint,
            };
            d.greeting(&mut session, &greeting);
            self.delegate = Some(d);
        }
        if kind == GreetingKind::Bye {
            self.state = ConnState::Closed;
            endpoint.close();
        }
    }

    fn continuation(&mut self, endpoint: &mut Endpoint, rest: &str) {
        match &mut self.in_flight {
            InFlight::Authenticate {
                mechanism,
                initial_sent,
                aborted,
                ..
            } => {
                if *aborted {
                    return;
                }
                let challenge = BASE64.decode(rest.trim()).unwrap_or_default();
                let response = if !*initial_sent {
                    *initial_sent = true;
                    match mechanism.initial_response() {
                        Ok(Some(initial)) => Ok(initial),
                        Ok(None) => mechanism.respond(&challenge),
                        Err(e) => Err(e),
                    }
                } else {
                    mechanism.respond(&challenge)
                };
                match response {
                    Ok(data) => {
                        let mut line = BASE64.encode(&data);
                        line.push_str("\r\n");
                        endpoint.send(line.into_bytes());
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "SASL exchange failed; aborting");
                        endpoint.send("*\r\n");
                        *aborted = true;
                    }
                }
            }
            InFlight::Append { body, .. } => {
                if let Some(data) = body.take() {
                    endpoint.send(data);
                    endpoint.send("\r\n");
                } else {
                    tracing::warn!("APPEND continuation with no body pending");
                }
            }
            InFlight::Idle { active, handler } => {
                *active = true;
                handler.handle_idling();
            }
            _ => {
                tracing::warn!("unexpected IMAP continuation; ignoring");
            }
        }
    }

    fn untagged(&mut self, _endpoint: &mut Endpoint, rest: &str) {
        let mut parts = rest.splitn(2, ' ');
        let first = parts.next().unwrap_or("");
        let remainder = parts.next().unwrap_or("");

        if let Ok(number) = first.parse::<u32>() {
            let mut kw_parts = remainder.splitn(2, ' ');
            let keyword = kw_parts.next().unwrap_or("").to_uppercase();
            let kw_rest = kw_parts.next().unwrap_or("");
            match keyword.as_str() {
                "EXISTS" => self.numeric_event(MailboxEvent::Exists(number)),
                "RECENT" => self.numeric_event(MailboxEvent::Recent(number)),
                "EXPUNGE" => self.numeric_event(MailboxEvent::Expunge(number)),
                "FETCH" => {
                    // Unsolicited flags update; a FETCH command in flight is
                    // handled upstream in handle_raw_line.
                    let flags = flags_in(kw_rest);
                    if !flags.is_empty() {
                        self.numeric_event(MailboxEvent::Flags {
                            message: number,
                            flags,
                        });
                    }
                }
                _ => {
                    tracing::debug!(keyword = %keyword, "ignoring untagged numeric response");
                }
            }
            return;
        }

        match first.to_uppercase().as_str() {
            "OK" | "NO" | "BAD" => {
                let (code, _text) = parse_response_code(remainder);
                self.untagged_status(code);
            }
            "CAPABILITY" => {
                self.capabilities = remainder
                    .split_whitespace()
                    .map(|w| w.to_uppercase())
                    .collect();
            }
            "FLAGS" => {
                if let InFlight::Select { info, .. } = &mut self.in_flight {
                    info.flags = parse_paren_list(remainder);
                }
            }
            "LIST" | "LSUB" => {
                if let InFlight::List(handler) = &mut self.in_flight {
                    if let Some(entry) = parse_list_entry(remainder) {
                        handler.handle_entry(&entry);
                    }
                }
            }
            "STATUS" => {
                if let InFlight::Status(handler) = &mut self.in_flight {
                    if let Some((mailbox, items)) = parse_status(remainder) {
                        handler.handle_status(&mailbox, &items);
                    }
                }
            }
            "SEARCH" => {
                if let InFlight::Search(handler) = &mut self.in_flight {
                    let ids: Vec<u32> = remainder
                        .split_whitespace()
                        .filter_map(|w| w.parse().ok())
                        .collect();
                    handler.handle_results(&ids);
                }
            }
            "BYE" => {
                if !matches!(self.in_flight, InFlight::Logout(_)) {
                    if let Some(d) = self.delegate.as_mut() {
                        d.bye(remainder);
                    }
                }
            }
            other => {
                tracing::debug!(keyword = %other, "ignoring untagged response");
            }
        }
    }

    /// Untagged `OK [code]` data: fills SELECT info while a SELECT is in
    /// flight, otherwise updates the current mailbox snapshot.
    fn untagged_status(&mut self, code: Option<ResponseCode>) {
        let Some(code) = code else { return };
        let info = match &mut self.in_flight {
            InFlight::Select { info, .. } => Some(info),
            _ => self.mailbox.as_mut(),
        };
        let Some(info) = info else { return };
        match code {
            ResponseCode::UidValidity(n) => info.uid_validity = Some(n),
            ResponseCode::UidNext(n) => info.uid_next = Some(n),
            ResponseCode::Unseen(n) => info.unseen = Some(n),
            ResponseCode::PermanentFlags(flags) => info.permanent_flags = flags,
            ResponseCode::ReadOnly => info.read_only = true,
            ResponseCode::ReadWrite => info.read_only = false,
            ResponseCode::Alert => {}
            _ => {}
        }
    }

    /// Route a numeric untagged event: SELECT in flight absorbs it, an active
    /// IDLE receives it, otherwise the connection's mailbox listener does.
    fn numeric_event(&mut self, event: MailboxEvent) {
        if let InFlight::Select { info, .. } = &mut self.in_flight {
            match event {
                MailboxEvent::Exists(n) => info.exists = n,
                MailboxEvent::Recent(n) => info.recent = n,
                _ => {}
            }
            return;
        }
        if let Some(mailbox) = self.mailbox.as_mut() {
            match &event {
                MailboxEvent::Exists(n) => mailbox.exists = *n,
                MailboxEvent::Recent(n) => mailbox.recent = *n,
                MailboxEvent::Expunge(_) => {
                    mailbox.exists = mailbox.exists.saturating_sub(1);
                }
                MailboxEvent::Flags { .. } => {}
            }
        }
        if let InFlight::Idle {
            handler,
            active: true,
        } = &mut self.in_flight
        {
            handler.handle_event(&event);
            return;
        }
        if let Some(d) = self.delegate.as_mut() {
            d.mailbox_event(&event);
        }
    }

    fn tagged(&mut self, endpoint: &mut Endpoint, text: &str) {
        let mut parts = text.splitn(2, ' ');
        let tag = parts.next().unwrap_or("");
        let rest = parts.next().unwrap_or("");
        if self.current_tag.as_deref() != Some(tag) {
            tracing::warn!(tag = %tag, "tagged reply does not match outstanding tag; ignoring");
            return;
        }
        let mut status_parts = rest.splitn(2, ' ');
        let status = match status_parts.next().unwrap_or("").to_uppercase().as_str() {
            "OK" => Status::Ok,
            "NO" => Status::No,
            "BAD" => Status::Bad,
            other => {
                self.fail(
                    endpoint,
                    Error::protocol(format!("unparseable tagged reply status: {:?}", other)),
                );
                return;
            }
        };
        let (code, reply_text) = parse_response_code(status_parts.next().unwrap_or(""));
        let reply = ImapReply {
            status,
            code,
            text: reply_text,
        };
        self.current_tag = None;
        self.current_fetch = None;
        self.fetch_depth = 0;
        // Completion returns the machine to the base captured at send time
        // unless the command itself changes it below.
        self.base = if self.was_selected {
            Base::Selected
        } else {
            self.saved_base
        };

        match mem::replace(&mut self.in_flight, InFlight::None) {
            InFlight::None => {
                tracing::warn!("tagged reply with no command in flight; ignoring");
            }
            InFlight::StartTls(mut handler) => {
                if reply.is_ok() {
                    self.capabilities.clear();
                    self.in_flight = InFlight::StartTls(handler);
                    if let Err(e) = endpoint.start_tls() {
                        self.fail(endpoint, e);
                    }
                } else {
                    let mut session = ImapSession {
                        client: &mut *self,
                        endpoint: &mut *endpoint,
                    };
                    handler.handle_rejected(&mut session, &reply);
                }
            }
            InFlight::Login(mut handler) | InFlight::Authenticate { mut handler, .. } => {
                if reply.is_ok() {
                    self.base = Base::Authenticated;
                    if let Some(ResponseCode::Capability(caps)) = &reply.code {
                        self.capabilities = caps.clone();
                    }
                    let mut session = ImapSession {
                        client: &mut *self,
                        endpoint: &mut *endpoint,
                    };
                    handler.handle_authenticated(&mut session, &reply);
                } else {
                    self.base = Base::NotAuthenticated;
                    let mut session = ImapSession {
                        client: &mut *self,
                        endpoint: &mut *endpoint,
                    };
                    handler.handle_rejected(&mut session, &reply);
                }
            }
            InFlight::Select {
                mut handler,
                mut info,
                examine,
            } => {
                if reply.is_ok() {
                    if examine {
                        info.read_only = true;
                    }
                    if let Some(ResponseCode::ReadOnly) = reply.code {
                        info.read_only = true;
                    }
                    self.base = Base::Selected;
                    self.mailbox = Some(info.clone());
                    let mut session = ImapSession {
                        client: &mut *self,
                        endpoint: &mut *endpoint,
                    };
                    handler.handle_selected(&mut session, &info, &reply);
                } else {
                    // A failed SELECT leaves no mailbox selected.
                    self.base = Base::Authenticated;
                    self.mailbox = None;
                    let mut session = ImapSession {
                        client: &mut *self,
                        endpoint: &mut *endpoint,
                    };
                    handler.handle_failure(&mut session, &reply);
                }
            }
            InFlight::List(mut handler) => {
                let mut session = ImapSession {
                    client: &mut *self,
                    endpoint: &mut *endpoint,
                };
                handler.handle_complete(&mut session, &reply);
            }
            InFlight::Status(mut handler) => {
                let mut session = ImapSession {
                    client: &mut *self,
                    endpoint: &mut *endpoint,
                };
                handler.handle_complete(&mut session, &reply);
            }
            InFlight::Search(mut handler) => {
                let mut session = ImapSession {
                    client: &mut *self,
                    endpoint: &mut *endpoint,
                };
                handler.handle_complete(&mut session, &reply);
            }
            InFlight::Fetch(mut handler) => {
                let mut session = ImapSession {
                    client: &mut *self,
                    endpoint: &mut *endpoint,
                };
                if reply.is_ok() {
                    handler.handle_fetch_complete(&mut session, &reply);
                } else {
                    handler.handle_failure(&mut session, &reply);
                }
            }
            InFlight::Idle { mut handler, .. } => {
                let mut session = ImapSession {
                    client: &mut *self,
                    endpoint: &mut *endpoint,
                };
                handler.handle_idle_complete(&mut session, &reply);
            }
            InFlight::Append { mut handler, .. } => {
                let mut session = ImapSession {
                    client: &mut *self,
                    endpoint: &mut *endpoint,
                };
                if reply.is_ok() {
                    let appended = match &reply.code {
                        Some(ResponseCode::AppendUid { uid_validity, uid }) => {
                            Some((*uid_validity, *uid))
                        }
                        _ => None,
                    };
                    handler.handle_appended(&mut session, appended, &reply);
                } else {
                    handler.handle_failure(&mut session, &reply);
                }
            }
            InFlight::CloseMailbox(mut handler) => {
                if reply.is_ok() {
                    self.base = Base::Authenticated;
                    self.mailbox = None;
                }
                let mut session = ImapSession {
                    client: &mut *self,
                    endpoint: &mut *endpoint,
                };
                handler.handle_complete(&mut session, &reply);
            }
            InFlight::Logout(mut handler) => {
                self.state = ConnState::Closed;
                let mut session = ImapSession {
                    client: &mut *self,
                    endpoint: &mut *endpoint,
                };
                handler.handle_complete(&mut session, &reply);
                endpoint.close();
            }
            InFlight::Command(mut handler) => {
                let mut session = ImapSession {
                    client: &mut *self,
                    endpoint: &mut *endpoint,
                };
                handler.handle_complete(&mut session, &reply);
            }
        }
    }

    /// One fragment of a FETCH response: parse data items, open a literal
    /// when the fragment ends in `{N}`, and close the response when its
    /// parenthesis group balances.
    fn fetch_fragment(&mut self, _endpoint: &mut Endpoint, text: &str, message: u32, first: bool) {
        let (body, literal) = match split_literal_marker(text) {
            Some((prefix, size)) => (prefix.to_string(), Some(size)),
            None => (text.to_string(), None),
        };
        let items_part = if first {
            body.trim_start().to_string()
        } else {
            body
        };
        self.fetch_depth += paren_balance(&items_part);
        if let InFlight::Fetch(handler) = &mut self.in_flight {
            for item in parse_fetch_items(&items_part) {
                handler.handle_fetch_item(message, &item);
            }
            if let Some(size) = literal {
                let section = extract_section(&items_part).unwrap_or_default();
                handler.handle_fetch_literal_begin(message, &section, size);
                self.literal = Some(FetchLiteral {
                    tracker: LiteralTracker::new(size),
                    message,
                });
            }
        }
        if literal.is_none() && self.fetch_depth <= 0 {
            self.current_fetch = None;
            self.fetch_depth = 0;
        }
    }
}

struct FetchLiteralSink<'a> {
    handler: &'a mut dyn FetchHandler,
    message: u32,
}

impl LiteralSink for FetchLiteralSink<'_> {
    fn literal_content(&mut self, chunk: &[u8]) {
        self.handler.handle_literal_content(self.message, chunk);
    }

    fn literal_complete(&mut self) {
        self.handler.handle_fetch_literal_end(self.message);
    }
}

struct DiscardSink;

impl LiteralSink for DiscardSink {
    fn literal_content(&mut self, _chunk: &[u8]) {}

    fn literal_complete(&mut self) {}
}

struct ImapSink<'a, 'b> {
    client: &'a mut ImapClient,
    endpoint: &'b mut Endpoint,
}

impl LineSink for ImapSink<'_, '_> {
    fn line(&mut self, line: &[u8]) {
        self.client
            .handle_raw_line(self.endpoint, &line[..line.len() - 2]);
    }

    fn continue_line_processing(&mut self) -> bool {
        !self.endpoint.close_requested()
            && !self.client.closed()
            && self.client.literal.is_none()
            && self
                .client
                .accumulating
                .as_ref()
                .map_or(true, |a| a.remaining == 0)
    }
}

impl ConnectionHandler for ImapClient {
    fn connected(&mut self, _endpoint: &mut Endpoint) {
        self.state = ConnState::Greeting;
    }

    fn receive(&mut self, endpoint: &mut Endpoint, buf: &mut BytesMut) {
        loop {
            if self.closed() || endpoint.close_requested() {
                return;
            }
            // Streaming FETCH literal.
            if let Some(mut literal) = self.literal.take() {
                let message = literal.message;
                let done = match &mut self.in_flight {
                    InFlight::Fetch(handler) => {
                        let mut sink = FetchLiteralSink {
                            handler: handler.as_mut(),
                            message,
                        };
                        literal.tracker.process(buf, &mut sink)
                    }
                    _ => {
                        // Command completed out from under the literal;
                        // drain and drop the payload.
                        literal.tracker.process(buf, &mut DiscardSink)
                    }
                };
                if !done {
                    self.literal = Some(literal);
                    return;
                }
                continue;
            }
            // Bytes owed to a folded (non-FETCH) literal.
            let mut need_more = false;
            if let Some(acc) = &mut self.accumulating {
                if acc.remaining > 0 {
                    if buf.is_empty() {
                        return;
                    }
                    let take = acc.remaining.min(buf.len());
                    let chunk = buf.split_to(take);
                    acc.line.extend_from_slice(&chunk);
                    acc.remaining -= take;
                    need_more = acc.remaining > 0;
                }
            }
            if need_more {
                return;
            }
            let mut sink = ImapSink {
                client: &mut *self,
                endpoint: &mut *endpoint,
            };
            LineParser::parse(buf, &mut sink);
            let blocked = self.literal.is_some()
                || self
                    .accumulating
                    .as_ref()
                    .map_or(false, |a| a.remaining > 0);
            if !blocked {
                // Every complete line was consumed; a partial trailing line
                // stays buffered for the next read.
                return;
            }
        }
    }

    fn security_established(&mut self, endpoint: &mut Endpoint, info: &TlsInfo) {
        self.capabilities.clear();
        if let InFlight::StartTls(mut handler) = mem::replace(&mut self.in_flight, InFlight::None)
        {
            let mut session = ImapSession {
                client: &mut *self,
                endpoint: &mut *endpoint,
            };
            handler.handle_tls_established(&mut session, info);
        }
    }

    fn disconnected(&mut self) {
        let orderly = matches!(self.state, ConnState::Closed);
        self.state = ConnState::Closed;
        if let Some(mut d) = self.delegate.take() {
            if !orderly {
                d.error(Error::transport("connection closed by server"));
            }
            d.disconnected();
            self.delegate = Some(d);
        }
    }

    fn error(&mut self, error: Error) {
        self.state = ConnState::Failed;
        if let Some(mut d) = self.delegate.take() {
            d.error(error);
            self.delegate = Some(d);
        }
    }
}

/// Borrowed view of the client and its endpoint, handed to reply callbacks.
/// Commands validate the machine state at dispatch time.
pub struct ImapSession<'a> {
    client: &'a mut ImapClient,
    endpoint: &'a mut Endpoint,
}

impl ImapSession<'_> {
    pub fn endpoint(&mut self) -> &mut Endpoint {
        self.endpoint
    }

    /// Capabilities from the greeting or the last CAPABILITY response.
    pub fn capabilities(&self) -> &[String] {
        &self.client.capabilities
    }

    /// Snapshot of the selected mailbox, if any.
    pub fn mailbox(&self) -> Option<&MailboxInfo> {
        self.client.mailbox.as_ref()
    }

    pub fn is_encrypted(&self) -> bool {
        self.endpoint.is_encrypted()
    }

    fn send_command(&mut self, command: String, in_flight: InFlight) -> Result<String, Error> {
        if !matches!(self.client.in_flight, InFlight::None) {
            return Err(Error::protocol("another IMAP command is in flight"));
        }
        if self.client.state != ConnState::Open {
            return Err(Error::protocol("connection is not open"));
        }
        let tag = self.client.tags.next();
        self.client.current_tag = Some(tag.clone());
        self.client.saved_base = self.client.base;
        self.client.was_selected = self.client.base == Base::Selected;
        self.client.in_flight = in_flight;
        self.endpoint
            .send(format!("{} {}\r\n", tag, command).into_bytes());
        Ok(tag)
    }

    fn require_base(&self, allowed: &[Base]) -> Result<(), Error> {
        if allowed.contains(&self.client.base) {
            Ok(())
        } else {
            Err(Error::protocol(format!(
                "command not legal in base state {:?}",
                self.client.base
            )))
        }
    }

    pub fn capability(&mut self, handler: impl CommandHandler) -> Result<(), Error> {
        self.send_command("CAPABILITY".to_string(), InFlight::Command(Box::new(handler)))?;
        Ok(())
    }

    pub fn start_tls(&mut self, handler: impl StartTlsHandler) -> Result<(), Error> {
        self.require_base(&[Base::NotAuthenticated])?;
        if self.endpoint.is_encrypted() {
            return Err(Error::protocol("connection is already encrypted"));
        }
        self.send_command("STARTTLS".to_string(), InFlight::StartTls(Box::new(handler)))?;
        Ok(())
    }

    pub fn login(
        &mut self,
        username: &str,
        password: &str,
        handler: impl LoginHandler,
    ) -> Result<(), Error> {
        self.require_base(&[Base::NotAuthenticated])?;
        let command = format!("LOGIN {} {}", quote_string(username), quote_string(password));
        self.send_command(command, InFlight::Login(Box::new(handler)))?;
        Ok(())
    }

    /// AUTHENTICATE with any SASL mechanism; the continuation exchange is
    /// driven internally and a mechanism failure aborts with `*`.
    pub fn authenticate(
        &mut self,
        mechanism: Box<dyn SaslClient>,
        handler: impl LoginHandler,
    ) -> Result<(), Error> {
        self.require_base(&[Base::NotAuthenticated])?;
        let command = format!("AUTHENTICATE {}", mechanism.mechanism());
        self.send_command(
            command,
            InFlight::Authenticate {
                handler: Box::new(handler),
                mechanism,
                initial_sent: false,
                aborted: false,
            },
        )?;
        Ok(())
    }

    pub fn select(&mut self, mailbox: &str, handler: impl SelectHandler) -> Result<(), Error> {
        self.require_base(&[Base::Authenticated, Base::Selected])?;
        let command = format!("SELECT {}", quote_string(mailbox));
        self.send_command(
            command,
            InFlight::Select {
                handler: Box::new(handler),
                info: MailboxInfo::default(),
                examine: false,
            },
        )?;
        Ok(())
    }

    /// EXAMINE: read-only SELECT.
    pub fn examine(&mut self, mailbox: &str, handler: impl SelectHandler) -> Result<(), Error> {
        self.require_base(&[Base::Authenticated, Base::Selected])?;
        let command = format!("EXAMINE {}", quote_string(mailbox));
        self.send_command(
            command,
            InFlight::Select {
                handler: Box::new(handler),
                info: MailboxInfo::default(),
                examine: true,
            },
        )?;
        Ok(())
    }

    pub fn list(
        &mut self,
        reference: &str,
        pattern: &str,
        handler: impl ListHandler,
    ) -> Result<(), Error> {
        self.require_base(&[Base::Authenticated, Base::Selected])?;
        let command = format!("LIST {} {}", quote_string(reference), quote_string(pattern));
        self.send_command(command, InFlight::List(Box::new(handler)))?;
        Ok(())
    }

    pub fn status(
        &mut self,
        mailbox: &str,
        items: &[&str],
        handler: impl StatusHandler,
    ) -> Result<(), Error> {
        self.require_base(&[Base::Authenticated, Base::Selected])?;
        let command = format!("STATUS {} ({})", quote_string(mailbox), items.join(" "));
        self.send_command(command, InFlight::Status(Box::new(handler)))?;
        Ok(())
    }

    pub fn fetch(
        &mut self,
        sequence: &str,
        items: &str,
        handler: impl FetchHandler,
    ) -> Result<(), Error> {
        self.require_base(&[Base::Selected])?;
        let command = format!("FETCH {} {}", sequence, items);
        self.send_command(command, InFlight::Fetch(Box::new(handler)))?;
        Ok(())
    }

    pub fn uid_fetch(
        &mut self,
        sequence: &str,
        items: &str,
        handler: impl FetchHandler,
    ) -> Result<(), Error> {
        self.require_base(&[Base::Selected])?;
        let command = format!("UID FETCH {} {}", sequence, items);
        self.send_command(command, InFlight::Fetch(Box::new(handler)))?;
        Ok(())
    }

    pub fn store(
        &mut self,
        sequence: &str,
        items: &str,
        handler: impl CommandHandler,
    ) -> Result<(), Error> {
        self.require_base(&[Base::Selected])?;
        let command = format!("STORE {} {}", sequence, items);
        self.send_command(command, InFlight::Command(Box::new(handler)))?;
        Ok(())
    }

    pub fn uid_store(
        &mut self,
        sequence: &str,
        items: &str,
        handler: impl CommandHandler,
    ) -> Result<(), Error> {
        self.require_base(&[Base::Selected])?;
        let command = format!("UID STORE {} {}", sequence, items);
        self.send_command(command, InFlight::Command(Box::new(handler)))?;
        Ok(())
    }

    pub fn search(&mut self, criteria: &str, handler: impl SearchHandler) -> Result<(), Error> {
        self.require_base(&[Base::Selected])?;
        let command = format!("SEARCH {}", criteria);
        self.send_command(command, InFlight::Search(Box::new(handler)))?;
        Ok(())
    }

    pub fn expunge(&mut self, handler: impl CommandHandler) -> Result<(), Error> {
        self.require_base(&[Base::Selected])?;
        self.send_command("EXPUNGE".to_string(), InFlight::Command(Box::new(handler)))?;
        Ok(())
    }

    pub fn noop(&mut self, handler: impl CommandHandler) -> Result<(), Error> {
        self.send_command("NOOP".to_string(), InFlight::Command(Box::new(handler)))?;
        Ok(())
    }

    /// Enter IDLE. Unsolicited events are routed to the handler until
    /// [`ImapSession::idle_done`].
    pub fn idle(&mut self, handler: impl IdleHandler) -> Result<(), Error> {
        self.require_base(&[Base::Selected])?;
        self.send_command(
            "IDLE".to_string(),
            InFlight::Idle {
                handler: Box::new(handler),
                active: false,
            },
        )?;
        Ok(())
    }

    /// Terminate an active IDLE; the tagged completion follows.
    pub fn idle_done(&mut self) -> Result<(), Error> {
        match &self.client.in_flight {
            InFlight::Idle { active: true, .. } => {
                self.endpoint.send("DONE\r\n");
                Ok(())
            }
            _ => Err(Error::protocol("no active IDLE to terminate")),
        }
    }

    /// APPEND a message. The mailbox, optional flag list and optional
    /// internal date precede a synchronizing `{size}` literal; the body
    /// streams after the server's continuation.
    pub fn append(
        &mut self,
        mailbox: &str,
        flags: &[&str],
        date: Option<DateTime<FixedOffset>>,
        message: Bytes,
        handler: impl AppendHandler,
    ) -> Result<(), Error> {
        self.require_base(&[Base::Authenticated, Base::Selected])?;
        let mut command = format!("APPEND {}", quote_string(mailbox));
        if !flags.is_empty() {
            command.push_str(&format!(" ({})", flags.join(" ")));
        }
        if let Some(date) = date {
            command.push_str(&format!(" \"{}\"", date.format("%d-%b-%Y %H:%M:%S %z")));
        }
        command.push_str(&format!(" {{{}}}", message.len()));
        self.send_command(
            command,
            InFlight::Append {
                handler: Box::new(handler),
                body: Some(message),
            },
        )?;
        Ok(())
    }

    /// CLOSE: expunge silently and return to the authenticated state.
    pub fn close_mailbox(&mut self, handler: impl CommandHandler) -> Result<(), Error> {
        self.require_base(&[Base::Selected])?;
        self.send_command("CLOSE".to_string(), InFlight::CloseMailbox(Box::new(handler)))?;
        Ok(())
    }

    pub fn logout(&mut self, handler: impl CommandHandler) -> Result<(), Error> {
        self.send_command("LOGOUT".to_string(), InFlight::Logout(Box::new(handler)))?;
        Ok(())
    }

    /// Escape hatch for commands without structured routing (CREATE, DELETE,
    /// RENAME, SUBSCRIBE, ...).
    pub fn command(&mut self, raw: &str, handler: impl CommandHandler) -> Result<(), Error> {
        self.send_command(raw.to_string(), InFlight::Command(Box::new(handler)))?;
        Ok(())
    }

    /// Close the transport without LOGOUT.
    pub fn close(&mut self) {
        self.endpoint.close();
    }
}

/// Thread-safe handle to a connected IMAP client.
pub struct ImapClientHandle {
    endpoint: EndpointHandle<ImapClient>,
}

impl Clone for ImapClientHandle {
    fn clone(&self) -> Self {
        Self {
            endpoint: self.endpoint.clone(),
        }
    }
}

impl ImapClientHandle {
    /// Run a closure against the session on the connection's loop thread.
    pub fn run(
        &self,
        f: impl FnOnce(&mut ImapSession<'_>) + Send + 'static,
    ) -> Result<(), Error> {
        self.endpoint.run(move |client, endpoint| {
            let mut session = ImapSession { client, endpoint };
            f(&mut session);
        })
    }

    pub fn close(&self) {
        self.endpoint.close();
    }
}

/// Connect an IMAP client on the given loop. The delegate's `greeting` fires
/// on the loop thread once the server banner arrives.
pub fn connect(
    loop_handle: &LoopHandle,
    host: &str,
    port: u16,
    options: ImapClientOptions,
    delegate: impl ImapConnectionHandler,
) -> Result<ImapClientHandle, Error> {
    let client = ImapClient::new(Box::new(delegate));
    let endpoint_options = EndpointOptions {
        implicit_tls: options.implicit_tls,
        server_name: options.server_name,
        tls_config: options.tls_config,
        read_buffer_size: 0,
    };
    let endpoint = endpoint::connect(loop_handle, host, port, endpoint_options, client)?;
    Ok(ImapClientHandle { endpoint })
}

/// `"* 1 FETCH (..."` → (1, items text after FETCH).
fn untagged_fetch(text: &str) -> Option<(u32, &str)> {
    let rest = text.strip_prefix("* ")?;
    let mut parts = rest.splitn(3, ' ');
    let number: u32 = parts.next()?.parse().ok()?;
    let keyword = parts.next()?;
    if !keyword.eq_ignore_ascii_case("FETCH") {
        return None;
    }
    Some((number, parts.next().unwrap_or("")))
}

/// Split a trailing `{N}` (or `{N+}`) literal marker off a line.
fn split_literal_marker(text: &str) -> Option<(&str, usize)> {
    let stripped = text.trim_end();
    if !stripped.ends_with('}') {
        return None;
    }
    let open = stripped.rfind('{')?;
    let inner = &stripped[open + 1..stripped.len() - 1];
    let digits = inner.strip_suffix('+').unwrap_or(inner);
    let size: usize = digits.parse().ok()?;
    Some((&stripped[..open], size))
}

/// Parenthesis balance of a fragment, ignoring quoted strings.
fn paren_balance(text: &str) -> i32 {
    let mut depth = 0;
    let mut in_quote = false;
    let mut escaped = false;
    for c in text.chars() {
        if in_quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_quote = false;
            }
            continue;
        }
        match c {
            '"' => in_quote = true,
            '(' => depth += 1,
            ')' => depth -= 1,
            _ => {}
        }
    }
    depth
}

/// Flags list inside `(FLAGS (...))`-shaped text, empty when absent.
fn flags_in(text: &str) -> Vec<String> {
    let Some(pos) = text.find("FLAGS") else {
        return Vec::new();
    };
    parse_paren_list(&text[pos + 5..])
}

/// Shallow scan of FETCH data items in one fragment. Body sections are
/// announced through the literal callbacks, so only atom/number/quoted items
/// are modelled here.
fn parse_fetch_items(text: &str) -> Vec<FetchItem> {
    let mut items = Vec::new();
    let trimmed = text.trim_start().trim_start_matches('(');
    let mut rest = trimmed;
    while !rest.is_empty() {
        rest = rest.trim_start();
        if rest.starts_with(')') || rest.is_empty() {
            break;
        }
        if let Some(after) = strip_keyword(rest, "FLAGS") {
            items.push(FetchItem::Flags(parse_paren_list(after)));
            rest = skip_group(after);
        } else if let Some(after) = strip_keyword(rest, "UID") {
            let (n, next) = take_number(after);
            if let Some(n) = n {
                items.push(FetchItem::Uid(n));
            }
            rest = next;
        } else if let Some(after) = strip_keyword(rest, "RFC822.SIZE") {
            let (n, next) = take_number(after);
            if let Some(n) = n {
                items.push(FetchItem::Size(n));
            }
            rest = next;
        } else if let Some(after) = strip_keyword(rest, "INTERNALDATE") {
            let after = after.trim_start();
            if let Some(stripped) = after.strip_prefix('"') {
                if let Some(end) = stripped.find('"') {
                    items.push(FetchItem::InternalDate(stripped[..end].to_string()));
                    rest = &stripped[end + 1..];
                    continue;
                }
            }
            rest = after;
        } else {
            // Unmodelled item (BODY[...], ENVELOPE, BODYSTRUCTURE, ...):
            // record the keyword and skip its value group if parenthesized.
            let end = rest
                .find(|c: char| c == ' ' || c == ')')
                .unwrap_or(rest.len());
            let word = &rest[..end];
            if !word.is_empty() {
                items.push(FetchItem::Other(word.to_string()));
            }
            rest = skip_group(&rest[end..]);
        }
    }
    items
}

fn strip_keyword<'a>(text: &'a str, keyword: &str) -> Option<&'a str> {
    let t = text.trim_start();
    if t.len() >= keyword.len() && t[..keyword.len()].eq_ignore_ascii_case(keyword) {
        let rest = &t[keyword.len()..];
        if rest.is_empty() || rest.starts_with(' ') || rest.starts_with('(') {
            return Some(rest);
        }
    }
    None
}

fn take_number(text: &str) -> (Option<u32>, &str) {
    let t = text.trim_start();
    let end = t
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(t.len());
    (t[..end].parse().ok(), &t[end..])
}

/// Skip past the first balanced parenthesis group, if the text starts one.
fn skip_group(text: &str) -> &str {
    let t = text.trim_start();
    if !t.starts_with('(') {
        return t;
    }
    let mut depth = 0;
    let mut in_quote = false;
    let mut escaped = false;
    for (i, c) in t.char_indices() {
        if in_quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_quote = false;
            }
            continue;
        }
        match c {
            '"' => in_quote = true,
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return &t[i + 1..];
                }
            }
            _ => {}
        }
    }
    ""
}

/// Section name of the last `BODY[...]` item in a fragment (S2: `"1"`).
fn extract_section(text: &str) -> Option<String> {
    let pos = text.rfind("BODY[")?;
    let after = &text[pos + 5..];
    let end = after.find(']')?;
    Some(after[..end].to_string())
}

/// `"mbox" (MESSAGES 231 UIDNEXT 44292)` → (mailbox, pairs).
fn parse_status(text: &str) -> Option<(String, Vec<(String, u32)>)> {
    let trimmed = text.trim_start();
    let (mailbox, rest) = if let Some(stripped) = trimmed.strip_prefix('"') {
        let end = stripped.find('"')?;
        (stripped[..end].to_string(), &stripped[end + 1..])
    } else {
        let end = trimmed.find(' ')?;
        (trimmed[..end].to_string(), &trimmed[end..])
    };
    let open = rest.find('(')?;
    let close = rest[open..].find(')')? + open;
    let mut items = Vec::new();
    let mut words = rest[open + 1..close].split_whitespace();
    while let (Some(name), Some(value)) = (words.next(), words.next()) {
        if let Ok(n) = value.parse() {
            items.push((name.to_uppercase(), n));
        }
    }
    Some((mailbox, items))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_marker_detection() {
        assert_eq!(
            split_literal_marker("* 1 FETCH (BODY[1] {11}"),
            Some(("* 1 FETCH (BODY[1] ", 11))
        );
        assert_eq!(
            split_literal_marker("a001 LOGIN {16+}"),
            Some(("a001 LOGIN ", 16))
        );
        assert_eq!(split_literal_marker("* 1 FETCH (UID 4)"), None);
    }

    #[test]
    fn untagged_fetch_detection() {
        let (n, rest) = untagged_fetch("* 12 FETCH (FLAGS (\\Seen))").unwrap();
        assert_eq!(n, 12);
        assert_eq!(rest, "(FLAGS (\\Seen))");
        assert!(untagged_fetch("* 12 EXPUNGE").is_none());
    }

    #[test]
    fn paren_balance_ignores_quotes() {
        assert_eq!(paren_balance("(a (b) \"(((\" c"), 1);
        assert_eq!(paren_balance("(FLAGS (\\Seen))"), 0);
    }

    #[test]
    fn fetch_item_scan() {
        let items = parse_fetch_items("(UID 4827 RFC822.SIZE 3124 FLAGS (\\Seen \\Answered))");
        assert!(items.contains(&FetchItem::Uid(4827)));
        assert!(items.contains(&FetchItem::Size(3124)));
        assert!(items.contains(&FetchItem::Flags(vec![
            "\\Seen".to_string(),
            "\\Answered".to_string()
        ])));
    }

    #[test]
    fn fetch_section_extraction() {
        assert_eq!(
            extract_section("* 1 FETCH (BODY[1] "),
            Some("1".to_string())
        );
        assert_eq!(
            extract_section("* 1 FETCH (BODY[HEADER.FIELDS (FROM TO)] "),
            Some("HEADER.FIELDS (FROM TO)".to_string())
        );
        assert_eq!(extract_section("UID 4"), None);
    }

    #[test]
    fn status_line_parse() {
        let (mailbox, items) =
            parse_status("\"INBOX\" (MESSAGES 231 UIDNEXT 44292)").unwrap();
        assert_eq!(mailbox, "INBOX");
        assert_eq!(
            items,
            vec![("MESSAGES".to_string(), 231), ("UIDNEXT".to_string(), 44292)]
        );
    }
}
