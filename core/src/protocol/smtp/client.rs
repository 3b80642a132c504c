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

//! SMTP client state machine. Reply lines are accumulated (`NNN-` continues,
//! `NNN ` completes) and dispatched to the reply handler registered by the
//! command in flight; callbacks issue the next command through the borrowed
//! [`SmtpSession`]. Message bodies stream either through the dot stuffer
//! (DATA) or as length-framed BDAT chunks when the server advertises
//! CHUNKING.

use std::mem;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{Bytes, BytesMut};

use crate::endpoint::{self, ConnectionHandler, Endpoint, EndpointHandle, EndpointOptions};
use crate::error::{Error, ErrorKind};
use crate::net::TlsInfo;
use crate::parse::{LineParser, LineSink};
use crate::reactor::LoopHandle;
use crate::sasl::SaslClient;

use super::{
    AuthHandler, Capabilities, DataHandler, EhloHandler, MailFromHandler, MailParams,
    MessageHandler, RcptToHandler, ReplyHandler, SmtpConnectionHandler, SmtpReply,
    StartTlsHandler,
};

use super::dot_stuffer::DotStuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Connecting,
    Greeting,
    Ready,
    EhloSent,
    HeloSent,
    StartTlsSent,
    AuthSent,
    MailFromSent,
    MailFromAccepted,
    RcptToSent,
    RcptToAccepted,
    DataSent,
    DataMode,
    DataEndSent,
    BdatMode,
    BdatEndSent,
    RsetSent,
    NoopSent,
    QuitSent,
    Closed,
    Failed,
}

enum Pending {
    None,
    Ehlo(Box<dyn EhloHandler>),
    StartTls(Box<dyn StartTlsHandler>),
    Auth {
        handler: Box<dyn AuthHandler>,
        mechanism: Box<dyn SaslClient>,
        aborted: bool,
    },
    MailFrom(Box<dyn MailFromHandler>),
    RcptTo {
        handler: Box<dyn RcptToHandler>,
        recipient: String,
    },
    Data(Box<dyn DataHandler>),
    Message(Box<dyn MessageHandler>),
    Rset(Box<dyn ReplyHandler>),
    Noop(Box<dyn ReplyHandler>),
    Quit(Box<dyn ReplyHandler>),
}

/// Options for [`connect`].
#[derive(Clone, Default)]
pub struct SmtpClientOptions {
    /// Handshake before the greeting (SMTPS, port 465).
    pub implicit_tls: bool,
    /// Never use BDAT even when the server advertises CHUNKING.
    pub disable_chunking: bool,
    /// TLS configuration override.
    pub tls_config: Option<Arc<rustls::ClientConfig>>,
    /// TLS server name override (defaults to the connect host).
    pub server_name: Option<String>,
}

/// SMTP protocol handler bound to one endpoint.
pub struct SmtpClient {
    delegate: Option<Box<dyn SmtpConnectionHandler>>,
    state: State,
    resume_state: State,
    pending: Pending,
    reply_code: u16,
    reply_lines: Vec<String>,
    capabilities: Option<Capabilities>,
    stuffer: DotStuffer,
    recipients_accepted: u32,
    bdat_handler: Option<Box<dyn MessageHandler>>,
    bdat_outstanding: u32,
    bdat_failed: bool,
    chunking_disabled: bool,
}

impl SmtpClient {
    fn new(delegate: Box<dyn SmtpConnectionHandler>, chunking_disabled: bool) -> Self {
        Self {
            delegate: Some(delegate),
            state: State::Connecting,
            resume_state: State::Ready,
            pending: Pending::None,
            reply_code: 0,
            reply_lines: Vec::new(),
            capabilities: None,
            stuffer: DotStuffer::new(),
            recipients_accepted: 0,
            bdat_handler: None,
            bdat_outstanding: 0,
            bdat_failed: false,
            chunking_disabled,
        }
    }

    fn fail(&mut self, endpoint: &mut Endpoint, error: Error) {
        self.state = State::Failed;
        self.pending = Pending::None;
        self.bdat_handler = None;
        if let Some(mut d) = self.delegate.take() {
            d.error(error);
            self.delegate = Some(d);
        }
        endpoint.close();
    }

    fn handle_line(&mut self, endpoint: &mut Endpoint, line: &[u8]) {
        let text = String::from_utf8_lossy(&line[..line.len() - 2]).into_owned();
        if text.len() < 3 || !text.as_bytes()[..3].iter().all(|b| b.is_ascii_digit()) {
            self.fail(
                endpoint,
                Error::protocol(format!("unparseable SMTP reply line: {:?}", text)),
            );
            return;
        }
        let code: u16 = text[..3].parse().unwrap_or(0);
        let (continuation, rest) = match text.as_bytes().get(3) {
            Some(b'-') => (true, &text[4..]),
            Some(b' ') => (false, &text[4..]),
            None => (false, ""),
            Some(_) => {
                self.fail(
                    endpoint,
                    Error::protocol(format!("bad SMTP reply separator: {:?}", text)),
                );
                return;
            }
        };
        if self.reply_lines.is_empty() {
            self.reply_code = code;
        } else if code != self.reply_code {
            self.fail(
                endpoint,
                Error::protocol(format!(
                    "SMTP reply code changed mid-reply: {} then {}",
                    self.reply_code, code
                )),
            );
            return;
        }
        self.reply_lines.push(rest.trim().to_string());
        if !continuation {
            let reply = SmtpReply {
                code: self.reply_code,
                lines: mem::take(&mut self.reply_lines),
            };
            self.dispatch(endpoint, reply);
        }
    }

    fn dispatch(&mut self, endpoint: &mut Endpoint, reply: SmtpReply) {
        if reply.code == 421 {
            self.service_closing(endpoint, reply);
            return;
        }
        match mem::replace(&mut self.pending, Pending::None) {
            Pending::None => match self.state {
                State::Greeting => {
                    self.state = State::Ready;
                    if let Some(mut d) = self.delegate.take() {
                        let mut session = SmtpSession {
                            client: &mut *self,
                            endpoint: &mut *endpoint,
                        };
                        d.greeting(&mut session, &reply);
                        self.delegate = Some(d);
                    }
                }
                State::BdatMode | State::BdatEndSent => self.bdat_reply(endpoint, reply),
                _ => {
                    tracing::warn!(code = reply.code, "unexpected SMTP reply; ignoring");
                }
            },
            Pending::Ehlo(mut handler) => {
                let was_ehlo = self.state == State::EhloSent;
                self.state = State::Ready;
                if reply.is_positive() {
                    let caps = if was_ehlo && reply.lines.len() > 1 {
                        Capabilities::parse(&reply.lines[1..])
                    } else {
                        Capabilities::default()
                    };
                    self.capabilities = Some(caps.clone());
                    let mut session = SmtpSession {
                        client: &mut *self,
                        endpoint: &mut *endpoint,
                    };
                    handler.handle_capabilities(&mut session, &caps, &reply);
                } else {
                    let mut session = SmtpSession {
                        client: &mut *self,
                        endpoint: &mut *endpoint,
                    };
                    handler.handle_rejected(&mut session, &reply);
                }
            }
            Pending::StartTls(handler) => {
                if reply.code == 220 {
                    self.pending = Pending::StartTls(handler);
                    if let Err(e) = endpoint.start_tls() {
                        self.fail(endpoint, e);
                    }
                } else {
                    self.state = State::Ready;
                    let mut handler = handler;
                    let mut session = SmtpSession {
                        client: &mut *self,
                        endpoint: &mut *endpoint,
                    };
                    handler.handle_rejected(&mut session, &reply);
                }
            }
            Pending::Auth {
                mut handler,
                mut mechanism,
                aborted,
            } => {
                if reply.code == 334 {
                    if aborted {
                        // Server ignored the abort; insist.
                        endpoint.send("*\r\n");
                        self.pending = Pending::Auth {
                            handler,
                            mechanism,
                            aborted: true,
                        };
                        return;
                    }
                    let challenge = match BASE64.decode(reply.message().trim()) {
                        Ok(c) => c,
                        Err(_) => {
                            endpoint.send("*\r\n");
                            self.pending = Pending::Auth {
                                handler,
                                mechanism,
                                aborted: true,
                            };
                            return;
                        }
                    };
                    match mechanism.respond(&challenge) {
                        Ok(response) => {
                            let mut line = BASE64.encode(&response);
                            line.push_str("\r\n");
                            endpoint.send(line.into_bytes());
                            self.pending = Pending::Auth {
                                handler,
                                mechanism,
                                aborted: false,
                            };
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "SASL exchange failed; aborting");
                            endpoint.send("*\r\n");
                            self.pending = Pending::Auth {
                                handler,
                                mechanism,
                                aborted: true,
                            };
                        }
                    }
                    return;
                }
                self.state = State::Ready;
                let mut session = SmtpSession {
                    client: &mut *self,
                    endpoint: &mut *endpoint,
                };
                if reply.code == 235 {
                    handler.handle_authenticated(&mut session, &reply);
                } else if reply.is_transient() {
                    handler.handle_temporary_failure(&mut session, &reply);
                } else {
                    handler.handle_rejected(&mut session, &reply);
                }
            }
            Pending::MailFrom(mut handler) => {
                if reply.is_positive() {
                    self.state = State::MailFromAccepted;
                    let mut session = SmtpSession {
                        client: &mut *self,
                        endpoint: &mut *endpoint,
                    };
                    handler.handle_sender_accepted(&mut session, &reply);
                } else {
                    self.state = State::Ready;
                    let mut session = SmtpSession {
                        client: &mut *self,
                        endpoint: &mut *endpoint,
                    };
                    if reply.is_transient() {
                        handler.handle_temporary_failure(&mut session, &reply);
                    } else {
                        handler.handle_sender_rejected(&mut session, &reply);
                    }
                }
            }
            Pending::RcptTo {
                mut handler,
                recipient,
            } => {
                // 251/252 are forward/unverified acceptances.
                if reply.is_positive() {
                    self.recipients_accepted += 1;
                    self.state = State::RcptToAccepted;
                    let mut session = SmtpSession {
                        client: &mut *self,
                        endpoint: &mut *endpoint,
                    };
                    handler.handle_recipient_accepted(&mut session, &recipient, &reply);
                } else {
                    self.state = if self.recipients_accepted > 0 {
                        State::RcptToAccepted
                    } else {
                        State::MailFromAccepted
                    };
                    let mut session = SmtpSession {
                        client: &mut *self,
                        endpoint: &mut *endpoint,
                    };
                    if reply.is_transient() {
                        handler.handle_temporary_failure(&mut session, &recipient, &reply);
                    } else {
                        handler.handle_recipient_rejected(&mut session, &recipient, &reply);
                    }
                }
            }
            Pending::Data(mut handler) => {
                if reply.code == 354 {
                    self.state = State::DataMode;
                    self.stuffer.reset();
                    let mut session = SmtpSession {
                        client: &mut *self,
                        endpoint: &mut *endpoint,
                    };
                    handler.handle_ready(&mut session);
                } else {
                    self.state = State::RcptToAccepted;
                    let mut session = SmtpSession {
                        client: &mut *self,
                        endpoint: &mut *endpoint,
                    };
                    if reply.is_transient() {
                        handler.handle_temporary_failure(&mut session, &reply);
                    } else {
                        handler.handle_rejected(&mut session, &reply);
                    }
                }
            }
            Pending::Message(mut handler) => {
                self.state = State::Ready;
                self.recipients_accepted = 0;
                let mut session = SmtpSession {
                    client: &mut *self,
                    endpoint: &mut *endpoint,
                };
                if reply.is_positive() {
                    let queue_id = reply.queue_id().map(|s| s.to_string());
                    handler.handle_message_accepted(&mut session, queue_id.as_deref(), &reply);
                } else if reply.is_transient() {
                    handler.handle_temporary_failure(&mut session, &reply);
                } else {
                    handler.handle_message_rejected(&mut session, &reply);
                }
            }
            Pending::Rset(mut handler) => {
                self.state = State::Ready;
                self.recipients_accepted = 0;
                let mut session = SmtpSession {
                    client: &mut *self,
                    endpoint: &mut *endpoint,
                };
                handler.handle_reply(&mut session, &reply);
            }
            Pending::Noop(mut handler) => {
                self.state = self.resume_state;
                let mut session = SmtpSession {
                    client: &mut *self,
                    endpoint: &mut *endpoint,
                };
                handler.handle_reply(&mut session, &reply);
            }
            Pending::Quit(mut handler) => {
                self.state = State::Closed;
                let mut session = SmtpSession {
                    client: &mut *self,
                    endpoint: &mut *endpoint,
                };
                handler.handle_reply(&mut session, &reply);
                endpoint.close();
            }
        }
    }

    /// 421: surface to the callback in flight (or the greeting), then close.
    fn service_closing(&mut self, endpoint: &mut Endpoint, reply: SmtpReply) {
        let pending = mem::replace(&mut self.pending, Pending::None);
        let at_greeting = self.state == State::Greeting;
        self.state = State::Closed;
        self.bdat_handler = None;
        match pending {
            Pending::None => {
                if let Some(mut d) = self.delegate.take() {
                    if at_greeting {
                        let mut session = SmtpSession {
                            client: &mut *self,
                            endpoint: &mut *endpoint,
                        };
                        d.greeting(&mut session, &reply);
                    } else {
                        d.service_closing(&reply);
                    }
                    self.delegate = Some(d);
                }
            }
            Pending::Ehlo(mut h) => {
                let mut session = SmtpSession {
                    client: &mut *self,
                    endpoint: &mut *endpoint,
                };
                h.handle_rejected(&mut session, &reply);
            }
            Pending::StartTls(mut h) => {
                let mut session = SmtpSession {
                    client: &mut *self,
                    endpoint: &mut *endpoint,
                };
                h.handle_rejected(&mut session, &reply);
            }
            Pending::Auth { mut handler, .. } => {
                let mut session = SmtpSession {
                    client: &mut *self,
                    endpoint: &mut *endpoint,
                };
                handler.handle_temporary_failure(&mut session, &reply);
            }
            Pending::MailFrom(mut h) => {
                let mut session = SmtpSession {
                    client: &mut *self,
                    endpoint: &mut *endpoint,
                };
                h.handle_temporary_failure(&mut session, &reply);
            }
            Pending::RcptTo {
                mut handler,
                recipient,
            } => {
                let mut session = SmtpSession {
                    client: &mut *self,
                    endpoint: &mut *endpoint,
                };
                handler.handle_temporary_failure(&mut session, &recipient, &reply);
            }
            Pending::Data(mut h) => {
                let mut session = SmtpSession {
                    client: &mut *self,
                    endpoint: &mut *endpoint,
                };
                h.handle_temporary_failure(&mut session, &reply);
            }
            Pending::Message(mut h) => {
                let mut session = SmtpSession {
                    client: &mut *self,
                    endpoint: &mut *endpoint,
                };
                h.handle_temporary_failure(&mut session, &reply);
            }
            Pending::Rset(mut h) | Pending::Noop(mut h) | Pending::Quit(mut h) => {
                let mut session = SmtpSession {
                    client: &mut *self,
                    endpoint: &mut *endpoint,
                };
                h.handle_reply(&mut session, &reply);
            }
        }
        endpoint.close();
    }

    fn bdat_reply(&mut self, endpoint: &mut Endpoint, reply: SmtpReply) {
        self.bdat_outstanding = self.bdat_outstanding.saturating_sub(1);
        if !reply.is_positive() && !self.bdat_failed {
            // First failing chunk decides the transaction; later chunk
            // replies are consumed silently.
            self.bdat_failed = true;
            if let Some(mut handler) = self.bdat_handler.take() {
                let mut session = SmtpSession {
                    client: &mut *self,
                    endpoint: &mut *endpoint,
                };
                if reply.is_transient() {
                    handler.handle_temporary_failure(&mut session, &reply);
                } else {
                    handler.handle_message_rejected(&mut session, &reply);
                }
            }
        }
        if self.bdat_outstanding == 0 && self.state == State::BdatEndSent {
            let failed = mem::replace(&mut self.bdat_failed, false);
            self.state = State::Ready;
            self.recipients_accepted = 0;
            if !failed {
                if let Some(mut handler) = self.bdat_handler.take() {
                    let queue_id = reply.queue_id().map(|s| s.to_string());
                    let mut session = SmtpSession {
                        client: &mut *self,
                        endpoint: &mut *endpoint,
                    };
                    handler.handle_message_accepted(&mut session, queue_id.as_deref(), &reply);
                }
            }
        }
    }
}

struct SmtpSink<'a, 'b> {
    client: &'a mut SmtpClient,
    endpoint: &'b mut Endpoint,
}

impl LineSink for SmtpSink<'_, '_> {
    fn line(&mut self, line: &[u8]) {
        self.client.handle_line(self.endpoint, line);
    }

    fn continue_line_processing(&mut self) -> bool {
        !self.endpoint.close_requested()
            && !matches!(self.client.state, State::Closed | State::Failed)
    }
}

impl ConnectionHandler for SmtpClient {
    fn connected(&mut self, _endpoint: &mut Endpoint) {
        self.state = State::Greeting;
    }

    fn receive(&mut self, endpoint: &mut Endpoint, buf: &mut BytesMut) {
        let mut sink = SmtpSink {
            client: &mut *self,
            endpoint: &mut *endpoint,
        };
        LineParser::parse(buf, &mut sink);
    }

    fn security_established(&mut self, endpoint: &mut Endpoint, info: &TlsInfo) {
        // Capabilities no longer apply; the caller must re-issue EHLO.
        self.capabilities = None;
        if let Pending::StartTls(mut handler) = mem::replace(&mut self.pending, Pending::None) {
            self.state = State::Ready;
            let mut session = SmtpSession {
                client: &mut *self,
                endpoint: &mut *endpoint,
            };
            handler.handle_tls_established(&mut session, info);
        }
    }

    fn disconnected(&mut self) {
        let orderly = matches!(self.state, State::QuitSent | State::Closed);
        self.state = State::Closed;
        if let Some(mut d) = self.delegate.take() {
            if !orderly {
                d.error(Error::transport("connection closed by server"));
            }
            d.disconnected();
            self.delegate = Some(d);
        }
    }

    fn error(&mut self, error: Error) {
        self.state = State::Failed;
        if let Some(mut d) = self.delegate.take() {
            d.error(error);
            self.delegate = Some(d);
        }
    }
}

/// Borrowed view of the client and its endpoint, handed to reply callbacks.
/// Commands validate the machine state at dispatch time; a call that is not
/// legal in the current state returns a protocol error.
pub struct SmtpSession<'a> {
    client: &'a mut SmtpClient,
    endpoint: &'a mut Endpoint,
}

impl SmtpSession<'_> {
    pub fn endpoint(&mut self) -> &mut Endpoint {
        self.endpoint
    }

    /// Capabilities from the last EHLO, if any.
    pub fn capabilities(&self) -> Option<&Capabilities> {
        self.client.capabilities.as_ref()
    }

    pub fn is_encrypted(&self) -> bool {
        self.endpoint.is_encrypted()
    }

    /// Number of recipients accepted in the current transaction.
    pub fn recipients_accepted(&self) -> u32 {
        self.client.recipients_accepted
    }

    fn require(&self, allowed: &[State]) -> Result<(), Error> {
        if !matches!(self.client.pending, Pending::None) {
            return Err(Error::protocol("another SMTP command is in flight"));
        }
        if allowed.contains(&self.client.state) {
            Ok(())
        } else {
            Err(Error::protocol(format!(
                "command not legal in state {:?}",
                self.client.state
            )))
        }
    }

    fn send_line(&mut self, mut line: String) {
        line.push_str("\r\n");
        self.endpoint.send(line.into_bytes());
    }

    pub fn ehlo(&mut self, hostname: &str, handler: impl EhloHandler) -> Result<(), Error> {
        self.require(&[State::Ready])?;
        self.client.state = State::EhloSent;
        self.client.pending = Pending::Ehlo(Box::new(handler));
        self.send_line(format!("EHLO {}", hostname));
        Ok(())
    }

    /// HELO fallback for servers replying 502 to EHLO. Success yields an
    /// empty capability set.
    pub fn helo(&mut self, hostname: &str, handler: impl EhloHandler) -> Result<(), Error> {
        self.require(&[State::Ready])?;
        self.client.state = State::HeloSent;
        self.client.pending = Pending::Ehlo(Box::new(handler));
        self.send_line(format!("HELO {}", hostname));
        Ok(())
    }

    pub fn start_tls(&mut self, handler: impl StartTlsHandler) -> Result<(), Error> {
        self.require(&[State::Ready])?;
        if self.endpoint.is_encrypted() {
            return Err(Error::protocol("connection is already encrypted"));
        }
        self.client.state = State::StartTlsSent;
        self.client.pending = Pending::StartTls(Box::new(handler));
        self.send_line("STARTTLS".to_string());
        Ok(())
    }

    /// AUTH with any SASL mechanism. Challenges are base64-framed per RFC
    /// 4954; a mechanism failure aborts the exchange with `*`.
    pub fn auth(
        &mut self,
        mut mechanism: Box<dyn SaslClient>,
        handler: impl AuthHandler,
    ) -> Result<(), Error> {
        self.require(&[State::Ready])?;
        let mut command = format!("AUTH {}", mechanism.mechanism());
        match mechanism.initial_response() {
            Ok(Some(initial)) => {
                command.push(' ');
                if initial.is_empty() {
                    command.push('=');
                } else {
                    command.push_str(&BASE64.encode(&initial));
                }
            }
            Ok(None) => {}
            Err(e) => return Err(Error::new(ErrorKind::AuthChallengeFail, e.to_string())),
        }
        self.client.state = State::AuthSent;
        self.client.pending = Pending::Auth {
            handler: Box::new(handler),
            mechanism,
            aborted: false,
        };
        self.send_line(command);
        Ok(())
    }

    pub fn mail_from(
        &mut self,
        reverse_path: &str,
        params: &MailParams,
        handler: impl MailFromHandler,
    ) -> Result<(), Error> {
        self.require(&[State::Ready])?;
        let mut command = format!("MAIL FROM:<{}>", reverse_path);
        if let Some(size) = params.size {
            command.push_str(&format!(" SIZE={}", size));
        }
        if params.smtputf8 {
            command.push_str(" SMTPUTF8");
        }
        self.client.state = State::MailFromSent;
        self.client.pending = Pending::MailFrom(Box::new(handler));
        self.send_line(command);
        Ok(())
    }

    pub fn rcpt_to(&mut self, forward_path: &str, handler: impl RcptToHandler) -> Result<(), Error> {
        self.require(&[State::MailFromAccepted, State::RcptToAccepted])?;
        self.client.state = State::RcptToSent;
        self.client.pending = Pending::RcptTo {
            handler: Box::new(handler),
            recipient: forward_path.to_string(),
        };
        self.send_line(format!("RCPT TO:<{}>", forward_path));
        Ok(())
    }

    /// Begin a DATA transfer. On 354 the session enters data mode.
    pub fn data(&mut self, handler: impl DataHandler) -> Result<(), Error> {
        self.require(&[State::RcptToAccepted])?;
        self.client.state = State::DataSent;
        self.client.pending = Pending::Data(Box::new(handler));
        self.send_line("DATA".to_string());
        Ok(())
    }

    /// Stream body bytes in data mode, dot-stuffed on the wire.
    pub fn write_body(&mut self, chunk: &[u8]) -> Result<(), Error> {
        if self.client.state != State::DataMode {
            return Err(Error::protocol("write_body outside data mode"));
        }
        let mut out = BytesMut::with_capacity(chunk.len() + 8);
        self.client.stuffer.process(chunk, &mut out);
        self.endpoint.send(out.freeze());
        Ok(())
    }

    /// Terminate the body (`CRLF.CRLF`) and await the final reply.
    pub fn end_message(&mut self, handler: impl MessageHandler) -> Result<(), Error> {
        if self.client.state != State::DataMode {
            return Err(Error::protocol("end_message outside data mode"));
        }
        let mut out = BytesMut::with_capacity(8);
        self.client.stuffer.finish(&mut out);
        self.endpoint.send(out.freeze());
        self.client.state = State::DataEndSent;
        self.client.pending = Pending::Message(Box::new(handler));
        Ok(())
    }

    /// Begin a BDAT transfer. Legal only when the server advertised CHUNKING
    /// and the client has not disabled it. The handler receives the final
    /// disposition; per-chunk acknowledgements are consumed internally and
    /// after a failing chunk the remaining acknowledgements are dropped
    /// silently.
    pub fn begin_chunked(&mut self, handler: impl MessageHandler) -> Result<(), Error> {
        self.require(&[State::RcptToAccepted])?;
        let chunking = self
            .client
            .capabilities
            .as_ref()
            .map(|c| c.chunking)
            .unwrap_or(false);
        if !chunking || self.client.chunking_disabled {
            return Err(Error::protocol("CHUNKING not available on this session"));
        }
        self.client.state = State::BdatMode;
        self.client.bdat_handler = Some(Box::new(handler));
        self.client.bdat_outstanding = 0;
        self.client.bdat_failed = false;
        Ok(())
    }

    /// Send one BDAT chunk (`BDAT n` framing, no dot stuffing).
    pub fn send_chunk(&mut self, chunk: &[u8]) -> Result<(), Error> {
        if self.client.state != State::BdatMode {
            return Err(Error::protocol("send_chunk outside chunked mode"));
        }
        self.endpoint
            .send(format!("BDAT {}\r\n", chunk.len()).into_bytes());
        self.endpoint.send(Bytes::copy_from_slice(chunk));
        self.client.bdat_outstanding += 1;
        Ok(())
    }

    /// Send `BDAT 0 LAST`; the message handler fires when every chunk has
    /// been acknowledged.
    pub fn end_chunked(&mut self) -> Result<(), Error> {
        if self.client.state != State::BdatMode {
            return Err(Error::protocol("end_chunked outside chunked mode"));
        }
        self.endpoint.send("BDAT 0 LAST\r\n");
        self.client.bdat_outstanding += 1;
        self.client.state = State::BdatEndSent;
        Ok(())
    }

    /// RSET: abort the current transaction, zeroing the recipient count.
    pub fn rset(&mut self, handler: impl ReplyHandler) -> Result<(), Error> {
        self.require(&[
            State::Ready,
            State::MailFromAccepted,
            State::RcptToAccepted,
        ])?;
        self.client.state = State::RsetSent;
        self.client.pending = Pending::Rset(Box::new(handler));
        self.send_line("RSET".to_string());
        Ok(())
    }

    pub fn noop(&mut self, handler: impl ReplyHandler) -> Result<(), Error> {
        self.require(&[
            State::Ready,
            State::MailFromAccepted,
            State::RcptToAccepted,
        ])?;
        self.client.resume_state = self.client.state;
        self.client.state = State::NoopSent;
        self.client.pending = Pending::Noop(Box::new(handler));
        self.send_line("NOOP".to_string());
        Ok(())
    }

    pub fn quit(&mut self, handler: impl ReplyHandler) -> Result<(), Error> {
        self.require(&[
            State::Ready,
            State::MailFromAccepted,
            State::RcptToAccepted,
        ])?;
        self.client.state = State::QuitSent;
        self.client.pending = Pending::Quit(Box::new(handler));
        self.send_line("QUIT".to_string());
        Ok(())
    }

    /// Close the transport without QUIT.
    pub fn close(&mut self) {
        self.endpoint.close();
    }
}

/// Thread-safe handle to a connected SMTP client.
pub struct SmtpClientHandle {
    endpoint: EndpointHandle<SmtpClient>,
}

impl Clone for SmtpClientHandle {
    fn clone(&self) -> Self {
        Self {
            endpoint: self.endpoint.clone(),
        }
    }
}

impl SmtpClientHandle {
    /// Run a closure against the session on the connection's loop thread.
    pub fn run(
        &self,
        f: impl FnOnce(&mut SmtpSession<'_>) + Send + 'static,
    ) -> Result<(), Error> {
        self.endpoint.run(move |client, endpoint| {
            let mut session = SmtpSession { client, endpoint };
            f(&mut session);
        })
    }

    pub fn close(&self) {
        self.endpoint.close();
    }
}

/// Connect an SMTP client on the given loop. The delegate's `greeting` fires
/// on the loop thread once the server banner arrives.
pub fn connect(
    loop_handle: &LoopHandle,
    host: &str,
    port: u16,
    options: SmtpClientOptions,
    delegate: impl SmtpConnectionHandler,
) -> Result<SmtpClientHandle, Error> {
    let client = SmtpClient::new(Box::new(delegate), options.disable_chunking);
    let endpoint_options = EndpointOptions {
        implicit_tls: options.implicit_tls,
        server_name: options.server_name,
        tls_config: options.tls_config,
        read_buffer_size: 0,
    };
    let endpoint = endpoint::connect(loop_handle, host, port, endpoint_options, client)?;
    Ok(SmtpClientHandle { endpoint })
}
