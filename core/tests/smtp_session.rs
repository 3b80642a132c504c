/*
 * smtp_session.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * Integration tests for the SMTP client: the full submission flow with
 * STARTTLS and AUTH PLAIN, recipient rejection, RSET, and BDAT chunking
 * including the mid-transaction error path.
 */

mod support;

use std::time::Duration;

use staffetta_core::protocol::smtp::{
    self, AuthHandler, Capabilities, DataHandler, EhloHandler, MailFromHandler, MailParams,
    MessageHandler, RcptToHandler, ReplyHandler, SmtpClientOptions, SmtpConnectionHandler,
    SmtpReply, SmtpSession, StartTlsHandler,
};
use staffetta_core::sasl::Plain;
use staffetta_core::{Error, Reactor, ReactorConfig, TlsInfo};
use support::{accept_tls, client_tls_config, events, self_signed, spawn_server, Events};

const CLIENT_HOST: &str = "client.example.org";

struct Delegate {
    events: Events,
    submit: bool,
}

impl SmtpConnectionHandler for Delegate {
    fn greeting(&mut self, session: &mut SmtpSession<'_>, reply: &SmtpReply) {
        self.events.emit(format!("greeting {}", reply.code));
        let handler = PreTlsEhlo {
            events: self.events.clone(),
            submit: self.submit,
        };
        session.ehlo(CLIENT_HOST, handler).unwrap();
    }

    fn service_closing(&mut self, reply: &SmtpReply) {
        self.events.emit(format!("service-closing {}", reply.code));
    }

    fn error(&mut self, error: Error) {
        self.events.emit(format!("error {}", error));
    }

    fn disconnected(&mut self) {
        self.events.emit("disconnected");
    }
}

struct PreTlsEhlo {
    events: Events,
    submit: bool,
}

impl EhloHandler for PreTlsEhlo {
    fn handle_capabilities(
        &mut self,
        session: &mut SmtpSession<'_>,
        capabilities: &Capabilities,
        _reply: &SmtpReply,
    ) {
        self.events.emit(format!(
            "capabilities starttls={} size={}",
            capabilities.starttls,
            capabilities.size.unwrap_or(0)
        ));
        if capabilities.starttls {
            session
                .start_tls(TlsHandler {
                    events: self.events.clone(),
                    submit: self.submit,
                })
                .unwrap();
        } else if self.submit {
            begin_envelope(session, &self.events);
        }
    }

    fn handle_rejected(&mut self, _session: &mut SmtpSession<'_>, reply: &SmtpReply) {
        self.events.emit(format!("ehlo-rejected {}", reply.code));
    }
}

struct TlsHandler {
    events: Events,
    submit: bool,
}

impl StartTlsHandler for TlsHandler {
    fn handle_tls_established(&mut self, session: &mut SmtpSession<'_>, info: &TlsInfo) {
        self.events.emit(format!(
            "tls {}",
            info.protocol.as_deref().unwrap_or("unknown")
        ));
        let submit = self.submit;
        session
            .ehlo(
                CLIENT_HOST,
                PostTlsEhlo {
                    events: self.events.clone(),
                    submit,
                },
            )
            .unwrap();
    }

    fn handle_rejected(&mut self, _session: &mut SmtpSession<'_>, reply: &SmtpReply) {
        self.events.emit(format!("starttls-rejected {}", reply.code));
    }
}

struct PostTlsEhlo {
    events: Events,
    submit: bool,
}

impl EhloHandler for PostTlsEhlo {
    fn handle_capabilities(
        &mut self,
        session: &mut SmtpSession<'_>,
        capabilities: &Capabilities,
        _reply: &SmtpReply,
    ) {
        self.events
            .emit(format!("capabilities2 auth={}", capabilities.auth.join(",")));
        session
            .auth(
                Box::new(Plain::new("", "alice", "secret")),
                Authed {
                    events: self.events.clone(),
                    submit: self.submit,
                },
            )
            .unwrap();
    }

    fn handle_rejected(&mut self, _session: &mut SmtpSession<'_>, reply: &SmtpReply) {
        self.events.emit(format!("ehlo-rejected {}", reply.code));
    }
}

struct Authed {
    events: Events,
    submit: bool,
}

impl AuthHandler for Authed {
    fn handle_authenticated(&mut self, session: &mut SmtpSession<'_>, _reply: &SmtpReply) {
        self.events.emit("authenticated");
        if self.submit {
            begin_envelope(session, &self.events);
        }
    }

    fn handle_rejected(&mut self, _session: &mut SmtpSession<'_>, reply: &SmtpReply) {
        self.events.emit(format!("auth-rejected {}", reply.code));
    }

    fn handle_temporary_failure(&mut self, _session: &mut SmtpSession<'_>, reply: &SmtpReply) {
        self.events.emit(format!("auth-temp {}", reply.code));
    }
}

fn begin_envelope(session: &mut SmtpSession<'_>, events: &Events) {
    let params = MailParams {
        size: Some(7),
        ..Default::default()
    };
    session
        .mail_from(
            "a@x",
            &params,
            Sender {
                events: events.clone(),
            },
        )
        .unwrap();
}

struct Sender {
    events: Events,
}

impl MailFromHandler for Sender {
    fn handle_sender_accepted(&mut self, session: &mut SmtpSession<'_>, _reply: &SmtpReply) {
        self.events.emit("sender-accepted");
        session
            .rcpt_to(
                "b@y",
                Recipient {
                    events: self.events.clone(),
                },
            )
            .unwrap();
    }

    fn handle_sender_rejected(&mut self, _session: &mut SmtpSession<'_>, reply: &SmtpReply) {
        self.events.emit(format!("sender-rejected {}", reply.code));
    }

    fn handle_temporary_failure(&mut self, _session: &mut SmtpSession<'_>, reply: &SmtpReply) {
        self.events.emit(format!("sender-temp {}", reply.code));
    }
}

struct Recipient {
    events: Events,
}

impl RcptToHandler for Recipient {
    fn handle_recipient_accepted(
        &mut self,
        session: &mut SmtpSession<'_>,
        recipient: &str,
        _reply: &SmtpReply,
    ) {
        self.events.emit(format!("recipient-accepted {}", recipient));
        session
            .data(Body {
                events: self.events.clone(),
            })
            .unwrap();
    }

    fn handle_recipient_rejected(
        &mut self,
        session: &mut SmtpSession<'_>,
        recipient: &str,
        reply: &SmtpReply,
    ) {
        self.events
            .emit(format!("recipient-rejected {} {}", recipient, reply.code));
        session
            .rset(Quitter {
                events: self.events.clone(),
                quit_after: true,
            })
            .unwrap();
    }

    fn handle_temporary_failure(
        &mut self,
        _session: &mut SmtpSession<'_>,
        recipient: &str,
        reply: &SmtpReply,
    ) {
        self.events
            .emit(format!("recipient-temp {} {}", recipient, reply.code));
    }
}

struct Body {
    events: Events,
}

impl DataHandler for Body {
    fn handle_ready(&mut self, session: &mut SmtpSession<'_>) {
        self.events.emit("data-ready");
        session.write_body(b"Hello!\r\n").unwrap();
        session
            .end_message(Finished {
                events: self.events.clone(),
            })
            .unwrap();
    }

    fn handle_rejected(&mut self, _session: &mut SmtpSession<'_>, reply: &SmtpReply) {
        self.events.emit(format!("data-rejected {}", reply.code));
    }

    fn handle_temporary_failure(&mut self, _session: &mut SmtpSession<'_>, reply: &SmtpReply) {
        self.events.emit(format!("data-temp {}", reply.code));
    }
}

struct Finished {
    events: Events,
}

impl MessageHandler for Finished {
    fn handle_message_accepted(
        &mut self,
        session: &mut SmtpSession<'_>,
        queue_id: Option<&str>,
        _reply: &SmtpReply,
    ) {
        self.events
            .emit(format!("message-accepted {}", queue_id.unwrap_or("-")));
        session
            .quit(Quitter {
                events: self.events.clone(),
                quit_after: false,
            })
            .unwrap();
    }

    fn handle_message_rejected(&mut self, _session: &mut SmtpSession<'_>, reply: &SmtpReply) {
        self.events.emit(format!("message-rejected {}", reply.code));
    }

    fn handle_temporary_failure(&mut self, _session: &mut SmtpSession<'_>, reply: &SmtpReply) {
        self.events.emit(format!("message-temp {}", reply.code));
    }
}

struct Quitter {
    events: Events,
    quit_after: bool,
}

impl ReplyHandler for Quitter {
    fn handle_reply(&mut self, session: &mut SmtpSession<'_>, reply: &SmtpReply) {
        self.events.emit(format!("reply {}", reply.code));
        if self.quit_after {
            session
                .quit(Quitter {
                    events: self.events.clone(),
                    quit_after: false,
                })
                .unwrap();
        }
    }
}

/// S1: submission with STARTTLS and AUTH PLAIN, queue id extraction.
#[test]
fn submit_with_starttls_and_plain() {
    let tls = self_signed();
    let client_config = client_tls_config(&tls.cert);
    let (port, server) = spawn_server(move |mut conn| {
        conn.send("220 smtp.example.org ESMTP");
        conn.expect(&format!("EHLO {}", CLIENT_HOST));
        conn.send("250-smtp");
        conn.send("250-STARTTLS");
        conn.send("250-AUTH PLAIN");
        conn.send("250 SIZE 10485760");
        conn.expect("STARTTLS");
        conn.send("220 Go ahead");
        let mut conn = accept_tls(conn.into_inner(), tls);
        conn.expect(&format!("EHLO {}", CLIENT_HOST));
        conn.send("250-smtp");
        conn.send("250 AUTH PLAIN");
        conn.expect("AUTH PLAIN AGFsaWNlAHNlY3JldA==");
        conn.send("235 2.7.0 Authentication successful");
        conn.expect("MAIL FROM:<a@x> SIZE=7");
        conn.send("250 OK");
        conn.expect("RCPT TO:<b@y>");
        conn.send("250 OK");
        conn.expect("DATA");
        conn.send("354 End data with <CR><LF>.<CR><LF>");
        loop {
            if conn.read_line() == "." {
                break;
            }
        }
        conn.send("250 2.0.0 Ok: queued as ABC123");
        conn.expect("QUIT");
        conn.send("221 Bye");
    });

    let reactor = Reactor::start(ReactorConfig::default().with_loops(1));
    let (events, log) = events();
    let options = SmtpClientOptions {
        tls_config: Some(client_config),
        server_name: Some("localhost".to_string()),
        ..Default::default()
    };
    let _client = smtp::connect(
        &reactor.next_loop(),
        "127.0.0.1",
        port,
        options,
        Delegate {
            events,
            submit: true,
        },
    )
    .unwrap();

    log.expect("greeting 220");
    log.expect("capabilities starttls=true size=10485760");
    assert!(log.next().starts_with("tls "));
    log.expect("capabilities2 auth=PLAIN");
    log.expect("authenticated");
    log.expect("sender-accepted");
    log.expect("recipient-accepted b@y");
    log.expect("data-ready");
    log.expect("message-accepted ABC123");
    log.expect("reply 221");
    server.join().unwrap();
    reactor.stop();
}

/// A 550 recipient surfaces through the specific callback, and RSET returns
/// the session to the ready state.
#[test]
fn recipient_rejection_and_rset() {
    let (port, server) = spawn_server(|mut conn| {
        conn.send("220 smtp.example.org ESMTP");
        conn.expect(&format!("EHLO {}", CLIENT_HOST));
        conn.send("250 smtp");
        conn.expect("MAIL FROM:<a@x> SIZE=7");
        conn.send("250 OK");
        conn.expect("RCPT TO:<b@y>");
        conn.send("550 5.1.1 No such user");
        conn.expect("RSET");
        conn.send("250 OK");
        conn.expect("QUIT");
        conn.send("221 Bye");
    });

    let reactor = Reactor::start(ReactorConfig::default().with_loops(1));
    let (events, log) = events();
    let _client = smtp::connect(
        &reactor.next_loop(),
        "127.0.0.1",
        port,
        SmtpClientOptions::default(),
        Delegate {
            events,
            submit: true,
        },
    )
    .unwrap();

    log.expect("greeting 220");
    log.expect("capabilities starttls=false size=0");
    log.expect("sender-accepted");
    log.expect("recipient-rejected b@y 550");
    log.expect("reply 250");
    log.expect("reply 221");
    server.join().unwrap();
    reactor.stop();
}

struct BdatDelegate {
    events: Events,
}

impl SmtpConnectionHandler for BdatDelegate {
    fn greeting(&mut self, session: &mut SmtpSession<'_>, _reply: &SmtpReply) {
        let events = self.events.clone();
        session.ehlo(CLIENT_HOST, BdatEhlo { events }).unwrap();
    }

    fn error(&mut self, error: Error) {
        self.events.emit(format!("error {}", error));
    }

    fn disconnected(&mut self) {
        self.events.emit("disconnected");
    }
}

struct BdatEhlo {
    events: Events,
}

impl EhloHandler for BdatEhlo {
    fn handle_capabilities(
        &mut self,
        session: &mut SmtpSession<'_>,
        capabilities: &Capabilities,
        _reply: &SmtpReply,
    ) {
        assert!(capabilities.chunking);
        session
            .mail_from(
                "a@x",
                &MailParams::default(),
                BdatSender {
                    events: self.events.clone(),
                },
            )
            .unwrap();
    }

    fn handle_rejected(&mut self, _session: &mut SmtpSession<'_>, reply: &SmtpReply) {
        self.events.emit(format!("ehlo-rejected {}", reply.code));
    }
}

struct BdatSender {
    events: Events,
}

impl MailFromHandler for BdatSender {
    fn handle_sender_accepted(&mut self, session: &mut SmtpSession<'_>, _reply: &SmtpReply) {
        session
            .rcpt_to(
                "b@y",
                BdatRecipient {
                    events: self.events.clone(),
                },
            )
            .unwrap();
    }

    fn handle_sender_rejected(&mut self, _session: &mut SmtpSession<'_>, reply: &SmtpReply) {
        self.events.emit(format!("sender-rejected {}", reply.code));
    }

    fn handle_temporary_failure(&mut self, _session: &mut SmtpSession<'_>, reply: &SmtpReply) {
        self.events.emit(format!("sender-temp {}", reply.code));
    }
}

struct BdatRecipient {
    events: Events,
}

impl RcptToHandler for BdatRecipient {
    fn handle_recipient_accepted(
        &mut self,
        session: &mut SmtpSession<'_>,
        _recipient: &str,
        _reply: &SmtpReply,
    ) {
        session
            .begin_chunked(BdatFinished {
                events: self.events.clone(),
            })
            .unwrap();
        session.send_chunk(b"Hello, ").unwrap();
        session.send_chunk(b"chunked world!\r\n").unwrap();
        session.end_chunked().unwrap();
    }

    fn handle_recipient_rejected(
        &mut self,
        _session: &mut SmtpSession<'_>,
        _recipient: &str,
        reply: &SmtpReply,
    ) {
        self.events.emit(format!("recipient-rejected {}", reply.code));
    }

    fn handle_temporary_failure(
        &mut self,
        _session: &mut SmtpSession<'_>,
        _recipient: &str,
        reply: &SmtpReply,
    ) {
        self.events.emit(format!("recipient-temp {}", reply.code));
    }
}

struct BdatFinished {
    events: Events,
}

impl MessageHandler for BdatFinished {
    fn handle_message_accepted(
        &mut self,
        session: &mut SmtpSession<'_>,
        queue_id: Option<&str>,
        _reply: &SmtpReply,
    ) {
        self.events
            .emit(format!("message-accepted {}", queue_id.unwrap_or("-")));
        session
            .quit(Quitter {
                events: self.events.clone(),
                quit_after: false,
            })
            .unwrap();
    }

    fn handle_message_rejected(&mut self, _session: &mut SmtpSession<'_>, reply: &SmtpReply) {
        self.events.emit(format!("message-rejected {}", reply.code));
    }

    fn handle_temporary_failure(&mut self, _session: &mut SmtpSession<'_>, reply: &SmtpReply) {
        self.events.emit(format!("message-temp {}", reply.code));
    }
}

/// BDAT framing: each chunk is length-prefixed, no dot stuffing, per-chunk
/// acknowledgements consumed in order.
#[test]
fn bdat_chunked_transfer() {
    let (port, server) = spawn_server(|mut conn| {
        conn.send("220 smtp.example.org ESMTP");
        conn.expect(&format!("EHLO {}", CLIENT_HOST));
        conn.send("250-smtp");
        conn.send("250 CHUNKING");
        conn.expect("MAIL FROM:<a@x>");
        conn.send("250 OK");
        conn.expect("RCPT TO:<b@y>");
        conn.send("250 OK");
        conn.expect("BDAT 7");
        assert_eq!(conn.read_exact_bytes(7), b"Hello, ");
        conn.send("250 7 octets received");
        conn.expect("BDAT 16");
        assert_eq!(conn.read_exact_bytes(16), b"chunked world!\r\n");
        conn.send("250 16 octets received");
        conn.expect("BDAT 0 LAST");
        conn.send("250 2.0.0 Ok: queued as BDAT42");
        conn.expect("QUIT");
        conn.send("221 Bye");
    });

    let reactor = Reactor::start(ReactorConfig::default().with_loops(1));
    let (events, log) = events();
    let _client = smtp::connect(
        &reactor.next_loop(),
        "127.0.0.1",
        port,
        SmtpClientOptions::default(),
        BdatDelegate { events },
    )
    .unwrap();

    log.expect("message-accepted BDAT42");
    log.expect("reply 221");
    server.join().unwrap();
    reactor.stop();
}

/// After the first failing chunk, later acknowledgements are dropped
/// silently and exactly one terminal callback reaches the message handler.
#[test]
fn bdat_error_path_delivers_single_failure() {
    let (port, server) = spawn_server(|mut conn| {
        conn.send("220 smtp.example.org ESMTP");
        conn.expect(&format!("EHLO {}", CLIENT_HOST));
        conn.send("250-smtp");
        conn.send("250 CHUNKING");
        conn.expect("MAIL FROM:<a@x>");
        conn.send("250 OK");
        conn.expect("RCPT TO:<b@y>");
        conn.send("250 OK");
        conn.expect("BDAT 7");
        let _ = conn.read_exact_bytes(7);
        conn.send("554 5.3.0 Chunk refused");
        conn.expect("BDAT 16");
        let _ = conn.read_exact_bytes(16);
        conn.send("503 5.5.1 Bad sequence");
        conn.expect("BDAT 0 LAST");
        conn.send("503 5.5.1 Bad sequence");
        conn.wait_close();
    });

    let reactor = Reactor::start(ReactorConfig::default().with_loops(1));
    let (events, log) = events();
    let client = smtp::connect(
        &reactor.next_loop(),
        "127.0.0.1",
        port,
        SmtpClientOptions::default(),
        BdatDelegate { events },
    )
    .unwrap();

    log.expect("message-rejected 554");
    log.expect_quiet(Duration::from_millis(500));
    client.close();
    server.join().unwrap();
    reactor.stop();
}
