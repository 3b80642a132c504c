/*
 * imap_session.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * Integration tests for the IMAP client: login, SELECT, FETCH with literal
 * streaming, IDLE with unsolicited events, APPEND with APPENDUID, LIST, and
 * tag correlation.
 */

mod support;

use bytes::Bytes;
use staffetta_core::protocol::imap::{
    self, AppendHandler, CommandHandler, FetchHandler, IdleHandler, ImapClientOptions,
    ImapConnectionHandler, ImapGreeting, ImapReply, ImapSession, ListEntry, ListHandler,
    LoginHandler, MailboxEvent, MailboxInfo, SelectHandler,
};
use staffetta_core::{Error, Reactor, ReactorConfig};
use support::{events, spawn_server, Events};

struct Delegate {
    events: Events,
    mailbox: &'static str,
}

impl ImapConnectionHandler for Delegate {
    fn greeting(&mut self, session: &mut ImapSession<'_>, greeting: &ImapGreeting) {
        self.events.emit(format!("greeting {:?}", greeting.kind));
        session
            .login(
                "alice",
                "secret",
                LoggedIn {
                    events: self.events.clone(),
                    mailbox: self.mailbox,
                },
            )
            .unwrap();
    }

    fn mailbox_event(&mut self, event: &MailboxEvent) {
        self.events.emit(format!("mailbox-event {:?}", event));
    }

    fn bye(&mut self, _text: &str) {
        self.events.emit("bye");
    }

    fn error(&mut self, error: Error) {
        self.events.emit(format!("error {}", error));
    }

    fn disconnected(&mut self) {
        self.events.emit("disconnected");
    }
}

struct LoggedIn {
    events: Events,
    mailbox: &'static str,
}

impl LoginHandler for LoggedIn {
    fn handle_authenticated(&mut self, session: &mut ImapSession<'_>, _reply: &ImapReply) {
        self.events.emit("authenticated");
        session
            .select(
                self.mailbox,
                Selected {
                    events: self.events.clone(),
                },
            )
            .unwrap();
    }

    fn handle_rejected(&mut self, _session: &mut ImapSession<'_>, reply: &ImapReply) {
        self.events.emit(format!("login-rejected {:?}", reply.status));
    }
}

struct Selected {
    events: Events,
}

impl SelectHandler for Selected {
    fn handle_selected(
        &mut self,
        _session: &mut ImapSession<'_>,
        mailbox: &MailboxInfo,
        _reply: &ImapReply,
    ) {
        self.events.emit(format!(
            "selected exists={} uidvalidity={}",
            mailbox.exists,
            mailbox.uid_validity.unwrap_or(0)
        ));
    }

    fn handle_failure(&mut self, _session: &mut ImapSession<'_>, reply: &ImapReply) {
        self.events.emit(format!("select-failed {:?}", reply.status));
    }
}

struct Fetcher {
    events: Events,
    content: Vec<u8>,
}

impl FetchHandler for Fetcher {
    fn handle_fetch_literal_begin(&mut self, message: u32, section: &str, size: usize) {
        self.events
            .emit(format!("literal-begin {} {:?} {}", message, section, size));
    }

    fn handle_literal_content(&mut self, _message: u32, chunk: &[u8]) {
        self.content.extend_from_slice(chunk);
    }

    fn handle_fetch_literal_end(&mut self, message: u32) {
        self.events.emit(format!(
            "literal-end {} content={:?}",
            message,
            String::from_utf8_lossy(&self.content)
        ));
    }

    fn handle_fetch_complete(&mut self, _session: &mut ImapSession<'_>, _reply: &ImapReply) {
        self.events.emit("fetch-complete");
    }

    fn handle_failure(&mut self, _session: &mut ImapSession<'_>, reply: &ImapReply) {
        self.events.emit(format!("fetch-failed {:?}", reply.status));
    }
}

/// S2: FETCH with a body literal, streamed to the handler.
#[test]
fn fetch_with_literal() {
    let (port, server) = spawn_server(|mut conn| {
        conn.send("* OK IMAP4rev1 ready");
        let tag = conn.expect_tagged("LOGIN ");
        conn.send(&format!("{} OK LOGIN completed", tag));
        let tag = conn.expect_tagged("SELECT ");
        conn.send("* 3 EXISTS");
        conn.send("* 0 RECENT");
        conn.send("* OK [UIDVALIDITY 3857529045] UIDs valid");
        conn.send(&format!("{} OK [READ-WRITE] SELECT completed", tag));
        let tag = conn.expect_tagged("FETCH 1 (BODY[1])");
        conn.send_raw(b"* 1 FETCH (BODY[1] {11}\r\nHello World)\r\n");
        conn.send(&format!("{} OK FETCH completed", tag));
        conn.wait_close();
    });

    let reactor = Reactor::start(ReactorConfig::default().with_loops(1));
    let (events, log) = events();
    let client = imap::connect(
        &reactor.next_loop(),
        "127.0.0.1",
        port,
        ImapClientOptions::default(),
        Delegate {
            events: events.clone(),
            mailbox: "INBOX",
        },
    )
    .unwrap();

    log.expect("greeting Ok");
    log.expect("authenticated");
    log.expect("selected exists=3 uidvalidity=3857529045");
    let fetch_events = events.clone();
    client
        .run(move |session| {
            session
                .fetch(
                    "1",
                    "(BODY[1])",
                    Fetcher {
                        events: fetch_events,
                        content: Vec::new(),
                    },
                )
                .unwrap();
        })
        .unwrap();
    log.expect("literal-begin 1 \"1\" 11");
    log.expect("literal-end 1 content=\"Hello World\"");
    log.expect("fetch-complete");
    client.close();
    server.join().unwrap();
    reactor.stop();
}

/// Literal payload split across reads and followed by another item.
#[test]
fn fetch_literal_across_chunks() {
    let (port, server) = spawn_server(|mut conn| {
        conn.send("* OK ready");
        let tag = conn.expect_tagged("LOGIN ");
        conn.send(&format!("{} OK", tag));
        let tag = conn.expect_tagged("SELECT ");
        conn.send("* 1 EXISTS");
        conn.send(&format!("{} OK SELECT done", tag));
        let tag = conn.expect_tagged("FETCH ");
        conn.send_raw(b"* 1 FETCH (BODY[] {10}\r\nfirst");
        std::thread::sleep(std::time::Duration::from_millis(50));
        conn.send_raw(b"12345 UID 77)\r\n");
        conn.send(&format!("{} OK done", tag));
        conn.wait_close();
    });

    let reactor = Reactor::start(ReactorConfig::default().with_loops(1));
    let (events, log) = events();
    let client = imap::connect(
        &reactor.next_loop(),
        "127.0.0.1",
        port,
        ImapClientOptions::default(),
        Delegate {
            events: events.clone(),
            mailbox: "INBOX",
        },
    )
    .unwrap();
    log.expect("greeting Ok");
    log.expect("authenticated");
    log.expect("selected exists=1 uidvalidity=0");
    let fetch_events = events.clone();
    client
        .run(move |session| {
            session
                .fetch(
                    "1",
                    "(BODY[])",
                    Fetcher {
                        events: fetch_events,
                        content: Vec::new(),
                    },
                )
                .unwrap();
        })
        .unwrap();
    log.expect("literal-begin 1 \"\" 10");
    log.expect("literal-end 1 content=\"first12345\"");
    log.expect("fetch-complete");
    client.close();
    server.join().unwrap();
    reactor.stop();
}

struct Idler {
    events: Events,
}

impl IdleHandler for Idler {
    fn handle_idling(&mut self) {
        self.events.emit("idling");
    }

    fn handle_event(&mut self, event: &MailboxEvent) {
        self.events.emit(format!("idle-event {:?}", event));
    }

    fn handle_idle_complete(&mut self, _session: &mut ImapSession<'_>, reply: &ImapReply) {
        self.events.emit(format!("idle-complete {:?}", reply.status));
    }
}

/// S3: IDLE with an unsolicited EXISTS, terminated by DONE.
#[test]
fn idle_with_unsolicited_exists() {
    let (port, server) = spawn_server(|mut conn| {
        conn.send("* OK ready");
        let tag = conn.expect_tagged("LOGIN ");
        conn.send(&format!("{} OK", tag));
        let tag = conn.expect_tagged("SELECT ");
        conn.send("* 2 EXISTS");
        conn.send(&format!("{} OK SELECT done", tag));
        let tag = conn.expect_tagged("IDLE");
        conn.send("+ idling");
        conn.send("* 5 EXISTS");
        conn.expect("DONE");
        conn.send(&format!("{} OK IDLE terminated", tag));
        conn.wait_close();
    });

    let reactor = Reactor::start(ReactorConfig::default().with_loops(1));
    let (events, log) = events();
    let client = imap::connect(
        &reactor.next_loop(),
        "127.0.0.1",
        port,
        ImapClientOptions::default(),
        Delegate {
            events: events.clone(),
            mailbox: "INBOX",
        },
    )
    .unwrap();
    log.expect("greeting Ok");
    log.expect("authenticated");
    log.expect("selected exists=2 uidvalidity=0");
    let idle_events = events.clone();
    client
        .run(move |session| {
            session.idle(Idler { events: idle_events }).unwrap();
        })
        .unwrap();
    log.expect("idling");
    log.expect("idle-event Exists(5)");
    client
        .run(|session| {
            session.idle_done().unwrap();
        })
        .unwrap();
    log.expect("idle-complete Ok");
    client.close();
    server.join().unwrap();
    reactor.stop();
}

struct Appender {
    events: Events,
}

impl AppendHandler for Appender {
    fn handle_appended(
        &mut self,
        _session: &mut ImapSession<'_>,
        appended: Option<(u32, u32)>,
        _reply: &ImapReply,
    ) {
        self.events.emit(format!("appended {:?}", appended));
    }

    fn handle_failure(&mut self, _session: &mut ImapSession<'_>, reply: &ImapReply) {
        self.events.emit(format!("append-failed {:?}", reply.status));
    }
}

/// APPEND: synchronizing literal, body streamed after continuation,
/// APPENDUID parsed from the completion.
#[test]
fn append_with_appenduid() {
    const MESSAGE: &[u8] = b"Subject: t\r\n\r\nbody\r\n";
    let (port, server) = spawn_server(|mut conn| {
        conn.send("* OK ready");
        let tag = conn.expect_tagged("LOGIN ");
        conn.send(&format!("{} OK", tag));
        let line_tag = conn.expect_tagged("APPEND \"Saved\" (\\Seen) {20}");
        conn.send("+ Ready for literal data");
        let body = conn.read_exact_bytes(MESSAGE.len());
        assert_eq!(body, MESSAGE);
        conn.expect(""); // trailing CRLF after the literal
        conn.send(&format!(
            "{} OK [APPENDUID 38505 3955] APPEND completed",
            line_tag
        ));
        conn.wait_close();
    });

    let reactor = Reactor::start(ReactorConfig::default().with_loops(1));
    let (events, log) = events();
    let client = imap::connect(
        &reactor.next_loop(),
        "127.0.0.1",
        port,
        ImapClientOptions::default(),
        AppendDelegate {
            events: events.clone(),
        },
    )
    .unwrap();
    log.expect("greeting Ok");
    log.expect("authenticated");
    let append_events = events.clone();
    client
        .run(move |session| {
            session
                .append(
                    "Saved",
                    &["\\Seen"],
                    None,
                    Bytes::from_static(MESSAGE),
                    Appender {
                        events: append_events,
                    },
                )
                .unwrap();
        })
        .unwrap();
    log.expect("appended Some((38505, 3955))");
    client.close();
    server.join().unwrap();
    reactor.stop();
}

struct AppendDelegate {
    events: Events,
}

impl ImapConnectionHandler for AppendDelegate {
    fn greeting(&mut self, session: &mut ImapSession<'_>, _greeting: &ImapGreeting) {
        self.events.emit("greeting Ok");
        session
            .login(
                "alice",
                "secret",
                JustAuthenticated {
                    events: self.events.clone(),
                },
            )
            .unwrap();
    }

    fn error(&mut self, error: Error) {
        self.events.emit(format!("error {}", error));
    }
}

struct JustAuthenticated {
    events: Events,
}

impl LoginHandler for JustAuthenticated {
    fn handle_authenticated(&mut self, _session: &mut ImapSession<'_>, _reply: &ImapReply) {
        self.events.emit("authenticated");
    }

    fn handle_rejected(&mut self, _session: &mut ImapSession<'_>, reply: &ImapReply) {
        self.events.emit(format!("login-rejected {:?}", reply.status));
    }
}

struct Lister {
    events: Events,
}

impl ListHandler for Lister {
    fn handle_entry(&mut self, entry: &ListEntry) {
        self.events.emit(format!("entry {}", entry.mailbox));
    }

    fn handle_complete(&mut self, _session: &mut ImapSession<'_>, _reply: &ImapReply) {
        self.events.emit("list-complete");
    }
}

/// LIST entries stream as they arrive, including a folded literal mailbox
/// name, followed by the tagged completion.
#[test]
fn list_with_literal_mailbox_name() {
    let (port, server) = spawn_server(|mut conn| {
        conn.send("* OK ready");
        let tag = conn.expect_tagged("LOGIN ");
        conn.send(&format!("{} OK", tag));
        let tag = conn.expect_tagged("LIST \"\" \"*\"");
        conn.send("* LIST (\\HasNoChildren) \"/\" \"INBOX\"");
        conn.send_raw(b"* LIST (\\HasNoChildren) \"/\" {9}\r\nOdd \"Box\"\r\n");
        conn.send(&format!("{} OK LIST completed", tag));
        conn.wait_close();
    });

    let reactor = Reactor::start(ReactorConfig::default().with_loops(1));
    let (events, log) = events();
    let client = imap::connect(
        &reactor.next_loop(),
        "127.0.0.1",
        port,
        ImapClientOptions::default(),
        AppendDelegate {
            events: events.clone(),
        },
    )
    .unwrap();
    log.expect("greeting Ok");
    log.expect("authenticated");
    let list_events = events.clone();
    client
        .run(move |session| {
            session
                .list("", "*", Lister { events: list_events })
                .unwrap();
        })
        .unwrap();
    log.expect("entry INBOX");
    log.expect("entry Odd \"Box\"");
    log.expect("list-complete");
    client.close();
    server.join().unwrap();
    reactor.stop();
}

struct Noop {
    events: Events,
}

impl CommandHandler for Noop {
    fn handle_complete(&mut self, _session: &mut ImapSession<'_>, reply: &ImapReply) {
        self.events.emit(format!("noop {:?}", reply.status));
    }
}

/// A tagged reply whose tag does not match the outstanding command is
/// ignored; the real completion still dispatches.
#[test]
fn mismatched_tag_is_ignored() {
    let (port, server) = spawn_server(|mut conn| {
        conn.send("* OK ready");
        let tag = conn.expect_tagged("LOGIN ");
        conn.send(&format!("{} OK", tag));
        let tag = conn.expect_tagged("NOOP");
        conn.send("ZZZ999 OK stale reply");
        conn.send(&format!("{} OK NOOP completed", tag));
        conn.wait_close();
    });

    let reactor = Reactor::start(ReactorConfig::default().with_loops(1));
    let (events, log) = events();
    let client = imap::connect(
        &reactor.next_loop(),
        "127.0.0.1",
        port,
        ImapClientOptions::default(),
        AppendDelegate {
            events: events.clone(),
        },
    )
    .unwrap();
    log.expect("greeting Ok");
    log.expect("authenticated");
    let noop_events = events.clone();
    client
        .run(move |session| {
            session.noop(Noop { events: noop_events }).unwrap();
        })
        .unwrap();
    log.expect("noop Ok");
    client.close();
    server.join().unwrap();
    reactor.stop();
}
