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

//! IMAP4rev1 client (RFC 3501): tagged command correlation, untagged response
//! routing, literal streaming, STARTTLS, SASL, IDLE, APPEND.
//!
//! Commands are strictly sequential: one tag is active at a time and its
//! completion restores the base state (authenticated or selected) captured
//! when the command was sent. Unsolicited server data is routed to the IDLE
//! handler when idling, otherwise to the connection's mailbox-event listener.

mod client;
mod tags;

pub use client::{connect, ImapClient, ImapClientHandle, ImapClientOptions, ImapSession};
pub use tags::TagGenerator;

use crate::error::Error;
use crate::net::TlsInfo;

/// Completion status of a tagged reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    No,
    Bad,
}

/// Bracketed response code on a status line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseCode {
    Alert,
    Capability(Vec<String>),
    PermanentFlags(Vec<String>),
    ReadOnly,
    ReadWrite,
    TryCreate,
    UidNext(u32),
    UidValidity(u32),
    Unseen(u32),
    AppendUid { uid_validity: u32, uid: u32 },
    Other(String),
}

/// Tagged completion reply.
#[derive(Debug, Clone)]
pub struct ImapReply {
    pub status: Status,
    pub code: Option<ResponseCode>,
    pub text: String,
}

impl ImapReply {
    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

/// Greeting flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GreetingKind {
    Ok,
    Preauth,
    Bye,
}

#[derive(Debug, Clone)]
pub struct ImapGreeting {
    pub kind: GreetingKind,
    pub text: String,
    /// Capabilities embedded in a `[CAPABILITY ...]` code, when present.
    pub capabilities: Option<Vec<String>>,
}

/// State of the selected mailbox, accumulated from untagged SELECT data.
#[derive(Debug, Clone, Default)]
pub struct MailboxInfo {
    pub exists: u32,
    pub recent: u32,
    pub flags: Vec<String>,
    pub permanent_flags: Vec<String>,
    pub uid_validity: Option<u32>,
    pub uid_next: Option<u32>,
    pub unseen: Option<u32>,
    pub read_only: bool,
}

/// One `* LIST` (or `* LSUB`) entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub attributes: Vec<String>,
    pub delimiter: Option<char>,
    pub mailbox: String,
}

/// Unsolicited mailbox update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailboxEvent {
    Exists(u32),
    Recent(u32),
    Expunge(u32),
    Flags { message: u32, flags: Vec<String> },
}

/// Parsed non-literal FETCH data item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchItem {
    Flags(Vec<String>),
    Uid(u32),
    Size(u32),
    InternalDate(String),
    /// Anything the client does not model structurally, verbatim.
    Other(String),
}

/// Connection-level delegate.
pub trait ImapConnectionHandler: Send + 'static {
    /// Server greeting received; the session starts in the not-authenticated
    /// state (or authenticated, for PREAUTH).
    fn greeting(&mut self, session: &mut ImapSession<'_>, greeting: &ImapGreeting);

    /// Unsolicited mailbox update outside IDLE.
    fn mailbox_event(&mut self, event: &MailboxEvent) {
        let _ = event;
    }

    /// Untagged BYE outside LOGOUT; the server is about to close.
    fn bye(&mut self, text: &str) {
        let _ = text;
    }

    /// Transport or protocol failure; the connection closes after this.
    fn error(&mut self, error: Error);

    /// Peer closed the stream.
    fn disconnected(&mut self) {}
}

/// Generic tagged-completion handler (NOOP, STORE, EXPUNGE, CLOSE, ...).
pub trait CommandHandler: Send + 'static {
    fn handle_complete(&mut self, session: &mut ImapSession<'_>, reply: &ImapReply);
}

/// Reply handler for LOGIN and AUTHENTICATE.
pub trait LoginHandler: Send + 'static {
    fn handle_authenticated(&mut self, session: &mut ImapSession<'_>, reply: &ImapReply);

    fn handle_rejected(&mut self, session: &mut ImapSession<'_>, reply: &ImapReply);
}

/// Reply handler for STARTTLS.
pub trait StartTlsHandler: Send + 'static {
    /// Handshake complete; capabilities were cleared, re-issue CAPABILITY.
    fn handle_tls_established(&mut self, session: &mut ImapSession<'_>, info: &TlsInfo);

    fn handle_rejected(&mut self, session: &mut ImapSession<'_>, reply: &ImapReply);
}

/// Reply handler for SELECT and EXAMINE.
pub trait SelectHandler: Send + 'static {
    fn handle_selected(
        &mut self,
        session: &mut ImapSession<'_>,
        mailbox: &MailboxInfo,
        reply: &ImapReply,
    );

    fn handle_failure(&mut self, session: &mut ImapSession<'_>, reply: &ImapReply);
}

/// Reply handler for LIST / LSUB.
pub trait ListHandler: Send + 'static {
    /// One entry, as it arrives.
    fn handle_entry(&mut self, entry: &ListEntry) {
        let _ = entry;
    }

    fn handle_complete(&mut self, session: &mut ImapSession<'_>, reply: &ImapReply);
}

/// Reply handler for STATUS.
pub trait StatusHandler: Send + 'static {
    fn handle_status(&mut self, mailbox: &str, items: &[(String, u32)]);

    fn handle_complete(&mut self, session: &mut ImapSession<'_>, reply: &ImapReply);
}

/// Reply handler for SEARCH / UID SEARCH.
pub trait SearchHandler: Send + 'static {
    fn handle_results(&mut self, ids: &[u32]);

    fn handle_complete(&mut self, session: &mut ImapSession<'_>, reply: &ImapReply);
}

/// Reply handler for FETCH / UID FETCH, including literal streaming.
pub trait FetchHandler: Send + 'static {
    /// A parsed, non-literal data item.
    fn handle_fetch_item(&mut self, message: u32, item: &FetchItem) {
        let _ = (message, item);
    }

    /// A `{N}` literal opens for the given body section.
    fn handle_fetch_literal_begin(&mut self, message: u32, section: &str, size: usize) {
        let _ = (message, section, size);
    }

    /// A slice of the literal payload.
    fn handle_literal_content(&mut self, message: u32, chunk: &[u8]) {
        let _ = (message, chunk);
    }

    /// Exactly `size` bytes have been delivered for the current literal.
    fn handle_fetch_literal_end(&mut self, message: u32) {
        let _ = message;
    }

    fn handle_fetch_complete(&mut self, session: &mut ImapSession<'_>, reply: &ImapReply);

    fn handle_failure(&mut self, session: &mut ImapSession<'_>, reply: &ImapReply);
}

/// Reply handler for IDLE.
pub trait IdleHandler: Send + 'static {
    /// Server acknowledged (`+ idling`).
    fn handle_idling(&mut self) {}

    /// Unsolicited event while idling.
    fn handle_event(&mut self, event: &MailboxEvent);

    /// Tagged completion after DONE (or a refusal).
    fn handle_idle_complete(&mut self, session: &mut ImapSession<'_>, reply: &ImapReply);
}

/// Reply handler for APPEND.
pub trait AppendHandler: Send + 'static {
    /// OK completion; `appended` carries APPENDUID (uidvalidity, uid) when
    /// the server provided it.
    fn handle_appended(
        &mut self,
        session: &mut ImapSession<'_>,
        appended: Option<(u32, u32)>,
        reply: &ImapReply,
    );

    fn handle_failure(&mut self, session: &mut ImapSession<'_>, reply: &ImapReply);
}

/// Quote a string argument: `\` and `"` are escaped, control characters are
/// stripped. Arguments that cannot be quoted must be sent as literals.
pub fn quote_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
            out.push(c);
        } else if !c.is_control() {
            out.push(c);
        }
    }
    out.push('"');
    out
}

/// Parse a leading `[code]` from status-line text. Returns the code and the
/// remaining human-readable text.
pub(crate) fn parse_response_code(text: &str) -> (Option<ResponseCode>, String) {
    let trimmed = text.trim_start();
    if !trimmed.starts_with('[') {
        return (None, trimmed.to_string());
    }
    let Some(end) = trimmed.find(']') else {
        return (None, trimmed.to_string());
    };
    let inner = &trimmed[1..end];
    let rest = trimmed[end + 1..].trim_start().to_string();
    let mut words = inner.split_whitespace();
    let keyword = words.next().unwrap_or("").to_uppercase();
    let code = match keyword.as_str() {
        "ALERT" => Some(ResponseCode::Alert),
        "CAPABILITY" => Some(ResponseCode::Capability(
            words.map(|w| w.to_uppercase()).collect(),
        )),
        "PERMANENTFLAGS" => {
            let list = inner
                .find('(')
                .and_then(|open| inner[open..].find(')').map(|close| &inner[open + 1..open + close]))
                .map(|s| s.split_whitespace().map(|f| f.to_string()).collect())
                .unwrap_or_default();
            Some(ResponseCode::PermanentFlags(list))
        }
        "READ-ONLY" => Some(ResponseCode::ReadOnly),
        "READ-WRITE" => Some(ResponseCode::ReadWrite),
        "TRYCREATE" => Some(ResponseCode::TryCreate),
        "UIDNEXT" => words.next().and_then(|w| w.parse().ok()).map(ResponseCode::UidNext),
        "UIDVALIDITY" => words
            .next()
            .and_then(|w| w.parse().ok())
            .map(ResponseCode::UidValidity),
        "UNSEEN" => words.next().and_then(|w| w.parse().ok()).map(ResponseCode::Unseen),
        "APPENDUID" => {
            let uid_validity = words.next().and_then(|w| w.parse().ok());
            let uid = words.next().and_then(|w| w.parse().ok());
            match (uid_validity, uid) {
                (Some(uid_validity), Some(uid)) => {
                    Some(ResponseCode::AppendUid { uid_validity, uid })
                }
                _ => Some(ResponseCode::Other(inner.to_string())),
            }
        }
        _ => Some(ResponseCode::Other(inner.to_string())),
    };
    (code, rest)
}

/// Parse `* LIST (\Attrs) "/" mailbox` data (after the LIST keyword).
pub(crate) fn parse_list_entry(rest: &str) -> Option<ListEntry> {
    let rest = rest.trim_start();
    let open = rest.find('(')?;
    let close = rest[open..].find(')')? + open;
    let attributes = rest[open + 1..close]
        .split_whitespace()
        .map(|s| s.to_string())
        .collect();
    let mut remainder = rest[close + 1..].trim_start();
    let delimiter = if remainder.starts_with("NIL") {
        remainder = remainder[3..].trim_start();
        None
    } else if remainder.starts_with('"') {
        let end = remainder[1..].find('"')? + 1;
        let delim = remainder[1..end].chars().next();
        remainder = remainder[end + 1..].trim_start();
        delim
    } else {
        None
    };
    let mailbox = if remainder.starts_with('"') {
        let end = remainder[1..].find('"')? + 1;
        remainder[1..end].to_string()
    } else {
        remainder.trim_end().to_string()
    };
    if mailbox.is_empty() {
        return None;
    }
    Some(ListEntry {
        attributes,
        delimiter,
        mailbox,
    })
}

/// List of space-separated atoms inside the first parenthesized group.
pub(crate) fn parse_paren_list(s: &str) -> Vec<String> {
    let Some(open) = s.find('(') else {
        return Vec::new();
    };
    let Some(close) = s[open..].find(')') else {
        return Vec::new();
    };
    s[open + 1..open + close]
        .split_whitespace()
        .map(|w| w.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_escapes_and_strips() {
        assert_eq!(quote_string("INBOX"), "\"INBOX\"");
        assert_eq!(quote_string("a\"b\\c"), "\"a\\\"b\\\\c\"");
        assert_eq!(quote_string("a\r\nb"), "\"ab\"");
    }

    #[test]
    fn response_code_uidvalidity() {
        let (code, rest) = parse_response_code("[UIDVALIDITY 3857529045] UIDs valid");
        assert_eq!(code, Some(ResponseCode::UidValidity(3_857_529_045)));
        assert_eq!(rest, "UIDs valid");
    }

    #[test]
    fn response_code_appenduid() {
        let (code, _) = parse_response_code("[APPENDUID 38505 3955] APPEND completed");
        assert_eq!(
            code,
            Some(ResponseCode::AppendUid {
                uid_validity: 38505,
                uid: 3955
            })
        );
    }

    #[test]
    fn response_code_capability() {
        let (code, _) = parse_response_code("[CAPABILITY IMAP4rev1 STARTTLS AUTH=PLAIN] ready");
        match code {
            Some(ResponseCode::Capability(caps)) => {
                assert!(caps.contains(&"STARTTLS".to_string()));
                assert!(caps.contains(&"AUTH=PLAIN".to_string()));
            }
            other => panic!("unexpected code: {:?}", other),
        }
    }

    #[test]
    fn list_entry_with_quoted_mailbox() {
        let entry = parse_list_entry("(\\HasNoChildren) \"/\" \"INBOX/Sent\"").unwrap();
        assert_eq!(entry.attributes, vec!["\\HasNoChildren"]);
        assert_eq!(entry.delimiter, Some('/'));
        assert_eq!(entry.mailbox, "INBOX/Sent");
    }

    #[test]
    fn list_entry_with_nil_delimiter() {
        let entry = parse_list_entry("(\\Noselect) NIL foo").unwrap();
        assert_eq!(entry.delimiter, None);
        assert_eq!(entry.mailbox, "foo");
    }
}
