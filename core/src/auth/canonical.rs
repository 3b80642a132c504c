/*
 * canonical.rs
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

//! DKIM canonicalization (RFC 6376 §3.4) and raw header extraction.
//!
//! Canonicalization operates on the raw field bytes as they appeared on the
//! wire: header hashes are computed over exact octets, so nothing here goes
//! through a structured header parser.

/// Canonicalization algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Canon {
    Simple,
    Relaxed,
}

impl Canon {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "simple" => Some(Canon::Simple),
            "relaxed" => Some(Canon::Relaxed),
            _ => None,
        }
    }
}

/// One header field as it appeared on the wire, folding included.
#[derive(Debug, Clone)]
pub struct RawHeader {
    /// Field name (without the colon), as written.
    pub name: String,
    /// Complete field bytes: name, colon, value, folded lines, final CRLF.
    pub raw: Vec<u8>,
}

impl RawHeader {
    /// Field value bytes (after the first colon), folding retained.
    pub fn value(&self) -> &[u8] {
        match self.raw.iter().position(|&b| b == b':') {
            Some(i) => &self.raw[i + 1..],
            None => &[],
        }
    }
}

/// Split a message into its raw header fields and body. The blank line
/// separating them is consumed. Tolerates bare-LF line endings on input.
pub fn split_message(raw: &[u8]) -> (Vec<RawHeader>, &[u8]) {
    let mut headers = Vec::new();
    let mut current: Option<RawHeader> = None;
    let mut pos = 0;
    while pos < raw.len() {
        let line_end = line_end_from(raw, pos);
        let line = &raw[pos..line_end];
        let content = strip_eol(line);
        if content.is_empty() {
            if let Some(h) = current.take() {
                headers.push(h);
            }
            return (headers, &raw[line_end..]);
        }
        if line[0] == b' ' || line[0] == b'\t' {
            if let Some(h) = current.as_mut() {
                h.raw.extend_from_slice(line);
            }
        } else {
            if let Some(h) = current.take() {
                headers.push(h);
            }
            let name_end = content.iter().position(|&b| b == b':').unwrap_or(content.len());
            let name = String::from_utf8_lossy(&content[..name_end])
                .trim()
                .to_string();
            current = Some(RawHeader {
                name,
                raw: line.to_vec(),
            });
        }
        pos = line_end;
    }
    if let Some(h) = current.take() {
        headers.push(h);
    }
    (headers, &raw[raw.len()..])
}

fn line_end_from(raw: &[u8], from: usize) -> usize {
    let mut i = from;
    while i < raw.len() {
        if raw[i] == b'\n' {
            return i + 1;
        }
        i += 1;
    }
    raw.len()
}

fn strip_eol(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    &line[..end]
}

fn is_wsp(b: u8) -> bool {
    b == b' ' || b == b'\t'
}

/// Canonicalize one header field. The output always ends with CRLF.
pub fn canonicalize_header(raw: &[u8], canon: Canon) -> Vec<u8> {
    match canon {
        Canon::Simple => {
            let mut out = strip_eol(raw).to_vec();
            out.extend_from_slice(b"\r\n");
            out
        }
        Canon::Relaxed => {
            let colon = raw.iter().position(|&b| b == b':').unwrap_or(raw.len());
            let name = String::from_utf8_lossy(&raw[..colon]).trim().to_lowercase();
            let value = if colon < raw.len() { &raw[colon + 1..] } else { &[][..] };
            let mut out = Vec::with_capacity(raw.len());
            out.extend_from_slice(name.as_bytes());
            out.push(b':');
            // Unfold, then collapse WSP runs to a single SP.
            let mut pending_space = false;
            let mut emitted = false;
            for &b in value {
                if b == b'\r' || b == b'\n' {
                    continue;
                }
                if is_wsp(b) {
                    pending_space = emitted;
                    continue;
                }
                if pending_space {
                    out.push(b' ');
                    pending_space = false;
                }
                out.push(b);
                emitted = true;
            }
            out.extend_from_slice(b"\r\n");
            out
        }
    }
}

/// Canonicalize a message body. Trailing empty lines are removed in both
/// algorithms; `simple` reduces an empty body to a single CRLF, `relaxed` to
/// the empty string, and `relaxed` additionally strips trailing whitespace
/// per line and collapses interior WSP runs.
pub fn canonicalize_body(body: &[u8], canon: Canon) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    let mut pos = 0;
    while pos < body.len() {
        let line_end = line_end_from(body, pos);
        let content = strip_eol(&body[pos..line_end]);
        match canon {
            Canon::Simple => out.extend_from_slice(content),
            Canon::Relaxed => {
                // WSP runs collapse to one SP; trailing WSP drops, but a
                // collapsed leading space is retained (unlike header values).
                let mut pending_space = false;
                for &b in content {
                    if is_wsp(b) {
                        pending_space = true;
                        continue;
                    }
                    if pending_space {
                        out.push(b' ');
                        pending_space = false;
                    }
                    out.push(b);
                }
            }
        }
        out.extend_from_slice(b"\r\n");
        pos = line_end;
    }
    // Remove trailing empty lines.
    while out.ends_with(b"\r\n\r\n") {
        out.truncate(out.len() - 2);
    }
    if out == b"\r\n" {
        out.clear();
    }
    if canon == Canon::Simple && out.is_empty() {
        out.extend_from_slice(b"\r\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_headers_and_body() {
        let raw = b"From: a@x\r\nSubject: hi\r\n there\r\n\r\nbody\r\n";
        let (headers, body) = split_message(raw);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0].name, "From");
        assert_eq!(headers[1].name, "Subject");
        assert_eq!(headers[1].raw, b"Subject: hi\r\n there\r\n");
        assert_eq!(body, b"body\r\n");
    }

    #[test]
    fn relaxed_header_rfc6376_example() {
        // RFC 6376 §3.4.5 example: "A: X" and folded "B : Y\t\r\n\tZ  ".
        assert_eq!(canonicalize_header(b"A: X\r\n", Canon::Relaxed), b"a:X\r\n");
        assert_eq!(
            canonicalize_header(b"B : Y\t\r\n\tZ  \r\n", Canon::Relaxed),
            b"b:Y Z\r\n"
        );
    }

    #[test]
    fn simple_header_is_verbatim() {
        assert_eq!(
            canonicalize_header(b"B : Y\t\r\n\tZ  \r\n", Canon::Simple),
            b"B : Y\t\r\n\tZ  \r\n"
        );
    }

    #[test]
    fn relaxed_body_rfc6376_example() {
        // RFC 6376 §3.4.5: " C \r\nD \t E\r\n\r\n\r\n" → " C\r\nD E\r\n".
        assert_eq!(
            canonicalize_body(b" C \r\nD \t E\r\n\r\n\r\n", Canon::Relaxed),
            b" C\r\nD E\r\n"
        );
    }

    #[test]
    fn simple_body_strips_trailing_empty_lines() {
        assert_eq!(
            canonicalize_body(b"body\r\n\r\n\r\n", Canon::Simple),
            b"body\r\n"
        );
    }

    #[test]
    fn empty_body_canonical_forms() {
        assert_eq!(canonicalize_body(b"", Canon::Simple), b"\r\n");
        assert!(canonicalize_body(b"", Canon::Relaxed).is_empty());
        assert!(canonicalize_body(b"\r\n\r\n", Canon::Relaxed).is_empty());
    }

    #[test]
    fn canonicalization_is_deterministic() {
        let msg = b"X-A: one two\t three\r\nbody line \r\n";
        let first = canonicalize_header(msg, Canon::Relaxed);
        for _ in 0..5 {
            assert_eq!(canonicalize_header(msg, Canon::Relaxed), first);
        }
    }
}
