/*
 * dot_stuffer.rs
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

//! Dot stuffing for SMTP DATA (RFC 5321 §4.5.2). A `.` as the first octet
//! after a CRLF gains a second `.`, so the `CRLF.CRLF` terminator emitted by
//! `finish` stays unambiguous. Works across arbitrary chunk boundaries; the
//! only state carried between chunks is the position within the CRLF pair.

use bytes::BytesMut;

#[derive(Clone, Copy, PartialEq)]
enum State {
    /// Mid-line.
    Normal,
    /// Saw CR, LF would complete the line break.
    SawCr,
    /// Immediately after CRLF (also the start of the message).
    SawCrLf,
}

pub struct DotStuffer {
    state: State,
    emitted: bool,
}

impl Default for DotStuffer {
    fn default() -> Self {
        Self {
            state: State::SawCrLf,
            emitted: false,
        }
    }
}

impl DotStuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the stuffed form of `chunk` to `out`. Unmodified spans are
    /// copied in one extend each; only a line-leading `.` costs an extra byte.
    pub fn process(&mut self, chunk: &[u8], out: &mut BytesMut) {
        let mut start = 0;
        for (i, &b) in chunk.iter().enumerate() {
            match self.state {
                State::SawCrLf => {
                    if b == b'.' {
                        out.extend_from_slice(&chunk[start..i]);
                        out.extend_from_slice(b".");
                        start = i;
                    }
                    self.state = if b == b'\r' { State::SawCr } else { State::Normal };
                }
                State::Normal => {
                    if b == b'\r' {
                        self.state = State::SawCr;
                    }
                }
                State::SawCr => {
                    self.state = if b == b'\n' {
                        State::SawCrLf
                    } else if b == b'\r' {
                        State::SawCr
                    } else {
                        State::Normal
                    };
                }
            }
        }
        if start < chunk.len() {
            self.emitted = true;
            out.extend_from_slice(&chunk[start..]);
        }
    }

    /// Append the `CRLF.CRLF` terminator, inserting a line break first when
    /// the body did not end on one, and reset for the next message.
    pub fn finish(&mut self, out: &mut BytesMut) {
        match self.state {
            State::SawCrLf if self.emitted => out.extend_from_slice(b".\r\n"),
            State::SawCr => out.extend_from_slice(b"\n.\r\n"),
            _ => out.extend_from_slice(b"\r\n.\r\n"),
        }
        self.reset();
    }

    pub fn reset(&mut self) {
        self.state = State::SawCrLf;
        self.emitted = false;
    }
}
