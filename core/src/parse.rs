/*
 * parse.rs
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

//! Reusable wire parsing utilities: CRLF line extraction and counted literal
//! delivery. Both operate on a `BytesMut` accumulator and leave incomplete
//! input buffered for the next network read.

use bytes::BytesMut;

/// Callback target for [`LineParser`].
pub trait LineSink {
    /// One complete line, including its terminating CRLF.
    fn line(&mut self, line: &[u8]);

    /// Polled before each line extraction. Return false to stop parsing and
    /// leave the remaining bytes buffered (e.g. after switching into literal
    /// mode, or after requesting a close).
    fn continue_line_processing(&mut self) -> bool {
        true
    }
}

/// Extracts CRLF-terminated lines from a byte accumulator.
///
/// The parser is stateless: a partial trailing line simply stays in the buffer.
/// Each emitted line borrows the split-off bytes, so the cost is one small
/// allocation per line at most.
pub struct LineParser;

impl LineParser {
    /// Emit every complete line in `buf` to `sink`, advancing the buffer.
    pub fn parse<S: LineSink>(buf: &mut BytesMut, sink: &mut S) {
        loop {
            if !sink.continue_line_processing() {
                return;
            }
            match find_crlf(&buf[..]) {
                Some(i) => {
                    let line = buf.split_to(i + 2);
                    sink.line(&line);
                }
                None => return,
            }
        }
    }
}

/// Position of the CR of the first CRLF in `buf`, if present.
pub(crate) fn find_crlf(buf: &[u8]) -> Option<usize> {
    let mut i = 0;
    while i + 1 < buf.len() {
        if buf[i] == b'\r' && buf[i + 1] == b'\n' {
            return Some(i);
        }
        i += 1;
    }
    None
}

/// Callback target for [`LiteralTracker`].
pub trait LiteralSink {
    /// A slice of the literal payload. Slices concatenate, in order, to
    /// exactly the announced size.
    fn literal_content(&mut self, chunk: &[u8]);

    /// Fired exactly once, when the final payload byte has been delivered.
    fn literal_complete(&mut self);
}

/// Counts down a literal payload of announced size, delivering it as slices of
/// the network buffer. Re-entrant across any number of reads until complete.
pub struct LiteralTracker {
    remaining: usize,
    complete: bool,
}

impl LiteralTracker {
    pub fn new(size: usize) -> Self {
        Self {
            remaining: size,
            complete: false,
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Deliver up to `remaining` bytes from `buf`, advancing it. Returns true
    /// iff the literal is now complete.
    pub fn process<S: LiteralSink>(&mut self, buf: &mut BytesMut, sink: &mut S) -> bool {
        if self.complete {
            return true;
        }
        if self.remaining > 0 && !buf.is_empty() {
            let take = self.remaining.min(buf.len());
            let chunk = buf.split_to(take);
            self.remaining -= take;
            sink.literal_content(&chunk);
        }
        if self.remaining == 0 {
            self.complete = true;
            sink.literal_complete();
        }
        self.complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Lines {
        lines: Vec<Vec<u8>>,
        stop_after: Option<usize>,
    }

    impl LineSink for Lines {
        fn line(&mut self, line: &[u8]) {
            self.lines.push(line.to_vec());
        }

        fn continue_line_processing(&mut self) -> bool {
            match self.stop_after {
                Some(n) => self.lines.len() < n,
                None => true,
            }
        }
    }

    fn sink() -> Lines {
        Lines {
            lines: Vec::new(),
            stop_after: None,
        }
    }

    #[test]
    fn emits_complete_lines_with_crlf() {
        let mut buf = BytesMut::from(&b"one\r\ntwo\r\npartial"[..]);
        let mut s = sink();
        LineParser::parse(&mut buf, &mut s);
        assert_eq!(s.lines, vec![b"one\r\n".to_vec(), b"two\r\n".to_vec()]);
        assert_eq!(&buf[..], b"partial");
    }

    #[test]
    fn bare_cr_is_not_a_terminator() {
        let mut buf = BytesMut::from(&b"a\rb\r\n"[..]);
        let mut s = sink();
        LineParser::parse(&mut buf, &mut s);
        assert_eq!(s.lines, vec![b"a\rb\r\n".to_vec()]);
        assert!(buf.is_empty());
    }

    #[test]
    fn stops_when_sink_declines() {
        let mut buf = BytesMut::from(&b"one\r\ntwo\r\n"[..]);
        let mut s = Lines {
            lines: Vec::new(),
            stop_after: Some(1),
        };
        LineParser::parse(&mut buf, &mut s);
        assert_eq!(s.lines.len(), 1);
        assert_eq!(&buf[..], b"two\r\n");
    }

    #[test]
    fn split_crlf_across_reads() {
        let mut buf = BytesMut::from(&b"line\r"[..]);
        let mut s = sink();
        LineParser::parse(&mut buf, &mut s);
        assert!(s.lines.is_empty());
        buf.extend_from_slice(b"\nrest\r\n");
        LineParser::parse(&mut buf, &mut s);
        assert_eq!(s.lines, vec![b"line\r\n".to_vec(), b"rest\r\n".to_vec()]);
    }

    struct Literal {
        content: Vec<u8>,
        completes: usize,
    }

    impl LiteralSink for Literal {
        fn literal_content(&mut self, chunk: &[u8]) {
            self.content.extend_from_slice(chunk);
        }

        fn literal_complete(&mut self) {
            self.completes += 1;
        }
    }

    #[test]
    fn literal_spans_multiple_reads() {
        let mut tracker = LiteralTracker::new(11);
        let mut sink = Literal {
            content: Vec::new(),
            completes: 0,
        };
        let mut buf = BytesMut::from(&b"Hello"[..]);
        assert!(!tracker.process(&mut buf, &mut sink));
        let mut buf = BytesMut::from(&b" World)\r\n"[..]);
        assert!(tracker.process(&mut buf, &mut sink));
        assert_eq!(sink.content, b"Hello World");
        assert_eq!(sink.completes, 1);
        assert_eq!(&buf[..], b")\r\n");
    }

    #[test]
    fn zero_length_literal_completes_immediately() {
        let mut tracker = LiteralTracker::new(0);
        let mut sink = Literal {
            content: Vec::new(),
            completes: 0,
        };
        let mut buf = BytesMut::new();
        assert!(tracker.process(&mut buf, &mut sink));
        assert!(sink.content.is_empty());
        assert_eq!(sink.completes, 1);
    }

    #[test]
    fn complete_fires_once() {
        let mut tracker = LiteralTracker::new(3);
        let mut sink = Literal {
            content: Vec::new(),
            completes: 0,
        };
        let mut buf = BytesMut::from(&b"abcdef"[..]);
        assert!(tracker.process(&mut buf, &mut sink));
        assert!(tracker.process(&mut buf, &mut sink));
        assert_eq!(sink.content, b"abc");
        assert_eq!(sink.completes, 1);
        assert_eq!(&buf[..], b"def");
    }
}
