/*
 * codec.rs
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

//! RESP2 codec. `try_parse` is incremental: it either consumes one complete
//! value from the front of the buffer or consumes nothing, so partial replies
//! simply wait for the next network read.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Error;

use super::RespValue;

/// Encode a command as an array of bulk strings.
pub fn encode_command(args: &[&[u8]]) -> Bytes {
    let mut out = BytesMut::with_capacity(
        16 + args.iter().map(|a| a.len() + 16).sum::<usize>(),
    );
    out.put_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        out.put_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.put_slice(arg);
        out.put_slice(b"\r\n");
    }
    out.freeze()
}

/// Parse one value from the front of `data`. Returns the value and the number
/// of bytes consumed, `None` when the buffer holds an incomplete value.
pub fn try_parse(data: &[u8]) -> Result<Option<(RespValue, usize)>, Error> {
    parse_at(data, 0)
}

fn parse_at(data: &[u8], pos: usize) -> Result<Option<(RespValue, usize)>, Error> {
    if pos >= data.len() {
        return Ok(None);
    }
    let prefix = data[pos];
    let Some(line_end) = find_crlf_from(data, pos + 1) else {
        return Ok(None);
    };
    let line = &data[pos + 1..line_end];
    let after_line = line_end + 2;
    match prefix {
        b'+' => Ok(Some((
            RespValue::Simple(String::from_utf8_lossy(line).into_owned()),
            after_line,
        ))),
        b'-' => Ok(Some((
            RespValue::Error(String::from_utf8_lossy(line).into_owned()),
            after_line,
        ))),
        b':' => {
            let n = parse_i64(line)?;
            Ok(Some((RespValue::Integer(n), after_line)))
        }
        b'$' => {
            let n = parse_i64(line)?;
            if n < 0 {
                return Ok(Some((RespValue::Null, after_line)));
            }
            let len = n as usize;
            if data.len() < after_line + len + 2 {
                return Ok(None);
            }
            if &data[after_line + len..after_line + len + 2] != b"\r\n" {
                return Err(Error::protocol("bulk string not CRLF-terminated"));
            }
            let payload = Bytes::copy_from_slice(&data[after_line..after_line + len]);
            Ok(Some((RespValue::Bulk(payload), after_line + len + 2)))
        }
        b'*' => {
            let n = parse_i64(line)?;
            if n < 0 {
                return Ok(Some((RespValue::Null, after_line)));
            }
            let mut items = Vec::with_capacity(n as usize);
            let mut cursor = after_line;
            for _ in 0..n {
                match parse_at(data, cursor)? {
                    Some((item, next)) => {
                        items.push(item);
                        cursor = next;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((RespValue::Array(items), cursor)))
        }
        other => Err(Error::protocol(format!(
            "unknown RESP type prefix: {:?}",
            other as char
        ))),
    }
}

fn find_crlf_from(data: &[u8], from: usize) -> Option<usize> {
    let mut i = from;
    while i + 1 < data.len() {
        if data[i] == b'\r' && data[i + 1] == b'\n' {
            return Some(i);
        }
        i += 1;
    }
    None
}

fn parse_i64(line: &[u8]) -> Result<i64, Error> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| Error::protocol("invalid RESP integer"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(mut data: &[u8]) -> Vec<RespValue> {
        let mut out = Vec::new();
        while let Some((value, consumed)) = try_parse(data).unwrap() {
            out.push(value);
            data = &data[consumed..];
        }
        assert!(data.is_empty());
        out
    }

    #[test]
    fn encodes_command_as_bulk_array() {
        let wire = encode_command(&[b"SET", b"k", b"v"]);
        assert_eq!(&wire[..], b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n");
    }

    #[test]
    fn parses_all_prefixes() {
        let values = parse_all(b"+OK\r\n-ERR boom\r\n:42\r\n$5\r\nhello\r\n");
        assert_eq!(
            values,
            vec![
                RespValue::Simple("OK".to_string()),
                RespValue::Error("ERR boom".to_string()),
                RespValue::Integer(42),
                RespValue::Bulk(Bytes::from_static(b"hello")),
            ]
        );
    }

    #[test]
    fn parses_null_bulk_and_null_array() {
        let values = parse_all(b"$-1\r\n*-1\r\n");
        assert_eq!(values, vec![RespValue::Null, RespValue::Null]);
    }

    #[test]
    fn parses_nested_array() {
        let values = parse_all(b"*2\r\n*2\r\n+a\r\n:1\r\n$1\r\nb\r\n");
        assert_eq!(
            values,
            vec![RespValue::Array(vec![
                RespValue::Array(vec![
                    RespValue::Simple("a".to_string()),
                    RespValue::Integer(1)
                ]),
                RespValue::Bulk(Bytes::from_static(b"b")),
            ])]
        );
    }

    #[test]
    fn incomplete_input_consumes_nothing() {
        assert!(try_parse(b"$5\r\nhel").unwrap().is_none());
        assert!(try_parse(b"*2\r\n+a\r\n").unwrap().is_none());
        assert!(try_parse(b"+OK\r").unwrap().is_none());
    }

    #[test]
    fn bulk_payload_may_contain_crlf() {
        let values = parse_all(b"$7\r\na\r\nb\r\nc\r\n");
        assert_eq!(values, vec![RespValue::Bulk(Bytes::from_static(b"a\r\nb\r\nc"))]);
    }

    #[test]
    fn unknown_prefix_is_a_protocol_error() {
        assert!(try_parse(b"%2\r\n").is_err());
    }
}
