//! Incremental RESP2/RESP3 reply decoder
//!
//! The decoder keeps unfinished aggregates on an explicit stack, so a reply
//! may arrive in any number of reads and nest to any depth without recursion.
//! Complete scalar elements are consumed from the input buffer as soon as they
//! are parsed; an incomplete element is left in place until more bytes arrive.

use bytes::{Buf, Bytes, BytesMut};
use resp_oxide_core::{
    config::ProtocolVersion,
    error::{RedisError, RedisResult},
    value::RespValue,
};

/// Largest bulk payload accepted (matches the server's proto-max-bulk-len default)
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Largest element count accepted for one aggregate
const MAX_AGGREGATE_LEN: i64 = i32::MAX as i64;

/// Upper bound on capacity reserved up front for an announced aggregate
const MAX_PREALLOC: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AggregateKind {
    Array,
    Map,
    Set,
    Push,
    Attribute,
}

#[derive(Debug)]
enum Partial {
    /// `remaining` is `None` for streamed aggregates terminated by `.`
    Aggregate {
        kind: AggregateKind,
        remaining: Option<usize>,
        items: Vec<RespValue>,
    },
    /// Streamed string collecting `;` chunks
    Chunks(BytesMut),
}

enum Token {
    Value(RespValue),
    Open(AggregateKind, Option<usize>),
    StreamedString,
    Chunk(Bytes),
    End,
}

/// Resumable reply decoder for one connection
#[derive(Debug, Default)]
pub struct RespDecoder {
    version: ProtocolVersion,
    stack: Vec<Partial>,
}

impl RespDecoder {
    /// Create a decoder accepting the tag set of `version`
    #[must_use]
    pub const fn new(version: ProtocolVersion) -> Self {
        Self {
            version,
            stack: Vec::new(),
        }
    }

    /// Tag set currently accepted
    #[must_use]
    pub const fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Switch tag sets, e.g. right before a `HELLO 3` reply is read
    pub fn set_version(&mut self, version: ProtocolVersion) {
        self.version = version;
    }

    /// Whether a partially decoded frame is being held
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.stack.is_empty()
    }

    /// Forget any partial frame (after the stream is replaced)
    pub fn reset(&mut self) {
        self.stack.clear();
    }

    /// Decode the next complete top-level frame from `buf`
    ///
    /// Returns `Ok(None)` when more bytes are needed. Bytes belonging to
    /// elements that were fully parsed are consumed even when the enclosing
    /// frame is still incomplete; the next call resumes where this one
    /// stopped.
    ///
    /// # Errors
    ///
    /// Returns [`RedisError::Protocol`] on malformed input. After an error the
    /// stream can no longer be trusted and the decoder must be reset together
    /// with its transport.
    pub fn decode(&mut self, buf: &mut BytesMut) -> RedisResult<Option<RespValue>> {
        loop {
            let Some(token) = self.next_token(buf)? else {
                return Ok(None);
            };

            let completed = match token {
                Token::Value(value) => Some(value),
                Token::Open(kind, Some(0)) => finish(kind, Vec::new())?,
                Token::Open(kind, remaining) => {
                    let capacity = remaining.unwrap_or(0).min(MAX_PREALLOC);
                    self.stack.push(Partial::Aggregate {
                        kind,
                        remaining,
                        items: Vec::with_capacity(capacity),
                    });
                    None
                }
                Token::StreamedString => {
                    self.stack.push(Partial::Chunks(BytesMut::new()));
                    None
                }
                Token::Chunk(data) => {
                    let Some(Partial::Chunks(acc)) = self.stack.last_mut() else {
                        return Err(protocol("string chunk outside a streamed string"));
                    };
                    if data.is_empty() {
                        let value = RespValue::BulkString(std::mem::take(acc).freeze());
                        self.stack.pop();
                        Some(value)
                    } else {
                        acc.extend_from_slice(&data);
                        None
                    }
                }
                Token::End => match self.stack.pop() {
                    Some(Partial::Aggregate {
                        kind,
                        remaining: None,
                        items,
                    }) => finish(kind, items)?,
                    _ => return Err(protocol("end marker outside a streamed aggregate")),
                },
            };

            if let Some(value) = completed {
                if let Some(frame) = self.fold(value)? {
                    return Ok(Some(frame));
                }
            }
        }
    }

    /// Attach a finished element to its parent, closing parents that fill up
    fn fold(&mut self, mut value: RespValue) -> RedisResult<Option<RespValue>> {
        loop {
            let Some(top) = self.stack.last_mut() else {
                return Ok(Some(value));
            };
            let Partial::Aggregate {
                items, remaining, ..
            } = top
            else {
                return Err(protocol("frame nested inside a streamed string"));
            };

            items.push(value);
            match remaining {
                Some(left) => {
                    *left -= 1;
                    if *left > 0 {
                        return Ok(None);
                    }
                }
                None => return Ok(None),
            }

            match self.stack.pop() {
                Some(Partial::Aggregate { kind, items, .. }) => match finish(kind, items)? {
                    Some(done) => value = done,
                    // Attribute consumed; the attributed value follows
                    None => return Ok(None),
                },
                _ => return Err(protocol("decoder stack out of sync")),
            }
        }
    }

    fn next_token(&self, buf: &mut BytesMut) -> RedisResult<Option<Token>> {
        if buf.is_empty() {
            return Ok(None);
        }
        let Some(newline) = buf[1..].iter().position(|&b| b == b'\n').map(|p| p + 1) else {
            return Ok(None);
        };
        if newline < 2 || buf[newline - 1] != b'\r' {
            return Err(protocol("line not terminated by CRLF"));
        }
        let tag = buf[0];
        let header_len = newline + 1;

        if self.version == ProtocolVersion::Resp2 && !matches!(tag, b'+' | b'-' | b':' | b'$' | b'*')
        {
            return Err(protocol(&format!(
                "type byte {:?} is not valid on a RESP2 connection",
                tag as char
            )));
        }

        let line = &buf[1..newline - 1];
        let token = match tag {
            b'+' => Token::Value(RespValue::SimpleString(utf8(line)?.to_string())),
            b'-' => Token::Value(RespValue::Error(utf8(line)?.to_string())),
            b':' => Token::Value(parse_integer(line)?),
            b'_' => {
                if !line.is_empty() {
                    return Err(protocol("null frame carries data"));
                }
                Token::Value(RespValue::Null)
            }
            b',' => Token::Value(RespValue::Double(parse_double(line)?)),
            b'#' => match line {
                b"t" => Token::Value(RespValue::Boolean(true)),
                b"f" => Token::Value(RespValue::Boolean(false)),
                _ => return Err(protocol("invalid boolean")),
            },
            b'(' => {
                let text = utf8(line)?;
                let digits = text.strip_prefix('-').unwrap_or(text);
                if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(protocol("invalid big number"));
                }
                Token::Value(RespValue::BigNumber(text.to_string()))
            }
            b'.' => {
                if !line.is_empty() {
                    return Err(protocol("end marker carries data"));
                }
                Token::End
            }
            b'$' | b'!' | b'=' | b';' => {
                if tag == b'$' && line == b"?" {
                    buf.advance(header_len);
                    return Ok(Some(Token::StreamedString));
                }
                let len = parse_len(line)?;
                if len == -1 && tag == b'$' {
                    buf.advance(header_len);
                    return Ok(Some(Token::Value(RespValue::Null)));
                }
                if !(0..=MAX_BULK_LEN).contains(&len) {
                    return Err(protocol(&format!("invalid blob length {len}")));
                }
                let len = len as usize;
                if buf.len() < header_len + len + 2 {
                    return Ok(None);
                }
                if &buf[header_len + len..header_len + len + 2] != b"\r\n" {
                    return Err(protocol("blob not terminated by CRLF"));
                }
                buf.advance(header_len);
                let data = buf.split_to(len).freeze();
                buf.advance(2);
                return Ok(Some(match tag {
                    b'$' => Token::Value(RespValue::BulkString(data)),
                    b'!' => Token::Value(RespValue::Error(utf8(&data)?.to_string())),
                    b'=' => Token::Value(verbatim(data)?),
                    _ => Token::Chunk(data),
                }));
            }
            b'*' | b'%' | b'~' | b'>' | b'|' => {
                let kind = match tag {
                    b'*' => AggregateKind::Array,
                    b'%' => AggregateKind::Map,
                    b'~' => AggregateKind::Set,
                    b'>' => AggregateKind::Push,
                    _ => AggregateKind::Attribute,
                };
                let pairs = matches!(kind, AggregateKind::Map | AggregateKind::Attribute);
                if line == b"?" {
                    if matches!(kind, AggregateKind::Push | AggregateKind::Attribute)
                        || self.version == ProtocolVersion::Resp2
                    {
                        return Err(protocol("aggregate type cannot be streamed"));
                    }
                    Token::Open(kind, None)
                } else {
                    let len = parse_len(line)?;
                    if len == -1 && kind == AggregateKind::Array {
                        Token::Value(RespValue::Null)
                    } else if !(0..=MAX_AGGREGATE_LEN).contains(&len) {
                        return Err(protocol(&format!("invalid aggregate length {len}")));
                    } else {
                        let len = len as usize;
                        Token::Open(kind, Some(if pairs { len * 2 } else { len }))
                    }
                }
            }
            other => {
                return Err(protocol(&format!(
                    "invalid type byte {:?}",
                    other as char
                )))
            }
        };

        buf.advance(header_len);
        Ok(Some(token))
    }
}

fn finish(kind: AggregateKind, items: Vec<RespValue>) -> RedisResult<Option<RespValue>> {
    Ok(Some(match kind {
        AggregateKind::Array => RespValue::Array(items),
        AggregateKind::Set => RespValue::Set(items),
        AggregateKind::Push => RespValue::Push(items),
        AggregateKind::Map => {
            if items.len() % 2 != 0 {
                return Err(protocol("map with an odd number of elements"));
            }
            let mut pairs = Vec::with_capacity(items.len() / 2);
            let mut iter = items.into_iter();
            while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
                pairs.push((key, value));
            }
            RespValue::Map(pairs)
        }
        AggregateKind::Attribute => return Ok(None),
    }))
}

fn protocol(msg: &str) -> RedisError {
    RedisError::Protocol(msg.to_string())
}

fn utf8(bytes: &[u8]) -> RedisResult<&str> {
    std::str::from_utf8(bytes).map_err(|e| RedisError::Protocol(format!("Invalid UTF-8: {e}")))
}

fn parse_len(line: &[u8]) -> RedisResult<i64> {
    utf8(line)?
        .parse::<i64>()
        .map_err(|e| RedisError::Protocol(format!("Invalid length: {e}")))
}

fn parse_integer(line: &[u8]) -> RedisResult<RespValue> {
    let text = utf8(line)?;
    if let Ok(value) = text.parse::<i64>() {
        return Ok(RespValue::Integer(value));
    }
    let digits = text.strip_prefix('-').unwrap_or(text);
    if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
        // Out of i64 range: keep every digit
        Ok(RespValue::BigNumber(text.to_string()))
    } else {
        Err(RedisError::Protocol(format!("Invalid integer: {text}")))
    }
}

fn parse_double(line: &[u8]) -> RedisResult<f64> {
    match utf8(line)? {
        "inf" | "+inf" => Ok(f64::INFINITY),
        "-inf" => Ok(f64::NEG_INFINITY),
        "nan" | "-nan" => Ok(f64::NAN),
        text => text
            .parse::<f64>()
            .map_err(|e| RedisError::Protocol(format!("Invalid double: {e}"))),
    }
}

fn verbatim(data: Bytes) -> RedisResult<RespValue> {
    if data.len() < 4 || data[3] != b':' {
        return Err(protocol("verbatim string without a format prefix"));
    }
    let format = utf8(&data[..3])?.to_string();
    Ok(RespValue::Verbatim {
        format,
        data: data.slice(4..),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encoder::RespEncoder;

    fn decode_all(version: ProtocolVersion, input: &[u8]) -> Vec<RespValue> {
        let mut decoder = RespDecoder::new(version);
        let mut buf = BytesMut::from(input);
        let mut out = Vec::new();
        while let Some(frame) = decoder.decode(&mut buf).unwrap() {
            out.push(frame);
        }
        assert!(buf.is_empty());
        assert!(decoder.is_idle());
        out
    }

    fn decode_one(version: ProtocolVersion, input: &[u8]) -> RespValue {
        let mut frames = decode_all(version, input);
        assert_eq!(frames.len(), 1);
        frames.remove(0)
    }

    #[test]
    fn test_decode_resp2_scalars() {
        let frames = decode_all(
            ProtocolVersion::Resp2,
            b"+OK\r\n-ERR unknown\r\n:1000\r\n$6\r\nfoobar\r\n$-1\r\n*-1\r\n$0\r\n\r\n",
        );
        assert_eq!(
            frames,
            vec![
                RespValue::SimpleString("OK".into()),
                RespValue::Error("ERR unknown".into()),
                RespValue::Integer(1000),
                RespValue::from("foobar"),
                RespValue::Null,
                RespValue::Null,
                RespValue::BulkString(Bytes::new()),
            ]
        );
    }

    #[test]
    fn test_decode_nested_array() {
        let value = decode_one(
            ProtocolVersion::Resp2,
            b"*2\r\n*2\r\n:1\r\n:2\r\n*0\r\n",
        );
        assert_eq!(
            value,
            RespValue::Array(vec![
                RespValue::Array(vec![RespValue::Integer(1), RespValue::Integer(2)]),
                RespValue::Array(vec![]),
            ])
        );
    }

    #[test]
    fn test_decode_resp3_types() {
        let frames = decode_all(
            ProtocolVersion::Resp3,
            b"_\r\n,3.25\r\n,-inf\r\n#t\r\n(3492890328409238509324850943850943825024385\r\n\
              !9\r\nERR oops!\r\n=8\r\ntxt:some\r\n%1\r\n+k\r\n:1\r\n~2\r\n:1\r\n:2\r\n\
              >2\r\n+message\r\n+x\r\n",
        );
        assert_eq!(frames[0], RespValue::Null);
        assert_eq!(frames[1], RespValue::Double(3.25));
        assert_eq!(frames[2], RespValue::Double(f64::NEG_INFINITY));
        assert_eq!(frames[3], RespValue::Boolean(true));
        assert_eq!(
            frames[4],
            RespValue::BigNumber("3492890328409238509324850943850943825024385".into())
        );
        assert_eq!(frames[5], RespValue::Error("ERR oops!".into()));
        assert_eq!(
            frames[6],
            RespValue::Verbatim {
                format: "txt".into(),
                data: Bytes::from_static(b"some"),
            }
        );
        assert_eq!(
            frames[7],
            RespValue::Map(vec![(
                RespValue::SimpleString("k".into()),
                RespValue::Integer(1)
            )])
        );
        assert_eq!(
            frames[8],
            RespValue::Set(vec![RespValue::Integer(1), RespValue::Integer(2)])
        );
        assert!(frames[9].is_push());
    }

    #[test]
    fn test_integer_overflow_becomes_big_number() {
        assert_eq!(
            decode_one(ProtocolVersion::Resp2, b":92233720368547758070\r\n"),
            RespValue::BigNumber("92233720368547758070".into())
        );
    }

    #[test]
    fn test_streamed_string_and_aggregates() {
        let frames = decode_all(
            ProtocolVersion::Resp3,
            b"$?\r\n;4\r\nHell\r\n;5\r\no wor\r\n;2\r\nld\r\n;0\r\n\
              *?\r\n:1\r\n$?\r\n;1\r\na\r\n;0\r\n.\r\n%?\r\n+a\r\n:1\r\n.\r\n",
        );
        assert_eq!(frames[0], RespValue::from("Hello world"));
        assert_eq!(
            frames[1],
            RespValue::Array(vec![RespValue::Integer(1), RespValue::from("a")])
        );
        assert_eq!(
            frames[2],
            RespValue::Map(vec![(
                RespValue::SimpleString("a".into()),
                RespValue::Integer(1)
            )])
        );
    }

    #[test]
    fn test_attributes_are_dropped() {
        let frames = decode_all(
            ProtocolVersion::Resp3,
            b"|1\r\n+ttl\r\n:3600\r\n$3\r\nval\r\n*2\r\n|1\r\n+a\r\n+b\r\n:1\r\n:2\r\n",
        );
        assert_eq!(
            frames,
            vec![
                RespValue::from("val"),
                RespValue::Array(vec![RespValue::Integer(1), RespValue::Integer(2)]),
            ]
        );
    }

    #[test]
    fn test_resp3_tag_rejected_on_resp2() {
        let mut decoder = RespDecoder::new(ProtocolVersion::Resp2);
        let mut buf = BytesMut::from(&b"%1\r\n+a\r\n+b\r\n"[..]);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(RedisError::Protocol(_))
        ));
    }

    #[test]
    fn test_malformed_input_is_protocol_error() {
        for input in [&b"?what\r\n"[..], b":12a\r\n", b"$3\r\nabcd\r\n", b"+OK\n"] {
            let mut decoder = RespDecoder::new(ProtocolVersion::Resp3);
            let mut buf = BytesMut::from(input);
            assert!(
                matches!(decoder.decode(&mut buf), Err(RedisError::Protocol(_))),
                "{input:?}"
            );
        }
    }

    #[test]
    fn test_oversized_aggregate_length_is_rejected() {
        for input in [
            &b"%9223372036854775807\r\n"[..],
            b"*9223372036854775807\r\n",
            b"~4294967296\r\n",
        ] {
            let mut decoder = RespDecoder::new(ProtocolVersion::Resp3);
            let mut buf = BytesMut::from(input);
            assert!(
                matches!(decoder.decode(&mut buf), Err(RedisError::Protocol(_))),
                "{input:?}"
            );
        }
    }

    #[test]
    fn test_incomplete_bulk_is_not_consumed() {
        let mut decoder = RespDecoder::new(ProtocolVersion::Resp2);
        let mut buf = BytesMut::from(&b"$6\r\nfoo"[..]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        assert_eq!(&buf[..], b"$6\r\nfoo");
        buf.extend_from_slice(b"bar\r\n");
        assert_eq!(
            decoder.decode(&mut buf).unwrap(),
            Some(RespValue::from("foobar"))
        );
    }

    #[test]
    fn test_split_reads_match_whole_stream() {
        let stream: &[u8] = b"*3\r\n$3\r\nfoo\r\n*2\r\n:1\r\n_\r\n%1\r\n+k\r\n~1\r\n#f\r\n\
            +OK\r\n$?\r\n;3\r\nabc\r\n;0\r\n>3\r\n+message\r\n+ch\r\n$2\r\nhi\r\n\
            *?\r\n,1.5\r\n.\r\n|1\r\n+a\r\n+b\r\n:7\r\n-ERR x\r\n";
        let whole = decode_all(ProtocolVersion::Resp3, stream);
        assert_eq!(whole.len(), 7);

        for chunk_size in 1..stream.len() {
            let mut decoder = RespDecoder::new(ProtocolVersion::Resp3);
            let mut buf = BytesMut::new();
            let mut frames = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                buf.extend_from_slice(chunk);
                while let Some(frame) = decoder.decode(&mut buf).unwrap() {
                    frames.push(frame);
                }
            }
            assert_eq!(frames, whole, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn test_deep_nesting_does_not_recurse() {
        const DEPTH: usize = 2_000;
        let mut input = Vec::new();
        for _ in 0..DEPTH {
            input.extend_from_slice(b"*1\r\n");
        }
        input.extend_from_slice(b":1\r\n");

        let mut value = decode_one(ProtocolVersion::Resp2, &input);
        let mut depth = 0;
        while let RespValue::Array(mut items) = value {
            depth += 1;
            value = items.pop().unwrap();
        }
        assert_eq!(depth, DEPTH);
        assert_eq!(value, RespValue::Integer(1));
    }

    #[test]
    fn test_command_round_trip() {
        let args = vec![
            Bytes::from_static(b"key"),
            Bytes::new(),
            Bytes::from_static(b"\0\r\n\xff"),
        ];
        let encoded = RespEncoder::command_bytes(b"SET", &args);
        let decoded = decode_one(ProtocolVersion::Resp2, &encoded);
        let items = decoded.as_array().unwrap();
        assert_eq!(items[0], RespValue::from("SET"));
        let decoded_args: Vec<Bytes> = items[1..]
            .iter()
            .map(|item| item.as_bytes().unwrap())
            .collect();
        assert_eq!(decoded_args, args);
    }
}
