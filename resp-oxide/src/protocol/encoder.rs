//! Request and reply frame encoding

use bytes::{BufMut, Bytes, BytesMut};
use resp_oxide_core::value::RespValue;

const CRLF: &[u8] = b"\r\n";

/// Encodes commands (and, for tests and mock servers, reply frames) into RESP
pub struct RespEncoder;

impl RespEncoder {
    /// Encode one command as an array of bulk strings
    ///
    /// Every argument is length-prefixed, so arbitrary bytes (including
    /// `\0` and `\r\n`) pass through untouched.
    pub fn encode_command(name: &[u8], args: &[Bytes], buf: &mut BytesMut) {
        let payload: usize = args.iter().map(|arg| arg.len() + 16).sum();
        buf.reserve(name.len() + payload + 32);

        Self::put_header(b'*', 1 + args.len(), buf);
        Self::put_bulk(name, buf);
        for arg in args {
            Self::put_bulk(arg, buf);
        }
    }

    /// Encode a command into a fresh buffer
    #[must_use]
    pub fn command_bytes(name: &[u8], args: &[Bytes]) -> Bytes {
        let mut buf = BytesMut::new();
        Self::encode_command(name, args, &mut buf);
        buf.freeze()
    }

    /// Encode a reply frame using RESP3 tags where the frame needs them
    pub fn encode(value: &RespValue, buf: &mut BytesMut) {
        match value {
            RespValue::SimpleString(s) => Self::put_line(b'+', s.as_bytes(), buf),
            RespValue::Error(e) => Self::put_line(b'-', e.as_bytes(), buf),
            RespValue::Integer(i) => Self::put_line(b':', i.to_string().as_bytes(), buf),
            RespValue::Double(d) => {
                let text = if d.is_nan() {
                    "nan".to_string()
                } else if *d == f64::INFINITY {
                    "inf".to_string()
                } else if *d == f64::NEG_INFINITY {
                    "-inf".to_string()
                } else {
                    d.to_string()
                };
                Self::put_line(b',', text.as_bytes(), buf);
            }
            RespValue::Boolean(b) => Self::put_line(b'#', if *b { b"t" } else { b"f" }, buf),
            RespValue::Null => buf.put_slice(b"$-1\r\n"),
            RespValue::BulkString(data) => Self::put_bulk(data, buf),
            RespValue::Verbatim { format, data } => {
                Self::put_header(b'=', format.len() + 1 + data.len(), buf);
                buf.put_slice(format.as_bytes());
                buf.put_u8(b':');
                buf.put_slice(data);
                buf.put_slice(CRLF);
            }
            RespValue::BigNumber(n) => Self::put_line(b'(', n.as_bytes(), buf),
            RespValue::Array(items) => Self::put_aggregate(b'*', items, buf),
            RespValue::Set(items) => Self::put_aggregate(b'~', items, buf),
            RespValue::Push(items) => Self::put_aggregate(b'>', items, buf),
            RespValue::Map(pairs) => {
                Self::put_header(b'%', pairs.len(), buf);
                for (key, value) in pairs {
                    Self::encode(key, buf);
                    Self::encode(value, buf);
                }
            }
        }
    }

    /// Encode a reply frame into a fresh buffer
    #[must_use]
    pub fn to_bytes(value: &RespValue) -> Bytes {
        let mut buf = BytesMut::new();
        Self::encode(value, &mut buf);
        buf.freeze()
    }

    fn put_aggregate(tag: u8, items: &[RespValue], buf: &mut BytesMut) {
        Self::put_header(tag, items.len(), buf);
        for item in items {
            Self::encode(item, buf);
        }
    }

    fn put_header(tag: u8, len: usize, buf: &mut BytesMut) {
        buf.put_u8(tag);
        buf.put_slice(len.to_string().as_bytes());
        buf.put_slice(CRLF);
    }

    fn put_bulk(data: &[u8], buf: &mut BytesMut) {
        Self::put_header(b'$', data.len(), buf);
        buf.put_slice(data);
        buf.put_slice(CRLF);
    }

    fn put_line(tag: u8, line: &[u8], buf: &mut BytesMut) {
        buf.put_u8(tag);
        buf.put_slice(line);
        buf.put_slice(CRLF);
    }
}
