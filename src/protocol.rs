//! Wire framing for the `Get` call.
//!
//! Length-prefixed binary frames with a text header line. Every request
//! carries an id chosen by the client so that many callers can share one
//! connection; responses may come back in any order.
//!
//! ```text
//! Request:  GET <id> <length>\r\n<key of exactly length bytes>
//! Response: VALUE <id> <length>\r\n<value of exactly length bytes>
//! Error:    ERROR <id> <message>\r\n
//!
//! Example:
//! Request:  GET 7 5\r\nhello
//! Response: VALUE 7 5\r\nhello
//! ```
//!
//! Special commands (line-based):
//! - `QUIT\r\n` - Close connection gracefully, answered with `OK\r\n`

use bytes::{Buf, Bytes, BytesMut};
use std::str;

/// Largest key or value accepted in a single frame.
pub const MAX_VALUE_SIZE: usize = 16 * 1024 * 1024; // 16MB

/// Longest header line we are willing to buffer while waiting for CRLF.
pub const MAX_HEADER_LEN: usize = 1024;

/// A complete frame, header and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Client request for `Get(key)`.
    Get { id: u64, key: Bytes },
    /// Successful answer to the request with the same id.
    Value { id: u64, value: Bytes },
    /// Failed answer. Id 0 is used when the request id could not be read.
    Error { id: u64, message: String },
    /// Client asks the server to close the connection.
    Quit,
    /// Server acknowledgement of `Quit`.
    Ok,
}

/// A parsed header line. Body-carrying headers report the body length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    Get { id: u64, length: usize },
    Value { id: u64, length: usize },
    Error { id: u64, message: String },
    Quit,
    Ok,
}

/// Result of parsing a header line.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseResult {
    /// Header parsed; second field is the bytes consumed by the line + CRLF.
    Complete(Header, usize),
    /// No CRLF yet.
    Incomplete,
    /// The line cannot be parsed. `skip` is the number of bytes to discard
    /// to reach the next line.
    Invalid { reason: String, skip: usize },
    /// Length field above [`MAX_VALUE_SIZE`].
    TooLarge { id: u64, length: usize },
}

/// Errors from [`decode`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// A bad header line. It has already been dropped from the buffer, so
    /// decoding can continue with the next line.
    #[error("{0}")]
    Malformed(String),
    /// The announced body is too large; framing can't be recovered.
    #[error("payload too large ({length} bytes)")]
    TooLarge { id: u64, length: usize },
}

/// Parse the header line at the start of `input`.
pub fn parse_header(input: &[u8]) -> ParseResult {
    let line_end = match find_crlf(input) {
        Some(pos) => pos,
        None if input.len() > MAX_HEADER_LEN => {
            return ParseResult::Invalid {
                reason: "header line too long".to_string(),
                skip: input.len(),
            }
        }
        None => return ParseResult::Incomplete,
    };
    let header_len = line_end + 2;

    let invalid = |reason: &str| ParseResult::Invalid {
        reason: reason.to_string(),
        skip: header_len,
    };

    let line = match str::from_utf8(&input[..line_end]) {
        Ok(s) => s,
        Err(_) => return invalid("header is not valid UTF-8"),
    };

    let mut parts = line.splitn(3, ' ');
    let verb = parts.next().unwrap_or_default();

    if verb.eq_ignore_ascii_case("QUIT") {
        return ParseResult::Complete(Header::Quit, header_len);
    }
    if verb.eq_ignore_ascii_case("OK") {
        return ParseResult::Complete(Header::Ok, header_len);
    }

    let id = match parts.next().map(str::parse::<u64>) {
        Some(Ok(id)) => id,
        _ => return invalid("invalid id"),
    };

    if verb.eq_ignore_ascii_case("ERROR") {
        let message = parts.next().unwrap_or_default().to_string();
        return ParseResult::Complete(Header::Error { id, message }, header_len);
    }

    let length = match parts.next().map(str::parse::<usize>) {
        Some(Ok(len)) => len,
        _ => return invalid("invalid length"),
    };
    if length > MAX_VALUE_SIZE {
        return ParseResult::TooLarge { id, length };
    }

    if verb.eq_ignore_ascii_case("GET") {
        ParseResult::Complete(Header::Get { id, length }, header_len)
    } else if verb.eq_ignore_ascii_case("VALUE") {
        ParseResult::Complete(Header::Value { id, length }, header_len)
    } else {
        invalid("unknown command")
    }
}

/// Decode one frame from the front of `buf`.
///
/// Returns `Ok(None)` until a whole frame (header and body) is buffered.
/// Consumed bytes are removed from `buf`; bodies are split off without
/// copying.
pub fn decode(buf: &mut BytesMut) -> Result<Option<Frame>, DecodeError> {
    match parse_header(&buf[..]) {
        ParseResult::Incomplete => Ok(None),
        ParseResult::Invalid { reason, skip } => {
            buf.advance(skip);
            Err(DecodeError::Malformed(reason))
        }
        ParseResult::TooLarge { id, length } => Err(DecodeError::TooLarge { id, length }),
        ParseResult::Complete(header, header_len) => {
            let body_len = match header {
                Header::Get { length, .. } | Header::Value { length, .. } => length,
                _ => 0,
            };
            if buf.len() < header_len + body_len {
                buf.reserve(header_len + body_len - buf.len());
                return Ok(None);
            }

            buf.advance(header_len);
            let frame = match header {
                Header::Get { id, length } => Frame::Get {
                    id,
                    key: buf.split_to(length).freeze(),
                },
                Header::Value { id, length } => Frame::Value {
                    id,
                    value: buf.split_to(length).freeze(),
                },
                Header::Error { id, message } => Frame::Error { id, message },
                Header::Quit => Frame::Quit,
                Header::Ok => Frame::Ok,
            };
            Ok(Some(frame))
        }
    }
}

/// Append the wire form of `frame` to `dst`.
pub fn encode(frame: &Frame, dst: &mut BytesMut) {
    match frame {
        Frame::Get { id, key } => {
            let header = format!("GET {id} {}\r\n", key.len());
            dst.reserve(header.len() + key.len());
            dst.extend_from_slice(header.as_bytes());
            dst.extend_from_slice(key);
        }
        Frame::Value { id, value } => {
            let header = format!("VALUE {id} {}\r\n", value.len());
            dst.reserve(header.len() + value.len());
            dst.extend_from_slice(header.as_bytes());
            dst.extend_from_slice(value);
        }
        Frame::Error { id, message } => {
            // Message must stay on one line
            let message = message.replace(['\r', '\n'], " ");
            dst.extend_from_slice(format!("ERROR {id} {message}\r\n").as_bytes());
        }
        Frame::Quit => dst.extend_from_slice(b"QUIT\r\n"),
        Frame::Ok => dst.extend_from_slice(b"OK\r\n"),
    }
}

/// Find \r\n in buffer, returning the position of \r.
fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\r\n")
}
