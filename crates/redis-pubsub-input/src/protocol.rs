//! Redis RESP2 wire protocol: frame types, codec, and pub/sub push classification.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::types::{Error, SubscriptionEvent};

// ---------------------------------------------------------------------------
// Protocol limits
// ---------------------------------------------------------------------------

/// Largest bulk string the server is allowed to send (Redis' own limit).
pub const MAX_BULK_LEN: usize = 512 * 1024 * 1024;
/// Largest array length accepted in a single frame.
pub const MAX_ARRAY_LEN: usize = 1024 * 1024;
/// Maximum nesting depth of arrays.
pub const MAX_DEPTH: usize = 32;
/// Longest header/simple-string line accepted before a CRLF must appear.
pub const MAX_LINE_LEN: usize = 64 * 1024;

const CRLF: &[u8] = b"\r\n";

pub mod push_kind {
    pub const MESSAGE: &str = "message";
    pub const PMESSAGE: &str = "pmessage";
    pub const SUBSCRIBE: &str = "subscribe";
    pub const PSUBSCRIBE: &str = "psubscribe";
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    pub const PUNSUBSCRIBE: &str = "punsubscribe";
    pub const PONG: &str = "pong";
}

/// Errors raised while decoding RESP frames.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown frame type byte 0x{0:02x}")]
    UnknownType(u8),

    #[error("invalid integer: {0:?}")]
    InvalidInteger(String),

    #[error("invalid length: {0}")]
    InvalidLength(i64),

    #[error("bulk string too large: {0} bytes")]
    BulkTooLarge(usize),

    #[error("array too long: {0} elements")]
    ArrayTooLong(usize),

    #[error("frame nested deeper than {MAX_DEPTH} levels")]
    TooDeep,

    #[error("bulk string not terminated by CRLF")]
    MissingTerminator,

    #[error("line exceeds {MAX_LINE_LEN} bytes without CRLF")]
    LineTooLong,

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("malformed {0} push")]
    MalformedPush(String),
}

// ---------------------------------------------------------------------------
// Frames and commands
// ---------------------------------------------------------------------------

/// A single decoded RESP2 value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    Null,
    Array(Vec<Frame>),
}

impl Frame {
    /// Text content of a string-like frame. `Null` reads as an empty string,
    /// which is what Redis sends for the channel of a bare `UNSUBSCRIBE`.
    /// Invalid UTF-8 in a bulk string is replaced with U+FFFD.
    pub fn into_text(self) -> Option<String> {
        match self {
            Frame::Simple(s) => Some(s),
            Frame::Bulk(b) => Some(String::from_utf8_lossy(&b).into_owned()),
            Frame::Null => Some(String::new()),
            _ => None,
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            Frame::Simple(_) => "simple",
            Frame::Error(_) => "error",
            Frame::Integer(_) => "integer",
            Frame::Bulk(_) => "bulk",
            Frame::Null => "null",
            Frame::Array(_) => "array",
        }
    }
}

/// A command sent to the server, encoded as an array of bulk strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    args: Vec<Bytes>,
}

impl Command {
    pub fn new(name: &str) -> Self {
        Self {
            args: vec![Bytes::copy_from_slice(name.as_bytes())],
        }
    }

    pub fn arg(mut self, arg: impl AsRef<[u8]>) -> Self {
        self.args.push(Bytes::copy_from_slice(arg.as_ref()));
        self
    }

    pub fn args(&self) -> &[Bytes] {
        &self.args
    }
}

/// Build a `PSUBSCRIBE pattern` command.
pub fn psubscribe(pattern: &str) -> Command {
    Command::new("PSUBSCRIBE").arg(pattern)
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// RESP2 codec for use with `tokio_util::codec::Framed`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RespCodec;

impl Decoder for RespCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Error> {
        match parse_frame(src, 0, 0)? {
            Some((frame, consumed)) => {
                src.advance(consumed);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Command> for RespCodec {
    type Error = Error;

    fn encode(&mut self, cmd: Command, dst: &mut BytesMut) -> Result<(), Error> {
        let args = cmd.args();
        dst.put_slice(format!("*{}\r\n", args.len()).as_bytes());
        for arg in args {
            dst.put_slice(format!("${}\r\n", arg.len()).as_bytes());
            dst.put_slice(arg);
            dst.put_slice(CRLF);
        }
        Ok(())
    }
}

/// Locate the line starting at `start`. Returns the line (without CRLF) and
/// the offset just past the CRLF, or `None` if more data is needed.
fn read_line(buf: &[u8], start: usize) -> Result<Option<(&[u8], usize)>, ProtocolError> {
    let Some(rest) = buf.get(start..) else {
        return Ok(None);
    };
    match rest.windows(2).position(|w| w == CRLF) {
        Some(idx) if idx > MAX_LINE_LEN => Err(ProtocolError::LineTooLong),
        Some(idx) => Ok(rest.get(..idx).map(|line| (line, start + idx + 2))),
        None if rest.len() > MAX_LINE_LEN => Err(ProtocolError::LineTooLong),
        None => Ok(None),
    }
}

fn parse_int(line: &[u8]) -> Result<i64, ProtocolError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| ProtocolError::InvalidInteger(String::from_utf8_lossy(line).into_owned()))
}

fn parse_len(line: &[u8]) -> Result<Option<usize>, ProtocolError> {
    match parse_int(line)? {
        -1 => Ok(None),
        n => usize::try_from(n)
            .map(Some)
            .map_err(|_| ProtocolError::InvalidLength(n)),
    }
}

fn parse_text(line: &[u8], what: &'static str) -> Result<String, ProtocolError> {
    std::str::from_utf8(line)
        .map(str::to_string)
        .map_err(|_| ProtocolError::InvalidUtf8(what))
}

/// Parse one frame starting at `pos` without consuming anything.
///
/// Returns the frame and the offset just past it, or `None` when `buf` does
/// not yet hold a complete frame.
fn parse_frame(
    buf: &[u8],
    pos: usize,
    depth: usize,
) -> Result<Option<(Frame, usize)>, ProtocolError> {
    if depth > MAX_DEPTH {
        return Err(ProtocolError::TooDeep);
    }
    let Some(&tag) = buf.get(pos) else {
        return Ok(None);
    };
    if !matches!(tag, b'+' | b'-' | b':' | b'$' | b'*') {
        return Err(ProtocolError::UnknownType(tag));
    }
    let Some((line, next)) = read_line(buf, pos + 1)? else {
        return Ok(None);
    };

    match tag {
        b'+' => Ok(Some((Frame::Simple(parse_text(line, "simple string")?), next))),
        b'-' => Ok(Some((Frame::Error(parse_text(line, "error reply")?), next))),
        b':' => Ok(Some((Frame::Integer(parse_int(line)?), next))),
        b'$' => {
            let Some(len) = parse_len(line)? else {
                return Ok(Some((Frame::Null, next)));
            };
            if len > MAX_BULK_LEN {
                return Err(ProtocolError::BulkTooLarge(len));
            }
            let end = next + len;
            if buf.len() < end + CRLF.len() {
                return Ok(None);
            }
            if buf.get(end..end + CRLF.len()) != Some(CRLF) {
                return Err(ProtocolError::MissingTerminator);
            }
            let data = buf.get(next..end).ok_or(ProtocolError::MissingTerminator)?;
            Ok(Some((
                Frame::Bulk(Bytes::copy_from_slice(data)),
                end + CRLF.len(),
            )))
        }
        _ => {
            let Some(len) = parse_len(line)? else {
                return Ok(Some((Frame::Null, next)));
            };
            if len > MAX_ARRAY_LEN {
                return Err(ProtocolError::ArrayTooLong(len));
            }
            let mut items = Vec::with_capacity(len.min(16));
            let mut cursor = next;
            for _ in 0..len {
                let Some((item, after)) = parse_frame(buf, cursor, depth + 1)? else {
                    return Ok(None);
                };
                items.push(item);
                cursor = after;
            }
            Ok(Some((Frame::Array(items), cursor)))
        }
    }
}

// ---------------------------------------------------------------------------
// Push classification
// ---------------------------------------------------------------------------

/// Classify a frame received on a subscribed connection.
pub fn event_from_frame(frame: Frame) -> SubscriptionEvent {
    match frame {
        Frame::Error(message) => SubscriptionEvent::ConnectionError(Error::Server(message)),
        Frame::Array(items) => event_from_push(items),
        other => SubscriptionEvent::Unrecognized {
            kind: other.kind_name().to_string(),
        },
    }
}

fn malformed(kind: &str) -> SubscriptionEvent {
    SubscriptionEvent::ConnectionError(Error::Protocol(ProtocolError::MalformedPush(
        kind.to_string(),
    )))
}

fn event_from_push(items: Vec<Frame>) -> SubscriptionEvent {
    let mut items = items.into_iter();
    let Some(kind) = items.next().and_then(Frame::into_text) else {
        return SubscriptionEvent::Unrecognized {
            kind: "array".to_string(),
        };
    };

    match kind.as_str() {
        push_kind::PMESSAGE => {
            let (Some(pattern), Some(channel), Some(Frame::Bulk(payload)), None) =
                (items.next(), items.next(), items.next(), items.next())
            else {
                return malformed(&kind);
            };
            match (pattern.into_text(), channel.into_text()) {
                (Some(pattern), Some(channel)) => SubscriptionEvent::PatternMessage {
                    pattern,
                    channel,
                    payload,
                },
                _ => malformed(&kind),
            }
        }
        push_kind::SUBSCRIBE
        | push_kind::PSUBSCRIBE
        | push_kind::UNSUBSCRIBE
        | push_kind::PUNSUBSCRIBE => {
            let (Some(channel), Some(Frame::Integer(count)), None) =
                (items.next(), items.next(), items.next())
            else {
                return malformed(&kind);
            };
            match channel.into_text() {
                Some(channel) => SubscriptionEvent::SubscriptionAck {
                    kind,
                    channel,
                    count,
                },
                None => malformed(&kind),
            }
        }
        _ => SubscriptionEvent::Unrecognized { kind },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
