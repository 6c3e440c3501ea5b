use bytes::{Buf, BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::{Frame, command};
use crate::parser::{ParseError, parse_frame, unescape_header_value};

/// Escape a header name or value for the wire.
///
/// STOMP 1.1 escapes backslash, LF and colon; CR is escaped as well so a
/// value can never terminate a header line early.
fn escape_header_value(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '\\' => result.push_str("\\\\"),
            '\r' => result.push_str("\\r"),
            '\n' => result.push_str("\\n"),
            ':' => result.push_str("\\c"),
            _ => result.push(ch),
        }
    }
    result
}

// CONNECT and CONNECTED headers are sent verbatim (STOMP 1.1 §Value Encoding).
fn uses_escaping(cmd: &str) -> bool {
    cmd != command::CONNECT && cmd != command::CONNECTED
}

fn invalid_data(context: &str, e: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("{}: {}", context, e))
}

impl From<ParseError> for io::Error {
    fn from(e: ParseError) -> Self {
        invalid_data("parse error", e)
    }
}

/// Items produced or consumed by the codec.
///
/// A `StompItem` is either a decoded `Frame` or a `Heartbeat` marker
/// representing a bare EOL on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StompItem {
    /// A decoded STOMP frame (command + headers + body)
    Frame(Frame),
    /// A single heartbeat pulse (LF or CRLF)
    Heartbeat,
}

/// `StompCodec` implements `tokio_util::codec::{Decoder, Encoder}` for the
/// STOMP wire protocol.
///
/// Decoding yields `StompItem::Frame` for complete frames (NUL-terminated or
/// sized by `content-length`) and `StompItem::Heartbeat` for every bare EOL
/// between frames. Encoding emits `content-length` whenever the body could
/// not be carried NUL-terminated.
#[derive(Debug, Default)]
pub struct StompCodec {}

impl StompCodec {
    pub fn new() -> Self {
        Self {}
    }

    fn decode_header(raw: &[u8], escaped: bool, what: &str) -> io::Result<String> {
        let bytes = if escaped {
            unescape_header_value(raw).map_err(|e| invalid_data(what, e))?
        } else {
            raw.to_vec()
        };
        String::from_utf8(bytes).map_err(|e| invalid_data(what, e))
    }
}

impl Decoder for StompCodec {
    type Item = StompItem;
    type Error = io::Error;

    /// Decode the next item from `src`.
    ///
    /// Returns `Ok(None)` without consuming anything when `src` holds only a
    /// partial item. Malformed input is reported as `InvalidData`.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match src.chunk() {
            [] => return Ok(None),
            [b'\n', ..] => {
                src.advance(1);
                return Ok(Some(StompItem::Heartbeat));
            }
            [b'\r', b'\n', ..] => {
                src.advance(2);
                return Ok(Some(StompItem::Heartbeat));
            }
            [b'\r'] => return Ok(None),
            _ => {}
        }

        let Some(raw) = parse_frame(src.chunk())? else {
            return Ok(None);
        };
        src.advance(raw.consumed);

        let command = String::from_utf8(raw.command)
            .map_err(|e| invalid_data("invalid utf8 in command", e))?;
        let escaped = uses_escaping(&command);
        let mut headers = Vec::with_capacity(raw.headers.len());
        for (k, v) in &raw.headers {
            headers.push((
                Self::decode_header(k, escaped, "invalid header name")?,
                Self::decode_header(v, escaped, "invalid header value")?,
            ));
        }

        Ok(Some(StompItem::Frame(Frame {
            command,
            headers,
            body: raw.body,
        })))
    }
}

impl Encoder<StompItem> for StompCodec {
    type Error = io::Error;

    fn encode(&mut self, item: StompItem, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame = match item {
            StompItem::Heartbeat => {
                dst.put_u8(b'\n');
                return Ok(());
            }
            StompItem::Frame(frame) => frame,
        };

        dst.extend_from_slice(frame.command.as_bytes());
        dst.put_u8(b'\n');

        let escaped = uses_escaping(&frame.command);
        let needs_length = !frame.has_header_ignore_case("content-length")
            && (frame.body.contains(&0) || std::str::from_utf8(&frame.body).is_err());

        for (k, v) in &frame.headers {
            if escaped {
                dst.extend_from_slice(escape_header_value(k).as_bytes());
                dst.put_u8(b':');
                dst.extend_from_slice(escape_header_value(v).as_bytes());
            } else {
                dst.extend_from_slice(k.as_bytes());
                dst.put_u8(b':');
                dst.extend_from_slice(v.as_bytes());
            }
            dst.put_u8(b'\n');
        }
        if needs_length {
            dst.extend_from_slice(format!("content-length:{}\n", frame.body.len()).as_bytes());
        }

        dst.put_u8(b'\n');
        dst.extend_from_slice(&frame.body);
        dst.put_u8(0);
        Ok(())
    }
}

/// Push-style wrapper around [`StompCodec`] for callers that receive bytes
/// in arbitrary chunks rather than through a `Framed` transport.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    codec: StompCodec,
    buf: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes. Nothing is parsed until [`pop_frames`](Self::pop_frames).
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Drain every complete item in arrival order. A trailing partial frame
    /// stays buffered for the next call.
    pub fn pop_frames(&mut self) -> io::Result<Vec<StompItem>> {
        let mut items = Vec::new();
        while let Some(item) = self.codec.decode(&mut self.buf)? {
            items.push(item);
        }
        Ok(items)
    }

    /// Bytes fed but not yet decoded.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Encode a single frame to its wire representation.
pub fn build_frame(cmd: &str, headers: &[(String, String)], body: &[u8]) -> Vec<u8> {
    let frame = Frame {
        command: cmd.to_string(),
        headers: headers.to_vec(),
        body: body.to_vec(),
    };
    let mut dst = BytesMut::new();
    // Encoding into a BytesMut cannot fail.
    let _ = StompCodec::new().encode(StompItem::Frame(frame), &mut dst);
    dst.to_vec()
}
