//! Slice-based STOMP frame parser.
//!
//! The parser works directly on the bytes buffered by the codec and never
//! consumes anything itself: it reports how many bytes a complete frame
//! occupies and leaves the advancing to the caller.

use thiserror::Error;

/// Reasons a byte sequence cannot be a STOMP frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),
    #[error("invalid content-length {0:?}")]
    InvalidContentLength(String),
    #[error("missing NUL terminator after content-length body")]
    MissingNul,
    #[error("NUL byte inside frame preamble")]
    UnexpectedNul,
    #[error("invalid escape sequence \\{0}")]
    InvalidEscape(char),
    #[error("dangling backslash at end of header")]
    DanglingEscape,
}

/// Raw parts of one complete frame plus the number of input bytes it spans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub command: Vec<u8>,
    pub headers: Vec<(Vec<u8>, Vec<u8>)>,
    pub body: Vec<u8>,
    pub consumed: usize,
}

fn strip_cr(line: &[u8]) -> &[u8] {
    match line.split_last() {
        Some((b'\r', rest)) => rest,
        _ => line,
    }
}

fn content_length(headers: &[(Vec<u8>, Vec<u8>)]) -> Result<Option<usize>, ParseError> {
    // STOMP 1.1: the first occurrence of a repeated header wins.
    let Some((_, v)) = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(b"content-length"))
    else {
        return Ok(None);
    };
    let text = String::from_utf8_lossy(v);
    text.trim()
        .parse::<usize>()
        .map(Some)
        .map_err(|_| ParseError::InvalidContentLength(text.into_owned()))
}

/// Parse one frame from the start of `input`.
///
/// `input` must not begin with a heartbeat EOL; the codec strips those first.
/// Returns `Ok(None)` when the frame is not complete yet.
pub fn parse_frame(input: &[u8]) -> Result<Option<RawFrame>, ParseError> {
    let mut pos = 0usize;

    let Some(cmd_end) = input.iter().position(|&b| b == b'\n') else {
        if input.contains(&0) {
            return Err(ParseError::UnexpectedNul);
        }
        return Ok(None);
    };
    let command = strip_cr(&input[..cmd_end]);
    if command.contains(&0) {
        return Err(ParseError::UnexpectedNul);
    }
    let command = command.to_vec();
    pos += cmd_end + 1;

    let mut headers = Vec::new();
    loop {
        let rest = &input[pos..];
        let Some(line_end) = rest.iter().position(|&b| b == b'\n') else {
            if rest.contains(&0) {
                return Err(ParseError::UnexpectedNul);
            }
            return Ok(None);
        };
        let line = strip_cr(&rest[..line_end]);
        pos += line_end + 1;
        if line.is_empty() {
            break;
        }
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            return Err(ParseError::MalformedHeader(
                String::from_utf8_lossy(line).into_owned(),
            ));
        };
        headers.push((line[..colon].to_vec(), line[colon + 1..].to_vec()));
    }

    let body_start = pos;
    let body_end = match content_length(&headers)? {
        Some(len) => {
            if input.len() < body_start + len + 1 {
                return Ok(None);
            }
            if input[body_start + len] != 0 {
                return Err(ParseError::MissingNul);
            }
            body_start + len
        }
        None => match input[body_start..].iter().position(|&b| b == 0) {
            Some(nul) => body_start + nul,
            None => return Ok(None),
        },
    };

    Ok(Some(RawFrame {
        command,
        headers,
        body: input[body_start..body_end].to_vec(),
        consumed: body_end + 1,
    }))
}

/// Reverse the STOMP header escaping (`\\`, `\n`, `\r`, `\c`).
pub fn unescape_header_value(input: &[u8]) -> Result<Vec<u8>, ParseError> {
    let mut out = Vec::with_capacity(input.len());
    let mut bytes = input.iter();
    while let Some(&b) = bytes.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match bytes.next() {
            Some(b'\\') => out.push(b'\\'),
            Some(b'n') => out.push(b'\n'),
            Some(b'r') => out.push(b'\r'),
            Some(b'c') => out.push(b':'),
            Some(&other) => return Err(ParseError::InvalidEscape(other as char)),
            None => return Err(ParseError::DanglingEscape),
        }
    }
    Ok(out)
}
