//! Content-Length framing.
//!
//! ```text
//! Content-Length: <n>\r\n
//! \r\n
//! <n bytes of UTF-8 JSON>
//! ```
//!
//! [`encode`] and [`decode`] work on whole frames. [`FrameDecoder`] is used on
//! the inbound byte stream, where a frame may arrive split over several chunks
//! or several frames may arrive in one chunk.

use crate::lsp::error::FramingError;

const HEADER_KEYWORD: &[u8] = b"Content-Length:";
const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Frame a message body.
pub fn encode(payload: &str) -> Vec<u8> {
    format!("Content-Length: {}\r\n\r\n{}", payload.len(), payload).into_bytes()
}

/// Decode a single complete frame into its payload.
///
/// Invalid UTF-8 is rejected, never replaced.
pub fn decode(bytes: &[u8]) -> Result<String, FramingError> {
    let delimited = std::str::from_utf8(bytes).map_err(|e| FramingError::InvalidUtf8 {
        valid_up_to: e.valid_up_to(),
    })?;
    match parse_header(bytes, true)? {
        HeaderScan::Complete { header_len, .. } => Ok(delimited[header_len..].to_string()),
        HeaderScan::Incomplete => Err(FramingError::MissingHeader {
            found: preview(bytes),
        }),
    }
}

/// Remove a leading `Content-Length` header if there is one.
pub fn strip_header(delimited: &str) -> Option<&str> {
    match parse_header(delimited.as_bytes(), true) {
        Ok(HeaderScan::Complete { header_len, .. }) => Some(&delimited[header_len..]),
        _ => None,
    }
}

/// Result of scanning the front of a buffer for a header.
#[derive(Debug, PartialEq, Eq)]
enum HeaderScan {
    /// More bytes are needed before the header can be judged.
    Incomplete,
    Complete {
        header_len: usize,
        content_length: usize,
    },
}

/// Scan `buf` for `Content-Length:\s*\d+\s*`.
///
/// Trailing whitespace is consumed up to and including the first `\r\n\r\n`
/// and never beyond it. With `at_end` the buffer is known to be complete, so
/// running out of bytes after the digits ends the header instead of waiting.
fn parse_header(buf: &[u8], at_end: bool) -> Result<HeaderScan, FramingError> {
    let keyword_len = buf.len().min(HEADER_KEYWORD.len());
    if buf[..keyword_len] != HEADER_KEYWORD[..keyword_len] {
        return Err(FramingError::MissingHeader { found: preview(buf) });
    }
    if buf.len() < HEADER_KEYWORD.len() {
        return incomplete(buf, at_end);
    }

    let mut pos = HEADER_KEYWORD.len();
    while pos < buf.len() && buf[pos].is_ascii_whitespace() {
        pos += 1;
    }

    let digits_start = pos;
    while pos < buf.len() && buf[pos].is_ascii_digit() {
        pos += 1;
    }
    if pos == buf.len() {
        return incomplete(buf, at_end).or_else(|_| {
            if digits_start == pos {
                Err(FramingError::InvalidContentLength(String::new()))
            } else {
                finish_header(buf, digits_start, pos, pos)
            }
        });
    }
    if digits_start == pos {
        return Err(FramingError::InvalidContentLength(preview(&buf[digits_start..])));
    }
    let digits_end = pos;

    while pos < buf.len() && buf[pos].is_ascii_whitespace() {
        if buf[pos..].starts_with(HEADER_TERMINATOR) {
            return finish_header(buf, digits_start, digits_end, pos + HEADER_TERMINATOR.len());
        }
        pos += 1;
    }
    if pos == buf.len() && !at_end {
        return Ok(HeaderScan::Incomplete);
    }
    finish_header(buf, digits_start, digits_end, pos)
}

fn incomplete(buf: &[u8], at_end: bool) -> Result<HeaderScan, FramingError> {
    if at_end {
        Err(FramingError::MissingHeader { found: preview(buf) })
    } else {
        Ok(HeaderScan::Incomplete)
    }
}

fn finish_header(
    buf: &[u8],
    digits_start: usize,
    digits_end: usize,
    header_len: usize,
) -> Result<HeaderScan, FramingError> {
    let digits = &buf[digits_start..digits_end];
    // Only ASCII digits were accepted above.
    let text = String::from_utf8_lossy(digits);
    let content_length = text
        .parse::<usize>()
        .map_err(|_| FramingError::InvalidContentLength(text.to_string()))?;
    Ok(HeaderScan::Complete {
        header_len,
        content_length,
    })
}

fn preview(bytes: &[u8]) -> String {
    let end = bytes.len().min(32);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Reassembles frames from an inbound byte stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    content_length: Option<usize>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk as it came off the wire.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Number of bytes held back waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Take the next complete payload out of the buffer.
    ///
    /// Returns `Ok(None)` when the buffer does not hold a whole frame yet. After
    /// an error the buffer is left as it was; the stream cannot be trusted past
    /// that point.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FramingError> {
        let content_length = match self.content_length {
            Some(length) => length,
            None => {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                match parse_header(&self.buffer, false)? {
                    HeaderScan::Incomplete => return Ok(None),
                    HeaderScan::Complete {
                        header_len,
                        content_length,
                    } => {
                        self.buffer.drain(..header_len);
                        self.content_length = Some(content_length);
                        content_length
                    }
                }
            }
        };

        if self.buffer.len() < content_length {
            return Ok(None);
        }

        let rest = self.buffer.split_off(content_length);
        let payload = std::mem::replace(&mut self.buffer, rest);
        self.content_length = None;
        Ok(Some(payload))
    }
}
