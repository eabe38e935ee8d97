// src/parser.rs
use crate::http::{Method, Request, RequestHead};

pub const MAX_HEADERS: usize = 64;
/// Largest request line + header block accepted before the blank line.
pub const MAX_HEAD_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    InvalidFormat,
    TooLarge,
    /// A body-carrying method arrived without `Content-Length`.
    MissingLength,
    /// Transfer codings are not accepted.
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Incomplete,
    Complete,
}

/// Parses a complete head (request line + headers, without the terminating
/// blank line).
pub fn parse_head(buf: &[u8]) -> Result<RequestHead, ParseError> {
    let text = std::str::from_utf8(buf).map_err(|_| ParseError::InvalidFormat)?;
    let mut lines = text.split("\r\n");

    // METHOD SP TARGET SP HTTP/1.x
    let request_line = lines.next().ok_or(ParseError::InvalidFormat)?;
    let mut parts = request_line.split(' ');
    let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next())
    {
        (Some(m), Some(t), Some(v), None) if !m.is_empty() => (m, t, v),
        _ => return Err(ParseError::InvalidFormat),
    };
    if !target.starts_with('/') || !version.starts_with("HTTP/") {
        return Err(ParseError::InvalidFormat);
    }

    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p, q),
        None => (target, ""),
    };

    let mut headers = Vec::new();
    for line in lines {
        if headers.len() >= MAX_HEADERS {
            return Err(ParseError::TooLarge);
        }
        let (name, value) = line.split_once(':').ok_or(ParseError::InvalidFormat)?;
        if name.is_empty() || name.contains(|c: char| c.is_ascii_whitespace()) {
            return Err(ParseError::InvalidFormat);
        }
        headers.push((name.to_string(), value.trim().to_string()));
    }

    Ok(RequestHead {
        method: Method::from_bytes(method.as_bytes()),
        path: path.to_string(),
        query: query.to_string(),
        version: version.to_string(),
        headers,
    })
}

/// Declared body length of a parsed head.
pub fn body_length(head: &RequestHead) -> Result<usize, ParseError> {
    if head.header("transfer-encoding").is_some() {
        return Err(ParseError::Unsupported);
    }
    match head.header("content-length") {
        Some(v) => {
            let v = v.trim();
            if v.is_empty() || !v.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ParseError::InvalidFormat);
            }
            // Lengths past u64/usize saturate; the body limit turns them into 413
            let n = v.parse::<u64>().unwrap_or(u64::MAX);
            Ok(usize::try_from(n).unwrap_or(usize::MAX))
        }
        None if head.method.requires_body() => Err(ParseError::MissingLength),
        None => Ok(0),
    }
}

/// Accumulates raw bytes for one request.
///
/// The head is parsed exactly once, when its blank line first appears; after
/// that only the body byte count is tracked. The result does not depend on
/// how the bytes were chunked across reads.
#[derive(Debug, Default)]
pub struct RequestBuffer {
    buf: Vec<u8>,
    head: Option<RequestHead>,
    body_start: usize,
    content_length: usize,
    // Where the next scan for the blank line resumes.
    scanned: usize,
}

impl RequestBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn head(&self) -> Option<&RequestHead> {
        self.head.as_ref()
    }

    /// Declared body length; zero until the head is parsed.
    pub fn content_length(&self) -> usize {
        self.content_length
    }

    /// Body bytes buffered so far.
    pub fn body_received(&self) -> usize {
        if self.head.is_some() {
            self.buf.len() - self.body_start
        } else {
            0
        }
    }

    pub fn advance(&mut self) -> Result<Progress, ParseError> {
        if self.head.is_none() {
            let from = self.scanned.saturating_sub(3);
            match find(&self.buf[from..], b"\r\n\r\n") {
                Some(pos) => {
                    let head_end = from + pos;
                    let head = parse_head(&self.buf[..head_end])?;
                    self.content_length = body_length(&head)?;
                    self.body_start = head_end + 4;
                    self.head = Some(head);
                }
                None => {
                    self.scanned = self.buf.len();
                    if self.buf.len() > MAX_HEAD_BYTES {
                        return Err(ParseError::TooLarge);
                    }
                    return Ok(Progress::Incomplete);
                }
            }
        }

        if self.body_received() >= self.content_length {
            Ok(Progress::Complete)
        } else {
            Ok(Progress::Incomplete)
        }
    }

    /// Move the finished request out. Bytes past the declared body are dropped.
    pub fn take_request(&mut self) -> Option<Request> {
        let head = self.head.take()?;
        let end = self.body_start.saturating_add(self.content_length);
        let body = self.buf.get(self.body_start..end)?.to_vec();
        self.buf = Vec::new();
        Some(Request { head, body })
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
