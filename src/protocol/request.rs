//! HTTP Request Types and Framing
//!
//! This module parses the request line and header block of an HTTP/1.x
//! request into a [`RequestHeader`], using the incremental
//! [`HeaderScanner`](crate::protocol::scanner::HeaderScanner).
//!
//! Parsing follows the same incremental contract as the scanner:
//! - `Ok((header, consumed))` - a complete head was parsed
//! - `Err(ParseError::Incomplete)` - the frame is incomplete; read more bytes
//!   and parse again
//! - any other error - the request is malformed and fatal for this exchange
//!
//! Header keys and values are stored as zero-copy `Bytes` slices of the
//! connection's read buffer whenever possible; only folded values and
//! non-canonical key casings allocate.

use crate::protocol::scanner::{has_header_value, HeaderScanner, ScanError};
use bytes::Bytes;
use memchr::memchr;
use std::borrow::Cow;
use thiserror::Error;

/// Errors that can occur while parsing a request head or body framing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The buffer does not yet hold a complete frame. Recoverable: refill
    /// the buffer and parse again.
    #[error("incomplete request frame")]
    Incomplete,

    /// The request line is malformed.
    #[error("invalid request line")]
    InvalidRequestLine,

    /// Unknown request method token.
    #[error("invalid method")]
    InvalidMethod,

    /// Unsupported or malformed protocol version.
    #[error("invalid protocol version")]
    InvalidVersion,

    /// A header name contained a line break.
    #[error("invalid header name")]
    InvalidHeaderName,

    /// `Content-Length` was present but not a valid number.
    #[error("invalid content length")]
    InvalidContentLength,

    /// A chunk size line in a chunked body was malformed.
    #[error("invalid chunk framing")]
    InvalidChunk,
}

impl From<ScanError> for ParseError {
    fn from(e: ScanError) -> Self {
        match e {
            ScanError::NeedMore => ParseError::Incomplete,
            ScanError::InvalidName => ParseError::InvalidHeaderName,
        }
    }
}

/// HTTP request methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Patch,
    Trace,
    Connect,
}

impl Method {
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        match b {
            b"GET" => Some(Method::Get),
            b"HEAD" => Some(Method::Head),
            b"POST" => Some(Method::Post),
            b"PUT" => Some(Method::Put),
            b"DELETE" => Some(Method::Delete),
            b"OPTIONS" => Some(Method::Options),
            b"PATCH" => Some(Method::Patch),
            b"TRACE" => Some(Method::Trace),
            b"CONNECT" => Some(Method::Connect),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Patch => "PATCH",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
        }
    }
}

/// HTTP protocol versions this engine serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }

    /// Whether this version keeps connections open by default.
    #[inline]
    pub fn default_keep_alive(&self) -> bool {
        matches!(self, Version::Http11)
    }
}

/// A parsed request head: request line plus header block.
#[derive(Debug, Clone)]
pub struct RequestHeader {
    pub method: Method,
    pub path: Bytes,
    pub version: Version,

    /// Header pairs in wire order, keys canonicalized to `Title-Case`.
    headers: Vec<(Bytes, Bytes)>,

    pub content_length: Option<usize>,
    pub chunked: bool,
    connection_close: bool,
    connection_keep_alive: bool,
    pub expect_continue: bool,
}

impl RequestHeader {
    /// Parses a request head from the front of `buf`.
    ///
    /// Returns the parsed head and the number of bytes consumed (request
    /// line through the blank line). `Incomplete` means the caller should
    /// read more bytes into the same buffer and call again.
    pub fn parse(buf: &Bytes) -> Result<(Self, usize), ParseError> {
        let line_end = memchr(b'\n', buf).ok_or(ParseError::Incomplete)?;
        let (method, path, version) = parse_request_line(&buf[..line_end])?;

        let head_start = line_end + 1;
        let mut scanner = HeaderScanner::new(&buf[head_start..]);

        let mut headers = Vec::with_capacity(8);
        let mut content_length = None;
        let mut chunked = false;
        let mut connection_close = false;
        let mut connection_keep_alive = false;
        let mut expect_continue = false;

        while scanner.next() {
            let key = match scanner.normalized_key() {
                Cow::Borrowed(k) => buf.slice_ref(k),
                Cow::Owned(k) => Bytes::from(k),
            };
            let value = match scanner.normalized_value() {
                Cow::Borrowed(v) => buf.slice_ref(v),
                Cow::Owned(v) => Bytes::from(v),
            };

            if key.eq_ignore_ascii_case(b"Content-Length") {
                let s = std::str::from_utf8(&value)
                    .map_err(|_| ParseError::InvalidContentLength)?;
                let n: usize = s
                    .trim()
                    .parse()
                    .map_err(|_| ParseError::InvalidContentLength)?;
                content_length = Some(n);
            } else if key.eq_ignore_ascii_case(b"Transfer-Encoding") {
                if has_header_value(&value, b"chunked") {
                    chunked = true;
                }
            } else if key.eq_ignore_ascii_case(b"Connection") {
                connection_close = has_header_value(&value, b"close");
                connection_keep_alive = has_header_value(&value, b"keep-alive");
            } else if key.eq_ignore_ascii_case(b"Expect") {
                expect_continue = value.eq_ignore_ascii_case(b"100-continue");
            }

            headers.push((key, value));
        }
        if let Some(err) = scanner.error() {
            return Err(err.into());
        }

        let consumed = head_start + scanner.consumed();
        Ok((
            Self {
                method,
                path: buf.slice_ref(path),
                version,
                headers,
                content_length,
                chunked,
                connection_close,
                connection_keep_alive,
                expect_continue,
            },
            consumed,
        ))
    }

    /// Case-insensitive single-header lookup.
    pub fn header(&self, name: &[u8]) -> Option<&Bytes> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// All header pairs in wire order.
    pub fn headers(&self) -> &[(Bytes, Bytes)] {
        &self.headers
    }

    /// Whether the request declares a body (explicit length or chunked).
    pub fn has_body(&self) -> bool {
        self.chunked || self.content_length.map(|n| n > 0).unwrap_or(false)
    }

    /// The persistence decision for this request: an explicit
    /// `Connection: close` always closes; HTTP/1.0 needs an explicit
    /// `Connection: keep-alive` to persist; HTTP/1.1 persists by default.
    pub fn should_keep_alive(&self) -> bool {
        if self.connection_close {
            return false;
        }
        self.version.default_keep_alive() || self.connection_keep_alive
    }
}

/// A complete request: head plus fully read body.
#[derive(Debug, Clone)]
pub struct Request {
    pub header: RequestHeader,
    pub body: Bytes,
}

impl Request {
    pub fn new(header: RequestHeader, body: Bytes) -> Self {
        Self { header, body }
    }

    #[inline]
    pub fn method(&self) -> Method {
        self.header.method
    }

    #[inline]
    pub fn path(&self) -> &Bytes {
        &self.header.path
    }
}

fn parse_request_line(line: &[u8]) -> Result<(Method, &[u8], Version), ParseError> {
    let line = match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    };

    let mut parts = line
        .split(|&b| b == b' ')
        .filter(|p| !p.is_empty());

    let method = parts.next().ok_or(ParseError::InvalidRequestLine)?;
    let path = parts.next().ok_or(ParseError::InvalidRequestLine)?;
    let version = parts.next().ok_or(ParseError::InvalidRequestLine)?;
    if parts.next().is_some() {
        return Err(ParseError::InvalidRequestLine);
    }

    let method = Method::from_bytes(method).ok_or(ParseError::InvalidMethod)?;
    if path.is_empty() || (path[0] != b'/' && path != b"*") {
        return Err(ParseError::InvalidRequestLine);
    }
    let version = match version {
        b"HTTP/1.1" => Version::Http11,
        b"HTTP/1.0" => Version::Http10,
        _ => return Err(ParseError::InvalidVersion),
    };

    Ok((method, path, version))
}

/// Attempts to decode a complete chunked body from the front of `buf`.
///
/// Returns `Ok(Some((body, consumed)))` once the terminating zero-size chunk
/// has arrived, `Ok(None)` while the framing is incomplete, and an error for
/// malformed chunk size lines. Trailer headers are consumed and discarded.
pub fn decode_chunked(buf: &[u8]) -> Result<Option<(Bytes, usize)>, ParseError> {
    let mut body = Vec::new();
    let mut pos = 0;

    loop {
        let line_end = match memchr(b'\n', &buf[pos..]) {
            Some(i) => pos + i,
            None => return Ok(None),
        };
        let size_line = &buf[pos..line_end];
        let size_line = match size_line.last() {
            Some(b'\r') => &size_line[..size_line.len() - 1],
            _ => size_line,
        };
        // Chunk extensions after ';' are ignored.
        let size_part = match memchr(b';', size_line) {
            Some(i) => &size_line[..i],
            None => size_line,
        };
        let size_str =
            std::str::from_utf8(size_part).map_err(|_| ParseError::InvalidChunk)?;
        let size = usize::from_str_radix(size_str.trim(), 16)
            .map_err(|_| ParseError::InvalidChunk)?;

        pos = line_end + 1;

        if size == 0 {
            // Skip trailers up to the final blank line.
            loop {
                let t_end = match memchr(b'\n', &buf[pos..]) {
                    Some(i) => pos + i,
                    None => return Ok(None),
                };
                let trailer = &buf[pos..t_end];
                pos = t_end + 1;
                if trailer.is_empty() || trailer == b"\r" {
                    return Ok(Some((Bytes::from(body), pos)));
                }
            }
        }

        // A size that overflows the chunk end can never be satisfied by any
        // buffer; treat it as malformed rather than waiting for more input.
        let chunk_end = pos
            .checked_add(size)
            .and_then(|e| e.checked_add(1))
            .ok_or(ParseError::InvalidChunk)?;
        if buf.len() < chunk_end {
            return Ok(None);
        }
        body.extend_from_slice(&buf[pos..pos + size]);
        pos += size;

        // Each chunk is followed by its own line terminator.
        if buf[pos] == b'\r' {
            if buf.len() < pos + 2 {
                return Ok(None);
            }
            if buf[pos + 1] != b'\n' {
                return Err(ParseError::InvalidChunk);
            }
            pos += 2;
        } else if buf[pos] == b'\n' {
            pos += 1;
        } else {
            return Err(ParseError::InvalidChunk);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &[u8]) -> Result<(RequestHeader, usize), ParseError> {
        RequestHeader::parse(&Bytes::copy_from_slice(input))
    }

    #[test]
    fn test_parse_simple_get() {
        let input = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let (head, consumed) = parse(input).unwrap();
        assert_eq!(head.method, Method::Get);
        assert_eq!(&head.path[..], b"/index.html");
        assert_eq!(head.version, Version::Http11);
        assert_eq!(&head.header(b"host").unwrap()[..], b"example.com");
        assert_eq!(consumed, input.len());
        assert!(!head.has_body());
        assert!(head.should_keep_alive());
    }

    #[test]
    fn test_parse_post_with_length() {
        let input = b"POST /api HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\n\r\n12345";
        let (head, consumed) = parse(input).unwrap();
        assert_eq!(head.method, Method::Post);
        assert_eq!(head.content_length, Some(5));
        assert!(head.has_body());
        assert_eq!(consumed, input.len() - 5);
    }

    #[test]
    fn test_incomplete_head() {
        assert_eq!(parse(b"GET / HTTP/1.1\r\nHos").unwrap_err(), ParseError::Incomplete);
        assert_eq!(parse(b"GET / HT").unwrap_err(), ParseError::Incomplete);
    }

    #[test]
    fn test_invalid_method_and_version() {
        assert_eq!(
            parse(b"FROB / HTTP/1.1\r\n\r\n").unwrap_err(),
            ParseError::InvalidMethod
        );
        assert_eq!(
            parse(b"GET / HTTP/2.0\r\n\r\n").unwrap_err(),
            ParseError::InvalidVersion
        );
    }

    #[test]
    fn test_keep_alive_semantics() {
        // HTTP/1.1 persists by default.
        let (head, _) = parse(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n").unwrap();
        assert!(head.should_keep_alive());

        // Explicit close always wins.
        let (head, _) =
            parse(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").unwrap();
        assert!(!head.should_keep_alive());

        // HTTP/1.0 closes unless keep-alive is requested.
        let (head, _) = parse(b"GET / HTTP/1.0\r\nHost: a\r\n\r\n").unwrap();
        assert!(!head.should_keep_alive());
        let (head, _) =
            parse(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n").unwrap();
        assert!(head.should_keep_alive());
    }

    #[test]
    fn test_expect_continue_flag() {
        let (head, _) = parse(
            b"POST / HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 3\r\n\r\n",
        )
        .unwrap();
        assert!(head.expect_continue);
    }

    #[test]
    fn test_invalid_content_length() {
        assert_eq!(
            parse(b"POST / HTTP/1.1\r\nContent-Length: five\r\n\r\n").unwrap_err(),
            ParseError::InvalidContentLength
        );
    }

    #[test]
    fn test_header_name_with_line_break_rejected() {
        assert_eq!(
            parse(b"GET / HTTP/1.1\r\nBad\r\nName: x\r\n\r\n").unwrap_err(),
            ParseError::InvalidHeaderName
        );
    }

    #[test]
    fn test_folded_header_value() {
        let input = b"GET / HTTP/1.1\r\nX-Long: alpha\r\n beta\r\n\r\n";
        let (head, consumed) = parse(input).unwrap();
        assert_eq!(&head.header(b"X-Long").unwrap()[..], b"alpha beta");
        assert_eq!(consumed, input.len());
    }

    #[test]
    fn test_keys_canonicalized() {
        let (head, _) = parse(b"GET / HTTP/1.1\r\ncontent-type: a/b\r\n\r\n").unwrap();
        assert_eq!(&head.headers()[0].0[..], b"Content-Type");
    }

    #[test]
    fn test_decode_chunked_complete() {
        let input = b"3\r\nfoo\r\n4\r\nbarb\r\n0\r\n\r\nGET /next";
        let (body, consumed) = decode_chunked(input).unwrap().unwrap();
        assert_eq!(&body[..], b"foobarb");
        assert_eq!(consumed, input.len() - b"GET /next".len());
    }

    #[test]
    fn test_decode_chunked_incomplete() {
        assert!(decode_chunked(b"3\r\nfo").unwrap().is_none());
        assert!(decode_chunked(b"3\r\nfoo\r\n").unwrap().is_none());
        assert!(decode_chunked(b"3\r\nfoo\r\n0\r\n").unwrap().is_none());
    }

    #[test]
    fn test_decode_chunked_invalid_size() {
        assert_eq!(
            decode_chunked(b"zz\r\nfoo\r\n").unwrap_err(),
            ParseError::InvalidChunk
        );
    }

    #[test]
    fn test_decode_chunked_huge_size_rejected() {
        // usize::MAX as a chunk size must fail cleanly, not overflow the
        // end-of-chunk arithmetic.
        assert_eq!(
            decode_chunked(b"ffffffffffffffff\r\nx\r\n").unwrap_err(),
            ParseError::InvalidChunk
        );
        assert_eq!(
            decode_chunked(b"fffffffffffffffe\r\n\r\n").unwrap_err(),
            ParseError::InvalidChunk
        );
    }
}
