//! HTTP Response Types and Encoding
//!
//! Owned response representation plus the wire encoder for response heads.
//! Bodies are either in-memory `Bytes` or a streaming [`BodyReader`], which
//! is how the file subsystem hands large files to the serve loop without
//! buffering them.

use crate::protocol::request::Version;
use bytes::{BufMut, Bytes, BytesMut};
use std::io;

/// The canned interim response written before a request body is read when
/// an `Expect: 100-continue` request is accepted.
pub const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Response status codes this engine emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    PartialContent,
    MovedPermanently,
    NotModified,
    BadRequest,
    NotFound,
    MethodNotAllowed,
    RequestTimeout,
    PayloadTooLarge,
    RangeNotSatisfiable,
    ExpectationFailed,
    HeaderFieldsTooLarge,
    InternalServerError,
    ServiceUnavailable,
}

impl StatusCode {
    pub fn code(&self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::PartialContent => 206,
            StatusCode::MovedPermanently => 301,
            StatusCode::NotModified => 304,
            StatusCode::BadRequest => 400,
            StatusCode::NotFound => 404,
            StatusCode::MethodNotAllowed => 405,
            StatusCode::RequestTimeout => 408,
            StatusCode::PayloadTooLarge => 413,
            StatusCode::RangeNotSatisfiable => 416,
            StatusCode::ExpectationFailed => 417,
            StatusCode::HeaderFieldsTooLarge => 431,
            StatusCode::InternalServerError => 500,
            StatusCode::ServiceUnavailable => 503,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::PartialContent => "Partial Content",
            StatusCode::MovedPermanently => "Moved Permanently",
            StatusCode::NotModified => "Not Modified",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::NotFound => "Not Found",
            StatusCode::MethodNotAllowed => "Method Not Allowed",
            StatusCode::RequestTimeout => "Request Timeout",
            StatusCode::PayloadTooLarge => "Payload Too Large",
            StatusCode::RangeNotSatisfiable => "Range Not Satisfiable",
            StatusCode::ExpectationFailed => "Expectation Failed",
            StatusCode::HeaderFieldsTooLarge => "Request Header Fields Too Large",
            StatusCode::InternalServerError => "Internal Server Error",
            StatusCode::ServiceUnavailable => "Service Unavailable",
        }
    }
}

/// A streaming response body source.
///
/// Readers are synchronous: the serve loop pulls chunks on the blocking
/// path of its write phase. `close` releases whatever resources back the
/// reader holds (pooled descriptors, cache reader counts).
///
/// `Send + Sync` so a `Response` holding a boxed reader can be borrowed
/// across await points inside a spawned connection task.
pub trait BodyReader: Send + Sync {
    /// Reads the next chunk into `buf`, returning 0 at end of body.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Releases the reader. Must be called exactly once.
    fn close(&mut self) -> io::Result<()>;
}

/// Response body payload.
pub enum Body {
    Empty,
    Bytes(Bytes),
    /// Streaming body with a known total length.
    Reader {
        reader: Box<dyn BodyReader>,
        len: usize,
    },
}

impl Body {
    pub fn len(&self) -> usize {
        match self {
            Body::Empty => 0,
            Body::Bytes(b) => b.len(),
            Body::Reader { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Body::Empty => write!(f, "Body::Empty"),
            Body::Bytes(b) => write!(f, "Body::Bytes({} bytes)", b.len()),
            Body::Reader { len, .. } => write!(f, "Body::Reader({} bytes)", len),
        }
    }
}

/// An outgoing response under construction.
#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    headers: Vec<(String, String)>,
    pub body: Body,
    /// Force the connection closed after this response.
    pub connection_close: bool,
    /// Suppress the body on the wire (HEAD) while keeping Content-Length.
    pub skip_body: bool,
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl Response {
    pub fn new() -> Self {
        Self {
            status: StatusCode::Ok,
            headers: Vec::new(),
            body: Body::Empty,
            connection_close: false,
            skip_body: false,
        }
    }

    /// Builds a plain-text error response.
    pub fn error(status: StatusCode, message: &str) -> Self {
        let mut resp = Self::new();
        resp.status = status;
        resp.set_content_type("text/plain; charset=utf-8");
        resp.set_body(Bytes::copy_from_slice(message.as_bytes()));
        resp
    }

    /// The canned response for a rejected `Expect: 100-continue`.
    pub fn expectation_failed() -> Self {
        let mut resp = Self::error(StatusCode::ExpectationFailed, "Expectation Failed");
        resp.connection_close = true;
        resp
    }

    /// Sets a header, replacing any previous value for the same name.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        for (k, v) in self.headers.iter_mut() {
            if k.eq_ignore_ascii_case(name) {
                *v = value;
                return;
            }
        }
        self.headers.push((name.to_string(), value));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_content_type(&mut self, ct: &str) {
        self.set_header("Content-Type", ct);
    }

    pub fn set_body(&mut self, body: Bytes) {
        self.body = Body::Bytes(body);
    }

    pub fn set_body_reader(&mut self, reader: Box<dyn BodyReader>, len: usize) {
        self.body = Body::Reader { reader, len };
    }

    /// Marks this response as a 206 for `start..=end` of an entity of
    /// `total` bytes.
    pub fn set_content_range(&mut self, start: usize, end: usize, total: usize) {
        self.status = StatusCode::PartialContent;
        self.set_header("Content-Range", format!("bytes {start}-{end}/{total}"));
    }

    /// Encodes the status line and header block into `dst`, including the
    /// terminating blank line. The body is not written here.
    pub fn encode_head(&self, dst: &mut BytesMut, version: Version, keep_alive: bool) {
        dst.put_slice(version.as_str().as_bytes());
        dst.put_u8(b' ');
        let mut code = itoa_buf(self.status.code() as usize);
        dst.put_slice(code.as_bytes());
        dst.put_u8(b' ');
        dst.put_slice(self.status.reason().as_bytes());
        dst.put_slice(b"\r\n");

        dst.put_slice(b"Server: flashhttp\r\n");

        for (k, v) in &self.headers {
            dst.put_slice(k.as_bytes());
            dst.put_slice(b": ");
            dst.put_slice(v.as_bytes());
            dst.put_slice(b"\r\n");
        }

        // 304 responses carry no entity, and therefore no length.
        if self.status != StatusCode::NotModified {
            dst.put_slice(b"Content-Length: ");
            code = itoa_buf(self.body.len());
            dst.put_slice(code.as_bytes());
            dst.put_slice(b"\r\n");
        }

        if keep_alive {
            if version == Version::Http10 {
                dst.put_slice(b"Connection: keep-alive\r\n");
            }
        } else {
            dst.put_slice(b"Connection: close\r\n");
        }

        dst.put_slice(b"\r\n");
    }
}

/// A fixed-capacity decimal formatter to keep head encoding allocation-free.
struct ItoaBuf {
    buf: [u8; 20],
    start: usize,
}

impl ItoaBuf {
    fn as_bytes(&self) -> &[u8] {
        &self.buf[self.start..]
    }
}

fn itoa_buf(mut n: usize) -> ItoaBuf {
    let mut buf = [0u8; 20];
    let mut i = buf.len();
    loop {
        i -= 1;
        buf[i] = b'0' + (n % 10) as u8;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    ItoaBuf { buf, start: i }
}

/// A single parsed byte range, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: usize,
    pub end: usize,
}

/// Parses a `Range` header value against an entity of `len` bytes.
///
/// Only single ranges are honored (`bytes=a-b`, `bytes=a-`, `bytes=-n`);
/// multipart ranges and anything malformed return `None`, and the caller
/// serves the whole entity. An in-grammar range that cannot be satisfied
/// (start past the end) returns `Some(Err(()))` so the caller can answer 416.
pub fn parse_byte_range(value: &[u8], len: usize) -> Option<Result<ByteRange, ()>> {
    let spec = value.strip_prefix(b"bytes=")?;
    if spec.contains(&b',') {
        return None;
    }
    let dash = spec.iter().position(|&b| b == b'-')?;
    let (start_s, end_s) = (&spec[..dash], &spec[dash + 1..]);

    if start_s.is_empty() {
        // Suffix form: the final n bytes.
        let n: usize = parse_decimal(end_s)?;
        if n == 0 || len == 0 {
            return Some(Err(()));
        }
        let n = n.min(len);
        return Some(Ok(ByteRange {
            start: len - n,
            end: len - 1,
        }));
    }

    let start: usize = parse_decimal(start_s)?;
    if start >= len {
        return Some(Err(()));
    }
    let end = if end_s.is_empty() {
        len - 1
    } else {
        let e: usize = parse_decimal(end_s)?;
        if e < start {
            return None;
        }
        e.min(len - 1)
    };
    Some(Ok(ByteRange { start, end }))
}

fn parse_decimal(b: &[u8]) -> Option<usize> {
    if b.is_empty() || !b.iter().all(|c| c.is_ascii_digit()) {
        return None;
    }
    std::str::from_utf8(b).ok()?.parse().ok()
}
