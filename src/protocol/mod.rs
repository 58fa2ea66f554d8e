//! HTTP/1.x Protocol Implementation
//!
//! This module provides the wire-level pieces of the engine: a zero-copy
//! header scanner and owned request/response types.
//!
//! ## Overview
//!
//! Parsing is incremental and allocation-shy. The scanner walks a borrowed
//! byte buffer and yields raw header spans; request parsing slices those
//! spans out of the connection buffer as `Bytes` so the common path never
//! copies. Only obsolete line folding and non-canonical key casing allocate.
//!
//! ## Modules
//!
//! - `scanner`: Incremental header and header-value scanners
//! - `request`: Request head parsing, body framing, keep-alive semantics
//! - `response`: Response construction and head encoding
//!
//! ## Example
//!
//! ```ignore
//! use flashhttp::protocol::{RequestHeader, Response, StatusCode};
//! use bytes::Bytes;
//!
//! let buf = Bytes::from_static(b"GET /index.html HTTP/1.1\r\nHost: a\r\n\r\n");
//! let (head, consumed) = RequestHeader::parse(&buf).unwrap();
//!
//! let mut resp = Response::new();
//! resp.set_content_type("text/html");
//! resp.set_body(Bytes::from_static(b"<h1>hi</h1>"));
//! ```

pub mod request;
pub mod response;
pub mod scanner;

// Re-export commonly used types for convenience
pub use request::{decode_chunked, Method, ParseError, Request, RequestHeader, Version};
pub use response::{
    parse_byte_range, Body, BodyReader, ByteRange, Response, StatusCode,
    CONTINUE_RESPONSE,
};
pub use scanner::{
    has_header_value, normalize_header_key, HeaderScanner, HeaderValueScanner,
    ScanError,
};
