//! Incremental HTTP Header Scanner
//!
//! This module implements a zero-copy tokenizer over a raw header block.
//! Each call to [`HeaderScanner::next`] advances past exactly one header
//! line and exposes the key and value as sub-slices of the caller's buffer.
//!
//! ## How the Scanner Works
//!
//! The scanner reads from a borrowed byte slice and signals one of:
//! - `next() == true` - a header line was consumed, `key()`/`value()` are valid
//! - `next() == false`, `error() == None` - the terminating blank line was
//!   consumed; the header block is complete
//! - `next() == false`, `error() == Some(NeedMore)` - the buffer ends before a
//!   required token; the caller should read more bytes and rescan
//! - `next() == false`, `error() == Some(InvalidName)` - a line break appeared
//!   inside a header name; the request is malformed
//!
//! Once an error is set, every subsequent `next()` call returns `false`
//! without consuming further input.
//!
//! ## Line Folding
//!
//! Historic HTTP allows a header value to continue on following lines that
//! begin with a space or tab. Deciding whether such a line is a continuation
//! or the next header requires scanning it for a colon; the scanner caches
//! the colon and newline positions it discovers during that lookahead so the
//! very next call does not rescan the same region.

use memchr::memchr;
use std::borrow::Cow;
use thiserror::Error;

/// Errors produced while scanning a header block.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ScanError {
    /// The buffer ends before a required token. Recoverable: refill the
    /// buffer and scan again.
    #[error("need more data")]
    NeedMore,

    /// A line break appeared before the colon of a header line. A header
    /// name cannot contain a line break.
    #[error("invalid header name")]
    InvalidName,
}

/// An incremental, allocation-free header tokenizer.
///
/// The scanner never copies payload bytes; `key()` and `value()` borrow from
/// the input buffer. The only allocation happens in
/// [`normalized_value`](Self::normalized_value) when a value actually spans
/// multiple folded lines, which is rare.
///
/// # Example
///
/// ```
/// use flashhttp::protocol::scanner::HeaderScanner;
///
/// let block = b"Host: example.com\r\nAccept: */*\r\n\r\nbody";
/// let mut scanner = HeaderScanner::new(block);
///
/// assert!(scanner.next());
/// assert_eq!(scanner.key(), b"Host");
/// assert_eq!(scanner.value(), b"example.com");
///
/// assert!(scanner.next());
/// assert_eq!(scanner.key(), b"Accept");
///
/// assert!(!scanner.next());
/// assert!(scanner.error().is_none());
/// assert_eq!(scanner.consumed(), block.len() - 4);
/// ```
#[derive(Debug)]
pub struct HeaderScanner<'a> {
    buf: &'a [u8],

    /// Cursor into `buf`; everything before it has been consumed.
    pos: usize,

    key: (usize, usize),
    value: (usize, usize),

    /// Set when the current value spans folded continuation lines.
    folded: bool,

    /// Cumulative number of consumed header bytes, including terminators.
    header_len: usize,

    error: Option<ScanError>,

    /// Cached token positions discovered while looking ahead past a folded
    /// value, relative to the cursor of the *next* call. Negative means
    /// "not cached".
    next_colon: isize,
    next_newline: isize,

    disable_normalizing: bool,
    initialized: bool,
}

impl<'a> HeaderScanner<'a> {
    /// Creates a scanner over an unconsumed header block.
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            key: (0, 0),
            value: (0, 0),
            folded: false,
            header_len: 0,
            error: None,
            next_colon: -1,
            next_newline: -1,
            disable_normalizing: false,
            initialized: false,
        }
    }

    /// Leaves header keys exactly as they appear on the wire instead of
    /// canonicalizing their casing.
    pub fn set_disable_normalizing(&mut self, disable: bool) {
        self.disable_normalizing = disable;
    }

    /// The raw key of the most recently scanned header line.
    #[inline]
    pub fn key(&self) -> &'a [u8] {
        &self.buf[self.key.0..self.key.1]
    }

    /// The key in canonical `Title-Case` form, unless normalization is
    /// disabled. Borrows the buffer when no casing change is needed.
    pub fn normalized_key(&self) -> Cow<'a, [u8]> {
        if self.disable_normalizing {
            return Cow::Borrowed(self.key());
        }
        normalize_header_key(self.key())
    }

    /// The raw value span of the most recently scanned header line. For a
    /// folded value this still contains the embedded line breaks; use
    /// [`normalized_value`](Self::normalized_value) for the logical value.
    #[inline]
    pub fn value(&self) -> &'a [u8] {
        &self.buf[self.value.0..self.value.1]
    }

    /// The logical value with folded line breaks collapsed into single
    /// spaces. Borrows the buffer unless folding actually occurred.
    pub fn normalized_value(&self) -> Cow<'a, [u8]> {
        if !self.folded {
            return Cow::Borrowed(self.value());
        }
        let mut out = Vec::with_capacity(self.value.1 - self.value.0);
        for line in self.value().split(|&b| b == b'\n') {
            let trimmed = trim_ascii(strip_cr(line));
            if trimmed.is_empty() {
                continue;
            }
            if !out.is_empty() {
                out.push(b' ');
            }
            out.extend_from_slice(trimmed);
        }
        Cow::Owned(out)
    }

    /// Whether the most recent value spanned folded continuation lines.
    #[inline]
    pub fn is_folded(&self) -> bool {
        self.folded
    }

    /// The terminal scan error, if any.
    #[inline]
    pub fn error(&self) -> Option<ScanError> {
        self.error
    }

    /// Total bytes consumed so far, including line terminators and, after
    /// the final `next()`, the blank line closing the header block.
    #[inline]
    pub fn consumed(&self) -> usize {
        self.header_len
    }

    /// Advances past exactly one header line.
    ///
    /// Returns `true` when a key/value pair is available, `false` when the
    /// header block ended or scanning cannot proceed (see [`error`](Self::error)).
    pub fn next(&mut self) -> bool {
        if !self.initialized {
            self.next_colon = -1;
            self.next_newline = -1;
            self.initialized = true;
        }
        if self.error.is_some() {
            return false;
        }

        let b = &self.buf[self.pos..];

        // A lone terminator marks the header/body boundary, not an error.
        if b.len() >= 2 && b[0] == b'\r' && b[1] == b'\n' {
            self.pos += 2;
            self.header_len += 2;
            return false;
        }
        if !b.is_empty() && b[0] == b'\n' {
            self.pos += 1;
            self.header_len += 1;
            return false;
        }

        // Locate the colon ending the header name, reusing the position a
        // previous folding lookahead cached.
        let mut n: usize;
        if self.next_colon >= 0 {
            n = self.next_colon as usize;
            self.next_colon = -1;
        } else {
            let colon = memchr(b':', b);
            let newline = memchr(b'\n', b);

            // A header name is always eventually followed by a newline, even
            // the one terminating the block. No newline in sight means the
            // frame is incomplete, and a newline before the colon means the
            // name itself contains a line break.
            let newline = match newline {
                Some(x) => x,
                None => return self.fail(ScanError::NeedMore),
            };
            n = match colon {
                Some(c) => c,
                None => return self.fail(ScanError::NeedMore),
            };
            if newline < n {
                return self.fail(ScanError::InvalidName);
            }
        }

        self.key = (self.pos, self.pos + n);

        // Skip the colon and any following spaces. The cached newline index
        // is relative to the value start, so it shifts back one slot per
        // skipped byte; it may go negative, which simply invalidates it.
        n += 1;
        while self.pos + n < self.buf.len() && self.buf[self.pos + n] == b' ' {
            n += 1;
            self.next_newline -= 1;
        }
        self.header_len += n;
        self.pos += n;

        let b = &self.buf[self.pos..];
        let mut n: usize;
        if self.next_newline >= 0 {
            n = self.next_newline as usize;
            self.next_newline = -1;
        } else {
            n = match memchr(b'\n', b) {
                Some(x) => x,
                None => return self.fail(ScanError::NeedMore),
            };
        }

        // Look ahead across lines starting with space/tab: folded
        // continuations of this value, unless one carries a colon, in which
        // case it is the next header and we cache what we found.
        let mut folded = false;
        loop {
            if n + 1 >= b.len() {
                break;
            }
            if b[n + 1] != b' ' && b[n + 1] != b'\t' {
                break;
            }
            let d = match memchr(b'\n', &b[n + 1..]) {
                Some(0) | None => break,
                Some(d) => d,
            };
            let e = n + d + 1;
            if let Some(c) = memchr(b':', &b[n + 1..e]) {
                self.next_colon = c as isize;
                self.next_newline = d as isize - c as isize - 1;
                break;
            }
            folded = true;
            n = e;
        }
        if n >= b.len() {
            return self.fail(ScanError::NeedMore);
        }

        let value_start = self.pos;
        self.header_len += n + 1;
        self.pos += n + 1;

        // Trim one optional trailing CR and any trailing spaces.
        if n > 0 && b[n - 1] == b'\r' {
            n -= 1;
        }
        while n > 0 && b[n - 1] == b' ' {
            n -= 1;
        }
        self.value = (value_start, value_start + n);
        self.folded = folded;
        true
    }

    #[inline]
    fn fail(&mut self, err: ScanError) -> bool {
        self.error = Some(err);
        false
    }
}

/// A lazy, forward-only iterator over the comma-separated tokens of a single
/// header value. Tokens are trimmed of surrounding spaces and tabs.
#[derive(Debug)]
pub struct HeaderValueScanner<'a> {
    buf: &'a [u8],
}

impl<'a> HeaderValueScanner<'a> {
    pub fn new(value: &'a [u8]) -> Self {
        Self { buf: value }
    }
}

impl<'a> Iterator for HeaderValueScanner<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.buf.is_empty() {
            return None;
        }
        match memchr(b',', self.buf) {
            Some(n) => {
                let token = trim_ascii(&self.buf[..n]);
                self.buf = &self.buf[n + 1..];
                Some(token)
            }
            None => {
                let token = trim_ascii(self.buf);
                self.buf = &self.buf[self.buf.len()..];
                Some(token)
            }
        }
    }
}

/// Case-insensitively checks whether a comma-separated header value contains
/// the given token, e.g. `keep-alive` within `Connection: keep-alive, TE`.
pub fn has_header_value(value: &[u8], token: &[u8]) -> bool {
    HeaderValueScanner::new(value).any(|t| t.eq_ignore_ascii_case(token))
}

/// Canonicalizes a header key into `Title-Case` form, e.g. `content-type`
/// becomes `Content-Type`. Returns a borrowed slice when the key is already
/// canonical, so well-behaved clients stay on the zero-copy path.
pub fn normalize_header_key(key: &[u8]) -> Cow<'_, [u8]> {
    if is_canonical_key(key) {
        return Cow::Borrowed(key);
    }
    let mut out = key.to_vec();
    let mut upper = true;
    for b in out.iter_mut() {
        if upper {
            b.make_ascii_uppercase();
        } else {
            b.make_ascii_lowercase();
        }
        upper = *b == b'-';
    }
    Cow::Owned(out)
}

fn is_canonical_key(key: &[u8]) -> bool {
    let mut upper = true;
    for &b in key {
        if !b.is_ascii_alphabetic() {
            upper = b == b'-';
            continue;
        }
        if upper != b.is_ascii_uppercase() {
            return false;
        }
        upper = false;
    }
    true
}

#[inline]
fn strip_cr(line: &[u8]) -> &[u8] {
    match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    }
}

#[inline]
fn trim_ascii(mut s: &[u8]) -> &[u8] {
    while let Some((b' ' | b'\t', rest)) = s.split_first() {
        s = rest;
    }
    while let Some((b' ' | b'\t', rest)) = s.split_last() {
        s = rest;
    }
    s
}
