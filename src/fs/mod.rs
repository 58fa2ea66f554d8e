//! Static File Serving
//!
//! This module implements the static file subsystem: a request handler that
//! maps URL paths onto a directory tree and serves files through a shared,
//! swept cache of open entries.
//!
//! ## Overview
//!
//! ```text
//! ┌──────────────┐   lookup    ┌──────────────────────────────────────┐
//! │  FileServer  │────────────>│              FileCache               │
//! │  (Handler)   │             │  identity map     compressed map     │
//! └──────┬───────┘             │  path -> FsFile   path -> FsFile     │
//!        │                     └───────────┬──────────────────────────┘
//!        │ reader                          │ evict idle, zero-reader
//!        ▼                                 ▼
//! ┌──────────────┐              ┌──────────────────┐
//! │ Big / Small  │              │   CacheSweeper   │
//! │ FileReader   │              │ (background task)│
//! └──────────────┘              └──────────────────┘
//! ```
//!
//! - Files above the small-file threshold get a dedicated pooled descriptor
//!   per reader; smaller files and generated directory indexes are served
//!   through readers with no descriptor of their own.
//! - Byte ranges, `If-Modified-Since`, index files, generated directory
//!   listings, and pre-compressed sibling files (`name.flashhttp.gz`) are
//!   handled here.
//! - Requests can never resolve outside the configured root: `..` segments
//!   are rejected outright.

pub mod cache;
pub mod sweeper;

// Re-export commonly used types for convenience
pub use cache::{BigFileReader, CacheKind, FileCache, FileReader, FsFile, SmallFileReader};
pub use sweeper::{CacheSweeper, SweepConfig};

use crate::protocol::{has_header_value, parse_byte_range, Method, Response, StatusCode};
use crate::server::{Handler, RequestContext};
use bytes::Bytes;
use crossbeam::queue::ArrayQueue;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Files at or below this size share the entry's descriptor instead of
/// opening one per reader.
pub const DEFAULT_SMALL_FILE_LIMIT: usize = 8 * 1024;

/// Suffix probed for pre-compressed sibling files.
pub const COMPRESSED_FILE_SUFFIX: &str = ".flashhttp.gz";

const SMALL_READER_POOL_SIZE: usize = 256;

/// Rewrites the raw request path before it is resolved against the root.
pub type PathRewriteFn = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// Invoked when no file matches the request.
pub type NotFoundFn = Arc<dyn Fn(&mut RequestContext) + Send + Sync>;

/// Configuration for a [`FileServer`].
#[derive(Clone)]
pub struct FileServerOptions {
    /// Directory the URL space maps onto.
    pub root: PathBuf,

    /// File names probed, in order, when a directory is requested.
    pub index_names: Vec<String>,

    /// Generate an HTML listing for directories with no index file.
    pub generate_index_pages: bool,

    /// Honor single-range `Range` requests with 206 responses.
    pub accept_byte_ranges: bool,

    /// Serve `name + suffix` siblings to clients that accept gzip.
    pub compress: bool,

    /// Suffix of pre-compressed sibling files.
    pub compressed_suffix: String,

    /// Size threshold separating small readers from big readers.
    pub small_file_limit: usize,

    /// Sweeper settings for the entry cache.
    pub sweep: SweepConfig,

    /// Optional request path rewrite, applied before decoding.
    pub path_rewrite: Option<PathRewriteFn>,

    /// Optional not-found responder, replacing the default text response.
    pub path_not_found: Option<NotFoundFn>,
}

impl Default for FileServerOptions {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            index_names: vec!["index.html".to_string()],
            generate_index_pages: false,
            accept_byte_ranges: true,
            compress: false,
            compressed_suffix: COMPRESSED_FILE_SUFFIX.to_string(),
            small_file_limit: DEFAULT_SMALL_FILE_LIMIT,
            sweep: SweepConfig::default(),
            path_rewrite: None,
            path_not_found: None,
        }
    }
}

impl FileServerOptions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }
}

/// A request handler serving files from a directory tree.
pub struct FileServer {
    options: FileServerOptions,
    cache: Arc<FileCache>,
    small_readers: Arc<ArrayQueue<SmallFileReader>>,
    _sweeper: CacheSweeper,
}

impl FileServer {
    /// Creates a file server and starts its cache sweeper. Must be called
    /// within a Tokio runtime.
    pub fn new(options: FileServerOptions) -> Self {
        let cache = Arc::new(FileCache::new());
        let sweeper = CacheSweeper::start(Arc::clone(&cache), options.sweep.clone());
        Self {
            options,
            cache,
            small_readers: Arc::new(ArrayQueue::new(SMALL_READER_POOL_SIZE)),
            _sweeper: sweeper,
        }
    }

    #[cfg(test)]
    pub(crate) fn cache(&self) -> &Arc<FileCache> {
        &self.cache
    }

    fn serve(&self, ctx: &mut RequestContext) {
        if !matches!(ctx.request.method(), Method::Get | Method::Head) {
            ctx.response =
                Response::error(StatusCode::MethodNotAllowed, "Method Not Allowed");
            ctx.response.set_header("Allow", "GET, HEAD");
            return;
        }

        let raw = ctx.request.path().clone();
        let raw_path = strip_query(&raw);
        let rewritten = match &self.options.path_rewrite {
            Some(rewrite) => rewrite(raw_path),
            None => raw_path.to_vec(),
        };

        let rel = match decode_percent(&rewritten).and_then(|p| sanitize_path(&p)) {
            Some(rel) => rel,
            None => {
                debug!(path = %String::from_utf8_lossy(raw_path), "rejecting unsafe path");
                self.not_found(ctx);
                return;
            }
        };
        let mut fs_path = self.options.root.join(rel);

        let mut meta = match std::fs::metadata(&fs_path) {
            Ok(m) => m,
            Err(_) => {
                self.not_found(ctx);
                return;
            }
        };

        if meta.is_dir() {
            // Directory URLs must be slash-terminated so relative links in
            // index pages resolve.
            if raw_path.last() != Some(&b'/') {
                let mut location = String::from_utf8_lossy(raw_path).into_owned();
                location.push('/');
                ctx.response.status = StatusCode::MovedPermanently;
                ctx.response.set_header("Location", location);
                return;
            }

            match self.resolve_dir(&fs_path) {
                DirResolution::IndexFile(candidate, m) => {
                    fs_path = candidate;
                    meta = m;
                }
                DirResolution::GeneratedIndex => {
                    self.serve_dir_index(ctx, &fs_path, &raw);
                    return;
                }
                DirResolution::NotFound => {
                    self.not_found(ctx);
                    return;
                }
            }
        }

        // Prefer a pre-compressed sibling when the client accepts gzip.
        let mut kind = CacheKind::Identity;
        if self.options.compress && accepts_gzip(ctx) {
            let mut compressed = fs_path.as_os_str().to_owned();
            compressed.push(&self.options.compressed_suffix);
            if Path::new(&compressed).is_file() {
                kind = CacheKind::Compressed;
            }
        }

        let entry = match self.lookup(kind, &fs_path, &meta) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(path = %fs_path.display(), error = %e, "failed to open file");
                self.not_found(ctx);
                return;
            }
        };

        self.respond_with_entry(ctx, &entry, kind);
    }

    fn resolve_dir(&self, dir: &Path) -> DirResolution {
        for name in &self.options.index_names {
            let candidate = dir.join(name);
            if let Ok(m) = std::fs::metadata(&candidate) {
                if m.is_file() {
                    return DirResolution::IndexFile(candidate, m);
                }
            }
        }
        if self.options.generate_index_pages {
            DirResolution::GeneratedIndex
        } else {
            DirResolution::NotFound
        }
    }

    fn lookup(
        &self,
        kind: CacheKind,
        fs_path: &Path,
        meta: &std::fs::Metadata,
    ) -> io::Result<Arc<FsFile>> {
        if let Some(entry) = self.cache.get(kind, fs_path) {
            return Ok(entry);
        }

        let open_path = match kind {
            CacheKind::Identity => fs_path.to_path_buf(),
            CacheKind::Compressed => {
                let mut p = fs_path.as_os_str().to_owned();
                p.push(&self.options.compressed_suffix);
                PathBuf::from(p)
            }
        };
        let file = File::open(&open_path)?;
        let open_meta = file.metadata()?;
        let len = open_meta.len() as usize;
        let modified = meta.modified().unwrap_or(UNIX_EPOCH);

        let entry = FsFile::from_file(
            open_path,
            file,
            len,
            content_type_for(fs_path).to_string(),
            modified,
            http_date(modified),
            kind == CacheKind::Compressed,
            len > self.options.small_file_limit,
        );
        Ok(self.cache.insert(kind, fs_path.to_path_buf(), entry))
    }

    fn serve_dir_index(&self, ctx: &mut RequestContext, dir: &Path, raw_path: &[u8]) {
        let display = String::from_utf8_lossy(strip_query(raw_path)).into_owned();
        let entry = match self.cache.get(CacheKind::Identity, dir) {
            Some(entry) => entry,
            None => {
                let page = match generate_index_page(dir, &display) {
                    Ok(page) => page,
                    Err(e) => {
                        warn!(path = %dir.display(), error = %e, "directory listing failed");
                        self.not_found(ctx);
                        return;
                    }
                };
                let now = SystemTime::now();
                self.cache.insert(
                    CacheKind::Identity,
                    dir.to_path_buf(),
                    FsFile::from_dir_index(dir.to_path_buf(), page, now, http_date(now)),
                )
            }
        };
        self.respond_with_entry(ctx, &entry, CacheKind::Identity);
    }

    fn respond_with_entry(
        &self,
        ctx: &mut RequestContext,
        entry: &Arc<FsFile>,
        kind: CacheKind,
    ) {
        // An unchanged entity short-circuits before any reader is taken.
        if let Some(ims) = ctx.request.header.header(b"If-Modified-Since") {
            if ims.as_ref() == entry.last_modified_str.as_bytes() {
                ctx.response.status = StatusCode::NotModified;
                ctx.response
                    .set_header("Last-Modified", entry.last_modified_str.clone());
                return;
            }
        }

        let mut reader = match self.entry_reader(entry) {
            Ok(reader) => reader,
            Err(e) => {
                warn!(error = %e, "failed to acquire file reader");
                ctx.response =
                    Response::error(StatusCode::InternalServerError, "Internal Server Error");
                return;
            }
        };

        let total = entry.content_length;
        let mut body_len = total;

        if self.options.accept_byte_ranges {
            ctx.response.set_header("Accept-Ranges", "bytes");
            if let Some(range) = ctx.request.header.header(b"Range") {
                match parse_byte_range(range, total) {
                    // Unsupported range forms fall through to the whole
                    // entity.
                    None => {}
                    Some(Err(())) => {
                        let _ = reader.close();
                        ctx.response = Response::error(
                            StatusCode::RangeNotSatisfiable,
                            "Range Not Satisfiable",
                        );
                        ctx.response
                            .set_header("Content-Range", format!("bytes */{total}"));
                        return;
                    }
                    Some(Ok(r)) => {
                        if let Err(e) = reader.update_byte_range(r.start, r.end) {
                            let _ = reader.close();
                            warn!(error = %e, "failed to position range reader");
                            ctx.response = Response::error(
                                StatusCode::InternalServerError,
                                "Internal Server Error",
                            );
                            return;
                        }
                        ctx.response.set_content_range(r.start, r.end, total);
                        body_len = r.end - r.start + 1;
                    }
                }
            }
        }

        ctx.response.set_content_type(&entry.content_type);
        ctx.response
            .set_header("Last-Modified", entry.last_modified_str.clone());
        if kind == CacheKind::Compressed {
            ctx.response.set_header("Content-Encoding", "gzip");
            ctx.response.set_header("Vary", "Accept-Encoding");
        }
        if ctx.request.method() == Method::Head {
            ctx.response.skip_body = true;
        }
        ctx.response.set_body_reader(reader, body_len);
    }

    fn entry_reader(&self, entry: &Arc<FsFile>) -> io::Result<Box<dyn FileReader>> {
        if entry.is_big() {
            entry.reader()
        } else {
            let mut shell = self.small_readers.pop().unwrap_or_default();
            entry.bind_small_reader(&mut shell);
            shell.attach_pool(Arc::clone(&self.small_readers));
            Ok(Box::new(shell))
        }
    }

    fn not_found(&self, ctx: &mut RequestContext) {
        match &self.options.path_not_found {
            Some(handler) => handler(ctx),
            None => {
                ctx.response = Response::error(StatusCode::NotFound, "path open failed");
            }
        }
    }
}

impl Handler for FileServer {
    async fn handle(&self, ctx: &mut RequestContext) {
        self.serve(ctx);
    }
}

enum DirResolution {
    IndexFile(PathBuf, std::fs::Metadata),
    GeneratedIndex,
    NotFound,
}

fn strip_query(path: &[u8]) -> &[u8] {
    match memchr::memchr(b'?', path) {
        Some(i) => &path[..i],
        None => path,
    }
}

fn accepts_gzip(ctx: &RequestContext) -> bool {
    ctx.request
        .header
        .header(b"Accept-Encoding")
        .map(|v| has_header_value(v, b"gzip"))
        .unwrap_or(false)
}

fn decode_percent(raw: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        match raw[i] {
            b'%' => {
                let hi = hex_digit(*raw.get(i + 1)?)?;
                let lo = hex_digit(*raw.get(i + 2)?)?;
                out.push(hi << 4 | lo);
                i += 3;
            }
            0 => return None,
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    Some(out)
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Turns a decoded URL path into a relative filesystem path. Any `..`
/// segment, or an embedded NUL, rejects the whole path.
fn sanitize_path(path: &[u8]) -> Option<PathBuf> {
    if path.contains(&0) {
        return None;
    }
    let s = std::str::from_utf8(path).ok()?;
    let mut rel = PathBuf::new();
    for comp in s.split('/') {
        match comp {
            "" | "." => {}
            ".." => return None,
            c => rel.push(c),
        }
    }
    Some(rel)
}

/// Maps a file extension to its `Content-Type`.
fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" => "text/javascript; charset=utf-8",
        "json" => "application/json",
        "txt" => "text/plain; charset=utf-8",
        "xml" => "application/xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "pdf" => "application/pdf",
        "wasm" => "application/wasm",
        "mp4" => "video/mp4",
        "woff2" => "font/woff2",
        _ => "application/octet-stream",
    }
}

fn generate_index_page(dir: &Path, display_path: &str) -> io::Result<Bytes> {
    let mut names: Vec<(String, bool)> = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Ok(name) = entry.file_name().into_string() {
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            names.push((name, is_dir));
        }
    }
    names.sort();

    let title = escape_html(display_path);
    let mut page = String::with_capacity(256 + names.len() * 64);
    page.push_str("<html><head><title>");
    page.push_str(&title);
    page.push_str("</title></head><body><h1>");
    page.push_str(&title);
    page.push_str("</h1><ul>");
    for (name, is_dir) in &names {
        let shown = escape_html(name);
        page.push_str("<li><a href=\"");
        page.push_str(&shown);
        if *is_dir {
            page.push('/');
        }
        page.push_str("\">");
        page.push_str(&shown);
        if *is_dir {
            page.push('/');
        }
        page.push_str("</a></li>");
    }
    page.push_str("</ul></body></html>");
    Ok(Bytes::from(page))
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

const DAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];
const MONTH_NAMES: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// Renders a timestamp as an IMF-fixdate, e.g.
/// `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn http_date(t: SystemTime) -> String {
    let secs = t
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let days = secs.div_euclid(86_400);
    let rem = secs.rem_euclid(86_400);
    let (hh, mm, ss) = (rem / 3600, (rem % 3600) / 60, rem % 60);
    let weekday = (days + 4).rem_euclid(7) as usize;

    // Civil-from-days conversion over 400-year eras.
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + i64::from(month <= 2);

    format!(
        "{}, {:02} {} {} {:02}:{:02}:{:02} GMT",
        DAY_NAMES[weekday],
        day,
        MONTH_NAMES[(month - 1) as usize],
        year,
        hh,
        mm,
        ss
    )
}
