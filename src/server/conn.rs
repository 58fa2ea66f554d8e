//! Connection Serve Loop
//!
//! This module drives one HTTP/1.x connection from accept to close.
//! Each connection gets its own task that runs a state machine over the
//! exchanges on the wire.
//!
//! ## Request Lifecycle
//!
//! ```text
//! 1. Connection handed over by the transport
//!        │
//!        ▼
//! 2. ┌──────────────────────────────────┐
//!    │           Main Loop              │
//!    │                                  │
//!    │  ┌─────────────────────────────┐ │
//!    │  │ Wait for request bytes      │ │  idle timeout between requests
//!    │  └───────────┬─────────────────┘ │
//!    │              ▼                   │
//!    │  ┌─────────────────────────────┐ │
//!    │  │ Parse request head          │ │  size-capped, incremental
//!    │  └───────────┬─────────────────┘ │
//!    │              ▼                   │
//!    │  ┌─────────────────────────────┐ │
//!    │  │ 100-continue / read body    │ │  interim write before body
//!    │  └───────────┬─────────────────┘ │
//!    │              ▼                   │
//!    │  ┌─────────────────────────────┐ │
//!    │  │ Run the application handler │ │  may hijack the connection
//!    │  └───────────┬─────────────────┘ │
//!    │              ▼                   │
//!    │  ┌─────────────────────────────┐ │
//!    │  │ Write response, stream body │ │
//!    │  └───────────┬─────────────────┘ │
//!    │              ▼                   │
//!    │     [keep-alive? loop back]      │
//!    └──────────────────────────────────┘
//!        │
//!        ▼
//! 3. Close / hand off to hijacker
//! ```
//!
//! Every stage pushes a trace event; the per-request stack is drained with
//! the final outcome when the exchange ends, however it ends.
//!
//! ## Buffer Management
//!
//! A single `BytesMut` accumulates incoming data. TCP is a stream: a read
//! may hold a partial request head, or several pipelined requests at once.
//! Parsing restarts from the buffer front after every refill, and parsed
//! heads slice their headers out of a frozen snapshot without copying.

use crate::protocol::{
    decode_chunked, Body, Method, ParseError, Request, RequestHeader, Response,
    StatusCode, Version, CONTINUE_RESPONSE,
};
use crate::server::trace::{EventKind, EventStack, EventStackPool, Outcome, Tracer};
use crate::server::transport::Conn;
use bytes::{Buf, Bytes, BytesMut};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tracing::{debug, info, trace, warn};

/// Initial read buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Chunk size used when streaming reader-backed bodies
const BODY_CHUNK_SIZE: usize = 16 * 1024;

/// Per-connection serving policy.
#[derive(Clone)]
pub struct ServeConfig {
    /// Timeout for reads while inside a request. Zero disables.
    pub read_timeout: Duration,

    /// Timeout for each response write. Zero disables.
    pub write_timeout: Duration,

    /// How long a kept-alive connection may sit idle between requests.
    pub idle_timeout: Duration,

    /// Cap on the request head, request line included.
    pub max_header_size: usize,

    /// Cap on the request body.
    pub max_body_size: usize,

    /// Reject any non-GET request before its body is read.
    pub get_only: bool,

    /// Close every connection after one response.
    pub disable_keep_alive: bool,

    /// Decides whether an `Expect: 100-continue` request may proceed.
    /// `None` accepts everything.
    pub continue_handler: Option<Arc<dyn Fn(&RequestHeader) -> bool + Send + Sync>>,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(180),
            write_timeout: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(60),
            max_header_size: 16 * 1024,
            max_body_size: 4 * 1024 * 1024,
            get_only: false,
            disable_keep_alive: false,
            continue_handler: None,
        }
    }
}

/// Statistics shared across all connections of a server.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub active_connections: AtomicU64,
    /// Total requests served to completion
    pub requests_served: AtomicU64,
    /// Connections handed over to hijackers
    pub connections_hijacked: AtomicU64,
    /// Total bytes read
    pub bytes_read: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn request_served(&self) {
        self.requests_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_hijacked(&self) {
        self.connections_hijacked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written
            .fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// State shared by every connection of one server instance.
pub struct ServerState {
    pub config: ServeConfig,
    pub tracer: Option<Arc<dyn Tracer>>,
    pub stacks: EventStackPool,
    pub stats: ConnectionStats,
}

impl ServerState {
    pub fn new(config: ServeConfig) -> Self {
        Self {
            config,
            tracer: None,
            stacks: EventStackPool::default(),
            stats: ConnectionStats::new(),
        }
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }
}

/// The future a hijacker runs once it owns the connection.
pub type HijackFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Takes ownership of the raw connection after the handler returns.
pub type HijackFn = Box<dyn FnOnce(Conn) -> HijackFuture + Send>;

/// Everything a handler sees for one request.
pub struct RequestContext {
    pub request: Request,
    pub response: Response,
    pub remote_addr: Option<SocketAddr>,
    hijacker: Option<HijackFn>,
}

impl RequestContext {
    pub fn new(request: Request, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            request,
            response: Response::new(),
            remote_addr,
            hijacker: None,
        }
    }

    /// Claims the connection. After the handler returns, no response is
    /// written; the raw stream is handed to `f` instead and the serve loop
    /// ends.
    pub fn hijack(&mut self, f: HijackFn) {
        self.hijacker = Some(f);
    }

    pub(crate) fn take_hijacker(&mut self) -> Option<HijackFn> {
        self.hijacker.take()
    }
}

/// An application request handler.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, ctx: &mut RequestContext) -> impl Future<Output = ()> + Send;
}

/// Errors that end a connection.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed request
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// The request head outgrew the configured cap
    #[error("request head too large")]
    HeaderTooLarge,

    /// The request body outgrew the configured cap
    #[error("request body too large")]
    BodyTooLarge,

    /// A non-GET request arrived on a GET-only server
    #[error("non-GET request on a GET-only server")]
    GetOnlyViolation,

    /// The peer vanished in the middle of a request
    #[error("unexpected end of stream")]
    UnexpectedEof,

    /// The peer stopped accepting our response
    #[error("connection failed while writing response: {0}")]
    ShortConnection(#[source] io::Error),
}

enum NextStep {
    KeepAlive,
    Close,
    Hijack(HijackFn),
}

/// Serves a single connection.
pub struct ConnectionHandler<H: Handler> {
    stream: BufWriter<Conn>,
    addr: Option<SocketAddr>,
    buffer: BytesMut,
    handler: Arc<H>,
    state: Arc<ServerState>,
    served: u64,
}

impl<H: Handler> ConnectionHandler<H> {
    pub fn new(
        conn: Conn,
        addr: Option<SocketAddr>,
        handler: Arc<H>,
        state: Arc<ServerState>,
    ) -> Self {
        state.stats.connection_opened();

        Self {
            stream: BufWriter::new(conn),
            addr,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            handler,
            state,
            served: 0,
        }
    }

    /// Runs the connection to completion.
    pub async fn run(mut self) -> Result<(), ServeError> {
        info!(client = ?self.addr, "Connection opened");

        let result = match self.main_loop().await {
            Ok(Some(hijacker)) => {
                self.state.stats.connection_hijacked();
                debug!(client = ?self.addr, "Connection handed to hijacker");
                hijacker(self.stream.into_inner()).await;
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };

        match &result {
            Ok(()) => {
                debug!(client = ?self.addr, requests = self.served, "Connection closed")
            }
            Err(ServeError::UnexpectedEof) => {
                debug!(client = ?self.addr, "Client went away mid-request")
            }
            Err(ServeError::Io(e)) if e.kind() == io::ErrorKind::ConnectionReset => {
                debug!(client = ?self.addr, "Connection reset by client")
            }
            Err(e) => warn!(client = ?self.addr, error = %e, "Connection error"),
        }

        self.state.stats.connection_closed();
        result
    }

    /// The request loop. Returns a hijacker if a handler claimed the
    /// connection.
    async fn main_loop(&mut self) -> Result<Option<HijackFn>, ServeError> {
        loop {
            // Wait for the first bytes of the next request. A quiet close
            // between requests is a normal ending.
            if self.buffer.is_empty() {
                let wait = if self.served > 0 {
                    self.state.config.idle_timeout
                } else {
                    self.state.config.read_timeout
                };
                match self.fill(wait).await {
                    Ok(0) => return Ok(None),
                    Ok(_) => {}
                    Err(ServeError::Io(e))
                        if e.kind() == io::ErrorKind::TimedOut && self.served > 0 =>
                    {
                        debug!(client = ?self.addr, "Idle connection timed out");
                        return Ok(None);
                    }
                    Err(e) => return Err(e),
                }
            }

            let mut events = self.state.stacks.get();
            let result = self.serve_request(&mut events).await;

            let outcome = match &result {
                Ok(NextStep::Hijack(_)) => Outcome::Hijacked,
                Ok(_) => Outcome::Completed,
                Err(_) => Outcome::Failed,
            };
            events.finalize(outcome, self.state.tracer.as_deref());
            self.state.stacks.put(events);

            match result {
                Ok(step) => {
                    self.served += 1;
                    self.state.stats.request_served();
                    match step {
                        NextStep::KeepAlive => continue,
                        NextStep::Close => return Ok(None),
                        NextStep::Hijack(hijacker) => return Ok(Some(hijacker)),
                    }
                }
                Err(e) => {
                    self.try_send_error(&e).await;
                    return Err(e);
                }
            }
        }
    }

    /// Serves one exchange: head, body, handler, response.
    async fn serve_request(
        &mut self,
        events: &mut EventStack,
    ) -> Result<NextStep, ServeError> {
        events.push(EventKind::HttpStart);
        events.push(EventKind::ReadHeader);
        let head = self.read_head().await?;

        if self.state.config.get_only && head.method != Method::Get {
            return Err(ServeError::GetOnlyViolation);
        }

        if head.expect_continue {
            let accept = self
                .state
                .config
                .continue_handler
                .as_ref()
                .map(|f| f(&head))
                .unwrap_or(true);
            if accept {
                // The interim response must reach the client before it
                // starts sending the body.
                self.send(CONTINUE_RESPONSE).await?;
                self.flush().await?;
            } else {
                events.push(EventKind::Write);
                let resp = Response::expectation_failed();
                self.write_head_and_bytes(&resp, head.version).await?;
                // The declared body was never read, so the framing on this
                // connection is gone.
                return Ok(NextStep::Close);
            }
        }

        let body = if head.has_body() {
            events.push(EventKind::ReadBody);
            self.read_body(&head).await?
        } else {
            Bytes::new()
        };

        events.push(EventKind::ServerHandle);
        let mut ctx = RequestContext::new(Request::new(head, body), self.addr);
        self.handler.handle(&mut ctx).await;

        if let Some(hijacker) = ctx.take_hijacker() {
            self.flush().await?;
            return Ok(NextStep::Hijack(hijacker));
        }

        events.push(EventKind::Write);
        let keep_alive = ctx.request.header.should_keep_alive()
            && !ctx.response.connection_close
            && !self.state.config.disable_keep_alive;
        self.write_response(&mut ctx, keep_alive).await?;

        trace!(
            client = ?self.addr,
            status = ctx.response.status.code(),
            keep_alive = keep_alive,
            "Request served"
        );

        Ok(if keep_alive {
            NextStep::KeepAlive
        } else {
            NextStep::Close
        })
    }

    /// Reads until a complete request head is buffered, then parses it.
    /// Parsed headers reference a frozen snapshot of the buffered bytes.
    async fn read_head(&mut self) -> Result<RequestHeader, ServeError> {
        loop {
            if !self.buffer.is_empty() {
                let snapshot = Bytes::copy_from_slice(&self.buffer);
                match RequestHeader::parse(&snapshot) {
                    Ok((head, consumed)) => {
                        // The cap applies to complete heads too; a whole
                        // oversized head can land in a single read.
                        if consumed > self.state.config.max_header_size {
                            return Err(ServeError::HeaderTooLarge);
                        }
                        self.buffer.advance(consumed);
                        return Ok(head);
                    }
                    Err(ParseError::Incomplete) => {
                        if self.buffer.len() > self.state.config.max_header_size {
                            return Err(ServeError::HeaderTooLarge);
                        }
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            if self.fill(self.state.config.read_timeout).await? == 0 {
                return Err(ServeError::UnexpectedEof);
            }
        }
    }

    /// Reads the request body per the head's framing.
    async fn read_body(&mut self, head: &RequestHeader) -> Result<Bytes, ServeError> {
        let max = self.state.config.max_body_size;

        if head.chunked {
            loop {
                match decode_chunked(&self.buffer)? {
                    Some((body, consumed)) => {
                        if body.len() > max {
                            return Err(ServeError::BodyTooLarge);
                        }
                        self.buffer.advance(consumed);
                        return Ok(body);
                    }
                    None => {
                        // Chunk framing adds overhead on top of the payload;
                        // a generous cap still bounds a hostile stream.
                        if self.buffer.len() > max.saturating_add(max / 4 + 1024) {
                            return Err(ServeError::BodyTooLarge);
                        }
                        if self.fill(self.state.config.read_timeout).await? == 0 {
                            return Err(ServeError::UnexpectedEof);
                        }
                    }
                }
            }
        } else {
            let len = head.content_length.unwrap_or(0);
            if len > max {
                return Err(ServeError::BodyTooLarge);
            }
            while self.buffer.len() < len {
                if self.fill(self.state.config.read_timeout).await? == 0 {
                    return Err(ServeError::UnexpectedEof);
                }
            }
            Ok(self.buffer.split_to(len).freeze())
        }
    }

    /// Writes the full response: head, then the body (buffered or
    /// streamed). HEAD responses keep their length but skip the payload.
    async fn write_response(
        &mut self,
        ctx: &mut RequestContext,
        keep_alive: bool,
    ) -> Result<(), ServeError> {
        let mut head = BytesMut::with_capacity(256);
        ctx.response
            .encode_head(&mut head, ctx.request.header.version, keep_alive);
        self.send(&head).await?;

        let skip_body = ctx.response.skip_body;
        match &mut ctx.response.body {
            Body::Empty => {}
            Body::Bytes(payload) => {
                if !skip_body && !payload.is_empty() {
                    let payload = payload.clone();
                    self.send(&payload).await?;
                }
            }
            Body::Reader { reader, .. } => {
                if skip_body {
                    reader.close()?;
                } else {
                    let mut chunk = vec![0u8; BODY_CHUNK_SIZE];
                    loop {
                        let n = match reader.read(&mut chunk) {
                            Ok(n) => n,
                            Err(e) => {
                                let _ = reader.close();
                                return Err(ServeError::Io(e));
                            }
                        };
                        if n == 0 {
                            break;
                        }
                        if let Err(e) = self.send_raw(&chunk[..n]).await {
                            let _ = reader.close();
                            return Err(e);
                        }
                    }
                    reader.close()?;
                }
            }
        }

        self.flush().await
    }

    async fn write_head_and_bytes(
        &mut self,
        resp: &Response,
        version: Version,
    ) -> Result<(), ServeError> {
        let mut out = BytesMut::with_capacity(256);
        resp.encode_head(&mut out, version, false);
        if let Body::Bytes(b) = &resp.body {
            out.extend_from_slice(b);
        }
        self.send(&out).await?;
        self.flush().await
    }

    /// Reads more data into the buffer. Returns the byte count; 0 means
    /// the peer closed its write side.
    async fn fill(&mut self, timeout: Duration) -> Result<usize, ServeError> {
        if self.buffer.capacity() - self.buffer.len() < 1024 {
            self.buffer.reserve(4096);
        }

        let n = maybe_timeout(timeout, self.stream.get_mut().read_buf(&mut self.buffer))
            .await?;
        self.state.stats.bytes_read(n);
        trace!(client = ?self.addr, bytes = n, "Read data");
        Ok(n)
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), ServeError> {
        self.send_raw(data).await
    }

    async fn send_raw(&mut self, data: &[u8]) -> Result<(), ServeError> {
        maybe_timeout(self.state.config.write_timeout, self.stream.write_all(data))
            .await
            .map_err(ServeError::ShortConnection)?;
        self.state.stats.bytes_written(data.len());
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), ServeError> {
        maybe_timeout(self.state.config.write_timeout, self.stream.flush())
            .await
            .map_err(ServeError::ShortConnection)
    }

    /// Best-effort error response before tearing the connection down.
    async fn try_send_error(&mut self, err: &ServeError) {
        let status = match err {
            ServeError::Parse(_) | ServeError::GetOnlyViolation => StatusCode::BadRequest,
            ServeError::HeaderTooLarge => StatusCode::HeaderFieldsTooLarge,
            ServeError::BodyTooLarge => StatusCode::PayloadTooLarge,
            _ => return,
        };
        let mut resp = Response::error(status, status.reason());
        resp.connection_close = true;
        let _ = self.write_head_and_bytes(&resp, Version::Http11).await;
    }
}

async fn maybe_timeout<F, T>(duration: Duration, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    if duration.is_zero() {
        fut.await
    } else {
        match tokio::time::timeout(duration, fut).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "operation timed out")),
        }
    }
}

/// Serves a connection to completion, logging but not propagating errors.
pub async fn handle_connection<H: Handler>(
    conn: Conn,
    addr: Option<SocketAddr>,
    handler: Arc<H>,
    state: Arc<ServerState>,
) {
    let handler = ConnectionHandler::new(conn, addr, handler, state);
    if let Err(e) = handler.run().await {
        match e {
            ServeError::UnexpectedEof => {}
            ServeError::Io(ref io_err)
                if io_err.kind() == io::ErrorKind::ConnectionReset => {}
            _ => {
                debug!(client = ?addr, error = %e, "Connection ended with error");
            }
        }
    }
}
