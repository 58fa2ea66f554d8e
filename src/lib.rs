//! # flashhttp - A High-Performance HTTP/1.x Connection-Serving Engine
//!
//! flashhttp is an HTTP/1.x server core written in Rust. It covers the
//! path from an accepted socket to a finished response: zero-copy request
//! parsing, a per-connection serve loop with keep-alive and tracing, a
//! cached static file subsystem, and a transport that owns listeners and
//! graceful shutdown.
//!
//! ## Features
//!
//! - **Zero-Copy Parsing**: headers are sliced out of the connection
//!   buffer as `Bytes`; only folded values and odd key casings allocate
//! - **Static Files**: shared entry cache with pooled big-file
//!   descriptors, byte ranges, conditional requests, directory listings
//! - **Stackless Ops**: stack-heavy streaming transforms run on a small
//!   pool of big-stack worker threads instead of bloating every task
//! - **Async I/O**: built on Tokio for handling thousands of concurrent
//!   connections
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            flashhttp                             │
//! │                                                                  │
//! │  ┌────────────┐    ┌───────────────┐    ┌────────────────┐       │
//! │  │ Transport  │───>│  Connection   │───>│    Handler     │       │
//! │  │ (accept,   │    │  serve loop   │    │ (FileServer or │       │
//! │  │  shutdown) │    │  + tracing    │    │  application)  │       │
//! │  └────────────┘    └───────┬───────┘    └───────┬────────┘       │
//! │                            │                    │                │
//! │                            ▼                    ▼                │
//! │  ┌────────────┐    ┌───────────────┐    ┌────────────────┐       │
//! │  │ Stackless  │    │    Header     │    │   FileCache    │       │
//! │  │ dispatcher │    │    scanner    │    │  + sweeper +   │       │
//! │  │            │    │  (zero-copy)  │    │ pooled readers │       │
//! │  └────────────┘    └───────────────┘    └────────────────┘       │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use flashhttp::fs::{FileServer, FileServerOptions};
//! use flashhttp::server::{ServerOptions, Transport};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let handler = Arc::new(FileServer::new(FileServerOptions::new("./public")));
//!     let transport = Transport::new(ServerOptions {
//!         addr: "127.0.0.1:8080".to_string(),
//!         ..Default::default()
//!     });
//!     transport.serve(handler).await
//! }
//! ```
//!
//! Custom handlers implement [`server::Handler`]:
//!
//! ```ignore
//! use flashhttp::server::{Handler, RequestContext};
//! use bytes::Bytes;
//!
//! struct Hello;
//!
//! impl Handler for Hello {
//!     async fn handle(&self, ctx: &mut RequestContext) {
//!         ctx.response.set_content_type("text/plain");
//!         ctx.response.set_body(Bytes::from_static(b"hello"));
//!     }
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`protocol`]: header scanner, request parsing, response encoding
//! - [`server`]: transport, serve loop, trace-event stack
//! - [`fs`]: static file handler, entry cache, pooled readers
//! - [`stackless`]: big-stack worker dispatch for heavy streaming ops
//!
//! ## Design Highlights
//!
//! ### Incremental Parsing
//!
//! The scanner and request parser both distinguish "need more bytes"
//! (recoverable: refill the buffer and parse again from the front) from
//! hard protocol errors. A connection buffer can therefore hold half a
//! request, or five pipelined ones, and the loop behaves identically.
//!
//! ### Reference-Counted File Entries
//!
//! Every open reader holds a count on its cache entry, and the background
//! sweeper only evicts idle entries with a zero count. Big-file readers
//! return their descriptors to a per-entry pool when they are released
//! cleanly, so hot large files don't pay an `open()` per request.
//!
//! ### Trace Stacks
//!
//! The serve loop pushes a stage event as each phase begins and drains the
//! stack LIFO with the request's final outcome. Stages that started always
//! get a finish record, even on failure; stages that never ran leave none.

pub mod fs;
pub mod protocol;
pub mod server;
pub mod stackless;

// Re-export commonly used types for convenience
pub use fs::{FileServer, FileServerOptions};
pub use protocol::{
    HeaderScanner, Method, Request, RequestHeader, Response, StatusCode, Version,
};
pub use server::{
    Handler, RequestContext, ServeConfig, ServerOptions, ServerState, Transport,
};
pub use stackless::{Dispatcher, StacklessWriter, StreamOp};

/// The default port flashhttp listens on
pub const DEFAULT_PORT: u16 = 8080;

/// The default host flashhttp binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of flashhttp
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
