//! HTTP Server Core
//!
//! This module contains everything between an accepted socket and the
//! application handler:
//!
//! - `transport`: listeners, the accept loop, lifecycle hooks, shutdown
//! - `conn`: the per-connection serve loop and its policy knobs
//! - `trace`: pooled per-request stage tracing
//!
//! ## Example
//!
//! ```ignore
//! use flashhttp::server::{ServerOptions, Transport};
//! use flashhttp::fs::{FileServer, FileServerOptions};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let transport = Transport::new(ServerOptions::default());
//!     let handler = Arc::new(FileServer::new(FileServerOptions::new("./public")));
//!     transport.serve(handler).await
//! }
//! ```

pub mod conn;
pub mod trace;
pub mod transport;

// Re-export commonly used types for convenience
pub use conn::{
    handle_connection, ConnectionHandler, ConnectionStats, Handler, HijackFn,
    HijackFuture, RequestContext, ServeConfig, ServeError, ServerState,
};
pub use trace::{EventKind, EventStack, EventStackPool, Outcome, RecordingTracer, TraceRecord, Tracer};
pub use transport::{
    AcceptHook, Conn, ConnectHook, ListenerHook, Network, ServerOptions, Transport,
};
