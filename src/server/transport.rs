//! Transport Lifecycle
//!
//! This module owns the listening side of the server: binding, the accept
//! loop, per-connection task spawning, and graceful shutdown. The serve
//! loop never touches a listener; it is handed an accepted [`Conn`].
//!
//! ## Hooks
//!
//! Two callbacks observe the connection lifecycle, with deliberately
//! different timing:
//!
//! - the **accept hook** runs on the accept loop before any task is
//!   spawned; no request data is readable yet, and returning `false`
//!   closes the connection on the spot
//! - the **connect hook** runs inside the connection's own task, right
//!   before serving begins
//!
//! ## Shutdown
//!
//! `shutdown(grace)` stops the accept loop, then waits up to `grace` for
//! in-flight connections to drain. Connections still running at the
//! deadline are left to finish on their own; the transport just stops
//! waiting for them.

use crate::server::conn::{handle_connection, ConnectionStats, Handler, ServeConfig, ServerState};
use crate::server::trace::Tracer;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, OnceLock};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// An accepted connection, independent of the listener flavor.
pub enum Conn {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Conn {
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            Conn::Tcp(s) => s.peer_addr().ok(),
            #[cfg(unix)]
            Conn::Unix(_) => None,
        }
    }
}

impl AsyncRead for Conn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            Conn::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Conn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Conn::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            Conn::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            Conn::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            Conn::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Listener flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    #[cfg(unix)]
    Unix,
}

/// Runs on the accept loop, before the connection task exists.
pub type AcceptHook = Arc<dyn Fn(Option<SocketAddr>) -> bool + Send + Sync>;

/// Runs inside the connection task, before serving starts.
pub type ConnectHook = Arc<dyn Fn(Option<SocketAddr>) + Send + Sync>;

/// Supplies a pre-configured TCP listener instead of a plain bind, for
/// socket options or wrapped listeners.
pub type ListenerHook = Arc<dyn Fn(&str) -> io::Result<std::net::TcpListener> + Send + Sync>;

/// Transport configuration.
#[derive(Clone)]
pub struct ServerOptions {
    pub network: Network,

    /// `host:port` for TCP, a filesystem path for unix sockets.
    pub addr: String,

    /// Per-connection serving policy.
    pub serve: ServeConfig,

    /// Default grace period for [`Transport::shutdown`].
    pub shutdown_grace: Duration,

    pub on_accept: Option<AcceptHook>,
    pub on_connect: Option<ConnectHook>,
    pub tcp_listener: Option<ListenerHook>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            network: Network::Tcp,
            addr: "127.0.0.1:8080".to_string(),
            serve: ServeConfig::default(),
            shutdown_grace: Duration::from_secs(5),
            on_accept: None,
            on_connect: None,
            tcp_listener: None,
        }
    }
}

enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl Listener {
    async fn accept(&self) -> io::Result<(Conn, Option<SocketAddr>)> {
        match self {
            Listener::Tcp(l) => {
                let (stream, peer) = l.accept().await?;
                Ok((Conn::Tcp(stream), Some(peer)))
            }
            #[cfg(unix)]
            Listener::Unix(l) => {
                let (stream, _) = l.accept().await?;
                Ok((Conn::Unix(stream), None))
            }
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Listener::Tcp(l) => l.local_addr().ok(),
            #[cfg(unix)]
            Listener::Unix(_) => None,
        }
    }
}

/// Binds, accepts, and shuts down a server.
pub struct Transport {
    options: ServerOptions,
    state: Arc<ServerState>,
    listener: Mutex<Option<Listener>>,
    local_addr: OnceLock<SocketAddr>,
    shutdown_tx: watch::Sender<bool>,
}

impl Transport {
    pub fn new(options: ServerOptions) -> Self {
        let state = ServerState::new(options.serve.clone());
        Self::with_state(options, state)
    }

    /// Builds a transport around pre-configured shared state, e.g. one
    /// carrying a tracer.
    pub fn with_state(options: ServerOptions, state: ServerState) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            options,
            state: Arc::new(state),
            listener: Mutex::new(None),
            local_addr: OnceLock::new(),
            shutdown_tx,
        }
    }

    pub fn with_tracer(options: ServerOptions, tracer: Arc<dyn Tracer>) -> Self {
        let state = ServerState::new(options.serve.clone()).with_tracer(tracer);
        Self::with_state(options, state)
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.state.stats
    }

    /// The bound TCP address, available after [`Transport::listen`].
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Binds the listener without starting the accept loop.
    pub async fn listen(&self) -> io::Result<()> {
        let listener = match self.options.network {
            Network::Tcp => {
                let listener = match &self.options.tcp_listener {
                    Some(hook) => {
                        let std_listener = hook(&self.options.addr)?;
                        std_listener.set_nonblocking(true)?;
                        TcpListener::from_std(std_listener)?
                    }
                    None => TcpListener::bind(&self.options.addr).await?,
                };
                Listener::Tcp(listener)
            }
            #[cfg(unix)]
            Network::Unix => {
                // A stale socket file from a previous run would make the
                // bind fail.
                let _ = std::fs::remove_file(&self.options.addr);
                Listener::Unix(UnixListener::bind(&self.options.addr)?)
            }
        };

        if let Some(addr) = listener.local_addr() {
            let _ = self.local_addr.set(addr);
        }
        if let Ok(mut slot) = self.listener.lock() {
            *slot = Some(listener);
        }
        Ok(())
    }

    /// Runs the accept loop until shutdown is requested.
    pub async fn serve<H: Handler>(&self, handler: Arc<H>) -> io::Result<()> {
        let bound = self
            .listener
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false);
        if !bound {
            self.listen().await?;
        }
        let listener = self
            .listener
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::Other, "transport is already serving")
            })?;

        info!(addr = %self.options.addr, "Server listening");
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (conn, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "Accept failed");
                            continue;
                        }
                    };

                    // Runs before the task exists; rejecting here drops the
                    // connection without reading a byte.
                    if let Some(hook) = &self.options.on_accept {
                        if !hook(peer) {
                            debug!(client = ?peer, "Connection rejected by accept hook");
                            continue;
                        }
                    }

                    let handler = Arc::clone(&handler);
                    let state = Arc::clone(&self.state);
                    let on_connect = self.options.on_connect.clone();
                    tokio::spawn(async move {
                        if let Some(hook) = &on_connect {
                            hook(peer);
                        }
                        handle_connection(conn, peer, handler, state).await;
                    });
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        drop(listener);
        self.cleanup();
        info!(addr = %self.options.addr, "Server stopped accepting");
        Ok(())
    }

    /// Stops accepting and waits up to `grace` for in-flight connections.
    /// The unix socket file, if any, is removed before this returns.
    pub async fn shutdown(&self, grace: Duration) {
        let _ = self.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let active = self.state.stats.active_connections.load(Ordering::Relaxed);
            if active == 0 {
                info!("Shutdown complete");
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(in_flight = active, "Shutdown deadline expired");
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.cleanup();
    }

    /// Stops accepting without waiting for in-flight connections.
    pub async fn close(&self) {
        self.shutdown(Duration::ZERO).await;
    }

    fn cleanup(&self) {
        #[cfg(unix)]
        if self.options.network == Network::Unix {
            let _ = std::fs::remove_file(PathBuf::from(&self.options.addr));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Response;
    use crate::server::conn::RequestContext;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct OkHandler;

    impl Handler for OkHandler {
        async fn handle(&self, ctx: &mut RequestContext) {
            ctx.response = Response::new();
            ctx.response.set_content_type("text/plain; charset=utf-8");
            ctx.response.set_body(Bytes::from_static(b"transport-ok"));
        }
    }

    async fn start(options: ServerOptions) -> Arc<Transport> {
        let transport = Arc::new(Transport::new(options));
        transport.listen().await.unwrap();
        let serving = Arc::clone(&transport);
        tokio::spawn(async move {
            serving.serve(Arc::new(OkHandler)).await.unwrap();
        });
        transport
    }

    async fn request_over_tcp(addr: SocketAddr) -> String {
        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut data = Vec::new();
        client.read_to_end(&mut data).await.unwrap();
        String::from_utf8_lossy(&data).into_owned()
    }

    fn tcp_options() -> ServerOptions {
        ServerOptions {
            addr: "127.0.0.1:0".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_serves_requests_then_shuts_down() {
        let transport = start(tcp_options()).await;
        let addr = transport.local_addr().unwrap();

        let resp = request_over_tcp(addr).await;
        assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(resp.ends_with("transport-ok"));

        transport.shutdown(Duration::from_secs(1)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_accept_hook_rejects_before_any_read() {
        let seen = Arc::new(AtomicUsize::new(0));
        let hook_seen = Arc::clone(&seen);
        let mut options = tcp_options();
        options.on_accept = Some(Arc::new(move |_| {
            hook_seen.fetch_add(1, Ordering::SeqCst);
            false
        }));
        let transport = start(options).await;
        let addr = transport.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 16];
        // Rejected without a byte exchanged in either direction.
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(transport.stats().connections_accepted.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_connect_hook_runs_inside_connection_task() {
        let ran = Arc::new(AtomicBool::new(false));
        let hook_ran = Arc::clone(&ran);
        let mut options = tcp_options();
        options.on_connect = Some(Arc::new(move |peer| {
            assert!(peer.is_some());
            hook_ran.store(true, Ordering::SeqCst);
        }));
        let transport = start(options).await;

        let resp = request_over_tcp(transport.local_addr().unwrap()).await;
        assert!(resp.ends_with("transport-ok"));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_listener_hook_supplies_socket() {
        let used = Arc::new(AtomicBool::new(false));
        let hook_used = Arc::clone(&used);
        let mut options = tcp_options();
        options.tcp_listener = Some(Arc::new(move |addr: &str| {
            hook_used.store(true, Ordering::SeqCst);
            std::net::TcpListener::bind(addr)
        }));
        let transport = start(options).await;

        assert!(used.load(Ordering::SeqCst));
        let resp = request_over_tcp(transport.local_addr().unwrap()).await;
        assert!(resp.ends_with("transport-ok"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_socket_serve_and_unlink() {
        let path = std::env::temp_dir().join(format!(
            "flashhttp-transport-test-{}.sock",
            std::process::id()
        ));
        let options = ServerOptions {
            network: Network::Unix,
            addr: path.to_string_lossy().into_owned(),
            ..Default::default()
        };
        let transport = start(options).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut client = UnixStream::connect(&path).await.unwrap();
        client
            .write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut data = Vec::new();
        client.read_to_end(&mut data).await.unwrap();
        let resp = String::from_utf8_lossy(&data);
        assert!(resp.ends_with("transport-ok"));

        // The socket file is gone by the time shutdown returns.
        transport.shutdown(Duration::from_secs(1)).await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_connections() {
        struct SlowHandler;
        impl Handler for SlowHandler {
            async fn handle(&self, ctx: &mut RequestContext) {
                tokio::time::sleep(Duration::from_millis(150)).await;
                ctx.response.set_body(Bytes::from_static(b"slow"));
            }
        }

        let transport = Arc::new(Transport::new(tcp_options()));
        transport.listen().await.unwrap();
        let addr = transport.local_addr().unwrap();
        let serving = Arc::clone(&transport);
        tokio::spawn(async move {
            serving.serve(Arc::new(SlowHandler)).await.unwrap();
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        // The in-flight response still completes under the grace period.
        transport.shutdown(Duration::from_secs(2)).await;
        let mut data = Vec::new();
        client.read_to_end(&mut data).await.unwrap();
        assert!(String::from_utf8_lossy(&data).ends_with("slow"));
        assert_eq!(transport.stats().active_connections.load(Ordering::Relaxed), 0);
    }
}
