//! TCP listener and per-connection handling.
//!
//! Each accepted connection gets its own task: one bounded read, payload
//! extraction, the canned response, close. The number of live connections is
//! capped by a semaphore and every read and write carries a deadline.

use crate::config::Config;
use crate::observer::Observer;
use crate::protocol::{extract_payload, RESPONSE};
use bytes::BytesMut;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

/// First sleep after a transient accept error
const INITIAL_ACCEPT_BACKOFF: Duration = Duration::from_millis(5);

/// Upper bound for the accept backoff
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Per-connection limits, copied into every connection task
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub buffer_size: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl From<&Config> for ConnectionSettings {
    fn from(config: &Config) -> Self {
        Self {
            buffer_size: config.buffer_size,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
        }
    }
}

/// Server instance
pub struct Server {
    listener: TcpListener,
    settings: ConnectionSettings,
    max_accept_failures: u32,
    observer: Arc<dyn Observer>,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Bind the configured address. Must be called from within a tokio runtime.
    pub fn bind(config: &Config, observer: Arc<dyn Observer>) -> Result<Self, ServerError> {
        let addr = resolve(&config.listen)?;
        let listener = create_listener(addr, config.backlog)
            .and_then(TcpListener::from_std)
            .map_err(|e| ServerError::Bind(addr, e))?;

        Ok(Server {
            listener,
            settings: ConnectionSettings::from(config),
            max_accept_failures: config.max_accept_failures,
            observer,
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until a fatal accept error occurs.
    pub async fn run(self) -> Result<(), ServerError> {
        info!(address = %self.local_addr()?, "Listening");

        let mut backoff = AcceptBackoff::new(self.max_accept_failures);

        loop {
            // Wait for a connection slot
            let permit = self
                .connection_limit
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| ServerError::LimiterClosed)?;

            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "New connection");
                    backoff.on_success();

                    let settings = self.settings;
                    let observer = Arc::clone(&self.observer);

                    tokio::spawn(async move {
                        match handle_connection(stream, peer, settings, observer.as_ref()).await {
                            Ok(()) => trace!(peer = %peer, "Connection closed"),
                            Err(ConnectionError::Closed) => {
                                debug!(peer = %peer, "Connection closed by client")
                            }
                            Err(e) => warn!(peer = %peer, error = %e, "Connection error"),
                        }
                        drop(permit);
                    });
                }
                Err(e) => match backoff.on_error(&e) {
                    Some(delay) => {
                        warn!(
                            error = %e,
                            failures = backoff.failures(),
                            "Failed to accept connection, retrying"
                        );
                        drop(permit);
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        error!(error = %e, "Failed to accept connection");
                        return Err(ServerError::Accept(e));
                    }
                },
            }
        }
    }
}

/// Serve a single request on `stream`.
///
/// Performs exactly one read of at most `buffer_size` bytes. If that read
/// fails, times out, or sees end of stream, nothing is written back.
/// Otherwise the request is reported to `observer` and the canned response is
/// written whether or not a payload was found.
pub async fn handle_connection<S>(
    mut stream: S,
    peer: SocketAddr,
    settings: ConnectionSettings,
    observer: &dyn Observer,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = BytesMut::zeroed(settings.buffer_size);

    let n = match timeout(settings.read_timeout, stream.read(&mut buffer)).await {
        Ok(Ok(0)) => return Err(ConnectionError::Closed),
        Ok(Ok(n)) => n,
        Ok(Err(e)) => return Err(ConnectionError::Read(e)),
        Err(_) => return Err(ConnectionError::ReadTimeout),
    };
    buffer.truncate(n);

    let request = String::from_utf8_lossy(&buffer);
    observer.request(peer, n, &request);

    match extract_payload(&request) {
        Ok(payload) => observer.payload(peer, &payload),
        Err(e) => observer.rejected(peer, &e),
    }

    match timeout(settings.write_timeout, stream.write_all(RESPONSE)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(ConnectionError::Write(e)),
        Err(_) => return Err(ConnectionError::WriteTimeout),
    }

    if let Err(e) = stream.shutdown().await {
        trace!(peer = %peer, error = %e, "Shutdown failed");
    }

    Ok(())
}

/// Retry state for the accept loop.
///
/// Transient errors are retried with a delay that doubles up to
/// `MAX_ACCEPT_BACKOFF`; the `max_failures`-th consecutive one is fatal.
#[derive(Debug)]
struct AcceptBackoff {
    failures: u32,
    delay: Duration,
    max_failures: u32,
}

impl AcceptBackoff {
    fn new(max_failures: u32) -> Self {
        Self {
            failures: 0,
            delay: INITIAL_ACCEPT_BACKOFF,
            max_failures,
        }
    }

    /// How long to wait before accepting again, or `None` if `e` is fatal.
    fn on_error(&mut self, e: &io::Error) -> Option<Duration> {
        if !is_transient(e) || self.failures + 1 >= self.max_failures {
            return None;
        }
        self.failures += 1;
        let delay = self.delay;
        self.delay = (self.delay * 2).min(MAX_ACCEPT_BACKOFF);
        Some(delay)
    }

    fn on_success(&mut self) {
        self.failures = 0;
        self.delay = INITIAL_ACCEPT_BACKOFF;
    }

    fn failures(&self) -> u32 {
        self.failures
    }
}

/// Accept errors that concern a single connection attempt or a momentary
/// shortage of file descriptors rather than the listener itself.
fn is_transient(e: &io::Error) -> bool {
    if matches!(e.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE)) {
        return true;
    }
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
    )
}

fn resolve(listen: &str) -> Result<SocketAddr, ServerError> {
    listen
        .to_socket_addrs()
        .map_err(|e| ServerError::Resolve(listen.to_string(), e))?
        .next()
        .ok_or_else(|| {
            ServerError::Resolve(
                listen.to_string(),
                io::Error::new(io::ErrorKind::NotFound, "no addresses"),
            )
        })
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

/// Errors that end a single connection
#[derive(Debug)]
pub enum ConnectionError {
    /// Peer closed before sending anything
    Closed,
    Read(io::Error),
    ReadTimeout,
    Write(io::Error),
    WriteTimeout,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Closed => write!(f, "connection closed before request"),
            ConnectionError::Read(e) => write!(f, "error reading: {e}"),
            ConnectionError::ReadTimeout => write!(f, "timed out reading request"),
            ConnectionError::Write(e) => write!(f, "error writing response: {e}"),
            ConnectionError::WriteTimeout => write!(f, "timed out writing response"),
        }
    }
}

impl std::error::Error for ConnectionError {}

/// Errors that stop the server
#[derive(Debug)]
pub enum ServerError {
    Resolve(String, io::Error),
    Bind(SocketAddr, io::Error),
    Accept(io::Error),
    LocalAddr(io::Error),
    LimiterClosed,
}

impl From<io::Error> for ServerError {
    fn from(e: io::Error) -> Self {
        ServerError::LocalAddr(e)
    }
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Resolve(addr, e) => write!(f, "Failed to resolve '{addr}': {e}"),
            ServerError::Bind(addr, e) => write!(f, "Error listening on {addr}: {e}"),
            ServerError::Accept(e) => write!(f, "Error accepting connection: {e}"),
            ServerError::LocalAddr(e) => write!(f, "Failed to read listener address: {e}"),
            ServerError::LimiterClosed => write!(f, "Connection limiter closed"),
        }
    }
}

impl std::error::Error for ServerError {}
