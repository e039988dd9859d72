//! TCP server for WebSocket connections.
//!
//! Accepts connections, completes the HTTP upgrade, and hands each upgraded
//! stream to its own session task. A supervising task per connection reports
//! errors and panics to the server's [`FailurePolicy`], so one bad connection
//! never takes the listener down.

use crate::config::Config;
use crate::http::{self, ParseResult};
use crate::protocols::websocket::{
    complete_handshake, session, FrameDecoder, MessageHandler, TracingObserver, UnmaskObserver,
};
use bytes::{Buf, BytesMut};
use std::any::Any;
use std::error::Error;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, trace, warn};

/// Read buffer size
const BUFFER_SIZE: usize = 16 * 1024;

/// Listen backlog
const BACKLOG: i32 = 1024;

/// Body sent to plain HTTP requests
const PLAIN_RESPONSE_BODY: &str = "Hey there!";

pub type ConnectionError = Box<dyn Error + Send + Sync>;

/// What the server does when a connection task fails.
pub trait FailurePolicy: Send + Sync + 'static {
    /// The connection handler returned an error.
    fn connection_failed(&self, peer: SocketAddr, error: &ConnectionError);

    /// The connection handler panicked.
    fn connection_panicked(&self, peer: SocketAddr, message: &str);
}

/// Log the failure and keep serving.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAndContinue;

impl FailurePolicy for LogAndContinue {
    fn connection_failed(&self, peer: SocketAddr, error: &ConnectionError) {
        debug!(peer = %peer, error = %error, "Connection error");
    }

    fn connection_panicked(&self, peer: SocketAddr, message: &str) {
        error!(peer = %peer, panic = %message, "Connection handler panicked");
    }
}

/// State shared by every connection task.
#[derive(Clone)]
struct Shared {
    handler: Arc<dyn MessageHandler>,
    observer: Option<Arc<dyn UnmaskObserver>>,
    max_header_size: usize,
}

/// Server instance
pub struct Server {
    config: Config,
    shared: Shared,
    policy: Arc<dyn FailurePolicy>,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Create a new server that hands messages to `handler`
    pub fn new(config: Config, handler: Arc<dyn MessageHandler>) -> Self {
        let observer: Option<Arc<dyn UnmaskObserver>> = if config.trace_unmask {
            Some(Arc::new(TracingObserver))
        } else {
            None
        };

        Server {
            shared: Shared {
                handler,
                observer,
                max_header_size: config.max_header_size,
            },
            policy: Arc::new(LogAndContinue),
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
            config,
        }
    }

    /// Replace the default [`LogAndContinue`] policy
    pub fn with_policy(mut self, policy: Arc<dyn FailurePolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> io::Result<TcpListener> {
        let addr = tokio::net::lookup_host(&self.config.listen)
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("no address for '{}'", self.config.listen),
                )
            })?;

        TcpListener::from_std(create_listener(addr)?)
    }

    /// Bind and serve until the listener fails
    pub async fn run(&self) -> Result<(), ConnectionError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ConnectionError> {
        info!(address = %listener.local_addr()?, "Server listening");

        loop {
            // Wait for a connection slot
            let permit = self.connection_limit.clone().acquire_owned().await?;

            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "New connection");

                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }

                    let shared = self.shared.clone();
                    let policy = Arc::clone(&self.policy);
                    let task = tokio::spawn(handle_connection(stream, peer, shared));

                    tokio::spawn(async move {
                        match task.await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => policy.connection_failed(peer, &e),
                            Err(e) if e.is_panic() => {
                                policy.connection_panicked(peer, &panic_message(e.into_panic()))
                            }
                            Err(e) => debug!(peer = %peer, error = %e, "Connection task cancelled"),
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }
}

fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Handle a single client connection: upgrade, then run the session
async fn handle_connection<S>(
    mut stream: S,
    peer: SocketAddr,
    shared: Shared,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);

    let request = loop {
        match http::parse_request(&buffer, shared.max_header_size) {
            ParseResult::Complete(request, consumed) => {
                buffer.advance(consumed);
                break request;
            }
            ParseResult::Incomplete => {
                let n = stream.read_buf(&mut buffer).await?;
                if n == 0 {
                    trace!(peer = %peer, "Connection closed before request completed");
                    return Ok(());
                }
            }
            ParseResult::Error(e) => {
                warn!(peer = %peer, error = %e, "Bad request");
                stream
                    .write_all(http::bad_request(&e.to_string()).as_bytes())
                    .await?;
                return Ok(());
            }
        }
    };

    if !request.is_websocket_upgrade() {
        debug!(
            peer = %peer,
            method = %request.method,
            path = %request.path,
            version = %request.version,
            "Plain HTTP request"
        );
        stream
            .write_all(http::ok_response(PLAIN_RESPONSE_BODY).as_bytes())
            .await?;
        stream.shutdown().await?;
        return Ok(());
    }

    let key = request.header("Sec-WebSocket-Key").unwrap_or("").trim();
    let headers = match complete_handshake(key) {
        Ok(headers) => headers,
        Err(e) => {
            warn!(peer = %peer, error = %e, "Rejecting upgrade");
            stream
                .write_all(http::bad_request(&e.to_string()).as_bytes())
                .await?;
            return Ok(());
        }
    };

    stream.write_all(headers.as_bytes()).await?;
    info!(peer = %peer, key = %key, "Client connected");

    let mut decoder = FrameDecoder::new();
    if let Some(observer) = shared.observer {
        decoder = decoder.with_observer(observer);
    }

    session::run(stream, buffer, decoder, shared.handler).await?;
    debug!(peer = %peer, "Client disconnected");
    Ok(())
}
