//! TCP server accepting a single client at a time.
//!
//! The acceptor owns the listening socket. Each accepted connection is either
//! installed as the active connection (spawning its decoder and responder)
//! or, if a live client is already connected, closed straight away without
//! writing a byte.

use crate::config::Config;
use crate::connection::{decode_loop, respond_loop, Limits, Outbound};
use crate::queue::MessageQueue;
use crate::session::{Connection, Rejected, Session};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Listen backlog
const BACKLOG: i32 = 128;

/// Server startup errors
#[derive(Debug)]
pub enum ServerError {
    Bind(SocketAddr, io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Bind(addr, e) => write!(f, "Failed to bind {addr}: {e}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Bind(_, e) => Some(e),
        }
    }
}

/// Server instance
pub struct Server {
    config: Config,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Self {
        Server { config }
    }

    /// Bind the listener and start accepting connections.
    pub async fn start(self) -> Result<ServerHandle, ServerError> {
        let addr = self.config.listen;
        let listener = create_listener(addr).map_err(|e| ServerError::Bind(addr, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::Bind(addr, e))?;

        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let session = Arc::new(Session::new());
        let limits = Limits {
            max_message_len: self.config.max_message_len,
            read_buffer_size: self.config.read_buffer_size,
        };

        let acceptor = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&session),
            tracker.clone(),
            shutdown.clone(),
            limits,
        ));

        info!(address = %local_addr, max_message_len = limits.max_message_len, "Server started");

        Ok(ServerHandle {
            local_addr,
            shutdown,
            tracker,
            session,
            acceptor,
        })
    }
}

/// Handle to a running server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    session: Arc<Session>,
    acceptor: JoinHandle<()>,
}

impl ServerHandle {
    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A client is connected and alive.
    pub fn has_client(&self) -> bool {
        self.session.is_busy()
    }

    /// Stop the server and wait for every loop to finish.
    ///
    /// Setting the shutdown signal closes the listener (the acceptor drops
    /// it on its way out) and the active connection. Loops are then joined
    /// acceptor first, then decoder, then responder, so no new work appears
    /// while in-flight work drains.
    pub async fn stop(self) {
        self.shutdown.cancel();
        let active = self.session.take();
        if let Some(active) = &active {
            active.conn.begin_closing();
        }

        if let Err(e) = self.acceptor.await {
            warn!(error = %e, "Acceptor task failed");
        }
        if let Some(active) = active {
            if let Err(e) = active.decoder.await {
                warn!(error = %e, "Decoder task failed");
            }
            if let Err(e) = active.responder.await {
                warn!(error = %e, "Responder task failed");
            }
        }

        // Loops of connections replaced earlier may still be winding down.
        self.tracker.close();
        self.tracker.wait().await;

        info!(address = %self.local_addr, "Server stopped");
    }
}

/// Accept connections until shutdown.
async fn accept_loop(
    listener: TcpListener,
    session: Arc<Session>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    limits: Limits,
) {
    loop {
        let (stream, peer) = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            res = listener.accept() => match res {
                Ok(accepted) => accepted,
                Err(e) => {
                    if shutdown.is_cancelled() {
                        break;
                    }
                    warn!(error = %e, "Failed to accept connection");
                    continue;
                }
            },
        };

        let conn = Arc::new(Connection::new(peer, &shutdown));
        let spawn = |conn: Arc<Connection>| spawn_loops(stream, conn, &tracker, limits);

        match session.try_install(conn, spawn) {
            Ok(_) => info!(%peer, "Client connected"),
            Err(Rejected::Busy) => {
                info!(%peer, "Rejected connection, a client is already connected")
            }
            Err(Rejected::ShuttingDown) => {
                debug!(%peer, "Rejected connection during shutdown");
                break;
            }
        }
    }

    debug!("Acceptor stopped");
}

/// Split the stream and start the decoder and responder for it.
fn spawn_loops(
    stream: TcpStream,
    conn: Arc<Connection>,
    tracker: &TaskTracker,
    limits: Limits,
) -> (JoinHandle<()>, JoinHandle<()>) {
    let (reader, writer) = stream.into_split();
    let out = Arc::new(Outbound::new(writer, conn.token().clone()));
    let queue = Arc::new(MessageQueue::new());

    let decoder = tracker.spawn(decode_loop(
        reader,
        Arc::clone(&out),
        Arc::clone(&queue),
        Arc::clone(&conn),
        limits,
    ));
    let responder = tracker.spawn(respond_loop(out, queue, conn));

    (decoder, responder)
}

/// Create a TCP listener with SO_REUSEADDR so restarts do not trip over
/// sockets left in TIME_WAIT.
fn create_listener(addr: SocketAddr) -> io::Result<TcpListener> {
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
    socket.listen(BACKLOG)?;

    TcpListener::from_std(socket.into())
}
