//! Connection state and the single active-connection slot.
//!
//! The acceptor is the only writer of the slot. Checking whether the current
//! client is still alive and installing a replacement happen under the same
//! lock, so two accepts can never both win.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Number of loops bound to each connection (decoder + responder).
const CONNECTION_LOOPS: usize = 2;

/// Lifecycle of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accepted at the transport level, not yet installed.
    Accepted,
    /// Installed as the active connection; loops running.
    Active,
    /// Peer EOF, I/O fault or stop observed; loops winding down.
    Closing,
    /// Both loops have exited and the socket is released.
    Closed,
}

/// Shared view of one client connection.
///
/// The decoder and responder each hold an `Arc<Connection>`; the stream
/// halves themselves live with the loops.
#[derive(Debug)]
pub struct Connection {
    peer: SocketAddr,
    state: Mutex<ConnState>,
    running: AtomicUsize,
    shutdown: CancellationToken,
    token: CancellationToken,
}

impl Connection {
    /// A freshly accepted connection. Its token is a child of `shutdown`, so
    /// a service stop closes it too.
    pub fn new(peer: SocketAddr, shutdown: &CancellationToken) -> Self {
        Self {
            peer,
            state: Mutex::new(ConnState::Accepted),
            running: AtomicUsize::new(0),
            shutdown: shutdown.clone(),
            token: shutdown.child_token(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnState {
        *self.lock_state()
    }

    /// Installed, not closing, and not cancelled by a stop.
    pub fn is_alive(&self) -> bool {
        *self.lock_state() == ConnState::Active && !self.token.is_cancelled()
    }

    /// The service-wide stop was requested.
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Service-wide shutdown token.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Per-connection token; cancelled on close or stop.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Completes when the connection is closed or the service stops.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    fn activate(&self) {
        self.running.store(CONNECTION_LOOPS, Ordering::SeqCst);
        *self.lock_state() = ConnState::Active;
    }

    /// Move to `Closing` and cancel anything blocked on this connection.
    pub fn begin_closing(&self) {
        {
            let mut state = self.lock_state();
            if *state == ConnState::Active || *state == ConnState::Accepted {
                *state = ConnState::Closing;
            }
        }
        self.token.cancel();
    }

    /// Called by each loop as it exits; the last one closes the connection.
    pub fn loop_exited(&self) {
        if self.running.fetch_sub(1, Ordering::SeqCst) == 1 {
            *self.lock_state() = ConnState::Closed;
            info!(peer = %self.peer, "Client disconnected");
        }
    }
}

/// The installed connection together with its two loops.
#[derive(Debug)]
pub struct ActiveConnection {
    pub conn: Arc<Connection>,
    pub decoder: JoinHandle<()>,
    pub responder: JoinHandle<()>,
}

/// Returned by [`Session::try_install`] when the slot is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejected {
    /// Another client is connected and alive
    Busy,
    /// The service is stopping
    ShuttingDown,
}

/// Owner of the single active-connection slot.
#[derive(Debug, Default)]
pub struct Session {
    slot: Mutex<Option<ActiveConnection>>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<ActiveConnection>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Install `conn` if no live connection occupies the slot.
    ///
    /// `spawn` starts the decoder and responder; it only runs when the
    /// install succeeds. A dead previous occupant is dropped; its loops are
    /// already on their way out.
    pub fn try_install<F>(
        &self,
        conn: Arc<Connection>,
        spawn: F,
    ) -> Result<Arc<Connection>, Rejected>
    where
        F: FnOnce(Arc<Connection>) -> (JoinHandle<()>, JoinHandle<()>),
    {
        let mut slot = self.lock();

        if conn.shutdown_requested() {
            return Err(Rejected::ShuttingDown);
        }
        if slot.as_ref().is_some_and(|active| active.conn.is_alive()) {
            return Err(Rejected::Busy);
        }

        conn.activate();
        let (decoder, responder) = spawn(Arc::clone(&conn));
        *slot = Some(ActiveConnection {
            conn: Arc::clone(&conn),
            decoder,
            responder,
        });
        Ok(conn)
    }

    /// A live connection currently occupies the slot.
    pub fn is_busy(&self) -> bool {
        self.lock().as_ref().is_some_and(|active| active.conn.is_alive())
    }

    /// Remove the current occupant, alive or not.
    pub fn take(&self) -> Option<ActiveConnection> {
        self.lock().take()
    }
}
