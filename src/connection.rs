//! Per-connection loops: the frame decoder and the responder.
//!
//! Both loops are generic over the stream halves so they can run against a
//! real `TcpStream` split or a mock.

use crate::protocol::{hex, ChunkKind, Frame, FrameDecoder, Response};
use crate::queue::{MessageQueue, Wake};
use crate::session::Connection;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Fragments smaller than this are hex-dumped at trace level
const FRAGMENT_DUMP_LIMIT: usize = 256;

/// Framing limits applied to each connection
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Maximum frame content length in bytes
    pub max_message_len: usize,
    /// Size of the per-read buffer
    pub read_buffer_size: usize,
}

/// Write side of a connection, shared by the decoder (error lines) and the
/// responder (echoes).
///
/// Each line is written whole under the lock. Writes give up as soon as the
/// connection is cancelled, so a stalled peer cannot pin the lock through a
/// shutdown.
pub struct Outbound<W> {
    writer: Mutex<W>,
    token: CancellationToken,
}

impl<W: AsyncWrite + Unpin> Outbound<W> {
    pub fn new(writer: W, token: CancellationToken) -> Self {
        Self {
            writer: Mutex::new(writer),
            token,
        }
    }

    /// Write one complete response line.
    pub async fn send(&self, line: &[u8]) -> io::Result<()> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "connection closed",
            )),
            res = async {
                let mut writer = self.writer.lock().await;
                writer.write_all(line).await?;
                writer.flush().await
            } => res,
        }
    }

    /// Shut down the write direction. Errors from an already gone peer are
    /// ignored.
    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            trace!(error = %e, "Write shutdown failed");
        }
    }
}

/// Why the decoder stopped
#[derive(Debug)]
enum Exit {
    PeerClosed,
    Cancelled,
    Fault(io::Error),
}

/// Read, reassemble and validate frames until the connection ends.
///
/// Valid messages go onto `queue`; violations are answered directly through
/// `out`. On exit the queue is closed (pending messages are discarded) and
/// the connection moves to `Closing`.
pub async fn decode_loop<R, W>(
    mut reader: R,
    out: Arc<Outbound<W>>,
    queue: Arc<MessageQueue>,
    conn: Arc<Connection>,
    limits: Limits,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let peer = conn.peer();
    let mut read_buf = vec![0u8; limits.read_buffer_size];
    let mut decoder = FrameDecoder::new(limits.max_message_len);

    let exit = 'read: loop {
        if conn.shutdown_requested() || !conn.is_alive() {
            break Exit::Cancelled;
        }

        let n = tokio::select! {
            biased;
            _ = conn.cancelled() => continue,
            res = reader.read(&mut read_buf) => match res {
                Ok(0) => break Exit::PeerClosed,
                Ok(n) => n,
                Err(e) => break Exit::Fault(e),
            },
        };

        let chunk = &read_buf[..n];
        if decoder.push(chunk) == ChunkKind::KeepAlive {
            debug!(%peer, bytes = n, "Ignored keep-alive fragment");
            continue;
        }
        if n < FRAGMENT_DUMP_LIMIT {
            trace!(%peer, bytes = n, fragment = %hex(chunk), "Received fragment");
        } else {
            trace!(%peer, bytes = n, "Received fragment");
        }

        while let Some(frame) = decoder.next_frame() {
            let error = frame.error_response();

            match frame {
                Frame::Message(message) => {
                    debug!(%peer, %message, "Received message");
                    queue.enqueue(message);
                }
                Frame::Blank => debug!(%peer, "Ignored blank message"),
                Frame::TooLong { len } => {
                    let max = limits.max_message_len;
                    warn!(%peer, len, max, "Message exceeded maximum length")
                }
                Frame::InvalidData { valid_up_to } => {
                    warn!(%peer, valid_up_to, "Message contains invalid UTF-8")
                }
            }

            if let Some(line) = error {
                if let Err(e) = out.send(line).await {
                    break 'read Exit::Fault(e);
                }
                debug!(%peer, "Sent error response");
            }
        }
    };

    queue.close();
    conn.begin_closing();

    match exit {
        Exit::PeerClosed => debug!(%peer, "Connection closed by client"),
        Exit::Cancelled => debug!(%peer, "Decoder cancelled"),
        // A forced close during shutdown surfaces as an I/O error; that is
        // the expected way out, not a fault.
        Exit::Fault(e) if conn.shutdown_requested() => {
            debug!(%peer, error = %e, "Read interrupted by shutdown")
        }
        Exit::Fault(e) => warn!(%peer, error = %e, "Connection error"),
    }

    out.close().await;
    conn.loop_exited();
}

/// Drain the queue in order and write `echo-<message>\n` for each entry.
///
/// Shutdown ends the loop without draining. A failed write is logged and
/// the loop moves on to the next message.
pub async fn respond_loop<W>(
    out: Arc<Outbound<W>>,
    queue: Arc<MessageQueue>,
    conn: Arc<Connection>,
) where
    W: AsyncWrite + Unpin,
{
    let peer = conn.peer();

    loop {
        match queue.wait(conn.shutdown_token()).await {
            Wake::Shutdown => {
                debug!(%peer, "Responder stopped by shutdown");
                break;
            }
            Wake::Closed => {
                debug!(%peer, "Responder stopped, connection closed");
                break;
            }
            Wake::Ready => {
                while let Some(message) = queue.dequeue() {
                    if !conn.is_alive() || conn.shutdown_requested() {
                        continue;
                    }
                    match out.send(&Response::echo(&message)).await {
                        Ok(()) => info!(%peer, %message, "Sent echo"),
                        Err(e) => warn!(%peer, error = %e, "Failed to send response"),
                    }
                }
            }
        }
    }

    conn.loop_exited();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DEFAULT_MAX_MESSAGE_LEN;
    use crate::session::{ConnState, Session};
    use std::time::Duration;
    use tokio::task::JoinHandle;
    use tokio_test::io::Builder;

    const LIMITS: Limits = Limits {
        max_message_len: DEFAULT_MAX_MESSAGE_LEN,
        read_buffer_size: 16 * 1024,
    };

    fn active_connection(shutdown: &CancellationToken) -> Arc<Connection> {
        let session = Session::new();
        let conn = Arc::new(Connection::new("127.0.0.1:40000".parse().unwrap(), shutdown));
        let idle = || -> (JoinHandle<()>, JoinHandle<()>) {
            (tokio::spawn(async {}), tokio::spawn(async {}))
        };
        session.try_install(conn, |_| idle()).unwrap()
    }

    #[tokio::test]
    async fn test_decoder_queues_messages_in_order() {
        let shutdown = CancellationToken::new();
        let conn = active_connection(&shutdown);
        let reader = Builder::new()
            .read(b"Ping\nHel")
            .read(b"lo\n")
            .wait(Duration::from_millis(50))
            .build();
        let writer = Builder::new().build();
        let out = Arc::new(Outbound::new(writer, conn.token().clone()));
        let queue = Arc::new(MessageQueue::new());

        // Observe the queue before the decoder closes it on EOF.
        let mut received = Vec::new();
        let decoder = tokio::spawn(decode_loop(
            reader,
            Arc::clone(&out),
            Arc::clone(&queue),
            Arc::clone(&conn),
            LIMITS,
        ));
        while received.len() < 2 {
            match queue.wait(&shutdown).await {
                Wake::Ready => received.extend(queue.dequeue_all()),
                _ => break,
            }
        }
        decoder.await.unwrap();

        assert_eq!(received, vec!["Ping".to_string(), "Hello".to_string()]);
        assert!(queue.is_closed());
        assert_eq!(conn.state(), ConnState::Closing);
    }

    #[tokio::test]
    async fn test_decoder_answers_violations() {
        let shutdown = CancellationToken::new();
        let conn = active_connection(&shutdown);
        let reader = Builder::new()
            .read(&[0xFF, 0xFF, 0xFE, b'\n'])
            .read(b"   \n")
            .build();
        let writer = Builder::new().write(Response::invalid_data()).build();
        let out = Arc::new(Outbound::new(writer, conn.token().clone()));
        let queue = Arc::new(MessageQueue::new());

        decode_loop(reader, out, Arc::clone(&queue), conn, LIMITS).await;
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_decoder_answers_too_long() {
        let shutdown = CancellationToken::new();
        let conn = active_connection(&shutdown);
        let limits = Limits {
            max_message_len: 4,
            read_buffer_size: 64,
        };
        let reader = Builder::new()
            .read(b"12345\nok\n")
            .read(b"ok\n")
            .wait(Duration::from_millis(50))
            .build();
        let writer = Builder::new().write(Response::too_long()).build();
        let out = Arc::new(Outbound::new(writer, conn.token().clone()));
        let queue = Arc::new(MessageQueue::new());

        let consumer = {
            let queue = Arc::clone(&queue);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                match queue.wait(&shutdown).await {
                    Wake::Ready => queue.dequeue_all(),
                    _ => Vec::new(),
                }
            })
        };

        decode_loop(reader, out, queue, conn, limits).await;

        // The "ok" behind the long frame shared its read and was discarded.
        assert_eq!(consumer.await.unwrap(), vec!["ok".to_string()]);
    }

    #[tokio::test]
    async fn test_decoder_stops_on_shutdown() {
        let shutdown = CancellationToken::new();
        let conn = active_connection(&shutdown);
        let reader = Builder::new().wait(Duration::from_secs(3600)).build();
        let writer = Builder::new().build();
        let out = Arc::new(Outbound::new(writer, conn.token().clone()));
        let queue = Arc::new(MessageQueue::new());

        let decoder = tokio::spawn(decode_loop(reader, out, Arc::clone(&queue), conn, LIMITS));
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(1), decoder)
            .await
            .unwrap()
            .unwrap();
        assert!(queue.is_closed());
    }

    #[tokio::test]
    async fn test_responder_echoes_in_order() {
        let shutdown = CancellationToken::new();
        let conn = active_connection(&shutdown);
        let writer = Builder::new()
            .write(b"echo-one\n")
            .write(b"echo-two\n")
            .build();
        let out = Arc::new(Outbound::new(writer, conn.token().clone()));
        let queue = Arc::new(MessageQueue::new());

        let responder = tokio::spawn(respond_loop(out, Arc::clone(&queue), Arc::clone(&conn)));
        queue.enqueue("one".to_string());
        queue.enqueue("two".to_string());

        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.close();

        tokio::time::timeout(Duration::from_secs(1), responder)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_responder_survives_write_failure() {
        let shutdown = CancellationToken::new();
        let conn = active_connection(&shutdown);
        let writer = Builder::new()
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "broken"))
            .write(b"echo-two\n")
            .build();
        let out = Arc::new(Outbound::new(writer, conn.token().clone()));
        let queue = Arc::new(MessageQueue::new());

        let responder = tokio::spawn(respond_loop(out, Arc::clone(&queue), Arc::clone(&conn)));
        queue.enqueue("one".to_string());
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue("two".to_string());
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!responder.is_finished());
        queue.close();
        tokio::time::timeout(Duration::from_secs(1), responder)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_responder_drops_messages_for_closing_connection() {
        let shutdown = CancellationToken::new();
        let conn = active_connection(&shutdown);
        // Independent token so only the liveness check can stop the writes.
        let writer = Builder::new().build();
        let out = Arc::new(Outbound::new(writer, CancellationToken::new()));
        let queue = Arc::new(MessageQueue::new());

        conn.begin_closing();
        queue.enqueue("one".to_string());
        queue.enqueue("two".to_string());

        let responder = tokio::spawn(respond_loop(out, Arc::clone(&queue), Arc::clone(&conn)));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(queue.is_empty());
        assert!(!queue.is_closed());
        assert!(!responder.is_finished());

        queue.close();
        tokio::time::timeout(Duration::from_secs(1), responder)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_responder_exits_on_shutdown_without_draining() {
        let shutdown = CancellationToken::new();
        let conn = active_connection(&shutdown);
        let writer = Builder::new().build();
        let out = Arc::new(Outbound::new(writer, conn.token().clone()));
        let queue = Arc::new(MessageQueue::new());

        shutdown.cancel();
        queue.enqueue("pending".to_string());

        respond_loop(out, Arc::clone(&queue), conn).await;
        assert_eq!(queue.len(), 1);
    }
}
