//! Line protocol framing and response generation.
//!
//! Messages are UTF-8 text terminated by a single `\n`. There is no length
//! prefix: a frame is everything up to and including the next delimiter.
//!
//! ```text
//! Request:  Ping\n
//! Response: echo-Ping\n
//! ```
//!
//! Frames that are too long or not valid UTF-8 are answered with a fixed
//! error line, and the whole receive buffer is discarded so that the next
//! delimiter starts a fresh frame.

use bytes::BytesMut;
use std::fmt::Write;
use tracing::debug;

/// Frame delimiter
pub const DELIMITER: u8 = b'\n';

/// Maximum frame content length in bytes, delimiter excluded
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 65536;

/// Bytes a peer may send as idle padding: space, tab, VT, FF, CR.
const PADDING: &[u8] = b" \t\x0b\x0c\r";

const ECHO_PREFIX: &[u8] = b"echo-";
const TOO_LONG: &str = "Ошибка, сообщение превысило максимальную длину\n";
const INVALID_DATA: &str = "Ошибка, сообщение содержит некорректные данные\n";

/// How a freshly read chunk was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    /// Delimiter-free padding, dropped without buffering
    KeepAlive,
    /// Appended to the receive buffer
    Buffered,
}

/// A frame pulled off the receive buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Valid, non-blank message (delimiter stripped)
    Message(String),
    /// Valid UTF-8 but empty or whitespace only
    Blank,
    /// Content exceeded the maximum length; buffer was discarded
    TooLong { len: usize },
    /// Content was not valid UTF-8; buffer was discarded
    InvalidData { valid_up_to: usize },
}

impl Frame {
    /// The error line owed to the peer for this frame, if any.
    pub fn error_response(&self) -> Option<&'static [u8]> {
        match self {
            Frame::TooLong { .. } => Some(Response::too_long()),
            Frame::InvalidData { .. } => Some(Response::invalid_data()),
            Frame::Message(_) | Frame::Blank => None,
        }
    }
}

/// Reassembles newline-terminated frames from an arbitrarily fragmented
/// byte stream.
///
/// The receive buffer only ever holds bytes that have not yet been consumed
/// into a completed or discarded frame. It has no upper bound: the length
/// check runs once a delimiter shows up.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    /// Prefix of `buffer` already known to hold no delimiter
    scanned: usize,
    max_message_len: usize,
}

impl FrameDecoder {
    /// Create a decoder enforcing `max_message_len` bytes per frame.
    pub fn new(max_message_len: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            scanned: 0,
            max_message_len,
        }
    }

    /// Feed a chunk read from the connection.
    pub fn push(&mut self, chunk: &[u8]) -> ChunkKind {
        if is_keep_alive(chunk) {
            return ChunkKind::KeepAlive;
        }
        self.buffer.extend_from_slice(chunk);
        ChunkKind::Buffered
    }

    /// Pull the next complete frame, if the buffer holds one.
    ///
    /// A violation clears the entire buffer, including any well-formed
    /// frames queued behind the offending one.
    pub fn next_frame(&mut self) -> Option<Frame> {
        let pos = match find_delimiter(&self.buffer[self.scanned..]) {
            Some(offset) => self.scanned + offset,
            None => {
                self.scanned = self.buffer.len();
                return None;
            }
        };
        self.scanned = 0;

        if pos > self.max_message_len {
            self.buffer.clear();
            return Some(Frame::TooLong { len: pos });
        }

        let frame = self.buffer.split_to(pos + 1);
        debug!(len = frame.len(), frame = %hex(&frame), "Complete frame");

        match std::str::from_utf8(&frame[..pos]) {
            Ok(text) if text.trim().is_empty() => Some(Frame::Blank),
            Ok(text) => Some(Frame::Message(text.to_owned())),
            Err(e) => {
                self.buffer.clear();
                Some(Frame::InvalidData {
                    valid_up_to: e.valid_up_to(),
                })
            }
        }
    }

    /// Bytes waiting for a delimiter.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Response line builders
pub struct Response;

impl Response {
    /// `echo-<message>\n`
    pub fn echo(message: &str) -> BytesMut {
        let mut buf = BytesMut::with_capacity(ECHO_PREFIX.len() + message.len() + 1);
        buf.extend_from_slice(ECHO_PREFIX);
        buf.extend_from_slice(message.as_bytes());
        buf.extend_from_slice(&[DELIMITER]);
        buf
    }

    /// Sent when a frame's content exceeds the maximum length
    pub fn too_long() -> &'static [u8] {
        TOO_LONG.as_bytes()
    }

    /// Sent when a frame is not valid UTF-8
    pub fn invalid_data() -> &'static [u8] {
        INVALID_DATA.as_bytes()
    }
}

/// A chunk with no delimiter made only of padding bytes.
pub fn is_keep_alive(chunk: &[u8]) -> bool {
    !chunk.contains(&DELIMITER) && chunk.iter().all(|b| PADDING.contains(b))
}

/// Dash-separated uppercase hex, for logging raw bytes.
pub fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            out.push('-');
        }
        let _ = write!(out, "{b:02X}");
    }
    out
}

fn find_delimiter(buffer: &[u8]) -> Option<usize> {
    buffer.iter().position(|&b| b == DELIMITER)
}
