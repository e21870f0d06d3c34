//! line-echo: a single-connection TCP line echo server
//!
//! One client at a time exchanges newline-terminated UTF-8 messages with the
//! server; each message comes back as `echo-<message>\n`.
//!
//! Components:
//! - `server`: acceptor and stop coordination
//! - `session`: the single active-connection slot and connection state
//! - `connection`: per-connection decoder and responder loops
//! - `queue`: decoder-to-responder message hand-off
//! - `protocol`: framing, validation and response lines
//! - `config`: CLI and TOML configuration

pub mod config;
pub mod connection;
pub mod protocol;
pub mod queue;
pub mod server;
pub mod session;
