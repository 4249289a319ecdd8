//! Concrete async transports for the device-linking network.
//!
//! Everything upstream of this crate (`devlink-proto`'s state machines,
//! `devlink-core`'s orchestration) is sans-IO: it consumes and produces
//! plain byte buffers. This crate is where those buffers actually cross a
//! socket.
//!
//! * [`rendezvous`] — a WebSocket dialer for the rendezvous relay, framing
//!   traffic per `devlink_wire::framing::RelayFrameDecoder`.
//! * [`mediator`] — a WebSocket dialer for the long-lived D2M session,
//!   framing traffic per `devlink_wire::framing::MediatorFrame`.
//! * [`blob`] — HTTP multipart upload and candidate-list download for the
//!   blob service contract.
//! * [`urls`] — mediator and rendezvous URL construction.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod blob;
pub mod mediator;
pub mod rendezvous;
pub mod urls;

/// Errors common to both WebSocket dialers.
#[derive(Debug)]
pub enum WsError {
    /// The underlying WebSocket connection failed.
    Connect(String),
    /// A send or receive on an established connection failed.
    Io(String),
    /// The peer closed the connection.
    Closed,
}

impl std::fmt::Display for WsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect(e) => write!(f, "failed to connect: {e}"),
            Self::Io(e) => write!(f, "transport error: {e}"),
            Self::Closed => write!(f, "connection closed by peer"),
        }
    }
}

impl std::error::Error for WsError {}
