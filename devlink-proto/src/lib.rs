//! Sans-IO protocol state machines for the device-linking network.
//!
//! This crate owns protocol *logic*, never I/O:
//! * [`authentication`] — the rendezvous handshake run over the relay during
//!   device-join.
//! * [`mediator`] — the long-lived D2M session: auth handshake, leader
//!   arbitration, reflection send/ack, steady-state frame dispatch.
//! * [`csp`] — the chat-server protocol session nested inside the mediator's
//!   proxy channel: handshake, login, per-direction nonce discipline,
//!   container framing.
//!
//! Each module exposes a `start()`/`on_*()` state-machine API that consumes
//! `self` by value and returns the next state plus any bytes to send. Actual
//! transports (WebSocket dialers, HTTP clients) live in `devlink-net`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod authentication;
pub mod csp;
pub mod mediator;
