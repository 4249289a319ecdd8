//! # devlink-core
//!
//! Message engine, blob-channel orchestration, dedupe/evolving-reply state,
//! and session supervisor for the device-linking client.
//!
//! ## Modules
//! - [`errors`] — `DevlinkError`, composing every sub-crate's narrow error
//!   type (crypto, protocol, timeout, transport, storage, caller).
//! - [`config`] — `ClientConfig`, the caller-supplied configuration surface.
//!   This crate never loads config from the environment or disk itself.
//! - [`storage`] — the identity store (with lazy device-id allocation),
//!   contact/group loading, atomic writes, and the inbound-media layout.
//! - [`directory`] — the public-key lookup contract and the shared contact
//!   cache it feeds.
//! - [`message`] — per-recipient AEAD body/metadata composition, caller
//!   validation, the reaction fallback matrix, and evolving-reply edit
//!   coalescing.
//! - [`inbound`] — typed interpretation of inbound container plaintexts,
//!   group containers included.
//! - [`blob`] — blob key generation, fixed-nonce file/thumbnail encryption,
//!   upload/download URL selection, file-message assembly. HTTP lives in
//!   `devlink-net`.
//! - [`dedupe`] — the bounded, disk-persisted incoming-message dedupe set
//!   and the in-memory evolving-reply anchor table.
//! - [`typing`] — typing-indicator refresh bookkeeping and the shutdown
//!   drain.
//! - [`supervisor`] — owns the mediator/CSP lifecycle: pending-ack tables,
//!   readiness waiters, reconnect backoff, and teardown on unexpected close.
//! - [`orchestrator`] — the single-writer session event loop wiring the
//!   mediator/CSP `Ready` handles from `devlink-proto` to the message
//!   engine, dedupe set, and supervisor above.
//! - [`sendflow`] — awaiting both acknowledgement planes of one send, and
//!   the serialized evolving-reply dispatcher.
//!
//! Protocol state machines (rendezvous handshake, mediator session, CSP
//! session) live in `devlink-proto`; this crate consumes their `Event`s and
//! `Ready` handles but owns none of the wire-level handshake logic itself.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod blob;
pub mod config;
pub mod dedupe;
pub mod directory;
pub mod errors;
pub mod inbound;
pub mod message;
pub mod orchestrator;
pub mod sendflow;
pub mod storage;
pub mod supervisor;
pub mod typing;

pub use config::ClientConfig;
pub use errors::{CallerError, DevlinkError};
