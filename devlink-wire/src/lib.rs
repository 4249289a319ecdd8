//! Fixed binary wire layouts for the device-linking protocol.
//!
//! # Overview
//!
//! | Module          | Contents                                                        |
//! |-----------------|-----------------------------------------------------------------|
//! | [`framing`]     | Relay, mediator, and CSP frame codecs                           |
//! | [`message`]     | The message-with-metadata frame and group addressing containers |
//! | [`body`]        | Container-plaintext bodies: text, edits, reactions, receipts    |
//! | [`envelope`]    | The reflection envelope tagged union                            |
//! | [`file_message`]| The file-message JSON payload                                   |
//!
//! None of these formats are schema-driven: they are fixed external wire
//! formats, so this crate hand-implements each one directly against the
//! [`Cursor`]/[`Serializable`]/[`Deserializable`] primitives rather than
//! generating code from a schema language.

#![deny(unsafe_code)]

pub mod body;
pub mod deserialize;
pub mod envelope;
pub mod file_message;
pub mod framing;
pub mod message;
pub mod serialize;

pub use deserialize::{Cursor, Deserializable};
pub use serialize::Serializable;
