//! Typed join-message framing sent over the rendezvous relay.
//!
//! Each relay frame (already length-delimited by
//! `devlink_wire::framing::RelayFrameDecoder`) carries one join message:
//! `type:u8 || payload`, mirroring the mediator's single-byte frame-type
//! discriminant idiom.

use std::fmt;

/// Join-message type discriminants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinMessageType {
    /// Protocol start marker; must arrive exactly once and first.
    Begin,
    /// An indexable blob chunk, collected ahead of `EssentialData`.
    BlobData,
    /// Identity, device-group data, contacts, and groups.
    EssentialData,
    /// Sent by the new device once `EssentialData` has been persisted.
    Registered,
}

impl JoinMessageType {
    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x00 => Some(Self::Begin),
            0x01 => Some(Self::BlobData),
            0x02 => Some(Self::EssentialData),
            0x03 => Some(Self::Registered),
            _ => None,
        }
    }

    fn tag(self) -> u8 {
        match self {
            Self::Begin => 0x00,
            Self::BlobData => 0x01,
            Self::EssentialData => 0x02,
            Self::Registered => 0x03,
        }
    }
}

/// One decoded join message.
#[derive(Clone, Debug, PartialEq)]
pub struct JoinMessage {
    pub kind: JoinMessageType,
    pub payload: Vec<u8>,
}

/// Error decoding a join message or a `BlobData` payload.
#[derive(Debug)]
pub enum Error {
    /// The frame was empty (no type byte).
    Empty,
    /// The type byte didn't match any known `JoinMessageType`.
    UnknownType(u8),
    /// A `BlobData` payload was shorter than its 4-byte id prefix.
    TruncatedBlobData,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty join-message frame"),
            Self::UnknownType(t) => write!(f, "unknown join-message type byte: {t:#04x}"),
            Self::TruncatedBlobData => write!(f, "BlobData payload shorter than its id prefix"),
        }
    }
}

impl std::error::Error for Error {}

/// Decode a relay-frame payload into a [`JoinMessage`].
pub fn decode_message(frame: &[u8]) -> Result<JoinMessage, Error> {
    let (&tag, payload) = frame.split_first().ok_or(Error::Empty)?;
    let kind = JoinMessageType::from_tag(tag).ok_or(Error::UnknownType(tag))?;
    Ok(JoinMessage { kind, payload: payload.to_vec() })
}

/// Encode a join message into a relay-frame payload.
pub fn encode_message(msg: &JoinMessage) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + msg.payload.len());
    out.push(msg.kind.tag());
    out.extend_from_slice(&msg.payload);
    out
}

/// Encode a `BlobData` payload: `id:u32LE || bytes`.
pub fn encode_blob_data(id: u32, bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + bytes.len());
    out.extend_from_slice(&id.to_le_bytes());
    out.extend_from_slice(bytes);
    out
}

/// Decode a `BlobData` payload into `(id, bytes)`.
pub fn decode_blob_data(payload: &[u8]) -> Result<(u32, Vec<u8>), Error> {
    if payload.len() < 4 {
        return Err(Error::TruncatedBlobData);
    }
    let id = u32::from_le_bytes(payload[0..4].try_into().unwrap());
    Ok((id, payload[4..].to_vec()))
}

/// Encode the empty `Registered` acknowledgement as a relay-frame payload.
pub fn encode_registered() -> Vec<u8> {
    encode_message(&JoinMessage { kind: JoinMessageType::Registered, payload: vec![] })
}
