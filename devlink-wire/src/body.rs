//! Container-plaintext message bodies.
//!
//! Each message type has a small fixed encoding that lands inside the padded,
//! AEAD-sealed body box. Reactions and edits use a tagged-field layout
//! (`fixed64` message id, length-delimited payload) so a decoder can skip
//! fields it does not know; the rest are plain fixed layouts.

use crate::deserialize::{Cursor, Error as DeError};

/// Container-plaintext message type tag, prepended before padding.
pub mod message_type {
    pub const TEXT: u8 = 0x01;
    pub const FILE: u8 = 0x02;
    pub const EDIT: u8 = 0x03;
    pub const TYPING: u8 = 0x04;
    pub const REACTION: u8 = 0x05;
    pub const DELIVERY_RECEIPT: u8 = 0x06;
    pub const GROUP_TEXT: u8 = 0x41;
    pub const GROUP_FILE: u8 = 0x42;
    pub const GROUP_EDIT: u8 = 0x43;
    pub const GROUP_SETUP: u8 = 0x44;
    pub const GROUP_NAME: u8 = 0x45;
    pub const GROUP_REACTION: u8 = 0x46;
    pub const GROUP_DELIVERY_RECEIPT: u8 = 0x47;
}

/// Per-message flag bits carried in the message-with-metadata header.
pub mod message_flags {
    /// The server must not queue this message for offline recipients.
    pub const NO_QUEUEING: u8 = 0x02;
    /// The recipient must not send a delivery ack back.
    pub const NO_SERVER_ACK: u8 = 0x04;
}

// ─── Tagged-field helpers ─────────────────────────────────────────────────────

// Wire types: 1 = fixed64, 2 = length-delimited.
fn tag(field: u8, wire_type: u8) -> u8 {
    (field << 3) | wire_type
}

fn put_varint(out: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn read_varint(buf: &mut Cursor) -> Result<u64, DeError> {
    let mut v = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = buf.read_byte()?;
        v |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(v);
        }
        shift += 7;
        if shift >= 64 {
            return Err(DeError::LengthOutOfRange { len: shift as usize, max: 63 });
        }
    }
}

// ─── Reaction ─────────────────────────────────────────────────────────────────

/// Whether a reaction is being placed or removed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReactionAction {
    Apply,
    Withdraw,
}

/// A modern emoji reaction against a previously delivered message.
///
/// The action is encoded positionally: the inner record lands in field 1 for
/// `Apply` and field 2 for `Withdraw`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reaction {
    pub action: ReactionAction,
    pub message_id: u64,
    /// 1-64 bytes of UTF-8. Length validation is the composer's job.
    pub emoji: String,
}

impl Reaction {
    pub fn encode(&self) -> Vec<u8> {
        let mut inner = Vec::with_capacity(16 + self.emoji.len());
        inner.push(tag(1, 1));
        inner.extend_from_slice(&self.message_id.to_le_bytes());
        inner.push(tag(2, 2));
        put_varint(&mut inner, self.emoji.len() as u64);
        inner.extend_from_slice(self.emoji.as_bytes());

        let outer_field = match self.action {
            ReactionAction::Apply => 1,
            ReactionAction::Withdraw => 2,
        };
        let mut out = Vec::with_capacity(2 + inner.len());
        out.push(tag(outer_field, 2));
        put_varint(&mut out, inner.len() as u64);
        out.extend_from_slice(&inner);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DeError> {
        let mut buf = Cursor::from_slice(bytes);
        let outer = buf.read_byte()?;
        let action = match outer {
            t if t == tag(1, 2) => ReactionAction::Apply,
            t if t == tag(2, 2) => ReactionAction::Withdraw,
            other => return Err(DeError::UnexpectedTag { tag: other }),
        };
        let inner_len = read_varint(&mut buf)? as usize;
        let inner = buf.read_vec(inner_len)?;

        let mut buf = Cursor::from_slice(&inner);
        let mut message_id = None;
        let mut emoji = None;
        while buf.remaining() > 0 {
            match buf.read_byte()? {
                t if t == tag(1, 1) => {
                    let mut b = [0u8; 8];
                    buf.read_exact(&mut b)?;
                    message_id = Some(u64::from_le_bytes(b));
                }
                t if t == tag(2, 2) => {
                    let len = read_varint(&mut buf)? as usize;
                    let raw = buf.read_vec(len)?;
                    emoji = Some(String::from_utf8_lossy(&raw).into_owned());
                }
                other => return Err(DeError::UnexpectedTag { tag: other }),
            }
        }
        match (message_id, emoji) {
            (Some(message_id), Some(emoji)) => Ok(Self { action, message_id, emoji }),
            _ => Err(DeError::UnexpectedEof),
        }
    }
}

// ─── Edit ─────────────────────────────────────────────────────────────────────

/// An in-place text replacement for a previously sent message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Edit {
    /// The message id the edit targets.
    pub message_id: u64,
    pub text: String,
}

impl Edit {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.text.len());
        out.push(tag(1, 1));
        out.extend_from_slice(&self.message_id.to_le_bytes());
        out.push(tag(2, 2));
        put_varint(&mut out, self.text.len() as u64);
        out.extend_from_slice(self.text.as_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DeError> {
        let mut buf = Cursor::from_slice(bytes);
        let mut message_id = None;
        let mut text = None;
        while buf.remaining() > 0 {
            match buf.read_byte()? {
                t if t == tag(1, 1) => {
                    let mut b = [0u8; 8];
                    buf.read_exact(&mut b)?;
                    message_id = Some(u64::from_le_bytes(b));
                }
                t if t == tag(2, 2) => {
                    let len = read_varint(&mut buf)? as usize;
                    let raw = buf.read_vec(len)?;
                    text = Some(String::from_utf8_lossy(&raw).into_owned());
                }
                other => return Err(DeError::UnexpectedTag { tag: other }),
            }
        }
        match (message_id, text) {
            (Some(message_id), Some(text)) => Ok(Self { message_id, text }),
            _ => Err(DeError::UnexpectedEof),
        }
    }
}

// ─── Delivery receipt ─────────────────────────────────────────────────────────

/// Delivery-receipt status codes.
pub mod receipt_status {
    pub const RECEIVED: u8 = 0x01;
    pub const READ: u8 = 0x02;
    pub const ACKNOWLEDGED: u8 = 0x03;
    pub const DECLINED: u8 = 0x04;
}

/// A delivery receipt: one status applied to one or more message ids.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub status: u8,
    /// At least one id; the codec enforces this on decode.
    pub message_ids: Vec<u64>,
}

impl DeliveryReceipt {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.message_ids.len() * 8);
        out.push(self.status);
        for id in &self.message_ids {
            out.extend_from_slice(&id.to_le_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DeError> {
        let mut buf = Cursor::from_slice(bytes);
        let status = buf.read_byte()?;
        let mut message_ids = Vec::new();
        while buf.remaining() > 0 {
            let mut b = [0u8; 8];
            buf.read_exact(&mut b)?;
            message_ids.push(u64::from_le_bytes(b));
        }
        if message_ids.is_empty() {
            return Err(DeError::UnexpectedEof);
        }
        Ok(Self { status, message_ids })
    }
}

// ─── Group setup / name ───────────────────────────────────────────────────────

/// A group membership announcement sent by the creator: the member list with
/// the creator itself excluded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupSetup {
    pub group_id: [u8; 8],
    pub members: Vec<[u8; 8]>,
}

impl GroupSetup {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.members.len() * 8);
        out.extend_from_slice(&self.group_id);
        for member in &self.members {
            out.extend_from_slice(member);
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DeError> {
        let mut buf = Cursor::from_slice(bytes);
        let mut group_id = [0u8; 8];
        buf.read_exact(&mut group_id)?;
        let mut members = Vec::new();
        while buf.remaining() > 0 {
            let mut member = [0u8; 8];
            buf.read_exact(&mut member)?;
            members.push(member);
        }
        Ok(Self { group_id, members })
    }
}

/// A group rename, sent by the creator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupName {
    pub group_id: [u8; 8],
    pub name: String,
}

impl GroupName {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.name.len());
        out.extend_from_slice(&self.group_id);
        out.extend_from_slice(self.name.as_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DeError> {
        let mut buf = Cursor::from_slice(bytes);
        let mut group_id = [0u8; 8];
        buf.read_exact(&mut group_id)?;
        let mut raw = Vec::new();
        buf.read_to_end(&mut raw);
        Ok(Self { group_id, name: String::from_utf8_lossy(&raw).into_owned() })
    }
}

// ─── Typing indicator ─────────────────────────────────────────────────────────

/// A typing started/stopped signal. Sends carry the no-queueing and
/// no-server-ack flags ([`message_flags`]) since a stale indicator is worse
/// than a dropped one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TypingIndicator {
    pub typing: bool,
}

impl TypingIndicator {
    pub fn encode(&self) -> Vec<u8> {
        vec![u8::from(self.typing)]
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DeError> {
        match bytes.first() {
            Some(0) => Ok(Self { typing: false }),
            Some(1) => Ok(Self { typing: true }),
            Some(&other) => Err(DeError::UnexpectedTag { tag: other }),
            None => Err(DeError::UnexpectedEof),
        }
    }
}
