//! The reflection envelope: the plaintext carried inside every `Reflected`
//! and `Reflect` frame, encrypted under the device group's reflection key.
//!
//! An envelope is decoded once into a tagged union and passed to handlers by
//! shape. Unknown variants are preserved as [`EnvelopeVariant::Other`] so a
//! newer peer device cannot break an older one.

use crate::deserialize::{Cursor, Deserializable, Error as DeError};
use crate::serialize::Serializable;

/// Envelope protocol version stamped on every encode.
pub const ENVELOPE_VERSION: u8 = 1;

/// Which conversation a message belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Conversation {
    /// A one-to-one chat with `peer`.
    Direct { peer: [u8; 8] },
    /// A group chat, identified by its creator and 8-byte group id.
    Group { creator: [u8; 8], group_id: [u8; 8] },
}

impl Conversation {
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Self::Direct { peer } => {
                out.push(0);
                peer.serialize(out);
            }
            Self::Group { creator, group_id } => {
                out.push(1);
                creator.serialize(out);
                group_id.serialize(out);
            }
        }
    }

    fn decode(buf: &mut Cursor) -> Result<Self, DeError> {
        match buf.read_byte()? {
            0 => Ok(Self::Direct { peer: <[u8; 8]>::deserialize(buf)? }),
            1 => Ok(Self::Group {
                creator: <[u8; 8]>::deserialize(buf)?,
                group_id: <[u8; 8]>::deserialize(buf)?,
            }),
            other => Err(DeError::UnexpectedTag { tag: other }),
        }
    }
}

/// An outgoing message as reflected to peer devices: the canonical inner
/// body exactly once, plus the ordered per-recipient nonce list that the
/// chat-server fan-out will use for the same logical message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub conversation: Conversation,
    pub message_id: u64,
    pub created_at_millis: u64,
    pub message_type: u8,
    /// One nonce per chat-server recipient, in fan-out order. Empty for
    /// group-only self messages that skip the fan-out entirely.
    pub nonces: Vec<[u8; 24]>,
    /// The type-stripped plaintext body.
    pub body: Vec<u8>,
}

/// One decoded reflection envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    /// The device-group member that produced this envelope.
    pub source_device_id: u64,
    pub variant: EnvelopeVariant,
}

/// The envelope payload, decoded by shape.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnvelopeVariant {
    /// A message another device received from the chat server; carries the
    /// raw message-with-metadata frame it saw.
    IncomingMessage { sender: [u8; 8], message_id: u64, frame: Vec<u8> },
    /// A message another device (or this one) sent.
    OutgoingMessage(OutgoingMessage),
    /// An update (edit, reaction, receipt) applied to a received message.
    IncomingMessageUpdate { sender: [u8; 8], message_id: u64, update: Vec<u8> },
    /// An update applied to a sent message.
    OutgoingMessageUpdate { conversation: Conversation, message_id: u64, update: Vec<u8> },
    ContactSync(Vec<u8>),
    GroupSync(Vec<u8>),
    SettingsSync(Vec<u8>),
    /// A variant this build does not know. Kept whole so it can be logged
    /// or forwarded without loss.
    Other { tag: u8, data: Vec<u8> },
}

mod variant_tag {
    pub const INCOMING_MESSAGE: u8 = 0x01;
    pub const OUTGOING_MESSAGE: u8 = 0x02;
    pub const INCOMING_MESSAGE_UPDATE: u8 = 0x03;
    pub const OUTGOING_MESSAGE_UPDATE: u8 = 0x04;
    pub const CONTACT_SYNC: u8 = 0x05;
    pub const GROUP_SYNC: u8 = 0x06;
    pub const SETTINGS_SYNC: u8 = 0x07;
}

impl Envelope {
    /// Encode with `pad_len & 0x0F` leading zero bytes of padding. Callers
    /// draw the pad length from the CSPRNG; this crate stays deterministic.
    pub fn encode(&self, pad_len: u8) -> Vec<u8> {
        let pad_len = pad_len & 0x0F;
        let mut out = Vec::with_capacity(16 + 10);
        out.push(pad_len);
        out.extend(std::iter::repeat(0u8).take(pad_len as usize));
        out.push(ENVELOPE_VERSION);
        self.source_device_id.serialize(&mut out);

        match &self.variant {
            EnvelopeVariant::IncomingMessage { sender, message_id, frame } => {
                out.push(variant_tag::INCOMING_MESSAGE);
                sender.serialize(&mut out);
                message_id.serialize(&mut out);
                out.extend_from_slice(frame);
            }
            EnvelopeVariant::OutgoingMessage(m) => {
                out.push(variant_tag::OUTGOING_MESSAGE);
                m.conversation.encode(&mut out);
                m.message_id.serialize(&mut out);
                m.created_at_millis.serialize(&mut out);
                out.push(m.message_type);
                out.push(m.nonces.len() as u8);
                for nonce in &m.nonces {
                    nonce.serialize(&mut out);
                }
                out.extend_from_slice(&m.body);
            }
            EnvelopeVariant::IncomingMessageUpdate { sender, message_id, update } => {
                out.push(variant_tag::INCOMING_MESSAGE_UPDATE);
                sender.serialize(&mut out);
                message_id.serialize(&mut out);
                out.extend_from_slice(update);
            }
            EnvelopeVariant::OutgoingMessageUpdate { conversation, message_id, update } => {
                out.push(variant_tag::OUTGOING_MESSAGE_UPDATE);
                conversation.encode(&mut out);
                message_id.serialize(&mut out);
                out.extend_from_slice(update);
            }
            EnvelopeVariant::ContactSync(data) => {
                out.push(variant_tag::CONTACT_SYNC);
                out.extend_from_slice(data);
            }
            EnvelopeVariant::GroupSync(data) => {
                out.push(variant_tag::GROUP_SYNC);
                out.extend_from_slice(data);
            }
            EnvelopeVariant::SettingsSync(data) => {
                out.push(variant_tag::SETTINGS_SYNC);
                out.extend_from_slice(data);
            }
            EnvelopeVariant::Other { tag, data } => {
                out.push(*tag);
                out.extend_from_slice(data);
            }
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DeError> {
        let mut buf = Cursor::from_slice(bytes);
        let pad_len = buf.read_byte()? as usize;
        if pad_len > 15 {
            return Err(DeError::LengthOutOfRange { len: pad_len, max: 15 });
        }
        let _pad = buf.read_vec(pad_len)?;
        let _version = buf.read_byte()?;
        let source_device_id = u64::deserialize(&mut buf)?;
        let tag = buf.read_byte()?;

        let variant = match tag {
            variant_tag::INCOMING_MESSAGE => {
                let sender = <[u8; 8]>::deserialize(&mut buf)?;
                let message_id = u64::deserialize(&mut buf)?;
                let mut frame = Vec::new();
                buf.read_to_end(&mut frame);
                EnvelopeVariant::IncomingMessage { sender, message_id, frame }
            }
            variant_tag::OUTGOING_MESSAGE => {
                let conversation = Conversation::decode(&mut buf)?;
                let message_id = u64::deserialize(&mut buf)?;
                let created_at_millis = u64::deserialize(&mut buf)?;
                let message_type = buf.read_byte()?;
                let nonce_count = buf.read_byte()? as usize;
                let mut nonces = Vec::with_capacity(nonce_count);
                for _ in 0..nonce_count {
                    nonces.push(<[u8; 24]>::deserialize(&mut buf)?);
                }
                let mut body = Vec::new();
                buf.read_to_end(&mut body);
                EnvelopeVariant::OutgoingMessage(OutgoingMessage {
                    conversation, message_id, created_at_millis, message_type, nonces, body,
                })
            }
            variant_tag::INCOMING_MESSAGE_UPDATE => {
                let sender = <[u8; 8]>::deserialize(&mut buf)?;
                let message_id = u64::deserialize(&mut buf)?;
                let mut update = Vec::new();
                buf.read_to_end(&mut update);
                EnvelopeVariant::IncomingMessageUpdate { sender, message_id, update }
            }
            variant_tag::OUTGOING_MESSAGE_UPDATE => {
                let conversation = Conversation::decode(&mut buf)?;
                let message_id = u64::deserialize(&mut buf)?;
                let mut update = Vec::new();
                buf.read_to_end(&mut update);
                EnvelopeVariant::OutgoingMessageUpdate { conversation, message_id, update }
            }
            variant_tag::CONTACT_SYNC => {
                let mut data = Vec::new();
                buf.read_to_end(&mut data);
                EnvelopeVariant::ContactSync(data)
            }
            variant_tag::GROUP_SYNC => {
                let mut data = Vec::new();
                buf.read_to_end(&mut data);
                EnvelopeVariant::GroupSync(data)
            }
            variant_tag::SETTINGS_SYNC => {
                let mut data = Vec::new();
                buf.read_to_end(&mut data);
                EnvelopeVariant::SettingsSync(data)
            }
            other => {
                let mut data = Vec::new();
                buf.read_to_end(&mut data);
                EnvelopeVariant::Other { tag: other, data }
            }
        };

        Ok(Self { source_device_id, variant })
    }
}
