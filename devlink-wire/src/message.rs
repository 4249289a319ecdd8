//! The message-with-metadata frame and the group addressing containers.

use crate::deserialize::{Cursor, Deserializable, Error as DeError};
use crate::serialize::Serializable;

/// `message-with-metadata`, exact byte layout from offset 0:
///
/// ```text
/// sender(8) | receiver(8) | messageId(8) | createdAtSec(4:u32LE) |
/// flags(1)  | reserved(1) | metadataLen(2:u16LE) | legacyNickname(32) |
/// encryptedMetadata(metadataLen) | messageNonce(24) | encryptedBody(..)
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct MessageWithMetadata {
    pub sender: [u8; 8],
    pub receiver: [u8; 8],
    pub message_id: u64,
    pub created_at_sec: u32,
    pub flags: u8,
    /// All-zero for identities that are not star-prefixed (gateway bots).
    pub legacy_nickname: [u8; 32],
    pub encrypted_metadata: Vec<u8>,
    pub message_nonce: [u8; 24],
    pub encrypted_body: Vec<u8>,
}

impl MessageWithMetadata {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.sender.serialize(&mut out);
        self.receiver.serialize(&mut out);
        self.message_id.serialize(&mut out);
        self.created_at_sec.serialize(&mut out);
        self.flags.serialize(&mut out);
        0u8.serialize(&mut out); // reserved
        (self.encrypted_metadata.len() as u16).serialize(&mut out);
        self.legacy_nickname.serialize(&mut out);
        out.extend_from_slice(&self.encrypted_metadata);
        self.message_nonce.serialize(&mut out);
        out.extend_from_slice(&self.encrypted_body);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DeError> {
        let mut buf = Cursor::from_slice(bytes);
        let sender = <[u8; 8]>::deserialize(&mut buf)?;
        let receiver = <[u8; 8]>::deserialize(&mut buf)?;
        let message_id = u64::deserialize(&mut buf)?;
        let created_at_sec = u32::deserialize(&mut buf)?;
        let flags = u8::deserialize(&mut buf)?;
        let _reserved = u8::deserialize(&mut buf)?;
        let metadata_len = u16::deserialize(&mut buf)? as usize;
        let legacy_nickname = <[u8; 32]>::deserialize(&mut buf)?;
        let encrypted_metadata = buf.read_vec(metadata_len)?;
        let message_nonce = <[u8; 24]>::deserialize(&mut buf)?;
        let mut encrypted_body = Vec::new();
        buf.read_to_end(&mut encrypted_body);
        Ok(Self {
            sender,
            receiver,
            message_id,
            created_at_sec,
            flags,
            legacy_nickname,
            encrypted_metadata,
            message_nonce,
            encrypted_body,
        })
    }
}

/// Group-creator container: `creatorsGroupId(8) || innerData`. Used only by
/// the group's creator when addressing members by group id.
#[derive(Clone, Debug, PartialEq)]
pub struct GroupCreatorContainer {
    pub creators_group_id: [u8; 8],
    pub inner_data: Vec<u8>,
}

impl GroupCreatorContainer {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.inner_data.len());
        self.creators_group_id.serialize(&mut out);
        out.extend_from_slice(&self.inner_data);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DeError> {
        let mut buf = Cursor::from_slice(bytes);
        let creators_group_id = <[u8; 8]>::deserialize(&mut buf)?;
        let mut inner_data = Vec::new();
        buf.read_to_end(&mut inner_data);
        Ok(Self { creators_group_id, inner_data })
    }
}

/// Group-member container: `creatorIdentity(8 ASCII) || groupId(8) || innerData`.
/// Used by any member when addressing others in the group.
#[derive(Clone, Debug, PartialEq)]
pub struct GroupMemberContainer {
    pub creator_identity: [u8; 8],
    pub group_id: [u8; 8],
    pub inner_data: Vec<u8>,
}

impl GroupMemberContainer {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.inner_data.len());
        self.creator_identity.serialize(&mut out);
        self.group_id.serialize(&mut out);
        out.extend_from_slice(&self.inner_data);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DeError> {
        let mut buf = Cursor::from_slice(bytes);
        let creator_identity = <[u8; 8]>::deserialize(&mut buf)?;
        let group_id = <[u8; 8]>::deserialize(&mut buf)?;
        let mut inner_data = Vec::new();
        buf.read_to_end(&mut inner_data);
        Ok(Self { creator_identity, group_id, inner_data })
    }
}
