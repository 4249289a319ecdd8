//! Typed interpretation of inbound container plaintexts.
//!
//! The session event loop hands callers a type tag plus the raw body; this
//! module turns that pair into one typed value per message kind, decoding
//! the group-member container for group kinds along the way, so handlers
//! dispatch on shape instead of re-probing bytes.

use devlink_wire::body::{self, message_type};
use devlink_wire::file_message::FileMessage;
use devlink_wire::message::GroupMemberContainer;

use crate::message::Error;

/// The group half of a group-addressed message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupContext {
    /// The group creator's identity.
    pub creator: [u8; 8],
    /// The 8-byte group id.
    pub group_id: [u8; 8],
}

/// One inbound message body, decoded by kind.
#[derive(Clone, Debug, PartialEq)]
pub enum IncomingContent {
    /// A plain text message.
    Text(String),
    /// A file message; the media itself still lives on the blob service.
    File(FileMessage),
    /// An in-place edit of an earlier message.
    Edit(body::Edit),
    /// A typing started/stopped signal.
    Typing(bool),
    /// A modern emoji reaction.
    Reaction(body::Reaction),
    /// A delivery receipt (including the legacy reaction fallback).
    DeliveryReceipt(body::DeliveryReceipt),
    /// A text message into a group.
    GroupText(GroupContext, String),
    /// A file message into a group.
    GroupFile(GroupContext, FileMessage),
    /// An edit of an earlier group message.
    GroupEdit(GroupContext, body::Edit),
    /// The creator's membership announcement.
    GroupSetup(body::GroupSetup),
    /// The creator's rename announcement.
    GroupName(body::GroupName),
    /// A reaction within a group.
    GroupReaction(GroupContext, body::Reaction),
    /// A delivery receipt within a group.
    GroupDeliveryReceipt(GroupContext, body::DeliveryReceipt),
    /// A kind this build does not know; kept whole for logging.
    Unknown {
        /// The unrecognized type tag.
        kind: u8,
        /// The untouched body bytes.
        body: Vec<u8>,
    },
}

fn group_parts(body: &[u8]) -> Result<(GroupContext, Vec<u8>), Error> {
    let container = GroupMemberContainer::decode(body).map_err(|_| Error::Truncated)?;
    Ok((
        GroupContext { creator: container.creator_identity, group_id: container.group_id },
        container.inner_data,
    ))
}

fn utf8(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Decode one `(kind, body)` pair as surfaced by the session event loop.
pub fn parse_incoming(kind: u8, body: &[u8]) -> Result<IncomingContent, Error> {
    Ok(match kind {
        message_type::TEXT => IncomingContent::Text(utf8(body)),
        message_type::FILE => {
            IncomingContent::File(FileMessage::from_json_bytes(body).map_err(|_| Error::Truncated)?)
        }
        message_type::EDIT => {
            IncomingContent::Edit(body::Edit::decode(body).map_err(|_| Error::Truncated)?)
        }
        message_type::TYPING => {
            let indicator = body::TypingIndicator::decode(body).map_err(|_| Error::Truncated)?;
            IncomingContent::Typing(indicator.typing)
        }
        message_type::REACTION => {
            IncomingContent::Reaction(body::Reaction::decode(body).map_err(|_| Error::Truncated)?)
        }
        message_type::DELIVERY_RECEIPT => IncomingContent::DeliveryReceipt(
            body::DeliveryReceipt::decode(body).map_err(|_| Error::Truncated)?,
        ),
        message_type::GROUP_TEXT => {
            let (group, inner) = group_parts(body)?;
            IncomingContent::GroupText(group, utf8(&inner))
        }
        message_type::GROUP_FILE => {
            let (group, inner) = group_parts(body)?;
            IncomingContent::GroupFile(group, FileMessage::from_json_bytes(&inner).map_err(|_| Error::Truncated)?)
        }
        message_type::GROUP_EDIT => {
            let (group, inner) = group_parts(body)?;
            IncomingContent::GroupEdit(group, body::Edit::decode(&inner).map_err(|_| Error::Truncated)?)
        }
        message_type::GROUP_SETUP => {
            IncomingContent::GroupSetup(body::GroupSetup::decode(body).map_err(|_| Error::Truncated)?)
        }
        message_type::GROUP_NAME => {
            IncomingContent::GroupName(body::GroupName::decode(body).map_err(|_| Error::Truncated)?)
        }
        message_type::GROUP_REACTION => {
            let (group, inner) = group_parts(body)?;
            IncomingContent::GroupReaction(group, body::Reaction::decode(&inner).map_err(|_| Error::Truncated)?)
        }
        message_type::GROUP_DELIVERY_RECEIPT => {
            let (group, inner) = group_parts(body)?;
            IncomingContent::GroupDeliveryReceipt(
                group,
                body::DeliveryReceipt::decode(&inner).map_err(|_| Error::Truncated)?,
            )
        }
        other => IncomingContent::Unknown { kind: other, body: body.to_vec() },
    })
}
