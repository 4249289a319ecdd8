//! The single-writer session event loop: everything between the raw
//! mediator socket and the caller-facing events.
//!
//! [`Session`] owns one mediator session plus an optional nested CSP
//! session, and routes every decoded frame through the dedupe set, the
//! message engine, and the supervisor's bookkeeping. It performs no I/O
//! itself: callers feed in frames read from the socket and get back events
//! plus frames to send, exactly as `devlink_proto::mediator::Ready` and
//! `devlink_proto::csp::Ready` already do individually — this module only
//! adds the plumbing between them.

use std::collections::HashMap;
use std::sync::Arc;

use devlink_proto::{csp, mediator};
use devlink_wire::envelope::{Conversation, Envelope, EnvelopeVariant, OutgoingMessage};
use devlink_wire::framing::{container_type, encode_csp_frame, CspFrameDecoder, MediatorFrame};
use devlink_wire::message::MessageWithMetadata;

use crate::dedupe::DedupeSet;
use crate::errors::DevlinkError;
use crate::message::{self, Metadata};
use crate::supervisor::Supervisor;

/// One fully decrypted inbound message, handed to the agent-dispatch host
/// or UI (both external collaborators).
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// The sender's 8-byte identity.
    pub sender: [u8; 8],
    /// Message id, unique per sender.
    pub message_id: u64,
    /// The container-plaintext type tag (`message::message_type`).
    pub kind: u8,
    /// The type-tagged body with the leading type byte stripped.
    pub body: Vec<u8>,
    /// The recovered per-message metadata.
    pub metadata: Metadata,
}

/// Which device-group synchronization plane a reflected sync touched.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    Contact,
    Group,
    Settings,
}

/// Events surfaced to the caller after feeding in one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The mediator promoted this device to leader; the CSP handshake
    /// should now be driven over the proxy channel and the result attached
    /// via [`Session::attach_csp`].
    PromotedToLeader,
    /// The reflection queue drained; steady state has been reached.
    ReflectionQueueDry,
    /// A previously sent reflection was acknowledged.
    ReflectAcked {
        /// The reflect id allocated when the message was sent.
        reflect_id: u32,
    },
    /// A previously sent CSP outgoing message was acknowledged.
    OutgoingAcked {
        /// The recipient's identity, as an ASCII string.
        receiver: String,
        /// The message id that was acknowledged.
        message_id: u64,
    },
    /// A new message arrived, survived dedupe, and was decrypted.
    Inbound(InboundMessage),
    /// A message with this `(sender, messageId)` pair was already seen
    /// and was dropped without being re-delivered to the caller.
    DuplicateDropped {
        /// The sender's 8-byte identity.
        sender: [u8; 8],
        /// The duplicate message id.
        message_id: u64,
    },
    /// A peer device in this device group sent a message; mirrored here so
    /// local state (read markers, reply anchors) can follow along.
    PeerMessageSent {
        /// The conversation the peer device addressed.
        conversation: Conversation,
        /// The logical message id the peer used.
        message_id: u64,
        /// The container-plaintext type tag.
        message_type: u8,
    },
    /// A reflected edit/reaction/receipt against an existing message.
    MessageUpdated {
        /// The message id the update targets.
        message_id: u64,
        /// Whether the updated message was inbound (`true`) or one of our
        /// own sends (`false`).
        incoming: bool,
    },
    /// A reflected contact-sync envelope was applied to the contact book.
    ContactSynced {
        /// The synced contact's identity string.
        identity: String,
    },
    /// A reflected contact/group/settings synchronization envelope that was
    /// surfaced without local application.
    Sync(SyncKind),
    /// Raw proxy bytes received while no CSP session is attached — the
    /// caller's handshake driver consumes these.
    HandshakeBytes(Vec<u8>),
}

/// Directory of recipient public keys keyed by identity wire bytes,
/// populated from the persisted contact directory.
pub type ContactBook = HashMap<[u8; 8], [u8; 32]>;

/// Frames produced by composing one outbound message. `frames` is ordered:
/// the reflect frame first, then the CSP fan-out in recipient order — the
/// same order the envelope's nonce list was built in.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    /// The reflect id to await via [`Supervisor::await_reflect_ack`].
    pub reflect_id: u32,
    /// The logical message id shared by every per-recipient send.
    pub message_id: u64,
    /// The recipients, in fan-out order, for outgoing-ack bookkeeping.
    pub recipients: Vec<[u8; 8]>,
    /// The frames to send, in order.
    pub frames: Vec<MediatorFrame>,
}

/// Ties one mediator session, an optional nested CSP session, and the
/// dedupe/supervisor state together into the session event loop.
pub struct Session {
    client_secret: [u8; 32],
    own_identity: [u8; 8],
    device_id: u64,
    mediator: mediator::Ready,
    csp: Option<csp::Ready>,
    csp_decoder: CspFrameDecoder,
    dedupe: DedupeSet,
    supervisor: Arc<Supervisor>,
    contacts: ContactBook,
}

impl Session {
    /// Build a session around a mediator session that has completed its
    /// handshake. `csp` starts unattached until the nested handshake
    /// completes externally.
    pub fn new(
        client_secret: [u8; 32],
        own_identity: [u8; 8],
        device_id: u64,
        mediator: mediator::Ready,
        dedupe: DedupeSet,
        supervisor: Arc<Supervisor>,
        contacts: ContactBook,
    ) -> Self {
        Self {
            client_secret,
            own_identity,
            device_id,
            mediator,
            csp: None,
            csp_decoder: CspFrameDecoder::new(),
            dedupe,
            supervisor,
            contacts,
        }
    }

    /// Attach a nested CSP session once its handshake has completed.
    pub fn attach_csp(&mut self, csp: csp::Ready) {
        self.supervisor.set_csp_ready(true);
        self.csp_decoder = CspFrameDecoder::new();
        self.csp = Some(csp);
    }

    /// Drop the CSP session on leader loss or mediator close; it only ever
    /// lives while the mediator keeps this device promoted.
    pub fn detach_csp(&mut self) {
        self.csp = None;
        self.supervisor.set_csp_ready(false);
    }

    /// Whether this device currently holds the mediator leader role.
    pub fn is_leader(&self) -> bool {
        self.mediator.is_leader
    }

    /// Whether a CSP session is currently attached.
    pub fn has_csp(&self) -> bool {
        self.csp.is_some()
    }

    /// Add or replace one contact's public key in the in-memory book.
    pub fn insert_contact(&mut self, identity: [u8; 8], public_key: [u8; 32]) {
        self.contacts.insert(identity, public_key);
    }

    /// Wrap already-sealed CSP bytes (handshake messages, the unblock
    /// container) into a length-prefixed proxy frame.
    pub fn proxy_frame_for(sealed: &[u8]) -> MediatorFrame {
        mediator::Ready::proxy_frame(encode_csp_frame(sealed))
    }

    /// Wrap raw unframed bytes (the 48-byte CSP client hello, which crosses
    /// the proxy before the length-prefixed framing starts) for the proxy.
    pub fn proxy_frame_raw(bytes: Vec<u8>) -> MediatorFrame {
        mediator::Ready::proxy_frame(bytes)
    }

    /// Feed one decoded D2M frame; returns events plus any frames that must
    /// be sent back to the mediator immediately (reflect acks, CSP acks,
    /// echo responses).
    pub fn on_mediator_frame(&mut self, frame_type: u8, payload: &[u8]) -> (Vec<SessionEvent>, Vec<MediatorFrame>) {
        let (raw_events, mut outgoing) = self.mediator.on_frame(frame_type, payload);
        let mut events = Vec::with_capacity(raw_events.len());
        for event in raw_events {
            match event {
                mediator::Event::PromotedToLeader => {
                    self.supervisor.set_leader(true);
                    events.push(SessionEvent::PromotedToLeader);
                }
                mediator::Event::ReflectionQueueDry => events.push(SessionEvent::ReflectionQueueDry),
                mediator::Event::ReflectAcked { reflect_id } => {
                    self.supervisor.resolve_reflect_ack(reflect_id);
                    events.push(SessionEvent::ReflectAcked { reflect_id });
                }
                mediator::Event::UnknownReflectAck { .. }
                | mediator::Event::TransactionBegin
                | mediator::Event::TransactionCommit
                | mediator::Event::TransactionReject
                | mediator::Event::TransactionEnd => {}
                mediator::Event::Reflected { envelope, .. } => {
                    events.extend(self.interpret_reflected(&envelope));
                }
                mediator::Event::ProxyBytes(bytes) => {
                    let (proxy_events, proxy_outgoing) = self.on_proxy_bytes(bytes);
                    events.extend(proxy_events);
                    outgoing.extend(proxy_outgoing);
                }
            }
        }
        (events, outgoing)
    }

    fn on_proxy_bytes(&mut self, bytes: Vec<u8>) -> (Vec<SessionEvent>, Vec<MediatorFrame>) {
        if self.csp.is_none() {
            return (vec![SessionEvent::HandshakeBytes(bytes)], vec![]);
        }
        self.csp_decoder.push(&bytes);
        let mut events = Vec::new();
        let mut outgoing = Vec::new();
        while let Some(sealed) = self.csp_decoder.pop_sealed_frame() {
            let csp = self.csp.as_mut().expect("checked above");
            match csp.open_container(&sealed) {
                Ok((kind, data)) => {
                    let (mut e, mut o) = self.on_csp_container(kind, &data);
                    events.append(&mut e);
                    outgoing.append(&mut o);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "CSP container decrypt failed, dropping frame");
                }
            }
        }
        (events, outgoing)
    }

    fn on_csp_container(&mut self, kind: u8, data: &[u8]) -> (Vec<SessionEvent>, Vec<MediatorFrame>) {
        match kind {
            container_type::ECHO_REQUEST => {
                let csp = self.csp.as_mut().expect("container only decodes with a session");
                let response = csp.seal_container(container_type::ECHO_RESPONSE, data);
                (vec![], vec![Self::proxy_frame_for(&response)])
            }
            container_type::ECHO_RESPONSE => (vec![], vec![]),
            container_type::OUTGOING_MESSAGE_ACK => {
                if data.len() < 16 {
                    tracing::warn!("OutgoingMessageAck container shorter than its fixed layout");
                    return (vec![], vec![]);
                }
                let mut receiver_bytes = [0u8; 8];
                receiver_bytes.copy_from_slice(&data[0..8]);
                let message_id = u64::from_le_bytes(data[8..16].try_into().unwrap());
                let receiver = identity_string(&receiver_bytes);
                self.supervisor.resolve_outgoing_ack(&receiver, message_id);
                (vec![SessionEvent::OutgoingAcked { receiver, message_id }], vec![])
            }
            container_type::INCOMING_MESSAGE => self.on_csp_incoming(data),
            other => {
                tracing::debug!(container_type = other, "unhandled CSP container type");
                (vec![], vec![])
            }
        }
    }

    fn on_csp_incoming(&mut self, data: &[u8]) -> (Vec<SessionEvent>, Vec<MediatorFrame>) {
        let frame = match MessageWithMetadata::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "malformed IncomingMessage container, dropping");
                return (vec![], vec![]);
            }
        };

        // The server is acked regardless of dedupe outcome, unless the
        // sender opted out of acks for this message.
        let mut outgoing = Vec::new();
        if frame.flags & devlink_wire::body::message_flags::NO_SERVER_ACK == 0 {
            let csp = self.csp.as_mut().expect("incoming container only decodes with a session");
            let ack = csp::Ready::encode_message_ack(&frame.sender, frame.message_id);
            let sealed = csp.seal_container(container_type::INCOMING_MESSAGE_ACK, &ack);
            outgoing.push(Self::proxy_frame_for(&sealed));
        }

        (self.surface_frame(&frame), outgoing)
    }

    /// Decode a reflected envelope and dispatch it by variant.
    fn interpret_reflected(&mut self, envelope: &[u8]) -> Vec<SessionEvent> {
        let envelope = match Envelope::decode(envelope) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "malformed reflected envelope, dropping");
                return Vec::new();
            }
        };

        match envelope.variant {
            EnvelopeVariant::IncomingMessage { sender, message_id, frame } => {
                if self.check_duplicate(&sender, message_id) {
                    return vec![SessionEvent::DuplicateDropped { sender, message_id }];
                }
                match MessageWithMetadata::decode(&frame) {
                    Ok(frame) => self.open_frame(&frame),
                    Err(e) => {
                        tracing::warn!(error = %e, "reflected incoming message with malformed frame, dropping");
                        Vec::new()
                    }
                }
            }
            EnvelopeVariant::OutgoingMessage(outgoing) => {
                // Dedupe against our own identity: the same logical send can
                // be reflected to us more than once across reconnects.
                let own = self.own_identity;
                if self.check_duplicate(&own, outgoing.message_id) {
                    return vec![SessionEvent::DuplicateDropped { sender: own, message_id: outgoing.message_id }];
                }
                vec![SessionEvent::PeerMessageSent {
                    conversation: outgoing.conversation,
                    message_id: outgoing.message_id,
                    message_type: outgoing.message_type,
                }]
            }
            EnvelopeVariant::IncomingMessageUpdate { message_id, .. } => {
                vec![SessionEvent::MessageUpdated { message_id, incoming: true }]
            }
            EnvelopeVariant::OutgoingMessageUpdate { message_id, .. } => {
                vec![SessionEvent::MessageUpdated { message_id, incoming: false }]
            }
            EnvelopeVariant::ContactSync(data) => self.apply_contact_sync(&data),
            EnvelopeVariant::GroupSync(_) => vec![SessionEvent::Sync(SyncKind::Group)],
            EnvelopeVariant::SettingsSync(_) => vec![SessionEvent::Sync(SyncKind::Settings)],
            EnvelopeVariant::Other { tag, .. } => {
                tracing::debug!(tag, "ignoring unknown reflected envelope variant");
                Vec::new()
            }
        }
    }

    /// A peer device synced a contact: fold the public key into our own
    /// book so the next send to that identity needs no directory lookup.
    fn apply_contact_sync(&mut self, data: &[u8]) -> Vec<SessionEvent> {
        let Ok(contact) = serde_json::from_slice::<devlink_join::Contact>(data) else {
            tracing::debug!("contact sync with unrecognized payload, surfacing without application");
            return vec![SessionEvent::Sync(SyncKind::Contact)];
        };
        match (
            crate::directory::parse_identity(&contact.identity),
            crate::directory::parse_public_key(&contact.public_key_hex),
        ) {
            (Ok(identity), Ok(public_key)) => {
                self.contacts.insert(identity, public_key);
                vec![SessionEvent::ContactSynced { identity: contact.identity }]
            }
            _ => {
                tracing::warn!(identity = %contact.identity, "contact sync with invalid identity or key, ignoring");
                vec![SessionEvent::Sync(SyncKind::Contact)]
            }
        }
    }

    /// Dedupe and open one message-with-metadata frame addressed to us.
    fn surface_frame(&mut self, frame: &MessageWithMetadata) -> Vec<SessionEvent> {
        if self.check_duplicate(&frame.sender, frame.message_id) {
            return vec![SessionEvent::DuplicateDropped { sender: frame.sender, message_id: frame.message_id }];
        }
        self.open_frame(frame)
    }

    fn check_duplicate(&mut self, sender: &[u8; 8], message_id: u64) -> bool {
        let sender_identity = identity_string(sender);
        let now_iso = chrono::Utc::now().to_rfc3339();
        match self.dedupe.check_and_insert(&sender_identity, message_id, &now_iso) {
            Ok(duplicate) => duplicate,
            Err(e) => {
                tracing::warn!(error = %e, "dedupe set persistence failed, processing message anyway");
                false
            }
        }
    }

    fn open_frame(&mut self, frame: &MessageWithMetadata) -> Vec<SessionEvent> {
        let sender_identity = identity_string(&frame.sender);
        let Some(sender_public) = self.contacts.get(&frame.sender).copied() else {
            tracing::warn!(sender = %sender_identity, "no known public key for sender, dropping");
            return Vec::new();
        };

        match message::open(&self.client_secret, &sender_public, frame) {
            Ok((plaintext, metadata)) => {
                let kind = plaintext.first().copied().unwrap_or(0);
                let body = plaintext.get(1..).unwrap_or(&[]).to_vec();
                vec![SessionEvent::Inbound(InboundMessage {
                    sender: frame.sender,
                    message_id: frame.message_id,
                    kind,
                    body,
                    metadata,
                })]
            }
            Err(e) => {
                tracing::warn!(error = %e, sender = %sender_identity, "failed to open inbound message, dropping");
                Vec::new()
            }
        }
    }

    // ─── Send paths ───────────────────────────────────────────────────────────

    /// The shared fan-out core behind every send: one container per
    /// `(recipient, plaintext)` pair, every recipient sharing the logical
    /// message id, and a reflection envelope whose nonce list matches the
    /// fan-out order exactly. The reflect frame always comes first. An empty
    /// recipient list (a self-only group) skips the fan-out and reflects
    /// with an empty nonce list, which needs no CSP session at all.
    fn fan_out(
        &mut self,
        conversation: Conversation,
        sends: &[([u8; 8], &[u8])],
        flags: u8,
        envelope_type: u8,
        envelope_body: &[u8],
        metadata: &Metadata,
    ) -> Result<Outbound, DevlinkError> {
        if !sends.is_empty() && self.csp.is_none() {
            return Err(no_csp());
        }

        let mut nonces = Vec::with_capacity(sends.len());
        let mut sealed_containers = Vec::with_capacity(sends.len());
        let mut recipients = Vec::with_capacity(sends.len());
        for (receiver, container_plain) in sends {
            let recipient_public = self.lookup_recipient(receiver)?;
            let composed = message::compose(
                &self.client_secret, &recipient_public, self.own_identity, *receiver, flags, container_plain, metadata,
            );
            nonces.push(composed.nonce);
            recipients.push(*receiver);
            let csp = self.csp.as_mut().expect("checked above");
            sealed_containers.push(csp.seal_container(container_type::OUTGOING_MESSAGE, &composed.frame.encode()));
        }

        let envelope = Envelope {
            source_device_id: self.device_id,
            variant: EnvelopeVariant::OutgoingMessage(OutgoingMessage {
                conversation,
                message_id: metadata.message_id,
                created_at_millis: metadata.created_at_millis,
                message_type: envelope_type,
                nonces,
                body: envelope_body.to_vec(),
            }),
        };
        let (reflect_id, reflect_frame) = self
            .mediator
            .reflect(&envelope.encode(random_pad()), metadata.created_at_millis);

        let mut frames = Vec::with_capacity(1 + sealed_containers.len());
        frames.push(reflect_frame);
        frames.extend(sealed_containers.iter().map(|sealed| Self::proxy_frame_for(sealed)));

        Ok(Outbound { reflect_id, message_id: metadata.message_id, recipients, frames })
    }

    /// Compose and seal a direct message addressed to `receiver`: the
    /// canonical envelope is reflected first, then one outgoing container is
    /// produced for the chat server, in that frame order.
    pub fn compose_direct_message(
        &mut self,
        receiver: [u8; 8],
        type_tag: u8,
        flags: u8,
        body: &[u8],
        metadata: Metadata,
    ) -> Result<Outbound, DevlinkError> {
        let plain = type_tagged(type_tag, body);
        self.fan_out(
            Conversation::Direct { peer: receiver },
            &[(receiver, plain.as_slice())],
            flags,
            type_tag,
            body,
            &metadata,
        )
    }

    /// A validated direct text message.
    pub fn compose_text(&mut self, receiver: [u8; 8], text: &str, metadata: Metadata) -> Result<Outbound, DevlinkError> {
        message::validate_text(text)?;
        self.compose_direct_message(receiver, message::message_type::TEXT, 0, text.as_bytes(), metadata)
    }

    /// An in-place edit of a previously sent direct message.
    pub fn compose_edit(
        &mut self,
        receiver: [u8; 8],
        target_message_id: u64,
        text: &str,
        metadata: Metadata,
    ) -> Result<Outbound, DevlinkError> {
        let body = message::edit_body(target_message_id, text).map_err(message_error)?;
        self.compose_direct_message(receiver, message::message_type::EDIT, 0, &body, metadata)
    }

    /// A delivery receipt covering one or more of the peer's message ids.
    pub fn compose_delivery_receipt(
        &mut self,
        receiver: [u8; 8],
        status: u8,
        message_ids: &[u64],
        metadata: Metadata,
    ) -> Result<Outbound, DevlinkError> {
        let body = devlink_wire::body::DeliveryReceipt { status, message_ids: message_ids.to_vec() }.encode();
        self.compose_direct_message(receiver, message::message_type::DELIVERY_RECEIPT, 0, &body, metadata)
    }

    /// A typing started/stopped indicator, flagged no-queueing/no-server-ack.
    pub fn compose_typing(&mut self, receiver: [u8; 8], typing: bool, metadata: Metadata) -> Result<Outbound, DevlinkError> {
        let (type_tag, flags, body) = crate::typing::typing_message(typing);
        self.compose_direct_message(receiver, type_tag, flags, &body, metadata)
    }

    /// A direct reaction, routed through the recipient's feature mask: a
    /// modern tagged body when supported, a legacy delivery receipt for the
    /// mapped thumb emoji otherwise, or nothing at all (`Ok(None)`).
    pub fn compose_reaction(
        &mut self,
        receiver: [u8; 8],
        target_message_id: u64,
        emoji: &str,
        apply: bool,
        supports_modern_reactions: bool,
        metadata: Metadata,
    ) -> Result<Option<Outbound>, DevlinkError> {
        match message::route_reaction(emoji, apply, supports_modern_reactions).map_err(message_error)? {
            message::ReactionRoute::Modern => {
                let body = message::reaction_body(target_message_id, emoji, apply);
                self.compose_direct_message(receiver, message::message_type::REACTION, 0, &body, metadata)
                    .map(Some)
            }
            message::ReactionRoute::LegacyReceipt(status) => {
                let body = message::legacy_receipt_body(status, target_message_id);
                self.compose_direct_message(receiver, message::message_type::DELIVERY_RECEIPT, 0, &body, metadata)
                    .map(Some)
            }
            message::ReactionRoute::Omitted => Ok(None),
        }
    }

    /// Compose a group message: the type tag leads (so receivers can
    /// dispatch on the first plaintext byte), followed by the group-member
    /// container wrapping the body, fanned out one container per recipient.
    pub fn compose_group_message(
        &mut self,
        creator: [u8; 8],
        group_id: [u8; 8],
        recipients: &[[u8; 8]],
        type_tag: u8,
        body: &[u8],
        metadata: Metadata,
    ) -> Result<Outbound, DevlinkError> {
        let container = message::wrap_group_member(creator, group_id, body.to_vec());
        let wrapped = type_tagged(type_tag, &container);
        let sends: Vec<_> = recipients.iter().map(|r| (*r, wrapped.as_slice())).collect();
        self.fan_out(
            Conversation::Group { creator, group_id },
            &sends,
            0,
            type_tag,
            body,
            &metadata,
        )
    }

    /// A group membership announcement: the member list (creator excluded)
    /// fanned out to every current and removed member, unwrapped since the
    /// body itself carries the group id.
    pub fn compose_group_setup(
        &mut self,
        group_id: [u8; 8],
        members: &[[u8; 8]],
        recipients: &[[u8; 8]],
        metadata: Metadata,
    ) -> Result<Outbound, DevlinkError> {
        let body = devlink_wire::body::GroupSetup { group_id, members: members.to_vec() }.encode();
        let plain = type_tagged(message::message_type::GROUP_SETUP, &body);
        let sends: Vec<_> = recipients.iter().map(|r| (*r, plain.as_slice())).collect();
        self.fan_out(
            Conversation::Group { creator: self.own_identity, group_id },
            &sends,
            0,
            message::message_type::GROUP_SETUP,
            &body,
            &metadata,
        )
    }

    /// A group rename, fanned out like a setup message.
    pub fn compose_group_name(
        &mut self,
        group_id: [u8; 8],
        name: &str,
        recipients: &[[u8; 8]],
        metadata: Metadata,
    ) -> Result<Outbound, DevlinkError> {
        let body = devlink_wire::body::GroupName { group_id, name: name.to_string() }.encode();
        let plain = type_tagged(message::message_type::GROUP_NAME, &body);
        let sends: Vec<_> = recipients.iter().map(|r| (*r, plain.as_slice())).collect();
        self.fan_out(
            Conversation::Group { creator: self.own_identity, group_id },
            &sends,
            0,
            message::message_type::GROUP_NAME,
            &body,
            &metadata,
        )
    }

    /// One logical group reaction, split across recipients by reaction
    /// support: supporting members get the group-reaction wrapper, the rest
    /// get a group delivery receipt, omitted members get nothing. The
    /// returned plan reports the partition; `None` means nothing was
    /// sendable at all.
    pub fn compose_group_reaction(
        &mut self,
        creator: [u8; 8],
        group_id: [u8; 8],
        members: &[([u8; 8], bool)],
        target_message_id: u64,
        emoji: &str,
        apply: bool,
        metadata: Metadata,
    ) -> Result<(message::GroupReactionPlan, Option<Outbound>), DevlinkError> {
        let plan = message::plan_group_reaction(members, emoji, apply).map_err(message_error)?;
        if plan.modern.is_empty() && plan.legacy.is_empty() {
            return Ok((plan, None));
        }

        let modern_plain = type_tagged(
            message::message_type::GROUP_REACTION,
            &message::wrap_group_member(creator, group_id, message::reaction_body(target_message_id, emoji, apply)),
        );
        // Fan-out order: modern members first, then the legacy fallbacks.
        let mut sends: Vec<([u8; 8], Vec<u8>)> = plan
            .modern
            .iter()
            .map(|member| (*member, modern_plain.clone()))
            .collect();
        for (member, status) in &plan.legacy {
            let legacy_plain = type_tagged(
                message::message_type::GROUP_DELIVERY_RECEIPT,
                &message::wrap_group_member(creator, group_id, message::legacy_receipt_body(*status, target_message_id)),
            );
            sends.push((*member, legacy_plain));
        }

        let borrowed: Vec<_> = sends.iter().map(|(member, plain)| (*member, plain.as_slice())).collect();
        let outbound = self.fan_out(
            Conversation::Group { creator, group_id },
            &borrowed,
            0,
            message::message_type::GROUP_REACTION,
            &message::reaction_body(target_message_id, emoji, apply),
            &metadata,
        )?;
        Ok((plan, Some(outbound)))
    }

    /// A liveness probe for the chat server: the server echoes the payload
    /// back as an `EchoResponse`.
    pub fn compose_echo_request(&mut self, payload: &[u8]) -> Result<MediatorFrame, DevlinkError> {
        let csp = self.csp.as_mut().ok_or_else(no_csp)?;
        let sealed = csp.seal_container(container_type::ECHO_REQUEST, payload);
        Ok(Self::proxy_frame_for(&sealed))
    }

    fn lookup_recipient(&self, receiver: &[u8; 8]) -> Result<[u8; 32], DevlinkError> {
        self.contacts.get(receiver).copied().ok_or_else(|| {
            DevlinkError::Protocol(format!("no public key known for {}", identity_string(receiver)))
        })
    }
}

fn type_tagged(type_tag: u8, body: &[u8]) -> Vec<u8> {
    let mut plain = Vec::with_capacity(1 + body.len());
    plain.push(type_tag);
    plain.extend_from_slice(body);
    plain
}

fn message_error(e: message::Error) -> DevlinkError {
    match e {
        message::Error::Caller(c) => DevlinkError::Caller(c),
        message::Error::Crypto(c) => DevlinkError::Crypto(c),
        message::Error::Truncated => DevlinkError::Protocol("truncated container".into()),
    }
}

fn no_csp() -> DevlinkError {
    DevlinkError::Transport("no CSP session attached; this device is not the leader".into())
}

fn random_pad() -> u8 {
    devlink_crypto::random_array::<1>()[0] & 0x0F
}

fn identity_string(id: &[u8; 8]) -> String {
    String::from_utf8_lossy(id).trim_end_matches('\0').to_string()
}
