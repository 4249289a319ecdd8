//! Message composition and parsing: per-recipient AEAD body/metadata boxes,
//! caller-input validation, the reaction fallback matrix, and evolving-reply
//! edit coalescing.

use devlink_crypto::{aead_open_xsalsa, aead_seal_xsalsa, kdf32, precompute, random_bytes, CryptoError};
use devlink_wire::body::{self, DeliveryReceipt, Reaction, ReactionAction, receipt_status};
use devlink_wire::message::{GroupMemberContainer, MessageWithMetadata};

pub use devlink_wire::body::message_type;

use crate::dedupe::{EvolvingReplyEntry, EvolvingReplyKey, EvolvingReplyTable};
use crate::errors::CallerError;

/// Largest accepted edit body, in bytes.
pub const MAX_EDIT_BYTES: usize = 6_000;

/// Errors from message composition/parsing.
#[derive(Debug)]
pub enum Error {
    /// An AEAD operation failed.
    Crypto(CryptoError),
    /// A decoded container was too short for its fixed layout.
    Truncated,
    /// The caller handed in something invalid; nothing was sent.
    Caller(CallerError),
}

impl From<CryptoError> for Error {
    fn from(e: CryptoError) -> Self { Self::Crypto(e) }
}

impl From<CallerError> for Error {
    fn from(e: CallerError) -> Self { Self::Caller(e) }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Crypto(e) => write!(f, "crypto error: {e}"),
            Self::Truncated => write!(f, "truncated container"),
            Self::Caller(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for Error {}

// ─── Caller-input validation ──────────────────────────────────────────────────

/// Reject an empty text body before any I/O happens.
pub fn validate_text(text: &str) -> Result<(), CallerError> {
    if text.is_empty() {
        return Err(CallerError::EmptyText);
    }
    Ok(())
}

/// Reject an empty or oversized edit body before any I/O happens.
pub fn validate_edit(text: &str) -> Result<(), CallerError> {
    validate_text(text)?;
    if text.len() > MAX_EDIT_BYTES {
        return Err(CallerError::OversizedEdit { len: text.len() });
    }
    Ok(())
}

/// Reject a reaction emoji outside the 1-64 UTF-8-byte bound.
pub fn validate_emoji(emoji: &str) -> Result<(), CallerError> {
    if emoji.is_empty() || emoji.len() > 64 {
        return Err(CallerError::EmojiLength { len: emoji.len() });
    }
    Ok(())
}

// ─── Padding ──────────────────────────────────────────────────────────────────

/// Minimum container-plaintext length: padding makes every container at
/// least this many bytes so traffic analysis can't infer body length below
/// this floor.
const MIN_PADDED_LEN: usize = 32;

/// Pad `body`: choose `p` in `[1,255]`, widened if needed so the padded
/// length reaches [`MIN_PADDED_LEN`], then append `p` copies of the byte
/// value `p`.
fn pad(body: &[u8]) -> Vec<u8> {
    pad_with(body, random_byte())
}

/// [`pad`] with the random draw factored out so tests can pin it.
fn pad_with(body: &[u8], draw: u8) -> Vec<u8> {
    let mut p = 1 + (draw as usize % 255);
    if body.len() + p < MIN_PADDED_LEN {
        p = MIN_PADDED_LEN - body.len();
    }
    let p = p.min(255).max(1) as u8;
    let mut out = Vec::with_capacity(body.len() + p as usize);
    out.extend_from_slice(body);
    out.extend(std::iter::repeat(p).take(p as usize));
    out
}

fn random_byte() -> u8 {
    let mut b = [0u8; 1];
    random_bytes(&mut b);
    b[0]
}

/// Strip and validate the padding appended by [`pad`].
fn unpad(padded: &[u8]) -> Result<Vec<u8>, Error> {
    let p = *padded.last().ok_or(Error::Truncated)? as usize;
    if p == 0 || p > padded.len() {
        return Err(Error::Truncated);
    }
    Ok(padded[..padded.len() - p].to_vec())
}

// ─── Metadata ─────────────────────────────────────────────────────────────────

/// Metadata carried alongside the encrypted body, under its own derived key:
/// leading padding, the message id, its creation time, and an optional
/// nickname.
#[derive(Clone, Debug, PartialEq)]
pub struct Metadata {
    /// Number of leading zero pad bytes (0-15), drawn fresh per message.
    pub padding_len: u8,
    /// The logical message id, shared with the frame header.
    pub message_id: u64,
    /// Creation time in milliseconds since the epoch.
    pub created_at_millis: u64,
    /// Sender nickname, set only for star-prefixed gateway identities.
    pub nickname: Option<String>,
}

impl Metadata {
    /// Build metadata with a freshly drawn padding length.
    pub fn new(message_id: u64, created_at_millis: u64, nickname: Option<String>) -> Self {
        Self { padding_len: random_byte() & 0x0F, message_id, created_at_millis, nickname }
    }

    fn encode(&self) -> Vec<u8> {
        let pad_len = self.padding_len & 0x0F;
        let mut out = Vec::with_capacity(18 + pad_len as usize);
        out.push(pad_len);
        out.extend(std::iter::repeat(0u8).take(pad_len as usize));
        out.extend_from_slice(&self.message_id.to_le_bytes());
        out.extend_from_slice(&self.created_at_millis.to_le_bytes());
        match &self.nickname {
            Some(n) => {
                let bytes = n.as_bytes();
                out.push(bytes.len().min(255) as u8);
                out.extend_from_slice(&bytes[..bytes.len().min(255)]);
            }
            None => out.push(0),
        }
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let padding_len = *bytes.first().ok_or(Error::Truncated)?;
        if padding_len > 15 || bytes.len() < 1 + padding_len as usize {
            return Err(Error::Truncated);
        }
        let rest = &bytes[1 + padding_len as usize..];
        if rest.len() < 17 {
            return Err(Error::Truncated);
        }
        let message_id = u64::from_le_bytes(rest[0..8].try_into().unwrap());
        let created_at_millis = u64::from_le_bytes(rest[8..16].try_into().unwrap());
        let nick_len = rest[16] as usize;
        let nickname = if nick_len == 0 {
            None
        } else {
            let end = 17 + nick_len;
            if end > rest.len() {
                return Err(Error::Truncated);
            }
            Some(String::from_utf8_lossy(&rest[17..end]).into_owned())
        };
        Ok(Self { padding_len, message_id, created_at_millis, nickname })
    }
}

// ─── Per-recipient composition ────────────────────────────────────────────────

/// Everything needed to send a CSP outgoing container and its matching
/// reflection envelope for one recipient.
pub struct ComposedMessage {
    /// The 24-byte nonce shared by the body and metadata boxes.
    pub nonce: [u8; 24],
    /// The `message-with-metadata` frame ready for the outgoing container.
    pub frame: MessageWithMetadata,
}

/// Derive the metadata key from a body shared-key. Key separation is the
/// guarantee that lets both boxes share one nonce.
fn metadata_key(shared_key: &[u8; 32]) -> [u8; 32] {
    kdf32(shared_key, b"mm", b"3ma-csp", &[])
}

/// Compose a direct message body+metadata pair addressed to one recipient.
///
/// `inner_plain` is the type-tagged, not-yet-padded container plaintext
/// (already wrapped in a group container by the caller for group sends).
pub fn compose(
    client_secret: &[u8; 32],
    recipient_public: &[u8; 32],
    sender: [u8; 8],
    receiver: [u8; 8],
    flags: u8,
    inner_plain: &[u8],
    metadata: &Metadata,
) -> ComposedMessage {
    let padded = pad(inner_plain);
    let nonce: [u8; 24] = {
        let mut n = [0u8; 24];
        random_bytes(&mut n);
        n
    };

    let shared_key = precompute(client_secret, recipient_public);
    let encrypted_body = aead_seal_xsalsa(&shared_key, &nonce, &padded);

    let md_key = metadata_key(&shared_key);
    let encrypted_metadata = aead_seal_xsalsa(&md_key, &nonce, &metadata.encode());

    // The cleartext nickname field is only populated for star-prefixed
    // gateway identities; everyone else gets it from the encrypted metadata.
    let mut legacy_nickname = [0u8; 32];
    if sender[0] == b'*' {
        if let Some(nickname) = &metadata.nickname {
            let bytes = nickname.as_bytes();
            let n = bytes.len().min(32);
            legacy_nickname[..n].copy_from_slice(&bytes[..n]);
        }
    }

    let frame = MessageWithMetadata {
        sender,
        receiver,
        message_id: metadata.message_id,
        created_at_sec: (metadata.created_at_millis / 1000) as u32,
        flags,
        legacy_nickname,
        encrypted_metadata,
        message_nonce: nonce,
        encrypted_body,
    };

    ComposedMessage { nonce, frame }
}

/// Inverse of [`compose`]: recover the type-tagged inner plaintext and
/// metadata from a received frame.
pub fn open(
    client_secret: &[u8; 32],
    sender_public: &[u8; 32],
    frame: &MessageWithMetadata,
) -> Result<(Vec<u8>, Metadata), Error> {
    let shared_key = precompute(client_secret, sender_public);
    let padded = aead_open_xsalsa(&shared_key, &frame.message_nonce, &frame.encrypted_body)?;
    let inner_plain = unpad(&padded)?;

    let md_key = metadata_key(&shared_key);
    let md_plain = aead_open_xsalsa(&md_key, &frame.message_nonce, &frame.encrypted_metadata)?;
    let metadata = Metadata::decode(&md_plain)?;

    Ok((inner_plain, metadata))
}

/// Wrap `inner_data` in a group-member container for a non-creator sender.
pub fn wrap_group_member(creator_identity: [u8; 8], group_id: [u8; 8], inner_data: Vec<u8>) -> Vec<u8> {
    GroupMemberContainer { creator_identity, group_id, inner_data }.encode()
}

// ─── Reaction fallback matrix ─────────────────────────────────────────────────

/// Outcome of routing one recipient's reaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReactionRoute {
    /// Recipient supports modern reactions: send as-is.
    Modern,
    /// Recipient does not: send this legacy receipt status instead.
    LegacyReceipt(u8),
    /// Neither modern nor legacy applies (unmapped emoji, or a withdraw
    /// with no legacy equivalent); nothing is sent.
    Omitted,
}

const THUMBS_UP: &[&str] = &["\u{1F44D}", "\u{1F44D}\u{1F3FB}", "\u{1F44D}\u{1F3FC}", "\u{1F44D}\u{1F3FD}", "\u{1F44D}\u{1F3FE}", "\u{1F44D}\u{1F3FF}"];
const THUMBS_DOWN: &[&str] = &["\u{1F44E}", "\u{1F44E}\u{1F3FB}", "\u{1F44E}\u{1F3FC}", "\u{1F44E}\u{1F3FD}", "\u{1F44E}\u{1F3FE}", "\u{1F44E}\u{1F3FF}"];

/// Route a single `(emoji, apply)` reaction for a recipient whose
/// `supports_modern_reactions` bit reflects their `featureMask`.
pub fn route_reaction(emoji: &str, apply: bool, supports_modern_reactions: bool) -> Result<ReactionRoute, Error> {
    validate_emoji(emoji)?;
    if supports_modern_reactions {
        return Ok(ReactionRoute::Modern);
    }
    if !apply {
        return Ok(ReactionRoute::Omitted);
    }
    if THUMBS_UP.contains(&emoji) {
        Ok(ReactionRoute::LegacyReceipt(receipt_status::ACKNOWLEDGED))
    } else if THUMBS_DOWN.contains(&emoji) {
        Ok(ReactionRoute::LegacyReceipt(receipt_status::DECLINED))
    } else {
        Ok(ReactionRoute::Omitted)
    }
}

/// The modern reaction body for `(message_id, emoji, apply)`.
pub fn reaction_body(message_id: u64, emoji: &str, apply: bool) -> Vec<u8> {
    Reaction {
        action: if apply { ReactionAction::Apply } else { ReactionAction::Withdraw },
        message_id,
        emoji: emoji.to_string(),
    }
    .encode()
}

/// The legacy delivery-receipt body a non-supporting recipient gets instead.
pub fn legacy_receipt_body(status: u8, message_id: u64) -> Vec<u8> {
    DeliveryReceipt { status, message_ids: vec![message_id] }.encode()
}

/// How one logical group reaction was split across recipients.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupReactionMode {
    /// Every reached member got the modern body.
    Modern,
    /// Every reached member got a legacy receipt.
    Legacy,
    /// Some members got one, some the other.
    Mixed,
    /// Nothing was sendable at all.
    Omitted,
}

/// The per-recipient partition for one group reaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupReactionPlan {
    /// Members that get the modern tagged reaction body.
    pub modern: Vec<[u8; 8]>,
    /// `(member, legacy receipt status)` pairs.
    pub legacy: Vec<([u8; 8], u8)>,
    /// Members that get nothing for this reaction.
    pub omitted: Vec<[u8; 8]>,
    /// The overall partition shape, reported back to the caller.
    pub mode: GroupReactionMode,
}

/// Partition `members` (each tagged with reaction support) for one logical
/// group reaction.
pub fn plan_group_reaction(
    members: &[([u8; 8], bool)],
    emoji: &str,
    apply: bool,
) -> Result<GroupReactionPlan, Error> {
    validate_emoji(emoji)?;
    let mut plan = GroupReactionPlan {
        modern: Vec::new(),
        legacy: Vec::new(),
        omitted: Vec::new(),
        mode: GroupReactionMode::Omitted,
    };
    for (member, supports) in members {
        match route_reaction(emoji, apply, *supports)? {
            ReactionRoute::Modern => plan.modern.push(*member),
            ReactionRoute::LegacyReceipt(status) => plan.legacy.push((*member, status)),
            ReactionRoute::Omitted => plan.omitted.push(*member),
        }
    }
    plan.mode = match (!plan.modern.is_empty(), !plan.legacy.is_empty()) {
        (true, true) => GroupReactionMode::Mixed,
        (true, false) => GroupReactionMode::Modern,
        (false, true) => GroupReactionMode::Legacy,
        (false, false) => GroupReactionMode::Omitted,
    };
    Ok(plan)
}

// ─── Evolving-reply coalescing ────────────────────────────────────────────────

/// How an inbound reply fragment is tagged by the agent-dispatch contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkKind {
    /// A cumulative snapshot of the text so far; may be coalesced.
    Partial,
    /// A structural chunk that must land; appended if it does not extend.
    Block,
    /// The closing chunk; always emitted, draining anything pending.
    Final,
}

/// What the caller should actually send for one incoming chunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EvolvingAction {
    /// Send a fresh group text; becomes the new anchor.
    NewAnchor(String),
    /// Send a group-edit against the existing anchor.
    EditAnchor { anchor_message_id: u64, text: String },
    /// Held back by the delta/interval gates; a later chunk carries it.
    Coalesced,
    /// A regression (prefix of what was already sent); dropped outright.
    Skipped,
}

/// Drive one evolving-reply chunk through the coalescing rules.
///
/// Partial chunks carry cumulative text, so coalescing is a pure no-op: the
/// next chunk re-delivers everything held back. `now` is caller-supplied so
/// this stays a pure function over the table state.
pub fn advance_evolving_reply(
    table: &mut EvolvingReplyTable,
    key: EvolvingReplyKey,
    kind: ChunkKind,
    text: &str,
    min_chars_delta: usize,
    min_interval: std::time::Duration,
    now: std::time::SystemTime,
) -> EvolvingAction {
    let Some(existing) = table.get(&key, now).cloned() else {
        table.upsert(key, 0, text.to_string(), now);
        return EvolvingAction::NewAnchor(text.to_string());
    };

    if existing.last_text.starts_with(text) {
        return EvolvingAction::Skipped;
    }

    let next_text = if text.starts_with(existing.last_text.as_str()) {
        text.to_string()
    } else {
        format!("{}{}", existing.last_text, text)
    };

    if kind == ChunkKind::Partial {
        let small_delta = next_text.len() - existing.last_text.len() < min_chars_delta;
        let too_soon = now
            .duration_since(existing.last_updated_at)
            .map(|age| age < min_interval)
            .unwrap_or(false);
        if small_delta || too_soon {
            return EvolvingAction::Coalesced;
        }
    }

    table.upsert(key, existing.anchor_message_id, next_text.clone(), now);
    EvolvingAction::EditAnchor { anchor_message_id: existing.anchor_message_id, text: next_text }
}

/// Record the real anchor message id once the send that produced
/// [`EvolvingAction::NewAnchor`] actually completes.
pub fn record_anchor(table: &mut EvolvingReplyTable, key: EvolvingReplyKey, anchor_message_id: u64, text: String, now: std::time::SystemTime) {
    table.upsert(key, anchor_message_id, text, now);
}

/// Replace the table entry with a fresh anchor after an edit failure: the
/// stream continues against a brand-new group text instead of dying.
pub fn reanchor_after_edit_failure(table: &mut EvolvingReplyTable, key: EvolvingReplyKey, new_anchor_message_id: u64, text: String, now: std::time::SystemTime) -> EvolvingReplyEntry {
    table.upsert(key.clone(), new_anchor_message_id, text.clone(), now);
    table.get(&key, now).cloned().expect("just inserted")
}

/// Build the group-edit body targeting `anchor_message_id`.
pub fn edit_body(anchor_message_id: u64, text: &str) -> Result<Vec<u8>, Error> {
    validate_edit(text)?;
    Ok(body::Edit { message_id: anchor_message_id, text: text.to_string() }.encode())
}
