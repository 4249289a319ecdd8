//! Device-join protocol (C4).
//!
//! Over a nominated rendezvous session, the new device consumes a sequence
//! of typed join messages — `Begin`, zero or more `BlobData`, then exactly
//! one `EssentialData` — persists the linked identity, and replies with a
//! single `Registered` acknowledgement before the rendezvous closes.
//!
//! Like `devlink-proto`, this is sans-IO: [`JoinSession`] consumes typed
//! join-message bytes and returns bytes to send plus the next state. The
//! caller supplies already-decrypted rendezvous payloads (see
//! `devlink_proto::authentication`) and is responsible for the relay
//! transport itself.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

pub mod qr;
pub mod wire;

pub use wire::{JoinMessage, JoinMessageType};

/// Errors from driving the join session.
#[derive(Debug)]
pub enum Error {
    /// The first frame received was not `Begin`.
    ExpectedBeginFirst,
    /// `EssentialData` arrived more than once.
    DuplicateEssentialData,
    /// A frame could not be decoded.
    Malformed(String),
    /// The rendezvous closed before `EssentialData` ever arrived.
    ClosedBeforeEssentialData,
    /// Persisting the linked identity to disk failed.
    Storage(io::Error),
    /// `EssentialData`'s JSON payload could not be parsed.
    Json(serde_json::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ExpectedBeginFirst => write!(f, "expected Begin as the first join message"),
            Self::DuplicateEssentialData => write!(f, "EssentialData received more than once"),
            Self::Malformed(msg) => write!(f, "malformed join message: {msg}"),
            Self::ClosedBeforeEssentialData => write!(f, "rendezvous closed before EssentialData arrived"),
            Self::Storage(e) => write!(f, "failed to persist linked identity: {e}"),
            Self::Json(e) => write!(f, "malformed EssentialData payload: {e}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self { Self::Storage(e) }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self { Self::Json(e) }
}

// ─── Data model (persisted-state schemas) ─────────────────────────────────────

/// Device-group data carried inside `EssentialData`: the root reflection
/// key and the mediator session cookie.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceGroupData {
    /// 32-byte device-group key (DGK), hex-encoded on the wire.
    #[serde(rename = "deviceGroupKey")]
    pub device_group_key_hex: String,
    /// 16-byte device cookie, hex-encoded on the wire.
    #[serde(rename = "deviceCookie")]
    pub device_cookie_hex: String,
}

/// One contact record, matching `contacts.json`'s schema exactly.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub identity: String,
    #[serde(rename = "publicKey")]
    pub public_key_hex: String,
    #[serde(rename = "firstName", skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(rename = "lastName", skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(rename = "featureMask", skip_serializing_if = "Option::is_none")]
    pub feature_mask: Option<u64>,
}

/// One group record, matching `groups.json`'s schema exactly.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Group {
    #[serde(rename = "creatorIdentity")]
    pub creator_identity: String,
    /// Decimal-string-encoded 8-byte group id, per the persisted-state schema.
    #[serde(rename = "groupId")]
    pub group_id_decimal: String,
    #[serde(rename = "memberIdentities")]
    pub member_identities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// The full `EssentialData` payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EssentialData {
    pub identity: String,
    /// 32-byte client key (long-lived X25519 secret), hex-encoded.
    #[serde(rename = "clientKey")]
    pub client_key_hex: String,
    #[serde(rename = "serverGroup")]
    pub server_group: String,
    #[serde(rename = "deviceGroupData")]
    pub device_group_data: DeviceGroupData,
    pub contacts: Vec<Contact>,
    pub groups: Vec<Group>,
}

/// The on-disk shape of `identity.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdentityFile {
    pub identity: String,
    #[serde(rename = "clientKey")]
    pub client_key_hex: String,
    #[serde(rename = "serverGroup")]
    pub server_group: String,
    #[serde(rename = "deviceGroupKey")]
    pub device_group_key_hex: String,
    #[serde(rename = "deviceCookie")]
    pub device_cookie_hex: String,
    #[serde(rename = "contactCount")]
    pub contact_count: usize,
    #[serde(rename = "groupCount")]
    pub group_count: usize,
    #[serde(rename = "linkedAt")]
    pub linked_at: String,
    #[serde(rename = "deviceId", skip_serializing_if = "Option::is_none")]
    pub device_id_hex: Option<String>,
}

/// Persist `data` under `data_dir`, writing `identity.json`, `contacts.json`,
/// and `groups.json` with their exact persisted field names. Each file is replaced
/// atomically (temp file + rename).
pub fn persist(data_dir: &Path, data: &EssentialData, linked_at_iso: &str) -> Result<(), Error> {
    fs::create_dir_all(data_dir)?;

    let identity_file = IdentityFile {
        identity: data.identity.clone(),
        client_key_hex: data.client_key_hex.clone(),
        server_group: data.server_group.clone(),
        device_group_key_hex: data.device_group_data.device_group_key_hex.clone(),
        device_cookie_hex: data.device_group_data.device_cookie_hex.clone(),
        contact_count: data.contacts.len(),
        group_count: data.groups.len(),
        linked_at: linked_at_iso.to_string(),
        device_id_hex: None,
    };

    write_json_atomic(&data_dir.join("identity.json"), &identity_file)?;
    write_json_atomic(&data_dir.join("contacts.json"), &data.contacts)?;
    write_json_atomic(&data_dir.join("groups.json"), &data.groups)?;
    tracing::info!(identity = %data.identity, contacts = data.contacts.len(), groups = data.groups.len(), "persisted linked identity");
    Ok(())
}

/// Convenience wrapper around [`persist`] that stamps `linkedAt` with the
/// current UTC time instead of requiring the caller to supply one.
pub fn persist_now(data_dir: &Path, data: &EssentialData) -> Result<(), Error> {
    persist(data_dir, data, &chrono::Utc::now().to_rfc3339())
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), Error> {
    let json = serde_json::to_vec_pretty(value)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp_path = dir.join(format!(".{}.tmp", path.file_name().and_then(|n| n.to_str()).unwrap_or("state")));
    fs::write(&tmp_path, json)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

// ─── Sans-IO session state machine ────────────────────────────────────────────

/// Awaiting the `Begin` marker, which must be the very first join message.
pub struct AwaitingBegin;

/// `Begin` received; collecting `BlobData` frames ahead of `EssentialData`.
#[derive(Debug)]
pub struct AwaitingEssentialData {
    blobs: HashMap<u32, Vec<u8>>,
}

/// `EssentialData` consumed and persisted; `Registered` has been sent.
pub struct Done {
    /// The parsed `EssentialData`, handed back for the caller's own use
    /// (e.g. seeding an in-memory contact cache before the mediator dials).
    pub essential_data: EssentialData,
}

/// Start a join session awaiting `Begin`.
pub fn start() -> AwaitingBegin { AwaitingBegin }

impl AwaitingBegin {
    /// Feed the first join message. Must be `Begin`; anything else is fatal.
    pub fn on_message(self, msg: &JoinMessage) -> Result<AwaitingEssentialData, Error> {
        match msg.kind {
            JoinMessageType::Begin => Ok(AwaitingEssentialData { blobs: HashMap::new() }),
            _ => Err(Error::ExpectedBeginFirst),
        }
    }
}

impl AwaitingEssentialData {
    /// Feed the next join message: either another `BlobData` (collected)
    /// or `EssentialData`, which persists state and yields the
    /// `Registered` ack bytes to send.
    pub fn on_message(
        mut self,
        msg: &JoinMessage,
        data_dir: &Path,
        linked_at_iso: &str,
    ) -> Result<JoinOutcome, Error> {
        match msg.kind {
            JoinMessageType::Begin => Err(Error::ExpectedBeginFirst),
            JoinMessageType::BlobData => {
                let (id, bytes) = wire::decode_blob_data(&msg.payload)
                    .map_err(|e| Error::Malformed(e.to_string()))?;
                self.blobs.insert(id, bytes);
                Ok(JoinOutcome::Continue(self))
            }
            JoinMessageType::EssentialData => {
                let essential_data: EssentialData = serde_json::from_slice(&msg.payload)?;
                persist(data_dir, &essential_data, linked_at_iso)?;
                let ack = wire::encode_registered();
                Ok(JoinOutcome::Done { ack, state: Done { essential_data } })
            }
            JoinMessageType::Registered => Err(Error::Malformed("Registered is client-to-relay only".into())),
        }
    }

    /// Blob bytes collected so far, keyed by id.
    pub fn blobs(&self) -> &HashMap<u32, Vec<u8>> { &self.blobs }

    /// Call when the rendezvous closes without ever delivering
    /// `EssentialData` — always a fatal protocol error.
    pub fn on_closed(self) -> Error { Error::ClosedBeforeEssentialData }
}

/// Result of feeding one message into [`AwaitingEssentialData`].
pub enum JoinOutcome {
    /// Not done yet; keep awaiting `EssentialData`.
    Continue(AwaitingEssentialData),
    /// `EssentialData` arrived, was persisted, and `ack` must be sent before
    /// closing the rendezvous.
    Done { ack: Vec<u8>, state: Done },
}
