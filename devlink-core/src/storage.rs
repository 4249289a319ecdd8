//! Persisted-state access under the caller-chosen data directory.
//!
//! The join flow (`devlink-join`) writes `identity.json`, `contacts.json`,
//! and `groups.json`; this module reads them back into typed key material,
//! lazily allocates the 64-bit device id on first connect, and owns the
//! inbound-media directory layout. Every write goes through
//! [`atomic_write`] so a crash never leaves a half-written file behind.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use devlink_join::{Contact, Group, IdentityFile};

use crate::directory::parse_identity;
use crate::errors::DevlinkError;

/// Write `contents` to `path` atomically: write to a sibling temp file, then
/// rename over the destination.
pub fn atomic_write(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let tmp_path = dir.join(format!(
        ".{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("state")
    ));
    fs::write(&tmp_path, contents)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// The linked identity, loaded once from `identity.json` and read-only
/// afterward except for the lazily allocated device id.
pub struct IdentityStore {
    path: PathBuf,
    file: IdentityFile,
    identity: [u8; 8],
    client_key: [u8; 32],
    device_group_key: [u8; 32],
    device_cookie: [u8; 16],
    device_id: Option<u64>,
}

impl IdentityStore {
    /// Load and decode `identity.json` from `data_dir`.
    pub fn load(data_dir: &Path) -> Result<Self, DevlinkError> {
        let path = data_dir.join("identity.json");
        let raw = fs::read_to_string(&path)?;
        let file: IdentityFile = serde_json::from_str(&raw)?;

        let identity = parse_identity(&file.identity)?;
        let client_key = decode_hex_array::<32>("clientKey", &file.client_key_hex)?;
        let device_group_key = decode_hex_array::<32>("deviceGroupKey", &file.device_group_key_hex)?;
        let device_cookie = decode_hex_array::<16>("deviceCookie", &file.device_cookie_hex)?;
        let device_id = file
            .device_id_hex
            .as_deref()
            .map(|h| decode_hex_array::<8>("deviceId", h).map(u64::from_le_bytes))
            .transpose()?;

        Ok(Self { path, file, identity, client_key, device_group_key, device_cookie, device_id })
    }

    /// The 8-character identity, validated at load time.
    pub fn identity(&self) -> &str { &self.file.identity }

    /// The identity as the 8 ASCII bytes used on the wire.
    pub fn identity_bytes(&self) -> [u8; 8] { self.identity }

    /// The long-lived X25519 client secret.
    pub fn client_key(&self) -> &[u8; 32] { &self.client_key }

    /// The opaque server-group routing tag.
    pub fn server_group(&self) -> &str { &self.file.server_group }

    /// The device-group key, root of the reflection key schedule.
    pub fn device_group_key(&self) -> &[u8; 32] { &self.device_group_key }

    /// The 16-byte device cookie sent in the CSP login extensions.
    pub fn device_cookie(&self) -> &[u8; 16] { &self.device_cookie }

    /// The persisted device id, if one has been allocated.
    pub fn device_id(&self) -> Option<u64> { self.device_id }

    /// Whether the next mediator connect is the first for this device (no
    /// device id had been allocated yet when the store was loaded).
    pub fn is_first_connect(&self) -> bool { self.device_id.is_none() }

    /// Return the device id, generating a random one and persisting it on
    /// the first call of this device's lifetime.
    pub fn ensure_device_id(&mut self) -> Result<u64, DevlinkError> {
        if let Some(id) = self.device_id {
            return Ok(id);
        }
        let id = u64::from_le_bytes(devlink_crypto::random_array::<8>());
        self.file.device_id_hex = Some(hex::encode(id.to_le_bytes()));
        self.device_id = Some(id);
        let json = serde_json::to_vec_pretty(&self.file)?;
        atomic_write(&self.path, &json)?;
        tracing::info!(device_id = id, "allocated and persisted device id");
        Ok(id)
    }
}

fn decode_hex_array<const N: usize>(field: &str, hex_str: &str) -> Result<[u8; N], DevlinkError> {
    let bytes = hex::decode(hex_str)
        .map_err(|e| DevlinkError::Protocol(format!("{field} is not valid hex: {e}")))?;
    bytes.as_slice().try_into().map_err(|_| {
        DevlinkError::Protocol(format!("{field} must be {N} bytes, got {}", bytes.len()))
    })
}

/// Load `contacts.json`, tolerating a missing file (an account with no
/// directory yet).
pub fn load_contacts(data_dir: &Path) -> Result<Vec<Contact>, DevlinkError> {
    load_json_or_default(&data_dir.join("contacts.json"))
}

/// Replace `contacts.json` wholesale. Entries are idempotent, so last write
/// wins across concurrent senders.
pub fn save_contacts(data_dir: &Path, contacts: &[Contact]) -> Result<(), DevlinkError> {
    let json = serde_json::to_vec_pretty(contacts)?;
    atomic_write(&data_dir.join("contacts.json"), &json)?;
    Ok(())
}

/// Load `groups.json`, tolerating a missing file.
pub fn load_groups(data_dir: &Path) -> Result<Vec<Group>, DevlinkError> {
    load_json_or_default(&data_dir.join("groups.json"))
}

fn load_json_or_default<T: serde::de::DeserializeOwned + Default>(path: &Path) -> Result<T, DevlinkError> {
    match fs::read_to_string(path) {
        Ok(raw) if !raw.trim().is_empty() => Ok(serde_json::from_str(&raw)?),
        Ok(_) => Ok(T::default()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

// ─── Inbound media layout ─────────────────────────────────────────────────────

/// Where a downloaded media blob for `(sender, message_id)` lands:
/// `media/inbound/<sender>/<timestamp>-<messageId>-<sanitized-filename>`.
pub fn media_inbound_path(
    data_dir: &Path,
    sender: &str,
    timestamp_millis: u64,
    message_id: u64,
    file_name: &str,
) -> PathBuf {
    data_dir
        .join("media")
        .join("inbound")
        .join(sender)
        .join(format!("{timestamp_millis}-{message_id}-{}", sanitize_filename(file_name)))
}

/// Persist one decrypted inbound media payload under the media layout,
/// returning the path it landed at.
pub fn save_inbound_media(
    data_dir: &Path,
    sender: &str,
    timestamp_millis: u64,
    message_id: u64,
    file_name: &str,
    plaintext: &[u8],
) -> Result<PathBuf, DevlinkError> {
    let path = media_inbound_path(data_dir, sender, timestamp_millis, message_id, file_name);
    atomic_write(&path, plaintext)?;
    tracing::info!(sender, message_id, path = %path.display(), bytes = plaintext.len(), "stored inbound media");
    Ok(path)
}

/// Reduce an attacker-chosen file name to a safe path component: only
/// alphanumerics, dots, dashes and underscores survive, no leading dot, and
/// the result is capped at 128 bytes.
pub fn sanitize_filename(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect();
    while out.starts_with('.') {
        out.remove(0);
    }
    out.truncate(128);
    if out.is_empty() {
        out.push_str("file");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use devlink_join::{DeviceGroupData, EssentialData};

    fn linked_data_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let data = EssentialData {
            identity: "ABCD1234".into(),
            client_key_hex: "11".repeat(32),
            server_group: "g1".into(),
            device_group_data: DeviceGroupData {
                device_group_key_hex: "22".repeat(32),
                device_cookie_hex: "33".repeat(16),
            },
            contacts: vec![Contact {
                identity: "BOB00001".into(),
                public_key_hex: "44".repeat(32),
                feature_mask: Some(0x200),
                ..Default::default()
            }],
            groups: vec![],
        };
        devlink_join::persist(dir.path(), &data, "2026-08-01T00:00:00Z").unwrap();
        dir
    }

    #[test]
    fn identity_store_decodes_the_persisted_key_material() {
        let dir = linked_data_dir();
        let store = IdentityStore::load(dir.path()).unwrap();
        assert_eq!(store.identity(), "ABCD1234");
        assert_eq!(store.identity_bytes(), *b"ABCD1234");
        assert_eq!(store.client_key(), &[0x11; 32]);
        assert_eq!(store.device_group_key(), &[0x22; 32]);
        assert_eq!(store.device_cookie(), &[0x33; 16]);
        assert!(store.is_first_connect());
    }

    #[test]
    fn ensure_device_id_allocates_once_and_persists() {
        let dir = linked_data_dir();
        let mut store = IdentityStore::load(dir.path()).unwrap();
        let id = store.ensure_device_id().unwrap();
        assert_eq!(store.ensure_device_id().unwrap(), id);

        let reloaded = IdentityStore::load(dir.path()).unwrap();
        assert_eq!(reloaded.device_id(), Some(id));
        assert!(!reloaded.is_first_connect());
    }

    #[test]
    fn malformed_hex_in_the_identity_file_is_rejected() {
        let dir = linked_data_dir();
        let path = dir.path().join("identity.json");
        let raw = fs::read_to_string(&path).unwrap().replace(&"11".repeat(32), "zz");
        fs::write(&path, raw).unwrap();
        assert!(matches!(IdentityStore::load(dir.path()), Err(DevlinkError::Protocol(_))));
    }

    #[test]
    fn contacts_round_trip_through_save_and_load() {
        let dir = linked_data_dir();
        let mut contacts = load_contacts(dir.path()).unwrap();
        assert_eq!(contacts.len(), 1);
        contacts.push(Contact {
            identity: "EVE00001".into(),
            public_key_hex: "55".repeat(32),
            ..Default::default()
        });
        save_contacts(dir.path(), &contacts).unwrap();
        assert_eq!(load_contacts(dir.path()).unwrap().len(), 2);
    }

    #[test]
    fn missing_contacts_file_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_contacts(dir.path()).unwrap().is_empty());
        assert!(load_groups(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn media_path_keeps_sender_and_ids_and_sanitizes_the_name() {
        let path = media_inbound_path(Path::new("/data"), "BOB00001", 1_700_000_000_000, 42, "../../etc/passwd");
        assert_eq!(
            path,
            Path::new("/data/media/inbound/BOB00001/1700000000000-42-_.._etc_passwd")
        );
    }

    #[test]
    fn inbound_media_lands_under_the_sender_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = save_inbound_media(dir.path(), "BOB00001", 1_000, 7, "pic.jpg", b"bytes").unwrap();
        assert!(path.ends_with("media/inbound/BOB00001/1000-7-pic.jpg"));
        assert_eq!(fs::read(&path).unwrap(), b"bytes");
    }

    #[test]
    fn sanitize_strips_leading_dots_and_never_returns_empty() {
        assert_eq!(sanitize_filename("..hidden"), "hidden");
        assert_eq!(sanitize_filename("///"), "___");
        assert_eq!(sanitize_filename(""), "file");
        assert_eq!(sanitize_filename("photo 1.jpg"), "photo_1.jpg");
    }
}
