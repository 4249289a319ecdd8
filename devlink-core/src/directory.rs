//! Contact directory and the public-key lookup contract.
//!
//! The directory service itself is an external collaborator; this module
//! defines the one call the core needs from it (identity → 32-byte public
//! key), normalizes the three result encodings collaborators are known to
//! return (hex, base64, a JSON object with an embedded key field), and
//! caches resolved keys in memory and in `contacts.json`.

use std::collections::HashMap;
use std::path::PathBuf;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use devlink_join::Contact;

use crate::errors::{CallerError, DevlinkError};
use crate::storage;

/// Feature-mask bit indicating the contact's clients understand modern
/// emoji reactions. Contacts without it get the legacy receipt fallback.
pub const FEATURE_MASK_REACTIONS: u64 = 0x200;

/// Parse and validate an 8-character identity (`[*0-9A-Z]{8}`) into its
/// ASCII wire bytes.
pub fn parse_identity(identity: &str) -> Result<[u8; 8], CallerError> {
    let bytes = identity.as_bytes();
    if bytes.len() != 8
        || !bytes.iter().all(|&b| b == b'*' || b.is_ascii_digit() || b.is_ascii_uppercase())
    {
        return Err(CallerError::InvalidIdentity(identity.to_string()));
    }
    Ok(bytes.try_into().expect("length checked above"))
}

/// The single call the core needs from the directory service.
pub trait PublicKeyLookup {
    /// Return the raw lookup result for `identity` — hex, base64, or a JSON
    /// object containing the key. [`parse_public_key`] normalizes it.
    fn lookup(&self, identity: &str) -> Result<String, DevlinkError>;
}

/// Normalize a lookup result into exactly 32 key bytes. Hex, base64, and
/// JSON-embedded fields (`publicKey`/`key`) are treated as equivalent;
/// anything that does not decode to 32 bytes is rejected.
pub fn parse_public_key(input: &str) -> Result<[u8; 32], DevlinkError> {
    let trimmed = input.trim();

    if trimmed.starts_with('{') {
        let value: serde_json::Value = serde_json::from_str(trimmed)?;
        let embedded = value
            .get("publicKey")
            .or_else(|| value.get("key"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| DevlinkError::Protocol("lookup result has no publicKey field".into()))?;
        return parse_public_key(embedded);
    }

    let decoded = if trimmed.len() == 64 && trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        hex::decode(trimmed).expect("hex digits checked above")
    } else {
        BASE64
            .decode(trimmed)
            .map_err(|e| DevlinkError::Protocol(format!("lookup result is neither hex nor base64: {e}")))?
    };

    decoded.as_slice().try_into().map_err(|_| {
        DevlinkError::Protocol(format!("public key must be 32 bytes, got {}", decoded.len()))
    })
}

/// One resolved directory entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// The contact's long-term X25519 public key.
    pub public_key: [u8; 32],
    /// Raw feature mask; zero when the directory never reported one.
    pub feature_mask: u64,
}

impl DirectoryEntry {
    /// Whether this contact's clients accept modern reactions.
    pub fn supports_reactions(&self) -> bool {
        self.feature_mask & FEATURE_MASK_REACTIONS != 0
    }
}

/// The shared contact public-key cache: a memory map backed by
/// `contacts.json`. Entries are idempotent, so concurrent send paths may
/// race on writes without harm.
pub struct ContactDirectory {
    data_dir: PathBuf,
    entries: HashMap<String, DirectoryEntry>,
    contacts: Vec<Contact>,
}

impl ContactDirectory {
    /// Load the directory from `contacts.json` under `data_dir`.
    pub fn load(data_dir: impl Into<PathBuf>) -> Result<Self, DevlinkError> {
        let data_dir = data_dir.into();
        let contacts = storage::load_contacts(&data_dir)?;
        let mut entries = HashMap::with_capacity(contacts.len());
        for contact in &contacts {
            match parse_public_key(&contact.public_key_hex) {
                Ok(public_key) => {
                    entries.insert(contact.identity.clone(), DirectoryEntry {
                        public_key,
                        feature_mask: contact.feature_mask.unwrap_or(0),
                    });
                }
                Err(e) => {
                    tracing::warn!(identity = %contact.identity, error = %e, "skipping contact with bad public key");
                }
            }
        }
        Ok(Self { data_dir, entries, contacts })
    }

    /// Look up a cached entry without touching the resolver.
    pub fn get(&self, identity: &str) -> Option<&DirectoryEntry> {
        self.entries.get(identity)
    }

    /// Resolve `identity`, consulting `lookup` on a cache miss and
    /// persisting the new entry to `contacts.json`.
    pub fn resolve(
        &mut self,
        identity: &str,
        lookup: &dyn PublicKeyLookup,
    ) -> Result<DirectoryEntry, DevlinkError> {
        parse_identity(identity)?;
        if let Some(entry) = self.entries.get(identity) {
            return Ok(*entry);
        }

        let raw = lookup.lookup(identity)?;
        let public_key = parse_public_key(&raw)?;
        let entry = DirectoryEntry { public_key, feature_mask: 0 };

        self.entries.insert(identity.to_string(), entry);
        self.contacts.push(Contact {
            identity: identity.to_string(),
            public_key_hex: hex::encode(public_key),
            ..Default::default()
        });
        storage::save_contacts(&self.data_dir, &self.contacts)?;
        tracing::debug!(identity, "resolved and cached public key");
        Ok(entry)
    }

    /// The wire-byte contact book consumed by the session event loop.
    pub fn contact_book(&self) -> HashMap<[u8; 8], [u8; 32]> {
        self.entries
            .iter()
            .filter_map(|(identity, entry)| {
                parse_identity(identity).ok().map(|id| (id, entry.public_key))
            })
            .collect()
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize { self.entries.len() }

    /// Whether the directory holds no contacts at all.
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
}
