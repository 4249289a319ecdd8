//! Blob channel (C8): per-message blob key generation, fixed-nonce file and
//! thumbnail encryption, and upload/download URL selection.
//!
//! The actual HTTP multipart transfer is not implemented here — this module
//! is transport-agnostic, matching the rest of this crate's sans-IO
//! discipline. Concrete HTTP upload/download lives in `devlink-net`; this
//! module owns the parts that must never touch a socket: key generation,
//! encryption, and URL selection.

use devlink_crypto::{aead_open_xsalsa, aead_seal_xsalsa, random_array, CryptoError};
use devlink_wire::file_message::FileMessage;

/// Fixed nonce for file-body encryption: safe only because `blobKey` is
/// freshly generated for every message.
pub const FILE_NONCE: [u8; 24] = {
    let mut n = [0u8; 24];
    n[23] = 0x01;
    n
};

/// Fixed nonce for thumbnail encryption, using the same `blobKey`.
pub const THUMBNAIL_NONCE: [u8; 24] = {
    let mut n = [0u8; 24];
    n[23] = 0x02;
    n
};

/// Where a blob lives, which determines how its URL is built.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlobScope {
    /// A single well-known public endpoint with a `persist` query parameter.
    Public,
    /// A templated mirror URL scoped to this device group.
    Local,
}

/// A freshly generated key for one outgoing blob.
///
/// Consumed by value on use: [`BlobKey::encrypt_file`] and
/// [`BlobKey::encrypt_thumbnail`] take `&self`, but the type is deliberately
/// not `Clone` so a caller cannot accidentally reuse the same key across two
/// distinct messages (the fixed nonces are only safe under per-message
/// freshness).
pub struct BlobKey([u8; 32]);

impl BlobKey {
    /// Generate a fresh 32-byte blob key.
    pub fn generate() -> Self {
        Self(random_array::<32>())
    }

    /// Reconstruct the key a sender embedded in a received file message.
    /// This is the decrypt path only; outgoing blobs always call
    /// [`Self::generate`].
    pub fn from_hex(hex_key: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(hex_key)
            .map_err(|_| CryptoError::InvalidKeyLength { expected: 32, got: 0 })?;
        let key: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength { expected: 32, got: bytes.len() })?;
        Ok(Self(key))
    }

    /// Encrypt file bytes with `(blobKey, FILE_NONCE)`.
    pub fn encrypt_file(&self, plaintext: &[u8]) -> Vec<u8> {
        aead_seal_xsalsa(&self.0, &FILE_NONCE, plaintext)
    }

    /// Decrypt file bytes previously sealed with [`Self::encrypt_file`].
    pub fn decrypt_file(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        aead_open_xsalsa(&self.0, &FILE_NONCE, ciphertext)
    }

    /// Encrypt a thumbnail with the same key, `THUMBNAIL_NONCE`.
    pub fn encrypt_thumbnail(&self, plaintext: &[u8]) -> Vec<u8> {
        aead_seal_xsalsa(&self.0, &THUMBNAIL_NONCE, plaintext)
    }

    /// Decrypt a thumbnail previously sealed with [`Self::encrypt_thumbnail`].
    pub fn decrypt_thumbnail(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        aead_open_xsalsa(&self.0, &THUMBNAIL_NONCE, ciphertext)
    }

    /// The raw key bytes, hex-encoded for embedding in the file-message body.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// The caller-facing description of one media attachment.
#[derive(Clone, Debug, Default)]
pub struct Attachment {
    /// MIME type of the full-size payload.
    pub media_type: String,
    /// Original file name, if any.
    pub file_name: Option<String>,
    /// Plaintext size in bytes.
    pub size: u64,
    /// Optional caption shown alongside the media.
    pub caption: Option<String>,
    /// Thumbnail MIME type, present only when a thumbnail was uploaded.
    pub thumbnail_media_type: Option<String>,
    /// Correlation id linking related sends (e.g. an album).
    pub correlation_id: Option<String>,
}

/// Assemble the file-message JSON payload once the blob (and optional
/// thumbnail) uploads have returned their ids. The blob key travels inside
/// the end-to-end-encrypted body; the service only ever sees ciphertext.
pub fn build_file_message(
    blob_key: &BlobKey,
    blob_id: &str,
    thumbnail_blob_id: Option<&str>,
    attachment: &Attachment,
) -> FileMessage {
    FileMessage {
        j: if attachment.thumbnail_media_type.is_some() { 1 } else { 0 },
        i: None,
        k: blob_key.to_hex(),
        b: blob_id.to_string(),
        m: attachment.media_type.clone(),
        n: attachment.file_name.clone(),
        s: attachment.size,
        d: attachment.caption.clone(),
        x: None,
        t: thumbnail_blob_id.map(str::to_string),
        p: attachment.thumbnail_media_type.clone(),
        c: attachment.correlation_id.clone(),
    }
}

/// One media payload encrypted and ready for upload: the ciphertexts to
/// POST, plus everything needed to build the file message once the blob
/// service returns its ids.
pub struct PreparedMedia {
    key: BlobKey,
    /// Ciphertext of the full-size payload, for the `blob` multipart field.
    pub file_ciphertext: Vec<u8>,
    /// Ciphertext of the thumbnail, when one was supplied.
    pub thumbnail_ciphertext: Option<Vec<u8>>,
    attachment: Attachment,
}

/// Encrypt one outgoing media payload (and optional thumbnail) under a
/// fresh blob key.
pub fn prepare_media_send(plaintext: &[u8], thumbnail: Option<&[u8]>, attachment: Attachment) -> PreparedMedia {
    let key = BlobKey::generate();
    PreparedMedia {
        file_ciphertext: key.encrypt_file(plaintext),
        thumbnail_ciphertext: thumbnail.map(|t| key.encrypt_thumbnail(t)),
        key,
        attachment,
    }
}

impl PreparedMedia {
    /// Finish the send once the uploads returned their ids. Consumes the
    /// prepared payload, and its key with it, so nothing can be encrypted
    /// under this key again.
    pub fn into_file_message(self, blob_id: &str, thumbnail_blob_id: Option<&str>) -> FileMessage {
        build_file_message(&self.key, blob_id, thumbnail_blob_id, &self.attachment)
    }
}

/// Build the upload URL for `scope`.
pub fn upload_url(
    scope: BlobScope,
    public_endpoint: &str,
    local_template: Option<&str>,
    device_id: u64,
    device_group_id: &str,
) -> Option<String> {
    match scope {
        BlobScope::Public => Some(format!("{public_endpoint}?persist=true")),
        BlobScope::Local => local_template.map(|tpl| {
            tpl.replace("{deviceGroupId}", device_group_id)
                + &format!("?deviceId={device_id}&deviceGroupId={device_group_id}")
        }),
    }
}

/// Candidate download URLs in the order they must be tried: public first,
/// then any local mirror template. The first successful fetch wins.
pub fn download_candidates(
    blob_id: &str,
    public_endpoint: &str,
    local_template: Option<&str>,
    device_group_id: &str,
) -> Vec<String> {
    let mut out = vec![format!("{public_endpoint}/{blob_id}")];
    if let Some(tpl) = local_template {
        out.push(tpl.replace("{deviceGroupId}", device_group_id) + &format!("/{blob_id}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_and_thumbnail_use_distinct_fixed_nonces() {
        assert_ne!(FILE_NONCE, THUMBNAIL_NONCE);
        assert_eq!(FILE_NONCE[23], 0x01);
        assert_eq!(THUMBNAIL_NONCE[23], 0x02);
        assert!(FILE_NONCE[..23].iter().all(|&b| b == 0));
    }

    #[test]
    fn blob_key_round_trips_file_and_thumbnail_independently() {
        let key = BlobKey::generate();
        let file_ct = key.encrypt_file(b"file bytes");
        let thumb_ct = key.encrypt_thumbnail(b"thumb bytes");
        assert_eq!(key.decrypt_file(&file_ct).unwrap(), b"file bytes");
        assert_eq!(key.decrypt_thumbnail(&thumb_ct).unwrap(), b"thumb bytes");
        // swapping nonces must not decrypt
        assert!(aead_open_xsalsa(&key.0, &THUMBNAIL_NONCE, &file_ct).is_err());
    }

    #[test]
    fn received_key_hex_round_trips_through_decryption() {
        let sender_key = BlobKey::generate();
        let ciphertext = sender_key.encrypt_file(b"media bytes");
        let receiver_key = BlobKey::from_hex(&sender_key.to_hex()).unwrap();
        assert_eq!(receiver_key.decrypt_file(&ciphertext).unwrap(), b"media bytes");
        assert!(BlobKey::from_hex("not-hex").is_err());
        assert!(BlobKey::from_hex(&"aa".repeat(16)).is_err());
    }

    #[test]
    fn two_generated_keys_never_collide() {
        let a = BlobKey::generate();
        let b = BlobKey::generate();
        assert_ne!(a.to_hex(), b.to_hex());
    }

    #[test]
    fn prepared_media_round_trips_through_the_receive_path() {
        let attachment = Attachment {
            media_type: "image/png".into(),
            file_name: Some("a.png".into()),
            size: 9,
            ..Default::default()
        };
        let prepared = prepare_media_send(b"png bytes", Some(b"thumb"), attachment);
        let file_ct = prepared.file_ciphertext.clone();
        let thumb_ct = prepared.thumbnail_ciphertext.clone().unwrap();
        let msg = prepared.into_file_message("11".repeat(16).as_str(), Some("22".repeat(16).as_str()));

        let key = BlobKey::from_hex(&msg.k).unwrap();
        assert_eq!(key.decrypt_file(&file_ct).unwrap(), b"png bytes");
        assert_eq!(key.decrypt_thumbnail(&thumb_ct).unwrap(), b"thumb");
        assert_eq!(msg.b, "11".repeat(16));
        assert_eq!(msg.t.as_deref(), Some("22".repeat(16).as_str()));
    }

    #[test]
    fn public_upload_url_carries_persist_param() {
        let url = upload_url(BlobScope::Public, "https://blob.example/upload", None, 7, "grp").unwrap();
        assert_eq!(url, "https://blob.example/upload?persist=true");
    }

    #[test]
    fn local_upload_url_interpolates_group_and_device() {
        let url = upload_url(
            BlobScope::Local,
            "https://blob.example/upload",
            Some("https://{deviceGroupId}.mirror.example/upload"),
            7,
            "grp123",
        ).unwrap();
        assert_eq!(url, "https://grp123.mirror.example/upload?deviceId=7&deviceGroupId=grp123");
    }

    #[test]
    fn local_upload_url_is_none_without_a_template() {
        assert!(upload_url(BlobScope::Local, "https://blob.example/upload", None, 1, "g").is_none());
    }

    #[test]
    fn file_message_carries_key_id_and_thumbnail_fields() {
        let key = BlobKey::generate();
        let attachment = Attachment {
            media_type: "image/jpeg".into(),
            file_name: Some("photo.jpg".into()),
            size: 2048,
            caption: Some("sunset".into()),
            thumbnail_media_type: Some("image/jpeg".into()),
            correlation_id: None,
        };
        let msg = build_file_message(&key, "aa11", Some("bb22"), &attachment);
        assert_eq!(msg.k, key.to_hex());
        assert_eq!(msg.b, "aa11");
        assert_eq!(msg.t.as_deref(), Some("bb22"));
        assert_eq!(msg.j, 1);
        assert_eq!(msg.s, 2048);
    }

    #[test]
    fn download_candidates_try_public_before_local() {
        let candidates = download_candidates(
            "deadbeef",
            "https://blob.example/dl",
            Some("https://{deviceGroupId}.mirror.example/dl"),
            "grp123",
        );
        assert_eq!(candidates, vec![
            "https://blob.example/dl/deadbeef".to_string(),
            "https://grp123.mirror.example/dl/deadbeef".to_string(),
        ]);
    }
}
