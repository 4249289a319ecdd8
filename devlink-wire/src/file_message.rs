//! The file-message JSON object carried in `innerData` of file/group-file messages.

use serde::{Deserialize, Serialize};

/// Field names match the wire format exactly (`j, i, k, b, m, n, s, d, x, t, p, c`);
/// absent optional fields are omitted by the encoder rather than emitted as `null`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FileMessage {
    /// Rendering type.
    pub j: u32,
    /// Legacy flag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub i: Option<u32>,
    /// Blob key, hex-encoded.
    pub k: String,
    /// Blob id, hex-encoded.
    pub b: String,
    /// Media type (MIME string).
    pub m: String,
    /// File name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    /// File size in bytes.
    pub s: u64,
    /// Caption.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,
    /// Metadata object.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<serde_json::Value>,
    /// Thumbnail blob id, hex-encoded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
    /// Thumbnail media type.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p: Option<String>,
    /// Correlation id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub c: Option<String>,
}

impl FileMessage {
    pub fn to_json_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("FileMessage always serializes")
    }

    pub fn from_json_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}
