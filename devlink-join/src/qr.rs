//! The QR join payload.
//!
//! The new device renders (out of scope here) a QR code carrying a
//! `device-group/join` URI; an existing device scans it and dials the same
//! rendezvous path with the same Authentication Key. Only the URI payload
//! itself is this crate's concern: a small fixed layout, base64url-encoded
//! into the URI fragment.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64URL;

/// URI scheme and path every join payload is carried under.
pub const JOIN_URI_PREFIX: &str = "threema://device-group/join#";

/// Payload format version (`V1_0`).
pub const VERSION_V1_0: u8 = 0;
/// The only variant a linking device emits: a request to join.
pub const VARIANT_REQUEST_TO_JOIN: u8 = 1;
/// Device-to-device protocol version advertised in the payload.
pub const D2D_PROTOCOL_VERSION: u8 = 2;
/// The single relay path this client uses.
pub const PATH_ID: u32 = 1;

/// Errors decoding a join URI.
#[derive(Debug, PartialEq, Eq)]
pub enum QrError {
    /// The URI did not start with [`JOIN_URI_PREFIX`].
    BadPrefix,
    /// The fragment was not valid base64url.
    Base64,
    /// The decoded payload was shorter than its fixed layout.
    Truncated,
    /// Unknown version or variant byte.
    Unsupported {
        /// Which field was unsupported (`"version"` or `"variant"`).
        field: &'static str,
        /// The offending byte.
        value: u8,
    },
}

impl std::fmt::Display for QrError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadPrefix => write!(f, "not a device-group join URI"),
            Self::Base64 => write!(f, "join payload is not valid base64url"),
            Self::Truncated => write!(f, "join payload shorter than its fixed layout"),
            Self::Unsupported { field, value } => write!(f, "unsupported {field} byte {value:#04x}"),
        }
    }
}

impl std::error::Error for QrError {}

/// The request-to-join payload carried in the QR code.
#[derive(Clone, PartialEq, Eq)]
pub struct JoinRequest {
    /// The rendezvous Authentication Key, shared only via this payload.
    pub ak: [u8; 32],
    /// The 64-character hex rendezvous path.
    pub rendezvous_path_hex: String,
}

impl JoinRequest {
    /// Encode into the URI placed in the QR code.
    pub fn to_uri(&self) -> String {
        let mut payload = Vec::with_capacity(41 + self.rendezvous_path_hex.len());
        payload.push(VERSION_V1_0);
        payload.push(VARIANT_REQUEST_TO_JOIN);
        payload.push(D2D_PROTOCOL_VERSION);
        payload.extend_from_slice(&PATH_ID.to_le_bytes());
        payload.extend_from_slice(&self.ak);
        payload.extend_from_slice(&(self.rendezvous_path_hex.len() as u16).to_le_bytes());
        payload.extend_from_slice(self.rendezvous_path_hex.as_bytes());
        format!("{JOIN_URI_PREFIX}{}", B64URL.encode(payload))
    }

    /// Decode a scanned URI back into the payload.
    pub fn from_uri(uri: &str) -> Result<Self, QrError> {
        let fragment = uri.strip_prefix(JOIN_URI_PREFIX).ok_or(QrError::BadPrefix)?;
        let payload = B64URL.decode(fragment).map_err(|_| QrError::Base64)?;
        if payload.len() < 41 {
            return Err(QrError::Truncated);
        }
        if payload[0] != VERSION_V1_0 {
            return Err(QrError::Unsupported { field: "version", value: payload[0] });
        }
        if payload[1] != VARIANT_REQUEST_TO_JOIN {
            return Err(QrError::Unsupported { field: "variant", value: payload[1] });
        }
        // payload[2] is the advertised d2d protocol version; newer is fine.
        let mut ak = [0u8; 32];
        ak.copy_from_slice(&payload[7..39]);
        let path_len = u16::from_le_bytes(payload[39..41].try_into().unwrap()) as usize;
        if payload.len() < 41 + path_len {
            return Err(QrError::Truncated);
        }
        let rendezvous_path_hex = String::from_utf8_lossy(&payload[41..41 + path_len]).into_owned();
        Ok(Self { ak, rendezvous_path_hex })
    }
}

impl std::fmt::Debug for JoinRequest {
    // The AK is a secret; only the path appears in debug output.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinRequest")
            .field("rendezvous_path_hex", &self.rendezvous_path_hex)
            .finish_non_exhaustive()
    }
}
