//! HTTP blob transport: multipart upload returning a 32-char hex
//! blob id, and candidate-list download (first successful fetch wins).

use reqwest::multipart::{Form, Part};
use reqwest::Client;

/// Errors from the blob HTTP transport.
#[derive(Debug)]
pub enum BlobError {
    /// The HTTP request itself failed (connect, TLS, timeout).
    Request(String),
    /// The server returned a non-2xx status.
    Status(u16),
    /// Every candidate download URL failed.
    AllCandidatesFailed,
}

impl std::fmt::Display for BlobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Request(e) => write!(f, "blob request failed: {e}"),
            Self::Status(code) => write!(f, "blob server returned status {code}"),
            Self::AllCandidatesFailed => write!(f, "no candidate download URL succeeded"),
        }
    }
}

impl std::error::Error for BlobError {}

/// Upload ciphertext as multipart field `blob` to `url`, returning the
/// 32-character hex blob id from the response body.
pub async fn upload(client: &Client, url: &str, ciphertext: Vec<u8>) -> Result<String, BlobError> {
    let form = Form::new().part("blob", Part::bytes(ciphertext));
    let resp = client
        .post(url)
        .multipart(form)
        .send()
        .await
        .map_err(|e| BlobError::Request(e.to_string()))?;

    if !resp.status().is_success() {
        return Err(BlobError::Status(resp.status().as_u16()));
    }
    resp.text().await.map_err(|e| BlobError::Request(e.to_string()))
}

/// Fetch raw ciphertext, trying each of `candidates` in order and returning
/// the first successful response.
pub async fn download(client: &Client, candidates: &[String]) -> Result<Vec<u8>, BlobError> {
    for url in candidates {
        let Ok(resp) = client.get(url).send().await else { continue };
        if !resp.status().is_success() {
            continue;
        }
        if let Ok(bytes) = resp.bytes().await {
            return Ok(bytes.to_vec());
        }
    }
    Err(BlobError::AllCandidatesFailed)
}

/// An owned HTTP client for the blob service, so callers outside this crate
/// never have to hold an `reqwest::Client` themselves.
#[derive(Clone, Default)]
pub struct BlobClient {
    client: Client,
}

impl BlobClient {
    /// Build a client with default TLS and connection-pool settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// See [`upload`].
    pub async fn upload(&self, url: &str, ciphertext: Vec<u8>) -> Result<String, BlobError> {
        upload(&self.client, url, ciphertext).await
    }

    /// See [`download`].
    pub async fn download(&self, candidates: &[String]) -> Result<Vec<u8>, BlobError> {
        download(&self.client, candidates).await
    }
}
