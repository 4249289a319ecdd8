//! Caller-supplied client configuration.
//!
//! This crate never reads environment variables, TOML, or config files
//! itself — configuration loading is explicitly out of scope. `ClientConfig`
//! is the *interface* to that external loader, not the loader: a caller
//! builds one (from whatever source it likes) and passes it to the
//! supervisor.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Runtime configuration for a linked-device client.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Directory holding `identity.json`, `contacts.json`, `groups.json`,
    /// the incoming-message dedupe file, and downloaded media.
    pub data_dir: PathBuf,
    /// Mediator (D2M) server host.
    pub mediator_host: String,
    /// Rendezvous/relay server host used during device-join.
    pub rendezvous_host: String,
    /// The well-known public blob endpoint.
    pub blob_public_endpoint: String,
    /// Optional override template for blob mirror URLs.
    pub blob_mirror_url_template: Option<String>,
    /// Client-info string sent in the CSP login extensions.
    pub client_info: String,
    /// How long to wait for a mediator `ReflectAck` before failing a send.
    #[serde(with = "duration_secs")]
    pub reflect_ack_timeout: Duration,
    /// How long to wait for a CSP `OutgoingMessageAck` before failing a send.
    #[serde(with = "duration_secs")]
    pub outgoing_ack_timeout: Duration,
    /// Delay before a reconnect attempt after an unexpected session close.
    #[serde(with = "duration_secs")]
    pub reconnect_backoff: Duration,
    /// Clock drift beyond which a warning is logged (never fatal).
    #[serde(with = "duration_secs")]
    pub clock_drift_warn_threshold: Duration,
    /// Minimum character growth before a partial reply chunk becomes an edit.
    pub evolving_min_chars_delta: usize,
    /// Minimum gap between partial-reply edits, in milliseconds.
    pub evolving_min_interval_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            mediator_host: String::new(),
            rendezvous_host: String::new(),
            blob_public_endpoint: String::new(),
            blob_mirror_url_template: None,
            client_info: format!("devlink/{}", env!("CARGO_PKG_VERSION")),
            reflect_ack_timeout: Duration::from_secs(15),
            outgoing_ack_timeout: Duration::from_secs(20),
            reconnect_backoff: Duration::from_secs(5),
            clock_drift_warn_threshold: Duration::from_secs(20 * 60),
            evolving_min_chars_delta: 8,
            evolving_min_interval_ms: 400,
        }
    }
}

mod duration_secs {
    use std::time::Duration;
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(d: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_literals() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.reflect_ack_timeout, Duration::from_secs(15));
        assert_eq!(cfg.outgoing_ack_timeout, Duration::from_secs(20));
        assert_eq!(cfg.reconnect_backoff, Duration::from_secs(5));
        assert_eq!(cfg.clock_drift_warn_threshold, Duration::from_secs(1200));
        assert_eq!(cfg.evolving_min_chars_delta, 8);
        assert_eq!(cfg.evolving_min_interval_ms, 400);
    }

    #[test]
    fn deserializes_partial_overrides_over_defaults() {
        let cfg: ClientConfig = serde_json::from_str(
            r#"{"data_dir": "/var/lib/devlink", "mediator_host": "mediator.example"}"#,
        )
        .unwrap();
        assert_eq!(cfg.data_dir, PathBuf::from("/var/lib/devlink"));
        assert_eq!(cfg.mediator_host, "mediator.example");
        assert_eq!(cfg.reflect_ack_timeout, Duration::from_secs(15));
    }
}
