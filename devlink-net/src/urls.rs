//! URL construction for the mediator and rendezvous WebSocket endpoints.
//!
//! Both servers shard by a hex prefix: the first four hex characters pick
//! the host, the first eight pick the path root, and the full hex string
//! identifies the session. The mediator derives its prefix from the public
//! device-group authentication key; the rendezvous uses its random path id.

/// `wss://mediator-<prefix4>.<host>/<prefix8>/<hexClientUrlInfo>` where the
/// prefixes come from the hex encoding of the public device-group key.
pub fn mediator_url(host: &str, dgpk_public: &[u8; 32]) -> String {
    let client_url_info = hex::encode(dgpk_public);
    format!(
        "wss://mediator-{}.{host}/{}/{client_url_info}",
        &client_url_info[..4],
        &client_url_info[..8],
    )
}

/// `wss://rendezvous-<prefix4>.<host>/<prefix8>/<path>` for a 64-character
/// hex rendezvous path.
pub fn rendezvous_url(host: &str, path_id_hex: &str) -> String {
    format!(
        "wss://rendezvous-{}.{host}/{}/{path_id_hex}",
        &path_id_hex[..4],
        &path_id_hex[..8],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mediator_url_shards_by_the_public_key_prefix() {
        let mut dgpk = [0u8; 32];
        dgpk[0] = 0xAB;
        dgpk[1] = 0xCD;
        let url = mediator_url("mediator.example", &dgpk);
        assert!(url.starts_with("wss://mediator-abcd.mediator.example/abcd0000/"));
        assert!(url.ends_with(&hex::encode(dgpk)));
    }

    #[test]
    fn rendezvous_url_shards_by_the_path_prefix() {
        let path = "deadbeef".to_string() + &"00".repeat(28);
        let url = rendezvous_url("relay.example", &path);
        assert_eq!(url, format!("wss://rendezvous-dead.relay.example/deadbeef/{path}"));
    }
}
