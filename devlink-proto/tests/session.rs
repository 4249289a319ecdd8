//! CSP handshake end-to-end against a scripted in-memory chat-server peer.

use std::collections::HashSet;

use devlink_crypto as crypto;
use devlink_proto::csp;
use devlink_wire::framing::container_type;

fn array32(bytes: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(bytes);
    out
}

fn array16(bytes: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(bytes);
    out
}

fn seq_nonce(cookie: &[u8; 16], seq: u64) -> [u8; 24] {
    let mut nonce = [0u8; 24];
    nonce[..16].copy_from_slice(cookie);
    nonce[16..].copy_from_slice(&seq.to_le_bytes());
    nonce
}

/// Plays the server side of the CSP handshake against a static keypair we
/// own, since no test can invert the real `CHAT_SERVER_KEY`.
struct ScriptedServer {
    secret: [u8; 32],
    public: [u8; 32],
    tsk_secret: [u8; 32],
    tsk_public: [u8; 32],
    sck: [u8; 16],
    transport_key: Option<[u8; 32]>,
    /// The next sequence this server consumes for its own sends.
    server_seq: u64,
}

impl ScriptedServer {
    fn new() -> Self {
        let secret = crypto::random_array::<32>();
        let public = crypto::x25519_public(&secret);
        let tsk_secret = crypto::random_array::<32>();
        let tsk_public = crypto::x25519_public(&tsk_secret);
        Self {
            secret, public, tsk_secret, tsk_public,
            sck: crypto::random_array::<16>(),
            transport_key: None,
            server_seq: 1,
        }
    }

    fn hello_response(&mut self, tck_public: &[u8; 32], cck: &[u8; 16]) -> Vec<u8> {
        let auth_key = crypto::precompute(&self.secret, tck_public);
        let mut plain = Vec::with_capacity(48);
        plain.extend_from_slice(&self.tsk_public);
        plain.extend_from_slice(cck);
        let nonce = seq_nonce(&self.sck, self.server_seq);
        self.server_seq += 1;
        let sealed = crypto::aead_seal_xsalsa(&auth_key, &nonce, &plain);

        self.transport_key = Some(crypto::precompute(&self.tsk_secret, tck_public));

        let mut out = Vec::with_capacity(80);
        out.extend_from_slice(&self.sck);
        out.extend_from_slice(&sealed);
        out
    }

    fn login_ack(&mut self) -> Vec<u8> {
        let key = self.transport_key.expect("transport key derived during hello_response");
        let mut plain = vec![0u8; 16];
        plain[12..16].copy_from_slice(&7u32.to_le_bytes()); // queuedMessages
        let nonce = seq_nonce(&self.sck, self.server_seq);
        self.server_seq += 1;
        crypto::aead_seal_xsalsa(&key, &nonce, &plain)
    }

    fn open_client_box(&self, cck: &[u8; 16], seq: u64, sealed: &[u8]) -> Vec<u8> {
        let key = self.transport_key.expect("transport key derived");
        crypto::aead_open_xsalsa(&key, &seq_nonce(cck, seq), sealed).unwrap()
    }
}

#[test]
fn handshake_ends_with_both_sequences_at_three_and_one_unblock_frame() {
    let mut server = ScriptedServer::new();
    let client_secret = crypto::random_array::<32>();

    let (hello, state) = csp::start_against(
        *b"CLIENT01", client_secret, 99, [3u8; 16], "devlink-test/1.0".into(), server.public,
    );
    assert_eq!(hello.len(), 48);
    let tck_public = array32(&hello[..32]);
    let cck = array16(&hello[32..48]);

    let response = server.hello_response(&tck_public, &cck);
    let (login_box, ext_box, awaiting_ack) = csp::on_server_hello(state, &response).unwrap();

    // The login boxes consumed client seqs 1 and 2, in that order.
    let login_plain = server.open_client_box(&cck, 1, &login_box);
    assert_eq!(login_plain.len(), 128);
    assert_eq!(&login_plain[0..8], b"CLIENT01");
    assert_eq!(&login_plain[8..38], b"threema-clever-extension-field");
    assert_eq!(&login_plain[40..56], &server.sck);
    let ext_plain = server.open_client_box(&cck, 2, &ext_box);
    assert!(!ext_plain.is_empty());

    let ack = server.login_ack();
    let (unblock, ready) = csp::on_login_ack(awaiting_ack, &ack).unwrap();

    // Entering Ready, both directions had consumed two boxes each. The
    // server's next sequence is still 3; the client immediately spent its
    // seq 3 on the unblock container, so it sits at 4.
    assert_eq!(ready.next_server_seq(), 3);
    assert_eq!(ready.next_client_seq(), 4);
    let unblock_plain = server.open_client_box(&cck, 3, &unblock);
    assert_eq!(unblock_plain[0], container_type::UNBLOCK_INCOMING_MESSAGES);
    assert_eq!(&unblock_plain[1..4], &[0, 0, 0]);
    assert_eq!(unblock_plain.len(), 4, "unblock carries no data");
}

#[test]
fn every_container_send_consumes_a_unique_nonce() {
    let mut server = ScriptedServer::new();
    let client_secret = crypto::random_array::<32>();

    let (hello, state) = csp::start_against(
        *b"CLIENT01", client_secret, 1, [0u8; 16], "t".into(), server.public,
    );
    let tck_public = array32(&hello[..32]);
    let cck = array16(&hello[32..48]);
    let response = server.hello_response(&tck_public, &cck);
    let (_login_box, _ext_box, awaiting_ack) = csp::on_server_hello(state, &response).unwrap();
    let ack = server.login_ack();
    let (_unblock, mut ready) = csp::on_login_ack(awaiting_ack, &ack).unwrap();

    // Seqs 1-3 went to login, extensions, and unblock; every further send
    // must take a fresh, strictly-increasing sequence (and therefore a
    // fresh nonce, since the cookie half is fixed for the session).
    let mut seen = HashSet::from([1u64, 2, 3]);
    for i in 0..100u64 {
        let seq = ready.next_client_seq();
        let sealed = ready.seal_container(container_type::OUTGOING_MESSAGE, &i.to_le_bytes());
        assert!(seen.insert(seq), "sequence {seq} was reused");
        assert_eq!(ready.next_client_seq(), seq + 1);
        // The box really was sealed under that sequence's nonce.
        let plain = server.open_client_box(&cck, seq, &sealed);
        assert_eq!(plain[0], container_type::OUTGOING_MESSAGE);
    }
}

#[test]
fn mismatched_server_cookie_echo_is_rejected() {
    let mut server = ScriptedServer::new();
    let client_secret = crypto::random_array::<32>();
    let (hello, state) = csp::start_against(
        *b"CLIENT01", client_secret, 1, [0u8; 16], "t".into(), server.public,
    );
    let tck_public = array32(&hello[..32]);
    let wrong_cck = [0xAAu8; 16];
    let response = server.hello_response(&tck_public, &wrong_cck);
    let err = csp::on_server_hello(state, &response).unwrap_err();
    assert_eq!(err, csp::Error::ChallengeEchoMismatch);
}
