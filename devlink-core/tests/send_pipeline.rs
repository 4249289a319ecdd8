//! The full outbound pipeline for one direct message: compose, arm the ack
//! waiters, feed back the mediator's reflect ack and the server's outgoing
//! ack, and watch the send complete — or time out on the right plane.

use std::sync::Arc;
use std::time::Duration;

use devlink_core::dedupe::DedupeSet;
use devlink_core::message::{self, Metadata};
use devlink_core::orchestrator::{ContactBook, Session, SessionEvent};
use devlink_core::sendflow::{await_send_complete, track_send, SendPlane};
use devlink_core::supervisor::Supervisor;
use devlink_crypto as crypto;
use devlink_proto::{csp, mediator};
use devlink_wire::framing::container_type;

const OWN_IDENTITY: [u8; 8] = *b"AAAAAAAA";
const PEER: [u8; 8] = *b"PEER0000";

fn seq_nonce(cookie: &[u8; 16], seq: u64) -> [u8; 24] {
    let mut nonce = [0u8; 24];
    nonce[..16].copy_from_slice(cookie);
    nonce[16..].copy_from_slice(&seq.to_le_bytes());
    nonce
}

/// Handshake a CSP session against a throwaway server, keeping the server's
/// sealing state so it can answer with containers of its own.
struct ServerHalf {
    sck: [u8; 16],
    transport_key: [u8; 32],
    server_seq: u64,
}

impl ServerHalf {
    fn establish(client_secret: [u8; 32]) -> (csp::Ready, Self) {
        let server_secret = crypto::random_array::<32>();
        let tsk_secret = crypto::random_array::<32>();
        let sck = crypto::random_array::<16>();

        let (hello, state) = csp::start_against(
            OWN_IDENTITY, client_secret, 7, [1u8; 16], "devlink-test/1.0".into(),
            crypto::x25519_public(&server_secret),
        );
        let tck_public: [u8; 32] = hello[..32].try_into().unwrap();

        let auth_key = crypto::precompute(&server_secret, &tck_public);
        let mut plain = Vec::with_capacity(48);
        plain.extend_from_slice(&crypto::x25519_public(&tsk_secret));
        plain.extend_from_slice(&hello[32..48]);
        let sealed = crypto::aead_seal_xsalsa(&auth_key, &seq_nonce(&sck, 1), &plain);
        let mut response = Vec::with_capacity(80);
        response.extend_from_slice(&sck);
        response.extend_from_slice(&sealed);

        let (_login, _ext, awaiting) = csp::on_server_hello(state, &response).unwrap();
        let transport_key = crypto::precompute(&tsk_secret, &tck_public);
        let ack = crypto::aead_seal_xsalsa(&transport_key, &seq_nonce(&sck, 2), &[0u8; 16]);
        let (_unblock, ready) = csp::on_login_ack(awaiting, &ack).unwrap();

        (ready, Self { sck, transport_key, server_seq: 3 })
    }

    /// Seal one server-to-client container.
    fn seal_container(&mut self, kind: u8, data: &[u8]) -> Vec<u8> {
        let mut plain = vec![kind, 0, 0, 0];
        plain.extend_from_slice(data);
        let nonce = seq_nonce(&self.sck, self.server_seq);
        self.server_seq += 1;
        crypto::aead_seal_xsalsa(&self.transport_key, &nonce, &plain)
    }
}

struct Pipeline {
    session: Session,
    server: ServerHalf,
    supervisor: Arc<Supervisor>,
    _dir: tempfile::TempDir,
}

fn pipeline(reflect_timeout: Duration, outgoing_timeout: Duration) -> Pipeline {
    let dgrk = crypto::random_array::<32>();
    let client_secret = crypto::random_array::<32>();
    let peer_secret = crypto::random_array::<32>();

    let esk_secret = crypto::random_array::<32>();
    let hello = mediator::ServerHello { esk: crypto::x25519_public(&esk_secret), challenge: vec![0u8; 16] };
    let (_client_hello, state) = mediator::on_server_hello(
        &crypto::random_array::<32>(),
        &crypto::random_array::<32>(),
        dgrk,
        1,
        true,
        &hello,
        b"{}",
    );
    let (ready, _drift) = mediator::on_server_info(state, mediator::ServerInfo { server_utc_secs: 0 }, 0);

    let dir = tempfile::tempdir().unwrap();
    let dedupe = DedupeSet::load(dir.path().join("incoming-message-dedupe.json")).unwrap();
    let supervisor = Arc::new(Supervisor::new(reflect_timeout, outgoing_timeout, Duration::from_secs(5)));

    let mut contacts = ContactBook::new();
    contacts.insert(PEER, crypto::x25519_public(&peer_secret));

    let mut session = Session::new(client_secret, OWN_IDENTITY, 1, ready, dedupe, supervisor.clone(), contacts);
    let (csp_ready, server) = ServerHalf::establish(client_secret);
    session.attach_csp(csp_ready);

    Pipeline { session, server, supervisor, _dir: dir }
}

#[tokio::test]
async fn direct_send_completes_after_both_acks_flow_back() {
    let mut p = pipeline(Duration::from_secs(1), Duration::from_secs(1));

    let metadata = Metadata::new(4321, 1_700_000_000_000, None);
    let outbound = p
        .session
        .compose_text(PEER, "pipeline hello", metadata)
        .unwrap();
    let tracking = track_send(&p.supervisor, &outbound);

    // The mediator acknowledges the reflection...
    let reflect_id = outbound.reflect_id;
    let (events, _out) = p
        .session
        .on_mediator_frame(mediator::frame_type::REFLECT_ACK, &reflect_id.to_le_bytes());
    assert_eq!(events, vec![SessionEvent::ReflectAcked { reflect_id }]);

    // ...and the chat server acknowledges the outgoing container, arriving
    // as a length-prefixed frame on the proxy channel.
    let ack_body = csp::Ready::encode_message_ack(&PEER, 4321);
    let sealed = p.server.seal_container(container_type::OUTGOING_MESSAGE_ACK, &ack_body);
    let framed = devlink_wire::framing::encode_csp_frame(&sealed);
    let (events, _out) = p.session.on_mediator_frame(mediator::frame_type::PROXY, &framed);
    assert_eq!(events, vec![SessionEvent::OutgoingAcked { receiver: "PEER0000".into(), message_id: 4321 }]);

    assert!(await_send_complete(&p.supervisor, tracking).await.is_ok());
}

#[tokio::test]
async fn unacknowledged_outgoing_container_fails_on_the_chat_server_plane() {
    let mut p = pipeline(Duration::from_secs(1), Duration::from_millis(30));

    let metadata = Metadata::new(1111, 1_000, None);
    let outbound = p.session.compose_text(PEER, "never acked", metadata).unwrap();
    let tracking = track_send(&p.supervisor, &outbound);

    // Only the reflection plane answers.
    let (_events, _out) = p
        .session
        .on_mediator_frame(mediator::frame_type::REFLECT_ACK, &outbound.reflect_id.to_le_bytes());

    let failure = await_send_complete(&p.supervisor, tracking).await.unwrap_err();
    assert_eq!(failure.plane, SendPlane::ChatServer);
    assert_eq!(failure.recipient.as_deref(), Some("PEER0000"));
}

#[tokio::test]
async fn teardown_mid_send_rejects_the_waiter_with_session_closed() {
    let mut p = pipeline(Duration::from_secs(5), Duration::from_secs(5));

    let metadata = Metadata::new(2222, 1_000, None);
    let outbound = p.session.compose_text(PEER, "interrupted", metadata).unwrap();
    let tracking = track_send(&p.supervisor, &outbound);

    p.supervisor.teardown(devlink_core::supervisor::ClosedReason::SessionClosed);
    let failure = await_send_complete(&p.supervisor, tracking).await.unwrap_err();
    assert_eq!(failure.plane, SendPlane::Reflection);
}

#[tokio::test]
async fn echo_request_round_trips_through_the_server_half() {
    let mut p = pipeline(Duration::from_secs(1), Duration::from_secs(1));

    // Server pings us; the session answers with an echo response carrying
    // the same bytes, ready-framed for the proxy channel.
    let sealed = p.server.seal_container(container_type::ECHO_REQUEST, b"ping");
    let framed = devlink_wire::framing::encode_csp_frame(&sealed);
    let (events, outgoing) = p.session.on_mediator_frame(mediator::frame_type::PROXY, &framed);
    assert!(events.is_empty());
    assert_eq!(outgoing.len(), 1);
    assert_eq!(outgoing[0].frame_type, mediator::frame_type::PROXY);

    // And we can probe the server ourselves.
    let probe = p.session.compose_echo_request(b"are you there").unwrap();
    assert_eq!(probe.frame_type, mediator::frame_type::PROXY);
}

#[test]
fn incoming_message_with_no_ack_flag_is_not_acked() {
    let mut p = pipeline(Duration::from_secs(1), Duration::from_secs(1));

    // A frame flagged no-server-ack must not produce an IncomingMessageAck,
    // even though it still surfaces (or dedupes) normally. Flags live in
    // the cleartext header, so the server half can assert on raw traffic.
    let peer_secret = crypto::random_array::<32>();
    p.session.insert_contact(*b"FLAGPEER", crypto::x25519_public(&peer_secret));

    let metadata = Metadata::new(9, 1_000, None);
    let composed = message::compose(
        &peer_secret,
        &crypto::x25519_public(&crypto::random_array::<32>()),
        *b"FLAGPEER",
        OWN_IDENTITY,
        devlink_wire::body::message_flags::NO_SERVER_ACK,
        b"\x01hi",
        &metadata,
    );
    let sealed = p.server.seal_container(container_type::INCOMING_MESSAGE, &composed.frame.encode());
    let framed = devlink_wire::framing::encode_csp_frame(&sealed);
    let (_events, outgoing) = p.session.on_mediator_frame(mediator::frame_type::PROXY, &framed);
    assert!(outgoing.is_empty(), "no-server-ack messages must not be acked");
}
