//! Group fan-out: one logical message id, one container per recipient, and
//! a reflection envelope whose nonce list matches the fan-out order exactly.

use std::sync::Arc;
use std::time::Duration;

use devlink_core::dedupe::DedupeSet;
use devlink_core::message::{self, Metadata};
use devlink_core::orchestrator::{ContactBook, Session};
use devlink_core::supervisor::Supervisor;
use devlink_crypto as crypto;
use devlink_proto::{csp, mediator};
use devlink_wire::envelope::{Conversation, Envelope, EnvelopeVariant};
use devlink_wire::framing::container_type;
use devlink_wire::message::{GroupMemberContainer, MessageWithMetadata};

const OWN_IDENTITY: [u8; 8] = *b"AAAAAAAA";
const MEMBER_ONE: [u8; 8] = *b"MEMBER01";
const MEMBER_TWO: [u8; 8] = *b"MEMBER02";

fn seq_nonce(cookie: &[u8; 16], seq: u64) -> [u8; 24] {
    let mut nonce = [0u8; 24];
    nonce[..16].copy_from_slice(cookie);
    nonce[16..].copy_from_slice(&seq.to_le_bytes());
    nonce
}

/// The server half of a scripted CSP handshake, kept around afterward to
/// decrypt the client's containers.
struct ChatServerSim {
    cck: [u8; 16],
    transport_key: [u8; 32],
    client_seq: u64,
}

impl ChatServerSim {
    /// Run the whole handshake against a fresh client, returning the ready
    /// client session and the server-side decryption state.
    fn handshake(client_identity: [u8; 8], client_secret: [u8; 32]) -> (csp::Ready, Self) {
        let server_secret = crypto::random_array::<32>();
        let server_public = crypto::x25519_public(&server_secret);
        let tsk_secret = crypto::random_array::<32>();
        let tsk_public = crypto::x25519_public(&tsk_secret);
        let sck = crypto::random_array::<16>();

        let (hello, state) = csp::start_against(
            client_identity, client_secret, 7, [1u8; 16], "devlink-test/1.0".into(), server_public,
        );
        let tck_public: [u8; 32] = hello[..32].try_into().unwrap();
        let cck: [u8; 16] = hello[32..48].try_into().unwrap();

        let auth_key = crypto::precompute(&server_secret, &tck_public);
        let mut plain = Vec::with_capacity(48);
        plain.extend_from_slice(&tsk_public);
        plain.extend_from_slice(&cck);
        let sealed = crypto::aead_seal_xsalsa(&auth_key, &seq_nonce(&sck, 1), &plain);
        let mut response = Vec::with_capacity(80);
        response.extend_from_slice(&sck);
        response.extend_from_slice(&sealed);

        let (_login_box, _ext_box, awaiting_ack) = csp::on_server_hello(state, &response).unwrap();

        let transport_key = crypto::precompute(&tsk_secret, &tck_public);
        // Server-originated boxes use the server cookie; the hello response
        // consumed server seq 1, so the login ack takes 2.
        let login_ack = crypto::aead_seal_xsalsa(&transport_key, &seq_nonce(&sck, 2), &[0u8; 16]);
        let (_unblock, ready) = csp::on_login_ack(awaiting_ack, &login_ack).unwrap();

        // The client consumed seqs 1-3 (login, extensions, unblock).
        (ready, Self { cck, transport_key, client_seq: 4 })
    }

    /// Open one client container, consuming the next client sequence.
    fn open(&mut self, sealed: &[u8]) -> (u8, Vec<u8>) {
        let nonce = seq_nonce(&self.cck, self.client_seq);
        self.client_seq += 1;
        let plain = crypto::aead_open_xsalsa(&self.transport_key, &nonce, sealed).unwrap();
        (plain[0], plain[4..].to_vec())
    }
}

struct Fixture {
    session: Session,
    server: ChatServerSim,
    dgrk: [u8; 32],
    member_secrets: [( [u8; 8], [u8; 32] ); 2],
    client_secret: [u8; 32],
    _dir: tempfile::TempDir,
}

fn fixture() -> Fixture {
    let dgrk = crypto::random_array::<32>();
    let client_secret = crypto::random_array::<32>();
    let member_one_secret = crypto::random_array::<32>();
    let member_two_secret = crypto::random_array::<32>();

    let esk_secret = crypto::random_array::<32>();
    let hello = mediator::ServerHello {
        esk: crypto::x25519_public(&esk_secret),
        challenge: vec![0u8; 16],
    };
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
    let supervisor = Arc::new(Supervisor::new(
        Duration::from_secs(15),
        Duration::from_secs(20),
        Duration::from_secs(5),
    ));

    let mut contacts = ContactBook::new();
    contacts.insert(MEMBER_ONE, crypto::x25519_public(&member_one_secret));
    contacts.insert(MEMBER_TWO, crypto::x25519_public(&member_two_secret));

    let mut session = Session::new(client_secret, OWN_IDENTITY, 1, ready, dedupe, supervisor, contacts);
    let (csp_ready, server) = ChatServerSim::handshake(OWN_IDENTITY, client_secret);
    session.attach_csp(csp_ready);

    Fixture {
        session,
        server,
        dgrk,
        member_secrets: [(MEMBER_ONE, member_one_secret), (MEMBER_TWO, member_two_secret)],
        client_secret,
        _dir: dir,
    }
}

#[test]
fn group_fan_out_shares_the_message_id_and_orders_the_nonce_list() {
    let mut fx = fixture();
    let group_id = [9u8; 8];
    let metadata = Metadata::new(4242, 1_700_000_000_000, None);

    let outbound = fx
        .session
        .compose_group_message(
            OWN_IDENTITY,
            group_id,
            &[MEMBER_ONE, MEMBER_TWO],
            message::message_type::GROUP_TEXT,
            b"hello group",
            metadata,
        )
        .unwrap();

    assert_eq!(outbound.message_id, 4242);
    assert_eq!(outbound.recipients, vec![MEMBER_ONE, MEMBER_TWO]);
    assert_eq!(outbound.frames.len(), 3);
    assert_eq!(outbound.frames[0].frame_type, mediator::frame_type::REFLECT);
    assert!(outbound.frames[1..].iter().all(|f| f.frame_type == mediator::frame_type::PROXY));

    // Recover the reflected envelope the way a peer device would.
    let reflect_payload = &outbound.frames[0].payload;
    let envelope_plain = crypto::open_nonce_ahead(&fx.dgrk, &reflect_payload[8..]).unwrap();
    let envelope = Envelope::decode(&envelope_plain).unwrap();
    let EnvelopeVariant::OutgoingMessage(reflected) = envelope.variant else {
        panic!("expected an outgoing-message envelope");
    };
    assert_eq!(reflected.conversation, Conversation::Group { creator: OWN_IDENTITY, group_id });
    assert_eq!(reflected.message_id, 4242);
    assert_eq!(reflected.body, b"hello group");
    assert_eq!(reflected.nonces.len(), 2);

    // Decrypt each fanned-out container server-side, in send order, and
    // check the per-recipient frames against the envelope's nonce list.
    for (index, frame) in outbound.frames[1..].iter().enumerate() {
        let sealed = &frame.payload[2..]; // strip the u16 length prefix
        let (container, data) = fx.server.open(sealed);
        assert_eq!(container, container_type::OUTGOING_MESSAGE);

        let message_frame = MessageWithMetadata::decode(&data).unwrap();
        assert_eq!(message_frame.message_id, 4242);
        let (identity, secret) = fx.member_secrets[index];
        assert_eq!(message_frame.receiver, identity);
        assert_eq!(
            message_frame.message_nonce, reflected.nonces[index],
            "envelope nonce order must match the fan-out order"
        );

        // The recipient can open it: the type tag leads, the group-member
        // container follows.
        let (inner, metadata) = message::open(&secret, &crypto::x25519_public(&fx.client_secret), &message_frame).unwrap();
        assert_eq!(inner[0], message::message_type::GROUP_TEXT);
        let container = GroupMemberContainer::decode(&inner[1..]).unwrap();
        assert_eq!(container.creator_identity, OWN_IDENTITY);
        assert_eq!(container.group_id, group_id);
        assert_eq!(container.inner_data, b"hello group");
        assert_eq!(metadata.message_id, 4242);
    }
}

#[test]
fn direct_send_reflects_first_then_fans_out_one_container() {
    let mut fx = fixture();
    let metadata = Metadata::new(7, 1_000, None);
    let outbound = fx
        .session
        .compose_direct_message(MEMBER_ONE, message::message_type::TEXT, 0, b"hi", metadata)
        .unwrap();

    assert_eq!(outbound.frames.len(), 2);
    assert_eq!(outbound.frames[0].frame_type, mediator::frame_type::REFLECT);
    assert_eq!(outbound.frames[1].frame_type, mediator::frame_type::PROXY);

    // The envelope's single nonce matches the container's frame nonce.
    let envelope_plain = crypto::open_nonce_ahead(&fx.dgrk, &outbound.frames[0].payload[8..]).unwrap();
    let envelope = Envelope::decode(&envelope_plain).unwrap();
    let EnvelopeVariant::OutgoingMessage(reflected) = envelope.variant else {
        panic!("expected an outgoing-message envelope");
    };

    let (container, data) = fx.server.open(&outbound.frames[1].payload[2..]);
    assert_eq!(container, container_type::OUTGOING_MESSAGE);
    let message_frame = MessageWithMetadata::decode(&data).unwrap();
    assert_eq!(reflected.nonces, vec![message_frame.message_nonce]);
}
