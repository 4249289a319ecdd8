//! The whole linking flow against a scripted existing-device peer: the
//! rendezvous handshake through nomination, then the join-message exchange
//! ending in a persisted identity and a `Registered` ack.

use devlink_crypto as crypto;
use devlink_join::wire::{self as join_wire, JoinMessage, JoinMessageType};
use devlink_join::{Contact, DeviceGroupData, EssentialData, Group, JoinOutcome};
use devlink_proto::authentication;

const RENDEZVOUS_PERSONAL: &[u8] = b"3ma-rendezvous";
const PATH_ID: u32 = 1;

fn frame_nonce(seq: u32) -> [u8; 24] {
    let mut n = [0u8; 24];
    n[0..4].copy_from_slice(&PATH_ID.to_le_bytes());
    n[4..8].copy_from_slice(&seq.to_le_bytes());
    n
}

fn array32(v: &[u8]) -> [u8; 32] {
    v[..32].try_into().unwrap()
}

/// The existing device's side of the relay: it knows the AK from the QR
/// payload and plays the responder role of the handshake.
struct ExistingDevice {
    encrypt_key: [u8; 32],
    decrypt_key: [u8; 32],
    encrypt_seq: u32,
    decrypt_seq: u32,
    eph_secret: [u8; 32],
    challenge: [u8; 16],
    transport_keys: Option<([u8; 32], [u8; 32])>, // (rrdtk, ridtk)
}

impl ExistingDevice {
    fn new(ak: &[u8; 32]) -> Self {
        Self {
            encrypt_key: array32(&crypto::kdf(ak, b"rrda", RENDEZVOUS_PERSONAL, &[], 32)),
            decrypt_key: array32(&crypto::kdf(ak, b"rida", RENDEZVOUS_PERSONAL, &[], 32)),
            encrypt_seq: 0,
            decrypt_seq: 0,
            eph_secret: crypto::random_array::<32>(),
            challenge: crypto::random_array::<16>(),
            transport_keys: None,
        }
    }

    fn seal(&mut self, plain: &[u8]) -> Vec<u8> {
        let nonce = frame_nonce(self.encrypt_seq);
        self.encrypt_seq += 1;
        crypto::aead_seal_xsalsa(&self.encrypt_key, &nonce, plain)
    }

    fn open(&mut self, sealed: &[u8]) -> Vec<u8> {
        let nonce = frame_nonce(self.decrypt_seq);
        self.decrypt_seq += 1;
        crypto::aead_open_xsalsa(&self.decrypt_key, &nonce, sealed).unwrap()
    }

    fn hello(&mut self) -> Vec<u8> {
        let mut plain = Vec::with_capacity(48);
        plain.extend_from_slice(&self.challenge);
        plain.extend_from_slice(&crypto::x25519_public(&self.eph_secret));
        self.seal(&plain)
    }

    /// Consume the initiator's auth-hello, derive the transport keys, and
    /// produce the challenge-echo auth frame.
    fn auth(&mut self, ak: &[u8; 32], auth_hello: &[u8]) -> Vec<u8> {
        let plain = self.open(auth_hello);
        assert_eq!(&plain[0..16], &self.challenge, "initiator must echo our challenge");
        let initiator_challenge: [u8; 16] = plain[16..32].try_into().unwrap();
        let initiator_eph_public: [u8; 32] = plain[32..64].try_into().unwrap();

        let shared = crypto::precompute(&self.eph_secret, &initiator_eph_public);
        let mut stk_input = Vec::with_capacity(64);
        stk_input.extend_from_slice(ak);
        stk_input.extend_from_slice(&shared);
        let stk = crypto::kdf(&stk_input, b"st", RENDEZVOUS_PERSONAL, &[], 32);
        self.transport_keys = Some((
            array32(&crypto::kdf(&stk, b"rrdt", RENDEZVOUS_PERSONAL, &[], 32)),
            array32(&crypto::kdf(&stk, b"ridt", RENDEZVOUS_PERSONAL, &[], 32)),
        ));

        self.seal(&initiator_challenge)
    }

    /// Swap both directions to the transport keys, keeping sequences.
    fn promote(&mut self) {
        let (rrdtk, ridtk) = self.transport_keys.expect("auth derived the transport keys");
        self.encrypt_key = rrdtk;
        self.decrypt_key = ridtk;
    }
}

fn essential_data() -> EssentialData {
    EssentialData {
        identity: "NEWDEV01".into(),
        client_key_hex: "aa".repeat(32),
        server_group: "s7".into(),
        device_group_data: DeviceGroupData {
            device_group_key_hex: "bb".repeat(32),
            device_cookie_hex: "cc".repeat(16),
        },
        contacts: vec![Contact {
            identity: "FRIEND01".into(),
            public_key_hex: "dd".repeat(32),
            nickname: Some("friend".into()),
            ..Default::default()
        }],
        groups: vec![Group {
            creator_identity: "NEWDEV01".into(),
            group_id_decimal: "7".into(),
            member_identities: vec!["FRIEND01".into()],
            name: Some("us".into()),
        }],
    }
}

#[test]
fn rendezvous_then_join_persists_the_identity_and_acks() {
    let data_dir = tempfile::tempdir().unwrap();

    let initiator = authentication::start();
    let ak = *initiator.authentication_key();
    let mut peer = ExistingDevice::new(&ak);

    // Handshake to nomination.
    let (auth_hello, state) = authentication::on_hello(initiator, &peer.hello()).unwrap();
    let auth = peer.auth(&ak, &auth_hello);
    let state = authentication::on_auth(state, &auth).unwrap();
    peer.promote();
    let mut nominated = authentication::on_nominate(state, &peer.seal(b"go")).unwrap();

    // Join messages: Begin, one blob, then the essential data.
    let frames = [
        join_wire::encode_message(&JoinMessage { kind: JoinMessageType::Begin, payload: vec![] }),
        join_wire::encode_message(&JoinMessage {
            kind: JoinMessageType::BlobData,
            payload: join_wire::encode_blob_data(1, b"avatar"),
        }),
        join_wire::encode_message(&JoinMessage {
            kind: JoinMessageType::EssentialData,
            payload: serde_json::to_vec(&essential_data()).unwrap(),
        }),
    ];

    let mut session = Some(devlink_join::start());
    let mut collecting = None;
    let mut registered_ack = None;
    for frame in &frames {
        let plain = nominated.decrypt(&peer.seal(frame)).unwrap();
        let msg = join_wire::decode_message(&plain).unwrap();

        if let Some(state) = session.take() {
            collecting = Some(state.on_message(&msg).unwrap());
            continue;
        }
        match collecting.take().unwrap().on_message(&msg, data_dir.path(), "2026-08-01T00:00:00Z").unwrap() {
            JoinOutcome::Continue(next) => collecting = Some(next),
            JoinOutcome::Done { ack, state } => {
                assert_eq!(state.essential_data.identity, "NEWDEV01");
                registered_ack = Some(nominated.encrypt(&ack));
            }
        }
    }

    // The peer can decrypt the ack and sees a bare Registered message.
    let ack_plain = peer.open(&registered_ack.expect("join completed"));
    let ack = join_wire::decode_message(&ack_plain).unwrap();
    assert_eq!(ack.kind, JoinMessageType::Registered);
    assert!(ack.payload.is_empty());

    // And the identity landed on disk with the persisted field names.
    let identity_json = std::fs::read_to_string(data_dir.path().join("identity.json")).unwrap();
    assert!(identity_json.contains("\"identity\": \"NEWDEV01\""));
    assert!(identity_json.contains("\"deviceGroupKey\""));
    assert!(identity_json.contains("\"linkedAt\""));
    let contacts_json = std::fs::read_to_string(data_dir.path().join("contacts.json")).unwrap();
    assert!(contacts_json.contains("FRIEND01"));
    let groups_json = std::fs::read_to_string(data_dir.path().join("groups.json")).unwrap();
    assert!(groups_json.contains("\"groupId\": \"7\""));
}
