//! Mediator (D2M) session: the long-lived framed connection that arbitrates
//! device-group leadership, reflects envelopes among peers, and proxies
//! opaque chat-server bytes to whichever device currently holds the lease.

use std::collections::HashMap;

use devlink_crypto::{self as crypto, CryptoError};
use devlink_wire::framing::MediatorFrame;

/// Errors from the mediator session.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    Crypto(CryptoError),
    Truncated { expected: usize, got: usize },
    ClockDriftExceeded { drift_secs: i64 },
}

impl From<CryptoError> for Error {
    fn from(e: CryptoError) -> Self { Self::Crypto(e) }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Crypto(e) => write!(f, "crypto: {e}"),
            Self::Truncated { expected, got } => write!(f, "truncated frame: expected {expected}, got {got}"),
            Self::ClockDriftExceeded { drift_secs } => write!(f, "clock drift of {drift_secs}s reported by server"),
        }
    }
}
impl std::error::Error for Error {}

/// `slotExhaustPolicy` carried in `ClientHello`. Always `Reject` for this client.
pub const SLOT_EXHAUST_POLICY_REJECT: u8 = 0;
/// `slotExpirationPolicy` carried in `ClientHello`. Always `Persistent`.
pub const SLOT_EXPIRATION_POLICY_PERSISTENT: u8 = 0;
/// Expected-slot-state values.
pub const EXPECTED_SLOT_STATE_NEW: u8 = 0;
pub const EXPECTED_SLOT_STATE_EXISTING: u8 = 1;

/// Frame type tags on the mediator socket.
#[allow(missing_docs)]
pub mod frame_type {
    pub const SERVER_HELLO: u8 = 0x10;
    pub const CLIENT_HELLO: u8 = 0x11;
    pub const SERVER_INFO: u8 = 0x12;
    pub const REFLECTION_QUEUE_DRY: u8 = 0x20;
    pub const ROLE_PROMOTED_TO_LEADER: u8 = 0x21;
    pub const REFLECT: u8 = 0x22;
    pub const REFLECTED: u8 = 0x23;
    pub const REFLECT_ACK: u8 = 0x24;
    pub const REFLECTED_ACK: u8 = 0x25;
    pub const TRANSACTION_BEGIN: u8 = 0x30;
    pub const TRANSACTION_COMMIT: u8 = 0x31;
    pub const TRANSACTION_REJECT: u8 = 0x32;
    pub const TRANSACTION_END: u8 = 0x33;
    pub const PROXY: u8 = 0x00;
}

const EPHEMERAL_FLAG: u16 = 0x0001;

/// The decoded `ServerHello` payload: `esk(32) || challenge(..)`.
#[derive(Clone, Debug, PartialEq)]
pub struct ServerHello {
    /// The server's ephemeral session public key.
    pub esk: [u8; 32],
    /// The challenge to encrypt back under the precomputed shared key.
    pub challenge: Vec<u8>,
}

impl ServerHello {
    /// Decode a `ServerHello` frame payload.
    pub fn decode(payload: &[u8]) -> Result<Self, Error> {
        if payload.len() < 48 {
            return Err(Error::Truncated { expected: 48, got: payload.len() });
        }
        let mut esk = [0u8; 32];
        esk.copy_from_slice(&payload[..32]);
        Ok(Self { esk, challenge: payload[32..].to_vec() })
    }
}

/// The decoded `ServerInfo` payload: `currentUtcSecs:u64LE || ..` (trailing
/// fields are ignored).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ServerInfo {
    /// The server's wall clock, for the drift check.
    pub server_utc_secs: i64,
}

impl ServerInfo {
    /// Decode a `ServerInfo` frame payload.
    pub fn decode(payload: &[u8]) -> Result<Self, Error> {
        if payload.len() < 8 {
            return Err(Error::Truncated { expected: 8, got: payload.len() });
        }
        let secs = u64::from_le_bytes(payload[..8].try_into().unwrap());
        Ok(Self { server_utc_secs: secs as i64 })
    }
}

/// `ClientHello` sent; waiting for the server's `ServerInfo`.
#[derive(Debug)]
pub struct AwaitingServerInfo {
    dgrk: [u8; 32],
}

/// A ready mediator session: reflects envelopes and dispatches steady-state
/// frames by type.
#[derive(Debug)]
pub struct Ready {
    dgrk: [u8; 32],
    /// Reflect id → send timestamp (millis), for the caller's timeout clock.
    pending_reflects: HashMap<u32, u64>,
    next_reflect_id: u32,
    /// Whether the server has promoted this device to leader.
    pub is_leader: bool,
}

/// One steady-state event surfaced to the caller.
#[allow(missing_docs)]
#[derive(Debug, PartialEq)]
pub enum Event {
    ReflectionQueueDry,
    PromotedToLeader,
    /// A decrypted envelope plaintext ready to interpret. Dedupe and
    /// envelope decoding stay with the caller.
    Reflected { reflected_id: u32, envelope: Vec<u8>, should_ack: bool },
    ReflectAcked { reflect_id: u32 },
    UnknownReflectAck { reflect_id: u32 },
    TransactionBegin,
    TransactionCommit,
    TransactionReject,
    TransactionEnd,
    /// Opaque chat-server bytes proxied through D2M type `0x00`.
    ProxyBytes(Vec<u8>),
}

/// Build the response to a decoded [`ServerHello`]: the `ClientHello` frame
/// payload plus the state awaiting `ServerInfo`.
pub fn on_server_hello(
    dgpk_secret: &[u8; 32],
    dgdik: &[u8; 32],
    dgrk: [u8; 32],
    device_id: u64,
    is_first_connect: bool,
    hello: &ServerHello,
    device_info: &[u8],
) -> (Vec<u8>, AwaitingServerInfo) {
    let shared_key = crypto::precompute(dgpk_secret, &hello.esk);
    let nonce = crypto::random_array::<24>();
    let challenge_response = crypto::aead_seal_xsalsa(&shared_key, &nonce, &hello.challenge);
    let mut challenge_frame = Vec::with_capacity(24 + challenge_response.len());
    challenge_frame.extend_from_slice(&nonce);
    challenge_frame.extend_from_slice(&challenge_response);

    let encrypted_device_info = crypto::seal_nonce_ahead(dgdik, device_info);

    let mut client_hello = Vec::new();
    client_hello.push(1u8); // protocol version
    client_hello.extend_from_slice(&(challenge_frame.len() as u16).to_le_bytes());
    client_hello.extend_from_slice(&challenge_frame);
    client_hello.extend_from_slice(&device_id.to_le_bytes());
    client_hello.push(SLOT_EXHAUST_POLICY_REJECT);
    client_hello.push(SLOT_EXPIRATION_POLICY_PERSISTENT);
    client_hello.push(if is_first_connect { EXPECTED_SLOT_STATE_NEW } else { EXPECTED_SLOT_STATE_EXISTING });
    client_hello.extend_from_slice(&(encrypted_device_info.len() as u32).to_le_bytes());
    client_hello.extend_from_slice(&encrypted_device_info);

    tracing::debug!(device_id, is_first_connect, "mediator: sent client hello");

    (client_hello, AwaitingServerInfo { dgrk })
}

/// Consume `ServerInfo`, checking clock drift (reported but non-fatal beyond
/// twenty minutes) and transitioning to the ready state.
pub fn on_server_info(state: AwaitingServerInfo, info: ServerInfo, local_utc_secs: i64) -> (Ready, Option<Error>) {
    let drift = info.server_utc_secs - local_utc_secs;
    let drift_report = if drift.abs() > 20 * 60 {
        tracing::warn!(drift_secs = drift, "mediator: server clock drift exceeds 20 minutes");
        Some(Error::ClockDriftExceeded { drift_secs: drift })
    } else {
        None
    };
    tracing::info!("mediator: session ready");
    (
        Ready { dgrk: state.dgrk, pending_reflects: HashMap::new(), next_reflect_id: 0, is_leader: false },
        drift_report,
    )
}

impl Ready {
    /// Dispatch one received frame `(frame_type, payload)` into zero or more
    /// events plus any frames that must be sent back immediately (acks).
    pub fn on_frame(&mut self, frame_type: u8, payload: &[u8]) -> (Vec<Event>, Vec<MediatorFrame>) {
        match frame_type {
            frame_type::REFLECTION_QUEUE_DRY => (vec![Event::ReflectionQueueDry], vec![]),
            frame_type::ROLE_PROMOTED_TO_LEADER => {
                self.is_leader = true;
                tracing::info!("mediator: promoted to leader");
                (vec![Event::PromotedToLeader], vec![])
            }
            frame_type::REFLECTED => self.on_reflected(payload),
            frame_type::REFLECT_ACK => self.on_reflect_ack(payload),
            frame_type::TRANSACTION_BEGIN => (vec![Event::TransactionBegin], vec![]),
            frame_type::TRANSACTION_COMMIT => (vec![Event::TransactionCommit], vec![]),
            frame_type::TRANSACTION_REJECT => (vec![Event::TransactionReject], vec![]),
            frame_type::TRANSACTION_END => (vec![Event::TransactionEnd], vec![]),
            frame_type::PROXY => (vec![Event::ProxyBytes(payload.to_vec())], vec![]),
            other => {
                tracing::warn!(frame_type = other, "mediator: unrecognized frame type, ignoring");
                (vec![], vec![])
            }
        }
    }

    fn on_reflected(&mut self, payload: &[u8]) -> (Vec<Event>, Vec<MediatorFrame>) {
        // headerLen(1) | flags(2) | reflectedId(4) | timestamp(8) | encryptedEnvelope
        if payload.len() < 16 {
            tracing::warn!("mediator: Reflected frame shorter than header");
            return (vec![], vec![]);
        }
        let header_len = payload[0] as usize;
        if header_len < 16 || header_len > payload.len() {
            tracing::warn!(header_len, "mediator: Reflected frame with bad header length");
            return (vec![], vec![]);
        }
        let flags = u16::from_le_bytes(payload[1..3].try_into().unwrap());
        let reflected_id = u32::from_le_bytes(payload[3..7].try_into().unwrap());
        let encrypted_envelope = &payload[header_len..];
        let ephemeral = flags & EPHEMERAL_FLAG != 0;

        let envelope = match crypto::open_nonce_ahead(&self.dgrk, encrypted_envelope) {
            Ok(plain) => plain,
            Err(_) => {
                tracing::warn!(reflected_id, "mediator: failed to decrypt reflected envelope");
                if ephemeral {
                    return (vec![], vec![]);
                }
                return (vec![], vec![reflected_ack_frame(reflected_id)]);
            }
        };

        let should_ack = !ephemeral;
        let mut outgoing = Vec::new();
        if should_ack {
            outgoing.push(reflected_ack_frame(reflected_id));
        }
        (vec![Event::Reflected { reflected_id, envelope, should_ack }], outgoing)
    }

    fn on_reflect_ack(&mut self, payload: &[u8]) -> (Vec<Event>, Vec<MediatorFrame>) {
        if payload.len() < 4 {
            return (vec![], vec![]);
        }
        let reflect_id = u32::from_le_bytes(payload[..4].try_into().unwrap());
        if self.pending_reflects.remove(&reflect_id).is_some() {
            (vec![Event::ReflectAcked { reflect_id }], vec![])
        } else {
            tracing::warn!(reflect_id, "mediator: ack for unknown pending reflect");
            (vec![Event::UnknownReflectAck { reflect_id }], vec![])
        }
    }

    /// Build the `Reflect` frame for a logical send, registering the pending
    /// entry by a reflect id not currently in flight. `envelope_plain` is an
    /// already-encoded (and padded) reflection envelope.
    pub fn reflect(&mut self, envelope_plain: &[u8], created_at_millis: u64) -> (u32, MediatorFrame) {
        let reflect_id = self.allocate_reflect_id();
        self.pending_reflects.insert(reflect_id, created_at_millis);

        let encrypted_envelope = crypto::seal_nonce_ahead(&self.dgrk, envelope_plain);

        let mut payload = Vec::with_capacity(8 + encrypted_envelope.len());
        payload.push(8u8); // headerLen
        payload.push(0u8); // reserved
        payload.extend_from_slice(&0u16.to_le_bytes()); // flags
        payload.extend_from_slice(&reflect_id.to_le_bytes());
        payload.extend_from_slice(&encrypted_envelope);

        (reflect_id, MediatorFrame::new(frame_type::REFLECT, payload))
    }

    fn allocate_reflect_id(&mut self) -> u32 {
        loop {
            let id = self.next_reflect_id;
            self.next_reflect_id = self.next_reflect_id.wrapping_add(1);
            if !self.pending_reflects.contains_key(&id) {
                return id;
            }
        }
    }

    /// Forget a pending reflect whose ack timed out, so a late ack is
    /// reported as unknown rather than resolving a stale entry.
    pub fn abandon_reflect(&mut self, reflect_id: u32) {
        self.pending_reflects.remove(&reflect_id);
    }

    /// Number of reflect sends awaiting an ack (for timeout bookkeeping by
    /// the caller, which owns the clock).
    pub fn pending_reflect_count(&self) -> usize {
        self.pending_reflects.len()
    }

    /// Frame opaque chat-server bytes for the proxy channel.
    pub fn proxy_frame(payload: Vec<u8>) -> MediatorFrame {
        MediatorFrame::new(frame_type::PROXY, payload)
    }
}

fn reflected_ack_frame(reflected_id: u32) -> MediatorFrame {
    MediatorFrame::new(frame_type::REFLECTED_ACK, reflected_id.to_le_bytes().to_vec())
}
