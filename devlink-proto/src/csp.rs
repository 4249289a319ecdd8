//! Chat-server protocol (CSP) session: the nested handshake run over the
//! mediator's proxy bytes (D2M type `0x00`), its per-direction nonce
//! discipline, and container framing for the steady state.

use devlink_crypto::{self as crypto, CryptoError};
use devlink_wire::framing::container_type;

/// The chat server's fixed public key, used for the CSP auth-key precompute.
pub const CHAT_SERVER_KEY: [u8; 32] = [
    0x45, 0x0b, 0x97, 0x57, 0x35, 0x27, 0x9f, 0xde, 0xcb, 0x33, 0x13, 0x64, 0x8f, 0x5f, 0xc6, 0xee,
    0x9f, 0xf4, 0x36, 0x0e, 0xa9, 0x2a, 0x8c, 0x17, 0x51, 0xc6, 0x61, 0xe4, 0xc0, 0xd8, 0xc9, 0x09,
];

const EXTENSION_MAGIC: &[u8; 30] = b"threema-clever-extension-field";
const CSP_PERSONAL: &[u8] = b"3ma-csp";

/// Errors from the CSP handshake and container layer.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    Crypto(CryptoError),
    Truncated { expected: usize, got: usize },
    CookieCollision,
    ChallengeEchoMismatch,
    UnexpectedPlaintextLen { expected: usize, got: usize },
}

impl From<CryptoError> for Error {
    fn from(e: CryptoError) -> Self { Self::Crypto(e) }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Crypto(e) => write!(f, "crypto: {e}"),
            Self::Truncated { expected, got } => write!(f, "truncated frame: expected {expected}, got {got}"),
            Self::CookieCollision => write!(f, "server cookie equals client cookie"),
            Self::ChallengeEchoMismatch => write!(f, "echoed client cookie does not match"),
            Self::UnexpectedPlaintextLen { expected, got } =>
                write!(f, "unexpected plaintext length: expected {expected}, got {got}"),
        }
    }
}
impl std::error::Error for Error {}

fn seq_nonce(cookie: &[u8; 16], seq: u64) -> [u8; 24] {
    let mut nonce = [0u8; 24];
    nonce[..16].copy_from_slice(cookie);
    nonce[16..].copy_from_slice(&seq.to_le_bytes());
    nonce
}

/// Per-direction sequence counter. Starts at 1; a decrypt failure still
/// consumes the sequence number, so callers must always advance it.
#[derive(Clone, Copy, Debug, Default)]
struct SeqCounter(u64);

impl SeqCounter {
    fn start() -> Self { Self(1) }
    fn take(&mut self) -> u64 {
        let n = self.0;
        self.0 += 1;
        n
    }
}

/// Client-side CSP identity material carried across the whole handshake.
#[derive(Debug)]
pub struct AwaitingServerHello {
    tck_secret: [u8; 32],
    tck_public: [u8; 32],
    cck: [u8; 16],
    client_identity: [u8; 8],
    client_secret: [u8; 32],
    device_id: u64,
    device_cookie: [u8; 16],
    client_info: String,
    server_static_key: [u8; 32],
}

/// Login boxes sent; waiting for the server's login acknowledgement.
#[derive(Debug)]
pub struct AwaitingLoginAck {
    cck: [u8; 16],
    sck: [u8; 16],
    transport_key: [u8; 32],
    client_seq: SeqCounter,
    server_seq: SeqCounter,
}

/// A CSP session ready to send/receive containers.
#[derive(Debug)]
pub struct Ready {
    cck: [u8; 16],
    sck: [u8; 16],
    transport_key: [u8; 32],
    client_seq: SeqCounter,
    server_seq: SeqCounter,
}

/// Begin the handshake: generate the ephemeral keypair and client cookie,
/// returning the 48-byte `ClientHello` to send verbatim (no framing, no AEAD).
pub fn start(
    client_identity: [u8; 8],
    client_secret: [u8; 32],
    device_id: u64,
    device_cookie: [u8; 16],
    client_info: String,
) -> (Vec<u8>, AwaitingServerHello) {
    start_against(client_identity, client_secret, device_id, device_cookie, client_info, CHAT_SERVER_KEY)
}

/// Like [`start`] but against an arbitrary server static key. Production
/// code should use [`start`]; this exists for tests and for staging
/// environments that run against a chat server with a different static key.
pub fn start_against(
    client_identity: [u8; 8],
    client_secret: [u8; 32],
    device_id: u64,
    device_cookie: [u8; 16],
    client_info: String,
    server_static_key: [u8; 32],
) -> (Vec<u8>, AwaitingServerHello) {
    let tck_secret = crypto::random_array::<32>();
    let tck_public = crypto::x25519_public(&tck_secret);
    let cck = crypto::random_array::<16>();

    let mut hello = Vec::with_capacity(48);
    hello.extend_from_slice(&tck_public);
    hello.extend_from_slice(&cck);

    tracing::debug!(identity = ?client_identity, "csp: sent client hello");

    (
        hello,
        AwaitingServerHello {
            tck_secret, tck_public, cck, client_identity, client_secret, device_id, device_cookie,
            client_info, server_static_key,
        },
    )
}

/// Consume the 80-byte server-hello response, returning the two login boxes
/// to send back-to-back.
pub fn on_server_hello(state: AwaitingServerHello, response: &[u8]) -> Result<(Vec<u8>, Vec<u8>, AwaitingLoginAck), Error> {
    if response.len() != 80 {
        return Err(Error::Truncated { expected: 80, got: response.len() });
    }
    let mut sck = [0u8; 16];
    sck.copy_from_slice(&response[..16]);
    if sck == state.cck {
        return Err(Error::CookieCollision);
    }

    let auth_key = crypto::precompute(&state.tck_secret, &state.server_static_key);
    let mut server_seq = SeqCounter::start();
    let nonce = seq_nonce(&sck, server_seq.take());
    let plain = crypto::aead_open_xsalsa(&auth_key, &nonce, &response[16..])?;
    if plain.len() != 48 {
        return Err(Error::UnexpectedPlaintextLen { expected: 48, got: plain.len() });
    }
    let tsk_public = array32(&plain[..32]);
    let echoed_cck = &plain[32..48];
    if echoed_cck != state.cck {
        return Err(Error::ChallengeEchoMismatch);
    }

    let transport_key = crypto::precompute(&state.tck_secret, &tsk_public);
    let mut client_seq = SeqCounter::start();

    let extensions_plain = build_extensions(state.device_id, &state.device_cookie, &state.client_info);
    let extensions_box_len = extensions_plain.len() + 16; // + Poly1305 tag

    let login_plain = build_login_data_plain(
        &state.client_identity, &sck, &state.tck_public, &state.client_secret, &tsk_public,
        &state.server_static_key, extensions_box_len,
    );
    let login_box = crypto::aead_seal_xsalsa(&transport_key, &seq_nonce(&state.cck, client_seq.take()), &login_plain);
    let extensions_box = crypto::aead_seal_xsalsa(&transport_key, &seq_nonce(&state.cck, client_seq.take()), &extensions_plain);

    tracing::debug!("csp: server hello verified, login boxes sent");

    Ok((login_box, extensions_box, AwaitingLoginAck { cck: state.cck, sck, transport_key, client_seq, server_seq }))
}

fn build_login_data_plain(
    identity: &[u8; 8],
    sck: &[u8; 16],
    tck_public: &[u8; 32],
    client_secret: &[u8; 32],
    tsk_public: &[u8; 32],
    server_static_key: &[u8; 32],
    extensions_box_len: usize,
) -> Vec<u8> {
    let ss1 = crypto::precompute(client_secret, server_static_key);
    let ss2 = crypto::precompute(client_secret, tsk_public);
    let mut ss = Vec::with_capacity(64);
    ss.extend_from_slice(&ss1);
    ss.extend_from_slice(&ss2);
    let vouch_key = crypto::kdf(&ss, b"v2", CSP_PERSONAL, &[], 32);

    let mut vouch_input = Vec::with_capacity(48);
    vouch_input.extend_from_slice(sck);
    vouch_input.extend_from_slice(tck_public);
    let vouch = crypto::kdf(&vouch_key, b"v2", CSP_PERSONAL, &vouch_input, 32);

    let mut plain = vec![0u8; 128];
    plain[0..8].copy_from_slice(identity);
    plain[8..38].copy_from_slice(EXTENSION_MAGIC);
    plain[38..40].copy_from_slice(&(extensions_box_len as u16).to_le_bytes());
    plain[40..56].copy_from_slice(sck);
    plain[80..112].copy_from_slice(&vouch);
    plain
}

/// Extension entry tags used in the second login box.
mod extension_tag {
    pub const CLIENT_INFO: u8 = 0x00;
    pub const DEVICE_ID: u8 = 0x01;
    pub const PAYLOAD_VERSION: u8 = 0x02;
    pub const DEVICE_COOKIE: u8 = 0x03;
}

fn build_extensions(device_id: u64, device_cookie: &[u8; 16], client_info: &str) -> Vec<u8> {
    let mut out = Vec::new();
    push_extension(&mut out, extension_tag::CLIENT_INFO, client_info.as_bytes());
    push_extension(&mut out, extension_tag::DEVICE_ID, &device_id.to_le_bytes());
    push_extension(&mut out, extension_tag::PAYLOAD_VERSION, &[1u8]);
    push_extension(&mut out, extension_tag::DEVICE_COOKIE, device_cookie);
    out
}

fn push_extension(out: &mut Vec<u8>, tag: u8, payload: &[u8]) {
    out.push(tag);
    out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    out.extend_from_slice(payload);
}

/// Consume the 32-byte login-ack box, returning the ready session plus the
/// first container to send (`UnblockIncomingMessages`).
pub fn on_login_ack(mut state: AwaitingLoginAck, sealed: &[u8]) -> Result<(Vec<u8>, Ready), Error> {
    let nonce = seq_nonce(&state.sck, state.server_seq.take());
    let plain = crypto::aead_open_xsalsa(&state.transport_key, &nonce, sealed)?;
    if plain.len() != 16 {
        return Err(Error::UnexpectedPlaintextLen { expected: 16, got: plain.len() });
    }

    let mut ready = Ready {
        cck: state.cck,
        sck: state.sck,
        transport_key: state.transport_key,
        client_seq: state.client_seq,
        server_seq: state.server_seq,
    };
    let unblock = ready.seal_container(container_type::UNBLOCK_INCOMING_MESSAGES, &[]);
    tracing::debug!("csp: session ready, sent unblock-incoming-messages");
    Ok((unblock, ready))
}

impl Ready {
    /// Seal one container frame: `containerType(1) || reserved(3,zero) || data`.
    pub fn seal_container(&mut self, container_type: u8, data: &[u8]) -> Vec<u8> {
        let mut plain = Vec::with_capacity(4 + data.len());
        plain.push(container_type);
        plain.extend_from_slice(&[0u8; 3]);
        plain.extend_from_slice(data);
        let nonce = seq_nonce(&self.cck, self.client_seq.take());
        crypto::aead_seal_xsalsa(&self.transport_key, &nonce, &plain)
    }

    /// Open a container frame received from the server.
    pub fn open_container(&mut self, sealed: &[u8]) -> Result<(u8, Vec<u8>), Error> {
        let nonce = seq_nonce(&self.sck, self.server_seq.take());
        let plain = crypto::aead_open_xsalsa(&self.transport_key, &nonce, sealed)?;
        if plain.len() < 4 {
            return Err(Error::Truncated { expected: 4, got: plain.len() });
        }
        Ok((plain[0], plain[4..].to_vec()))
    }

    /// Build an `OutgoingMessageAck`/`IncomingMessageAck` container body:
    /// `identity(8) || messageId:u64LE`.
    pub fn encode_message_ack(identity: &[u8; 8], message_id: u64) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        out.extend_from_slice(identity);
        out.extend_from_slice(&message_id.to_le_bytes());
        out
    }

    /// The client-sequence value the next send will consume. Starts at 1 and
    /// never regresses; a decrypt failure still advances the other direction.
    pub fn next_client_seq(&self) -> u64 { self.client_seq.0 }

    /// The server-sequence value the next receive will consume.
    pub fn next_server_seq(&self) -> u64 { self.server_seq.0 }
}

fn array32(bytes: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(bytes);
    out
}

#[cfg(test)]
fn array16(bytes: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(bytes);
    out
}
