//! Sans-IO rendezvous handshake (initiator role).
//!
//! # Flow
//!
//! ```text
//! let initiator = authentication::start();
//! // receive hello bytes from the relay
//! let (auth_hello, initiator) = authentication::on_hello(initiator, &hello)?;
//! // send auth_hello, receive auth bytes
//! let initiator = authentication::on_auth(initiator, &auth)?;
//! // receive nominate bytes
//! let nominated = authentication::on_nominate(initiator, &nominate)?;
//! // nominated.encrypt()/.decrypt() carry user payloads from here on
//! ```

use std::fmt;

use devlink_crypto::{self as crypto, CryptoError};

const RENDEZVOUS_PERSONAL: &[u8] = b"3ma-rendezvous";
const PATH_ID: u32 = 1;

// ─── Error ────────────────────────────────────────────────────────────────────

/// Errors that can occur during the rendezvous handshake.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// Decrypting a handshake frame failed.
    Crypto(CryptoError),
    /// A frame was shorter than its fixed layout requires.
    Truncated { expected: usize, got: usize },
    /// The responder echoed back the wrong challenge.
    ChallengeMismatch,
}

impl From<CryptoError> for Error {
    fn from(e: CryptoError) -> Self { Self::Crypto(e) }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Crypto(e) => write!(f, "rendezvous crypto error: {e}"),
            Self::Truncated { expected, got } =>
                write!(f, "truncated handshake frame: expected at least {expected} bytes, got {got}"),
            Self::ChallengeMismatch => write!(f, "responder echoed the wrong challenge"),
        }
    }
}
impl std::error::Error for Error {}

fn frame_nonce(seq: u32) -> [u8; 24] {
    let mut n = [0u8; 24];
    n[0..4].copy_from_slice(&PATH_ID.to_le_bytes());
    n[4..8].copy_from_slice(&seq.to_le_bytes());
    n
}

/// A symmetric cipher over one direction's sequence counter.
#[derive(Debug)]
struct DirCipher {
    key: [u8; 32],
    seq: u32,
}

impl DirCipher {
    fn new(key: [u8; 32]) -> Self { Self { key, seq: 0 } }

    fn seal(&mut self, plaintext: &[u8]) -> Vec<u8> {
        let nonce = frame_nonce(self.seq);
        self.seq += 1;
        crypto::aead_seal_xsalsa(&self.key, &nonce, plaintext)
    }

    fn open(&mut self, sealed: &[u8]) -> Result<Vec<u8>, Error> {
        let nonce = frame_nonce(self.seq);
        self.seq += 1;
        Ok(crypto::aead_open_xsalsa(&self.key, &nonce, sealed)?)
    }

    /// Swap to a new key in place, keeping the running sequence counter.
    fn rekey(&mut self, new_key: [u8; 32]) {
        self.key = new_key;
    }
}

// ─── Step state ──────────────────────────────────────────────────────────────

/// Initial state: authentication key established, waiting for the
/// responder's hello.
#[derive(Debug)]
pub struct AwaitingHello {
    ak: [u8; 32],
    path_id_hex: String,
    encrypt: DirCipher,
    decrypt: DirCipher,
    our_challenge: [u8; 16],
    our_eph_secret: [u8; 32],
    our_eph_public: [u8; 32],
}

/// Waiting for the responder to echo our challenge under the new transport keys.
#[derive(Debug)]
pub struct AwaitingAuth {
    path_id_hex: String,
    our_challenge: [u8; 16],
    encrypt: DirCipher,
    decrypt: DirCipher,
    ridtk: [u8; 32],
    rrdtk: [u8; 32],
    rph: [u8; 32],
}

/// Waiting for the nominate frame that promotes the session to the data phase.
#[derive(Debug)]
pub struct AwaitingNominate {
    path_id_hex: String,
    encrypt: DirCipher,
    decrypt: DirCipher,
    rph: [u8; 32],
}

/// The data phase: arbitrary user payloads may now be exchanged.
#[derive(Debug)]
pub struct Nominated {
    path_id_hex: String,
    encrypt: DirCipher,
    decrypt: DirCipher,
    rph: [u8; 32],
}

/// Derive `X25519(secret, peer_public)` run through the HSalsa20 transform —
/// the same construction [`devlink_crypto::precompute`] uses.
fn shared_etk(secret: &[u8; 32], peer_public: &[u8; 32]) -> [u8; 32] {
    crypto::precompute(secret, peer_public)
}

impl AwaitingHello {
    /// The relay path id, hex-encoded, used to build the rendezvous URL
    /// dialed before the responder's hello ever arrives.
    pub fn path_id_hex(&self) -> &str { &self.path_id_hex }

    /// The Authentication Key this session generated. The scanning device
    /// receives it out-of-band inside the QR join payload; it never crosses
    /// the relay itself.
    pub fn authentication_key(&self) -> &[u8; 32] { &self.ak }
}

/// Begin a rendezvous handshake as the initiator: generates the Authentication
/// Key, a random 32-byte path id, and the auth-phase key pair `(ridak, rrdak)`.
pub fn start() -> AwaitingHello {
    let ak = crypto::random_array::<32>();
    let path_id_bytes = crypto::random_array::<32>();
    let path_id_hex = hex_encode(&path_id_bytes);

    let ridak = crypto::kdf(&ak, b"rida", RENDEZVOUS_PERSONAL, &[], 32);
    let rrdak = crypto::kdf(&ak, b"rrda", RENDEZVOUS_PERSONAL, &[], 32);

    let our_eph_secret = crypto::random_array::<32>();
    let our_eph_public = crypto::x25519_public(&our_eph_secret);

    AwaitingHello {
        ak,
        path_id_hex,
        encrypt: DirCipher::new(array32(&ridak)),
        decrypt: DirCipher::new(array32(&rrdak)),
        our_challenge: crypto::random_array::<16>(),
        our_eph_secret,
        our_eph_public,
    }
}

/// Consume the responder's hello (`challenge(16) || ephemeralPublic(32)`,
/// sealed under `rrdak`), and produce the auth-hello reply to send.
pub fn on_hello(mut state: AwaitingHello, hello_frame: &[u8]) -> Result<(Vec<u8>, AwaitingAuth), Error> {
    let plain = state.decrypt.open(hello_frame)?;
    if plain.len() < 48 {
        return Err(Error::Truncated { expected: 48, got: plain.len() });
    }
    let mut peer_challenge = [0u8; 16];
    peer_challenge.copy_from_slice(&plain[0..16]);
    let mut peer_eph_public = [0u8; 32];
    peer_eph_public.copy_from_slice(&plain[16..48]);

    let shared = shared_etk(&state.our_eph_secret, &peer_eph_public);

    let mut auth_hello_plain = Vec::with_capacity(64);
    auth_hello_plain.extend_from_slice(&peer_challenge);
    auth_hello_plain.extend_from_slice(&state.our_challenge);
    auth_hello_plain.extend_from_slice(&state.our_eph_public);
    let auth_hello_frame = state.encrypt.seal(&auth_hello_plain);

    let mut stk_input = Vec::with_capacity(64);
    stk_input.extend_from_slice(&state.ak);
    stk_input.extend_from_slice(&shared);
    let stk = crypto::kdf(&stk_input, b"st", RENDEZVOUS_PERSONAL, &[], 32);
    let ridtk = crypto::kdf(&stk, b"ridt", RENDEZVOUS_PERSONAL, &[], 32);
    let rrdtk = crypto::kdf(&stk, b"rrdt", RENDEZVOUS_PERSONAL, &[], 32);
    let rph = crypto::kdf(&[], b"ph", RENDEZVOUS_PERSONAL, &stk, 32);

    Ok((
        auth_hello_frame,
        AwaitingAuth {
            path_id_hex: state.path_id_hex,
            our_challenge: state.our_challenge,
            encrypt: state.encrypt,
            decrypt: state.decrypt,
            ridtk: array32(&ridtk),
            rrdtk: array32(&rrdtk),
            rph: array32(&rph),
        },
    ))
}

/// Consume the responder's auth confirmation (still sealed under the auth
/// key `rrdak`), verify it echoes our challenge, and only then atomically
/// swap the encrypt/decrypt ciphers from auth keys to transport keys —
/// preserving each direction's running sequence counter across the swap.
pub fn on_auth(mut state: AwaitingAuth, auth_frame: &[u8]) -> Result<AwaitingNominate, Error> {
    let plain = state.decrypt.open(auth_frame)?;
    if plain.len() < 16 {
        return Err(Error::Truncated { expected: 16, got: plain.len() });
    }
    if &plain[0..16] != state.our_challenge {
        return Err(Error::ChallengeMismatch);
    }

    state.encrypt.rekey(state.ridtk);
    state.decrypt.rekey(state.rrdtk);

    Ok(AwaitingNominate {
        path_id_hex: state.path_id_hex,
        encrypt: state.encrypt,
        decrypt: state.decrypt,
        rph: state.rph,
    })
}

/// Consume the nominate frame; a successful decode promotes the session to
/// the data phase.
pub fn on_nominate(mut state: AwaitingNominate, nominate_frame: &[u8]) -> Result<Nominated, Error> {
    let _ = state.decrypt.open(nominate_frame)?;
    Ok(Nominated {
        path_id_hex: state.path_id_hex,
        encrypt: state.encrypt,
        decrypt: state.decrypt,
        rph: state.rph,
    })
}

impl Nominated {
    /// Encrypt a user-level payload for the data phase.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Vec<u8> {
        self.encrypt.seal(plaintext)
    }

    /// Decrypt a user-level payload received during the data phase.
    pub fn decrypt(&mut self, sealed: &[u8]) -> Result<Vec<u8>, Error> {
        self.decrypt.open(sealed)
    }

    /// The relay path id, hex-encoded, used to build the rendezvous URL.
    pub fn path_id_hex(&self) -> &str { &self.path_id_hex }

    /// 32-byte verification hash presented to the user as an out-of-band
    /// confirmation symbol sequence.
    pub fn verification_hash(&self) -> [u8; 32] { self.rph }
}

fn array32(v: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&v[..32]);
    out
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Mirrors the initiator's cipher lifecycle on the responder side: the
    /// same auth-key ciphers carry their sequence counters across the swap
    /// to transport keys, exactly as [`on_auth`] does for the initiator.
    struct Responder {
        encrypt: DirCipher,
        decrypt: DirCipher,
        ridtk: [u8; 32],
        rrdtk: [u8; 32],
    }

    impl Responder {
        fn new(ak: &[u8; 32]) -> Self {
            let ridak = array32(&crypto::kdf(ak, b"rida", RENDEZVOUS_PERSONAL, &[], 32));
            let rrdak = array32(&crypto::kdf(ak, b"rrda", RENDEZVOUS_PERSONAL, &[], 32));
            Self {
                encrypt: DirCipher::new(rrdak),
                decrypt: DirCipher::new(ridak),
                ridtk: [0; 32],
                rrdtk: [0; 32],
            }
        }

        fn derive_transport_keys(&mut self, ak: &[u8; 32], shared: &[u8; 32]) {
            let mut stk_input = Vec::new();
            stk_input.extend_from_slice(ak);
            stk_input.extend_from_slice(shared);
            let stk = crypto::kdf(&stk_input, b"st", RENDEZVOUS_PERSONAL, &[], 32);
            self.ridtk = array32(&crypto::kdf(&stk, b"ridt", RENDEZVOUS_PERSONAL, &[], 32));
            self.rrdtk = array32(&crypto::kdf(&stk, b"rrdt", RENDEZVOUS_PERSONAL, &[], 32));
        }

        fn swap_to_transport(&mut self) {
            self.encrypt.rekey(self.rrdtk);
            self.decrypt.rekey(self.ridtk);
        }
    }

    #[test]
    fn full_handshake_reaches_nominated() {
        let initiator = start();
        let ak = initiator.ak;
        let mut responder = Responder::new(&ak);

        let responder_challenge = crypto::random_array::<16>();
        let responder_eph_secret = crypto::random_array::<32>();
        let responder_eph_public = crypto::x25519_public(&responder_eph_secret);
        let mut hello_plain = Vec::new();
        hello_plain.extend_from_slice(&responder_challenge);
        hello_plain.extend_from_slice(&responder_eph_public);
        let hello_frame = responder.encrypt.seal(&hello_plain);

        let (auth_hello_frame, awaiting_auth) = on_hello(initiator, &hello_frame).unwrap();

        let decoded = responder.decrypt.open(&auth_hello_frame).unwrap();
        assert_eq!(&decoded[0..16], &responder_challenge);
        let initiator_challenge: [u8; 16] = decoded[16..32].try_into().unwrap();
        let initiator_eph_public: [u8; 32] = decoded[32..64].try_into().unwrap();

        let shared = shared_etk(&responder_eph_secret, &initiator_eph_public);
        responder.derive_transport_keys(&ak, &shared);

        let auth_frame = responder.encrypt.seal(&initiator_challenge);
        let awaiting_nominate = on_auth(awaiting_auth, &auth_frame).unwrap();
        responder.swap_to_transport();

        let nominate_frame = responder.encrypt.seal(b"go");
        let mut nominated = on_nominate(awaiting_nominate, &nominate_frame).unwrap();

        let user_frame = nominated.encrypt(b"hello device");
        assert_eq!(responder.decrypt.open(&user_frame).unwrap(), b"hello device");

        let reply_frame = responder.encrypt.seal(b"welcome");
        assert_eq!(nominated.decrypt(&reply_frame).unwrap(), b"welcome");
    }

    #[test]
    fn wrong_echoed_challenge_is_rejected() {
        let initiator = start();
        let ak = initiator.ak;
        let mut responder = Responder::new(&ak);

        let responder_challenge = crypto::random_array::<16>();
        let responder_eph_secret = crypto::random_array::<32>();
        let responder_eph_public = crypto::x25519_public(&responder_eph_secret);
        let mut plain = Vec::new();
        plain.extend_from_slice(&responder_challenge);
        plain.extend_from_slice(&responder_eph_public);
        let hello_frame = responder.encrypt.seal(&plain);

        let (_auth_hello, awaiting_auth) = on_hello(initiator, &hello_frame).unwrap();

        let wrong_frame = responder.encrypt.seal(&[0u8; 16]);
        assert_eq!(on_auth(awaiting_auth, &wrong_frame).unwrap_err(), Error::ChallengeMismatch);
    }
}
