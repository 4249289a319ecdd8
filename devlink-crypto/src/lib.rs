//! Cryptographic primitives for the device-linking protocol.
//!
//! Provides:
//! - X25519 scalar multiplication and the NaCl-box precomputed shared key
//!   (HSalsa20 key extraction over the raw DH point)
//! - XSalsa20-Poly1305 AEAD (rendezvous transport, reflection envelopes, CSP login boxes)
//! - ChaCha20-Poly1305 AEAD, for callers that need a second AEAD family
//! - Keyed BLAKE2b with 16-byte salt/personalization — the device-group key schedule
//! - A CSPRNG wrapper

#![deny(unsafe_code)]

pub mod schedule;

pub use schedule::DeviceGroupKeys;

use blake2::Blake2bMac;
use blake2::digest::{Mac, consts::U32};
use chacha20poly1305::{
    ChaCha20Poly1305, Key as ChaChaKey, Nonce as ChaChaNonce,
    aead::{Aead, KeyInit, Payload},
};
use salsa20::hsalsa;
use x25519_dalek::{PublicKey, StaticSecret};
use xsalsa20poly1305::{
    XSalsa20Poly1305, Key as XSalsaKey, Nonce as XSalsaNonce,
    aead::{Aead as XAead, KeyInit as XKeyInit},
};

/// Errors produced by the primitives in this crate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CryptoError {
    /// A key was not exactly the expected length.
    InvalidKeyLength { expected: usize, got: usize },
    /// A nonce was not exactly the expected length.
    InvalidNonceLength { expected: usize, got: usize },
    /// AEAD tag verification failed. Fatal to the current frame, never to the
    /// session unless the caller says otherwise.
    AuthenticationFailed,
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidKeyLength { expected, got } =>
                write!(f, "invalid key length: expected {expected}, got {got}"),
            Self::InvalidNonceLength { expected, got } =>
                write!(f, "invalid nonce length: expected {expected}, got {got}"),
            Self::AuthenticationFailed => write!(f, "AEAD authentication failed"),
        }
    }
}
impl std::error::Error for CryptoError {}

/// Fill `out` with cryptographically secure random bytes.
pub fn random_bytes(out: &mut [u8]) {
    getrandom::getrandom(out).expect("getrandom failed");
}

/// Generate `N` random bytes.
pub fn random_array<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    random_bytes(&mut buf);
    buf
}

// ─── X25519 + HSalsa20 precompute (NaCl box key) ───────────────────────────────

/// The X25519 public key corresponding to `secret`.
pub fn x25519_public(secret: &[u8; 32]) -> [u8; 32] {
    *PublicKey::from(&StaticSecret::from(*secret)).as_bytes()
}

/// Scalar-multiply `secret` by `peer_public`, then run the result through
/// HSalsa20 keyed by the raw DH point with an all-zero 16-byte input and the
/// standard `expand 32-byte k` constants — the same construction
/// `crypto_box_beforenm` uses to turn a Diffie-Hellman point into a
/// uniformly-random symmetric key.
pub fn precompute(secret: &[u8; 32], peer_public: &[u8; 32]) -> [u8; 32] {
    let secret = StaticSecret::from(*secret);
    let public = PublicKey::from(*peer_public);
    let shared = secret.diffie_hellman(&public);
    hsalsa_extract(shared.as_bytes(), &[0u8; 16])
}

fn hsalsa_extract(key: &[u8; 32], input16: &[u8; 16]) -> [u8; 32] {
    let out = hsalsa::<salsa20::cipher::consts::U10>(key.into(), input16.into());
    out.into()
}

// ─── AEAD: XSalsa20-Poly1305 (24-byte nonce) ───────────────────────────────────

/// Seal `plaintext` under `key`/`nonce`, returning `ciphertext || tag`.
pub fn aead_seal_xsalsa(key: &[u8; 32], nonce: &[u8; 24], plaintext: &[u8]) -> Vec<u8> {
    let cipher = XSalsa20Poly1305::new(XSalsaKey::from_slice(key));
    cipher
        .encrypt(XSalsaNonce::from_slice(nonce), plaintext)
        .expect("xsalsa20poly1305 seal never fails")
}

/// Open a `ciphertext || tag` buffer produced by [`aead_seal_xsalsa`].
pub fn aead_open_xsalsa(key: &[u8; 32], nonce: &[u8; 24], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XSalsa20Poly1305::new(XSalsaKey::from_slice(key));
    cipher
        .decrypt(XSalsaNonce::from_slice(nonce), sealed)
        .map_err(|_| CryptoError::AuthenticationFailed)
}

// ─── AEAD: ChaCha20-Poly1305 (12-byte nonce) ───────────────────────────────────

/// Seal `plaintext` under `key`/`nonce`, returning `ciphertext || tag`.
pub fn aead_seal_chacha(key: &[u8; 32], nonce: &[u8; 12], plaintext: &[u8]) -> Vec<u8> {
    let cipher = ChaCha20Poly1305::new(ChaChaKey::from_slice(key));
    cipher
        .encrypt(ChaChaNonce::from_slice(nonce), Payload::from(plaintext))
        .expect("chacha20poly1305 seal never fails")
}

/// Open a `ciphertext || tag` buffer produced by [`aead_seal_chacha`].
pub fn aead_open_chacha(key: &[u8; 32], nonce: &[u8; 12], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(ChaChaKey::from_slice(key));
    cipher
        .decrypt(ChaChaNonce::from_slice(nonce), Payload::from(sealed))
        .map_err(|_| CryptoError::AuthenticationFailed)
}

// ─── Nonce-ahead framing helper ─────────────────────────────────────────────────

/// Seal with XSalsa20-Poly1305 under a fresh random nonce, returning
/// `nonce(24) || ciphertext || tag` — the "nonce-ahead" wire format used
/// throughout the mediator and CSP planes.
pub fn seal_nonce_ahead(key: &[u8; 32], plaintext: &[u8]) -> Vec<u8> {
    let nonce = random_array::<24>();
    let sealed = aead_seal_xsalsa(key, &nonce, plaintext);
    let mut out = Vec::with_capacity(24 + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    out
}

/// Inverse of [`seal_nonce_ahead`].
pub fn open_nonce_ahead(key: &[u8; 32], framed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if framed.len() < 24 {
        return Err(CryptoError::InvalidNonceLength { expected: 24, got: framed.len() });
    }
    let mut nonce = [0u8; 24];
    nonce.copy_from_slice(&framed[..24]);
    aead_open_xsalsa(key, &nonce, &framed[24..])
}

// ─── KDF: keyed BLAKE2b with salt + personalization ────────────────────────────

/// BLAKE2b keyed by `key`, with `salt`/`personal` carried in the BLAKE2b
/// parameter block (zero-padded there to 16 bytes each), hashing `input` and
/// producing `out_len` bytes (max 32). This is the sole derivation primitive
/// of every key schedule in the protocol.
pub fn kdf(key: &[u8], salt: &[u8], personal: &[u8], input: &[u8], out_len: usize) -> Vec<u8> {
    assert!(out_len <= 32, "this derivation schedule never needs more than 32 bytes");
    kdf32(key, salt, personal, input)[..out_len].to_vec()
}

/// [`kdf`] specialized to the 32-byte output every derivation here uses.
pub fn kdf32(key: &[u8], salt: &[u8], personal: &[u8], input: &[u8]) -> [u8; 32] {
    let mut mac = Blake2bMac::<U32>::new_with_salt_and_personal(key, salt, personal)
        .expect("key <= 64 bytes, salt and personalization <= 16 bytes");
    mac.update(input);
    mac.finalize().into_bytes().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precompute_is_symmetric() {
        let a = random_array::<32>();
        let b = random_array::<32>();
        let k1 = precompute(&a, &x25519_public(&b));
        let k2 = precompute(&b, &x25519_public(&a));
        assert_eq!(k1, k2);
    }

    #[test]
    fn xsalsa_round_trip() {
        let key = random_array::<32>();
        let nonce = random_array::<24>();
        let sealed = aead_seal_xsalsa(&key, &nonce, b"hello device group");
        let opened = aead_open_xsalsa(&key, &nonce, &sealed).unwrap();
        assert_eq!(opened, b"hello device group");
    }

    #[test]
    fn xsalsa_tamper_detected() {
        let key = random_array::<32>();
        let nonce = random_array::<24>();
        let mut sealed = aead_seal_xsalsa(&key, &nonce, b"payload");
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert_eq!(aead_open_xsalsa(&key, &nonce, &sealed), Err(CryptoError::AuthenticationFailed));
    }

    #[test]
    fn chacha_round_trip() {
        let key = random_array::<32>();
        let nonce = random_array::<12>();
        let sealed = aead_seal_chacha(&key, &nonce, b"csp bytes");
        assert_eq!(aead_open_chacha(&key, &nonce, &sealed).unwrap(), b"csp bytes");
    }

    #[test]
    fn nonce_ahead_round_trip() {
        let key = random_array::<32>();
        let framed = seal_nonce_ahead(&key, b"envelope");
        assert_eq!(open_nonce_ahead(&key, &framed).unwrap(), b"envelope");
    }

    #[test]
    fn kdf_is_deterministic_and_salt_separated() {
        let dgk = random_array::<32>();
        let a = kdf(&dgk, b"p", b"3ma-mdev", &[], 32);
        let b = kdf(&dgk, b"p", b"3ma-mdev", &[], 32);
        let c = kdf(&dgk, b"r", b"3ma-mdev", &[], 32);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn kdf_personalization_separates_domains() {
        let key = random_array::<32>();
        let a = kdf32(&key, b"v2", b"3ma-csp", &[]);
        let b = kdf32(&key, b"v2", b"3ma-rendezvous", &[]);
        assert_ne!(a, b);
    }

    #[test]
    fn kdf_accepts_an_empty_key() {
        let input = random_array::<32>();
        let a = kdf32(&[], b"ph", b"3ma-rendezvous", &input);
        let b = kdf32(&[], b"ph", b"3ma-rendezvous", &input);
        assert_eq!(a, b);
    }
}
