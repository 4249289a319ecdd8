//! Device-group key schedule.
//!
//! Every key a linked device uses against the mediator is a pure function of
//! the 32-byte device-group key (DGK) transferred during the join: one keyed
//! BLAKE2b derivation per purpose, separated by salt. The schedule is derived
//! once per process and the DGK itself never leaves it.

use crate::{kdf32, x25519_public};

const MDEV_PERSONAL: &[u8] = b"3ma-mdev";

/// The full set of keys derived from the device-group key.
pub struct DeviceGroupKeys {
    /// Authentication secret toward the mediator (salt `p`).
    pub dgpk_secret: [u8; 32],
    /// X25519 public half of [`Self::dgpk_secret`]; also feeds the mediator
    /// URL derivation.
    pub dgpk_public: [u8; 32],
    /// Reflection envelope key (salt `r`).
    pub dgrk: [u8; 32],
    /// Device-info encryption key (salt `di`).
    pub dgdik: [u8; 32],
    /// Shared-device-data key (salt `sdd`).
    pub dgsddk: [u8; 32],
    /// Transaction-scope key (salt `ts`).
    pub dgtsk: [u8; 32],
}

impl DeviceGroupKeys {
    /// Derive the whole schedule from the device-group key.
    pub fn derive(dgk: &[u8; 32]) -> Self {
        let dgpk_secret = kdf32(dgk, b"p", MDEV_PERSONAL, &[]);
        Self {
            dgpk_public: x25519_public(&dgpk_secret),
            dgpk_secret,
            dgrk: kdf32(dgk, b"r", MDEV_PERSONAL, &[]),
            dgdik: kdf32(dgk, b"di", MDEV_PERSONAL, &[]),
            dgsddk: kdf32(dgk, b"sdd", MDEV_PERSONAL, &[]),
            dgtsk: kdf32(dgk, b"ts", MDEV_PERSONAL, &[]),
        }
    }
}

impl std::fmt::Debug for DeviceGroupKeys {
    // Only the public half is printable; everything else stays out of logs.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceGroupKeys")
            .field("dgpk_public", &self.dgpk_public)
            .finish_non_exhaustive()
    }
}
