//! Salt (nonce) replay protection

use std::{fmt, time::Duration};

use cfg_if::cfg_if;
use lru_time_cache::LruCache;

use crate::{
    config::ServerType,
    crypto::{v2::TIMESTAMP_TOLERANCE, CipherKind},
};

#[cfg(feature = "security-replay-attack-detect")]
use self::ppbloom::PingPongBloom;

#[cfg(feature = "security-replay-attack-detect")]
mod ppbloom;

/// Remembers salts of accepted handshakes
///
/// AEAD (and stream) salts go into a ping-pong Bloom filter, which keeps every entry for at least 60 seconds.
/// AEAD 2022 handshakes carry a timestamp which already rejects anything older than 30 seconds, so their salts
/// are kept in an exact set that expires entries after twice that window.
pub struct ReplayProtector {
    #[cfg(feature = "security-replay-attack-detect")]
    nonce_ppbloom: spin::Mutex<PingPongBloom>,

    nonce_set: spin::Mutex<LruCache<Vec<u8>, ()>>,
}

impl fmt::Debug for ReplayProtector {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ReplayProtector").finish()
    }
}

impl ReplayProtector {
    /// Create a new ReplayProtector, sized for `config_type`
    #[allow(unused_variables)]
    pub fn new(config_type: ServerType) -> ReplayProtector {
        ReplayProtector {
            #[cfg(feature = "security-replay-attack-detect")]
            nonce_ppbloom: spin::Mutex::new(PingPongBloom::new(config_type)),
            nonce_set: spin::Mutex::new(LruCache::with_expiry_duration(Duration::from_secs(
                TIMESTAMP_TOLERANCE * 2,
            ))),
        }
    }

    /// Remember `nonce`, returns `true` if it has been seen before
    ///
    /// Empty nonces (the `none` method) are never duplicated.
    pub fn check_nonce_and_set(&self, method: CipherKind, nonce: &[u8]) -> bool {
        if nonce.is_empty() {
            return false;
        }

        if method.is_aead_2022() {
            let mut set = self.nonce_set.lock();
            if set.get(nonce).is_some() {
                return true;
            }
            set.insert(nonce.to_vec(), ());
            return false;
        }

        cfg_if! {
            if #[cfg(feature = "security-replay-attack-detect")] {
                self.nonce_ppbloom.lock().check_and_set(nonce)
            } else {
                false
            }
        }
    }

    /// Returns `true` the first time `salt` is seen in the window, `false` for a duplicate
    #[inline]
    pub fn check(&self, method: CipherKind, salt: &[u8]) -> bool {
        !self.check_nonce_and_set(method, salt)
    }
}
