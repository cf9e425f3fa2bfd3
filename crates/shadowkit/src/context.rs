//! Shadowsocks service context

use std::sync::Arc;

use byte_string::ByteStr;
use log::warn;

use crate::{
    config::{ReplayAttackPolicy, ServerType},
    crypto::{random_iv_or_salt, CipherKind},
    security::replay::ReplayProtector,
};

/// Service context, shared by every connection of one inbound or outbound
#[derive(Debug)]
pub struct Context {
    // Protector against replay attack
    // The actual replay detection behavior is controlled by `replay_attack_policy`
    replay_protector: ReplayProtector,
    replay_attack_policy: ReplayAttackPolicy,
}

/// `Context` for sharing between services
pub type SharedContext = Arc<Context>;

impl Context {
    /// Create a new `Context` for `Client` or `Server`
    pub fn new(config_type: ServerType) -> Context {
        Context {
            replay_protector: ReplayProtector::new(config_type),
            replay_attack_policy: ReplayAttackPolicy::default(),
        }
    }

    /// Create a new `Context` shared
    pub fn new_shared(config_type: ServerType) -> SharedContext {
        SharedContext::new(Context::new(config_type))
    }

    /// Check if nonce exist or not
    ///
    /// If not, set into the current bloom filter
    #[inline]
    pub fn check_nonce_and_set(&self, method: CipherKind, nonce: &[u8]) -> bool {
        self.replay_protector.check_nonce_and_set(method, nonce)
    }

    /// Generate a random IV / salt
    ///
    /// With `unique`, the nonce is also remembered in the replay filter, so a peer reflecting it back is detected.
    pub fn generate_nonce(&self, method: CipherKind, nonce: &mut [u8], unique: bool) {
        if nonce.is_empty() {
            return;
        }

        loop {
            random_iv_or_salt(nonce);

            if !unique || !self.check_nonce_and_set(method, nonce) {
                break;
            }
        }
    }

    /// Check a received nonce against the replay filter, following the replay attack policy
    ///
    /// Returns `true` if the nonce was seen before and the request must be rejected.
    pub fn is_nonce_replayed(&self, method: CipherKind, nonce: &[u8]) -> bool {
        match self.replay_attack_policy.effective(method) {
            ReplayAttackPolicy::Default | ReplayAttackPolicy::Ignore => false,
            ReplayAttackPolicy::Detect => {
                if self.replay_protector.check_nonce_and_set(method, nonce) {
                    warn!("detected repeated nonce (iv/salt) {:?}", ByteStr::new(nonce));
                }
                false
            }
            ReplayAttackPolicy::Reject => self.replay_protector.check_nonce_and_set(method, nonce),
        }
    }

    /// Set policy against replay attack
    pub fn set_replay_attack_policy(&mut self, replay_attack_policy: ReplayAttackPolicy) {
        self.replay_attack_policy = replay_attack_policy;
    }

    /// Get policy against replay attack
    pub fn replay_attack_policy(&self) -> ReplayAttackPolicy {
        self.replay_attack_policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_policy_rejects_second_salt() {
        let context = Context::new(ServerType::Server);
        let salt = [3u8; 16];
        assert!(!context.is_nonce_replayed(CipherKind::AEAD2022_BLAKE3_AES_128_GCM, &salt));
        assert!(context.is_nonce_replayed(CipherKind::AEAD2022_BLAKE3_AES_128_GCM, &salt));
    }

    #[test]
    fn detect_policy_accepts() {
        let mut context = Context::new(ServerType::Server);
        context.set_replay_attack_policy(ReplayAttackPolicy::Detect);
        let salt = [4u8; 16];
        assert!(!context.is_nonce_replayed(CipherKind::AEAD2022_BLAKE3_AES_128_GCM, &salt));
        assert!(!context.is_nonce_replayed(CipherKind::AEAD2022_BLAKE3_AES_128_GCM, &salt));
    }

    #[test]
    fn generated_nonce_is_remembered() {
        let context = Context::new(ServerType::Local);
        let mut salt = [0u8; 16];
        context.generate_nonce(CipherKind::AEAD2022_BLAKE3_AES_128_GCM, &mut salt, true);
        assert!(context.check_nonce_and_set(CipherKind::AEAD2022_BLAKE3_AES_128_GCM, &salt));
    }
}
