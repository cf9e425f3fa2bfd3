//! SIP022 TCP record cipher

use crate::crypto::{
    aead::{AeadPrimitive, AeadSequence},
    CipherKind,
};

use super::derive_session_key;

/// AEAD cipher of one direction of a 2022 TCP stream
///
/// Keyed with the BLAKE3 session subkey of `key || salt`, nonces count up from 0.
pub struct TcpCipher {
    kind: CipherKind,
    cipher: AeadSequence,
}

impl TcpCipher {
    /// # Panics
    ///
    /// If `kind` is not a 2022 method or `key` doesn't have its key length.
    pub fn new(kind: CipherKind, key: &[u8], salt: &[u8]) -> TcpCipher {
        assert!(kind.is_aead_2022(), "{kind} is not a 2022 cipher");
        assert_eq!(key.len(), kind.key_len(), "{kind} key length mismatch");

        let mut subkey = [0u8; 32];
        let subkey = &mut subkey[..kind.key_len()];
        derive_session_key(key, salt, subkey);

        TcpCipher {
            kind,
            cipher: AeadSequence::new(AeadPrimitive::new(kind, subkey)),
        }
    }

    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    pub fn tag_len(&self) -> usize {
        self.kind.tag_len()
    }

    /// Seal `pkt` in place, the last `tag_len()` bytes are reserved for the tag
    pub fn encrypt_packet(&mut self, pkt: &mut [u8]) {
        self.cipher.encrypt(pkt);
    }

    #[must_use]
    pub fn decrypt_packet(&mut self, pkt: &mut [u8]) -> bool {
        self.cipher.decrypt(pkt)
    }
}
