//! SIP022 UDP packet cipher
//!
//! AES methods seal the packet body with the session subkey of `key || session_id`,
//! using `packet_header[4..16]` as nonce. The ChaCha method seals with
//! XChaCha20-Poly1305 keyed by the PSK itself and a random 24 bytes nonce.

use crate::crypto::{aead::AeadPrimitive, CipherKind};

use super::derive_session_key;

pub struct UdpCipher {
    cipher: AeadPrimitive,
}

impl UdpCipher {
    /// # Panics
    ///
    /// If `kind` is not a 2022 method or `key` doesn't have its key length.
    pub fn new(kind: CipherKind, key: &[u8], session_id: u64) -> UdpCipher {
        assert_eq!(key.len(), kind.key_len(), "{kind} key length mismatch");

        let cipher = match kind {
            CipherKind::AEAD2022_BLAKE3_AES_128_GCM | CipherKind::AEAD2022_BLAKE3_AES_256_GCM => {
                let mut subkey = [0u8; 32];
                let subkey = &mut subkey[..kind.key_len()];
                derive_session_key(key, &session_id.to_be_bytes(), subkey);
                AeadPrimitive::new(kind, subkey)
            }
            CipherKind::AEAD2022_BLAKE3_CHACHA20_POLY1305 => AeadPrimitive::new_xchacha20_poly1305(key),
            _ => panic!("{kind} is not a 2022 cipher"),
        };

        UdpCipher { cipher }
    }

    /// Nonce length, 12 for AES methods and 24 for the ChaCha method
    pub fn nonce_len(&self) -> usize {
        self.cipher.nonce_len()
    }

    /// Seal `pkt` in place, the last 16 bytes are reserved for the tag
    pub fn encrypt_packet(&self, nonce: &[u8], pkt: &mut [u8]) {
        self.cipher.seal(nonce, pkt);
    }

    #[must_use]
    pub fn decrypt_packet(&self, nonce: &[u8], pkt: &mut [u8]) -> bool {
        self.cipher.open(nonce, pkt)
    }
}
