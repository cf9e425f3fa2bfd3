//! Ciphers of the original protocol: stream ciphers and SIP004 AEAD ciphers

use hkdf::Hkdf;
use sha1::Sha1;

use super::{
    aead::{AeadPrimitive, AeadSequence},
    CipherCategory,
    CipherKind,
};

#[cfg(feature = "stream-cipher")]
mod stream;

pub use super::openssl_bytes_to_key;

const SUBKEY_INFO: &[u8] = b"ss-subkey";

enum CipherVariant {
    None,
    #[cfg(feature = "stream-cipher")]
    Stream(stream::StreamCipher),
    Aead(AeadSequence),
}

/// Cipher for one direction of a stream (or one UDP packet)
///
/// Stream ciphers are keyed with `key` and `iv` directly. AEAD ciphers derive
/// a subkey with `HKDF-SHA1(salt, key, "ss-subkey")` and seal records with an
/// incrementing nonce.
pub struct Cipher {
    kind: CipherKind,
    cipher: CipherVariant,
}

impl Cipher {
    /// Create a cipher with the master `key` and the per-stream `iv_or_salt`
    ///
    /// # Panics
    ///
    /// If `kind` is a 2022 method, or lengths of `key` or `iv_or_salt` don't match `kind`.
    pub fn new(kind: CipherKind, key: &[u8], iv_or_salt: &[u8]) -> Cipher {
        assert_eq!(key.len(), kind.key_len(), "{kind} key length mismatch");

        let cipher = match kind.category() {
            CipherCategory::None => CipherVariant::None,
            #[cfg(feature = "stream-cipher")]
            CipherCategory::Stream => CipherVariant::Stream(stream::StreamCipher::new(kind, key, iv_or_salt)),
            CipherCategory::Aead => {
                assert_eq!(iv_or_salt.len(), kind.salt_len(), "{kind} salt length mismatch");

                let mut subkey = [0u8; 32];
                let subkey = &mut subkey[..kind.key_len()];
                hkdf_sha1(key, iv_or_salt, subkey);

                CipherVariant::Aead(AeadSequence::new(AeadPrimitive::new(kind, subkey)))
            }
            CipherCategory::Aead2022 => panic!("{kind} is handled by v2 ciphers"),
        };

        Cipher { kind, cipher }
    }

    /// Method of this cipher
    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    /// Framing family
    pub fn category(&self) -> CipherCategory {
        self.kind.category()
    }

    /// Tag length, 0 for non-AEAD ciphers
    pub fn tag_len(&self) -> usize {
        self.kind.tag_len()
    }

    /// Encrypt `pkt` in place
    ///
    /// For AEAD ciphers the last `tag_len()` bytes of `pkt` are reserved for the tag.
    pub fn encrypt_packet(&mut self, pkt: &mut [u8]) {
        match self.cipher {
            CipherVariant::None => {}
            #[cfg(feature = "stream-cipher")]
            CipherVariant::Stream(ref mut c) => c.encrypt(pkt),
            CipherVariant::Aead(ref mut c) => c.encrypt(pkt),
        }
    }

    /// Decrypt `pkt` in place, returns `false` if authentication failed
    #[must_use]
    pub fn decrypt_packet(&mut self, pkt: &mut [u8]) -> bool {
        match self.cipher {
            CipherVariant::None => true,
            #[cfg(feature = "stream-cipher")]
            CipherVariant::Stream(ref mut c) => {
                c.decrypt(pkt);
                true
            }
            CipherVariant::Aead(ref mut c) => c.decrypt(pkt),
        }
    }
}

/// `HKDF-SHA1(salt, ikm = key, info = "ss-subkey")`, output length is `subkey.len()`
pub fn hkdf_sha1(key: &[u8], salt: &[u8], subkey: &mut [u8]) {
    let hk = Hkdf::<Sha1>::new(Some(salt), key);
    // Output is at most 32 bytes, far below 255 * 20
    if hk.expand(SUBKEY_INFO, subkey).is_err() {
        unreachable!("HKDF-SHA1 output too long");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aead_subkey_derivation() {
        let salt: Vec<u8> = (0u8..16).collect();
        let mut subkey = [0u8; 16];
        hkdf_sha1(&[0u8; 16], &salt, &mut subkey);
        assert_eq!(hex::encode(subkey), "041b65262affbcc06f05f4bfbe1632d3");
    }

    #[test]
    fn aead_cipher_pair() {
        let key = [0u8; 16];
        let salt = [9u8; 16];

        let mut enc = Cipher::new(CipherKind::AES_128_GCM, &key, &salt);
        let mut dec = Cipher::new(CipherKind::AES_128_GCM, &key, &salt);

        let mut pkt = b"pong".to_vec();
        pkt.resize(4 + enc.tag_len(), 0);
        enc.encrypt_packet(&mut pkt);
        assert_ne!(&pkt[..4], b"pong");

        assert!(dec.decrypt_packet(&mut pkt));
        assert_eq!(&pkt[..4], b"pong");
    }

    #[test]
    fn none_cipher_passes_through() {
        let mut c = Cipher::new(CipherKind::NONE, &[], &[]);
        let mut pkt = b"plain".to_vec();
        c.encrypt_packet(&mut pkt);
        assert_eq!(pkt, b"plain");
        assert!(c.decrypt_packet(&mut pkt));
    }

    #[test]
    #[should_panic(expected = "handled by v2 ciphers")]
    fn aead_2022_method_panics() {
        let kind = CipherKind::AEAD2022_BLAKE3_AES_128_GCM;
        let _ = Cipher::new(kind, &[0u8; 16], &[0u8; 16]);
    }
}
