//! AEAD primitives shared by the SIP004 and SIP022 record framings

use aes_gcm::{
    aead::{consts::U12, generic_array::GenericArray, AeadInPlace, KeyInit},
    Aes128Gcm,
    Aes256Gcm,
    AesGcm,
};
use chacha20poly1305::{ChaCha20Poly1305, XChaCha20Poly1305};

use super::CipherKind;

type Aes192Gcm = AesGcm<aes::Aes192, U12>;

pub const AEAD_TAG_LEN: usize = 16;

/// One keyed AEAD primitive
pub enum AeadPrimitive {
    Aes128Gcm(Box<Aes128Gcm>),
    Aes192Gcm(Box<Aes192Gcm>),
    Aes256Gcm(Box<Aes256Gcm>),
    ChaCha20Poly1305(Box<ChaCha20Poly1305>),
    XChaCha20Poly1305(Box<XChaCha20Poly1305>),
}

impl AeadPrimitive {
    /// Key a primitive for `kind` with an already derived (sub)key
    ///
    /// # Panics
    ///
    /// If `kind` is not an AEAD method, or `key` doesn't have the method's key length.
    pub fn new(kind: CipherKind, key: &[u8]) -> AeadPrimitive {
        use CipherKind::*;

        match kind {
            AES_128_GCM | AEAD2022_BLAKE3_AES_128_GCM => {
                AeadPrimitive::Aes128Gcm(Box::new(Aes128Gcm::new(GenericArray::from_slice(key))))
            }
            AES_192_GCM => AeadPrimitive::Aes192Gcm(Box::new(Aes192Gcm::new(GenericArray::from_slice(key)))),
            AES_256_GCM | AEAD2022_BLAKE3_AES_256_GCM => {
                AeadPrimitive::Aes256Gcm(Box::new(Aes256Gcm::new(GenericArray::from_slice(key))))
            }
            CHACHA20_POLY1305 | AEAD2022_BLAKE3_CHACHA20_POLY1305 => {
                AeadPrimitive::ChaCha20Poly1305(Box::new(ChaCha20Poly1305::new(GenericArray::from_slice(key))))
            }
            XCHACHA20_POLY1305 => {
                AeadPrimitive::XChaCha20Poly1305(Box::new(XChaCha20Poly1305::new(GenericArray::from_slice(key))))
            }
            _ => panic!("{kind} is not an AEAD cipher"),
        }
    }

    /// XChaCha20-Poly1305 with a 24 bytes nonce, used by 2022 ChaCha UDP packets
    ///
    /// # Panics
    ///
    /// If `key` isn't 32 bytes.
    pub fn new_xchacha20_poly1305(key: &[u8]) -> AeadPrimitive {
        AeadPrimitive::XChaCha20Poly1305(Box::new(XChaCha20Poly1305::new(GenericArray::from_slice(key))))
    }

    /// Nonce length this primitive expects
    pub fn nonce_len(&self) -> usize {
        match *self {
            AeadPrimitive::XChaCha20Poly1305(..) => 24,
            _ => 12,
        }
    }

    /// Seal `pkt` in place
    ///
    /// `pkt` is `plaintext || tag space(16)`, the tag is written into the last 16 bytes.
    pub fn seal(&self, nonce: &[u8], pkt: &mut [u8]) {
        let plen = pkt.len() - AEAD_TAG_LEN;
        let (data, tag_out) = pkt.split_at_mut(plen);

        let result = match *self {
            AeadPrimitive::Aes128Gcm(ref c) => c.encrypt_in_place_detached(GenericArray::from_slice(nonce), &[], data),
            AeadPrimitive::Aes192Gcm(ref c) => c.encrypt_in_place_detached(GenericArray::from_slice(nonce), &[], data),
            AeadPrimitive::Aes256Gcm(ref c) => c.encrypt_in_place_detached(GenericArray::from_slice(nonce), &[], data),
            AeadPrimitive::ChaCha20Poly1305(ref c) => {
                c.encrypt_in_place_detached(GenericArray::from_slice(nonce), &[], data)
            }
            AeadPrimitive::XChaCha20Poly1305(ref c) => {
                c.encrypt_in_place_detached(GenericArray::from_slice(nonce), &[], data)
            }
        };

        match result {
            Ok(tag) => tag_out.copy_from_slice(&tag),
            // Only fails if plaintext exceeds the primitive's limit (GiBs), records are at most 64KiB
            Err(..) => unreachable!("AEAD seal with oversized record"),
        }
    }

    /// Open `pkt` in place, returns `false` if authentication failed
    ///
    /// `pkt` is `ciphertext || tag(16)`; on success the first `pkt.len() - 16` bytes are plaintext.
    #[must_use]
    pub fn open(&self, nonce: &[u8], pkt: &mut [u8]) -> bool {
        if pkt.len() < AEAD_TAG_LEN {
            return false;
        }

        let plen = pkt.len() - AEAD_TAG_LEN;
        let (data, tag) = pkt.split_at_mut(plen);
        let tag = GenericArray::from_slice(tag);

        let result = match *self {
            AeadPrimitive::Aes128Gcm(ref c) => {
                c.decrypt_in_place_detached(GenericArray::from_slice(nonce), &[], data, tag)
            }
            AeadPrimitive::Aes192Gcm(ref c) => {
                c.decrypt_in_place_detached(GenericArray::from_slice(nonce), &[], data, tag)
            }
            AeadPrimitive::Aes256Gcm(ref c) => {
                c.decrypt_in_place_detached(GenericArray::from_slice(nonce), &[], data, tag)
            }
            AeadPrimitive::ChaCha20Poly1305(ref c) => {
                c.decrypt_in_place_detached(GenericArray::from_slice(nonce), &[], data, tag)
            }
            AeadPrimitive::XChaCha20Poly1305(ref c) => {
                c.decrypt_in_place_detached(GenericArray::from_slice(nonce), &[], data, tag)
            }
        };

        result.is_ok()
    }
}

/// AEAD primitive with a little-endian counter nonce, starting from 0
///
/// Each `encrypt`/`decrypt` call consumes one nonce.
pub struct AeadSequence {
    primitive: AeadPrimitive,
    nonce: [u8; 24],
    nonce_len: usize,
}

impl AeadSequence {
    pub fn new(primitive: AeadPrimitive) -> AeadSequence {
        let nonce_len = primitive.nonce_len();
        AeadSequence {
            primitive,
            nonce: [0u8; 24],
            nonce_len,
        }
    }

    pub fn encrypt(&mut self, pkt: &mut [u8]) {
        self.primitive.seal(&self.nonce[..self.nonce_len], pkt);
        increase_nonce(&mut self.nonce[..self.nonce_len]);
    }

    #[must_use]
    pub fn decrypt(&mut self, pkt: &mut [u8]) -> bool {
        let ok = self.primitive.open(&self.nonce[..self.nonce_len], pkt);
        increase_nonce(&mut self.nonce[..self.nonce_len]);
        ok
    }
}

#[inline]
fn increase_nonce(nonce: &mut [u8]) {
    for i in nonce {
        *i = i.wrapping_add(1);
        if *i != 0 {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_is_little_endian_counter() {
        let mut nonce = [0u8; 12];
        increase_nonce(&mut nonce);
        assert_eq!(nonce[0], 1);

        nonce[0] = 0xFF;
        increase_nonce(&mut nonce);
        assert_eq!(&nonce[..3], &[0x00, 0x02, 0x00]);
    }

    #[test]
    fn record_nonce_matches_index() {
        let key = [7u8; 16];
        let mut seq = AeadSequence::new(AeadPrimitive::new(CipherKind::AES_128_GCM, &key));
        let reference = AeadPrimitive::new(CipherKind::AES_128_GCM, &key);

        for i in 0u64..3 {
            let mut pkt = vec![0u8; 5 + AEAD_TAG_LEN];
            pkt[..5].copy_from_slice(b"hello");
            seq.encrypt(&mut pkt);

            let mut nonce = [0u8; 12];
            nonce[..8].copy_from_slice(&i.to_le_bytes());
            assert!(reference.open(&nonce, &mut pkt));
            assert_eq!(&pkt[..5], b"hello");
        }
    }

    #[test]
    fn tampered_record_is_rejected() {
        let key = [1u8; 32];
        let mut enc = AeadSequence::new(AeadPrimitive::new(CipherKind::CHACHA20_POLY1305, &key));
        let mut dec = AeadSequence::new(AeadPrimitive::new(CipherKind::CHACHA20_POLY1305, &key));

        let mut pkt = vec![0u8; 4 + AEAD_TAG_LEN];
        pkt[..4].copy_from_slice(b"ping");
        enc.encrypt(&mut pkt);
        pkt[2] ^= 0x01;
        assert!(!dec.decrypt(&mut pkt));
    }
}
