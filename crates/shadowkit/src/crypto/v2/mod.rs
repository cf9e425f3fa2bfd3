//! Ciphers of the SIP022 (Shadowsocks 2022) protocol

use aes::{
    cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit},
    Aes128,
    Aes256,
};

use std::time::{SystemTime, UNIX_EPOCH};

use super::CipherKind;

pub mod tcp;
pub mod udp;

/// Headers whose timestamp is further than this from the local clock are rejected, in seconds
pub const TIMESTAMP_TOLERANCE: u64 = 30;

/// Upper bound of random padding in request headers and UDP packets
pub const MAX_PADDING_LEN: usize = 900;

/// Seconds since the UNIX epoch, the clock of 2022 headers
pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

const SESSION_SUBKEY_CONTEXT: &str = "shadowsocks 2022 session subkey";
const IDENTITY_SUBKEY_CONTEXT: &str = "shadowsocks 2022 identity subkey";

fn blake3_derive(context: &str, key: &[u8], salt: &[u8], out: &mut [u8]) {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    hasher.update(key);
    hasher.update(salt);
    let mut reader = hasher.finalize_xof();
    reader.fill(out);
}

/// Session subkey, `BLAKE3-derive-key("shadowsocks 2022 session subkey", key || salt)`
pub fn derive_session_key(key: &[u8], salt: &[u8], out: &mut [u8]) {
    blake3_derive(SESSION_SUBKEY_CONTEXT, key, salt, out);
}

/// Identity subkey for encrypting EIH, `BLAKE3-derive-key("shadowsocks 2022 identity subkey", key || salt)`
pub fn derive_identity_key(key: &[u8], salt: &[u8], out: &mut [u8]) {
    blake3_derive(IDENTITY_SUBKEY_CONTEXT, key, salt, out);
}

/// First 16 bytes of `BLAKE3(psk)`, which identifies a PSK in identity headers
pub fn identity_hash(psk: &[u8]) -> [u8; 16] {
    let hash = blake3::hash(psk);
    let mut out = [0u8; 16];
    out.copy_from_slice(&hash.as_bytes()[..16]);
    out
}

/// Raw AES block cipher of the AES 2022 methods
///
/// Encrypts identity headers (keyed with an identity subkey) and the UDP separate header (keyed with the PSK).
pub enum BlockCipher {
    Aes128(Box<Aes128>),
    Aes256(Box<Aes256>),
}

impl BlockCipher {
    /// # Panics
    ///
    /// If `kind` is not an AES 2022 method, or `key` is shorter than its key length.
    pub fn new(kind: CipherKind, key: &[u8]) -> BlockCipher {
        match kind {
            CipherKind::AEAD2022_BLAKE3_AES_128_GCM => {
                BlockCipher::Aes128(Box::new(Aes128::new(GenericArray::from_slice(&key[..16]))))
            }
            CipherKind::AEAD2022_BLAKE3_AES_256_GCM => {
                BlockCipher::Aes256(Box::new(Aes256::new(GenericArray::from_slice(&key[..32]))))
            }
            _ => panic!("{kind} doesn't have a block cipher"),
        }
    }

    /// Create the cipher for identity headers of the layer keyed by `psk`, bound to `salt`
    pub fn identity(kind: CipherKind, psk: &[u8], salt: &[u8]) -> BlockCipher {
        let mut subkey = [0u8; 32];
        let subkey = &mut subkey[..kind.key_len()];
        derive_identity_key(psk, salt, subkey);
        BlockCipher::new(kind, subkey)
    }

    pub fn encrypt_block(&self, block: &mut [u8; 16]) {
        let block = GenericArray::from_mut_slice(block);
        match *self {
            BlockCipher::Aes128(ref c) => c.encrypt_block(block),
            BlockCipher::Aes256(ref c) => c.encrypt_block(block),
        }
    }

    pub fn decrypt_block(&self, block: &mut [u8; 16]) {
        let block = GenericArray::from_mut_slice(block);
        match *self {
            BlockCipher::Aes128(ref c) => c.decrypt_block(block),
            BlockCipher::Aes256(ref c) => c.decrypt_block(block),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_key_matches_blake3_api() {
        let key = [1u8; 32];
        let salt = [2u8; 32];

        let mut out = [0u8; 32];
        derive_session_key(&key, &salt, &mut out);

        let mut material = key.to_vec();
        material.extend_from_slice(&salt);
        assert_eq!(out, blake3::derive_key(SESSION_SUBKEY_CONTEXT, &material));

        let mut identity = [0u8; 32];
        derive_identity_key(&key, &salt, &mut identity);
        assert_ne!(identity, out);
    }

    #[test]
    fn identity_header_block() {
        let ipsk = [5u8; 16];
        let salt = [6u8; 16];
        let upsk_hash = identity_hash(&[7u8; 16]);

        let cipher = BlockCipher::identity(CipherKind::AEAD2022_BLAKE3_AES_128_GCM, &ipsk, &salt);
        let mut block = upsk_hash;
        cipher.encrypt_block(&mut block);
        assert_ne!(block, upsk_hash);

        let peer = BlockCipher::identity(CipherKind::AEAD2022_BLAKE3_AES_128_GCM, &ipsk, &salt);
        peer.decrypt_block(&mut block);
        assert_eq!(block, upsk_hash);
    }
}
