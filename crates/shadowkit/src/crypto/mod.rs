//! Shadowsocks cipher registry and key derivation

pub use self::kind::{CipherCategory, CipherKind, UnknownCipherError};

mod aead;
pub mod kind;
pub mod v1;
pub mod v2;

use md5::{Digest, Md5};
use rand::RngCore;

/// Fill `iv_or_salt` with random bytes
///
/// An all-zero output is never returned, so a freshly generated salt could not
/// be confused with an uninitialized buffer.
pub fn random_iv_or_salt(iv_or_salt: &mut [u8]) {
    if iv_or_salt.is_empty() {
        return;
    }

    let mut rng = rand::thread_rng();
    loop {
        rng.fill_bytes(iv_or_salt);
        if iv_or_salt.iter().any(|b| *b != 0) {
            break;
        }
    }
}

/// Derive a key from a password with OpenSSL's `EVP_BytesToKey` (MD5, no salt, 1 round)
///
/// `D_0 = MD5(password)`, `D_i = MD5(D_{i-1} || password)`, `key = D_0 || D_1 || ...` truncated.
pub fn openssl_bytes_to_key(password: &[u8], key: &mut [u8]) {
    let key_len = key.len();

    let mut last_digest: Option<[u8; 16]> = None;
    let mut offset = 0usize;
    while offset < key_len {
        let mut m = Md5::new();
        if let Some(digest) = last_digest {
            m.update(digest);
        }
        m.update(password);
        let digest: [u8; 16] = m.finalize().into();

        let amt = std::cmp::min(key_len - offset, digest.len());
        key[offset..offset + amt].copy_from_slice(&digest[..amt]);

        offset += amt;
        last_digest = Some(digest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_to_key_matches_openssl() {
        // openssl enc -aes-256-cfb -k foobar -P -nosalt -md md5
        let mut key = [0u8; 32];
        openssl_bytes_to_key(b"foobar", &mut key);
        assert_eq!(
            hex::encode(key),
            "3858f62230ac3c915f300c664312c63f568378529614d22ddb49237d2f60bfdf"
        );

        let mut short = [0u8; 16];
        openssl_bytes_to_key(b"foobar", &mut short);
        assert_eq!(&short[..], &key[..16]);
    }

    #[test]
    fn random_salt_is_not_zero() {
        let mut salt = [0u8; 32];
        random_iv_or_salt(&mut salt);
        assert!(salt.iter().any(|b| *b != 0));
    }
}
