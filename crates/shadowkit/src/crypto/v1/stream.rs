//! Legacy stream ciphers
//!
//! Insecure, no integrity protection at all. Only enabled with the `stream-cipher` feature.

use cipher::{
    generic_array::GenericArray,
    BlockCipher,
    BlockDecryptMut,
    BlockEncryptMut,
    KeyInit,
    KeyIvInit,
    StreamCipher as _,
};
use md5::{Digest, Md5};

use crate::crypto::CipherKind;

trait StreamApply: Send + Sync {
    fn encrypt(&mut self, data: &mut [u8]);
    fn decrypt(&mut self, data: &mut [u8]);
}

/// Ciphers that XOR a keystream, encryption and decryption are the same
struct Keystream<C>(C);

impl<C> StreamApply for Keystream<C>
where
    C: cipher::StreamCipher + Send + Sync,
{
    fn encrypt(&mut self, data: &mut [u8]) {
        self.0.apply_keystream(data);
    }

    fn decrypt(&mut self, data: &mut [u8]) {
        self.0.apply_keystream(data);
    }
}

/// Full block CFB (CFB128 for AES and Camellia, CFB64 for the 64 bits block ciphers)
struct Cfb<C>
where
    C: BlockEncryptMut + BlockCipher,
{
    enc: cfb_mode::BufEncryptor<C>,
    dec: cfb_mode::BufDecryptor<C>,
}

impl<C> StreamApply for Cfb<C>
where
    C: BlockEncryptMut + BlockCipher + Send + Sync,
{
    fn encrypt(&mut self, data: &mut [u8]) {
        self.enc.encrypt(data);
    }

    fn decrypt(&mut self, data: &mut [u8]) {
        self.dec.decrypt(data);
    }
}

struct Cfb8<C>
where
    C: BlockEncryptMut + BlockCipher,
{
    enc: cfb8::Encryptor<C>,
    dec: cfb8::Decryptor<C>,
}

impl<C> StreamApply for Cfb8<C>
where
    C: BlockEncryptMut + BlockCipher + Send + Sync,
{
    fn encrypt(&mut self, data: &mut [u8]) {
        for b in data.iter_mut() {
            self.enc
                .encrypt_block_mut(GenericArray::from_mut_slice(std::slice::from_mut(b)));
        }
    }

    fn decrypt(&mut self, data: &mut [u8]) {
        for b in data.iter_mut() {
            self.dec
                .decrypt_block_mut(GenericArray::from_mut_slice(std::slice::from_mut(b)));
        }
    }
}

/// # Panics
///
/// If `key` or `iv` doesn't have the length `T` takes.
fn init<T: KeyIvInit>(key: &[u8], iv: &[u8]) -> T {
    match T::new_from_slices(key, iv) {
        Ok(c) => c,
        Err(..) => panic!("invalid stream cipher key or iv length"),
    }
}

fn keystream<C>(key: &[u8], iv: &[u8]) -> Box<dyn StreamApply>
where
    C: KeyIvInit + cipher::StreamCipher + Send + Sync + 'static,
{
    Box::new(Keystream(init::<C>(key, iv)))
}

fn cfb<C>(key: &[u8], iv: &[u8]) -> Box<dyn StreamApply>
where
    C: BlockEncryptMut + BlockCipher + KeyInit + Send + Sync + 'static,
{
    Box::new(Cfb::<C> {
        enc: init(key, iv),
        dec: init(key, iv),
    })
}

fn cfb8<C>(key: &[u8], iv: &[u8]) -> Box<dyn StreamApply>
where
    C: BlockEncryptMut + BlockCipher + KeyInit + Send + Sync + 'static,
{
    Box::new(Cfb8::<C> {
        enc: init(key, iv),
        dec: init(key, iv),
    })
}

/// RC4 keyed with 16 bytes, panics on any other key length
fn rc4(key: &[u8]) -> Box<dyn StreamApply> {
    match rc4::Rc4::<cipher::consts::U16>::new_from_slice(key) {
        Ok(c) => Box::new(Keystream(c)),
        Err(..) => panic!("invalid rc4 key length"),
    }
}

/// Stream cipher for one direction
pub struct StreamCipher {
    inner: Box<dyn StreamApply>,
}

impl StreamCipher {
    /// # Panics
    ///
    /// If `kind` is not a stream method, or `key` and `iv` don't have the method's lengths.
    pub fn new(kind: CipherKind, key: &[u8], iv: &[u8]) -> StreamCipher {
        use aes::{Aes128, Aes192, Aes256};
        use camellia::{Camellia128, Camellia192, Camellia256};
        use CipherKind::*;

        let inner = match kind {
            SS_RC4_MD5 => {
                let mut m = Md5::new();
                m.update(key);
                m.update(iv);
                let rc4_key = m.finalize();
                rc4(&rc4_key)
            }
            RC4 => rc4(key),

            AES_128_CTR => keystream::<ctr::Ctr128BE<Aes128>>(key, iv),
            AES_192_CTR => keystream::<ctr::Ctr128BE<Aes192>>(key, iv),
            AES_256_CTR => keystream::<ctr::Ctr128BE<Aes256>>(key, iv),

            AES_128_CFB8 => cfb8::<Aes128>(key, iv),
            AES_192_CFB8 => cfb8::<Aes192>(key, iv),
            AES_256_CFB8 => cfb8::<Aes256>(key, iv),
            AES_128_CFB128 => cfb::<Aes128>(key, iv),
            AES_192_CFB128 => cfb::<Aes192>(key, iv),
            AES_256_CFB128 => cfb::<Aes256>(key, iv),

            AES_128_OFB => keystream::<ofb::Ofb<Aes128>>(key, iv),
            AES_192_OFB => keystream::<ofb::Ofb<Aes192>>(key, iv),
            AES_256_OFB => keystream::<ofb::Ofb<Aes256>>(key, iv),

            CAMELLIA_128_CFB8 => cfb8::<Camellia128>(key, iv),
            CAMELLIA_192_CFB8 => cfb8::<Camellia192>(key, iv),
            CAMELLIA_256_CFB8 => cfb8::<Camellia256>(key, iv),
            CAMELLIA_128_CFB128 => cfb::<Camellia128>(key, iv),
            CAMELLIA_192_CFB128 => cfb::<Camellia192>(key, iv),
            CAMELLIA_256_CFB128 => cfb::<Camellia256>(key, iv),

            BF_CFB => cfb::<blowfish::Blowfish>(key, iv),
            CAST5_CFB => cfb::<cast5::Cast5>(key, iv),
            DES_CFB => cfb::<des::Des>(key, iv),

            CHACHA20 => keystream::<chacha20::ChaCha20Legacy>(key, iv),
            CHACHA20_IETF => keystream::<chacha20::ChaCha20>(key, iv),
            XCHACHA20 => keystream::<chacha20::XChaCha20>(key, iv),
            SALSA20 => keystream::<salsa20::Salsa20>(key, iv),

            _ => panic!("{kind} is not a stream cipher"),
        };

        StreamCipher { inner }
    }

    pub fn encrypt(&mut self, data: &mut [u8]) {
        self.inner.encrypt(data);
    }

    pub fn decrypt(&mut self, data: &mut [u8]) {
        self.inner.decrypt(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_ciphers_pair() {
        let plain = b"the quick brown fox jumps over the lazy dog";

        for kind in CipherKind::available_ciphers().iter().filter(|k| k.is_stream()) {
            let key = vec![0x42u8; kind.key_len()];
            let iv = vec![0x24u8; kind.iv_len()];

            let mut enc = StreamCipher::new(*kind, &key, &iv);
            let mut dec = StreamCipher::new(*kind, &key, &iv);

            // Encrypt in two pieces, the keystream must continue across calls
            let mut data = plain.to_vec();
            let (a, b) = data.split_at_mut(7);
            enc.encrypt(a);
            enc.encrypt(b);
            assert_ne!(&data[..], &plain[..], "{kind}");

            dec.decrypt(&mut data);
            assert_eq!(&data[..], &plain[..], "{kind}");
        }
    }

    #[test]
    #[should_panic(expected = "invalid stream cipher key or iv length")]
    fn short_iv_panics() {
        let _ = StreamCipher::new(CipherKind::AES_128_CTR, &[0u8; 16], &[0u8; 8]);
    }
}
