//! Cipher method table
//!
//! Every supported method is a variant of [`CipherKind`]; the lengths and the
//! framing family of each method are resolved by exhaustive matches, so there is
//! no runtime registration step.

use std::{
    fmt::{self, Display},
    str::FromStr,
};

/// Framing family of a method
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CipherCategory {
    /// No encryption, bytes are passed through
    None,
    /// Legacy stream ciphers, `iv || stream-encrypt(..)`
    #[cfg(feature = "stream-cipher")]
    Stream,
    /// AEAD ciphers with HKDF-SHA1 subkeys (SIP004)
    Aead,
    /// AEAD ciphers with BLAKE3 subkeys and extended headers (SIP022)
    Aead2022,
}

/// Shadowsocks encryption method
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum CipherKind {
    NONE,

    #[cfg(feature = "stream-cipher")]
    SS_RC4_MD5,
    #[cfg(feature = "stream-cipher")]
    RC4,

    #[cfg(feature = "stream-cipher")]
    AES_128_CTR,
    #[cfg(feature = "stream-cipher")]
    AES_192_CTR,
    #[cfg(feature = "stream-cipher")]
    AES_256_CTR,

    #[cfg(feature = "stream-cipher")]
    AES_128_CFB8,
    #[cfg(feature = "stream-cipher")]
    AES_192_CFB8,
    #[cfg(feature = "stream-cipher")]
    AES_256_CFB8,
    #[cfg(feature = "stream-cipher")]
    AES_128_CFB128,
    #[cfg(feature = "stream-cipher")]
    AES_192_CFB128,
    #[cfg(feature = "stream-cipher")]
    AES_256_CFB128,

    #[cfg(feature = "stream-cipher")]
    AES_128_OFB,
    #[cfg(feature = "stream-cipher")]
    AES_192_OFB,
    #[cfg(feature = "stream-cipher")]
    AES_256_OFB,

    #[cfg(feature = "stream-cipher")]
    CAMELLIA_128_CFB8,
    #[cfg(feature = "stream-cipher")]
    CAMELLIA_192_CFB8,
    #[cfg(feature = "stream-cipher")]
    CAMELLIA_256_CFB8,
    #[cfg(feature = "stream-cipher")]
    CAMELLIA_128_CFB128,
    #[cfg(feature = "stream-cipher")]
    CAMELLIA_192_CFB128,
    #[cfg(feature = "stream-cipher")]
    CAMELLIA_256_CFB128,

    #[cfg(feature = "stream-cipher")]
    BF_CFB,
    #[cfg(feature = "stream-cipher")]
    CAST5_CFB,
    #[cfg(feature = "stream-cipher")]
    DES_CFB,

    #[cfg(feature = "stream-cipher")]
    CHACHA20,
    #[cfg(feature = "stream-cipher")]
    CHACHA20_IETF,
    #[cfg(feature = "stream-cipher")]
    XCHACHA20,
    #[cfg(feature = "stream-cipher")]
    SALSA20,

    AES_128_GCM,
    AES_192_GCM,
    AES_256_GCM,
    CHACHA20_POLY1305,
    XCHACHA20_POLY1305,

    AEAD2022_BLAKE3_AES_128_GCM,
    AEAD2022_BLAKE3_AES_256_GCM,
    AEAD2022_BLAKE3_CHACHA20_POLY1305,
}

impl CipherKind {
    /// All methods compiled into this build
    pub fn available_ciphers() -> &'static [CipherKind] {
        const AVAILABLE: &[CipherKind] = &[
            CipherKind::NONE,
            #[cfg(feature = "stream-cipher")]
            CipherKind::SS_RC4_MD5,
            #[cfg(feature = "stream-cipher")]
            CipherKind::RC4,
            #[cfg(feature = "stream-cipher")]
            CipherKind::AES_128_CTR,
            #[cfg(feature = "stream-cipher")]
            CipherKind::AES_192_CTR,
            #[cfg(feature = "stream-cipher")]
            CipherKind::AES_256_CTR,
            #[cfg(feature = "stream-cipher")]
            CipherKind::AES_128_CFB8,
            #[cfg(feature = "stream-cipher")]
            CipherKind::AES_192_CFB8,
            #[cfg(feature = "stream-cipher")]
            CipherKind::AES_256_CFB8,
            #[cfg(feature = "stream-cipher")]
            CipherKind::AES_128_CFB128,
            #[cfg(feature = "stream-cipher")]
            CipherKind::AES_192_CFB128,
            #[cfg(feature = "stream-cipher")]
            CipherKind::AES_256_CFB128,
            #[cfg(feature = "stream-cipher")]
            CipherKind::AES_128_OFB,
            #[cfg(feature = "stream-cipher")]
            CipherKind::AES_192_OFB,
            #[cfg(feature = "stream-cipher")]
            CipherKind::AES_256_OFB,
            #[cfg(feature = "stream-cipher")]
            CipherKind::CAMELLIA_128_CFB8,
            #[cfg(feature = "stream-cipher")]
            CipherKind::CAMELLIA_192_CFB8,
            #[cfg(feature = "stream-cipher")]
            CipherKind::CAMELLIA_256_CFB8,
            #[cfg(feature = "stream-cipher")]
            CipherKind::CAMELLIA_128_CFB128,
            #[cfg(feature = "stream-cipher")]
            CipherKind::CAMELLIA_192_CFB128,
            #[cfg(feature = "stream-cipher")]
            CipherKind::CAMELLIA_256_CFB128,
            #[cfg(feature = "stream-cipher")]
            CipherKind::BF_CFB,
            #[cfg(feature = "stream-cipher")]
            CipherKind::CAST5_CFB,
            #[cfg(feature = "stream-cipher")]
            CipherKind::DES_CFB,
            #[cfg(feature = "stream-cipher")]
            CipherKind::CHACHA20,
            #[cfg(feature = "stream-cipher")]
            CipherKind::CHACHA20_IETF,
            #[cfg(feature = "stream-cipher")]
            CipherKind::XCHACHA20,
            #[cfg(feature = "stream-cipher")]
            CipherKind::SALSA20,
            CipherKind::AES_128_GCM,
            CipherKind::AES_192_GCM,
            CipherKind::AES_256_GCM,
            CipherKind::CHACHA20_POLY1305,
            CipherKind::XCHACHA20_POLY1305,
            CipherKind::AEAD2022_BLAKE3_AES_128_GCM,
            CipherKind::AEAD2022_BLAKE3_AES_256_GCM,
            CipherKind::AEAD2022_BLAKE3_CHACHA20_POLY1305,
        ];
        AVAILABLE
    }

    /// Framing family
    pub fn category(&self) -> CipherCategory {
        use CipherKind::*;

        match *self {
            NONE => CipherCategory::None,
            AES_128_GCM | AES_192_GCM | AES_256_GCM | CHACHA20_POLY1305 | XCHACHA20_POLY1305 => CipherCategory::Aead,
            AEAD2022_BLAKE3_AES_128_GCM | AEAD2022_BLAKE3_AES_256_GCM | AEAD2022_BLAKE3_CHACHA20_POLY1305 => {
                CipherCategory::Aead2022
            }
            #[cfg(feature = "stream-cipher")]
            _ => CipherCategory::Stream,
        }
    }

    /// Check if it is a legacy stream cipher
    #[cfg(feature = "stream-cipher")]
    pub fn is_stream(&self) -> bool {
        self.category() == CipherCategory::Stream
    }

    /// Check if it is an AEAD cipher (SIP004)
    pub fn is_aead(&self) -> bool {
        self.category() == CipherCategory::Aead
    }

    /// Check if it is an AEAD 2022 cipher (SIP022)
    pub fn is_aead_2022(&self) -> bool {
        self.category() == CipherCategory::Aead2022
    }

    /// Length of the (pre-shared) key
    pub fn key_len(&self) -> usize {
        use CipherKind::*;

        match *self {
            NONE => 0,

            #[cfg(feature = "stream-cipher")]
            SS_RC4_MD5 | RC4 => 16,

            #[cfg(feature = "stream-cipher")]
            AES_128_CTR | AES_128_CFB8 | AES_128_CFB128 | AES_128_OFB => 16,
            #[cfg(feature = "stream-cipher")]
            AES_192_CTR | AES_192_CFB8 | AES_192_CFB128 | AES_192_OFB => 24,
            #[cfg(feature = "stream-cipher")]
            AES_256_CTR | AES_256_CFB8 | AES_256_CFB128 | AES_256_OFB => 32,

            #[cfg(feature = "stream-cipher")]
            CAMELLIA_128_CFB8 | CAMELLIA_128_CFB128 => 16,
            #[cfg(feature = "stream-cipher")]
            CAMELLIA_192_CFB8 | CAMELLIA_192_CFB128 => 24,
            #[cfg(feature = "stream-cipher")]
            CAMELLIA_256_CFB8 | CAMELLIA_256_CFB128 => 32,

            #[cfg(feature = "stream-cipher")]
            BF_CFB | CAST5_CFB => 16,
            #[cfg(feature = "stream-cipher")]
            DES_CFB => 8,

            #[cfg(feature = "stream-cipher")]
            CHACHA20 | CHACHA20_IETF | XCHACHA20 | SALSA20 => 32,

            AES_128_GCM => 16,
            AES_192_GCM => 24,
            AES_256_GCM => 32,
            CHACHA20_POLY1305 | XCHACHA20_POLY1305 => 32,

            AEAD2022_BLAKE3_AES_128_GCM => 16,
            AEAD2022_BLAKE3_AES_256_GCM => 32,
            AEAD2022_BLAKE3_CHACHA20_POLY1305 => 32,
        }
    }

    /// IV length of stream ciphers, 0 for the others
    pub fn iv_len(&self) -> usize {
        use CipherKind::*;

        match *self {
            #[cfg(feature = "stream-cipher")]
            RC4 => 0,
            #[cfg(feature = "stream-cipher")]
            SS_RC4_MD5 => 16,
            #[cfg(feature = "stream-cipher")]
            AES_128_CTR | AES_192_CTR | AES_256_CTR => 16,
            #[cfg(feature = "stream-cipher")]
            AES_128_CFB8 | AES_192_CFB8 | AES_256_CFB8 | AES_128_CFB128 | AES_192_CFB128 | AES_256_CFB128 => 16,
            #[cfg(feature = "stream-cipher")]
            AES_128_OFB | AES_192_OFB | AES_256_OFB => 16,
            #[cfg(feature = "stream-cipher")]
            CAMELLIA_128_CFB8 | CAMELLIA_192_CFB8 | CAMELLIA_256_CFB8 => 16,
            #[cfg(feature = "stream-cipher")]
            CAMELLIA_128_CFB128 | CAMELLIA_192_CFB128 | CAMELLIA_256_CFB128 => 16,
            #[cfg(feature = "stream-cipher")]
            BF_CFB | CAST5_CFB | DES_CFB => 8,
            #[cfg(feature = "stream-cipher")]
            CHACHA20 | SALSA20 => 8,
            #[cfg(feature = "stream-cipher")]
            CHACHA20_IETF => 12,
            #[cfg(feature = "stream-cipher")]
            XCHACHA20 => 24,
            _ => 0,
        }
    }

    /// Salt length of AEAD ciphers, which equals to the key length, 0 for the others
    pub fn salt_len(&self) -> usize {
        match self.category() {
            CipherCategory::Aead | CipherCategory::Aead2022 => self.key_len(),
            _ => 0,
        }
    }

    /// Length of whatever is sent in front of the first encrypted byte
    pub fn iv_or_salt_len(&self) -> usize {
        match self.category() {
            CipherCategory::None => 0,
            #[cfg(feature = "stream-cipher")]
            CipherCategory::Stream => self.iv_len(),
            CipherCategory::Aead | CipherCategory::Aead2022 => self.salt_len(),
        }
    }

    /// Authentication tag length of AEAD ciphers
    pub fn tag_len(&self) -> usize {
        match self.category() {
            CipherCategory::Aead | CipherCategory::Aead2022 => 16,
            _ => 0,
        }
    }

    /// AEAD nonce length used for the TCP record sequence
    pub fn nonce_len(&self) -> usize {
        match *self {
            CipherKind::XCHACHA20_POLY1305 => 24,
            _ => match self.category() {
                CipherCategory::Aead | CipherCategory::Aead2022 => 12,
                _ => 0,
            },
        }
    }

    /// Methods that could carry Extensible Identity Headers
    pub fn support_eih(&self) -> bool {
        matches!(
            *self,
            CipherKind::AEAD2022_BLAKE3_AES_128_GCM | CipherKind::AEAD2022_BLAKE3_AES_256_GCM
        )
    }

    /// Method name as it appears in configurations and URLs
    pub fn name(&self) -> &'static str {
        use CipherKind::*;

        match *self {
            NONE => "none",

            #[cfg(feature = "stream-cipher")]
            SS_RC4_MD5 => "rc4-md5",
            #[cfg(feature = "stream-cipher")]
            RC4 => "rc4",

            #[cfg(feature = "stream-cipher")]
            AES_128_CTR => "aes-128-ctr",
            #[cfg(feature = "stream-cipher")]
            AES_192_CTR => "aes-192-ctr",
            #[cfg(feature = "stream-cipher")]
            AES_256_CTR => "aes-256-ctr",

            #[cfg(feature = "stream-cipher")]
            AES_128_CFB8 => "aes-128-cfb8",
            #[cfg(feature = "stream-cipher")]
            AES_192_CFB8 => "aes-192-cfb8",
            #[cfg(feature = "stream-cipher")]
            AES_256_CFB8 => "aes-256-cfb8",
            #[cfg(feature = "stream-cipher")]
            AES_128_CFB128 => "aes-128-cfb",
            #[cfg(feature = "stream-cipher")]
            AES_192_CFB128 => "aes-192-cfb",
            #[cfg(feature = "stream-cipher")]
            AES_256_CFB128 => "aes-256-cfb",

            #[cfg(feature = "stream-cipher")]
            AES_128_OFB => "aes-128-ofb",
            #[cfg(feature = "stream-cipher")]
            AES_192_OFB => "aes-192-ofb",
            #[cfg(feature = "stream-cipher")]
            AES_256_OFB => "aes-256-ofb",

            #[cfg(feature = "stream-cipher")]
            CAMELLIA_128_CFB8 => "camellia-128-cfb8",
            #[cfg(feature = "stream-cipher")]
            CAMELLIA_192_CFB8 => "camellia-192-cfb8",
            #[cfg(feature = "stream-cipher")]
            CAMELLIA_256_CFB8 => "camellia-256-cfb8",
            #[cfg(feature = "stream-cipher")]
            CAMELLIA_128_CFB128 => "camellia-128-cfb",
            #[cfg(feature = "stream-cipher")]
            CAMELLIA_192_CFB128 => "camellia-192-cfb",
            #[cfg(feature = "stream-cipher")]
            CAMELLIA_256_CFB128 => "camellia-256-cfb",

            #[cfg(feature = "stream-cipher")]
            BF_CFB => "bf-cfb",
            #[cfg(feature = "stream-cipher")]
            CAST5_CFB => "cast5-cfb",
            #[cfg(feature = "stream-cipher")]
            DES_CFB => "des-cfb",

            #[cfg(feature = "stream-cipher")]
            CHACHA20 => "chacha20",
            #[cfg(feature = "stream-cipher")]
            CHACHA20_IETF => "chacha20-ietf",
            #[cfg(feature = "stream-cipher")]
            XCHACHA20 => "xchacha20",
            #[cfg(feature = "stream-cipher")]
            SALSA20 => "salsa20",

            AES_128_GCM => "aes-128-gcm",
            AES_192_GCM => "aes-192-gcm",
            AES_256_GCM => "aes-256-gcm",
            CHACHA20_POLY1305 => "chacha20-ietf-poly1305",
            XCHACHA20_POLY1305 => "xchacha20-ietf-poly1305",

            AEAD2022_BLAKE3_AES_128_GCM => "2022-blake3-aes-128-gcm",
            AEAD2022_BLAKE3_AES_256_GCM => "2022-blake3-aes-256-gcm",
            AEAD2022_BLAKE3_CHACHA20_POLY1305 => "2022-blake3-chacha20-poly1305",
        }
    }
}

impl Display for CipherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error while parsing a method name
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown cipher method \"{0}\"")]
pub struct UnknownCipherError(String);

impl FromStr for CipherKind {
    type Err = UnknownCipherError;

    fn from_str(s: &str) -> Result<CipherKind, UnknownCipherError> {
        let s = s.to_ascii_lowercase();
        match s.as_str() {
            "plain" | "none" => return Ok(CipherKind::NONE),
            "chacha20-poly1305" => return Ok(CipherKind::CHACHA20_POLY1305),
            "xchacha20-poly1305" => return Ok(CipherKind::XCHACHA20_POLY1305),
            _ => {}
        }

        CipherKind::available_ciphers()
            .iter()
            .find(|k| k.name() == s)
            .copied()
            .ok_or(UnknownCipherError(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_method_names() {
        for kind in CipherKind::available_ciphers() {
            assert_eq!(kind.name().parse::<CipherKind>().unwrap(), *kind);
        }

        assert_eq!("PLAIN".parse::<CipherKind>().unwrap(), CipherKind::NONE);
        assert_eq!(
            "chacha20-poly1305".parse::<CipherKind>().unwrap(),
            CipherKind::CHACHA20_POLY1305
        );
        assert!("aes-512-gcm".parse::<CipherKind>().is_err());
    }

    #[test]
    fn aead_lengths() {
        assert_eq!(CipherKind::AES_128_GCM.salt_len(), 16);
        assert_eq!(CipherKind::AES_192_GCM.key_len(), 24);
        assert_eq!(CipherKind::CHACHA20_POLY1305.tag_len(), 16);
        assert_eq!(CipherKind::XCHACHA20_POLY1305.nonce_len(), 24);
        assert_eq!(CipherKind::AEAD2022_BLAKE3_AES_256_GCM.iv_or_salt_len(), 32);
        assert_eq!(CipherKind::NONE.iv_or_salt_len(), 0);
        assert!(CipherKind::AEAD2022_BLAKE3_AES_128_GCM.support_eih());
        assert!(!CipherKind::AEAD2022_BLAKE3_CHACHA20_POLY1305.support_eih());
    }
}
