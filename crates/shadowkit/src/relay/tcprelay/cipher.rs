//! Per-direction record cipher

use crate::crypto::{v1::Cipher, v2::tcp::TcpCipher, CipherCategory, CipherKind};

/// Plaintext limit of one AEAD record, the two high bits of the length are reserved
pub const AEAD_MAX_RECORD_LEN: usize = 0x3FFF;
/// Plaintext limit of one 2022 record
pub const AEAD_2022_MAX_RECORD_LEN: usize = 0xFFFF;

/// Largest plaintext of one record, `None` if `method` doesn't frame the stream in records
pub fn max_record_len(method: CipherKind) -> Option<usize> {
    match method.category() {
        CipherCategory::Aead => Some(AEAD_MAX_RECORD_LEN),
        CipherCategory::Aead2022 => Some(AEAD_2022_MAX_RECORD_LEN),
        _ => None,
    }
}

/// Which end of the connection this side is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    /// Type byte of the 2022 headers this side sends
    pub fn header_type(self) -> u8 {
        match self {
            Role::Client => 0,
            Role::Server => 1,
        }
    }

    /// Type byte of the 2022 headers the peer sends
    pub fn peer_header_type(self) -> u8 {
        match self {
            Role::Client => Role::Server.header_type(),
            Role::Server => Role::Client.header_type(),
        }
    }
}

pub(crate) enum RecordCipher {
    Legacy(Cipher),
    Session(TcpCipher),
}

impl RecordCipher {
    pub fn new(method: CipherKind, key: &[u8], nonce: &[u8]) -> RecordCipher {
        if method.is_aead_2022() {
            RecordCipher::Session(TcpCipher::new(method, key, nonce))
        } else {
            RecordCipher::Legacy(Cipher::new(method, key, nonce))
        }
    }

    pub fn seal(&mut self, record: &mut [u8]) {
        match *self {
            RecordCipher::Legacy(ref mut c) => c.encrypt_packet(record),
            RecordCipher::Session(ref mut c) => c.encrypt_packet(record),
        }
    }

    #[must_use]
    pub fn open(&mut self, record: &mut [u8]) -> bool {
        match *self {
            RecordCipher::Legacy(ref mut c) => c.decrypt_packet(record),
            RecordCipher::Session(ref mut c) => c.decrypt_packet(record),
        }
    }
}
