//! Trojan protocol
//!
//! Trojan runs in plaintext inside a TLS stream, TLS itself is provided by the caller.
//!
//! ```plain
//! +-----------------------+---------+----------------+---------+----------+
//! | hex(SHA224(password)) |  CRLF   | Trojan Request |  CRLF   | Payload  |
//! +-----------------------+---------+----------------+---------+----------+
//! |          56           | X'0D0A' |    Variable    | X'0D0A' | Variable |
//! +-----------------------+---------+----------------+---------+----------+
//! ```

use std::io::{self, ErrorKind};

use sha2::{Digest, Sha224};

use super::address::AddressError;

pub use self::{
    client::TrojanClientStream,
    protocol::{Command, RequestHeader, UdpPacketHeader},
    server::{TrojanAcceptor, TrojanInbound, TrojanUser, TrojanUserManager},
    udp::TrojanUdpStream,
};

mod client;
pub mod protocol;
mod server;
mod udp;

/// Length of a Trojan key, the hex encoded SHA-224 of password
pub const KEY_LEN: usize = 56;

/// Derive the key sent on the wire from `password`
pub fn password_to_key(password: &str) -> [u8; KEY_LEN] {
    let digest = hex::encode(Sha224::digest(password.as_bytes()));

    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(digest.as_bytes());
    key
}

/// Trojan protocol error
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    IoError(#[from] io::Error),
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error("unknown trojan key")]
    UnknownKey,
    #[error("expecting CRLF, but found {0:?}")]
    InvalidCrlf([u8; 2]),
    #[error("unsupported command {0:#x}")]
    UnsupportedCommand(u8),
    #[error("packet of {0} bytes is larger than buffer of {1} bytes")]
    PacketTooLarge(usize, usize),
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        match err {
            Error::IoError(err) => err,
            Error::Address(err) => err.into(),
            Error::UnknownKey => io::Error::new(ErrorKind::PermissionDenied, err),
            e => io::Error::new(ErrorKind::InvalidData, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_lowercase_sha224_hex() {
        let key = password_to_key("hunter2");
        assert_eq!(key.len(), 56);
        assert_eq!(
            std::str::from_utf8(&key).unwrap(),
            hex::encode(Sha224::digest(b"hunter2"))
        );
        assert!(key.iter().all(|c| c.is_ascii_digit() || (b'a'..=b'f').contains(c)));

        // SHA-224("") from FIPS 180-4 test vectors
        assert_eq!(
            &password_to_key("")[..],
            b"d14a028c2a3a2bc9476102bb288234c415a2b01f828ea62ac5b3e42f"
        );
    }
}
