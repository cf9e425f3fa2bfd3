//! Errors of the encrypted TCP transport

use std::io;

/// Failure while reading or writing records of a Shadowsocks TCP stream
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error(transparent)]
    IoError(#[from] io::Error),
    #[error("data record failed authentication")]
    DecryptDataError,
    #[error("length record failed authentication")]
    DecryptLengthError,
    #[error("record length {0:#x} is above the 0x3FFF limit of AEAD streams")]
    DataTooLong(usize),
    #[error("salt (or IV) was already used by another stream")]
    SaltRepeated,
    #[error("header type {1:#x} where {0:#x} is expected")]
    InvalidStreamType(u8, u8),
    #[error("header timestamp {0} is too far from local clock {1}")]
    InvalidTimestamp(u64, u64),
    #[error("response header echoes a request salt that wasn't sent")]
    MismatchedRequestSalt,
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

impl From<ProtocolError> for io::Error {
    fn from(e: ProtocolError) -> io::Error {
        match e {
            ProtocolError::IoError(err) => err,
            e => io::Error::other(e),
        }
    }
}

/// The `ProtocolError` behind an `io::Error` returned by a proxy stream, if any
pub fn protocol_error(err: &io::Error) -> Option<&ProtocolError> {
    err.get_ref()?.downcast_ref::<ProtocolError>()
}
