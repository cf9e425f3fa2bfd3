//! UDP over TCP
//!
//! Datagrams are framed back to back on an already established stream, in both directions.
//!
//! ```plain
//! +----------+--------+----------+
//! | ADDR     | LENGTH | Payload  |
//! +----------+--------+----------+
//! | Variable |   2    | Variable |
//! +----------+--------+----------+
//! ```

use std::io::{self, ErrorKind};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use super::{
    address::AddressError,
    framing::{self, Payload},
    Address,
};

/// Host a client asks for to open a UoT association instead of a TCP tunnel
pub const UOT_MAGIC_ADDRESS: &str = "sp.udp-over-tcp.arpa";

/// Target of a request that opens a UoT association
pub fn uot_destination() -> Address {
    Address::DomainNameAddress(UOT_MAGIC_ADDRESS.to_owned(), 0)
}

pub fn is_uot_destination(addr: &Address) -> bool {
    matches!(addr, Address::DomainNameAddress(host, _) if host.eq_ignore_ascii_case(UOT_MAGIC_ADDRESS))
}

/// UoT framing error
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    IoError(io::Error),
    #[error(transparent)]
    Address(AddressError),
    #[error("stream ended in the middle of a frame")]
    ShortFrame,
    #[error("frame of {0} bytes is larger than buffer of {1} bytes")]
    FrameTooLarge(usize, usize),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        match err.kind() {
            ErrorKind::UnexpectedEof => Error::ShortFrame,
            _ => Error::IoError(err),
        }
    }
}

impl From<AddressError> for Error {
    fn from(err: AddressError) -> Error {
        match err {
            AddressError::IoError(e) => e.into(),
            e => Error::Address(e),
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        match err {
            Error::IoError(err) => err,
            Error::Address(err) => err.into(),
            Error::ShortFrame => io::Error::new(ErrorKind::UnexpectedEof, err),
            e => io::Error::new(ErrorKind::InvalidData, e),
        }
    }
}

/// Datagrams on a reliable stream
pub struct UotStream<S> {
    stream: S,
}

impl<S> UotStream<S> {
    pub fn new(stream: S) -> UotStream<S> {
        UotStream { stream }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S> UotStream<S>
where
    S: AsyncRead + AsyncWrite,
{
    pub fn into_split(self) -> (UotStream<ReadHalf<S>>, UotStream<WriteHalf<S>>) {
        let (r, w) = tokio::io::split(self.stream);
        (UotStream::new(r), UotStream::new(w))
    }
}

impl<S> UotStream<S>
where
    S: AsyncRead + Unpin,
{
    /// Read one frame into `buf`
    ///
    /// Returns `Ok(None)` if the stream ends on a frame boundary. A frame larger than `buf` is
    /// skipped and reported as [`Error::FrameTooLarge`], the next call reads the frame behind it.
    pub async fn read_packet(&mut self, buf: &mut [u8]) -> Result<Option<(usize, Address)>, Error> {
        let atyp = match framing::read_frame_start(&mut self.stream).await? {
            Some(atyp) => [atyp],
            None => return Ok(None),
        };

        let mut reader = (&atyp[..]).chain(&mut self.stream);
        let addr = Address::read_from(&mut reader).await?;
        let length = reader.read_u16().await? as usize;

        match framing::read_payload(&mut reader, length, buf).await? {
            Payload::Read(n) => Ok(Some((n, addr))),
            Payload::Oversized(n) => Err(Error::FrameTooLarge(n, buf.len())),
        }
    }
}

impl<S> UotStream<S>
where
    S: AsyncWrite + Unpin,
{
    /// Write one frame
    pub async fn write_packet(&mut self, addr: &Address, payload: &[u8]) -> io::Result<()> {
        let frame = framing::encode_frame(addr, &[], payload)?;
        self.stream.write_all(&frame).await?;
        self.stream.flush().await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};

    use super::*;

    fn target() -> Address {
        Address::SocketAddress(SocketAddr::new(Ipv4Addr::new(10, 0, 0, 1).into(), 5353))
    }

    #[tokio::test]
    async fn frame_layout() {
        let payload = vec![0x5Au8; 1200];

        let mut wire = Vec::new();
        UotStream::new(&mut wire).write_packet(&target(), &payload).await.unwrap();

        assert_eq!(&wire[..9], &[0x01, 10, 0, 0, 1, 0x14, 0xE9, 0x04, 0xB0]);
        assert_eq!(&wire[9..], &payload[..]);

        let mut buf = vec![0u8; 2048];
        let mut reader = UotStream::new(&wire[..]);
        let (n, addr) = reader.read_packet(&mut buf).await.unwrap().unwrap();
        assert_eq!(n, 1200);
        assert_eq!(addr, target());
        assert!(reader.read_packet(&mut buf).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_frame() {
        let wire = framing::encode_frame(&target(), &[], &[0u8; 1200]).unwrap();

        let mut buf = vec![0u8; 2048];

        // 1100 of 1200 payload bytes
        let mut reader = UotStream::new(&wire[..9 + 1100]);
        assert!(matches!(reader.read_packet(&mut buf).await, Err(Error::ShortFrame)));

        // inside the address
        let mut reader = UotStream::new(&wire[..3]);
        assert!(matches!(reader.read_packet(&mut buf).await, Err(Error::ShortFrame)));
    }

    #[tokio::test]
    async fn oversized_frame_is_skipped() {
        let mut wire = Vec::new();
        let mut writer = UotStream::new(&mut wire);
        writer.write_packet(&target(), &[0xEEu8; 600]).await.unwrap();
        writer.write_packet(&target(), b"fits").await.unwrap();

        let mut buf = [0u8; 512];
        let mut reader = UotStream::new(&wire[..]);
        assert!(matches!(
            reader.read_packet(&mut buf).await,
            Err(Error::FrameTooLarge(600, 512))
        ));

        let (n, addr) = reader.read_packet(&mut buf).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"fits");
        assert_eq!(addr, target());
        assert!(reader.read_packet(&mut buf).await.unwrap().is_none());
    }

    #[test]
    fn magic_destination() {
        assert!(is_uot_destination(&uot_destination()));
        assert!(is_uot_destination(&Address::DomainNameAddress("SP.UDP-over-TCP.arpa".to_owned(), 443)));
        assert!(!is_uot_destination(&target()));
    }
}
