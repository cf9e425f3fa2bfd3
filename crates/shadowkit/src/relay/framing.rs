//! Datagram frames on a stream, shared by UDP over TCP and Trojan `UdpAssociate`
//!
//! ```plain
//! +----------+--------+-----------+----------+
//! | ADDR     | LENGTH | SEPARATOR | Payload  |
//! +----------+--------+-----------+----------+
//! | Variable |   2    | 0 or 2    | Variable |
//! +----------+--------+-----------+----------+
//! ```
//!
//! UoT frames have no separator, Trojan puts a CRLF there.

use std::io::{self, ErrorKind};

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::Address;

/// Outcome of [`read_payload`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    /// Payload of this length is at the head of the buffer
    Read(usize),
    /// Payload of this length didn't fit and was discarded, the stream is at the next frame
    Oversized(usize),
}

/// Read the first byte of a frame, `Ok(None)` if the stream ends on a frame boundary
pub async fn read_frame_start<R>(reader: &mut R) -> io::Result<Option<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut first = [0u8; 1];
    match reader.read(&mut first).await? {
        0 => Ok(None),
        _ => Ok(Some(first[0])),
    }
}

/// Read `length` bytes of payload into `buf`
///
/// A payload larger than `buf` is read off the stream and dropped, so the following frame stays
/// readable.
pub async fn read_payload<R>(reader: &mut R, length: usize, buf: &mut [u8]) -> io::Result<Payload>
where
    R: AsyncRead + Unpin,
{
    if length <= buf.len() {
        reader.read_exact(&mut buf[..length]).await?;
        return Ok(Payload::Read(length));
    }

    let drained = tokio::io::copy(&mut (&mut *reader).take(length as u64), &mut tokio::io::sink()).await?;
    if drained < length as u64 {
        return Err(ErrorKind::UnexpectedEof.into());
    }
    Ok(Payload::Oversized(length))
}

/// Encode one frame
pub fn encode_frame(addr: &Address, separator: &[u8], payload: &[u8]) -> io::Result<BytesMut> {
    let length = u16::try_from(payload.len())
        .map_err(|_| io::Error::new(ErrorKind::InvalidInput, "datagram larger than 65535 bytes"))?;

    let mut buf = BytesMut::with_capacity(addr.serialized_len() + 2 + separator.len() + payload.len());
    addr.write_to_buf(&mut buf);
    buf.put_u16(length);
    buf.put_slice(separator);
    buf.put_slice(payload);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn oversized_payload_is_skipped() {
        let wire = [&[0xAAu8; 10][..], b"next"].concat();
        let mut reader = &wire[..];

        let mut small = [0u8; 4];
        assert_eq!(read_payload(&mut reader, 10, &mut small).await.unwrap(), Payload::Oversized(10));
        assert_eq!(read_payload(&mut reader, 4, &mut small).await.unwrap(), Payload::Read(4));
        assert_eq!(&small, b"next");
        assert_eq!(read_frame_start(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn short_payload() {
        let mut reader = &[0u8; 3][..];
        let err = read_payload(&mut reader, 8, &mut [0u8; 4]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);

        let mut reader = &[0u8; 3][..];
        let err = read_payload(&mut reader, 4, &mut [0u8; 4]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn frame_with_separator() {
        let addr = Address::DomainNameAddress("a.io".to_owned(), 53);
        let frame = encode_frame(&addr, b"\r\n", b"xy").unwrap();
        assert_eq!(&frame[..], b"\x03\x04a.io\x00\x35\x00\x02\r\nxy");

        assert!(encode_frame(&addr, &[], &[0u8; 65536]).is_err());
    }
}
