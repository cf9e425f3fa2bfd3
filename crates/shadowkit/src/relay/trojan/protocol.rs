//! Trojan request and UDP packet headers

use std::io;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::relay::Address;

use super::{Error, KEY_LEN};

pub(super) const CRLF: [u8; 2] = *b"\r\n";

async fn read_crlf<R>(r: &mut R) -> Result<(), Error>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf).await?;
    if buf != CRLF {
        return Err(Error::InvalidCrlf(buf));
    }
    Ok(())
}

/// Trojan request command
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Connect,
    UdpAssociate,
}

impl Command {
    #[rustfmt::skip]
    const CMD_CONNECT:       u8 = 0x01;
    #[rustfmt::skip]
    const CMD_UDP_ASSOCIATE: u8 = 0x03;

    pub fn as_u8(self) -> u8 {
        match self {
            Command::Connect => Command::CMD_CONNECT,
            Command::UdpAssociate => Command::CMD_UDP_ASSOCIATE,
        }
    }

    pub fn from_u8(code: u8) -> Option<Command> {
        match code {
            Command::CMD_CONNECT => Some(Command::Connect),
            Command::CMD_UDP_ASSOCIATE => Some(Command::UdpAssociate),
            _ => None,
        }
    }
}

/// Trojan request header
///
/// ```plain
/// +-----+------+----------+----------+------+
/// | KEY | CRLF | CMD      | DST      | CRLF |
/// +-----+------+----------+----------+------+
/// | 56  |  2   | 1        | Variable |  2   |
/// +-----+------+----------+----------+------+
/// ```
#[derive(Clone, Debug)]
pub struct RequestHeader {
    pub key: [u8; KEY_LEN],
    pub command: Command,
    pub address: Address,
}

impl RequestHeader {
    pub fn new(key: [u8; KEY_LEN], command: Command, address: Address) -> RequestHeader {
        RequestHeader { key, command, address }
    }

    /// Read the key only, the rest is read by [`read_after_key`](Self::read_after_key)
    pub async fn read_key<R>(r: &mut R) -> Result<[u8; KEY_LEN], Error>
    where
        R: AsyncRead + Unpin,
    {
        let mut key = [0u8; KEY_LEN];
        r.read_exact(&mut key).await?;
        Ok(key)
    }

    /// Read the rest of the header after a verified key
    pub async fn read_after_key<R>(key: [u8; KEY_LEN], r: &mut R) -> Result<RequestHeader, Error>
    where
        R: AsyncRead + Unpin,
    {
        read_crlf(r).await?;

        let cmd = r.read_u8().await?;
        let command = Command::from_u8(cmd).ok_or(Error::UnsupportedCommand(cmd))?;
        let address = Address::read_from(r).await?;

        read_crlf(r).await?;

        Ok(RequestHeader { key, command, address })
    }

    pub async fn write_to<W>(&self, w: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = BytesMut::with_capacity(self.serialized_len());
        self.write_to_buf(&mut buf);
        w.write_all(&buf).await
    }

    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&self.key);
        buf.put_slice(&CRLF);
        buf.put_u8(self.command.as_u8());
        self.address.write_to_buf(buf);
        buf.put_slice(&CRLF);
    }

    pub fn serialized_len(&self) -> usize {
        KEY_LEN + 2 + 1 + self.address.serialized_len() + 2
    }
}

/// Header of one UDP packet in a `UdpAssociate` stream
///
/// ```plain
/// +----------+--------+------+----------+
/// | ADDR     | LENGTH | CRLF | Payload  |
/// +----------+--------+------+----------+
/// | Variable |   2    |  2   | Variable |
/// +----------+--------+------+----------+
/// ```
#[derive(Clone, Debug)]
pub struct UdpPacketHeader {
    pub address: Address,
    pub length: u16,
}

impl UdpPacketHeader {
    pub async fn read_from<R>(r: &mut R) -> Result<UdpPacketHeader, Error>
    where
        R: AsyncRead + Unpin,
    {
        let address = Address::read_from(r).await?;
        let length = r.read_u16().await?;
        read_crlf(r).await?;
        Ok(UdpPacketHeader { address, length })
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};

    use super::*;
    use crate::relay::trojan::password_to_key;

    #[tokio::test]
    async fn request_header_layout() {
        let addr = Address::SocketAddress(SocketAddr::new(Ipv4Addr::new(1, 2, 3, 4).into(), 443));
        let header = RequestHeader::new(password_to_key("hunter2"), Command::Connect, addr.clone());

        let mut buf = BytesMut::new();
        header.write_to_buf(&mut buf);
        assert_eq!(buf.len(), header.serialized_len());
        assert_eq!(&buf[56..59], b"\r\n\x01");
        assert_eq!(&buf[59..66], &[0x01, 1, 2, 3, 4, 0x01, 0xBB]);
        assert_eq!(&buf[66..], b"\r\n");

        let mut r = &buf[..];
        let key = RequestHeader::read_key(&mut r).await.unwrap();
        let parsed = RequestHeader::read_after_key(key, &mut r).await.unwrap();
        assert_eq!(parsed.command, Command::Connect);
        assert_eq!(parsed.address, addr);
    }

    #[tokio::test]
    async fn missing_crlf() {
        let mut buf = BytesMut::new();
        buf.put_slice(b"\r\x00");
        let err = RequestHeader::read_after_key([b'0'; KEY_LEN], &mut &buf[..])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCrlf(..)));
    }
}
