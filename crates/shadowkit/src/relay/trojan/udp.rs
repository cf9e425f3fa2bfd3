//! Trojan `UdpAssociate` packet stream

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::relay::{
    framing::{self, Payload},
    Address,
};

use super::{
    protocol::{Command, RequestHeader, UdpPacketHeader, CRLF},
    Error,
    KEY_LEN,
};

/// Datagrams carried in a Trojan stream, one `UdpPacketHeader` in front of each
pub struct TrojanUdpStream<S> {
    stream: S,
}

impl<S> TrojanUdpStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Send a `UdpAssociate` request on `stream`
    pub async fn connect(mut stream: S, key: [u8; KEY_LEN], addr: Address) -> io::Result<TrojanUdpStream<S>> {
        let header = RequestHeader::new(key, Command::UdpAssociate, addr);
        header.write_to(&mut stream).await?;
        Ok(TrojanUdpStream { stream })
    }

    pub fn into_split(self) -> (TrojanUdpStream<ReadHalf<S>>, TrojanUdpStream<WriteHalf<S>>) {
        let (r, w) = tokio::io::split(self.stream);
        (TrojanUdpStream { stream: r }, TrojanUdpStream { stream: w })
    }
}

impl<S> TrojanUdpStream<S> {
    /// Wrap a stream whose request header was already exchanged
    pub fn from_stream(stream: S) -> TrojanUdpStream<S> {
        TrojanUdpStream { stream }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S> TrojanUdpStream<S>
where
    S: AsyncRead + Unpin,
{
    /// Read one packet into `buf`, returns its length and address
    ///
    /// `Ok(None)` if the stream ends between packets. A packet larger than `buf` is skipped and
    /// reported as [`Error::PacketTooLarge`], the stream stays usable.
    pub async fn read_packet(&mut self, buf: &mut [u8]) -> Result<Option<(usize, Address)>, Error> {
        let atyp = match framing::read_frame_start(&mut self.stream).await? {
            Some(atyp) => [atyp],
            None => return Ok(None),
        };

        let mut reader = (&atyp[..]).chain(&mut self.stream);
        let header = UdpPacketHeader::read_from(&mut reader).await?;

        match framing::read_payload(&mut reader, header.length as usize, buf).await? {
            Payload::Read(n) => Ok(Some((n, header.address))),
            Payload::Oversized(n) => Err(Error::PacketTooLarge(n, buf.len())),
        }
    }
}

impl<S> TrojanUdpStream<S>
where
    S: AsyncWrite + Unpin,
{
    /// Write one packet of `payload` with `addr`
    pub async fn write_packet(&mut self, addr: &Address, payload: &[u8]) -> io::Result<()> {
        let frame = framing::encode_frame(addr, &CRLF, payload)?;
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
    use crate::relay::trojan::password_to_key;

    #[tokio::test]
    async fn packets_in_both_directions() {
        let (client, mut server) = tokio::io::duplex(4096);
        let target = Address::SocketAddress(SocketAddr::new(Ipv4Addr::new(8, 8, 8, 8).into(), 53));

        let mut client = TrojanUdpStream::connect(client, password_to_key("p"), target.clone())
            .await
            .unwrap();
        client.write_packet(&target, b"query").await.unwrap();

        let key = RequestHeader::read_key(&mut server).await.unwrap();
        let header = RequestHeader::read_after_key(key, &mut server).await.unwrap();
        assert_eq!(header.command, Command::UdpAssociate);

        let mut server = TrojanUdpStream::from_stream(server);
        let mut buf = [0u8; 64];
        let (n, addr) = server.read_packet(&mut buf).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"query");
        assert_eq!(addr, target);

        server.write_packet(&target, b"answer").await.unwrap();
        let (n, addr) = client.read_packet(&mut buf).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"answer");
        assert_eq!(addr, target);

        server.shutdown().await.unwrap();
        assert!(client.read_packet(&mut buf).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_packet_is_skipped() {
        let target = Address::DomainNameAddress("dns.example".to_owned(), 53);

        let mut wire = Vec::new();
        let mut writer = TrojanUdpStream::from_stream(&mut wire);
        writer.write_packet(&target, b"toolong").await.unwrap();
        writer.write_packet(&target, b"ok").await.unwrap();
        assert_eq!(&wire[15..19], b"\x00\x07\r\n");

        let mut reader = TrojanUdpStream::from_stream(&wire[..]);
        let mut small = [0u8; 2];
        assert!(matches!(
            reader.read_packet(&mut small).await,
            Err(Error::PacketTooLarge(7, 2))
        ));

        let (n, addr) = reader.read_packet(&mut small).await.unwrap().unwrap();
        assert_eq!(&small[..n], b"ok");
        assert_eq!(addr, target);
        assert!(reader.read_packet(&mut small).await.unwrap().is_none());
    }
}
