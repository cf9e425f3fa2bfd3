//! Datagrams framed on a stream
//!
//! Trojan `UdpAssociate` and UDP over TCP both carry address-prefixed datagrams on a TCP-like
//! stream. [`StreamPacketConn`] turns the two halves of such a stream into a [`PacketConn`] for
//! inbounds, [`relay_packets`] pumps an inbound [`PacketConn`] through one for outbounds.

use std::io;

use async_trait::async_trait;
use futures::future::{self, Either};
use log::warn;
use shadowkit::{
    relay::{trojan, udprelay::MAXIMUM_UDP_PAYLOAD_SIZE, uot, Address},
    TrojanUdpStream,
    UotStream,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::Mutex,
};

use crate::handler::PacketConn;

/// Receiving half of a framed datagram stream
#[async_trait]
pub trait PacketReader: Send {
    /// Next datagram, `Ok(None)` when the stream ends between two datagrams
    ///
    /// Datagrams larger than `buf` are dropped.
    async fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, Address)>>;
}

/// Sending half of a framed datagram stream
#[async_trait]
pub trait PacketWriter: Send {
    async fn write_packet(&mut self, addr: &Address, payload: &[u8]) -> io::Result<()>;

    async fn shutdown(&mut self) -> io::Result<()>;
}

#[async_trait]
impl<S> PacketReader for UotStream<S>
where
    S: AsyncRead + Unpin + Send,
{
    async fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, Address)>> {
        loop {
            match UotStream::read_packet(self, buf).await {
                Err(uot::Error::FrameTooLarge(n, cap)) => warn!("UoT frame of {} bytes dropped, buffer has {}", n, cap),
                r => return r.map_err(Into::into),
            }
        }
    }
}

#[async_trait]
impl<S> PacketWriter for UotStream<S>
where
    S: AsyncWrite + Unpin + Send,
{
    async fn write_packet(&mut self, addr: &Address, payload: &[u8]) -> io::Result<()> {
        UotStream::write_packet(self, addr, payload).await
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        UotStream::shutdown(self).await
    }
}

#[async_trait]
impl<S> PacketReader for TrojanUdpStream<S>
where
    S: AsyncRead + Unpin + Send,
{
    async fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, Address)>> {
        loop {
            match TrojanUdpStream::read_packet(self, buf).await {
                Err(trojan::Error::PacketTooLarge(n, cap)) => {
                    warn!("trojan packet of {} bytes dropped, buffer has {}", n, cap)
                }
                r => return r.map_err(Into::into),
            }
        }
    }
}

#[async_trait]
impl<S> PacketWriter for TrojanUdpStream<S>
where
    S: AsyncWrite + Unpin + Send,
{
    async fn write_packet(&mut self, addr: &Address, payload: &[u8]) -> io::Result<()> {
        TrojanUdpStream::write_packet(self, addr, payload).await
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        TrojanUdpStream::shutdown(self).await
    }
}

/// [`PacketConn`] of an inbound whose client sends framed datagrams
pub struct StreamPacketConn<R, W> {
    reader: Mutex<R>,
    writer: Mutex<W>,
}

impl<R, W> StreamPacketConn<R, W> {
    pub fn new(reader: R, writer: W) -> StreamPacketConn<R, W> {
        StreamPacketConn {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait]
impl<R, W> PacketConn for StreamPacketConn<R, W>
where
    R: PacketReader,
    W: PacketWriter,
{
    async fn read_packet(&self, buf: &mut [u8]) -> io::Result<Option<(usize, Address)>> {
        self.reader.lock().await.read_packet(buf).await
    }

    async fn write_packet(&self, payload: &[u8], source: &Address) -> io::Result<()> {
        self.writer.lock().await.write_packet(source, payload).await
    }
}

/// Relay datagrams between an inbound `conn` and a framed stream to the server
///
/// Ends when either side closes or fails.
pub async fn relay_packets<R, W>(conn: &dyn PacketConn, mut reader: R, mut writer: W) -> io::Result<()>
where
    R: PacketReader,
    W: PacketWriter,
{
    let l2r = async {
        let mut buffer = vec![0u8; MAXIMUM_UDP_PAYLOAD_SIZE];
        while let Some((n, target_addr)) = conn.read_packet(&mut buffer).await? {
            writer.write_packet(&target_addr, &buffer[..n]).await?;
        }
        writer.shutdown().await
    };

    let r2l = async {
        let mut buffer = vec![0u8; MAXIMUM_UDP_PAYLOAD_SIZE];
        while let Some((n, addr)) = reader.read_packet(&mut buffer).await? {
            conn.write_packet(&buffer[..n], &addr).await?;
        }
        Ok(())
    };

    tokio::pin!(l2r);
    tokio::pin!(r2l);

    match future::select(l2r, r2l).await {
        Either::Left((r, ..)) => r,
        Either::Right((r, ..)) => r,
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};

    use super::*;

    fn dns() -> Address {
        Address::SocketAddress(SocketAddr::new(Ipv4Addr::new(9, 9, 9, 9).into(), 53))
    }

    #[tokio::test]
    async fn oversized_datagram_is_dropped() {
        let (client, server) = tokio::io::duplex(4096);
        let (server_r, server_w) = UotStream::new(server).into_split();
        let conn = StreamPacketConn::new(server_r, server_w);

        let mut client = UotStream::new(client);
        client.write_packet(&dns(), &[0u8; 100]).await.unwrap();
        client.write_packet(&dns(), b"query").await.unwrap();

        let mut buf = [0u8; 64];
        let (n, addr) = conn.read_packet(&mut buf).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"query");
        assert_eq!(addr, dns());

        conn.write_packet(b"answer", &dns()).await.unwrap();
        let (n, _) = client.read_packet(&mut buf).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"answer");

        client.shutdown().await.unwrap();
        assert!(conn.read_packet(&mut buf).await.unwrap().is_none());
    }
}
