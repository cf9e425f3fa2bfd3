//! SOCKS5 UDP ASSOCIATE relay

use std::{
    io::{self, ErrorKind},
    net::SocketAddr,
};

use async_trait::async_trait;
use byte_string::ByteStr;
use bytes::{BufMut, BytesMut};
use log::{trace, warn};
use shadowkit::{
    net::UdpSocket,
    relay::socks5::{Address, UdpAssociateHeader},
};
use spin::Mutex as SpinMutex;

use crate::handler::PacketConn;

/// Packet connection over the UDP socket of one association
///
/// The first client address that sends a valid datagram owns the association, datagrams from any
/// other address are dropped.
pub struct Socks5UdpPacketConn {
    socket: UdpSocket,
    client_addr: SpinMutex<Option<SocketAddr>>,
}

impl Socks5UdpPacketConn {
    pub fn new(socket: UdpSocket) -> Socks5UdpPacketConn {
        Socks5UdpPacketConn {
            socket,
            client_addr: SpinMutex::new(None),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn accept_peer(&self, peer_addr: SocketAddr) -> bool {
        let mut client_addr = self.client_addr.lock();
        match *client_addr {
            Some(addr) => addr == peer_addr,
            None => {
                *client_addr = Some(peer_addr);
                true
            }
        }
    }
}

#[async_trait]
impl PacketConn for Socks5UdpPacketConn {
    async fn read_packet(&self, buf: &mut [u8]) -> io::Result<Option<(usize, Address)>> {
        loop {
            let (n, peer_addr) = self.socket.recv_from(buf).await?;

            let (header, header_len) = match UdpAssociateHeader::decode(&buf[..n]) {
                Ok(h) => h,
                Err(err) => {
                    warn!(
                        "socks5 udp packet from {} is invalid, error: {}, packet: {:?}",
                        peer_addr,
                        err,
                        ByteStr::new(&buf[..n])
                    );
                    continue;
                }
            };

            if header.frag != 0 {
                warn!(
                    "socks5 udp packet from {} is fragmented (frag {}), dropped",
                    peer_addr, header.frag
                );
                continue;
            }

            if !self.accept_peer(peer_addr) {
                trace!("socks5 udp packet from {} is not from the associated client, dropped", peer_addr);
                continue;
            }

            buf.copy_within(header_len..n, 0);

            trace!(
                "socks5 udp {} -> {} with {} bytes",
                peer_addr,
                header.address,
                n - header_len
            );

            return Ok(Some((n - header_len, header.address)));
        }
    }

    async fn write_packet(&self, payload: &[u8], source: &Address) -> io::Result<()> {
        let client_addr = match *self.client_addr.lock() {
            Some(a) => a,
            None => return Err(io::Error::new(ErrorKind::NotConnected, "socks5 udp client is unknown")),
        };

        let header = UdpAssociateHeader::new(0, source.clone());
        let mut send_buf = BytesMut::with_capacity(header.serialized_len() + payload.len());
        header.write_to_buf(&mut send_buf);
        send_buf.put_slice(payload);

        let n = self.socket.send_to(&send_buf, client_addr).await?;
        if n != send_buf.len() {
            warn!(
                "socks5 udp {} <- {} sent {} bytes != expected {} bytes",
                client_addr,
                source,
                n,
                send_buf.len()
            );
        }

        Ok(())
    }
}
