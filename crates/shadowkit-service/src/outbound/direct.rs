//! Outbound connecting destinations directly

use std::{
    io::{self, ErrorKind},
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    time::Duration,
};

use async_trait::async_trait;
use futures::future::{self, Either};
use log::{debug, trace, warn};
use shadowkit::{
    net::{resolve_address, ConnectOpts, TcpStream as OutboundTcpStream, UdpSocket as OutboundUdpSocket},
    relay::{tcprelay::utils::copy_bidirectional, udprelay::MAXIMUM_UDP_PAYLOAD_SIZE, Address},
};
use tokio::time;

use crate::{
    handler::{BoxPacketConn, BoxProxyStream, ConnectionHandler, Metadata, PacketConn},
    DEFAULT_UDP_EXPIRY_DURATION,
};

/// Dials destinations from this host and relays in both directions
#[derive(Debug, Clone)]
pub struct DirectHandler {
    connect_opts: ConnectOpts,
    udp_expiry_duration: Duration,
}

impl Default for DirectHandler {
    fn default() -> DirectHandler {
        DirectHandler::new()
    }
}

impl DirectHandler {
    pub fn new() -> DirectHandler {
        DirectHandler {
            connect_opts: ConnectOpts::default(),
            udp_expiry_duration: DEFAULT_UDP_EXPIRY_DURATION,
        }
    }

    pub fn set_connect_opts(&mut self, opts: ConnectOpts) {
        self.connect_opts = opts;
    }

    /// Packet connections end after no packet was read from the client for `d`
    pub fn set_udp_expiry_duration(&mut self, d: Duration) {
        self.udp_expiry_duration = d;
    }
}

/// Outbound UDP sockets of one packet connection
struct OutboundSockets {
    ipv4: OutboundUdpSocket,
    ipv6: Option<OutboundUdpSocket>,
}

impl OutboundSockets {
    async fn bind() -> io::Result<OutboundSockets> {
        let ipv4 = OutboundUdpSocket::bind(&SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0)).await?;
        let ipv6 = match OutboundUdpSocket::bind(&SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0)).await {
            Ok(s) => Some(s),
            Err(err) => {
                debug!("udp outbound ipv6 socket unavailable, error: {}", err);
                None
            }
        };
        Ok(OutboundSockets { ipv4, ipv6 })
    }

    async fn send_to(&self, payload: &[u8], target: SocketAddr) -> io::Result<usize> {
        match target {
            SocketAddr::V4(..) => self.ipv4.send_to(payload, target).await,
            SocketAddr::V6(..) => match self.ipv6 {
                Some(ref s) => s.send_to(payload, target).await,
                None => Err(io::Error::new(ErrorKind::AddrNotAvailable, "ipv6 outbound is not available")),
            },
        }
    }

    async fn recv_from(&self, ipv4_buf: &mut [u8], ipv6_buf: &mut [u8]) -> io::Result<(usize, SocketAddr, bool)> {
        let ipv4 = async { self.ipv4.recv_from(ipv4_buf).await.map(|(n, a)| (n, a, true)) };
        let ipv6 = async {
            match self.ipv6 {
                Some(ref s) => s.recv_from(ipv6_buf).await.map(|(n, a)| (n, a, false)),
                None => future::pending().await,
            }
        };

        tokio::pin!(ipv4);
        tokio::pin!(ipv6);

        match future::select(ipv4, ipv6).await {
            Either::Left((r, ..)) | Either::Right((r, ..)) => r,
        }
    }
}

#[async_trait]
impl ConnectionHandler for DirectHandler {
    async fn new_connection(&self, mut stream: BoxProxyStream, metadata: Metadata) -> io::Result<()> {
        let mut remote = OutboundTcpStream::connect_remote_with_opts(&metadata.destination, &self.connect_opts).await?;

        debug!(
            "{} tcp tunnel {} <-> {} established",
            metadata.protocol, metadata.source, metadata.destination
        );

        match copy_bidirectional(&mut stream, &mut remote).await {
            Ok((rn, wn)) => {
                trace!(
                    "tcp tunnel {} <-> {} closed, L2R {} bytes, R2L {} bytes",
                    metadata.source,
                    metadata.destination,
                    rn,
                    wn
                );
            }
            Err(err) => {
                trace!(
                    "tcp tunnel {} <-> {} closed with error: {}",
                    metadata.source,
                    metadata.destination,
                    err
                );
            }
        }

        Ok(())
    }

    async fn new_packet_connection(&self, conn: BoxPacketConn, metadata: Metadata) -> io::Result<()> {
        let outbound = OutboundSockets::bind().await?;

        debug!("{} udp association {} established", metadata.protocol, metadata.source);

        let l2r = self.relay_to_remote(&*conn, &outbound, &metadata);
        let r2l = relay_to_client(&*conn, &outbound, &metadata);

        tokio::pin!(l2r);
        tokio::pin!(r2l);

        let result = match future::select(l2r, r2l).await {
            Either::Left((r, ..)) => r,
            Either::Right((r, ..)) => r,
        };

        debug!("{} udp association {} closed", metadata.protocol, metadata.source);
        result
    }
}

impl DirectHandler {
    async fn relay_to_remote(
        &self,
        conn: &dyn PacketConn,
        outbound: &OutboundSockets,
        metadata: &Metadata,
    ) -> io::Result<()> {
        let mut buffer = vec![0u8; MAXIMUM_UDP_PAYLOAD_SIZE];
        loop {
            let (n, target_addr) = match time::timeout(self.udp_expiry_duration, conn.read_packet(&mut buffer)).await {
                Ok(Ok(Some(p))) => p,
                Ok(Ok(None)) => {
                    trace!("udp association {} closed by client", metadata.source);
                    return Ok(());
                }
                Ok(Err(err)) => return Err(err),
                Err(..) => {
                    trace!("udp association {} expired", metadata.source);
                    return Ok(());
                }
            };

            let target = match target_addr {
                Address::SocketAddress(sa) => sa,
                Address::DomainNameAddress(..) => match resolve_address(&target_addr).await {
                    Ok(sa) => sa,
                    Err(err) => {
                        warn!(
                            "udp relay {} -> {} resolve failed, error: {}",
                            metadata.source, target_addr, err
                        );
                        continue;
                    }
                },
            };

            match outbound.send_to(&buffer[..n], target).await {
                Ok(sn) if sn != n => {
                    warn!(
                        "udp relay {} -> {} sent {} bytes != expected {} bytes",
                        metadata.source, target, sn, n
                    );
                }
                Ok(..) => trace!("udp relay {} -> {} with {} bytes", metadata.source, target_addr, n),
                Err(err) => warn!("udp relay {} -> {} failed, error: {}", metadata.source, target_addr, err),
            }
        }
    }
}

async fn relay_to_client(conn: &dyn PacketConn, outbound: &OutboundSockets, metadata: &Metadata) -> io::Result<()> {
    let mut ipv4_buffer = vec![0u8; MAXIMUM_UDP_PAYLOAD_SIZE];
    let mut ipv6_buffer = vec![0u8; MAXIMUM_UDP_PAYLOAD_SIZE];
    loop {
        let (n, source, is_ipv4) = outbound.recv_from(&mut ipv4_buffer, &mut ipv6_buffer).await?;
        let payload = if is_ipv4 { &ipv4_buffer[..n] } else { &ipv6_buffer[..n] };

        trace!("udp relay {} <- {} with {} bytes", metadata.source, source, n);
        conn.write_packet(payload, &Address::from(source)).await?;
    }
}
