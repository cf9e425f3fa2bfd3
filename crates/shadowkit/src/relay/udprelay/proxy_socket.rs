//! Shadowsocks UDP socket, either end of the association

use std::{io, net::SocketAddr};

use bytes::BytesMut;
use log::{trace, warn};

use crate::{
    config::ServerConfig,
    context::SharedContext,
    crypto::CipherKind,
    net::{resolve_address, ConnectOpts, UdpSocket},
    relay::{tcprelay::Role, Address},
};

use super::{
    codec::{PacketCodec, ProtocolError},
    options::UdpSocketControlData,
};

/// Room for the nonce, the address, 2022 headers and the tag in front of and behind a payload
const PACKET_OVERHEAD: usize = 256;

#[derive(thiserror::Error, Debug)]
pub enum ProxySocketError {
    #[error(transparent)]
    IoError(#[from] io::Error),
    #[error(transparent)]
    ProtocolError(ProtocolError),
    #[error("peer: {0}, {1}")]
    ProtocolErrorWithPeer(SocketAddr, ProtocolError),
}

impl ProxySocketError {
    /// The protocol error, if a packet was received but rejected
    pub fn protocol_error(&self) -> Option<&ProtocolError> {
        match *self {
            ProxySocketError::IoError(..) => None,
            ProxySocketError::ProtocolError(ref err) | ProxySocketError::ProtocolErrorWithPeer(_, ref err) => Some(err),
        }
    }
}

impl From<ProxySocketError> for io::Error {
    fn from(e: ProxySocketError) -> io::Error {
        match e {
            ProxySocketError::IoError(e) => e,
            _ => io::Error::other(e),
        }
    }
}

pub type ProxySocketResult<T> = Result<T, ProxySocketError>;

/// UDP socket speaking the Shadowsocks packet protocol
///
/// A client socket is connected to its server and sends requests. A server socket is bound to the
/// server address and answers whichever peer it received from.
#[derive(Debug)]
pub struct ProxySocket {
    socket: UdpSocket,
    codec: PacketCodec,
    context: SharedContext,
}

impl ProxySocket {
    /// Client socket connected to the server of `svr_cfg`
    pub async fn connect(context: SharedContext, svr_cfg: &ServerConfig) -> ProxySocketResult<ProxySocket> {
        ProxySocket::connect_with_opts(context, svr_cfg, &ConnectOpts::default()).await
    }

    pub async fn connect_with_opts(
        context: SharedContext,
        svr_cfg: &ServerConfig,
        opts: &ConnectOpts,
    ) -> ProxySocketResult<ProxySocket> {
        let socket = UdpSocket::connect_remote_with_opts(svr_cfg.addr(), opts).await?;
        trace!("udp socket connected to {} server {}", svr_cfg.method(), svr_cfg.addr());

        Ok(ProxySocket::from_socket(Role::Client, context, svr_cfg, socket))
    }

    /// Server socket bound to the address of `svr_cfg`
    pub async fn bind(context: SharedContext, svr_cfg: &ServerConfig) -> ProxySocketResult<ProxySocket> {
        let bind_addr = resolve_address(svr_cfg.addr()).await?;
        let socket = UdpSocket::bind(&bind_addr).await?;
        Ok(ProxySocket::from_socket(Role::Server, context, svr_cfg, socket))
    }

    pub fn from_socket(role: Role, context: SharedContext, svr_cfg: &ServerConfig, socket: UdpSocket) -> ProxySocket {
        ProxySocket {
            socket,
            codec: PacketCodec::new(role, svr_cfg),
            context,
        }
    }

    pub fn method(&self) -> CipherKind {
        self.codec.method()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn encode(&self, addr: &Address, control: &UdpSocketControlData, payload: &[u8]) -> BytesMut {
        if let Some(ref user) = control.user {
            trace!("udp packet to {} sealed for user {}", addr, user.name());
        }

        let mut packet = BytesMut::with_capacity(payload.len() + PACKET_OVERHEAD);
        self.codec.encode(&self.context, addr, control, payload, &mut packet);
        packet
    }

    fn check_sent(&self, packet: &[u8], sent: usize) -> usize {
        if sent != packet.len() {
            warn!("udp {:?} socket sent {} of {} bytes", self.codec.role(), sent, packet.len());
        }
        sent
    }

    /// Send `payload` for `addr` to the connected server
    pub async fn send(&self, addr: &Address, payload: &[u8]) -> ProxySocketResult<usize> {
        self.send_with_ctrl(addr, &UdpSocketControlData::default(), payload).await
    }

    pub async fn send_with_ctrl(
        &self,
        addr: &Address,
        control: &UdpSocketControlData,
        payload: &[u8],
    ) -> ProxySocketResult<usize> {
        let packet = self.encode(addr, control, payload);
        trace!("udp send {} bytes for {}, {:?}", payload.len(), addr, control);

        let sent = self.socket.send(&packet).await?;
        Ok(self.check_sent(&packet, sent))
    }

    /// Send `payload` from `addr` to the peer `target`
    pub async fn send_to(&self, target: SocketAddr, addr: &Address, payload: &[u8]) -> ProxySocketResult<usize> {
        self.send_to_with_ctrl(target, addr, &UdpSocketControlData::default(), payload)
            .await
    }

    pub async fn send_to_with_ctrl(
        &self,
        target: SocketAddr,
        addr: &Address,
        control: &UdpSocketControlData,
        payload: &[u8],
    ) -> ProxySocketResult<usize> {
        let packet = self.encode(addr, control, payload);
        trace!("udp send {} bytes from {} to {}, {:?}", payload.len(), addr, target, control);

        let sent = self.socket.send_to(&packet, target).await?;
        Ok(self.check_sent(&packet, sent))
    }

    /// Receive from the connected server
    ///
    /// `recv_buf` has to hold a whole packet, the payload is moved to its front. Returns the
    /// payload length, its address and the packet length.
    pub async fn recv(&self, recv_buf: &mut [u8]) -> ProxySocketResult<(usize, Address, usize)> {
        let (n, addr, packet_len, _) = self.recv_with_ctrl(recv_buf).await?;
        Ok((n, addr, packet_len))
    }

    pub async fn recv_with_ctrl(
        &self,
        recv_buf: &mut [u8],
    ) -> ProxySocketResult<(usize, Address, usize, Option<UdpSocketControlData>)> {
        let packet_len = self.socket.recv(recv_buf).await?;

        let (n, addr, control) = self
            .codec
            .decode(&mut recv_buf[..packet_len])
            .map_err(ProxySocketError::ProtocolError)?;
        trace!("udp recv {} bytes for {}, {:?}", n, addr, control);

        Ok((n, addr, packet_len, control))
    }

    /// Receive from any peer, returns the payload length, the peer, the payload's address and the
    /// packet length
    pub async fn recv_from(&self, recv_buf: &mut [u8]) -> ProxySocketResult<(usize, SocketAddr, Address, usize)> {
        let (n, peer_addr, addr, packet_len, _) = self.recv_from_with_ctrl(recv_buf).await?;
        Ok((n, peer_addr, addr, packet_len))
    }

    #[allow(clippy::type_complexity)]
    pub async fn recv_from_with_ctrl(
        &self,
        recv_buf: &mut [u8],
    ) -> ProxySocketResult<(usize, SocketAddr, Address, usize, Option<UdpSocketControlData>)> {
        let (packet_len, peer_addr) = self.socket.recv_from(recv_buf).await?;

        let (n, addr, control) = self
            .codec
            .decode(&mut recv_buf[..packet_len])
            .map_err(|err| ProxySocketError::ProtocolErrorWithPeer(peer_addr, err))?;
        trace!("udp recv {} bytes from {} for {}, {:?}", n, peer_addr, addr, control);

        Ok((n, peer_addr, addr, packet_len, control))
    }
}
