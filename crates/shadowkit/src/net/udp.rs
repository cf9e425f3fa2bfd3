//! UDP socket wrappers

use std::{
    io::{self, ErrorKind},
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    ops::{Deref, DerefMut},
};

use crate::relay::Address;

use super::{AddrFamily, ConnectOpts};

/// Wrappers for outbound `UdpSocket`
#[derive(Debug)]
pub struct UdpSocket(tokio::net::UdpSocket);

impl UdpSocket {
    /// Connects to proxy target or a server
    pub async fn connect_remote_with_opts(addr: &Address, opts: &ConnectOpts) -> io::Result<UdpSocket> {
        let remote_addr = resolve_address(addr).await?;
        UdpSocket::connect_with_opts(&remote_addr, opts).await
    }

    /// Connects to a socket address
    pub async fn connect_with_opts(addr: &SocketAddr, opts: &ConnectOpts) -> io::Result<UdpSocket> {
        let socket = create_outbound_udp_socket(AddrFamily::from(addr), opts).await?;
        socket.connect(addr).await?;
        Ok(UdpSocket(socket))
    }

    /// Binds to a specific address
    pub async fn bind(addr: &SocketAddr) -> io::Result<UdpSocket> {
        tokio::net::UdpSocket::bind(addr).await.map(UdpSocket)
    }

    /// Binds an unconnected outbound socket of address family `af`
    pub async fn connect_any_with_opts<AF: Into<AddrFamily>>(af: AF, opts: &ConnectOpts) -> io::Result<UdpSocket> {
        create_outbound_udp_socket(af.into(), opts).await.map(UdpSocket)
    }

    /// Send `buf` to `target`, domain names are resolved by the system
    pub async fn send_to_address(&self, buf: &[u8], target: &Address) -> io::Result<usize> {
        match *target {
            Address::SocketAddress(sa) => self.0.send_to(buf, sa).await,
            Address::DomainNameAddress(..) => {
                let sa = resolve_address(target).await?;
                self.0.send_to(buf, sa).await
            }
        }
    }
}

async fn create_outbound_udp_socket(af: AddrFamily, opts: &ConnectOpts) -> io::Result<tokio::net::UdpSocket> {
    let bind_addr = match (af, opts.bind_local_addr) {
        (AddrFamily::Ipv4, Some(IpAddr::V4(ip))) => SocketAddr::new(ip.into(), 0),
        (AddrFamily::Ipv6, Some(IpAddr::V6(ip))) => SocketAddr::new(ip.into(), 0),
        (AddrFamily::Ipv4, ..) => SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0),
        (AddrFamily::Ipv6, ..) => SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0),
    };
    tokio::net::UdpSocket::bind(bind_addr).await
}

/// Resolve `addr` into the first socket address the system returns
pub async fn resolve_address(addr: &Address) -> io::Result<SocketAddr> {
    match *addr {
        Address::SocketAddress(sa) => Ok(sa),
        Address::DomainNameAddress(ref domain, port) => tokio::net::lookup_host((domain.as_str(), port))
            .await?
            .next()
            .ok_or_else(|| io::Error::new(ErrorKind::NotFound, format!("{domain}:{port} resolved to no address"))),
    }
}

impl Deref for UdpSocket {
    type Target = tokio::net::UdpSocket;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for UdpSocket {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<tokio::net::UdpSocket> for UdpSocket {
    fn from(s: tokio::net::UdpSocket) -> Self {
        UdpSocket(s)
    }
}

impl From<UdpSocket> for tokio::net::UdpSocket {
    fn from(s: UdpSocket) -> tokio::net::UdpSocket {
        s.0
    }
}
