//! Network wrappers for connecting and accepting with options

use std::net::SocketAddr;

pub use self::{
    option::{AcceptOpts, ConnectOpts, TcpSocketOpts},
    peek::PeekableStream,
    tcp::{TcpListener, TcpStream},
    udp::{resolve_address, UdpSocket},
};

mod option;
pub mod peek;
pub mod tcp;
pub mod udp;

/// Address family `AF_INET`, `AF_INET6`
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AddrFamily {
    /// `AF_INET`
    Ipv4,
    /// `AF_INET6`
    Ipv6,
}

impl From<&SocketAddr> for AddrFamily {
    fn from(addr: &SocketAddr) -> Self {
        match *addr {
            SocketAddr::V4(..) => Self::Ipv4,
            SocketAddr::V6(..) => Self::Ipv6,
        }
    }
}

impl From<SocketAddr> for AddrFamily {
    fn from(addr: SocketAddr) -> Self {
        AddrFamily::from(&addr)
    }
}
