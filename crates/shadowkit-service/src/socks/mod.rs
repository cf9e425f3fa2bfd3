//! SOCKS inbound, version 5 and on mixed listeners also 4 and 4a

pub use self::{
    server::Socks5Server,
    socks4::Socks4TcpHandler,
    tcprelay::Socks5TcpHandler,
    udprelay::Socks5UdpPacketConn,
};

pub mod client;
pub mod config;
mod server;
pub mod socks4;
mod tcprelay;
mod udprelay;
