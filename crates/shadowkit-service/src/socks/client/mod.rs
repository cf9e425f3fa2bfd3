//! SOCKS5 clients

pub use self::{
    tcp_client::{Socks5Credential, Socks5TcpClient},
    udp_client::Socks5UdpClient,
};

pub mod tcp_client;
pub mod udp_client;
