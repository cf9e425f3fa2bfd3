//! Wire-compatible Shadowsocks, Trojan and SOCKS5 protocol core
//!
//! The crate implements the wire protocols only. Listeners, handshakes of the SOCKS5 server and
//! connection dispatching live in `shadowkit-service`.

#![crate_type = "lib"]

pub use self::{
    config::{ServerConfig, ServerUser, ServerUserManager},
    context::{Context, SharedContext},
    relay::{
        tcprelay::{ProxyClientStream, ProxyListener, ProxyServerStream},
        trojan::{TrojanAcceptor, TrojanClientStream, TrojanUdpStream},
        udprelay::proxy_socket::ProxySocket,
        uot::UotStream,
        Address,
    },
};

pub mod config;
pub mod context;
pub mod crypto;
pub mod net;
pub mod relay;
pub mod security;
