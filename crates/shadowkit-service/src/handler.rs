//! Boundary between inbound protocols and whatever consumes their connections
//!
//! Every inbound ends its handshake by handing a stream or a packet connection, together with its
//! `Metadata`, to a `ConnectionHandler`. Routing, outbound dialing and accounting belong to the
//! handler.

use std::{
    fmt::{self, Display},
    io,
    net::SocketAddr,
};

use async_trait::async_trait;
use log::error;
use shadowkit::relay::Address;
use tokio::io::{AsyncRead, AsyncWrite};

/// Protocol an inbound connection was accepted with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InboundProtocol {
    Socks4,
    Socks5,
    Http,
    Shadowsocks,
    Trojan,
}

impl InboundProtocol {
    pub fn name(self) -> &'static str {
        match self {
            InboundProtocol::Socks4 => "socks4",
            InboundProtocol::Socks5 => "socks5",
            InboundProtocol::Http => "http",
            InboundProtocol::Shadowsocks => "shadowsocks",
            InboundProtocol::Trojan => "trojan",
        }
    }
}

impl Display for InboundProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Describes an accepted connection
#[derive(Debug, Clone)]
pub struct Metadata {
    pub protocol: InboundProtocol,
    /// Peer address of the inbound connection
    pub source: SocketAddr,
    /// Requested destination. For packet connections, the destination of the first packet, or the
    /// address the client announced
    pub destination: Address,
    /// Authenticated user, if the protocol has users
    pub user: Option<String>,
}

impl Metadata {
    pub fn new(protocol: InboundProtocol, source: SocketAddr, destination: Address) -> Metadata {
        Metadata {
            protocol,
            source,
            destination,
            user: None,
        }
    }

    pub fn with_user<U: Into<String>>(mut self, user: U) -> Metadata {
        self.user = Some(user.into());
        self
    }
}

/// Full-duplex byte stream of an inbound connection
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<S> ProxyStream for S where S: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxProxyStream = Box<dyn ProxyStream>;

/// Datagram side of an inbound connection
///
/// `read_packet` and `write_packet` may run concurrently.
#[async_trait]
pub trait PacketConn: Send + Sync {
    /// Receive the next datagram into `buf`, returns its length and destination
    ///
    /// `Ok(None)` once the association is closed by the client.
    async fn read_packet(&self, buf: &mut [u8]) -> io::Result<Option<(usize, Address)>>;

    /// Send `payload` back to the client as coming from `source`
    async fn write_packet(&self, payload: &[u8], source: &Address) -> io::Result<()>;
}

pub type BoxPacketConn = Box<dyn PacketConn>;

/// Consumer of accepted connections
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    /// Serve a TCP-like connection until it ends
    async fn new_connection(&self, stream: BoxProxyStream, metadata: Metadata) -> io::Result<()>;

    /// Serve a packet connection until it ends
    async fn new_packet_connection(&self, conn: BoxPacketConn, metadata: Metadata) -> io::Result<()>;

    /// Non-fatal errors of inbounds, handshake failures and errors returned by the methods above
    fn handle_error(&self, metadata: Option<&Metadata>, err: io::Error) {
        match metadata {
            Some(m) => error!("{} connection {} -> {} error: {}", m.protocol, m.source, m.destination, err),
            None => error!("inbound error: {}", err),
        }
    }
}
