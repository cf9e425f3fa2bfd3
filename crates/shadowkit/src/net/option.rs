//! Options for inbound and outbound sockets

use std::{net::IpAddr, time::Duration};

/// Options for TCP sockets
#[derive(Debug, Clone, Default)]
pub struct TcpSocketOpts {
    /// `TCP_NODELAY`
    pub nodelay: bool,
}

/// Options for connecting to remote server
#[derive(Debug, Clone, Default)]
pub struct ConnectOpts {
    /// Outbound socket binds to this IP address, mostly for choosing network interfaces
    ///
    /// It only affects sockets that trying to connect to addresses with the same family
    pub bind_local_addr: Option<IpAddr>,

    /// Give up connecting after this long
    pub connect_timeout: Option<Duration>,

    /// TCP options
    pub tcp: TcpSocketOpts,
}

/// Inbound connection options
#[derive(Clone, Debug, Default)]
pub struct AcceptOpts {
    /// TCP options
    pub tcp: TcpSocketOpts,
}
