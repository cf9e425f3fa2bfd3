//! Outbound through a Trojan server
//!
//! Connections to the server are plain TCP. Wrap this handler's logic with a TLS connector when
//! talking to a real deployment.

use std::io;

use async_trait::async_trait;
use log::{debug, trace};
use shadowkit::{
    crypto::CipherKind,
    net::{ConnectOpts, TcpStream},
    relay::{
        trojan::{password_to_key, KEY_LEN},
        Address,
    },
    TrojanClientStream,
    TrojanUdpStream,
};

use crate::{
    handler::{BoxPacketConn, BoxProxyStream, ConnectionHandler, Metadata},
    stream_packet::relay_packets,
    utils::establish_tcp_tunnel,
};

/// Tunnels connections through a Trojan server
pub struct TrojanHandler {
    server_addr: Address,
    key: [u8; KEY_LEN],
    connect_opts: ConnectOpts,
}

impl TrojanHandler {
    pub fn new<A>(server_addr: A, password: &str) -> TrojanHandler
    where
        A: Into<Address>,
    {
        TrojanHandler {
            server_addr: server_addr.into(),
            key: password_to_key(password),
            connect_opts: ConnectOpts::default(),
        }
    }

    pub fn set_connect_opts(&mut self, opts: ConnectOpts) {
        self.connect_opts = opts;
    }

    pub fn server_addr(&self) -> &Address {
        &self.server_addr
    }
}

#[async_trait]
impl ConnectionHandler for TrojanHandler {
    async fn new_connection(&self, mut stream: BoxProxyStream, metadata: Metadata) -> io::Result<()> {
        let remote = TcpStream::connect_remote_with_opts(&self.server_addr, &self.connect_opts).await?;
        let mut remote = TrojanClientStream::from_stream(remote, self.key, metadata.destination.clone());

        trace!(
            "tcp tunnel {} -> {} through trojan server {}",
            metadata.source,
            metadata.destination,
            self.server_addr
        );

        establish_tcp_tunnel(
            CipherKind::NONE,
            &mut stream,
            &mut remote,
            metadata.source,
            &metadata.destination,
        )
        .await
    }

    async fn new_packet_connection(&self, conn: BoxPacketConn, metadata: Metadata) -> io::Result<()> {
        let remote = TcpStream::connect_remote_with_opts(&self.server_addr, &self.connect_opts).await?;
        let remote = TrojanUdpStream::connect(remote, self.key, metadata.destination.clone()).await?;
        let (reader, writer) = remote.into_split();

        debug!(
            "udp association {} through trojan server {}",
            metadata.source, self.server_addr
        );

        relay_packets(&*conn, reader, writer).await
    }
}
