//! Outbound through a Shadowsocks server
//!
//! UDP goes in Shadowsocks UDP packets by default. With UDP over TCP enabled, an association is
//! one TCP stream to the server's UoT destination, carrying UoT frames.

use std::io;

use async_trait::async_trait;
use futures::future::{self, Either};
use log::{debug, trace, warn};
use shadowkit::{
    config::ServerConfig,
    context::SharedContext,
    net::ConnectOpts,
    relay::{
        tcprelay::ProxyClientStream,
        udprelay::{ClientSession, ProxySocket, ProxySocketError, UdpSocketControlData, MAXIMUM_UDP_PAYLOAD_SIZE},
        uot::uot_destination,
    },
    UotStream,
};
use spin::Mutex as SpinMutex;

use crate::{
    handler::{BoxPacketConn, BoxProxyStream, ConnectionHandler, Metadata, PacketConn},
    stream_packet::relay_packets,
    utils::establish_tcp_tunnel,
};

/// Tunnels connections through a Shadowsocks server
pub struct ShadowsocksHandler {
    context: SharedContext,
    svr_cfg: ServerConfig,
    connect_opts: ConnectOpts,
    udp_over_tcp: bool,
}

impl ShadowsocksHandler {
    /// `context` must be a client (`ServerType::Local`) context
    pub fn new(context: SharedContext, svr_cfg: ServerConfig) -> ShadowsocksHandler {
        ShadowsocksHandler {
            context,
            svr_cfg,
            connect_opts: ConnectOpts::default(),
            udp_over_tcp: false,
        }
    }

    pub fn set_connect_opts(&mut self, opts: ConnectOpts) {
        self.connect_opts = opts;
    }

    /// Carry UDP associations in TCP streams instead of UDP packets
    pub fn set_udp_over_tcp(&mut self, udp_over_tcp: bool) {
        self.udp_over_tcp = udp_over_tcp;
    }

    pub fn server_config(&self) -> &ServerConfig {
        &self.svr_cfg
    }

    async fn relay_udp_over_tcp(&self, conn: BoxPacketConn, metadata: Metadata) -> io::Result<()> {
        let remote = ProxyClientStream::connect_with_opts(
            self.context.clone(),
            &self.svr_cfg,
            uot_destination(),
            &self.connect_opts,
        )
        .await?;
        let (reader, writer) = UotStream::new(remote).into_split();

        debug!(
            "udp association {} over tcp through server {}",
            metadata.source,
            self.svr_cfg.addr()
        );

        relay_packets(&*conn, reader, writer).await
    }
}

#[async_trait]
impl ConnectionHandler for ShadowsocksHandler {
    async fn new_connection(&self, mut stream: BoxProxyStream, metadata: Metadata) -> io::Result<()> {
        let mut remote = ProxyClientStream::connect_with_opts(
            self.context.clone(),
            &self.svr_cfg,
            metadata.destination.clone(),
            &self.connect_opts,
        )
        .await?;

        trace!(
            "tcp tunnel {} -> {} through server {}",
            metadata.source,
            metadata.destination,
            self.svr_cfg.addr()
        );

        establish_tcp_tunnel(
            self.svr_cfg.method(),
            &mut stream,
            &mut remote,
            metadata.source,
            &metadata.destination,
        )
        .await
    }

    async fn new_packet_connection(&self, conn: BoxPacketConn, metadata: Metadata) -> io::Result<()> {
        if self.udp_over_tcp {
            return self.relay_udp_over_tcp(conn, metadata).await;
        }

        let socket = ProxySocket::connect_with_opts(self.context.clone(), &self.svr_cfg, &self.connect_opts).await?;
        let session = SpinMutex::new(ClientSession::new());
        let is_aead_2022 = self.svr_cfg.method().is_aead_2022();

        debug!(
            "udp association {} through server {}, client session {:#x}",
            metadata.source,
            self.svr_cfg.addr(),
            session.lock().client_session_id()
        );

        let l2r = async {
            let mut buffer = vec![0u8; MAXIMUM_UDP_PAYLOAD_SIZE];
            while let Some((n, target_addr)) = conn.read_packet(&mut buffer).await? {
                let control = if is_aead_2022 {
                    session.lock().next_control()
                } else {
                    UdpSocketControlData::default()
                };

                if let Err(err) = socket.send_with_ctrl(&target_addr, &control, &buffer[..n]).await {
                    warn!("udp relay {} -> {} failed, error: {}", metadata.source, target_addr, err);
                }
            }
            Ok::<_, io::Error>(())
        };

        let r2l = relay_to_client(&socket, &*conn, &session, is_aead_2022, &metadata);

        tokio::pin!(l2r);
        tokio::pin!(r2l);

        match future::select(l2r, r2l).await {
            Either::Left((r, ..)) => r,
            Either::Right((r, ..)) => r,
        }
    }
}

async fn relay_to_client(
    socket: &ProxySocket,
    conn: &dyn PacketConn,
    session: &SpinMutex<ClientSession>,
    is_aead_2022: bool,
    metadata: &Metadata,
) -> io::Result<()> {
    let mut buffer = vec![0u8; MAXIMUM_UDP_PAYLOAD_SIZE];
    loop {
        let (n, addr, _, control) = match socket.recv_with_ctrl(&mut buffer).await {
            Ok(r) => r,
            Err(ProxySocketError::IoError(err)) => return Err(err),
            Err(err) => {
                warn!("udp relay {} <- server dropped a packet, error: {}", metadata.source, err);
                continue;
            }
        };

        if is_aead_2022 {
            let checked = match control {
                Some(ref control) => session.lock().check_response(control),
                None => Ok(()),
            };
            if let Err(err) = checked {
                warn!("udp relay {} <- {} dropped a packet, error: {}", metadata.source, addr, err);
                continue;
            }
        }

        conn.write_packet(&buffer[..n], &addr).await?;
    }
}
