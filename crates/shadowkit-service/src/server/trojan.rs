//! Trojan server
//!
//! `TrojanServer::run` accepts plain TCP connections, which is only useful behind a TLS terminating
//! proxy or in tests. Servers doing TLS themselves pass their TLS streams to `serve_stream`.

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use log::{debug, error, info, trace};
use shadowkit::{
    net::TcpListener,
    relay::trojan::{Command, TrojanUserManager},
    TrojanAcceptor,
    TrojanUdpStream,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    time,
};

use crate::{
    handler::{InboundProtocol, Metadata},
    stream_packet::StreamPacketConn,
};

use super::context::ServiceContext;

/// Trojan inbound
pub struct TrojanServer {
    context: Arc<ServiceContext>,
    acceptor: TrojanAcceptor,
    listener: TcpListener,
}

impl TrojanServer {
    pub async fn new(
        context: Arc<ServiceContext>,
        listen: &SocketAddr,
        users: Arc<TrojanUserManager>,
    ) -> io::Result<TrojanServer> {
        let listener = TcpListener::bind_with_opts(listen, context.accept_opts().clone()).await?;
        Ok(TrojanServer {
            context,
            acceptor: TrojanAcceptor::new(users),
            listener,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> io::Result<()> {
        info!("trojan server listening on {}", self.listener.local_addr()?);

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(s) => s,
                Err(err) => {
                    error!("trojan server accept failed with error: {}", err);
                    time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let context = self.context.clone();
            let acceptor = self.acceptor.clone();
            tokio::spawn(async move { serve_stream(&context, &acceptor, stream, peer_addr).await });
        }
    }
}

/// Serve one Trojan connection already unwrapped from TLS
///
/// Connections with unknown keys or malformed requests are closed without a response.
pub async fn serve_stream<S>(context: &ServiceContext, acceptor: &TrojanAcceptor, stream: S, peer_addr: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
{
    let inbound = match acceptor.accept(stream).await {
        Ok(i) => i,
        Err(err) => {
            debug!("trojan client {} rejected, error: {}", peer_addr, err);
            context.handler().handle_error(None, err.into());
            return;
        }
    };

    let metadata =
        Metadata::new(InboundProtocol::Trojan, peer_addr, inbound.address).with_user(inbound.user.name());
    let handler = context.handler();

    let result = match inbound.command {
        Command::Connect => {
            trace!("trojan client {} connect {}", peer_addr, metadata.destination);
            handler.new_connection(Box::new(inbound.stream), metadata.clone()).await
        }
        Command::UdpAssociate => {
            trace!("trojan client {} udp associate {}", peer_addr, metadata.destination);
            let (reader, writer) = TrojanUdpStream::from_stream(inbound.stream).into_split();
            let conn = StreamPacketConn::new(reader, writer);
            handler.new_packet_connection(Box::new(conn), metadata.clone()).await
        }
    };

    if let Err(err) = result {
        handler.handle_error(Some(&metadata), err);
    }
}
