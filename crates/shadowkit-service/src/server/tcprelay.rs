//! Shadowsocks TCP server

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use log::{debug, error, info, trace, warn};
use shadowkit::{
    net::TcpListener,
    relay::{tcprelay::ProxyServerStream, uot::is_uot_destination},
    ProxyListener,
    ServerConfig,
    UotStream,
};
use tokio::{net::TcpStream as TokioTcpStream, time};

use crate::{
    handler::{InboundProtocol, Metadata},
    stream_packet::StreamPacketConn,
    utils::ignore_until_end,
};

use super::context::ServiceContext;

/// Accepts Shadowsocks TCP connections and hands them to the `ConnectionHandler`
///
/// Requests for the UoT destination become packet connections if the server relays UDP.
pub struct TcpServer {
    context: Arc<ServiceContext>,
    listener: ProxyListener,
    udp_over_tcp: bool,
}

impl TcpServer {
    pub async fn new(context: Arc<ServiceContext>, svr_cfg: &ServerConfig) -> io::Result<TcpServer> {
        let listener = TcpListener::bind_remote_with_opts(svr_cfg.addr(), context.accept_opts().clone()).await?;
        let listener = ProxyListener::from_listener(context.context(), listener, svr_cfg);
        Ok(TcpServer {
            context,
            listener,
            udp_over_tcp: svr_cfg.mode().enable_udp(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> io::Result<()> {
        info!("shadowsocks tcp server listening on {}", self.listener.local_addr()?);

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(s) => s,
                Err(err) => {
                    error!("tcp server accept failed with error: {}", err);
                    time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let client = TcpServerClient {
                context: self.context.clone(),
                peer_addr,
                stream,
                udp_over_tcp: self.udp_over_tcp,
            };

            tokio::spawn(async move {
                if let Err(err) = client.serve().await {
                    debug!("tcp server stream aborted with error: {}", err);
                }
            });
        }
    }
}

struct TcpServerClient {
    context: Arc<ServiceContext>,
    peer_addr: SocketAddr,
    stream: ProxyServerStream<TokioTcpStream>,
    udp_over_tcp: bool,
}

impl TcpServerClient {
    async fn serve(mut self) -> io::Result<()> {
        let target_addr = match self.stream.handshake().await {
            Ok(a) => a,
            Err(err) => {
                warn!(
                    "handshake failed, maybe wrong method or key, or under replay attacks. peer: {}, error: {}",
                    self.peer_addr, err
                );
                self.context.handler().handle_error(None, err);

                // The socket stays open until the client closes it. Reads of the stream itself
                // would only repeat the handshake error, so drain the socket underneath.
                let _ = ignore_until_end(self.stream.get_mut()).await;
                return Ok(());
            }
        };

        trace!(
            "accepted tcp client connection {}, requesting {}",
            self.peer_addr,
            target_addr
        );

        let mut metadata = Metadata::new(InboundProtocol::Shadowsocks, self.peer_addr, target_addr);
        if let Some(user) = self.stream.user() {
            metadata = metadata.with_user(user.name());
        }

        let handler = self.context.handler().clone();
        let result = if is_uot_destination(&metadata.destination) {
            if !self.udp_over_tcp {
                warn!("UoT request from {} refused, UDP is disabled", self.peer_addr);
                return Ok(());
            }

            trace!("UoT association from {}", self.peer_addr);
            let (reader, writer) = UotStream::new(self.stream).into_split();
            let conn = StreamPacketConn::new(reader, writer);
            handler.new_packet_connection(Box::new(conn), metadata.clone()).await
        } else {
            handler.new_connection(Box::new(self.stream), metadata.clone()).await
        };

        if let Err(err) = result {
            handler.handle_error(Some(&metadata), err);
        }

        Ok(())
    }
}
