//! SOCKS5 server

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use log::{debug, error, info};
use shadowkit::net::TcpListener;
use tokio::time;

use crate::{config::SocksInboundConfig, server::context::ServiceContext};

use super::tcprelay::Socks5TcpHandler;

/// SOCKS5 TCP server instance
pub struct Socks5Server {
    context: Arc<ServiceContext>,
    listener: TcpListener,
    handler: Socks5TcpHandler,
}

impl Socks5Server {
    pub async fn new(context: Arc<ServiceContext>, config: &SocksInboundConfig) -> io::Result<Socks5Server> {
        let listener = TcpListener::bind_with_opts(&config.listen, context.accept_opts().clone()).await?;
        let handler = Socks5TcpHandler::new(
            context.clone(),
            config.auth.clone(),
            config.mode,
            config.udp_bind_addr,
        );
        Ok(Socks5Server {
            context,
            listener,
            handler,
        })
    }

    /// Get TCP server local addr
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Start TCP accept loop
    pub async fn run(self) -> io::Result<()> {
        info!("socks5 server listening on {}", self.listener.local_addr()?);

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(s) => s,
                Err(err) => {
                    error!("accept failed with error: {}", err);
                    time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let local_addr = match stream.local_addr() {
                Ok(a) => a,
                Err(err) => {
                    debug!("socks5 client {} local_addr failed, error: {}", peer_addr, err);
                    continue;
                }
            };

            let context = self.context.clone();
            let handler = self.handler.clone();
            tokio::spawn(async move {
                if let Err(err) = handler.handle_socks5_client(stream, peer_addr, local_addr).await {
                    debug!("socks5 tcp client {} handler error: {}", peer_addr, err);
                    context.handler().handle_error(None, err);
                }
            });
        }
    }
}
