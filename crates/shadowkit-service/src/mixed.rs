//! Mixed SOCKS and HTTP proxy listener
//!
//! The first byte of a connection picks the protocol: `0x05` is SOCKS5, `0x04` is SOCKS4 or 4a,
//! anything else is passed to the HTTP proxy handler if there is one.

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use log::{debug, error, info, trace};
use shadowkit::net::{PeekableStream, TcpListener};
use tokio::{net::TcpStream as TokioTcpStream, time};

use crate::{
    config::SocksInboundConfig,
    handler::BoxProxyStream,
    server::context::ServiceContext,
    socks::{socks4::SOCKS4_VERSION, Socks4TcpHandler, Socks5TcpHandler},
};

const SOCKS5_VERSION: u8 = 0x05;

/// Serves HTTP proxy requests arriving on a mixed listener
///
/// `stream` starts with the request line.
#[async_trait]
pub trait HttpProxyHandler: Send + Sync {
    async fn serve_http(&self, stream: BoxProxyStream, peer_addr: SocketAddr) -> io::Result<()>;
}

/// Listener accepting SOCKS5 and HTTP proxy clients on one port
pub struct MixedServer {
    context: Arc<ServiceContext>,
    listener: TcpListener,
    socks4_handler: Socks4TcpHandler,
    socks_handler: Socks5TcpHandler,
    http_handler: Option<Arc<dyn HttpProxyHandler>>,
}

impl MixedServer {
    pub async fn new(context: Arc<ServiceContext>, config: &SocksInboundConfig) -> io::Result<MixedServer> {
        let listener = TcpListener::bind_with_opts(&config.listen, context.accept_opts().clone()).await?;
        let socks_handler = Socks5TcpHandler::new(
            context.clone(),
            config.auth.clone(),
            config.mode,
            config.udp_bind_addr,
        );

        let socks4_handler = Socks4TcpHandler::new(context.clone(), config.auth.clone(), config.mode);

        Ok(MixedServer {
            context,
            listener,
            socks4_handler,
            socks_handler,
            http_handler: None,
        })
    }

    /// Handle non-SOCKS connections with `handler`, they are closed if it is not set
    pub fn set_http_handler(&mut self, handler: Arc<dyn HttpProxyHandler>) {
        self.http_handler = Some(handler);
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> io::Result<()> {
        info!("mixed server listening on {}", self.listener.local_addr()?);

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(s) => s,
                Err(err) => {
                    error!("accept failed with error: {}", err);
                    time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let client = MixedClient {
                socks4_handler: self.socks4_handler.clone(),
                socks_handler: self.socks_handler.clone(),
                http_handler: self.http_handler.clone(),
                peer_addr,
            };
            let context = self.context.clone();

            tokio::spawn(async move {
                if let Err(err) = client.serve(stream).await {
                    debug!("mixed client {} handler error: {}", peer_addr, err);
                    context.handler().handle_error(None, err);
                }
            });
        }
    }
}

struct MixedClient {
    socks4_handler: Socks4TcpHandler,
    socks_handler: Socks5TcpHandler,
    http_handler: Option<Arc<dyn HttpProxyHandler>>,
    peer_addr: SocketAddr,
}

impl MixedClient {
    async fn serve(self, stream: TokioTcpStream) -> io::Result<()> {
        let local_addr = stream.local_addr()?;
        let mut stream = PeekableStream::new(stream);

        let version = match stream.peek_u8().await? {
            Some(v) => v,
            None => {
                trace!("mixed client {} closed before sending anything", self.peer_addr);
                return Ok(());
            }
        };

        match version {
            SOCKS5_VERSION => {
                self.socks_handler
                    .handle_socks5_client(stream, self.peer_addr, local_addr)
                    .await
            }
            SOCKS4_VERSION => self.socks4_handler.handle_socks4_client(stream, self.peer_addr).await,
            _ => match self.http_handler {
                Some(ref handler) => handler.serve_http(Box::new(stream), self.peer_addr).await,
                None => {
                    debug!(
                        "mixed client {} sent {:#x}, which is not socks, and http proxy is not enabled",
                        self.peer_addr, version
                    );
                    Ok(())
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
        sync::mpsc,
    };

    use super::*;
    use crate::{
        config::SocksInboundConfig,
        handler::{BoxPacketConn, ConnectionHandler, InboundProtocol, Metadata},
        socks::config::Socks5AuthConfig,
    };
    use shadowkit::{config::Mode, relay::Address};

    /// Reports each connection with the first 5 bytes relayed on it
    struct RecordingHandler(mpsc::UnboundedSender<(Metadata, Vec<u8>)>);

    #[async_trait]
    impl ConnectionHandler for RecordingHandler {
        async fn new_connection(&self, mut stream: BoxProxyStream, metadata: Metadata) -> io::Result<()> {
            let mut early = vec![0u8; 5];
            stream.read_exact(&mut early).await?;
            let _ = self.0.send((metadata, early));
            Ok(())
        }

        async fn new_packet_connection(&self, _conn: BoxPacketConn, _metadata: Metadata) -> io::Result<()> {
            Ok(())
        }
    }

    struct RecordingHttpHandler(mpsc::UnboundedSender<Vec<u8>>);

    #[async_trait]
    impl HttpProxyHandler for RecordingHttpHandler {
        async fn serve_http(&self, mut stream: BoxProxyStream, _peer_addr: SocketAddr) -> io::Result<()> {
            let mut buf = vec![0u8; 16];
            stream.read_exact(&mut buf).await?;
            let _ = self.0.send(buf);
            Ok(())
        }
    }

    type Connections = mpsc::UnboundedReceiver<(Metadata, Vec<u8>)>;

    async fn start(http_handler: Option<Arc<dyn HttpProxyHandler>>) -> SocketAddr {
        start_with_auth(http_handler, Socks5AuthConfig::new()).await.0
    }

    async fn start_with_auth(
        http_handler: Option<Arc<dyn HttpProxyHandler>>,
        auth: Socks5AuthConfig,
    ) -> (SocketAddr, Connections) {
        let (tx, rx) = mpsc::unbounded_channel();
        let context = Arc::new(ServiceContext::new(Arc::new(RecordingHandler(tx))));
        let config = SocksInboundConfig {
            listen: SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0),
            auth: Arc::new(auth),
            mode: Mode::TcpAndUdp,
            udp_bind_addr: None,
        };

        let mut server = MixedServer::new(context, &config).await.unwrap();
        if let Some(h) = http_handler {
            server.set_http_handler(h);
        }
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());
        (addr, rx)
    }

    #[tokio::test]
    async fn socks4a_connect_reaches_handler() {
        let _ = env_logger::try_init();

        let (addr, mut connections) = start_with_auth(None, Socks5AuthConfig::new()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        // Payload pipelined behind the request must not be lost
        let mut request = vec![0x04, 0x01, 0x01, 0xBB, 0, 0, 0, 1];
        request.extend_from_slice(b"alice\0example.com\0early");
        stream.write_all(&request).await.unwrap();

        let mut reply = [0u8; 8];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x00, 90, 0, 0, 0, 0, 0, 0]);

        let (metadata, early) = connections.recv().await.unwrap();
        assert_eq!(metadata.protocol, InboundProtocol::Socks4);
        assert_eq!(metadata.destination, Address::DomainNameAddress("example.com".to_owned(), 443));
        assert!(metadata.user.is_none());
        assert_eq!(early, b"early");
    }

    #[tokio::test]
    async fn socks4_refused_when_password_required() {
        let _ = env_logger::try_init();

        let mut auth = Socks5AuthConfig::new();
        auth.passwd.add_user("alice", "secret");
        let (addr, mut connections) = start_with_auth(None, auth).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(&[0x04, 0x01, 0x00, 0x50, 1, 2, 3, 4, 0x00])
            .await
            .unwrap();

        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, [0x00, 91, 0, 0, 0, 0, 0, 0]);
        assert!(connections.try_recv().is_err());
    }

    #[tokio::test]
    async fn http_request_is_handed_off_intact() {
        let _ = env_logger::try_init();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let addr = start(Some(Arc::new(RecordingHttpHandler(tx)))).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), b"GET / HTTP/1.1\r\n");
    }

    #[tokio::test]
    async fn socks5_greeting_is_answered() {
        let _ = env_logger::try_init();

        let addr = start(None).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();

        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);
    }
}
