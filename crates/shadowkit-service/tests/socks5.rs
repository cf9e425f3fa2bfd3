use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
    sync::{mpsc, oneshot},
    time,
};

use shadowkit::{
    config::Mode,
    relay::socks5::{Address, Error as Socks5Error},
};
use shadowkit_service::{
    config::SocksInboundConfig,
    handler::{BoxPacketConn, BoxProxyStream, ConnectionHandler, Metadata},
    outbound::DirectHandler,
    server::ServiceContext,
    socks::{
        client::{Socks5Credential, Socks5TcpClient, Socks5UdpClient},
        config::Socks5AuthConfig,
        Socks5Server,
    },
};

fn localhost() -> SocketAddr {
    SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0)
}

async fn start_socks5(handler: Arc<dyn ConnectionHandler>, auth: Socks5AuthConfig) -> SocketAddr {
    let context = Arc::new(ServiceContext::new(handler));
    let config = SocksInboundConfig {
        listen: localhost(),
        auth: Arc::new(auth),
        mode: Mode::TcpAndUdp,
        udp_bind_addr: None,
    };

    let server = Socks5Server::new(context, &config).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    addr
}

async fn start_tcp_echo() -> SocketAddr {
    let listener = TcpListener::bind(localhost()).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

async fn start_udp_echo() -> SocketAddr {
    let socket = UdpSocket::bind(localhost()).await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65536];
        while let Ok((n, peer_addr)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], peer_addr).await;
        }
    });
    addr
}

#[tokio::test]
async fn connect_without_auth() {
    let _ = env_logger::try_init();

    let echo_addr = start_tcp_echo().await;
    let proxy_addr = start_socks5(Arc::new(DirectHandler::new()), Socks5AuthConfig::new()).await;

    let mut client = Socks5TcpClient::connect(echo_addr, proxy_addr).await.unwrap();
    client.write_all(b"through socks5").await.unwrap();

    let mut buf = [0u8; 14];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"through socks5");
}

fn auth_with_user() -> Socks5AuthConfig {
    let mut auth = Socks5AuthConfig::new();
    auth.passwd.add_user("alice", "secret");
    auth
}

#[tokio::test]
async fn connect_with_password() {
    let _ = env_logger::try_init();

    let echo_addr = start_tcp_echo().await;
    let proxy_addr = start_socks5(Arc::new(DirectHandler::new()), auth_with_user()).await;

    let credential = Socks5Credential::new("alice", "secret");
    let mut client = Socks5TcpClient::connect_with_auth(echo_addr, proxy_addr, Some(&credential))
        .await
        .unwrap();
    client.write_all(b"ping").await.unwrap();

    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
}

#[tokio::test]
async fn wrong_password_is_rejected() {
    let _ = env_logger::try_init();

    let echo_addr = start_tcp_echo().await;
    let proxy_addr = start_socks5(Arc::new(DirectHandler::new()), auth_with_user()).await;

    let credential = Socks5Credential::new("alice", "not the secret");
    let result = Socks5TcpClient::connect_with_auth(echo_addr, proxy_addr, Some(&credential)).await;
    assert!(matches!(result, Err(Socks5Error::PasswdAuthFailure)));
}

#[tokio::test]
async fn method_selection() {
    let _ = env_logger::try_init();

    let proxy_addr = start_socks5(Arc::new(DirectHandler::new()), auth_with_user()).await;

    // Only "no authentication" offered while a password is required
    let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0xff]);

    // Both offered, password is chosen
    let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
    stream.write_all(&[0x05, 0x02, 0x00, 0x02]).await.unwrap();
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x02]);

    let open_addr = start_socks5(Arc::new(DirectHandler::new()), Socks5AuthConfig::new()).await;
    let mut stream = TcpStream::connect(open_addr).await.unwrap();
    stream.write_all(&[0x05, 0x02, 0x02, 0x00]).await.unwrap();
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00]);
}

#[tokio::test]
async fn bind_is_not_supported() {
    let _ = env_logger::try_init();

    let proxy_addr = start_socks5(Arc::new(DirectHandler::new()), Socks5AuthConfig::new()).await;

    let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await.unwrap();

    stream
        .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0x1f, 0x90])
        .await
        .unwrap();
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await.unwrap();
    assert_eq!(header, [0x05, 0x07]);
}

#[tokio::test]
async fn udp_associate_echo() {
    let _ = env_logger::try_init();

    let echo_addr = start_udp_echo().await;
    let proxy_addr = start_socks5(Arc::new(DirectHandler::new()), Socks5AuthConfig::new()).await;

    let mut client = Socks5UdpClient::bind(localhost()).await.unwrap();
    client.associate(proxy_addr, None).await.unwrap();

    let mut buf = vec![0u8; 65536];
    for payload in [&b"first datagram"[..], &b"second"[..]] {
        client.send_to(0, payload, echo_addr).await.unwrap();

        let (n, frag, addr) = time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frag, 0);
        assert_eq!(&buf[..n], payload);
        assert_eq!(addr, Address::SocketAddress(echo_addr));
    }
}

/// Holds each packet connection until the association is torn down
struct HoldingHandler {
    started: mpsc::UnboundedSender<oneshot::Receiver<()>>,
}

#[async_trait]
impl ConnectionHandler for HoldingHandler {
    async fn new_connection(&self, _stream: BoxProxyStream, _metadata: Metadata) -> io::Result<()> {
        Ok(())
    }

    async fn new_packet_connection(&self, _conn: BoxPacketConn, _metadata: Metadata) -> io::Result<()> {
        let (_alive, dropped) = oneshot::channel::<()>();
        let _ = self.started.send(dropped);
        futures::future::pending::<()>().await;
        Ok(())
    }
}

#[tokio::test]
async fn udp_association_ends_with_control_connection() {
    let _ = env_logger::try_init();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let proxy_addr = start_socks5(Arc::new(HoldingHandler { started: tx }), Socks5AuthConfig::new()).await;

    let mut client = Socks5UdpClient::bind(localhost()).await.unwrap();
    client.associate(proxy_addr, None).await.unwrap();

    let dropped = time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();

    client.dissociate();

    // The packet connection is dropped once the control connection closes
    let result = time::timeout(Duration::from_secs(1), dropped).await.unwrap();
    assert!(result.is_err());
}
