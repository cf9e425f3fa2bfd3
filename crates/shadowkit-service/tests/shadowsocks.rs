use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, UdpSocket},
    time,
};

use shadowkit::{
    config::{Mode, ServerConfig, ServerType, ServerUser, ServerUserManager},
    context::Context,
    crypto::CipherKind,
    relay::socks5::Address,
};
use shadowkit_service::{
    config::SocksInboundConfig,
    handler::ConnectionHandler,
    outbound::{DirectHandler, ShadowsocksHandler},
    server::{ServiceContext, TcpServer, UdpServer},
    socks::{
        client::{Socks5TcpClient, Socks5UdpClient},
        config::Socks5AuthConfig,
        Socks5Server,
    },
};

fn localhost() -> SocketAddr {
    SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0)
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

/// Start TCP and UDP servers for `svr_cfg` on one port, returns `svr_cfg` with the bound address
async fn start_shadowsocks(mut svr_cfg: ServerConfig) -> ServerConfig {
    let context = Arc::new(ServiceContext::new(Arc::new(DirectHandler::new())));

    let tcp_server = TcpServer::new(context.clone(), &svr_cfg).await.unwrap();
    let server_addr = tcp_server.local_addr().unwrap();
    svr_cfg.set_addr(server_addr);

    let udp_server = UdpServer::new(context, &svr_cfg, None, None).await.unwrap();

    tokio::spawn(tcp_server.run());
    tokio::spawn(udp_server.run());
    svr_cfg
}

async fn start_socks5(handler: Arc<dyn ConnectionHandler>) -> SocketAddr {
    let context = Arc::new(ServiceContext::new(handler));
    let config = SocksInboundConfig {
        listen: localhost(),
        auth: Arc::new(Socks5AuthConfig::new()),
        mode: Mode::TcpAndUdp,
        udp_bind_addr: None,
    };

    let server = Socks5Server::new(context, &config).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    addr
}

async fn tcp_echo_through(server_cfg: ServerConfig, client_cfg: ServerConfig) {
    let echo_addr = start_tcp_echo().await;
    let server_cfg = start_shadowsocks(server_cfg).await;

    let mut client_cfg = client_cfg;
    client_cfg.set_addr(server_cfg.addr().clone());
    let handler = ShadowsocksHandler::new(Context::new_shared(ServerType::Local), client_cfg);
    let proxy_addr = start_socks5(Arc::new(handler)).await;

    let mut client = Socks5TcpClient::connect(echo_addr, proxy_addr).await.unwrap();
    client.write_all(b"encrypted hop").await.unwrap();

    let mut buf = [0u8; 13];
    time::timeout(Duration::from_secs(5), client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"encrypted hop");
}

#[tokio::test]
async fn tcp_aead() {
    let _ = env_logger::try_init();

    let svr_cfg = ServerConfig::new(localhost(), "password", CipherKind::AES_256_GCM).unwrap();
    tcp_echo_through(svr_cfg.clone(), svr_cfg).await;
}

#[tokio::test]
async fn tcp_aead_2022_multi_user() {
    let _ = env_logger::try_init();

    let method = CipherKind::AEAD2022_BLAKE3_AES_128_GCM;
    let ipsk = [11u8; 16];
    let upsk = [12u8; 16];

    let mut svr_cfg = ServerConfig::with_psks(localhost(), method, &[&ipsk]).unwrap();
    let users = ServerUserManager::new();
    users.add_user(ServerUser::new("dave", upsk.to_vec()));
    svr_cfg.set_user_manager(Arc::new(users)).unwrap();

    let client_cfg = ServerConfig::with_psks(localhost(), method, &[&ipsk, &upsk]).unwrap();
    tcp_echo_through(svr_cfg, client_cfg).await;
}

#[tokio::test]
async fn udp_aead_2022() {
    let _ = env_logger::try_init();

    let echo_addr = start_udp_echo().await;

    let method = CipherKind::AEAD2022_BLAKE3_CHACHA20_POLY1305;
    let svr_cfg = ServerConfig::with_psks(localhost(), method, &[&[13u8; 32]]).unwrap();
    let svr_cfg = start_shadowsocks(svr_cfg).await;

    let handler = ShadowsocksHandler::new(Context::new_shared(ServerType::Local), svr_cfg);
    let proxy_addr = start_socks5(Arc::new(handler)).await;

    let mut client = Socks5UdpClient::bind(localhost()).await.unwrap();
    client.associate(proxy_addr, None).await.unwrap();

    let mut buf = vec![0u8; 65536];
    for i in 0..3u8 {
        let payload = [i; 32];
        client.send_to(0, &payload, echo_addr).await.unwrap();

        let (n, _, addr) = time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], &payload);
        assert_eq!(addr, Address::SocketAddress(echo_addr));
    }
}

#[tokio::test]
async fn udp_over_tcp_aead() {
    let _ = env_logger::try_init();

    let echo_addr = start_udp_echo().await;

    // Only the TCP listener runs, datagrams can't reach the server any other way
    let mut svr_cfg = ServerConfig::new(localhost(), "uot-password", CipherKind::CHACHA20_POLY1305).unwrap();
    let context = Arc::new(ServiceContext::new(Arc::new(DirectHandler::new())));
    let tcp_server = TcpServer::new(context, &svr_cfg).await.unwrap();
    svr_cfg.set_addr(tcp_server.local_addr().unwrap());
    tokio::spawn(tcp_server.run());

    let mut handler = ShadowsocksHandler::new(Context::new_shared(ServerType::Local), svr_cfg);
    handler.set_udp_over_tcp(true);
    let proxy_addr = start_socks5(Arc::new(handler)).await;

    let mut client = Socks5UdpClient::bind(localhost()).await.unwrap();
    client.associate(proxy_addr, None).await.unwrap();

    let mut buf = vec![0u8; 65536];
    for size in [1usize, 512, 1400] {
        let payload = vec![size as u8; size];
        client.send_to(0, &payload, echo_addr).await.unwrap();

        let (n, _, addr) = time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], &payload[..]);
        assert_eq!(addr, Address::SocketAddress(echo_addr));
    }
}

#[tokio::test]
async fn failed_handshake_keeps_socket_open() {
    let _ = env_logger::try_init();

    let svr_cfg = ServerConfig::new(localhost(), "password", CipherKind::AES_256_GCM).unwrap();
    let svr_cfg = start_shadowsocks(svr_cfg).await;

    let server_addr = match svr_cfg.addr() {
        Address::SocketAddress(addr) => *addr,
        addr => panic!("unexpected server address {addr}"),
    };
    let mut stream = tokio::net::TcpStream::connect(server_addr).await.unwrap();
    stream.write_all(&[0x55u8; 64]).await.unwrap();

    let mut buf = [0u8; 16];
    let still_open = time::timeout(Duration::from_millis(300), stream.read(&mut buf)).await;
    assert!(still_open.is_err(), "server answered a bad handshake with {still_open:?}");

    // More garbage is swallowed, the socket closes after the client's FIN
    stream.write_all(&[0x66u8; 1024]).await.unwrap();
    stream.shutdown().await.unwrap();
    let n = time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);
}
