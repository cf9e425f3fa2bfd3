use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time,
};

use shadowkit::{
    config::Mode,
    relay::trojan::{password_to_key, TrojanUser, TrojanUserManager},
};
use shadowkit_service::{
    config::SocksInboundConfig,
    handler::ConnectionHandler,
    outbound::{DirectHandler, TrojanHandler},
    server::{ServiceContext, TrojanServer},
    socks::{client::Socks5TcpClient, config::Socks5AuthConfig, Socks5Server},
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

async fn start_trojan(password: &str) -> SocketAddr {
    let users = TrojanUserManager::new();
    users.add_user(TrojanUser::new("carol", password));

    let context = Arc::new(ServiceContext::new(Arc::new(DirectHandler::new())));
    let server = TrojanServer::new(context, &localhost(), Arc::new(users)).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    addr
}

async fn start_socks5(handler: Arc<dyn ConnectionHandler>) -> SocketAddr {
    let context = Arc::new(ServiceContext::new(handler));
    let config = SocksInboundConfig {
        listen: localhost(),
        auth: Arc::new(Socks5AuthConfig::new()),
        mode: Mode::TcpOnly,
        udp_bind_addr: None,
    };

    let server = Socks5Server::new(context, &config).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    addr
}

#[tokio::test]
async fn connect_through_trojan() {
    let _ = env_logger::try_init();

    let echo_addr = start_tcp_echo().await;
    let trojan_addr = start_trojan("hunter2").await;
    let proxy_addr = start_socks5(Arc::new(TrojanHandler::new(trojan_addr, "hunter2"))).await;

    let mut client = Socks5TcpClient::connect(echo_addr, proxy_addr).await.unwrap();
    client.write_all(b"over trojan").await.unwrap();

    let mut buf = [0u8; 11];
    time::timeout(Duration::from_secs(5), client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"over trojan");
}

#[tokio::test]
async fn unknown_key_is_closed_silently() {
    let _ = env_logger::try_init();

    let echo_addr = start_tcp_echo().await;
    let trojan_addr = start_trojan("hunter2").await;

    let mut request = Vec::new();
    request.extend_from_slice(&password_to_key("hunter3"));
    request.extend_from_slice(b"\r\n");
    request.push(0x01);
    request.push(0x01);
    match echo_addr {
        SocketAddr::V4(v4) => request.extend_from_slice(&v4.ip().octets()),
        SocketAddr::V6(..) => unreachable!("echo server listens on ipv4"),
    }
    request.extend_from_slice(&echo_addr.port().to_be_bytes());
    request.extend_from_slice(b"\r\nhello");

    let mut stream = TcpStream::connect(trojan_addr).await.unwrap();
    stream.write_all(&request).await.unwrap();

    // Nothing is ever sent back, the connection is closed or reset
    let mut response = Vec::new();
    let result = time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .unwrap();
    if result.is_ok() {
        assert!(response.is_empty());
    }
}
