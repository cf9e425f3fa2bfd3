use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use byte_string::ByteStr;
use log::info;
use tokio::{net::UdpSocket, time};

use shadowkit::{
    config::{ServerConfig, ServerType, ServerUser, ServerUserManager},
    context::Context,
    crypto::CipherKind,
    relay::{
        udprelay::{ClientSession, ProtocolError, ProxySocket, ProxySocketError, UdpSocketControlData},
        Address,
    },
};

fn localhost() -> SocketAddr {
    SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0)
}

fn target() -> Address {
    Address::SocketAddress(SocketAddr::new(Ipv4Addr::new(10, 0, 0, 1).into(), 53))
}

/// Bind a server socket, returns it with a client configuration pointing to it
async fn bind_server(svr_cfg: &ServerConfig, mut client_cfg: ServerConfig) -> (ProxySocket, ServerConfig) {
    let server = ProxySocket::bind(Context::new_shared(ServerType::Server), svr_cfg)
        .await
        .unwrap();
    client_cfg.set_addr(server.local_addr().unwrap());
    (server, client_cfg)
}

/// One request and one response between a client and a server of `svr_cfg`
async fn packet_exchange(svr_cfg: ServerConfig) {
    let (server, client_cfg) = bind_server(&svr_cfg, svr_cfg.clone()).await;
    let client = ProxySocket::connect(Context::new_shared(ServerType::Local), &client_cfg)
        .await
        .unwrap();

    client.send(&target(), b"query").await.unwrap();

    let mut buf = vec![0u8; 65536];
    let (n, peer_addr, addr, ..) = server.recv_from(&mut buf).await.unwrap();
    info!("server received {:?} for {}", ByteStr::new(&buf[..n]), addr);
    assert_eq!(&buf[..n], b"query");
    assert_eq!(addr, target());

    server.send_to(peer_addr, &addr, b"answer").await.unwrap();

    let (n, addr, ..) = client.recv(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"answer");
    assert_eq!(addr, target());
}

#[tokio::test]
async fn aead_packet_exchange() {
    let _ = env_logger::try_init();

    let svr_cfg = ServerConfig::new(localhost(), "password", CipherKind::CHACHA20_POLY1305).unwrap();
    packet_exchange(svr_cfg).await;
}

#[cfg(feature = "stream-cipher")]
#[tokio::test]
async fn stream_cipher_packet_exchange() {
    let _ = env_logger::try_init();

    for method in [CipherKind::AES_256_CFB128, CipherKind::CHACHA20_IETF] {
        let svr_cfg = ServerConfig::new(localhost(), "password", method).unwrap();
        packet_exchange(svr_cfg).await;
    }
}

#[tokio::test]
async fn none_method_packet_exchange() {
    let _ = env_logger::try_init();

    let svr_cfg = ServerConfig::new(localhost(), "", CipherKind::NONE).unwrap();
    packet_exchange(svr_cfg).await;
}

#[tokio::test]
async fn none_method_sends_address_and_payload() {
    let raw = UdpSocket::bind(localhost()).await.unwrap();

    let mut client_cfg = ServerConfig::new(localhost(), "", CipherKind::NONE).unwrap();
    client_cfg.set_addr(raw.local_addr().unwrap());
    let client = ProxySocket::connect(Context::new_shared(ServerType::Local), &client_cfg)
        .await
        .unwrap();
    client.send(&target(), b"query").await.unwrap();

    let mut buf = [0u8; 64];
    let (n, _) = raw.recv_from(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"\x01\x0a\x00\x00\x01\x00\x35query");
}

#[tokio::test]
async fn aead_2022_session() {
    let _ = env_logger::try_init();

    let method = CipherKind::AEAD2022_BLAKE3_AES_256_GCM;
    let svr_cfg = ServerConfig::with_psks(localhost(), method, &[&[3u8; 32]]).unwrap();
    let (server, client_cfg) = bind_server(&svr_cfg, svr_cfg.clone()).await;
    let client = ProxySocket::connect(Context::new_shared(ServerType::Local), &client_cfg)
        .await
        .unwrap();

    let mut session = ClientSession::new();
    let mut buf = vec![0u8; 65536];

    for expected_packet_id in 0..3u64 {
        client
            .send_with_ctrl(&target(), &session.next_control(), b"ping")
            .await
            .unwrap();

        let (n, _, _, _, control) = server.recv_from_with_ctrl(&mut buf).await.unwrap();
        let control = control.unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(control.client_session_id, session.client_session_id());
        assert_eq!(control.packet_id, expected_packet_id);
    }

    let server_session_id = 0x1122_3344_5566_7788;
    let mut reply = UdpSocketControlData::new(session.client_session_id(), server_session_id, 0);

    let client_addr = client.local_addr().unwrap();
    server.send_to_with_ctrl(client_addr, &target(), &reply, b"pong").await.unwrap();

    let (n, _, _, control) = client.recv_with_ctrl(&mut buf).await.unwrap();
    let control = control.unwrap();
    assert_eq!(&buf[..n], b"pong");
    assert_eq!(control.server_session_id, server_session_id);
    session.check_response(&control).unwrap();

    // Same packet ID again
    server.send_to_with_ctrl(client_addr, &target(), &reply, b"pong").await.unwrap();
    let (_, _, _, control) = client.recv_with_ctrl(&mut buf).await.unwrap();
    assert!(matches!(
        session.check_response(&control.unwrap()),
        Err(ProtocolError::PacketIdRepeated(..))
    ));

    reply.packet_id = 1;
    server.send_to_with_ctrl(client_addr, &target(), &reply, b"pong").await.unwrap();
    let (_, _, _, control) = client.recv_with_ctrl(&mut buf).await.unwrap();
    session.check_response(&control.unwrap()).unwrap();
}

#[tokio::test]
async fn aead_2022_multi_user() {
    let _ = env_logger::try_init();

    let method = CipherKind::AEAD2022_BLAKE3_AES_128_GCM;
    let ipsk = [1u8; 16];
    let upsk = [2u8; 16];

    let mut svr_cfg = ServerConfig::with_psks(localhost(), method, &[&ipsk]).unwrap();
    let user_manager = ServerUserManager::new();
    user_manager.add_user(ServerUser::new("bob", upsk.to_vec()));
    svr_cfg.set_user_manager(Arc::new(user_manager)).unwrap();

    let client_cfg = ServerConfig::with_psks(localhost(), method, &[&ipsk, &upsk]).unwrap();
    let (server, client_cfg) = bind_server(&svr_cfg, client_cfg).await;
    let client = ProxySocket::connect(Context::new_shared(ServerType::Local), &client_cfg)
        .await
        .unwrap();

    let mut session = ClientSession::new();
    client
        .send_with_ctrl(&target(), &session.next_control(), b"hello")
        .await
        .unwrap();

    let mut buf = vec![0u8; 65536];
    let (n, peer_addr, addr, _, control) = server.recv_from_with_ctrl(&mut buf).await.unwrap();
    let control = control.unwrap();
    assert_eq!(&buf[..n], b"hello");
    assert_eq!(control.user.as_ref().map(|u| u.name()), Some("bob"));

    // Responses are encrypted with the user's key
    let mut reply = control.clone();
    reply.server_session_id = 42;
    reply.packet_id = 0;
    server.send_to_with_ctrl(peer_addr, &addr, &reply, b"world").await.unwrap();

    let (n, ..) = client.recv_with_ctrl(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"world");
}

#[tokio::test]
async fn aead_2022_unknown_user_is_rejected() {
    let _ = env_logger::try_init();

    let method = CipherKind::AEAD2022_BLAKE3_AES_128_GCM;
    let ipsk = [1u8; 16];

    let mut svr_cfg = ServerConfig::with_psks(localhost(), method, &[&ipsk]).unwrap();
    let user_manager = ServerUserManager::new();
    user_manager.add_user(ServerUser::new("bob", vec![2u8; 16]));
    svr_cfg.set_user_manager(Arc::new(user_manager)).unwrap();

    let client_cfg = ServerConfig::with_psks(localhost(), method, &[&ipsk, &[5u8; 16]]).unwrap();
    let (server, client_cfg) = bind_server(&svr_cfg, client_cfg).await;
    let client = ProxySocket::connect(Context::new_shared(ServerType::Local), &client_cfg)
        .await
        .unwrap();

    let mut session = ClientSession::new();
    client
        .send_with_ctrl(&target(), &session.next_control(), b"hello")
        .await
        .unwrap();

    let mut buf = vec![0u8; 65536];
    let result = time::timeout(Duration::from_secs(5), server.recv_from_with_ctrl(&mut buf))
        .await
        .unwrap();
    assert!(matches!(result, Err(ProxySocketError::ProtocolErrorWithPeer(..))));
}
