//! SOCKS5 connections, from the greeting to the handoff to the `ConnectionHandler`

use std::{
    io::{self, ErrorKind},
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};

use log::{debug, error, trace, warn};
use shadowkit::{
    config::Mode,
    net::UdpSocket,
    relay::socks5::{
        Address,
        Command,
        Error as Socks5Error,
        HandshakeRequest,
        HandshakeResponse,
        PasswdAuthRequest,
        PasswdAuthResponse,
        Reply,
        TcpRequestHeader,
        TcpResponseHeader,
        SOCKS5_AUTH_METHOD_NONE,
        SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE,
        SOCKS5_AUTH_METHOD_PASSWORD,
        SOCKS5_PASSWD_AUTH_FAILURE,
        SOCKS5_PASSWD_AUTH_SUCCEEDED,
    },
};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    handler::{InboundProtocol, Metadata},
    server::context::ServiceContext,
    utils::ignore_until_end,
};

use super::{config::Socks5AuthConfig, udprelay::Socks5UdpPacketConn};

/// Send the reply to a request
async fn reply<S>(stream: &mut S, reply: Reply, addr: Address) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let header = TcpResponseHeader::new(reply, addr);
    trace!("socks5 reply {:?}", header);
    header.write_to(stream).await
}

/// Bound address reported for CONNECT, the outbound socket belongs to the handler
fn unspecified_address() -> Address {
    Address::SocketAddress(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0))
}

/// SOCKS5 side of the mixed and the dedicated SOCKS listeners
#[derive(Clone)]
pub struct Socks5TcpHandler {
    context: Arc<ServiceContext>,
    auth: Arc<Socks5AuthConfig>,
    mode: Mode,
    udp_bind_addr: Option<IpAddr>,
}

impl Socks5TcpHandler {
    pub fn new(
        context: Arc<ServiceContext>,
        auth: Arc<Socks5AuthConfig>,
        mode: Mode,
        udp_bind_addr: Option<IpAddr>,
    ) -> Socks5TcpHandler {
        Socks5TcpHandler {
            context,
            auth,
            mode,
            udp_bind_addr,
        }
    }

    /// Serve a client whose stream is positioned at the SOCKS5 greeting
    ///
    /// UDP associations listen on the IP of `local_addr` unless `udp_bind_addr` is configured.
    pub async fn handle_socks5_client<S>(self, mut stream: S, peer_addr: SocketAddr, local_addr: SocketAddr) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let greeting = match HandshakeRequest::read_from(&mut stream).await {
            Ok(greeting) => greeting,
            Err(Socks5Error::IoError(ref err)) if err.kind() == ErrorKind::UnexpectedEof => {
                trace!("socks5 client {} closed before greeting", peer_addr);
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        trace!("socks5 {} {:?}", peer_addr, greeting);

        let user = self.negotiate(&mut stream, &greeting.methods).await?;

        let request = match TcpRequestHeader::read_from(&mut stream).await {
            Ok(request) => request,
            Err(err) => {
                debug!("socks5 client {} sent a bad request, error: {}", peer_addr, err);
                reply(&mut stream, err.reply(), Address::SocketAddress(peer_addr)).await?;
                return Err(err.into());
            }
        };

        let mut metadata = Metadata::new(InboundProtocol::Socks5, peer_addr, request.address.clone());
        if let Some(user) = user {
            metadata = metadata.with_user(user);
        }

        match request.command {
            Command::TcpConnect if self.mode.enable_tcp() => {
                debug!("socks5 {} CONNECT {}", peer_addr, request.address);
                self.connect(stream, metadata).await
            }
            Command::UdpAssociate if self.mode.enable_udp() => {
                debug!("socks5 {} UDP ASSOCIATE {}", peer_addr, request.address);
                self.udp_associate(stream, local_addr, metadata).await
            }
            command => {
                warn!("socks5 {} {:?} isn't served in mode {}", peer_addr, command, self.mode);
                reply(&mut stream, Reply::CommandNotSupported, request.address).await
            }
        }
    }

    /// Pick the method the configuration asks for, returns the authenticated user
    async fn negotiate<S>(&self, stream: &mut S, offered: &[u8]) -> io::Result<Option<String>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let method = match self.auth.auth_required() {
            true => SOCKS5_AUTH_METHOD_PASSWORD,
            false => SOCKS5_AUTH_METHOD_NONE,
        };

        if !offered.contains(&method) {
            HandshakeResponse::new(SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE).write_to(stream).await?;
            return Err(Socks5Error::NoAcceptableAuthMethod(offered.to_vec()).into());
        }
        HandshakeResponse::new(method).write_to(stream).await?;

        if method == SOCKS5_AUTH_METHOD_NONE {
            return Ok(None);
        }

        let user = self.authenticate(stream).await;
        let status = match user {
            Ok(..) => SOCKS5_PASSWD_AUTH_SUCCEEDED,
            Err(..) => SOCKS5_PASSWD_AUTH_FAILURE,
        };
        PasswdAuthResponse::new(status).write_to(stream).await?;
        user.map(Some)
    }

    async fn authenticate<S>(&self, stream: &mut S) -> io::Result<String>
    where
        S: AsyncRead + Unpin,
    {
        let request = PasswdAuthRequest::read_from(stream).await?;

        let (Ok(user_name), Ok(password)) = (String::from_utf8(request.uname), String::from_utf8(request.passwd)) else {
            warn!("socks5 username/password isn't UTF-8");
            return Err(Socks5Error::PasswdAuthFailure.into());
        };

        if !self.auth.passwd.check_user(&user_name, &password) {
            warn!("socks5 rejected user {}", user_name);
            return Err(Socks5Error::PasswdAuthFailure.into());
        }

        trace!("socks5 authenticated user {}", user_name);
        Ok(user_name)
    }

    async fn connect<S>(self, mut stream: S, metadata: Metadata) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        reply(&mut stream, Reply::Succeeded, unspecified_address()).await?;

        let handler = self.context.handler();
        if let Err(err) = handler.new_connection(Box::new(stream), metadata.clone()).await {
            handler.handle_error(Some(&metadata), err);
        }
        Ok(())
    }

    async fn udp_associate<S>(self, mut stream: S, local_addr: SocketAddr, metadata: Metadata) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let bind_ip = self.udp_bind_addr.unwrap_or(local_addr.ip());
        let socket = match UdpSocket::bind(&SocketAddr::new(bind_ip, 0)).await {
            Ok(socket) => socket,
            Err(err) => {
                error!("socks5 udp associate failed to bind {}, error: {}", bind_ip, err);
                reply(&mut stream, Reply::GeneralFailure, metadata.destination).await?;
                return Err(err);
            }
        };

        // Clients need an address they can send to
        let mut relay_addr = socket.local_addr()?;
        if relay_addr.ip().is_unspecified() {
            relay_addr.set_ip(local_addr.ip());
        }
        reply(&mut stream, Reply::Succeeded, Address::SocketAddress(relay_addr)).await?;
        debug!("socks5 udp associate {} relaying on {}", metadata.source, relay_addr);

        let handler = self.context.handler();
        let conn = Socks5UdpPacketConn::new(socket);

        // Ends with the control connection
        tokio::select! {
            result = handler.new_packet_connection(Box::new(conn), metadata.clone()) => {
                if let Err(err) = result {
                    handler.handle_error(Some(&metadata), err);
                }
            }
            _ = ignore_until_end(&mut stream) => {
                trace!("socks5 udp associate {} control connection closed", metadata.source);
            }
        }

        Ok(())
    }
}
