//! SOCKS5 CONNECT and UDP ASSOCIATE client

use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    task::{self, Poll},
};

use log::trace;
use pin_project::pin_project;
use shadowkit::relay::socks5::{
    Address,
    Command,
    Error,
    HandshakeRequest,
    HandshakeResponse,
    PasswdAuthRequest,
    PasswdAuthResponse,
    Reply,
    TcpRequestHeader,
    TcpResponseHeader,
    SOCKS5_AUTH_METHOD_NONE,
    SOCKS5_AUTH_METHOD_PASSWORD,
    SOCKS5_PASSWD_AUTH_SUCCEEDED,
};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::{TcpStream, ToSocketAddrs},
};

/// Username and password for RFC1929 authentication
#[derive(Debug, Clone)]
pub struct Socks5Credential {
    pub username: String,
    pub password: String,
}

impl Socks5Credential {
    pub fn new<U, P>(username: U, password: P) -> Socks5Credential
    where
        U: Into<String>,
        P: Into<String>,
    {
        Socks5Credential {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Method offered in the greeting
    fn method(credential: Option<&Socks5Credential>) -> u8 {
        match credential {
            Some(..) => SOCKS5_AUTH_METHOD_PASSWORD,
            None => SOCKS5_AUTH_METHOD_NONE,
        }
    }
}

/// Stream to a target, through a SOCKS5 proxy
///
/// For UDP ASSOCIATE the stream carries nothing, it only keeps the association alive.
#[pin_project]
pub struct Socks5TcpClient {
    #[pin]
    stream: TcpStream,
    bound_addr: Address,
}

impl Socks5TcpClient {
    pub async fn connect<A, P>(addr: A, proxy: P) -> Result<Socks5TcpClient, Error>
    where
        A: Into<Address>,
        P: ToSocketAddrs,
    {
        Socks5TcpClient::connect_with_auth(addr, proxy, None).await
    }

    pub async fn connect_with_auth<A, P>(
        addr: A,
        proxy: P,
        credential: Option<&Socks5Credential>,
    ) -> Result<Socks5TcpClient, Error>
    where
        A: Into<Address>,
        P: ToSocketAddrs,
    {
        Socks5TcpClient::open(proxy, credential, Command::TcpConnect, addr.into()).await
    }

    /// Associate the UDP socket bound to `addr`, returns the client and the proxy's relay address
    pub async fn udp_associate<A, P>(
        addr: A,
        proxy: P,
        credential: Option<&Socks5Credential>,
    ) -> Result<(Socks5TcpClient, Address), Error>
    where
        A: Into<Address>,
        P: ToSocketAddrs,
    {
        let client = Socks5TcpClient::open(proxy, credential, Command::UdpAssociate, addr.into()).await?;
        let relay_addr = client.bound_addr.clone();
        Ok((client, relay_addr))
    }

    /// BND.ADDR of the proxy's reply
    pub fn bound_addr(&self) -> &Address {
        &self.bound_addr
    }

    /// Address of the proxy
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    async fn open<P>(
        proxy: P,
        credential: Option<&Socks5Credential>,
        command: Command,
        addr: Address,
    ) -> Result<Socks5TcpClient, Error>
    where
        P: ToSocketAddrs,
    {
        let mut stream = TcpStream::connect(proxy).await?;

        negotiate(&mut stream, credential).await?;

        trace!("socks5 {:?} {}", command, addr);
        TcpRequestHeader::new(command, addr).write_to(&mut stream).await?;

        let response = TcpResponseHeader::read_from(&mut stream).await?;
        if response.reply != Reply::Succeeded {
            return Err(Error::Reply(response.reply));
        }

        Ok(Socks5TcpClient {
            stream,
            bound_addr: response.address,
        })
    }
}

/// Greeting and, with a `credential`, the username/password exchange
async fn negotiate(stream: &mut TcpStream, credential: Option<&Socks5Credential>) -> Result<(), Error> {
    let method = Socks5Credential::method(credential);
    HandshakeRequest::new(vec![method]).write_to(stream).await?;

    let chosen = HandshakeResponse::read_from(stream).await?.chosen_method;
    trace!("socks5 proxy chose method {:#x}", chosen);
    if chosen != method {
        return Err(Error::NoAcceptableAuthMethod(vec![method]));
    }

    let Some(credential) = credential else {
        return Ok(());
    };

    PasswdAuthRequest::new(credential.username.as_bytes(), credential.password.as_bytes())?
        .write_to(stream)
        .await?;
    match PasswdAuthResponse::read_from(stream).await?.status {
        SOCKS5_PASSWD_AUTH_SUCCEEDED => Ok(()),
        _ => Err(Error::PasswdAuthFailure),
    }
}

impl AsyncRead for Socks5TcpClient {
    fn poll_read(self: Pin<&mut Self>, cx: &mut task::Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        self.project().stream.poll_read(cx, buf)
    }
}

impl AsyncWrite for Socks5TcpClient {
    fn poll_write(self: Pin<&mut Self>, cx: &mut task::Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.project().stream.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        self.project().stream.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        self.project().stream.poll_shutdown(cx)
    }
}
