//! TCP connect and accept honoring [`ConnectOpts`] and [`AcceptOpts`]

use std::{
    io::{self, ErrorKind},
    net::SocketAddr,
    ops::Deref,
    pin::Pin,
    task::{self, Poll},
};

use log::{debug, trace};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::{TcpListener as TokioTcpListener, TcpSocket, TcpStream as TokioTcpStream},
    time,
};

use crate::relay::Address;

use super::{AcceptOpts, ConnectOpts};

/// Outbound TCP connection
#[derive(Debug)]
pub struct TcpStream {
    inner: TokioTcpStream,
}

impl TcpStream {
    /// Connect to `addr`, within `opts.connect_timeout` if set
    pub async fn connect_with_opts(addr: &SocketAddr, opts: &ConnectOpts) -> io::Result<TcpStream> {
        let inner = match opts.connect_timeout {
            None => open_stream(addr, opts).await?,
            Some(limit) => time::timeout(limit, open_stream(addr, opts))
                .await
                .map_err(|_| io::Error::new(ErrorKind::TimedOut, format!("connect {addr} timed out")))??,
        };
        Ok(TcpStream { inner })
    }

    /// Connect to a server or a proxy target
    ///
    /// Host names are resolved by the system, addresses are tried in order until one connects.
    pub async fn connect_remote_with_opts(addr: &Address, opts: &ConnectOpts) -> io::Result<TcpStream> {
        let (host, port) = match *addr {
            Address::SocketAddress(ref sa) => return TcpStream::connect_with_opts(sa, opts).await,
            Address::DomainNameAddress(ref host, port) => (host.as_str(), port),
        };

        let mut last_err = io::Error::new(ErrorKind::NotFound, format!("{host}:{port} resolved to no address"));
        for sa in tokio::net::lookup_host((host, port)).await? {
            match TcpStream::connect_with_opts(&sa, opts).await {
                Ok(stream) => {
                    trace!("connected {} via {}", addr, sa);
                    return Ok(stream);
                }
                Err(err) => {
                    debug!("connect {} via {} failed, error: {}", addr, sa, err);
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    pub fn into_inner(self) -> TokioTcpStream {
        self.inner
    }
}

/// Bind to `opts.bind_local_addr` when it has the family of `addr`
async fn open_stream(addr: &SocketAddr, opts: &ConnectOpts) -> io::Result<TokioTcpStream> {
    let stream = match opts.bind_local_addr {
        Some(local_ip) if local_ip.is_ipv4() == addr.is_ipv4() => {
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            socket.bind(SocketAddr::new(local_ip, 0))?;
            socket.connect(*addr).await?
        }
        _ => TokioTcpStream::connect(addr).await?,
    };

    stream.set_nodelay(opts.tcp.nodelay)?;
    Ok(stream)
}

impl Deref for TcpStream {
    type Target = TokioTcpStream;

    fn deref(&self) -> &TokioTcpStream {
        &self.inner
    }
}

impl AsyncRead for TcpStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut task::Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut task::Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Listener whose accepted sockets get `AcceptOpts` applied
#[derive(Debug)]
pub struct TcpListener {
    inner: TokioTcpListener,
    accept_opts: AcceptOpts,
}

impl TcpListener {
    pub async fn bind_with_opts(addr: &SocketAddr, accept_opts: AcceptOpts) -> io::Result<TcpListener> {
        let inner = TokioTcpListener::bind(addr).await?;
        Ok(TcpListener { inner, accept_opts })
    }

    /// Bind to `addr`, a host name is bound at the first of its addresses that is bindable
    pub async fn bind_remote_with_opts(addr: &Address, accept_opts: AcceptOpts) -> io::Result<TcpListener> {
        let inner = match *addr {
            Address::SocketAddress(ref sa) => TokioTcpListener::bind(sa).await?,
            Address::DomainNameAddress(ref host, port) => TokioTcpListener::bind((host.as_str(), port)).await?,
        };
        Ok(TcpListener { inner, accept_opts })
    }

    pub async fn accept(&self) -> io::Result<(TokioTcpStream, SocketAddr)> {
        let (stream, peer_addr) = self.inner.accept().await?;
        stream.set_nodelay(self.accept_opts.tcp.nodelay)?;
        Ok((stream, peer_addr))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use std::{net::Ipv4Addr, time::Duration};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::net::TcpSocketOpts;

    #[tokio::test]
    async fn connect_by_host_name() {
        let accept_opts = AcceptOpts {
            tcp: TcpSocketOpts { nodelay: true },
        };
        let listener = TcpListener::bind_with_opts(&SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0), accept_opts)
            .await
            .unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            assert!(stream.nodelay().unwrap());
            stream.write_all(b"hi").await.unwrap();
        });

        let opts = ConnectOpts {
            connect_timeout: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        let addr = Address::DomainNameAddress("localhost".to_owned(), port);
        let mut stream = match TcpStream::connect_remote_with_opts(&addr, &opts).await {
            Ok(s) => s,
            // localhost may resolve to ::1 only, which the v4 listener doesn't serve
            Err(..) => TcpStream::connect_with_opts(&SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port), &opts)
                .await
                .unwrap(),
        };

        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        server.await.unwrap();
    }
}
