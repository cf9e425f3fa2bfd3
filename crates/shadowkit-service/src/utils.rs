//! Relay utilities

use std::{
    future::Future,
    io,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures::ready;
use log::{debug, trace};
use shadowkit::{
    crypto::CipherKind,
    relay::{
        tcprelay::utils::{alloc_plain_read_buffer, copy_encrypted_bidirectional},
        Address,
    },
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    task::JoinHandle,
    time,
};

/// A spawned inbound server
///
/// Resolves to the server's result, the task is aborted when the handle drops.
pub struct ServerHandle(pub JoinHandle<io::Result<()>>);

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl Future for ServerHandle {
    type Output = io::Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match ready!(Pin::new(&mut self.0).poll(cx)) {
            Ok(res) => res.into(),
            Err(err) => Err(io::Error::other(err)).into(),
        }
    }
}

/// How long the first read of a tunnel waits for data to go out with the request header
pub const EAGER_PAYLOAD_TIMEOUT: Duration = Duration::from_millis(300);

/// Relay between a client's `plain` stream and a `shadow` stream connected to a proxy server
///
/// `shadow` sends its request header with the first write. The first read on `plain` waits at most
/// `EAGER_PAYLOAD_TIMEOUT`, so the header and the client's first bytes travel in one packet. Clients
/// of protocols where the server speaks first, like FTP, get the header sent alone after that.
pub async fn establish_tcp_tunnel<P, S>(
    method: CipherKind,
    plain: &mut P,
    shadow: &mut S,
    peer_addr: SocketAddr,
    target_addr: &Address,
) -> io::Result<()>
where
    P: AsyncRead + AsyncWrite + Unpin + ?Sized,
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    {
        let mut buffer = alloc_plain_read_buffer(method);
        match time::timeout(EAGER_PAYLOAD_TIMEOUT, plain.read(&mut buffer)).await {
            Ok(Ok(0)) => {
                // EOF. Just terminate right here.
                return Ok(());
            }
            Ok(Ok(n)) => {
                shadow.write_all(&buffer[..n]).await?;
            }
            Ok(Err(err)) => return Err(err),
            Err(..) => {
                // Timeout. Send the header alone.
                shadow.write(&[]).await?;
            }
        }
    }

    debug!("established tcp tunnel {} <-> {}", peer_addr, target_addr);

    match copy_encrypted_bidirectional(method, shadow, plain).await {
        Ok((rn, wn)) => {
            trace!(
                "tcp tunnel {} <-> {} closed, L2R {} bytes, R2L {} bytes",
                peer_addr,
                target_addr,
                wn,
                rn
            );
        }
        Err(err) => {
            trace!("tcp tunnel {} <-> {} closed with error: {}", peer_addr, target_addr, err);
        }
    }

    Ok(())
}

/// Consumes all data from `reader` and throws away until EOF
pub async fn ignore_until_end<R>(reader: &mut R) -> io::Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buffer = [0u8; 2048];
    while reader.read(&mut buffer).await? != 0 {}
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{
        net::{Ipv4Addr, SocketAddr},
        time::Instant,
    };

    use tokio::io::AsyncWriteExt;

    use super::*;

    #[tokio::test]
    async fn header_sent_alone_after_timeout() {
        let (mut client, mut plain) = tokio::io::duplex(1024);
        let (mut shadow, mut server) = tokio::io::duplex(1024);

        let peer_addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 1);
        let target_addr = Address::from(SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 2));

        let start = Instant::now();
        let tunnel = tokio::spawn(async move {
            establish_tcp_tunnel(CipherKind::NONE, &mut plain, &mut shadow, peer_addr, &target_addr).await
        });

        // Server speaks first
        server.write_all(b"220 welcome").await.unwrap();
        let mut buf = [0u8; 11];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"220 welcome");
        assert!(start.elapsed() >= EAGER_PAYLOAD_TIMEOUT);

        client.write_all(b"USER x").await.unwrap();
        let mut buf = [0u8; 6];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"USER x");

        drop(client);
        drop(server);
        tunnel.await.unwrap().unwrap();
    }
}
