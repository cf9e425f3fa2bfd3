//! Trojan client stream

use std::{
    io::{self, ErrorKind},
    pin::Pin,
    task::{self, Poll},
};

use bytes::{BufMut, BytesMut};
use futures::ready;
use log::trace;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::relay::Address;

use super::{
    protocol::{Command, RequestHeader},
    KEY_LEN,
};

enum TrojanClientWriteState {
    Connect(RequestHeader),
    Connecting { buffer: BytesMut, pos: usize, consumed: usize },
    Connected,
}

/// A `Connect` stream to a Trojan server
///
/// The request header is sent together with the first write.
pub struct TrojanClientStream<S> {
    stream: S,
    state: TrojanClientWriteState,
}

impl<S> TrojanClientStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Create a stream over `stream`, which must be the TLS stream to the server
    pub fn from_stream<A>(stream: S, key: [u8; KEY_LEN], addr: A) -> TrojanClientStream<S>
    where
        A: Into<Address>,
    {
        TrojanClientStream {
            stream,
            state: TrojanClientWriteState::Connect(RequestHeader::new(key, Command::Connect, addr.into())),
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S> AsyncRead for TrojanClientStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(self: Pin<&mut Self>, cx: &mut task::Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl<S> AsyncWrite for TrojanClientStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(self: Pin<&mut Self>, cx: &mut task::Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        loop {
            match this.state {
                TrojanClientWriteState::Connect(ref header) => {
                    let mut buffer = BytesMut::with_capacity(header.serialized_len() + buf.len());
                    header.write_to_buf(&mut buffer);
                    buffer.put_slice(buf);

                    trace!("sending trojan request to {}, payload {} bytes", header.address, buf.len());

                    this.state = TrojanClientWriteState::Connecting {
                        buffer,
                        pos: 0,
                        consumed: buf.len(),
                    };
                }
                TrojanClientWriteState::Connecting {
                    ref buffer,
                    ref mut pos,
                    consumed,
                } => {
                    while *pos < buffer.len() {
                        let n = ready!(Pin::new(&mut this.stream).poll_write(cx, &buffer[*pos..]))?;
                        if n == 0 {
                            return Err(ErrorKind::WriteZero.into()).into();
                        }
                        *pos += n;
                    }

                    this.state = TrojanClientWriteState::Connected;
                    return Ok(consumed).into();
                }
                TrojanClientWriteState::Connected => {
                    return Pin::new(&mut this.stream).poll_write(cx, buf);
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::relay::trojan::password_to_key;

    #[tokio::test]
    async fn header_coalesced_with_first_write() {
        let (client, mut server) = tokio::io::duplex(4096);
        let addr = SocketAddr::new(Ipv4Addr::new(1, 2, 3, 4).into(), 443);

        let mut stream = TrojanClientStream::from_stream(client, password_to_key("hunter2"), addr);
        stream.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
        stream.write_all(b"more").await.unwrap();
        drop(stream);

        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();

        assert_eq!(&received[..56], &password_to_key("hunter2")[..]);
        assert!(received.ends_with(b"GET / HTTP/1.1\r\nHost: x\r\n\r\nmore"));
        assert_eq!(received.len(), 56 + 2 + 1 + 7 + 2 + 27 + 4);
    }
}
