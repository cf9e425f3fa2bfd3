//! Client end of a Shadowsocks TCP stream

use std::{
    io::{self, ErrorKind},
    pin::Pin,
    task::{self, Poll},
};

use bytes::{BufMut, BytesMut};
use futures::ready;
use log::trace;
use once_cell::sync::Lazy;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::{
    config::ServerConfig,
    context::SharedContext,
    crypto::CipherKind,
    net::{ConnectOpts, TcpStream as OutboundTcpStream},
    relay::Address,
};

use super::{
    cipher::{max_record_len, Role},
    fresh_nonce,
    header::RequestHeader,
    reader::RecordReader,
    writer::RecordWriter,
};

static DEFAULT_CONNECT_OPTS: Lazy<ConnectOpts> = Lazy::new(ConnectOpts::default);

enum RequestState {
    /// Nothing written yet, the target goes out with the first write
    Pending(Address),
    /// Header and the first payload, `buffer[pos..]` isn't accepted by the writer yet
    Sending { buffer: BytesMut, pos: usize, consumed: usize },
    Sent,
}

/// Stream to a target, relayed by a Shadowsocks server
///
/// The request header is coalesced with the first write. Writing an empty buffer sends the header
/// alone, for protocols where the server speaks first.
pub struct ProxyClientStream<S> {
    stream: S,
    method: CipherKind,
    reader: RecordReader,
    writer: RecordWriter,
    request: RequestState,
    context: SharedContext,
}

impl ProxyClientStream<OutboundTcpStream> {
    /// Connect to the server of `svr_cfg` and relay to `addr`
    pub async fn connect<A>(context: SharedContext, svr_cfg: &ServerConfig, addr: A) -> io::Result<Self>
    where
        A: Into<Address>,
    {
        ProxyClientStream::connect_with_opts(context, svr_cfg, addr, &DEFAULT_CONNECT_OPTS).await
    }

    pub async fn connect_with_opts<A>(
        context: SharedContext,
        svr_cfg: &ServerConfig,
        addr: A,
        opts: &ConnectOpts,
    ) -> io::Result<Self>
    where
        A: Into<Address>,
    {
        let stream = OutboundTcpStream::connect_remote_with_opts(svr_cfg.addr(), opts).await?;
        trace!("connected to {} server {}", svr_cfg.method(), svr_cfg.addr());
        Ok(ProxyClientStream::from_stream(context, stream, svr_cfg, addr))
    }
}

impl<S> ProxyClientStream<S> {
    /// Wrap `stream`, already connected to the server of `svr_cfg`
    pub fn from_stream<A>(context: SharedContext, stream: S, svr_cfg: &ServerConfig, addr: A) -> ProxyClientStream<S>
    where
        A: Into<Address>,
    {
        let method = svr_cfg.method();
        let nonce = fresh_nonce(&context, method);

        let mut reader = RecordReader::new(Role::Client, method, svr_cfg.key());
        if method.is_aead_2022() {
            reader.bind_request_salt(&nonce);
        }
        let writer = RecordWriter::new(Role::Client, method, svr_cfg.key(), &nonce, svr_cfg.identity_keys());

        ProxyClientStream {
            stream,
            method,
            reader,
            writer,
            request: RequestState::Pending(addr.into()),
            context,
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

    /// Salt (or IV) sent to the server
    pub fn sent_nonce(&self) -> &[u8] {
        self.writer.nonce()
    }

    /// Salt (or IV) of the server, after the first read
    pub fn received_nonce(&self) -> Option<&[u8]> {
        self.reader.nonce()
    }
}

impl<S> AsyncRead for ProxyClientStream<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read(self: Pin<&mut Self>, cx: &mut task::Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.reader
            .poll_read_decrypted(cx, &this.context, &mut this.stream, buf)
            .map_err(Into::into)
    }
}

impl<S> AsyncWrite for ProxyClientStream<S>
where
    S: AsyncWrite + Unpin,
{
    fn poll_write(self: Pin<&mut Self>, cx: &mut task::Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        loop {
            match this.request {
                RequestState::Pending(ref addr) => {
                    let method = this.method;
                    let payload_limit = first_payload_limit(method, addr);
                    let payload = &buf[..buf.len().min(payload_limit)];

                    let header = RequestHeader::new(method, addr.clone(), payload.len());
                    let mut buffer = BytesMut::with_capacity(header.serialized_len() + payload.len());
                    header.write_to_buf(&mut buffer);
                    buffer.put_slice(payload);
                    trace!("request to {} with {} bytes of payload", addr, payload.len());

                    this.request = RequestState::Sending {
                        buffer,
                        pos: 0,
                        consumed: payload.len(),
                    };
                }
                RequestState::Sending {
                    ref buffer,
                    ref mut pos,
                    consumed,
                } => {
                    while *pos < buffer.len() {
                        let n = ready!(this.writer.poll_write_encrypted(cx, &mut this.stream, &buffer[*pos..]))?;
                        if n == 0 {
                            return Poll::Ready(Err(ErrorKind::WriteZero.into()));
                        }
                        *pos += n;
                    }

                    this.request = RequestState::Sent;
                    return Poll::Ready(Ok(consumed));
                }
                RequestState::Sent => {
                    return this
                        .writer
                        .poll_write_encrypted(cx, &mut this.stream, buf)
                        .map_err(Into::into);
                }
            }
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// Payload that fits in the first record behind the request header
///
/// The header is measured as if payload followed, a 2022 header is only padded when none does.
fn first_payload_limit(method: CipherKind, addr: &Address) -> usize {
    match max_record_len(method) {
        Some(max) => {
            let header_len = RequestHeader::new(method, addr.clone(), 1).serialized_len();
            max.saturating_sub(header_len)
        }
        None => usize::MAX,
    }
}
