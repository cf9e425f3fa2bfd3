//! Server end of a Shadowsocks TCP stream, and the listener producing it

use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{self, Poll, Waker},
};

use bytes::Bytes;
use futures::ready;
use log::{trace, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};

use crate::{
    config::{ServerConfig, ServerUser, ServerUserManager},
    context::SharedContext,
    crypto::CipherKind,
    net::{AcceptOpts, TcpListener},
    relay::Address,
};

use super::{cipher::Role, fresh_nonce, header::RequestHeader, reader::RecordReader, writer::RecordWriter};

enum ResponseState {
    /// A 2022 response echoes the request salt, so writes wait until the reader has it
    AwaitRequest(Option<Waker>),
    Ready,
}

/// Stream from a Shadowsocks client
///
/// [`handshake`](ProxyServerStream::handshake) reads the target first, reads and writes are
/// relayed payload after that.
pub struct ProxyServerStream<S> {
    stream: S,
    method: CipherKind,
    reader: RecordReader,
    writer: RecordWriter,
    response: ResponseState,
    context: SharedContext,
    handshaked: bool,
}

impl<S> ProxyServerStream<S> {
    pub fn from_stream(context: SharedContext, stream: S, method: CipherKind, key: &[u8]) -> ProxyServerStream<S> {
        ProxyServerStream::from_stream_with_users(context, stream, method, key, None)
    }

    /// Like [`from_stream`](Self::from_stream), 2022 clients are identified in `users`
    pub fn from_stream_with_users(
        context: SharedContext,
        stream: S,
        method: CipherKind,
        key: &[u8],
        users: Option<Arc<ServerUserManager>>,
    ) -> ProxyServerStream<S> {
        let nonce = fresh_nonce(&context, method);
        let response = if method.is_aead_2022() {
            ResponseState::AwaitRequest(None)
        } else {
            ResponseState::Ready
        };

        ProxyServerStream {
            stream,
            method,
            reader: RecordReader::new(Role::Server, method, key).with_users(users),
            writer: RecordWriter::new(Role::Server, method, key, &nonce, &[]),
            response,
            context,
            handshaked: false,
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

    /// User selected by the client's identity header
    pub fn user(&self) -> Option<&Arc<ServerUser>> {
        self.reader.user()
    }

    /// Salt (or IV) of the client
    pub fn received_nonce(&self) -> Option<&[u8]> {
        self.reader.nonce()
    }
}

impl<S> ProxyServerStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Read the request header, returns the target the client asks for
    ///
    /// Must be called once, before any read.
    pub async fn handshake(&mut self) -> io::Result<Address> {
        if self.handshaked {
            return Err(io::Error::other("request header was already read"));
        }
        self.handshaked = true;

        let header = RequestHeader::read_from(self.method, self).await?;

        if header.padding == Some(0) {
            match self.reader.record_progress() {
                (1, 0) => return Err(io::Error::other("first record carries neither payload nor padding")),
                (records, _) if records > 1 => warn!("request header of {} spans {} records", header.addr, records),
                _ => {}
            }
        }

        trace!("{} request to {}", self.method, header.addr);
        Ok(header.addr)
    }
}

impl<S> AsyncRead for ProxyServerStream<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read(self: Pin<&mut Self>, cx: &mut task::Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.handshaked {
            return Poll::Ready(Err(io::Error::other("request header wasn't read yet")));
        }

        ready!(this.reader.poll_read_decrypted(cx, &this.context, &mut this.stream, buf))?;

        if let ResponseState::AwaitRequest(ref mut waker) = this.response {
            if let Some(waker) = waker.take() {
                waker.wake();
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl<S> AsyncWrite for ProxyServerStream<S>
where
    S: AsyncWrite + Unpin,
{
    fn poll_write(self: Pin<&mut Self>, cx: &mut task::Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if let ResponseState::AwaitRequest(ref mut waker) = this.response {
            match this.reader.nonce() {
                Some(request_salt) => {
                    let user_key = this.reader.user().map(|user| user.key());
                    this.writer.bind_request(request_salt, user_key);
                    this.response = ResponseState::Ready;
                }
                None => {
                    if !waker.as_ref().is_some_and(|w| w.will_wake(cx.waker())) {
                        *waker = Some(cx.waker().clone());
                    }
                    return Poll::Pending;
                }
            }
        }

        this.writer
            .poll_write_encrypted(cx, &mut this.stream, buf)
            .map_err(Into::into)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// TCP listener of a Shadowsocks server
///
/// Accepted streams still have to [`handshake`](ProxyServerStream::handshake).
#[derive(Debug)]
pub struct ProxyListener {
    listener: TcpListener,
    method: CipherKind,
    key: Bytes,
    users: Option<Arc<ServerUserManager>>,
    context: SharedContext,
}

impl ProxyListener {
    pub async fn bind(context: SharedContext, svr_cfg: &ServerConfig) -> io::Result<ProxyListener> {
        let listener = TcpListener::bind_remote_with_opts(svr_cfg.addr(), AcceptOpts::default()).await?;
        Ok(ProxyListener::from_listener(context, listener, svr_cfg))
    }

    pub fn from_listener(context: SharedContext, listener: TcpListener, svr_cfg: &ServerConfig) -> ProxyListener {
        ProxyListener {
            listener,
            method: svr_cfg.method(),
            key: Bytes::copy_from_slice(svr_cfg.key()),
            users: svr_cfg.clone_user_manager(),
            context,
        }
    }

    pub async fn accept(&self) -> io::Result<(ProxyServerStream<TcpStream>, SocketAddr)> {
        let (stream, peer_addr) = self.listener.accept().await?;
        trace!("{} client {} connected", self.method, peer_addr);

        let stream = ProxyServerStream::from_stream_with_users(
            self.context.clone(),
            stream,
            self.method,
            &self.key,
            self.users.clone(),
        );
        Ok((stream, peer_addr))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}
