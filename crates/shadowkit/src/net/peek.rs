//! Stream adapter that could look at the first byte without consuming it

use std::{
    io,
    pin::Pin,
    task::{self, Poll},
};

use futures::{future, ready};
use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Stream with at most one byte buffered in front
///
/// Reads return the peeked byte first, then fall through to the underlying stream.
#[pin_project]
#[derive(Debug)]
pub struct PeekableStream<S> {
    #[pin]
    stream: S,
    peeked: Option<u8>,
}

impl<S> PeekableStream<S> {
    pub fn new(stream: S) -> PeekableStream<S> {
        PeekableStream { stream, peeked: None }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Return the underlying stream, a byte that is peeked but not read yet is lost
    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S> PeekableStream<S>
where
    S: AsyncRead + Unpin,
{
    /// Poll for the first unread byte without consuming it
    ///
    /// `Ok(None)` if the stream is at EOF.
    pub fn poll_peek_u8(&mut self, cx: &mut task::Context<'_>) -> Poll<io::Result<Option<u8>>> {
        if let Some(b) = self.peeked {
            return Ok(Some(b)).into();
        }

        let mut byte = [0u8; 1];
        let mut read_buf = ReadBuf::new(&mut byte);
        ready!(Pin::new(&mut self.stream).poll_read(cx, &mut read_buf))?;

        if read_buf.filled().is_empty() {
            return Ok(None).into();
        }

        self.peeked = Some(byte[0]);
        Ok(self.peeked).into()
    }

    /// Look at the first unread byte without consuming it
    pub async fn peek_u8(&mut self) -> io::Result<Option<u8>> {
        future::poll_fn(|cx| self.poll_peek_u8(cx)).await
    }
}

impl<S> AsyncRead for PeekableStream<S>
where
    S: AsyncRead,
{
    fn poll_read(self: Pin<&mut Self>, cx: &mut task::Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        if buf.remaining() == 0 {
            return Ok(()).into();
        }

        if let Some(b) = this.peeked.take() {
            buf.put_slice(&[b]);
            return Ok(()).into();
        }

        this.stream.poll_read(cx, buf)
    }
}

impl<S> AsyncWrite for PeekableStream<S>
where
    S: AsyncWrite,
{
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

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn peeked_byte_is_read_again() {
        let (mut a, b) = tokio::io::duplex(64);
        a.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        drop(a);

        let mut stream = PeekableStream::new(b);
        assert_eq!(stream.peek_u8().await.unwrap(), Some(0x05));
        assert_eq!(stream.peek_u8().await.unwrap(), Some(0x05));

        let mut all = Vec::new();
        stream.read_to_end(&mut all).await.unwrap();
        assert_eq!(all, [0x05, 0x01, 0x00]);
    }

    #[tokio::test]
    async fn peek_at_eof() {
        let (a, b) = tokio::io::duplex(64);
        drop(a);

        let mut stream = PeekableStream::new(b);
        assert_eq!(stream.peek_u8().await.unwrap(), None);
    }
}
