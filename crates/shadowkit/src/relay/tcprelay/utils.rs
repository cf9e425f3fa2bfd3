//! Relaying between a proxy stream and a plain stream

use std::io::{self, ErrorKind};

use log::trace;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::crypto::CipherKind;

use super::cipher::max_record_len;

/// Copy buffer of plain streams
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Buffer for reading plaintext bound for a `method` stream, one read fills at most one record
pub fn alloc_plain_read_buffer(method: CipherKind) -> Box<[u8]> {
    let size = max_record_len(method).unwrap_or(DEFAULT_BUFFER_SIZE);
    vec![0u8; size].into_boxed_slice()
}

/// Copy `reader` into `writer` until EOF, then shut `writer` down
async fn pump<R, W>(reader: &mut R, writer: &mut W, mut buffer: Box<[u8]>) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }

        let mut chunk = &buffer[..n];
        while !chunk.is_empty() {
            match writer.write(chunk).await? {
                0 => return Err(ErrorKind::WriteZero.into()),
                written => chunk = &chunk[written..],
            }
        }
        total += n as u64;
    }

    writer.flush().await?;
    writer.shutdown().await?;
    Ok(total)
}

async fn pump_both<A, B>(a: &mut A, b: &mut B, a_buffer: Box<[u8]>, b_buffer: Box<[u8]>) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let (mut a_reader, mut a_writer) = tokio::io::split(a);
    let (mut b_reader, mut b_writer) = tokio::io::split(b);

    // An error in one direction drops the other one
    let result = tokio::try_join!(
        pump(&mut a_reader, &mut b_writer, a_buffer),
        pump(&mut b_reader, &mut a_writer, b_buffer),
    );
    match result {
        Ok((a_to_b, b_to_a)) => trace!("relay finished, {} bytes a to b, {} bytes b to a", a_to_b, b_to_a),
        Err(ref err) => trace!("relay aborted, {}", err),
    }
    result
}

/// Relay between `encrypted` and `plain` in both directions
///
/// EOF of one side shuts down the other side's writer while the opposite direction continues.
/// Returns bytes copied from `encrypted` to `plain` and from `plain` to `encrypted`.
pub async fn copy_encrypted_bidirectional<E, P>(
    method: CipherKind,
    encrypted: &mut E,
    plain: &mut P,
) -> io::Result<(u64, u64)>
where
    E: AsyncRead + AsyncWrite + Unpin + ?Sized,
    P: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    pump_both(encrypted, plain, alloc_plain_read_buffer(method), alloc_plain_read_buffer(method)).await
}

/// Relay between two plain streams in both directions
pub async fn copy_bidirectional<A, B>(a: &mut A, b: &mut B) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let buffer = || vec![0u8; DEFAULT_BUFFER_SIZE].into_boxed_slice();
    pump_both(a, b, buffer(), buffer()).await
}
