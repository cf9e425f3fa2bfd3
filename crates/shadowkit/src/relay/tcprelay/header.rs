//! Request header at the front of a client's plaintext
//!
//! ```plain
//! Stream, AEAD   ADDR
//! AEAD 2022      ADDR | PADDING_LEN (u16) | PADDING
//! ```
//!
//! A 2022 request whose first record carries no payload must be padded.

use std::io::{self, ErrorKind};

use bytes::BufMut;
use rand::{Rng, RngCore};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{
    crypto::{v2::MAX_PADDING_LEN, CipherKind},
    relay::Address,
};

/// Target of a proxied stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    pub addr: Address,
    /// Padding length, 2022 headers only
    pub padding: Option<u16>,
}

impl RequestHeader {
    /// Header for `addr`, followed by `payload_len` bytes of payload in the same record
    pub fn new(method: CipherKind, addr: Address, payload_len: usize) -> RequestHeader {
        let padding = method.is_aead_2022().then(|| match payload_len {
            0 => rand::thread_rng().gen_range(1..=MAX_PADDING_LEN) as u16,
            _ => 0,
        });
        RequestHeader { addr, padding }
    }

    pub async fn read_from<R>(method: CipherKind, reader: &mut R) -> io::Result<RequestHeader>
    where
        R: AsyncRead + Unpin,
    {
        let addr = Address::read_from(reader).await?;
        if !method.is_aead_2022() {
            return Ok(RequestHeader { addr, padding: None });
        }

        let padding = reader.read_u16().await?;
        let skipped = tokio::io::copy(&mut reader.take(padding as u64), &mut tokio::io::sink()).await?;
        if skipped < padding as u64 {
            return Err(ErrorKind::UnexpectedEof.into());
        }

        Ok(RequestHeader {
            addr,
            padding: Some(padding),
        })
    }

    /// # Panics
    ///
    /// If the padding is longer than `MAX_PADDING_LEN`.
    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        self.addr.write_to_buf(buf);

        if let Some(padding) = self.padding {
            let padding = padding as usize;
            assert!(padding <= MAX_PADDING_LEN, "padding of {padding} bytes is too long");

            buf.put_u16(padding as u16);
            let mut bytes = vec![0u8; padding];
            rand::thread_rng().fill_bytes(&mut bytes);
            buf.put_slice(&bytes);
        }
    }

    pub fn serialized_len(&self) -> usize {
        self.addr.serialized_len() + self.padding.map_or(0, |p| 2 + p as usize)
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};

    use super::*;

    fn target() -> Address {
        Address::SocketAddress(SocketAddr::new(Ipv4Addr::new(1, 2, 3, 4).into(), 80))
    }

    #[test]
    fn padding_only_without_payload() {
        let method = CipherKind::AEAD2022_BLAKE3_AES_128_GCM;

        let empty = RequestHeader::new(method, target(), 0);
        let padding = empty.padding.unwrap();
        assert!((1..=MAX_PADDING_LEN as u16).contains(&padding));
        assert_eq!(empty.serialized_len(), 7 + 2 + padding as usize);

        assert_eq!(RequestHeader::new(method, target(), 10).padding, Some(0));
        assert_eq!(RequestHeader::new(CipherKind::AES_128_GCM, target(), 0).padding, None);
    }

    #[tokio::test]
    async fn padding_is_skipped() {
        let method = CipherKind::AEAD2022_BLAKE3_AES_256_GCM;
        let header = RequestHeader::new(method, target(), 0);

        let mut wire = Vec::new();
        header.write_to_buf(&mut wire);
        assert_eq!(wire.len(), header.serialized_len());
        wire.extend_from_slice(b"payload");

        let mut reader = &wire[..];
        let decoded = RequestHeader::read_from(method, &mut reader).await.unwrap();
        assert_eq!(decoded, header);
        assert_eq!(reader, b"payload");
    }

    #[tokio::test]
    async fn truncated_padding() {
        let mut wire = Vec::new();
        target().write_to_buf(&mut wire);
        wire.extend_from_slice(&[0x00, 0x10, 0xAA]);

        let err = RequestHeader::read_from(CipherKind::AEAD2022_BLAKE3_AES_128_GCM, &mut &wire[..])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }
}
