//! Encrypting half of a Shadowsocks TCP stream

use std::{
    io::{self, ErrorKind},
    iter,
    pin::Pin,
    task::{self, Poll},
};

use byte_string::ByteStr;
use bytes::{BufMut, Bytes, BytesMut};
use futures::ready;
use log::trace;
use tokio::io::AsyncWrite;

use crate::crypto::{
    v2::{identity_hash, unix_timestamp, BlockCipher},
    CipherCategory,
    CipherKind,
};

use super::{
    cipher::{max_record_len, RecordCipher, Role, AEAD_2022_MAX_RECORD_LEN},
    error::ProtocolResult,
};

enum WriteState {
    Idle,
    /// `pending[written..]` is still on its way, then `consumed` input bytes are reported
    Flushing { written: usize, consumed: usize },
}

/// Seals plaintext into records of one direction
///
/// The salt (and identity headers of a 2022 client) goes out in front of the first record. A 2022
/// stream starts with a header record, sent on the first write even if it carries no data.
pub struct RecordWriter {
    method: CipherKind,
    role: Role,
    cipher: Option<RecordCipher>,
    nonce: Bytes,
    pending: BytesMut,
    state: WriteState,
    header_sent: bool,
    request_salt: Option<Bytes>,
}

impl RecordWriter {
    /// Writer that sends `nonce` in front of the first record
    ///
    /// A 2022 client chains one identity header per entry of `identity_keys`, each carrying the
    /// hash of the next key, the last one the hash of `key`.
    pub fn new(role: Role, method: CipherKind, key: &[u8], nonce: &[u8], identity_keys: &[Bytes]) -> RecordWriter {
        let mut pending = BytesMut::with_capacity(nonce.len() + identity_keys.len() * 16);
        pending.put_slice(nonce);

        if role == Role::Client && method.support_eih() {
            let next_keys = identity_keys.iter().skip(1).map(|k| &k[..]).chain(iter::once(key));
            for (ipsk, next_key) in identity_keys.iter().zip(next_keys) {
                let mut block = identity_hash(next_key);
                BlockCipher::identity(method, ipsk, nonce).encrypt_block(&mut block);
                trace!("identity header {:?}", ByteStr::new(&block));
                pending.put_slice(&block);
            }
        }

        let cipher = match method.category() {
            CipherCategory::None => None,
            _ => Some(RecordCipher::new(method, key, nonce)),
        };

        RecordWriter {
            method,
            role,
            cipher,
            nonce: Bytes::copy_from_slice(nonce),
            pending,
            state: WriteState::Idle,
            header_sent: !method.is_aead_2022(),
            request_salt: None,
        }
    }

    /// Salt (or IV) sent to the peer
    pub fn nonce(&self) -> &[u8] {
        &self.nonce
    }

    /// Bind a 2022 response to the request it answers
    ///
    /// `user_key` re-keys the response for the user selected by the request's identity header.
    pub fn bind_request(&mut self, request_salt: &[u8], user_key: Option<&[u8]>) {
        debug_assert_eq!(self.role, Role::Server);
        self.request_salt = Some(Bytes::copy_from_slice(request_salt));
        if let Some(key) = user_key {
            self.cipher = Some(RecordCipher::new(self.method, key, &self.nonce));
        }
    }

    /// Seal `buf` and write it to `stream`
    ///
    /// Returns how much of `buf` was consumed once everything sealed for it is written. Callers
    /// retry with the same `buf` after `Pending`, as with any `AsyncWrite`.
    pub fn poll_write_encrypted<S>(
        &mut self,
        cx: &mut task::Context<'_>,
        stream: &mut S,
        buf: &[u8],
    ) -> Poll<ProtocolResult<usize>>
    where
        S: AsyncWrite + Unpin + ?Sized,
    {
        loop {
            match self.state {
                WriteState::Idle => {
                    let consumed = self.seal(buf);
                    if self.pending.is_empty() {
                        return Poll::Ready(Ok(0));
                    }
                    self.state = WriteState::Flushing { written: 0, consumed };
                }
                WriteState::Flushing {
                    ref mut written,
                    consumed,
                } => {
                    while *written < self.pending.len() {
                        let n = ready!(Pin::new(&mut *stream).poll_write(cx, &self.pending[*written..]))?;
                        if n == 0 {
                            return Poll::Ready(Err(io::Error::from(ErrorKind::WriteZero).into()));
                        }
                        *written += n;
                    }

                    self.pending.clear();
                    self.state = WriteState::Idle;
                    return Poll::Ready(Ok(consumed));
                }
            }
        }
    }

    fn seal(&mut self, buf: &[u8]) -> usize {
        let limit = max_record_len(self.method).unwrap_or(AEAD_2022_MAX_RECORD_LEN);
        let data = &buf[..buf.len().min(limit)];
        let tag_len = self.method.tag_len();

        let cipher = match self.cipher {
            None => {
                self.pending.put_slice(data);
                return data.len();
            }
            Some(ref mut cipher) => cipher,
        };

        if !self.method.is_aead() && !self.method.is_aead_2022() {
            let start = self.pending.len();
            self.pending.put_slice(data);
            cipher.seal(&mut self.pending[start..]);
            return data.len();
        }

        if !self.header_sent {
            self.header_sent = true;

            let mut header = BytesMut::with_capacity(1 + 8 + self.nonce.len() + 2);
            header.put_u8(self.role.header_type());
            header.put_u64(unix_timestamp());
            if let Some(ref request_salt) = self.request_salt {
                header.put_slice(request_salt);
            }
            header.put_u16(data.len() as u16);

            seal_record(cipher, tag_len, &header, &mut self.pending);
            seal_record(cipher, tag_len, data, &mut self.pending);
            return data.len();
        }

        if data.is_empty() {
            return 0;
        }
        seal_record(cipher, tag_len, &(data.len() as u16).to_be_bytes(), &mut self.pending);
        seal_record(cipher, tag_len, data, &mut self.pending);
        data.len()
    }
}

fn seal_record(cipher: &mut RecordCipher, tag_len: usize, plain: &[u8], dst: &mut BytesMut) {
    let start = dst.len();
    dst.put_slice(plain);
    dst.put_bytes(0, tag_len);
    cipher.seal(&mut dst[start..]);
}
