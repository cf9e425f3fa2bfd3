//! Decrypting half of a Shadowsocks TCP stream
//!
//! ```plain
//! AEAD        SALT | LEN+TAG | DATA+TAG | LEN+TAG | DATA+TAG | ...
//! AEAD 2022   SALT | EIH * N | (TYPE TIMESTAMP [REQUEST_SALT] LEN)+TAG | DATA+TAG | LEN+TAG | DATA+TAG | ...
//! Stream      IV   | ciphertext
//! ```
//!
//! Identity headers (EIH) are only present in requests to servers with a user table. A response
//! echoes the salt of the request it answers.

use std::{
    io::{self, ErrorKind},
    pin::Pin,
    sync::Arc,
    task::{self, Poll},
};

use byte_string::ByteStr;
use bytes::{Buf, Bytes};
use futures::ready;
use log::trace;
use tokio::io::{AsyncRead, ReadBuf};

use crate::{
    config::{ServerUser, ServerUserManager},
    context::Context,
    crypto::{
        v2::{unix_timestamp, BlockCipher, TIMESTAMP_TOLERANCE},
        CipherCategory,
        CipherKind,
    },
};

use super::{
    cipher::{RecordCipher, Role, AEAD_MAX_RECORD_LEN},
    error::{ProtocolError, ProtocolResult},
};

pub(crate) const IDENTITY_HEADER_LEN: usize = 16;

enum ReadState {
    /// Salt or IV, and for 2022 the identity header and fixed header record behind it
    Greeting,
    /// `none` and stream ciphers, bytes are deciphered as they arrive
    Unframed,
    Length,
    Record { length: usize },
    Drain { pos: usize },
}

/// Reads one direction of a stream and yields its plaintext
pub struct RecordReader {
    method: CipherKind,
    role: Role,
    key: Bytes,
    state: ReadState,
    cipher: Option<RecordCipher>,
    buffer: Vec<u8>,
    nonce: Option<Bytes>,
    nonce_checked: bool,
    records: u64,
    sent_salt: Option<Bytes>,
    users: Option<Arc<ServerUserManager>>,
    user: Option<Arc<ServerUser>>,
}

impl RecordReader {
    pub fn new(role: Role, method: CipherKind, key: &[u8]) -> RecordReader {
        let mut reader = RecordReader {
            method,
            role,
            key: Bytes::copy_from_slice(key),
            state: ReadState::Greeting,
            cipher: None,
            buffer: Vec::new(),
            nonce: None,
            nonce_checked: false,
            records: 0,
            sent_salt: None,
            users: None,
            user: None,
        };

        if method.category() == CipherCategory::None {
            reader.state = ReadState::Unframed;
        } else if method.iv_or_salt_len() == 0 {
            reader.cipher = Some(RecordCipher::new(method, key, &[]));
            reader.nonce = Some(Bytes::new());
            reader.nonce_checked = true;
            reader.state = ReadState::Unframed;
        }

        reader
    }

    /// Identify 2022 clients by the identity header in front of their request
    pub fn with_users(mut self, users: Option<Arc<ServerUserManager>>) -> RecordReader {
        self.users = users;
        self
    }

    /// Accept only a response header that echoes `salt`, the salt this client sent
    pub fn bind_request_salt(&mut self, salt: &[u8]) {
        debug_assert_eq!(self.role, Role::Client);
        self.sent_salt = Some(Bytes::copy_from_slice(salt));
    }

    /// Salt (or IV) of the peer, once received
    pub fn nonce(&self) -> Option<&[u8]> {
        self.nonce.as_deref()
    }

    /// User selected by the identity header
    pub fn user(&self) -> Option<&Arc<ServerUser>> {
        self.user.as_ref()
    }

    /// Records opened so far, and plaintext of the latest record not returned yet
    pub fn record_progress(&self) -> (u64, usize) {
        match self.state {
            ReadState::Drain { pos } => (self.records, self.buffer.len() - pos),
            _ => (self.records, 0),
        }
    }

    fn expects_identity(&self) -> bool {
        self.role == Role::Server && self.method.support_eih() && self.users.is_some()
    }

    fn greeting_len(&self) -> usize {
        let nonce_len = self.method.iv_or_salt_len();
        if !self.method.is_aead_2022() {
            return nonce_len;
        }

        let identity_len = if self.expects_identity() { IDENTITY_HEADER_LEN } else { 0 };
        let echo_len = if self.role == Role::Client { nonce_len } else { 0 };
        nonce_len + identity_len + 1 + 8 + echo_len + 2 + self.method.tag_len()
    }

    /// Read plaintext into `buf`
    ///
    /// Nothing filled in means the peer closed the stream on a record boundary.
    pub fn poll_read_decrypted<S>(
        &mut self,
        cx: &mut task::Context<'_>,
        context: &Context,
        stream: &mut S,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<ProtocolResult<()>>
    where
        S: AsyncRead + Unpin + ?Sized,
    {
        let tag_len = self.method.tag_len();

        loop {
            match self.state {
                ReadState::Greeting => {
                    let len = self.greeting_len();
                    if !ready!(poll_fill(cx, stream, &mut self.buffer, len))? {
                        return Poll::Ready(Ok(()));
                    }
                    self.state = self.open_greeting(context)?;
                    self.buffer.clear();
                }
                ReadState::Unframed => return self.poll_read_unframed(cx, stream, buf),
                ReadState::Length => {
                    if !ready!(poll_fill(cx, stream, &mut self.buffer, 2 + tag_len))? {
                        return Poll::Ready(Ok(()));
                    }
                    let length = self.open_length()?;
                    self.buffer.clear();
                    self.state = ReadState::Record { length };
                }
                ReadState::Record { length } => {
                    if !ready!(poll_fill(cx, stream, &mut self.buffer, length + tag_len))? {
                        return Poll::Ready(Err(io::Error::from(ErrorKind::UnexpectedEof).into()));
                    }
                    self.open_record(context, length)?;
                    self.state = ReadState::Drain { pos: 0 };
                }
                ReadState::Drain { ref mut pos } => {
                    let rest = &self.buffer[*pos..];
                    if rest.is_empty() {
                        self.buffer.clear();
                        self.state = ReadState::Length;
                        continue;
                    }

                    let n = rest.len().min(buf.remaining());
                    buf.put_slice(&rest[..n]);
                    *pos += n;
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }

    fn poll_read_unframed<S>(
        &mut self,
        cx: &mut task::Context<'_>,
        stream: &mut S,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<ProtocolResult<()>>
    where
        S: AsyncRead + Unpin + ?Sized,
    {
        let filled = buf.filled().len();
        ready!(Pin::new(&mut *stream).poll_read(cx, buf))?;

        if let Some(ref mut cipher) = self.cipher {
            if !cipher.open(&mut buf.filled_mut()[filled..]) {
                return Poll::Ready(Err(ProtocolError::DecryptDataError));
            }
        }
        Poll::Ready(Ok(()))
    }

    fn open_greeting(&mut self, context: &Context) -> ProtocolResult<ReadState> {
        let nonce_len = self.method.iv_or_salt_len();
        let nonce = Bytes::copy_from_slice(&self.buffer[..nonce_len]);
        trace!("received {} nonce {:?}", self.method, ByteStr::new(&nonce));

        if !self.method.is_aead_2022() {
            self.cipher = Some(RecordCipher::new(self.method, &self.key, &nonce));
            self.nonce = Some(nonce);

            if self.method.is_aead() {
                // checked once the first record authenticates
                return Ok(ReadState::Length);
            }
            self.check_replay(context)?;
            return Ok(ReadState::Unframed);
        }

        let mut header_start = nonce_len;
        if self.expects_identity() {
            let mut user_hash = [0u8; IDENTITY_HEADER_LEN];
            user_hash.copy_from_slice(&self.buffer[nonce_len..nonce_len + IDENTITY_HEADER_LEN]);
            BlockCipher::identity(self.method, &self.key, &nonce).decrypt_block(&mut user_hash);

            self.user = self.users.as_ref().and_then(|users| users.get_user_by_hash(&user_hash));
            match self.user {
                Some(ref user) => trace!("identity header selects {:?}", user),
                None => trace!("identity header {:?} matches no user", ByteStr::new(&user_hash)),
            }
            header_start += IDENTITY_HEADER_LEN;
        }

        // Without a matching user the record is opened with the identity key, and fails
        let mut cipher = {
            let key = self.user.as_ref().map_or(&self.key[..], |user| user.key());
            RecordCipher::new(self.method, key, &nonce)
        };

        let record = &mut self.buffer[header_start..];
        if !cipher.open(record) {
            return Err(ProtocolError::DecryptLengthError);
        }
        let mut header = &record[..record.len() - self.method.tag_len()];

        let header_type = header.get_u8();
        if header_type != self.role.peer_header_type() {
            return Err(ProtocolError::InvalidStreamType(self.role.peer_header_type(), header_type));
        }

        let timestamp = header.get_u64();
        let now = unix_timestamp();
        if now.abs_diff(timestamp) > TIMESTAMP_TOLERANCE {
            return Err(ProtocolError::InvalidTimestamp(timestamp, now));
        }

        if self.role == Role::Client {
            let (echoed, rest) = header.split_at(nonce_len);
            if let Some(ref sent) = self.sent_salt {
                if sent[..] != *echoed {
                    return Err(ProtocolError::MismatchedRequestSalt);
                }
            }
            header = rest;
        }

        let length = header.get_u16() as usize;
        trace!("{} header type {} timestamp {} length {}", self.method, header_type, timestamp, length);

        self.cipher = Some(cipher);
        self.nonce = Some(nonce);

        // Responses are bound to our own salt, only requests need the replay filter
        if self.role == Role::Server {
            self.check_replay(context)?;
        } else {
            self.nonce_checked = true;
        }

        Ok(ReadState::Record { length })
    }

    fn open_length(&mut self) -> ProtocolResult<usize> {
        let cipher = self.cipher.as_mut().ok_or(ProtocolError::DecryptLengthError)?;
        if !cipher.open(&mut self.buffer) {
            return Err(ProtocolError::DecryptLengthError);
        }

        let length = u16::from_be_bytes([self.buffer[0], self.buffer[1]]) as usize;
        if self.method.is_aead() && length > AEAD_MAX_RECORD_LEN {
            return Err(ProtocolError::DataTooLong(length));
        }
        Ok(length)
    }

    fn open_record(&mut self, context: &Context, length: usize) -> ProtocolResult<()> {
        let cipher = self.cipher.as_mut().ok_or(ProtocolError::DecryptDataError)?;
        if !cipher.open(&mut self.buffer) {
            return Err(ProtocolError::DecryptDataError);
        }
        self.buffer.truncate(length);
        self.records += 1;

        // A salt enters the filter only after a record authenticates, garbage never fills it
        self.check_replay(context)
    }

    fn check_replay(&mut self, context: &Context) -> ProtocolResult<()> {
        if self.nonce_checked {
            return Ok(());
        }
        self.nonce_checked = true;

        match self.nonce {
            Some(ref nonce) if context.is_nonce_replayed(self.method, nonce) => Err(ProtocolError::SaltRepeated),
            _ => Ok(()),
        }
    }
}

/// Read from `stream` until `buffer` holds `size` bytes
///
/// `Ok(false)` if the stream ended before the first byte. Ending after it is `UnexpectedEof`.
fn poll_fill<S>(cx: &mut task::Context<'_>, stream: &mut S, buffer: &mut Vec<u8>, size: usize) -> Poll<io::Result<bool>>
where
    S: AsyncRead + Unpin + ?Sized,
{
    while buffer.len() < size {
        let start = buffer.len();
        buffer.resize(size, 0);

        let mut read_buf = ReadBuf::new(&mut buffer[start..]);
        let result = Pin::new(&mut *stream).poll_read(cx, &mut read_buf);
        let n = read_buf.filled().len();
        buffer.truncate(start + n);
        ready!(result)?;

        if n == 0 {
            if buffer.is_empty() {
                return Poll::Ready(Ok(false));
            }
            return Poll::Ready(Err(ErrorKind::UnexpectedEof.into()));
        }
    }
    Poll::Ready(Ok(true))
}
