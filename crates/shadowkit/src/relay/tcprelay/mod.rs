//! Shadowsocks over TCP
//!
//! Each direction of a connection is a [`RecordReader`] or [`RecordWriter`] over the socket.
//! [`ProxyClientStream`] and [`ProxyServerStream`] pair them and exchange the [`RequestHeader`].

pub use self::{
    cipher::{max_record_len, Role, AEAD_2022_MAX_RECORD_LEN, AEAD_MAX_RECORD_LEN},
    client::ProxyClientStream,
    error::{protocol_error, ProtocolError, ProtocolResult},
    header::RequestHeader,
    reader::RecordReader,
    server::{ProxyListener, ProxyServerStream},
    writer::RecordWriter,
};

use crate::{context::Context, crypto::CipherKind};

mod cipher;
mod client;
mod error;
mod header;
mod reader;
mod server;
pub mod utils;
mod writer;

/// Unique salt (or IV) for a new stream, empty for methods without one
fn fresh_nonce(context: &Context, method: CipherKind) -> Vec<u8> {
    let mut nonce = vec![0u8; method.iv_or_salt_len()];
    context.generate_nonce(method, &mut nonce, true);
    nonce
}
