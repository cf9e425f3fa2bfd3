//! Packets of the `none`, stream and AEAD methods
//!
//! ```plain
//! +----------+-------------------------+-------+
//! | NONCE    | *ADDR | Payload*        | TAG   |
//! +----------+-------------------------+-------+
//! | 0/IV/SALT| Variable                | 0/16  |
//! +----------+-------------------------+-------+
//! ```
//!
//! The nonce is the stream cipher's IV or the AEAD salt. Every packet has a fresh one, so an AEAD
//! packet is a single record sealed with the zero nonce.

use byte_string::ByteStr;
use bytes::{BufMut, BytesMut};
use log::trace;

use crate::{
    context::Context,
    crypto::{v1::Cipher, CipherKind},
    relay::Address,
};

use super::codec::{ProtocolError, ProtocolResult};

/// Append the sealed packet of `addr` and `payload` to `dst`
pub fn seal_packet(context: &Context, method: CipherKind, key: &[u8], addr: &Address, payload: &[u8], dst: &mut BytesMut) {
    let nonce_len = method.iv_or_salt_len();
    let start = dst.len();

    dst.reserve(nonce_len + addr.serialized_len() + payload.len() + method.tag_len());
    dst.put_bytes(0, nonce_len);
    context.generate_nonce(method, &mut dst[start..], false);

    let body_start = dst.len();
    addr.write_to_buf(dst);
    dst.put_slice(payload);
    dst.put_bytes(0, method.tag_len());

    let (nonce, body) = dst[start..].split_at_mut(nonce_len);
    Cipher::new(method, key, nonce).encrypt_packet(body);
    trace!(
        "sealed {} packet, nonce {:?}, {} bytes",
        method,
        ByteStr::new(&dst[start..body_start]),
        dst.len() - start
    );
}

/// Open `packet` in place, the payload is moved to its front
///
/// Returns the payload length and the address in front of it.
pub fn open_packet(method: CipherKind, key: &[u8], packet: &mut [u8]) -> ProtocolResult<(usize, Address)> {
    let nonce_len = method.iv_or_salt_len();
    let tag_len = method.tag_len();
    if packet.len() < nonce_len + tag_len {
        return Err(ProtocolError::PacketTooShort(nonce_len + tag_len, packet.len()));
    }

    let (nonce, body) = packet.split_at_mut(nonce_len);
    if !Cipher::new(method, key, nonce).decrypt_packet(body) {
        return Err(ProtocolError::DecryptPayloadError);
    }

    let body_len = body.len() - tag_len;
    let (addr, addr_len) = Address::decode(&body[..body_len])?;

    let payload_start = nonce_len + addr_len;
    let payload_len = body_len - addr_len;
    packet.copy_within(payload_start..payload_start + payload_len, 0);
    Ok((payload_len, addr))
}
