//! Shadowsocks UDP AEAD 2022 protocol
//!
//! AES methods, Client -> Server
//!
//! ```plain
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! | Client Session ID             | Packet ID                     |  AES-ECB(PSK)
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! | Extensible Identity Headers (16 bytes each, optional)         |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! | TYPE  | UNIX Epoch Timestamp  | PADDING SIZE  | Padding       |  AEAD
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! | Address (Variable ...)        | Payload (Variable ...)        |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! ```
//!
//! AES methods, Server -> Client
//!
//! ```plain
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! | Server Session ID             | Packet ID                     |  AES-ECB(PSK)
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! | TYPE  | UNIX Epoch Timestamp  | Client Session ID             |  AEAD
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! | PADDING SIZE  | Padding       | Address       | Payload       |
//! +-------+-------+-------+-------+-------+-------+-------+-------+
//! ```
//!
//! The ChaCha method prepends a random 24 bytes nonce instead, and seals the session ID and
//! packet ID together with the rest of the packet. It has no identity headers.

use std::sync::Arc;

use byte_string::ByteStr;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::trace;
use rand::{Rng, RngCore};

use crate::{
    config::{ServerUser, ServerUserManager},
    crypto::{
        v2::{identity_hash, udp::UdpCipher, unix_timestamp, BlockCipher, MAX_PADDING_LEN, TIMESTAMP_TOLERANCE},
        CipherKind,
    },
    relay::Address,
};

use super::{
    codec::{ProtocolError, ProtocolResult},
    options::UdpSocketControlData,
};

const CLIENT_SOCKET_TYPE: u8 = 0;
const SERVER_SOCKET_TYPE: u8 = 1;

const SEPARATE_HEADER_LEN: usize = 16;
const IDENTITY_HEADER_LEN: usize = 16;
const TAG_LEN: usize = 16;
const XCHACHA_NONCE_LEN: usize = 24;

#[inline]
fn get_padding_size(payload: &[u8]) -> usize {
    if payload.is_empty() {
        rand::thread_rng().gen_range(0..MAX_PADDING_LEN)
    } else {
        0
    }
}

fn separate_header(session_id: u64, packet_id: u64) -> [u8; SEPARATE_HEADER_LEN] {
    let mut header = [0u8; SEPARATE_HEADER_LEN];
    header[..8].copy_from_slice(&session_id.to_be_bytes());
    header[8..].copy_from_slice(&packet_id.to_be_bytes());
    header
}

fn xor_block(block: &mut [u8; 16], other: &[u8; 16]) {
    for (b, o) in block.iter_mut().zip(other.iter()) {
        *b ^= *o;
    }
}

/// Main header of a packet, everything before address and payload
struct MessageHeader {
    socket_type: u8,
    timestamp: u64,
    /// Only in `Server -> Client` packets
    client_session_id: Option<u64>,
}

impl MessageHeader {
    fn new(socket_type: u8, client_session_id: Option<u64>) -> MessageHeader {
        MessageHeader {
            socket_type,
            timestamp: unix_timestamp(),
            client_session_id,
        }
    }

    fn write_with_payload(&self, addr: &Address, payload: &[u8], dst: &mut BytesMut) {
        dst.put_u8(self.socket_type);
        dst.put_u64(self.timestamp);
        if let Some(client_session_id) = self.client_session_id {
            dst.put_u64(client_session_id);
        }

        let padding_size = get_padding_size(payload);
        dst.put_u16(padding_size as u16);
        if padding_size > 0 {
            let start = dst.len();
            dst.put_bytes(0, padding_size);
            rand::thread_rng().fill_bytes(&mut dst[start..]);
        }

        addr.write_to_buf(dst);
        dst.put_slice(payload);
    }

    /// Parse and validate the header, returns `(address, header length including address)`
    fn read_from(
        body: &[u8],
        expected_type: u8,
        with_client_session_id: bool,
    ) -> ProtocolResult<(MessageHeader, Address, usize)> {
        let fixed_len = 1 + 8 + if with_client_session_id { 8 } else { 0 } + 2;
        if body.len() < fixed_len {
            return Err(ProtocolError::PacketTooShort(fixed_len, body.len()));
        }

        let mut cur = body;
        let socket_type = cur.get_u8();
        if socket_type != expected_type {
            return Err(ProtocolError::InvalidSocketType(expected_type, socket_type));
        }

        let timestamp = cur.get_u64();
        let now = unix_timestamp();
        if now.abs_diff(timestamp) > TIMESTAMP_TOLERANCE {
            return Err(ProtocolError::InvalidTimestamp(timestamp, now));
        }

        let client_session_id = if with_client_session_id {
            Some(cur.get_u64())
        } else {
            None
        };

        let padding_size = cur.get_u16() as usize;
        if cur.remaining() < padding_size {
            return Err(ProtocolError::PacketTooShort(fixed_len + padding_size, body.len()));
        }
        cur.advance(padding_size);

        let (addr, addr_len) = Address::decode(cur)?;
        let header_len = fixed_len + padding_size + addr_len;

        Ok((
            MessageHeader {
                socket_type,
                timestamp,
                client_session_id,
            },
            addr,
            header_len,
        ))
    }
}

/// Seal one packet into `dst`
///
/// `key` encrypts the body. AES methods encrypt the separate header with the first identity key
/// if there is any, and chain one identity header per identity key.
#[allow(clippy::too_many_arguments)]
fn encrypt_message(
    method: CipherKind,
    key: &[u8],
    identity_keys: &[Bytes],
    session_id: u64,
    packet_id: u64,
    header: &MessageHeader,
    addr: &Address,
    payload: &[u8],
    dst: &mut BytesMut,
) {
    let start = dst.len();

    match method {
        CipherKind::AEAD2022_BLAKE3_CHACHA20_POLY1305 => {
            dst.reserve(XCHACHA_NONCE_LEN + SEPARATE_HEADER_LEN + MAX_PADDING_LEN + payload.len() + TAG_LEN + 64);

            dst.put_bytes(0, XCHACHA_NONCE_LEN);
            rand::thread_rng().fill_bytes(&mut dst[start..]);

            dst.put_slice(&separate_header(session_id, packet_id));
            header.write_with_payload(addr, payload, dst);
            dst.put_bytes(0, TAG_LEN);

            let cipher = UdpCipher::new(method, key, session_id);
            let (nonce, message) = dst[start..].split_at_mut(XCHACHA_NONCE_LEN);
            cipher.encrypt_packet(nonce, message);
        }
        CipherKind::AEAD2022_BLAKE3_AES_128_GCM | CipherKind::AEAD2022_BLAKE3_AES_256_GCM => {
            dst.reserve(
                SEPARATE_HEADER_LEN
                    + identity_keys.len() * IDENTITY_HEADER_LEN
                    + MAX_PADDING_LEN
                    + payload.len()
                    + TAG_LEN
                    + 64,
            );

            let plain_header = separate_header(session_id, packet_id);
            dst.put_slice(&plain_header);

            for (idx, ipsk) in identity_keys.iter().enumerate() {
                let next_key = identity_keys.get(idx + 1).map(|k| &k[..]).unwrap_or(key);

                let mut eih = identity_hash(next_key);
                xor_block(&mut eih, &plain_header);
                BlockCipher::new(method, ipsk).encrypt_block(&mut eih);

                trace!(
                    "UDP packet identity header {:?}, next key hash {:?}",
                    ByteStr::new(&eih),
                    ByteStr::new(&identity_hash(next_key))
                );

                dst.put_slice(&eih);
            }

            let body_start = dst.len();
            header.write_with_payload(addr, payload, dst);
            dst.put_bytes(0, TAG_LEN);

            let cipher = UdpCipher::new(method, key, session_id);
            cipher.encrypt_packet(&plain_header[4..16], &mut dst[body_start..]);

            let header_key = identity_keys.first().map(|k| &k[..]).unwrap_or(key);
            let mut block = plain_header;
            BlockCipher::new(method, header_key).encrypt_block(&mut block);
            dst[start..start + SEPARATE_HEADER_LEN].copy_from_slice(&block);
        }
        _ => unreachable!("{} is not an AEAD 2022 cipher", method),
    }
}

/// An opened packet, body is `packet[body_start..body_end]`
struct OpenedMessage {
    session_id: u64,
    packet_id: u64,
    body_start: usize,
    body_end: usize,
    user: Option<Arc<ServerUser>>,
}

fn decrypt_message(
    method: CipherKind,
    key: &[u8],
    packet: &mut [u8],
    user_manager: Option<&ServerUserManager>,
) -> ProtocolResult<OpenedMessage> {
    match method {
        CipherKind::AEAD2022_BLAKE3_CHACHA20_POLY1305 => {
            let min_len = XCHACHA_NONCE_LEN + SEPARATE_HEADER_LEN + TAG_LEN;
            if packet.len() < min_len {
                return Err(ProtocolError::PacketTooShort(min_len, packet.len()));
            }

            let cipher = UdpCipher::new(method, key, 0);
            let (nonce, message) = packet.split_at_mut(XCHACHA_NONCE_LEN);
            if !cipher.decrypt_packet(nonce, message) {
                return Err(ProtocolError::DecryptPayloadError);
            }

            let mut header = &message[..SEPARATE_HEADER_LEN];
            let session_id = header.get_u64();
            let packet_id = header.get_u64();

            Ok(OpenedMessage {
                session_id,
                packet_id,
                body_start: XCHACHA_NONCE_LEN + SEPARATE_HEADER_LEN,
                body_end: packet.len() - TAG_LEN,
                user: None,
            })
        }
        CipherKind::AEAD2022_BLAKE3_AES_128_GCM | CipherKind::AEAD2022_BLAKE3_AES_256_GCM => {
            let eih_len = if user_manager.is_some() { IDENTITY_HEADER_LEN } else { 0 };
            let min_len = SEPARATE_HEADER_LEN + eih_len + TAG_LEN;
            if packet.len() < min_len {
                return Err(ProtocolError::PacketTooShort(min_len, packet.len()));
            }

            let header_cipher = BlockCipher::new(method, key);

            let mut plain_header = [0u8; SEPARATE_HEADER_LEN];
            plain_header.copy_from_slice(&packet[..SEPARATE_HEADER_LEN]);
            header_cipher.decrypt_block(&mut plain_header);

            let mut header = &plain_header[..];
            let session_id = header.get_u64();
            let packet_id = header.get_u64();

            let user = match user_manager {
                None => None,
                Some(user_manager) => {
                    let mut user_hash = [0u8; IDENTITY_HEADER_LEN];
                    user_hash.copy_from_slice(&packet[SEPARATE_HEADER_LEN..SEPARATE_HEADER_LEN + IDENTITY_HEADER_LEN]);
                    header_cipher.decrypt_block(&mut user_hash);
                    xor_block(&mut user_hash, &plain_header);

                    trace!("UDP packet got user hash {:?}", ByteStr::new(&user_hash));

                    match user_manager.get_user_by_hash(&user_hash) {
                        Some(user) => Some(user),
                        None => return Err(ProtocolError::InvalidClientUser(Bytes::copy_from_slice(&user_hash))),
                    }
                }
            };

            let body_key = user.as_ref().map(|u| u.key()).unwrap_or(key);
            let body_start = SEPARATE_HEADER_LEN + eih_len;

            let cipher = UdpCipher::new(method, body_key, session_id);
            if !cipher.decrypt_packet(&plain_header[4..16], &mut packet[body_start..]) {
                return Err(ProtocolError::DecryptPayloadError);
            }

            Ok(OpenedMessage {
                session_id,
                packet_id,
                body_start,
                body_end: packet.len() - TAG_LEN,
                user,
            })
        }
        _ => unreachable!("{} is not an AEAD 2022 cipher", method),
    }
}

/// Encrypt `Client -> Server` AEAD 2022 packet
pub fn encrypt_client_payload_aead_2022(
    method: CipherKind,
    key: &[u8],
    addr: &Address,
    control: &UdpSocketControlData,
    identity_keys: &[Bytes],
    payload: &[u8],
    dst: &mut BytesMut,
) {
    let header = MessageHeader::new(CLIENT_SOCKET_TYPE, None);
    encrypt_message(
        method,
        key,
        identity_keys,
        control.client_session_id,
        control.packet_id,
        &header,
        addr,
        payload,
        dst,
    );
}

/// Encrypt `Server -> Client` AEAD 2022 packet
pub fn encrypt_server_payload_aead_2022(
    method: CipherKind,
    key: &[u8],
    addr: &Address,
    control: &UdpSocketControlData,
    payload: &[u8],
    dst: &mut BytesMut,
) {
    let header = MessageHeader::new(SERVER_SOCKET_TYPE, Some(control.client_session_id));
    encrypt_message(
        method,
        key,
        &[],
        control.server_session_id,
        control.packet_id,
        &header,
        addr,
        payload,
        dst,
    );
}

/// Decrypt `Client -> Server` AEAD 2022 packet
///
/// With `user_manager`, `key` is the server's identity PSK and the packet must carry an identity header.
pub fn decrypt_client_payload_aead_2022(
    method: CipherKind,
    key: &[u8],
    packet: &mut [u8],
    user_manager: Option<&ServerUserManager>,
) -> ProtocolResult<(usize, Address, UdpSocketControlData)> {
    let opened = decrypt_message(method, key, packet, user_manager)?;

    let body = &packet[opened.body_start..opened.body_end];
    let (_, addr, header_len) = MessageHeader::read_from(body, CLIENT_SOCKET_TYPE, false)?;

    let payload_start = opened.body_start + header_len;
    let payload_len = opened.body_end - payload_start;
    packet.copy_within(payload_start..opened.body_end, 0);

    let mut control = UdpSocketControlData::new(opened.session_id, 0, opened.packet_id);
    control.user = opened.user;

    trace!(
        "UDP client packet session {:#x} packet id {} addr {} payload {} bytes",
        control.client_session_id,
        control.packet_id,
        addr,
        payload_len
    );

    Ok((payload_len, addr, control))
}

/// Decrypt `Server -> Client` AEAD 2022 packet
pub fn decrypt_server_payload_aead_2022(
    method: CipherKind,
    key: &[u8],
    packet: &mut [u8],
) -> ProtocolResult<(usize, Address, UdpSocketControlData)> {
    let opened = decrypt_message(method, key, packet, None)?;

    let body = &packet[opened.body_start..opened.body_end];
    let (header, addr, header_len) = MessageHeader::read_from(body, SERVER_SOCKET_TYPE, true)?;

    let payload_start = opened.body_start + header_len;
    let payload_len = opened.body_end - payload_start;
    packet.copy_within(payload_start..opened.body_end, 0);

    let control = UdpSocketControlData::new(
        header.client_session_id.unwrap_or(0),
        opened.session_id,
        opened.packet_id,
    );

    Ok((payload_len, addr, control))
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};

    use super::*;

    fn target() -> Address {
        Address::SocketAddress(SocketAddr::new(Ipv4Addr::new(10, 0, 0, 1).into(), 53))
    }

    #[test]
    fn client_packet_with_identity_header() {
        let method = CipherKind::AEAD2022_BLAKE3_AES_128_GCM;
        let ipsk = Bytes::from_static(&[1u8; 16]);
        let upsk = [2u8; 16];

        let user_manager = ServerUserManager::new();
        user_manager.add_user(ServerUser::new("alice", Bytes::copy_from_slice(&upsk)));

        let control = UdpSocketControlData::new(0x1234, 0, 7);
        let mut packet = BytesMut::new();
        encrypt_client_payload_aead_2022(
            method,
            &upsk,
            &target(),
            &control,
            &[ipsk.clone()],
            b"query",
            &mut packet,
        );

        let (n, addr, control) =
            decrypt_client_payload_aead_2022(method, &ipsk, &mut packet, Some(&user_manager)).unwrap();
        assert_eq!(&packet[..n], b"query");
        assert_eq!(addr, target());
        assert_eq!(control.client_session_id, 0x1234);
        assert_eq!(control.packet_id, 7);
        assert_eq!(control.user.unwrap().name(), "alice");
    }

    #[test]
    fn client_packet_unknown_user() {
        let method = CipherKind::AEAD2022_BLAKE3_AES_128_GCM;
        let ipsk = Bytes::from_static(&[1u8; 16]);

        let user_manager = ServerUserManager::new();
        user_manager.add_user(ServerUser::new("alice", Bytes::from_static(&[2u8; 16])));

        let mut packet = BytesMut::new();
        encrypt_client_payload_aead_2022(
            method,
            &[3u8; 16],
            &target(),
            &UdpSocketControlData::new(1, 0, 1),
            &[ipsk.clone()],
            b"query",
            &mut packet,
        );

        let err = decrypt_client_payload_aead_2022(method, &ipsk, &mut packet, Some(&user_manager)).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidClientUser(..)));
    }

    #[test]
    fn server_packet_carries_client_session() {
        for method in [
            CipherKind::AEAD2022_BLAKE3_AES_256_GCM,
            CipherKind::AEAD2022_BLAKE3_CHACHA20_POLY1305,
        ] {
            let key = [9u8; 32];
            let control = UdpSocketControlData::new(0xAA, 0xBB, 3);

            let mut packet = BytesMut::new();
            encrypt_server_payload_aead_2022(method, &key, &target(), &control, b"answer", &mut packet);

            let (n, addr, control) = decrypt_server_payload_aead_2022(method, &key, &mut packet).unwrap();
            assert_eq!(&packet[..n], b"answer");
            assert_eq!(addr, target());
            assert_eq!(control.client_session_id, 0xAA);
            assert_eq!(control.server_session_id, 0xBB);
            assert_eq!(control.packet_id, 3);
        }
    }

    #[test]
    fn stale_timestamp_rejected() {
        let method = CipherKind::AEAD2022_BLAKE3_AES_128_GCM;
        let key = [4u8; 16];

        let header = MessageHeader {
            socket_type: CLIENT_SOCKET_TYPE,
            timestamp: unix_timestamp() - 31,
            client_session_id: None,
        };
        let mut packet = BytesMut::new();
        encrypt_message(method, &key, &[], 1, 1, &header, &target(), b"late", &mut packet);

        let err = decrypt_client_payload_aead_2022(method, &key, &mut packet, None).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidTimestamp(..)));
    }

    #[test]
    fn client_packet_rejected_by_client() {
        let method = CipherKind::AEAD2022_BLAKE3_AES_128_GCM;
        let key = [5u8; 16];

        let mut packet = BytesMut::new();
        encrypt_client_payload_aead_2022(
            method,
            &key,
            &target(),
            &UdpSocketControlData::new(1, 0, 1),
            &[],
            b"",
            &mut packet,
        );

        let err = decrypt_server_payload_aead_2022(method, &key, &mut packet).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidSocketType(SERVER_SOCKET_TYPE, CLIENT_SOCKET_TYPE)));
    }

    #[test]
    fn tampered_packet() {
        let method = CipherKind::AEAD2022_BLAKE3_CHACHA20_POLY1305;
        let key = [6u8; 32];

        let mut packet = BytesMut::new();
        encrypt_client_payload_aead_2022(
            method,
            &key,
            &target(),
            &UdpSocketControlData::new(1, 0, 1),
            &[],
            b"x",
            &mut packet,
        );
        let last = packet.len() - 1;
        packet[last] ^= 0x01;

        let err = decrypt_client_payload_aead_2022(method, &key, &mut packet, None).unwrap_err();
        assert!(matches!(err, ProtocolError::DecryptPayloadError));
    }
}
