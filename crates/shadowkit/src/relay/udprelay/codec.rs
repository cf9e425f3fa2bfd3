//! Packet codec of one UDP socket
//!
//! Which packet layout applies depends on the method, and for 2022 methods also on the direction:
//! clients send identity headers, servers answer with the client's session ID.

use std::{io, sync::Arc};

use byte_string::ByteStr;
use bytes::{Bytes, BytesMut};

use crate::{
    config::{ServerConfig, ServerUserManager},
    context::Context,
    crypto::CipherKind,
    relay::{address::AddressError, tcprelay::Role, Address},
};

use super::{aead_2022, legacy, options::UdpSocketControlData};

/// UDP packet protocol error
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("packet too short, at least {0} bytes, but only {1} bytes")]
    PacketTooShort(usize, usize),
    #[error("invalid address in packet, {0}")]
    InvalidAddress(#[from] AddressError),
    #[error("decrypt payload failed")]
    DecryptPayloadError,
    #[error("invalid socket type, expecting {0:#x}, but found {1:#x}")]
    InvalidSocketType(u8, u8),
    #[error("invalid timestamp {0} - now {1} = {ts_diff}", ts_diff = *.0 as i64 - *.1 as i64)]
    InvalidTimestamp(u64, u64),
    #[error("invalid client user identity {:?}", ByteStr::new(.0))]
    InvalidClientUser(Bytes),
    #[error("session {0:#x} packet id {1} is replayed or out of window")]
    PacketIdRepeated(u64, u64),
    #[error("too many server sessions, server session {0:#x} rejected")]
    TooManyServerSessions(u64),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

impl From<ProtocolError> for io::Error {
    fn from(e: ProtocolError) -> io::Error {
        io::Error::other(e)
    }
}

/// Seals outgoing and opens incoming packets of one side
#[derive(Debug, Clone)]
pub struct PacketCodec {
    role: Role,
    method: CipherKind,
    key: Bytes,
    /// iPSKs a client puts in front of its packets
    identity_keys: Arc<Vec<Bytes>>,
    /// Users a server identifies clients among
    users: Option<Arc<ServerUserManager>>,
}

impl PacketCodec {
    pub fn new(role: Role, svr_cfg: &ServerConfig) -> PacketCodec {
        let (identity_keys, users) = match role {
            Role::Client => (svr_cfg.clone_identity_keys(), None),
            Role::Server => (Arc::new(Vec::new()), svr_cfg.clone_user_manager()),
        };

        PacketCodec {
            role,
            method: svr_cfg.method(),
            key: Bytes::copy_from_slice(svr_cfg.key()),
            identity_keys,
            users,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn method(&self) -> CipherKind {
        self.method
    }

    /// Append the packet carrying `payload` for `addr` to `dst`
    ///
    /// `control` is only read by 2022 methods.
    pub fn encode(
        &self,
        context: &Context,
        addr: &Address,
        control: &UdpSocketControlData,
        payload: &[u8],
        dst: &mut BytesMut,
    ) {
        if !self.method.is_aead_2022() {
            legacy::seal_packet(context, self.method, &self.key, addr, payload, dst);
            return;
        }

        match self.role {
            Role::Client => aead_2022::encrypt_client_payload_aead_2022(
                self.method,
                &self.key,
                addr,
                control,
                &self.identity_keys,
                payload,
                dst,
            ),
            Role::Server => {
                // Responses to an identified user are sealed with the user's key
                let key = control.user.as_ref().map_or(&self.key[..], |user| user.key());
                aead_2022::encrypt_server_payload_aead_2022(self.method, key, addr, control, payload, dst)
            }
        }
    }

    /// Open `packet` in place, the payload is moved to its front
    ///
    /// Returns the payload length, its address and, for 2022 methods, the packet's control data.
    pub fn decode(&self, packet: &mut [u8]) -> ProtocolResult<(usize, Address, Option<UdpSocketControlData>)> {
        if !self.method.is_aead_2022() {
            let (n, addr) = legacy::open_packet(self.method, &self.key, packet)?;
            return Ok((n, addr, None));
        }

        let (n, addr, control) = match self.role {
            Role::Client => aead_2022::decrypt_server_payload_aead_2022(self.method, &self.key, packet)?,
            Role::Server => {
                aead_2022::decrypt_client_payload_aead_2022(self.method, &self.key, packet, self.users.as_deref())?
            }
        };
        Ok((n, addr, Some(control)))
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};

    use crate::config::ServerType;

    use super::*;

    #[test]
    fn client_and_server_codecs_pair() {
        let context = Context::new(ServerType::Local);
        let target = Address::SocketAddress(SocketAddr::new(Ipv4Addr::new(8, 8, 4, 4).into(), 53));
        let addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 8388);

        for svr_cfg in [
            ServerConfig::new(addr, "secret", CipherKind::CHACHA20_POLY1305).unwrap(),
            ServerConfig::with_psks(addr, CipherKind::AEAD2022_BLAKE3_AES_128_GCM, &[&[4u8; 16]]).unwrap(),
        ] {
            let client = PacketCodec::new(Role::Client, &svr_cfg);
            let server = PacketCodec::new(Role::Server, &svr_cfg);

            let control = UdpSocketControlData::new(0xC0FFEE, 0, 3);
            let mut packet = BytesMut::new();
            client.encode(&context, &target, &control, b"query", &mut packet);

            let (n, addr, received) = server.decode(&mut packet).unwrap();
            assert_eq!(&packet[..n], b"query");
            assert_eq!(addr, target);
            if svr_cfg.method().is_aead_2022() {
                let received = received.unwrap();
                assert_eq!(received.client_session_id, 0xC0FFEE);
                assert_eq!(received.packet_id, 3);
            } else {
                assert!(received.is_none());
            }

            // Opening with the own side's codec fails for 2022, the header type is the other one's
            let mut packet = BytesMut::new();
            client.encode(&context, &target, &control, b"query", &mut packet);
            assert_eq!(client.decode(&mut packet).is_ok(), !svr_cfg.method().is_aead_2022());
        }
    }
}
