//! Shadowsocks UDP relay
//!
//! Every packet is encrypted on its own and carries the target address in front of its payload.
//!
//! ```plain
//! +------+----------+----------+----------+
//! | ATYP | DST.ADDR | DST.PORT |   DATA   |
//! +------+----------+----------+----------+
//! |  1   | Variable |    2     | Variable |
//! +------+----------+----------+----------+
//! ```
//!
//! See [`legacy`] for how the `none`, stream and AEAD methods wrap it, and `aead_2022` for the
//! session based packets of the 2022 methods.

pub use self::{
    codec::{PacketCodec, ProtocolError, ProtocolResult},
    options::UdpSocketControlData,
    proxy_socket::{ProxySocket, ProxySocketError},
    session::{ClientSession, ServerSessionTracker},
};

mod aead_2022;
pub mod codec;
pub mod legacy;
pub mod options;
pub mod proxy_socket;
pub mod session;

/// Largest datagram a relay buffer has to hold
pub const MAXIMUM_UDP_PAYLOAD_SIZE: usize = 65536;
