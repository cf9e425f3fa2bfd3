//! Relay protocols of both local and server side
//!
//! Shadowsocks, Trojan and SOCKS5 share the SOCKS5 address codec in [`address`].

pub use self::address::Address;

pub mod address;
pub mod framing;
pub mod socks5;
pub mod tcprelay;
pub mod trojan;
pub mod udprelay;
pub mod uot;
