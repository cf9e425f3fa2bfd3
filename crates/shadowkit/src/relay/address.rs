//! Address codec shared by SOCKS5, Shadowsocks and Trojan
//!
//! ```plain
//! +------+----------+----------+
//! | ATYP | DST.ADDR | DST.PORT |
//! +------+----------+----------+
//! |  1   | Variable |    2     |
//! +------+----------+----------+
//! ```
//!
//! `ATYP` is `0x01` for IPv4 (4 bytes), `0x03` for a domain name (1 byte length followed by the name)
//! and `0x04` for IPv6 (16 bytes). Port is big-endian.

use std::{
    fmt::{self, Debug, Formatter},
    io::{self, ErrorKind},
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, ToSocketAddrs},
    str::FromStr,
    vec,
};

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[rustfmt::skip]
pub(crate) mod consts {
    pub const ADDR_TYPE_IPV4:        u8 = 0x01;
    pub const ADDR_TYPE_DOMAIN_NAME: u8 = 0x03;
    pub const ADDR_TYPE_IPV6:        u8 = 0x04;
}

/// Address decoding error
#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    #[error("{0}")]
    IoError(#[from] io::Error),
    #[error("address type {0:#x} not supported")]
    AddressTypeNotSupported(u8),
    #[error("address domain name must be non-empty UTF-8")]
    InvalidDomainName,
    #[error("address truncated")]
    Truncated,
}

impl From<AddressError> for io::Error {
    fn from(err: AddressError) -> io::Error {
        match err {
            AddressError::IoError(err) => err,
            AddressError::Truncated => io::Error::new(ErrorKind::UnexpectedEof, err),
            e => io::Error::new(ErrorKind::InvalidData, e),
        }
    }
}

/// Destination or source of a connection or a packet
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Address {
    /// Socket address (IP Address)
    SocketAddress(SocketAddr),
    /// Domain name address
    DomainNameAddress(String, u16),
}

impl Address {
    /// Create a domain name address, the name must be 1 to 255 bytes
    pub fn domain_name<S: Into<String>>(name: S, port: u16) -> Result<Address, AddressError> {
        let name = name.into();
        if name.is_empty() || name.len() > u8::MAX as usize {
            return Err(AddressError::InvalidDomainName);
        }
        Ok(Address::DomainNameAddress(name, port))
    }

    /// Decode from the head of `buf`, returning the address and the consumed length
    pub fn decode(buf: &[u8]) -> Result<(Address, usize), AddressError> {
        let mut cur = io::Cursor::new(buf);
        let addr = Address::read_cursor(&mut cur)?;
        Ok((addr, cur.position() as usize))
    }

    /// Read from a cursor
    pub fn read_cursor<T: AsRef<[u8]>>(cur: &mut io::Cursor<T>) -> Result<Address, AddressError> {
        if cur.remaining() < 1 {
            return Err(AddressError::Truncated);
        }

        let atyp = cur.get_u8();
        match atyp {
            consts::ADDR_TYPE_IPV4 => {
                if cur.remaining() < 4 + 2 {
                    return Err(AddressError::Truncated);
                }
                let addr = Ipv4Addr::from(cur.get_u32());
                let port = cur.get_u16();
                Ok(Address::SocketAddress(SocketAddr::V4(SocketAddrV4::new(addr, port))))
            }
            consts::ADDR_TYPE_IPV6 => {
                if cur.remaining() < 16 + 2 {
                    return Err(AddressError::Truncated);
                }
                let addr = Ipv6Addr::from(cur.get_u128());
                let port = cur.get_u16();
                Ok(Address::SocketAddress(SocketAddr::V6(SocketAddrV6::new(addr, port, 0, 0))))
            }
            consts::ADDR_TYPE_DOMAIN_NAME => {
                if cur.remaining() < 1 {
                    return Err(AddressError::Truncated);
                }
                let domain_len = cur.get_u8() as usize;
                if domain_len == 0 {
                    return Err(AddressError::InvalidDomainName);
                }
                if cur.remaining() < domain_len + 2 {
                    return Err(AddressError::Truncated);
                }
                let mut buf = vec![0u8; domain_len];
                cur.copy_to_slice(&mut buf);
                let port = cur.get_u16();
                let addr = String::from_utf8(buf).map_err(|_| AddressError::InvalidDomainName)?;
                Ok(Address::DomainNameAddress(addr, port))
            }
            _ => Err(AddressError::AddressTypeNotSupported(atyp)),
        }
    }

    /// Parse from an `AsyncRead`
    pub async fn read_from<R>(stream: &mut R) -> Result<Address, AddressError>
    where
        R: AsyncRead + Unpin,
    {
        let addr_type = stream.read_u8().await?;
        match addr_type {
            consts::ADDR_TYPE_IPV4 => {
                let mut buf = [0u8; 6];
                stream.read_exact(&mut buf).await?;

                let v4addr = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
                let port = u16::from_be_bytes([buf[4], buf[5]]);
                Ok(Address::SocketAddress(SocketAddr::V4(SocketAddrV4::new(v4addr, port))))
            }
            consts::ADDR_TYPE_IPV6 => {
                let mut buf = [0u8; 18];
                stream.read_exact(&mut buf).await?;

                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[..16]);
                let port = u16::from_be_bytes([buf[16], buf[17]]);

                Ok(Address::SocketAddress(SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(octets),
                    port,
                    0,
                    0,
                ))))
            }
            consts::ADDR_TYPE_DOMAIN_NAME => {
                let length = stream.read_u8().await? as usize;
                if length == 0 {
                    return Err(AddressError::InvalidDomainName);
                }

                // Len(Domain) + Len(Port)
                let mut raw_addr = vec![0u8; length + 2];
                stream.read_exact(&mut raw_addr).await?;

                let port = u16::from_be_bytes([raw_addr[length], raw_addr[length + 1]]);
                raw_addr.truncate(length);

                match String::from_utf8(raw_addr) {
                    Ok(addr) => Ok(Address::DomainNameAddress(addr, port)),
                    Err(..) => Err(AddressError::InvalidDomainName),
                }
            }
            _ => Err(AddressError::AddressTypeNotSupported(addr_type)),
        }
    }

    /// Writes to writer
    #[inline]
    pub async fn write_to<W>(&self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = BytesMut::with_capacity(self.serialized_len());
        self.write_to_buf(&mut buf);
        writer.write_all(&buf).await
    }

    /// Writes to buffer
    ///
    /// # Panics
    ///
    /// If a domain name is empty or longer than 255 bytes.
    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        match *self {
            Address::SocketAddress(SocketAddr::V4(ref addr)) => {
                buf.put_u8(consts::ADDR_TYPE_IPV4);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Address::SocketAddress(SocketAddr::V6(ref addr)) => {
                buf.put_u8(consts::ADDR_TYPE_IPV6);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Address::DomainNameAddress(ref dnaddr, port) => {
                assert!(
                    !dnaddr.is_empty() && dnaddr.len() <= u8::MAX as usize,
                    "domain name length must be in 1..=255"
                );

                buf.put_u8(consts::ADDR_TYPE_DOMAIN_NAME);
                buf.put_u8(dnaddr.len() as u8);
                buf.put_slice(dnaddr.as_bytes());
                buf.put_u16(port);
            }
        }
    }

    /// Get required buffer size for serializing
    #[inline]
    pub fn serialized_len(&self) -> usize {
        match *self {
            Address::SocketAddress(SocketAddr::V4(..)) => 1 + 4 + 2,
            Address::SocketAddress(SocketAddr::V6(..)) => 1 + 16 + 2,
            Address::DomainNameAddress(ref dmname, _) => 1 + 1 + dmname.len() + 2,
        }
    }

    /// Get maximum required buffer size for serializing
    #[inline]
    pub const fn max_serialized_len() -> usize {
        1 // ADDR_TYPE
        + 1 // DOMAIN LENGTH
        + u8::MAX as usize // MAX DOMAIN
        + 2 // PORT
    }

    /// Get associated port number
    pub fn port(&self) -> u16 {
        match *self {
            Address::SocketAddress(addr) => addr.port(),
            Address::DomainNameAddress(.., port) => port,
        }
    }

    /// Get host address string
    pub fn host(&self) -> String {
        match *self {
            Address::SocketAddress(ref addr) => addr.ip().to_string(),
            Address::DomainNameAddress(ref domain, ..) => domain.to_owned(),
        }
    }

    /// Unspecified IPv4 address `0.0.0.0:0`
    pub fn unspecified() -> Address {
        Address::SocketAddress(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)))
    }
}

impl Debug for Address {
    #[inline]
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Address {
    #[inline]
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match *self {
            Address::SocketAddress(ref addr) => write!(f, "{addr}"),
            Address::DomainNameAddress(ref addr, ref port) => write!(f, "{addr}:{port}"),
        }
    }
}

impl ToSocketAddrs for Address {
    type Iter = vec::IntoIter<SocketAddr>;

    fn to_socket_addrs(&self) -> io::Result<vec::IntoIter<SocketAddr>> {
        match *self {
            Address::SocketAddress(addr) => Ok(vec![addr].into_iter()),
            Address::DomainNameAddress(ref addr, port) => (&addr[..], port).to_socket_addrs(),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(s: SocketAddr) -> Address {
        Address::SocketAddress(s)
    }
}

impl From<(String, u16)> for Address {
    fn from((dn, port): (String, u16)) -> Address {
        Address::DomainNameAddress(dn, port)
    }
}

impl From<&Address> for Address {
    fn from(addr: &Address) -> Address {
        addr.clone()
    }
}

/// Parse `Address` error
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid address \"{0}\"")]
pub struct ParseAddressError(String);

impl FromStr for Address {
    type Err = ParseAddressError;

    fn from_str(s: &str) -> Result<Address, ParseAddressError> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Address::SocketAddress(addr));
        }

        let (dn, port) = s.rsplit_once(':').ok_or_else(|| ParseAddressError(s.to_owned()))?;
        let port = port.parse::<u16>().map_err(|_| ParseAddressError(s.to_owned()))?;
        Address::domain_name(dn, port).map_err(|_| ParseAddressError(s.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_wire_layout() {
        let addr: Address = "1.2.3.4:443".parse().unwrap();

        let mut buf = BytesMut::new();
        addr.write_to_buf(&mut buf);
        assert_eq!(&buf[..], &[0x01, 1, 2, 3, 4, 0x01, 0xBB]);
        assert_eq!(addr.serialized_len(), buf.len());
    }

    #[test]
    fn domain_keeps_trailing_dot() {
        let addr = Address::domain_name("example.com.", 80).unwrap();

        let mut buf = BytesMut::new();
        addr.write_to_buf(&mut buf);
        assert_eq!(buf[0], 0x03);
        assert_eq!(buf[1] as usize, "example.com.".len());

        let (decoded, n) = Address::decode(&buf).unwrap();
        assert_eq!(decoded, addr);
        assert_eq!(n, buf.len());
    }

    #[test]
    fn ipv6_decodes_from_stream_and_cursor() {
        let addr: Address = "[2001:db8::1]:53".parse().unwrap();
        let mut buf = BytesMut::new();
        addr.write_to_buf(&mut buf);
        assert_eq!(buf.len(), 19);

        let (decoded, _) = Address::decode(&buf).unwrap();
        assert_eq!(decoded, addr);

        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let streamed = rt.block_on(async { Address::read_from(&mut &buf[..]).await.unwrap() });
        assert_eq!(streamed, addr);
    }

    #[test]
    fn rejects_unknown_type_and_empty_domain() {
        match Address::decode(&[0x02, 0, 0]) {
            Err(AddressError::AddressTypeNotSupported(0x02)) => {}
            r => panic!("unexpected {r:?}"),
        }
        match Address::decode(&[0x03, 0x00, 0x00, 0x50]) {
            Err(AddressError::InvalidDomainName) => {}
            r => panic!("unexpected {r:?}"),
        }
        match Address::decode(&[0x01, 127, 0]) {
            Err(AddressError::Truncated) => {}
            r => panic!("unexpected {r:?}"),
        }
        assert!(Address::domain_name("", 1).is_err());
        assert!(Address::domain_name("a".repeat(256), 1).is_err());
    }
}
