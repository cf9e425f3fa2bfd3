//! SOCKS5 messages ([RFC 1928](https://www.ietf.org/rfc/rfc1928.txt)) and the username/password
//! sub-negotiation ([RFC 1929](https://www.ietf.org/rfc/rfc1929.txt))
//!
//! Every message has `read_from` (where a peer sends it), `write_to`, `write_to_buf` and
//! `serialized_len`. The UDP header is decoded from a datagram instead of read from a stream.

use std::io::{self, ErrorKind};

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub use super::address::{Address, AddressError};

pub const SOCKS5_VERSION: u8 = 0x05;

pub const SOCKS5_AUTH_METHOD_NONE: u8 = 0x00;
pub const SOCKS5_AUTH_METHOD_PASSWORD: u8 = 0x02;
/// Sent back when none of the offered methods is usable
pub const SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE: u8 = 0xFF;

const PASSWD_AUTH_VERSION: u8 = 0x01;
pub const SOCKS5_PASSWD_AUTH_SUCCEEDED: u8 = 0x00;
pub const SOCKS5_PASSWD_AUTH_FAILURE: u8 = 0x01;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    TcpConnect,
    TcpBind,
    UdpAssociate,
}

impl From<Command> for u8 {
    fn from(command: Command) -> u8 {
        match command {
            Command::TcpConnect => 0x01,
            Command::TcpBind => 0x02,
            Command::UdpAssociate => 0x03,
        }
    }
}

impl TryFrom<u8> for Command {
    type Error = Error;

    fn try_from(code: u8) -> Result<Command, Error> {
        match code {
            0x01 => Ok(Command::TcpConnect),
            0x02 => Ok(Command::TcpBind),
            0x03 => Ok(Command::UdpAssociate),
            _ => Err(Error::UnsupportedCommand(code)),
        }
    }
}

/// REP field of a response, indexed by its code
#[derive(thiserror::Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reply {
    #[error("succeeded")]
    Succeeded,
    #[error("general failure")]
    GeneralFailure,
    #[error("connection not allowed by ruleset")]
    ConnectionNotAllowed,
    #[error("network unreachable")]
    NetworkUnreachable,
    #[error("host unreachable")]
    HostUnreachable,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("TTL expired")]
    TtlExpired,
    #[error("command not supported")]
    CommandNotSupported,
    #[error("address type not supported")]
    AddressTypeNotSupported,
    #[error("unassigned reply {0:#x}")]
    Other(u8),
}

const ASSIGNED_REPLIES: [Reply; 9] = [
    Reply::Succeeded,
    Reply::GeneralFailure,
    Reply::ConnectionNotAllowed,
    Reply::NetworkUnreachable,
    Reply::HostUnreachable,
    Reply::ConnectionRefused,
    Reply::TtlExpired,
    Reply::CommandNotSupported,
    Reply::AddressTypeNotSupported,
];

impl From<u8> for Reply {
    fn from(code: u8) -> Reply {
        ASSIGNED_REPLIES.get(code as usize).copied().unwrap_or(Reply::Other(code))
    }
}

impl From<Reply> for u8 {
    fn from(reply: Reply) -> u8 {
        match reply {
            Reply::Other(code) => code,
            assigned => ASSIGNED_REPLIES
                .iter()
                .position(|r| *r == assigned)
                .map_or(0x01, |code| code as u8),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    IoError(#[from] io::Error),
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error("socks version {0:#x} isn't 5")]
    UnsupportedSocksVersion(u8),
    #[error("unknown command {0:#x}")]
    UnsupportedCommand(u8),
    #[error("none of the methods {0:?} is acceptable")]
    NoAcceptableAuthMethod(Vec<u8>),
    #[error("username/password sub-negotiation version {0:#x} isn't 1")]
    UnsupportedPasswdAuthVersion(u8),
    #[error("username and password must be 1 to 255 bytes")]
    PasswdAuthInvalidRequest,
    #[error("username/password rejected")]
    PasswdAuthFailure,
    #[error("server replied: {0}")]
    Reply(Reply),
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        match err {
            Error::IoError(err) => err,
            Error::Address(err) => err.into(),
            Error::PasswdAuthFailure => io::Error::new(ErrorKind::PermissionDenied, err),
            e => io::Error::other(e),
        }
    }
}

impl Error {
    /// Reply telling the client why its request failed
    pub fn reply(&self) -> Reply {
        match *self {
            Error::IoError(ref err) if err.kind() == ErrorKind::ConnectionRefused => Reply::ConnectionRefused,
            Error::Address(AddressError::AddressTypeNotSupported(..)) => Reply::AddressTypeNotSupported,
            Error::UnsupportedCommand(..) => Reply::CommandNotSupported,
            Error::NoAcceptableAuthMethod(..) | Error::PasswdAuthFailure => Reply::ConnectionNotAllowed,
            Error::Reply(reply) => reply,
            _ => Reply::GeneralFailure,
        }
    }
}

async fn read_array<R, const N: usize>(r: &mut R) -> io::Result<[u8; N]>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; N];
    r.read_exact(&mut buf).await?;
    Ok(buf)
}

fn check_version(version: u8) -> Result<(), Error> {
    match version {
        SOCKS5_VERSION => Ok(()),
        v => Err(Error::UnsupportedSocksVersion(v)),
    }
}

macro_rules! buffered_write_to {
    ($($message:ty),+ $(,)?) => {
        $(
            impl $message {
                /// Serialize into one buffer and write it with a single `write_all`
                pub async fn write_to<W>(&self, w: &mut W) -> io::Result<()>
                where
                    W: AsyncWrite + Unpin,
                {
                    let mut buf = BytesMut::with_capacity(self.serialized_len());
                    self.write_to_buf(&mut buf);
                    w.write_all(&buf).await
                }
            }
        )+
    };
}

buffered_write_to!(
    HandshakeRequest,
    HandshakeResponse,
    TcpRequestHeader,
    TcpResponseHeader,
    UdpAssociateHeader,
    PasswdAuthRequest,
    PasswdAuthResponse,
);

/// Method selection from the client
///
/// ```plain
/// VER | NMETHODS | METHODS
///  1  |    1     | 1 to 255
/// ```
#[derive(Clone, Debug)]
pub struct HandshakeRequest {
    pub methods: Vec<u8>,
}

impl HandshakeRequest {
    pub fn new(methods: Vec<u8>) -> HandshakeRequest {
        HandshakeRequest { methods }
    }

    pub async fn read_from<R>(r: &mut R) -> Result<HandshakeRequest, Error>
    where
        R: AsyncRead + Unpin,
    {
        let [version, nmethods] = read_array::<_, 2>(r).await?;
        check_version(version)?;

        let mut methods = vec![0u8; nmethods as usize];
        r.read_exact(&mut methods).await?;
        Ok(HandshakeRequest { methods })
    }

    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(SOCKS5_VERSION);
        buf.put_u8(self.methods.len() as u8);
        buf.put_slice(&self.methods);
    }

    pub fn serialized_len(&self) -> usize {
        2 + self.methods.len()
    }
}

/// Method chosen by the server
#[derive(Clone, Copy, Debug)]
pub struct HandshakeResponse {
    pub chosen_method: u8,
}

impl HandshakeResponse {
    pub fn new(chosen_method: u8) -> HandshakeResponse {
        HandshakeResponse { chosen_method }
    }

    pub async fn read_from<R>(r: &mut R) -> Result<HandshakeResponse, Error>
    where
        R: AsyncRead + Unpin,
    {
        let [version, chosen_method] = read_array::<_, 2>(r).await?;
        check_version(version)?;
        Ok(HandshakeResponse { chosen_method })
    }

    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&[SOCKS5_VERSION, self.chosen_method]);
    }

    pub fn serialized_len(&self) -> usize {
        2
    }
}

/// Request sent after authentication
///
/// ```plain
/// VER | CMD | RSV | ATYP | DST.ADDR | DST.PORT
/// ```
#[derive(Clone, Debug)]
pub struct TcpRequestHeader {
    pub command: Command,
    pub address: Address,
}

impl TcpRequestHeader {
    pub fn new(command: Command, address: Address) -> TcpRequestHeader {
        TcpRequestHeader { command, address }
    }

    pub async fn read_from<R>(r: &mut R) -> Result<TcpRequestHeader, Error>
    where
        R: AsyncRead + Unpin,
    {
        let [version, command, _reserved] = read_array::<_, 3>(r).await?;
        check_version(version)?;
        let command = Command::try_from(command)?;

        let address = Address::read_from(r).await?;
        Ok(TcpRequestHeader { command, address })
    }

    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&[SOCKS5_VERSION, self.command.into(), 0x00]);
        self.address.write_to_buf(buf);
    }

    pub fn serialized_len(&self) -> usize {
        3 + self.address.serialized_len()
    }
}

/// Reply to a request, `address` is the address the server bound for it
///
/// ```plain
/// VER | REP | RSV | ATYP | BND.ADDR | BND.PORT
/// ```
#[derive(Clone, Debug)]
pub struct TcpResponseHeader {
    pub reply: Reply,
    pub address: Address,
}

impl TcpResponseHeader {
    pub fn new(reply: Reply, address: Address) -> TcpResponseHeader {
        TcpResponseHeader { reply, address }
    }

    pub async fn read_from<R>(r: &mut R) -> Result<TcpResponseHeader, Error>
    where
        R: AsyncRead + Unpin,
    {
        let [version, reply, _reserved] = read_array::<_, 3>(r).await?;
        check_version(version)?;

        let address = Address::read_from(r).await?;
        Ok(TcpResponseHeader {
            reply: Reply::from(reply),
            address,
        })
    }

    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&[SOCKS5_VERSION, self.reply.into(), 0x00]);
        self.address.write_to_buf(buf);
    }

    pub fn serialized_len(&self) -> usize {
        3 + self.address.serialized_len()
    }
}

/// Header in front of every datagram of a UDP association
///
/// ```plain
/// RSV (2) | FRAG | ATYP | DST.ADDR | DST.PORT | DATA
/// ```
///
/// Fragments are never reassembled, relays drop datagrams with a non-zero `frag`.
#[derive(Clone, Debug)]
pub struct UdpAssociateHeader {
    pub frag: u8,
    pub address: Address,
}

impl UdpAssociateHeader {
    pub fn new(frag: u8, address: Address) -> UdpAssociateHeader {
        UdpAssociateHeader { frag, address }
    }

    /// Header at the front of `datagram` and its length
    pub fn decode(datagram: &[u8]) -> Result<(UdpAssociateHeader, usize), Error> {
        let frag = match datagram {
            [_, _, frag, ..] => *frag,
            _ => return Err(AddressError::Truncated.into()),
        };

        let (address, addr_len) = Address::decode(&datagram[3..])?;
        Ok((UdpAssociateHeader { frag, address }, 3 + addr_len))
    }

    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16(0);
        buf.put_u8(self.frag);
        self.address.write_to_buf(buf);
    }

    pub fn serialized_len(&self) -> usize {
        3 + self.address.serialized_len()
    }
}

/// Username/password sub-negotiation request
///
/// ```plain
/// VER (1) | ULEN | UNAME | PLEN | PASSWD
/// ```
#[derive(Clone)]
pub struct PasswdAuthRequest {
    pub uname: Vec<u8>,
    pub passwd: Vec<u8>,
}

impl PasswdAuthRequest {
    /// Fails unless both fields are 1 to 255 bytes long
    pub fn new<U, P>(uname: U, passwd: P) -> Result<PasswdAuthRequest, Error>
    where
        U: Into<Vec<u8>>,
        P: Into<Vec<u8>>,
    {
        let request = PasswdAuthRequest {
            uname: uname.into(),
            passwd: passwd.into(),
        };

        let field_ok = |field: &[u8]| (1..=u8::MAX as usize).contains(&field.len());
        if field_ok(&request.uname) && field_ok(&request.passwd) {
            Ok(request)
        } else {
            Err(Error::PasswdAuthInvalidRequest)
        }
    }

    pub async fn read_from<R>(r: &mut R) -> Result<PasswdAuthRequest, Error>
    where
        R: AsyncRead + Unpin,
    {
        let [version] = read_array::<_, 1>(r).await?;
        if version != PASSWD_AUTH_VERSION {
            return Err(Error::UnsupportedPasswdAuthVersion(version));
        }

        let uname = read_auth_field(r).await?;
        let passwd = read_auth_field(r).await?;
        Ok(PasswdAuthRequest { uname, passwd })
    }

    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(PASSWD_AUTH_VERSION);
        for field in [&self.uname, &self.passwd] {
            buf.put_u8(field.len() as u8);
            buf.put_slice(field);
        }
    }

    pub fn serialized_len(&self) -> usize {
        3 + self.uname.len() + self.passwd.len()
    }
}

async fn read_auth_field<R>(r: &mut R) -> Result<Vec<u8>, Error>
where
    R: AsyncRead + Unpin,
{
    let [len] = read_array::<_, 1>(r).await?;
    if len == 0 {
        return Err(Error::PasswdAuthInvalidRequest);
    }

    let mut field = vec![0u8; len as usize];
    r.read_exact(&mut field).await?;
    Ok(field)
}

/// Sub-negotiation result, `status` is `0x00` on success
#[derive(Clone, Copy, Debug)]
pub struct PasswdAuthResponse {
    pub status: u8,
}

impl PasswdAuthResponse {
    pub fn new(status: u8) -> PasswdAuthResponse {
        PasswdAuthResponse { status }
    }

    pub async fn read_from<R>(r: &mut R) -> Result<PasswdAuthResponse, Error>
    where
        R: AsyncRead + Unpin,
    {
        let [version, status] = read_array::<_, 2>(r).await?;
        if version != PASSWD_AUTH_VERSION {
            return Err(Error::UnsupportedPasswdAuthVersion(version));
        }
        Ok(PasswdAuthResponse { status })
    }

    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&[PASSWD_AUTH_VERSION, self.status]);
    }

    pub fn serialized_len(&self) -> usize {
        2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn udp_associate_request_layout() {
        let header = TcpRequestHeader::new(Command::UdpAssociate, Address::unspecified());
        let mut buf = BytesMut::new();
        header.write_to_buf(&mut buf);
        assert_eq!(&buf[..], &[0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
        assert_eq!(buf.len(), header.serialized_len());

        let decoded = TcpRequestHeader::read_from(&mut &buf[..]).await.unwrap();
        assert_eq!(decoded.command, Command::UdpAssociate);
        assert_eq!(decoded.address, Address::unspecified());
    }

    #[tokio::test]
    async fn socks4_version_is_rejected() {
        let buf = [0x04u8, 0x01, 0x00, 0x01, 1, 2, 3, 4, 0, 80];
        let err = TcpRequestHeader::read_from(&mut &buf[..]).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedSocksVersion(0x04)), "{err}");
    }

    #[tokio::test]
    async fn unknown_command() {
        let buf = [0x05u8, 0x09, 0x00, 0x01, 1, 2, 3, 4, 0, 80];
        let err = TcpRequestHeader::read_from(&mut &buf[..]).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedCommand(0x09)));
        assert_eq!(err.reply(), Reply::CommandNotSupported);
    }

    #[test]
    fn reply_codes() {
        assert_eq!(u8::from(Reply::Succeeded), 0x00);
        assert_eq!(u8::from(Reply::AddressTypeNotSupported), 0x08);
        assert_eq!(Reply::from(0x05), Reply::ConnectionRefused);
        assert_eq!(Reply::from(0x42), Reply::Other(0x42));
        assert_eq!(u8::from(Reply::Other(0x42)), 0x42);
    }

    #[test]
    fn udp_header_in_front_of_payload() {
        let mut buf = BytesMut::new();
        UdpAssociateHeader::new(0, "8.8.8.8:53".parse().unwrap()).write_to_buf(&mut buf);
        buf.put_slice(b"query");

        let (header, n) = UdpAssociateHeader::decode(&buf).unwrap();
        assert_eq!(header.frag, 0);
        assert_eq!(header.address, "8.8.8.8:53".parse::<Address>().unwrap());
        assert_eq!(&buf[n..], b"query");

        assert!(UdpAssociateHeader::decode(&[0x00, 0x00]).is_err());
    }

    #[tokio::test]
    async fn passwd_auth_exchange() {
        let req = PasswdAuthRequest::new("user", "pass").unwrap();
        let mut buf = BytesMut::new();
        req.write_to_buf(&mut buf);
        assert_eq!(&buf[..], b"\x01\x04user\x04pass");
        assert_eq!(buf.len(), req.serialized_len());

        let decoded = PasswdAuthRequest::read_from(&mut &buf[..]).await.unwrap();
        assert_eq!(decoded.uname, b"user");
        assert_eq!(decoded.passwd, b"pass");

        let empty_user = [0x01u8, 0x00, 0x01, b'p'];
        assert!(matches!(
            PasswdAuthRequest::read_from(&mut &empty_user[..]).await,
            Err(Error::PasswdAuthInvalidRequest)
        ));
        assert!(PasswdAuthRequest::new("", "pass").is_err());
    }
}
