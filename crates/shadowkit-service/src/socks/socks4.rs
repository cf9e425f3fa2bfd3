//! SOCKS4 and SOCKS4a inbound
//!
//! ```plain
//! request   VN (4) | CD | DSTPORT (2) | DSTIP (4) | USERID | NUL [ | HOST | NUL ]
//! reply     VN (0) | CD | DSTPORT (2) | DSTIP (4)
//! ```
//!
//! A DSTIP of `0.0.0.x` with `x != 0` marks a 4a request, the host name follows the user id.
//! SOCKS4 has no authentication, so it is refused when the inbound requires a password.

use std::{
    io::{self, ErrorKind},
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::Arc,
};

use log::{debug, trace, warn};
use shadowkit::{config::Mode, relay::Address};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::{
    handler::{InboundProtocol, Metadata},
    server::context::ServiceContext,
};

use super::config::Socks5AuthConfig;

pub const SOCKS4_VERSION: u8 = 0x04;

/// Longest USERID or host name accepted, both end with a NUL
const MAX_FIELD_LEN: usize = 255;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Socks4Command {
    Connect,
    Bind,
}

/// CD field of a reply
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Socks4Reply {
    Granted,
    RejectedOrFailed,
}

impl Socks4Reply {
    pub fn code(self) -> u8 {
        match self {
            Socks4Reply::Granted => 90,
            Socks4Reply::RejectedOrFailed => 91,
        }
    }

    /// The reply carries no bound address, DSTPORT and DSTIP are zeros
    pub async fn write_to<W>(self, w: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let reply = [0x00, self.code(), 0, 0, 0, 0, 0, 0];
        w.write_all(&reply).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    IoError(#[from] io::Error),
    #[error("socks version {0:#x} isn't 4")]
    UnsupportedSocksVersion(u8),
    #[error("unknown socks4 command {0:#x}")]
    UnsupportedCommand(u8),
    #[error("field isn't terminated within {MAX_FIELD_LEN} bytes")]
    FieldTooLong,
    #[error("socks4a host name isn't UTF-8")]
    InvalidHostEncoding,
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        match err {
            Error::IoError(err) => err,
            e => io::Error::new(ErrorKind::InvalidData, e),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Socks4Request {
    pub command: Socks4Command,
    pub destination: Address,
    pub user_id: Vec<u8>,
}

impl Socks4Request {
    /// Read a request, `r` is buffered because both variable fields end with a NUL
    pub async fn read_from<R>(r: &mut R) -> Result<Socks4Request, Error>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut fixed = [0u8; 8];
        r.read_exact(&mut fixed).await?;

        let [version, command, port_hi, port_lo, a, b, c, d] = fixed;
        if version != SOCKS4_VERSION {
            return Err(Error::UnsupportedSocksVersion(version));
        }
        let command = match command {
            0x01 => Socks4Command::Connect,
            0x02 => Socks4Command::Bind,
            code => return Err(Error::UnsupportedCommand(code)),
        };
        let port = u16::from_be_bytes([port_hi, port_lo]);

        let user_id = read_nul_terminated(r).await?;

        let destination = if [a, b, c] == [0, 0, 0] && d != 0 {
            let host = read_nul_terminated(r).await?;
            let host = String::from_utf8(host).map_err(|_| Error::InvalidHostEncoding)?;
            Address::DomainNameAddress(host, port)
        } else {
            Address::SocketAddress(SocketAddrV4::new(Ipv4Addr::new(a, b, c, d), port).into())
        };

        Ok(Socks4Request {
            command,
            destination,
            user_id,
        })
    }
}

async fn read_nul_terminated<R>(r: &mut R) -> Result<Vec<u8>, Error>
where
    R: AsyncBufRead + Unpin,
{
    let mut field = Vec::new();
    let mut limited = (&mut *r).take(MAX_FIELD_LEN as u64 + 1);
    limited.read_until(b'\0', &mut field).await?;

    match field.pop() {
        Some(b'\0') => Ok(field),
        _ if field.len() >= MAX_FIELD_LEN => Err(Error::FieldTooLong),
        _ => Err(io::Error::from(ErrorKind::UnexpectedEof).into()),
    }
}

/// Serves SOCKS4 and SOCKS4a clients, CONNECT only
#[derive(Clone)]
pub struct Socks4TcpHandler {
    context: Arc<ServiceContext>,
    auth: Arc<Socks5AuthConfig>,
    mode: Mode,
}

impl Socks4TcpHandler {
    pub fn new(context: Arc<ServiceContext>, auth: Arc<Socks5AuthConfig>, mode: Mode) -> Socks4TcpHandler {
        Socks4TcpHandler { context, auth, mode }
    }

    /// Serve a client whose stream is positioned at the request
    pub async fn handle_socks4_client<S>(self, stream: S, peer_addr: SocketAddr) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        // Bytes the client sent behind the request stay in the reader's buffer and reach the handler
        let mut stream = BufReader::new(stream);

        let request = match Socks4Request::read_from(&mut stream).await {
            Ok(r) => r,
            Err(Error::IoError(ref err)) if err.kind() == ErrorKind::UnexpectedEof => {
                trace!("socks4 client {} closed during the request", peer_addr);
                return Ok(());
            }
            Err(err) => {
                let _ = Socks4Reply::RejectedOrFailed.write_to(&mut stream).await;
                return Err(err.into());
            }
        };
        trace!("socks4 {:?} peer: {}", request, peer_addr);

        let refusal = if self.auth.auth_required() {
            Some("password authentication is required")
        } else if request.command == Socks4Command::Bind {
            Some("BIND is not supported")
        } else if !self.mode.enable_tcp() {
            Some("TCP is disabled")
        } else {
            None
        };
        if let Some(reason) = refusal {
            warn!("socks4 {:?} from {} refused, {}", request.command, peer_addr, reason);
            return Socks4Reply::RejectedOrFailed.write_to(&mut stream).await;
        }

        debug!("socks4 CONNECT {} from {}", request.destination, peer_addr);
        Socks4Reply::Granted.write_to(&mut stream).await?;

        let metadata = Metadata::new(InboundProtocol::Socks4, peer_addr, request.destination);
        let handler = self.context.handler();
        if let Err(err) = handler.new_connection(Box::new(stream), metadata.clone()).await {
            handler.handle_error(Some(&metadata), err);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn socks4_ip_request() {
        let wire = [0x04u8, 0x01, 0x00, 0x50, 10, 0, 0, 1, b'b', b'o', b'b', 0x00];
        let request = Socks4Request::read_from(&mut &wire[..]).await.unwrap();
        assert_eq!(request.command, Socks4Command::Connect);
        assert_eq!(request.destination, "10.0.0.1:80".parse::<Address>().unwrap());
        assert_eq!(request.user_id, b"bob");
    }

    #[tokio::test]
    async fn socks4a_host_follows_user_id() {
        let mut wire = vec![0x04u8, 0x01, 0x01, 0xBB, 0, 0, 0, 7, 0x00];
        wire.extend_from_slice(b"example.com\0payload");

        let mut reader = &wire[..];
        let request = Socks4Request::read_from(&mut reader).await.unwrap();
        assert_eq!(request.destination, Address::DomainNameAddress("example.com".to_owned(), 443));
        assert!(request.user_id.is_empty());
        assert_eq!(reader, b"payload");
    }

    #[tokio::test]
    async fn unterminated_user_id() {
        let mut wire = vec![0x04u8, 0x01, 0x00, 0x50, 1, 2, 3, 4];
        wire.extend_from_slice(&[b'x'; 300]);

        let err = Socks4Request::read_from(&mut &wire[..]).await.unwrap_err();
        assert!(matches!(err, Error::FieldTooLong), "{err}");

        let truncated = [0x04u8, 0x01, 0x00, 0x50, 1, 2, 3, 4, b'x'];
        let err = Socks4Request::read_from(&mut &truncated[..]).await.unwrap_err();
        assert!(matches!(err, Error::IoError(ref e) if e.kind() == ErrorKind::UnexpectedEof));
    }

    #[tokio::test]
    async fn reply_layout() {
        let mut buf = Vec::new();
        Socks4Reply::Granted.write_to(&mut buf).await.unwrap();
        assert_eq!(buf, [0x00, 90, 0, 0, 0, 0, 0, 0]);
    }
}
