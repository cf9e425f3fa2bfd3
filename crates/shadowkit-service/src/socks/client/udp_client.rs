//! SOCKS5 UDP ASSOCIATE client

use std::{io, net::SocketAddr};

use bytes::{BufMut, BytesMut};
use log::{debug, trace};
use tokio::net::{lookup_host, ToSocketAddrs, UdpSocket};

use shadowkit::relay::socks5::{Address, Error, UdpAssociateHeader};

use super::tcp_client::{Socks5Credential, Socks5TcpClient};

struct Association {
    /// Closing it ends the association
    _control: Socks5TcpClient,
    relay_addr: SocketAddr,
}

/// UDP socket relaying datagrams through a SOCKS5 proxy
pub struct Socks5UdpClient {
    socket: UdpSocket,
    association: Option<Association>,
}

impl Socks5UdpClient {
    pub async fn bind<A>(addrs: A) -> io::Result<Socks5UdpClient>
    where
        A: ToSocketAddrs,
    {
        Ok(Socks5UdpClient {
            socket: UdpSocket::bind(addrs).await?,
            association: None,
        })
    }

    /// Associate this socket with `proxy`
    ///
    /// An unspecified relay address in the reply stands for the proxy's own address.
    pub async fn associate<P>(&mut self, proxy: P, credential: Option<&Socks5Credential>) -> Result<(), Error>
    where
        P: ToSocketAddrs,
    {
        if self.association.is_some() {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "udp already associated").into());
        }

        let local_addr = self.socket.local_addr()?;
        let (control, relay) = Socks5TcpClient::udp_associate(local_addr, proxy, credential).await?;

        let mut relay_addr = match relay {
            Address::SocketAddress(sa) => sa,
            Address::DomainNameAddress(ref host, port) => lookup_host((host.as_str(), port))
                .await?
                .next()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("relay {relay} resolved to no address")))?,
        };
        if relay_addr.ip().is_unspecified() {
            relay_addr.set_ip(control.peer_addr()?.ip());
        }
        debug!("udp associated {} with relay {}", local_addr, relay_addr);

        self.association = Some(Association {
            _control: control,
            relay_addr,
        });
        Ok(())
    }

    pub fn dissociate(&mut self) {
        self.association = None;
    }

    fn relay_addr(&self) -> io::Result<SocketAddr> {
        match self.association {
            Some(ref association) => Ok(association.relay_addr),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "udp not associated")),
        }
    }

    /// Send `buf` for `target` as fragment `frag`, returns the payload bytes sent
    pub async fn send_to<A>(&self, frag: u8, buf: &[u8], target: A) -> Result<usize, Error>
    where
        A: Into<Address>,
    {
        let relay_addr = self.relay_addr()?;

        let header = UdpAssociateHeader::new(frag, target.into());
        let header_len = header.serialized_len();
        let mut datagram = BytesMut::with_capacity(header_len + buf.len());
        header.write_to_buf(&mut datagram);
        datagram.put_slice(buf);

        let n = self.socket.send_to(&datagram, relay_addr).await?;
        Ok(n.saturating_sub(header_len))
    }

    /// Receive the next datagram from the relay, the payload is moved to the front of `recv_buf`
    ///
    /// Returns the payload length, the fragment number and the address the payload came from.
    /// Datagrams from anyone but the relay are dropped.
    pub async fn recv_from(&self, recv_buf: &mut [u8]) -> Result<(usize, u8, Address), Error> {
        let relay_addr = self.relay_addr()?;

        loop {
            let (n, peer_addr) = self.socket.recv_from(recv_buf).await?;
            if peer_addr != relay_addr {
                trace!("dropped {} bytes from {}, not the relay {}", n, peer_addr, relay_addr);
                continue;
            }

            let (header, header_len) = UdpAssociateHeader::decode(&recv_buf[..n])?;
            recv_buf.copy_within(header_len..n, 0);
            return Ok((n - header_len, header.frag, header.address));
        }
    }
}
