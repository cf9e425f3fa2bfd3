//! Shadowsocks UDP server
//!
//! Packets are grouped into associations, one per client session for AEAD 2022 methods and one per
//! client address for the others. Every association is handed to the `ConnectionHandler` as a
//! packet connection and lives until it is idle for the UDP expiry duration.

use std::{
    io::{self, ErrorKind},
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, error, info, trace, warn};
use lru_time_cache::LruCache;
use shadowkit::{
    config::ServerUser,
    relay::{
        udprelay::{ProxySocketError, UdpSocketControlData, MAXIMUM_UDP_PAYLOAD_SIZE},
        Address,
    },
    security::packet_window::PacketWindowFilter,
    ProxySocket,
    ServerConfig,
};
use spin::Mutex as SpinMutex;
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time,
};

use crate::handler::{InboundProtocol, Metadata, PacketConn};

use super::context::ServiceContext;

/// Identity of an association
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum NatKey {
    PeerAddr(SocketAddr),
    SessionId(u64),
}

type AssociationMap = LruCache<NatKey, UdpAssociation>;
type SharedAssociationMap = Arc<Mutex<AssociationMap>>;

/// Packet received from a client, queued for its association
type InboundPacket = (SocketAddr, Address, Bytes);

pub struct UdpServer {
    context: Arc<ServiceContext>,
    listener: Arc<ProxySocket>,
    assoc_map: SharedAssociationMap,
    housekeeping: JoinHandle<()>,
    keepalive_tx: mpsc::Sender<NatKey>,
}

impl Drop for UdpServer {
    fn drop(&mut self) {
        self.housekeeping.abort();
    }
}

/// Refresh associations that sent a response and evict the expired ones
async fn housekeeping(assoc_map: SharedAssociationMap, time_to_live: Duration, mut keepalive_rx: mpsc::Receiver<NatKey>) {
    let mut expiry = time::interval(time_to_live);
    loop {
        tokio::select! {
            key = keepalive_rx.recv() => match key {
                Some(key) => {
                    assoc_map.lock().await.get(&key);
                }
                None => break,
            },
            _ = expiry.tick() => {
                // Iterating drops expired entries
                let alive = assoc_map.lock().await.iter().count();
                trace!("udp server has {} associations", alive);
            }
        }
    }
}

impl UdpServer {
    pub async fn new(
        context: Arc<ServiceContext>,
        svr_cfg: &ServerConfig,
        time_to_live: Option<Duration>,
        capacity: Option<usize>,
    ) -> io::Result<UdpServer> {
        let listener = ProxySocket::bind(context.context(), svr_cfg).await?;

        let time_to_live = time_to_live.unwrap_or(crate::DEFAULT_UDP_EXPIRY_DURATION);
        let assoc_map = match capacity {
            Some(capacity) => LruCache::with_expiry_duration_and_capacity(time_to_live, capacity),
            None => LruCache::with_expiry_duration(time_to_live),
        };
        let assoc_map = Arc::new(Mutex::new(assoc_map));

        let (keepalive_tx, keepalive_rx) = mpsc::channel(64);
        let housekeeping = tokio::spawn(housekeeping(assoc_map.clone(), time_to_live, keepalive_rx));

        Ok(UdpServer {
            context,
            listener: Arc::new(listener),
            assoc_map,
            housekeeping,
            keepalive_tx,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Receive until the socket fails, undecryptable packets are reported and skipped
    pub async fn run(self) -> io::Result<()> {
        info!("shadowsocks udp server listening on {}", self.listener.local_addr()?);

        let mut buffer = vec![0u8; MAXIMUM_UDP_PAYLOAD_SIZE];
        loop {
            let (n, peer_addr, target_addr, _, control) = match self.listener.recv_from_with_ctrl(&mut buffer).await {
                Ok(received) => received,
                Err(ProxySocketError::IoError(err)) => {
                    error!("udp server recv_from failed with error: {}", err);
                    continue;
                }
                Err(err) => {
                    self.context.handler().handle_error(None, err.into());
                    continue;
                }
            };

            let packet = (peer_addr, target_addr, Bytes::copy_from_slice(&buffer[..n]));
            if let Err(err) = self.dispatch(packet, control).await {
                error!("udp packet of {} with {} bytes dropped, error: {}", peer_addr, n, err);
            }
        }
    }

    /// Queue `packet` on the association of its session or peer, creating it when needed
    async fn dispatch(&self, packet: InboundPacket, control: Option<UdpSocketControlData>) -> io::Result<()> {
        let peer_addr = packet.0;
        let key = match control {
            Some(ref control) => NatKey::SessionId(control.client_session_id),
            None => NatKey::PeerAddr(peer_addr),
        };

        let mut assoc_map = self.assoc_map.lock().await;

        let reusable = assoc_map.get(&key).map_or(false, |assoc| !assoc.is_closed());
        if !reusable {
            let assoc = UdpAssociation::new(
                &self.context,
                self.listener.clone(),
                key,
                &packet,
                control.as_ref(),
                self.keepalive_tx.clone(),
            );
            debug!("created udp association {:?} for {}", key, peer_addr);
            assoc_map.insert(key, assoc);
        }

        let Some(assoc) = assoc_map.get_mut(&key) else {
            return Err(io::Error::other("udp association evicted on insert"));
        };

        if let Some(ref control) = control {
            if !assoc.packet_window.validate_packet_id(control.packet_id, u64::MAX) {
                warn!(
                    "udp client {} packet id {} of session {:#x} is replayed or too old",
                    peer_addr, control.packet_id, control.client_session_id
                );
                return Ok(());
            }
        }

        assoc.try_send(packet)
    }
}

struct UdpAssociation {
    assoc_handle: JoinHandle<()>,
    sender: mpsc::Sender<InboundPacket>,
    packet_window: PacketWindowFilter,
}

impl Drop for UdpAssociation {
    fn drop(&mut self) {
        self.assoc_handle.abort();
    }
}

impl UdpAssociation {
    fn new(
        context: &ServiceContext,
        inbound: Arc<ProxySocket>,
        key: NatKey,
        first_packet: &InboundPacket,
        control: Option<&UdpSocketControlData>,
        keepalive_tx: mpsc::Sender<NatKey>,
    ) -> UdpAssociation {
        // 128 pending packets for each association, excessive packets are dropped
        let (sender, receiver) = mpsc::channel(128);

        let user = control.and_then(|c| c.user.clone());

        let (peer_addr, ref target_addr, _) = *first_packet;
        let mut metadata = Metadata::new(InboundProtocol::Shadowsocks, peer_addr, target_addr.clone());
        if let Some(ref user) = user {
            metadata = metadata.with_user(user.name());
        }

        let conn = ShadowsocksPacketConn {
            inbound,
            key,
            peer_addr: SpinMutex::new(peer_addr),
            receiver: Mutex::new(receiver),
            session: control.map(|c| ServerSession {
                client_session_id: c.client_session_id,
                server_session_id: rand::random(),
                next_packet_id: AtomicU64::new(0),
                user,
            }),
            keepalive_tx,
        };

        let handler = context.handler().clone();
        let assoc_handle = tokio::spawn(async move {
            if let Err(err) = handler.new_packet_connection(Box::new(conn), metadata.clone()).await {
                handler.handle_error(Some(&metadata), err);
            }
        });

        UdpAssociation {
            assoc_handle,
            sender,
            packet_window: PacketWindowFilter::new(),
        }
    }

    fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    fn try_send(&self, data: InboundPacket) -> io::Result<()> {
        if let Err(..) = self.sender.try_send(data) {
            return Err(io::Error::other("udp relay channel full"));
        }
        Ok(())
    }
}

/// Server side of an AEAD 2022 association
struct ServerSession {
    client_session_id: u64,
    server_session_id: u64,
    next_packet_id: AtomicU64,
    user: Option<Arc<ServerUser>>,
}

impl ServerSession {
    fn next_control(&self) -> UdpSocketControlData {
        let packet_id = self.next_packet_id.fetch_add(1, Ordering::Relaxed);
        let mut control = UdpSocketControlData::new(self.client_session_id, self.server_session_id, packet_id);
        control.user = self.user.clone();
        control
    }
}

struct ShadowsocksPacketConn {
    inbound: Arc<ProxySocket>,
    key: NatKey,
    // AEAD 2022 clients may roam, responses go to the latest address
    peer_addr: SpinMutex<SocketAddr>,
    receiver: Mutex<mpsc::Receiver<InboundPacket>>,
    session: Option<ServerSession>,
    keepalive_tx: mpsc::Sender<NatKey>,
}

impl Drop for ShadowsocksPacketConn {
    fn drop(&mut self) {
        debug!("udp association {:?} is closed", self.key);
    }
}

#[async_trait]
impl PacketConn for ShadowsocksPacketConn {
    async fn read_packet(&self, buf: &mut [u8]) -> io::Result<Option<(usize, Address)>> {
        let mut receiver = self.receiver.lock().await;
        let (peer_addr, target_addr, data) = match receiver.recv().await {
            Some(p) => p,
            None => return Ok(None),
        };

        *self.peer_addr.lock() = peer_addr;

        if data.len() > buf.len() {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!("udp packet of {} bytes is larger than buffer", data.len()),
            ));
        }
        buf[..data.len()].copy_from_slice(&data);

        trace!("udp relay {} -> {} with {} bytes", peer_addr, target_addr, data.len());
        Ok(Some((data.len(), target_addr)))
    }

    async fn write_packet(&self, payload: &[u8], source: &Address) -> io::Result<()> {
        let peer_addr = *self.peer_addr.lock();

        let control = match self.session {
            Some(ref session) => session.next_control(),
            None => UdpSocketControlData::default(),
        };

        // Keep association alive in map
        let _ = self.keepalive_tx.try_send(self.key);

        self.inbound
            .send_to_with_ctrl(peer_addr, source, &control, payload)
            .await?;

        trace!("udp relay {} <- {} with {} bytes", peer_addr, source, payload.len());
        Ok(())
    }
}
