//! UDP Socket options and extra data

use std::sync::Arc;

use crate::config::ServerUser;

#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct UdpSocketControlData {
    /// Session ID in client.
    ///
    /// For identifying an unique association in client
    pub client_session_id: u64,
    /// Session ID in server.
    ///
    /// For identifying an unique association in server
    pub server_session_id: u64,
    /// Packet counter
    pub packet_id: u64,
    /// User identified by the identity header, server responses are encrypted with its key
    pub user: Option<Arc<ServerUser>>,
}

impl UdpSocketControlData {
    pub fn new(client_session_id: u64, server_session_id: u64, packet_id: u64) -> UdpSocketControlData {
        UdpSocketControlData {
            client_session_id,
            server_session_id,
            packet_id,
            user: None,
        }
    }
}
