//! AEAD 2022 UDP session state of a client association
//!
//! A client association owns one random client session ID and a packet counter. Packets from the
//! server carry the server's session ID, which could change when the server restarts or migrates
//! the association. Two generations of server sessions are remembered, so packets of the previous
//! session still in flight are accepted after a rotation.

use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::security::packet_window::PacketWindowFilter;

use super::{
    codec::{ProtocolError, ProtocolResult},
    options::UdpSocketControlData,
};

/// Minimum interval between two server session rotations
pub const SERVER_SESSION_ROTATE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct RemoteSession {
    session_id: u64,
    window: PacketWindowFilter,
}

impl RemoteSession {
    fn new(session_id: u64) -> RemoteSession {
        RemoteSession {
            session_id,
            window: PacketWindowFilter::new(),
        }
    }
}

/// Tracks server sessions observed by one client association
#[derive(Debug, Default)]
pub struct ServerSessionTracker {
    current: Option<RemoteSession>,
    last: Option<RemoteSession>,
    last_rotated: Option<Instant>,
}

impl ServerSessionTracker {
    pub fn new() -> ServerSessionTracker {
        ServerSessionTracker::default()
    }

    /// Validate `packet_id` of a packet from `session_id`
    ///
    /// A new session ID rotates the current session into the previous generation, unless another
    /// rotation happened within the last 60 seconds.
    pub fn check_packet(&mut self, session_id: u64, packet_id: u64) -> ProtocolResult<()> {
        self.check_packet_at(session_id, packet_id, Instant::now())
    }

    fn check_packet_at(&mut self, session_id: u64, packet_id: u64, now: Instant) -> ProtocolResult<()> {
        let is_current = self.current.as_ref().is_some_and(|s| s.session_id == session_id);
        let is_last = self.last.as_ref().is_some_and(|s| s.session_id == session_id);

        let session = if is_current {
            self.current.as_mut()
        } else if is_last {
            self.last.as_mut()
        } else {
            if let Some(ref current) = self.current {
                if let Some(last_rotated) = self.last_rotated {
                    if now.saturating_duration_since(last_rotated) < SERVER_SESSION_ROTATE_INTERVAL {
                        return Err(ProtocolError::TooManyServerSessions(session_id));
                    }
                }

                debug!(
                    "server session rotated from {:#x} to {:#x}",
                    current.session_id, session_id
                );

                self.last = self.current.take();
                self.last_rotated = Some(now);
            } else {
                trace!("server session {:#x} established", session_id);
            }
            Some(self.current.insert(RemoteSession::new(session_id)))
        };

        let session = match session {
            Some(s) => s,
            None => return Err(ProtocolError::TooManyServerSessions(session_id)),
        };

        if !session.window.validate_packet_id(packet_id, u64::MAX) {
            return Err(ProtocolError::PacketIdRepeated(session_id, packet_id));
        }

        Ok(())
    }

    /// Session ID of the latest server session
    pub fn current_session_id(&self) -> Option<u64> {
        self.current.as_ref().map(|s| s.session_id)
    }
}

/// Client side of an AEAD 2022 UDP association
#[derive(Debug)]
pub struct ClientSession {
    client_session_id: u64,
    next_packet_id: u64,
    server_sessions: ServerSessionTracker,
}

impl Default for ClientSession {
    fn default() -> ClientSession {
        ClientSession::new()
    }
}

impl ClientSession {
    /// Create a session with a random client session ID
    pub fn new() -> ClientSession {
        ClientSession::with_session_id(rand::random())
    }

    pub fn with_session_id(client_session_id: u64) -> ClientSession {
        ClientSession {
            client_session_id,
            next_packet_id: 0,
            server_sessions: ServerSessionTracker::new(),
        }
    }

    pub fn client_session_id(&self) -> u64 {
        self.client_session_id
    }

    /// Control data for the next outgoing packet, the packet ID increases by 1 on every call
    pub fn next_control(&mut self) -> UdpSocketControlData {
        let packet_id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.wrapping_add(1);
        UdpSocketControlData::new(self.client_session_id, 0, packet_id)
    }

    /// Validate control data of a packet received from the server
    pub fn check_response(&mut self, control: &UdpSocketControlData) -> ProtocolResult<()> {
        if control.client_session_id != self.client_session_id {
            // Not a response to this association
            return Err(ProtocolError::DecryptPayloadError);
        }
        self.server_sessions
            .check_packet(control.server_session_id, control.packet_id)
    }

    pub fn server_sessions(&self) -> &ServerSessionTracker {
        &self.server_sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_id_repeated() {
        let mut tracker = ServerSessionTracker::new();
        tracker.check_packet(1, 0).unwrap();
        tracker.check_packet(1, 1).unwrap();
        assert!(matches!(
            tracker.check_packet(1, 1),
            Err(ProtocolError::PacketIdRepeated(1, 1))
        ));
    }

    #[test]
    fn rotation_keeps_previous_session() {
        let now = Instant::now();
        let mut tracker = ServerSessionTracker::new();
        tracker.check_packet_at(1, 0, now).unwrap();
        tracker.check_packet_at(2, 0, now).unwrap();
        assert_eq!(tracker.current_session_id(), Some(2));

        // Late packets of the previous session, with their own window
        tracker.check_packet_at(1, 1, now).unwrap();
        assert!(tracker.check_packet_at(1, 0, now).is_err());
    }

    #[test]
    fn rotation_cap() {
        let now = Instant::now();
        let mut tracker = ServerSessionTracker::new();
        tracker.check_packet_at(1, 0, now).unwrap();
        tracker.check_packet_at(2, 0, now + Duration::from_secs(1)).unwrap();

        let err = tracker
            .check_packet_at(3, 0, now + Duration::from_secs(30))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::TooManyServerSessions(3)));

        tracker.check_packet_at(3, 0, now + Duration::from_secs(62)).unwrap();
        assert_eq!(tracker.current_session_id(), Some(3));
    }

    #[test]
    fn client_session_packet_ids() {
        let mut session = ClientSession::with_session_id(42);
        assert_eq!(session.next_control().packet_id, 0);
        assert_eq!(session.next_control().packet_id, 1);

        let control = UdpSocketControlData::new(42, 7, 0);
        session.check_response(&control).unwrap();
        assert!(session.check_response(&control).is_err());

        let other = UdpSocketControlData::new(43, 7, 1);
        assert!(session.check_response(&other).is_err());
    }
}
