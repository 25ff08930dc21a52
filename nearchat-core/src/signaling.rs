//! Relay client: registration, heartbeat and location messages out; roster, room and SDP
//! events in. Blocked senders are filtered here, before anything reaches the mesh.

use std::collections::HashSet;

use tracing::{debug, info};

use crate::identity::PeerId;
use crate::protocol::{
    ClientMessage, GeoPosition, IceCandidate, NearbyPeer, ProfileLite, RelayMessage,
    SessionDescription,
};
use crate::wire::{self, WireError};

/// Decoded relay input, already stripped of blocked senders.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalEvent {
    Roster {
        room_id: String,
        room_label: String,
        peers: Vec<NearbyPeer>,
    },
    RoomChanged {
        room_id: String,
        room_label: String,
    },
    Offer {
        from: PeerId,
        description: SessionDescription,
    },
    Answer {
        from: PeerId,
        description: SessionDescription,
    },
    Candidate {
        from: PeerId,
        candidate: IceCandidate,
    },
}

pub struct SignalingClient {
    self_id: PeerId,
    connected: bool,
    blocked: HashSet<PeerId>,
    last_location: Option<(GeoPosition, f64)>,
}

impl SignalingClient {
    pub fn new(self_id: PeerId) -> Self {
        Self {
            self_id,
            connected: false,
            blocked: HashSet::new(),
            last_location: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Socket is open: register, then replay the last location so the relay can place us.
    pub fn on_connected(&mut self, profile: &ProfileLite) -> Vec<ClientMessage> {
        self.connected = true;
        info!(id = %self.self_id, "relay connected, registering");
        let mut out = vec![ClientMessage::Register {
            id: self.self_id,
            profile: profile.clone(),
        }];
        out.extend(self.refresh_location());
        out
    }

    pub fn on_disconnected(&mut self) {
        if self.connected {
            info!("relay disconnected");
        }
        self.connected = false;
    }

    pub fn heartbeat(&self, timestamp: u64) -> ClientMessage {
        ClientMessage::Heartbeat { timestamp }
    }

    /// Remember the position for periodic re-sends and build the update.
    pub fn report_location(&mut self, location: GeoPosition, radius_km: f64) -> ClientMessage {
        self.last_location = Some((location.clone(), radius_km));
        ClientMessage::UpdateLocation {
            location,
            radius: radius_km,
        }
    }

    /// Re-send of the last reported position, if any.
    pub fn refresh_location(&self) -> Option<ClientMessage> {
        self.last_location
            .as_ref()
            .map(|(location, radius)| ClientMessage::UpdateLocation {
                location: location.clone(),
                radius: *radius,
            })
    }

    pub fn has_location(&self) -> bool {
        self.last_location.is_some()
    }

    pub fn request_lan_discovery(&self) -> ClientMessage {
        ClientMessage::RequestLanDiscovery
    }

    pub fn offer(&self, to: PeerId, payload: SessionDescription) -> ClientMessage {
        ClientMessage::Offer { to, payload }
    }

    pub fn answer(&self, to: PeerId, payload: SessionDescription) -> ClientMessage {
        ClientMessage::Answer { to, payload }
    }

    pub fn candidate(&self, to: PeerId, payload: IceCandidate) -> ClientMessage {
        ClientMessage::Candidate { to, payload }
    }

    pub fn block(&mut self, peer: PeerId) -> bool {
        self.blocked.insert(peer)
    }

    pub fn unblock(&mut self, peer: &PeerId) -> bool {
        self.blocked.remove(peer)
    }

    pub fn is_blocked(&self, peer: &PeerId) -> bool {
        self.blocked.contains(peer)
    }

    /// Parse one relay text frame. `Ok(None)` for unknown types and blocked senders.
    pub fn decode(&self, text: &str) -> Result<Option<SignalEvent>, WireError> {
        let msg: RelayMessage = wire::decode_json(text)?;
        let event = match msg {
            RelayMessage::NearbyPeers {
                peers,
                room_id,
                room_label,
            } => SignalEvent::Roster {
                room_id,
                room_label,
                peers: peers
                    .into_iter()
                    .filter(|p| p.id != self.self_id && !self.is_blocked(&p.id))
                    .collect(),
            },
            RelayMessage::RoomUpdate {
                room_id,
                room_label,
            } => SignalEvent::RoomChanged {
                room_id,
                room_label,
            },
            RelayMessage::Offer { from, payload } => SignalEvent::Offer {
                from,
                description: payload,
            },
            RelayMessage::Answer { from, payload } => SignalEvent::Answer {
                from,
                description: payload,
            },
            RelayMessage::Candidate { from, payload } => SignalEvent::Candidate {
                from,
                candidate: payload,
            },
            RelayMessage::Unknown => {
                debug!("ignoring unknown relay message");
                return Ok(None);
            }
        };
        if let Some(from) = event.sender() {
            if self.is_blocked(&from) {
                debug!(peer = %from, "dropping signal from blocked peer");
                return Ok(None);
            }
        }
        Ok(Some(event))
    }
}

impl SignalEvent {
    fn sender(&self) -> Option<PeerId> {
        match self {
            SignalEvent::Offer { from, .. }
            | SignalEvent::Answer { from, .. }
            | SignalEvent::Candidate { from, .. } => Some(*from),
            SignalEvent::Roster { .. } | SignalEvent::RoomChanged { .. } => None,
        }
    }
}
