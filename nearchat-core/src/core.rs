//! Host-driven API: MeshCore receives events from the host, returns actions.
//!
//! Control traffic (relay messages, RTC work, REST fetches) goes out as `Action`s. Data channel
//! traffic is written straight to the channel handles the host registered on open.

use std::collections::HashMap;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::{ChannelError, ChannelKind, DataChannel};
use crate::config::MeshConfig;
use crate::crypto::{CryptoEngine, CryptoError};
use crate::gossip::{Broadcaster, OverlayChange, Room};
use crate::identity::{Identity, PeerId, PublicKey};
use crate::link::{role_for, ConnectionManager, LinkState, Role, RtcCommand};
use crate::outbox::{Outgoing, PendingQueue};
use crate::protocol::{
    BroadcastMessage, ChatFrame, ClientMessage, ControlFrame, GeoPosition, IceCandidate,
    NearbyPeer, PeerPayload, Profile, ProfileLite, SdpKind, SessionDescription,
};
use crate::reliability::{ReliabilityManager, Timer, TurnCredential};
use crate::signaling::{SignalEvent, SignalingClient};
use crate::transfer::{FileMeta, IncomingTransfers, OutgoingTransfer, OutgoingTransfers, TransferError};
use crate::wire::{self, WireError};

/// Milliseconds since the Unix epoch, for wire timestamps.
pub fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Work for the host.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Send on the relay socket.
    Relay(ClientMessage),
    Rtc(RtcCommand),
    /// Call the credential endpoint, then `on_credential` / `on_credential_failed`.
    FetchCredential,
    /// Run the location strategy, then `report_location` or `request_lan_discovery`.
    AcquireLocation,
    Event(MeshEvent),
}

/// Notifications for the application layer.
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    RelayOpened(PeerId),
    RelayClosed,
    RoomChanged {
        room_id: String,
        room_label: String,
    },
    NearbyPeers(Vec<NearbyPeer>),
    ProfileUpdated {
        peer: PeerId,
        profile: ProfileLite,
    },
    AvatarReceived {
        peer: PeerId,
        version: u32,
        data: Vec<u8>,
    },
    SessionEstablished(PeerId),
    PeerLeft(PeerId),
    ChatReceived {
        peer: PeerId,
        id: Uuid,
        text: String,
        timestamp: u64,
    },
    MessageDelivered {
        peer: PeerId,
        id: Uuid,
    },
    MessageRead {
        peer: PeerId,
        id: Uuid,
    },
    ReactionReceived {
        peer: PeerId,
        id: Uuid,
        emoji: String,
    },
    BroadcastReceived(BroadcastMessage),
    FileIncoming {
        peer: PeerId,
        id: Uuid,
        name: String,
        size: u64,
        mime: String,
    },
    FileReceived {
        peer: PeerId,
        id: Uuid,
        name: String,
        mime: String,
        bytes: Vec<u8>,
    },
    FileSent {
        peer: PeerId,
        id: Uuid,
    },
    TransferFailed {
        peer: PeerId,
        id: Uuid,
        reason: String,
    },
    DecryptFailed {
        peer: PeerId,
        reason: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("no open chat channel to {0}")]
    NotReady(PeerId),
    #[error("peer {0} is blocked")]
    Blocked(PeerId),
    #[error("not in a room")]
    NoRoom,
    #[error("unknown transfer {0}")]
    UnknownTransfer(Uuid),
}

impl MeshError {
    /// Worth queueing and trying again once the channel is back.
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            MeshError::NotReady(_)
                | MeshError::Channel(_)
                | MeshError::Crypto(CryptoError::NoSession(_))
        )
    }
}

/// Main coordinator. Host passes events; core returns actions.
pub struct MeshCore {
    config: MeshConfig,
    crypto: CryptoEngine,
    signaling: SignalingClient,
    links: ConnectionManager,
    gossip: Broadcaster,
    outbox: PendingQueue,
    outgoing: OutgoingTransfers,
    incoming: IncomingTransfers,
    reliability: ReliabilityManager,
    profile: Profile,
    peer_profiles: HashMap<PeerId, ProfileLite>,
    /// Avatar version last received per peer.
    peer_avatars: HashMap<PeerId, u32>,
}

impl MeshCore {
    pub fn new(identity: Identity, profile: Profile, config: MeshConfig) -> Self {
        let id = identity.id();
        Self {
            crypto: CryptoEngine::new(identity),
            signaling: SignalingClient::new(id),
            links: ConnectionManager::new(
                id,
                config.ice_check_timeout(),
                config.disconnect_grace(),
            ),
            gossip: Broadcaster::new(
                id,
                config.neighbor_degree,
                config.broadcast_ttl,
                config.seen_capacity,
            ),
            outbox: PendingQueue::new(),
            outgoing: OutgoingTransfers::new(),
            incoming: IncomingTransfers::new(),
            reliability: ReliabilityManager::new(&config),
            profile,
            peer_profiles: HashMap::new(),
            peer_avatars: HashMap::new(),
            config,
        }
    }

    pub fn id(&self) -> PeerId {
        self.crypto.id()
    }

    pub fn public_key(&self) -> &PublicKey {
        self.crypto.public_key()
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn peer_profile(&self, peer: &PeerId) -> Option<&ProfileLite> {
        self.peer_profiles.get(peer)
    }

    pub fn room(&self) -> Option<&Room> {
        self.gossip.room()
    }

    pub fn overlay(&self) -> Vec<PeerId> {
        self.gossip.overlay().iter().copied().collect()
    }

    pub fn links(&self) -> &ConnectionManager {
        &self.links
    }

    pub fn has_session(&self, peer: &PeerId) -> bool {
        self.crypto.has_session(peer)
    }

    pub fn pending_count(&self, peer: &PeerId) -> usize {
        self.outbox.len(peer)
    }

    pub fn is_blocked(&self, peer: &PeerId) -> bool {
        self.signaling.is_blocked(peer)
    }

    /// Earliest maintenance deadline. Link timers need a regular `tick` on top of this.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.reliability.next_deadline()
    }

    /// First call after construction: fetch a relay credential and a position.
    pub fn start(&mut self) -> Vec<Action> {
        info!(id = %self.id(), "mesh core starting");
        vec![Action::FetchCredential, Action::AcquireLocation]
    }

    pub fn on_relay_connected(&mut self, now: Instant) -> Vec<Action> {
        let mut out: Vec<Action> = self
            .signaling
            .on_connected(&self.profile.lite)
            .into_iter()
            .map(Action::Relay)
            .collect();
        if !self.signaling.has_location() {
            out.push(Action::AcquireLocation);
        }
        self.reliability.on_relay_connected(now);
        out.push(Action::Event(MeshEvent::RelayOpened(self.id())));
        out
    }

    /// Existing links stay up; only maintenance pauses.
    pub fn on_relay_disconnected(&mut self) -> Vec<Action> {
        self.signaling.on_disconnected();
        self.reliability.on_relay_lost();
        vec![Action::Event(MeshEvent::RelayClosed)]
    }

    pub fn on_relay_text(&mut self, text: &str, now: Instant) -> Vec<Action> {
        let event = match self.signaling.decode(text) {
            Ok(Some(event)) => event,
            Ok(None) => return Vec::new(),
            Err(e) => {
                warn!(error = %e, "bad relay message");
                return Vec::new();
            }
        };
        match event {
            SignalEvent::Roster {
                room_id,
                room_label,
                peers,
            } => self.on_roster(room_id, room_label, peers, now),
            SignalEvent::RoomChanged {
                room_id,
                room_label,
            } => {
                let change = self.gossip.set_room(&room_id, &room_label);
                if !change.room_switched {
                    return Vec::new();
                }
                let mut out = vec![Action::Event(MeshEvent::RoomChanged {
                    room_id,
                    room_label,
                })];
                out.extend(self.apply_overlay(change, now));
                out
            }
            SignalEvent::Offer { from, description } => self
                .links
                .on_remote_offer(from, description, now)
                .commands
                .into_iter()
                .map(Action::Rtc)
                .collect(),
            SignalEvent::Answer { from, description } => {
                if !self.links.contains(&from) {
                    debug!(peer = %from, "answer for unknown link");
                    return Vec::new();
                }
                vec![Action::Rtc(RtcCommand::ApplyAnswer {
                    peer: from,
                    description,
                })]
            }
            SignalEvent::Candidate { from, candidate } => {
                if !self.links.contains(&from) {
                    debug!(peer = %from, "candidate for unknown link");
                    return Vec::new();
                }
                vec![Action::Rtc(RtcCommand::AddCandidate {
                    peer: from,
                    candidate,
                })]
            }
        }
    }

    fn on_roster(
        &mut self,
        room_id: String,
        room_label: String,
        peers: Vec<NearbyPeer>,
        now: Instant,
    ) -> Vec<Action> {
        let mut out = Vec::new();
        for p in &peers {
            self.links.mark_seen(&p.id, now);
            if let Some(profile) = &p.profile {
                out.extend(self.store_profile(p.id, profile.clone()));
            }
        }
        let change = self
            .gossip
            .on_roster(&room_id, &room_label, peers.iter().map(|p| p.id));
        if change.room_switched {
            out.push(Action::Event(MeshEvent::RoomChanged {
                room_id,
                room_label,
            }));
        }
        out.push(Action::Event(MeshEvent::NearbyPeers(peers)));
        out.extend(self.apply_overlay(change, now));
        out
    }

    /// Open broadcast links we are responsible for and drop the ones no longer needed.
    fn apply_overlay(&mut self, change: OverlayChange, now: Instant) -> Vec<Action> {
        let mut out = Vec::new();
        let me = self.id();
        let overlay: Vec<PeerId> = self.gossip.overlay().iter().copied().collect();
        for peer in overlay {
            if role_for(me, peer) != Role::Initiator {
                continue;
            }
            out.extend(self.links.ensure_link(peer, Role::Initiator, now).into_iter().map(Action::Rtc));
            out.extend(
                self.links
                    .ensure_channels(peer, &[ChannelKind::Broadcast, ChannelKind::BroadcastControl])
                    .into_iter()
                    .map(Action::Rtc),
            );
        }
        for peer in change.removed {
            if self.wants_chat(&peer) {
                self.links.close_channel(&peer, ChannelKind::Broadcast);
                self.links.close_channel(&peer, ChannelKind::BroadcastControl);
            } else {
                out.extend(self.teardown(peer));
            }
        }
        out
    }

    fn wants_chat(&self, peer: &PeerId) -> bool {
        self.links.has_open(peer, ChannelKind::Chat)
            || self.outbox.is_pending(peer)
            || self.outgoing.has_pending(peer)
    }

    /// Close the link and everything riding on it. Queued items survive for a later link.
    fn teardown(&mut self, peer: PeerId) -> Vec<Action> {
        let mut out = Vec::new();
        let removed = self.links.remove(&peer);
        self.crypto.invalidate(&peer);
        out.extend(self.fail_transfers(peer, "link closed"));
        if let Some(cmd) = removed {
            out.push(Action::Rtc(cmd));
            out.push(Action::Event(MeshEvent::PeerLeft(peer)));
        }
        out
    }

    fn fail_transfers(&mut self, peer: PeerId, reason: &str) -> Vec<Action> {
        self.outgoing
            .drop_peer(&peer)
            .into_iter()
            .chain(self.incoming.drop_peer(&peer))
            .map(|id| {
                warn!(%peer, %id, reason, "transfer failed");
                Action::Event(MeshEvent::TransferFailed {
                    peer,
                    id,
                    reason: reason.to_owned(),
                })
            })
            .collect()
    }

    pub fn on_credential(&mut self, credential: TurnCredential, now: Instant) -> Vec<Action> {
        self.reliability.on_credential(&credential, now);
        vec![Action::Rtc(RtcCommand::SetRelayCredential(credential))]
    }

    pub fn on_credential_failed(&mut self, now: Instant) -> Vec<Action> {
        warn!("relay credential fetch failed");
        self.reliability.on_credential_failed(now);
        Vec::new()
    }

    /// Position from the host's location strategy; re-sent every refresh period.
    pub fn report_location(&mut self, position: GeoPosition, radius_km: f64) -> Vec<Action> {
        let msg = self.signaling.report_location(position, radius_km);
        if self.signaling.is_connected() {
            vec![Action::Relay(msg)]
        } else {
            Vec::new()
        }
    }

    /// No position at all: ask the relay to group us by network instead.
    pub fn request_lan_discovery(&mut self) -> Vec<Action> {
        if !self.signaling.is_connected() {
            return Vec::new();
        }
        vec![Action::Relay(self.signaling.request_lan_discovery())]
    }

    /// Offer or answer produced by the backend.
    pub fn on_local_description(&mut self, peer: PeerId, description: SessionDescription) -> Vec<Action> {
        if !self.links.contains(&peer) {
            return Vec::new();
        }
        let msg = match description.kind {
            SdpKind::Offer => self.signaling.offer(peer, description),
            SdpKind::Answer => self.signaling.answer(peer, description),
        };
        vec![Action::Relay(msg)]
    }

    pub fn on_local_candidate(&mut self, peer: PeerId, candidate: IceCandidate) -> Vec<Action> {
        if !self.links.contains(&peer) {
            return Vec::new();
        }
        vec![Action::Relay(self.signaling.candidate(peer, candidate))]
    }

    pub fn on_connection_state(&mut self, peer: PeerId, state: LinkState, now: Instant) -> Vec<Action> {
        let outcome = self.links.on_state(peer, state, now);
        let mut out: Vec<Action> = outcome.commands.into_iter().map(Action::Rtc).collect();
        if outcome.teardown {
            out.extend(self.teardown(peer));
        }
        out
    }

    /// A data channel (local or remote) is open and `handle` can send on it.
    pub fn on_channel_open(
        &mut self,
        peer: PeerId,
        label: &str,
        mut handle: Box<dyn DataChannel>,
    ) -> Vec<Action> {
        let Some(kind) = ChannelKind::from_label(label) else {
            warn!(%peer, label, "unknown channel label");
            handle.close();
            return Vec::new();
        };
        if self.signaling.is_blocked(&peer) {
            handle.close();
            return Vec::new();
        }
        if !self.links.on_channel_open(peer, kind, handle) {
            return Vec::new();
        }
        debug!(%peer, label, "channel open");
        match kind {
            ChannelKind::Chat => {
                let frame = ChatFrame::KeyExchange {
                    public_key: self.crypto.public_key().clone(),
                };
                if let Err(e) = self.send_json(&peer, kind, &frame) {
                    warn!(%peer, error = %e, "key exchange send failed");
                }
            }
            ChannelKind::BroadcastControl => self.send_profile_lite(&peer),
            ChannelKind::Broadcast => {}
        }
        Vec::new()
    }

    pub fn on_channel_closed(&mut self, peer: PeerId, label: &str) -> Vec<Action> {
        let Some(kind) = ChannelKind::from_label(label) else {
            return Vec::new();
        };
        if !self.links.on_channel_closed(&peer, kind) {
            return Vec::new();
        }
        debug!(%peer, label, "channel closed");
        if kind == ChannelKind::Chat {
            self.fail_transfers(peer, "chat channel closed")
        } else {
            Vec::new()
        }
    }

    pub fn on_channel_text(&mut self, peer: PeerId, label: &str, text: &str, now: Instant) -> Vec<Action> {
        if self.signaling.is_blocked(&peer) {
            return Vec::new();
        }
        match ChannelKind::from_label(label) {
            Some(ChannelKind::Chat) => self.on_chat_frame(peer, text, now),
            Some(ChannelKind::Broadcast) => self.on_broadcast_frame(peer, text),
            Some(ChannelKind::BroadcastControl) => match wire::decode_json::<ControlFrame>(text) {
                Ok(ControlFrame::ProfileLite(profile)) => self.store_profile(peer, profile),
                Err(e) => {
                    debug!(%peer, error = %e, "bad control frame");
                    Vec::new()
                }
            },
            None => Vec::new(),
        }
    }

    /// File chunk on the chat channel.
    pub fn on_channel_binary(&mut self, peer: PeerId, label: &str, data: &[u8], now: Instant) -> Vec<Action> {
        if ChannelKind::from_label(label) != Some(ChannelKind::Chat) {
            return Vec::new();
        }
        match wire::decode_chunk(data) {
            Ok((id, chunk)) => match self.incoming.on_chunk(&peer, id, chunk, now) {
                Ok(()) => Vec::new(),
                Err(e @ TransferError::Overrun { .. }) => vec![Action::Event(MeshEvent::TransferFailed {
                    peer,
                    id,
                    reason: e.to_string(),
                })],
                Err(e) => {
                    debug!(%peer, error = %e, "dropping chunk");
                    Vec::new()
                }
            },
            Err(e) => {
                debug!(%peer, error = %e, "bad binary frame");
                Vec::new()
            }
        }
    }

    /// The channel drained below the low-water mark: resume paused transfers.
    pub fn on_buffered_low(&mut self, peer: PeerId, label: &str) -> Vec<Action> {
        if ChannelKind::from_label(label) != Some(ChannelKind::Chat) {
            return Vec::new();
        }
        self.pump(peer)
    }

    fn on_chat_frame(&mut self, peer: PeerId, text: &str, now: Instant) -> Vec<Action> {
        let frame: ChatFrame = match wire::decode_json(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(%peer, error = %e, "bad chat frame");
                return Vec::new();
            }
        };
        match frame {
            ChatFrame::KeyExchange { public_key } => self.on_key_exchange(peer, public_key, now),
            ChatFrame::Sealed(envelope) => {
                let plain = match self.crypto.decrypt_message(&peer, &envelope) {
                    Ok(plain) => plain,
                    Err(e) => {
                        warn!(%peer, error = %e, "decrypt failed");
                        return vec![Action::Event(MeshEvent::DecryptFailed {
                            peer,
                            reason: e.to_string(),
                        })];
                    }
                };
                match serde_json::from_slice::<PeerPayload>(&plain) {
                    Ok(payload) => self.on_payload(peer, payload, now),
                    Err(e) => {
                        debug!(%peer, error = %e, "bad sealed payload");
                        Vec::new()
                    }
                }
            }
        }
    }

    fn on_key_exchange(&mut self, peer: PeerId, public_key: PublicKey, now: Instant) -> Vec<Action> {
        let fresh = self.crypto.derive_shared_secret(peer, &public_key);
        let mut out = self.flush_outbox(peer, now);
        if fresh {
            info!(%peer, "session established");
            let lite = self.profile.lite.clone();
            out.extend(self.send_payload(peer, PeerPayload::Profile(lite), now));
            out.push(Action::Event(MeshEvent::SessionEstablished(peer)));
        }
        out.extend(self.pump(peer));
        out
    }

    fn on_payload(&mut self, peer: PeerId, payload: PeerPayload, now: Instant) -> Vec<Action> {
        debug!(%peer, kind = payload.kind(), "payload");
        match payload {
            PeerPayload::ChatMessage { id, text, timestamp } => {
                let mut out = self.send_payload(peer, PeerPayload::MessageDelivered { id }, now);
                out.push(Action::Event(MeshEvent::ChatReceived {
                    peer,
                    id,
                    text,
                    timestamp,
                }));
                out
            }
            PeerPayload::FileStart {
                id,
                name,
                size,
                mime,
                encrypted_size,
                compressed,
            } => {
                let meta = FileMeta {
                    id,
                    name: name.clone(),
                    mime: mime.clone(),
                    size,
                    encrypted_size,
                    compressed,
                };
                match self.incoming.begin(peer, meta, now) {
                    Ok(()) => vec![Action::Event(MeshEvent::FileIncoming {
                        peer,
                        id,
                        name,
                        size,
                        mime,
                    })],
                    Err(e) => {
                        warn!(%peer, %id, error = %e, "rejecting file-start");
                        Vec::new()
                    }
                }
            }
            PeerPayload::FileEnd { id } => self.finish_incoming(peer, id, now),
            PeerPayload::FileCancel { id } => {
                if self.incoming.cancel(&peer, &id) {
                    info!(%peer, %id, "sender cancelled transfer");
                    vec![Action::Event(MeshEvent::TransferFailed {
                        peer,
                        id,
                        reason: "cancelled by sender".into(),
                    })]
                } else {
                    Vec::new()
                }
            }
            PeerPayload::MessageDelivered { id } => {
                vec![Action::Event(MeshEvent::MessageDelivered { peer, id })]
            }
            PeerPayload::MessageRead { id } => {
                vec![Action::Event(MeshEvent::MessageRead { peer, id })]
            }
            PeerPayload::Reaction { id, emoji } => {
                vec![Action::Event(MeshEvent::ReactionReceived { peer, id, emoji })]
            }
            PeerPayload::Profile(profile) | PeerPayload::ProfileUpdate(profile) => {
                let version = profile.avatar_version;
                let mut out = self.store_profile(peer, profile);
                let known = self.peer_avatars.get(&peer).copied().unwrap_or(0);
                if version > known {
                    out.extend(self.send_payload(peer, PeerPayload::AvatarRequest { version }, now));
                }
                out
            }
            PeerPayload::AvatarRequest { version } => {
                let Some(thumb) = &self.profile.avatar_thumb else {
                    return Vec::new();
                };
                if self.profile.lite.avatar_version < version {
                    debug!(%peer, version, "avatar request for a version we do not have");
                    return Vec::new();
                }
                let reply = PeerPayload::AvatarThumb {
                    version: self.profile.lite.avatar_version,
                    data: B64.encode(thumb),
                };
                self.send_payload(peer, reply, now)
            }
            PeerPayload::AvatarThumb { version, data } => match B64.decode(data) {
                Ok(data) => {
                    self.peer_avatars.insert(peer, version);
                    vec![Action::Event(MeshEvent::AvatarReceived {
                        peer,
                        version,
                        data,
                    })]
                }
                Err(e) => {
                    debug!(%peer, error = %e, "bad avatar data");
                    Vec::new()
                }
            },
        }
    }

    fn finish_incoming(&mut self, peer: PeerId, id: Uuid, now: Instant) -> Vec<Action> {
        let done = match self.incoming.finish(&peer, id, now) {
            Ok(done) => done,
            Err(e) => {
                return vec![Action::Event(MeshEvent::TransferFailed {
                    peer,
                    id,
                    reason: e.to_string(),
                })]
            }
        };
        match self.crypto.decrypt_file(&done.blob, done.meta.compressed) {
            Ok(bytes) => {
                info!(%peer, %id, name = %done.meta.name, bytes = bytes.len(), "file received");
                vec![Action::Event(MeshEvent::FileReceived {
                    peer,
                    id,
                    name: done.meta.name,
                    mime: done.meta.mime,
                    bytes,
                })]
            }
            Err(e) => {
                warn!(%peer, %id, error = %e, "file decrypt failed");
                vec![Action::Event(MeshEvent::TransferFailed {
                    peer,
                    id,
                    reason: e.to_string(),
                })]
            }
        }
    }

    fn store_profile(&mut self, peer: PeerId, profile: ProfileLite) -> Vec<Action> {
        if self.peer_profiles.get(&peer) == Some(&profile) {
            return Vec::new();
        }
        self.peer_profiles.insert(peer, profile.clone());
        vec![Action::Event(MeshEvent::ProfileUpdated { peer, profile })]
    }

    fn on_broadcast_frame(&mut self, peer: PeerId, text: &str) -> Vec<Action> {
        let msg: BroadcastMessage = match wire::decode_json(text) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(%peer, error = %e, "bad broadcast frame");
                return Vec::new();
            }
        };
        let signaling = &self.signaling;
        let Some(received) = self
            .gossip
            .receive(peer, msg, |p| signaling.is_blocked(p))
        else {
            return Vec::new();
        };
        if let Some((next, targets)) = received.forward {
            self.flood(&next, &targets);
        }
        vec![Action::Event(MeshEvent::BroadcastReceived(received.deliver))]
    }

    /// Best effort: peers without an open broadcast channel are skipped.
    fn flood(&mut self, msg: &BroadcastMessage, targets: &[PeerId]) {
        let text = match wire::encode_json(msg) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "broadcast encode failed");
                return;
            }
        };
        for peer in targets {
            let Some(channel) = self.links.channel_mut(peer, ChannelKind::Broadcast) else {
                continue;
            };
            if let Err(e) = channel.send_text(&text) {
                debug!(%peer, error = %e, "broadcast forward failed");
            }
        }
    }

    fn is_ready(&self, peer: &PeerId) -> bool {
        self.crypto.has_session(peer) && self.links.has_open(peer, ChannelKind::Chat)
    }

    fn ensure_chat(&mut self, peer: PeerId, now: Instant) -> Vec<Action> {
        self.links
            .ensure_chat_channel(peer, now)
            .into_iter()
            .map(Action::Rtc)
            .collect()
    }

    fn send_json<T: serde::Serialize>(
        &mut self,
        peer: &PeerId,
        kind: ChannelKind,
        msg: &T,
    ) -> Result<(), MeshError> {
        let text = wire::encode_json(msg)?;
        let channel = self
            .links
            .channel_mut(peer, kind)
            .ok_or(MeshError::NotReady(*peer))?;
        channel.send_text(&text)?;
        Ok(())
    }

    fn send_sealed(&mut self, peer: &PeerId, payload: &PeerPayload) -> Result<(), MeshError> {
        if !self.links.has_open(peer, ChannelKind::Chat) {
            return Err(MeshError::NotReady(*peer));
        }
        let plain = wire::encode_json(payload)?;
        let envelope = self.crypto.encrypt_message(peer, plain.as_bytes())?;
        self.send_json(peer, ChannelKind::Chat, &ChatFrame::Sealed(envelope))?;
        debug!(%peer, kind = payload.kind(), "sealed payload sent");
        Ok(())
    }

    /// Send now if possible, otherwise queue behind earlier items and open the chat channel.
    fn send_payload(&mut self, peer: PeerId, payload: PeerPayload, now: Instant) -> Vec<Action> {
        if payload.is_size_capped() {
            if let Err(e) = wire::encode_json_capped(&payload, self.config.payload_cap) {
                warn!(%peer, kind = payload.kind(), error = %e, "dropping oversized payload");
                return Vec::new();
            }
        }
        if self.outbox.is_pending(&peer) || !self.is_ready(&peer) {
            self.outbox.push(peer, Outgoing::Payload(payload));
            return self.ensure_chat(peer, now);
        }
        match self.send_sealed(&peer, &payload) {
            Ok(()) => Vec::new(),
            Err(e) if e.is_retryable() => {
                debug!(%peer, error = %e, "queueing payload");
                self.outbox.push(peer, Outgoing::Payload(payload));
                self.ensure_chat(peer, now)
            }
            Err(e) => {
                warn!(%peer, kind = payload.kind(), error = %e, "payload dropped");
                Vec::new()
            }
        }
    }

    /// Drain the queue in order. Stops at the first retryable failure and keeps the rest.
    fn flush_outbox(&mut self, peer: PeerId, now: Instant) -> Vec<Action> {
        let mut out = Vec::new();
        let mut items = self.outbox.take(&peer);
        if !items.is_empty() {
            debug!(%peer, count = items.len(), "flushing queued items");
        }
        while let Some(item) = items.pop_front() {
            let result = match &item {
                Outgoing::Payload(payload) => self.send_sealed(&peer, payload).map(|()| Vec::new()),
                Outgoing::File {
                    id,
                    name,
                    mime,
                    bytes,
                } => self.start_file(peer, *id, name, mime, bytes),
            };
            match result {
                Ok(actions) => out.extend(actions),
                Err(e) if e.is_retryable() => {
                    debug!(%peer, error = %e, "flush interrupted");
                    items.push_front(item);
                    break;
                }
                Err(e) => {
                    warn!(%peer, error = %e, "queued item dropped");
                    if let Outgoing::File { id, .. } = item {
                        out.push(Action::Event(MeshEvent::TransferFailed {
                            peer,
                            id,
                            reason: e.to_string(),
                        }));
                    }
                }
            }
        }
        if !items.is_empty() {
            self.outbox.requeue_front(peer, items);
            out.extend(self.ensure_chat(peer, now));
        }
        out
    }

    fn start_file(
        &mut self,
        peer: PeerId,
        id: Uuid,
        name: &str,
        mime: &str,
        bytes: &[u8],
    ) -> Result<Vec<Action>, MeshError> {
        let sealed = self.crypto.encrypt_file(bytes)?;
        let blob = sealed.blob;
        let start = PeerPayload::FileStart {
            id,
            name: name.to_owned(),
            size: bytes.len() as u64,
            mime: mime.to_owned(),
            encrypted_size: blob.len() as u64,
            compressed: sealed.compressed,
        };
        self.send_sealed(&peer, &start)?;
        info!(%peer, %id, name, size = bytes.len(), encrypted = blob.len(), "file transfer started");
        self.outgoing.push(
            peer,
            OutgoingTransfer::new(id, name.to_owned(), blob, self.config.chunk_size),
        );
        Ok(self.pump(peer))
    }

    /// Push chunks until the channel is full, then close out finished transfers.
    fn pump(&mut self, peer: PeerId) -> Vec<Action> {
        if !self.outgoing.has_pending(&peer) {
            return Vec::new();
        }
        let Some(channel) = self.links.channel_mut(&peer, ChannelKind::Chat) else {
            return Vec::new();
        };
        let report = match self
            .outgoing
            .pump(&peer, channel.as_mut(), self.config.buffered_high_water)
        {
            Ok(report) => report,
            Err(e) => {
                warn!(%peer, error = %e, "chunk send failed");
                return self.fail_transfers(peer, "chunk send failed");
            }
        };
        let mut out = Vec::new();
        for id in report.finished {
            match self.send_sealed(&peer, &PeerPayload::FileEnd { id }) {
                Ok(()) => {
                    info!(%peer, %id, "file sent");
                    out.push(Action::Event(MeshEvent::FileSent { peer, id }));
                }
                Err(e) => out.push(Action::Event(MeshEvent::TransferFailed {
                    peer,
                    id,
                    reason: e.to_string(),
                })),
            }
        }
        out
    }

    pub fn send_chat(&mut self, peer: PeerId, text: String, now: Instant) -> Result<(Uuid, Vec<Action>), MeshError> {
        if self.signaling.is_blocked(&peer) {
            return Err(MeshError::Blocked(peer));
        }
        let id = Uuid::new_v4();
        let payload = PeerPayload::ChatMessage {
            id,
            text,
            timestamp: unix_ms(),
        };
        Ok((id, self.send_payload(peer, payload, now)))
    }

    pub fn send_file(
        &mut self,
        peer: PeerId,
        name: String,
        mime: String,
        bytes: Vec<u8>,
        now: Instant,
    ) -> Result<(Uuid, Vec<Action>), MeshError> {
        if self.signaling.is_blocked(&peer) {
            return Err(MeshError::Blocked(peer));
        }
        let id = Uuid::new_v4();
        if self.outbox.is_pending(&peer) || !self.is_ready(&peer) {
            self.outbox.push(
                peer,
                Outgoing::File {
                    id,
                    name,
                    mime,
                    bytes,
                },
            );
            return Ok((id, self.ensure_chat(peer, now)));
        }
        match self.start_file(peer, id, &name, &mime, &bytes) {
            Ok(actions) => Ok((id, actions)),
            Err(e) if e.is_retryable() => {
                self.outbox.push(
                    peer,
                    Outgoing::File {
                        id,
                        name,
                        mime,
                        bytes,
                    },
                );
                Ok((id, self.ensure_chat(peer, now)))
            }
            Err(e) => Err(e),
        }
    }

    /// Stop an outgoing transfer before its next chunk.
    pub fn cancel_transfer(&mut self, id: Uuid) -> Result<Vec<Action>, MeshError> {
        if let Some(peer) = self.outbox.remove_file(&id) {
            return Ok(vec![Action::Event(MeshEvent::TransferFailed {
                peer,
                id,
                reason: "cancelled".into(),
            })]);
        }
        let peer = self
            .outgoing
            .cancel(&id)
            .ok_or(MeshError::UnknownTransfer(id))?;
        info!(%peer, %id, "transfer cancelled");
        if let Err(e) = self.send_sealed(&peer, &PeerPayload::FileCancel { id }) {
            debug!(%peer, error = %e, "file-cancel not delivered");
        }
        Ok(vec![Action::Event(MeshEvent::TransferFailed {
            peer,
            id,
            reason: "cancelled".into(),
        })])
    }

    pub fn mark_read(&mut self, peer: PeerId, id: Uuid, now: Instant) -> Vec<Action> {
        self.send_payload(peer, PeerPayload::MessageRead { id }, now)
    }

    pub fn send_reaction(&mut self, peer: PeerId, id: Uuid, emoji: String, now: Instant) -> Vec<Action> {
        self.send_payload(peer, PeerPayload::Reaction { id, emoji }, now)
    }

    /// Post to the public room. Delivered locally, then flooded to overlay peers.
    pub fn broadcast(&mut self, text: String) -> Result<(BroadcastMessage, Vec<Action>), MeshError> {
        let msg = self
            .gossip
            .originate(text, unix_ms())
            .ok_or(MeshError::NoRoom)?;
        let targets = self.gossip.forward_targets(&msg, None);
        self.flood(&msg, &targets);
        let out = vec![Action::Event(MeshEvent::BroadcastReceived(msg.clone()))];
        Ok((msg, out))
    }

    /// Replace the local profile and announce it to the relay, sessions and broadcast links.
    pub fn set_profile(&mut self, profile: Profile, now: Instant) -> Vec<Action> {
        self.profile = profile;
        let mut out = Vec::new();
        if self.signaling.is_connected() {
            let mut avatar = self.profile.avatar_thumb.as_ref().map(|t| B64.encode(t));
            if avatar.as_ref().is_some_and(|a| a.len() > self.config.payload_cap) {
                warn!("avatar too large for relay profile update, omitting");
                avatar = None;
            }
            out.push(Action::Relay(ClientMessage::ServerProfileUpdate {
                name: self.profile.lite.name.clone(),
                avatar_version: self.profile.lite.avatar_version,
                avatar,
            }));
        }
        for peer in self.links.peers() {
            if self.crypto.has_session(&peer) {
                let update = PeerPayload::ProfileUpdate(self.profile.lite.clone());
                out.extend(self.send_payload(peer, update, now));
            }
            if self.links.has_open(&peer, ChannelKind::BroadcastControl) {
                self.send_profile_lite(&peer);
            }
        }
        out
    }

    fn send_profile_lite(&mut self, peer: &PeerId) {
        let frame = ControlFrame::ProfileLite(self.profile.lite.clone());
        let text = match wire::encode_json_capped(&frame, self.config.payload_cap) {
            Ok(text) => text,
            Err(e) => {
                warn!(%peer, error = %e, "dropping oversized profile-lite");
                return;
            }
        };
        if let Some(channel) = self.links.channel_mut(peer, ChannelKind::BroadcastControl) {
            if let Err(e) = channel.send_text(&text) {
                debug!(%peer, error = %e, "profile-lite send failed");
            }
        }
    }

    /// Ask a peer for its current avatar thumbnail.
    pub fn request_avatar(&mut self, peer: PeerId, now: Instant) -> Vec<Action> {
        let version = self
            .peer_profiles
            .get(&peer)
            .map_or(0, |p| p.avatar_version);
        self.send_payload(peer, PeerPayload::AvatarRequest { version }, now)
    }

    /// Drop everything from and to `peer` until unblocked.
    pub fn block(&mut self, peer: PeerId, now: Instant) -> Vec<Action> {
        if !self.signaling.block(peer) {
            return Vec::new();
        }
        info!(%peer, "peer blocked");
        let dropped = self.outbox.clear(&peer);
        if dropped > 0 {
            debug!(%peer, dropped, "discarded queued items");
        }
        let mut out = self.teardown(peer);
        let change = self.gossip.remove_member(&peer);
        out.extend(self.apply_overlay(change, now));
        out
    }

    pub fn unblock(&mut self, peer: &PeerId) -> bool {
        self.signaling.unblock(peer)
    }

    /// Close the link to `peer`. Queued items stay for a later link.
    pub fn disconnect(&mut self, peer: PeerId) -> Vec<Action> {
        self.teardown(peer)
    }

    /// Drive link timers and maintenance. Call at least every few hundred milliseconds.
    pub fn tick(&mut self, now: Instant) -> Vec<Action> {
        let (commands, dead) = self.links.tick(now);
        let mut out: Vec<Action> = commands.into_iter().map(Action::Rtc).collect();
        for peer in dead {
            out.extend(self.teardown(peer));
        }
        for (peer, id) in self.incoming.expire(now, self.config.transfer_idle()) {
            warn!(%peer, %id, "incoming transfer stalled");
            out.push(Action::Event(MeshEvent::TransferFailed {
                peer,
                id,
                reason: "transfer stalled".into(),
            }));
        }
        for timer in self.reliability.due(now) {
            match timer {
                Timer::Heartbeat => {
                    if self.signaling.is_connected() {
                        out.push(Action::Relay(self.signaling.heartbeat(unix_ms())));
                    }
                }
                Timer::Prune => {
                    let stale = self.links.stale(now, self.config.stale_after());
                    if !stale.is_empty() {
                        info!(count = stale.len(), "pruning stale links");
                    }
                    for peer in stale {
                        out.extend(self.teardown(peer));
                    }
                }
                Timer::Location => match self.signaling.refresh_location() {
                    Some(msg) if self.signaling.is_connected() => out.push(Action::Relay(msg)),
                    Some(_) => {}
                    None => out.push(Action::AcquireLocation),
                },
                Timer::Credential => out.push(Action::FetchCredential),
            }
        }
        out
    }

    /// Close every link and stop all timers.
    pub fn shutdown(&mut self) -> Vec<Action> {
        info!("mesh core shutting down");
        self.reliability.shutdown();
        let mut out = Vec::new();
        for peer in self.links.peers() {
            out.extend(self.teardown(peer));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::RecordingChannel;
    use crate::protocol::RelayMessage;
    use crate::wire::Frame;
    use rand::RngCore;
    use std::time::Duration;

    struct Node {
        core: MeshCore,
        chat: RecordingChannel,
    }

    fn node(name: &str) -> Node {
        let profile = Profile {
            lite: ProfileLite {
                name: name.into(),
                ..Default::default()
            },
            avatar_thumb: None,
        };
        Node {
            core: MeshCore::new(Identity::generate(), profile, MeshConfig::default()),
            chat: RecordingChannel::new(),
        }
    }

    fn offer_from(peer: PeerId) -> String {
        serde_json::to_string(&RelayMessage::Offer {
            from: peer,
            payload: SessionDescription {
                kind: SdpKind::Offer,
                sdp: "v=0".into(),
            },
        })
        .unwrap()
    }

    /// Deliver every text frame `from` wrote on its chat channel to `to`.
    fn deliver(from: &Node, to: &mut Node, now: Instant) -> Vec<Action> {
        let sender = from.core.id();
        let mut out = Vec::new();
        for frame in from.chat.take_frames() {
            match frame {
                Frame::Text(t) => out.extend(to.core.on_channel_text(sender, "chat", &t, now)),
                Frame::Binary(b) => out.extend(to.core.on_channel_binary(sender, "chat", &b, now)),
            }
        }
        out
    }

    /// A opens a chat link to B and both sides finish the key exchange.
    fn connect(a: &mut Node, b: &mut Node, now: Instant) {
        let a_id = a.core.id();
        let b_id = b.core.id();
        a.core.ensure_chat(b_id, now);
        b.core.on_relay_text(&offer_from(a_id), now);
        a.core.on_channel_open(b_id, "chat", a.chat.boxed());
        b.core.on_channel_open(a_id, "chat", b.chat.boxed());
        deliver(a, b, now);
        deliver(b, a, now);
        deliver(a, b, now);
        deliver(b, a, now);
    }

    fn events(actions: &[Action]) -> Vec<&MeshEvent> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Event(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn start_requests_credential_and_location() {
        let mut n = node("a");
        assert_eq!(n.core.start(), vec![Action::FetchCredential, Action::AcquireLocation]);
    }

    #[test]
    fn relay_connect_registers() {
        let mut n = node("a");
        let out = n.core.on_relay_connected(Instant::now());
        assert!(matches!(out[0], Action::Relay(ClientMessage::Register { .. })));
        assert!(out.contains(&Action::Event(MeshEvent::RelayOpened(n.core.id()))));
    }

    #[test]
    fn chat_before_session_is_queued_and_flushed_in_order() {
        let now = Instant::now();
        let mut a = node("a");
        let mut b = node("b");
        let b_id = b.core.id();
        let (_, out) = a.core.send_chat(b_id, "one".into(), now).unwrap();
        assert!(out
            .iter()
            .any(|x| matches!(x, Action::Rtc(RtcCommand::Open { role: Role::Initiator, .. }))));
        a.core.send_chat(b_id, "two".into(), now).unwrap();
        assert_eq!(a.core.pending_count(&b_id), 2);

        connect(&mut a, &mut b, now);
        assert!(a.core.has_session(&b_id));
        assert_eq!(a.core.pending_count(&b_id), 0);
    }

    #[test]
    fn chat_delivery_emits_event_and_ack() {
        let now = Instant::now();
        let mut a = node("a");
        let mut b = node("b");
        connect(&mut a, &mut b, now);
        let (id, _) = a.core.send_chat(b.core.id(), "hello".into(), now).unwrap();
        let got = deliver(&a, &mut b, now);
        assert!(events(&got).iter().any(|e| matches!(
            e,
            MeshEvent::ChatReceived { text, id: got_id, .. } if text == "hello" && *got_id == id
        )));
        let acks = deliver(&b, &mut a, now);
        assert!(events(&acks)
            .iter()
            .any(|e| matches!(e, MeshEvent::MessageDelivered { id: got_id, .. } if *got_id == id)));
    }

    #[test]
    fn garbage_ciphertext_reports_decrypt_failure() {
        let now = Instant::now();
        let mut a = node("a");
        let mut b = node("b");
        connect(&mut a, &mut b, now);
        let frame = r#"{"type":"sealed","nonce":"AAAAAAAAAAAAAAAA","ciphertext":"AAAAAAAAAAAAAAAAAAAAAAAA"}"#;
        let out = b.core.on_channel_text(a.core.id(), "chat", frame, now);
        assert!(matches!(events(&out)[..], [MeshEvent::DecryptFailed { .. }]));
    }

    #[test]
    fn failure_tears_down_and_reports_peer_left() {
        let now = Instant::now();
        let mut a = node("a");
        let mut b = node("b");
        connect(&mut a, &mut b, now);
        let b_id = b.core.id();
        a.core.on_connection_state(b_id, LinkState::Checking, now);
        a.core.on_connection_state(b_id, LinkState::Failed, now);
        a.core.on_connection_state(b_id, LinkState::Checking, now);
        let out = a.core.on_connection_state(b_id, LinkState::Failed, now);
        assert!(out.contains(&Action::Rtc(RtcCommand::Close { peer: b_id })));
        assert!(out.contains(&Action::Event(MeshEvent::PeerLeft(b_id))));
        assert!(!a.core.has_session(&b_id));
        assert!(a.chat.is_closed());
    }

    #[test]
    fn blocked_peer_is_refused() {
        let now = Instant::now();
        let mut a = node("a");
        let mut b = node("b");
        connect(&mut a, &mut b, now);
        let b_id = b.core.id();
        a.core.block(b_id, now);
        assert!(a.core.links().get(&b_id).is_none());
        assert!(matches!(
            a.core.send_chat(b_id, "x".into(), now),
            Err(MeshError::Blocked(_))
        ));
        assert!(a.core.on_relay_text(&offer_from(b_id), now).is_empty());
        assert!(a.core.unblock(&b_id));
    }

    #[test]
    fn cancel_unknown_transfer_is_an_error() {
        let mut a = node("a");
        assert!(matches!(
            a.core.cancel_transfer(Uuid::new_v4()),
            Err(MeshError::UnknownTransfer(_))
        ));
    }

    #[test]
    fn queued_file_can_be_cancelled() {
        let now = Instant::now();
        let mut a = node("a");
        let peer = PeerId::random();
        let (id, _) = a
            .core
            .send_file(peer, "a.txt".into(), "text/plain".into(), b"abc".to_vec(), now)
            .unwrap();
        let out = a.core.cancel_transfer(id).unwrap();
        assert!(matches!(events(&out)[..], [MeshEvent::TransferFailed { .. }]));
        assert_eq!(a.core.pending_count(&peer), 0);
    }

    #[test]
    fn cancelled_transfer_tells_receiver() {
        let now = Instant::now();
        let mut a = node("a");
        let mut b = node("b");
        connect(&mut a, &mut b, now);
        let b_id = b.core.id();
        let mut big = vec![0u8; 2 * 1024 * 1024];
        rand::thread_rng().fill_bytes(&mut big);
        let (id, _) = a
            .core
            .send_file(b_id, "big.bin".into(), "application/octet-stream".into(), big, now)
            .unwrap();
        a.core.cancel_transfer(id).unwrap();
        let got = deliver(&a, &mut b, now);
        let evs = events(&got);
        assert!(evs.iter().any(|e| matches!(e, MeshEvent::FileIncoming { .. })));
        assert!(evs.iter().any(|e| matches!(
            e,
            MeshEvent::TransferFailed { reason, .. } if reason == "cancelled by sender"
        )));
        assert!(!evs.iter().any(|e| matches!(e, MeshEvent::FileReceived { .. })));
    }

    /// A starts a small file to B; only the `file-start` frame reaches B.
    fn announce_only(a: &mut Node, b: &mut Node, now: Instant) -> Uuid {
        let (id, _) = a
            .core
            .send_file(b.core.id(), "s.txt".into(), "text/plain".into(), vec![9u8; 512], now)
            .unwrap();
        for frame in a.chat.take_frames() {
            if let Frame::Text(t) = frame {
                let out = b.core.on_channel_text(a.core.id(), "chat", &t, now);
                if events(&out).iter().any(|e| matches!(e, MeshEvent::FileIncoming { .. })) {
                    return id;
                }
            }
        }
        panic!("file-start never arrived");
    }

    #[test]
    fn oversized_incoming_transfer_fails_at_once() {
        let now = Instant::now();
        let mut a = node("a");
        let mut b = node("b");
        connect(&mut a, &mut b, now);
        let a_id = a.core.id();
        let id = announce_only(&mut a, &mut b, now);

        let flood = wire::encode_chunk(id, &vec![0u8; 64 * 1024]);
        let out = b.core.on_channel_binary(a_id, "chat", &flood, now);
        assert!(matches!(
            events(&out)[..],
            [MeshEvent::TransferFailed { id: failed, .. }] if *failed == id
        ));
        assert!(b.core.on_channel_binary(a_id, "chat", &flood, now).is_empty());
    }

    #[test]
    fn stalled_incoming_transfer_fails_on_tick() {
        let now = Instant::now();
        let mut a = node("a");
        let mut b = node("b");
        connect(&mut a, &mut b, now);
        let id = announce_only(&mut a, &mut b, now);

        let quiet = b.core.tick(now + Duration::from_secs(30));
        assert!(events(&quiet).is_empty());
        let out = b.core.tick(now + Duration::from_secs(61));
        assert!(events(&out).iter().any(|e| matches!(
            e,
            MeshEvent::TransferFailed { id: failed, reason, .. } if *failed == id && reason == "transfer stalled"
        )));
    }

    #[test]
    fn read_receipt_and_reaction_reach_sender() {
        let now = Instant::now();
        let mut a = node("a");
        let mut b = node("b");
        connect(&mut a, &mut b, now);
        let a_id = a.core.id();
        let (id, _) = a.core.send_chat(b.core.id(), "hi".into(), now).unwrap();
        deliver(&a, &mut b, now);
        deliver(&b, &mut a, now);

        b.core.mark_read(a_id, id, now);
        b.core.send_reaction(a_id, id, "👍".into(), now);
        let got = deliver(&b, &mut a, now);
        let evs = events(&got);
        assert!(evs
            .iter()
            .any(|e| matches!(e, MeshEvent::MessageRead { id: read, .. } if *read == id)));
        assert!(evs.iter().any(|e| matches!(
            e,
            MeshEvent::ReactionReceived { id: r, emoji, .. } if *r == id && emoji == "👍"
        )));
    }

    #[test]
    fn explicit_avatar_request_returns_thumbnail() {
        let now = Instant::now();
        let mut a = node("a");
        let mut b = node("b");
        b.core.profile.avatar_thumb = Some(vec![5, 6, 7]);
        b.core.profile.lite.avatar_version = 2;
        connect(&mut a, &mut b, now);

        a.core.request_avatar(b.core.id(), now);
        deliver(&a, &mut b, now);
        let got = deliver(&b, &mut a, now);
        assert!(events(&got).iter().any(|e| matches!(
            e,
            MeshEvent::AvatarReceived { version: 2, data, .. } if data == &vec![5, 6, 7]
        )));
    }

    fn roster(room: &str, peers: &[PeerId]) -> String {
        serde_json::to_string(&RelayMessage::NearbyPeers {
            peers: peers
                .iter()
                .map(|id| NearbyPeer {
                    id: *id,
                    profile: None,
                })
                .collect(),
            room_id: room.into(),
            room_label: String::new(),
        })
        .unwrap()
    }

    /// A peer id this node would initiate to.
    fn higher_peer(me: PeerId) -> PeerId {
        loop {
            let p = PeerId::random();
            if role_for(me, p) == Role::Initiator {
                return p;
            }
        }
    }

    #[test]
    fn room_change_drops_broadcast_links_but_keeps_chat() {
        let now = Instant::now();
        let mut a = node("a");
        let mut b = node("b");
        connect(&mut a, &mut b, now);
        let a_id = a.core.id();
        let b_id = b.core.id();
        let c = higher_peer(a_id);
        let d = higher_peer(a_id);

        a.core.on_relay_text(&roster("r1", &[b_id, c, d]), now);
        assert!(a.core.links().get(&c).is_some());
        assert!(a.core.links().get(&d).is_some());

        let update = serde_json::to_string(&RelayMessage::RoomUpdate {
            room_id: "r2".into(),
            room_label: "elsewhere".into(),
        })
        .unwrap();
        let out = a.core.on_relay_text(&update, now);
        assert!(events(&out)
            .iter()
            .any(|e| matches!(e, MeshEvent::RoomChanged { room_id, .. } if room_id == "r2")));
        for p in [c, d] {
            assert!(out.contains(&Action::Event(MeshEvent::PeerLeft(p))));
            assert!(a.core.links().get(&p).is_none());
        }
        // B still has an open chat, so only its broadcast channels close.
        assert!(!out.contains(&Action::Event(MeshEvent::PeerLeft(b_id))));
        assert!(a.core.links().get(&b_id).is_some());
        assert!(a.core.has_session(&b_id));
    }

    #[test]
    fn heartbeat_and_prune_follow_relay() {
        let t0 = Instant::now();
        let mut a = node("a");
        a.core.on_relay_connected(t0);
        let out = a.core.tick(t0 + Duration::from_secs(25));
        assert!(out
            .iter()
            .any(|x| matches!(x, Action::Relay(ClientMessage::Heartbeat { .. }))));

        let idle = PeerId::random();
        a.core.ensure_chat(idle, t0);
        let out = a.core.tick(t0 + Duration::from_secs(60));
        assert!(out.contains(&Action::Event(MeshEvent::PeerLeft(idle))));

        a.core.on_relay_disconnected();
        assert!(a.core.next_deadline().is_none());
    }

    #[test]
    fn credential_pushes_to_backend_and_schedules_refresh() {
        let t0 = Instant::now();
        let mut a = node("a");
        let cred = TurnCredential {
            username: "u".into(),
            credential: "p".into(),
            ttl: 600,
        };
        let out = a.core.on_credential(cred.clone(), t0);
        assert_eq!(out, vec![Action::Rtc(RtcCommand::SetRelayCredential(cred))]);
        let out = a.core.tick(t0 + Duration::from_secs(540));
        assert!(out.contains(&Action::FetchCredential));
    }

    #[test]
    fn avatar_exchange_after_profile() {
        let now = Instant::now();
        let mut a = node("a");
        let mut b = node("b");
        b.core.profile.avatar_thumb = Some(vec![1, 2, 3]);
        b.core.profile.lite.avatar_version = 4;
        connect(&mut a, &mut b, now);
        // A saw version 4 in B's profile, asked for it and got the thumbnail back.
        assert_eq!(a.core.peer_avatars.get(&b.core.id()), Some(&4));
        assert_eq!(a.core.peer_profile(&b.core.id()).unwrap().avatar_version, 4);
        assert!(b.core.peer_avatars.is_empty());
    }
}
