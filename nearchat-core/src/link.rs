//! Connection manager: one `PeerLink` per remote id, the ICE failure policy, and the table of
//! open logical channels. The host's RTC backend does the work; this module only decides.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::channel::{ChannelKind, DataChannel};
use crate::identity::PeerId;
use crate::protocol::{IceCandidate, SessionDescription};
use crate::reliability::TurnCredential;

/// Mirrors the peer connection state reported by the RTC backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl LinkState {
    pub fn is_up(self) -> bool {
        matches!(self, LinkState::Connected | LinkState::Completed)
    }

    /// Connected or still working on it; such links are never pruned.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            LinkState::Connected | LinkState::Completed | LinkState::Checking
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Creates channels and sends offers.
    Initiator,
    /// Answers offers and accepts inbound channels.
    Responder,
}

/// Overlay links are opened by the smaller id so both sides agree without negotiating.
pub fn role_for(local: PeerId, remote: PeerId) -> Role {
    if local < remote {
        Role::Initiator
    } else {
        Role::Responder
    }
}

/// Work for the host's RTC backend.
#[derive(Debug, Clone, PartialEq)]
pub enum RtcCommand {
    /// Create the peer connection.
    Open {
        peer: PeerId,
        role: Role,
        relay_only: bool,
    },
    CreateChannel {
        peer: PeerId,
        kind: ChannelKind,
    },
    /// Create an offer, set it locally and report it through `on_local_description`.
    Negotiate {
        peer: PeerId,
        ice_restart: bool,
    },
    /// Restrict ICE to relay candidates on the existing connection.
    ForceRelay {
        peer: PeerId,
    },
    /// Set the remote offer, then produce and report an answer.
    ApplyOffer {
        peer: PeerId,
        description: SessionDescription,
    },
    ApplyAnswer {
        peer: PeerId,
        description: SessionDescription,
    },
    AddCandidate {
        peer: PeerId,
        candidate: IceCandidate,
    },
    Close {
        peer: PeerId,
    },
    /// Relay credential for every connection created from now on.
    SetRelayCredential(TurnCredential),
}

pub struct PeerLink {
    pub peer: PeerId,
    pub state: LinkState,
    pub role: Role,
    pub relay_only: bool,
    channels: HashMap<ChannelKind, Box<dyn DataChannel>>,
    requested: BTreeSet<ChannelKind>,
    /// Last time the peer appeared in a roster or the link was created.
    pub last_seen: Instant,
    state_since: Instant,
    restart_attempted: bool,
}

impl PeerLink {
    fn new(peer: PeerId, role: Role, now: Instant) -> Self {
        Self {
            peer,
            state: LinkState::New,
            role,
            relay_only: false,
            channels: HashMap::new(),
            requested: BTreeSet::new(),
            last_seen: now,
            state_since: now,
            restart_attempted: false,
        }
    }

    pub fn has_open(&self, kind: ChannelKind) -> bool {
        self.channels.contains_key(&kind)
    }

    fn close_channels(&mut self) {
        for (_, mut ch) in self.channels.drain() {
            ch.close();
        }
        self.requested.clear();
    }
}

/// Result of a state report.
#[derive(Debug, Default)]
pub struct StateOutcome {
    pub commands: Vec<RtcCommand>,
    /// The link is beyond recovery and must be torn down.
    pub teardown: bool,
}

/// Result of a remote offer.
#[derive(Debug, Default)]
pub struct OfferOutcome {
    pub commands: Vec<RtcCommand>,
    pub created: bool,
}

pub struct ConnectionManager {
    local: PeerId,
    links: HashMap<PeerId, PeerLink>,
    ice_check_timeout: Duration,
    disconnect_grace: Duration,
}

impl ConnectionManager {
    pub fn new(local: PeerId, ice_check_timeout: Duration, disconnect_grace: Duration) -> Self {
        Self {
            local,
            links: HashMap::new(),
            ice_check_timeout,
            disconnect_grace,
        }
    }

    pub fn get(&self, peer: &PeerId) -> Option<&PeerLink> {
        self.links.get(peer)
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.links.contains_key(peer)
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.links.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Create the link if absent. Existing links keep their role.
    pub fn ensure_link(&mut self, peer: PeerId, role: Role, now: Instant) -> Vec<RtcCommand> {
        if self.links.contains_key(&peer) {
            return Vec::new();
        }
        info!(%peer, ?role, "opening link");
        self.links.insert(peer, PeerLink::new(peer, role, now));
        vec![RtcCommand::Open {
            peer,
            role,
            relay_only: false,
        }]
    }

    /// Request channels that are neither open nor already requested. One negotiation covers
    /// them all; a responder whose link is still coming up relies on the remote offer instead.
    pub fn ensure_channels(&mut self, peer: PeerId, kinds: &[ChannelKind]) -> Vec<RtcCommand> {
        let Some(link) = self.links.get_mut(&peer) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for kind in kinds {
            if link.has_open(*kind) || !link.requested.insert(*kind) {
                continue;
            }
            out.push(RtcCommand::CreateChannel { peer, kind: *kind });
        }
        if !out.is_empty() && (link.role == Role::Initiator || link.state.is_up()) {
            out.push(RtcCommand::Negotiate {
                peer,
                ice_restart: false,
            });
        }
        out
    }

    /// Make sure a chat channel exists or is on its way. Locally created links initiate.
    pub fn ensure_chat_channel(&mut self, peer: PeerId, now: Instant) -> Vec<RtcCommand> {
        let mut out = self.ensure_link(peer, Role::Initiator, now);
        out.extend(self.ensure_channels(peer, &[ChannelKind::Chat]));
        out
    }

    /// Remote offer. A link created here is a responder. When both sides offered at once the
    /// smaller id wins: it ignores the remote offer, the larger id resets to responder.
    pub fn on_remote_offer(
        &mut self,
        peer: PeerId,
        description: SessionDescription,
        now: Instant,
    ) -> OfferOutcome {
        let mut outcome = OfferOutcome::default();
        match self.links.get_mut(&peer) {
            None => {
                outcome.created = true;
                outcome.commands = self.ensure_link(peer, Role::Responder, now);
            }
            Some(link) if link.role == Role::Initiator && !link.state.is_up() => {
                if role_for(self.local, peer) == Role::Initiator {
                    debug!(%peer, "offer collision, keeping local offer");
                    return outcome;
                }
                debug!(%peer, "offer collision, yielding to remote");
                let requested: Vec<ChannelKind> = link.requested.iter().copied().collect();
                let relay_only = link.relay_only;
                link.close_channels();
                link.role = Role::Responder;
                link.state = LinkState::New;
                link.state_since = now;
                outcome.commands.push(RtcCommand::Close { peer });
                outcome.commands.push(RtcCommand::Open {
                    peer,
                    role: Role::Responder,
                    relay_only,
                });
                for kind in requested {
                    link.requested.insert(kind);
                    outcome.commands.push(RtcCommand::CreateChannel { peer, kind });
                }
            }
            Some(_) => {}
        }
        outcome
            .commands
            .push(RtcCommand::ApplyOffer { peer, description });
        outcome
    }

    fn relay_fallback(link: &mut PeerLink, now: Instant) -> Vec<RtcCommand> {
        warn!(peer = %link.peer, "switching link to relay-only");
        link.relay_only = true;
        link.state_since = now;
        link.restart_attempted = false;
        let mut out = vec![RtcCommand::ForceRelay { peer: link.peer }];
        if link.role == Role::Initiator {
            out.push(RtcCommand::Negotiate {
                peer: link.peer,
                ice_restart: true,
            });
        }
        out
    }

    /// Connection state report from the backend.
    pub fn on_state(&mut self, peer: PeerId, state: LinkState, now: Instant) -> StateOutcome {
        let mut outcome = StateOutcome::default();
        let Some(link) = self.links.get_mut(&peer) else {
            return outcome;
        };
        if link.state == state {
            return outcome;
        }
        debug!(%peer, from = ?link.state, to = ?state, "link state");
        link.state = state;
        link.state_since = now;
        match state {
            LinkState::Connected | LinkState::Completed => {
                link.restart_attempted = false;
            }
            LinkState::Disconnected => {
                link.restart_attempted = false;
            }
            LinkState::Failed if link.relay_only => {
                warn!(%peer, "relay-only link failed");
                outcome.teardown = true;
            }
            LinkState::Failed => {
                outcome.commands = Self::relay_fallback(link, now);
            }
            LinkState::Closed => outcome.teardown = true,
            LinkState::New | LinkState::Checking => {}
        }
        outcome
    }

    /// Time-driven part of the ICE policy. Returns commands and links to tear down.
    pub fn tick(&mut self, now: Instant) -> (Vec<RtcCommand>, Vec<PeerId>) {
        let mut commands = Vec::new();
        let mut teardown = Vec::new();
        for link in self.links.values_mut() {
            let elapsed = now.saturating_duration_since(link.state_since);
            match link.state {
                LinkState::Checking if elapsed >= self.ice_check_timeout => {
                    if link.relay_only {
                        warn!(peer = %link.peer, "relay-only link stuck checking");
                        teardown.push(link.peer);
                    } else {
                        commands.extend(Self::relay_fallback(link, now));
                    }
                }
                LinkState::Disconnected => {
                    if elapsed >= self.disconnect_grace + self.ice_check_timeout {
                        warn!(peer = %link.peer, "link did not recover");
                        teardown.push(link.peer);
                    } else if elapsed >= self.disconnect_grace && !link.restart_attempted {
                        link.restart_attempted = true;
                        info!(peer = %link.peer, "ice restart");
                        if link.role == Role::Initiator {
                            commands.push(RtcCommand::Negotiate {
                                peer: link.peer,
                                ice_restart: true,
                            });
                        }
                    }
                }
                _ => {}
            }
        }
        (commands, teardown)
    }

    pub fn mark_seen(&mut self, peer: &PeerId, now: Instant) {
        if let Some(link) = self.links.get_mut(peer) {
            link.last_seen = now;
        }
    }

    /// Links absent from rosters for `stale_after` that are not live.
    pub fn stale(&self, now: Instant, stale_after: Duration) -> Vec<PeerId> {
        self.links
            .values()
            .filter(|l| {
                !l.state.is_live() && now.saturating_duration_since(l.last_seen) >= stale_after
            })
            .map(|l| l.peer)
            .collect()
    }

    /// Register a channel the backend reports open. Handles for unknown links are closed.
    pub fn on_channel_open(
        &mut self,
        peer: PeerId,
        kind: ChannelKind,
        mut handle: Box<dyn DataChannel>,
    ) -> bool {
        let Some(link) = self.links.get_mut(&peer) else {
            warn!(%peer, label = kind.label(), "channel for unknown link");
            handle.close();
            return false;
        };
        link.requested.remove(&kind);
        if let Some(mut old) = link.channels.insert(kind, handle) {
            old.close();
        }
        true
    }

    pub fn on_channel_closed(&mut self, peer: &PeerId, kind: ChannelKind) -> bool {
        let Some(link) = self.links.get_mut(peer) else {
            return false;
        };
        link.requested.remove(&kind);
        link.channels.remove(&kind).is_some()
    }

    pub fn close_channel(&mut self, peer: &PeerId, kind: ChannelKind) {
        if let Some(link) = self.links.get_mut(peer) {
            link.requested.remove(&kind);
            if let Some(mut ch) = link.channels.remove(&kind) {
                ch.close();
            }
        }
    }

    pub fn has_open(&self, peer: &PeerId, kind: ChannelKind) -> bool {
        self.links.get(peer).is_some_and(|l| l.has_open(kind))
    }

    pub fn channel_mut(&mut self, peer: &PeerId, kind: ChannelKind) -> Option<&mut Box<dyn DataChannel>> {
        self.links.get_mut(peer)?.channels.get_mut(&kind)
    }

    /// Drop the link and close its channels. Returns the command for the backend.
    pub fn remove(&mut self, peer: &PeerId) -> Option<RtcCommand> {
        let mut link = self.links.remove(peer)?;
        link.close_channels();
        info!(%peer, "link closed");
        Some(RtcCommand::Close { peer: *peer })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::RecordingChannel;
    use crate::protocol::SdpKind;

    fn manager() -> (ConnectionManager, PeerId) {
        let local = PeerId::random();
        (
            ConnectionManager::new(local, Duration::from_secs(7), Duration::from_millis(1500)),
            local,
        )
    }

    fn offer() -> SessionDescription {
        SessionDescription {
            kind: SdpKind::Offer,
            sdp: "v=0".into(),
        }
    }

    #[test]
    fn role_follows_id_order() {
        let a = PeerId::random();
        let b = PeerId::random();
        assert_ne!(role_for(a, b), role_for(b, a));
    }

    #[test]
    fn ensure_link_is_idempotent() {
        let (mut cm, _) = manager();
        let peer = PeerId::random();
        let now = Instant::now();
        assert_eq!(cm.ensure_link(peer, Role::Initiator, now).len(), 1);
        assert!(cm.ensure_link(peer, Role::Responder, now).is_empty());
        assert_eq!(cm.get(&peer).unwrap().role, Role::Initiator);
    }

    #[test]
    fn chat_channel_requested_once_with_single_negotiation() {
        let (mut cm, _) = manager();
        let peer = PeerId::random();
        let cmds = cm.ensure_chat_channel(peer, Instant::now());
        assert!(matches!(cmds[0], RtcCommand::Open { role: Role::Initiator, .. }));
        assert!(matches!(cmds[1], RtcCommand::CreateChannel { kind: ChannelKind::Chat, .. }));
        assert!(matches!(cmds[2], RtcCommand::Negotiate { ice_restart: false, .. }));
        assert!(cm.ensure_chat_channel(peer, Instant::now()).is_empty());
    }

    #[test]
    fn inbound_offer_creates_responder() {
        let (mut cm, _) = manager();
        let peer = PeerId::random();
        let out = cm.on_remote_offer(peer, offer(), Instant::now());
        assert!(out.created);
        assert_eq!(cm.get(&peer).unwrap().role, Role::Responder);
        assert!(matches!(out.commands.last(), Some(RtcCommand::ApplyOffer { .. })));
    }

    #[test]
    fn checking_timeout_forces_relay_then_teardown() {
        let (mut cm, _) = manager();
        let peer = PeerId::random();
        let t0 = Instant::now();
        cm.ensure_link(peer, Role::Initiator, t0);
        cm.on_state(peer, LinkState::Checking, t0);
        let (cmds, down) = cm.tick(t0 + Duration::from_secs(6));
        assert!(cmds.is_empty() && down.is_empty());
        let t1 = t0 + Duration::from_secs(7);
        let (cmds, _) = cm.tick(t1);
        assert!(cmds.contains(&RtcCommand::ForceRelay { peer }));
        assert!(cmds.contains(&RtcCommand::Negotiate { peer, ice_restart: true }));
        assert!(cm.get(&peer).unwrap().relay_only);
        let (_, down) = cm.tick(t1 + Duration::from_secs(7));
        assert_eq!(down, vec![peer]);
    }

    #[test]
    fn failure_policy_depends_on_relay_only() {
        let (mut cm, _) = manager();
        let peer = PeerId::random();
        let now = Instant::now();
        cm.ensure_link(peer, Role::Responder, now);
        let first = cm.on_state(peer, LinkState::Failed, now);
        assert!(!first.teardown);
        assert_eq!(first.commands, vec![RtcCommand::ForceRelay { peer }]);
        cm.on_state(peer, LinkState::Checking, now);
        let second = cm.on_state(peer, LinkState::Failed, now);
        assert!(second.teardown);
    }

    #[test]
    fn disconnect_grace_then_restart_then_teardown() {
        let (mut cm, _) = manager();
        let peer = PeerId::random();
        let t0 = Instant::now();
        cm.ensure_link(peer, Role::Initiator, t0);
        cm.on_state(peer, LinkState::Connected, t0);
        cm.on_state(peer, LinkState::Disconnected, t0);
        let (cmds, _) = cm.tick(t0 + Duration::from_millis(1500));
        assert_eq!(cmds, vec![RtcCommand::Negotiate { peer, ice_restart: true }]);
        let (cmds, down) = cm.tick(t0 + Duration::from_millis(2000));
        assert!(cmds.is_empty() && down.is_empty());
        let (_, down) = cm.tick(t0 + Duration::from_millis(8500));
        assert_eq!(down, vec![peer]);
    }

    #[test]
    fn stale_skips_live_links() {
        let (mut cm, _) = manager();
        let idle = PeerId::random();
        let up = PeerId::random();
        let t0 = Instant::now();
        cm.ensure_link(idle, Role::Initiator, t0);
        cm.ensure_link(up, Role::Initiator, t0);
        cm.on_state(up, LinkState::Connected, t0);
        let later = t0 + Duration::from_secs(61);
        assert_eq!(cm.stale(later, Duration::from_secs(60)), vec![idle]);
        cm.mark_seen(&idle, later);
        assert!(cm.stale(later, Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn channels_register_and_close_on_remove() {
        let (mut cm, _) = manager();
        let peer = PeerId::random();
        cm.ensure_link(peer, Role::Initiator, Instant::now());
        let ch = RecordingChannel::new();
        assert!(cm.on_channel_open(peer, ChannelKind::Chat, ch.boxed()));
        assert!(cm.has_open(&peer, ChannelKind::Chat));
        assert_eq!(cm.remove(&peer), Some(RtcCommand::Close { peer }));
        assert!(ch.is_closed());

        let stray = RecordingChannel::new();
        assert!(!cm.on_channel_open(peer, ChannelKind::Chat, stray.boxed()));
        assert!(stray.is_closed());
    }

    #[test]
    fn offer_collision_resolved_by_id_order() {
        let local = PeerId::random();
        let mut cm =
            ConnectionManager::new(local, Duration::from_secs(7), Duration::from_millis(1500));
        let peer = PeerId::random();
        cm.ensure_chat_channel(peer, Instant::now());
        let out = cm.on_remote_offer(peer, offer(), Instant::now());
        if local < peer {
            assert!(out.commands.is_empty());
            assert_eq!(cm.get(&peer).unwrap().role, Role::Initiator);
        } else {
            assert_eq!(cm.get(&peer).unwrap().role, Role::Responder);
            assert!(out
                .commands
                .contains(&RtcCommand::CreateChannel { peer, kind: ChannelKind::Chat }));
        }
    }
}
