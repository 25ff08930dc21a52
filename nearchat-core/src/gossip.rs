//! Public-room gossip: hash-ring overlay with bounded degree, TTL flood, de-duplication.

use std::collections::{BTreeSet, HashSet, VecDeque};

use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;

use crate::identity::PeerId;
use crate::protocol::BroadcastMessage;

/// Position of a member on the overlay ring: first 8 bytes of SHA-256 of the id.
pub fn ring_position(id: &PeerId) -> u64 {
    let digest = Sha256::digest(id.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

/// Neighbors of `local` among `members` (which may or may not contain `local`).
///
/// With at most `k` other members everyone is a neighbor. Otherwise `k - k/2` successors and
/// `k/2` predecessors around the ring, which is exactly `k` distinct members.
pub fn select_neighbors(local: PeerId, members: &BTreeSet<PeerId>, k: usize) -> BTreeSet<PeerId> {
    let mut ring: Vec<PeerId> = members.iter().copied().collect();
    if !members.contains(&local) {
        ring.push(local);
    }
    let others = ring.len() - 1;
    if others <= k {
        return ring.into_iter().filter(|m| *m != local).collect();
    }
    ring.sort_by_key(|m| (ring_position(m), *m));
    let n = ring.len();
    let Some(at) = ring.iter().position(|m| *m == local) else {
        return BTreeSet::new();
    };
    let successors = k - k / 2;
    let predecessors = k / 2;
    let mut out = BTreeSet::new();
    for step in 1..=successors {
        out.insert(ring[(at + step) % n]);
    }
    for step in 1..=predecessors {
        out.insert(ring[(at + n - step) % n]);
    }
    out
}

/// Bounded set of broadcast ids with oldest-first eviction.
pub struct SeenSet {
    order: VecDeque<Uuid>,
    index: HashSet<Uuid>,
    capacity: usize,
}

impl SeenSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            index: HashSet::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Record an id. Returns false if it was already present.
    pub fn insert(&mut self, id: Uuid) -> bool {
        if !self.index.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.index.remove(&oldest);
            }
        }
        true
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.index.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.index.clear();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
    pub id: String,
    pub label: String,
}

/// Result of a membership recomputation.
#[derive(Debug, Default)]
pub struct OverlayChange {
    pub room_switched: bool,
    /// Overlay peers that were not overlay peers before.
    pub added: Vec<PeerId>,
    /// Former overlay peers that dropped out.
    pub removed: Vec<PeerId>,
}

/// What to do with an inbound broadcast.
#[derive(Debug)]
pub struct Received {
    pub deliver: BroadcastMessage,
    /// Copy with decremented ttl plus the peers to send it to.
    pub forward: Option<(BroadcastMessage, Vec<PeerId>)>,
}

pub struct Broadcaster {
    local: PeerId,
    degree: usize,
    ttl: u8,
    room: Option<Room>,
    members: BTreeSet<PeerId>,
    overlay: BTreeSet<PeerId>,
    seen: SeenSet,
}

impl Broadcaster {
    pub fn new(local: PeerId, degree: usize, ttl: u8, seen_capacity: usize) -> Self {
        Self {
            local,
            degree,
            ttl,
            room: None,
            members: BTreeSet::new(),
            overlay: BTreeSet::new(),
            seen: SeenSet::new(seen_capacity),
        }
    }

    pub fn room(&self) -> Option<&Room> {
        self.room.as_ref()
    }

    /// Remote members of the current room.
    pub fn members(&self) -> &BTreeSet<PeerId> {
        &self.members
    }

    /// Peers this node keeps a broadcast link with: it picked them or they picked it.
    pub fn overlay(&self) -> &BTreeSet<PeerId> {
        &self.overlay
    }

    /// Room assignment from the relay. A different id empties the member set, so the overlay
    /// empties too; `removed` lists the peers whose broadcast links should go.
    pub fn set_room(&mut self, id: &str, label: &str) -> OverlayChange {
        if !self.switch_room(id, label) {
            return OverlayChange::default();
        }
        let mut change = self.recompute();
        change.room_switched = true;
        change
    }

    /// Clears membership and the seen cache when the id differs. Returns true on a switch.
    fn switch_room(&mut self, id: &str, label: &str) -> bool {
        match &mut self.room {
            Some(room) if room.id == id => {
                room.label = label.to_owned();
                false
            }
            _ => {
                info!(room = id, label, "room switched");
                self.room = Some(Room {
                    id: id.to_owned(),
                    label: label.to_owned(),
                });
                self.members.clear();
                self.seen.clear();
                true
            }
        }
    }

    /// Replace the member set for `room_id` and recompute neighbors.
    pub fn on_roster(
        &mut self,
        room_id: &str,
        room_label: &str,
        peers: impl IntoIterator<Item = PeerId>,
    ) -> OverlayChange {
        let room_switched = self.switch_room(room_id, room_label);
        self.members = peers.into_iter().filter(|p| *p != self.local).collect();
        let mut change = self.recompute();
        change.room_switched = room_switched;
        change
    }

    /// Drop one member (blocked locally) ahead of the next roster.
    pub fn remove_member(&mut self, peer: &PeerId) -> OverlayChange {
        if !self.members.remove(peer) {
            return OverlayChange::default();
        }
        self.recompute()
    }

    fn recompute(&mut self) -> OverlayChange {
        let mut everyone = self.members.clone();
        everyone.insert(self.local);
        let neighbors = select_neighbors(self.local, &everyone, self.degree);
        let mut overlay = neighbors.clone();
        for member in &self.members {
            if overlay.contains(member) {
                continue;
            }
            if select_neighbors(*member, &everyone, self.degree).contains(&self.local) {
                overlay.insert(*member);
            }
        }
        let added = overlay.difference(&self.overlay).copied().collect();
        let removed = self.overlay.difference(&overlay).copied().collect();
        debug!(
            members = self.members.len(),
            neighbors = neighbors.len(),
            overlay = overlay.len(),
            "overlay recomputed"
        );
        self.overlay = overlay;
        OverlayChange {
            room_switched: false,
            added,
            removed,
        }
    }

    /// Build a new broadcast, marking it seen. None when not in a room.
    pub fn originate(&mut self, text: String, timestamp: u64) -> Option<BroadcastMessage> {
        let room = self.room.as_ref()?;
        let msg = BroadcastMessage {
            id: Uuid::new_v4(),
            room_id: room.id.clone(),
            origin: self.local,
            timestamp,
            ttl: self.ttl,
            text,
        };
        self.seen.insert(msg.id);
        Some(msg)
    }

    /// Overlay peers to send `msg` to, skipping the immediate sender and the author.
    pub fn forward_targets(&self, msg: &BroadcastMessage, from: Option<PeerId>) -> Vec<PeerId> {
        self.overlay
            .iter()
            .copied()
            .filter(|p| Some(*p) != from && *p != msg.origin)
            .collect()
    }

    /// Handle a broadcast from `from`. None when it must be ignored.
    pub fn receive(
        &mut self,
        from: PeerId,
        msg: BroadcastMessage,
        is_blocked: impl Fn(&PeerId) -> bool,
    ) -> Option<Received> {
        let in_room = self.room.as_ref().is_some_and(|r| r.id == msg.room_id);
        if !in_room || is_blocked(&msg.origin) || msg.origin == self.local {
            return None;
        }
        if !self.seen.insert(msg.id) {
            return None;
        }
        let forward = (msg.ttl > 0).then(|| {
            let mut next = msg.clone();
            next.ttl -= 1;
            let targets = self.forward_targets(&next, Some(from));
            (next, targets)
        });
        Some(Received {
            deliver: msg,
            forward,
        })
    }
}
