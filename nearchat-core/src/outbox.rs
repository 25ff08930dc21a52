//! Per-peer FIFO of application items waiting for an encrypted channel.

use std::collections::{HashMap, VecDeque};

use uuid::Uuid;

use crate::identity::PeerId;
use crate::protocol::PeerPayload;

/// One queued item. Files are kept as plaintext and sealed when they leave the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Payload(PeerPayload),
    File {
        id: Uuid,
        name: String,
        mime: String,
        bytes: Vec<u8>,
    },
}

#[derive(Default)]
pub struct PendingQueue {
    queues: HashMap<PeerId, VecDeque<Outgoing>>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, peer: PeerId, item: Outgoing) {
        self.queues.entry(peer).or_default().push_back(item);
    }

    pub fn is_pending(&self, peer: &PeerId) -> bool {
        self.queues.get(peer).is_some_and(|q| !q.is_empty())
    }

    pub fn len(&self, peer: &PeerId) -> usize {
        self.queues.get(peer).map_or(0, VecDeque::len)
    }

    /// Take everything queued for `peer`, oldest first.
    pub fn take(&mut self, peer: &PeerId) -> VecDeque<Outgoing> {
        self.queues.remove(peer).unwrap_or_default()
    }

    /// Put unsent items back ahead of anything queued since `take`.
    pub fn requeue_front(&mut self, peer: PeerId, mut items: VecDeque<Outgoing>) {
        if items.is_empty() {
            return;
        }
        if let Some(newer) = self.queues.remove(&peer) {
            items.extend(newer);
        }
        self.queues.insert(peer, items);
    }

    /// Drop a queued file that never started.
    pub fn remove_file(&mut self, id: &Uuid) -> Option<PeerId> {
        for (peer, queue) in self.queues.iter_mut() {
            let before = queue.len();
            queue.retain(|item| !matches!(item, Outgoing::File { id: fid, .. } if fid == id));
            if queue.len() != before {
                return Some(*peer);
            }
        }
        None
    }

    pub fn clear(&mut self, peer: &PeerId) -> usize {
        self.queues.remove(peer).map_or(0, |q| q.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat(text: &str) -> Outgoing {
        Outgoing::Payload(PeerPayload::ChatMessage {
            id: Uuid::new_v4(),
            text: text.into(),
            timestamp: 0,
        })
    }

    #[test]
    fn fifo_and_requeue_keeps_order() {
        let peer = PeerId::random();
        let mut q = PendingQueue::new();
        q.push(peer, chat("1"));
        q.push(peer, chat("2"));
        let mut taken = q.take(&peer);
        assert!(!q.is_pending(&peer));
        assert_eq!(taken.len(), 2);
        taken.pop_front();
        q.push(peer, chat("3"));
        q.requeue_front(peer, taken);
        let order: Vec<String> = q
            .take(&peer)
            .into_iter()
            .map(|item| match item {
                Outgoing::Payload(PeerPayload::ChatMessage { text, .. }) => text,
                _ => String::new(),
            })
            .collect();
        assert_eq!(order, vec!["2", "3"]);
    }

    #[test]
    fn remove_queued_file() {
        let peer = PeerId::random();
        let id = Uuid::new_v4();
        let mut q = PendingQueue::new();
        q.push(
            peer,
            Outgoing::File {
                id,
                name: "a".into(),
                mime: "text/plain".into(),
                bytes: vec![1],
            },
        );
        q.push(peer, chat("x"));
        assert_eq!(q.remove_file(&id), Some(peer));
        assert_eq!(q.len(&peer), 1);
        assert_eq!(q.remove_file(&id), None);
        assert_eq!(q.clear(&peer), 1);
    }
}
