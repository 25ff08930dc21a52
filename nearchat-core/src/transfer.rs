//! File transfer: chunk the sealed blob, pump chunks under flow control, reassemble on receipt.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::channel::{ChannelError, DataChannel};
use crate::identity::PeerId;
use crate::wire;

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Minimum absolute tolerance between declared and received encrypted size.
const MIN_SIZE_TOLERANCE: u64 = 1024;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("unknown transfer {0}")]
    Unknown(Uuid),
    #[error("transfer {0} already in progress")]
    Duplicate(Uuid),
    #[error("received {actual} bytes, expected {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("received {actual} bytes, more than the announced {expected}")]
    Overrun { expected: u64, actual: u64 },
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Declared size and received size agree within `max(1 KiB, 0.1 %)`.
pub fn within_tolerance(expected: u64, actual: u64) -> bool {
    let tolerance = MIN_SIZE_TOLERANCE.max(expected / 1000);
    expected.abs_diff(actual) <= tolerance
}

/// Sealed file on its way out.
pub struct OutgoingTransfer {
    pub id: Uuid,
    pub name: String,
    blob: Vec<u8>,
    offset: usize,
    chunk_size: usize,
}

impl OutgoingTransfer {
    pub fn new(id: Uuid, name: String, blob: Vec<u8>, chunk_size: usize) -> Self {
        Self {
            id,
            name,
            blob,
            offset: 0,
            chunk_size: if chunk_size == 0 {
                DEFAULT_CHUNK_SIZE
            } else {
                chunk_size
            },
        }
    }

    pub fn is_done(&self) -> bool {
        self.offset >= self.blob.len()
    }

    fn next_chunk(&mut self) -> Option<&[u8]> {
        if self.is_done() {
            return None;
        }
        let start = self.offset;
        let end = (start + self.chunk_size).min(self.blob.len());
        self.offset = end;
        Some(&self.blob[start..end])
    }
}

/// What a pump pass achieved.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PumpReport {
    /// Transfers whose last chunk went out; the caller sends `file-end` for each, in order.
    pub finished: Vec<Uuid>,
    /// Stopped on the high-water mark; resume on the buffered-low signal.
    pub paused: bool,
    pub chunks_sent: usize,
}

/// Outgoing transfers grouped by peer, served round-robin so chunks interleave.
#[derive(Default)]
pub struct OutgoingTransfers {
    by_peer: HashMap<PeerId, VecDeque<OutgoingTransfer>>,
}

impl OutgoingTransfers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, peer: PeerId, transfer: OutgoingTransfer) {
        self.by_peer.entry(peer).or_default().push_back(transfer);
    }

    pub fn has_pending(&self, peer: &PeerId) -> bool {
        self.by_peer.get(peer).is_some_and(|q| !q.is_empty())
    }

    /// Owner of transfer `id`, if it is still sending.
    pub fn peer_of(&self, id: &Uuid) -> Option<PeerId> {
        self.by_peer
            .iter()
            .find(|(_, q)| q.iter().any(|t| t.id == *id))
            .map(|(p, _)| *p)
    }

    /// Remove a transfer before its next chunk. Returns its peer.
    pub fn cancel(&mut self, id: &Uuid) -> Option<PeerId> {
        let peer = self.peer_of(id)?;
        if let Some(queue) = self.by_peer.get_mut(&peer) {
            queue.retain(|t| t.id != *id);
            if queue.is_empty() {
                self.by_peer.remove(&peer);
            }
        }
        Some(peer)
    }

    /// Forget every transfer to `peer`; returns their ids.
    pub fn drop_peer(&mut self, peer: &PeerId) -> Vec<Uuid> {
        self.by_peer
            .remove(peer)
            .map(|q| q.into_iter().map(|t| t.id).collect())
            .unwrap_or_default()
    }

    /// Send chunks for `peer` while the channel's buffer stays at or below `high_water`.
    pub fn pump(
        &mut self,
        peer: &PeerId,
        channel: &mut dyn DataChannel,
        high_water: usize,
    ) -> Result<PumpReport, TransferError> {
        let mut report = PumpReport::default();
        let Some(queue) = self.by_peer.get_mut(peer) else {
            return Ok(report);
        };
        while let Some(mut transfer) = queue.pop_front() {
            if channel.buffered_amount() > high_water {
                queue.push_front(transfer);
                report.paused = true;
                debug!(%peer, buffered = channel.buffered_amount(), "transfer paused");
                break;
            }
            let id = transfer.id;
            if let Some(chunk) = transfer.next_chunk() {
                let frame = wire::encode_chunk(id, chunk);
                if let Err(e) = channel.send_binary(&frame) {
                    queue.push_front(transfer);
                    return Err(e.into());
                }
                report.chunks_sent += 1;
            }
            if transfer.is_done() {
                report.finished.push(transfer.id);
            } else {
                queue.push_back(transfer);
            }
        }
        if queue.is_empty() {
            self.by_peer.remove(peer);
        }
        Ok(report)
    }
}

/// Metadata announced by `file-start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub id: Uuid,
    pub name: String,
    pub mime: String,
    pub size: u64,
    pub encrypted_size: u64,
    pub compressed: bool,
}

struct IncomingTransfer {
    peer: PeerId,
    meta: FileMeta,
    chunks: Vec<Vec<u8>>,
    received: u64,
    started_at: Instant,
    last_activity: Instant,
}

/// All bytes arrived and the size checks out.
#[derive(Debug)]
pub struct CompletedTransfer {
    pub peer: PeerId,
    pub meta: FileMeta,
    pub blob: Vec<u8>,
}

#[derive(Default)]
pub struct IncomingTransfers {
    active: HashMap<Uuid, IncomingTransfer>,
}

impl IncomingTransfers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn begin(&mut self, peer: PeerId, meta: FileMeta, now: Instant) -> Result<(), TransferError> {
        if self.active.contains_key(&meta.id) {
            return Err(TransferError::Duplicate(meta.id));
        }
        debug!(%peer, id = %meta.id, name = %meta.name, size = meta.encrypted_size, "incoming file");
        self.active.insert(
            meta.id,
            IncomingTransfer {
                peer,
                meta,
                chunks: Vec::new(),
                received: 0,
                started_at: now,
                last_activity: now,
            },
        );
        Ok(())
    }

    /// Store one chunk. Chunks from a peer other than the announcer are rejected. A transfer
    /// that grows past its announced size plus tolerance is dropped.
    pub fn on_chunk(&mut self, peer: &PeerId, id: Uuid, bytes: &[u8], now: Instant) -> Result<(), TransferError> {
        let t = match self.active.get_mut(&id) {
            Some(t) if t.peer == *peer => t,
            _ => return Err(TransferError::Unknown(id)),
        };
        let received = t.received + bytes.len() as u64;
        let expected = t.meta.encrypted_size;
        if received > expected && !within_tolerance(expected, received) {
            warn!(%id, expected, actual = received, "transfer overran its announced size");
            self.active.remove(&id);
            return Err(TransferError::Overrun {
                expected,
                actual: received,
            });
        }
        t.received = received;
        t.last_activity = now;
        t.chunks.push(bytes.to_vec());
        Ok(())
    }

    /// Drop transfers that saw no chunk for `idle`. Returns `(sender, id)` for each.
    pub fn expire(&mut self, now: Instant, idle: Duration) -> Vec<(PeerId, Uuid)> {
        let expired: Vec<(PeerId, Uuid)> = self
            .active
            .iter()
            .filter(|(_, t)| now.saturating_duration_since(t.last_activity) >= idle)
            .map(|(id, t)| (t.peer, *id))
            .collect();
        for (_, id) in &expired {
            self.active.remove(id);
        }
        expired
    }

    /// Close out transfer `id` on `file-end`. State is discarded either way.
    pub fn finish(&mut self, peer: &PeerId, id: Uuid, now: Instant) -> Result<CompletedTransfer, TransferError> {
        let t = match self.active.remove(&id) {
            Some(t) if t.peer == *peer => t,
            Some(t) => {
                self.active.insert(id, t);
                return Err(TransferError::Unknown(id));
            }
            None => return Err(TransferError::Unknown(id)),
        };
        if !within_tolerance(t.meta.encrypted_size, t.received) {
            warn!(%id, expected = t.meta.encrypted_size, actual = t.received, "transfer size mismatch");
            return Err(TransferError::SizeMismatch {
                expected: t.meta.encrypted_size,
                actual: t.received,
            });
        }
        debug!(%id, elapsed = ?now.saturating_duration_since(t.started_at), "transfer complete");
        Ok(CompletedTransfer {
            peer: t.peer,
            meta: t.meta,
            blob: t.chunks.concat(),
        })
    }

    /// Sender gave up. Returns true if the transfer existed.
    pub fn cancel(&mut self, peer: &PeerId, id: &Uuid) -> bool {
        if self.active.get(id).is_some_and(|t| t.peer == *peer) {
            self.active.remove(id);
            true
        } else {
            false
        }
    }

    /// Discard everything from `peer`; returns the dropped ids.
    pub fn drop_peer(&mut self, peer: &PeerId) -> Vec<Uuid> {
        let ids: Vec<Uuid> = self
            .active
            .iter()
            .filter(|(_, t)| t.peer == *peer)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            self.active.remove(id);
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::RecordingChannel;
    use crate::wire::Frame;

    fn meta(id: Uuid, encrypted_size: u64) -> FileMeta {
        FileMeta {
            id,
            name: "a.bin".into(),
            mime: "application/octet-stream".into(),
            size: encrypted_size,
            encrypted_size,
            compressed: false,
        }
    }

    #[test]
    fn tolerance_bounds() {
        assert!(within_tolerance(10_000, 11_024));
        assert!(!within_tolerance(10_000, 11_025));
        assert!(within_tolerance(10_000_000, 10_010_000));
        assert!(!within_tolerance(10_000_000, 10_010_001));
        assert!(within_tolerance(0, 0));
    }

    #[test]
    fn pump_pauses_on_high_water_and_resumes() {
        let peer = PeerId::random();
        let ch = RecordingChannel::new();
        let mut handle = ch.boxed();
        let mut out = OutgoingTransfers::new();
        let id = Uuid::new_v4();
        out.push(peer, OutgoingTransfer::new(id, "f".into(), vec![7u8; 10 * 1024], 1024));

        let report = out.pump(&peer, handle.as_mut(), 2048).unwrap();
        assert!(report.paused);
        assert!(report.finished.is_empty());
        let sent = report.chunks_sent;
        assert!(sent >= 2 && sent < 10);

        let mut total = sent;
        while out.has_pending(&peer) {
            ch.drain();
            let r = out.pump(&peer, handle.as_mut(), 2048).unwrap();
            total += r.chunks_sent;
            if !r.finished.is_empty() {
                assert_eq!(r.finished, vec![id]);
            }
        }
        assert_eq!(total, 10);
        let bytes: usize = ch
            .frames()
            .iter()
            .map(|f| match f {
                Frame::Binary(b) => b.len() - wire::CHUNK_TAG_LEN,
                Frame::Text(_) => 0,
            })
            .sum();
        assert_eq!(bytes, 10 * 1024);
    }

    #[test]
    fn transfers_to_one_peer_interleave() {
        let peer = PeerId::random();
        let ch = RecordingChannel::new();
        let mut handle = ch.boxed();
        let mut out = OutgoingTransfers::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        out.push(peer, OutgoingTransfer::new(a, "a".into(), vec![1; 300], 100));
        out.push(peer, OutgoingTransfer::new(b, "b".into(), vec![2; 300], 100));
        let report = out.pump(&peer, handle.as_mut(), usize::MAX).unwrap();
        assert_eq!(report.finished, vec![a, b]);
        let tags: Vec<Uuid> = ch
            .frames()
            .iter()
            .filter_map(|f| match f {
                Frame::Binary(b) => Some(wire::decode_chunk(b).unwrap().0),
                Frame::Text(_) => None,
            })
            .collect();
        assert_eq!(tags, vec![a, b, a, b, a, b]);
    }

    #[test]
    fn cancel_between_chunks() {
        let peer = PeerId::random();
        let ch = RecordingChannel::new();
        let mut handle = ch.boxed();
        let mut out = OutgoingTransfers::new();
        let id = Uuid::new_v4();
        out.push(peer, OutgoingTransfer::new(id, "f".into(), vec![0; 4096], 1024));
        out.pump(&peer, handle.as_mut(), 1024).unwrap();
        assert_eq!(out.cancel(&id), Some(peer));
        assert!(!out.has_pending(&peer));
        ch.drain();
        let report = out.pump(&peer, handle.as_mut(), 1024).unwrap();
        assert_eq!(report, PumpReport::default());
    }

    #[test]
    fn closed_channel_surfaces_error() {
        let peer = PeerId::random();
        let ch = RecordingChannel::new();
        let mut handle = ch.boxed();
        handle.close();
        let mut out = OutgoingTransfers::new();
        out.push(peer, OutgoingTransfer::new(Uuid::new_v4(), "f".into(), vec![0; 10], 4));
        assert!(matches!(
            out.pump(&peer, handle.as_mut(), usize::MAX),
            Err(TransferError::Channel(ChannelError::Closed))
        ));
        assert!(out.has_pending(&peer));
    }

    #[test]
    fn incoming_reassembles_in_order() {
        let peer = PeerId::random();
        let id = Uuid::new_v4();
        let now = Instant::now();
        let mut inc = IncomingTransfers::new();
        inc.begin(peer, meta(id, 6), now).unwrap();
        assert!(matches!(
            inc.begin(peer, meta(id, 6), now),
            Err(TransferError::Duplicate(_))
        ));
        inc.on_chunk(&peer, id, b"abc", now).unwrap();
        inc.on_chunk(&peer, id, b"def", now).unwrap();
        let done = inc.finish(&peer, id, now).unwrap();
        assert_eq!(done.blob, b"abcdef");
        assert!(inc.is_empty());
    }

    #[test]
    fn incoming_rejects_size_mismatch_and_strangers() {
        let peer = PeerId::random();
        let stranger = PeerId::random();
        let id = Uuid::new_v4();
        let now = Instant::now();
        let mut inc = IncomingTransfers::new();
        inc.begin(peer, meta(id, 50_000), now).unwrap();
        assert!(inc.on_chunk(&stranger, id, b"x", now).is_err());
        inc.on_chunk(&peer, id, &[0; 10_000], now).unwrap();
        assert!(matches!(
            inc.finish(&peer, id, now),
            Err(TransferError::SizeMismatch { expected: 50_000, actual: 10_000 })
        ));
        assert!(inc.is_empty());
    }

    #[test]
    fn drop_peer_and_cancel() {
        let peer = PeerId::random();
        let now = Instant::now();
        let mut inc = IncomingTransfers::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        inc.begin(peer, meta(a, 1), now).unwrap();
        inc.begin(peer, meta(b, 1), now).unwrap();
        assert!(inc.cancel(&peer, &a));
        assert!(!inc.cancel(&peer, &a));
        assert_eq!(inc.drop_peer(&peer), vec![b]);
    }

    #[test]
    fn overrun_drops_transfer_early() {
        let peer = PeerId::random();
        let id = Uuid::new_v4();
        let now = Instant::now();
        let mut inc = IncomingTransfers::new();
        inc.begin(peer, meta(id, 4096), now).unwrap();
        inc.on_chunk(&peer, id, &[0; 4096], now).unwrap();
        inc.on_chunk(&peer, id, &[0; 1024], now).unwrap();
        assert!(matches!(
            inc.on_chunk(&peer, id, &[0; 1], now),
            Err(TransferError::Overrun { expected: 4096, actual: 5121 })
        ));
        assert!(inc.is_empty());
        assert!(matches!(
            inc.on_chunk(&peer, id, &[0; 1], now),
            Err(TransferError::Unknown(_))
        ));
    }

    #[test]
    fn idle_transfers_expire() {
        let peer = PeerId::random();
        let now = Instant::now();
        let idle = Duration::from_secs(60);
        let mut inc = IncomingTransfers::new();
        let quiet = Uuid::new_v4();
        let busy = Uuid::new_v4();
        inc.begin(peer, meta(quiet, 100), now).unwrap();
        inc.begin(peer, meta(busy, 100), now).unwrap();
        inc.on_chunk(&peer, busy, &[0; 10], now + Duration::from_secs(30)).unwrap();

        assert!(inc.expire(now + Duration::from_secs(59), idle).is_empty());
        assert_eq!(inc.expire(now + Duration::from_secs(60), idle), vec![(peer, quiet)]);
        assert_eq!(inc.len(), 1);
        assert_eq!(inc.expire(now + Duration::from_secs(90), idle), vec![(peer, busy)]);
        assert!(inc.is_empty());
    }
}
