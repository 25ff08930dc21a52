//! Logical channels carried by a peer link and the handle a host gives the core for each one.

#[cfg(any(test, feature = "test-util"))]
use std::cell::RefCell;
#[cfg(any(test, feature = "test-util"))]
use std::rc::Rc;

#[cfg(any(test, feature = "test-util"))]
use crate::wire::Frame;

/// The three data channels a link can carry, identified on the wire by label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelKind {
    /// Ordered, reliable, end-to-end encrypted direct chat and file chunks.
    Chat,
    /// Unordered, best-effort public-room flood.
    Broadcast,
    /// Ordered profile-lite exchange paired with each broadcast link.
    BroadcastControl,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 3] = [
        ChannelKind::Chat,
        ChannelKind::Broadcast,
        ChannelKind::BroadcastControl,
    ];

    pub fn label(self) -> &'static str {
        match self {
            ChannelKind::Chat => "chat",
            ChannelKind::Broadcast => "broadcast",
            ChannelKind::BroadcastControl => "broadcast-ctl",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.label() == label)
    }

    pub fn ordered(self) -> bool {
        !matches!(self, ChannelKind::Broadcast)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,
}

/// Sending half of an open data channel. Implemented by the host's RTC backend.
pub trait DataChannel {
    fn send_text(&mut self, text: &str) -> Result<(), ChannelError>;

    fn send_binary(&mut self, data: &[u8]) -> Result<(), ChannelError>;

    /// Bytes accepted by `send_*` but not yet handed to the network.
    fn buffered_amount(&self) -> usize;

    fn close(&mut self);
}

/// In-memory channel that records every frame. Buffered amount grows with each send and is
/// drained explicitly, which lets callers exercise flow control without a network.
#[cfg(any(test, feature = "test-util"))]
#[derive(Clone, Default)]
pub struct RecordingChannel {
    inner: Rc<RefCell<Recorded>>,
}

#[cfg(any(test, feature = "test-util"))]
#[derive(Default)]
struct Recorded {
    frames: Vec<Frame>,
    buffered: usize,
    closed: bool,
}

#[cfg(any(test, feature = "test-util"))]
impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames sent so far, oldest first.
    pub fn frames(&self) -> Vec<Frame> {
        self.inner.borrow().frames.clone()
    }

    /// Remove and return everything sent so far.
    pub fn take_frames(&self) -> Vec<Frame> {
        std::mem::take(&mut self.inner.borrow_mut().frames)
    }

    pub fn sent_count(&self) -> usize {
        self.inner.borrow().frames.len()
    }

    /// Pretend the network consumed everything queued.
    pub fn drain(&self) {
        self.inner.borrow_mut().buffered = 0;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.borrow().closed
    }

    pub fn boxed(&self) -> Box<dyn DataChannel> {
        Box::new(self.clone())
    }
}

#[cfg(any(test, feature = "test-util"))]
impl DataChannel for RecordingChannel {
    fn send_text(&mut self, text: &str) -> Result<(), ChannelError> {
        let mut inner = self.inner.borrow_mut();
        if inner.closed {
            return Err(ChannelError::Closed);
        }
        inner.buffered += text.len();
        inner.frames.push(Frame::Text(text.to_owned()));
        Ok(())
    }

    fn send_binary(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        let mut inner = self.inner.borrow_mut();
        if inner.closed {
            return Err(ChannelError::Closed);
        }
        inner.buffered += data.len();
        inner.frames.push(Frame::Binary(data.to_vec()));
        Ok(())
    }

    fn buffered_amount(&self) -> usize {
        self.inner.borrow().buffered
    }

    fn close(&mut self) {
        self.inner.borrow_mut().closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_roundtrip() {
        for kind in ChannelKind::ALL {
            assert_eq!(ChannelKind::from_label(kind.label()), Some(kind));
        }
        assert_eq!(ChannelKind::from_label("video"), None);
        assert!(!ChannelKind::Broadcast.ordered());
    }

    #[test]
    fn recording_channel_tracks_buffer_and_close() {
        let ch = RecordingChannel::new();
        let mut handle = ch.boxed();
        handle.send_text("hi").unwrap();
        handle.send_binary(&[0u8; 10]).unwrap();
        assert_eq!(handle.buffered_amount(), 12);
        ch.drain();
        assert_eq!(handle.buffered_amount(), 0);
        handle.close();
        assert!(ch.is_closed());
        assert!(handle.send_text("late").is_err());
        assert_eq!(ch.sent_count(), 2);
    }
}
