//! Nearchat mesh core: proximity discovery via a signaling relay, encrypted peer links,
//! public-room gossip and file transfer.
//! Host-driven: no I/O; host passes events and receives actions.

pub mod channel;
pub mod config;
pub mod core;
pub mod crypto;
pub mod gossip;
pub mod identity;
pub mod link;
pub mod location;
pub mod outbox;
pub mod protocol;
pub mod reliability;
pub mod signaling;
pub mod transfer;
pub mod wire;

pub use channel::{ChannelError, ChannelKind, DataChannel};
#[cfg(any(test, feature = "test-util"))]
pub use channel::RecordingChannel;
pub use config::MeshConfig;
pub use crate::core::{unix_ms, Action, MeshCore, MeshError, MeshEvent};
pub use crypto::{CryptoEngine, CryptoError, Envelope};
pub use identity::{Identity, Keypair, PeerId, PublicKey};
pub use link::{LinkState, Role, RtcCommand};
pub use protocol::{GeoPosition, Profile, ProfileLite};
pub use reliability::TurnCredential;
pub use wire::Frame;
