//! Nearchat wire types: relay control messages, peer channel frames, broadcast and profile records.
//!
//! Every record is JSON with a kebab-case `type` tag; field names are camelCase.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::Envelope;
use crate::identity::{PeerId, PublicKey};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoPosition {
    pub latitude: f64,
    pub longitude: f64,
    /// Accuracy radius in meters.
    pub accuracy_m: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// SDP blob relayed verbatim between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

/// Public part of a profile. Never carries avatar bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileLite {
    pub name: String,
    #[serde(default)]
    pub age: Option<u8>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub avatar_version: u32,
}

/// Local profile: the lite record plus an optional avatar thumbnail.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Profile {
    pub lite: ProfileLite,
    pub avatar_thumb: Option<Vec<u8>>,
}

/// Client → relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    Register {
        id: PeerId,
        profile: ProfileLite,
    },
    Heartbeat {
        timestamp: u64,
    },
    UpdateLocation {
        location: GeoPosition,
        /// Preferred discovery radius in kilometers.
        radius: f64,
    },
    RequestLanDiscovery,
    #[serde(rename_all = "camelCase")]
    ServerProfileUpdate {
        name: String,
        avatar_version: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        avatar: Option<String>,
    },
    Offer {
        to: PeerId,
        payload: SessionDescription,
    },
    Answer {
        to: PeerId,
        payload: SessionDescription,
    },
    Candidate {
        to: PeerId,
        payload: IceCandidate,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearbyPeer {
    pub id: PeerId,
    #[serde(default)]
    pub profile: Option<ProfileLite>,
}

/// Relay → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RelayMessage {
    #[serde(rename_all = "camelCase")]
    NearbyPeers {
        peers: Vec<NearbyPeer>,
        room_id: String,
        #[serde(default)]
        room_label: String,
    },
    #[serde(rename_all = "camelCase")]
    RoomUpdate {
        room_id: String,
        #[serde(default)]
        room_label: String,
    },
    Offer {
        from: PeerId,
        payload: SessionDescription,
    },
    Answer {
        from: PeerId,
        payload: SessionDescription,
    },
    Candidate {
        from: PeerId,
        payload: IceCandidate,
    },
    /// Anything this version does not understand.
    #[serde(other)]
    Unknown,
}

/// Text frame on the `chat` channel. Only the key exchange travels in clear.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ChatFrame {
    #[serde(rename_all = "camelCase")]
    KeyExchange { public_key: PublicKey },
    Sealed(Envelope),
}

/// Plaintext inside a sealed chat frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PeerPayload {
    ChatMessage {
        id: Uuid,
        text: String,
        timestamp: u64,
    },
    #[serde(rename_all = "camelCase")]
    FileStart {
        id: Uuid,
        name: String,
        size: u64,
        mime: String,
        encrypted_size: u64,
        /// The sealed body is zstd-compressed.
        #[serde(default)]
        compressed: bool,
    },
    FileEnd {
        id: Uuid,
    },
    FileCancel {
        id: Uuid,
    },
    MessageDelivered {
        id: Uuid,
    },
    MessageRead {
        id: Uuid,
    },
    Reaction {
        id: Uuid,
        emoji: String,
    },
    Profile(ProfileLite),
    ProfileUpdate(ProfileLite),
    AvatarRequest {
        version: u32,
    },
    AvatarThumb {
        version: u32,
        /// base64 image bytes
        data: String,
    },
}

impl PeerPayload {
    /// Profile and avatar payloads are subject to the soft size cap.
    pub fn is_size_capped(&self) -> bool {
        matches!(
            self,
            PeerPayload::Profile(_)
                | PeerPayload::ProfileUpdate(_)
                | PeerPayload::AvatarRequest { .. }
                | PeerPayload::AvatarThumb { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PeerPayload::ChatMessage { .. } => "chat-message",
            PeerPayload::FileStart { .. } => "file-start",
            PeerPayload::FileEnd { .. } => "file-end",
            PeerPayload::FileCancel { .. } => "file-cancel",
            PeerPayload::MessageDelivered { .. } => "message-delivered",
            PeerPayload::MessageRead { .. } => "message-read",
            PeerPayload::Reaction { .. } => "reaction",
            PeerPayload::Profile(_) => "profile",
            PeerPayload::ProfileUpdate(_) => "profile-update",
            PeerPayload::AvatarRequest { .. } => "avatar-request",
            PeerPayload::AvatarThumb { .. } => "avatar-thumb",
        }
    }
}

/// Public-room message flooded over `broadcast` channels. Never encrypted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastMessage {
    pub id: Uuid,
    pub room_id: String,
    pub origin: PeerId,
    pub timestamp: u64,
    pub ttl: u8,
    pub text: String,
}

/// Frame on the `broadcast-ctl` channel paired with each broadcast link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlFrame {
    ProfileLite(ProfileLite),
}
