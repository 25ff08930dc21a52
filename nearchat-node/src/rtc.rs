//! WebRTC backend. Executes the core's `RtcCommand`s in order on one task and turns peer
//! connection callbacks into `Input`s for the event loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use nearchat_core::channel::ChannelKind;
use nearchat_core::protocol::{IceCandidate, SdpKind, SessionDescription};
use nearchat_core::{ChannelError, DataChannel, LinkState, PeerId, Role, RtcCommand, TurnCredential};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::node::Input;

enum Outbound {
    Text(String),
    Binary(Bytes),
    Close,
}

/// Send half of an open RTC data channel. Sends are queued to a writer task, so
/// `buffered_amount` counts both the local queue and the SCTP send buffer.
pub struct RtcChannel {
    tx: UnboundedSender<Outbound>,
    queued: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
}

impl RtcChannel {
    fn spawn(
        peer: PeerId,
        dc: Arc<RTCDataChannel>,
        in_flight: Arc<AtomicUsize>,
        low_water: usize,
        inputs: UnboundedSender<Input>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));
        tokio::spawn(write_loop(
            peer,
            dc,
            rx,
            queued.clone(),
            in_flight.clone(),
            low_water,
            inputs,
        ));
        Self {
            tx,
            queued,
            in_flight,
        }
    }

    fn enqueue(&self, out: Outbound, len: usize) -> Result<(), ChannelError> {
        self.queued.fetch_add(len, Ordering::SeqCst);
        self.tx.send(out).map_err(|_| {
            self.queued.fetch_sub(len, Ordering::SeqCst);
            ChannelError::Closed
        })
    }
}

impl DataChannel for RtcChannel {
    fn send_text(&mut self, text: &str) -> Result<(), ChannelError> {
        self.enqueue(Outbound::Text(text.to_owned()), text.len())
    }

    fn send_binary(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        self.enqueue(Outbound::Binary(Bytes::copy_from_slice(data)), data.len())
    }

    fn buffered_amount(&self) -> usize {
        self.queued.load(Ordering::SeqCst) + self.in_flight.load(Ordering::SeqCst)
    }

    fn close(&mut self) {
        let _ = self.tx.send(Outbound::Close);
    }
}

async fn write_loop(
    peer: PeerId,
    dc: Arc<RTCDataChannel>,
    mut rx: UnboundedReceiver<Outbound>,
    queued: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    low_water: usize,
    inputs: UnboundedSender<Input>,
) {
    let label = dc.label().to_owned();
    while let Some(out) = rx.recv().await {
        let (sent, len) = match out {
            Outbound::Text(t) => {
                let len = t.len();
                (dc.send_text(t).await, len)
            }
            Outbound::Binary(b) => {
                let len = b.len();
                (dc.send(&b).await, len)
            }
            Outbound::Close => {
                if let Err(e) = dc.close().await {
                    debug!(%peer, %label, error = %e, "close data channel");
                }
                break;
            }
        };
        let before = queued.load(Ordering::SeqCst) + in_flight.load(Ordering::SeqCst);
        queued.fetch_sub(len, Ordering::SeqCst);
        if let Err(e) = sent {
            warn!(%peer, %label, error = %e, "data channel send failed");
            break;
        }
        in_flight.store(dc.buffered_amount().await, Ordering::SeqCst);
        let after = queued.load(Ordering::SeqCst) + in_flight.load(Ordering::SeqCst);
        if before > low_water && after <= low_water {
            let _ = inputs.send(Input::BufferedLow {
                peer,
                label: label.clone(),
            });
        }
    }
}

fn link_state(state: RTCPeerConnectionState) -> Option<LinkState> {
    match state {
        RTCPeerConnectionState::New => Some(LinkState::New),
        RTCPeerConnectionState::Connecting => Some(LinkState::Checking),
        RTCPeerConnectionState::Connected => Some(LinkState::Connected),
        RTCPeerConnectionState::Disconnected => Some(LinkState::Disconnected),
        RTCPeerConnectionState::Failed => Some(LinkState::Failed),
        RTCPeerConnectionState::Closed => Some(LinkState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

fn channel_init(kind: ChannelKind) -> RTCDataChannelInit {
    if kind.ordered() {
        RTCDataChannelInit::default()
    } else {
        RTCDataChannelInit {
            ordered: Some(false),
            max_retransmits: Some(0),
            ..Default::default()
        }
    }
}

/// Build the ICE server list. TURN urls are only usable once a relay credential is known.
fn ice_servers(urls: &[String], credential: Option<&TurnCredential>) -> Vec<RTCIceServer> {
    let mut out = Vec::new();
    for url in urls {
        let is_turn = url.starts_with("turn:") || url.starts_with("turns:");
        match (is_turn, credential) {
            (false, _) => out.push(RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            }),
            (true, Some(c)) => out.push(RTCIceServer {
                urls: vec![url.clone()],
                username: c.username.clone(),
                credential: c.credential.clone(),
                ..Default::default()
            }),
            (true, None) => debug!(%url, "skipping turn server without credential"),
        }
    }
    out
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription> {
    let desc = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp)?,
    };
    Ok(desc)
}

struct Peer {
    pc: Arc<RTCPeerConnection>,
    role: Role,
}

pub struct RtcBackend {
    api: API,
    ice_urls: Vec<String>,
    credential: Option<TurnCredential>,
    low_water: usize,
    peers: HashMap<PeerId, Peer>,
    inputs: UnboundedSender<Input>,
}

impl RtcBackend {
    pub fn new(ice_urls: Vec<String>, low_water: usize, inputs: UnboundedSender<Input>) -> Result<Self> {
        let mut media = MediaEngine::default();
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self {
            api,
            ice_urls,
            credential: None,
            low_water,
            peers: HashMap::new(),
            inputs,
        })
    }

    /// Execute commands until the sender side is dropped, then close every connection.
    pub async fn run(mut self, mut commands: UnboundedReceiver<RtcCommand>) {
        while let Some(cmd) = commands.recv().await {
            if let Err(e) = self.execute(cmd).await {
                warn!(error = %e, "rtc command failed");
            }
        }
        for (peer, p) in self.peers.drain() {
            if let Err(e) = p.pc.close().await {
                debug!(%peer, error = %e, "close on shutdown");
            }
        }
    }

    fn config(&self, relay_only: bool) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: ice_servers(&self.ice_urls, self.credential.as_ref()),
            ice_transport_policy: if relay_only {
                RTCIceTransportPolicy::Relay
            } else {
                RTCIceTransportPolicy::All
            },
            ..Default::default()
        }
    }

    fn pc(&self, peer: &PeerId) -> Result<Arc<RTCPeerConnection>> {
        self.peers
            .get(peer)
            .map(|p| p.pc.clone())
            .ok_or_else(|| anyhow!("no peer connection for {peer}"))
    }

    async fn execute(&mut self, cmd: RtcCommand) -> Result<()> {
        match cmd {
            RtcCommand::Open {
                peer,
                role,
                relay_only,
            } => self.open(peer, role, relay_only).await,
            RtcCommand::CreateChannel { peer, kind } => {
                let pc = self.pc(&peer)?;
                let dc = pc
                    .create_data_channel(kind.label(), Some(channel_init(kind)))
                    .await
                    .with_context(|| format!("create {} channel", kind.label()))?;
                wire_channel(peer, dc, self.low_water, self.inputs.clone()).await;
                Ok(())
            }
            RtcCommand::Negotiate { peer, ice_restart } => {
                let pc = self.pc(&peer)?;
                let options = RTCOfferOptions {
                    ice_restart,
                    ..Default::default()
                };
                let offer = pc.create_offer(Some(options)).await?;
                pc.set_local_description(offer.clone()).await?;
                let _ = self.inputs.send(Input::LocalDescription {
                    peer,
                    description: SessionDescription {
                        kind: SdpKind::Offer,
                        sdp: offer.sdp,
                    },
                });
                Ok(())
            }
            RtcCommand::ForceRelay { peer } => {
                let pc = self.pc(&peer)?;
                pc.set_configuration(self.config(true)).await?;
                info!(%peer, "switched to relay-only ice");
                Ok(())
            }
            RtcCommand::ApplyOffer { peer, description } => {
                let pc = self.pc(&peer)?;
                pc.set_remote_description(to_rtc_description(description)?).await?;
                let answer = pc.create_answer(None).await?;
                pc.set_local_description(answer.clone()).await?;
                let _ = self.inputs.send(Input::LocalDescription {
                    peer,
                    description: SessionDescription {
                        kind: SdpKind::Answer,
                        sdp: answer.sdp,
                    },
                });
                Ok(())
            }
            RtcCommand::ApplyAnswer { peer, description } => {
                let pc = self.pc(&peer)?;
                pc.set_remote_description(to_rtc_description(description)?).await?;
                Ok(())
            }
            RtcCommand::AddCandidate { peer, candidate } => {
                let pc = self.pc(&peer)?;
                pc.add_ice_candidate(RTCIceCandidateInit {
                    candidate: candidate.candidate,
                    sdp_mid: candidate.sdp_mid,
                    sdp_mline_index: candidate.sdp_mline_index,
                    ..Default::default()
                })
                .await?;
                Ok(())
            }
            RtcCommand::Close { peer } => {
                if let Some(p) = self.peers.remove(&peer) {
                    debug!(%peer, role = ?p.role, "closing peer connection");
                    p.pc.close().await?;
                }
                Ok(())
            }
            RtcCommand::SetRelayCredential(credential) => {
                self.credential = Some(credential);
                Ok(())
            }
        }
    }

    async fn open(&mut self, peer: PeerId, role: Role, relay_only: bool) -> Result<()> {
        if let Some(old) = self.peers.remove(&peer) {
            let _ = old.pc.close().await;
        }
        let pc = Arc::new(self.api.new_peer_connection(self.config(relay_only)).await?);

        let inputs = self.inputs.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            if let Some(state) = link_state(s) {
                let _ = inputs.send(Input::ConnectionState { peer, state });
            }
            Box::pin(async {})
        }));

        let inputs = self.inputs.clone();
        pc.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
            let inputs = inputs.clone();
            Box::pin(async move {
                let Some(c) = c else { return };
                match c.to_json() {
                    Ok(init) => {
                        let _ = inputs.send(Input::LocalCandidate {
                            peer,
                            candidate: IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                            },
                        });
                    }
                    Err(e) => warn!(%peer, error = %e, "cannot serialize local candidate"),
                }
            })
        }));

        let inputs = self.inputs.clone();
        let low_water = self.low_water;
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let inputs = inputs.clone();
            Box::pin(async move {
                wire_channel(peer, dc, low_water, inputs).await;
            })
        }));

        info!(%peer, ?role, relay_only, "peer connection created");
        self.peers.insert(peer, Peer { pc, role });
        Ok(())
    }
}

/// Attach message, close and low-water handlers; report the channel to the loop once open.
async fn wire_channel(peer: PeerId, dc: Arc<RTCDataChannel>, low_water: usize, inputs: UnboundedSender<Input>) {
    let label = dc.label().to_owned();

    let tx = inputs.clone();
    let l = label.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let input = if msg.is_string {
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => Some(Input::ChannelText {
                    peer,
                    label: l.clone(),
                    text,
                }),
                Err(_) => {
                    warn!(%peer, label = %l, "dropping non-utf8 text frame");
                    None
                }
            }
        } else {
            Some(Input::ChannelBinary {
                peer,
                label: l.clone(),
                data: msg.data.to_vec(),
            })
        };
        if let Some(input) = input {
            let _ = tx.send(input);
        }
        Box::pin(async {})
    }));

    let tx = inputs.clone();
    let l = label.clone();
    dc.on_close(Box::new(move || {
        let _ = tx.send(Input::ChannelClosed {
            peer,
            label: l.clone(),
        });
        Box::pin(async {})
    }));

    let in_flight = Arc::new(AtomicUsize::new(0));
    dc.set_buffered_amount_low_threshold(low_water).await;
    let tx = inputs.clone();
    let l = label.clone();
    let counter = in_flight.clone();
    let weak = Arc::downgrade(&dc);
    dc.on_buffered_amount_low(Box::new(move || {
        let tx = tx.clone();
        let l = l.clone();
        let counter = counter.clone();
        let weak = weak.clone();
        Box::pin(async move {
            if let Some(dc) = weak.upgrade() {
                counter.store(dc.buffered_amount().await, Ordering::SeqCst);
            }
            let _ = tx.send(Input::BufferedLow { peer, label: l });
        })
    }))
    .await;

    let d = dc.clone();
    dc.on_open(Box::new(move || {
        let channel = RtcChannel::spawn(peer, d, in_flight, low_water, inputs.clone());
        let _ = inputs.send(Input::ChannelOpen {
            peer,
            label,
            channel,
        });
        Box::pin(async {})
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_urls_need_a_credential() {
        let urls = vec![
            "stun:stun.example.org:3478".to_string(),
            "turn:turn.example.org:3478".to_string(),
        ];
        assert_eq!(ice_servers(&urls, None).len(), 1);
        let cred = TurnCredential {
            username: "u".into(),
            credential: "p".into(),
            ttl: 60,
        };
        let servers = ice_servers(&urls, Some(&cred));
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[1].username, "u");
    }

    #[test]
    fn broadcast_channel_is_lossy() {
        let init = channel_init(ChannelKind::Broadcast);
        assert_eq!(init.ordered, Some(false));
        assert_eq!(init.max_retransmits, Some(0));
        assert_eq!(channel_init(ChannelKind::Chat).ordered, None);
    }

    #[test]
    fn connecting_maps_to_checking() {
        assert_eq!(link_state(RTCPeerConnectionState::Connecting), Some(LinkState::Checking));
        assert_eq!(link_state(RTCPeerConnectionState::Unspecified), None);
    }

    #[test]
    fn closed_writer_reports_channel_closed() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let mut ch = RtcChannel {
            tx,
            queued: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
        };
        assert!(matches!(ch.send_text("hi"), Err(ChannelError::Closed)));
        assert_eq!(ch.buffered_amount(), 0);
    }
}
