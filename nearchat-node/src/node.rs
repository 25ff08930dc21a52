//! Event loop that owns the `MeshCore`. Every other task talks to it through `Input`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nearchat_core::location::LocationFix;
use nearchat_core::protocol::{IceCandidate, SessionDescription};
use nearchat_core::{Action, LinkState, MeshCore, MeshEvent, PeerId, RtcCommand, TurnCredential};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::console::{Command, HELP};
use crate::geolocate::Locator;
use crate::rest::RestClient;
use crate::rtc::RtcChannel;

/// Link timers are driven from this tick on top of the core's own deadlines.
const TICK: Duration = Duration::from_millis(250);

pub enum Input {
    RelayUp,
    RelayDown,
    RelayText(String),
    Credential(Option<TurnCredential>),
    Location(Option<LocationFix>),
    LocalDescription {
        peer: PeerId,
        description: SessionDescription,
    },
    LocalCandidate {
        peer: PeerId,
        candidate: IceCandidate,
    },
    ConnectionState {
        peer: PeerId,
        state: LinkState,
    },
    ChannelOpen {
        peer: PeerId,
        label: String,
        channel: RtcChannel,
    },
    ChannelClosed {
        peer: PeerId,
        label: String,
    },
    ChannelText {
        peer: PeerId,
        label: String,
        text: String,
    },
    ChannelBinary {
        peer: PeerId,
        label: String,
        data: Vec<u8>,
    },
    BufferedLow {
        peer: PeerId,
        label: String,
    },
    FileLoaded {
        peer: PeerId,
        name: String,
        mime: String,
        bytes: Vec<u8>,
    },
    Command(Command),
    Shutdown,
}

pub struct Node {
    core: MeshCore,
    inputs: UnboundedSender<Input>,
    relay: UnboundedSender<String>,
    rtc: UnboundedSender<RtcCommand>,
    rest: RestClient,
    locator: Arc<Locator>,
    radius_km: f64,
    download_dir: PathBuf,
    /// Display names from rosters and profile updates, for the console.
    names: HashMap<PeerId, String>,
}

impl Node {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        core: MeshCore,
        inputs: UnboundedSender<Input>,
        relay: UnboundedSender<String>,
        rtc: UnboundedSender<RtcCommand>,
        rest: RestClient,
        locator: Locator,
        radius_km: f64,
        download_dir: PathBuf,
    ) -> Self {
        Self {
            core,
            inputs,
            relay,
            rtc,
            rest,
            locator: Arc::new(locator),
            radius_km,
            download_dir,
            names: HashMap::new(),
        }
    }

    /// Run until `Input::Shutdown`, `/quit` or every sender is gone, then close all links.
    pub async fn run(mut self, mut rx: UnboundedReceiver<Input>) {
        let actions = self.core.start();
        self.dispatch(actions);
        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                input = rx.recv() => match input {
                    None | Some(Input::Shutdown) | Some(Input::Command(Command::Quit)) => break,
                    Some(input) => self.handle(input),
                },
                _ = ticker.tick() => {
                    let actions = self.core.tick(Instant::now());
                    self.dispatch(actions);
                }
            }
        }
        let actions = self.core.shutdown();
        self.dispatch(actions);
        info!("event loop stopped");
    }

    fn handle(&mut self, input: Input) {
        let now = Instant::now();
        let actions = match input {
            Input::RelayUp => self.core.on_relay_connected(now),
            Input::RelayDown => self.core.on_relay_disconnected(),
            Input::RelayText(text) => self.core.on_relay_text(&text, now),
            Input::Credential(Some(c)) => self.core.on_credential(c, now),
            Input::Credential(None) => self.core.on_credential_failed(now),
            Input::Location(Some(fix)) => self.core.report_location(fix.position, self.radius_km),
            Input::Location(None) => {
                info!("no location source available, asking relay for lan discovery");
                self.core.request_lan_discovery()
            }
            Input::LocalDescription { peer, description } => {
                self.core.on_local_description(peer, description)
            }
            Input::LocalCandidate { peer, candidate } => self.core.on_local_candidate(peer, candidate),
            Input::ConnectionState { peer, state } => self.core.on_connection_state(peer, state, now),
            Input::ChannelOpen {
                peer,
                label,
                channel,
            } => self.core.on_channel_open(peer, &label, Box::new(channel)),
            Input::ChannelClosed { peer, label } => self.core.on_channel_closed(peer, &label),
            Input::ChannelText { peer, label, text } => {
                self.core.on_channel_text(peer, &label, &text, now)
            }
            Input::ChannelBinary { peer, label, data } => {
                self.core.on_channel_binary(peer, &label, &data, now)
            }
            Input::BufferedLow { peer, label } => self.core.on_buffered_low(peer, &label),
            Input::FileLoaded {
                peer,
                name,
                mime,
                bytes,
            } => match self.core.send_file(peer, name.clone(), mime, bytes, now) {
                Ok((id, actions)) => {
                    println!("sending {name} as {id}");
                    actions
                }
                Err(e) => {
                    println!("cannot send {name}: {e}");
                    Vec::new()
                }
            },
            Input::Command(cmd) => self.command(cmd, now),
            Input::Shutdown => Vec::new(),
        };
        self.dispatch(actions);
    }

    fn command(&mut self, cmd: Command, now: Instant) -> Vec<Action> {
        match cmd {
            Command::Msg { peer, text } => {
                let Some(peer) = self.resolve(&peer) else {
                    return Vec::new();
                };
                match self.core.send_chat(peer, text, now) {
                    Ok((_, actions)) => actions,
                    Err(e) => {
                        println!("not sent: {e}");
                        Vec::new()
                    }
                }
            }
            Command::Send { peer, path } => {
                if let Some(peer) = self.resolve(&peer) {
                    self.load_file(peer, path);
                }
                Vec::new()
            }
            Command::Cancel(id) => self.core.cancel_transfer(id).unwrap_or_else(|e| {
                println!("{e}");
                Vec::new()
            }),
            Command::Read { peer, id } => match self.resolve(&peer) {
                Some(peer) => self.core.mark_read(peer, id, now),
                None => Vec::new(),
            },
            Command::React { peer, id, emoji } => match self.resolve(&peer) {
                Some(peer) => self.core.send_reaction(peer, id, emoji, now),
                None => Vec::new(),
            },
            Command::Avatar(peer) => match self.resolve(&peer) {
                Some(peer) => self.core.request_avatar(peer, now),
                None => Vec::new(),
            },
            Command::All(text) => match self.core.broadcast(text) {
                Ok((_, actions)) => actions,
                Err(e) => {
                    println!("not sent: {e}");
                    Vec::new()
                }
            },
            Command::Block(peer) => match self.resolve(&peer) {
                Some(peer) => self.core.block(peer, now),
                None => Vec::new(),
            },
            Command::Unblock(peer) => {
                match peer.parse::<PeerId>() {
                    Ok(id) if self.core.unblock(&id) => println!("unblocked {id}"),
                    Ok(id) => println!("{id} was not blocked"),
                    Err(_) => println!("unblock needs a full peer id"),
                }
                Vec::new()
            }
            Command::Name(name) => {
                let mut profile = self.core.profile().clone();
                profile.lite.name = name;
                self.core.set_profile(profile, now)
            }
            Command::Peers => {
                self.print_peers();
                Vec::new()
            }
            Command::Help => {
                println!("{HELP}");
                Vec::new()
            }
            Command::Quit => Vec::new(),
        }
    }

    /// Full id, or a prefix matching exactly one known peer.
    fn resolve(&self, needle: &str) -> Option<PeerId> {
        if let Ok(id) = needle.parse::<PeerId>() {
            return Some(id);
        }
        let matches: Vec<PeerId> = self
            .names
            .keys()
            .copied()
            .chain(self.core.links().peers())
            .filter(|id| id.to_string().starts_with(needle))
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        match matches.as_slice() {
            [one] => Some(*one),
            [] => {
                println!("no peer matches {needle}");
                None
            }
            _ => {
                println!("{needle} is ambiguous");
                None
            }
        }
    }

    fn print_peers(&self) {
        if let Some(room) = self.core.room() {
            println!("room {} ({})", room.label, room.id);
        }
        let overlay = self.core.overlay();
        for (id, name) in &self.names {
            let link = self
                .core
                .links()
                .get(id)
                .map(|l| format!("{:?}", l.state))
                .unwrap_or_else(|| "-".into());
            let mut flags = String::new();
            if self.core.has_session(id) {
                flags.push_str(" secure");
            }
            if overlay.contains(id) {
                flags.push_str(" overlay");
            }
            let pending = self.core.pending_count(id);
            if pending > 0 {
                flags.push_str(&format!(" pending={pending}"));
            }
            println!("{id} {name:<16} {link}{flags}");
        }
    }

    fn load_file(&self, peer: PeerId, path: PathBuf) {
        let inputs = self.inputs.clone();
        tokio::spawn(async move {
            match tokio::fs::read(&path).await {
                Ok(bytes) => {
                    let name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| "file".into());
                    let mime = guess_mime(&path);
                    let _ = inputs.send(Input::FileLoaded {
                        peer,
                        name,
                        mime,
                        bytes,
                    });
                }
                Err(e) => println!("cannot read {}: {e}", path.display()),
            }
        });
    }

    fn dispatch(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Relay(msg) => match serde_json::to_string(&msg) {
                    Ok(text) => {
                        let _ = self.relay.send(text);
                    }
                    Err(e) => warn!(error = %e, "cannot encode relay message"),
                },
                Action::Rtc(cmd) => {
                    let _ = self.rtc.send(cmd);
                }
                Action::FetchCredential => {
                    let rest = self.rest.clone();
                    let inputs = self.inputs.clone();
                    tokio::spawn(async move {
                        let credential = match rest.turn_credential().await {
                            Ok(c) => Some(c),
                            Err(e) => {
                                warn!(error = %e, "credential fetch failed");
                                None
                            }
                        };
                        let _ = inputs.send(Input::Credential(credential));
                    });
                }
                Action::AcquireLocation => {
                    let locator = self.locator.clone();
                    let inputs = self.inputs.clone();
                    tokio::spawn(async move {
                        let fix = locator.locate().await;
                        let _ = inputs.send(Input::Location(fix));
                    });
                }
                Action::Event(event) => self.on_event(event),
            }
        }
    }

    fn name_of(&self, peer: &PeerId) -> String {
        self.names
            .get(peer)
            .cloned()
            .unwrap_or_else(|| short_id(peer))
    }

    fn on_event(&mut self, event: MeshEvent) {
        match event {
            MeshEvent::RelayOpened(id) => println!("online as {id}"),
            MeshEvent::RelayClosed => println!("relay lost, reconnecting"),
            MeshEvent::RoomChanged {
                room_id,
                room_label,
            } => println!("joined room {room_label} ({room_id})"),
            MeshEvent::NearbyPeers(peers) => {
                for p in &peers {
                    let name = p
                        .profile
                        .as_ref()
                        .map(|pr| pr.name.clone())
                        .unwrap_or_else(|| short_id(&p.id));
                    self.names.insert(p.id, name);
                }
                println!("{} peers nearby", peers.len());
            }
            MeshEvent::ProfileUpdated { peer, profile } => {
                self.names.insert(peer, profile.name);
            }
            MeshEvent::AvatarReceived { peer, version, data } => {
                debug!(%peer, version, bytes = data.len(), "avatar received");
                println!("avatar v{version} from {} ({} bytes)", self.name_of(&peer), data.len());
            }
            MeshEvent::SessionEstablished(peer) => println!("secure link with {}", self.name_of(&peer)),
            MeshEvent::PeerLeft(peer) => println!("{} left", self.name_of(&peer)),
            MeshEvent::ChatReceived { peer, id, text, .. } => {
                println!("[{}] {text}  ({id})", self.name_of(&peer));
            }
            MeshEvent::MessageDelivered { peer, id } => debug!(%peer, %id, "delivered"),
            MeshEvent::MessageRead { peer, id } => println!("{} read {id}", self.name_of(&peer)),
            MeshEvent::ReactionReceived { peer, id, emoji } => {
                println!("{} reacted {emoji} to {id}", self.name_of(&peer));
            }
            MeshEvent::BroadcastReceived(msg) => {
                if msg.origin != self.core.id() {
                    println!("<{}> {}", self.name_of(&msg.origin), msg.text);
                }
            }
            MeshEvent::FileIncoming {
                peer, name, size, ..
            } => println!("{} is sending {name} ({size} bytes)", self.name_of(&peer)),
            MeshEvent::FileReceived {
                peer, name, bytes, ..
            } => {
                let from = self.name_of(&peer);
                let path = self.download_dir.join(safe_file_name(&name));
                tokio::spawn(async move {
                    if let Some(dir) = path.parent() {
                        let _ = tokio::fs::create_dir_all(dir).await;
                    }
                    match tokio::fs::write(&path, &bytes).await {
                        Ok(()) => println!("saved {} from {from}", path.display()),
                        Err(e) => warn!(path = %path.display(), error = %e, "cannot save file"),
                    }
                });
            }
            MeshEvent::FileSent { peer, id } => println!("transfer {id} to {} done", self.name_of(&peer)),
            MeshEvent::TransferFailed { peer, id, reason } => {
                println!("transfer {id} with {} failed: {reason}", self.name_of(&peer));
            }
            MeshEvent::DecryptFailed { peer, reason } => {
                warn!(%peer, %reason, "undecryptable frame");
            }
        }
    }
}

fn short_id(peer: &PeerId) -> String {
    peer.to_string().chars().take(8).collect()
}

/// Keep only the final path component and strip anything that could escape the download dir.
fn safe_file_name(name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_control() || c == '/' || c == '\\' { '_' } else { c })
        .collect();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        "received.bin".into()
    } else {
        cleaned
    }
}

fn guess_mime(path: &Path) -> String {
    mime_guess::from_path(path).first_or_octet_stream().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn received_names_cannot_escape() {
        assert_eq!(safe_file_name("../../etc/passwd"), "passwd");
        assert_eq!(safe_file_name(".."), "received.bin");
        assert_eq!(safe_file_name(""), "received.bin");
        assert_eq!(safe_file_name("holiday photo.JPG"), "holiday photo.JPG");
    }

    #[test]
    fn mime_from_extension() {
        assert_eq!(guess_mime(Path::new("a/B.PNG")), "image/png");
        assert_eq!(guess_mime(Path::new("clip.webm")), "video/webm");
        assert_eq!(guess_mime(Path::new("notes")), "application/octet-stream");
    }
}
