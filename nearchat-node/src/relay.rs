//! Signaling relay socket: connect, pump text frames both ways, reconnect with backoff.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::node::Input;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

/// Keep a relay session alive until the input queue closes. Frames queued while the socket is
/// down are discarded; the core re-registers and replays its location on every reconnect.
pub async fn run(url: String, mut outgoing: UnboundedReceiver<String>, inputs: UnboundedSender<Input>) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        match connect_async(url.as_str()).await {
            Ok((socket, _)) => {
                info!(%url, "relay connected");
                backoff = INITIAL_BACKOFF;
                while outgoing.try_recv().is_ok() {}
                if inputs.send(Input::RelayUp).is_err() {
                    return;
                }
                let (mut sink, mut stream) = socket.split();
                loop {
                    tokio::select! {
                        frame = stream.next() => match frame {
                            Some(Ok(Message::Text(text))) => {
                                if inputs.send(Input::RelayText(text)).is_err() {
                                    return;
                                }
                            }
                            Some(Ok(Message::Ping(data))) => {
                                let _ = sink.send(Message::Pong(data)).await;
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(other)) => debug!(kind = ?other, "ignoring relay frame"),
                            Some(Err(e)) => {
                                warn!(error = %e, "relay read failed");
                                break;
                            }
                        },
                        out = outgoing.recv() => match out {
                            Some(text) => {
                                if let Err(e) = sink.send(Message::Text(text)).await {
                                    warn!(error = %e, "relay write failed");
                                    break;
                                }
                            }
                            None => {
                                let _ = sink.send(Message::Close(None)).await;
                                return;
                            }
                        },
                    }
                }
                if inputs.send(Input::RelayDown).is_err() {
                    return;
                }
            }
            Err(e) => warn!(%url, error = %e, retry_in = ?backoff, "relay connect failed"),
        }
        tokio::time::sleep(backoff).await;
        backoff = next_backoff(backoff);
    }
}
