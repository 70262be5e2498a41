//! Dispatcher notification stream.
//!
//! Connects to the dispatcher's `/ws` endpoint, subscribes to job updates for
//! one worker and forwards every parsed [`Notification`] into a channel. The
//! socket is reopened after a fixed delay whenever it drops.

use futures::{SinkExt, StreamExt};
use nectar_common::{ClientMessage, Notification};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Why a session ended
#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    /// The socket went away; reconnect
    Dropped,
    /// Nobody is reading notifications anymore; stop for good
    ReceiverGone,
}

/// Keep a subscription open until the receiving side of `tx` is dropped.
pub async fn run(ws_url: String, worker: String, tx: mpsc::Sender<Notification>, reconnect_delay: Duration) {
    loop {
        info!(url = %ws_url, "Connecting to dispatcher subscription channel");

        match connect_async(ws_url.as_str()).await {
            Ok((stream, _response)) => {
                info!("Subscription channel connected");
                if run_session(stream, &worker, &tx).await == SessionEnd::ReceiverGone {
                    return;
                }
                warn!("Subscription channel lost, reconnecting in {:?}", reconnect_delay);
            }
            Err(e) => {
                warn!(error = %e, "Subscription connect failed");
            }
        }

        if tx.is_closed() {
            return;
        }
        tokio::time::sleep(reconnect_delay).await;
    }
}

async fn run_session(
    stream: tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    worker: &str,
    tx: &mpsc::Sender<Notification>,
) -> SessionEnd {
    let (mut sink, mut stream) = stream.split();

    let subscribe = ClientMessage::SubscribeJobUpdates {
        worker: Some(worker.to_string()),
    };
    let frame = match serde_json::to_string(&subscribe) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "Failed to encode subscribe frame");
            return SessionEnd::Dropped;
        }
    };
    if let Err(e) = sink.send(Message::Text(frame)).await {
        warn!(error = %e, "Failed to send subscribe frame");
        return SessionEnd::Dropped;
    }

    loop {
        tokio::select! {
            _ = tx.closed() => return SessionEnd::ReceiverGone,
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let Some(notification) = parse(&text) else { continue };
                    if tx.send(notification).await.is_err() {
                        return SessionEnd::ReceiverGone;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(?frame, "Dispatcher closed subscription channel");
                    return SessionEnd::Dropped;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "Subscription receive error");
                    return SessionEnd::Dropped;
                }
                None => return SessionEnd::Dropped,
            }
        }
    }
}

/// Notifications from a newer dispatcher may carry types we do not know; skip them.
fn parse(text: &str) -> Option<Notification> {
    match serde_json::from_str::<Notification>(text) {
        Ok(notification) => Some(notification),
        Err(e) => {
            debug!(error = %e, raw = %text, "Ignoring unrecognized notification");
            None
        }
    }
}
