use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{sink::SinkExt, stream::StreamExt};
use nectar_common::{ClientMessage, Notification};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::coordinator::Coordinator;

/// Per-observer ring size
pub const CHANNEL_CAPACITY: usize = 256;

/// Single publish point for state changes
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Deliver to every current observer. Never blocks; having no observers is fine.
    pub fn publish(&self, msg: Notification) {
        let kind = msg.kind();
        match self.tx.send(msg) {
            Ok(n) => debug!("Broadcast {} to {} observer(s)", kind, n),
            Err(_) => debug!("Broadcast {} with no observers", kind),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn observers(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(CHANNEL_CAPACITY)
    }
}

/// WebSocket handler for real-time job updates
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(coordinator): State<Arc<Coordinator>>,
) -> impl IntoResponse {
    let notifier = coordinator.notifier().clone();
    ws.on_upgrade(move |socket| handle_socket(socket, notifier))
}

async fn handle_socket(socket: WebSocket, notifier: Notifier) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = notifier.subscribe();
    // direct replies to this observer only
    let (reply_tx, mut reply_rx) = mpsc::channel::<Notification>(8);

    info!("Observer connected ({} total)", notifier.observers());

    // forward broadcasts and direct replies to the client
    let mut send_task = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                received = rx.recv() => match received {
                    Ok(msg) => msg,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Observer lagging, dropped {} message(s)", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                reply = reply_rx.recv() => match reply {
                    Some(msg) => msg,
                    None => break,
                },
            };

            let text = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to encode {}: {}", msg.kind(), e);
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // handle incoming subscription requests
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::SubscribeJobUpdates { worker }) => {
                        let topic = match worker {
                            Some(worker) => format!("job_updates:{}", worker),
                            None => "job_updates".to_string(),
                        };
                        debug!("Observer subscribed to {}", topic);
                        if reply_tx
                            .send(Notification::SubscriptionConfirmed { topic })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => debug!("Ignoring client frame: {}", e),
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // wait for either task to finish
    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    }

    info!("Observer disconnected");
}
