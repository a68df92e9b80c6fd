//! ==============================================================================
//! hub.rs - realtime fan-out to dashboard clients
//! ==============================================================================
//!
//! purpose:
//!     pushes every committed scan batch to all connected dashboards.
//!
//! delivery model:
//!     best effort. there is no acknowledgement and no replay: a dashboard
//!     that connects after a batch never sees it and should reload from
//!     GET /api/devices. each subscriber has its own bounded buffer in the
//!     broadcast channel; one that falls behind loses its oldest events and
//!     never slows ingest or the other subscribers.
//!
//! ```text
//!     ┌────────────┐   publish   ┌───────────────────┐   recv   ┌───────────┐
//!     │ scan handler│ ─────────► │ broadcast::Sender │ ───────► │ ws session │ x N
//!     └────────────┘             └───────────────────┘          └───────────┘
//! ```
//!
//! relationships:
//!     - used by: server.rs (publish after commit, /ws upgrade)
//!
//! ==============================================================================

use crate::domain::HubEvent;
use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct Hub {
    tx: broadcast::Sender<Arc<HubEvent>>,
    next_id: Arc<AtomicU64>,
}

impl Hub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, next_id: Arc::new(AtomicU64::new(1)) }
    }

    /// Send an event to everyone currently subscribed.
    ///
    /// Returns how many subscribers it was queued for; zero when nobody is
    /// listening, which is not an error.
    pub fn publish(&self, event: HubEvent) -> usize {
        self.tx.send(Arc::new(event)).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<HubEvent>> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    fn next_connection_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Drive one websocket connection until either side goes away.
pub async fn serve_socket(socket: WebSocket, hub: Hub) {
    let connection_id = hub.next_connection_id();
    let mut events = hub.subscribe();
    let (mut sender, mut receiver) = socket.split();

    info!(connection_id, subscribers = hub.subscriber_count(), "dashboard connected");

    if send_event(&mut sender, &HubEvent::Hello { connection_id }).await.is_ok() {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => {
                        if let Err(e) = send_event(&mut sender, &event).await {
                            debug!(connection_id, error = %e, "send failed");
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(connection_id, skipped, "dashboard lagging, events dropped");
                    }
                    Err(RecvError::Closed) => break,
                },
                incoming = receiver.next() => match incoming {
                    // dashboards only listen; anything they send is ignored
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                },
            }
        }
    }

    info!(connection_id, "dashboard disconnected");
}

async fn send_event<S>(sender: &mut S, event: &HubEvent) -> Result<(), axum::Error>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    let text = serde_json::to_string(event).map_err(axum::Error::new)?;
    sender.send(Message::Text(text)).await
}
