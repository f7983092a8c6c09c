//! Client push channel.
//!
//! Fan-out point for session updates and task responses. The websocket
//! transport itself lives outside the core; anything that wants a live feed
//! subscribes to the broadcast channel here.

use tokio::sync::broadcast;

use fleet_common::WebsocketEvent;

/// Broadcasts events to every connected subscriber.
pub struct PushChannel {
    tx: broadcast::Sender<WebsocketEvent>,
}

impl PushChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Send an event to all current subscribers. Events sent while nobody
    /// is subscribed are dropped.
    pub fn broadcast(&self, event: WebsocketEvent) {
        let receivers = self.tx.receiver_count();
        if let Err(e) = self.tx.send(event) {
            if receivers > 0 {
                tracing::warn!("push channel send failed: {}", e);
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WebsocketEvent> {
        self.tx.subscribe()
    }
}

impl Default for PushChannel {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_common::{RunnerTaskResponse, WebsocketEventType};

    #[tokio::test]
    async fn test_broadcast_reaches_subscriber() {
        let channel = PushChannel::new(8);
        let mut rx = channel.subscribe();

        channel.broadcast(WebsocketEvent {
            event_type: WebsocketEventType::WorkerTaskResponse,
            session_id: "ses-1".to_string(),
            owner: "user-1".to_string(),
            session: None,
            worker_task_response: Some(RunnerTaskResponse::error(
                "ses-1".to_string(),
                "boom".to_string(),
            )),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.session_id, "ses-1");
        assert_eq!(event.event_type, WebsocketEventType::WorkerTaskResponse);
    }

    #[tokio::test]
    async fn test_broadcast_without_subscribers_is_silent() {
        let channel = PushChannel::new(8);
        channel.broadcast(WebsocketEvent {
            event_type: WebsocketEventType::SessionUpdate,
            session_id: "ses-1".to_string(),
            owner: "user-1".to_string(),
            session: None,
            worker_task_response: None,
        });
    }
}
