//! Broadcast bus fanning command events out to requester channels.
//!
//! Uses `tokio::broadcast` so every requester connection can subscribe and
//! filter for its own traffic. Slow subscribers lag rather than blocking
//! the router.

use tokio::sync::broadcast;

use crate::protocol::WireFrame;

/// One event addressed to a requester channel.
#[derive(Debug, Clone)]
pub struct CommandEvent {
    /// Requester the event belongs to; `None` broadcasts to every
    /// requester connection (agent presence changes).
    pub requester_id: Option<String>,
    /// Ready-to-forward wire frame.
    pub frame: WireFrame,
}

impl CommandEvent {
    pub fn for_requester(requester_id: impl Into<String>, frame: WireFrame) -> Self {
        Self {
            requester_id: Some(requester_id.into()),
            frame,
        }
    }

    pub fn broadcast(frame: WireFrame) -> Self {
        Self {
            requester_id: None,
            frame,
        }
    }
}

/// Broadcast-based event bus.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CommandEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to all future events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CommandEvent> {
        self.sender.subscribe()
    }

    /// Publish an event; returns the number of subscribers reached. Events
    /// with no subscribers are dropped silently.
    pub fn publish(&self, event: CommandEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        let sent = bus.publish(CommandEvent::for_requester(
            "user-1",
            WireFrame::event("command_progress", serde_json::json!({})),
        ));
        assert_eq!(sent, 1);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.requester_id.as_deref(), Some("user-1"));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_dropped() {
        let bus = EventBus::new(16);
        let sent = bus.publish(CommandEvent::broadcast(WireFrame::event(
            "agent_connected",
            serde_json::json!({}),
        )));
        assert_eq!(sent, 0);
    }
}
