//! Pub/sub adapter contract for horizontal scale.
//!
//! When multiple controller replicas coexist, a shared messaging layer
//! carries commands to the replica holding the agent's session and fans
//! progress/results back to the replica holding the requester's session.
//! Delivery is best-effort, in order per channel; Lost detection covers
//! drops. This module defines the contract and channel names, an
//! in-process bus for single-replica deployments and tests, and a
//! Redis-backed bus.

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Registrations and departures.
pub const PRESENCE_CHANNEL: &str = "ogent.agents.presence";

/// Commands toward the replica holding the agent's session.
pub fn agent_in_channel(agent_id: &str) -> String {
    format!("ogent.agent.{agent_id}.in")
}

/// Progress/results toward the replica holding the requester's session.
pub fn command_out_channel(command_id: Uuid) -> String {
    format!("ogent.command.{command_id}.out")
}

/// A best-effort, per-channel-ordered pub/sub transport.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a payload on a channel. Publishing to a channel nobody
    /// subscribes to is not an error.
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Subscribe to a channel. The receiver yields payloads in publish
    /// order until the bus (or the subscription) is dropped.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>>;
}

/// In-process bus backed by per-channel broadcast channels.
#[derive(Default)]
pub struct LocalBus {
    channels: DashMap<String, broadcast::Sender<String>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        // No subscribers is fine; the send result is the delivery count.
        let _ = self.sender(channel).send(payload.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>> {
        let mut source = self.sender(channel).subscribe();
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(lagged = n, "local bus subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(rx)
    }
}

/// Redis pub/sub bus for multi-replica deployments.
pub struct RedisBus {
    client: redis::Client,
}

impl RedisBus {
    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::Messaging(format!("invalid redis url: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| Error::Messaging(format!("redis connect failed: {e}")))?;
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async::<i64>(&mut conn)
            .await
            .map_err(|e| Error::Messaging(format!("redis publish failed: {e}")))?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| Error::Messaging(format!("redis connect failed: {e}")))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| Error::Messaging(format!("redis subscribe failed: {e}")))?;

        let channel = channel.to_string();
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(message) = stream.next().await {
                match message.get_payload::<String>() {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(channel = %channel, error = %e, "undecodable redis payload"),
                }
            }
            debug!(channel = %channel, "redis subscription ended");
        });
        Ok(rx)
    }
}
