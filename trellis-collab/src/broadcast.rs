//! Per-document broadcast channel: low-latency delta fan-out.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers. Each
//! subscriber gets an independent receiver buffering up to `capacity`
//! messages; lagging receivers drop the oldest (backpressure), never block
//! the sender.
//!
//! Broadcast is a latency optimization, not the durability path: `publish`
//! is fire-and-forget and failures are logged, never surfaced to the edit
//! path. Durability comes from the coordinator's debounced flush.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, RwLock};

use crate::protocol::{validate_identifier, ProtocolError, MAX_DOCUMENT_ID_LEN};

/// Connection state of a channel, as seen by subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Connected,
    Disconnected,
}

/// Snapshot of channel counters.
#[derive(Debug, Clone, Default)]
pub struct ChannelStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub subscribers: usize,
}

/// Derive the deterministic channel name for a document.
///
/// The id is validated first — channel names share the identifier security
/// boundary with storage paths.
pub fn channel_name(document_id: &str) -> Result<String, ProtocolError> {
    validate_identifier(document_id, MAX_DOCUMENT_ID_LEN)?;
    Ok(format!("doc:{document_id}"))
}

/// A broadcast channel scoped to one document.
///
/// All coordinators open on the same document share one channel; a publish
/// by one is fanned out to every subscriber, including the publisher (echo
/// filtering by origin tag is the receiver's job).
pub struct DocChannel {
    name: String,
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    status_tx: watch::Sender<ChannelStatus>,
    capacity: usize,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl DocChannel {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        let (status_tx, _) = watch::channel(ChannelStatus::Connected);
        Self {
            name: name.into(),
            sender,
            status_tx,
            capacity,
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }

    /// Fire-and-forget publish of pre-encoded envelope bytes.
    ///
    /// Returns the number of receivers the message reached. Zero receivers
    /// is not an error — a sole editor publishes into the void.
    pub fn publish(&self, encoded: Vec<u8>) -> usize {
        match self.sender.send(Arc::new(encoded)) {
            Ok(count) => {
                self.messages_sent.fetch_add(1, Ordering::Relaxed);
                count
            }
            Err(_) => {
                // No active receivers; message dropped by design.
                self.messages_dropped.fetch_add(1, Ordering::Relaxed);
                log::trace!("channel {}: publish with no subscribers", self.name);
                0
            }
        }
    }

    /// Subscribe to messages on this channel.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }

    /// Watch connection-state transitions.
    pub fn status(&self) -> watch::Receiver<ChannelStatus> {
        self.status_tx.subscribe()
    }

    /// Push a connection-state transition to all watchers.
    ///
    /// Called by the transport driving this channel (and by tests to
    /// simulate drops/reconnects).
    pub fn set_status(&self, status: ChannelStatus) {
        // send_replace never fails; watchers may or may not exist.
        self.status_tx.send_replace(status);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            subscribers: self.sender.receiver_count(),
        }
    }
}

/// Registry mapping channel names to live channels.
///
/// Hands out `Arc<DocChannel>` handles so that rebinding the same document
/// reuses the same underlying channel — callers must hold the handle rather
/// than re-resolving per message, or reconnect churn follows.
pub struct ChannelRegistry {
    channels: RwLock<HashMap<String, Arc<DocChannel>>>,
    default_capacity: usize,
}

impl ChannelRegistry {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Get or create the channel with the given name.
    pub async fn get_or_create(&self, name: &str) -> Arc<DocChannel> {
        // Fast path: read lock
        {
            let channels = self.channels.read().await;
            if let Some(channel) = channels.get(name) {
                return channel.clone();
            }
        }

        // Slow path: write lock, double-check after acquiring
        let mut channels = self.channels.write().await;
        if let Some(channel) = channels.get(name) {
            return channel.clone();
        }

        let channel = Arc::new(DocChannel::new(name, self.default_capacity));
        channels.insert(name.to_string(), channel.clone());
        log::debug!("channel registry: created {name}");
        channel
    }

    /// Remove a channel if nothing subscribes to it anymore.
    pub async fn remove_if_idle(&self, name: &str) -> bool {
        let mut channels = self.channels.write().await;
        if let Some(channel) = channels.get(name) {
            if channel.subscriber_count() == 0 {
                channels.remove(name);
                log::debug!("channel registry: removed idle {name}");
                return true;
            }
        }
        false
    }

    /// Drop every idle channel. Returns how many were removed.
    pub async fn sweep_idle(&self) -> usize {
        let mut channels = self.channels.write().await;
        let before = channels.len();
        channels.retain(|_, c| c.subscriber_count() > 0);
        before - channels.len()
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_name_derivation() {
        assert_eq!(channel_name("doc-1").unwrap(), "doc:doc-1");
        assert!(channel_name("doc/../escape").is_err());
        assert!(channel_name("").is_err());
    }

    #[tokio::test]
    async fn test_publish_fan_out() {
        let channel = DocChannel::new("doc:test", 16);
        let mut rx1 = channel.subscribe();
        let mut rx2 = channel.subscribe();

        let count = channel.publish(vec![1, 2, 3]);
        assert_eq!(count, 2);

        assert_eq!(*rx1.recv().await.unwrap(), vec![1, 2, 3]);
        assert_eq!(*rx2.recv().await.unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let channel = DocChannel::new("doc:test", 16);
        assert_eq!(channel.publish(vec![1]), 0);

        let stats = channel.stats();
        assert_eq!(stats.messages_sent, 0);
        assert_eq!(stats.messages_dropped, 1);
    }

    #[tokio::test]
    async fn test_status_transitions() {
        let channel = DocChannel::new("doc:test", 16);
        let mut status = channel.status();
        assert_eq!(*status.borrow(), ChannelStatus::Connected);

        channel.set_status(ChannelStatus::Disconnected);
        status.changed().await.unwrap();
        assert_eq!(*status.borrow(), ChannelStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_registry_get_or_create_returns_same_handle() {
        let registry = ChannelRegistry::new(16);
        let a = registry.get_or_create("doc:a").await;
        let b = registry.get_or_create("doc:a").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.channel_count().await, 1);
    }

    #[tokio::test]
    async fn test_registry_isolates_documents() {
        let registry = ChannelRegistry::new(16);
        let a = registry.get_or_create("doc:a").await;
        let b = registry.get_or_create("doc:b").await;

        let mut rx_b = b.subscribe();
        a.publish(vec![9]);

        // Nothing crosses between channels
        assert!(rx_b.try_recv().is_err());
        assert_eq!(registry.channel_count().await, 2);
    }

    #[tokio::test]
    async fn test_registry_idle_cleanup() {
        let registry = ChannelRegistry::new(16);
        let channel = registry.get_or_create("doc:a").await;

        {
            let _rx = channel.subscribe();
            assert!(!registry.remove_if_idle("doc:a").await);
        }
        // Receiver dropped — now idle
        assert!(registry.remove_if_idle("doc:a").await);
        assert_eq!(registry.channel_count().await, 0);
    }

    #[tokio::test]
    async fn test_registry_sweep_idle() {
        let registry = ChannelRegistry::new(16);
        let a = registry.get_or_create("doc:a").await;
        let _b = registry.get_or_create("doc:b").await;

        let _rx = a.subscribe();
        let removed = registry.sweep_idle().await;
        assert_eq!(removed, 1);
        assert_eq!(registry.channel_count().await, 1);
    }

    #[tokio::test]
    async fn test_stats_track_sends() {
        let channel = DocChannel::new("doc:test", 16);
        let _rx = channel.subscribe();

        channel.publish(vec![1]);
        channel.publish(vec![2]);

        let stats = channel.stats();
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.subscribers, 1);
    }
}
