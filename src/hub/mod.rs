//! Event broadcast hub
//!
//! Fans typed events out to subscriber connections, each with a topic
//! filter. A producer is never blocked on a slow subscriber for longer
//! than the configured send timeout; subscribers that cannot keep up
//! are dropped.

use crate::config::HubConfig;
use crate::events::BroadcastEvent;
use crate::telemetry::{record_latency, LatencyMetric};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

struct Subscriber {
    /// Topics this connection receives; empty means all topics
    topics: HashSet<String>,
    tx: mpsc::Sender<String>,
}

impl Subscriber {
    fn matches(&self, topic: &str) -> bool {
        self.topics.is_empty() || self.topics.contains(topic)
    }
}

/// Pub/sub fan-out point for all derived events
pub struct EventBroadcastHub {
    config: HubConfig,
    subscribers: Arc<RwLock<HashMap<Uuid, Subscriber>>>,
    events_published: AtomicU64,
    events_dropped: AtomicU64,
}

impl EventBroadcastHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            events_published: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
        }
    }

    /// Register a new connection with an initial topic filter.
    /// Returns the connection id and the receiving end of its channel.
    pub async fn register(
        &self,
        topics: impl IntoIterator<Item = String>,
    ) -> (Uuid, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let id = Uuid::new_v4();
        let subscriber = Subscriber {
            topics: topics.into_iter().collect(),
            tx,
        };
        self.subscribers.write().await.insert(id, subscriber);
        tracing::debug!(connection = %id, "Subscriber registered");
        (id, rx)
    }

    /// Add a topic to a connection's filter
    pub async fn subscribe(&self, id: Uuid, topic: impl Into<String>) -> bool {
        let mut subs = self.subscribers.write().await;
        match subs.get_mut(&id) {
            Some(sub) => {
                sub.topics.insert(topic.into());
                true
            }
            None => false,
        }
    }

    /// Remove a topic from a connection's filter
    pub async fn unsubscribe(&self, id: Uuid, topic: &str) -> bool {
        let mut subs = self.subscribers.write().await;
        match subs.get_mut(&id) {
            Some(sub) => sub.topics.remove(topic),
            None => false,
        }
    }

    /// Drop a connection entirely
    pub async fn disconnect(&self, id: Uuid) {
        self.subscribers.write().await.remove(&id);
        tracing::debug!(connection = %id, "Subscriber disconnected");
    }

    /// Drop every connection (shutdown path)
    pub async fn disconnect_all(&self) {
        self.subscribers.write().await.clear();
    }

    /// Deliver an event to every matching subscriber.
    ///
    /// The event is serialized once. Subscribers whose channel cannot
    /// accept the message within the send timeout are removed.
    pub async fn publish(&self, event: &BroadcastEvent) {
        let topic = event.topic();
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, topic, "Failed to serialize event");
                return;
            }
        };
        self.events_published.fetch_add(1, Ordering::Relaxed);

        let start = std::time::Instant::now();
        let timeout = Duration::from_millis(self.config.send_timeout_ms);
        let mut slow: Vec<Uuid> = Vec::new();
        {
            let subs = self.subscribers.read().await;
            for (id, sub) in subs.iter() {
                if !sub.matches(topic) {
                    continue;
                }
                match tokio::time::timeout(timeout, sub.tx.send(payload.clone())).await {
                    Ok(Ok(())) => {}
                    // Timed out or receiver gone: drop the connection
                    _ => slow.push(*id),
                }
            }
        }

        if !slow.is_empty() {
            let mut subs = self.subscribers.write().await;
            for id in slow {
                subs.remove(&id);
                self.events_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(connection = %id, topic, "Dropped slow subscriber");
            }
        }
        record_latency(LatencyMetric::Publish, start.elapsed());
    }

    /// Number of live connections
    pub async fn client_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Subscriber count per topic; all-topic connections count toward
    /// the "*" entry
    pub async fn subscription_stats(&self) -> HashMap<String, usize> {
        let subs = self.subscribers.read().await;
        let mut stats: HashMap<String, usize> = HashMap::new();
        for sub in subs.values() {
            if sub.topics.is_empty() {
                *stats.entry("*".to_string()).or_insert(0) += 1;
            } else {
                for topic in &sub.topics {
                    *stats.entry(topic.clone()).or_insert(0) += 1;
                }
            }
        }
        stats
    }

    pub fn events_published(&self) -> u64 {
        self.events_published.load(Ordering::Relaxed)
    }

    pub fn events_dropped(&self) -> u64 {
        self.events_dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub() -> EventBroadcastHub {
        EventBroadcastHub::new(HubConfig {
            send_timeout_ms: 50,
            channel_capacity: 4,
            stats_interval_secs: 60,
        })
    }

    fn estimate_event() -> BroadcastEvent {
        BroadcastEvent::VolatilityEstimate {
            timestamp_ms: 1_700_000_000_000,
            instrument: "BTC-PERPETUAL".to_string(),
            volatility: 0.02,
        }
    }

    fn trade_event() -> BroadcastEvent {
        BroadcastEvent::OptionChainUpdate {
            timestamp_ms: 1_700_000_000_000,
            underlying: "BTC".to_string(),
            n_instruments: 10,
            n_tracked: 5,
        }
    }

    #[tokio::test]
    async fn test_topic_filtering() {
        let hub = hub();
        let (_, mut vol_rx) = hub
            .register(vec!["volatility_estimate".to_string()])
            .await;
        let (_, mut all_rx) = hub.register(Vec::new()).await;
        let (_, mut chain_rx) = hub
            .register(vec!["option_chain_update".to_string()])
            .await;

        hub.publish(&estimate_event()).await;

        let msg = vol_rx.recv().await.unwrap();
        assert!(msg.contains("volatility_estimate"));
        let msg = all_rx.recv().await.unwrap();
        assert!(msg.contains("volatility_estimate"));
        // The chain subscriber must not receive it
        assert!(chain_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_subscribe_unsubscribe() {
        let hub = hub();
        let (id, mut rx) = hub
            .register(vec!["option_chain_update".to_string()])
            .await;

        hub.publish(&estimate_event()).await;
        assert!(rx.try_recv().is_err());

        assert!(hub.subscribe(id, "volatility_estimate").await);
        hub.publish(&estimate_event()).await;
        assert!(rx.recv().await.is_some());

        assert!(hub.unsubscribe(id, "volatility_estimate").await);
        hub.publish(&estimate_event()).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_mid_publish_preserves_others() {
        let hub = hub();
        let (id, rx) = hub.register(Vec::new()).await;
        let (_, mut other_rx) = hub.register(Vec::new()).await;

        // Simulate a dead connection: drop the receiver
        drop(rx);
        hub.publish(&trade_event()).await;

        // The live subscriber still gets the event; the dead one is gone
        assert!(other_rx.recv().await.is_some());
        assert_eq!(hub.client_count().await, 1);
        hub.disconnect(id).await; // already removed; must not panic
        assert_eq!(hub.client_count().await, 1);
    }

    #[tokio::test]
    async fn test_slow_subscriber_dropped_not_publisher_stalled() {
        let hub = hub();
        // Fill the channel (capacity 4) and never drain it
        let (_, _stuck_rx) = hub.register(Vec::new()).await;
        for _ in 0..4 {
            hub.publish(&estimate_event()).await;
        }
        assert_eq!(hub.client_count().await, 1);

        // Channel is full; the next publish times out and drops it
        let start = std::time::Instant::now();
        hub.publish(&estimate_event()).await;
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(hub.client_count().await, 0);
        assert_eq!(hub.events_dropped(), 1);
    }

    #[tokio::test]
    async fn test_subscription_stats() {
        let hub = hub();
        let (_, _rx1) = hub
            .register(vec![
                "trade".to_string(),
                "volatility_event".to_string(),
            ])
            .await;
        let (_, _rx2) = hub.register(vec!["trade".to_string()]).await;
        let (_, _rx3) = hub.register(Vec::new()).await;

        let stats = hub.subscription_stats().await;
        assert_eq!(stats.get("trade"), Some(&2));
        assert_eq!(stats.get("volatility_event"), Some(&1));
        assert_eq!(stats.get("*"), Some(&1));
        assert_eq!(hub.client_count().await, 3);
    }

    #[tokio::test]
    async fn test_delivery_order_per_subscriber() {
        let hub = hub();
        let (_, mut rx) = hub.register(Vec::new()).await;
        for i in 0..3 {
            hub.publish(&BroadcastEvent::VolatilityEstimate {
                timestamp_ms: i,
                instrument: "BTC-PERPETUAL".to_string(),
                volatility: 0.01,
            })
            .await;
        }
        for i in 0..3 {
            let msg = rx.recv().await.unwrap();
            assert!(msg.contains(&format!("\"timestamp_ms\":{}", i)));
        }
    }
}
