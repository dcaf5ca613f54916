use crate::protocol::LogEvent;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::warn;

/// Per-subscriber queue depth. A subscriber that falls this far behind loses
/// messages rather than stalling the publisher.
const SUBSCRIBER_QUEUE_DEPTH: usize = 1024;

/// One publication: topic tag, reception timestamp, the typed event, and for
/// voice topics the raw 480-byte A-law payload.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub timestamp: u64,
    pub event: LogEvent,
    pub voice: Option<Bytes>,
}

/// In-process topic-keyed fan-out with prefix-matched subscriptions.
///
/// `S_` matches all signaling, `S_29` a single message id, `V_42` the voice
/// stream of call 42. Delivery is at-most-once: each subscriber owns a
/// bounded queue and a full queue drops the message.
#[derive(Clone, Default)]
pub struct Bus {
    inner: Arc<Mutex<Registry>>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    subscribers: Vec<SubscriberEntry>,
}

struct SubscriberEntry {
    id: u64,
    filters: Vec<String>,
    tx: mpsc::Sender<Arc<BusMessage>>,
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<I, S>(&self, filters: I) -> Subscription
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
        let mut registry = self.inner.lock().expect("bus registry poisoned");
        registry.next_id += 1;
        let id = registry.next_id;
        registry.subscribers.push(SubscriberEntry {
            id,
            filters: filters.into_iter().map(Into::into).collect(),
            tx,
        });
        Subscription {
            bus: self.clone(),
            id,
            rx,
        }
    }

    pub fn publish(&self, msg: BusMessage) {
        let msg = Arc::new(msg);
        let registry = self.inner.lock().expect("bus registry poisoned");
        for sub in &registry.subscribers {
            if !sub.filters.iter().any(|f| msg.topic.starts_with(f.as_str())) {
                continue;
            }
            if sub.tx.try_send(msg.clone()).is_err() {
                warn!(topic = %msg.topic, subscriber = sub.id, "slow subscriber, message dropped");
            }
        }
    }

    fn add_filter(&self, id: u64, prefix: String) {
        let mut registry = self.inner.lock().expect("bus registry poisoned");
        if let Some(sub) = registry.subscribers.iter_mut().find(|s| s.id == id) {
            if !sub.filters.contains(&prefix) {
                sub.filters.push(prefix);
            }
        }
    }

    fn remove_filter(&self, id: u64, prefix: &str) {
        let mut registry = self.inner.lock().expect("bus registry poisoned");
        if let Some(sub) = registry.subscribers.iter_mut().find(|s| s.id == id) {
            sub.filters.retain(|f| f != prefix);
        }
    }

    fn unsubscribe(&self, id: u64) {
        let mut registry = self.inner.lock().expect("bus registry poisoned");
        registry.subscribers.retain(|s| s.id != id);
    }
}

/// A live subscription. Filters can be adjusted while subscribed, which is
/// how per-call voice interception attaches and detaches. Dropping the
/// subscription unregisters it.
pub struct Subscription {
    bus: Bus,
    id: u64,
    rx: mpsc::Receiver<Arc<BusMessage>>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Arc<BusMessage>> {
        self.rx.recv().await
    }

    pub fn add_filter(&self, prefix: impl Into<String>) {
        self.bus.add_filter(self.id, prefix.into());
    }

    pub fn remove_filter(&self, prefix: &str) {
        self.bus.remove_filter(self.id, prefix);
    }

    /// Detached control for adjusting this subscription's filters while the
    /// receiver itself is parked in an event loop.
    pub fn handle(&self) -> SubscriptionHandle {
        SubscriptionHandle {
            bus: self.bus.clone(),
            id: self.id,
        }
    }
}

/// Filter control detached from the receiving half of a subscription.
#[derive(Clone)]
pub struct SubscriptionHandle {
    bus: Bus,
    id: u64,
}

impl SubscriptionHandle {
    pub fn add_filter(&self, prefix: impl Into<String>) {
        self.bus.add_filter(self.id, prefix.into());
    }

    pub fn remove_filter(&self, prefix: &str) {
        self.bus.remove_filter(self.id, prefix);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{GroupCallPttIdle, MessageHeader, MSG_GROUP_CALL_PTT_IDLE};

    fn signaling_msg(topic: &str) -> BusMessage {
        BusMessage {
            topic: topic.to_string(),
            timestamp: 0,
            event: LogEvent::GroupCallPttIdle(GroupCallPttIdle {
                header: MessageHeader {
                    sequence: 0,
                    api_version: 1,
                    msg_id: MSG_GROUP_CALL_PTT_IDLE,
                },
                call_id: 1,
            }),
            voice: None,
        }
    }

    #[tokio::test]
    async fn prefix_subscription_filters_topics() {
        let bus = Bus::new();
        let mut all_signaling = bus.subscribe(["S_"]);
        let mut one_call = bus.subscribe(["V_42"]);

        bus.publish(signaling_msg("S_30"));
        bus.publish(signaling_msg("V_421")); // prefix match is textual
        bus.publish(signaling_msg("V_7"));

        assert_eq!(all_signaling.recv().await.unwrap().topic, "S_30");
        assert_eq!(one_call.recv().await.unwrap().topic, "V_421");
    }

    #[tokio::test]
    async fn filters_can_be_added_and_removed_live() {
        let bus = Bus::new();
        let mut sub = bus.subscribe(["S_"]);

        bus.publish(signaling_msg("V_9"));
        sub.add_filter("V_9");
        bus.publish(signaling_msg("V_9"));
        sub.remove_filter("V_9");
        bus.publish(signaling_msg("V_9"));
        bus.publish(signaling_msg("S_1"));

        assert_eq!(sub.recv().await.unwrap().topic, "V_9");
        assert_eq!(sub.recv().await.unwrap().topic, "S_1");
    }

    #[tokio::test]
    async fn slow_subscriber_drops_instead_of_blocking() {
        let bus = Bus::new();
        let mut sub = bus.subscribe(["S_"]);

        for _ in 0..(super::SUBSCRIBER_QUEUE_DEPTH + 16) {
            bus.publish(signaling_msg("S_1"));
        }

        // Queue holds exactly its depth, the excess was dropped.
        let mut received = 0;
        while sub.rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, super::SUBSCRIBER_QUEUE_DEPTH);
    }

    #[tokio::test]
    async fn dropped_subscription_unregisters() {
        let bus = Bus::new();
        let sub = bus.subscribe(["S_"]);
        drop(sub);
        // No subscriber left, publish must not panic or leak.
        bus.publish(signaling_msg("S_1"));
        assert!(bus.inner.lock().unwrap().subscribers.is_empty());
    }
}
