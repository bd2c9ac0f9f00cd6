//! In-process, topic-routed frame broker.
//!
//! Uses one [`tokio::sync::broadcast`] channel per [`Topic`], created the
//! first time someone subscribes to it, so every subscriber receives every
//! frame on its topic without any single subscriber blocking the others.
//!
//! # Delivery guarantees
//!
//! | Property | Behaviour |
//! |---|---|
//! | Routing | Exact topic match; a frame only reaches its own topic's channel |
//! | Ordering | Per topic, in publish order |
//! | Persistence | None; a frame published with no subscriber is dropped |
//! | Back-pressure | None; a slow subscriber loses the oldest frames (`Lagged`) |
//!
//! A second, global *tap* channel sees every frame regardless of topic. It
//! exists for bridges that relay the whole bus to another process.
//!
//! A topic's channel is closed as soon as its last [`TopicReceiver`] is
//! dropped, so short-lived topics (RPC reply topics) leave nothing behind.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, trace};
use xiron_types::Topic;

use crate::frame::Frame;

/// Default channel capacity (number of buffered frames before old ones are
/// dropped for slow subscribers).
pub const DEFAULT_CAPACITY: usize = 256;

/// Shared broker handle. Clone it cheaply – all clones route through the same
/// channels.
#[derive(Clone, Debug)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

#[derive(Debug)]
struct BrokerInner {
    capacity: usize,
    topics: RwLock<HashMap<Topic, broadcast::Sender<Frame>>>,
    tap: broadcast::Sender<Frame>,
}

impl Broker {
    /// Create a broker whose per-topic channels each buffer `capacity` frames.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero, like [`broadcast::channel`].
    pub fn new(capacity: usize) -> Self {
        let (tap, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(BrokerInner {
                capacity,
                topics: RwLock::new(HashMap::new()),
                tap,
            }),
        }
    }

    /// Hand `frame` to every current subscriber of its topic.
    ///
    /// Returns the number of subscribers that received it. `0` means the
    /// frame was dropped: delivery is at-most-once and nothing is persisted,
    /// so this is a normal condition rather than an error.
    pub fn publish(&self, frame: Frame) -> usize {
        let delivered = {
            let topics = self.inner.topics.read();
            topics
                .get(&frame.topic)
                .and_then(|tx| tx.send(frame.clone()).ok())
                .unwrap_or(0)
        };
        if delivered == 0 {
            trace!(topic = %frame.topic, "no subscribers, frame dropped");
            self.prune(&frame.topic);
        }
        // The tap has no subscribers unless a bridge is attached.
        let _ = self.inner.tap.send(frame);
        delivered
    }

    /// Subscribe to exactly one topic.
    pub fn subscribe(&self, topic: &Topic) -> TopicReceiver {
        let mut topics = self.inner.topics.write();
        let sender = topics.entry(topic.clone()).or_insert_with(|| {
            debug!(topic = %topic, "opening topic channel");
            broadcast::channel(self.inner.capacity).0
        });
        TopicReceiver {
            topic: topic.clone(),
            receiver: sender.subscribe(),
            broker: Arc::downgrade(&self.inner),
        }
    }

    /// Receive every frame published on this broker, whatever its topic.
    pub fn tap(&self) -> broadcast::Receiver<Frame> {
        self.inner.tap.subscribe()
    }

    /// Number of live receivers on `topic`.
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.inner
            .topics
            .read()
            .get(topic)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// Topics that currently have at least one receiver.
    pub fn topics(&self) -> Vec<Topic> {
        let mut topics: Vec<Topic> = self
            .inner
            .topics
            .read()
            .iter()
            .filter(|(_, tx)| tx.receiver_count() > 0)
            .map(|(topic, _)| topic.clone())
            .collect();
        topics.sort();
        topics
    }

    /// Number of topic channels currently open, live or not.
    #[cfg(test)]
    pub(crate) fn open_channels(&self) -> usize {
        self.inner.topics.read().len()
    }

    fn prune(&self, topic: &Topic) {
        self.inner.release(topic, 0);
    }
}

impl BrokerInner {
    /// Drop `topic`'s channel if it has at most `remaining` receivers.
    fn release(&self, topic: &Topic, remaining: usize) {
        let mut topics = self.topics.write();
        if topics.get(topic).is_some_and(|tx| tx.receiver_count() <= remaining) {
            topics.remove(topic);
            trace!(topic = %topic, "topic channel closed");
        }
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// An async receiver bound to a single [`Topic`] channel.
///
/// Obtained via [`Broker::subscribe`]. Dropping it releases the slot counted
/// by [`Broker::subscriber_count`].
#[derive(Debug)]
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Frame>,
    broker: Weak<BrokerInner>,
}

impl TopicReceiver {
    /// Wait for the next frame on this topic.
    ///
    /// Returns:
    /// * `Ok(frame)` – a successfully received frame.
    /// * `Err(broadcast::error::RecvError::Lagged(n))` – the receiver fell
    ///   behind and `n` frames were dropped.
    /// * `Err(broadcast::error::RecvError::Closed)` – the broker has shut down.
    pub async fn recv(&mut self) -> Result<Frame, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }
}

impl Drop for TopicReceiver {
    fn drop(&mut self) {
        // `self.receiver` is still alive here, so it counts as one.
        if let Some(broker) = self.broker.upgrade() {
            broker.release(&self.topic, 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn topic(tag: &str) -> Topic {
        Topic::new(tag).unwrap()
    }

    #[tokio::test]
    async fn publish_and_receive() -> Result<(), Box<dyn std::error::Error>> {
        let broker = Broker::default();
        let mut rx = broker.subscribe(&topic("vel"));

        let delivered = broker.publish(Frame::new(topic("vel"), "{}"));
        assert_eq!(delivered, 1);

        let frame = rx.recv().await?;
        assert_eq!(frame.topic, topic("vel"));
        assert_eq!(&*frame.body, "{}");
        Ok(())
    }

    #[test]
    fn publish_without_subscribers_is_dropped_not_an_error() {
        let broker = Broker::default();
        assert_eq!(broker.publish(Frame::new(topic("vel"), "{}")), 0);
        assert!(broker.topics().is_empty());
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_frame() -> Result<(), Box<dyn std::error::Error>> {
        let broker = Broker::default();
        let mut rx1 = broker.subscribe(&topic("pose"));
        let mut rx2 = broker.subscribe(&topic("pose"));

        assert_eq!(broker.publish(Frame::new(topic("pose"), "{\"n\":1}")), 2);
        assert_eq!(rx1.recv().await?.body, rx2.recv().await?.body);
        Ok(())
    }

    /// A subscriber on `scan` must not receive frames published to `pose`,
    /// nor to topics that merely share a prefix.
    #[tokio::test]
    async fn subscriber_does_not_receive_other_topic_frames() {
        let broker = Broker::default();
        let mut scan_rx = broker.subscribe(&topic("scan"));
        let _pose_rx = broker.subscribe(&topic("pose"));

        broker.publish(Frame::new(topic("pose"), "{}"));
        broker.publish(Frame::new(topic("scan/robot0"), "{}"));

        let result = tokio::time::timeout(Duration::from_millis(50), scan_rx.recv()).await;
        assert!(result.is_err(), "scan subscriber must not receive other topics");
    }

    #[tokio::test]
    async fn frames_arrive_in_publish_order() -> Result<(), Box<dyn std::error::Error>> {
        let broker = Broker::default();
        let mut rx = broker.subscribe(&topic("vel"));
        for i in 0..10 {
            broker.publish(Frame::new(topic("vel"), format!("{{\"seq\":{i}}}")));
        }
        for i in 0..10 {
            assert_eq!(&*rx.recv().await?.body, format!("{{\"seq\":{i}}}"));
        }
        Ok(())
    }

    #[tokio::test]
    async fn subscriber_count_tracks_receivers() {
        let broker = Broker::default();
        let t = topic("vel");
        assert_eq!(broker.subscriber_count(&t), 0);

        let rx1 = broker.subscribe(&t);
        let rx2 = broker.subscribe(&t);
        assert_eq!(broker.subscriber_count(&t), 2);
        assert_eq!(broker.topics(), vec![t.clone()]);

        drop(rx1);
        assert_eq!(broker.open_channels(), 1);
        drop(rx2);
        assert_eq!(broker.subscriber_count(&t), 0);
        assert!(broker.topics().is_empty());
        assert_eq!(broker.open_channels(), 0);
    }

    #[tokio::test]
    async fn dropped_receiver_closes_its_channel() -> Result<(), Box<dyn std::error::Error>> {
        let broker = Broker::default();
        let _keep = broker.subscribe(&topic("pose"));

        for i in 0..100 {
            let t = topic(&format!("rpc/reply/{i}"));
            let mut rx = broker.subscribe(&t);
            assert_eq!(broker.publish(Frame::new(t, "{}")), 1);
            rx.recv().await?;
        }
        assert_eq!(broker.open_channels(), 1);

        // Resubscribing after a close opens a fresh, working channel.
        let mut again = broker.subscribe(&topic("rpc/reply/7"));
        assert_eq!(broker.publish(Frame::new(topic("rpc/reply/7"), "{}")), 1);
        again.recv().await?;
        Ok(())
    }

    #[test]
    fn receiver_outliving_broker_drops_cleanly() {
        let broker = Broker::default();
        let rx = broker.subscribe(&topic("vel"));
        drop(broker);
        drop(rx);
    }

    #[tokio::test]
    async fn tap_sees_every_topic() -> Result<(), Box<dyn std::error::Error>> {
        let broker = Broker::default();
        let mut tap = broker.tap();

        broker.publish(Frame::new(topic("vel"), "{}"));
        broker.publish(Frame::new(topic("pose"), "{}"));

        assert_eq!(tap.recv().await?.topic, topic("vel"));
        assert_eq!(tap.recv().await?.topic, topic("pose"));
        Ok(())
    }

    /// Flooding a low-capacity channel while a subscriber sleeps must produce
    /// a `Lagged` error rather than panicking or blocking the publisher.
    #[tokio::test]
    async fn slow_subscriber_lags() {
        let broker = Broker::new(16);
        let mut slow = broker.subscribe(&topic("scan"));

        for _ in 0..1_000 {
            broker.publish(Frame::new(topic("scan"), "{}"));
        }

        let result = slow.recv().await;
        assert!(
            matches!(result, Err(broadcast::error::RecvError::Lagged(_))),
            "expected Lagged error, got: {result:?}"
        );
    }
}
