//! Fire-and-forget publication of commands and telemetry.
//!
//! A publish serialises the payload, hands the frame to the broker, and
//! returns. It never waits for a peer and never fails because nobody is
//! listening: with no subscriber on the topic the frame is simply dropped.

use serde::Serialize;
use tracing::debug;
use xiron_types::{BusError, LaserScan, Pose, Topic, VelocityBatch, VelocityCommand};

use crate::broker::Broker;
use crate::frame::Frame;

/// Values that may be published on the bus.
pub trait Payload: Serialize {}

impl Payload for VelocityCommand {}
impl Payload for VelocityBatch {}
impl Payload for Pose {}
impl Payload for LaserScan {}

#[derive(Serialize)]
struct BatchRef<'a> {
    commands: &'a [VelocityCommand],
}

impl Payload for BatchRef<'_> {}

#[derive(Clone, Debug)]
pub struct Publisher {
    broker: Broker,
}

impl Publisher {
    pub fn new(broker: Broker) -> Self {
        Self { broker }
    }

    /// Publish `payload` under `topic`.
    ///
    /// Returns the number of local subscribers handed the frame; `Ok(0)`
    /// means it was dropped. Only serialisation can fail.
    pub fn publish<P: Payload>(&self, topic: &Topic, payload: &P) -> Result<usize, BusError> {
        let frame = Frame::encode(topic.clone(), payload)?;
        let delivered = self.broker.publish(frame);
        if delivered == 0 {
            debug!(topic = %topic, "published with no local subscribers");
        }
        Ok(delivered)
    }

    /// Publish several velocity commands as one [`VelocityBatch`] message.
    pub fn publish_batch(
        &self,
        topic: &Topic,
        commands: &[VelocityCommand],
    ) -> Result<usize, BusError> {
        self.publish(topic, &BatchRef { commands })
    }

    /// Publish an already-encoded body without validating it.
    pub fn publish_raw(&self, topic: &Topic, body: impl Into<std::sync::Arc<str>>) -> usize {
        self.broker.publish(Frame::new(topic.clone(), body))
    }
}
