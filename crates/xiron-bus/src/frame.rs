//! Topic-tagged frames, the unit the broker and the bridge move around.
//!
//! The topic travels beside the JSON body rather than inside it, so a
//! subscriber filters before it parses. On a WebSocket the two parts share one
//! text message: `"<topic>\n<json body>"`.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;
use xiron_types::{BusError, Topic};

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub topic: Topic,
    /// One JSON object, UTF-8 text.
    pub body: Arc<str>,
    /// Bridge connection this frame arrived through, if any. Never sent on
    /// the wire; it only stops a bridge from echoing a frame back to its peer.
    pub origin: Option<Uuid>,
}

impl Frame {
    pub fn new(topic: Topic, body: impl Into<Arc<str>>) -> Self {
        Self {
            topic,
            body: body.into(),
            origin: None,
        }
    }

    /// Serialise `payload` into a frame under `topic`.
    pub fn encode<P: Serialize + ?Sized>(topic: Topic, payload: &P) -> Result<Self, BusError> {
        let body = serde_json::to_string(payload)?;
        Ok(Self::new(topic, body))
    }

    pub fn with_origin(mut self, origin: Uuid) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn to_wire(&self) -> String {
        format!("{}\n{}", self.topic, self.body)
    }

    pub fn from_wire(text: &str) -> Result<Self, BusError> {
        let (topic, body) = text
            .split_once('\n')
            .ok_or_else(|| BusError::Serialization("frame has no topic separator".to_string()))?;
        Ok(Self::new(Topic::new(topic)?, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xiron_types::{RobotId, VelocityCommand};

    #[test]
    fn wire_format_puts_topic_first() -> Result<(), Box<dyn std::error::Error>> {
        let cmd = VelocityCommand::unicycle(RobotId::new("robot0")?, 0.25, 0.3);
        let frame = Frame::encode(Topic::new("vel")?, &cmd)?;
        let wire = frame.to_wire();
        assert!(wire.starts_with("vel\n{"));

        let back = Frame::from_wire(&wire)?;
        assert_eq!(back.topic.as_str(), "vel");
        assert_eq!(back.body, frame.body);
        Ok(())
    }

    #[test]
    fn body_may_contain_newlines() -> Result<(), Box<dyn std::error::Error>> {
        let frame = Frame::from_wire("pose\n{\n\"a\": 1\n}")?;
        assert_eq!(frame.topic.as_str(), "pose");
        assert_eq!(&*frame.body, "{\n\"a\": 1\n}");
        Ok(())
    }

    #[test]
    fn missing_separator_is_rejected() {
        assert!(matches!(Frame::from_wire("vel"), Err(BusError::Serialization(_))));
        assert!(matches!(Frame::from_wire("\n{}"), Err(BusError::InvalidTopic(_))));
    }

    #[test]
    fn origin_is_not_on_the_wire() -> Result<(), Box<dyn std::error::Error>> {
        let frame = Frame::new(Topic::new("scan")?, "{}").with_origin(Uuid::new_v4());
        let back = Frame::from_wire(&frame.to_wire())?;
        assert_eq!(back.origin, None);
        Ok(())
    }
}
