//! `xiron-types` – shared vocabulary of the Xiron telemetry/command bus.
//!
//! Every value that crosses the bus is defined here: the routing [`Topic`],
//! the opaque [`RobotId`], the command and telemetry entities, and the
//! [`BusError`] family returned by every fallible bus operation.

use std::fmt;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum byte length of a [`Topic`] tag.
pub const MAX_TOPIC_LEN: usize = 255;

// ─────────────────────────────────────────────────────────────────────────────
// Identifiers
// ─────────────────────────────────────────────────────────────────────────────

/// Opaque identifier of a simulated robot (e.g. `"robot0"`).
///
/// Identifiers are caller-supplied; the only rule the bus enforces is that
/// they are non-empty, both at construction and when decoded off the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RobotId(String);

impl RobotId {
    pub fn new(id: impl Into<String>) -> Result<Self, BusError> {
        let id = id.into();
        if id.is_empty() {
            return Err(BusError::InvalidRobotId);
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RobotId {
    type Error = BusError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RobotId> for String {
    fn from(id: RobotId) -> Self {
        id.0
    }
}

impl fmt::Display for RobotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Routing tag scoping which messages a subscriber receives.
///
/// Matching is exact: a subscriber on `"pose"` never sees `"pose/robot0"`.
/// A topic is framed ahead of the JSON body on the wire, so it may not
/// contain a newline and is capped at [`MAX_TOPIC_LEN`] bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Topic(String);

impl Topic {
    pub fn new(tag: impl Into<String>) -> Result<Self, BusError> {
        let tag = tag.into();
        if tag.is_empty() {
            return Err(BusError::InvalidTopic("topic must not be empty".to_string()));
        }
        if tag.len() > MAX_TOPIC_LEN {
            return Err(BusError::InvalidTopic(format!(
                "topic is {} bytes, exceeding the limit of {MAX_TOPIC_LEN}",
                tag.len()
            )));
        }
        if tag.contains('\n') {
            return Err(BusError::InvalidTopic(format!("topic {tag:?} contains a newline")));
        }
        Ok(Self(tag))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Topic {
    type Error = BusError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Topic> for String {
    fn from(topic: Topic) -> Self {
        topic.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Entities
// ─────────────────────────────────────────────────────────────────────────────

/// A commanded linear + angular velocity for one robot.
///
/// Commands are not queued anywhere on the bus; the simulator treats the
/// latest command for a robot as its current intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VelocityCommand {
    pub robot_id: RobotId,
    /// Linear velocity `(x, y)` in m/s.
    pub linear: (f64, f64),
    /// Angular velocity in rad/s.
    pub angular: f64,
}

impl VelocityCommand {
    /// Differential-drive command: forward speed `v`, turn rate `w`.
    pub fn unicycle(robot_id: RobotId, v: f64, w: f64) -> Self {
        Self {
            robot_id,
            linear: (v, 0.0),
            angular: w,
        }
    }
}

/// Several velocity commands published as one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VelocityBatch {
    pub commands: Vec<VelocityCommand>,
}

/// A robot's reported position and heading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub robot_id: RobotId,
    pub position: (f64, f64),
    /// Heading in radians.
    pub orientation: f64,
}

/// A robot's range-sensor sweep.
///
/// `values.len() == count` is the producer's responsibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaserScan {
    pub robot_id: RobotId,
    pub angle_min: f64,
    pub angle_max: f64,
    pub count: usize,
    pub values: Vec<f64>,
}

/// Body of the `GetPose` and `GetScan` queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseRequest {
    pub id: RobotId,
}

// ─────────────────────────────────────────────────────────────────────────────
// Decoding contract
// ─────────────────────────────────────────────────────────────────────────────

/// An entity a subscriber can receive.
///
/// `decode_all` turns one message body into the entities it carries, so that
/// batched payloads can fan out to per-robot callbacks.
pub trait BusMessage: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn robot_id(&self) -> &RobotId;

    fn decode_all(body: &str) -> Result<Vec<Self>, BusError> {
        Ok(vec![serde_json::from_str(body)?])
    }
}

impl BusMessage for VelocityCommand {
    fn robot_id(&self) -> &RobotId {
        &self.robot_id
    }

    /// Accepts either a single command or a [`VelocityBatch`].
    fn decode_all(body: &str) -> Result<Vec<Self>, BusError> {
        let value: serde_json::Value = serde_json::from_str(body)?;
        if value.get("commands").is_some() {
            let batch: VelocityBatch = serde_json::from_value(value)?;
            Ok(batch.commands)
        } else {
            Ok(vec![serde_json::from_value(value)?])
        }
    }
}

impl BusMessage for Pose {
    fn robot_id(&self) -> &RobotId {
        &self.robot_id
    }
}

impl BusMessage for LaserScan {
    fn robot_id(&self) -> &RobotId {
        &self.robot_id
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Failure of the underlying transport: connect, send, receive, or timeout.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport closed")]
    Closed,

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("receive failed: {0}")]
    Receive(String),

    #[error("remote call failed: {0}")]
    Remote(String),
}

/// Error type for every fallible bus operation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BusError {
    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("Transport Error: {0}")]
    Transport(#[from] TransportError),

    #[error("Subscription to {topic} for {robot_id} failed after {attempts} attempt(s): {last_error}")]
    SubscriptionFailure {
        robot_id: RobotId,
        topic: Topic,
        attempts: u32,
        last_error: String,
    },

    #[error("robot id must not be empty")]
    InvalidRobotId,

    #[error("Invalid Topic: {0}")]
    InvalidTopic(String),

    #[error("poll frequency must be finite and positive, got {0}")]
    InvalidFrequency(f64),

    #[error("{robot_id} is already subscribed to {topic}")]
    AlreadySubscribed { robot_id: RobotId, topic: Topic },

    #[error("Config Error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for BusError {
    fn from(e: serde_json::Error) -> Self {
        BusError::Serialization(e.to_string())
    }
}
