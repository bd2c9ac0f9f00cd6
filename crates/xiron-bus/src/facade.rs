//! Synchronous command surface over the bus.
//!
//! [`CommandClient`] is a thin adapter: `set_velocity` is a publish on the
//! command topic and the getters are RPC round trips. It owns nothing but its
//! transport handles.

use std::time::Duration;

use xiron_types::{BusError, LaserScan, Pose, PoseRequest, RobotId, Topic, TransportError, VelocityCommand};

use crate::broker::Broker;
use crate::config::BusConfig;
use crate::publisher::Publisher;
use crate::rpc::{GET_POSE, GET_SCAN, RpcClient};

#[derive(Clone, Debug)]
pub struct CommandClient {
    publisher: Publisher,
    rpc: RpcClient,
    command_topic: Topic,
    timeout: Duration,
}

impl CommandClient {
    pub fn new(broker: Broker, command_topic: Topic) -> Self {
        Self {
            publisher: Publisher::new(broker.clone()),
            rpc: RpcClient::new(broker),
            command_topic,
            timeout: BusConfig::default().rpc_timeout(),
        }
    }

    pub fn from_config(broker: Broker, config: &BusConfig) -> Result<Self, BusError> {
        Ok(Self::new(broker, config.command_topic()?).with_timeout(config.rpc_timeout()))
    }

    /// Override the round-trip timeout (builder-style).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Command forward speed `v` (m/s) and turn rate `w` (rad/s).
    ///
    /// Returns once the frame is handed to the transport. There is no
    /// confirmation that the simulator acted on it.
    pub fn set_velocity(&self, robot_id: &RobotId, v: f64, w: f64) -> Result<(), BusError> {
        let command = VelocityCommand::unicycle(robot_id.clone(), v, w);
        self.publisher.publish(&self.command_topic, &command)?;
        Ok(())
    }

    /// Ask the simulator for `robot_id`'s current pose.
    ///
    /// # Errors
    ///
    /// [`TransportError::Timeout`] when nothing answers within the timeout;
    /// [`TransportError::Remote`] when the answer is for a different robot.
    pub async fn get_pose(&self, robot_id: &RobotId) -> Result<Pose, BusError> {
        let request = PoseRequest { id: robot_id.clone() };
        let pose: Pose = self.rpc.call(GET_POSE, &request, self.timeout).await?;
        expect_robot(robot_id, &pose.robot_id)?;
        Ok(pose)
    }

    /// Ask the simulator for `robot_id`'s latest laser scan.
    pub async fn get_scan(&self, robot_id: &RobotId) -> Result<LaserScan, BusError> {
        let request = PoseRequest { id: robot_id.clone() };
        let scan: LaserScan = self.rpc.call(GET_SCAN, &request, self.timeout).await?;
        expect_robot(robot_id, &scan.robot_id)?;
        Ok(scan)
    }
}

fn expect_robot(asked: &RobotId, got: &RobotId) -> Result<(), BusError> {
    if asked == got {
        Ok(())
    } else {
        Err(TransportError::Remote(format!("asked for {asked}, got a reply for {got}")).into())
    }
}
