//! Request/response over the bus.
//!
//! A call publishes a [`RequestEnvelope`] on the method topic `rpc/<method>`
//! and waits on a private reply topic for the matching [`ReplyEnvelope`].
//! Because both legs are ordinary frames, calls work unchanged across a
//! [`WsLink`](crate::bridge::WsLink).
//!
//! | Method | Request | Response |
//! |---|---|---|
//! | [`GET_POSE`] | [`PoseRequest`] | [`Pose`](xiron_types::Pose) |
//! | [`GET_SCAN`] | [`PoseRequest`] | [`LaserScan`](xiron_types::LaserScan) |

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};
use uuid::Uuid;
use xiron_types::{BusError, PoseRequest, RobotId, Topic, TransportError};

use crate::broker::Broker;
use crate::frame::Frame;

pub const GET_POSE: &str = "GetPose";
pub const GET_SCAN: &str = "GetScan";

/// Topic a method's requests are published on.
pub fn method_topic(method: &str) -> Result<Topic, BusError> {
    Topic::new(format!("rpc/{method}"))
}

#[derive(Debug, Serialize, Deserialize)]
struct RequestEnvelope {
    call_id: Uuid,
    reply_to: Topic,
    body: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct ReplyEnvelope {
    call_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ok: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct RpcClient {
    broker: Broker,
}

impl RpcClient {
    pub fn new(broker: Broker) -> Self {
        Self { broker }
    }

    /// Call `method` and wait up to `timeout` for its reply.
    ///
    /// # Errors
    ///
    /// * [`TransportError::Timeout`] when no reply arrives in time, including
    ///   when nobody serves the method.
    /// * [`TransportError::Remote`] when the responder reported an error.
    /// * [`BusError::Serialization`] when the reply does not decode as `Resp`.
    #[instrument(skip(self, request))]
    pub async fn call<Req, Resp>(
        &self,
        method: &str,
        request: &Req,
        timeout: Duration,
    ) -> Result<Resp, BusError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let call_id = Uuid::new_v4();
        let reply_to = Topic::new(format!("rpc/reply/{call_id}"))?;
        // Subscribe before sending so a fast responder cannot beat us.
        let mut replies = self.broker.subscribe(&reply_to);

        let envelope = RequestEnvelope {
            call_id,
            reply_to,
            body: serde_json::to_value(request)?,
        };
        let handed = self.broker.publish(Frame::encode(method_topic(method)?, &envelope)?);
        debug!(%call_id, handed, "request published");

        let wait = async {
            loop {
                match replies.recv().await {
                    Ok(frame) => match serde_json::from_str::<ReplyEnvelope>(&frame.body) {
                        Ok(reply) if reply.call_id == call_id => return Ok(reply),
                        Ok(_) => continue,
                        Err(e) => {
                            warn!(%call_id, error = %e, "discarding malformed reply");
                            continue;
                        }
                    },
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(BusError::Transport(TransportError::Closed));
                    }
                }
            }
        };

        let reply = tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| TransportError::Timeout(timeout))??;

        match (reply.ok, reply.error) {
            (_, Some(error)) => Err(TransportError::Remote(error).into()),
            (Some(value), None) => Ok(serde_json::from_value(value)?),
            (None, None) => Err(BusError::Serialization("reply carries neither ok nor error".to_string())),
        }
    }
}

/// Where poll-mode subscriptions fetch the latest value from.
///
/// Returns the raw JSON body so the subscriber decides how to parse it.
#[async_trait]
pub trait QuerySource: Send + Sync {
    async fn query(&self, method: &str, robot_id: &RobotId, timeout: Duration) -> Result<String, BusError>;
}

#[async_trait]
impl QuerySource for RpcClient {
    async fn query(&self, method: &str, robot_id: &RobotId, timeout: Duration) -> Result<String, BusError> {
        let request = PoseRequest { id: robot_id.clone() };
        let value: serde_json::Value = self.call(method, &request, timeout).await?;
        Ok(value.to_string())
    }
}

// ---------------------------------------------------------------------------
// Responder
// ---------------------------------------------------------------------------

/// Serves one method on the bus until shut down or dropped.
pub struct RpcResponder {
    method: String,
    cancel: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl RpcResponder {
    /// Start answering `method` with `handler`.
    ///
    /// The method topic is subscribed before this returns, so requests sent
    /// afterwards are never missed. A handler `Err` is sent back to the
    /// caller as [`TransportError::Remote`].
    pub fn serve<Req, Resp, F>(broker: Broker, method: &str, handler: F) -> Result<Self, BusError>
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> Result<Resp, String> + Send + Sync + 'static,
    {
        let mut requests = broker.subscribe(&method_topic(method)?);
        let (cancel, mut cancel_rx) = watch::channel(false);
        let name = method.to_string();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_rx.changed() => break,
                    msg = requests.recv() => match msg {
                        Ok(frame) => answer(&broker, &name, &frame, &handler),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(method = %name, lagged_by = n, "responder lagged, requests lost");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            debug!(method = %name, "responder stopped");
        });

        Ok(Self {
            method: method.to_string(),
            cancel,
            task: Some(task),
        })
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Stop serving and wait for the task to release its subscription.
    pub async fn shutdown(mut self) {
        self.cancel.send_replace(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for RpcResponder {
    fn drop(&mut self) {
        self.cancel.send_replace(true);
    }
}

fn answer<Req, Resp, F>(broker: &Broker, method: &str, frame: &Frame, handler: &F)
where
    Req: DeserializeOwned,
    Resp: Serialize,
    F: Fn(Req) -> Result<Resp, String>,
{
    let envelope: RequestEnvelope = match serde_json::from_str(&frame.body) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(method, error = %e, "discarding malformed request");
            return;
        }
    };

    let outcome = serde_json::from_value::<Req>(envelope.body)
        .map_err(|e| format!("bad request: {e}"))
        .and_then(handler)
        .and_then(|resp| serde_json::to_value(resp).map_err(|e| e.to_string()));

    let (ok, error) = match outcome {
        Ok(value) => (Some(value), None),
        Err(e) => (None, Some(e)),
    };
    let reply = ReplyEnvelope {
        call_id: envelope.call_id,
        ok,
        error,
    };
    match Frame::encode(envelope.reply_to, &reply) {
        Ok(frame) => {
            broker.publish(frame);
        }
        Err(e) => warn!(method, error = %e, "failed to encode reply"),
    }
}
