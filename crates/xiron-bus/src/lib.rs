//! `xiron-bus` – the telemetry/command bus between a control process and the
//! robots of a Xiron simulation.
//!
//! Commands and telemetry are JSON frames routed by exact [`Topic`] match.
//! Delivery is at-most-once: nothing is persisted, and a frame published
//! while nobody listens is dropped.
//!
//! # Modules
//!
//! - [`broker`] – in-process, per-topic broadcast channels.
//! - [`frame`] – topic-tagged frames and their wire text.
//! - [`publisher`] – fire-and-forget publication of entities.
//! - [`dispatcher`] – background subscriptions (push or poll) with an
//!   observable lifecycle.
//! - [`rpc`] – request/response calls expressed as frames.
//! - [`facade`] – `set_velocity` / `get_pose` convenience client.
//! - [`bridge`] – WebSocket transport joining brokers across processes.
//! - [`config`] – [`BusConfig`] and [`RetryPolicy`].
//!
//! [`Topic`]: xiron_types::Topic

pub mod bridge;
pub mod broker;
pub mod config;
pub mod dispatcher;
pub mod facade;
pub mod frame;
pub mod publisher;
pub mod rpc;

pub use bridge::{WsBridge, WsLink};
pub use broker::{Broker, TopicReceiver};
pub use config::{BusConfig, RetryPolicy};
pub use dispatcher::{
    DeliveryMode, Dispatcher, SubscriptionHandle, SubscriptionInfo, SubscriptionState,
    SubscriptionStats,
};
pub use facade::CommandClient;
pub use frame::Frame;
pub use publisher::{Payload, Publisher};
pub use rpc::{GET_POSE, GET_SCAN, QuerySource, RpcClient, RpcResponder};

/// Build a broker sized by `config`.
pub fn broker_from_config(config: &BusConfig) -> Result<Broker, xiron_types::BusError> {
    config.validate()?;
    Ok(Broker::new(config.channel_capacity))
}
