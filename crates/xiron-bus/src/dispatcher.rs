//! Background delivery of telemetry to per-robot callbacks.
//!
//! Each [`Dispatcher::subscribe`] call starts one Tokio task that owns its
//! own topic receiver and feeds decoded entities to the caller's callback.
//!
//! # Delivery modes
//!
//! * [`DeliveryMode::Push`] (the default) – the callback fires once per
//!   received message, in arrival order, as soon as it arrives.
//! * [`DeliveryMode::Poll`] – every `1 / frequency_hz` seconds the task asks a
//!   [`QuerySource`] for the latest value, using the subscribed topic as the
//!   method name (e.g. `GetPose`).
//!
//! # Lifecycle
//!
//! ```text
//! Created ──start──▶ Running ──cancel──▶ Stopped
//!                       │
//!                       └──unrecoverable error──▶ Failed
//! ```
//!
//! A failed subscription is never restarted automatically; poll errors are
//! first retried with exponential backoff per [`RetryPolicy`]. The owner
//! learns the outcome from [`SubscriptionHandle::state`] or
//! [`SubscriptionHandle::wait`]. Re-subscribing the same (robot, topic) pair
//! replaces a terminal entry.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use xiron_types::{BusError, BusMessage, RobotId, Topic, TransportError};

use crate::broker::{Broker, TopicReceiver};
use crate::config::{BusConfig, RetryPolicy};
use crate::rpc::{QuerySource, RpcClient};

/// How a subscription obtains its messages.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum DeliveryMode {
    #[default]
    Push,
    Poll { frequency_hz: f64 },
}

impl DeliveryMode {
    fn validate(self) -> Result<(), BusError> {
        match self {
            DeliveryMode::Poll { frequency_hz } if !(frequency_hz.is_finite() && frequency_hz > 0.0) => {
                Err(BusError::InvalidFrequency(frequency_hz))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionState {
    Created,
    Running,
    Stopped,
    Failed(BusError),
}

impl SubscriptionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubscriptionState::Stopped | SubscriptionState::Failed(_))
    }
}

/// Counters describing what a subscription has seen so far.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SubscriptionStats {
    /// Callback invocations.
    pub delivered: u64,
    /// Messages dropped because they did not decode.
    pub malformed: u64,
    /// Messages lost because the subscriber fell behind.
    pub lagged: u64,
    /// Poll queries that failed.
    pub failed_queries: u64,
    pub last_error: Option<BusError>,
}

#[derive(Default)]
struct StatsCell {
    delivered: AtomicU64,
    malformed: AtomicU64,
    lagged: AtomicU64,
    failed_queries: AtomicU64,
    last_error: Mutex<Option<BusError>>,
}

impl StatsCell {
    fn snapshot(&self) -> SubscriptionStats {
        SubscriptionStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            lagged: self.lagged.load(Ordering::Relaxed),
            failed_queries: self.failed_queries.load(Ordering::Relaxed),
            last_error: self.last_error.lock().clone(),
        }
    }

    fn record(&self, counter: &AtomicU64, error: BusError) {
        counter.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock() = Some(error);
    }
}

/// State shared between a subscription task, its handles, and the registry.
struct Shared {
    robot_id: RobotId,
    topic: Topic,
    mode: DeliveryMode,
    state: watch::Sender<SubscriptionState>,
    cancel: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    stats: StatsCell,
}

impl Shared {
    async fn stop(&self) {
        self.cancel.send_replace(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(robot = %self.robot_id, topic = %self.topic, error = %e, "subscription task aborted");
            }
        }
        // Cancelled before the task ever ran.
        self.state.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = SubscriptionState::Stopped;
                true
            }
        });
    }
}

/// Caller-side view of one subscription. Clones refer to the same
/// subscription; dropping every handle does not stop it.
#[derive(Clone)]
pub struct SubscriptionHandle {
    shared: Arc<Shared>,
}

impl SubscriptionHandle {
    pub fn robot_id(&self) -> &RobotId {
        &self.shared.robot_id
    }

    pub fn topic(&self) -> &Topic {
        &self.shared.topic
    }

    pub fn mode(&self) -> DeliveryMode {
        self.shared.mode
    }

    pub fn state(&self) -> SubscriptionState {
        self.shared.state.borrow().clone()
    }

    pub fn stats(&self) -> SubscriptionStats {
        self.shared.stats.snapshot()
    }

    /// Wait until the subscription is `Stopped` or `Failed`.
    pub async fn wait(&self) -> SubscriptionState {
        let mut rx = self.shared.state.subscribe();
        // The sender lives in `shared`, which we hold, so this cannot fail.
        match rx.wait_for(SubscriptionState::is_terminal).await {
            Ok(state) => (*state).clone(),
            Err(_) => self.state(),
        }
    }

    /// Stop delivery and wait for the task to release its receiver.
    ///
    /// Idempotent. Callbacks stop within one polling interval.
    pub async fn cancel(&self) {
        self.shared.stop().await;
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("robot_id", &self.shared.robot_id)
            .field("topic", &self.shared.topic)
            .field("mode", &self.shared.mode)
            .field("state", &*self.shared.state.borrow())
            .finish()
    }
}

/// Registry entry as reported by [`Dispatcher::subscriptions`].
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionInfo {
    pub robot_id: RobotId,
    pub topic: Topic,
    pub mode: DeliveryMode,
    pub state: SubscriptionState,
}

type Registry = HashMap<(RobotId, Topic), Arc<Shared>>;

/// Owns every subscription it starts. Dropping it signals all of them to
/// stop; call [`Dispatcher::shutdown`] to also wait for their exit.
pub struct Dispatcher {
    broker: Broker,
    source: Arc<dyn QuerySource>,
    retry: RetryPolicy,
    query_timeout: Duration,
    registry: Mutex<Registry>,
}

impl Dispatcher {
    /// Dispatcher with the default retry policy that polls over the broker's
    /// own RPC primitive.
    pub fn new(broker: Broker) -> Self {
        let source = Arc::new(RpcClient::new(broker.clone()));
        Self {
            broker,
            source,
            retry: RetryPolicy::default(),
            query_timeout: BusConfig::default().rpc_timeout(),
            registry: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(broker: Broker, config: &BusConfig) -> Self {
        Self::new(broker)
            .with_retry(config.retry.clone())
            .with_query_timeout(config.rpc_timeout())
    }

    /// Override where poll-mode subscriptions fetch values from.
    pub fn with_source(mut self, source: Arc<dyn QuerySource>) -> Self {
        self.source = source;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Start delivering `T` values for `robot_id` on `topic` to `callback`.
    ///
    /// The callback only ever sees successfully decoded entities whose robot
    /// id equals `robot_id`; batched velocity commands are split. In push mode
    /// the topic receiver is registered before this returns, so anything
    /// published afterwards is delivered.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// * [`BusError::InvalidFrequency`] for a non-positive poll frequency.
    /// * [`BusError::AlreadySubscribed`] if the pair has a live subscription.
    pub fn subscribe<T, F>(
        &self,
        robot_id: RobotId,
        topic: Topic,
        mode: DeliveryMode,
        callback: F,
    ) -> Result<SubscriptionHandle, BusError>
    where
        T: BusMessage,
        F: FnMut(T) + Send + 'static,
    {
        mode.validate()?;

        let mut registry = self.registry.lock();
        let key = (robot_id.clone(), topic.clone());
        if let Some(existing) = registry.get(&key) {
            if !existing.state.borrow().is_terminal() {
                return Err(BusError::AlreadySubscribed { robot_id, topic });
            }
        }

        let (cancel, cancel_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            robot_id,
            topic,
            mode,
            state: watch::channel(SubscriptionState::Created).0,
            cancel,
            task: Mutex::new(None),
            stats: StatsCell::default(),
        });

        let worker = Worker {
            shared: Arc::clone(&shared),
            cancel: cancel_rx,
            callback,
            _entity: std::marker::PhantomData::<fn(T)>,
        };
        let task = match mode {
            DeliveryMode::Push => {
                let receiver = self.broker.subscribe(&shared.topic);
                tokio::spawn(worker.supervise(|w| w.run_push(receiver).boxed()))
            }
            DeliveryMode::Poll { frequency_hz } => {
                let poll = PollParams {
                    period: Duration::from_secs_f64(1.0 / frequency_hz),
                    source: Arc::clone(&self.source),
                    retry: self.retry.clone(),
                    timeout: self.query_timeout,
                };
                tokio::spawn(worker.supervise(|w| w.run_poll(poll).boxed()))
            }
        };
        *shared.task.lock() = Some(task);

        info!(robot = %shared.robot_id, topic = %shared.topic, ?mode, "subscribed");
        registry.insert(key, Arc::clone(&shared));
        Ok(SubscriptionHandle { shared })
    }

    /// Cancel the subscription for (`robot_id`, `topic`), if any.
    ///
    /// Idempotent: returns `false` when nothing was registered. Returns once
    /// the task has exited and released its transport handle.
    pub async fn unsubscribe(&self, robot_id: &RobotId, topic: &Topic) -> bool {
        let removed = self
            .registry
            .lock()
            .remove(&(robot_id.clone(), topic.clone()));
        match removed {
            Some(shared) => {
                shared.stop().await;
                info!(robot = %robot_id, topic = %topic, "unsubscribed");
                true
            }
            None => false,
        }
    }

    /// Every registered subscription, including ones that already failed.
    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        let mut infos: Vec<SubscriptionInfo> = self
            .registry
            .lock()
            .values()
            .map(|shared| SubscriptionInfo {
                robot_id: shared.robot_id.clone(),
                topic: shared.topic.clone(),
                mode: shared.mode,
                state: shared.state.borrow().clone(),
            })
            .collect();
        infos.sort_by(|a, b| (&a.robot_id, &a.topic).cmp(&(&b.robot_id, &b.topic)));
        infos
    }

    /// Stop every subscription and wait for all of them to exit.
    pub async fn shutdown(&self) {
        let drained: Vec<Arc<Shared>> = self.registry.lock().drain().map(|(_, s)| s).collect();
        for shared in drained {
            shared.stop().await;
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        for shared in self.registry.get_mut().values() {
            shared.cancel.send_replace(true);
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct PollParams {
    period: Duration,
    source: Arc<dyn QuerySource>,
    retry: RetryPolicy,
    timeout: Duration,
}

struct Worker<T, F> {
    shared: Arc<Shared>,
    cancel: watch::Receiver<bool>,
    callback: F,
    _entity: std::marker::PhantomData<fn(T)>,
}

impl<T, F> Worker<T, F>
where
    T: BusMessage,
    F: FnMut(T) + Send + 'static,
{
    /// Run `body` and publish its outcome as the terminal state. A panicking
    /// callback fails the subscription instead of leaving it `Running`.
    async fn supervise<B>(mut self, body: B)
    where
        B: for<'a> FnOnce(&'a mut Self) -> futures_util::future::BoxFuture<'a, SubscriptionState>,
    {
        let started = self.shared.state.send_if_modified(|state| {
            if *state == SubscriptionState::Created {
                *state = SubscriptionState::Running;
                true
            } else {
                false
            }
        });
        if !started || *self.cancel.borrow() {
            self.shared.state.send_replace(SubscriptionState::Stopped);
            return;
        }

        let shared = Arc::clone(&self.shared);
        let outcome = AssertUnwindSafe(body(&mut self)).catch_unwind().await;
        let terminal = outcome.unwrap_or_else(|_| {
            SubscriptionState::Failed(BusError::SubscriptionFailure {
                robot_id: shared.robot_id.clone(),
                topic: shared.topic.clone(),
                attempts: 0,
                last_error: "callback panicked".to_string(),
            })
        });

        match &terminal {
            SubscriptionState::Failed(e) => {
                error!(robot = %shared.robot_id, topic = %shared.topic, error = %e, "subscription failed");
            }
            _ => debug!(robot = %shared.robot_id, topic = %shared.topic, "subscription stopped"),
        }
        shared.state.send_replace(terminal);
    }

    async fn run_push(&mut self, mut receiver: TopicReceiver) -> SubscriptionState {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.changed() => return SubscriptionState::Stopped,
                msg = receiver.recv() => match msg {
                    Ok(frame) => {
                        // Other robots' messages share the topic; zero matches is normal.
                        let _ = self.deliver(&frame.body);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        self.shared.stats.lagged.fetch_add(n, Ordering::Relaxed);
                        warn!(robot = %self.shared.robot_id, topic = %self.shared.topic, lagged_by = n, "subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return SubscriptionState::Failed(TransportError::Closed.into());
                    }
                }
            }
        }
    }

    async fn run_poll(&mut self, poll: PollParams) -> SubscriptionState {
        let mut ticker = tokio::time::interval(poll.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let method = self.shared.topic.as_str().to_string();
        let mut failures: u32 = 0;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.changed() => return SubscriptionState::Stopped,
                _ = ticker.tick() => {}
            }

            let result = tokio::select! {
                biased;
                _ = self.cancel.changed() => return SubscriptionState::Stopped,
                result = poll.source.query(&method, &self.shared.robot_id, poll.timeout) => result,
            };

            // A reply must carry at least one entity for our robot.
            let result = result.and_then(|body| match self.deliver(&body)? {
                0 => Err(TransportError::Remote(format!(
                    "reply carried no entity for {}",
                    self.shared.robot_id
                ))
                .into()),
                n => Ok(n),
            });

            match result {
                Ok(_) => failures = 0,
                Err(e) => {
                    failures += 1;
                    let stats = &self.shared.stats;
                    stats.record(&stats.failed_queries, e.clone());
                    if failures > poll.retry.max_retries {
                        return SubscriptionState::Failed(BusError::SubscriptionFailure {
                            robot_id: self.shared.robot_id.clone(),
                            topic: self.shared.topic.clone(),
                            attempts: failures,
                            last_error: e.to_string(),
                        });
                    }
                    let backoff = poll.retry.backoff(failures);
                    warn!(
                        robot = %self.shared.robot_id,
                        topic = %self.shared.topic,
                        attempt = failures,
                        ?backoff,
                        error = %e,
                        "poll query failed, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = self.cancel.changed() => return SubscriptionState::Stopped,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
    }

    /// Decode `body` and hand every entity for our robot to the callback.
    /// Returns how many reached it; a body that does not decode is counted
    /// as malformed and returned as the error.
    fn deliver(&mut self, body: &str) -> Result<usize, BusError> {
        let items = match T::decode_all(body) {
            Ok(items) => items,
            Err(e) => {
                warn!(robot = %self.shared.robot_id, topic = %self.shared.topic, error = %e, "dropping malformed message");
                let stats = &self.shared.stats;
                stats.record(&stats.malformed, e.clone());
                return Err(e);
            }
        };
        let mut delivered = 0;
        for item in items {
            if item.robot_id() == &self.shared.robot_id {
                (self.callback)(item);
                self.shared.stats.delivered.fetch_add(1, Ordering::Relaxed);
                delivered += 1;
            }
        }
        Ok(delivered)
    }
}
