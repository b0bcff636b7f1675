//! In-process [`Broker`] with per-subscription queues.
//!
//! Each subscription owns a FIFO queue. Publishing appends a copy of the
//! payload to every subscription on the topic. A registered receiver runs a
//! pump task that hands messages to its handler one at a time. Times come
//! from `tokio::time`, so TTL and idle expiry follow paused test clocks.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use hubmesh_core::broker::{
    Broker, Disposition, MessageHandler, ReceiverHandle, SubscriptionInfo, SubscriptionSpec,
};
use hubmesh_core::errors::BrokerError;

/// Connection string scheme accepted by [`InMemoryBroker::connect`].
pub const MEMORY_SCHEME: &str = "memory://";

#[derive(Clone, Debug)]
pub struct InMemoryBrokerConfig {
    /// Deliveries attempted before an abandoned message is dead-lettered.
    pub max_delivery_count: u32,
}

impl Default for InMemoryBrokerConfig {
    fn default() -> Self {
        Self {
            max_delivery_count: 10,
        }
    }
}

type SubKey = (String, String);

struct Queued {
    payload: Bytes,
    enqueued_at: Instant,
    delivery_count: u32,
}

struct Subscription {
    spec: SubscriptionSpec,
    queue: VecDeque<Queued>,
    notify: Arc<Notify>,
    /// Id of the attached receiver, if any.
    receiver: Option<u64>,
    receiver_cancel: Option<CancellationToken>,
    last_activity: Instant,
}

impl Subscription {
    fn new(spec: SubscriptionSpec, now: Instant) -> Self {
        Self {
            spec,
            queue: VecDeque::new(),
            notify: Arc::new(Notify::new()),
            receiver: None,
            receiver_cancel: None,
            last_activity: now,
        }
    }

    /// Drop messages older than the TTL. Returns how many were dropped.
    fn purge_expired(&mut self, now: Instant) -> u64 {
        let ttl = self.spec.message_ttl;
        let before = self.queue.len();
        self.queue.retain(|m| now.duration_since(m.enqueued_at) < ttl);
        (before - self.queue.len()) as u64
    }

    fn is_idle(&self, now: Instant) -> bool {
        self.receiver.is_none()
            && now.duration_since(self.last_activity) >= self.spec.idle_auto_delete
    }

    fn info(&self) -> SubscriptionInfo {
        SubscriptionInfo {
            topic: self.spec.topic.clone(),
            name: self.spec.name.clone(),
            idle_auto_delete: self.spec.idle_auto_delete,
            message_ttl: self.spec.message_ttl,
            pending: self.queue.len(),
        }
    }
}

enum Next {
    Message(Queued),
    Empty,
    Gone,
}

struct Shared {
    config: InMemoryBrokerConfig,
    subscriptions: Mutex<HashMap<SubKey, Subscription>>,
    offline: AtomicBool,
    next_receiver: AtomicU64,
    published: AtomicU64,
    expired: AtomicU64,
    dead_lettered: AtomicU64,
}

impl Shared {
    fn check_online(&self) -> Result<(), BrokerError> {
        if self.offline.load(Ordering::Acquire) {
            Err(BrokerError::Unavailable("broker is offline".into()))
        } else {
            Ok(())
        }
    }

    fn sweep_idle(&self) -> usize {
        let now = Instant::now();
        let mut subs = self.subscriptions.lock();
        let before = subs.len();
        subs.retain(|(topic, name), sub| {
            let idle = sub.is_idle(now);
            if idle {
                debug!(topic = %topic, subscription = %name, "subscription idle, auto-deleting");
            }
            !idle
        });
        before - subs.len()
    }

    fn take_next(&self, key: &SubKey) -> Next {
        let now = Instant::now();
        let mut subs = self.subscriptions.lock();
        let Some(sub) = subs.get_mut(key) else {
            return Next::Gone;
        };
        let expired = sub.purge_expired(now);
        if expired > 0 {
            self.expired.fetch_add(expired, Ordering::Relaxed);
        }
        match sub.queue.pop_front() {
            Some(msg) => Next::Message(msg),
            None => Next::Empty,
        }
    }

    fn requeue(&self, key: &SubKey, mut msg: Queued) {
        msg.delivery_count += 1;
        if msg.delivery_count >= self.config.max_delivery_count {
            warn!(
                topic = %key.0,
                subscription = %key.1,
                deliveries = msg.delivery_count,
                "message exceeded max delivery count, dead-lettering"
            );
            self.dead_lettered.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if let Some(sub) = self.subscriptions.lock().get_mut(key) {
            sub.queue.push_front(msg);
            sub.notify.notify_one();
        }
    }

    fn detach(&self, key: &SubKey, receiver_id: u64) {
        if let Some(sub) = self.subscriptions.lock().get_mut(key) {
            if sub.receiver == Some(receiver_id) {
                sub.receiver = None;
                sub.receiver_cancel = None;
                sub.last_activity = Instant::now();
            }
        }
    }
}

/// Broker living entirely inside this process. Clones share state, so every
/// node of an in-process cluster can hold its own handle.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_config(InMemoryBrokerConfig::default())
    }

    pub fn with_config(config: InMemoryBrokerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                subscriptions: Mutex::new(HashMap::new()),
                offline: AtomicBool::new(false),
                next_receiver: AtomicU64::new(1),
                published: AtomicU64::new(0),
                expired: AtomicU64::new(0),
                dead_lettered: AtomicU64::new(0),
            }),
        }
    }

    /// Open a broker from a `memory://` connection string.
    ///
    /// Every call returns a new, empty broker; the part after the scheme is
    /// not used to look up an existing one. Nodes that should share a topic
    /// must share one broker through [`Clone`].
    pub fn connect(connection_string: &str) -> Result<Self, BrokerError> {
        if !connection_string.starts_with(MEMORY_SCHEME) {
            return Err(BrokerError::Unavailable(format!(
                "unsupported connection string '{connection_string}', expected {MEMORY_SCHEME}..."
            )));
        }
        Ok(Self::new())
    }

    /// Simulate a transport outage. While offline every operation fails with
    /// [`BrokerError::Unavailable`] and receivers report it once through
    /// [`MessageHandler::on_error`].
    pub fn set_offline(&self, offline: bool) {
        self.shared.offline.store(offline, Ordering::Release);
        let subs = self.shared.subscriptions.lock();
        for sub in subs.values() {
            sub.notify.notify_one();
        }
    }

    pub fn is_offline(&self) -> bool {
        self.shared.offline.load(Ordering::Acquire)
    }

    /// Delete every subscription that has been without a receiver for its
    /// idle window. Also runs before each broker operation.
    pub fn sweep_idle(&self) -> usize {
        self.shared.sweep_idle()
    }

    pub fn subscription_count(&self) -> usize {
        self.shared.subscriptions.lock().len()
    }

    pub fn has_subscription(&self, topic: &str, name: &str) -> bool {
        self.shared
            .subscriptions
            .lock()
            .contains_key(&(topic.to_string(), name.to_string()))
    }

    pub fn published_count(&self) -> u64 {
        self.shared.published.load(Ordering::Relaxed)
    }

    pub fn expired_count(&self) -> u64 {
        self.shared.expired.load(Ordering::Relaxed)
    }

    pub fn dead_letter_count(&self) -> u64 {
        self.shared.dead_lettered.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError> {
        self.shared.check_online()?;
        self.shared.sweep_idle();

        let now = Instant::now();
        let mut expired = 0;
        let mut fanout = 0usize;
        {
            let mut subs = self.shared.subscriptions.lock();
            for sub in subs.values_mut().filter(|s| s.spec.topic == topic) {
                expired += sub.purge_expired(now);
                sub.queue.push_back(Queued {
                    payload: payload.clone(),
                    enqueued_at: now,
                    delivery_count: 0,
                });
                sub.notify.notify_one();
                fanout += 1;
            }
        }
        if expired > 0 {
            self.shared.expired.fetch_add(expired, Ordering::Relaxed);
        }
        self.shared.published.fetch_add(1, Ordering::Relaxed);
        debug!(topic, subscriptions = fanout, bytes = payload.len(), "published");
        Ok(())
    }

    async fn get_subscription(
        &self,
        topic: &str,
        name: &str,
    ) -> Result<Option<SubscriptionInfo>, BrokerError> {
        self.shared.check_online()?;
        self.shared.sweep_idle();

        let now = Instant::now();
        let mut subs = self.shared.subscriptions.lock();
        let key = (topic.to_string(), name.to_string());
        Ok(subs.get_mut(&key).map(|sub| {
            let expired = sub.purge_expired(now);
            if expired > 0 {
                self.shared.expired.fetch_add(expired, Ordering::Relaxed);
            }
            sub.info()
        }))
    }

    async fn create_subscription(&self, spec: &SubscriptionSpec) -> Result<(), BrokerError> {
        self.shared.check_online()?;
        self.shared.sweep_idle();

        let key = (spec.topic.clone(), spec.name.clone());
        let mut subs = self.shared.subscriptions.lock();
        if subs.contains_key(&key) {
            return Err(BrokerError::SubscriptionExists {
                topic: spec.topic.clone(),
                name: spec.name.clone(),
            });
        }
        subs.insert(key, Subscription::new(spec.clone(), Instant::now()));
        debug!(topic = %spec.topic, subscription = %spec.name, "subscription created");
        Ok(())
    }

    async fn delete_subscription(&self, topic: &str, name: &str) -> Result<(), BrokerError> {
        self.shared.check_online()?;

        let key = (topic.to_string(), name.to_string());
        let removed = self.shared.subscriptions.lock().remove(&key);
        match removed {
            Some(sub) => {
                if let Some(cancel) = sub.receiver_cancel {
                    cancel.cancel();
                }
                debug!(topic, subscription = name, dropped = sub.queue.len(), "subscription deleted");
                Ok(())
            }
            None => Err(BrokerError::SubscriptionNotFound {
                topic: topic.to_string(),
                name: name.to_string(),
            }),
        }
    }

    async fn register_receiver(
        &self,
        topic: &str,
        name: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Box<dyn ReceiverHandle>, BrokerError> {
        self.shared.check_online()?;
        self.shared.sweep_idle();

        let key = (topic.to_string(), name.to_string());
        let receiver_id = self.shared.next_receiver.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let notify = {
            let mut subs = self.shared.subscriptions.lock();
            let Some(sub) = subs.get_mut(&key) else {
                return Err(BrokerError::SubscriptionNotFound {
                    topic: topic.to_string(),
                    name: name.to_string(),
                });
            };
            if sub.receiver.is_some() {
                return Err(BrokerError::Transport(format!(
                    "subscription '{name}' already has a receiver"
                )));
            }
            sub.receiver = Some(receiver_id);
            sub.receiver_cancel = Some(cancel.clone());
            sub.notify.clone()
        };

        let task = tokio::spawn(pump(
            self.shared.clone(),
            key.clone(),
            receiver_id,
            handler,
            cancel.clone(),
            notify,
        ));
        debug!(topic, subscription = name, receiver_id, "receiver registered");

        Ok(Box::new(InMemoryReceiver {
            shared: self.shared.clone(),
            key,
            receiver_id,
            cancel,
            task: Some(task),
        }))
    }
}

async fn pump(
    shared: Arc<Shared>,
    key: SubKey,
    receiver_id: u64,
    handler: Arc<dyn MessageHandler>,
    cancel: CancellationToken,
    notify: Arc<Notify>,
) {
    let mut reported_offline = false;
    loop {
        if cancel.is_cancelled() {
            break;
        }

        if shared.offline.load(Ordering::Acquire) {
            if !reported_offline {
                handler.on_error(&BrokerError::Unavailable("broker is offline".into()));
                reported_offline = true;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = notify.notified() => continue,
            }
        }
        reported_offline = false;

        let msg = match shared.take_next(&key) {
            Next::Message(msg) => msg,
            Next::Empty => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = notify.notified() => continue,
                }
            }
            Next::Gone => break,
        };

        let disposition = handler.on_message(msg.payload.clone(), cancel.clone()).await;
        if disposition == Disposition::Abandon {
            shared.requeue(&key, msg);
        }
    }
    shared.detach(&key, receiver_id);
    debug!(topic = %key.0, subscription = %key.1, receiver_id, "receiver stopped");
}

/// Handle returned by [`InMemoryBroker::register_receiver`].
///
/// Dropping it without `close` frees the subscription's receiver slot at once
/// and cancels the pump without waiting for it. A handler call already in
/// flight sees its token cancelled and may still return `Abandon`, which
/// requeues the message for the next receiver.
pub struct InMemoryReceiver {
    shared: Arc<Shared>,
    key: SubKey,
    receiver_id: u64,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

#[async_trait]
impl ReceiverHandle for InMemoryReceiver {
    async fn close(&mut self) -> Result<(), BrokerError> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        self.cancel.cancel();
        task.await
            .map_err(|e| BrokerError::Transport(format!("receiver task failed: {e}")))
    }

    fn is_closed(&self) -> bool {
        self.task.is_none()
    }
}

impl Drop for InMemoryReceiver {
    fn drop(&mut self) {
        self.cancel.cancel();
        if self.task.is_some() {
            self.shared.detach(&self.key, self.receiver_id);
        }
    }
}
