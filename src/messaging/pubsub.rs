//! Subscription manager
//!
//! `BrokerPubSub` wraps a `Transport` and provides the uniform
//! `Publisher`/`Subscriber` contract on top of it:
//! - one broker client handle per subscribing client id, dialed on its first
//!   subscription and closed as soon as its last topic is removed
//! - at most one subscription per (client id, topic)
//! - bounded acknowledgement waits for subscribe/unsubscribe
//! - publish retries on transient broker errors following a `Backoff`
//!
//! Concurrency notes:
//! - The registry lock is only held while looking up, inserting or removing
//!   a client slot. It is never held across a broker round trip.
//! - Each slot has its own async lock, so operations for one client id are
//!   serialized while different clients proceed independently.
//! - Once the slot lock is taken, the broker work runs in a spawned task that
//!   owns the guard. A caller that gives up (session cancelled) therefore
//!   never leaves a half-applied mutation behind.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::messaging::retry::Backoff;
use crate::messaging::transport::{Transport, TransportClient};
use crate::messaging::{Message, MessageHandler, Publisher, Subscriber};
use crate::utils::{BrokerError, MessagingError};

type SlotRef<C> = Arc<AsyncMutex<Slot<C>>>;

struct Slot<C> {
    /// Set once the slot was removed from the registry; holders must look
    /// the client up again.
    retired: bool,
    subscription: Option<Subscription<C>>,
}

struct Subscription<C> {
    client: C,
    topics: HashMap<String, Route>,
}

struct Route {
    handler: Arc<dyn MessageHandler>,
    task: JoinHandle<()>,
}

impl Route {
    fn stop(self, topic: &str) {
        self.task.abort();
        if let Err(err) = self.handler.cancel() {
            warn!("Failed to cancel handler for {topic}: {err}");
        }
    }
}

struct Inner<T: Transport> {
    transport: T,
    timeout: Duration,
    backoff: Backoff,
    registry: Mutex<HashMap<String, SlotRef<T::Client>>>,
    closed: AtomicBool,
}

pub struct BrokerPubSub<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for BrokerPubSub<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> BrokerPubSub<T> {
    pub fn new(transport: T, timeout: Duration, backoff: Backoff) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                timeout,
                backoff,
                registry: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    /// Whether `id` currently holds at least one subscription.
    pub async fn is_registered(&self, id: &str) -> bool {
        let Some((slot, guard)) = self.inner.lock(id, false).await else {
            return false;
        };
        let registered = guard.subscription.is_some();
        self.inner.release(id, &slot, guard);
        registered
    }

    /// Number of client ids with a live entry.
    pub fn clients(&self) -> usize {
        self.inner.registry().len()
    }

    fn ensure_open(&self) -> Result<(), MessagingError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::closed().into());
        }
        Ok(())
    }
}

impl<T: Transport> Inner<T> {
    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<String, SlotRef<T::Client>>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Locks the slot for `id`, creating an empty one when `create` is set.
    async fn lock(
        &self,
        id: &str,
        create: bool,
    ) -> Option<(SlotRef<T::Client>, OwnedMutexGuard<Slot<T::Client>>)> {
        loop {
            let (slot, created) = {
                let mut registry = self.registry();
                match registry.get(id) {
                    Some(slot) => (slot.clone(), false),
                    None if create => {
                        let slot = Arc::new(AsyncMutex::new(Slot {
                            retired: false,
                            subscription: None,
                        }));
                        registry.insert(id.to_string(), slot.clone());
                        (slot, true)
                    }
                    None => return None,
                }
            };
            let mut pending = PendingSlot {
                inner: self,
                id,
                slot: slot.clone(),
                armed: created,
            };
            let guard = slot.clone().lock_owned().await;
            pending.armed = false;
            if !guard.retired {
                return Some((slot, guard));
            }
        }
    }

    /// Releases a read-only hold on a slot, settling it when it is empty.
    fn release(
        &self,
        id: &str,
        slot: &SlotRef<T::Client>,
        mut guard: OwnedMutexGuard<Slot<T::Client>>,
    ) {
        self.settle(id, slot, &mut guard);
    }

    /// Drops the registry entry of a slot that ended up without a subscription.
    fn settle(&self, id: &str, slot: &SlotRef<T::Client>, guard: &mut Slot<T::Client>) {
        if guard.subscription.is_some() {
            return;
        }
        guard.retired = true;
        let mut registry = self.registry();
        if registry.get(id).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            registry.remove(id);
        }
    }

    /// Stores `sub` back into the slot, or closes its client handle when no
    /// topic is left.
    async fn restore(&self, id: &str, guard: &mut Slot<T::Client>, sub: Subscription<T::Client>) {
        if !sub.topics.is_empty() {
            guard.subscription = Some(sub);
            return;
        }
        if let Err(err) = sub.client.close().await {
            warn!("Failed to close {} client {id}: {err}", self.transport.name());
        }
        debug!("Released {} client {id}", self.transport.name());
    }

    async fn subscribe(
        &self,
        slot: SlotRef<T::Client>,
        mut guard: OwnedMutexGuard<Slot<T::Client>>,
        id: &str,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), MessagingError> {
        if guard
            .subscription
            .as_ref()
            .is_some_and(|sub| sub.topics.contains_key(topic))
        {
            return Err(MessagingError::AlreadySubscribed);
        }

        let mut sub = match guard.subscription.take() {
            Some(sub) => sub,
            None => match self.transport.dial(id).await {
                Ok(client) => Subscription {
                    client,
                    topics: HashMap::new(),
                },
                Err(err) => {
                    self.settle(id, &slot, &mut guard);
                    return Err(err.into());
                }
            },
        };

        let result = self.attach(&mut sub, topic, handler).await;
        self.restore(id, &mut guard, sub).await;
        self.settle(id, &slot, &mut guard);
        result
    }

    async fn attach(
        &self,
        sub: &mut Subscription<T::Client>,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), MessagingError> {
        let (tx, rx) = mpsc::unbounded_channel();
        match tokio::time::timeout(self.timeout, sub.client.subscribe(topic, tx)).await {
            Err(_) => return Err(MessagingError::SubscribeTimeout),
            Ok(Err(err)) => return Err(err.into()),
            Ok(Ok(())) => {}
        }
        let task = tokio::spawn(deliver(topic.to_string(), rx, handler.clone()));
        sub.topics.insert(topic.to_string(), Route { handler, task });
        Ok(())
    }

    async fn unsubscribe(
        &self,
        slot: SlotRef<T::Client>,
        mut guard: OwnedMutexGuard<Slot<T::Client>>,
        id: &str,
        topic: &str,
    ) -> Result<(), MessagingError> {
        let Some(mut sub) = guard.subscription.take() else {
            self.settle(id, &slot, &mut guard);
            return Err(MessagingError::NotSubscribed);
        };
        let result = self.detach(&mut sub, topic).await;
        self.restore(id, &mut guard, sub).await;
        self.settle(id, &slot, &mut guard);
        result
    }

    async fn detach(
        &self,
        sub: &mut Subscription<T::Client>,
        topic: &str,
    ) -> Result<(), MessagingError> {
        if !sub.topics.contains_key(topic) {
            return Err(MessagingError::NotSubscribed);
        }
        match tokio::time::timeout(self.timeout, sub.client.unsubscribe(topic)).await {
            Err(_) => return Err(MessagingError::UnsubscribeTimeout),
            Ok(Err(err)) => return Err(err.into()),
            Ok(Ok(())) => {}
        }
        let Some(route) = sub.topics.remove(topic) else {
            error!("Topic {topic} unsubscribed on the broker but missing locally");
            return Err(MessagingError::UnsubscribeDeleteTopic);
        };
        route.stop(topic);
        Ok(())
    }

    async fn close(&self) -> Result<(), MessagingError> {
        let slots: Vec<(String, SlotRef<T::Client>)> = self.registry().drain().collect();
        for (id, slot) in slots {
            let mut guard = slot.lock_owned().await;
            guard.retired = true;
            let Some(mut sub) = guard.subscription.take() else {
                continue;
            };
            for (topic, route) in sub.topics.drain() {
                route.stop(&topic);
                match tokio::time::timeout(self.timeout, sub.client.unsubscribe(&topic)).await {
                    Err(_) => warn!("Timed out unsubscribing {id} from {topic} on close"),
                    Ok(Err(err)) => warn!("Failed to unsubscribe {id} from {topic}: {err}"),
                    Ok(Ok(())) => {}
                }
            }
            if let Err(err) = sub.client.close().await {
                warn!("Failed to close {} client {id}: {err}", self.transport.name());
            }
        }
        self.transport.close().await.map_err(Into::into)
    }
}

/// A slot inserted by a caller still waiting for its lock. If the caller
/// gives up, the slot is settled so no empty entry stays behind.
struct PendingSlot<'a, T: Transport> {
    inner: &'a Inner<T>,
    id: &'a str,
    slot: SlotRef<T::Client>,
    armed: bool,
}

impl<T: Transport> Drop for PendingSlot<'_, T> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // A current holder settles the slot itself when it lets go.
        if let Ok(mut guard) = self.slot.try_lock() {
            self.inner.settle(self.id, &self.slot, &mut guard);
        }
    }
}

/// Decodes raw broker payloads and hands them to the subscription's handler.
/// A payload that fails to decode is dropped; the stream keeps going.
async fn deliver(
    topic: String,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    handler: Arc<dyn MessageHandler>,
) {
    while let Some(raw) = rx.recv().await {
        let msg = match Message::decode(&raw) {
            Ok(msg) => msg,
            Err(err) => {
                warn!("Failed to unmarshal received message on {topic}: {err}");
                continue;
            }
        };
        if let Err(err) = handler.handle(msg).await {
            warn!("Failed to handle message on {topic}: {err}");
        }
    }
}

fn task_failed(err: tokio::task::JoinError) -> MessagingError {
    BrokerError::fatal(format!("subscription task failed: {err}")).into()
}

#[async_trait]
impl<T: Transport> Publisher for BrokerPubSub<T> {
    async fn publish(&self, topic: &str, msg: &Message) -> Result<(), MessagingError> {
        if topic.is_empty() {
            return Err(MessagingError::EmptyTopic);
        }
        self.ensure_open()?;
        let payload = msg.encode()?;
        let transport = &self.inner.transport;
        self.inner
            .backoff
            .retry(|| {
                let payload = payload.clone();
                async move {
                    transport
                        .publish(topic, payload)
                        .await
                        .map_err(MessagingError::from)
                }
            })
            .await
    }

    async fn close(&self) -> Result<(), MessagingError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.close().await
    }
}

#[async_trait]
impl<T: Transport> Subscriber for BrokerPubSub<T> {
    async fn subscribe(
        &self,
        id: &str,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), MessagingError> {
        if id.is_empty() {
            return Err(MessagingError::EmptyId);
        }
        if topic.is_empty() {
            return Err(MessagingError::EmptyTopic);
        }
        self.ensure_open()?;

        let Some((slot, guard)) = self.inner.lock(id, true).await else {
            return Err(MessagingError::NotSubscribed);
        };
        let inner = self.inner.clone();
        let (id, topic) = (id.to_string(), topic.to_string());
        tokio::spawn(async move { inner.subscribe(slot, guard, &id, &topic, handler).await })
            .await
            .map_err(task_failed)?
    }

    async fn unsubscribe(&self, id: &str, topic: &str) -> Result<(), MessagingError> {
        if id.is_empty() {
            return Err(MessagingError::EmptyId);
        }
        if topic.is_empty() {
            return Err(MessagingError::EmptyTopic);
        }

        let Some((slot, guard)) = self.inner.lock(id, false).await else {
            return Err(MessagingError::NotSubscribed);
        };
        let inner = self.inner.clone();
        let (id, topic) = (id.to_string(), topic.to_string());
        tokio::spawn(async move { inner.unsubscribe(slot, guard, &id, &topic).await })
            .await
            .map_err(task_failed)?
    }

    async fn topics(&self, id: &str) -> Vec<String> {
        let Some((slot, guard)) = self.inner.lock(id, false).await else {
            return Vec::new();
        };
        let mut topics: Vec<String> = guard
            .subscription
            .as_ref()
            .map(|sub| sub.topics.keys().cloned().collect())
            .unwrap_or_default();
        self.inner.release(id, &slot, guard);
        topics.sort();
        topics
    }
}
