//! MQTT connectors.
//!
//! Normalized topics are translated to MQTT naming before they reach the
//! broker: `.` becomes `/`, `*` becomes `+` and `>` becomes `#`.
//!
//! `MqttTransport` talks to the embedded `RetainedBroker`.
//! `RemoteMqttTransport` shares a single `rumqttc` connection to an external
//! broker between every subscriber. SUBACK and UNSUBACK packets arrive in
//! request order, so acknowledgements are correlated by a FIFO of waiters.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ClientError, ConnectionError, Event, EventLoop, Incoming, MqttOptions, QoS,
    SubscribeReasonCode,
};
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::RetainedBroker;
use crate::broker::topic::mqtt_matches;
use crate::messaging::transport::{Delivery, Transport, TransportClient};
use crate::utils::BrokerError;

/// Translates a normalized topic or filter to MQTT naming.
pub fn to_mqtt(topic: &str) -> String {
    topic
        .split('.')
        .map(|segment| match segment {
            "*" => "+",
            ">" => "#",
            other => other,
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[derive(Debug, Clone)]
pub struct MqttTransport {
    broker: RetainedBroker,
    retain: bool,
    closed: Arc<AtomicBool>,
}

impl MqttTransport {
    /// `retain` marks every published message as the topic's retained value.
    pub fn new(broker: RetainedBroker, retain: bool) -> Self {
        Self {
            broker,
            retain,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn broker(&self) -> &RetainedBroker {
        &self.broker
    }
}

#[async_trait]
impl Transport for MqttTransport {
    type Client = MqttClient;

    fn name(&self) -> &'static str {
        "mqtt"
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::closed());
        }
        self.broker.publish(&to_mqtt(topic), payload, self.retain)?;
        Ok(())
    }

    async fn dial(&self, client_id: &str) -> Result<MqttClient, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::closed());
        }
        self.broker.connect(client_id)?;
        Ok(MqttClient {
            id: client_id.to_string(),
            broker: self.broker.clone(),
        })
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("MQTT connector closed");
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct MqttClient {
    id: String,
    broker: RetainedBroker,
}

#[async_trait]
impl TransportClient for MqttClient {
    async fn subscribe(&self, filter: &str, delivery: Delivery) -> Result<(), BrokerError> {
        self.broker.subscribe(&self.id, &to_mqtt(filter), delivery)
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), BrokerError> {
        if !self.broker.unsubscribe(&self.id, &to_mqtt(filter)) {
            return Err(BrokerError::rejected(format!("no subscription to {filter}")));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.broker.disconnect(&self.id);
        Ok(())
    }
}

type Ack = oneshot::Sender<Result<(), BrokerError>>;

#[derive(Debug)]
struct Route {
    owner: String,
    filter: String,
    delivery: Delivery,
}

/// Fans incoming publishes out to local subscribers and tracks the waiters
/// of outstanding subscribe/unsubscribe requests.
#[derive(Debug, Default)]
pub struct Router {
    routes: Mutex<Vec<Route>>,
    suback: Mutex<VecDeque<Ack>>,
    unsuback: Mutex<VecDeque<Ack>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Router {
    /// Adds a route, replacing an existing one for the same owner and filter.
    pub fn add(&self, owner: &str, filter: &str, delivery: Delivery) {
        let mut routes = locked(&self.routes);
        routes.retain(|r| !(r.owner == owner && r.filter == filter));
        routes.push(Route {
            owner: owner.to_string(),
            filter: filter.to_string(),
            delivery,
        });
    }

    /// Removes a route and returns whether another owner still uses the
    /// filter, or `None` if the route did not exist.
    pub fn remove(&self, owner: &str, filter: &str) -> Option<bool> {
        let mut routes = locked(&self.routes);
        let position = routes
            .iter()
            .position(|r| r.owner == owner && r.filter == filter)?;
        routes.remove(position);
        Some(routes.iter().any(|r| r.filter == filter))
    }

    /// Like `remove`, without removing anything.
    pub fn shared(&self, owner: &str, filter: &str) -> Option<bool> {
        let routes = locked(&self.routes);
        routes.iter().find(|r| r.owner == owner && r.filter == filter)?;
        Some(routes.iter().any(|r| r.owner != owner && r.filter == filter))
    }

    pub fn in_use(&self, filter: &str) -> bool {
        locked(&self.routes).iter().any(|r| r.filter == filter)
    }

    /// Removes every route of `owner` and returns the filters nobody uses
    /// anymore.
    pub fn remove_owner(&self, owner: &str) -> Vec<String> {
        let mut routes = locked(&self.routes);
        let mut released = Vec::new();
        routes.retain(|r| {
            if r.owner == owner {
                released.push(r.filter.clone());
                return false;
            }
            true
        });
        released.retain(|filter| !routes.iter().any(|r| &r.filter == filter));
        released.sort();
        released.dedup();
        released
    }

    /// Delivers a payload to every matching route and returns the count.
    pub fn dispatch(&self, topic: &str, payload: &[u8]) -> usize {
        let mut routes = locked(&self.routes);
        let mut delivered = 0;
        routes.retain(|route| {
            if !mqtt_matches(&route.filter, topic) {
                return true;
            }
            match route.delivery.send(payload.to_vec()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => {
                    debug!("Dropping closed route {} on {}", route.owner, route.filter);
                    false
                }
            }
        });
        delivered
    }

    pub(crate) fn expect_suback(&self, ack: Ack) {
        locked(&self.suback).push_back(ack);
    }

    pub(crate) fn expect_unsuback(&self, ack: Ack) {
        locked(&self.unsuback).push_back(ack);
    }

    /// Drops the most recent waiter after its request never left.
    fn withdraw(&self, unsubscribe: bool) {
        let queue = if unsubscribe { &self.unsuback } else { &self.suback };
        locked(queue).pop_back();
    }

    /// Number of requests still waiting for their acknowledgement.
    pub fn pending(&self) -> usize {
        locked(&self.suback).len() + locked(&self.unsuback).len()
    }

    pub fn on_suback(&self, codes: &[SubscribeReasonCode]) {
        let result = if codes.iter().any(|c| matches!(c, SubscribeReasonCode::Failure)) {
            Err(BrokerError::rejected("subscription refused by broker"))
        } else {
            Ok(())
        };
        if let Some(ack) = locked(&self.suback).pop_front() {
            let _ = ack.send(result);
        }
    }

    pub fn on_unsuback(&self) {
        if let Some(ack) = locked(&self.unsuback).pop_front() {
            let _ = ack.send(Ok(()));
        }
    }

    /// Fails every outstanding request; their packets were lost with the
    /// connection.
    pub fn fail_pending(&self, err: &BrokerError) {
        for ack in locked(&self.suback)
            .drain(..)
            .chain(locked(&self.unsuback).drain(..))
        {
            let _ = ack.send(Err(err.clone()));
        }
    }
}

struct Remote {
    client: AsyncClient,
    router: Arc<Router>,
    qos: QoS,
    retain: bool,
    /// Serializes requests so acknowledgements arrive in waiter order.
    requests: AsyncMutex<()>,
}

impl Remote {
    /// Routes `filter` to `owner` and sends SUBSCRIBE. The route is in place
    /// before the request leaves and is taken back if the SUBACK never
    /// confirms it.
    async fn subscribe(
        self: &Arc<Self>,
        owner: &str,
        filter: &str,
        delivery: Delivery,
    ) -> Result<(), BrokerError> {
        let (tx, rx) = oneshot::channel();
        let mut pending = {
            let _order = self.requests.lock().await;
            self.router.add(owner, filter, delivery);
            let mut pending = PendingRoute {
                remote: self.clone(),
                owner: owner.to_string(),
                filter: filter.to_string(),
                sent: false,
                committed: false,
            };
            self.router.expect_suback(tx);
            if let Err(err) = self.client.subscribe(filter, self.qos).await {
                self.router.withdraw(false);
                return Err(client_error(err));
            }
            pending.sent = true;
            pending
        };
        match rx.await.unwrap_or_else(|_| Err(BrokerError::closed())) {
            Ok(()) => {
                pending.commit();
                Ok(())
            }
            Err(err) => {
                pending.sent = false;
                Err(err)
            }
        }
    }

    /// Drops the route of `owner` on `filter`, sending UNSUBSCRIBE when no
    /// other owner uses the filter. The route stays until the broker
    /// acknowledges, so a request that times out can be repeated.
    async fn release(&self, owner: &str, filter: &str) -> Result<(), BrokerError> {
        let (tx, rx) = oneshot::channel();
        {
            let _order = self.requests.lock().await;
            match self.router.shared(owner, filter) {
                None => {
                    return Err(BrokerError::rejected(format!("no subscription to {filter}")));
                }
                Some(true) => {
                    self.router.remove(owner, filter);
                    return Ok(());
                }
                Some(false) => {}
            }
            self.router.expect_unsuback(tx);
            if let Err(err) = self.client.unsubscribe(filter).await {
                self.router.withdraw(true);
                return Err(client_error(err));
            }
        }
        rx.await.unwrap_or_else(|_| Err(BrokerError::closed()))?;
        self.router.remove(owner, filter);
        Ok(())
    }

    /// Sends UNSUBSCRIBE for `filter` if no route uses it anymore.
    async fn unsubscribe_unused(&self, filter: &str) -> Result<(), BrokerError> {
        let (tx, rx) = oneshot::channel();
        {
            let _order = self.requests.lock().await;
            if self.router.in_use(filter) {
                return Ok(());
            }
            self.router.expect_unsuback(tx);
            if let Err(err) = self.client.unsubscribe(filter).await {
                self.router.withdraw(true);
                return Err(client_error(err));
            }
        }
        rx.await.unwrap_or_else(|_| Err(BrokerError::closed()))
    }
}

/// A route added ahead of its SUBACK. Unless committed it is removed on
/// drop, and a SUBSCRIBE that already left is undone on the broker.
struct PendingRoute {
    remote: Arc<Remote>,
    owner: String,
    filter: String,
    sent: bool,
    committed: bool,
}

impl PendingRoute {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for PendingRoute {
    fn drop(&mut self) {
        if self.committed || self.remote.router.remove(&self.owner, &self.filter).is_none() {
            return;
        }
        if !self.sent {
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            return;
        };
        let (remote, filter) = (self.remote.clone(), self.filter.clone());
        runtime.spawn(async move {
            if let Err(err) = remote.unsubscribe_unused(&filter).await {
                debug!("Failed to undo subscription to {filter}: {err}");
            }
        });
    }
}

fn client_error(err: ClientError) -> BrokerError {
    BrokerError::fatal(format!("mqtt client: {err}"))
}

fn connection_error(err: &ConnectionError) -> BrokerError {
    match err {
        ConnectionError::ConnectionRefused(code) => {
            BrokerError::transient(format!("connection refused: {code:?}"))
        }
        other => BrokerError::transient(format!("connection lost: {other}")),
    }
}

/// Connector to an external MQTT broker.
#[derive(Clone)]
pub struct RemoteMqttTransport {
    remote: Arc<Remote>,
    driver: Arc<Mutex<Option<JoinHandle<()>>>>,
    closed: Arc<AtomicBool>,
}

impl RemoteMqttTransport {
    /// Creates the shared connection and starts its event loop. The
    /// connection is established lazily and re-established after failures.
    pub fn connect(client_id: &str, host: &str, port: u16, retain: bool) -> Self {
        let (transport, eventloop) = Self::detached(client_id, host, port, retain);
        let router = transport.remote.router.clone();
        let driver = tokio::spawn(drive(eventloop, router, format!("{host}:{port}")));
        *locked(&transport.driver) = Some(driver);
        transport
    }

    /// Creates the connection without polling its event loop; the caller
    /// drives it and feeds acknowledgements to `router()`.
    pub fn detached(client_id: &str, host: &str, port: u16, retain: bool) -> (Self, EventLoop) {
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_session(false);
        let (client, eventloop) = AsyncClient::new(options, 64);

        let transport = Self {
            remote: Arc::new(Remote {
                client,
                router: Arc::new(Router::default()),
                qos: QoS::AtLeastOnce,
                retain,
                requests: AsyncMutex::new(()),
            }),
            driver: Arc::new(Mutex::new(None)),
            closed: Arc::new(AtomicBool::new(false)),
        };
        (transport, eventloop)
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.remote.router
    }
}

async fn drive(mut eventloop: EventLoop, router: Arc<Router>, addr: String) {
    let mut connected = false;
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                if connected {
                    info!("Reconnected to MQTT broker {addr}");
                } else {
                    info!("Connected to MQTT broker {addr}");
                }
                connected = true;
                debug!("ConnAck {:?}", ack.code);
            }
            Ok(Event::Incoming(Incoming::SubAck(ack))) => router.on_suback(&ack.return_codes),
            Ok(Event::Incoming(Incoming::UnsubAck(_))) => router.on_unsuback(),
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                router.dispatch(&publish.topic, &publish.payload);
            }
            Ok(_) => {}
            Err(err) => {
                connected = false;
                let err = connection_error(&err);
                warn!("MQTT broker {addr}: {err}, retrying in 1s");
                router.fail_pending(&err);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

#[async_trait]
impl Transport for RemoteMqttTransport {
    type Client = RemoteMqttClient;

    fn name(&self) -> &'static str {
        "mqtt"
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::closed());
        }
        self.remote
            .client
            .publish(to_mqtt(topic), self.remote.qos, self.remote.retain, payload)
            .await
            .map_err(client_error)
    }

    async fn dial(&self, client_id: &str) -> Result<RemoteMqttClient, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::closed());
        }
        Ok(RemoteMqttClient {
            id: client_id.to_string(),
            remote: self.remote.clone(),
        })
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(err) = self.remote.client.disconnect().await {
            warn!("Failed to disconnect from MQTT broker: {err}");
        }
        if let Some(driver) = locked(&self.driver).take() {
            driver.abort();
        }
        self.remote.router.fail_pending(&BrokerError::closed());
        Ok(())
    }
}

/// Subscriber view of the shared remote connection.
pub struct RemoteMqttClient {
    id: String,
    remote: Arc<Remote>,
}

#[async_trait]
impl TransportClient for RemoteMqttClient {
    async fn subscribe(&self, filter: &str, delivery: Delivery) -> Result<(), BrokerError> {
        self.remote
            .subscribe(&self.id, &to_mqtt(filter), delivery)
            .await
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), BrokerError> {
        self.remote.release(&self.id, &to_mqtt(filter)).await
    }

    async fn close(&self) -> Result<(), BrokerError> {
        for filter in self.remote.router.remove_owner(&self.id) {
            if let Err(err) = self.remote.unsubscribe_unused(&filter).await {
                warn!("Failed to release {filter} for {}: {err}", self.id);
            }
        }
        Ok(())
    }
}
