//! Embedded retained-topic broker.
//!
//! Clients connect with an id, subscribe with MQTT filters (`+`, `#`) and
//! receive every message published to a matching topic. A message published
//! with the retain flag is kept as the topic's last known value and replayed
//! to each new matching subscription. Publishing an empty retained payload
//! clears it; this is a broker-level operation, since messages published
//! through the connectors always carry an encoded envelope.
//!
//! Concurrency and usage notes:
//! - State lives behind a single mutex and no method awaits while holding it.
//! - Deliveries are pushed into unbounded channels, so a slow subscriber
//!   never blocks a publisher.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::broker::topic::{FilterTable, SubscriberId, is_valid_mqtt_filter, mqtt_matches};
use crate::messaging::transport::Delivery;
use crate::utils::BrokerError;

/// A connected client and the delivery channel of each of its filters.
#[derive(Debug, Default)]
struct Client {
    deliveries: HashMap<String, Delivery>,
}

#[derive(Debug)]
struct State {
    filters: FilterTable,
    clients: HashMap<SubscriberId, Client>,
    retained: BTreeMap<String, Vec<u8>>,
    available: bool,
}

impl Default for State {
    fn default() -> Self {
        Self {
            filters: FilterTable::default(),
            clients: HashMap::new(),
            retained: BTreeMap::new(),
            available: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetainedBroker {
    state: Arc<Mutex<State>>,
}

impl RetainedBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a client. Connecting with an id already in use takes over
    /// that session and drops its subscriptions.
    pub fn connect(&self, client_id: &str) -> Result<(), BrokerError> {
        let mut state = self.state();
        if !state.available {
            return Err(BrokerError::transient("server unavailable"));
        }
        if state.clients.contains_key(client_id) {
            info!("Client {client_id} reconnected, taking over its session");
            state.filters.remove_subscriber(client_id);
        }
        state
            .clients
            .insert(client_id.to_string(), Client::default());
        Ok(())
    }

    /// Removes a client and all of its subscriptions.
    pub fn disconnect(&self, client_id: &str) -> bool {
        let mut state = self.state();
        state.filters.remove_subscriber(client_id);
        state.clients.remove(client_id).is_some()
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        self.state().clients.contains_key(client_id)
    }

    /// Subscribes a connected client to `filter`. Retained messages on
    /// matching topics are delivered immediately.
    pub fn subscribe(
        &self,
        client_id: &str,
        filter: &str,
        delivery: Delivery,
    ) -> Result<(), BrokerError> {
        if !is_valid_mqtt_filter(filter) {
            return Err(BrokerError::rejected(format!("invalid topic filter '{filter}'")));
        }
        let mut state = self.state();
        let State {
            filters,
            clients,
            retained,
            ..
        } = &mut *state;
        let Some(client) = clients.get_mut(client_id) else {
            return Err(BrokerError::fatal(format!("client {client_id} not connected")));
        };

        for (topic, payload) in retained.iter() {
            if mqtt_matches(filter, topic) && delivery.send(payload.clone()).is_err() {
                return Err(BrokerError::fatal("subscriber channel closed"));
            }
        }
        filters.subscribe(filter, client_id.to_string());
        client.deliveries.insert(filter.to_string(), delivery);
        debug!("{client_id} subscribed to {filter}");
        Ok(())
    }

    /// Returns `false` if the client had no such subscription.
    pub fn unsubscribe(&self, client_id: &str, filter: &str) -> bool {
        let mut state = self.state();
        if let Some(client) = state.clients.get_mut(client_id) {
            client.deliveries.remove(filter);
        }
        state.filters.unsubscribe(filter, client_id)
    }

    /// Publishes `payload` to every matching subscription and returns the
    /// number of deliveries made.
    pub fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<usize, BrokerError> {
        if topic.is_empty() || topic.contains(['+', '#']) {
            return Err(BrokerError::rejected(format!("invalid topic name '{topic}'")));
        }
        let mut state = self.state();
        if !state.available {
            return Err(BrokerError::transient("server unavailable"));
        }
        if retain {
            if payload.is_empty() {
                state.retained.remove(topic);
            } else {
                state.retained.insert(topic.to_string(), payload.clone());
            }
        }

        let mut delivered = 0;
        let mut closed = Vec::new();
        for (filter, client_id) in state.filters.matching(topic, mqtt_matches) {
            let Some(delivery) = state
                .clients
                .get(client_id)
                .and_then(|client| client.deliveries.get(filter))
            else {
                continue;
            };
            match delivery.send(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => closed.push((filter.to_string(), client_id.clone())),
            }
        }
        for (filter, client_id) in closed {
            warn!("Dropping closed subscription {client_id} on {filter}");
            if let Some(client) = state.clients.get_mut(&client_id) {
                client.deliveries.remove(&filter);
            }
            state.filters.unsubscribe(&filter, &client_id);
        }
        Ok(delivered)
    }

    pub fn retained(&self, topic: &str) -> Option<Vec<u8>> {
        self.state().retained.get(topic).cloned()
    }

    /// Makes the broker reject (`false`) or accept (`true`) requests.
    pub fn set_available(&self, available: bool) {
        self.state().available = available;
    }
}
