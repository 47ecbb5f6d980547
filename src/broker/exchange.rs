//! Embedded exchange/queue broker.
//!
//! Publishers write to a named topic exchange with a routing key. Queues are
//! bound to exchanges with `*`/`#` patterns and receive a copy of every
//! matching message; a queue with no consumer buffers its messages until one
//! attaches. Exclusive queues belong to one connection and are deleted with
//! it. The broker can be blocked (flow control), in which case publishes
//! fail with a transient error until it is unblocked.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::broker::topic::{FilterTable, amqp_matches};
use crate::messaging::transport::Delivery;
use crate::utils::BrokerError;

#[derive(Debug, Default)]
struct Queue {
    owner: Option<String>,
    consumer: Option<Delivery>,
    backlog: VecDeque<Vec<u8>>,
}

impl Queue {
    fn push(&mut self, body: Vec<u8>) {
        let body = match &self.consumer {
            Some(consumer) => match consumer.send(body) {
                Ok(()) => return,
                Err(returned) => returned.0,
            },
            None => body,
        };
        self.consumer = None;
        self.backlog.push_back(body);
    }
}

#[derive(Debug, Default)]
struct State {
    exchanges: HashMap<String, FilterTable>,
    queues: HashMap<String, Queue>,
    blocked: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ExchangeBroker {
    state: Arc<Mutex<State>>,
}

impl ExchangeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Declares a topic exchange. Idempotent.
    pub fn declare_exchange(&self, name: &str) {
        self.state().exchanges.entry(name.to_string()).or_default();
    }

    /// Declares a queue. A queue declared by another owner is locked.
    pub fn declare_queue(&self, name: &str, owner: Option<&str>) -> Result<(), BrokerError> {
        let mut state = self.state();
        if let Some(queue) = state.queues.get(name) {
            if queue.owner.as_deref() != owner {
                return Err(BrokerError::rejected(format!(
                    "RESOURCE_LOCKED - cannot obtain exclusive access to queue '{name}'"
                )));
            }
            return Ok(());
        }
        state.queues.insert(
            name.to_string(),
            Queue {
                owner: owner.map(str::to_string),
                ..Queue::default()
            },
        );
        Ok(())
    }

    pub fn bind(&self, queue: &str, exchange: &str, pattern: &str) -> Result<(), BrokerError> {
        let mut state = self.state();
        if !state.queues.contains_key(queue) {
            return Err(not_found("queue", queue));
        }
        let Some(bindings) = state.exchanges.get_mut(exchange) else {
            return Err(not_found("exchange", exchange));
        };
        bindings.subscribe(pattern, queue.to_string());
        Ok(())
    }

    pub fn unbind(&self, queue: &str, exchange: &str, pattern: &str) -> bool {
        self.state()
            .exchanges
            .get_mut(exchange)
            .is_some_and(|bindings| bindings.unsubscribe(pattern, queue))
    }

    /// Attaches the single consumer of a queue and flushes its backlog.
    pub fn consume(&self, queue: &str, delivery: Delivery) -> Result<(), BrokerError> {
        let mut state = self.state();
        let Some(queue_state) = state.queues.get_mut(queue) else {
            return Err(not_found("queue", queue));
        };
        if queue_state.consumer.as_ref().is_some_and(|c| !c.is_closed()) {
            return Err(BrokerError::rejected(format!(
                "ACCESS_REFUSED - queue '{queue}' already has a consumer"
            )));
        }
        while let Some(body) = queue_state.backlog.pop_front() {
            if let Err(returned) = delivery.send(body) {
                queue_state.backlog.push_front(returned.0);
                return Err(BrokerError::fatal("consumer channel closed"));
            }
        }
        queue_state.consumer = Some(delivery);
        Ok(())
    }

    pub fn cancel(&self, queue: &str) -> bool {
        self.state()
            .queues
            .get_mut(queue)
            .and_then(|q| q.consumer.take())
            .is_some()
    }

    /// Deletes a queue and every binding pointing at it.
    pub fn delete_queue(&self, queue: &str) -> bool {
        let mut state = self.state();
        for bindings in state.exchanges.values_mut() {
            bindings.remove_subscriber(queue);
        }
        state.queues.remove(queue).is_some()
    }

    /// Deletes every exclusive queue owned by `owner`.
    pub fn close_owner(&self, owner: &str) {
        let mut state = self.state();
        let owned: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, q)| q.owner.as_deref() == Some(owner))
            .map(|(name, _)| name.clone())
            .collect();
        for queue in owned {
            debug!("Deleting exclusive queue {queue}");
            for bindings in state.exchanges.values_mut() {
                bindings.remove_subscriber(&queue);
            }
            state.queues.remove(&queue);
        }
    }

    /// Routes a message to every queue bound with a matching pattern and
    /// returns how many queues received it.
    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
    ) -> Result<usize, BrokerError> {
        let mut state = self.state();
        if state.blocked {
            return Err(BrokerError::transient("connection blocked"));
        }
        let Some(bindings) = state.exchanges.get(exchange) else {
            return Err(not_found("exchange", exchange));
        };
        let mut targets: Vec<String> = bindings
            .matching(routing_key, amqp_matches)
            .map(|(_, queue)| queue.clone())
            .collect();
        targets.sort();
        targets.dedup();

        for name in &targets {
            match state.queues.get_mut(name) {
                Some(queue) => queue.push(body.clone()),
                None => warn!("Binding points at missing queue {name}"),
            }
        }
        Ok(targets.len())
    }

    /// Messages waiting in a queue without a consumer.
    pub fn backlog(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, |q| q.backlog.len())
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.state().queues.contains_key(queue)
    }

    pub fn block(&self) {
        warn!("Broker connection blocked");
        self.state().blocked = true;
    }

    pub fn unblock(&self) {
        self.state().blocked = false;
    }
}

fn not_found(kind: &str, name: &str) -> BrokerError {
    BrokerError::rejected(format!("NOT_FOUND - no {kind} '{name}'"))
}
