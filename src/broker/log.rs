//! Embedded partitioned log broker.
//!
//! Topics are created on first write and split into a fixed number of
//! append-only partitions. A record's partition is chosen by hashing its key
//! (murmur2, as Kafka's default partitioner does). Consumers register a
//! dot-separated filter and are pushed every record appended to a matching
//! topic from the moment they subscribe.
//!
//! Leader elections can be started and completed per topic; while one is in
//! progress, writes to that topic fail with a transient error.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::broker::topic::FilterTable;
use crate::messaging::topic::matches;
use crate::messaging::transport::Delivery;
use crate::persistence::LogStore;
use crate::utils::BrokerError;

pub const LEADER_NOT_AVAILABLE: &str = "[5] Leader Not Available";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordPosition {
    pub partition: u32,
    pub offset: u64,
}

#[derive(Debug, Default)]
struct State {
    topics: HashMap<String, Vec<Vec<Vec<u8>>>>,
    filters: FilterTable,
    consumers: HashMap<String, Delivery>,
    next_consumer: u64,
    electing: HashSet<String>,
    shut_down: bool,
}

#[derive(Debug, Clone)]
pub struct LogBroker {
    state: Arc<Mutex<State>>,
    store: Option<LogStore>,
    partitions: u32,
}

impl LogBroker {
    /// In-memory broker.
    pub fn new(partitions: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            store: None,
            partitions: partitions.max(1),
        }
    }

    /// Durable broker backed by a sled store at `path`. Records already in
    /// the store are recovered.
    pub fn open(path: &str, partitions: u32) -> Result<Self, BrokerError> {
        let store = LogStore::open(path).map_err(store_error)?;
        let mut state = State::default();
        let partitions = partitions.max(1);
        for stored in store.load().map_err(store_error)? {
            let log = state
                .topics
                .entry(stored.topic)
                .or_insert_with(|| vec![Vec::new(); partitions as usize]);
            if let Some(records) = log.get_mut(stored.partition as usize) {
                *records = stored.records;
            }
        }
        info!("Recovered {} topics from {path}", state.topics.len());
        Ok(Self {
            state: Arc::new(Mutex::new(state)),
            store: Some(store),
            partitions,
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    /// Appends a record and pushes it to every matching consumer.
    pub fn produce(
        &self,
        topic: &str,
        key: &[u8],
        value: Vec<u8>,
    ) -> Result<RecordPosition, BrokerError> {
        let mut state = self.state();
        if state.shut_down {
            return Err(BrokerError::closed());
        }
        if state.electing.contains(topic) {
            return Err(BrokerError::transient(LEADER_NOT_AVAILABLE));
        }

        let partition = partition_for_key(key, self.partitions);
        let log = state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); self.partitions as usize]);
        let records = &mut log[partition as usize];
        let offset = records.len() as u64;
        if let Some(store) = &self.store {
            store
                .append(topic, partition, offset, &value)
                .map_err(store_error)?;
        }
        records.push(value.clone());

        let mut closed = Vec::new();
        for (_, consumer) in state.filters.matching(topic, matches) {
            let Some(delivery) = state.consumers.get(consumer) else {
                continue;
            };
            if delivery.send(value.clone()).is_err() {
                closed.push(consumer.clone());
            }
        }
        for consumer in closed {
            debug!("Dropping closed consumer {consumer}");
            state.consumers.remove(&consumer);
            state.filters.remove_subscriber(&consumer);
        }

        Ok(RecordPosition { partition, offset })
    }

    /// Registers a consumer for `filter` and returns its id.
    pub fn subscribe(&self, filter: &str, delivery: Delivery) -> Result<String, BrokerError> {
        if filter.is_empty() {
            return Err(BrokerError::rejected("empty subscription filter"));
        }
        let mut state = self.state();
        if state.shut_down {
            return Err(BrokerError::closed());
        }
        state.next_consumer += 1;
        let id = format!("consumer-{}", state.next_consumer);
        state.filters.subscribe(filter, id.clone());
        state.consumers.insert(id.clone(), delivery);
        Ok(id)
    }

    pub fn unsubscribe(&self, consumer: &str) -> bool {
        let mut state = self.state();
        state.filters.remove_subscriber(consumer);
        state.consumers.remove(consumer).is_some()
    }

    /// Records stored in a partition starting at `offset`.
    pub fn fetch(&self, topic: &str, partition: u32, offset: u64) -> Vec<Vec<u8>> {
        self.state()
            .topics
            .get(topic)
            .and_then(|log| log.get(partition as usize))
            .map(|records| records.iter().skip(offset as usize).cloned().collect())
            .unwrap_or_default()
    }

    pub fn end_offset(&self, topic: &str, partition: u32) -> u64 {
        self.state()
            .topics
            .get(topic)
            .and_then(|log| log.get(partition as usize))
            .map_or(0, |records| records.len() as u64)
    }

    pub fn begin_election(&self, topic: &str) {
        warn!("Leader election started for {topic}");
        self.state().electing.insert(topic.to_string());
    }

    pub fn complete_election(&self, topic: &str) {
        info!("Leader elected for {topic}");
        self.state().electing.remove(topic);
    }

    /// Stops accepting requests. Consumers are dropped.
    pub fn shutdown(&self) {
        let mut state = self.state();
        state.shut_down = true;
        state.consumers.clear();
        state.filters = FilterTable::default();
        if let Some(store) = &self.store {
            if let Err(err) = store.flush() {
                warn!("Failed to flush log store: {err}");
            }
        }
    }
}

fn store_error(err: sled::Error) -> BrokerError {
    BrokerError::fatal(format!("log store: {err}"))
}

/// Kafka default partitioner.
pub fn partition_for_key(key: &[u8], partitions: u32) -> u32 {
    if partitions == 0 {
        return 0;
    }
    (murmur2(key) & 0x7fff_ffff) % partitions
}

fn murmur2(data: &[u8]) -> u32 {
    const SEED: u32 = 0x9747_b28c;
    const M: u32 = 0x5bd1_e995;
    const R: u32 = 24;

    let mut h = SEED ^ data.len() as u32;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    let tail = chunks.remainder();
    if tail.len() >= 3 {
        h ^= (tail[2] as u32) << 16;
    }
    if tail.len() >= 2 {
        h ^= (tail[1] as u32) << 8;
    }
    if !tail.is_empty() {
        h ^= tail[0] as u32;
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h
}
