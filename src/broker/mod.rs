//! The `broker` module contains the embedded message brokers the connectors
//! talk to: a partitioned log, an exchange/queue broker and a retained-topic
//! broker. Each keeps its subscriptions in a `topic::FilterTable` and pushes
//! raw payloads into per-subscription channels.

pub mod exchange;
pub mod log;
pub mod retained;
pub mod topic;

pub use exchange::ExchangeBroker;
pub use log::LogBroker;
pub use retained::RetainedBroker;
