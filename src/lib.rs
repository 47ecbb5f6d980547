//! # thingbus
//!
//! `thingbus` is the messaging backbone of an IoT platform: a broker-agnostic
//! publish/subscribe layer plus a session bridge that lets edge devices
//! exchange messages with backend services through interchangeable brokers.
//!
//! ## Core Modules
//!
//! The library is structured into several modules, each with a distinct responsibility:
//!
//! - `messaging`: Message envelope, topic naming, the uniform `Publisher`/`Subscriber`
//!   contract, the subscription manager and the broker connectors.
//! - `broker`: Embedded brokers (partitioned log, exchange/queue, retained-topic).
//! - `adapter`: Session bridge handling connect/publish/subscribe/disconnect, auth
//!   checks, lifecycle events and forwarding to secondary brokers.
//! - `client`: State of a connected edge session.
//! - `config`: Handles loading and managing configuration.
//! - `persistence`: Durable storage for the log broker, using sled.
//! - `transport`: Manages the WebSocket server and communication with edge clients.
//! - `utils`: Contains shared utilities, such as error types and logging.

pub mod adapter;
pub mod broker;
pub mod client;
pub mod config;
pub mod messaging;
pub mod persistence;
pub mod transport;
pub mod utils;
