//! The `transport` module is responsible for handling network communication
//! with edge clients via WebSockets.
//!
//! It defines the JSON frames exchanged with clients and implements the
//! WebSocket server, which turns frames into session events for the
//! adapter and writes deliveries and acknowledgements back.

pub mod message;
pub mod websocket;
