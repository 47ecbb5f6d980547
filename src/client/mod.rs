//! The `client` module defines the state of a single edge session.
//!
//! A `Session` carries the session's id, the identity established when it
//! connected, the outbound stream messages are written to and a
//! cancellation signal raised when the session goes away.

pub mod session;
pub use session::Session;
