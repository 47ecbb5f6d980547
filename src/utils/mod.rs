//! The `utils` module provides definitions shared across the `thingbus`
//! crate: the error taxonomy and logging initialisation.

pub mod error;
pub mod logging;

pub use error::{BrokerError, BrokerErrorKind, ErrorKind, MessagingError};
