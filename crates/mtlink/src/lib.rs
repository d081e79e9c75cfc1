//! Session and connection orchestration for a stateful encrypted mobile
//! transport.
//!
//! A [`Manager`] owns every live connection and session behind a single
//! dispatch loop. Wire encoding, the key exchange and the API schema stay
//! outside the crate, behind the traits in [`transport`].

pub mod config;
pub mod error;
pub mod manager;
pub mod observer;
pub mod store;
pub mod transport;

pub use config::Config;
pub use error::ManagerError;
pub use manager::{Event, EventKind, Manager, RegistrySnapshot, SessionBinding};
pub use observer::{EventObserver, NoopObserver, TracingObserver};
