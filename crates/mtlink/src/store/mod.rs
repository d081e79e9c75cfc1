//! Persisted-session lookup.
//!
//! The manager only asks whether key material exists for a phone number; the
//! file format belongs to the transport that writes it.

mod error;
mod file;
mod session;

pub use error::{StorageError, StorageResult};
pub use file::{FileSessionStore, SESSION_FILE_EXTENSION};
pub use session::SessionStore;
