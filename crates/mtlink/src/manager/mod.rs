//! Session/connection manager.
//!
//! # Architecture
//!
//! ```text
//!  ┌───────────────┐  Event + oneshot   ┌──────────────────┐
//!  │    Manager    │───────────────────▶│   event queue    │◀──── notifications
//!  │   (façade)    │                    │ (unbounded mpsc) │      (EventSink held by
//!  └───────────────┘                    └────────┬─────────┘       sessions/connections)
//!                                                │ one at a time
//!                                                ▼
//!                                       ┌──────────────────┐
//!                                       │    Dispatcher    │  owns Registry
//!                                       │ (connections +   │  (only writer)
//!                                       │  sessions)       │
//!                                       └───┬──────────▲───┘
//!                                 spawn     │          │ Internal follow-ups
//!                                           ▼          │ (SessionReady, DiscardApplied, ...)
//!                                       ┌──────────────┴───┐
//!                                       │     workers      │  handshake, close, await
//!                                       │  (TaskTracker)   │  nested requests
//!                                       └──────────────────┘
//! ```
//!
//! - **Manager**: cloneless handle; sends requests and waits on their reply
//!   under a timeout. `finish()` closes connections and drains every task.
//! - **Dispatcher**: the only code that touches the registries. Never
//!   awaits anything except the queue and the shutdown token.
//! - **Registry**: connections and sessions. Sessions are registered as soon
//!   as they are constructed and removed only when their discard notification
//!   arrives; connections are removed only when their close notification
//!   arrives.
//!
//! A discarded session's update cursor is copied onto its connection before
//! the discard replies, and handed to the next session bound there. Updates
//! delivered between the two binds are not reconciled.

mod dispatch;
pub mod events;
mod handle;
mod registry;

pub use events::{
    ConnectionInfo, Event, EventKind, RegistrySnapshot, Reply, SessionBinding, SessionInfo,
};
pub use handle::Manager;
