//! RFID access-decision engine with a real-time notification hub.
//!
//! [`AccessControl`] evaluates a presented card against a room: card
//! liveness, the room's operating window, then direct card grants, grants to
//! the card's owner, and group membership, in that order. Every decision is
//! written to the audit log and handed to a [`Notify`] sink. A [`Hub`] fans
//! events out to connected subscribers through bounded queues, and
//! [`ClientSession`] pumps one subscriber's queue into any `Sink`/`Stream`
//! transport.
//!
//! # Examples
//!
//! Checking access with the in-memory store (enable `memory-store`):
//! ```no_run
//! # #[cfg(feature = "memory-store")]
//! # {
//! use rfid_access::{AccessControlBuilder, CardIdentifier, MemoryStore, RoomId};
//! let store = MemoryStore::new();
//! let access = AccessControlBuilder::new(store).build();
//! let card = CardIdentifier::try_from("04A23B9F").unwrap();
//! let _ = access.check_access(&card, RoomId::new(1), None);
//! # }
//! ```
//!
//! Wiring a hub with a background dispatcher:
//! ```no_run
//! use rfid_access::{Hub, HubConfig, Notifier};
//! use std::sync::Arc;
//! # async fn run() {
//! let hub = Arc::new(Hub::new(HubConfig::default()));
//! let (notifier, dispatcher) = Notifier::new(hub.clone());
//! tokio::spawn(dispatcher.run());
//! # let _ = notifier;
//! # }
//! ```
#![forbid(unsafe_code)]

mod clock;
mod engine;
mod error;
mod event;
mod hub;
mod model;
mod notify;
mod schedule;
mod session;
mod store;
mod types;

#[cfg(feature = "memory-store")]
mod memory_store;

#[cfg(feature = "axum")]
pub mod axum;

pub use crate::clock::{Clock, FixedClock, SystemClock};
pub use crate::engine::{
    AccessCheck, AccessControl, AccessControlBuilder, AccessResponse, DEFAULT_EXPIRY_WARNING_WINDOW,
    Decision, Grant,
};
pub use crate::error::{Error, Result, StoreError};
pub use crate::event::{
    AccessEvent, Audience, CardAction, CardEvent, CardSummary, Event, ExpiryWarning,
};
pub use crate::hub::{
    DEFAULT_QUEUE_CAPACITY, Delivery, Hub, HubConfig, Message, SubscriberId, SubscriberIdentity,
    Subscription,
};
pub use crate::model::{
    AccessLevel, AccessLog, AccessResult, Card, CardStatus, DenialReason, Group, NewAccessLog,
    NewCard, NewPermission, Permission, Principal, Room,
};
pub use crate::notify::{Dispatcher, NoNotify, Notifier, Notify};
pub use crate::schedule::Schedule;
pub use crate::session::{ClientSession, Frame, SessionEnd, Teardown};
pub use crate::store::{AccessLogStore, CardStore, PermissionStore, RoomStore, Store};
pub use crate::types::{
    CardId, CardIdentifier, DeviceId, GroupId, LogId, PermissionId, RoomId, UserId,
};

#[cfg(feature = "memory-store")]
pub use crate::memory_store::MemoryStore;
