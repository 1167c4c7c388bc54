//! Real-time event payloads and their wire envelope.
//!
//! Every event travels as
//! `{"type": ..., "content": ..., "user_id"?: ..., "admin"?: true}` where
//! `user_id` is present only for user-scoped deliveries and `admin` only for
//! admin-scoped ones.

use crate::error::Result;
use crate::hub::SubscriberIdentity;
use crate::model::{AccessResult, Card, CardStatus, DenialReason, Room};
use crate::types::{CardId, CardIdentifier, DeviceId, RoomId, UserId};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Which subscribers receive a published event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Audience {
    /// Every connected subscriber, authenticated or not.
    Everyone,
    /// Subscribers whose token carries the admin flag.
    Admins,
    /// Subscribers with a user identity.
    Authenticated,
    /// Subscribers authenticated as one specific user.
    User(UserId),
}

impl Audience {
    /// Returns whether a subscriber with `identity` is part of this audience.
    pub fn admits(&self, identity: &SubscriberIdentity) -> bool {
        match self {
            Self::Everyone => true,
            Self::Admins => identity.is_admin,
            Self::Authenticated => identity.user_id.is_some(),
            Self::User(user) => identity.user_id == Some(*user),
        }
    }
}

/// Closed set of events pushed to subscribers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Event {
    /// A card was created, changed, or moved through its lifecycle.
    CardLifecycle(CardEvent),
    /// An access check reached a decision.
    AccessDecision(AccessEvent),
    /// A card will expire soon.
    ExpiryWarning(ExpiryWarning),
}

impl Event {
    /// Returns the `type` value used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CardLifecycle(_) => "card_event",
            Self::AccessDecision(_) => "access_event",
            Self::ExpiryWarning(_) => "card_expiry",
        }
    }

    /// Serializes the event for `audience`.
    pub fn encode(&self, audience: Audience) -> Result<String> {
        let envelope = Envelope {
            kind: self.kind(),
            content: self,
            user_id: match audience {
                Audience::User(user) => Some(user),
                _ => None,
            },
            admin: audience == Audience::Admins,
        };
        Ok(serde_json::to_string(&envelope)?)
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    content: &'a Event,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<UserId>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    admin: bool,
}

/// Card fields shared by event payloads.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CardSummary {
    pub id: CardId,
    pub card_id: CardIdentifier,
    pub status: CardStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
}

impl From<&Card> for CardSummary {
    fn from(card: &Card) -> Self {
        Self {
            id: card.id,
            card_id: card.identifier.clone(),
            status: card.status,
            expiry: card.expiry_date,
        }
    }
}

/// Lifecycle change applied to a card.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum CardAction {
    #[serde(rename = "card_created")]
    Created,
    #[serde(rename = "card_updated")]
    Updated,
    #[serde(rename = "card_deleted")]
    Deleted,
    #[serde(rename = "card_blocked")]
    Blocked,
    #[serde(rename = "card_unblocked")]
    Unblocked,
    #[serde(rename = "card_revoked")]
    Revoked,
}

/// Payload of a `card_event`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CardEvent {
    pub action: CardAction,
    pub card: CardSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

impl CardEvent {
    /// Describes `action` applied to `card`.
    pub fn new(action: CardAction, card: &Card) -> Self {
        Self {
            action,
            card: CardSummary::from(card),
            user_id: card.user_id,
        }
    }
}

/// Payload of an `access_event`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AccessEvent {
    /// Absent when the presented identifier matched no card.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub card: Option<CardSummary>,
    pub card_identifier: CardIdentifier,
    pub room_id: RoomId,
    /// Absent when the decision was reached before the room was loaded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    pub result: AccessResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenialReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,
    pub timestamp: DateTime<Utc>,
}

impl AccessEvent {
    pub(crate) fn new(
        card: Option<&Card>,
        card_identifier: &CardIdentifier,
        room_id: RoomId,
        room: Option<&Room>,
        reason: Option<DenialReason>,
        device_id: Option<&DeviceId>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            card: card.map(CardSummary::from),
            card_identifier: card_identifier.clone(),
            room_id,
            room_name: room.map(|room| room.name.clone()),
            user_id: card.and_then(|card| card.user_id),
            result: if reason.is_some() {
                AccessResult::Denied
            } else {
                AccessResult::Granted
            },
            reason,
            device_id: device_id.cloned(),
            timestamp,
        }
    }
}

/// Payload of a `card_expiry` warning.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExpiryWarning {
    pub card_id: CardId,
    pub card_identifier: CardIdentifier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    pub expiry_date: DateTime<Utc>,
    pub days_left: i64,
}
