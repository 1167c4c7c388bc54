//! Entities supplied by the data store and the audit records produced by
//! access checks.

use crate::error::{Error, Result};
use crate::schedule::Schedule;
use crate::types::{
    CardId, CardIdentifier, DeviceId, GroupId, LogId, PermissionId, RoomId, UserId,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Lifecycle status of a card.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardStatus {
    Active,
    Blocked,
    Revoked,
    Expired,
    Pending,
}

impl CardStatus {
    /// Returns the wire name of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Blocked => "blocked",
            Self::Revoked => "revoked",
            Self::Expired => "expired",
            Self::Pending => "pending",
        }
    }

    /// Returns the denial reason for a non-active status.
    pub fn denial_reason(self) -> Option<DenialReason> {
        match self {
            Self::Active => None,
            Self::Blocked => Some(DenialReason::CardBlocked),
            Self::Revoked => Some(DenialReason::CardRevoked),
            Self::Expired => Some(DenialReason::CardExpired),
            Self::Pending => Some(DenialReason::CardInactive),
        }
    }
}

impl fmt::Display for CardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An RFID credential.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    pub id: CardId,
    pub identifier: CardIdentifier,
    pub status: CardStatus,
    pub expiry_date: Option<DateTime<Utc>>,
    pub issue_date: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
    /// Owning user; `None` for an unassigned card.
    pub user_id: Option<UserId>,
}

impl Card {
    /// Returns the status the card has at `now`.
    ///
    /// An active card whose expiry lies in the past reads as
    /// [`CardStatus::Expired`]; the stored status is not touched here.
    pub fn status_at(&self, now: DateTime<Utc>) -> CardStatus {
        match (self.status, self.expiry_date) {
            (CardStatus::Active, Some(expiry)) if now > expiry => CardStatus::Expired,
            (status, _) => status,
        }
    }
}

/// Values for registering a new card.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewCard {
    pub identifier: CardIdentifier,
    pub user_id: Option<UserId>,
    pub status: CardStatus,
    pub expiry_date: Option<DateTime<Utc>>,
    pub issue_date: DateTime<Utc>,
}

/// Room access level.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    Public,
    Restricted,
    Admin,
}

/// A physical room guarded by one or more readers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub building: String,
    pub room_number: String,
    pub access_level: AccessLevel,
    /// Weekday digits, `0` = Sunday; empty means every day.
    pub operating_days: String,
    /// `HH:MM-HH:MM`; empty means always open. A close time earlier than
    /// the open time wraps past midnight.
    pub operating_hours: String,
}

impl Room {
    /// Creates a restricted room that is always open.
    pub fn new(id: RoomId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            building: String::new(),
            room_number: String::new(),
            access_level: AccessLevel::Restricted,
            operating_days: String::new(),
            operating_hours: String::new(),
        }
    }

    /// Public rooms skip permission checks entirely.
    pub fn is_public(&self) -> bool {
        self.access_level == AccessLevel::Public
    }

    /// Returns whether the room's operating window contains `local`.
    pub fn is_open_at(&self, local: NaiveDateTime) -> bool {
        Schedule::parse(&self.operating_days, &self.operating_hours).contains(local)
    }
}

/// The holder of a permission: a card or a user, never both.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Principal {
    Card(CardId),
    User(UserId),
}

impl Principal {
    /// Builds a principal from nullable columns, rejecting both or neither.
    pub fn from_parts(card: Option<CardId>, user: Option<UserId>) -> Result<Self> {
        match (card, user) {
            (Some(card), None) => Ok(Self::Card(card)),
            (None, Some(user)) => Ok(Self::User(user)),
            (Some(_), Some(_)) => Err(Error::InvalidPermission(
                "permission must not target both a card and a user".to_string(),
            )),
            (None, None) => Err(Error::InvalidPermission(
                "permission must target a card or a user".to_string(),
            )),
        }
    }
}

/// A grant of access to one room.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub id: PermissionId,
    pub principal: Principal,
    pub room_id: RoomId,
    pub granted_by: UserId,
    pub valid_from: DateTime<Utc>,
    pub valid_until: Option<DateTime<Utc>>,
    /// Carried for compatibility; never evaluated.
    pub time_restriction: Option<String>,
    pub active: bool,
}

impl Permission {
    /// Returns whether the permission is active and its window contains `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.active
            && self.valid_from <= now
            && self.valid_until.is_none_or(|until| now <= until)
    }

    /// Returns whether the permission opens `room` at `now`.
    pub fn grants(&self, room: RoomId, now: DateTime<Utc>) -> bool {
        self.room_id == room && self.is_valid_at(now)
    }
}

/// Values for creating a permission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewPermission {
    pub principal: Principal,
    pub room_id: RoomId,
    pub granted_by: UserId,
    pub valid_from: DateTime<Utc>,
    pub valid_until: Option<DateTime<Utc>>,
    pub time_restriction: Option<String>,
}

/// Named collection of users and rooms.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub description: String,
    /// Informational only; access never walks the parent chain.
    pub parent_id: Option<GroupId>,
    pub users: BTreeSet<UserId>,
    pub rooms: BTreeSet<RoomId>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Group {
    /// Returns whether membership in this group opens `room` for `user`.
    pub fn grants(&self, user: UserId, room: RoomId) -> bool {
        self.deleted_at.is_none() && self.users.contains(&user) && self.rooms.contains(&room)
    }
}

/// Outcome recorded in an access log.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessResult {
    Granted,
    Denied,
}

impl AccessResult {
    /// Returns the wire name of the result.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Granted => "granted",
            Self::Denied => "denied",
        }
    }
}

/// Why an access check was refused.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    NoPermission,
    CardInactive,
    CardExpired,
    OutsideHours,
    CardBlocked,
    CardRevoked,
}

impl DenialReason {
    /// Returns the reason code.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoPermission => "no_permission",
            Self::CardInactive => "card_inactive",
            Self::CardExpired => "card_expired",
            Self::OutsideHours => "outside_hours",
            Self::CardBlocked => "card_blocked",
            Self::CardRevoked => "card_revoked",
        }
    }

    /// Returns a message suitable for display at a reader or in the admin UI.
    pub fn text(self) -> &'static str {
        match self {
            Self::NoPermission => "No permission for this room",
            Self::CardInactive => "The card is not active",
            Self::CardExpired => "The card has expired",
            Self::OutsideHours => "Access attempted outside operating hours",
            Self::CardBlocked => "The card is blocked",
            Self::CardRevoked => "The card has been revoked",
        }
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable audit record of one access check.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessLog {
    pub id: LogId,
    /// `None` when the presented identifier matched no card.
    pub card_id: Option<CardId>,
    pub card_identifier: CardIdentifier,
    pub room_id: RoomId,
    pub timestamp: DateTime<Utc>,
    pub result: AccessResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denial_reason: Option<DenialReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,
}

/// Values for appending an access log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewAccessLog {
    pub card_id: Option<CardId>,
    pub card_identifier: CardIdentifier,
    pub room_id: RoomId,
    pub timestamp: DateTime<Utc>,
    pub result: AccessResult,
    pub denial_reason: Option<DenialReason>,
    pub device_id: Option<DeviceId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, 10, 0, 0).unwrap()
    }

    fn card(status: CardStatus, expiry: Option<DateTime<Utc>>) -> Card {
        Card {
            id: CardId::new(1),
            identifier: CardIdentifier::try_from("04A23B9F").unwrap(),
            status,
            expiry_date: expiry,
            issue_date: now() - Duration::days(30),
            last_used: None,
            user_id: Some(UserId::new(1)),
        }
    }

    fn permission(valid_until: Option<DateTime<Utc>>) -> Permission {
        Permission {
            id: PermissionId::new(1),
            principal: Principal::Card(CardId::new(1)),
            room_id: RoomId::new(3),
            granted_by: UserId::new(9),
            valid_from: now() - Duration::hours(1),
            valid_until,
            time_restriction: None,
            active: true,
        }
    }

    #[test]
    fn active_card_past_expiry_reads_as_expired() {
        let card = card(CardStatus::Active, Some(now() - Duration::seconds(1)));
        assert_eq!(card.status_at(now()), CardStatus::Expired);
        assert_eq!(card.status, CardStatus::Active);
    }

    #[test]
    fn blocked_card_keeps_status_past_expiry() {
        let card = card(CardStatus::Blocked, Some(now() - Duration::days(1)));
        assert_eq!(card.status_at(now()), CardStatus::Blocked);
    }

    #[test]
    fn status_maps_to_denial_reason() {
        assert_eq!(CardStatus::Active.denial_reason(), None);
        assert_eq!(
            CardStatus::Pending.denial_reason(),
            Some(DenialReason::CardInactive)
        );
        assert_eq!(
            CardStatus::Revoked.denial_reason(),
            Some(DenialReason::CardRevoked)
        );
    }

    #[test]
    fn permission_window_is_inclusive() {
        let until = now();
        assert!(permission(Some(until)).is_valid_at(now()));
        assert!(!permission(Some(until)).is_valid_at(now() + Duration::seconds(1)));
        assert!(permission(None).is_valid_at(now() + Duration::days(3650)));
    }

    #[test]
    fn inactive_permission_never_grants() {
        let mut perm = permission(None);
        perm.active = false;
        assert!(!perm.grants(RoomId::new(3), now()));
    }

    #[test]
    fn principal_rejects_both_and_neither() {
        assert!(matches!(
            Principal::from_parts(Some(CardId::new(1)), Some(UserId::new(1))),
            Err(Error::InvalidPermission(_))
        ));
        assert!(matches!(
            Principal::from_parts(None, None),
            Err(Error::InvalidPermission(_))
        ));
        assert_eq!(
            Principal::from_parts(None, Some(UserId::new(2))).unwrap(),
            Principal::User(UserId::new(2))
        );
    }

    #[test]
    fn deleted_group_grants_nothing() {
        let mut group = Group {
            id: GroupId::new(1),
            name: "lab".to_string(),
            users: BTreeSet::from([UserId::new(5)]),
            rooms: BTreeSet::from([RoomId::new(3)]),
            ..Group::default()
        };
        assert!(group.grants(UserId::new(5), RoomId::new(3)));
        group.deleted_at = Some(now());
        assert!(!group.grants(UserId::new(5), RoomId::new(3)));
    }
}
