use crate::error::StoreError;
use crate::model::{AccessLog, Card, NewAccessLog, NewCard, NewPermission, Permission, Principal, Room};
use crate::types::{CardId, CardIdentifier, RoomId, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Store interface for cards.
#[async_trait]
pub trait CardStore {
    /// Looks up a card by its plaintext identifier.
    async fn find_card_by_identifier(
        &self,
        identifier: &CardIdentifier,
    ) -> std::result::Result<Option<Card>, StoreError>;

    /// Looks up a card by row id.
    async fn find_card(&self, card: CardId) -> std::result::Result<Option<Card>, StoreError>;

    /// Inserts a new card and returns the stored row.
    async fn insert_card(&self, card: NewCard) -> std::result::Result<Card, StoreError>;

    /// Persists every mutable field of an existing card.
    async fn save_card(&self, card: &Card) -> std::result::Result<(), StoreError>;

    /// Returns active cards whose expiry lies within `[from, until]`, soonest first.
    async fn cards_expiring_between(
        &self,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> std::result::Result<Vec<Card>, StoreError>;
}

/// Store interface for rooms.
#[async_trait]
pub trait RoomStore {
    /// Looks up a room by row id.
    async fn find_room(&self, room: RoomId) -> std::result::Result<Option<Room>, StoreError>;
}

/// Store interface for direct and group-inherited grants.
#[async_trait]
pub trait PermissionStore {
    /// Returns every permission attached to a card, for any room.
    async fn permissions_for_card(
        &self,
        card: CardId,
    ) -> std::result::Result<Vec<Permission>, StoreError>;

    /// Returns active permissions attached to a user for one room.
    async fn permissions_for_user(
        &self,
        user: UserId,
        room: RoomId,
    ) -> std::result::Result<Vec<Permission>, StoreError>;

    /// Returns whether the user belongs to a non-deleted group that lists the room.
    async fn user_in_group_with_room(
        &self,
        user: UserId,
        room: RoomId,
    ) -> std::result::Result<bool, StoreError>;

    /// Inserts a new active permission.
    async fn create_permission(
        &self,
        permission: NewPermission,
    ) -> std::result::Result<Permission, StoreError>;

    /// Marks every permission of `principal` for `room` inactive; returns the count.
    async fn deactivate_permissions(
        &self,
        principal: Principal,
        room: RoomId,
    ) -> std::result::Result<usize, StoreError>;
}

/// Append-only audit sink.
#[async_trait]
pub trait AccessLogStore {
    /// Appends one access log record.
    async fn create_log(&self, log: NewAccessLog) -> std::result::Result<AccessLog, StoreError>;
}

/// Composite store trait.
pub trait Store: CardStore + RoomStore + PermissionStore + AccessLogStore + Send + Sync {}

impl<T> Store for T where T: CardStore + RoomStore + PermissionStore + AccessLogStore + Send + Sync {}
