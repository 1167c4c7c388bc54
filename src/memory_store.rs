use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use crate::model::{
    AccessLog, Card, CardStatus, Group, NewAccessLog, NewCard, NewPermission, Permission,
    Principal, Room,
};
use crate::store::{AccessLogStore, CardStore, PermissionStore, RoomStore};
use crate::types::{CardId, CardIdentifier, GroupId, LogId, PermissionId, RoomId, UserId};
use crate::StoreError;

#[derive(Debug, Error)]
#[error("memory store is offline")]
struct Offline;

/// In-memory store implementation for tests and demos.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    cards: RwLock<BTreeMap<CardId, Card>>,
    rooms: RwLock<HashMap<RoomId, Room>>,
    permissions: RwLock<Vec<Permission>>,
    groups: RwLock<BTreeMap<GroupId, Group>>,
    logs: RwLock<Vec<AccessLog>>,
    next_id: AtomicU64,
    card_saves: AtomicUsize,
    offline: AtomicBool,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn check_online(&self) -> std::result::Result<(), StoreError> {
        if self.inner.offline.load(Ordering::Relaxed) {
            return Err(Box::new(Offline));
        }
        Ok(())
    }

    /// Makes every store call fail until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::Relaxed);
    }

    /// Inserts or replaces a room.
    pub fn put_room(&self, room: Room) {
        let mut guard = self.inner.rooms.write().expect("poisoned lock");
        guard.insert(room.id, room);
    }

    /// Inserts or replaces a card without counting it as a save.
    pub fn put_card(&self, card: Card) {
        let mut guard = self.inner.cards.write().expect("poisoned lock");
        guard.insert(card.id, card);
    }

    /// Inserts a permission row, keeping insertion order.
    pub fn put_permission(&self, permission: NewPermission) -> Permission {
        let stored = Permission {
            id: PermissionId::new(self.next_id()),
            principal: permission.principal,
            room_id: permission.room_id,
            granted_by: permission.granted_by,
            valid_from: permission.valid_from,
            valid_until: permission.valid_until,
            time_restriction: permission.time_restriction,
            active: true,
        };
        let mut guard = self.inner.permissions.write().expect("poisoned lock");
        guard.push(stored.clone());
        stored
    }

    /// Inserts or replaces a group.
    pub fn put_group(&self, group: Group) {
        let mut guard = self.inner.groups.write().expect("poisoned lock");
        guard.insert(group.id, group);
    }

    /// Adds a user to a group.
    pub fn add_group_user(&self, group: GroupId, user: UserId) {
        let mut guard = self.inner.groups.write().expect("poisoned lock");
        if let Some(group) = guard.get_mut(&group) {
            group.users.insert(user);
        }
    }

    /// Removes a user from a group.
    pub fn remove_group_user(&self, group: GroupId, user: UserId) {
        let mut guard = self.inner.groups.write().expect("poisoned lock");
        if let Some(group) = guard.get_mut(&group) {
            group.users.remove(&user);
        }
    }

    /// Adds a room to a group.
    pub fn add_group_room(&self, group: GroupId, room: RoomId) {
        let mut guard = self.inner.groups.write().expect("poisoned lock");
        if let Some(group) = guard.get_mut(&group) {
            group.rooms.insert(room);
        }
    }

    /// Removes a room from a group.
    pub fn remove_group_room(&self, group: GroupId, room: RoomId) {
        let mut guard = self.inner.groups.write().expect("poisoned lock");
        if let Some(group) = guard.get_mut(&group) {
            group.rooms.remove(&room);
        }
    }

    /// Soft-deletes a group.
    pub fn delete_group(&self, group: GroupId, at: DateTime<Utc>) {
        let mut guard = self.inner.groups.write().expect("poisoned lock");
        if let Some(group) = guard.get_mut(&group) {
            group.deleted_at = Some(at);
        }
    }

    /// Returns a snapshot of a card.
    pub fn card(&self, card: CardId) -> Option<Card> {
        let guard = self.inner.cards.read().expect("poisoned lock");
        guard.get(&card).cloned()
    }

    /// Returns every permission row.
    pub fn permissions(&self) -> Vec<Permission> {
        let guard = self.inner.permissions.read().expect("poisoned lock");
        guard.clone()
    }

    /// Returns the audit trail in write order.
    pub fn logs(&self) -> Vec<AccessLog> {
        let guard = self.inner.logs.read().expect("poisoned lock");
        guard.clone()
    }

    /// Returns how many times [`CardStore::save_card`] has been called.
    pub fn card_saves(&self) -> usize {
        self.inner.card_saves.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl CardStore for MemoryStore {
    async fn find_card_by_identifier(
        &self,
        identifier: &CardIdentifier,
    ) -> std::result::Result<Option<Card>, StoreError> {
        self.check_online()?;
        let guard = self.inner.cards.read().expect("poisoned lock");
        Ok(guard
            .values()
            .find(|card| &card.identifier == identifier)
            .cloned())
    }

    async fn find_card(&self, card: CardId) -> std::result::Result<Option<Card>, StoreError> {
        self.check_online()?;
        Ok(self.card(card))
    }

    async fn insert_card(&self, card: NewCard) -> std::result::Result<Card, StoreError> {
        self.check_online()?;
        let mut guard = self.inner.cards.write().expect("poisoned lock");
        if guard.values().any(|existing| existing.identifier == card.identifier) {
            return Err(format!("card identifier {} already registered", card.identifier).into());
        }
        let stored = Card {
            id: CardId::new(self.next_id()),
            identifier: card.identifier,
            status: card.status,
            expiry_date: card.expiry_date,
            issue_date: card.issue_date,
            last_used: None,
            user_id: card.user_id,
        };
        guard.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn save_card(&self, card: &Card) -> std::result::Result<(), StoreError> {
        self.check_online()?;
        let mut guard = self.inner.cards.write().expect("poisoned lock");
        let Some(slot) = guard.get_mut(&card.id) else {
            return Err(format!("card {} does not exist", card.id).into());
        };
        *slot = card.clone();
        self.inner.card_saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn cards_expiring_between(
        &self,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> std::result::Result<Vec<Card>, StoreError> {
        self.check_online()?;
        let guard = self.inner.cards.read().expect("poisoned lock");
        let mut cards: Vec<Card> = guard
            .values()
            .filter(|card| card.status == CardStatus::Active)
            .filter(|card| {
                card.expiry_date
                    .is_some_and(|expiry| from <= expiry && expiry <= until)
            })
            .cloned()
            .collect();
        cards.sort_by_key(|card| card.expiry_date);
        Ok(cards)
    }
}

#[async_trait]
impl RoomStore for MemoryStore {
    async fn find_room(&self, room: RoomId) -> std::result::Result<Option<Room>, StoreError> {
        self.check_online()?;
        let guard = self.inner.rooms.read().expect("poisoned lock");
        Ok(guard.get(&room).cloned())
    }
}

#[async_trait]
impl PermissionStore for MemoryStore {
    async fn permissions_for_card(
        &self,
        card: CardId,
    ) -> std::result::Result<Vec<Permission>, StoreError> {
        self.check_online()?;
        let guard = self.inner.permissions.read().expect("poisoned lock");
        Ok(guard
            .iter()
            .filter(|perm| perm.principal == Principal::Card(card))
            .cloned()
            .collect())
    }

    async fn permissions_for_user(
        &self,
        user: UserId,
        room: RoomId,
    ) -> std::result::Result<Vec<Permission>, StoreError> {
        self.check_online()?;
        let guard = self.inner.permissions.read().expect("poisoned lock");
        Ok(guard
            .iter()
            .filter(|perm| {
                perm.principal == Principal::User(user) && perm.room_id == room && perm.active
            })
            .cloned()
            .collect())
    }

    async fn user_in_group_with_room(
        &self,
        user: UserId,
        room: RoomId,
    ) -> std::result::Result<bool, StoreError> {
        self.check_online()?;
        let guard = self.inner.groups.read().expect("poisoned lock");
        Ok(guard.values().any(|group| group.grants(user, room)))
    }

    async fn create_permission(
        &self,
        permission: NewPermission,
    ) -> std::result::Result<Permission, StoreError> {
        self.check_online()?;
        Ok(self.put_permission(permission))
    }

    async fn deactivate_permissions(
        &self,
        principal: Principal,
        room: RoomId,
    ) -> std::result::Result<usize, StoreError> {
        self.check_online()?;
        let mut guard = self.inner.permissions.write().expect("poisoned lock");
        let mut changed = 0;
        for perm in guard
            .iter_mut()
            .filter(|perm| perm.principal == principal && perm.room_id == room && perm.active)
        {
            perm.active = false;
            changed += 1;
        }
        Ok(changed)
    }
}

#[async_trait]
impl AccessLogStore for MemoryStore {
    async fn create_log(&self, log: NewAccessLog) -> std::result::Result<AccessLog, StoreError> {
        self.check_online()?;
        let stored = AccessLog {
            id: LogId::new(self.next_id()),
            card_id: log.card_id,
            card_identifier: log.card_identifier,
            room_id: log.room_id,
            timestamp: log.timestamp,
            result: log.result,
            denial_reason: log.denial_reason,
            device_id: log.device_id,
        };
        let mut guard = self.inner.logs.write().expect("poisoned lock");
        guard.push(stored.clone());
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use futures::executor::block_on;
    use chrono::{Duration, TimeZone};
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, 10, 0, 0).unwrap()
    }

    fn new_card(identifier: &str, expiry: Option<DateTime<Utc>>) -> NewCard {
        NewCard {
            identifier: CardIdentifier::try_from(identifier).unwrap(),
            user_id: None,
            status: CardStatus::Active,
            expiry_date: expiry,
            issue_date: now(),
        }
    }

    #[test]
    fn insert_card_rejects_duplicate_identifier() {
        let store = MemoryStore::new();
        block_on(store.insert_card(new_card("04A2", None))).unwrap();

        assert!(block_on(store.insert_card(new_card("04A2", None))).is_err());
    }

    #[test]
    fn deactivate_only_touches_matching_rows() {
        let store = MemoryStore::new();
        let card = CardId::new(10);
        for room in [RoomId::new(1), RoomId::new(2)] {
            store.put_permission(NewPermission {
                principal: Principal::Card(card),
                room_id: room,
                granted_by: UserId::new(1),
                valid_from: now(),
                valid_until: None,
                time_restriction: None,
            });
        }

        let changed =
            block_on(store.deactivate_permissions(Principal::Card(card), RoomId::new(1))).unwrap();

        assert_eq!(changed, 1);
        let active: Vec<_> = store.permissions().into_iter().filter(|p| p.active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].room_id, RoomId::new(2));
    }

    #[test]
    fn expiring_cards_are_sorted_and_bounded() {
        let store = MemoryStore::new();
        block_on(store.insert_card(new_card("late", Some(now() + Duration::days(20))))).unwrap();
        block_on(store.insert_card(new_card("soon", Some(now() + Duration::days(2))))).unwrap();
        block_on(store.insert_card(new_card("far", Some(now() + Duration::days(90))))).unwrap();
        block_on(store.insert_card(new_card("past", Some(now() - Duration::days(1))))).unwrap();

        let cards =
            block_on(store.cards_expiring_between(now(), now() + Duration::days(30))).unwrap();
        let ids: Vec<&str> = cards.iter().map(|card| card.identifier.as_str()).collect();

        assert_eq!(ids, vec!["soon", "late"]);
    }

    #[test]
    fn offline_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_offline(true);

        assert!(block_on(store.find_room(RoomId::new(1))).is_err());
    }
}
