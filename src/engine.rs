use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::event::{AccessEvent, CardAction, CardEvent, Event, ExpiryWarning};
use crate::model::{
    AccessResult, Card, CardStatus, DenialReason, NewAccessLog, NewCard, NewPermission,
    Permission, Principal, Room,
};
use crate::notify::{NoNotify, Notify};
use crate::store::Store;
use crate::types::{CardId, CardIdentifier, DeviceId, PermissionId, RoomId, UserId};
use chrono::{DateTime, Duration, FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Look-ahead used when warning about cards that are about to expire.
pub const DEFAULT_EXPIRY_WARNING_WINDOW: Duration = Duration::days(30);

/// Access decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Entry is granted.
    Granted,
    /// Entry is refused for the given reason.
    Denied(DenialReason),
}

impl Decision {
    /// Returns the denial reason, if any.
    pub fn reason(self) -> Option<DenialReason> {
        match self {
            Self::Granted => None,
            Self::Denied(reason) => Some(reason),
        }
    }

    fn from_reason(reason: Option<DenialReason>) -> Self {
        reason.map_or(Self::Granted, Self::Denied)
    }
}

/// Outcome of one access check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessCheck {
    pub decision: Decision,
    /// Evaluation instant, also used for the audit record.
    pub timestamp: DateTime<Utc>,
}

impl AccessCheck {
    /// Returns whether entry was granted.
    pub fn granted(&self) -> bool {
        self.decision == Decision::Granted
    }

    /// Returns the denial code, empty when granted.
    pub fn reason_code(&self) -> &'static str {
        self.decision.reason().map_or("", DenialReason::as_str)
    }

    /// Returns the human-readable denial text, empty when granted.
    pub fn reason_text(&self) -> &'static str {
        self.decision.reason().map_or("", DenialReason::text)
    }
}

/// Reader-facing shape of an [`AccessCheck`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessResponse {
    pub granted: bool,
    pub reason_code: String,
    pub reason_text: String,
    pub timestamp: DateTime<Utc>,
}

impl From<AccessCheck> for AccessResponse {
    fn from(check: AccessCheck) -> Self {
        Self {
            granted: check.granted(),
            reason_code: check.reason_code().to_string(),
            reason_text: check.reason_text().to_string(),
            timestamp: check.timestamp,
        }
    }
}

/// Options for a new permission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub granted_by: UserId,
    pub valid_until: Option<DateTime<Utc>>,
    /// Stored verbatim; not evaluated.
    pub time_restriction: Option<String>,
}

impl Grant {
    /// An open-ended grant issued by `granted_by`.
    pub fn by(granted_by: UserId) -> Self {
        Self {
            granted_by,
            valid_until: None,
            time_restriction: None,
        }
    }

    /// Ends the grant at `until`, inclusive.
    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.valid_until = Some(until);
        self
    }

    /// Attaches a time restriction expression.
    pub fn time_restriction(mut self, expression: impl Into<String>) -> Self {
        self.time_restriction = Some(expression.into());
        self
    }
}

/// Which rule opened the door.
#[derive(Debug, Clone, Copy)]
enum GrantedBy {
    PublicRoom,
    Card(PermissionId),
    User(PermissionId),
    Group,
}

/// Inputs shared by every terminal branch of a check.
struct Attempt<'a> {
    identifier: &'a CardIdentifier,
    room_id: RoomId,
    device: Option<&'a DeviceId>,
    now: DateTime<Utc>,
}

/// Access evaluator with a pluggable store and optional notifier.
pub struct AccessControl<S, N = NoNotify> {
    store: S,
    notifier: N,
    clock: Arc<dyn Clock>,
    utc_offset: FixedOffset,
}

/// Builder for [`AccessControl`].
pub struct AccessControlBuilder<S, N = NoNotify> {
    store: S,
    notifier: N,
    clock: Arc<dyn Clock>,
    utc_offset: FixedOffset,
}

impl<S> AccessControlBuilder<S, NoNotify> {
    /// Creates a builder using the system clock, UTC operating hours and no notifier.
    pub fn new(store: S) -> Self {
        Self {
            store,
            notifier: NoNotify,
            clock: Arc::new(SystemClock),
            utc_offset: Utc.fix(),
        }
    }
}

impl<S, N> AccessControlBuilder<S, N> {
    /// Sets the sink for access and card events.
    pub fn notifier<N2: Notify>(self, notifier: N2) -> AccessControlBuilder<S, N2> {
        AccessControlBuilder {
            store: self.store,
            notifier,
            clock: self.clock,
            utc_offset: self.utc_offset,
        }
    }

    /// Sets the time source.
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Sets the offset in which room operating hours are read.
    pub fn utc_offset(mut self, offset: FixedOffset) -> Self {
        self.utc_offset = offset;
        self
    }

    /// Builds the evaluator.
    pub fn build(self) -> AccessControl<S, N> {
        AccessControl {
            store: self.store,
            notifier: self.notifier,
            clock: self.clock,
            utc_offset: self.utc_offset,
        }
    }
}

impl<S, N> AccessControl<S, N>
where
    S: Store,
    N: Notify,
{
    /// Returns the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Decides whether the card presented as `identifier` may enter `room_id`.
    ///
    /// Every decision is logged before it is published. Denials are returned
    /// as [`Decision::Denied`]; only store failures and a missing room are
    /// errors.
    pub async fn check_access(
        &self,
        identifier: &CardIdentifier,
        room_id: RoomId,
        device: Option<&DeviceId>,
    ) -> Result<AccessCheck> {
        let attempt = Attempt {
            identifier,
            room_id,
            device,
            now: self.clock.now(),
        };

        let Some(mut card) = self
            .store
            .find_card_by_identifier(identifier)
            .await
            .map_err(Error::from)?
        else {
            debug!(card = %identifier, "unknown card presented");
            return self
                .finish(&attempt, None, None, Some(DenialReason::NoPermission))
                .await;
        };

        let status = card.status_at(attempt.now);
        if status != card.status {
            card.status = status;
            self.store.save_card(&card).await.map_err(Error::from)?;
            info!(card = %card.id, "card expired");
        }
        if let Some(reason) = status.denial_reason() {
            return self.finish(&attempt, Some(&card), None, Some(reason)).await;
        }

        let room = self
            .store
            .find_room(room_id)
            .await
            .map_err(Error::from)?
            .ok_or(Error::RoomNotFound(room_id))?;

        let local = attempt.now.with_timezone(&self.utc_offset).naive_local();
        if !room.is_open_at(local) {
            return self
                .finish(&attempt, Some(&card), Some(&room), Some(DenialReason::OutsideHours))
                .await;
        }

        let Some(rule) = self.matching_rule(&card, &room, attempt.now).await? else {
            return self
                .finish(&attempt, Some(&card), Some(&room), Some(DenialReason::NoPermission))
                .await;
        };
        debug!(card = %card.id, room = %room.id, ?rule, "access granted");

        card.last_used = Some(attempt.now);
        self.store.save_card(&card).await.map_err(Error::from)?;
        self.finish(&attempt, Some(&card), Some(&room), None).await
    }

    async fn matching_rule(
        &self,
        card: &Card,
        room: &Room,
        now: DateTime<Utc>,
    ) -> Result<Option<GrantedBy>> {
        if room.is_public() {
            return Ok(Some(GrantedBy::PublicRoom));
        }

        let direct = self
            .store
            .permissions_for_card(card.id)
            .await
            .map_err(Error::from)?;
        if let Some(perm) = direct.iter().find(|perm| perm.grants(room.id, now)) {
            return Ok(Some(GrantedBy::Card(perm.id)));
        }

        let Some(owner) = card.user_id else {
            return Ok(None);
        };

        let by_user = self
            .store
            .permissions_for_user(owner, room.id)
            .await
            .map_err(Error::from)?;
        if let Some(perm) = by_user.iter().find(|perm| perm.grants(room.id, now)) {
            return Ok(Some(GrantedBy::User(perm.id)));
        }

        let in_group = self
            .store
            .user_in_group_with_room(owner, room.id)
            .await
            .map_err(Error::from)?;
        Ok(in_group.then_some(GrantedBy::Group))
    }

    async fn finish(
        &self,
        attempt: &Attempt<'_>,
        card: Option<&Card>,
        room: Option<&Room>,
        reason: Option<DenialReason>,
    ) -> Result<AccessCheck> {
        let result = if reason.is_some() {
            AccessResult::Denied
        } else {
            AccessResult::Granted
        };
        self.store
            .create_log(NewAccessLog {
                card_id: card.map(|card| card.id),
                card_identifier: attempt.identifier.clone(),
                room_id: attempt.room_id,
                timestamp: attempt.now,
                result,
                denial_reason: reason,
                device_id: attempt.device.cloned(),
            })
            .await
            .map_err(Error::from)?;

        if let Some(reason) = reason {
            info!(card = %attempt.identifier, room = %attempt.room_id, %reason, "access denied");
        }

        let event = AccessEvent::new(
            card,
            attempt.identifier,
            attempt.room_id,
            room,
            reason,
            attempt.device,
            attempt.now,
        );
        self.notifier.notify_admins_and_owner(
            Event::AccessDecision(event),
            card.and_then(|card| card.user_id),
        );

        Ok(AccessCheck {
            decision: Decision::from_reason(reason),
            timestamp: attempt.now,
        })
    }

    /// Registers a new active card, optionally owned by `user`.
    pub async fn register_card(
        &self,
        user: Option<UserId>,
        identifier: &str,
        expiry_date: Option<DateTime<Utc>>,
    ) -> Result<Card> {
        let identifier = CardIdentifier::new(identifier)?;
        let card = self
            .store
            .insert_card(NewCard {
                identifier,
                user_id: user,
                status: CardStatus::Active,
                expiry_date,
                issue_date: self.clock.now(),
            })
            .await
            .map_err(Error::from)?;

        info!(card = %card.id, identifier = %card.identifier, "card registered");
        self.publish_card_event(CardAction::Created, &card);
        Ok(card)
    }

    /// Blocks a card. Revoked cards cannot be blocked.
    pub async fn block_card(&self, card: CardId) -> Result<Card> {
        self.transition(card, CardStatus::Blocked, CardAction::Blocked)
            .await
    }

    /// Reactivates a blocked card.
    pub async fn unblock_card(&self, card: CardId) -> Result<Card> {
        self.transition(card, CardStatus::Active, CardAction::Unblocked)
            .await
    }

    /// Permanently revokes a card.
    pub async fn revoke_card(&self, card: CardId) -> Result<Card> {
        self.transition(card, CardStatus::Revoked, CardAction::Revoked)
            .await
    }

    async fn transition(&self, id: CardId, to: CardStatus, action: CardAction) -> Result<Card> {
        let mut card = self
            .store
            .find_card(id)
            .await
            .map_err(Error::from)?
            .ok_or(Error::CardNotFound(id))?;

        let from = card.status;
        if !transition_allowed(from, to) {
            return Err(Error::InvalidCardTransition { card: id, from, to });
        }

        card.status = to;
        self.store.save_card(&card).await.map_err(Error::from)?;
        info!(card = %id, %from, %to, "card status changed");
        self.publish_card_event(action, &card);
        Ok(card)
    }

    fn publish_card_event(&self, action: CardAction, card: &Card) {
        self.notifier.notify_admins_and_owner(
            Event::CardLifecycle(CardEvent::new(action, card)),
            card.user_id,
        );
    }

    /// Grants `card` access to `room`, valid from now.
    pub async fn grant_card_access(
        &self,
        card: CardId,
        room: RoomId,
        grant: Grant,
    ) -> Result<Permission> {
        self.store
            .find_card(card)
            .await
            .map_err(Error::from)?
            .ok_or(Error::CardNotFound(card))?;
        self.grant(Principal::Card(card), room, grant).await
    }

    /// Grants every card owned by `user` access to `room`, valid from now.
    pub async fn grant_user_access(
        &self,
        user: UserId,
        room: RoomId,
        grant: Grant,
    ) -> Result<Permission> {
        self.grant(Principal::User(user), room, grant).await
    }

    async fn grant(&self, principal: Principal, room: RoomId, grant: Grant) -> Result<Permission> {
        self.store
            .find_room(room)
            .await
            .map_err(Error::from)?
            .ok_or(Error::RoomNotFound(room))?;

        let now = self.clock.now();
        if grant.valid_until.is_some_and(|until| until < now) {
            return Err(Error::InvalidPermission(
                "validity end lies before validity start".to_string(),
            ));
        }

        let permission = self
            .store
            .create_permission(NewPermission {
                principal,
                room_id: room,
                granted_by: grant.granted_by,
                valid_from: now,
                valid_until: grant.valid_until,
                time_restriction: grant.time_restriction,
            })
            .await
            .map_err(Error::from)?;
        info!(permission = %permission.id, ?principal, %room, "permission granted");
        Ok(permission)
    }

    /// Deactivates every grant of `card` for `room`; returns how many changed.
    pub async fn revoke_card_access(&self, card: CardId, room: RoomId) -> Result<usize> {
        self.revoke(Principal::Card(card), room).await
    }

    /// Deactivates every grant of `user` for `room`; returns how many changed.
    pub async fn revoke_user_access(&self, user: UserId, room: RoomId) -> Result<usize> {
        self.revoke(Principal::User(user), room).await
    }

    async fn revoke(&self, principal: Principal, room: RoomId) -> Result<usize> {
        let changed = self
            .store
            .deactivate_permissions(principal, room)
            .await
            .map_err(Error::from)?;
        info!(?principal, %room, changed, "permissions revoked");
        Ok(changed)
    }

    /// Publishes a `card_expiry` warning for each active card expiring within
    /// `within` from now, and returns those cards.
    ///
    /// A window reaching past the representable range is clamped to it.
    pub async fn notify_expiring_cards(&self, within: Duration) -> Result<Vec<Card>> {
        let now = self.clock.now();
        let until = now.checked_add_signed(within).unwrap_or(if within < Duration::zero() {
            DateTime::<Utc>::MIN_UTC
        } else {
            DateTime::<Utc>::MAX_UTC
        });
        let cards = self
            .store
            .cards_expiring_between(now, until)
            .await
            .map_err(Error::from)?;

        for card in &cards {
            let Some(expiry_date) = card.expiry_date else {
                continue;
            };
            let warning = ExpiryWarning {
                card_id: card.id,
                card_identifier: card.identifier.clone(),
                user_id: card.user_id,
                expiry_date,
                days_left: (expiry_date - now).num_days(),
            };
            self.notifier
                .notify_admins_and_owner(Event::ExpiryWarning(warning), card.user_id);
        }
        debug!(count = cards.len(), "expiry warnings published");
        Ok(cards)
    }
}

fn transition_allowed(from: CardStatus, to: CardStatus) -> bool {
    match to {
        CardStatus::Blocked => from != CardStatus::Revoked,
        CardStatus::Active => from == CardStatus::Blocked,
        CardStatus::Revoked => true,
        CardStatus::Expired | CardStatus::Pending => false,
    }
}
