//! Subscriber registry and fan-out.
//!
//! The hub owns one bounded queue per connected subscriber. Publishing
//! encodes an event once and offers it to every matching queue without
//! waiting; a subscriber whose queue is full is dropped so that a stalled
//! consumer never holds up delivery to the others.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::event::{Audience, Event};
use crate::types::UserId;

/// Default number of pending messages per subscriber.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Hub and session tuning.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HubConfig {
    /// Pending messages a subscriber may hold before it is dropped.
    pub queue_capacity: usize,
    /// Interval between liveness pings on an idle session.
    pub ping_period: Duration,
    /// How long a session may go without a pong before it is closed.
    pub pong_wait: Duration,
    /// Upper bound for a single transport write.
    pub write_wait: Duration,
    /// Largest inbound message accepted from a subscriber, in bytes.
    pub max_message_size: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            ping_period: Duration::from_secs(30),
            pong_wait: Duration::from_secs(60),
            write_wait: Duration::from_secs(10),
            max_message_size: 1024,
        }
    }
}

impl HubConfig {
    /// Sets the per-subscriber queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Sets the idle ping interval.
    pub fn with_ping_period(mut self, period: Duration) -> Self {
        self.ping_period = period;
        self
    }

    /// Sets the pong deadline.
    pub fn with_pong_wait(mut self, wait: Duration) -> Self {
        self.pong_wait = wait;
        self
    }

    /// Sets the per-write deadline.
    pub fn with_write_wait(mut self, wait: Duration) -> Self {
        self.write_wait = wait;
        self
    }

    /// Sets the inbound message size limit.
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }
}

/// Who a subscriber is, as established by the transport's authentication.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SubscriberIdentity {
    pub user_id: Option<UserId>,
    pub is_admin: bool,
}

impl SubscriberIdentity {
    /// A subscriber without a valid token.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// An authenticated subscriber.
    pub fn user(user_id: UserId, is_admin: bool) -> Self {
        Self {
            user_id: Some(user_id),
            is_admin,
        }
    }
}

/// Handle identifying one registration with the hub.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Encoded message as queued for subscribers.
pub type Message = Arc<str>;

/// The receiving half of a registration.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriberId,
    pub identity: SubscriberIdentity,
    pub receiver: mpsc::Receiver<Message>,
}

/// Outcome of one publish.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Subscribers the message was queued for.
    pub delivered: usize,
    /// Subscribers dropped because their queue was full or closed.
    pub dropped: usize,
}

#[derive(Debug)]
struct Subscriber {
    identity: SubscriberIdentity,
    sender: mpsc::Sender<Message>,
}

/// Real-time fan-out hub.
#[derive(Debug, Default)]
pub struct Hub {
    config: HubConfig,
    subscribers: RwLock<HashMap<SubscriberId, Subscriber>>,
    next_id: AtomicU64,
}

impl Hub {
    /// Creates an empty hub.
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Returns the hub configuration.
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Registers a subscriber and returns its queue.
    pub fn connect(&self, identity: SubscriberIdentity) -> Subscription {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (sender, receiver) = mpsc::channel(self.config.queue_capacity.max(1));

        let mut guard = self.subscribers.write().expect("poisoned lock");
        guard.insert(id, Subscriber { identity, sender });
        info!(
            subscriber = %id,
            user_id = ?identity.user_id,
            admin = identity.is_admin,
            "subscriber connected"
        );

        Subscription {
            id,
            identity,
            receiver,
        }
    }

    /// Deregisters a subscriber and closes its queue.
    ///
    /// Returns `false` when the subscriber was already gone, which makes
    /// repeated teardown harmless.
    pub fn disconnect(&self, id: SubscriberId) -> bool {
        let mut guard = self.subscribers.write().expect("poisoned lock");
        match guard.remove(&id) {
            Some(subscriber) => {
                info!(
                    subscriber = %id,
                    user_id = ?subscriber.identity.user_id,
                    admin = subscriber.identity.is_admin,
                    "subscriber disconnected"
                );
                true
            }
            None => false,
        }
    }

    /// Returns the number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().expect("poisoned lock").len()
    }

    /// Returns whether a subscriber is still registered.
    pub fn is_connected(&self, id: SubscriberId) -> bool {
        self.subscribers
            .read()
            .expect("poisoned lock")
            .contains_key(&id)
    }

    /// Encodes `event` once and queues it for every subscriber in `audience`.
    ///
    /// Never waits on a subscriber. An encoding failure is logged and aborts
    /// only this publish.
    pub fn publish(&self, audience: Audience, event: &Event) -> Result<Delivery> {
        let encoded = match event.encode(audience) {
            Ok(encoded) => encoded,
            Err(err) => {
                error!(kind = event.kind(), %err, "dropping event that failed to encode");
                return Err(err);
            }
        };
        Ok(self.broadcast(audience, Message::from(encoded)))
    }

    fn broadcast(&self, audience: Audience, message: Message) -> Delivery {
        let mut delivery = Delivery::default();
        let mut overflowed = Vec::new();

        {
            let guard = self.subscribers.read().expect("poisoned lock");
            for (id, subscriber) in guard.iter() {
                if !audience.admits(&subscriber.identity) {
                    continue;
                }
                match subscriber.sender.try_send(message.clone()) {
                    Ok(()) => delivery.delivered += 1,
                    Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                        overflowed.push(*id);
                    }
                }
            }
        }

        if !overflowed.is_empty() {
            let mut guard = self.subscribers.write().expect("poisoned lock");
            for id in overflowed {
                if guard.remove(&id).is_some() {
                    debug!(subscriber = %id, "dropping subscriber with full or closed queue");
                    delivery.dropped += 1;
                }
            }
        }

        delivery
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{CardAction, CardEvent};
    use crate::model::{Card, CardStatus};
    use crate::types::{CardId, CardIdentifier};
    use chrono::{TimeZone, Utc};

    fn event() -> Event {
        let card = Card {
            id: CardId::new(1),
            identifier: CardIdentifier::try_from("04A23B9F").unwrap(),
            status: CardStatus::Active,
            expiry_date: None,
            issue_date: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            last_used: None,
            user_id: Some(UserId::new(7)),
        };
        Event::CardLifecycle(CardEvent::new(CardAction::Created, &card))
    }

    #[test]
    fn full_subscriber_is_dropped_and_others_still_receive() {
        let hub = Hub::new(HubConfig::default());
        let mut subscriptions: Vec<Subscription> = (0..100)
            .map(|i| hub.connect(SubscriberIdentity::user(UserId::new(i), true)))
            .collect();

        let stalled = subscriptions.remove(0);
        for _ in 0..DEFAULT_QUEUE_CAPACITY {
            let delivery = hub.publish(Audience::User(UserId::new(0)), &event()).unwrap();
            assert_eq!(delivery.delivered, 1);
        }

        let delivery = hub.publish(Audience::Admins, &event()).unwrap();

        assert_eq!(delivery, Delivery { delivered: 99, dropped: 1 });
        assert!(!hub.is_connected(stalled.id));
        assert_eq!(hub.subscriber_count(), 99);
        for subscription in &mut subscriptions {
            let message = subscription.receiver.try_recv().expect("queued message");
            assert!(message.contains("\"admin\":true"));
        }
    }

    #[test]
    fn dropped_subscriber_queue_is_closed_after_draining() {
        let hub = Hub::new(HubConfig::default().with_queue_capacity(1));
        let mut subscription = hub.connect(SubscriberIdentity::anonymous());

        hub.publish(Audience::Everyone, &event()).unwrap();
        let delivery = hub.publish(Audience::Everyone, &event()).unwrap();

        assert_eq!(delivery.dropped, 1);
        assert!(subscription.receiver.try_recv().is_ok());
        assert!(matches!(
            subscription.receiver.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn publish_only_reaches_matching_audience() {
        let hub = Hub::new(HubConfig::default());
        let mut anonymous = hub.connect(SubscriberIdentity::anonymous());
        let mut owner = hub.connect(SubscriberIdentity::user(UserId::new(7), false));
        let mut admin = hub.connect(SubscriberIdentity::user(UserId::new(1), true));

        let delivery = hub.publish(Audience::User(UserId::new(7)), &event()).unwrap();
        assert_eq!(delivery.delivered, 1);
        assert!(owner.receiver.try_recv().is_ok());
        assert!(admin.receiver.try_recv().is_err());

        let delivery = hub.publish(Audience::Authenticated, &event()).unwrap();
        assert_eq!(delivery.delivered, 2);
        assert!(anonymous.receiver.try_recv().is_err());

        let delivery = hub.publish(Audience::Everyone, &event()).unwrap();
        assert_eq!(delivery.delivered, 3);
    }

    #[test]
    fn disconnect_twice_is_harmless() {
        let hub = Hub::new(HubConfig::default());
        let mut subscription = hub.connect(SubscriberIdentity::anonymous());

        assert!(hub.disconnect(subscription.id));
        assert!(!hub.disconnect(subscription.id));
        assert_eq!(hub.subscriber_count(), 0);
        assert!(matches!(
            subscription.receiver.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn subscriber_with_dropped_receiver_is_pruned() {
        let hub = Hub::new(HubConfig::default());
        let subscription = hub.connect(SubscriberIdentity::anonymous());
        drop(subscription);

        let delivery = hub.publish(Audience::Everyone, &event()).unwrap();

        assert_eq!(delivery, Delivery { delivered: 0, dropped: 1 });
        assert_eq!(hub.subscriber_count(), 0);
    }
}
