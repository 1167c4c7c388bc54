use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc;
use tracing::debug;

use crate::event::{Audience, Event};
use crate::hub::Hub;
use crate::types::UserId;

/// Sink for events raised by access checks and card lifecycle changes.
///
/// Implementations must not block the caller.
pub trait Notify: Send + Sync {
    /// Hands an event over for delivery.
    fn notify(&self, audience: Audience, event: Event);

    /// Sends `event` to all admins and, when present, to the owning user.
    fn notify_admins_and_owner(&self, event: Event, owner: Option<UserId>) {
        match owner {
            Some(owner) => {
                self.notify(Audience::Admins, event.clone());
                self.notify(Audience::User(owner), event);
            }
            None => self.notify(Audience::Admins, event),
        }
    }
}

/// No-op notifier used when no hub is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoNotify;

impl Notify for NoNotify {
    fn notify(&self, _audience: Audience, _event: Event) {}
}

/// Publishes on the caller's task.
impl Notify for Arc<Hub> {
    fn notify(&self, audience: Audience, event: Event) {
        // Encoding failures are already logged by the hub.
        let _ = self.publish(audience, &event);
    }
}

#[derive(Debug)]
struct Notification {
    audience: Audience,
    event: Event,
}

/// Cloneable handle that queues events for the hub's dispatch loop.
#[derive(Debug, Clone)]
pub struct Notifier {
    sender: mpsc::UnboundedSender<Notification>,
    pending: Arc<AtomicUsize>,
}

impl Notifier {
    /// Creates a notifier and the dispatch loop that drains it into `hub`.
    ///
    /// The queue between the two is unbounded: the [`Dispatcher`] must be
    /// spawned and kept running, or queued events accumulate in memory.
    /// [`Notifier::pending`] reports the current backlog.
    pub fn new(hub: Arc<Hub>) -> (Self, Dispatcher) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        (
            Self {
                sender,
                pending: pending.clone(),
            },
            Dispatcher {
                hub,
                receiver,
                pending,
            },
        )
    }

    /// Returns how many events are queued but not yet dispatched.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }
}

impl Notify for Notifier {
    fn notify(&self, audience: Audience, event: Event) {
        // Counted before sending so the dispatcher never decrements first.
        self.pending.fetch_add(1, Ordering::Relaxed);
        if self.sender.send(Notification { audience, event }).is_err() {
            self.pending.fetch_sub(1, Ordering::Relaxed);
            debug!("hub dispatcher stopped; dropping event");
        }
    }
}

/// Long-lived loop delivering queued events through the hub.
#[derive(Debug)]
pub struct Dispatcher {
    hub: Arc<Hub>,
    receiver: mpsc::UnboundedReceiver<Notification>,
    pending: Arc<AtomicUsize>,
}

impl Dispatcher {
    /// Runs until every [`Notifier`] has been dropped.
    pub async fn run(mut self) {
        while let Some(Notification { audience, event }) = self.receiver.recv().await {
            self.pending.fetch_sub(1, Ordering::Relaxed);
            if let Ok(delivery) = self.hub.publish(audience, &event) {
                debug!(
                    kind = event.kind(),
                    delivered = delivery.delivered,
                    dropped = delivery.dropped,
                    "event dispatched"
                );
            }
        }
        debug!("hub dispatcher finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{CardAction, CardEvent};
    use crate::hub::{HubConfig, SubscriberIdentity};
    use crate::model::{Card, CardStatus};
    use crate::types::{CardId, CardIdentifier};
    use chrono::{TimeZone, Utc};

    fn event(owner: Option<UserId>) -> Event {
        let card = Card {
            id: CardId::new(1),
            identifier: CardIdentifier::try_from("04A23B9F").unwrap(),
            status: CardStatus::Revoked,
            expiry_date: None,
            issue_date: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            last_used: None,
            user_id: owner,
        };
        Event::CardLifecycle(CardEvent::new(CardAction::Revoked, &card))
    }

    #[tokio::test]
    async fn dispatcher_delivers_queued_events_in_order() {
        let hub = Arc::new(Hub::new(HubConfig::default()));
        let mut admin = hub.connect(SubscriberIdentity::user(UserId::new(1), true));
        let mut owner = hub.connect(SubscriberIdentity::user(UserId::new(7), false));
        let (notifier, dispatcher) = Notifier::new(hub.clone());
        let task = tokio::spawn(dispatcher.run());

        notifier.notify_admins_and_owner(event(Some(UserId::new(7))), Some(UserId::new(7)));
        drop(notifier);
        task.await.unwrap();

        let to_admin = admin.receiver.recv().await.unwrap();
        let to_owner = owner.receiver.recv().await.unwrap();
        assert!(to_admin.contains("\"admin\":true"));
        assert!(to_owner.contains("\"user_id\":7"));
        assert!(admin.receiver.try_recv().is_err());
    }

    #[test]
    fn notify_without_dispatcher_does_not_block() {
        let hub = Arc::new(Hub::new(HubConfig::default()));
        let (notifier, dispatcher) = Notifier::new(hub);
        drop(dispatcher);

        notifier.notify(Audience::Everyone, event(None));
    }

    #[test]
    fn undispatched_events_are_counted() {
        let hub = Arc::new(Hub::new(HubConfig::default()));
        let (notifier, _dispatcher) = Notifier::new(hub);

        notifier.notify(Audience::Everyone, event(None));
        notifier.notify(Audience::Admins, event(None));

        assert_eq!(notifier.pending(), 2);
    }

    #[test]
    fn hub_notifies_directly() {
        let hub = Arc::new(Hub::new(HubConfig::default()));
        let mut admin = hub.connect(SubscriberIdentity::user(UserId::new(1), true));

        hub.notify_admins_and_owner(event(None), None);

        assert!(admin.receiver.try_recv().is_ok());
        assert!(admin.receiver.try_recv().is_err());
    }
}
