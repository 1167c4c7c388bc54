//! Per-subscriber message pumps.
//!
//! A session runs an inbound pump, which only watches for disconnects and
//! liveness acknowledgements, alongside an outbound pump that drains the hub
//! queue into the transport. Whichever pump stops first ends the session; the
//! hub registration is then released once and the transport is closed.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout, timeout_at};
use tracing::{debug, warn};

use crate::hub::{HubConfig, Hub, Message, SubscriberId, Subscription};

/// Transport-level frame exchanged with a subscriber.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

/// Why a session stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    /// The peer closed the connection or the stream ended.
    PeerClosed,
    /// Reading from the transport failed.
    ReadFailed,
    /// No pong arrived within the read deadline.
    ReadTimeout,
    /// The peer sent a message over the size limit.
    MessageTooLarge,
    /// The hub closed the queue, usually because it overflowed.
    QueueClosed,
    /// Writing to the transport failed.
    WriteFailed,
    /// A write did not complete within the write deadline.
    WriteTimeout,
}

/// Releases a hub registration at most once.
#[derive(Debug)]
pub struct Teardown {
    hub: Arc<Hub>,
    id: SubscriberId,
    done: AtomicBool,
}

impl Teardown {
    /// Guards the registration `id` on `hub`.
    pub fn new(hub: Arc<Hub>, id: SubscriberId) -> Self {
        Self {
            hub,
            id,
            done: AtomicBool::new(false),
        }
    }

    /// Deregisters the subscriber; returns `true` only on the first call.
    pub fn run(&self) -> bool {
        if self.done.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.hub.disconnect(self.id);
        true
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        self.run();
    }
}

/// One connected real-time subscriber.
#[derive(Debug)]
pub struct ClientSession {
    config: HubConfig,
    subscription: Subscription,
    teardown: Teardown,
}

impl ClientSession {
    /// Wraps a registration obtained from [`Hub::connect`].
    pub fn new(hub: Arc<Hub>, subscription: Subscription) -> Self {
        Self {
            config: hub.config().clone(),
            teardown: Teardown::new(hub, subscription.id),
            subscription,
        }
    }

    /// Returns the hub registration id.
    pub fn id(&self) -> SubscriberId {
        self.subscription.id
    }

    /// Pumps messages until either direction fails, then tears down.
    pub async fn run<Si, St, E>(self, mut sink: Si, mut stream: St) -> SessionEnd
    where
        Si: Sink<Frame> + Unpin + Send,
        Si::Error: fmt::Display,
        St: Stream<Item = Result<Frame, E>> + Unpin + Send,
        E: fmt::Display,
    {
        let Self {
            config,
            subscription,
            teardown,
        } = self;
        let id = subscription.id;
        let mut receiver = subscription.receiver;

        let end = tokio::select! {
            end = read_pump(&mut stream, &config) => end,
            end = write_pump(&mut sink, &mut receiver, &config) => end,
        };

        teardown.run();
        drop(receiver);
        if timeout(config.write_wait, sink.close()).await.is_err() {
            debug!(subscriber = %id, "transport close timed out");
        }
        debug!(subscriber = %id, ?end, "session finished");
        end
    }
}

async fn read_pump<St, E>(stream: &mut St, config: &HubConfig) -> SessionEnd
where
    St: Stream<Item = Result<Frame, E>> + Unpin,
    E: fmt::Display,
{
    let mut deadline = Instant::now() + config.pong_wait;
    loop {
        let frame = match timeout_at(deadline, stream.next()).await {
            Err(_) => return SessionEnd::ReadTimeout,
            Ok(None) => return SessionEnd::PeerClosed,
            Ok(Some(Err(err))) => {
                warn!(%err, "subscriber read failed");
                return SessionEnd::ReadFailed;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Frame::Pong(_) => deadline = Instant::now() + config.pong_wait,
            Frame::Close => return SessionEnd::PeerClosed,
            Frame::Text(text) if text.len() > config.max_message_size => {
                return SessionEnd::MessageTooLarge;
            }
            Frame::Binary(data) if data.len() > config.max_message_size => {
                return SessionEnd::MessageTooLarge;
            }
            Frame::Text(_) | Frame::Binary(_) | Frame::Ping(_) => {}
        }
    }
}

async fn write_pump<Si>(
    sink: &mut Si,
    receiver: &mut mpsc::Receiver<Message>,
    config: &HubConfig,
) -> SessionEnd
where
    Si: Sink<Frame> + Unpin,
    Si::Error: fmt::Display,
{
    let mut ticker = interval_at(Instant::now() + config.ping_period, config.ping_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let frame = tokio::select! {
            biased;
            message = receiver.recv() => match message {
                Some(first) => Frame::Text(coalesce(first, receiver)),
                None => {
                    let _ = timeout(config.write_wait, sink.send(Frame::Close)).await;
                    return SessionEnd::QueueClosed;
                }
            },
            _ = ticker.tick() => Frame::Ping(Vec::new()),
        };

        match timeout(config.write_wait, sink.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(%err, "subscriber write failed");
                return SessionEnd::WriteFailed;
            }
            Err(_) => return SessionEnd::WriteTimeout,
        }
    }
}

/// Joins `first` with every message already waiting, newline separated.
fn coalesce(first: Message, receiver: &mut mpsc::Receiver<Message>) -> String {
    let mut payload = String::from(&*first);
    while let Ok(next) = receiver.try_recv() {
        payload.push('\n');
        payload.push_str(&next);
    }
    payload
}
