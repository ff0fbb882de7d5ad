//! # Event Bus
//!
//! Topic-addressed, in-memory, fire-and-forget fan-out.
//!
//! Producers publish a [`Message`]; the message names its own topic, so a payload can
//! never land on a topic that expects a different shape. Consumers [`join`](EventBus::join)
//! a topic and receive every message published from that moment on.
//!
//! ## Delivery rules
//!
//! - **No store-and-forward**: publishing to a topic with no joined subscriber is a no-op.
//!   A later subscriber never sees earlier messages.
//! - **Per-topic order**: within one topic, every subscriber observes publish order.
//! - **No cross-topic order**: topics are independent channels.
//! - **Never blocks**: each topic group has a bounded ring. A subscriber that falls more than
//!   `capacity` messages behind loses the oldest ones; the publisher is never held up.
//!
//! ## Groups
//!
//! Each topic owns one group, created lazily on first publish or first join. Creation is
//! serialized by a single lock over the topic map, so a group is never created twice.
//! Groups live as long as the bus, even with no subscribers left, which means the topic
//! vocabulary should stay small and closed.
//!
//! ```rust
//! use agent_framework::bus::{EventBus, Message};
//!
//! #[derive(Clone, Debug)]
//! enum Signal { Ping(u32) }
//!
//! impl Message for Signal {
//!     type Topic = &'static str;
//!     fn topic(&self) -> Self::Topic { "ping" }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let bus = EventBus::<Signal>::new();
//!     let mut sub = bus.join("ping");
//!     bus.publish(Signal::Ping(7));
//!     assert!(matches!(sub.recv().await, Some(Signal::Ping(7))));
//! }
//! ```

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{trace, warn};

/// Default per-topic ring size.
pub const DEFAULT_CAPACITY: usize = 64;

/// A payload that can travel on the bus.
///
/// The associated `Topic` is a small closed vocabulary (usually a fieldless enum).
/// Each message variant reports the topic it belongs to.
pub trait Message: Clone + Debug + Send + Sync + 'static {
    type Topic: Copy + Eq + Hash + Debug + Display + Send + Sync + 'static;

    fn topic(&self) -> Self::Topic;
}

/// Process-wide topic registry.
///
/// A cheap handle: clones share one topic map, so the bus is built once and a clone is
/// handed to every service.
pub struct EventBus<M: Message> {
    groups: Arc<Mutex<HashMap<M::Topic, broadcast::Sender<M>>>>,
    capacity: usize,
}

impl<M: Message> Clone for EventBus<M> {
    fn clone(&self) -> Self {
        Self {
            groups: Arc::clone(&self.groups),
            capacity: self.capacity,
        }
    }
}

impl<M: Message> Default for EventBus<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Message> EventBus<M> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a bus whose topic groups buffer up to `capacity` undelivered messages
    /// per subscriber.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            groups: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    fn group(&self, topic: M::Topic) -> broadcast::Sender<M> {
        let mut groups = self.groups.lock();
        groups
            .entry(topic)
            .or_insert_with(|| {
                trace!(%topic, "Bus group created");
                broadcast::channel(self.capacity).0
            })
            .clone()
    }

    /// Delivers `message` to every endpoint currently joined to its topic.
    ///
    /// Returns the number of subscribers the message was handed to. Zero means the
    /// message was discarded.
    pub fn publish(&self, message: M) -> usize {
        let topic = message.topic();
        match self.group(topic).send(message) {
            Ok(delivered) => {
                trace!(%topic, delivered, "Published");
                delivered
            }
            Err(_) => {
                trace!(%topic, "Published with no subscribers; dropped");
                0
            }
        }
    }

    /// Registers a new endpoint on `topic`. It receives messages published from now on.
    pub fn join(&self, topic: M::Topic) -> Subscription<M> {
        Subscription {
            topic,
            receiver: self.group(topic).subscribe(),
        }
    }

    /// Joins `topic`, waits for exactly one message, then leaves.
    ///
    /// Resolves to `None` only if every handle to the bus is dropped while waiting.
    pub async fn receive(&self, topic: M::Topic) -> Option<M> {
        self.join(topic).recv().await
    }

    /// Number of endpoints currently joined to `topic`.
    pub fn subscriber_count(&self, topic: M::Topic) -> usize {
        self.groups
            .lock()
            .get(&topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    /// Number of topic groups created so far.
    pub fn topic_count(&self) -> usize {
        self.groups.lock().len()
    }
}

/// One consumer's view of a topic group. Dropping it leaves the topic.
pub struct Subscription<M: Message> {
    topic: M::Topic,
    receiver: broadcast::Receiver<M>,
}

impl<M: Message> Subscription<M> {
    /// Waits for the next message. Cancel-safe, so it can sit in a `select!` arm.
    ///
    /// Messages lost to lag are skipped with a warning.
    pub async fn recv(&mut self) -> Option<M> {
        loop {
            match self.receiver.recv().await {
                Ok(message) => return Some(message),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(topic = %self.topic, skipped, "Subscriber lagged; messages dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Returns a message if one is already waiting.
    pub fn try_recv(&mut self) -> Option<M> {
        loop {
            match self.receiver.try_recv() {
                Ok(message) => return Some(message),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(topic = %self.topic, skipped, "Subscriber lagged; messages dropped");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }
}
