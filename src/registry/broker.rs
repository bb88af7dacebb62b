//! Fan-out of applied writes to subscribers.
//!
//! Every subscriber owns a bounded channel. Publishing never blocks: a
//! subscriber whose channel is full is disconnected, and a subscriber whose
//! receiver was dropped is pruned.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::wrappers::ReceiverStream;

use super::filter::Filter;
use super::types::Member;

pub type SubscriptionId = u64;

/// Which applied writes a subscriber receives.
#[derive(Debug, Clone)]
pub enum SubscriberScope {
    /// Writes owned by the local node, and writes that take ownership away from it.
    Owned,
    /// Every applied write.
    All,
    /// Every applied write matching the filter.
    Filtered(Filter),
}

impl SubscriberScope {
    fn accepts(&self, member: &Member, owned_or_lost: bool) -> bool {
        match self {
            SubscriberScope::Owned => owned_or_lost,
            SubscriberScope::All => true,
            SubscriberScope::Filtered(filter) => filter.matches(member),
        }
    }
}

/// Receiving half of a subscription.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    receiver: mpsc::Receiver<Member>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Next update, or `None` once the broker disconnected this subscriber.
    pub async fn recv(&mut self) -> Option<Member> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Member> {
        self.receiver.try_recv().ok()
    }

    pub fn into_stream(self) -> ReceiverStream<Member> {
        ReceiverStream::new(self.receiver)
    }
}

struct Subscriber {
    id: SubscriptionId,
    scope: SubscriberScope,
    sender: mpsc::Sender<Member>,
}

pub struct Broker {
    capacity: usize,
    next_id: SubscriptionId,
    subscribers: Vec<Subscriber>,
}

impl Broker {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_id: 1,
            subscribers: Vec::new(),
        }
    }

    /// Attaches a subscriber, queueing `initial` ahead of any live update.
    ///
    /// The channel is sized to hold the whole catch-up on top of the normal
    /// capacity, so catch-up alone never disconnects a subscriber.
    pub fn attach(&mut self, scope: SubscriberScope, initial: Vec<Member>) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.capacity + initial.len());
        for member in initial {
            // Cannot fail: the channel is empty, open and large enough.
            let _ = sender.try_send(member);
        }

        let id = self.next_id;
        self.next_id += 1;
        self.subscribers.push(Subscriber { id, scope, sender });

        tracing::debug!("Attached subscriber {} ({} total)", id, self.subscribers.len());
        Subscription { id, receiver }
    }

    pub fn detach(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| s.id != id);
        before != self.subscribers.len()
    }

    /// Delivers an applied write to every interested subscriber.
    ///
    /// `owned_or_lost` is true when the write is owned by the local node or
    /// replaced a record the local node owned.
    pub fn publish(&mut self, member: &Member, owned_or_lost: bool) {
        self.subscribers.retain(|subscriber| {
            if !subscriber.scope.accepts(member, owned_or_lost) {
                return !subscriber.sender.is_closed();
            }

            match subscriber.sender.try_send(member.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        "Subscriber {} is not keeping up, disconnecting",
                        subscriber.id
                    );
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!("Subscriber {} closed", subscriber.id);
                    false
                }
            }
        });
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}
