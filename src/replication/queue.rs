use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tokio::sync::Notify;

use crate::registry::types::Member;

struct QueueState {
    order: VecDeque<String>,
    pending: HashMap<String, Member>,
    closed: bool,
    dropped: u64,
}

/// Bounded queue of updates waiting to be pushed to one peer.
///
/// Holds at most one pending update per member id: a newer or equal
/// version replaces the queued one in place, an older one is discarded.
/// When full, the oldest id is dropped to make room.
pub struct PendingUpdates {
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl PendingUpdates {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(QueueState {
                order: VecDeque::new(),
                pending: HashMap::new(),
                closed: false,
                dropped: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Queues an update, returning false if it was discarded.
    pub fn push(&self, member: Member) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }

        let id = member.state.id.clone();
        if let Some(queued) = state.pending.get_mut(&id) {
            if member.version < queued.version {
                return false;
            }
            *queued = member;
            return true;
        }

        if state.order.len() >= self.capacity
            && let Some(oldest) = state.order.pop_front()
        {
            state.pending.remove(&oldest);
            state.dropped += 1;
            tracing::debug!("Pending queue full, dropped update for {}", oldest);
        }

        state.order.push_back(id.clone());
        state.pending.insert(id, member);
        drop(state);

        self.notify.notify_one();
        true
    }

    /// Waits for the next update. Returns `None` once the queue is closed.
    pub async fn take(&self) -> Option<Member> {
        loop {
            {
                let mut state = self.state.lock();
                if state.closed {
                    return None;
                }
                while let Some(id) = state.order.pop_front() {
                    if let Some(member) = state.pending.remove(&id) {
                        return Some(member);
                    }
                }
            }
            self.notify.notified().await;
        }
    }

    /// Discards pending updates and wakes the consumer.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.order.clear();
        state.pending.clear();
        drop(state);

        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.state.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}
