use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;

use crate::message::{Message, RequestId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("a request with id {0} is already waiting for a response")]
pub struct DuplicateRequestId(pub RequestId);

/// Correlates outbound request IDs with the task waiting for the response.
#[derive(Clone, Default)]
pub struct PendingRequests {
    slots: Arc<Mutex<HashMap<RequestId, oneshot::Sender<Message>>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<RequestId, oneshot::Sender<Message>>> {
        // The map holds no invariants that a panicking holder could break.
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a slot for `id`. The slot is released when the returned waiter drops.
    pub fn wait_for(&self, id: RequestId) -> Result<Waiter, DuplicateRequestId> {
        let (tx, rx) = oneshot::channel();
        {
            let mut slots = self.slots();
            if slots.get(&id).is_some_and(|s| !s.is_closed()) {
                return Err(DuplicateRequestId(id));
            }
            slots.insert(id.clone(), tx);
        }
        Ok(Waiter {
            rx,
            guard: SlotGuard {
                pending: self.clone(),
                id,
            },
        })
    }

    /// Resolves the slot matching `msg.id`. Returns false when nothing is waiting, which
    /// means the message is unsolicited.
    pub fn notify(&self, msg: Message) -> bool {
        let Some(id) = msg.id.clone() else {
            return false;
        };
        let Some(tx) = self.slots().remove(&id) else {
            return false;
        };
        tx.send(msg).is_ok()
    }

    pub fn done(&self, id: &RequestId) {
        self.slots().remove(id);
    }

    /// Drops the slot without a reply; the waiter observes [`Waited::Closed`].
    pub fn close(&self, id: &RequestId) {
        self.done(id);
    }

    /// Drops every slot. Waiters observe [`Waited::Closed`].
    pub fn close_all(&self) {
        self.slots().clear();
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.slots().contains_key(id)
    }
}

struct SlotGuard {
    pending: PendingRequests,
    id: RequestId,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        // The receiver is dropped before the guard, so only our own slot reads as closed.
        let mut slots = self.pending.slots();
        if slots.get(&self.id).is_some_and(|s| s.is_closed()) {
            slots.remove(&self.id);
        }
    }
}

pub enum Waited {
    Response(Message),
    Closed,
}

/// Receiving half of a pending slot.
pub struct Waiter {
    rx: oneshot::Receiver<Message>,
    guard: SlotGuard,
}

impl Waiter {
    pub fn id(&self) -> &RequestId {
        &self.guard.id
    }

    pub async fn recv(mut self) -> Waited {
        match (&mut self.rx).await {
            Ok(msg) => Waited::Response(msg),
            Err(_) => Waited::Closed,
        }
    }
}
