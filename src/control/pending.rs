use std::collections::HashMap;

use tokio::sync::oneshot;
use tokio::time::Instant;

use super::{ControlError, RequestKind};
use crate::protocol::TabResponse;

pub(crate) type Reply = oneshot::Sender<Result<TabResponse, ControlError>>;

struct Pending {
    kind: RequestKind,
    reply: Reply,
    deadline: Instant,
}

/// In-flight control requests keyed by request id.
///
/// Every entry leaves the table exactly once: through [`take`], [`expire`]
/// or [`fail_all`]. The last two complete the reply channel themselves; a
/// taken entry hands its reply to the caller.
///
/// [`take`]: PendingRequests::take
/// [`expire`]: PendingRequests::expire
/// [`fail_all`]: PendingRequests::fail_all
#[derive(Default)]
pub(crate) struct PendingRequests {
    entries: HashMap<String, Pending>,
}

impl PendingRequests {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, request_id: String, kind: RequestKind, reply: Reply, deadline: Instant) {
        self.entries.insert(request_id, Pending { kind, reply, deadline });
    }

    /// Remove a request that got its response. `None` when the id is not
    /// (or no longer) tracked.
    pub(crate) fn take(&mut self, request_id: &str) -> Option<(RequestKind, Reply)> {
        self.entries.remove(request_id).map(|p| (p.kind, p.reply))
    }

    /// Fail every request whose deadline is at or before `now` with
    /// [`ControlError::Timeout`]. Returns the expired ids.
    pub(crate) fn expire(&mut self, now: Instant) -> Vec<String> {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            if let Some(pending) = self.entries.remove(id) {
                let _ = pending.reply.send(Err(ControlError::Timeout));
            }
        }
        expired
    }

    pub(crate) fn fail_all(&mut self) {
        for (_, pending) in self.entries.drain() {
            let _ = pending.reply.send(Err(ControlError::ChannelClosed));
        }
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|p| p.deadline).min()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, request_id: &str) -> bool {
        self.entries.contains_key(request_id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
