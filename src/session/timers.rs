use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::state::{Event, TimerKind};

/// One-shot timers for a session driver, at most one per kind.
///
/// Each timer is a spawned sleep that posts `TimerFired` back into the
/// driver's event queue. Rescheduling a kind aborts its previous task.
/// Dropping the set aborts everything still outstanding.
pub(crate) struct Timers {
    tasks: HashMap<TimerKind, JoinHandle<()>>,
    events: mpsc::UnboundedSender<Event>,
}

impl Timers {
    pub(crate) fn new(events: mpsc::UnboundedSender<Event>) -> Self {
        Self { tasks: HashMap::new(), events }
    }

    pub(crate) fn schedule(&mut self, timer: TimerKind, after: Duration, generation: u64) {
        self.cancel(timer);
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = events.send(Event::TimerFired { timer, generation });
        });
        self.tasks.insert(timer, handle);
    }

    pub(crate) fn cancel(&mut self, timer: TimerKind) {
        if let Some(handle) = self.tasks.remove(&timer) {
            handle.abort();
        }
    }

    pub(crate) fn cancel_all(&mut self) {
        for (_, handle) in self.tasks.drain() {
            handle.abort();
        }
    }

    /// Timers that have not fired yet.
    pub(crate) fn pending(&self) -> usize {
        self.tasks.values().filter(|h| !h.is_finished()).count()
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fires_with_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx);
        timers.schedule(TimerKind::Heartbeat, Duration::from_millis(5), 7);

        let event = rx.recv().await.unwrap();
        assert_eq!(event, Event::TimerFired { timer: TimerKind::Heartbeat, generation: 7 });
    }

    #[tokio::test]
    async fn reschedule_replaces_previous() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx);
        timers.schedule(TimerKind::Reconnect, Duration::from_millis(5), 1);
        timers.schedule(TimerKind::Reconnect, Duration::from_millis(20), 2);
        assert_eq!(timers.pending(), 1);

        let event = rx.recv().await.unwrap();
        assert_eq!(event, Event::TimerFired { timer: TimerKind::Reconnect, generation: 2 });
    }

    #[tokio::test]
    async fn cancel_all_silences_everything() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx);
        timers.schedule(TimerKind::Heartbeat, Duration::from_millis(10), 1);
        timers.schedule(TimerKind::Emergency, Duration::from_millis(20), 1);
        timers.cancel_all();
        assert_eq!(timers.pending(), 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }
}
