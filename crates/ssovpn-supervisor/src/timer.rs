//! Named, cancellable one-shot timers
//!
//! The registry owns one tokio task per pending timer. Scheduling a name that
//! is already pending aborts the previous task first, so at most one instance
//! of each named timer exists. Firings are delivered as `TimerFired` events on
//! the control task's queue; delays are best-effort, not hard real-time.

use std::collections::HashMap;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::event::{Event, EventSender, TimerName};

pub struct TimerRegistry {
    events: EventSender,
    pending: HashMap<TimerName, JoinHandle<()>>,
}

impl TimerRegistry {
    pub fn new(events: EventSender) -> Self {
        Self {
            events,
            pending: HashMap::new(),
        }
    }

    /// Schedule `name` to fire after `delay`, replacing any pending instance.
    pub fn schedule(&mut self, name: TimerName, delay: Duration) {
        if let Some(old) = self.pending.remove(&name) {
            debug!("Replacing pending {} timer", name);
            old.abort();
        }

        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(Event::TimerFired(name));
        });

        self.pending.insert(name, handle);
    }

    /// Cancel a pending timer. Cancelling a timer that is not pending is a
    /// no-op.
    pub fn cancel(&mut self, name: TimerName) {
        if let Some(handle) = self.pending.remove(&name) {
            debug!("Cancelling {} timer", name);
            handle.abort();
        }
    }

    /// True while `name` is scheduled and has not yet fired.
    pub fn is_pending(&self, name: TimerName) -> bool {
        self.pending
            .get(&name)
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Cancel every pending timer.
    pub fn cancel_all(&mut self) {
        for (name, handle) in self.pending.drain() {
            debug!("Cancelling {} timer", name);
            handle.abort();
        }
    }
}

impl Drop for TimerRegistry {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut registry = TimerRegistry::new(tx);

        registry.schedule(TimerName::RestartBackoff, Duration::from_secs(2));
        assert!(registry.is_pending(TimerName::RestartBackoff));

        let event = rx.recv().await.unwrap();
        assert_eq!(event, Event::TimerFired(TimerName::RestartBackoff));
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_twice_yields_single_firing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut registry = TimerRegistry::new(tx);

        registry.schedule(TimerName::DirectAuthRetry, Duration::from_secs(3));
        registry.schedule(TimerName::DirectAuthRetry, Duration::from_secs(3));

        let event = rx.recv().await.unwrap();
        assert_eq!(event, Event::TimerFired(TimerName::DirectAuthRetry));

        // The superseded instance must not fire a second time.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_firing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut registry = TimerRegistry::new(tx);

        registry.schedule(TimerName::SecretsWait, Duration::from_secs(5));
        registry.cancel(TimerName::SecretsWait);
        assert!(!registry.is_pending(TimerName::SecretsWait));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_names_fire_independently() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut registry = TimerRegistry::new(tx);

        registry.schedule(TimerName::RestartBackoff, Duration::from_secs(2));
        registry.schedule(TimerName::SecretsWait, Duration::from_secs(5));
        registry.cancel(TimerName::RestartBackoff);

        let event = rx.recv().await.unwrap();
        assert_eq!(event, Event::TimerFired(TimerName::SecretsWait));
    }
}
