//! Pending-send tracking for acknowledged delivery.
//!
//! Every data message sent in acknowledged mode gets an entry here until the
//! peer acknowledges it or its retries run out. Each entry owns a
//! timer task that sleeps for the current backoff and then posts a
//! [`RetryTick`] to the agent's retry queue; the agent feeds the tick back
//! through [`PendingSendTracker::on_timeout`].
//!
//! Entries live in a fixed slot arena sized by `max_in_flight` with an
//! id→slot index beside it. All access goes through one short mutex
//! section, so the agent task, the timer tasks and the backend receive
//! context can use the tracker concurrently.

mod backoff;

pub use backoff::RetryPolicy;

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::TrackerError;
use crate::wire::ProxyMessage;

/// Posted by a retry timer when its timeout expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryTick {
    pub id: u32,
    /// Distinguishes a live timer from one superseded by a reschedule.
    pub epoch: u64,
}

/// What the agent must do after a timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeoutAction {
    /// Re-send `message`; the next timer is already armed.
    Retry { message: ProxyMessage, attempts: u8 },
    /// Attempts exhausted, the entry was dropped.
    GaveUp { id: u32, attempts: u8 },
}

struct Tracked {
    message: ProxyMessage,
    attempts: u8,
    epoch: u64,
    timer: Option<JoinHandle<()>>,
}

struct Pool {
    slots: Vec<Option<Tracked>>,
    index: HashMap<u32, usize>,
    free: Vec<usize>,
    next_epoch: u64,
}

impl Pool {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            index: HashMap::with_capacity(capacity),
            // Reversed so slot 0 is handed out first.
            free: (0..capacity).rev().collect(),
            next_epoch: 0,
        }
    }

    fn bump_epoch(&mut self) -> u64 {
        self.next_epoch = self.next_epoch.wrapping_add(1);
        self.next_epoch
    }
}

/// Bounded pool of messages awaiting acknowledgment.
pub struct PendingSendTracker {
    agent: String,
    policy: RetryPolicy,
    capacity: usize,
    ticks: mpsc::Sender<RetryTick>,
    pool: Mutex<Pool>,
}

impl PendingSendTracker {
    pub fn new(
        agent: impl Into<String>,
        policy: RetryPolicy,
        capacity: usize,
        ticks: mpsc::Sender<RetryTick>,
    ) -> Self {
        Self {
            agent: agent.into(),
            policy,
            capacity,
            ticks,
            pool: Mutex::new(Pool::with_capacity(capacity)),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of messages currently awaiting acknowledgment.
    pub fn len(&self) -> usize {
        self.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: u32) -> bool {
        self.lock().index.contains_key(&id)
    }

    /// Re-send count of a tracked message.
    pub fn attempts(&self, id: u32) -> Option<u8> {
        let pool = self.lock();
        let slot = *pool.index.get(&id)?;
        pool.slots[slot].as_ref().map(|t| t.attempts)
    }

    /// Track `message` with `attempts` prior re-sends and arm its timer.
    ///
    /// An entry with the same id is updated in place; otherwise a slot is
    /// taken from the pool. Returns the armed timeout.
    pub fn start_or_reschedule(
        &self,
        message: &ProxyMessage,
        attempts: u8,
    ) -> Result<Duration, TrackerError> {
        let timeout = self.policy.timeout_for(attempts);
        let mut guard = self.lock();
        let pool = &mut *guard;

        let existing = pool.index.get(&message.id).copied();
        let slot = match existing {
            Some(slot) => slot,
            None => {
                let slot = pool.free.pop().ok_or(TrackerError::PoolExhausted {
                    capacity: self.capacity,
                })?;
                pool.index.insert(message.id, slot);
                slot
            }
        };

        let epoch = pool.bump_epoch();
        let timer = self.arm(message.id, epoch, timeout);
        match pool.slots[slot].as_mut() {
            Some(tracked) => {
                if let Some(old) = tracked.timer.take() {
                    cancel_timer(old);
                }
                tracked.message = message.clone();
                tracked.attempts = attempts;
                tracked.epoch = epoch;
                tracked.timer = Some(timer);
            }
            None => {
                pool.slots[slot] = Some(Tracked {
                    message: message.clone(),
                    attempts,
                    epoch,
                    timer: Some(timer),
                });
            }
        }

        tracing::debug!(
            agent = %self.agent,
            msg_id = message.id,
            attempts,
            timeout_ms = timeout.as_millis() as u64,
            "Tracking sent message"
        );
        Ok(timeout)
    }

    /// Handle an expired timer.
    ///
    /// Returns `None` for ticks of messages that were acknowledged or
    /// rescheduled in the meantime. Otherwise the attempt counter goes up:
    /// below the maximum the next timer is armed and a retry is returned,
    /// at the maximum the entry is dropped.
    pub fn on_timeout(&self, tick: RetryTick) -> Option<TimeoutAction> {
        let mut guard = self.lock();
        let pool = &mut *guard;
        let slot = *pool.index.get(&tick.id)?;
        let current = pool.slots[slot].as_ref().map(|t| t.epoch)?;
        if current != tick.epoch {
            tracing::debug!(agent = %self.agent, msg_id = tick.id, "Ignoring stale retry tick");
            return None;
        }

        let epoch = pool.bump_epoch();
        let tracked = pool.slots[slot].as_mut()?;
        // The timer that posted this tick has finished.
        tracked.timer = None;
        tracked.attempts = tracked.attempts.saturating_add(1);
        let attempts = tracked.attempts;

        if self.policy.may_retry(attempts) {
            let timeout = self.policy.timeout_for(attempts);
            tracked.epoch = epoch;
            tracked.timer = Some(self.arm(tick.id, epoch, timeout));
            let message = tracked.message.clone();
            tracing::debug!(
                agent = %self.agent,
                msg_id = tick.id,
                attempts,
                timeout_ms = timeout.as_millis() as u64,
                "Acknowledgment timed out, retrying"
            );
            return Some(TimeoutAction::Retry { message, attempts });
        }

        pool.slots[slot] = None;
        pool.index.remove(&tick.id);
        pool.free.push(slot);
        tracing::error!(
            agent = %self.agent,
            msg_id = tick.id,
            attempts,
            "Max transmit attempts reached, giving up"
        );
        Some(TimeoutAction::GaveUp {
            id: tick.id,
            attempts,
        })
    }

    /// Stop tracking `id`: cancel its timer and free the slot.
    pub fn stop(&self, id: u32) -> Result<(), TrackerError> {
        let mut guard = self.lock();
        let pool = &mut *guard;
        let slot = pool
            .index
            .remove(&id)
            .ok_or(TrackerError::NotFound { id })?;
        if let Some(timer) = pool.slots[slot].take().and_then(|t| t.timer) {
            cancel_timer(timer);
        }
        pool.free.push(slot);
        tracing::debug!(agent = %self.agent, msg_id = id, "Stopped tracking message");
        Ok(())
    }

    /// Drop every entry and cancel every timer.
    pub fn clear(&self) {
        let mut guard = self.lock();
        let pool = &mut *guard;
        let ids: Vec<u32> = pool.index.keys().copied().collect();
        for id in ids {
            if let Some(slot) = pool.index.remove(&id) {
                if let Some(timer) = pool.slots[slot].take().and_then(|t| t.timer) {
                    cancel_timer(timer);
                }
                pool.free.push(slot);
            }
        }
    }

    fn arm(&self, id: u32, epoch: u64, timeout: Duration) -> JoinHandle<()> {
        let ticks = self.ticks.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if ticks.send(RetryTick { id, epoch }).await.is_err() {
                tracing::debug!(msg_id = id, "Retry queue closed, dropping tick");
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, Pool> {
        self.pool.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for PendingSendTracker {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Abort a timer task unless we are running on it.
fn cancel_timer(timer: JoinHandle<()>) {
    if tokio::task::try_id() != Some(timer.id()) {
        timer.abort();
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio::time::Instant;

    use super::*;
    use crate::config::Limits;

    fn policy(max_attempts: u8) -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_millis(5_000),
            max_attempts,
        }
    }

    fn message(id: u32) -> ProxyMessage {
        ProxyMessage::data(id, vec![1u8, 2, 3], "temp", &Limits::default()).unwrap()
    }

    fn assert_elapsed(started: Instant, ms: u64) {
        let elapsed = started.elapsed();
        assert!(
            elapsed >= Duration::from_millis(ms) && elapsed < Duration::from_millis(ms + 2),
            "expected ~{}ms, got {:?}",
            ms,
            elapsed
        );
    }

    fn tracker(capacity: usize, max_attempts: u8) -> (PendingSendTracker, mpsc::Receiver<RetryTick>) {
        let (tx, rx) = mpsc::channel(16);
        (
            PendingSendTracker::new("test", policy(max_attempts), capacity, tx),
            rx,
        )
    }

    // ── Timers ──

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_back_off_until_given_up() {
        let (tracker, mut ticks) = tracker(4, 3);
        let started = Instant::now();
        assert_eq!(
            tracker.start_or_reschedule(&message(7), 0).unwrap(),
            Duration::from_millis(100)
        );

        let tick = ticks.recv().await.unwrap();
        assert_elapsed(started, 100);
        match tracker.on_timeout(tick) {
            Some(TimeoutAction::Retry { message, attempts }) => {
                assert_eq!(message.id, 7);
                assert_eq!(attempts, 1);
            }
            other => panic!("Expected Retry, got {:?}", other),
        }

        let tick = ticks.recv().await.unwrap();
        assert_elapsed(started, 300);
        match tracker.on_timeout(tick) {
            Some(TimeoutAction::Retry { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("Expected Retry, got {:?}", other),
        }

        let tick = ticks.recv().await.unwrap();
        assert_elapsed(started, 700);
        assert_eq!(
            tracker.on_timeout(tick),
            Some(TimeoutAction::GaveUp { id: 7, attempts: 3 })
        );
        assert!(!tracker.contains(7));
        assert!(tracker.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_timer() {
        let (tracker, mut ticks) = tracker(4, 5);
        tracker.start_or_reschedule(&message(1), 0).unwrap();
        tracker.stop(1).unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(ticks.try_recv().is_err());
        assert!(tracker.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_supersedes_old_tick() {
        let (tracker, mut ticks) = tracker(4, 5);
        tracker.start_or_reschedule(&message(3), 0).unwrap();
        let stale = RetryTick { id: 3, epoch: 1 };
        tracker.start_or_reschedule(&message(3), 2).unwrap();
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.attempts(3), Some(2));
        assert_eq!(tracker.on_timeout(stale), None);

        let tick = ticks.recv().await.unwrap();
        assert_eq!(tick.epoch, 2);
        match tracker.on_timeout(tick) {
            Some(TimeoutAction::Retry { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("Expected Retry, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_after_ack_is_ignored() {
        let (tracker, _ticks) = tracker(4, 5);
        tracker.start_or_reschedule(&message(9), 0).unwrap();
        tracker.stop(9).unwrap();
        assert_eq!(tracker.on_timeout(RetryTick { id: 9, epoch: 1 }), None);
    }

    // ── Pool ──

    #[tokio::test]
    async fn test_pool_exhaustion_and_release() {
        let (tracker, _ticks) = tracker(2, 5);
        tracker.start_or_reschedule(&message(1), 0).unwrap();
        tracker.start_or_reschedule(&message(2), 0).unwrap();
        assert_eq!(
            tracker.start_or_reschedule(&message(3), 0).unwrap_err(),
            TrackerError::PoolExhausted { capacity: 2 }
        );

        // Rescheduling a tracked id needs no new slot.
        tracker.start_or_reschedule(&message(2), 1).unwrap();

        tracker.stop(1).unwrap();
        tracker.start_or_reschedule(&message(3), 0).unwrap();
        assert!(tracker.contains(2));
        assert!(tracker.contains(3));
    }

    #[tokio::test]
    async fn test_stop_unknown_id_is_not_found() {
        let (tracker, _ticks) = tracker(2, 5);
        assert_eq!(tracker.stop(42), Err(TrackerError::NotFound { id: 42 }));

        tracker.start_or_reschedule(&message(42), 0).unwrap();
        assert_eq!(tracker.stop(42), Ok(()));
        assert_eq!(tracker.stop(42), Err(TrackerError::NotFound { id: 42 }));
    }

    #[tokio::test]
    async fn test_clear_releases_everything() {
        let (tracker, _ticks) = tracker(3, 5);
        for id in 0..3 {
            tracker.start_or_reschedule(&message(id), 0).unwrap();
        }
        tracker.clear();
        assert!(tracker.is_empty());
        for id in 10..13 {
            tracker.start_or_reschedule(&message(id), 0).unwrap();
        }
    }
}
