//! Per-process output history and live fan-out.
//!
//! Producers call [`LogHub::add_log`], which never waits: each subscriber
//! owns a bounded channel and a line that does not fit is dropped for that
//! subscriber only. History and the subscriber list share one lock so a
//! [`LogHub::subscribe_with_history`] snapshot can neither miss nor repeat a
//! line.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, Utc};
use relay_core::settings::{DEFAULT_LOG_HISTORY, DEFAULT_SUBSCRIBER_CAPACITY};
use relay_core::time_utils::format_log_time;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::trace;

/// Which pipe a captured line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
        }
    }
}

impl fmt::Display for LogStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `[YYYY-MM-DD HH:MM:SS] [stdout] text`
pub fn format_line(at: DateTime<Utc>, stream: LogStream, text: &str) -> String {
    format!("[{}] [{}] {}", format_log_time(at), stream, text)
}

#[derive(Debug, Default)]
struct HubState {
    history: VecDeque<String>,
    subscribers: Vec<(u64, mpsc::Sender<String>)>,
    next_id: u64,
    /// Set by `close_all`; later subscribers get an already-closed stream.
    closed: bool,
}

/// Bounded history plus a dynamic set of subscriber channels.
#[derive(Debug, Clone)]
pub struct LogHub {
    state: Arc<Mutex<HubState>>,
    history_capacity: usize,
    subscriber_capacity: usize,
}

impl Default for LogHub {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_HISTORY, DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

impl LogHub {
    pub fn new(history_capacity: usize, subscriber_capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState::default())),
            history_capacity,
            subscriber_capacity: subscriber_capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        lock_state(&self.state)
    }

    /// Record a line and offer it to every subscriber without waiting.
    pub fn add_log(&self, line: impl Into<String>) {
        let line = line.into();
        let mut state = self.lock();

        if self.history_capacity > 0 {
            if state.history.len() >= self.history_capacity {
                state.history.pop_front();
            }
            state.history.push_back(line.clone());
        }

        state.subscribers.retain(|(id, tx)| match tx.try_send(line.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                trace!(subscriber = id, "subscriber full; line dropped");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    /// Register a new live subscriber.
    pub fn subscribe(&self) -> LogSubscription {
        let mut state = self.lock();
        self.register(&mut state)
    }

    /// Snapshot the history and register a subscriber in one step.
    pub fn subscribe_with_history(&self) -> (Vec<String>, LogSubscription) {
        let mut state = self.lock();
        let history = state.history.iter().cloned().collect();
        let sub = self.register(&mut state);
        (history, sub)
    }

    /// Remove and close a subscriber; unknown ids are ignored.
    pub fn unsubscribe(&self, id: u64) {
        self.lock().subscribers.retain(|(sid, _)| *sid != id);
    }

    /// Close every subscriber channel, signalling end of stream.
    pub fn close_all(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.subscribers.clear();
    }

    pub fn history(&self) -> Vec<String> {
        self.lock().history.iter().cloned().collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    fn register(&self, state: &mut HubState) -> LogSubscription {
        let (tx, rx) = mpsc::channel(self.subscriber_capacity);
        let id = state.next_id;
        state.next_id += 1;
        if !state.closed {
            state.subscribers.push((id, tx));
        }
        LogSubscription {
            id,
            rx,
            hub: Arc::downgrade(&self.state),
        }
    }
}

fn lock_state(state: &Mutex<HubState>) -> MutexGuard<'_, HubState> {
    // A panic while holding the lock cannot leave the state inconsistent.
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Receiving end of one subscription; dropping it unsubscribes.
#[derive(Debug)]
pub struct LogSubscription {
    id: u64,
    rx: mpsc::Receiver<String>,
    hub: Weak<Mutex<HubState>>,
}

impl LogSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next line, or `None` once the hub has closed this stream.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }
}

impl Drop for LogSubscription {
    fn drop(&mut self) {
        if let Some(state) = self.hub.upgrade() {
            lock_state(&state).subscribers.retain(|(sid, _)| *sid != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::{Duration, Instant};

    #[test]
    fn test_format_line() {
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(
            format_line(at, LogStream::Stderr, "boom"),
            "[2024-01-02 03:04:05] [stderr] boom"
        );
    }

    #[test]
    fn test_history_is_capped() {
        let hub = LogHub::new(3, 10);
        for i in 0..5 {
            hub.add_log(format!("line {i}"));
        }
        assert_eq!(hub.history(), vec!["line 2", "line 3", "line 4"]);
    }

    #[tokio::test]
    async fn test_subscriber_receives_in_order() {
        let hub = LogHub::default();
        let mut sub = hub.subscribe();
        hub.add_log("a");
        hub.add_log("b");
        hub.add_log("c");
        assert_eq!(sub.recv().await.as_deref(), Some("a"));
        assert_eq!(sub.recv().await.as_deref(), Some("b"));
        assert_eq!(sub.recv().await.as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn test_full_subscriber_does_not_block_others() {
        let hub = LogHub::new(1000, 4);
        let _stalled = hub.subscribe();
        let mut live = hub.subscribe();

        let started = Instant::now();
        for i in 0..500 {
            hub.add_log(format!("{i}"));
            // Keep the live subscriber drained.
            assert_eq!(live.try_recv(), Some(format!("{i}")));
        }
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(hub.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn test_overflow_drops_newest_for_that_subscriber_only() {
        let hub = LogHub::new(1000, 2);
        let mut slow = hub.subscribe();
        for i in 0..5 {
            hub.add_log(format!("{i}"));
        }
        assert_eq!(slow.try_recv().as_deref(), Some("0"));
        assert_eq!(slow.try_recv().as_deref(), Some("1"));
        assert_eq!(slow.try_recv(), None);
        assert_eq!(hub.history().len(), 5);
    }

    #[tokio::test]
    async fn test_close_all_ends_streams() {
        let hub = LogHub::default();
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();
        hub.add_log("last");
        hub.close_all();

        assert_eq!(a.recv().await.as_deref(), Some("last"));
        assert_eq!(a.recv().await, None);
        assert_eq!(b.recv().await.as_deref(), Some("last"));
        assert_eq!(b.recv().await, None);

        let mut late = hub.subscribe();
        assert_eq!(late.recv().await, None);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let hub = LogHub::default();
        let mut sub = hub.subscribe();
        hub.unsubscribe(sub.id());
        hub.unsubscribe(sub.id());
        assert_eq!(hub.subscriber_count(), 0);
        assert_eq!(sub.recv().await, None);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let hub = LogHub::default();
        let sub = hub.subscribe();
        let _other = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 2);
        drop(sub);
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_with_history_has_no_gap() {
        let hub = LogHub::default();
        hub.add_log("before");
        let (history, mut sub) = hub.subscribe_with_history();
        hub.add_log("after");
        assert_eq!(history, vec!["before"]);
        assert_eq!(sub.recv().await.as_deref(), Some("after"));
        assert_eq!(sub.try_recv(), None);
    }
}
