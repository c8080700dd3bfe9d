//! The stream-job kernel: append-only log with replaying fan-out.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::trace;

/// Extra buffer slots granted to every subscriber beyond the replayed log.
const SUBSCRIBER_HEADROOM: usize = 16;

struct Inner {
    logs: Vec<String>,
    listeners: Vec<mpsc::Sender<String>>,
    done: bool,
}

/// An in-memory job exposing an ordered log to many subscribers.
///
/// All subscribers observe messages in the order of `append` calls. The
/// log lives only as long as the process; that is deliberate — stream
/// jobs narrate operations, they are not the system of record.
pub struct StreamJob {
    pub id: String,
    pub owner: String,
    pub created_at: DateTime<Utc>,
    inner: Mutex<Inner>,
}

impl StreamJob {
    /// Create a job with an id of `{prefix}_{unix-nanos}`.
    pub fn new(prefix: &str, owner: &str) -> Self {
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        Self {
            id: format!("{prefix}_{nanos}"),
            owner: owner.to_string(),
            created_at: Utc::now(),
            inner: Mutex::new(Inner {
                logs: Vec::new(),
                listeners: Vec::new(),
                done: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a log line and fan it out to live subscribers.
    ///
    /// A subscriber whose buffer is full loses this message; nobody else
    /// is affected and the producer never blocks. Appends after `done`
    /// are dropped.
    pub fn append(&self, message: impl Into<String>) {
        let message = message.into();
        let mut inner = self.lock();
        if inner.done {
            trace!(job = %self.id, "append after done ignored");
            return;
        }

        inner.logs.push(message.clone());
        inner.listeners.retain(|listener| {
            match listener.try_send(message.clone()) {
                Ok(()) => true,
                // Full buffer: drop the message for this subscriber only.
                Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Subscribe, receiving the full log so far followed by live messages.
    ///
    /// The channel buffer is sized to the current log plus headroom, so
    /// the replay itself can never drop. Subscribing after `done` yields
    /// a channel that replays the log and then closes.
    pub fn subscribe(&self) -> mpsc::Receiver<String> {
        let mut inner = self.lock();
        let (tx, rx) = mpsc::channel(inner.logs.len() + SUBSCRIBER_HEADROOM);

        for entry in &inner.logs {
            // Capacity is guaranteed; a failure here means the receiver
            // vanished already, which only this subscriber notices.
            let _ = tx.try_send(entry.clone());
        }

        if !inner.done {
            inner.listeners.push(tx);
        }
        rx
    }

    /// Detach a subscriber. Dropping the receiver has the same effect;
    /// this only prunes the sender eagerly.
    pub fn unsubscribe(&self, receiver: mpsc::Receiver<String>) {
        drop(receiver);
        let mut inner = self.lock();
        inner.listeners.retain(|listener| !listener.is_closed());
    }

    /// Mark the job finished and close every subscriber channel after
    /// pending deliveries drain. Idempotent.
    pub fn mark_done(&self) {
        let mut inner = self.lock();
        if inner.done {
            return;
        }
        inner.done = true;
        // Dropping the senders closes each channel once its buffered
        // messages are consumed.
        inner.listeners.clear();
    }

    /// Whether the job has finished.
    pub fn is_done(&self) -> bool {
        self.lock().done
    }

    /// Number of log lines appended so far.
    pub fn log_len(&self) -> usize {
        self.lock().logs.len()
    }

    /// Snapshot of the log.
    pub fn logs(&self) -> Vec<String> {
        self.lock().logs.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_replays_then_receives_live() {
        let job = StreamJob::new("job", "tester");
        job.append("m1");
        job.append("m2");

        let mut rx = job.subscribe();
        assert_eq!(rx.recv().await.as_deref(), Some("m1"));
        assert_eq!(rx.recv().await.as_deref(), Some("m2"));

        job.append("m3");
        assert_eq!(rx.recv().await.as_deref(), Some("m3"));

        job.mark_done();
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn subscribers_see_a_prefix_in_append_order() {
        let job = StreamJob::new("job", "tester");
        let mut rx = job.subscribe();

        for i in 0..10 {
            job.append(format!("msg-{i}"));
        }
        job.mark_done();

        let mut seen = Vec::new();
        while let Some(msg) = rx.recv().await {
            seen.push(msg);
        }
        let expected: Vec<String> = (0..10).map(|i| format!("msg-{i}")).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn subscribe_after_done_is_replay_then_eof() {
        let job = StreamJob::new("job", "tester");
        job.append("only");
        job.mark_done();

        let mut rx = job.subscribe();
        assert_eq!(rx.recv().await.as_deref(), Some("only"));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn append_after_done_is_a_noop() {
        let job = StreamJob::new("job", "tester");
        job.mark_done();
        job.mark_done();
        job.append("late");
        assert_eq!(job.log_len(), 0);
    }

    #[tokio::test]
    async fn slow_subscriber_drops_without_blocking_others() {
        let job = StreamJob::new("job", "tester");

        // Subscribed at log size 0: buffer holds SUBSCRIBER_HEADROOM.
        let mut slow = job.subscribe();
        for i in 0..(SUBSCRIBER_HEADROOM + 8) {
            job.append(format!("m{i}"));
        }

        // A fresh subscriber replays everything.
        let mut fresh = job.subscribe();
        job.mark_done();

        let mut slow_seen = 0;
        while slow.recv().await.is_some() {
            slow_seen += 1;
        }
        assert_eq!(slow_seen, SUBSCRIBER_HEADROOM);

        let mut fresh_seen = 0;
        while fresh.recv().await.is_some() {
            fresh_seen += 1;
        }
        assert_eq!(fresh_seen, SUBSCRIBER_HEADROOM + 8);
    }

    #[tokio::test]
    async fn unsubscribe_prunes_the_listener() {
        let job = StreamJob::new("job", "tester");
        let rx = job.subscribe();
        job.unsubscribe(rx);
        job.append("after");
        assert_eq!(job.log_len(), 1);
    }

    #[test]
    fn ids_carry_the_prefix() {
        let job = StreamJob::new("teardown_job", "tester");
        assert!(job.id.starts_with("teardown_job_"));
        assert_eq!(job.owner, "tester");
    }
}
