//! Status publisher: typed events mirrored out to every observer.
//!
//! Events fan out over a broadcast channel for persistent subscribers (SSE),
//! with a bounded in-memory history as the pull fallback for transports that
//! cannot hold a connection. De-duplication is per subscriber: each
//! [`Subscription`] owns its own debounce cache keyed by
//! `(event type, subject id, message)` with TTL eviction, so one slow
//! operator console cannot suppress alerts for another.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::debug;

/// How many events the pull-fallback buffer retains.
const HISTORY_CAP: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    JobStarted,
    JobCompleted,
    JobError,
    StageStarted,
    StageProgress,
    StageCompleted,
    StageError,
    PipelineStarted,
    PipelineCompleted,
    PipelineError,
    PipelineStopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// Monotonic sequence number, usable as a pull cursor.
    pub seq: u64,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub subject_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

struct History {
    buf: VecDeque<Event>,
    next_seq: u64,
}

pub struct EventPublisher {
    tx: broadcast::Sender<Event>,
    history: Mutex<History>,
    debounce_ttl: Duration,
}

impl EventPublisher {
    pub fn new(debounce_ttl: Duration) -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            tx,
            history: Mutex::new(History {
                buf: VecDeque::with_capacity(HISTORY_CAP),
                next_seq: 1,
            }),
            debounce_ttl,
        }
    }

    /// Records the event in the history buffer and fans it out. Never blocks;
    /// having no live subscribers is not an error.
    pub fn publish(
        &self,
        event_type: EventType,
        subject_id: &str,
        payload: serde_json::Value,
        message: Option<String>,
    ) {
        let event = {
            let mut history = self.history.lock().unwrap();
            let event = Event {
                seq: history.next_seq,
                event_type,
                subject_id: subject_id.to_string(),
                message,
                payload,
                timestamp: Utc::now(),
            };
            history.next_seq += 1;
            if history.buf.len() == HISTORY_CAP {
                history.buf.pop_front();
            }
            history.buf.push_back(event.clone());
            event
        };

        debug!(event_type = ?event.event_type, subject = %event.subject_id, seq = event.seq, "event published");
        let _ = self.tx.send(event);
    }

    /// Pull fallback: every buffered event with `seq > cursor`, oldest first.
    /// Events already evicted from the bounded buffer are gone.
    pub fn events_since(&self, cursor: u64) -> Vec<Event> {
        let history = self.history.lock().unwrap();
        history
            .buf
            .iter()
            .filter(|e| e.seq > cursor)
            .cloned()
            .collect()
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            seen: HashMap::new(),
            ttl: self.debounce_ttl,
        }
    }
}

/// One observer's view of the event stream.
///
/// Delivery is at-least-once overall, but semantically identical events —
/// same `(type, subject id, message)` — arriving within the TTL window are
/// delivered at most once through this subscription.
pub struct Subscription {
    rx: broadcast::Receiver<Event>,
    seen: HashMap<(EventType, String, String), Instant>,
    ttl: Duration,
}

impl Subscription {
    /// Next event that survives debouncing, or `None` once the publisher is
    /// gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if self.admit(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("event subscriber lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn admit(&mut self, event: &Event) -> bool {
        let now = Instant::now();
        let ttl = self.ttl;
        self.seen.retain(|_, at| now.duration_since(*at) < ttl);

        let key = (
            event.event_type,
            event.subject_id.clone(),
            event.message.clone().unwrap_or_default(),
        );
        match self.seen.get(&key) {
            Some(at) if now.duration_since(*at) < ttl => false,
            _ => {
                self.seen.insert(key, now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn identical_events_inside_window_delivered_once() {
        let publisher = EventPublisher::new(Duration::from_secs(5));
        let mut sub = publisher.subscribe();

        publisher.publish(EventType::JobCompleted, "job-1", json!({}), None);
        publisher.publish(EventType::JobCompleted, "job-1", json!({}), None);
        publisher.publish(EventType::JobCompleted, "job-2", json!({}), None);

        let first = sub.recv().await.unwrap();
        assert_eq!(first.subject_id, "job-1");
        // The duplicate for job-1 is swallowed; the next delivery is job-2.
        let second = sub.recv().await.unwrap();
        assert_eq!(second.subject_id, "job-2");
    }

    #[tokio::test]
    async fn identical_event_is_delivered_again_after_the_window() {
        let publisher = EventPublisher::new(Duration::from_millis(50));
        let mut sub = publisher.subscribe();

        publisher.publish(EventType::JobCompleted, "job-1", json!({}), None);
        assert_eq!(sub.recv().await.unwrap().subject_id, "job-1");

        tokio::time::sleep(Duration::from_millis(80)).await;

        publisher.publish(EventType::JobCompleted, "job-1", json!({}), None);
        assert_eq!(sub.recv().await.unwrap().subject_id, "job-1");
    }

    #[tokio::test]
    async fn different_messages_are_distinct_facts() {
        let publisher = EventPublisher::new(Duration::from_secs(5));
        let mut sub = publisher.subscribe();

        publisher.publish(
            EventType::StageProgress,
            "scraping",
            json!({}),
            Some("completed=1".to_string()),
        );
        publisher.publish(
            EventType::StageProgress,
            "scraping",
            json!({}),
            Some("completed=2".to_string()),
        );

        assert_eq!(sub.recv().await.unwrap().message.as_deref(), Some("completed=1"));
        assert_eq!(sub.recv().await.unwrap().message.as_deref(), Some("completed=2"));
    }

    #[test]
    fn cursor_pull_returns_only_newer_events() {
        let publisher = EventPublisher::new(Duration::from_secs(5));
        publisher.publish(EventType::JobStarted, "job-1", json!({}), None);
        publisher.publish(EventType::JobCompleted, "job-1", json!({}), None);

        let all = publisher.events_since(0);
        assert_eq!(all.len(), 2);

        let newer = publisher.events_since(all[0].seq);
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].event_type, EventType::JobCompleted);
    }
}
