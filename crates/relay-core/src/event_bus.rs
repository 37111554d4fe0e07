use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::mpsc;

use relay_types::EngineEvent;

/// Bound on replayed history per stream (task/<id> or conversation/<id>).
pub const REPLAY_BUFFER_CAP: usize = 500;
/// Bound on concurrent live subscribers per stream.
pub const MAX_SUBSCRIBERS_PER_STREAM: usize = 10;

#[derive(Debug, Error)]
pub enum EventBusError {
    #[error("stream {0} already has the maximum of {MAX_SUBSCRIBERS_PER_STREAM} subscribers")]
    TooManySubscribers(String),
}

struct StreamState {
    replay: VecDeque<EngineEvent>,
    subscribers: HashMap<u64, mpsc::UnboundedSender<EngineEvent>>,
}

impl StreamState {
    fn new() -> Self {
        Self {
            replay: VecDeque::with_capacity(REPLAY_BUFFER_CAP),
            subscribers: HashMap::new(),
        }
    }

    fn push_replay(&mut self, event: EngineEvent) {
        if self.replay.len() >= REPLAY_BUFFER_CAP {
            self.replay.pop_front();
        }
        self.replay.push_back(event);
    }
}

/// A live subscription to one stream. Dropping it unsubscribes.
pub struct Subscription {
    stream_id: String,
    subscriber_id: u64,
    bus: EventBus,
    pub receiver: mpsc::UnboundedReceiver<EngineEvent>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.stream_id, self.subscriber_id);
    }
}

/// Delivers events to every live subscriber of a named stream while
/// retaining a bounded replay tail so late joiners lose nothing recent.
///
/// `publish` never fails: a subscriber whose channel is closed is
/// dropped silently rather than treated as an error.
#[derive(Clone)]
pub struct EventBus {
    streams: std::sync::Arc<Mutex<HashMap<String, StreamState>>>,
    next_subscriber_id: std::sync::Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            streams: std::sync::Arc::new(Mutex::new(HashMap::new())),
            next_subscriber_id: std::sync::Arc::new(AtomicU64::new(1)),
        }
    }

    /// Appends `event` to the stream's replay buffer, then fans it out
    /// to every live subscriber. Send failures just drop that subscriber.
    pub fn publish(&self, stream_id: &str, event: EngineEvent) {
        let mut streams = self.streams.lock().expect("event bus mutex poisoned");
        let state = streams
            .entry(stream_id.to_string())
            .or_insert_with(StreamState::new);
        state.push_replay(event.clone());
        state
            .subscribers
            .retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    /// Subscribes to `stream_id`, returning the replay tail (oldest
    /// first) and a live subscription. Rejects once the stream already
    /// has `MAX_SUBSCRIBERS_PER_STREAM` subscribers.
    ///
    /// Origin allowlisting happens one layer up, at the websocket
    /// upgrade, since this type has no notion of HTTP headers.
    pub fn subscribe(&self, stream_id: &str) -> Result<(Vec<EngineEvent>, Subscription), EventBusError> {
        let mut streams = self.streams.lock().expect("event bus mutex poisoned");
        let state = streams
            .entry(stream_id.to_string())
            .or_insert_with(StreamState::new);
        if state.subscribers.len() >= MAX_SUBSCRIBERS_PER_STREAM {
            return Err(EventBusError::TooManySubscribers(stream_id.to_string()));
        }
        let subscriber_id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        state.subscribers.insert(subscriber_id, tx);
        let replay = state.replay.iter().cloned().collect();
        drop(streams);
        Ok((
            replay,
            Subscription {
                stream_id: stream_id.to_string(),
                subscriber_id,
                bus: self.clone(),
                receiver: rx,
            },
        ))
    }

    fn unsubscribe(&self, stream_id: &str, subscriber_id: u64) {
        let mut streams = self.streams.lock().expect("event bus mutex poisoned");
        if let Some(state) = streams.get_mut(stream_id) {
            state.subscribers.remove(&subscriber_id);
            if state.subscribers.is_empty() && state.replay.is_empty() {
                streams.remove(stream_id);
            }
        }
    }

    /// Current number of live subscribers on `stream_id`.
    pub fn subscriber_count(&self, stream_id: &str) -> usize {
        self.streams
            .lock()
            .expect("event bus mutex poisoned")
            .get(stream_id)
            .map(|s| s.subscribers.len())
            .unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

pub fn task_stream(task_id: &str) -> String {
    format!("task/{task_id}")
}

pub fn conversation_stream(conversation_id: &str) -> String {
    format!("conversation/{conversation_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn publish_before_subscribe_is_replayed() {
        let bus = EventBus::new();
        bus.publish("task/t1", EngineEvent::new("output", json!({"line": "one"})));
        bus.publish("task/t1", EngineEvent::new("output", json!({"line": "two"})));

        let (replay, _sub) = bus.subscribe("task/t1").unwrap();
        assert_eq!(replay.len(), 2);
        assert_eq!(replay[0].properties["line"], "one");
        assert_eq!(replay[1].properties["line"], "two");
    }

    #[test]
    fn replay_buffer_drops_oldest_past_cap() {
        let bus = EventBus::new();
        for i in 0..(REPLAY_BUFFER_CAP + 10) {
            bus.publish("task/t1", EngineEvent::new("output", json!({"line": i})));
        }
        let (replay, _sub) = bus.subscribe("task/t1").unwrap();
        assert_eq!(replay.len(), REPLAY_BUFFER_CAP);
        assert_eq!(replay[0].properties["line"], 10);
    }

    #[test]
    fn eleventh_subscriber_is_rejected() {
        let bus = EventBus::new();
        let mut subs = Vec::new();
        for _ in 0..MAX_SUBSCRIBERS_PER_STREAM {
            let (_, sub) = bus.subscribe("task/t1").unwrap();
            subs.push(sub);
        }
        assert!(bus.subscribe("task/t1").is_err());
    }

    #[test]
    fn unsubscribe_frees_a_slot() {
        let bus = EventBus::new();
        let mut subs = Vec::new();
        for _ in 0..MAX_SUBSCRIBERS_PER_STREAM {
            let (_, sub) = bus.subscribe("task/t1").unwrap();
            subs.push(sub);
        }
        subs.pop();
        assert!(bus.subscribe("task/t1").is_ok());
    }

    #[tokio::test]
    async fn live_subscriber_receives_subsequent_publishes() {
        let bus = EventBus::new();
        let (_, mut sub) = bus.subscribe("task/t1").unwrap();
        bus.publish("task/t1", EngineEvent::new("output", json!({"line": "live"})));
        let event = sub.receiver.recv().await.unwrap();
        assert_eq!(event.properties["line"], "live");
    }
}
