// crates/core/src/hub.rs
//! Per-channel publish/subscribe with a bounded replay buffer.
//!
//! A channel id is usually a job id. Events pushed to a channel are written
//! to every registered subscriber and appended to a ring buffer so that a
//! subscriber connecting late can be replayed the recent history.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Default number of events retained per channel.
pub const DEFAULT_BUFFER_SIZE: usize = 50;

/// Per-subscriber queue depth. A subscriber that falls this far behind
/// starts losing events (write failure, isolated to that subscriber).
pub const SUBSCRIBER_QUEUE: usize = 256;

/// Event name of the terminal frame sent by [`Hub::end`].
pub const END_EVENT: &str = "end";

/// One published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubEvent {
    /// Per-channel sequence number, starting at 1.
    pub sequence: u64,
    pub event: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl HubEvent {
    pub fn is_end(&self) -> bool {
        self.event == END_EVENT
    }
}

/// Identifies one registered subscriber.
pub type SubscriberId = u64;

/// A sink events are written to.
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub id: SubscriberId,
    tx: mpsc::Sender<HubEvent>,
}

impl Subscriber {
    pub fn new(id: SubscriberId, tx: mpsc::Sender<HubEvent>) -> Self {
        Self { id, tx }
    }

    /// Non-blocking write. Returns false if the subscriber is gone or full.
    fn write(&self, event: &HubEvent) -> bool {
        self.tx.try_send(event.clone()).is_ok()
    }
}

#[derive(Debug, Default)]
struct Channel {
    next_sequence: u64,
    buffer: VecDeque<HubEvent>,
    subscribers: Vec<Subscriber>,
}

impl Channel {
    fn record(&mut self, event: &str, payload: serde_json::Value, capacity: usize) -> HubEvent {
        self.next_sequence += 1;
        let entry = HubEvent {
            sequence: self.next_sequence,
            event: event.to_string(),
            payload,
            timestamp: Utc::now(),
        };
        while self.buffer.len() >= capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(entry.clone());
        entry
    }

    fn deliver(&self, channel_id: &str, event: &HubEvent) {
        for sub in &self.subscribers {
            if !sub.write(event) {
                tracing::debug!(
                    channel = %channel_id,
                    subscriber = sub.id,
                    sequence = event.sequence,
                    "Subscriber write failed"
                );
            }
        }
    }
}

/// Aggregate hub counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubStats {
    pub channels: usize,
    pub subscribers: usize,
    pub buffered_events: usize,
}

/// Broadcast hub. All channel state sits behind one mutex; no method holds it
/// across an `.await`.
pub struct Hub {
    buffer_size: usize,
    next_subscriber: AtomicU64,
    channels: Mutex<HashMap<String, Channel>>,
}

impl Hub {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            next_subscriber: AtomicU64::new(1),
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Channel>> {
        match self.channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Hub mutex poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Allocate a subscriber with its own queue.
    pub fn new_subscriber(&self) -> (Subscriber, mpsc::Receiver<HubEvent>) {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE.max(self.buffer_size + 1));
        (Subscriber::new(id, tx), rx)
    }

    /// Register `subscriber` on `channel_id` and replay every buffered event
    /// to it in original order.
    ///
    /// `last_event_id` is accepted for resumption but currently ignored: the
    /// whole buffer is always replayed.
    pub fn register(&self, channel_id: &str, subscriber: Subscriber, last_event_id: Option<u64>) {
        let mut channels = self.lock();
        let channel = channels.entry(channel_id.to_string()).or_default();
        tracing::debug!(
            channel = %channel_id,
            subscriber = subscriber.id,
            ?last_event_id,
            replay = channel.buffer.len(),
            "Subscriber registered"
        );
        for event in &channel.buffer {
            if !subscriber.write(event) {
                tracing::debug!(channel = %channel_id, subscriber = subscriber.id, "Replay write failed");
                break;
            }
        }
        channel.subscribers.push(subscriber);
    }

    /// Allocate, register and return the receiving end in one call.
    pub fn subscribe(
        &self,
        channel_id: &str,
        last_event_id: Option<u64>,
    ) -> (SubscriberId, mpsc::Receiver<HubEvent>) {
        let (subscriber, rx) = self.new_subscriber();
        let id = subscriber.id;
        self.register(channel_id, subscriber, last_event_id);
        (id, rx)
    }

    /// Remove one subscriber. The channel and its buffer survive even when no
    /// subscriber is left.
    pub fn unregister(&self, channel_id: &str, subscriber_id: SubscriberId) -> bool {
        let mut channels = self.lock();
        let Some(channel) = channels.get_mut(channel_id) else {
            return false;
        };
        let before = channel.subscribers.len();
        channel.subscribers.retain(|s| s.id != subscriber_id);
        before != channel.subscribers.len()
    }

    /// Buffer the event and write it to every current subscriber. Never fails;
    /// a dead subscriber only affects itself.
    pub fn push(&self, channel_id: &str, payload: serde_json::Value, event: &str) -> u64 {
        let mut channels = self.lock();
        let channel = channels.entry(channel_id.to_string()).or_default();
        let entry = channel.record(event, payload, self.buffer_size);
        channel.deliver(channel_id, &entry);
        metrics::counter!(crate::metrics::HUB_EVENTS_TOTAL).increment(1);
        entry.sequence
    }

    /// Send a terminal `end` frame carrying `status`, close every subscriber
    /// and forget the channel entirely.
    pub fn end(&self, channel_id: &str, status: &str) {
        let removed = self.lock().remove(channel_id);
        let Some(mut channel) = removed else {
            tracing::debug!(channel = %channel_id, %status, "End on unknown channel");
            return;
        };
        let entry = channel.record(
            END_EVENT,
            serde_json::json!({ "status": status }),
            self.buffer_size,
        );
        channel.deliver(channel_id, &entry);
        tracing::debug!(
            channel = %channel_id,
            %status,
            subscribers = channel.subscribers.len(),
            "Channel ended"
        );
        // Dropping the senders closes every subscriber stream.
    }

    /// Drop a channel's state without a terminal frame.
    pub fn cleanup(&self, channel_id: &str) -> bool {
        self.lock().remove(channel_id).is_some()
    }

    /// Drop every channel. Used on shutdown.
    pub fn cleanup_all(&self) -> usize {
        let mut channels = self.lock();
        let n = channels.len();
        channels.clear();
        n
    }

    pub fn buffered(&self, channel_id: &str) -> Vec<HubEvent> {
        self.lock()
            .get(channel_id)
            .map(|c| c.buffer.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn active_channels(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn stats(&self) -> HubStats {
        let channels = self.lock();
        HubStats {
            channels: channels.len(),
            subscribers: channels.values().map(|c| c.subscribers.len()).sum(),
            buffered_events: channels.values().map(|c| c.buffer.len()).sum(),
        }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}
