//! In-process message bus with consumer-group semantics.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{BusError, BusMessage, MessageBus, PendingMessage};

struct StoredMessage {
    seq: u64,
    id: String,
    payload: Value,
}

struct PendingEntry {
    seq: u64,
    consumer: String,
    delivered_at: Instant,
    delivery_count: u32,
}

#[derive(Default)]
struct Group {
    last_delivered: u64,
    pending: HashMap<String, PendingEntry>,
}

#[derive(Default)]
struct Stream {
    messages: VecDeque<StoredMessage>,
    next_seq: u64,
    groups: HashMap<String, Group>,
}

impl Stream {
    fn group_mut(&mut self, stream: &str, group: &str) -> Result<&mut Group, BusError> {
        self.groups
            .get_mut(group)
            .ok_or_else(|| BusError::GroupNotFound {
                stream: stream.to_string(),
                group: group.to_string(),
            })
    }
}

/// [`MessageBus`] backed by process memory.
///
/// Streams, groups and pending lists behave like their stream-server
/// counterparts: a group reads each message once, delivered messages stay
/// pending until acknowledged, and idle pending messages can be claimed by
/// another consumer.
#[derive(Default)]
pub struct MemoryMessageBus {
    streams: Mutex<HashMap<String, Stream>>,
    published: Notify,
}

impl MemoryMessageBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live streams.
    pub fn stream_count(&self) -> usize {
        self.streams.lock().len()
    }

    /// Number of messages in a stream, zero if it does not exist.
    pub fn stream_len(&self, request_id: &str) -> usize {
        self.streams
            .lock()
            .get(request_id)
            .map_or(0, |s| s.messages.len())
    }

    fn try_read(
        &self,
        request_id: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<BusMessage>, BusError> {
        let mut streams = self.streams.lock();
        let not_found = || BusError::GroupNotFound {
            stream: request_id.to_string(),
            group: group.to_string(),
        };
        let stream = streams.get_mut(request_id).ok_or_else(not_found)?;
        let Stream {
            messages, groups, ..
        } = stream;
        let group_state = groups.get_mut(group).ok_or_else(not_found)?;

        let now = Instant::now();
        let after = group_state.last_delivered;
        let mut delivered = Vec::new();
        for message in messages
            .iter()
            .filter(|m| m.seq > after)
            .take(count.max(1))
        {
            group_state.last_delivered = message.seq;
            group_state.pending.insert(
                message.id.clone(),
                PendingEntry {
                    seq: message.seq,
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    delivery_count: 1,
                },
            );
            delivered.push(BusMessage {
                id: message.id.clone(),
                payload: message.payload.clone(),
                delivery_count: 1,
            });
        }
        Ok(delivered)
    }
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

#[async_trait]
impl MessageBus for MemoryMessageBus {
    async fn publish_response(&self, request_id: &str, payload: &Value) -> Result<String, BusError> {
        let id = {
            let mut streams = self.streams.lock();
            let stream = streams.entry(request_id.to_string()).or_default();
            stream.next_seq += 1;
            let id = format!("{}-{}", now_millis(), stream.next_seq);
            stream.messages.push_back(StoredMessage {
                seq: stream.next_seq,
                id: id.clone(),
                payload: payload.clone(),
            });
            id
        };
        self.published.notify_waiters();
        Ok(id)
    }

    async fn read_group(
        &self,
        request_id: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<BusMessage>, BusError> {
        let deadline = Instant::now() + block;
        loop {
            // Register interest before checking so a publish in between is not missed
            let notified = self.published.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let messages = self.try_read(request_id, group, consumer, count)?;
            if !messages.is_empty() {
                return Ok(messages);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(
        &self,
        request_id: &str,
        group: &str,
        message_ids: &[String],
    ) -> Result<usize, BusError> {
        let mut streams = self.streams.lock();
        let Some(stream) = streams.get_mut(request_id) else {
            return Ok(0);
        };
        let group = stream.group_mut(request_id, group)?;
        Ok(message_ids
            .iter()
            .filter(|id| group.pending.remove(id.as_str()).is_some())
            .count())
    }

    async fn create_group(&self, request_id: &str, group: &str) -> Result<(), BusError> {
        self.streams
            .lock()
            .entry(request_id.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn pending(&self, request_id: &str, group: &str) -> Result<Vec<PendingMessage>, BusError> {
        let mut streams = self.streams.lock();
        let stream = streams
            .get_mut(request_id)
            .ok_or_else(|| BusError::StreamNotFound(request_id.to_string()))?;
        let group = stream.group_mut(request_id, group)?;

        let now = Instant::now();
        let mut entries: Vec<(&String, &PendingEntry)> = group.pending.iter().collect();
        entries.sort_by_key(|(_, entry)| entry.seq);
        Ok(entries
            .into_iter()
            .map(|(id, entry)| PendingMessage {
                message_id: id.clone(),
                consumer: entry.consumer.clone(),
                idle: now.saturating_duration_since(entry.delivered_at),
                delivery_count: entry.delivery_count,
            })
            .collect())
    }

    async fn claim(
        &self,
        request_id: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        message_ids: &[String],
    ) -> Result<Vec<BusMessage>, BusError> {
        let mut streams = self.streams.lock();
        let stream = streams
            .get_mut(request_id)
            .ok_or_else(|| BusError::StreamNotFound(request_id.to_string()))?;
        let Stream {
            messages, groups, ..
        } = stream;
        let group_state = groups
            .get_mut(group)
            .ok_or_else(|| BusError::GroupNotFound {
                stream: request_id.to_string(),
                group: group.to_string(),
            })?;

        let now = Instant::now();
        let mut claimed = Vec::new();
        for id in message_ids {
            let Some(entry) = group_state.pending.get_mut(id) else {
                continue;
            };
            if now.saturating_duration_since(entry.delivered_at) < min_idle {
                continue;
            }
            match messages.iter().find(|m| m.seq == entry.seq) {
                Some(message) => {
                    entry.consumer = consumer.to_string();
                    entry.delivered_at = now;
                    entry.delivery_count += 1;
                    claimed.push(BusMessage {
                        id: message.id.clone(),
                        payload: message.payload.clone(),
                        delivery_count: entry.delivery_count,
                    });
                }
                None => {
                    // Trimmed away while pending
                    group_state.pending.remove(id);
                }
            }
        }
        Ok(claimed)
    }

    async fn trim(&self, request_id: &str, max_len: usize) -> Result<usize, BusError> {
        let mut streams = self.streams.lock();
        let Some(stream) = streams.get_mut(request_id) else {
            return Ok(0);
        };
        let excess = stream.messages.len().saturating_sub(max_len);
        stream.messages.drain(..excess);
        Ok(excess)
    }

    async fn delete_stream(&self, request_id: &str) -> Result<bool, BusError> {
        let existed = self.streams.lock().remove(request_id).is_some();
        if existed {
            self.published.notify_waiters();
        }
        Ok(existed)
    }
}
