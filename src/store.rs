//! In-memory stream store: stream lifecycle, the append pipeline, and the
//! read path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex as SyncMutex, RwLock};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use crate::notify::NotificationFabric;
use crate::offset::{self, OffsetQuery};
use crate::types::{
    normalize_content_type, AppendOptions, AppendOutcome, ProducerState, ReadResult,
    Stream, StreamConfig, StreamLifecycleEvent, StreamMessage, WaitResult,
};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("stream not found")]
    NotFound,
    #[error("stream already exists with a different configuration")]
    Conflict,
    #[error("cannot specify both Stream-TTL and Stream-Expires-At")]
    TtlConflict,
    #[error("invalid TTL value")]
    InvalidTtl,
    #[error("invalid Stream-Expires-At timestamp")]
    InvalidExpiresAt,
    #[error("content-type mismatch: expected {expected}, got {actual}")]
    ContentTypeMismatch { expected: String, actual: String },
    #[error("sequence gap: expected {expected}, received {received}")]
    SequenceGap { expected: u64, received: u64 },
    #[error("stale epoch: current is {current}")]
    StaleEpoch { current: u64 },
    #[error("epoch advanced but sequence was not reset to 0")]
    InvalidEpochSeq,
    #[error("Stream-Seq must be strictly greater than the stream's last Stream-Seq")]
    SequenceConflict,
    #[error("invalid JSON body")]
    InvalidJson,
    #[error("empty JSON arrays are not allowed on append")]
    EmptyArray,
    #[error("empty body not allowed")]
    EmptyBody,
    #[error("invalid offset: {0}")]
    InvalidOffset(String),
}

impl From<offset::InvalidOffset> for StoreError {
    fn from(e: offset::InvalidOffset) -> Self {
        StoreError::InvalidOffset(e.0)
    }
}

/// Outcome of the producer-fencing state machine (spec §4.3 step 4), prior
/// to being folded into the overall [`AppendOutcome`].
enum ProducerDecision {
    Proposed { epoch: u64, seq: u64 },
    Duplicate { epoch: u64, seq: u64 },
}

fn validate_producer(
    producers: &mut HashMap<String, ProducerState>,
    producer_id: &str,
    epoch: u64,
    seq: u64,
    now_ms: i64,
    ttl_ms: i64,
) -> Result<ProducerDecision, StoreError> {
    producers.retain(|_, p| now_ms - p.last_updated < ttl_ms);

    match producers.get(producer_id) {
        None => {
            if seq != 0 {
                return Err(StoreError::SequenceGap {
                    expected: 0,
                    received: seq,
                });
            }
            Ok(ProducerDecision::Proposed { epoch, seq: 0 })
        }
        Some(s) if epoch < s.epoch => Err(StoreError::StaleEpoch { current: s.epoch }),
        Some(s) if epoch > s.epoch => {
            if seq != 0 {
                return Err(StoreError::InvalidEpochSeq);
            }
            Ok(ProducerDecision::Proposed { epoch, seq: 0 })
        }
        Some(s) if seq <= s.last_seq => Ok(ProducerDecision::Duplicate {
            epoch: s.epoch,
            seq: s.last_seq,
        }),
        Some(s) if seq == s.last_seq + 1 => Ok(ProducerDecision::Proposed { epoch, seq }),
        Some(s) => Err(StoreError::SequenceGap {
            expected: s.last_seq + 1,
            received: seq,
        }),
    }
}

/// A parsed, ready-to-store JSON append body.
enum JsonAppend {
    /// The source was `[]`. Silently accepted (0-byte no-op) only on
    /// initial create; a client error on any later append.
    EmptyArray,
    Data(Vec<u8>),
}

fn process_json_append(raw: &[u8]) -> Result<JsonAppend, StoreError> {
    let value: serde_json::Value =
        serde_json::from_slice(raw).map_err(|_| StoreError::InvalidJson)?;

    match value {
        serde_json::Value::Array(elements) if elements.is_empty() => Ok(JsonAppend::EmptyArray),
        serde_json::Value::Array(elements) => {
            let mut out = Vec::new();
            for element in &elements {
                out.extend_from_slice(element.to_string().as_bytes());
                out.push(b',');
            }
            Ok(JsonAppend::Data(out))
        }
        other => {
            let mut out = other.to_string().into_bytes();
            out.push(b',');
            Ok(JsonAppend::Data(out))
        }
    }
}

/// Render a read's selected messages into a response body for the given
/// content type. JSON streams wrap the stored trailing-comma internal form
/// into a proper JSON array; anything else is the raw byte concatenation.
pub fn format_response(is_json: bool, messages: &[StreamMessage]) -> Vec<u8> {
    let mut data: Vec<u8> = messages.iter().flat_map(|m| m.data.iter().copied()).collect();

    if !is_json {
        return data;
    }

    if data.last() == Some(&b',') {
        data.pop();
    }
    let mut out = Vec::with_capacity(data.len() + 2);
    out.push(b'[');
    out.extend(data);
    out.push(b']');
    out
}

/// In-memory, thread-safe stream store.
pub struct StreamStore {
    streams: RwLock<HashMap<String, Stream>>,
    producer_locks: SyncMutex<HashMap<(String, String), Arc<AsyncMutex<()>>>>,
    notifier: Arc<NotificationFabric>,
    producer_ttl_ms: i64,
    on_lifecycle: Option<Box<dyn Fn(StreamLifecycleEvent) + Send + Sync>>,
}

impl StreamStore {
    pub fn new(producer_ttl_ms: i64) -> Arc<Self> {
        Arc::new(Self {
            streams: RwLock::new(HashMap::new()),
            producer_locks: SyncMutex::new(HashMap::new()),
            notifier: Arc::new(NotificationFabric::new()),
            producer_ttl_ms,
            on_lifecycle: None,
        })
    }

    pub fn with_lifecycle<F>(producer_ttl_ms: i64, on_lifecycle: F) -> Arc<Self>
    where
        F: Fn(StreamLifecycleEvent) + Send + Sync + 'static,
    {
        Arc::new(Self {
            streams: RwLock::new(HashMap::new()),
            producer_locks: SyncMutex::new(HashMap::new()),
            notifier: Arc::new(NotificationFabric::new()),
            producer_ttl_ms,
            on_lifecycle: Some(Box::new(on_lifecycle)),
        })
    }

    fn emit_lifecycle(&self, event: StreamLifecycleEvent) {
        if let Some(cb) = &self.on_lifecycle {
            cb(event);
        }
    }

    /// Remove `path` from the map if it's expired, emitting a deletion
    /// event. Returns whether it was removed.
    fn evict_if_expired(&self, streams: &mut HashMap<String, Stream>, path: &str) -> bool {
        let expired = streams.get(path).map(|s| s.is_expired()).unwrap_or(false);
        if expired {
            streams.remove(path);
            self.notifier.cancel_path(path);
            self.emit_lifecycle(StreamLifecycleEvent::Deleted {
                path: path.to_string(),
                timestamp: Utc::now().timestamp_millis(),
            });
        }
        expired
    }

    pub fn get(&self, path: &str) -> Result<Stream, StoreError> {
        let mut streams = self.streams.write();
        self.evict_if_expired(&mut streams, path);
        streams.get(path).cloned().ok_or(StoreError::NotFound)
    }

    pub fn has(&self, path: &str) -> bool {
        self.get(path).is_ok()
    }

    pub fn get_current_offset(&self, path: &str) -> Option<String> {
        self.get(path).ok().map(|s| s.current_offset)
    }

    pub fn get_producer_epoch(&self, path: &str, producer_id: &str) -> Option<u64> {
        self.get(path)
            .ok()
            .and_then(|s| s.producers.get(producer_id).map(|p| p.epoch))
    }

    /// Create a stream. Idempotent when an equivalent, non-expired stream
    /// already exists (same normalized content-type, TTL, and expiry).
    ///
    /// Returns `(stream, created)`, where `created` is `false` for the
    /// idempotent re-creation case (the HTTP layer uses it to pick 201 vs.
    /// 200).
    pub fn create(&self, path: &str, config: StreamConfig) -> Result<(Stream, bool), StoreError> {
        if config.ttl_seconds.is_some() && config.expires_at.is_some() {
            return Err(StoreError::TtlConflict);
        }
        if config.ttl_seconds == Some(0) {
            return Err(StoreError::InvalidTtl);
        }

        {
            let mut streams = self.streams.write();
            self.evict_if_expired(&mut streams, path);

            if let Some(existing) = streams.get(path) {
                let existing_ct = existing
                    .content_type
                    .as_deref()
                    .map(normalize_content_type)
                    .unwrap_or_else(|| normalize_content_type(crate::types::DEFAULT_CONTENT_TYPE));
                let new_ct = config
                    .content_type
                    .as_deref()
                    .map(normalize_content_type)
                    .unwrap_or_else(|| normalize_content_type(crate::types::DEFAULT_CONTENT_TYPE));

                if existing_ct == new_ct
                    && existing.ttl_seconds == config.ttl_seconds
                    && existing.expires_at == config.expires_at
                {
                    return Ok((existing.clone(), false));
                }
                return Err(StoreError::Conflict);
            }

            let mut stream = Stream::new(path.to_string());
            stream.content_type = config.content_type.clone();
            stream.ttl_seconds = config.ttl_seconds;
            stream.expires_at = config.expires_at;
            streams.insert(path.to_string(), stream);

            info!(path = %path, "created stream");
            self.emit_lifecycle(StreamLifecycleEvent::Created {
                path: path.to_string(),
                content_type: config.content_type.clone(),
                timestamp: Utc::now().timestamp_millis(),
            });
        }

        // Initial data runs through the normal append pipeline so that JSON
        // framing, the empty-array exception, and offset accounting all
        // follow the same code path as a regular append. If it fails, the
        // stream creation as a whole is rolled back.
        if let Some(data) = config.initial_data {
            if !data.is_empty() {
                let result = self.append_inner(path, data, AppendOptions::default(), true);
                if let Err(e) = result {
                    self.streams.write().remove(path);
                    return Err(e);
                }
            }
        }

        Ok((self.get(path)?, true))
    }

    pub fn delete(&self, path: &str) -> bool {
        let removed = self.streams.write().remove(path).is_some();
        if removed {
            info!(path = %path, "deleted stream");
            self.notifier.cancel_path(path);
            self.emit_lifecycle(StreamLifecycleEvent::Deleted {
                path: path.to_string(),
                timestamp: Utc::now().timestamp_millis(),
            });
        }
        removed
    }

    /// Acquire (creating if necessary) the serialization lock for a
    /// `(path, producerId)` pair. Held across the whole append so concurrent
    /// retries from the same producer serialize; independent producers never
    /// contend with each other.
    async fn producer_guard(&self, path: &str, producer_id: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let key = (path.to_string(), producer_id.to_string());
        let lock = self
            .producer_locks
            .lock()
            .entry(key)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    pub async fn append(
        &self,
        path: &str,
        data: Vec<u8>,
        opts: AppendOptions,
    ) -> Result<AppendOutcome, StoreError> {
        let _guard = if let Some(p) = &opts.producer {
            Some(self.producer_guard(path, &p.id).await)
        } else {
            None
        };

        self.append_inner(path, data, opts, false)
    }

    /// The synchronous core of the append pipeline (spec §4.3 steps 2–8),
    /// callable either directly or with a producer lock already held.
    fn append_inner(
        &self,
        path: &str,
        data: Vec<u8>,
        opts: AppendOptions,
        is_initial_create: bool,
    ) -> Result<AppendOutcome, StoreError> {
        let mut streams = self.streams.write();

        if self.evict_if_expired(&mut streams, path) || !streams.contains_key(path) {
            return Err(StoreError::NotFound);
        }
        let stream = streams.get_mut(path).unwrap();

        if let (Some(requested), Some(existing)) = (&opts.content_type, &stream.content_type) {
            if normalize_content_type(requested) != normalize_content_type(existing) {
                return Err(StoreError::ContentTypeMismatch {
                    expected: existing.clone(),
                    actual: requested.clone(),
                });
            }
        }

        let proposed_producer = if let Some(p) = &opts.producer {
            let now_ms = Utc::now().timestamp_millis();
            match validate_producer(
                &mut stream.producers,
                &p.id,
                p.epoch,
                p.seq,
                now_ms,
                self.producer_ttl_ms,
            )? {
                ProducerDecision::Duplicate { epoch, seq } => {
                    return Ok(AppendOutcome::Duplicate { epoch, seq });
                }
                ProducerDecision::Proposed { epoch, seq } => Some((p.id.clone(), epoch, seq)),
            }
        } else {
            None
        };

        if let Some(seq) = &opts.stream_seq {
            if let Some(last) = &stream.last_stream_seq {
                if seq.as_str() <= last.as_str() {
                    return Err(StoreError::SequenceConflict);
                }
            }
        }

        let processed = if stream.is_json() {
            match process_json_append(&data)? {
                JsonAppend::EmptyArray if is_initial_create => Vec::new(),
                JsonAppend::EmptyArray => return Err(StoreError::EmptyArray),
                JsonAppend::Data(bytes) => bytes,
            }
        } else {
            data
        };

        let new_offset = if processed.is_empty() {
            stream.current_offset.clone()
        } else {
            let new_byte_offset = stream.current_byte_offset() + processed.len() as u64;
            let new_offset = offset::encode(stream.current_read_seq(), new_byte_offset);
            stream.messages.push(StreamMessage {
                data: processed,
                offset: new_offset.clone(),
                timestamp: Utc::now().timestamp_millis(),
            });
            stream.current_offset = new_offset.clone();
            new_offset
        };

        if let Some((id, epoch, seq)) = &proposed_producer {
            stream.producers.insert(
                id.clone(),
                ProducerState {
                    epoch: *epoch,
                    last_seq: *seq,
                    last_updated: Utc::now().timestamp_millis(),
                },
            );
        }
        if let Some(seq) = opts.stream_seq {
            stream.last_stream_seq = Some(seq);
        }

        let appended_message = stream.messages.last().cloned();
        let all_messages_snapshot = if appended_message.is_some() {
            Some(stream.messages.clone())
        } else {
            None
        };
        debug!(path = %path, offset = %new_offset, "appended to stream");
        drop(streams);

        if let Some(messages) = all_messages_snapshot {
            self.notifier.notify(path, &messages);
        }

        Ok(AppendOutcome::Accepted {
            offset: new_offset,
            producer: proposed_producer.map(|(_, epoch, seq)| (epoch, seq)),
        })
    }

    /// Catch-up read: messages strictly after `offset` (or all messages, if
    /// `offset` is the start sentinel).
    pub fn read(&self, path: &str, offset: &OffsetQuery) -> Result<ReadResult, StoreError> {
        let stream = self.get(path)?;
        let resolved = offset.resolve(&stream.current_offset);

        let messages: Vec<StreamMessage> = match &resolved {
            None => stream.messages.clone(),
            Some(o) => stream
                .messages
                .iter()
                .filter(|m| crate::offset::compare(&m.offset, o) == std::cmp::Ordering::Greater)
                .cloned()
                .collect(),
        };

        // Every stored message carries the post-append tail offset, so a
        // non-empty result always reaches all the way to `current_offset`.
        // An empty result is caught up iff the caller's own resolved offset
        // is already at (or, for a brand new stream, absent and nothing
        // exists to read).
        let up_to_date = match (messages.last(), &resolved) {
            (Some(_), _) => true,
            (None, Some(o)) => offset::compare(o, &stream.current_offset) != std::cmp::Ordering::Less,
            (None, None) => stream.messages.is_empty(),
        };

        Ok(ReadResult { messages, up_to_date })
    }

    /// Wait for messages past `offset` on `path`, resolving immediately if
    /// any already exist.
    pub async fn wait_for_messages(
        &self,
        path: &str,
        offset: &OffsetQuery,
        timeout: Duration,
    ) -> Result<WaitResult, StoreError> {
        let stream = self.get(path)?;
        let resolved = offset.resolve(&stream.current_offset);

        let already: Vec<StreamMessage> = match &resolved {
            None => stream.messages.clone(),
            Some(o) => stream
                .messages
                .iter()
                .filter(|m| crate::offset::compare(&m.offset, o) == std::cmp::Ordering::Greater)
                .cloned()
                .collect(),
        };

        Ok(self.notifier.wait(path, resolved, already, timeout).await)
    }

    pub fn clear(&self) {
        self.streams.write().clear();
        self.producer_locks.lock().clear();
    }

    /// Resolve every outstanding long-poll/SSE waiter with an empty,
    /// timed-out result. Intended for graceful shutdown.
    pub fn cancel_all_waits(&self) {
        self.notifier.cancel_all();
    }
}
