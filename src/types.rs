//! Core data model: messages, producer state, streams, and server options.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::offset::{self, INITIAL_OFFSET};

/// A single appended message. Immutable once stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamMessage {
    /// Stored bytes. For JSON-mode streams this is the internal
    /// trailing-comma form, not a standalone valid JSON value.
    pub data: Vec<u8>,
    /// The offset this message advanced the stream to (i.e. the post-append
    /// tail, not the position the message starts at).
    pub offset: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// Per-`(stream, producerId)` idempotency state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProducerState {
    pub epoch: u64,
    pub last_seq: u64,
    pub last_updated: i64,
}

/// Stream metadata and its message log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stream {
    pub path: String,
    pub content_type: Option<String>,
    pub messages: Vec<StreamMessage>,
    pub current_offset: String,
    /// The last accepted `Stream-Seq` value (opaque, lexicographically
    /// compared), independent of any producer's sequence number.
    pub last_stream_seq: Option<String>,
    pub ttl_seconds: Option<u64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: i64,
    pub producers: HashMap<String, ProducerState>,
}

impl Stream {
    pub fn new(path: String) -> Self {
        Self {
            path,
            content_type: None,
            messages: Vec::new(),
            current_offset: INITIAL_OFFSET.to_string(),
            last_stream_seq: None,
            ttl_seconds: None,
            expires_at: None,
            created_at: Utc::now().timestamp_millis(),
            producers: HashMap::new(),
        }
    }

    pub fn is_expired(&self) -> bool {
        if let Some(expires_at) = self.expires_at {
            if Utc::now() >= expires_at {
                return true;
            }
        }
        if let Some(ttl_seconds) = self.ttl_seconds {
            let expiry = self.created_at + ttl_seconds as i64 * 1000;
            if Utc::now().timestamp_millis() >= expiry {
                return true;
            }
        }
        false
    }

    pub fn is_json(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|ct| normalize_content_type(ct) == "application/json")
            .unwrap_or(false)
    }

    /// Byte length of `current_offset`'s byte-offset component.
    pub fn current_byte_offset(&self) -> u64 {
        offset::decode(&self.current_offset)
            .map(|(_, byte_offset)| byte_offset)
            .unwrap_or(0)
    }

    pub fn current_read_seq(&self) -> u64 {
        offset::decode(&self.current_offset)
            .map(|(read_seq, _)| read_seq)
            .unwrap_or(0)
    }
}

/// Configuration accepted by `StreamStore::create`.
#[derive(Debug, Clone, Default)]
pub struct StreamConfig {
    pub content_type: Option<String>,
    pub ttl_seconds: Option<u64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub initial_data: Option<Vec<u8>>,
}

/// A producer identity attached to an append.
#[derive(Debug, Clone)]
pub struct ProducerRef {
    pub id: String,
    pub epoch: u64,
    pub seq: u64,
}

/// Options accepted by `StreamStore::append`.
#[derive(Debug, Clone, Default)]
pub struct AppendOptions {
    pub content_type: Option<String>,
    pub stream_seq: Option<String>,
    pub producer: Option<ProducerRef>,
}

/// Result of an accepted (or deduplicated) append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    Accepted {
        offset: String,
        producer: Option<(u64, u64)>,
    },
    Duplicate {
        epoch: u64,
        seq: u64,
    },
}

/// Result of a catch-up read.
#[derive(Debug, Clone)]
pub struct ReadResult {
    pub messages: Vec<StreamMessage>,
    pub up_to_date: bool,
}

/// Result of `StreamStore::wait_for_messages`.
#[derive(Debug, Clone)]
pub struct WaitResult {
    pub messages: Vec<StreamMessage>,
    pub timed_out: bool,
}

/// Stream lifecycle event, for optional external hooks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamLifecycleEvent {
    Created {
        path: String,
        content_type: Option<String>,
        timestamp: i64,
    },
    Deleted {
        path: String,
        timestamp: i64,
    },
}

/// Server-wide tunables.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub port: u16,
    pub host: String,
    pub long_poll_timeout_ms: u64,
    pub cursor_interval_seconds: u64,
    pub cursor_epoch: DateTime<Utc>,
    /// How long a producer's idempotency state survives without activity
    /// before it's evicted (default 7 days).
    pub producer_ttl_ms: i64,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            port: 4437,
            host: "127.0.0.1".to_string(),
            long_poll_timeout_ms: 30_000,
            cursor_interval_seconds: 20,
            cursor_epoch: DateTime::parse_from_rfc3339("2024-10-09T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            producer_ttl_ms: 7 * 24 * 60 * 60 * 1000,
        }
    }
}

/// Normalize a content-type by stripping parameters and whitespace and
/// lowercasing, e.g. `"Application/JSON; charset=utf-8"` -> `"application/json"`.
pub fn normalize_content_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
        .to_ascii_lowercase()
}

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
