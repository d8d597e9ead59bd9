//! Time-bucketed cache-cursor generation, for CDN request collapsing.
//!
//! Time is divided into fixed intervals since a fixed epoch. Two requests
//! for the same data within the same interval get the same cursor, so a
//! caching layer in front of this service can collapse them into one
//! upstream request. If a client presents a cursor that's already caught up
//! to (or ahead of) the current interval, jitter is added so a crowd of
//! long-poll clients doesn't reconnect in lockstep at the interval boundary.

use chrono::{DateTime, Utc};
use rand::Rng;

#[derive(Debug, Clone)]
pub struct CursorOptions {
    /// Interval duration in seconds (default: 20).
    pub interval_seconds: u64,
    /// Epoch for interval numbering (default: 2024-10-09T00:00:00Z).
    pub epoch: DateTime<Utc>,
}

impl Default for CursorOptions {
    fn default() -> Self {
        Self {
            interval_seconds: 20,
            epoch: DateTime::parse_from_rfc3339("2024-10-09T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        }
    }
}

/// The current interval number: `floor((now - epoch) / interval_seconds)`.
pub fn current_interval(options: &CursorOptions) -> u64 {
    let elapsed = Utc::now()
        .signed_duration_since(options.epoch)
        .num_seconds()
        .max(0) as u64;
    elapsed / options.interval_seconds
}

/// Compute the cursor to hand back to a client.
///
/// Without a client cursor, this is just the current interval. With one,
/// if it's behind the current interval we return the current interval (it
/// naturally advances); if it's at or ahead of the current interval we add
/// jitter of 1–3600 seconds, rounded up to at least one interval, so the
/// cursor keeps moving forward without every client jumping the same amount
/// at once.
pub fn cursor(client_cursor: Option<u64>, options: &CursorOptions) -> u64 {
    let interval = current_interval(options);

    match client_cursor {
        None => interval,
        Some(c) if c < interval => interval,
        Some(c) => {
            let jitter_seconds: u64 = rand::thread_rng().gen_range(1..=3600);
            let jitter_intervals = jitter_seconds.div_ceil(options.interval_seconds).max(1);
            c + jitter_intervals
        }
    }
}

pub fn parse_cursor(raw: &str) -> Option<u64> {
    raw.parse().ok()
}
