//! Filesystem-safe path encoding, for a future on-disk store.
//!
//! The in-memory store keys streams directly by their URL path. A
//! file-backed store would need a filesystem-safe key instead; this module
//! is that extension point, unwired to anything today and built only under
//! the `file-storage` feature.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use sha2::{Digest, Sha256};

/// Maximum length for an encoded path before truncation.
const MAX_PATH_LENGTH: usize = 200;
/// Length to truncate to, leaving room for the hash suffix.
const TRUNCATE_LENGTH: usize = 180;
/// Length of the hash prefix used for truncated paths.
const HASH_PREFIX_LENGTH: usize = 16;

/// Encode a URL path to a filesystem-safe string.
///
/// Long paths are truncated with a hash suffix to keep the result within
/// filesystem name-length limits while staying unique.
pub fn encode_path(path: &str) -> String {
    let encoded = URL_SAFE_NO_PAD.encode(path.as_bytes());

    if encoded.len() > MAX_PATH_LENGTH {
        let hash = compute_hash(path);
        let truncated = &encoded[..TRUNCATE_LENGTH];
        format!("{}~{}", truncated, &hash[..HASH_PREFIX_LENGTH])
    } else {
        encoded
    }
}

/// Decode a filesystem-safe string back to a URL path.
///
/// Truncated paths (containing `~`) can't be recovered and return `None`.
pub fn decode_path(encoded: &str) -> Option<String> {
    if encoded.contains('~') {
        return None;
    }

    URL_SAFE_NO_PAD
        .decode(encoded)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
}

fn compute_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Generate a unique directory name for a stream: `{encoded_path}~{timestamp}~{random_hex}`.
/// The timestamp/random suffix lets a deleted stream's path be reused immediately
/// while the old directory is still being torn down asynchronously.
pub fn generate_stream_dir_name(path: &str) -> String {
    let encoded = encode_path(path);
    let timestamp = chrono::Utc::now().timestamp_millis();
    let random: u64 = rand::random();
    format!("{}~{}~{:016x}", encoded, timestamp, random)
}

/// Extract the encoded-path portion from a stream directory name.
pub fn extract_encoded_path(dir_name: &str) -> Option<&str> {
    dir_name.split('~').next()
}
