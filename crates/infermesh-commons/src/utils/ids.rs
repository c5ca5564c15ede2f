use std::collections::hash_map::DefaultHasher;
use std::hash::{
    Hash,
    Hasher,
};
use std::sync::atomic::{
    AtomicU64,
    Ordering,
};

use uuid::Uuid;

static REQ_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Process-unique request id: hash of a fresh UUID combined with a monotonic
/// counter, rendered as a decimal string.
pub fn next_request_id() -> String {
    let mut hasher = DefaultHasher::new();
    Uuid::new_v4().hash(&mut hasher);
    REQ_COUNTER.fetch_add(1, Ordering::Relaxed).hash(&mut hasher);
    hasher.finish().to_string()
}

/// Tokenizer requests are identified by the UUID hash alone.
pub fn next_tokenizer_id() -> String {
    let mut hasher = DefaultHasher::new();
    Uuid::new_v4().hash(&mut hasher);
    hasher.finish().to_string()
}
