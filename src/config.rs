//! Store tunables (normative defaults).
//!
//! Values are intentionally explicit about their units to avoid confusion.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Chunk size for streaming attachment copies. Bounds staging memory.
    pub attachment_copy_buf_bytes: usize,
    /// Per-subscriber event queue depth; laggards past this are dropped.
    pub max_event_queue_events: usize,
    /// Hard cap on registered event subscribers.
    pub max_event_subscribers: usize,
    /// SQLite busy handler timeout.
    pub sqlite_busy_timeout_ms: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            attachment_copy_buf_bytes: 64 * 1024,
            max_event_queue_events: 256,
            max_event_subscribers: 64,
            sqlite_busy_timeout_ms: 5_000,
        }
    }
}
