//! Document bodies.
//!
//! A body is an immutable byte sequence, JSON by convention but opaque to the
//! store. The empty body is the literal two bytes `{}` so that stubs and
//! tombstones round-trip as valid JSON objects.

use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

/// The canonical empty body.
pub const EMPTY_BODY: &[u8] = b"{}";

/// Immutable document body, cheap to clone.
#[derive(Clone, PartialEq, Eq)]
pub struct DocumentBody {
    bytes: Arc<[u8]>,
}

impl DocumentBody {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into().into(),
        }
    }

    /// The empty `{}` body used for stubs and tombstones.
    pub fn empty() -> Self {
        Self::new(EMPTY_BODY)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// JSON-object view of the body.
    ///
    /// Returns an empty map when the bytes are not a JSON object, matching
    /// the permissive read path: replication never inspects payloads, only
    /// callers that expect JSON do.
    pub fn to_map(&self) -> Map<String, Value> {
        match serde_json::from_slice::<Value>(&self.bytes) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

impl fmt::Debug for DocumentBody {
    // Bodies can be megabytes; print a prefix only.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const MAX: usize = 64;
        let shown = &self.bytes[..self.bytes.len().min(MAX)];
        write!(
            f,
            "DocumentBody({} bytes: {:?}{})",
            self.bytes.len(),
            String::from_utf8_lossy(shown),
            if self.bytes.len() > MAX { ".." } else { "" }
        )
    }
}
