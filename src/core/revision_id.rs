//! Revision identifiers.
//!
//! A revision id is `"<generation>-<suffix>"`: a decimal generation starting
//! at 1, a `-` separator, and an opaque suffix (hex digest in practice).
//! Generation strictly increases from parent to child, which is what makes
//! cycles in a revision tree impossible by construction.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::{CoreError, InvalidId};

/// Revision identifier - `"{generation}-{suffix}"` format.
///
/// Ordering is by `(generation, suffix)` with the generation compared
/// numerically. That ordering is the tiebreak used by winner election, so
/// two stores holding the same revisions always elect the same winner.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevisionId(String);

impl RevisionId {
    /// Parse and validate a revision id string.
    ///
    /// Accepted form: `<generation>-<suffix>` where generation is a decimal
    /// integer >= 1 with no sign or leading whitespace, and suffix is 1+
    /// non-whitespace bytes.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        if s.is_empty() {
            return Err(InvalidId::Revision {
                raw: s.to_string(),
                reason: "empty".into(),
            }
            .into());
        }

        let Some((gen_raw, suffix)) = s.split_once('-') else {
            return Err(InvalidId::Revision {
                raw: s.to_string(),
                reason: "must contain '-' separator".into(),
            }
            .into());
        };

        if gen_raw.is_empty() || !gen_raw.bytes().all(|b| b.is_ascii_digit()) {
            return Err(InvalidId::Revision {
                raw: s.to_string(),
                reason: "generation must be a decimal integer".into(),
            }
            .into());
        }

        let generation: u64 = gen_raw.parse().map_err(|_| InvalidId::Revision {
            raw: s.to_string(),
            reason: "generation out of range".into(),
        })?;
        if generation == 0 {
            return Err(InvalidId::Revision {
                raw: s.to_string(),
                reason: "generation must be >= 1".into(),
            }
            .into());
        }

        if suffix.is_empty() {
            return Err(InvalidId::Revision {
                raw: s.to_string(),
                reason: "missing suffix".into(),
            }
            .into());
        }
        if suffix.bytes().any(|b| b.is_ascii_whitespace()) {
            return Err(InvalidId::Revision {
                raw: s.to_string(),
                reason: "suffix contains whitespace".into(),
            }
            .into());
        }

        Ok(Self(s.to_string()))
    }

    /// Build the first-generation id for a new document from a body digest.
    pub(crate) fn first(suffix: &str) -> Self {
        Self(format!("1-{}", suffix))
    }

    /// Build the child id one generation past `self`.
    pub(crate) fn child(&self, suffix: &str) -> Self {
        Self(format!("{}-{}", self.generation() + 1, suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric generation prefix.
    pub fn generation(&self) -> u64 {
        // Validated at construction; the split cannot fail.
        self.0
            .split_once('-')
            .and_then(|(g, _)| g.parse().ok())
            .unwrap_or(0)
    }

    /// Opaque suffix past the first `-`.
    pub fn suffix(&self) -> &str {
        self.0.split_once('-').map(|(_, s)| s).unwrap_or("")
    }
}

impl Ord for RevisionId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.generation()
            .cmp(&other.generation())
            .then_with(|| self.suffix().cmp(other.suffix()))
    }
}

impl PartialOrd for RevisionId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RevisionId({:?})", self.0)
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
