use thiserror::Error;

use crate::core::{CoreError, TreeError};
use crate::store::{AttachmentError, ManagerError, StoreError};

/// How a failure relates to a retry.
///
/// Domain refusals never heal on replay: a stale revision id stays stale, a
/// malformed datastore name stays malformed, an out-of-order tree insert is
/// wrong forever. A busy SQLite handle or an interrupted attachment copy,
/// on the other hand, may well go through on the next attempt. Replication
/// drivers use this split to decide between resubmitting a batch and
/// surfacing the failure.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// The same inputs against the same store will fail the same way.
    Permanent,
    /// A later attempt has a real chance of succeeding.
    Retryable,
    /// Not enough information to judge either way.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Transience::Permanent => "permanent",
            Transience::Retryable => "retryable",
            Transience::Unknown => "unknown",
        }
    }
}

/// Whether a failed operation left anything behind.
///
/// Mutations run inside SQLite transactions and staging removes its temp
/// file on every exit path, so most failures report `None`: the store looks
/// exactly as it did before the call. `Unknown` belongs to the few paths,
/// like directory removal and blob renames, where the error itself cannot
/// say how far the side effects got.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Effect {
    /// The store is unchanged.
    None,
    /// Something was durably written or removed before the failure.
    Some,
    /// The failure does not reveal whether anything changed.
    Unknown,
}

impl Effect {
    pub fn as_str(self) -> &'static str {
        match self {
            Effect::None => "none",
            Effect::Some => "some",
            Effect::Unknown => "unknown",
        }
    }
}

/// Top-level error for callers that do not care which capability failed.
///
/// Each subsystem keeps its own bounded error enum; this wrapper only
/// forwards them unchanged, along with their retry and side-effect
/// classification.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error(transparent)]
    Attachment(#[from] AttachmentError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Manager(#[from] ManagerError),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Core(e) => e.transience(),
            Error::Tree(e) => e.transience(),
            Error::Attachment(e) => e.transience(),
            Error::Store(e) => e.transience(),
            Error::Manager(e) => e.transience(),
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            Error::Core(e) => e.effect(),
            Error::Tree(e) => e.effect(),
            Error::Attachment(e) => e.effect(),
            Error::Store(e) => e.effect(),
            Error::Manager(e) => e.effect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::InvalidId;

    #[test]
    fn domain_refusals_are_permanent_and_clean() {
        let err: Error = CoreError::from(InvalidId::Revision {
            raw: "bogus".into(),
            reason: "must contain '-' separator".into(),
        })
        .into();

        assert_eq!(err.transience(), Transience::Permanent);
        assert!(!err.transience().is_retryable());
        assert_eq!(err.effect(), Effect::None);
    }

    #[test]
    fn cancelled_staging_is_retryable() {
        let err: Error = AttachmentError::Cancelled.into();
        assert_eq!(err.transience(), Transience::Retryable);
        assert_eq!(err.effect().as_str(), "none");
    }
}
