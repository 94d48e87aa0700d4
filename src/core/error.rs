//! Validation errors for identifiers and attachment encodings.
//!
//! Everything here describes input the store refuses to accept, never an
//! I/O or SQLite failure; those live with the subsystems that produce them.

use thiserror::Error;

use crate::error::{Effect, Transience};

/// Invalid identifier.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum InvalidId {
    #[error("revision id `{raw}` is invalid: {reason}")]
    Revision { raw: String, reason: String },
    #[error("datastore name `{raw}` is invalid: {reason}")]
    Datastore { raw: String, reason: String },
    #[error("document id `{raw}` is invalid: {reason}")]
    Document { raw: String, reason: String },
}

/// Attachment encoding string not recognized.
#[derive(Debug, Error, Clone)]
#[error("attachment encoding `{raw}` is not recognized")]
pub struct InvalidEncoding {
    pub raw: String,
}

/// Canonical error enum for core capability.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum CoreError {
    #[error(transparent)]
    InvalidId(#[from] InvalidId),
    #[error(transparent)]
    InvalidEncoding(#[from] InvalidEncoding),
}

impl CoreError {
    pub fn transience(&self) -> Transience {
        // Rejected ids and encodings stay rejected on replay.
        Transience::Permanent
    }

    pub fn effect(&self) -> Effect {
        Effect::None
    }
}
