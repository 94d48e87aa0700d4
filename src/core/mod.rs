//! Core domain types for the document store.
//!
//! Module hierarchy follows type dependency order:
//! - revision_id: RevisionId (generation-suffix wire format)
//! - body: DocumentBody (opaque bytes, JSON by convention)
//! - revision: DocumentRevision, RevisionBuilder
//! - tree: RevisionTree (per-document forest, winner election)

pub mod body;
pub mod error;
pub mod revision;
pub mod revision_id;
pub mod tree;

pub use body::{DocumentBody, EMPTY_BODY};
pub use error::{CoreError, InvalidEncoding, InvalidId};
pub use revision::{DocumentRevision, RevisionBuilder, SENTINEL_PARENT};
pub use revision_id::RevisionId;
pub use tree::{RevisionTree, TreeError};
