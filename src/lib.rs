#![forbid(unsafe_code)]

//! Embedded, offline-first document datastore that replicates with
//! CouchDB-compatible services.
//!
//! Documents are multi-version: each document is a revision tree (a forest,
//! when replication imports detached branches), with a deterministic winner
//! elected among its leaves. Replication negotiates missing revisions via
//! [`Datastore::revs_diff`] and lands them via [`Datastore::force_insert`];
//! binary attachments are staged through [`PreparedAttachment`] so commits
//! never hold network resources.

pub mod config;
pub mod core;
pub mod error;
pub mod events;
pub mod store;
pub mod telemetry;

pub use error::{Effect, Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export core types at crate root for convenience
pub use crate::config::Limits;
pub use crate::core::{
    CoreError, DocumentBody, DocumentRevision, EMPTY_BODY, InvalidEncoding, InvalidId,
    RevisionBuilder, RevisionId, RevisionTree, SENTINEL_PARENT, TreeError,
};
pub use crate::events::{DatastoreEvent, EventBus, EventSubscription};
pub use crate::store::{
    Attachment, AttachmentError, CancellationFlag, Datastore, DatastoreManager, Encoding,
    IndexError, ManagerError, MissingRevs, PreparedAttachment, RevisionOffers, RevsDiffResult,
    SavedAttachment, StoreError,
};
