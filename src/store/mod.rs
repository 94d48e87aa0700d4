//! Storage layer: SQLite revision index, attachment staging, the datastore
//! facade, and the manager that owns a directory of datastores.

pub mod attachments;
pub mod datastore;
pub mod index;
pub mod manager;

pub use attachments::{
    Attachment, AttachmentError, CancellationFlag, Encoding, PreparedAttachment,
};
pub use datastore::{
    ATTACHMENTS_DIR_NAME, DB_FILE_NAME, Datastore, MissingRevs, RevisionOffers, RevsDiffResult,
    SavedAttachment, StoreError,
};
pub use index::{IndexError, RevisionIndex};
pub use manager::{DatastoreManager, ManagerError};
