//! Datastore facade.
//!
//! The surface the replication driver and application code consume. All
//! mutations run under a per-document lock and a single SQLite transaction,
//! so a revision and its attachment rows become visible together or not at
//! all. Winner election never trusts the persisted `current` column during
//! a mutation: the tree is rebuilt from rows and the column reassigned to
//! match topology before the transaction commits.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use sha1::{Digest, Sha1};
use thiserror::Error;
use uuid::Uuid;

use crate::config::Limits;
use crate::core::{
    CoreError, DocumentBody, DocumentRevision, InvalidId, RevisionBuilder, RevisionId,
    RevisionTree, SENTINEL_PARENT, TreeError,
};
use crate::error::{Effect, Transience};

use super::attachments::{
    Attachment, AttachmentError, CancellationFlag, Encoding, PreparedAttachment, hex,
};
use super::index::{
    self, IndexError, RevisionIndex, RevisionRow,
};

pub const DB_FILE_NAME: &str = "db.sqlite3";
pub const ATTACHMENTS_DIR_NAME: &str = "attachments";

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("document `{doc_id}` not found")]
    NotFound { doc_id: String },
    #[error("document `{doc_id}` has no revision `{rev}`")]
    RevisionNotFound { doc_id: String, rev: String },
    #[error("conflict on `{doc_id}`: `{rev}` is not the current revision")]
    Conflict { doc_id: String, rev: String },
    #[error("revision `{rev}` of `{doc_id}` already exists with different content")]
    RevisionExists { doc_id: String, rev: String },
    #[error("invalid revision history for `{doc_id}`: {reason}")]
    InvalidHistory { doc_id: String, reason: String },
    #[error("store corruption: {reason}")]
    Corruption { reason: String },
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Attachment(#[from] AttachmentError),
}

impl StoreError {
    pub fn transience(&self) -> Transience {
        match self {
            StoreError::NotFound { .. }
            | StoreError::RevisionNotFound { .. }
            | StoreError::Conflict { .. }
            | StoreError::RevisionExists { .. }
            | StoreError::InvalidHistory { .. }
            | StoreError::Corruption { .. } => Transience::Permanent,
            StoreError::Io { .. } => Transience::Unknown,
            StoreError::Core(e) => e.transience(),
            StoreError::Tree(e) => e.transience(),
            StoreError::Index(e) => e.transience(),
            StoreError::Attachment(e) => e.transience(),
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            StoreError::Io { .. } => Effect::Unknown,
            StoreError::Core(e) => e.effect(),
            StoreError::Tree(e) => e.effect(),
            StoreError::Index(e) => e.effect(),
            StoreError::Attachment(e) => e.effect(),
            _ => Effect::None,
        }
    }
}

/// Candidate revisions offered per document, e.g. the change feed a pull
/// replication is evaluating. Duplicates collapse by construction.
pub type RevisionOffers = BTreeMap<String, BTreeSet<String>>;

/// Locally missing revisions per document. Serializes to the CouchDB
/// `_revs_diff` response shape: `{"doc1": {"missing": ["2-a"]}}`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct RevsDiffResult {
    docs: BTreeMap<String, MissingRevs>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MissingRevs {
    pub missing: BTreeSet<String>,
}

impl RevsDiffResult {
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Number of documents with at least one missing revision.
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn missing_for(&self, doc_id: &str) -> Option<&BTreeSet<String>> {
        self.docs.get(doc_id).map(|m| &m.missing)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &BTreeSet<String>)> {
        self.docs.iter().map(|(doc, m)| (doc, &m.missing))
    }
}

/// A committed attachment row joined with its blob location.
#[derive(Clone, Debug)]
pub struct SavedAttachment {
    pub name: String,
    pub content_type: String,
    pub key: Vec<u8>,
    pub encoding: Encoding,
    pub length: i64,
    pub path: PathBuf,
}

struct DatastoreInner {
    name: String,
    dir: PathBuf,
    attachments_dir: PathBuf,
    index: Mutex<RevisionIndex>,
    doc_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    limits: Limits,
}

/// An open datastore. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Datastore {
    inner: Arc<DatastoreInner>,
}

impl std::fmt::Debug for Datastore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Datastore")
            .field("name", &self.inner.name)
            .field("dir", &self.inner.dir)
            .finish()
    }
}

impl Datastore {
    /// Open (creating if needed) the datastore rooted at `dir`.
    pub(crate) fn open(
        name: &str,
        dir: &Path,
        limits: &Limits,
    ) -> Result<Self, StoreError> {
        let attachments_dir = dir.join(ATTACHMENTS_DIR_NAME);
        fs::create_dir_all(&attachments_dir).map_err(|source| StoreError::Io {
            path: attachments_dir.clone(),
            source,
        })?;
        let index = RevisionIndex::open(&dir.join(DB_FILE_NAME), limits)?;
        Ok(Self {
            inner: Arc::new(DatastoreInner {
                name: name.to_string(),
                dir: dir.to_path_buf(),
                attachments_dir,
                index: Mutex::new(index),
                doc_locks: Mutex::new(HashMap::new()),
                limits: limits.clone(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    pub fn attachments_dir(&self) -> &Path {
        &self.inner.attachments_dir
    }

    /// The store's logical clock: sequence of the latest commit.
    pub fn last_sequence(&self) -> Result<i64, StoreError> {
        Ok(self.lock_index().last_sequence()?)
    }

    /// Which of the offered revisions are missing locally.
    ///
    /// One batched index lookup per offered document; a document whose
    /// offered revisions are all known is omitted from the result. Empty
    /// input yields empty output.
    pub fn revs_diff(&self, offers: &RevisionOffers) -> Result<RevsDiffResult, StoreError> {
        let mut result = RevsDiffResult::default();
        for (doc_id, offered) in offers {
            if offered.is_empty() {
                continue;
            }
            let known = self.lock_index().rev_ids_for_doc(doc_id)?;
            let missing: BTreeSet<String> = offered
                .iter()
                .filter(|rev| !known.contains(rev.as_str()))
                .cloned()
                .collect();
            if !missing.is_empty() {
                result.docs.insert(doc_id.clone(), MissingRevs { missing });
            }
        }
        Ok(result)
    }

    /// Create a document with a generated id.
    pub fn create_document(&self, body: DocumentBody) -> Result<DocumentRevision, StoreError> {
        let doc_id = Uuid::new_v4().simple().to_string();
        self.create_document_with_id(&doc_id, body)
    }

    /// Create a document with a caller-chosen id.
    pub fn create_document_with_id(
        &self,
        doc_id: &str,
        body: DocumentBody,
    ) -> Result<DocumentRevision, StoreError> {
        validate_doc_id(doc_id)?;
        let lock = self.doc_lock(doc_id);
        let _doc_guard = lock.lock().expect("doc lock poisoned");
        let mut index = self.lock_index();

        let tx = index.transaction()?;
        let tree = build_tree(&index::revision_rows(&tx, doc_id)?)?;

        // Recreating a deleted document extends the tombstone's branch, so
        // the new revision supersedes the tombstone during replication.
        let (rev, parent_sequence) = if tree.is_empty() {
            (RevisionId::first(&body_digest(&body)), None)
        } else {
            let winner = tree.current_revision()?;
            if !winner.deleted {
                return Err(StoreError::Conflict {
                    doc_id: doc_id.to_string(),
                    rev: winner.rev.to_string(),
                });
            }
            (winner.rev.child(&body_digest(&body)), Some(winner.sequence))
        };

        let internal_id = index::get_or_create_doc(&tx, doc_id)?;
        let sequence = index::insert_revision_row(
            &tx,
            internal_id,
            rev.as_str(),
            parent_sequence,
            false,
            false,
            body.as_bytes(),
        )?;
        recompute_current(&tx, doc_id, internal_id)?;
        tx.commit().map_err(IndexError::from)?;

        tracing::debug!(doc_id = %doc_id, rev = %rev, sequence, "created document");
        let mut created = RevisionBuilder::new()
            .doc_id(doc_id)
            .rev(rev)
            .body(body)
            .sequence(sequence)
            .internal_id(internal_id)
            .parent_sequence(parent_sequence.unwrap_or(SENTINEL_PARENT))
            .build();
        created.current = true;
        Ok(created)
    }

    /// Replace the winning revision. `prev_rev` must be the current winner.
    pub fn update_document(
        &self,
        doc_id: &str,
        prev_rev: &RevisionId,
        body: DocumentBody,
    ) -> Result<DocumentRevision, StoreError> {
        self.append_child(doc_id, prev_rev, body, false)
    }

    /// Insert a tombstone on top of the winning revision. The revision is
    /// retained for convergence, not erased.
    pub fn delete_document(
        &self,
        doc_id: &str,
        prev_rev: &RevisionId,
    ) -> Result<DocumentRevision, StoreError> {
        self.append_child(doc_id, prev_rev, DocumentBody::empty(), true)
    }

    fn append_child(
        &self,
        doc_id: &str,
        prev_rev: &RevisionId,
        body: DocumentBody,
        deleted: bool,
    ) -> Result<DocumentRevision, StoreError> {
        let lock = self.doc_lock(doc_id);
        let _doc_guard = lock.lock().expect("doc lock poisoned");
        let mut index = self.lock_index();

        let tx = index.transaction()?;
        let tree = build_tree(&index::revision_rows(&tx, doc_id)?)?;
        if tree.is_empty() {
            return Err(StoreError::NotFound {
                doc_id: doc_id.to_string(),
            });
        }
        let winner = tree.current_revision()?;
        if winner.rev != *prev_rev || winner.deleted {
            return Err(StoreError::Conflict {
                doc_id: doc_id.to_string(),
                rev: prev_rev.to_string(),
            });
        }

        let rev = prev_rev.child(&body_digest(&body));
        let internal_id = winner.internal_id;
        let parent_sequence = winner.sequence;
        let sequence = index::insert_revision_row(
            &tx,
            internal_id,
            rev.as_str(),
            Some(parent_sequence),
            deleted,
            false,
            body.as_bytes(),
        )?;
        recompute_current(&tx, doc_id, internal_id)?;
        tx.commit().map_err(IndexError::from)?;

        tracing::debug!(doc_id = %doc_id, rev = %rev, deleted, "appended revision");
        let mut appended = RevisionBuilder::new()
            .doc_id(doc_id)
            .rev(rev)
            .body(body)
            .sequence(sequence)
            .internal_id(internal_id)
            .deleted(deleted)
            .parent_sequence(parent_sequence)
            .build();
        appended.current = true;
        Ok(appended)
    }

    /// Insert a replicated revision together with its offered ancestry.
    ///
    /// `parent_path` is newest-first, starting with the inserted revision
    /// itself (the order CouchDB's `_revisions.ids` arrives in). Ancestors
    /// missing locally materialize as `{}`-bodied stubs. Re-inserting a
    /// known revision with an identical body is a no-op; with a different
    /// body it is rejected. The revision and its attachments commit
    /// atomically per document.
    pub fn force_insert(
        &self,
        rev: DocumentRevision,
        parent_path: &[RevisionId],
        attachments: Vec<PreparedAttachment>,
    ) -> Result<(), StoreError> {
        let doc_id = rev.doc_id.clone();
        validate_doc_id(&doc_id)?;
        validate_history(&doc_id, &rev.rev, parent_path)?;

        let lock = self.doc_lock(&doc_id);
        let _doc_guard = lock.lock().expect("doc lock poisoned");
        let mut index = self.lock_index();

        let tx = index.transaction()?;
        let mut tree = build_tree(&index::revision_rows(&tx, &doc_id)?)?;

        if let Some(existing) = tree.lookup(&doc_id, rev.rev.as_str()) {
            if existing.body.as_bytes() == rev.body.as_bytes()
                && existing.deleted == rev.deleted
            {
                tracing::debug!(doc_id = %doc_id, rev = %rev.rev, "force insert no-op, revision known");
                return Ok(());
            }
            return Err(StoreError::RevisionExists {
                doc_id,
                rev: rev.rev.to_string(),
            });
        }

        let internal_id = index::get_or_create_doc(&tx, &doc_id)?;

        // Find the newest offered ancestor already known locally; everything
        // older than it is already in the tree (or belongs to history the
        // remote never sent), so only the gap between it and the new
        // revision materializes as stubs.
        let mut parent_sequence: Option<i64> = None;
        let mut first_known = parent_path.len();
        for (i, ancestor) in parent_path.iter().enumerate().skip(1) {
            if let Some(known) = tree.lookup(&doc_id, ancestor.as_str()) {
                parent_sequence = Some(known.sequence);
                first_known = i;
                break;
            }
        }

        // Stub the gap oldest-first so each stub's parent already exists.
        for ancestor in parent_path[1..first_known].iter().rev() {
            let sequence = index::insert_revision_row(
                &tx,
                internal_id,
                ancestor.as_str(),
                parent_sequence,
                false,
                false,
                crate::core::EMPTY_BODY,
            )?;
            tree.add(
                RevisionBuilder::new()
                    .doc_id(&doc_id)
                    .rev(ancestor.clone())
                    .sequence(sequence)
                    .internal_id(internal_id)
                    .parent_sequence(parent_sequence.unwrap_or(SENTINEL_PARENT))
                    .build_stub(),
            )?;
            parent_sequence = Some(sequence);
        }

        let sequence = index::insert_revision_row(
            &tx,
            internal_id,
            rev.rev.as_str(),
            parent_sequence,
            rev.deleted,
            false,
            rev.body.as_bytes(),
        )?;
        tree.add(
            RevisionBuilder::new()
                .doc_id(&doc_id)
                .rev(rev.rev.clone())
                .body(rev.body.clone())
                .sequence(sequence)
                .internal_id(internal_id)
                .deleted(rev.deleted)
                .parent_sequence(parent_sequence.unwrap_or(SENTINEL_PARENT))
                .build(),
        )?;

        for prepared in &attachments {
            index::insert_attachment_row(
                &tx,
                sequence,
                &prepared.attachment.name,
                &prepared.attachment.content_type,
                &prepared.sha1,
                prepared.encoding.to_db(),
                blob_len(prepared)?,
            )?;
        }

        let leaf_sequences: Vec<i64> = tree.leafs().iter().map(|r| r.sequence).collect();
        index::set_current_flags(&tx, internal_id, &leaf_sequences)?;

        // Blob renames happen before the SQL commit: if a rename fails the
        // transaction rolls back and no revision is visible; if the commit
        // fails the renamed blobs are unreferenced content-addressed files,
        // invisible through the facade.
        for prepared in attachments {
            prepared.commit(&self.inner.attachments_dir)?;
        }
        tx.commit().map_err(IndexError::from)?;

        tracing::debug!(doc_id = %doc_id, rev = %rev.rev, sequence, "force inserted revision");
        Ok(())
    }

    /// The winning revision of a document. A document whose winner is a
    /// tombstone is reported as not found.
    pub fn get_document(&self, doc_id: &str) -> Result<DocumentRevision, StoreError> {
        let tree = self.revision_tree(doc_id)?;
        let winner = tree.current_revision()?;
        if winner.deleted {
            return Err(StoreError::NotFound {
                doc_id: doc_id.to_string(),
            });
        }
        Ok(winner.clone())
    }

    /// A specific revision of a document.
    pub fn get_document_rev(
        &self,
        doc_id: &str,
        rev: &str,
    ) -> Result<DocumentRevision, StoreError> {
        let tree = self.revision_tree(doc_id)?;
        tree.lookup(doc_id, rev).cloned().ok_or_else(|| {
            StoreError::RevisionNotFound {
                doc_id: doc_id.to_string(),
                rev: rev.to_string(),
            }
        })
    }

    /// Documents with more than one live leaf.
    pub fn get_conflicted_documents(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.lock_index().conflicted_doc_ids()?)
    }

    /// The full revision forest of a document. Local-only revisions are
    /// excluded; replication never sees them.
    pub fn revision_tree(&self, doc_id: &str) -> Result<RevisionTree, StoreError> {
        let rows = self.lock_index().revision_rows(doc_id)?;
        let tree = build_tree(&rows)?;
        if tree.is_empty() {
            return Err(StoreError::NotFound {
                doc_id: doc_id.to_string(),
            });
        }
        Ok(tree)
    }

    /// Stage an attachment into this datastore's attachments directory.
    pub fn prepare_attachment(
        &self,
        attachment: Attachment,
        encoding: Encoding,
        cancel: &CancellationFlag,
    ) -> Result<PreparedAttachment, StoreError> {
        Ok(PreparedAttachment::prepare(
            attachment,
            &self.inner.attachments_dir,
            encoding,
            &self.inner.limits,
            cancel,
        )?)
    }

    /// Committed attachments of a revision.
    pub fn attachments_for(
        &self,
        rev: &DocumentRevision,
    ) -> Result<Vec<SavedAttachment>, StoreError> {
        let rows = self.lock_index().attachments_for_sequence(rev.sequence)?;
        rows.into_iter()
            .map(|row| {
                let encoding = Encoding::from_db(row.encoding).ok_or_else(|| {
                    StoreError::Corruption {
                        reason: format!("unknown attachment encoding code {}", row.encoding),
                    }
                })?;
                let path = self.inner.attachments_dir.join(hex(&row.key));
                Ok(SavedAttachment {
                    name: row.name,
                    content_type: row.content_type,
                    key: row.key,
                    encoding,
                    length: row.length,
                    path,
                })
            })
            .collect()
    }

    fn lock_index(&self) -> std::sync::MutexGuard<'_, RevisionIndex> {
        self.inner.index.lock().expect("index lock poisoned")
    }

    fn doc_lock(&self, doc_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.inner.doc_locks.lock().expect("doc lock map poisoned");
        locks.entry(doc_id.to_string()).or_default().clone()
    }
}

fn validate_doc_id(doc_id: &str) -> Result<(), StoreError> {
    if doc_id.is_empty() {
        return Err(CoreError::from(InvalidId::Document {
            raw: doc_id.to_string(),
            reason: "empty".into(),
        })
        .into());
    }
    if doc_id.starts_with('_') {
        return Err(CoreError::from(InvalidId::Document {
            raw: doc_id.to_string(),
            reason: "reserved `_` prefix".into(),
        })
        .into());
    }
    Ok(())
}

fn validate_history(
    doc_id: &str,
    rev: &RevisionId,
    parent_path: &[RevisionId],
) -> Result<(), StoreError> {
    let Some(first) = parent_path.first() else {
        return Err(StoreError::InvalidHistory {
            doc_id: doc_id.to_string(),
            reason: "empty".into(),
        });
    };
    if first != rev {
        return Err(StoreError::InvalidHistory {
            doc_id: doc_id.to_string(),
            reason: format!("history must start with `{rev}`, got `{first}`"),
        });
    }
    for pair in parent_path.windows(2) {
        if pair[0].generation() <= pair[1].generation() {
            return Err(StoreError::InvalidHistory {
                doc_id: doc_id.to_string(),
                reason: format!(
                    "generations must strictly decrease, got `{}` then `{}`",
                    pair[0], pair[1]
                ),
            });
        }
    }
    Ok(())
}

/// Reassign `current` from freshly rebuilt topology.
fn recompute_current(
    conn: &rusqlite::Connection,
    doc_id: &str,
    internal_id: i64,
) -> Result<(), StoreError> {
    let tree = build_tree(&index::revision_rows(conn, doc_id)?)?;
    let leaf_sequences: Vec<i64> = tree.leafs().iter().map(|r| r.sequence).collect();
    index::set_current_flags(conn, internal_id, &leaf_sequences)?;
    Ok(())
}

fn build_tree(rows: &[RevisionRow]) -> Result<RevisionTree, StoreError> {
    let mut tree = RevisionTree::new();
    for row in rows {
        if row.local {
            continue;
        }
        tree.add(row_to_revision(row)?)?;
    }
    Ok(tree)
}

fn row_to_revision(row: &RevisionRow) -> Result<DocumentRevision, StoreError> {
    let rev = RevisionId::parse(&row.revid).map_err(|_| StoreError::Corruption {
        reason: format!("stored revision id `{}` does not parse", row.revid),
    })?;
    Ok(DocumentRevision {
        doc_id: row.docid.clone(),
        rev,
        body: DocumentBody::new(row.body.clone()),
        sequence: row.sequence,
        internal_id: row.internal_id,
        local: row.local,
        deleted: row.deleted,
        current: row.current,
        parent_sequence: row.parent.unwrap_or(SENTINEL_PARENT),
    })
}

fn body_digest(body: &DocumentBody) -> String {
    let mut hasher = Sha1::new();
    hasher.update(body.as_bytes());
    let digest: [u8; 20] = hasher.finalize().into();
    hex(&digest)
}

fn blob_len(prepared: &PreparedAttachment) -> Result<i64, StoreError> {
    let meta = fs::metadata(&prepared.temp_path).map_err(|source| StoreError::Io {
        path: prepared.temp_path.clone(),
        source,
    })?;
    Ok(meta.len() as i64)
}
