//! Document revisions.
//!
//! A revision is one immutable version of a document. `sequence` is the
//! store-wide insertion number (a logical clock), `internal_id` clusters all
//! revisions of one document, and `parent_sequence` points at the parent
//! revision or [`SENTINEL_PARENT`] for a root.

use super::body::DocumentBody;
use super::revision_id::RevisionId;

/// Parent sequence value marking a root revision.
pub const SENTINEL_PARENT: i64 = -1;

/// One immutable revision of a document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DocumentRevision {
    pub doc_id: String,
    pub rev: RevisionId,
    pub body: DocumentBody,
    pub sequence: i64,
    pub internal_id: i64,
    pub local: bool,
    pub deleted: bool,
    /// True exactly when this revision is a leaf of its document's tree.
    /// Topology is authoritative; the persistence layer reassigns this flag
    /// at commit time to match the tree derivation.
    pub current: bool,
    pub parent_sequence: i64,
}

impl DocumentRevision {
    pub fn is_root(&self) -> bool {
        self.parent_sequence == SENTINEL_PARENT
    }
}

/// Builder for [`DocumentRevision`].
///
/// Three build forms mirror the three kinds of revision the store creates:
/// replicated/committed revisions (`build`), local-only documents
/// (`build_local`), and body-less ancestor stubs (`build_stub`).
#[derive(Debug)]
pub struct RevisionBuilder {
    doc_id: Option<String>,
    rev: Option<RevisionId>,
    body: Option<DocumentBody>,
    sequence: i64,
    internal_id: i64,
    deleted: bool,
    parent_sequence: i64,
}

impl Default for RevisionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RevisionBuilder {
    pub fn new() -> Self {
        Self {
            doc_id: None,
            rev: None,
            body: None,
            sequence: 0,
            internal_id: 0,
            deleted: false,
            parent_sequence: SENTINEL_PARENT,
        }
    }

    pub fn doc_id(mut self, doc_id: impl Into<String>) -> Self {
        self.doc_id = Some(doc_id.into());
        self
    }

    pub fn rev(mut self, rev: RevisionId) -> Self {
        self.rev = Some(rev);
        self
    }

    pub fn body(mut self, body: DocumentBody) -> Self {
        self.body = Some(body);
        self
    }

    pub fn sequence(mut self, sequence: i64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn internal_id(mut self, internal_id: i64) -> Self {
        self.internal_id = internal_id;
        self
    }

    pub fn deleted(mut self, deleted: bool) -> Self {
        self.deleted = deleted;
        self
    }

    pub fn parent_sequence(mut self, parent_sequence: i64) -> Self {
        self.parent_sequence = parent_sequence;
        self
    }

    /// A replicated or committed revision. `current` starts false; the
    /// persistence layer assigns it from tree topology.
    pub fn build(self) -> DocumentRevision {
        DocumentRevision {
            doc_id: self.doc_id.unwrap_or_default(),
            rev: self.rev.expect("revision id is required"),
            body: self.body.unwrap_or_else(DocumentBody::empty),
            sequence: self.sequence,
            internal_id: self.internal_id,
            local: false,
            deleted: self.deleted,
            current: false,
            parent_sequence: self.parent_sequence,
        }
    }

    /// A local-only document: never replicated, always its own current
    /// revision.
    pub fn build_local(self) -> DocumentRevision {
        DocumentRevision {
            doc_id: self.doc_id.unwrap_or_default(),
            rev: self.rev.expect("revision id is required"),
            body: self.body.unwrap_or_else(DocumentBody::empty),
            sequence: self.sequence,
            internal_id: self.internal_id,
            local: true,
            deleted: false,
            current: true,
            parent_sequence: self.parent_sequence,
        }
    }

    /// An ancestor stub with the empty `{}` body, created when force-insert
    /// reconciles a history whose interior revisions are absent locally.
    pub fn build_stub(self) -> DocumentRevision {
        DocumentRevision {
            doc_id: self.doc_id.unwrap_or_default(),
            rev: self.rev.expect("revision id is required"),
            body: DocumentBody::empty(),
            sequence: self.sequence,
            internal_id: self.internal_id,
            local: false,
            deleted: false,
            current: false,
            parent_sequence: self.parent_sequence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_full_revision() {
        let rev = RevisionBuilder::new()
            .doc_id("hahaha")
            .rev(RevisionId::parse("1-testrevision").unwrap())
            .body(DocumentBody::new(br#"{"a":"test data"}"#.to_vec()))
            .sequence(123_456_789)
            .internal_id(987_654_321)
            .deleted(true)
            .build();

        assert_eq!(rev.doc_id, "hahaha");
        assert_eq!(rev.rev.as_str(), "1-testrevision");
        assert!(!rev.local);
        assert!(rev.deleted);
        assert!(!rev.current);
        assert!(rev.is_root());
        assert_eq!(
            rev.body.to_map().get("a").and_then(|v| v.as_str()),
            Some("test data")
        );
    }

    #[test]
    fn build_local_document() {
        let rev = RevisionBuilder::new()
            .doc_id("hahaha")
            .rev(RevisionId::parse("2-local").unwrap())
            .body(DocumentBody::new(br#"{"a":"test data"}"#.to_vec()))
            .build_local();

        assert!(rev.local);
        assert!(!rev.deleted);
        assert!(rev.current);
    }

    #[test]
    fn build_stub_has_empty_body() {
        let rev = RevisionBuilder::new()
            .doc_id("hahaha")
            .rev(RevisionId::parse("1-testrevision").unwrap())
            .build_stub();

        assert_eq!(rev.body.as_bytes(), b"{}");
        assert!(!rev.deleted);
    }
}
