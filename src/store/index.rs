//! SQLite revision index.
//!
//! One database file per datastore. The `revs` table is the durable side of
//! the per-document revision trees: `sequence` is the store-wide logical
//! clock (SQLite rowid discipline keeps it strictly increasing), `parent`
//! points at the parent revision's sequence (NULL for roots, surfaced to the
//! domain layer as the -1 sentinel), and `current` mirrors tree topology:
//! it is reassigned inside every committing transaction.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, Transaction, params};
use thiserror::Error;

use crate::config::Limits;
use crate::error::{Effect, Transience};

const SCHEMA_VERSION: u32 = 1;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS docs (
    doc_id INTEGER PRIMARY KEY AUTOINCREMENT,
    docid  TEXT UNIQUE NOT NULL
);
CREATE TABLE IF NOT EXISTS revs (
    sequence INTEGER PRIMARY KEY AUTOINCREMENT,
    doc_id   INTEGER NOT NULL REFERENCES docs(doc_id),
    parent   INTEGER REFERENCES revs(sequence),
    revid    TEXT NOT NULL,
    current  INTEGER NOT NULL DEFAULT 0,
    deleted  INTEGER NOT NULL DEFAULT 0,
    local    INTEGER NOT NULL DEFAULT 0,
    json     BLOB NOT NULL,
    UNIQUE (doc_id, revid)
);
CREATE INDEX IF NOT EXISTS revs_by_doc ON revs(doc_id);
CREATE TABLE IF NOT EXISTS attachments (
    sequence     INTEGER NOT NULL REFERENCES revs(sequence),
    name         TEXT NOT NULL,
    content_type TEXT NOT NULL,
    key          BLOB NOT NULL,
    encoding     INTEGER NOT NULL,
    length       INTEGER NOT NULL,
    UNIQUE (sequence, name)
);
";

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IndexError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("index schema version mismatch: expected {expected}, got {got}")]
    SchemaVersionMismatch { expected: u32, got: u32 },
    #[error("revision row decode failed: {0}")]
    RowDecode(String),
}

impl IndexError {
    pub fn transience(&self) -> Transience {
        match self {
            IndexError::Sqlite(_) | IndexError::Io { .. } => Transience::Unknown,
            IndexError::SchemaVersionMismatch { .. } | IndexError::RowDecode(_) => {
                Transience::Permanent
            }
        }
    }

    pub fn effect(&self) -> Effect {
        // Writes happen inside explicit transactions; a surfaced error means
        // the transaction rolled back.
        Effect::None
    }
}

/// Raw revision row, decoded into a `DocumentRevision` by the store layer.
#[derive(Debug, Clone)]
pub(crate) struct RevisionRow {
    pub sequence: i64,
    pub internal_id: i64,
    pub docid: String,
    pub revid: String,
    pub parent: Option<i64>,
    pub current: bool,
    pub deleted: bool,
    pub local: bool,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub(crate) struct AttachmentRow {
    pub sequence: i64,
    pub name: String,
    pub content_type: String,
    pub key: Vec<u8>,
    pub encoding: i64,
    pub length: i64,
}

pub struct RevisionIndex {
    conn: Connection,
}

impl RevisionIndex {
    pub fn open(path: &Path, limits: &Limits) -> Result<Self, IndexError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_millis(limits.sqlite_busy_timeout_ms))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        check_schema_version(&conn)?;
        Ok(Self { conn })
    }

    pub(crate) fn transaction(&mut self) -> Result<Transaction<'_>, IndexError> {
        Ok(self.conn.transaction()?)
    }

    pub fn last_sequence(&self) -> Result<i64, IndexError> {
        let seq: Option<i64> =
            self.conn
                .query_row("SELECT MAX(sequence) FROM revs", [], |row| row.get(0))?;
        Ok(seq.unwrap_or(0))
    }

    /// All persisted rev ids for one document, one query. Local-only
    /// revisions are excluded: they are invisible to replication.
    pub(crate) fn rev_ids_for_doc(&self, docid: &str) -> Result<HashSet<String>, IndexError> {
        rev_ids_for_doc(&self.conn, docid)
    }

    /// Every revision row of a document, parents before children.
    pub(crate) fn revision_rows(&self, docid: &str) -> Result<Vec<RevisionRow>, IndexError> {
        revision_rows(&self.conn, docid)
    }

    /// Documents with more than one live leaf.
    pub(crate) fn conflicted_doc_ids(&self) -> Result<Vec<String>, IndexError> {
        let mut stmt = self.conn.prepare(
            "SELECT d.docid FROM docs d JOIN revs r ON r.doc_id = d.doc_id
             WHERE r.current = 1 AND r.deleted = 0 AND r.local = 0
             GROUP BY d.docid HAVING COUNT(*) > 1 ORDER BY d.docid",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub(crate) fn attachments_for_sequence(
        &self,
        sequence: i64,
    ) -> Result<Vec<AttachmentRow>, IndexError> {
        let mut stmt = self.conn.prepare(
            "SELECT sequence, name, content_type, key, encoding, length
             FROM attachments WHERE sequence = ? ORDER BY name",
        )?;
        let rows = stmt.query_map(params![sequence], |row| {
            Ok(AttachmentRow {
                sequence: row.get(0)?,
                name: row.get(1)?,
                content_type: row.get(2)?,
                key: row.get(3)?,
                encoding: row.get(4)?,
                length: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

fn check_schema_version(conn: &Connection) -> Result<(), IndexError> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    match existing {
        None => {
            conn.execute(
                "INSERT INTO meta (key, value) VALUES ('schema_version', ?)",
                params![SCHEMA_VERSION.to_string()],
            )?;
            Ok(())
        }
        Some(v) => {
            let got: u32 = v
                .parse()
                .map_err(|_| IndexError::RowDecode(format!("schema_version `{v}`")))?;
            if got != SCHEMA_VERSION {
                return Err(IndexError::SchemaVersionMismatch {
                    expected: SCHEMA_VERSION,
                    got,
                });
            }
            Ok(())
        }
    }
}

// Write helpers take `&Connection` so they run both standalone and inside a
// `Transaction` (which derefs to one).

pub(crate) fn get_or_create_doc(conn: &Connection, docid: &str) -> Result<i64, IndexError> {
    if let Some(id) = conn
        .query_row(
            "SELECT doc_id FROM docs WHERE docid = ?",
            params![docid],
            |row| row.get(0),
        )
        .optional()?
    {
        return Ok(id);
    }
    conn.execute("INSERT INTO docs (docid) VALUES (?)", params![docid])?;
    Ok(conn.last_insert_rowid())
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn insert_revision_row(
    conn: &Connection,
    internal_id: i64,
    revid: &str,
    parent: Option<i64>,
    deleted: bool,
    local: bool,
    body: &[u8],
) -> Result<i64, IndexError> {
    conn.execute(
        "INSERT INTO revs (doc_id, parent, revid, current, deleted, local, json)
         VALUES (?, ?, ?, 0, ?, ?, ?)",
        params![internal_id, parent, revid, deleted, local, body],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Reassign the `current` column for a document to exactly `leaf_sequences`.
pub(crate) fn set_current_flags(
    conn: &Connection,
    internal_id: i64,
    leaf_sequences: &[i64],
) -> Result<(), IndexError> {
    conn.execute(
        "UPDATE revs SET current = 0 WHERE doc_id = ? AND local = 0",
        params![internal_id],
    )?;
    for seq in leaf_sequences {
        conn.execute(
            "UPDATE revs SET current = 1 WHERE sequence = ?",
            params![seq],
        )?;
    }
    Ok(())
}

pub(crate) fn insert_attachment_row(
    conn: &Connection,
    sequence: i64,
    name: &str,
    content_type: &str,
    key: &[u8],
    encoding: i64,
    length: i64,
) -> Result<(), IndexError> {
    conn.execute(
        "INSERT OR REPLACE INTO attachments (sequence, name, content_type, key, encoding, length)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![sequence, name, content_type, key, encoding, length],
    )?;
    Ok(())
}

pub(crate) fn rev_ids_for_doc(
    conn: &Connection,
    docid: &str,
) -> Result<HashSet<String>, IndexError> {
    let mut stmt = conn.prepare_cached(
        "SELECT r.revid FROM revs r JOIN docs d ON r.doc_id = d.doc_id
         WHERE d.docid = ? AND r.local = 0",
    )?;
    let rows = stmt.query_map(params![docid], |row| row.get::<_, String>(0))?;
    Ok(rows.collect::<Result<HashSet<_>, _>>()?)
}

pub(crate) fn revision_rows(
    conn: &Connection,
    docid: &str,
) -> Result<Vec<RevisionRow>, IndexError> {
    let mut stmt = conn.prepare_cached(
        "SELECT r.sequence, r.doc_id, d.docid, r.revid, r.parent, r.current, r.deleted,
                r.local, r.json
         FROM revs r JOIN docs d ON r.doc_id = d.doc_id
         WHERE d.docid = ? ORDER BY r.sequence",
    )?;
    let rows = stmt.query_map(params![docid], |row| {
        Ok(RevisionRow {
            sequence: row.get(0)?,
            internal_id: row.get(1)?,
            docid: row.get(2)?,
            revid: row.get(3)?,
            parent: row.get(4)?,
            current: row.get(5)?,
            deleted: row.get(6)?,
            local: row.get(7)?,
            body: row.get(8)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, RevisionIndex) {
        let dir = tempfile::tempdir().unwrap();
        let index = RevisionIndex::open(&dir.path().join("db.sqlite3"), &Limits::default()).unwrap();
        (dir, index)
    }

    #[test]
    fn open_initializes_schema_version() {
        let (_dir, index) = open_temp();
        assert_eq!(index.last_sequence().unwrap(), 0);
    }

    #[test]
    fn reopen_accepts_matching_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.sqlite3");
        drop(RevisionIndex::open(&path, &Limits::default()).unwrap());
        assert!(RevisionIndex::open(&path, &Limits::default()).is_ok());
    }

    #[test]
    fn insert_and_query_revisions() {
        let (_dir, mut index) = open_temp();
        let tx = index.transaction().unwrap();
        let doc = get_or_create_doc(&tx, "doc1").unwrap();
        let s1 = insert_revision_row(&tx, doc, "1-a", None, false, false, b"{}").unwrap();
        let s2 = insert_revision_row(&tx, doc, "2-a", Some(s1), false, false, b"{}").unwrap();
        set_current_flags(&tx, doc, &[s2]).unwrap();
        tx.commit().unwrap();

        assert!(s2 > s1);
        assert_eq!(index.last_sequence().unwrap(), s2);

        let revids = index.rev_ids_for_doc("doc1").unwrap();
        assert!(revids.contains("1-a") && revids.contains("2-a"));

        let rows = index.revision_rows("doc1").unwrap();
        assert_eq!(rows.len(), 2);
        assert!(!rows[0].current);
        assert!(rows[1].current);
    }

    #[test]
    fn local_revisions_hidden_from_replication_lookup() {
        let (_dir, mut index) = open_temp();
        let tx = index.transaction().unwrap();
        let doc = get_or_create_doc(&tx, "doc1").unwrap();
        insert_revision_row(&tx, doc, "1-local", None, false, true, b"{}").unwrap();
        tx.commit().unwrap();

        assert!(index.rev_ids_for_doc("doc1").unwrap().is_empty());
    }
}
