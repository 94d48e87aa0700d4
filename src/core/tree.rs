//! Per-document revision trees.
//!
//! A document's history is a forest: usually one tree, but replication may
//! import a subtree whose true root is absent locally, so multiple roots are
//! permitted. Nodes live in an arena (`Vec`) with integer child indices;
//! `by_sequence` and `by_rev` give O(1) lookup without heap-allocated node
//! graphs.
//!
//! Insertion is ordered by parent arrival: a node's parent must already be in
//! the tree (or the node is a root). Leaves are derived from edges, never
//! stored; winner election and conflict detection operate on the derived
//! leaf set.

use std::collections::HashMap;

use thiserror::Error;

use crate::error::{Effect, Transience};

use super::revision::{DocumentRevision, SENTINEL_PARENT};
use super::revision_id::RevisionId;

#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum TreeError {
    #[error("revision `{rev}` already present in tree")]
    DuplicateRevision { rev: String },
    #[error("parent sequence {parent_sequence} not present in tree")]
    ParentMissing { parent_sequence: i64 },
    #[error("sequence {sequence} not present in tree")]
    UnknownSequence { sequence: i64 },
    #[error("tree is empty")]
    Empty,
    #[error(
        "generation did not increase from parent `{parent}` to child `{child}`"
    )]
    GenerationOrder { parent: String, child: String },
    #[error("parent sequence {parent_sequence} belongs to document `{parent_doc}`, not `{doc}`")]
    DocumentMismatch {
        parent_sequence: i64,
        parent_doc: String,
        doc: String,
    },
}

impl TreeError {
    pub fn transience(&self) -> Transience {
        Transience::Permanent
    }

    pub fn effect(&self) -> Effect {
        Effect::None
    }
}

#[derive(Debug, Clone)]
struct Node {
    rev: DocumentRevision,
    children: Vec<usize>,
    depth: usize,
}

/// Revision forest for a single document.
#[derive(Debug, Clone, Default)]
pub struct RevisionTree {
    nodes: Vec<Node>,
    roots: Vec<usize>,
    by_sequence: HashMap<i64, usize>,
    by_rev: HashMap<String, usize>,
}

impl RevisionTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Singleton tree from a root revision.
    pub fn with_root(root: DocumentRevision) -> Result<Self, TreeError> {
        let mut tree = Self::new();
        tree.add(root)?;
        Ok(tree)
    }

    /// Insert a revision whose parent (if any) is already present.
    ///
    /// Returns `&mut Self` so ordered insertions chain:
    /// `tree.add(d2)?.add(d3)?`.
    pub fn add(&mut self, rev: DocumentRevision) -> Result<&mut Self, TreeError> {
        if self.by_rev.contains_key(rev.rev.as_str())
            || self.by_sequence.contains_key(&rev.sequence)
        {
            return Err(TreeError::DuplicateRevision {
                rev: rev.rev.to_string(),
            });
        }

        let (parent_idx, depth) = if rev.parent_sequence == SENTINEL_PARENT {
            (None, 0)
        } else {
            let Some(&idx) = self.by_sequence.get(&rev.parent_sequence) else {
                return Err(TreeError::ParentMissing {
                    parent_sequence: rev.parent_sequence,
                });
            };
            let parent = &self.nodes[idx].rev;
            if parent.doc_id != rev.doc_id {
                return Err(TreeError::DocumentMismatch {
                    parent_sequence: rev.parent_sequence,
                    parent_doc: parent.doc_id.clone(),
                    doc: rev.doc_id.clone(),
                });
            }
            // Cycles are impossible as long as this holds.
            if parent.rev.generation() >= rev.rev.generation() {
                return Err(TreeError::GenerationOrder {
                    parent: parent.rev.to_string(),
                    child: rev.rev.to_string(),
                });
            }
            (Some(idx), self.nodes[idx].depth + 1)
        };

        let idx = self.nodes.len();
        self.by_sequence.insert(rev.sequence, idx);
        self.by_rev.insert(rev.rev.as_str().to_string(), idx);
        self.nodes.push(Node {
            rev,
            children: Vec::new(),
            depth,
        });

        match parent_idx {
            Some(p) => self.nodes[p].children.push(idx),
            None => self.roots.push(idx),
        }
        Ok(self)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Root nodes keyed by sequence.
    pub fn roots(&self) -> HashMap<i64, &DocumentRevision> {
        self.roots
            .iter()
            .map(|&i| (self.nodes[i].rev.sequence, &self.nodes[i].rev))
            .collect()
    }

    /// The root with the given sequence, if that sequence is a root.
    pub fn root(&self, sequence: i64) -> Option<&DocumentRevision> {
        self.roots
            .iter()
            .map(|&i| &self.nodes[i].rev)
            .find(|r| r.sequence == sequence)
    }

    /// Leaf revisions, in unspecified order.
    pub fn leafs(&self) -> Vec<&DocumentRevision> {
        self.nodes
            .iter()
            .filter(|n| n.children.is_empty())
            .map(|n| &n.rev)
            .collect()
    }

    /// Rev ids of all leaves.
    pub fn leaf_revision_ids(&self) -> Vec<RevisionId> {
        self.nodes
            .iter()
            .filter(|n| n.children.is_empty())
            .map(|n| n.rev.rev.clone())
            .collect()
    }

    pub fn by_sequence(&self, sequence: i64) -> Option<&DocumentRevision> {
        self.by_sequence.get(&sequence).map(|&i| &self.nodes[i].rev)
    }

    pub fn lookup(&self, doc_id: &str, rev: &str) -> Option<&DocumentRevision> {
        self.by_rev
            .get(rev)
            .map(|&i| &self.nodes[i].rev)
            .filter(|r| r.doc_id == doc_id)
    }

    pub fn contains(&self, rev: &str) -> bool {
        self.by_rev.contains_key(rev)
    }

    /// Depth from root (0 at root), or -1 for an unknown sequence.
    pub fn depth(&self, sequence: i64) -> i64 {
        match self.by_sequence.get(&sequence) {
            Some(&i) => self.nodes[i].depth as i64,
            None => -1,
        }
    }

    /// Revisions from `sequence` up to its root, leaf-first.
    pub fn path_for_node(&self, sequence: i64) -> Result<Vec<&DocumentRevision>, TreeError> {
        let Some(&idx) = self.by_sequence.get(&sequence) else {
            return Err(TreeError::UnknownSequence { sequence });
        };

        let mut path = Vec::with_capacity(self.nodes[idx].depth + 1);
        let mut cur = &self.nodes[idx];
        loop {
            path.push(&cur.rev);
            if cur.rev.parent_sequence == SENTINEL_PARENT {
                break;
            }
            match self.by_sequence.get(&cur.rev.parent_sequence) {
                Some(&p) => cur = &self.nodes[p],
                // Parent edges are validated on insert.
                None => break,
            }
        }
        Ok(path)
    }

    /// Rev ids from `sequence` up to its root, leaf-first.
    pub fn path(&self, sequence: i64) -> Result<Vec<RevisionId>, TreeError> {
        Ok(self
            .path_for_node(sequence)?
            .iter()
            .map(|r| r.rev.clone())
            .collect())
    }

    /// True iff more than one non-deleted leaf exists. Deleted leaves never
    /// create a conflict by themselves.
    pub fn has_conflicts(&self) -> bool {
        self.nodes
            .iter()
            .filter(|n| n.children.is_empty() && !n.rev.deleted)
            .count()
            > 1
    }

    /// The winning leaf: highest generation among non-deleted leaves, ties
    /// broken by lexicographically greatest suffix. When every leaf is
    /// deleted the same rule applies over the deleted leaves, so a fully
    /// deleted document still has a deterministic public revision.
    pub fn current_revision(&self) -> Result<&DocumentRevision, TreeError> {
        let leafs = self.leafs();
        if leafs.is_empty() {
            return Err(TreeError::Empty);
        }
        let winner = leafs
            .iter()
            .copied()
            .filter(|r| !r.deleted)
            .max_by(|a, b| a.rev.cmp(&b.rev))
            .or_else(|| leafs.iter().copied().max_by(|a, b| a.rev.cmp(&b.rev)));
        // Non-empty leaf set always yields a winner.
        winner.ok_or(TreeError::Empty)
    }
}
