//! Datastore manager.
//!
//! Owns a root directory and the set of datastores open under it. One
//! manager per directory: concurrent managers against the same root are
//! undefined behavior (advisory, not enforced).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;

use crate::config::Limits;
use crate::core::{CoreError, InvalidId};
use crate::error::{Effect, Transience};
use crate::events::{DatastoreEvent, EventBus, EventSubscription};

use super::datastore::{Datastore, StoreError};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ManagerError {
    #[error("datastore `{name}` does not exist")]
    NotFound { name: String },
    #[error("manager root {path:?} is not a writable directory")]
    RootUnusable { path: PathBuf },
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ManagerError {
    pub fn transience(&self) -> Transience {
        match self {
            ManagerError::NotFound { .. } | ManagerError::RootUnusable { .. } => {
                Transience::Permanent
            }
            ManagerError::Io { .. } => Transience::Unknown,
            ManagerError::Core(e) => e.transience(),
            ManagerError::Store(e) => e.transience(),
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            ManagerError::Io { .. } => Effect::Unknown,
            ManagerError::Core(e) => e.effect(),
            ManagerError::Store(e) => e.effect(),
            _ => Effect::None,
        }
    }
}

/// Manages the datastores under one root directory.
pub struct DatastoreManager {
    root: PathBuf,
    limits: Limits,
    open: Mutex<HashMap<String, Datastore>>,
    events: EventBus,
}

impl DatastoreManager {
    /// Construct a manager over an existing writable directory.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, ManagerError> {
        Self::with_limits(root, Limits::default())
    }

    pub fn with_limits(root: impl Into<PathBuf>, limits: Limits) -> Result<Self, ManagerError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(ManagerError::RootUnusable { path: root });
        }
        let events = EventBus::new(&limits);
        Ok(Self {
            root,
            limits,
            open: Mutex::new(HashMap::new()),
            events,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Subscribe to lifecycle events. `None` when the subscriber cap is
    /// reached.
    pub fn subscribe(&self) -> Option<EventSubscription> {
        self.events.subscribe()
    }

    /// Open a datastore, creating it on first use.
    ///
    /// Idempotent: the same instance is returned for a name until it is
    /// closed or deleted, including under concurrent opens.
    pub fn open(&self, name: &str) -> Result<Datastore, ManagerError> {
        validate_name(name)?;

        let mut open = self.open.lock().expect("open map poisoned");
        if let Some(ds) = open.get(name) {
            return Ok(ds.clone());
        }

        let dir = self.root.join(name);
        let created = !dir.exists();
        let ds = Datastore::open(name, &dir, &self.limits)?;
        open.insert(name.to_string(), ds.clone());
        drop(open);

        if created {
            tracing::info!(name = %name, "datastore created");
            self.events.publish(DatastoreEvent::Created {
                name: name.to_string(),
            });
        }
        self.events.publish(DatastoreEvent::Opened {
            name: name.to_string(),
        });
        Ok(ds)
    }

    /// Drop a datastore from the open map. On-disk state is untouched.
    pub fn close(&self, name: &str) -> Result<(), ManagerError> {
        validate_name(name)?;
        let removed = {
            let mut open = self.open.lock().expect("open map poisoned");
            open.remove(name)
        };
        if removed.is_some() {
            self.events.publish(DatastoreEvent::Closed {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    /// Delete a datastore's entire subdirectory. Not undoable; data
    /// replicated to remote databases is unaffected.
    pub fn delete(&self, name: &str) -> Result<(), ManagerError> {
        validate_name(name)?;

        let mut open = self.open.lock().expect("open map poisoned");
        let dir = self.root.join(name);
        let result = if dir.is_dir() {
            fs::remove_dir_all(&dir).map_err(|source| ManagerError::Io { path: dir, source })
        } else {
            Err(ManagerError::NotFound {
                name: name.to_string(),
            })
        };
        // Any open handle to the deleted files is in an unknown state;
        // drop it even when the removal failed partway.
        open.remove(name);
        drop(open);

        result?;
        tracing::info!(name = %name, "datastore deleted");
        self.events.publish(DatastoreEvent::Deleted {
            name: name.to_string(),
        });
        Ok(())
    }

    /// Names of datastores present on disk.
    pub fn list(&self) -> Result<Vec<String>, ManagerError> {
        let entries = fs::read_dir(&self.root).map_err(|source| ManagerError::Io {
            path: self.root.clone(),
            source,
        })?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| ManagerError::Io {
                path: self.root.clone(),
                source,
            })?;
            if !entry.path().is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str()
                && validate_name(name).is_ok()
            {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Names must match `^[A-Za-z][A-Za-z0-9_]*$`.
fn validate_name(name: &str) -> Result<(), ManagerError> {
    let mut bytes = name.bytes();
    let valid = match bytes.next() {
        Some(first) => {
            first.is_ascii_alphabetic()
                && bytes.all(|b| b.is_ascii_alphanumeric() || b == b'_')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(CoreError::from(InvalidId::Datastore {
            raw: name.to_string(),
            reason: "must start with a letter and contain only letters, digits and `_`".into(),
        })
        .into())
    }
}
