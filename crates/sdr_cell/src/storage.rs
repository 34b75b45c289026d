//! Persistent key/value storage for user preferences.
//!
//! The core needs only `get(key)` and `set(key, value)` of JSON primitives.
//! [`StorageNamespace`] prefixes keys so several clients can share a backend,
//! and [`persistent_cell`] exposes a stored preference as a local cell that
//! writes every change back.

use std::cell::{Cell as StdCell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::{debug, info, warn};

use crate::cell::Cell;
use crate::context::Context;
use crate::error::CellError;
use crate::value::{Value, ValueType};

/// Errors from the file-backed store.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage file is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("storage file {0} does not contain a JSON object")]
    NotAnObject(PathBuf),
}

/// A key/value backend.
pub trait Storage {
    fn get(&self, key: &str) -> Option<serde_json::Value>;

    fn set(&self, key: &str, value: serde_json::Value);

    /// Write buffered changes out. Returns whether anything was written.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the backend cannot be written.
    fn persist(&self) -> Result<bool, StorageError> {
        Ok(false)
    }
}

/// Volatile storage, used by tests and when no state file is configured.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RefCell<BTreeMap<String, serde_json::Value>>,
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.entries.borrow().get(key).cloned()
    }

    fn set(&self, key: &str, value: serde_json::Value) {
        self.entries.borrow_mut().insert(key.to_string(), value);
    }
}

/// Storage kept in a JSON object on disk.
///
/// On open, a readable file is copied to `<path>~` first, so a version that
/// misreads the file cannot destroy the last good copy on its first save.
/// Writes are buffered until [`Storage::persist`].
#[derive(Debug)]
pub struct JsonFileStorage {
    path: PathBuf,
    entries: RefCell<BTreeMap<String, serde_json::Value>>,
    dirty: StdCell<bool>,
}

impl JsonFileStorage {
    /// Load `path`, or start empty if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the file exists but cannot be read or is
    /// not a JSON object.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.is_file() {
            let text = std::fs::read_to_string(&path)?;
            let serde_json::Value::Object(map) = serde_json::from_str::<serde_json::Value>(&text)? else {
                return Err(StorageError::NotAnObject(path));
            };
            std::fs::copy(&path, backup_path(&path))?;
            info!(path = %path.display(), keys = map.len(), "loaded state file");
            map.into_iter().collect()
        } else {
            info!(path = %path.display(), "no state file, starting empty");
            BTreeMap::new()
        };
        Ok(Self {
            path,
            entries: RefCell::new(entries),
            dirty: StdCell::new(false),
        })
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.get()
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push("~");
    PathBuf::from(name)
}

impl Storage for JsonFileStorage {
    fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.entries.borrow().get(key).cloned()
    }

    fn set(&self, key: &str, value: serde_json::Value) {
        let mut entries = self.entries.borrow_mut();
        if entries.get(key) != Some(&value) {
            entries.insert(key.to_string(), value);
            self.dirty.set(true);
        }
    }

    fn persist(&self) -> Result<bool, StorageError> {
        if !self.dirty.get() {
            return Ok(false);
        }
        let object: serde_json::Map<String, serde_json::Value> = self
            .entries
            .borrow()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let text = serde_json::to_string(&serde_json::Value::Object(object))?;
        std::fs::write(&self.path, text)?;
        self.dirty.set(false);
        debug!(path = %self.path.display(), "state written");
        Ok(true)
    }
}

/// A key prefix over a shared backend.
#[derive(Clone)]
pub struct StorageNamespace {
    backend: Rc<dyn Storage>,
    prefix: String,
}

impl StorageNamespace {
    #[must_use]
    pub fn new(backend: Rc<dyn Storage>, prefix: impl Into<String>) -> Self {
        Self {
            backend,
            prefix: prefix.into(),
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.backend.get(&self.full_key(key))
    }

    /// Stored value, or `default` if the key is absent.
    #[must_use]
    pub fn get_or(&self, key: &str, default: serde_json::Value) -> serde_json::Value {
        self.get(key).unwrap_or(default)
    }

    pub fn set(&self, key: &str, value: serde_json::Value) {
        self.backend.set(&self.full_key(key), value);
    }

    /// Flush the backend.
    ///
    /// # Errors
    ///
    /// Propagates the backend's [`StorageError`].
    pub fn persist(&self) -> Result<bool, StorageError> {
        self.backend.persist()
    }
}

impl fmt::Debug for StorageNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageNamespace")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

/// A local cell whose value is loaded from `key` and written back after
/// every change. A missing or invalid stored value falls back to `default`.
///
/// # Errors
///
/// Returns [`CellError::TypeMismatch`] if `default` violates `value_type`.
pub fn persistent_cell(
    ctx: &Context,
    key: &str,
    value_type: ValueType,
    default: Value,
) -> Result<Cell, CellError> {
    let stored = ctx.storage().get(key).and_then(|json| {
        let admitted = Value::from_json(&json).and_then(|v| value_type.admit(v));
        match admitted {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(key, %err, "ignoring stored preference");
                None
            }
        }
    });
    let cell = Cell::local(ctx, value_type, stored.unwrap_or(default))?;

    let storage = ctx.storage().clone();
    let key = key.to_string();
    cell.listen(move |value| match value.to_json() {
        Some(json) => storage.set(&key, json),
        None => warn!(key = %key, value = %value.describe(), "preference not representable in storage"),
    });
    Ok(cell)
}
