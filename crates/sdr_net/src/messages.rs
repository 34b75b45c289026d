//! Message types exchanged between the client and the radio server.
//!
//! A session starts with a [`Hello`] request answered by a [`Snapshot`] of
//! the whole block tree. After that the server broadcasts [`StateDelta`]s and
//! the client publishes [`ActionFrame`]s. Cell values travel as JSON values so
//! the wire stays independent of the client's in-memory [`Value`] type.
//!
//! [`Value`]: sdr_cell::Value

use sdr_cell::ValueType;
use serde::{Deserialize, Serialize};

/// Protocol revision sent in every hello.
pub const PROTOCOL_VERSION: u32 = 1;

// ── Handshake ───────────────────────────────────────────────────────────────

/// Opens a session. Sent as a request on
/// [`subjects::hello`](crate::subjects::hello).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Unique per client process.
    pub client_id: String,
    pub protocol: u32,
}

/// The server's full state, answering a [`Hello`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub root: BlockDesc,
}

// ── Tree description ────────────────────────────────────────────────────────

/// Wire form of a block: kind, declared capabilities and child cells in
/// order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockDesc {
    pub kind: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub cells: Vec<CellDesc>,
}

/// Wire form of one child cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellDesc {
    pub name: String,
    pub value_type: ValueType,
    #[serde(default)]
    pub writable: bool,
    pub content: CellContent,
}

/// What a cell holds: a plain value or a nested block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellContent {
    Value(serde_json::Value),
    Block(BlockDesc),
}

impl BlockDesc {
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            capabilities: Vec::new(),
            cells: Vec::new(),
        }
    }

    /// Declare a capability.
    #[must_use]
    pub fn capability(mut self, tag: impl Into<String>) -> Self {
        self.capabilities.push(tag.into());
        self
    }

    /// Append a value cell.
    #[must_use]
    pub fn value(
        mut self,
        name: impl Into<String>,
        value_type: ValueType,
        writable: bool,
        value: serde_json::Value,
    ) -> Self {
        self.cells.push(CellDesc {
            name: name.into(),
            value_type,
            writable,
            content: CellContent::Value(value),
        });
        self
    }

    /// Append a cell holding a nested block.
    #[must_use]
    pub fn block(mut self, name: impl Into<String>, block: BlockDesc) -> Self {
        self.cells.push(CellDesc {
            name: name.into(),
            value_type: ValueType::Block,
            writable: false,
            content: CellContent::Block(block),
        });
        self
    }

    /// Child cell by name.
    #[must_use]
    pub fn cell(&self, name: &str) -> Option<&CellDesc> {
        self.cells.iter().find(|c| c.name == name)
    }

    /// Follow `path` through nested blocks.
    #[must_use]
    pub fn find<S: AsRef<str>>(&self, path: &[S]) -> Option<&CellDesc> {
        let (first, rest) = path.split_first()?;
        let cell = self.cell(first.as_ref())?;
        match (&cell.content, rest.is_empty()) {
            (_, true) => Some(cell),
            (CellContent::Block(child), false) => child.find(rest),
            (CellContent::Value(_), false) => None,
        }
    }

    /// Mutable variant of [`BlockDesc::find`].
    pub fn find_mut<S: AsRef<str>>(&mut self, path: &[S]) -> Option<&mut CellDesc> {
        let (first, rest) = path.split_first()?;
        let cell = self.cells.iter_mut().find(|c| c.name == first.as_ref())?;
        if rest.is_empty() {
            return Some(cell);
        }
        match &mut cell.content {
            CellContent::Block(child) => child.find_mut(rest),
            CellContent::Value(_) => None,
        }
    }
}

// ── Live traffic ────────────────────────────────────────────────────────────

/// A change broadcast by the server on
/// [`subjects::state_delta`](crate::subjects::state_delta).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateDelta {
    /// A value cell changed.
    Value {
        path: Vec<String>,
        value: serde_json::Value,
    },
    /// A block cell now holds a different block.
    Block { path: Vec<String>, block: BlockDesc },
    /// The action with this sequence number was refused.
    Rejected { seq: u64, reason: String },
}

/// A write request published on [`subjects::action`](crate::subjects::action).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionFrame {
    /// Client-assigned, increasing per client.
    pub seq: u64,
    pub path: Vec<String>,
    pub value: serde_json::Value,
}
