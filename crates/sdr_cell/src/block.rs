//! Composite values.
//!
//! A [`Block`] groups named child cells under a kind name and declares the
//! [`Capability`] tags it implements. Capabilities are how consumers discover
//! what a block can do (see [`Index::implementing`](crate::Index::implementing));
//! nothing probes a block for ad hoc properties.
//!
//! The child list is fixed once built. A structural change is expressed by
//! storing a new block in the owning cell.

use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::cell::Cell;
use crate::context::Context;

/// A capability tag a block declares.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Capability(String);

impl Capability {
    #[must_use]
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Capability {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

impl From<String> for Capability {
    fn from(tag: String) -> Self {
        Self(tag)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u64);

/// A composite of named child cells.
pub struct Block {
    id: BlockId,
    kind: String,
    capabilities: Vec<Capability>,
    cells: Vec<(String, Cell)>,
}

/// Shared handle to a [`Block`]. Equality is identity.
#[derive(Clone)]
pub struct BlockRef(Rc<Block>);

impl BlockRef {
    /// Start building a block of the given kind.
    #[must_use]
    pub fn builder(kind: impl Into<String>) -> BlockBuilder {
        BlockBuilder {
            kind: kind.into(),
            capabilities: Vec::new(),
            cells: Vec::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> BlockId {
        self.0.id
    }

    /// The block's kind name (what constructed it).
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.0.kind
    }

    #[must_use]
    pub fn capabilities(&self) -> &[Capability] {
        &self.0.capabilities
    }

    /// Whether the block declares `tag`.
    #[must_use]
    pub fn implements(&self, tag: &Capability) -> bool {
        self.0.capabilities.contains(tag)
    }

    /// Child cell by name.
    #[must_use]
    pub fn cell(&self, name: &str) -> Option<&Cell> {
        self.0
            .cells
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, cell)| cell)
    }

    /// Child cells in declaration order.
    pub fn cells(&self) -> impl Iterator<Item = (&str, &Cell)> {
        self.0.cells.iter().map(|(n, c)| (n.as_str(), c))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.cells.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.cells.is_empty()
    }

    /// Follow `path` through nested block cells and return the final cell.
    #[must_use]
    pub fn resolve<S: AsRef<str>>(&self, path: &[S]) -> Option<Cell> {
        let (first, rest) = path.split_first()?;
        let cell = self.cell(first.as_ref())?.clone();
        if rest.is_empty() {
            return Some(cell);
        }
        let child = cell.get().as_block()?.clone();
        child.resolve(rest)
    }

    /// Identity comparison.
    #[must_use]
    pub fn ptr_eq(&self, other: &BlockRef) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for BlockRef {
    // Children are listed by name only; blocks may form cycles.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("id", &self.0.id)
            .field("kind", &self.0.kind)
            .field("capabilities", &self.0.capabilities)
            .field(
                "cells",
                &self.0.cells.iter().map(|(n, _)| n).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Builder returned by [`BlockRef::builder`].
#[derive(Debug)]
pub struct BlockBuilder {
    kind: String,
    capabilities: Vec<Capability>,
    cells: Vec<(String, Cell)>,
}

impl BlockBuilder {
    /// Declare a capability. Duplicates are ignored.
    #[must_use]
    pub fn capability(mut self, tag: impl Into<Capability>) -> Self {
        let tag = tag.into();
        if !self.capabilities.contains(&tag) {
            self.capabilities.push(tag);
        }
        self
    }

    /// Add a named child cell, replacing any earlier cell with that name.
    #[must_use]
    pub fn cell(mut self, name: impl Into<String>, cell: Cell) -> Self {
        let name = name.into();
        match self.cells.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = cell,
            None => self.cells.push((name, cell)),
        }
        self
    }

    #[must_use]
    pub fn build(self, ctx: &Context) -> BlockRef {
        BlockRef(Rc::new(Block {
            id: BlockId(ctx.next_id()),
            kind: self.kind,
            capabilities: self.capabilities,
            cells: self.cells,
        }))
    }
}
