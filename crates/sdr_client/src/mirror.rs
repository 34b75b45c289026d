//! Local mirror of the server's block tree.
//!
//! The [`Mirror`] owns the [`RemoteCell`] write handle of every mirrored
//! cell, keyed by slash-joined path (`"source/freq"`). It is owned by the
//! session, which makes the session the only writer of remote state.
//!
//! A snapshot is reconciled into the existing tree rather than replacing it:
//! a block whose kind, capabilities and cell layout match the description
//! keeps its cells, and only their values change. Widgets listening on those
//! cells see a value update instead of losing their cell. Blocks whose shape
//! changed are rebuilt and swapped into their parent cell.

use std::collections::HashMap;

use sdr_cell::{BlockRef, Cell, Context, RemoteCell, Value, ValueType};
use sdr_net::{BlockDesc, CellContent, Snapshot, StateDelta};
use tracing::{debug, trace};

use crate::error::ClientError;

/// Slash-joined key for a cell path.
pub fn path_key<S: AsRef<str>>(path: &[S]) -> String {
    path.iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join("/")
}

fn child_key(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

/// The session-owned copy of remote state.
#[derive(Debug)]
pub struct Mirror {
    root: RemoteCell,
    cells: HashMap<String, RemoteCell>,
    rebuilds: u64,
}

impl Mirror {
    /// An empty mirror; the root cell holds null until the first snapshot.
    ///
    /// # Errors
    ///
    /// Propagates [`sdr_cell::CellError`] from creating the root cell.
    pub fn new(ctx: &Context) -> Result<Self, ClientError> {
        Ok(Self {
            root: RemoteCell::new(ctx, ValueType::Block, Value::Null, false)?,
            cells: HashMap::new(),
            rebuilds: 0,
        })
    }

    /// The read-only root cell handed to widgets and the index.
    #[must_use]
    pub fn root(&self) -> Cell {
        self.root.cell()
    }

    #[must_use]
    pub fn is_populated(&self) -> bool {
        self.root.get().as_block().is_some()
    }

    /// How many blocks were built from scratch rather than reconciled.
    #[must_use]
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }

    /// Current value at `key`, if the cell exists.
    #[must_use]
    pub fn value_at(&self, key: &str) -> Option<Value> {
        self.cells.get(key).map(RemoteCell::get)
    }

    /// Store `value` in the cell at `key`.
    ///
    /// # Errors
    ///
    /// [`ClientError::UnknownPath`] if no such cell exists, or a cell error
    /// if the value violates its type.
    pub fn apply_value(&self, key: &str, value: Value) -> Result<bool, ClientError> {
        let cell = self
            .cells
            .get(key)
            .ok_or_else(|| ClientError::UnknownPath(key.to_string()))?;
        Ok(cell.apply(value)?)
    }

    /// Check `value` against the type of the cell at `key` without storing
    /// it.
    ///
    /// # Errors
    ///
    /// [`ClientError::UnknownPath`] if no such cell exists, or a cell error
    /// if the value violates its type.
    pub fn admit(&self, key: &str, value: Value) -> Result<Value, ClientError> {
        let cell = self
            .cells
            .get(key)
            .ok_or_else(|| ClientError::UnknownPath(key.to_string()))?;
        Ok(cell.cell().value_type().admit(value)?)
    }

    /// Bring the whole tree in line with `snapshot`.
    ///
    /// Either the whole snapshot is applied or none of it: every value is
    /// checked and every replacement block built before any cell changes.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot describes a value its own declared
    /// type rejects. The mirror is left as it was.
    pub fn apply_snapshot(&mut self, ctx: &Context, snapshot: &Snapshot) -> Result<(), ClientError> {
        let current = self.root.get();
        match current.as_block() {
            Some(existing) if same_shape(existing, &snapshot.root) => {
                let mut steps = Vec::new();
                self.plan(ctx, existing, &snapshot.root, "", &mut steps)?;
                self.commit(steps)
            }
            _ => {
                let mut staged = Staged::default();
                let block = build(ctx, &snapshot.root, "", &mut staged)?;
                self.rebuilds += staged.blocks;
                self.cells = staged.cells;
                self.root.apply(Value::Block(block))?;
                Ok(())
            }
        }
    }

    /// Apply one server change.
    ///
    /// # Errors
    ///
    /// [`ClientError::UnknownPath`] for paths outside the tree, or a cell
    /// error for ill-typed values. `Rejected` deltas are not handled here.
    pub fn apply_delta(&mut self, ctx: &Context, delta: &StateDelta) -> Result<(), ClientError> {
        match delta {
            StateDelta::Value { path, value } => {
                let key = path_key(path);
                trace!(path = %key, %value, "value delta");
                self.apply_value(&key, Value::from_json(value)?)?;
                Ok(())
            }
            StateDelta::Block { path, block } => {
                let key = path_key(path);
                debug!(path = %key, kind = %block.kind, "block delta");
                let step = self.stage_block(ctx, &key, block)?;
                self.commit(vec![step])
            }
            StateDelta::Rejected { .. } => Ok(()),
        }
    }

    /// Collect the changes that bring `existing` in line with `desc`,
    /// checking every value against its cell's type on the way.
    fn plan(
        &self,
        ctx: &Context,
        existing: &BlockRef,
        desc: &BlockDesc,
        prefix: &str,
        steps: &mut Vec<Step>,
    ) -> Result<(), ClientError> {
        for cell in &desc.cells {
            let key = child_key(prefix, &cell.name);
            match &cell.content {
                CellContent::Value(json) => {
                    let value = self.admit(&key, Value::from_json(json)?)?;
                    steps.push(Step::Set { key, value });
                }
                CellContent::Block(child) => {
                    let current = existing.cell(&cell.name).map(Cell::get);
                    match current.as_ref().and_then(Value::as_block) {
                        Some(block) if same_shape(block, child) => {
                            self.plan(ctx, block, child, &key, steps)?;
                        }
                        _ => steps.push(self.stage_block(ctx, &key, child)?),
                    }
                }
            }
        }
        Ok(())
    }

    /// Build a replacement for the block cell at `key` without touching the
    /// mirror.
    fn stage_block(&self, ctx: &Context, key: &str, desc: &BlockDesc) -> Result<Step, ClientError> {
        if !self.cells.contains_key(key) {
            return Err(ClientError::UnknownPath(key.to_string()));
        }
        let mut staged = Staged::default();
        let block = build(ctx, desc, key, &mut staged)?;
        Ok(Step::Swap {
            key: key.to_string(),
            block,
            staged,
        })
    }

    /// Apply checked steps. Values were admitted while planning, so the
    /// cell writes here do not fail on type.
    fn commit(&mut self, steps: Vec<Step>) -> Result<(), ClientError> {
        for step in steps {
            match step {
                Step::Set { key, value } => {
                    self.apply_value(&key, value)?;
                }
                Step::Swap { key, block, staged } => {
                    let nested = format!("{key}/");
                    self.cells.retain(|k, _| !k.starts_with(&nested));
                    self.cells.extend(staged.cells);
                    self.rebuilds += staged.blocks;
                    self.apply_value(&key, Value::Block(block))?;
                }
            }
        }
        Ok(())
    }
}

/// A checked change waiting to be committed.
enum Step {
    Set { key: String, value: Value },
    Swap { key: String, block: BlockRef, staged: Staged },
}

/// Write handles of a freshly built subtree, not yet part of the mirror.
#[derive(Default)]
struct Staged {
    cells: HashMap<String, RemoteCell>,
    blocks: u64,
}

fn build(
    ctx: &Context,
    desc: &BlockDesc,
    prefix: &str,
    staged: &mut Staged,
) -> Result<BlockRef, ClientError> {
    let mut builder = desc
        .capabilities
        .iter()
        .fold(BlockRef::builder(desc.kind.as_str()), |b, tag| {
            b.capability(tag.as_str())
        });
    for cell in &desc.cells {
        let key = child_key(prefix, &cell.name);
        let initial = match &cell.content {
            CellContent::Value(json) => Value::from_json(json)?,
            CellContent::Block(child) => Value::Block(build(ctx, child, &key, staged)?),
        };
        let remote = RemoteCell::new(ctx, cell.value_type.clone(), initial, cell.writable)?;
        builder = builder.cell(cell.name.as_str(), remote.cell());
        staged.cells.insert(key, remote);
    }
    staged.blocks += 1;
    Ok(builder.build(ctx))
}

/// Whether `block` can absorb `desc` by value updates alone.
fn same_shape(block: &BlockRef, desc: &BlockDesc) -> bool {
    block.kind() == desc.kind
        && block.len() == desc.cells.len()
        && block
            .capabilities()
            .iter()
            .map(|c| c.as_str())
            .eq(desc.capabilities.iter().map(String::as_str))
        && block.cells().zip(&desc.cells).all(|((name, cell), d)| {
            name == d.name
                && *cell.value_type() == d.value_type
                && cell.is_writable() == d.writable
                && matches!(
                    (cell.value_type(), &d.content),
                    (ValueType::Block, CellContent::Block(_))
                        | (_, CellContent::Value(_))
                )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::radio_snapshot;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_first_snapshot_populates_root() {
        let ctx = Context::in_memory();
        let mut mirror = Mirror::new(&ctx).unwrap();
        assert!(!mirror.is_populated());

        mirror.apply_snapshot(&ctx, &radio_snapshot(98e6)).unwrap();
        assert!(mirror.is_populated());
        let root = mirror.root().get();
        let freq = root.as_block().unwrap().resolve(&["source", "freq"]).unwrap();
        assert_eq!(freq.get(), Value::Float(98e6));
        assert!(freq.is_writable());
        assert_eq!(mirror.value_at("source/sample_rate"), Some(Value::Int(2_400_000)));
    }

    #[test]
    fn test_resync_keeps_cells_and_listeners() {
        let ctx = Context::in_memory();
        let mut mirror = Mirror::new(&ctx).unwrap();
        mirror.apply_snapshot(&ctx, &radio_snapshot(98e6)).unwrap();
        let rebuilds = mirror.rebuilds();
        let freq = mirror
            .root()
            .get()
            .as_block()
            .unwrap()
            .resolve(&["source", "freq"])
            .unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        let _h = freq.listen(move |v| s.borrow_mut().push(v.clone()));

        mirror.apply_snapshot(&ctx, &radio_snapshot(101.1e6)).unwrap();
        ctx.scheduler().flush().unwrap();

        assert_eq!(mirror.rebuilds(), rebuilds);
        assert_eq!(*seen.borrow(), vec![Value::Float(101.1e6)]);
    }

    #[test]
    fn test_changed_block_is_rebuilt_in_parent() {
        let ctx = Context::in_memory();
        let mut mirror = Mirror::new(&ctx).unwrap();
        mirror.apply_snapshot(&ctx, &radio_snapshot(98e6)).unwrap();
        let root_before = mirror.root().get();

        let mut changed = radio_snapshot(98e6);
        let source = changed.root.find_mut(&["source"]).unwrap();
        source.content = CellContent::Block(BlockDesc::new("RTLSDRSource").capability("device"));
        mirror.apply_snapshot(&ctx, &changed).unwrap();

        // The root block itself was reconciled.
        assert_eq!(mirror.root().get(), root_before);
        assert_eq!(mirror.value_at("source/freq"), None);
        let root = mirror.root().get();
        let source = root.as_block().unwrap().cell("source").unwrap().get();
        assert_eq!(source.as_block().unwrap().kind(), "RTLSDRSource");
    }

    #[test]
    fn test_value_delta_updates_cell() {
        let ctx = Context::in_memory();
        let mut mirror = Mirror::new(&ctx).unwrap();
        mirror.apply_snapshot(&ctx, &radio_snapshot(98e6)).unwrap();
        let delta = StateDelta::Value {
            path: vec!["source".into(), "agc".into()],
            value: serde_json::json!(true),
        };
        mirror.apply_delta(&ctx, &delta).unwrap();
        assert_eq!(mirror.value_at("source/agc"), Some(Value::Bool(true)));
    }

    #[test]
    fn test_unknown_path_is_an_error() {
        let ctx = Context::in_memory();
        let mut mirror = Mirror::new(&ctx).unwrap();
        mirror.apply_snapshot(&ctx, &radio_snapshot(98e6)).unwrap();
        let delta = StateDelta::Value {
            path: vec!["source".into(), "volume".into()],
            value: serde_json::json!(1),
        };
        assert!(matches!(
            mirror.apply_delta(&ctx, &delta),
            Err(ClientError::UnknownPath(p)) if p == "source/volume"
        ));
    }

    fn source_with_agc(agc: serde_json::Value) -> BlockDesc {
        let mut snapshot = radio_snapshot(98e6);
        snapshot.root.find_mut(&["source", "agc"]).unwrap().content = CellContent::Value(agc);
        match &snapshot.root.find(&["source"]).unwrap().content {
            CellContent::Block(block) => block.clone(),
            CellContent::Value(_) => unreachable!(),
        }
    }

    #[test]
    fn test_failed_block_delta_keeps_old_block_writable() {
        let ctx = Context::in_memory();
        let mut mirror = Mirror::new(&ctx).unwrap();
        mirror.apply_snapshot(&ctx, &radio_snapshot(98e6)).unwrap();
        let rebuilds = mirror.rebuilds();

        let bad = StateDelta::Block {
            path: vec!["source".into()],
            block: source_with_agc(serde_json::json!("yes")),
        };
        assert!(mirror.apply_delta(&ctx, &bad).is_err());
        assert_eq!(mirror.rebuilds(), rebuilds);

        let tune = StateDelta::Value {
            path: vec!["source".into(), "freq".into()],
            value: serde_json::json!(101e6),
        };
        mirror.apply_delta(&ctx, &tune).unwrap();
        assert_eq!(mirror.value_at("source/freq"), Some(Value::Float(101e6)));

        mirror.apply_snapshot(&ctx, &radio_snapshot(99e6)).unwrap();
        mirror.apply_snapshot(&ctx, &radio_snapshot(100e6)).unwrap();
        assert_eq!(mirror.value_at("source/freq"), Some(Value::Float(100e6)));
    }

    #[test]
    fn test_block_delta_swaps_subtree() {
        let ctx = Context::in_memory();
        let mut mirror = Mirror::new(&ctx).unwrap();
        mirror.apply_snapshot(&ctx, &radio_snapshot(98e6)).unwrap();
        let delta = StateDelta::Block {
            path: vec!["source".into()],
            block: source_with_agc(serde_json::json!(true)),
        };
        mirror.apply_delta(&ctx, &delta).unwrap();
        assert_eq!(mirror.value_at("source/agc"), Some(Value::Bool(true)));
        assert_eq!(mirror.value_at("source/freq"), Some(Value::Float(98e6)));
    }

    #[test]
    fn test_rejected_resync_changes_nothing() {
        let ctx = Context::in_memory();
        let mut mirror = Mirror::new(&ctx).unwrap();
        mirror.apply_snapshot(&ctx, &radio_snapshot(98e6)).unwrap();

        let mut bad = radio_snapshot(120e6);
        bad.root.find_mut(&["source", "sample_rate"]).unwrap().content =
            CellContent::Value(serde_json::json!("fast"));
        assert!(mirror.apply_snapshot(&ctx, &bad).is_err());

        assert_eq!(mirror.value_at("source/freq"), Some(Value::Float(98e6)));
        assert_eq!(mirror.value_at("receivers/a/rec_freq"), Some(Value::Float(98e6)));
        assert_eq!(mirror.value_at("source/sample_rate"), Some(Value::Int(2_400_000)));
    }

    #[test]
    fn test_ill_typed_snapshot_value_rejected() {
        let ctx = Context::in_memory();
        let mut mirror = Mirror::new(&ctx).unwrap();
        let snapshot = Snapshot {
            root: BlockDesc::new("Top").value("agc", ValueType::Bool, true, serde_json::json!("yes")),
        };
        assert!(mirror.apply_snapshot(&ctx, &snapshot).is_err());
        assert!(!mirror.is_populated());
    }
}
