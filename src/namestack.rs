//! The scoped name lookup stack (`tablestack`).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::BraidError;
use crate::table::ResultTable;
use crate::value::Value;

struct Frame(Mutex<HashMap<String, Value>>);

/// An ordered stack of mapping frames used to resolve template variables and
/// thread `$result` through a chain.
///
/// Lookup walks top -> bottom through the explicit frames pushed by nested
/// handlers; if no frame holds the key, the braid's own result table is
/// consulted as an implicit bottom frame (grounded in the source, which
/// pushes the braid instance itself as `tablestack`'s first frame so a bare
/// key like `"query1"` resolves to `ttable["query1"].value`). `clone()` is
/// shallow: the clone shares the same frame references, so siblings that
/// hold clones of the same stack observe each other's writes to those
/// frames until one of them pushes a new frame of its own.
#[derive(Clone)]
pub struct NameStack {
    frames: Vec<Arc<Frame>>,
    fallback: Option<Arc<ResultTable>>,
}

impl NameStack {
    pub fn new() -> Self {
        Self {
            frames: Vec::new(),
            fallback: None,
        }
    }

    /// A stack rooted at `table`: lookups that miss every explicit frame
    /// fall back to the result table.
    pub fn rooted(table: Arc<ResultTable>) -> Self {
        Self {
            frames: Vec::new(),
            fallback: Some(table),
        }
    }

    /// Push a new frame on top, owned by the caller's scope.
    pub fn add(&mut self, data: HashMap<String, Value>) {
        self.frames.push(Arc::new(Frame(Mutex::new(data))));
    }

    /// Look up `key`, walking frames top to bottom and then falling back to
    /// the result table. `Ok(None)` means the key is absent everywhere;
    /// `Err(UnfinishedThread)` means the fallback table has the key but it
    /// hasn't finished running yet.
    pub fn get(&self, key: &str) -> Result<Option<Value>, BraidError> {
        for frame in self.frames.iter().rev() {
            let guard = frame.0.lock();
            if let Some(v) = guard.get(key) {
                return Ok(Some(v.clone()));
            }
        }
        if let Some(table) = &self.fallback {
            if table.contains(key) {
                return table.get(key).map(Some);
            }
        }
        Ok(None)
    }

    /// Write `key` into the topmost frame. A no-op if no frame has been
    /// pushed yet (writes only ever target an explicit frame, never the
    /// result-table fallback).
    pub fn set(&self, key: impl Into<String>, value: Value) {
        if let Some(top) = self.frames.last() {
            top.0.lock().insert(key.into(), value);
        }
    }

    /// Look up `key` in the topmost frame only, skipping lower frames and
    /// the result-table fallback. Used by `$foreach` to read an inherited
    /// `$throttle` without picking up an unrelated ancestor frame's value.
    pub fn get_in_top_frame(&self, key: &str) -> Option<Value> {
        self.frames.last().and_then(|top| top.0.lock().get(key).cloned())
    }

    /// Pure presence check. The source's `tablestack.__contains__` returns
    /// `not not self[k]`, so a falsy-but-present value (`0`, `""`, `false`)
    /// incorrectly reports as absent; this implementation reports presence
    /// regardless of truthiness (see DESIGN.md).
    pub fn contains(&self, key: &str) -> bool {
        matches!(self.get(key), Ok(Some(_)))
    }

    /// A consolidated mapping of the explicit frames, top-precedence
    /// shadowing applied (later/topmost frames win). Does not include the
    /// result-table fallback: frames in this implementation hold only
    /// already-resolved values, so there is no lazy lookup to fail and
    /// tolerate inside the merge.
    pub fn flat(&self) -> HashMap<String, Value> {
        let mut out = HashMap::new();
        for frame in &self.frames {
            let guard = frame.0.lock();
            for (k, v) in guard.iter() {
                out.insert(k.clone(), v.clone());
            }
        }
        out
    }
}

impl Default for NameStack {
    fn default() -> Self {
        Self::new()
    }
}
