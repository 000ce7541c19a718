//! The result table (`ttable`): per-braid registry of spawned task states.

use std::collections::HashMap;

use dashmap::DashMap;

use crate::error::BraidError;
use crate::value::Value;

/// Lifecycle state of a result-table entry. Progresses only
/// `NotStarted -> Done` or `NotStarted -> Error`, never backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    NotStarted,
    Done,
    Error,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Done | State::Error)
    }
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub state: State,
    pub value: Option<Value>,
    /// Side channel a collaborator handler (e.g. an LLM adapter) can stash
    /// extra detail against, without the core's state/value lifecycle
    /// needing to know what that detail is. Never touched by the built-in
    /// handlers or by `wait`/`get`.
    pub meta: HashMap<String, Value>,
}

impl Entry {
    fn not_started() -> Self {
        Self {
            state: State::NotStarted,
            value: None,
            meta: HashMap::new(),
        }
    }
}

/// Concurrent map from spawned key to its entry. Backed by `dashmap` so
/// sibling workers can insert/read/update distinct keys without contending
/// on a single global lock.
#[derive(Default)]
pub struct ResultTable {
    inner: DashMap<String, Entry>,
}

impl ResultTable {
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    /// Insert a fresh `not-started` entry for `key`. Fails with
    /// `KeyOverrideAttempt` if the key already has an entry — a key is
    /// inserted exactly once per `run`.
    pub fn insert_not_started(&self, key: &str) -> Result<(), BraidError> {
        match self.inner.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(BraidError::KeyOverrideAttempt(key.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Entry::not_started());
                Ok(())
            }
        }
    }

    /// Transition `key` to `done` with the given value. The entry is
    /// terminal afterwards and is never reassigned.
    pub fn mark_done(&self, key: &str, value: Value) {
        if let Some(mut entry) = self.inner.get_mut(key) {
            entry.state = State::Done;
            entry.value = Some(value);
        }
    }

    /// Transition `key` to `error`.
    pub fn mark_error(&self, key: &str) {
        if let Some(mut entry) = self.inner.get_mut(key) {
            entry.state = State::Error;
            entry.value = None;
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    /// Stash `field: value` in `key`'s metadata side-channel. A no-op if
    /// `key` has no entry (the key was never spawned, or a collaborator
    /// raced `run` with its own bookkeeping).
    pub fn set_meta(&self, key: &str, field: &str, value: Value) {
        if let Some(mut entry) = self.inner.get_mut(key) {
            entry.meta.insert(field.to_string(), value);
        }
    }

    /// Snapshot of whatever metadata has been stashed against `key`. Empty
    /// if none has, or if no entry exists for `key`.
    pub fn meta(&self, key: &str) -> HashMap<String, Value> {
        self.inner
            .get(key)
            .map(|e| e.meta.clone())
            .unwrap_or_default()
    }

    pub fn state_of(&self, key: &str) -> Option<State> {
        self.inner.get(key).map(|e| e.state)
    }

    /// Read a finished value. Raises `UnfinishedThread` both when the entry
    /// exists but hasn't reached `done`, and when no entry exists at all —
    /// from the caller's perspective a key that was never spawned is simply
    /// never going to finish, so it is folded into the same error kind
    /// rather than introducing a fifth "no such key" variant.
    pub fn get(&self, key: &str) -> Result<Value, BraidError> {
        match self.inner.get(key) {
            Some(entry) if entry.state == State::Done => {
                Ok(entry.value.clone().unwrap_or(Value::Null))
            }
            _ => Err(BraidError::UnfinishedThread(key.to_string())),
        }
    }

    /// Snapshot of every key currently in the table, in no particular order
    /// (`dashmap` shards keys across internal buckets). Used by `wait()`
    /// with no explicit key list.
    pub fn keys_snapshot(&self) -> Vec<String> {
        self.inner.iter().map(|r| r.key().clone()).collect()
    }
}
