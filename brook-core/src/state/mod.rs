//! # Keyed user state
//!
//! State cells of stateful stages live in the element manager, not in the
//! worker. A bundle carries a read-only snapshot of the cells for its keys;
//! the worker answers with [`StateWrite`]s that are applied when the bundle
//! is persisted and dropped when it fails, so retries start from the same
//! state.
//!
//! ## Cell kinds
//!
//! - Bag: ordered list of encoded values.
//! - Multimap: user key to ordered list of encoded values.

use std::collections::{BTreeMap, HashMap};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::coder::ElementDecoder;
use crate::error::EngineError;
use crate::window::Window;

pub mod hashmap;

pub use hashmap::HashMapStateBackend;

/// A state declaration of one transform: `(transform id, state id)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LinkId {
    pub transform_id: String,
    pub state_id: String,
}

impl LinkId {
    pub fn new(transform_id: impl Into<String>, state_id: impl Into<String>) -> Self {
        Self {
            transform_id: transform_id.into(),
            state_id: state_id.into(),
        }
    }
}

/// One state cell: a declaration scoped to a user key and window.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StateId {
    pub link: LinkId,
    pub key: Vec<u8>,
    pub window: Window,
}

/// A mutation requested by a worker.
///
/// Appended `data` may hold several concatenated encoded values; they are
/// split with the declaration's value decoder before being stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateWrite {
    BagAppend {
        id: StateId,
        data: Vec<u8>,
    },
    BagClear {
        id: StateId,
    },
    MultimapAppend {
        id: StateId,
        user_key: Vec<u8>,
        data: Vec<u8>,
    },
    MultimapRemove {
        id: StateId,
        user_key: Vec<u8>,
    },
    MultimapClear {
        id: StateId,
    },
}

impl StateWrite {
    pub fn id(&self) -> &StateId {
        match self {
            StateWrite::BagAppend { id, .. }
            | StateWrite::BagClear { id }
            | StateWrite::MultimapAppend { id, .. }
            | StateWrite::MultimapRemove { id, .. }
            | StateWrite::MultimapClear { id } => id,
        }
    }
}

/// Read-only view of the state cells of a bundle's keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub bags: BTreeMap<StateId, Vec<Vec<u8>>>,
    pub multimaps: BTreeMap<StateId, BTreeMap<Vec<u8>, Vec<Vec<u8>>>>,
}

impl StateSnapshot {
    /// Values of a bag cell; empty if it was never written.
    pub fn bag(&self, id: &StateId) -> &[Vec<u8>] {
        self.bags.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    /// Values under `user_key` in a multimap cell.
    pub fn multimap_get(&self, id: &StateId, user_key: &[u8]) -> &[Vec<u8>] {
        self.multimaps
            .get(id)
            .and_then(|m| m.get(user_key))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// User keys present in a multimap cell, in byte order.
    pub fn multimap_keys(&self, id: &StateId) -> Vec<&[u8]> {
        self.multimaps
            .get(id)
            .map(|m| m.keys().map(Vec::as_slice).collect())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.bags.is_empty() && self.multimaps.is_empty()
    }

    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        bincode::serialize(self).context("failed to serialize state snapshot")
    }

    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        bincode::deserialize(bytes).context("failed to deserialize state snapshot")
    }
}

#[cfg(test)]
#[path = "tests/hashmap_tests.rs"]
mod tests;
