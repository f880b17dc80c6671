//! # Graph preprocessing
//!
//! Turns a portable [`pipeline::Pipeline`] into an [`ExecutionPlan`]: one
//! stage per leaf transform, in topological order, plus the decoding metadata
//! of every PCollection a stage touches.
//!
//! Everything that can be rejected up front is rejected here: unknown
//! references, environments nothing can run, merging window functions and
//! processing-time triggers. A plan that preprocessed cleanly registers with
//! the [`ElementManager`] without further validation.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result};
use prost::Message;
use serde::{Deserialize, Serialize};

use crate::coder::{CoderRegistry, ElementDecoder, PColInfo, encode_length_prefixed};
use crate::engine::{ElementManager, OnWindowExpiration, SideInputRef, WinStrat};
use crate::error::EngineError;
use crate::pipeline::{self, urns};
use crate::state::LinkId;
use crate::types::{EventTime, MAX_TIMESTAMP, StageId};
use crate::window::{Trigger, WindowFn};

mod plan;
mod preprocess;

pub use plan::*;
pub use preprocess::*;

#[cfg(test)]
#[path = "tests/graph_tests.rs"]
mod tests;
