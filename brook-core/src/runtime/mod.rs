//! # Bundle execution
//!
//! Pulls ready bundles from the [`ElementManager`] and runs them with bounded
//! concurrency. Runner-native stages (flatten, window into, group by key) are
//! executed in-process; every other stage is handed to the [`Worker`]
//! registered for its environment.
//!
//! ```text
//! ElementManager::bundles ──> Executor ──> native stage | Worker
//!          ^                                     │
//!          └──── persist_bundle / fail_bundle ───┘
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::coder::{PColInfo, encode_grouped_value, encode_windowed_value};
use crate::engine::{
    BundleInput, BundleOutputs, ElementManager, FailureDisposition, FiredTimer, ReadyBundle,
    TimerSet, instruction_ids,
};
use crate::error::EngineError;
use crate::graph::{ExecutionPlan, StageDescriptor, StageOp};
use crate::state::{StateSnapshot, StateWrite};
use crate::types::{EventTime, StageId};

mod executor;
mod stage;
mod worker;

pub use executor::*;
pub use stage::*;
pub use worker::*;

#[cfg(test)]
#[path = "tests/runtime_tests.rs"]
mod tests;
