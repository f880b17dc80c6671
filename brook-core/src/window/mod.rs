use std::time::Duration;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::pipeline::{self, urns};
use crate::types::{END_OF_GLOBAL_WINDOW, EventTime, MAX_TIMESTAMP};

mod assigners;
mod primitives;
mod triggers;

pub use assigners::*;
pub use primitives::*;
pub use triggers::*;

#[cfg(test)]
#[path = "tests/window_tests.rs"]
mod tests;

#[cfg(test)]
#[path = "tests/trigger_tests.rs"]
mod trigger_tests;
