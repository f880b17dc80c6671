//! # Time
//!
//! Watermark bookkeeping for the element manager: the minimum over upstream
//! producers, the holds a stage asserts on its own output, the processing
//! clock, and the per-stage timer queues.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::types::{EventTime, MAX_TIMESTAMP, MIN_TIMESTAMP, Watermark};
use crate::window::Window;

mod timer_service;
mod tracker;
mod watermark;

pub use timer_service::*;
pub use tracker::*;
pub use watermark::*;

#[cfg(test)]
#[path = "tests/time_tests.rs"]
mod tests;
