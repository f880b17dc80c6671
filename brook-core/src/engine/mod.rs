//! # Element manager
//!
//! The engine's single source of truth for a running pipeline: every stage's
//! pending elements, watermarks, holds, aggregation windows, timers and keyed
//! state live here behind one mutex.
//!
//! ## Life of a bundle
//!
//! 1. Data arrives at a stage (injected by an impulse or test stream, or
//!    routed from a persisted bundle) and adds a watermark hold.
//! 2. The bundle loop started by [`ElementManager::bundles`] picks ready work
//!    per stage, marks it in flight and sends a [`ReadyBundle`].
//! 3. The executor fetches the payload with [`ElementManager::input_for_bundle`]
//!    and runs it.
//! 4. [`ElementManager::persist_bundle`] routes outputs downstream, applies
//!    timers and state, releases the holds and refreshes watermarks.
//!    [`ElementManager::fail_bundle`] instead puts everything back.
//!
//! ## Watermarks
//!
//! A stage's input watermark is the minimum output watermark of the stages
//! producing its main and side inputs. Its output watermark is
//! `max(previous, min(input, earliest hold))`. Changes propagate through an
//! ordered refresh set until nothing moves.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

use crate::coder::{ElementDecoder, PColInfo};
use crate::error::EngineError;
use crate::pipeline;
use crate::state::{HashMapStateBackend, LinkId, StateSnapshot, StateWrite};
use crate::time::{
    HoldTracker, PendingTimer, ProcessingClock, TimerKey, TimerService, WatermarkTracker,
    output_watermark,
};
use crate::types::{
    Element, EventTime, MAX_TIMESTAMP, MIN_TIMESTAMP, StageId, TimeDomain, Watermark,
};
use crate::window::{PaneInfo, PaneTiming, Trigger, TriggerEvent, TriggerState, Window};

mod aggregate;
mod manager;
mod stage_state;
mod teststream;

pub use manager::ElementManager;
pub use teststream::TestStreamBuilder;

use aggregate::AggregateState;
use stage_state::{InFlight, StageState};
use teststream::TestStreamHandler;

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;

#[cfg(test)]
#[path = "tests/aggregate_tests.rs"]
mod aggregate_tests;

// ── Configuration ─────────────────────────────────────────────────────────────

/// Tuning knobs of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Upper bound on bundles handed out and not yet persisted or failed.
    pub max_in_flight_bundles: usize,
    /// Failed attempts of the same work tolerated before the run fails.
    pub max_bundle_retries: usize,
    /// Keep every output watermark change for later inspection.
    pub record_watermarks: bool,
    /// Real-time clock mode requested through the `prism_enable_rtc`
    /// experiment. Recorded only; scheduling ignores it.
    pub enable_rtc: bool,
}

/// Pipeline experiment that sets [`EngineConfig::enable_rtc`].
pub const ENABLE_RTC_EXPERIMENT: &str = "prism_enable_rtc";

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_in_flight_bundles: 8,
            max_bundle_retries: 3,
            record_watermarks: false,
            enable_rtc: false,
        }
    }
}

impl EngineConfig {
    /// Apply the pipeline experiments the engine understands. Unknown ones
    /// are ignored.
    pub fn with_experiments<S: AsRef<str>>(mut self, experiments: &[S]) -> Self {
        if experiments.iter().any(|e| e.as_ref() == ENABLE_RTC_EXPERIMENT) {
            self.enable_rtc = true;
        }
        self
    }
}

// ── Windowing strategy ────────────────────────────────────────────────────────

/// Whether fired panes keep their elements for the next pane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Accumulation {
    Discarding,
    Accumulating,
}

/// Timestamp given to a fired pane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputTimePolicy {
    EndOfWindow,
    EarliestInPane,
    LatestInPane,
}

/// Windowing strategy of an aggregating stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WinStrat {
    /// Milliseconds past the end of a window during which late data is kept.
    pub allowed_lateness: EventTime,
    pub accumulation: Accumulation,
    pub trigger: Trigger,
    pub output_time: OutputTimePolicy,
}

impl Default for WinStrat {
    fn default() -> Self {
        Self {
            allowed_lateness: 0,
            accumulation: Accumulation::Discarding,
            trigger: Trigger::Default,
            output_time: OutputTimePolicy::EndOfWindow,
        }
    }
}

impl TryFrom<&pipeline::WindowingStrategy> for WinStrat {
    type Error = EngineError;

    fn try_from(ws: &pipeline::WindowingStrategy) -> Result<Self, Self::Error> {
        let trigger = match &ws.trigger {
            Some(t) => Trigger::try_from(t)?,
            None => Trigger::Default,
        };
        let accumulation = match ws.accumulation_mode() {
            pipeline::AccumulationMode::Accumulating => Accumulation::Accumulating,
            pipeline::AccumulationMode::Retracting => {
                return Err(EngineError::malformed("retracting accumulation mode"));
            }
            _ => Accumulation::Discarding,
        };
        let output_time = match ws.output_time() {
            pipeline::OutputTime::EarliestInPane => OutputTimePolicy::EarliestInPane,
            pipeline::OutputTime::LatestInPane => OutputTimePolicy::LatestInPane,
            _ => OutputTimePolicy::EndOfWindow,
        };
        Ok(Self {
            allowed_lateness: ws.allowed_lateness.max(0),
            accumulation,
            trigger,
            output_time,
        })
    }
}

// ── Stage registration ────────────────────────────────────────────────────────

/// A side input consumed by a stage.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SideInputRef {
    pub transform_id: String,
    /// Local input name on the transform.
    pub local_id: String,
    pub pcollection: String,
}

/// The timer family a transform wants fired when a window's state expires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnWindowExpiration {
    pub transform_id: String,
    pub family: String,
}

// ── Bundles ───────────────────────────────────────────────────────────────────

/// A unit of work handed to the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyBundle {
    pub stage: StageId,
    pub instruction_id: String,
    /// The stage's input watermark when the bundle was cut.
    pub watermark: EventTime,
}

/// A timer being delivered to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiredTimer {
    pub transform_id: String,
    pub family: String,
    pub tag: String,
    pub key: Vec<u8>,
    pub window: Window,
    pub domain: TimeDomain,
    pub fire: EventTime,
    pub hold: EventTime,
}

impl FiredTimer {
    fn from_pending(t: PendingTimer, domain: TimeDomain) -> Self {
        Self {
            transform_id: t.key.transform_id,
            family: t.key.family,
            tag: t.key.tag,
            key: t.key.key,
            window: t.key.window,
            domain,
            fire: t.fire,
            hold: t.hold,
        }
    }

    fn timer_key(&self) -> TimerKey {
        TimerKey {
            transform_id: self.transform_id.clone(),
            family: self.family.clone(),
            tag: self.tag.clone(),
            key: self.key.clone(),
            window: self.window,
        }
    }
}

/// One fired pane of an aggregating stage: every value of `key` in `window`
/// that the pane covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiredPane {
    pub key: Vec<u8>,
    pub window: Window,
    /// Output timestamp chosen by the stage's output-time policy.
    pub timestamp: EventTime,
    pub pane: PaneInfo,
    /// Encoded values with the key stripped.
    pub values: Vec<Vec<u8>>,
}

/// Everything a side input has received so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SideInputData {
    pub input: SideInputRef,
    pub elements: Vec<Element>,
}

/// The payload of an in-flight bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleInput {
    pub stage: StageId,
    /// Main input elements, in arrival order.
    pub elements: Vec<Element>,
    pub panes: Vec<FiredPane>,
    pub timers: Vec<FiredTimer>,
    pub side_inputs: Vec<SideInputData>,
    pub state: StateSnapshot,
    pub processing_time: EventTime,
    pub watermark: EventTime,
}

/// A timer set or cleared by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerSet {
    pub transform_id: String,
    pub family: String,
    pub tag: String,
    pub key: Vec<u8>,
    pub window: Window,
    pub fire: EventTime,
    pub hold: EventTime,
    /// Delete instead of set.
    pub clear: bool,
}

impl TimerSet {
    fn timer_key(&self) -> TimerKey {
        TimerKey {
            transform_id: self.transform_id.clone(),
            family: self.family.clone(),
            tag: self.tag.clone(),
            key: self.key.clone(),
            window: self.window,
        }
    }
}

/// What a completed bundle produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BundleOutputs {
    /// Concatenated encoded windowed values per output PCollection.
    pub data: HashMap<String, Vec<u8>>,
    pub timers: Vec<TimerSet>,
    pub state_writes: Vec<StateWrite>,
}

/// What happens to a failed bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// The bundle's work was returned and will be scheduled again.
    Retry { attempt: usize },
    /// The stage failed more often than allowed; the run must fail.
    Exhausted { attempts: usize },
}

/// Generates `inst001`, `inst002`, ...
pub fn instruction_ids() -> impl FnMut() -> String + Send + 'static {
    let mut next = 0u64;
    move || {
        next += 1;
        format!("inst{next:03}")
    }
}
