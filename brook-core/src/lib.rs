//! # Brook Core
//!
//! A single-process engine for portable dataflow pipelines: watermark-driven
//! progress, per-window triggers, keyed state and timers, and bounded-parallel
//! bundle execution.
//!
//! - [`pipeline`]: prost messages of the portable pipeline graph, plus a builder.
//! - [`coder`]: windowed-value, window and pane encodings; element decoders.
//! - [`window`]: windows, window functions, pane info and the trigger engine.
//! - [`time`]: watermark trackers, holds, timers and processing clocks.
//! - [`state`]: keyed user state.
//! - [`engine`]: the [`ElementManager`](engine::ElementManager), which owns
//!   every stage's pending work and hands out ready bundles.
//! - [`graph`]: preprocessing of a pipeline into an
//!   [`ExecutionPlan`](graph::ExecutionPlan).
//! - [`runtime`]: bundle execution against [`Worker`](runtime::Worker)s.
//! - [`job`]: job lifecycle and [`run_pipeline`](job::run_pipeline).

pub mod coder;
pub mod engine;
pub mod error;
pub mod graph;
pub mod job;
pub mod pipeline;
pub mod runtime;
pub mod state;
pub mod time;
pub mod types;
pub mod window;
