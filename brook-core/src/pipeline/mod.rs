//! Portable pipeline graph messages.
//!
//! These are hand-declared `prost` messages that mirror the subset of the
//! portable pipeline protos the engine reads, with the same field tags, so a
//! serialized pipeline from any SDK decodes into them directly.

use std::collections::HashMap;

mod builder;
pub mod urns;

pub use builder::PipelineBuilder;

#[cfg(test)]
#[path = "tests/pipeline_tests.rs"]
mod tests;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Pipeline {
    #[prost(message, optional, tag = "1")]
    pub components: Option<Components>,
    #[prost(string, repeated, tag = "2")]
    pub root_transform_ids: Vec<String>,
    #[prost(string, repeated, tag = "4")]
    pub requirements: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Components {
    #[prost(map = "string, message", tag = "1")]
    pub transforms: HashMap<String, PTransform>,
    #[prost(map = "string, message", tag = "2")]
    pub pcollections: HashMap<String, PCollection>,
    #[prost(map = "string, message", tag = "3")]
    pub windowing_strategies: HashMap<String, WindowingStrategy>,
    #[prost(map = "string, message", tag = "4")]
    pub coders: HashMap<String, Coder>,
    #[prost(map = "string, message", tag = "5")]
    pub environments: HashMap<String, Environment>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FunctionSpec {
    #[prost(string, tag = "1")]
    pub urn: String,
    #[prost(bytes = "vec", tag = "3")]
    pub payload: Vec<u8>,
}

impl FunctionSpec {
    pub fn new(urn: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            urn: urn.into(),
            payload,
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PTransform {
    #[prost(message, optional, tag = "1")]
    pub spec: Option<FunctionSpec>,
    #[prost(string, repeated, tag = "2")]
    pub subtransforms: Vec<String>,
    /// Local input name to PCollection id.
    #[prost(map = "string, string", tag = "3")]
    pub inputs: HashMap<String, String>,
    /// Local output tag to PCollection id.
    #[prost(map = "string, string", tag = "4")]
    pub outputs: HashMap<String, String>,
    #[prost(string, tag = "5")]
    pub unique_name: String,
    #[prost(string, tag = "7")]
    pub environment_id: String,
}

impl PTransform {
    /// The transform's URN, or the empty string for composites without a spec.
    pub fn urn(&self) -> &str {
        self.spec.as_ref().map(|s| s.urn.as_str()).unwrap_or_default()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum IsBounded {
    Unspecified = 0,
    Unbounded = 1,
    Bounded = 2,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PCollection {
    #[prost(string, tag = "1")]
    pub unique_name: String,
    #[prost(string, tag = "2")]
    pub coder_id: String,
    #[prost(enumeration = "IsBounded", tag = "3")]
    pub is_bounded: i32,
    #[prost(string, tag = "4")]
    pub windowing_strategy_id: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MergeStatus {
    Unspecified = 0,
    NonMerging = 1,
    NeedsMerge = 2,
    AlreadyMerged = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum AccumulationMode {
    Unspecified = 0,
    Discarding = 1,
    Accumulating = 2,
    Retracting = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum OutputTime {
    Unspecified = 0,
    EndOfWindow = 1,
    LatestInPane = 2,
    EarliestInPane = 3,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WindowingStrategy {
    #[prost(message, optional, tag = "1")]
    pub window_fn: Option<FunctionSpec>,
    #[prost(enumeration = "MergeStatus", tag = "2")]
    pub merge_status: i32,
    #[prost(string, tag = "3")]
    pub window_coder_id: String,
    #[prost(message, optional, tag = "4")]
    pub trigger: Option<Trigger>,
    #[prost(enumeration = "AccumulationMode", tag = "5")]
    pub accumulation_mode: i32,
    #[prost(enumeration = "OutputTime", tag = "6")]
    pub output_time: i32,
    /// Milliseconds.
    #[prost(int64, tag = "8")]
    pub allowed_lateness: i64,
    #[prost(bool, tag = "10")]
    pub assigns_to_one_window: bool,
    #[prost(string, tag = "11")]
    pub environment_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Coder {
    #[prost(message, optional, tag = "1")]
    pub spec: Option<FunctionSpec>,
    #[prost(string, repeated, tag = "2")]
    pub component_coder_ids: Vec<String>,
}

impl Coder {
    pub fn urn(&self) -> &str {
        self.spec.as_ref().map(|s| s.urn.as_str()).unwrap_or_default()
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Environment {
    #[prost(string, tag = "2")]
    pub urn: String,
    #[prost(bytes = "vec", tag = "3")]
    pub payload: Vec<u8>,
}

// ── Triggers ──────────────────────────────────────────────────────────────────

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Trigger {
    #[prost(oneof = "trigger::Kind", tags = "1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12")]
    pub kind: Option<trigger::Kind>,
}

pub mod trigger {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct AfterAll {
        #[prost(message, repeated, tag = "1")]
        pub subtriggers: Vec<super::Trigger>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct AfterAny {
        #[prost(message, repeated, tag = "1")]
        pub subtriggers: Vec<super::Trigger>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct AfterEach {
        #[prost(message, repeated, tag = "1")]
        pub subtriggers: Vec<super::Trigger>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct AfterEndOfWindow {
        #[prost(message, optional, tag = "1")]
        pub early_firings: Option<Box<super::Trigger>>,
        #[prost(message, optional, tag = "2")]
        pub late_firings: Option<Box<super::Trigger>>,
    }

    /// Timestamp transforms are not read; the trigger is rejected anyway.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct AfterProcessingTime {}

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct AfterSynchronizedProcessingTime {}

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Default {}

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ElementCount {
        #[prost(int32, tag = "1")]
        pub element_count: i32,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Never {}

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Always {}

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct OrFinally {
        #[prost(message, optional, tag = "1")]
        pub main: Option<Box<super::Trigger>>,
        #[prost(message, optional, tag = "2")]
        pub finally: Option<Box<super::Trigger>>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Repeat {
        #[prost(message, optional, tag = "1")]
        pub subtrigger: Option<Box<super::Trigger>>,
    }

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "1")]
        AfterAll(AfterAll),
        #[prost(message, tag = "2")]
        AfterAny(AfterAny),
        #[prost(message, tag = "3")]
        AfterEach(AfterEach),
        #[prost(message, tag = "4")]
        AfterEndOfWindow(AfterEndOfWindow),
        #[prost(message, tag = "5")]
        AfterProcessingTime(AfterProcessingTime),
        #[prost(message, tag = "6")]
        AfterSynchronizedProcessingTime(AfterSynchronizedProcessingTime),
        #[prost(message, tag = "7")]
        Default(Default),
        #[prost(message, tag = "8")]
        ElementCount(ElementCount),
        #[prost(message, tag = "9")]
        Never(Never),
        #[prost(message, tag = "10")]
        OrFinally(OrFinally),
        #[prost(message, tag = "11")]
        Repeat(Repeat),
        #[prost(message, tag = "12")]
        Always(Always),
    }
}

// ── Transform payloads ────────────────────────────────────────────────────────

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ParDoPayload {
    #[prost(message, optional, tag = "1")]
    pub do_fn: Option<FunctionSpec>,
    #[prost(map = "string, message", tag = "3")]
    pub side_inputs: HashMap<String, SideInput>,
    #[prost(map = "string, message", tag = "4")]
    pub state_specs: HashMap<String, StateSpec>,
    #[prost(map = "string, message", tag = "9")]
    pub timer_family_specs: HashMap<String, TimerFamilySpec>,
    #[prost(string, tag = "12")]
    pub on_window_expiration_timer_family_spec: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SideInput {
    #[prost(message, optional, tag = "1")]
    pub access_pattern: Option<FunctionSpec>,
    #[prost(message, optional, tag = "2")]
    pub view_fn: Option<FunctionSpec>,
    #[prost(message, optional, tag = "3")]
    pub window_mapping_fn: Option<FunctionSpec>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StateSpec {
    #[prost(oneof = "state_spec::Spec", tags = "1, 2, 3, 4, 5, 8")]
    pub spec: Option<state_spec::Spec>,
}

pub mod state_spec {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ReadModifyWrite {
        #[prost(string, tag = "1")]
        pub coder_id: String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Bag {
        #[prost(string, tag = "1")]
        pub element_coder_id: String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Combining {
        #[prost(string, tag = "1")]
        pub accumulator_coder_id: String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Map {
        #[prost(string, tag = "1")]
        pub key_coder_id: String,
        #[prost(string, tag = "2")]
        pub value_coder_id: String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Set {
        #[prost(string, tag = "1")]
        pub element_coder_id: String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Multimap {
        #[prost(string, tag = "1")]
        pub key_coder_id: String,
        #[prost(string, tag = "2")]
        pub value_coder_id: String,
    }

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Spec {
        #[prost(message, tag = "1")]
        ReadModifyWrite(ReadModifyWrite),
        #[prost(message, tag = "2")]
        Bag(Bag),
        #[prost(message, tag = "3")]
        Combining(Combining),
        #[prost(message, tag = "4")]
        Map(Map),
        #[prost(message, tag = "5")]
        Set(Set),
        #[prost(message, tag = "8")]
        Multimap(Multimap),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum TimeDomain {
    Unspecified = 0,
    EventTime = 1,
    ProcessingTime = 2,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TimerFamilySpec {
    #[prost(enumeration = "TimeDomain", tag = "1")]
    pub time_domain: i32,
    #[prost(string, tag = "2")]
    pub timer_family_coder_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WindowIntoPayload {
    #[prost(message, optional, tag = "1")]
    pub window_fn: Option<FunctionSpec>,
}

/// Payload of the fixed-windows function, in milliseconds.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FixedWindowsPayload {
    #[prost(int64, tag = "1")]
    pub size_millis: i64,
    #[prost(int64, tag = "2")]
    pub offset_millis: i64,
}

/// Payload of the sliding-windows function, in milliseconds.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SlidingWindowsPayload {
    #[prost(int64, tag = "1")]
    pub size_millis: i64,
    #[prost(int64, tag = "2")]
    pub period_millis: i64,
    #[prost(int64, tag = "3")]
    pub offset_millis: i64,
}

// ── TestStream ────────────────────────────────────────────────────────────────

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TestStreamPayload {
    #[prost(string, tag = "1")]
    pub coder_id: String,
    #[prost(message, repeated, tag = "2")]
    pub events: Vec<test_stream_payload::Event>,
}

pub mod test_stream_payload {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Event {
        #[prost(oneof = "event::Kind", tags = "1, 2, 3")]
        pub kind: Option<event::Kind>,
    }

    pub mod event {
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct AdvanceWatermark {
            #[prost(int64, tag = "1")]
            pub new_watermark: i64,
            #[prost(string, tag = "2")]
            pub tag: String,
        }

        /// Relative advance in milliseconds.
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct AdvanceProcessingTime {
            #[prost(int64, tag = "1")]
            pub advance_duration: i64,
        }

        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct AddElements {
            #[prost(message, repeated, tag = "1")]
            pub elements: Vec<super::TimestampedElement>,
            #[prost(string, tag = "3")]
            pub tag: String,
        }

        #[derive(Clone, PartialEq, ::prost::Oneof)]
        pub enum Kind {
            #[prost(message, tag = "1")]
            WatermarkEvent(AdvanceWatermark),
            #[prost(message, tag = "2")]
            ProcessingTimeEvent(AdvanceProcessingTime),
            #[prost(message, tag = "3")]
            ElementEvent(AddElements),
        }
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct TimestampedElement {
        #[prost(bytes = "vec", tag = "1")]
        pub encoded_element: Vec<u8>,
        #[prost(int64, tag = "2")]
        pub timestamp: i64,
    }
}
