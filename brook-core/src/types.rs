use serde::{Deserialize, Serialize};

use crate::window::{PaneInfo, Window};

/// Event time in milliseconds since epoch.
pub type EventTime = i64;

/// Smallest representable element timestamp. Also the initial watermark.
pub const MIN_TIMESTAMP: EventTime = i64::MIN / 1000;

/// Terminal watermark value: no more data will ever arrive.
pub const MAX_TIMESTAMP: EventTime = i64::MAX / 1000;

/// Maximum timestamp of the global window, one day before [`MAX_TIMESTAMP`].
pub const END_OF_GLOBAL_WINDOW: EventTime = MAX_TIMESTAMP - 86_400_000;

/// Clamp an arbitrary millisecond value into the representable timestamp range.
pub fn clamp_timestamp(ts: i64) -> EventTime {
    ts.clamp(MIN_TIMESTAMP, MAX_TIMESTAMP)
}

/// Index of a stage inside the element manager's stage arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StageId(pub usize);

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Watermark indicates that no elements with timestamp <= this value will arrive.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Watermark {
    pub timestamp: EventTime,
}

impl Watermark {
    /// Create a new watermark at the given timestamp.
    pub fn new(timestamp: EventTime) -> Self {
        Self { timestamp }
    }

    /// True once the watermark reached the terminal value.
    pub fn is_final(&self) -> bool {
        self.timestamp >= MAX_TIMESTAMP
    }
}

impl std::fmt::Display for Watermark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.timestamp {
            t if t >= MAX_TIMESTAMP => f.write_str("Watermark(+inf)"),
            t if t <= MIN_TIMESTAMP => f.write_str("Watermark(-inf)"),
            t => write!(f, "Watermark({}ms)", t),
        }
    }
}

/// Time domain of a timer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimeDomain {
    EventTime,
    ProcessingTime,
}

/// A single windowed element as held by the engine.
///
/// The value stays encoded; only the parts the engine needs for scheduling
/// (window, timestamp, pane, key) are decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub window: Window,
    pub timestamp: EventTime,
    pub pane: PaneInfo,
    /// Timestamp at which this element holds its stage's output watermark.
    pub hold: EventTime,
    /// Encoded value bytes (without the windowed-value header).
    pub elm_bytes: Vec<u8>,
    /// Encoded key bytes, present for KV-typed collections.
    pub key_bytes: Option<Vec<u8>>,
    /// Arrival order, used as a deterministic tie breaker.
    pub sequence: u64,
}

impl Element {
    /// Create an element in `window` at `timestamp` that holds at its own timestamp.
    pub fn new(window: Window, timestamp: EventTime, elm_bytes: Vec<u8>) -> Self {
        Self {
            window,
            timestamp,
            pane: PaneInfo::no_firing(),
            hold: timestamp,
            elm_bytes,
            key_bytes: None,
            sequence: 0,
        }
    }

    /// Attach encoded key bytes.
    pub fn with_key(mut self, key_bytes: Vec<u8>) -> Self {
        self.key_bytes = Some(key_bytes);
        self
    }

    /// Attach pane information.
    pub fn with_pane(mut self, pane: PaneInfo) -> Self {
        self.pane = pane;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_constants_are_ordered() {
        assert!(MIN_TIMESTAMP < 0);
        assert!(END_OF_GLOBAL_WINDOW < MAX_TIMESTAMP);
        assert_eq!(MAX_TIMESTAMP - END_OF_GLOBAL_WINDOW, 86_400_000);
    }

    #[test]
    fn test_clamp_timestamp() {
        assert_eq!(clamp_timestamp(i64::MAX), MAX_TIMESTAMP);
        assert_eq!(clamp_timestamp(i64::MIN), MIN_TIMESTAMP);
        assert_eq!(clamp_timestamp(42), 42);
    }

    #[test]
    fn test_watermark_display() {
        assert_eq!(Watermark::new(MAX_TIMESTAMP).to_string(), "Watermark(+inf)");
        assert_eq!(Watermark::new(MIN_TIMESTAMP).to_string(), "Watermark(-inf)");
        assert_eq!(Watermark::new(10).to_string(), "Watermark(10ms)");
        assert!(Watermark::new(MAX_TIMESTAMP).is_final());
    }

    #[test]
    fn test_element_builders() {
        let e = Element::new(Window::Global, 5, vec![1, 2]).with_key(vec![9]);
        assert_eq!(e.hold, 5);
        assert_eq!(e.key_bytes, Some(vec![9]));
        assert_eq!(e.pane, PaneInfo::no_firing());
    }
}
