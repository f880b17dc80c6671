use super::*;

/// A window an element belongs to.
///
/// Windows are value types: two elements share a window exactly when their
/// `Window`s compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Window {
    /// The single window spanning all of time.
    Global,
    /// A half-open event-time window `[start, end)`.
    Interval { start: EventTime, end: EventTime },
}

impl Window {
    pub fn interval(start: EventTime, end: EventTime) -> Self {
        Window::Interval { start, end }
    }

    /// The maximum timestamp that belongs to this window.
    /// A window's on-time pane fires once the input watermark reaches it.
    pub fn max_timestamp(&self) -> EventTime {
        match self {
            Window::Global => END_OF_GLOBAL_WINDOW,
            Window::Interval { end, .. } => end.saturating_sub(1),
        }
    }

    /// Return true if `timestamp` falls inside this window.
    pub fn contains(&self, timestamp: EventTime) -> bool {
        match self {
            Window::Global => true,
            Window::Interval { start, end } => timestamp >= *start && timestamp < *end,
        }
    }

    /// Time after which the window's state may be discarded.
    ///
    /// Saturates instead of overflowing, so windows near the end of time with
    /// large allowed lateness collapse onto [`MAX_TIMESTAMP`].
    pub fn gc_time(&self, allowed_lateness: EventTime) -> EventTime {
        self.max_timestamp()
            .saturating_add(allowed_lateness.max(0))
            .min(MAX_TIMESTAMP)
    }

    /// True when the input watermark has passed the window's garbage collection time.
    pub fn is_expired(&self, watermark: EventTime, allowed_lateness: EventTime) -> bool {
        watermark >= MAX_TIMESTAMP || watermark > self.gc_time(allowed_lateness)
    }
}

impl std::fmt::Display for Window {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Window::Global => f.write_str("GlobalWindow"),
            Window::Interval { start, end } => write!(f, "IntervalWindow([{}, {}))", start, end),
        }
    }
}

/// When a pane fired relative to the watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaneTiming {
    Early = 0,
    OnTime = 1,
    Late = 2,
    Unknown = 3,
}

impl PaneTiming {
    pub(crate) fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0 => PaneTiming::Early,
            1 => PaneTiming::OnTime,
            2 => PaneTiming::Late,
            _ => PaneTiming::Unknown,
        }
    }
}

/// Describes one trigger firing of a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PaneInfo {
    pub is_first: bool,
    pub is_last: bool,
    pub timing: PaneTiming,
    pub index: i64,
    /// Index among on-time and late panes; -1 for early panes.
    pub non_speculative_index: i64,
}

impl PaneInfo {
    /// The pane of an element that was never produced by a trigger.
    pub fn no_firing() -> Self {
        Self {
            is_first: true,
            is_last: true,
            timing: PaneTiming::Unknown,
            index: 0,
            non_speculative_index: 0,
        }
    }
}

impl Default for PaneInfo {
    fn default() -> Self {
        Self::no_firing()
    }
}
