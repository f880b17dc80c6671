use super::*;

/// Multiset of timestamps at which a stage holds back its output watermark.
///
/// Pending and in-flight elements, fired panes awaiting their bundle,
/// event-time timers and buffered aggregation state each add a hold; the
/// stage's output watermark is capped by the smallest one.
#[derive(Debug, Clone, Default)]
pub struct HoldTracker {
    holds: BTreeMap<EventTime, usize>,
    len: usize,
}

impl HoldTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, ts: EventTime) {
        *self.holds.entry(ts).or_default() += 1;
        self.len += 1;
    }

    /// Release one hold at `ts`. Returns false if none was held there.
    pub fn release(&mut self, ts: EventTime) -> bool {
        let Some(count) = self.holds.get_mut(&ts) else {
            return false;
        };
        *count -= 1;
        if *count == 0 {
            self.holds.remove(&ts);
        }
        self.len -= 1;
        true
    }

    /// The earliest hold, if any.
    pub fn min(&self) -> Option<EventTime> {
        self.holds.keys().next().copied()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Compute a stage's next output watermark.
///
/// `min(input, earliest hold)`, never below the previous value.
pub fn output_watermark(previous: EventTime, input: EventTime, holds: &HoldTracker) -> EventTime {
    let bound = holds.min().map_or(input, |h| h.min(input));
    previous.max(bound)
}

/// Source of processing time for timers.
///
/// Pipelines driven by a test stream use a synthetic clock that only moves
/// when the script advances it (or when the engine is idle and jumps it to
/// the next timer); all others follow the wall clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingClock {
    WallClock,
    Synthetic { now: EventTime },
}

impl ProcessingClock {
    pub fn synthetic() -> Self {
        ProcessingClock::Synthetic { now: 0 }
    }

    pub fn is_synthetic(&self) -> bool {
        matches!(self, ProcessingClock::Synthetic { .. })
    }

    /// Current processing time in milliseconds since the epoch.
    pub fn now(&self) -> EventTime {
        match self {
            ProcessingClock::WallClock => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as EventTime)
                .unwrap_or(0),
            ProcessingClock::Synthetic { now } => *now,
        }
    }

    /// Advance a synthetic clock by `millis`; `MAX_TIMESTAMP` or more moves it
    /// to the end of time. No-op on the wall clock.
    pub fn advance(&mut self, millis: EventTime) {
        if let ProcessingClock::Synthetic { now } = self {
            *now = if millis >= MAX_TIMESTAMP {
                MAX_TIMESTAMP
            } else {
                now.saturating_add(millis.max(0)).min(MAX_TIMESTAMP)
            };
        }
    }

    /// Move a synthetic clock forward to `ts`. Never moves it backward.
    pub fn jump_to(&mut self, ts: EventTime) {
        if let ProcessingClock::Synthetic { now } = self {
            *now = (*now).max(ts);
        }
    }

    /// How long until `ts` is reached on the wall clock. `None` for synthetic
    /// clocks, which never move by themselves.
    pub fn until(&self, ts: EventTime) -> Option<Duration> {
        match self {
            ProcessingClock::WallClock => {
                Some(Duration::from_millis(ts.saturating_sub(self.now()).max(0) as u64))
            }
            ProcessingClock::Synthetic { .. } => None,
        }
    }
}
