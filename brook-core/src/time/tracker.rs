use super::*;

/// Tracks the output watermark of every upstream producer of a stage and
/// computes the stage's input watermark as their minimum.
///
/// A stage can only advance its event-time clock to the minimum of all
/// producers, because a lagging producer might still emit elements with
/// earlier timestamps. Side-input producers count as channels too.
///
/// A tracker with no channels belongs to a source stage; its input watermark
/// is [`MAX_TIMESTAMP`] from the start, so only the stage's own holds keep its
/// output back.
#[derive(Debug, Clone)]
pub struct WatermarkTracker {
    /// Per-channel last-seen watermark. Starts at `MIN_TIMESTAMP`.
    channel_watermarks: Vec<EventTime>,
    /// The minimum last handed to the stage.
    current_min: EventTime,
}

impl WatermarkTracker {
    /// Create a tracker for `num_channels` upstream producers.
    pub fn new(num_channels: usize) -> Self {
        let mut tracker = Self {
            channel_watermarks: vec![MIN_TIMESTAMP; num_channels],
            current_min: MIN_TIMESTAMP,
        };
        tracker.current_min = tracker.compute_min();
        tracker
    }

    /// Notify the tracker that `channel_id` reported a new watermark.
    ///
    /// Returns `Some(watermark)` if the minimum advanced, `None` otherwise.
    /// A channel reporting below the current minimum is clamped to it, so the
    /// input watermark never regresses.
    pub fn advance(&mut self, channel_id: usize, watermark: Watermark) -> Option<Watermark> {
        let slot = &mut self.channel_watermarks[channel_id];
        *slot = (*slot).max(watermark.timestamp.max(self.current_min));
        let new_min = self.compute_min();
        if new_min > self.current_min {
            self.current_min = new_min;
            Some(Watermark::new(new_min))
        } else {
            None
        }
    }

    pub fn num_channels(&self) -> usize {
        self.channel_watermarks.len()
    }

    /// Return the current input watermark.
    pub fn current_min_timestamp(&self) -> EventTime {
        self.current_min
    }

    /// `MAX_TIMESTAMP` when there are no channels.
    fn compute_min(&self) -> EventTime {
        self.channel_watermarks
            .iter()
            .copied()
            .min()
            .unwrap_or(MAX_TIMESTAMP)
    }
}
