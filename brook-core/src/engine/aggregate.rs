use super::*;

/// Buffered data and trigger progress of one (window, key).
#[derive(Debug)]
struct WindowState {
    /// Elements of the next pane. In accumulating mode this also keeps the
    /// elements of every earlier pane.
    buffer: Vec<Element>,
    /// Elements added since the last pane.
    unfired: usize,
    trigger: TriggerState,
    pane_index: i64,
    non_speculative_index: i64,
    on_time_fired: bool,
    /// The trigger finished; later data for this window is dropped.
    closed: bool,
    /// Watermark hold covering the unfired elements.
    hold: Option<EventTime>,
}

impl WindowState {
    fn new(trigger: &Trigger) -> Self {
        Self {
            buffer: Vec::new(),
            unfired: 0,
            trigger: trigger.new_state(),
            pane_index: 0,
            non_speculative_index: 0,
            on_time_fired: false,
            closed: false,
            hold: None,
        }
    }

    fn unfired_elements(&self) -> &[Element] {
        &self.buffer[self.buffer.len() - self.unfired..]
    }

    fn set_hold(&mut self, hold: Option<EventTime>, holds: &mut HoldTracker) {
        if self.hold == hold {
            return;
        }
        if let Some(old) = self.hold.take() {
            holds.release(old);
        }
        if let Some(new) = hold {
            holds.add(new);
        }
        self.hold = hold;
    }
}

/// Windows and fired panes of a grouping stage.
///
/// Elements are absorbed as soon as they are routed to the stage; triggers are
/// polled per element and whenever the input watermark moves. Fired panes
/// queue in `ready` until a bundle takes them, each holding the stage's output
/// watermark at its output timestamp until that bundle is persisted.
#[derive(Debug)]
pub(crate) struct AggregateState {
    strat: WinStrat,
    windows: BTreeMap<(Window, Vec<u8>), WindowState>,
    ready: VecDeque<FiredPane>,
    last_watermark: EventTime,
    dropped: u64,
}

impl AggregateState {
    pub(crate) fn new(strat: WinStrat) -> Self {
        Self {
            strat,
            windows: BTreeMap::new(),
            ready: VecDeque::new(),
            last_watermark: MIN_TIMESTAMP,
            dropped: 0,
        }
    }

    /// Late elements dropped so far.
    pub(crate) fn dropped(&self) -> u64 {
        self.dropped
    }

    #[cfg(test)]
    pub(crate) fn open_windows(&self) -> usize {
        self.windows.len()
    }

    #[cfg(test)]
    pub(crate) fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Buffer one element and poll its window's trigger.
    pub(crate) fn add_element(
        &mut self,
        e: Element,
        watermark: EventTime,
        holds: &mut HoldTracker,
    ) {
        let key = e.key_bytes.clone().unwrap_or_default();
        let window = e.window;
        if window.is_expired(watermark, self.strat.allowed_lateness) {
            self.drop_late(&e, "expired");
            return;
        }
        let strat = &self.strat;
        let state = self
            .windows
            .entry((window, key.clone()))
            .or_insert_with(|| WindowState::new(&strat.trigger));
        if state.closed {
            self.drop_late(&e, "closed");
            return;
        }
        state.buffer.push(e);
        state.unfired += 1;
        let hold = pane_hold(strat, &window, state.unfired_elements());
        state.set_hold(hold, holds);

        let eow = watermark >= window.max_timestamp();
        let result = strat
            .trigger
            .evaluate(&mut state.trigger, TriggerEvent::elements(1, eow));
        if result.is_fire() {
            let pane = fire(strat, &key, &window, state, eow, result.is_finish(), holds);
            self.ready.extend(pane);
        }
    }

    /// Poll every window after the input watermark moved, then garbage
    /// collect expired windows, emitting a final pane for any unfired data.
    pub(crate) fn on_watermark(&mut self, watermark: EventTime, holds: &mut HoldTracker) {
        if watermark <= self.last_watermark {
            return;
        }
        self.last_watermark = watermark;
        let strat = &self.strat;
        let mut expired = Vec::new();
        for ((window, key), state) in self.windows.iter_mut() {
            let eow = watermark >= window.max_timestamp();
            let is_expired = window.is_expired(watermark, strat.allowed_lateness);
            if !state.closed {
                let result = strat
                    .trigger
                    .evaluate(&mut state.trigger, TriggerEvent::watermark(eow));
                if result.is_fire() {
                    let finish = result.is_finish() || is_expired;
                    let pane = fire(strat, key, window, state, eow, finish, holds);
                    self.ready.extend(pane);
                }
            }
            if is_expired {
                if !state.closed && state.unfired > 0 {
                    let pane = fire(strat, key, window, state, true, true, holds);
                    self.ready.extend(pane);
                }
                state.set_hold(None, holds);
                expired.push((*window, key.clone()));
            }
        }
        for id in expired {
            self.windows.remove(&id);
        }
    }

    /// Take the queued panes whose key is not busy, preserving fire order.
    pub(crate) fn take_ready(&mut self, busy: &BTreeSet<Vec<u8>>) -> Vec<FiredPane> {
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(self.ready.len());
        for pane in self.ready.drain(..) {
            if busy.contains(&pane.key) {
                kept.push_back(pane);
            } else {
                taken.push(pane);
            }
        }
        self.ready = kept;
        taken
    }

    /// Put the panes of a failed bundle back at the front of the queue.
    pub(crate) fn return_panes(&mut self, panes: Vec<FiredPane>) {
        for pane in panes.into_iter().rev() {
            self.ready.push_front(pane);
        }
    }

    fn drop_late(&mut self, e: &Element, reason: &str) {
        self.dropped += 1;
        tracing::debug!(
            "dropping late element at {} for {} window {}",
            e.timestamp,
            reason,
            e.window
        );
    }
}

/// The hold protecting a window's unfired elements.
fn pane_hold(strat: &WinStrat, window: &Window, unfired: &[Element]) -> Option<EventTime> {
    if unfired.is_empty() {
        return None;
    }
    match strat.output_time {
        OutputTimePolicy::EndOfWindow => Some(window.max_timestamp()),
        // The latest timestamp is not known until the pane fires.
        OutputTimePolicy::EarliestInPane | OutputTimePolicy::LatestInPane => {
            unfired.iter().map(|e| e.timestamp).min()
        }
    }
}

/// Emit a pane for a window whose trigger fired. Returns `None` when nothing
/// arrived since the last pane.
fn fire(
    strat: &WinStrat,
    key: &[u8],
    window: &Window,
    state: &mut WindowState,
    end_of_window: bool,
    finish: bool,
    holds: &mut HoldTracker,
) -> Option<FiredPane> {
    if finish {
        state.closed = true;
    }
    if state.unfired == 0 {
        return None;
    }
    let timing = if !end_of_window {
        PaneTiming::Early
    } else if !state.on_time_fired {
        state.on_time_fired = true;
        PaneTiming::OnTime
    } else {
        PaneTiming::Late
    };
    let pane = PaneInfo {
        is_first: state.pane_index == 0,
        is_last: finish,
        timing,
        index: state.pane_index,
        non_speculative_index: if timing == PaneTiming::Early {
            -1
        } else {
            state.non_speculative_index
        },
    };
    state.pane_index += 1;
    if timing != PaneTiming::Early {
        state.non_speculative_index += 1;
    }

    let timestamps = state.buffer.iter().map(|e| e.timestamp);
    let timestamp = match strat.output_time {
        OutputTimePolicy::EndOfWindow => window.max_timestamp(),
        OutputTimePolicy::EarliestInPane => timestamps.min().unwrap_or(window.max_timestamp()),
        OutputTimePolicy::LatestInPane => timestamps.max().unwrap_or(window.max_timestamp()),
    };
    let values = state
        .buffer
        .iter()
        .map(|e| {
            let key_len = e.key_bytes.as_ref().map_or(0, Vec::len);
            e.elm_bytes[key_len.min(e.elm_bytes.len())..].to_vec()
        })
        .collect();

    state.unfired = 0;
    state.set_hold(None, holds);
    if finish || strat.accumulation == Accumulation::Discarding {
        state.buffer.clear();
    }
    holds.add(timestamp);
    Some(FiredPane {
        key: key.to_vec(),
        window: *window,
        timestamp,
        pane,
        values,
    })
}
