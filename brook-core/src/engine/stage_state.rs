use super::*;

/// Keyed-state settings of a stateful stage.
#[derive(Debug, Default)]
pub(crate) struct StatefulMeta {
    /// Value decoders used to split appended state data.
    pub(crate) state_decoders: HashMap<LinkId, ElementDecoder>,
    pub(crate) allowed_lateness: EventTime,
    pub(crate) on_window_expiration: Option<OnWindowExpiration>,
    /// `(transform id, family)` of every processing-time timer family.
    pub(crate) processing_families: BTreeSet<(String, String)>,
}

#[derive(Debug)]
pub(crate) enum StageKind {
    /// Runs every ready element, no per-key ordering.
    Plain,
    /// Emits one element when primed; has no inputs.
    Impulse,
    /// Replays scripted events; its output watermark is set by the script.
    TestStream,
    Aggregate(Box<AggregateState>),
    Stateful(Box<StatefulMeta>),
}

/// Work taken out of a stage for one bundle.
#[derive(Debug, Clone)]
pub(crate) struct InFlight {
    pub(crate) stage: StageId,
    pub(crate) elements: Vec<Element>,
    pub(crate) panes: Vec<FiredPane>,
    pub(crate) timers: Vec<FiredTimer>,
    /// Keys owned by the bundle; empty for stages without per-key ordering.
    pub(crate) keys: BTreeSet<Vec<u8>>,
    pub(crate) watermark: EventTime,
}

/// Identity of one piece of work across retries, whatever bundle carries it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum WorkUnit {
    Element(u64),
    Pane(Vec<u8>, Window),
    Timer(TimerKey),
}

impl InFlight {
    fn units(&self) -> impl Iterator<Item = WorkUnit> + '_ {
        let elements = self.elements.iter().map(|e| WorkUnit::Element(e.sequence));
        let panes = self.panes.iter().map(|p| WorkUnit::Pane(p.key.clone(), p.window));
        let timers = self.timers.iter().map(|t| WorkUnit::Timer(t.timer_key()));
        elements.chain(panes).chain(timers)
    }
}

/// Everything the element manager tracks for one stage.
#[derive(Debug)]
pub(crate) struct StageState {
    pub(crate) id: StageId,
    pub(crate) name: String,
    pub(crate) inputs: Vec<String>,
    pub(crate) outputs: Vec<String>,
    pub(crate) sides: Vec<SideInputRef>,
    /// Producers of main and side inputs, in tracker channel order.
    pub(crate) upstream: Vec<StageId>,
    /// Producers of side inputs only.
    pub(crate) side_producers: Vec<StageId>,
    /// Consumers of any output, main or side.
    pub(crate) downstream: Vec<StageId>,
    pub(crate) tracker: WatermarkTracker,
    pub(crate) output: EventTime,
    pub(crate) holds: HoldTracker,
    pub(crate) pending: VecDeque<Element>,
    pub(crate) busy_keys: BTreeSet<Vec<u8>>,
    pub(crate) in_flight: usize,
    pub(crate) kind: StageKind,
    pub(crate) event_timers: TimerService,
    pub(crate) processing_timers: TimerService,
    pub(crate) state: HashMapStateBackend,
    /// Failed attempts of work that went back to pending, cleared once that
    /// work is persisted.
    pub(crate) attempts: HashMap<WorkUnit, usize>,
}

impl StageState {
    pub(crate) fn new(
        id: StageId,
        name: String,
        inputs: Vec<String>,
        outputs: Vec<String>,
        sides: Vec<SideInputRef>,
        upstream: Vec<StageId>,
        side_producers: Vec<StageId>,
    ) -> Self {
        Self {
            id,
            name,
            inputs,
            outputs,
            sides,
            tracker: WatermarkTracker::new(upstream.len()),
            upstream,
            side_producers,
            downstream: Vec::new(),
            output: MIN_TIMESTAMP,
            holds: HoldTracker::new(),
            pending: VecDeque::new(),
            busy_keys: BTreeSet::new(),
            in_flight: 0,
            kind: StageKind::Plain,
            event_timers: TimerService::new(),
            processing_timers: TimerService::new(),
            state: HashMapStateBackend::new(),
            attempts: HashMap::new(),
        }
    }

    pub(crate) fn input_watermark(&self) -> EventTime {
        self.tracker.current_min_timestamp()
    }

    pub(crate) fn stateful(&self) -> Option<&StatefulMeta> {
        match &self.kind {
            StageKind::Stateful(meta) => Some(meta.as_ref()),
            _ => None,
        }
    }

    pub(crate) fn aggregate(&self) -> Option<&AggregateState> {
        match &self.kind {
            StageKind::Aggregate(agg) => Some(agg.as_ref()),
            _ => None,
        }
    }

    /// Time domain of a timer family declared by this stage.
    pub(crate) fn timer_domain(&self, transform_id: &str, family: &str) -> TimeDomain {
        let processing = self.stateful().is_some_and(|m| {
            m.processing_families
                .contains(&(transform_id.to_string(), family.to_string()))
        });
        if processing {
            TimeDomain::ProcessingTime
        } else {
            TimeDomain::EventTime
        }
    }

    // ── Incoming data ────────────────────────────────────────────────────────

    /// Accept one element routed from upstream.
    pub(crate) fn accept(&mut self, e: Element) {
        let input = self.input_watermark();
        match &mut self.kind {
            StageKind::Aggregate(agg) => {
                agg.add_element(e, input, &mut self.holds);
                return;
            }
            StageKind::Stateful(meta) => {
                if let Some(owe) = &meta.on_window_expiration
                    && !e.window.is_expired(input, meta.allowed_lateness)
                {
                    let key = TimerKey {
                        transform_id: owe.transform_id.clone(),
                        family: owe.family.clone(),
                        tag: String::new(),
                        key: e.key_bytes.clone().unwrap_or_default(),
                        window: e.window,
                    };
                    if !self.event_timers.contains(&key) {
                        let fire = e
                            .window
                            .gc_time(meta.allowed_lateness)
                            .saturating_add(1)
                            .min(MAX_TIMESTAMP);
                        let hold = e.window.max_timestamp();
                        self.event_timers.register(key, fire, hold);
                        self.holds.add(hold);
                    }
                }
            }
            StageKind::Plain | StageKind::Impulse | StageKind::TestStream => {}
        }
        self.holds.add(e.hold);
        self.pending.push_back(e);
    }

    /// Register or clear a timer requested by a worker.
    pub(crate) fn set_timer(&mut self, t: &TimerSet) {
        let key = t.timer_key();
        let input = self.input_watermark();
        match self.timer_domain(&t.transform_id, &t.family) {
            TimeDomain::EventTime => {
                if let Some(old) = self.event_timers.delete(&key) {
                    self.holds.release(old.hold);
                }
                if !t.clear {
                    self.event_timers.register(key, t.fire, t.hold);
                    self.holds.add(t.hold);
                }
            }
            TimeDomain::ProcessingTime => {
                self.processing_timers.delete(&key);
                // Nothing can fire them once the input is exhausted.
                if !t.clear && input < MAX_TIMESTAMP {
                    self.processing_timers.register(key, t.fire, t.hold);
                }
            }
        }
    }

    // ── Bundles ──────────────────────────────────────────────────────────────

    /// Take the stage's ready work, or `None` when there is none.
    ///
    /// `side_watermark` is the minimum output watermark of the side input
    /// producers; a main element is ready once it reaches the end of the
    /// element's window. `now` is the current processing time.
    pub(crate) fn cut_bundle(
        &mut self,
        side_watermark: EventTime,
        now: EventTime,
    ) -> Option<InFlight> {
        let input = self.input_watermark();
        let side_ready = |e: &Element| side_watermark >= e.window.max_timestamp();
        let mut bundle = InFlight {
            stage: self.id,
            elements: Vec::new(),
            panes: Vec::new(),
            timers: Vec::new(),
            keys: BTreeSet::new(),
            watermark: input,
        };
        match &mut self.kind {
            StageKind::Impulse | StageKind::TestStream => return None,
            StageKind::Plain => {
                let (ready, waiting): (VecDeque<_>, VecDeque<_>) =
                    self.pending.drain(..).partition(|e| side_ready(e));
                self.pending = waiting;
                bundle.elements = ready.into();
            }
            StageKind::Aggregate(agg) => {
                bundle.panes = agg.take_ready(&self.busy_keys);
                bundle.keys = bundle.panes.iter().map(|p| p.key.clone()).collect();
            }
            StageKind::Stateful(_) => {
                let busy = &self.busy_keys;
                let (ready, waiting): (VecDeque<_>, VecDeque<_>) =
                    self.pending.drain(..).partition(|e| {
                        let key = e.key_bytes.as_deref().unwrap_or_default();
                        side_ready(e) && !busy.contains(key)
                    });
                self.pending = waiting;
                bundle.elements = ready.into();

                let free = |k: &[u8]| !busy.contains(k);
                let fired_event = self.event_timers.drain_due(input, free);
                // Processing-time timers all fire once the input is exhausted.
                let processing_now = if input >= MAX_TIMESTAMP {
                    MAX_TIMESTAMP
                } else {
                    now
                };
                let fired_processing = self.processing_timers.drain_due(processing_now, free);
                bundle.timers = fired_event
                    .into_iter()
                    .map(|t| FiredTimer::from_pending(t, TimeDomain::EventTime))
                    .chain(
                        fired_processing
                            .into_iter()
                            .map(|t| FiredTimer::from_pending(t, TimeDomain::ProcessingTime)),
                    )
                    .collect();
                bundle.keys = bundle
                    .elements
                    .iter()
                    .map(|e| e.key_bytes.clone().unwrap_or_default())
                    .chain(bundle.timers.iter().map(|t| t.key.clone()))
                    .collect();
            }
        }
        if bundle.elements.is_empty() && bundle.panes.is_empty() && bundle.timers.is_empty() {
            return None;
        }
        self.busy_keys.extend(bundle.keys.iter().cloned());
        self.in_flight += 1;
        Some(bundle)
    }

    /// Release everything a persisted bundle held.
    pub(crate) fn complete_bundle(&mut self, bundle: &InFlight) {
        for e in &bundle.elements {
            self.holds.release(e.hold);
        }
        for p in &bundle.panes {
            self.holds.release(p.timestamp);
        }
        for t in &bundle.timers {
            if t.domain == TimeDomain::EventTime {
                self.holds.release(t.hold);
            }
        }
        self.finish_bundle(bundle);
        if !self.attempts.is_empty() {
            for unit in bundle.units() {
                self.attempts.remove(&unit);
            }
        }
    }

    /// Put a failed bundle's work back. Its holds were never released.
    ///
    /// Returns the number of failed attempts of the most retried work the
    /// bundle carried.
    pub(crate) fn return_bundle(&mut self, bundle: InFlight) -> usize {
        self.finish_bundle(&bundle);
        let units: Vec<WorkUnit> = bundle.units().collect();
        let attempts = 1 + units
            .iter()
            .filter_map(|u| self.attempts.get(u))
            .max()
            .copied()
            .unwrap_or(0);
        for unit in units {
            self.attempts.insert(unit, attempts);
        }
        let InFlight {
            elements,
            panes,
            timers,
            ..
        } = bundle;
        if !elements.is_empty() {
            let mut merged: Vec<Element> = self.pending.drain(..).chain(elements).collect();
            merged.sort_by_key(|e| e.sequence);
            self.pending = merged.into();
        }
        if let StageKind::Aggregate(agg) = &mut self.kind {
            agg.return_panes(panes);
        }
        for t in timers {
            let key = t.timer_key();
            let service = match t.domain {
                TimeDomain::EventTime => &mut self.event_timers,
                TimeDomain::ProcessingTime => &mut self.processing_timers,
            };
            if let Some(replaced) = service.register(key, t.fire, t.hold)
                && t.domain == TimeDomain::EventTime
            {
                self.holds.release(replaced.hold);
            }
        }
        attempts
    }

    fn finish_bundle(&mut self, bundle: &InFlight) {
        for key in &bundle.keys {
            self.busy_keys.remove(key);
        }
        self.in_flight -= 1;
    }

    // ── Watermarks ───────────────────────────────────────────────────────────

    /// React to the current input watermark and recompute the output
    /// watermark. Returns the new output watermark if it advanced.
    ///
    /// `scripted` overrides the computation for test stream stages.
    pub(crate) fn update_watermark(&mut self, scripted: Option<EventTime>) -> Option<EventTime> {
        let input = self.input_watermark();
        if let StageKind::Aggregate(agg) = &mut self.kind {
            agg.on_watermark(input, &mut self.holds);
        }
        if matches!(self.kind, StageKind::Stateful(_)) {
            self.clear_expired_state(input);
        }
        let previous = self.output;
        let next = match scripted {
            Some(wm) => previous.max(wm),
            None => {
                let next = output_watermark(previous, input, &self.holds);
                // Pending processing-time work may still produce output.
                if next >= MAX_TIMESTAMP
                    && (!self.processing_timers.is_empty() || self.in_flight > 0)
                {
                    previous
                } else {
                    next
                }
            }
        };
        if next > previous {
            self.output = next;
            Some(next)
        } else {
            None
        }
    }

    /// Drop state of expired windows that nothing can touch any more.
    fn clear_expired_state(&mut self, input: EventTime) {
        let Some(lateness) = self.stateful().map(|m| m.allowed_lateness) else {
            return;
        };
        for key in self.state.keys() {
            if self.busy_keys.contains(&key) {
                continue;
            }
            for window in self.state.windows_of(&key) {
                let referenced = self.pending.iter().any(|e| {
                    e.window == window && e.key_bytes.as_deref() == Some(key.as_slice())
                }) || self.event_timers.has_window(&key, &window)
                    || self.processing_timers.has_window(&key, &window);
                if window.is_expired(input, lateness) && !referenced {
                    tracing::debug!(
                        "stage {} clearing state of expired window {}",
                        self.name,
                        window
                    );
                    self.state.clear_window(&key, &window);
                }
            }
        }
    }

    /// One-line summary for stuck diagnostics.
    pub(crate) fn describe(&self) -> String {
        format!(
            "{} (input {}, output {}, pending {}, holds {})",
            self.name,
            Watermark::new(self.input_watermark()),
            Watermark::new(self.output),
            self.pending.len(),
            self.holds.len()
        )
    }
}
