use std::sync::MutexGuard;
use std::time::Duration;

use super::stage_state::{StageKind, StatefulMeta};
use super::teststream::TestStreamEvent;
use super::*;

/// What the bundle loop should do next.
#[derive(Debug)]
enum Step {
    Bundles(Vec<ReadyBundle>),
    /// Wait for a persisted or failed bundle, or for the deadline of a
    /// wall-clock processing-time timer.
    Wait(Option<Duration>),
    Finished,
}

/// Mutable engine state. Every access goes through [`ElementManager::core`].
#[derive(Debug)]
pub(crate) struct Core {
    pub(crate) stages: Vec<StageState>,
    by_name: HashMap<String, StageId>,
    /// PCollection -> the stage producing it.
    producers: HashMap<String, StageId>,
    /// PCollection -> stages consuming it as a main input.
    consumers: BTreeMap<String, Vec<StageId>>,
    /// PCollection -> stages consuming it as a side input.
    side_consumers: BTreeMap<String, Vec<StageId>>,
    /// Everything written so far to PCollections read as side inputs.
    side_data: BTreeMap<String, Vec<Element>>,
    pcolls: HashMap<String, Arc<PColInfo>>,
    in_flight: BTreeMap<String, InFlight>,
    clock: ProcessingClock,
    test_stream: Option<TestStreamHandler>,
    sequence: u64,
    started: bool,
    failure: Option<EngineError>,
    watermark_log: Vec<(StageId, EventTime)>,
}

impl Core {
    fn stage(&self, id: StageId) -> Result<&StageState, EngineError> {
        self.stages
            .get(id.0)
            .ok_or_else(|| EngineError::UnknownStage(id.to_string()))
    }

    fn stage_mut(&mut self, id: StageId) -> Result<&mut StageState, EngineError> {
        self.stages
            .get_mut(id.0)
            .ok_or_else(|| EngineError::UnknownStage(id.to_string()))
    }

    pub(crate) fn pcollection_info(&self, pcoll: &str) -> Option<Arc<PColInfo>> {
        self.pcolls.get(pcoll).cloned()
    }

    /// Hand `elements` to every consumer of `pcoll`.
    fn route(&mut self, pcoll: &str, elements: Vec<Element>) {
        if elements.is_empty() {
            return;
        }
        if self.side_consumers.contains_key(pcoll) {
            self.side_data
                .entry(pcoll.to_string())
                .or_default()
                .extend(elements.iter().cloned());
        }
        let Some(consumers) = self.consumers.get(pcoll) else {
            return;
        };
        for id in consumers.clone() {
            for e in &elements {
                let mut e = e.clone();
                self.sequence += 1;
                e.sequence = self.sequence;
                self.stages[id.0].accept(e);
            }
        }
    }

    /// Recompute output watermarks starting from `dirty`, propagating every
    /// change downstream until nothing moves. Stages are visited in id order,
    /// which is topological.
    fn refresh(&mut self, mut dirty: BTreeSet<usize>, record: bool) {
        while let Some(idx) = dirty.pop_first() {
            let scripted = self
                .test_stream
                .as_ref()
                .filter(|ts| ts.stage.0 == idx)
                .map(|ts| ts.watermark());
            let Some(wm) = self.stages[idx].update_watermark(scripted) else {
                continue;
            };
            tracing::debug!(
                "stage {} output watermark -> {}",
                self.stages[idx].name,
                Watermark::new(wm)
            );
            if record {
                self.watermark_log.push((StageId(idx), wm));
            }
            for d in self.stages[idx].downstream.clone() {
                let consumer = &mut self.stages[d.0];
                if let Some(channel) = consumer.upstream.iter().position(|u| u.0 == idx)
                    && consumer.tracker.advance(channel, Watermark::new(wm)).is_some()
                {
                    dirty.insert(d.0);
                }
            }
        }
    }

    /// Cut at most one bundle per stage without exceeding the in-flight cap.
    fn collect_ready(
        &mut self,
        max_in_flight: usize,
        id_gen: &mut dyn FnMut() -> String,
    ) -> Vec<ReadyBundle> {
        let mut ready = Vec::new();
        let now = self.clock.now();
        for idx in 0..self.stages.len() {
            if self.in_flight.len() >= max_in_flight {
                break;
            }
            let side_watermark = self.stages[idx]
                .side_producers
                .iter()
                .map(|p| self.stages[p.0].output)
                .min()
                .unwrap_or(MAX_TIMESTAMP);
            let Some(bundle) = self.stages[idx].cut_bundle(side_watermark, now) else {
                continue;
            };
            let instruction_id = id_gen();
            tracing::debug!(
                "bundle {} for stage {}: {} elements, {} panes, {} timers",
                instruction_id,
                self.stages[idx].name,
                bundle.elements.len(),
                bundle.panes.len(),
                bundle.timers.len()
            );
            ready.push(ReadyBundle {
                stage: StageId(idx),
                instruction_id: instruction_id.clone(),
                watermark: bundle.watermark,
            });
            self.in_flight.insert(instruction_id, bundle);
        }
        ready
    }

    /// Apply the next test stream event. Returns false when there is none.
    fn apply_test_event(&mut self, record: bool) -> bool {
        let Some(ts) = self.test_stream.as_mut() else {
            return false;
        };
        let stage = ts.stage;
        let Some(event) = ts.advance() else {
            return false;
        };
        match event {
            TestStreamEvent::Elements {
                pcollection,
                elements,
            } => {
                tracing::debug!("test stream: {} elements into {}", elements.len(), pcollection);
                self.route(&pcollection, elements);
            }
            TestStreamEvent::Watermark { tag, watermark } => {
                tracing::debug!("test stream: watermark of {} -> {}", tag, watermark);
            }
            TestStreamEvent::ProcessingTime { advance } => {
                self.clock.advance(advance);
                tracing::debug!("test stream: processing time -> {}", self.clock.now());
            }
        }
        self.refresh(BTreeSet::from([stage.0]), record);
        true
    }

    fn next_processing_timer(&self) -> Option<EventTime> {
        self.stages
            .iter()
            .filter_map(|s| s.processing_timers.next_timer())
            .min()
    }

    fn all_done(&self) -> bool {
        self.stages.iter().all(|s| s.output >= MAX_TIMESTAMP)
    }

    fn step(&mut self, config: &EngineConfig, id_gen: &mut dyn FnMut() -> String) -> Step {
        if !self.started {
            self.started = true;
            let all = (0..self.stages.len()).collect();
            self.refresh(all, config.record_watermarks);
        }
        loop {
            if self.failure.is_some() {
                return Step::Finished;
            }
            let ready = self.collect_ready(config.max_in_flight_bundles.max(1), id_gen);
            if !ready.is_empty() {
                return Step::Bundles(ready);
            }
            let next_timer = self.next_processing_timer();
            if !self.in_flight.is_empty() {
                return Step::Wait(next_timer.and_then(|t| self.clock.until(t)));
            }
            if self.all_done() {
                return Step::Finished;
            }
            if self.apply_test_event(config.record_watermarks) {
                continue;
            }
            if let Some(t) = next_timer {
                if self.clock.is_synthetic() {
                    if t > self.clock.now() {
                        self.clock.jump_to(t);
                        tracing::debug!("processing time jumps to {}", t);
                        continue;
                    }
                } else {
                    return Step::Wait(self.clock.until(t));
                }
            }
            let blocked: Vec<String> = self
                .stages
                .iter()
                .filter(|s| s.output < MAX_TIMESTAMP)
                .map(StageState::describe)
                .collect();
            let err = EngineError::Stuck(blocked.join("; "));
            tracing::error!("{}", err);
            self.failure = Some(err);
            return Step::Finished;
        }
    }
}

/// Coordinates every stage of one pipeline run.
///
/// Stages are registered in topological order before [`bundles`] is called.
/// All methods take `&self`; the state lives behind one mutex that is never
/// held across an await point.
///
/// [`bundles`]: ElementManager::bundles
#[derive(Debug)]
pub struct ElementManager {
    config: EngineConfig,
    core: Mutex<Core>,
    notify: Notify,
}

impl ElementManager {
    pub fn new(config: EngineConfig) -> Self {
        if config.enable_rtc {
            tracing::info!("real-time clock experiment requested; using the default clock");
        }
        Self {
            config,
            core: Mutex::new(Core {
                stages: Vec::new(),
                by_name: HashMap::new(),
                producers: HashMap::new(),
                consumers: BTreeMap::new(),
                side_consumers: BTreeMap::new(),
                side_data: BTreeMap::new(),
                pcolls: HashMap::new(),
                in_flight: BTreeMap::new(),
                clock: ProcessingClock::WallClock,
                test_stream: None,
                sequence: 0,
                started: false,
                failure: None,
                watermark_log: Vec::new(),
            }),
            notify: Notify::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Lock the shared state. A panic while it was held poisons it for the
    /// rest of the run.
    pub(crate) fn core(&self) -> Result<MutexGuard<'_, Core>, EngineError> {
        self.core
            .lock()
            .map_err(|_| EngineError::Internal("element manager lock poisoned".into()))
    }

    // ── Registration ─────────────────────────────────────────────────────────

    /// Register a stage. Producers of every input must already be registered.
    pub fn add_stage(
        &self,
        name: &str,
        inputs: Vec<String>,
        outputs: Vec<String>,
        side_inputs: Vec<SideInputRef>,
    ) -> Result<StageId, EngineError> {
        let mut core = self.core()?;
        if core.by_name.contains_key(name) {
            return Err(EngineError::DuplicateStage(name.to_string()));
        }
        for out in &outputs {
            if core.producers.contains_key(out) {
                return Err(EngineError::malformed(format!(
                    "pcollection {out} has more than one producer"
                )));
            }
        }
        let producer = |core: &Core, pcoll: &str| {
            core.producers
                .get(pcoll)
                .copied()
                .ok_or_else(|| EngineError::UnknownPCollection(pcoll.to_string()))
        };
        let mut upstream: Vec<StageId> = Vec::new();
        for pcoll in &inputs {
            let p = producer(&core, pcoll)?;
            if !upstream.contains(&p) {
                upstream.push(p);
            }
        }
        let mut side_producers: Vec<StageId> = Vec::new();
        for side in &side_inputs {
            let p = producer(&core, &side.pcollection)?;
            if !upstream.contains(&p) {
                upstream.push(p);
            }
            if !side_producers.contains(&p) {
                side_producers.push(p);
            }
        }

        let id = StageId(core.stages.len());
        for p in &upstream {
            core.stages[p.0].downstream.push(id);
        }
        for pcoll in &inputs {
            let consumers = core.consumers.entry(pcoll.clone()).or_default();
            if !consumers.contains(&id) {
                consumers.push(id);
            }
        }
        for side in &side_inputs {
            let consumers = core.side_consumers.entry(side.pcollection.clone()).or_default();
            if !consumers.contains(&id) {
                consumers.push(id);
            }
        }
        for out in &outputs {
            core.producers.insert(out.clone(), id);
        }
        core.by_name.insert(name.to_string(), id);
        tracing::debug!(
            "registered stage {} {} inputs={:?} outputs={:?} sides={}",
            id,
            name,
            inputs,
            outputs,
            side_inputs.len()
        );
        core.stages.push(StageState::new(
            id,
            name.to_string(),
            inputs,
            outputs,
            side_inputs,
            upstream,
            side_producers,
        ));
        Ok(id)
    }

    /// Mark a stage as a windowed aggregation.
    pub fn stage_aggregates(&self, id: StageId, strat: WinStrat) -> Result<(), EngineError> {
        let mut core = self.core()?;
        core.stage_mut(id)?.kind = StageKind::Aggregate(Box::new(AggregateState::new(strat)));
        Ok(())
    }

    /// Mark a stage as stateful: elements and timers of one key are never in
    /// two bundles at once.
    pub fn stage_stateful(
        &self,
        id: StageId,
        state_decoders: HashMap<LinkId, ElementDecoder>,
        allowed_lateness: EventTime,
    ) -> Result<(), EngineError> {
        let mut core = self.core()?;
        let stage = core.stage_mut(id)?;
        match &mut stage.kind {
            StageKind::Stateful(meta) => {
                meta.state_decoders = state_decoders;
                meta.allowed_lateness = allowed_lateness;
            }
            kind => {
                *kind = StageKind::Stateful(Box::new(StatefulMeta {
                    state_decoders,
                    allowed_lateness,
                    ..StatefulMeta::default()
                }));
            }
        }
        Ok(())
    }

    pub fn stage_on_window_expiration(
        &self,
        id: StageId,
        timer: OnWindowExpiration,
    ) -> Result<(), EngineError> {
        self.with_stateful(id, |meta| meta.on_window_expiration = Some(timer))
    }

    /// Declare `(transform id, family)` timer families as processing-time.
    pub fn stage_processing_time_timers(
        &self,
        id: StageId,
        families: Vec<(String, String)>,
    ) -> Result<(), EngineError> {
        self.with_stateful(id, |meta| meta.processing_families.extend(families))
    }

    fn with_stateful(
        &self,
        id: StageId,
        f: impl FnOnce(&mut StatefulMeta),
    ) -> Result<(), EngineError> {
        let mut core = self.core()?;
        let stage = core.stage_mut(id)?;
        match &mut stage.kind {
            StageKind::Stateful(meta) => {
                f(meta);
                Ok(())
            }
            _ => Err(EngineError::malformed(format!(
                "stage {} declares timers but is not stateful",
                stage.name
            ))),
        }
    }

    /// Coder metadata for a PCollection the engine materialises itself.
    pub fn register_pcollection(&self, info: Arc<PColInfo>) -> Result<(), EngineError> {
        self.core()?.pcolls.insert(info.global_id.clone(), info);
        Ok(())
    }

    /// Turn a stage into an impulse and emit its single element.
    pub fn impulse(&self, id: StageId) -> Result<(), EngineError> {
        let mut core = self.core()?;
        let stage = core.stage_mut(id)?;
        stage.kind = StageKind::Impulse;
        let outputs = stage.outputs.clone();
        for out in outputs {
            // An empty byte array in the nested bytes encoding.
            let value = vec![0];
            let e = match core.pcollection_info(&out) {
                Some(info) => info.element_from_value(Window::Global, MIN_TIMESTAMP, value)?,
                None => Element::new(Window::Global, MIN_TIMESTAMP, value),
            };
            core.route(&out, vec![e.with_pane(PaneInfo::no_firing())]);
        }
        core.refresh(BTreeSet::from([id.0]), self.config.record_watermarks);
        Ok(())
    }

    /// Turn a stage into a test stream emitting into the PCollections of
    /// `tags` (tag -> PCollection). Only one test stream per pipeline.
    pub fn add_test_stream(
        &self,
        id: StageId,
        tags: BTreeMap<String, String>,
    ) -> Result<TestStreamBuilder<'_>, EngineError> {
        let mut core = self.core()?;
        if core.test_stream.is_some() {
            return Err(EngineError::malformed("more than one test stream"));
        }
        let stage = core.stage_mut(id)?;
        if let Some(pcoll) = tags.values().find(|p| !stage.outputs.contains(p)) {
            return Err(EngineError::UnknownPCollection(format!(
                "{pcoll} is not an output of test stream stage {}",
                stage.name
            )));
        }
        stage.kind = StageKind::TestStream;
        core.test_stream = Some(TestStreamHandler::new(id, tags));
        core.clock = ProcessingClock::synthetic();
        Ok(TestStreamBuilder { em: self })
    }

    pub(crate) fn with_test_stream<T>(
        &self,
        f: impl FnOnce(&Core, &mut TestStreamHandler) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let mut core = self.core()?;
        let mut ts = core
            .test_stream
            .take()
            .ok_or_else(|| EngineError::malformed("no test stream registered"))?;
        let result = f(&core, &mut ts);
        core.test_stream = Some(ts);
        result
    }

    // ── Running ──────────────────────────────────────────────────────────────

    /// Start the bundle loop. The returned channel yields ready bundles until
    /// every stage's output watermark reached the end of time, the run failed,
    /// or `cancel` fired; then it closes.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bundles(
        self: &Arc<Self>,
        cancel: CancellationToken,
        mut id_gen: impl FnMut() -> String + Send + 'static,
    ) -> mpsc::Receiver<ReadyBundle> {
        let (tx, rx) = mpsc::channel(self.config.max_in_flight_bundles.max(1));
        let em = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                let step = match em.core() {
                    Ok(mut core) => core.step(&em.config, &mut id_gen),
                    Err(err) => {
                        tracing::error!("bundle loop stopped: {}", err);
                        break;
                    }
                };
                match step {
                    Step::Finished => break,
                    Step::Bundles(bundles) => {
                        for rb in bundles {
                            tokio::select! {
                                biased;
                                _ = cancel.cancelled() => return,
                                sent = tx.send(rb) => {
                                    if sent.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                    }
                    Step::Wait(deadline) => {
                        let sleep = async {
                            match deadline {
                                Some(d) => tokio::time::sleep(d).await,
                                None => std::future::pending::<()>().await,
                            }
                        };
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return,
                            _ = em.notify.notified() => {}
                            _ = sleep => {}
                        }
                    }
                }
            }
            tracing::debug!("bundle loop finished");
        });
        rx
    }

    /// The payload of an in-flight bundle.
    pub fn input_for_bundle(&self, rb: &ReadyBundle) -> Result<BundleInput, EngineError> {
        let core = self.core()?;
        let bundle = core
            .in_flight
            .get(&rb.instruction_id)
            .ok_or_else(|| EngineError::UnknownBundle(rb.instruction_id.clone()))?;
        let stage = core.stage(bundle.stage)?;
        let side_inputs = stage
            .sides
            .iter()
            .map(|side| SideInputData {
                input: side.clone(),
                elements: core.side_data.get(&side.pcollection).cloned().unwrap_or_default(),
            })
            .collect();
        Ok(BundleInput {
            stage: bundle.stage,
            elements: bundle.elements.clone(),
            panes: bundle.panes.clone(),
            timers: bundle.timers.clone(),
            side_inputs,
            state: stage.state.snapshot(bundle.keys.iter().map(Vec::as_slice)),
            processing_time: core.clock.now(),
            watermark: bundle.watermark,
        })
    }

    /// Commit a completed bundle.
    ///
    /// Outputs and state writes are decoded before anything is applied; on a
    /// decode error the bundle stays in flight and nothing changes.
    pub fn persist_bundle(
        &self,
        rb: &ReadyBundle,
        outputs: BundleOutputs,
    ) -> Result<(), EngineError> {
        {
            let mut core = self.core()?;
            let bundle = core
                .in_flight
                .get(&rb.instruction_id)
                .ok_or_else(|| EngineError::UnknownBundle(rb.instruction_id.clone()))?;
            let id = bundle.stage;
            let stage = core.stage(id)?;

            let BundleOutputs {
                data,
                timers,
                state_writes,
            } = outputs;
            let mut data: Vec<(String, Vec<u8>)> = data.into_iter().collect();
            data.sort();
            let mut decoded = Vec::with_capacity(data.len());
            for (pcoll, bytes) in data {
                if !stage.outputs.contains(&pcoll) {
                    return Err(EngineError::UnknownPCollection(format!(
                        "{pcoll} is not an output of stage {}",
                        stage.name
                    )));
                }
                let info = core
                    .pcollection_info(&pcoll)
                    .ok_or_else(|| EngineError::UnknownPCollection(pcoll.clone()))?;
                decoded.push((pcoll, info.decode_elements(&bytes)?));
            }
            let prepared = match stage.stateful() {
                Some(meta) => HashMapStateBackend::prepare(state_writes, &meta.state_decoders)?,
                None if state_writes.is_empty() => Vec::new(),
                None => {
                    return Err(EngineError::malformed(format!(
                        "stage {} is not stateful but wrote state",
                        stage.name
                    )));
                }
            };

            let Some(bundle) = core.in_flight.remove(&rb.instruction_id) else {
                return Err(EngineError::UnknownBundle(rb.instruction_id.clone()));
            };
            for (pcoll, elements) in decoded {
                core.route(&pcoll, elements);
            }
            let stage = &mut core.stages[id.0];
            for t in &timers {
                stage.set_timer(t);
            }
            stage.state.apply(prepared);
            stage.complete_bundle(&bundle);
            tracing::debug!("persisted bundle {} of stage {}", rb.instruction_id, stage.name);
            core.refresh(BTreeSet::from([id.0]), self.config.record_watermarks);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Return a failed bundle's work to its stage for another attempt.
    pub fn fail_bundle(&self, rb: &ReadyBundle) -> Result<FailureDisposition, EngineError> {
        let disposition = {
            let mut core = self.core()?;
            let bundle = core
                .in_flight
                .remove(&rb.instruction_id)
                .ok_or_else(|| EngineError::UnknownBundle(rb.instruction_id.clone()))?;
            let stage = core.stage_mut(bundle.stage)?;
            let attempts = stage.return_bundle(bundle);
            if attempts > self.config.max_bundle_retries {
                FailureDisposition::Exhausted { attempts }
            } else {
                tracing::warn!(
                    "bundle {} of stage {} failed, attempt {}",
                    rb.instruction_id,
                    stage.name,
                    attempts
                );
                FailureDisposition::Retry { attempt: attempts }
            }
        };
        self.notify.notify_one();
        Ok(disposition)
    }

    /// Fail the run. The bundle loop stops handing out work; the first error
    /// wins.
    pub fn abort(&self, err: EngineError) {
        match self.core() {
            Ok(mut core) if core.failure.is_none() => {
                tracing::error!("aborting run: {}", err);
                core.failure = Some(err);
            }
            Ok(_) => {}
            Err(poisoned) => tracing::error!("aborting run: {} ({})", err, poisoned),
        }
        self.notify.notify_one();
    }

    // ── Inspection ───────────────────────────────────────────────────────────

    /// The error that ended the run, if any.
    pub fn failure(&self) -> Option<EngineError> {
        match self.core() {
            Ok(core) => core.failure.clone(),
            Err(err) => Some(err),
        }
    }

    pub fn stage_id(&self, name: &str) -> Option<StageId> {
        self.core().ok()?.by_name.get(name).copied()
    }

    pub fn stage_name(&self, id: StageId) -> Option<String> {
        self.core().ok()?.stages.get(id.0).map(|s| s.name.clone())
    }

    pub fn stage_count(&self) -> usize {
        self.core().map_or(0, |core| core.stages.len())
    }

    pub fn output_watermark(&self, id: StageId) -> Option<EventTime> {
        self.core().ok()?.stages.get(id.0).map(|s| s.output)
    }

    pub fn input_watermark(&self, id: StageId) -> Option<EventTime> {
        self.core().ok()?.stages.get(id.0).map(StageState::input_watermark)
    }

    /// Late elements dropped by an aggregating stage.
    pub fn dropped_late(&self, id: StageId) -> u64 {
        self.core().map_or(0, |core| {
            core.stages
                .get(id.0)
                .and_then(StageState::aggregate)
                .map_or(0, AggregateState::dropped)
        })
    }

    /// Every output watermark change, in order. Empty unless
    /// [`EngineConfig::record_watermarks`] is set.
    pub fn watermark_log(&self) -> Vec<(StageId, EventTime)> {
        self.core()
            .map(|core| core.watermark_log.clone())
            .unwrap_or_default()
    }

    /// Whether every stage finished and nothing is in flight.
    pub fn is_done(&self) -> bool {
        self.core()
            .is_ok_and(|core| core.in_flight.is_empty() && core.all_done())
    }
}
