use super::*;

// ── Trigger ───────────────────────────────────────────────────────────────────

/// Compiled trigger tree for an aggregating stage.
///
/// The tree itself is immutable and shared by every window of the stage; the
/// mutable part of a firing lives in a parallel [`TriggerState`] tree created
/// per (window, key) by [`Trigger::new_state`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trigger {
    /// Fires on every poll.
    Always,
    /// Never fires; the pane only closes at window garbage collection.
    Never,
    /// Fires once at least `n` elements arrived since the last firing.
    ElementCount(usize),
    /// Fires when the watermark passes the end of the window. Before that the
    /// optional `early` trigger may fire speculative panes; after it the
    /// optional `late` trigger fires for late data.
    AfterEndOfWindow {
        early: Option<Box<Trigger>>,
        late: Option<Box<Trigger>>,
    },
    /// Fires once every child is ready.
    AfterAll(Vec<Trigger>),
    /// Fires as soon as any child is ready.
    AfterAny(Vec<Trigger>),
    /// Runs children one after another, handing off when one finishes.
    AfterEach(Vec<Trigger>),
    /// Fires per `main`; closes the pane as soon as `finally` is ready.
    OrFinally {
        main: Box<Trigger>,
        finally: Box<Trigger>,
    },
    /// Re-arms the child after every firing. Never finishes on its own.
    Repeatedly(Box<Trigger>),
    /// Used when a pipeline declares no trigger: an end-of-window trigger
    /// without early or late firings.
    Default,
}

/// Outcome of polling a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerResult {
    /// Keep buffering.
    None,
    /// Emit a pane and keep the window open.
    Fire,
    /// Emit a pane and close the window for good.
    FireAndFinish,
}

impl TriggerResult {
    /// Return true if a pane should be emitted.
    pub fn is_fire(self) -> bool {
        matches!(self, TriggerResult::Fire | TriggerResult::FireAndFinish)
    }

    /// Return true if the window accepts no further panes.
    pub fn is_finish(self) -> bool {
        matches!(self, TriggerResult::FireAndFinish)
    }
}

/// What happened to a window since the last poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerEvent {
    /// Elements added to the pane since the last poll.
    pub new_elements: usize,
    /// Whether the input watermark is at or past the window's max timestamp.
    pub end_of_window: bool,
}

impl TriggerEvent {
    pub fn elements(n: usize, end_of_window: bool) -> Self {
        Self {
            new_elements: n,
            end_of_window,
        }
    }

    pub fn watermark(end_of_window: bool) -> Self {
        Self {
            new_elements: 0,
            end_of_window,
        }
    }
}

/// Per-window mutable state mirroring the shape of a [`Trigger`] tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerState {
    finished: bool,
    count: usize,
    position: usize,
    end_of_window_fired: bool,
    children: Vec<TriggerState>,
}

impl TriggerState {
    /// True once the trigger will never fire again.
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

const EARLY: usize = 0;
const LATE: usize = 1;
const MAIN: usize = 0;
const FINALLY: usize = 1;

impl Trigger {
    /// Build the initial state tree for one window.
    pub fn new_state(&self) -> TriggerState {
        let children = match self {
            Trigger::AfterEndOfWindow { early, late } => vec![
                early.as_ref().map(|t| t.new_state()).unwrap_or_default(),
                late.as_ref().map(|t| t.new_state()).unwrap_or_default(),
            ],
            Trigger::AfterAll(subs) | Trigger::AfterAny(subs) | Trigger::AfterEach(subs) => {
                subs.iter().map(Trigger::new_state).collect()
            }
            Trigger::OrFinally { main, finally } => vec![main.new_state(), finally.new_state()],
            Trigger::Repeatedly(sub) => vec![sub.new_state()],
            Trigger::Always | Trigger::Never | Trigger::ElementCount(_) | Trigger::Default => {
                Vec::new()
            }
        };
        TriggerState {
            children,
            ..TriggerState::default()
        }
    }

    /// Poll the trigger with an event, applying any firing to `state`.
    pub fn evaluate(&self, state: &mut TriggerState, event: TriggerEvent) -> TriggerResult {
        if state.finished {
            return TriggerResult::None;
        }
        self.on_element(state, event.new_elements);
        if !self.should_fire(state, event.end_of_window) {
            return TriggerResult::None;
        }
        self.on_fire(state, event.end_of_window);
        if state.finished {
            TriggerResult::FireAndFinish
        } else {
            TriggerResult::Fire
        }
    }

    fn on_element(&self, state: &mut TriggerState, n: usize) {
        if state.finished || n == 0 {
            return;
        }
        match self {
            Trigger::ElementCount(_) => state.count += n,
            Trigger::AfterEndOfWindow { early, late } => {
                let (sub, idx) = if state.end_of_window_fired {
                    (late, LATE)
                } else {
                    (early, EARLY)
                };
                if let Some(sub) = sub {
                    sub.on_element(&mut state.children[idx], n);
                }
            }
            Trigger::AfterAll(subs) | Trigger::AfterAny(subs) => {
                for (sub, child) in subs.iter().zip(state.children.iter_mut()) {
                    sub.on_element(child, n);
                }
            }
            Trigger::AfterEach(subs) => {
                if let Some(sub) = subs.get(state.position) {
                    sub.on_element(&mut state.children[state.position], n);
                }
            }
            Trigger::OrFinally { main, finally } => {
                main.on_element(&mut state.children[MAIN], n);
                finally.on_element(&mut state.children[FINALLY], n);
            }
            Trigger::Repeatedly(sub) => sub.on_element(&mut state.children[0], n),
            Trigger::Always | Trigger::Never | Trigger::Default => {}
        }
    }

    fn should_fire(&self, state: &TriggerState, end_of_window: bool) -> bool {
        if state.finished {
            return false;
        }
        match self {
            Trigger::Always => true,
            Trigger::Never => false,
            Trigger::ElementCount(n) => state.count >= *n,
            Trigger::AfterEndOfWindow { early, late } => {
                if !state.end_of_window_fired {
                    end_of_window
                        || early
                            .as_ref()
                            .is_some_and(|t| t.should_fire(&state.children[EARLY], end_of_window))
                } else {
                    late.as_ref()
                        .is_some_and(|t| t.should_fire(&state.children[LATE], end_of_window))
                }
            }
            Trigger::Default => !state.end_of_window_fired && end_of_window,
            Trigger::AfterAll(subs) => subs
                .iter()
                .zip(state.children.iter())
                .all(|(sub, child)| child.finished || sub.should_fire(child, end_of_window)),
            Trigger::AfterAny(subs) => subs
                .iter()
                .zip(state.children.iter())
                .any(|(sub, child)| sub.should_fire(child, end_of_window)),
            Trigger::AfterEach(subs) => subs
                .get(state.position)
                .is_some_and(|sub| sub.should_fire(&state.children[state.position], end_of_window)),
            Trigger::OrFinally { main, finally } => {
                main.should_fire(&state.children[MAIN], end_of_window)
                    || finally.should_fire(&state.children[FINALLY], end_of_window)
            }
            Trigger::Repeatedly(sub) => sub.should_fire(&state.children[0], end_of_window),
        }
    }

    fn on_fire(&self, state: &mut TriggerState, end_of_window: bool) {
        match self {
            Trigger::Always | Trigger::Never => {}
            Trigger::ElementCount(_) => state.finished = true,
            Trigger::AfterEndOfWindow { early, late } => {
                if !state.end_of_window_fired && end_of_window {
                    state.end_of_window_fired = true;
                    if let Some(early) = early {
                        state.children[EARLY] = early.new_state();
                    }
                    if late.is_none() {
                        state.finished = true;
                    }
                    return;
                }
                let (sub, idx) = if state.end_of_window_fired {
                    (late, LATE)
                } else {
                    (early, EARLY)
                };
                if let Some(sub) = sub {
                    let child = &mut state.children[idx];
                    sub.on_fire(child, end_of_window);
                    if child.finished {
                        *child = sub.new_state();
                    }
                }
            }
            Trigger::Default => {
                state.end_of_window_fired = true;
                state.finished = true;
            }
            Trigger::AfterAll(subs) | Trigger::AfterAny(subs) => {
                for (sub, child) in subs.iter().zip(state.children.iter_mut()) {
                    if sub.should_fire(child, end_of_window) {
                        sub.on_fire(child, end_of_window);
                    }
                }
                state.finished = true;
            }
            Trigger::AfterEach(subs) => {
                if let Some(sub) = subs.get(state.position) {
                    let child = &mut state.children[state.position];
                    sub.on_fire(child, end_of_window);
                    if child.finished {
                        state.position += 1;
                    }
                }
                if state.position >= subs.len() {
                    state.finished = true;
                }
            }
            Trigger::OrFinally { main, finally } => {
                if finally.should_fire(&state.children[FINALLY], end_of_window) {
                    finally.on_fire(&mut state.children[FINALLY], end_of_window);
                    state.finished = true;
                    return;
                }
                main.on_fire(&mut state.children[MAIN], end_of_window);
                if state.children[MAIN].finished {
                    state.finished = true;
                }
            }
            Trigger::Repeatedly(sub) => {
                let child = &mut state.children[0];
                sub.on_fire(child, end_of_window);
                if child.finished {
                    *child = sub.new_state();
                }
            }
        }
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn list(
            f: &mut std::fmt::Formatter<'_>,
            name: &str,
            subs: &[Trigger],
        ) -> std::fmt::Result {
            write!(f, "{name}(")?;
            for (i, sub) in subs.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{sub}")?;
            }
            f.write_str(")")
        }
        match self {
            Trigger::Always => f.write_str("Always"),
            Trigger::Never => f.write_str("Never"),
            Trigger::ElementCount(n) => write!(f, "ElementCount({n})"),
            Trigger::AfterEndOfWindow { early, late } => {
                f.write_str("AfterEndOfWindow(")?;
                if let Some(early) = early {
                    write!(f, "early={early}")?;
                }
                if let Some(late) = late {
                    if early.is_some() {
                        f.write_str(", ")?;
                    }
                    write!(f, "late={late}")?;
                }
                f.write_str(")")
            }
            Trigger::AfterAll(subs) => list(f, "AfterAll", subs),
            Trigger::AfterAny(subs) => list(f, "AfterAny", subs),
            Trigger::AfterEach(subs) => list(f, "AfterEach", subs),
            Trigger::OrFinally { main, finally } => write!(f, "OrFinally({main}, {finally})"),
            Trigger::Repeatedly(sub) => write!(f, "Repeatedly({sub})"),
            Trigger::Default => f.write_str("Default"),
        }
    }
}

// ── Proto conversion ──────────────────────────────────────────────────────────

impl TryFrom<&pipeline::Trigger> for Trigger {
    type Error = EngineError;

    /// Compile a pipeline trigger. Processing-time triggers are rejected.
    fn try_from(proto: &pipeline::Trigger) -> Result<Self, Self::Error> {
        use pipeline::trigger::Kind;

        fn subs(list: &[pipeline::Trigger]) -> Result<Vec<Trigger>, EngineError> {
            list.iter().map(Trigger::try_from).collect()
        }
        fn optional(
            t: &Option<Box<pipeline::Trigger>>,
        ) -> Result<Option<Box<Trigger>>, EngineError> {
            match t {
                // An unset sub-trigger and an explicit Default mean the same: none.
                Some(t) if t.kind.is_some() => {
                    Ok(Some(Box::new(Trigger::try_from(t.as_ref())?)))
                }
                _ => Ok(None),
            }
        }
        fn required(t: &Option<Box<pipeline::Trigger>>) -> Result<Box<Trigger>, EngineError> {
            match t {
                Some(t) => Ok(Box::new(Trigger::try_from(t.as_ref())?)),
                None => Ok(Box::new(Trigger::Default)),
            }
        }

        Ok(match &proto.kind {
            Some(Kind::AfterAll(t)) => Trigger::AfterAll(subs(&t.subtriggers)?),
            Some(Kind::AfterAny(t)) => Trigger::AfterAny(subs(&t.subtriggers)?),
            Some(Kind::AfterEach(t)) => Trigger::AfterEach(subs(&t.subtriggers)?),
            Some(Kind::AfterEndOfWindow(t)) => Trigger::AfterEndOfWindow {
                early: optional(&t.early_firings)?,
                late: optional(&t.late_firings)?,
            },
            Some(Kind::Always(_)) => Trigger::Always,
            Some(Kind::ElementCount(t)) => Trigger::ElementCount(t.element_count.max(0) as usize),
            Some(Kind::Never(_)) => Trigger::Never,
            Some(Kind::OrFinally(t)) => Trigger::OrFinally {
                main: required(&t.main)?,
                finally: required(&t.finally)?,
            },
            Some(Kind::Repeat(t)) => Trigger::Repeatedly(required(&t.subtrigger)?),
            Some(Kind::AfterProcessingTime(_)) => {
                return Err(EngineError::UnsupportedTrigger("AfterProcessingTime".into()));
            }
            Some(Kind::AfterSynchronizedProcessingTime(_)) => {
                return Err(EngineError::UnsupportedTrigger(
                    "AfterSynchronizedProcessingTime".into(),
                ));
            }
            Some(Kind::Default(_)) | None => Trigger::Default,
        })
    }
}

impl From<&Trigger> for pipeline::Trigger {
    fn from(trigger: &Trigger) -> Self {
        use pipeline::trigger::{self as pt, Kind};

        fn boxed(t: &Trigger) -> Option<Box<pipeline::Trigger>> {
            Some(Box::new(t.into()))
        }
        fn subs(list: &[Trigger]) -> Vec<pipeline::Trigger> {
            list.iter().map(pipeline::Trigger::from).collect()
        }

        let kind = match trigger {
            Trigger::Always => Kind::Always(pt::Always {}),
            Trigger::Never => Kind::Never(pt::Never {}),
            Trigger::ElementCount(n) => Kind::ElementCount(pt::ElementCount {
                element_count: i32::try_from(*n).unwrap_or(i32::MAX),
            }),
            Trigger::AfterEndOfWindow { early, late } => {
                Kind::AfterEndOfWindow(pt::AfterEndOfWindow {
                    early_firings: early.as_deref().and_then(boxed),
                    late_firings: late.as_deref().and_then(boxed),
                })
            }
            Trigger::AfterAll(t) => Kind::AfterAll(pt::AfterAll { subtriggers: subs(t) }),
            Trigger::AfterAny(t) => Kind::AfterAny(pt::AfterAny { subtriggers: subs(t) }),
            Trigger::AfterEach(t) => Kind::AfterEach(pt::AfterEach { subtriggers: subs(t) }),
            Trigger::OrFinally { main, finally } => Kind::OrFinally(pt::OrFinally {
                main: boxed(main),
                finally: boxed(finally),
            }),
            Trigger::Repeatedly(sub) => Kind::Repeat(pt::Repeat {
                subtrigger: boxed(sub),
            }),
            Trigger::Default => Kind::Default(pt::Default {}),
        };
        pipeline::Trigger { kind: Some(kind) }
    }
}
