use super::*;

/// A test stream event, ready to be scripted into the element manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScriptedEvent {
    /// Encoded elements and their timestamps, length-prefixed where the
    /// element coder needs it.
    Elements {
        tag: String,
        elements: Vec<(Vec<u8>, EventTime)>,
    },
    Watermark {
        tag: String,
        watermark: EventTime,
    },
    /// Milliseconds; [`MAX_TIMESTAMP`] means the end of time.
    ProcessingTime { advance: EventTime },
}

/// Keyed state and timers declared by a user transform.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatefulSpec {
    /// Value decoder of every state declaration.
    pub state_decoders: BTreeMap<LinkId, ElementDecoder>,
    pub allowed_lateness: EventTime,
    pub on_window_expiration: Option<OnWindowExpiration>,
    /// `(transform id, family)` of processing-time timer families.
    pub processing_families: Vec<(String, String)>,
}

/// What a stage does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageOp {
    Impulse,
    Flatten,
    GroupByKey(WinStrat),
    WindowInto(WindowFn),
    TestStream {
        /// Tag -> output PCollection.
        tags: BTreeMap<String, String>,
        events: Vec<ScriptedEvent>,
    },
    /// A user transform run by the worker of `environment`.
    ParDo {
        environment: String,
        stateful: Option<StatefulSpec>,
    },
}

impl StageOp {
    pub fn is_runner_native(&self) -> bool {
        !matches!(self, StageOp::ParDo { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            StageOp::Impulse => "impulse",
            StageOp::Flatten => "flatten",
            StageOp::GroupByKey(_) => "group_by_key",
            StageOp::WindowInto(_) => "window_into",
            StageOp::TestStream { .. } => "test_stream",
            StageOp::ParDo { stateful: None, .. } => "pardo",
            StageOp::ParDo { .. } => "stateful_pardo",
        }
    }
}

/// One stage of the plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDescriptor {
    pub id: StageId,
    /// `stage-NNN`, by topological position.
    pub name: String,
    pub transform_id: String,
    pub unique_name: String,
    pub op: StageOp,
    /// Main input PCollections, sorted.
    pub inputs: Vec<String>,
    /// Output PCollections, sorted.
    pub outputs: Vec<String>,
    pub side_inputs: Vec<SideInputRef>,
}

impl StageDescriptor {
    /// The single output PCollection of a runner-native stage.
    pub fn only_output(&self) -> Result<&str, EngineError> {
        match self.outputs.as_slice() {
            [out] => Ok(out),
            outs => Err(EngineError::malformed(format!(
                "{} ({}) has {} outputs, expected one",
                self.name,
                self.transform_id,
                outs.len()
            ))),
        }
    }
}

/// A preprocessed pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// In topological order; `stages[i].id == StageId(i)`.
    pub stages: Vec<StageDescriptor>,
    pub pcollections: BTreeMap<String, PColInfo>,
}

impl ExecutionPlan {
    pub fn stage(&self, id: StageId) -> Option<&StageDescriptor> {
        self.stages.get(id.0)
    }

    pub fn pcollection(&self, id: &str) -> Result<&PColInfo, EngineError> {
        self.pcollections
            .get(id)
            .ok_or_else(|| EngineError::UnknownPCollection(id.to_string()))
    }

    /// Environments of every user stage.
    pub fn environments(&self) -> BTreeSet<&str> {
        self.stages
            .iter()
            .filter_map(|s| match &s.op {
                StageOp::ParDo { environment, .. } => Some(environment.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).context("failed to serialize execution plan")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).context("failed to deserialize execution plan")
    }

    /// Register every stage with `em`, script the test stream and prime the
    /// impulses.
    pub fn register(&self, em: &ElementManager) -> Result<(), EngineError> {
        for info in self.pcollections.values() {
            em.register_pcollection(Arc::new(info.clone()))?;
        }
        let mut impulses = Vec::new();
        for stage in &self.stages {
            let id = em.add_stage(
                &stage.name,
                stage.inputs.clone(),
                stage.outputs.clone(),
                stage.side_inputs.clone(),
            )?;
            if id != stage.id {
                return Err(EngineError::malformed(format!(
                    "{} registered as {id}, expected {}",
                    stage.name, stage.id
                )));
            }
            match &stage.op {
                StageOp::Impulse => impulses.push(id),
                StageOp::Flatten | StageOp::WindowInto(_) => {}
                StageOp::GroupByKey(strat) => em.stage_aggregates(id, strat.clone())?,
                StageOp::TestStream { tags, events } => {
                    let script = em.add_test_stream(id, tags.clone())?;
                    for event in events {
                        match event {
                            ScriptedEvent::Elements { tag, elements } => {
                                script.add_element_event(tag, elements.clone())?
                            }
                            ScriptedEvent::Watermark { tag, watermark } => {
                                script.add_watermark_event(tag, *watermark)?
                            }
                            ScriptedEvent::ProcessingTime { advance } => {
                                script.add_processing_time_event(*advance)?
                            }
                        }
                    }
                }
                StageOp::ParDo {
                    stateful: Some(spec),
                    ..
                } => {
                    let decoders: HashMap<LinkId, ElementDecoder> = spec
                        .state_decoders
                        .iter()
                        .map(|(link, dec)| (link.clone(), dec.clone()))
                        .collect();
                    em.stage_stateful(id, decoders, spec.allowed_lateness)?;
                    if let Some(owe) = &spec.on_window_expiration {
                        em.stage_on_window_expiration(id, owe.clone())?;
                    }
                    if !spec.processing_families.is_empty() {
                        em.stage_processing_time_timers(id, spec.processing_families.clone())?;
                    }
                }
                StageOp::ParDo { stateful: None, .. } => {}
            }
        }
        // Impulses go last, once every consumer is known.
        for id in impulses {
            em.impulse(id)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for ExecutionPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for s in &self.stages {
            write!(f, "{} {:<15} {}", s.name, s.op.label(), s.unique_name)?;
            if let StageOp::ParDo { environment, .. } = &s.op {
                write!(f, " @{environment}")?;
            }
            write!(f, "\n    in: {:?}  out: {:?}", s.inputs, s.outputs)?;
            if !s.side_inputs.is_empty() {
                let sides: Vec<&str> =
                    s.side_inputs.iter().map(|r| r.pcollection.as_str()).collect();
                write!(f, "  side: {sides:?}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
