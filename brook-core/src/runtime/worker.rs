use super::*;

/// One bundle for a user transform.
///
/// Element payloads use the portable windowed-value encoding of the
/// PCollection they belong to; the matching [`PColInfo`] travels with them
/// so a worker can decode and re-encode without its own coder registry.
#[derive(Debug, Clone)]
pub struct BundleRequest {
    pub instruction_id: String,
    /// Display name of the stage, `stage-NNN`.
    pub stage: String,
    pub transform_id: String,
    pub environment: String,
    pub input: Arc<PColInfo>,
    /// Concatenated windowed values of the main input.
    pub data: Vec<u8>,
    pub timers: Vec<FiredTimer>,
    /// Side inputs by local id.
    pub side_inputs: BTreeMap<String, SideInputPayload>,
    pub state: StateSnapshot,
    pub processing_time: EventTime,
    /// Input watermark when the bundle was cut.
    pub watermark: EventTime,
    /// Output PCollections by id.
    pub outputs: BTreeMap<String, Arc<PColInfo>>,
}

impl BundleRequest {
    /// The sole output, for transforms that declare exactly one.
    pub fn only_output(&self) -> Result<(&str, &Arc<PColInfo>), EngineError> {
        let mut outputs = self.outputs.iter();
        match (outputs.next(), outputs.next()) {
            (Some((id, info)), None) => Ok((id.as_str(), info)),
            _ => Err(EngineError::malformed(format!(
                "{} has {} outputs, expected one",
                self.transform_id,
                self.outputs.len()
            ))),
        }
    }
}

/// Everything a side input has received so far.
#[derive(Debug, Clone)]
pub struct SideInputPayload {
    pub pcollection: Arc<PColInfo>,
    /// Concatenated windowed values.
    pub data: Vec<u8>,
}

/// What a worker produced for one bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BundleResponse {
    /// Concatenated windowed values per output PCollection.
    pub data: HashMap<String, Vec<u8>>,
    pub timers: Vec<TimerSet>,
    pub state_writes: Vec<StateWrite>,
}

impl From<BundleResponse> for BundleOutputs {
    fn from(r: BundleResponse) -> Self {
        BundleOutputs {
            data: r.data,
            timers: r.timers,
            state_writes: r.state_writes,
        }
    }
}

/// Executes user transforms of one environment.
///
/// An `Err` is a retryable bundle failure unless it wraps a non-retryable
/// [`EngineError`].
#[async_trait]
pub trait Worker: Send + Sync {
    async fn execute_bundle(&self, request: BundleRequest) -> Result<BundleResponse>;
}

/// A [`Worker`] backed by a closure.
pub struct FnWorker<F> {
    f: F,
}

impl<F> FnWorker<F>
where
    F: Fn(BundleRequest) -> Result<BundleResponse> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> Worker for FnWorker<F>
where
    F: Fn(BundleRequest) -> Result<BundleResponse> + Send + Sync,
{
    async fn execute_bundle(&self, request: BundleRequest) -> Result<BundleResponse> {
        (self.f)(request)
    }
}

/// Workers by environment id.
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    workers: HashMap<String, Arc<dyn Worker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `worker` for `environment`, replacing any previous one.
    pub fn register(&mut self, environment: impl Into<String>, worker: Arc<dyn Worker>) {
        self.workers.insert(environment.into(), worker);
    }

    pub fn with(mut self, environment: impl Into<String>, worker: Arc<dyn Worker>) -> Self {
        self.register(environment, worker);
        self
    }

    pub fn get(&self, environment: &str) -> Result<Arc<dyn Worker>, EngineError> {
        self.workers
            .get(environment)
            .cloned()
            .ok_or_else(|| EngineError::UnknownEnvironment(environment.to_string()))
    }

    /// Fail unless every environment `plan` uses has a worker.
    pub fn check(&self, plan: &ExecutionPlan) -> Result<(), EngineError> {
        for env in plan.environments() {
            self.get(env)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut envs: Vec<&String> = self.workers.keys().collect();
        envs.sort();
        f.debug_struct("WorkerRegistry")
            .field("environments", &envs)
            .finish()
    }
}
