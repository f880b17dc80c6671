use super::*;

/// Drives one registered pipeline to completion.
///
/// Bundles run as tasks in a [`JoinSet`], at most
/// `max_in_flight_bundles` at a time. Successful bundles are persisted;
/// failures are retried through [`ElementManager::fail_bundle`] until the
/// same work has used up its retry budget. Decode errors and other
/// non-retryable failures abort the run immediately.
pub struct Executor {
    em: Arc<ElementManager>,
    stages: Arc<StageContext>,
    workers: WorkerRegistry,
}

impl Executor {
    /// Fails if a user stage's environment has no registered worker.
    pub fn new(
        em: Arc<ElementManager>,
        plan: Arc<ExecutionPlan>,
        workers: WorkerRegistry,
    ) -> Result<Self, EngineError> {
        workers.check(&plan)?;
        Ok(Self {
            em,
            stages: Arc::new(StageContext::new(plan)),
            workers,
        })
    }

    /// Run until every stage finished, the run failed, or `cancel` fired.
    ///
    /// Cancellation stops new bundles from being handed out; bundles already
    /// running finish and are persisted before this returns
    /// [`EngineError::Cancelled`].
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let permits = Arc::new(Semaphore::new(self.em.config().max_in_flight_bundles.max(1)));
        let mut rx = self.em.bundles(cancel.clone(), instruction_ids());
        let mut tasks = JoinSet::new();
        let mut executed = 0usize;

        loop {
            tokio::select! {
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    self.reap(joined);
                }
                next = rx.recv() => {
                    let Some(rb) = next else { break };
                    let permit = Arc::clone(&permits)
                        .acquire_owned()
                        .await
                        .context("bundle semaphore closed")?;
                    let em = Arc::clone(&self.em);
                    let stages = Arc::clone(&self.stages);
                    let workers = self.workers.clone();
                    executed += 1;
                    tasks.spawn(async move {
                        execute(&em, &stages, &workers, rb).await;
                        drop(permit);
                    });
                }
            }
        }
        while let Some(joined) = tasks.join_next().await {
            self.reap(joined);
        }
        tracing::debug!("executor drained after {} bundles", executed);

        if let Some(err) = self.em.failure() {
            return Err(err.into());
        }
        if self.em.is_done() {
            return Ok(());
        }
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled("run cancelled before completion".into()).into());
        }
        Err(EngineError::Internal("bundle loop ended before the pipeline finished".into()).into())
    }

    fn reap(&self, joined: std::result::Result<(), tokio::task::JoinError>) {
        if let Err(e) = joined {
            self.em.abort(EngineError::Internal(format!("bundle task failed: {e}")));
        }
    }
}

/// Run one bundle and report its outcome to the element manager.
async fn execute(
    em: &ElementManager,
    stages: &StageContext,
    workers: &WorkerRegistry,
    rb: ReadyBundle,
) {
    let persisted = match run_bundle(em, stages, workers, &rb).await {
        Ok(outputs) => em.persist_bundle(&rb, outputs).map_err(anyhow::Error::from),
        Err(err) => Err(err),
    };
    let Err(err) = persisted else {
        return;
    };
    let stage = em
        .stage_name(rb.stage)
        .unwrap_or_else(|| rb.stage.to_string());

    match err.downcast_ref::<EngineError>() {
        Some(e) if !e.is_retryable() => {
            tracing::error!("bundle {} of {} failed: {:#}", rb.instruction_id, stage, err);
            em.abort(e.clone());
        }
        _ => {
            tracing::warn!("bundle {} of {} failed: {:#}", rb.instruction_id, stage, err);
            match em.fail_bundle(&rb) {
                Ok(FailureDisposition::Retry { .. }) => {}
                Ok(FailureDisposition::Exhausted { attempts }) => {
                    em.abort(EngineError::BundleFailed {
                        stage,
                        instruction: rb.instruction_id.clone(),
                        attempts,
                        cause: format!("{err:#}"),
                    });
                }
                Err(e) => em.abort(e),
            }
        }
    }
}

async fn run_bundle(
    em: &ElementManager,
    stages: &StageContext,
    workers: &WorkerRegistry,
    rb: &ReadyBundle,
) -> Result<BundleOutputs> {
    let input = em.input_for_bundle(rb)?;
    let stage = stages.stage(rb.stage)?;
    if stage.op.is_runner_native() {
        return Ok(stages.run_native(stage, &input)?);
    }

    let request = stages.request(stage, rb, input)?;
    let worker = workers.get(&request.environment)?;
    tracing::debug!(
        "bundle {} of {} -> {} ({} bytes, {} timers)",
        rb.instruction_id,
        stage.name,
        request.environment,
        request.data.len(),
        request.timers.len()
    );
    // A panicking worker fails the bundle, not the executor.
    let response = tokio::spawn(async move { worker.execute_bundle(request).await })
        .await
        .with_context(|| format!("worker for {} panicked", stage.name))??;
    Ok(response.into())
}
