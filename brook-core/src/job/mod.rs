//! # Jobs
//!
//! A [`Job`] owns one pipeline run: preprocessing, registration with a fresh
//! [`ElementManager`] and execution. Its [`JobState`] is published on a watch
//! channel and every transition is also kept in a message log.
//!
//! ```text
//! Stopped ─> Starting ─> Running ─> Done
//!               │           ├────> Failed
//!               └───────────┴────> Canceled
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::engine::{ElementManager, EngineConfig};
use crate::error::EngineError;
use crate::graph::{ExecutionPlan, preprocess};
use crate::pipeline::Pipeline;
use crate::runtime::{Executor, WorkerRegistry};
use crate::types::{EventTime, StageId};

#[cfg(test)]
#[path = "tests/job_tests.rs"]
mod tests;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Stopped,
    Starting,
    Running,
    Done,
    Failed,
    Canceled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Failed | JobState::Canceled)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Stopped => "STOPPED",
            JobState::Starting => "STARTING",
            JobState::Running => "RUNNING",
            JobState::Done => "DONE",
            JobState::Failed => "FAILED",
            JobState::Canceled => "CANCELED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Importance {
    Debug,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMessage {
    pub importance: Importance,
    pub text: String,
}

/// What a finished run looked like.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub plan: Arc<ExecutionPlan>,
    /// Final output watermark per stage name.
    pub output_watermarks: BTreeMap<String, EventTime>,
    /// Late elements dropped per stage name; stages that dropped nothing are
    /// left out.
    pub dropped_late: BTreeMap<String, u64>,
    /// Every output watermark change, when
    /// [`EngineConfig::record_watermarks`] is set.
    pub watermark_log: Vec<(StageId, EventTime)>,
}

impl RunReport {
    fn collect(plan: Arc<ExecutionPlan>, em: &ElementManager) -> Self {
        let mut output_watermarks = BTreeMap::new();
        let mut dropped_late = BTreeMap::new();
        for stage in &plan.stages {
            if let Some(wm) = em.output_watermark(stage.id) {
                output_watermarks.insert(stage.name.clone(), wm);
            }
            let dropped = em.dropped_late(stage.id);
            if dropped > 0 {
                dropped_late.insert(stage.name.clone(), dropped);
            }
        }
        Self {
            plan,
            output_watermarks,
            dropped_late,
            watermark_log: em.watermark_log(),
        }
    }
}

/// One pipeline run.
#[derive(Debug)]
pub struct Job {
    id: String,
    name: String,
    state: watch::Sender<JobState>,
    messages: Mutex<Vec<JobMessage>>,
    cancel: CancellationToken,
}

impl Job {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let (state, _) = watch::channel(JobState::Stopped);
        Self {
            id: id.into(),
            name: name.into(),
            state,
            messages: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> JobState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<JobState> {
        self.state.subscribe()
    }

    /// Request cancellation. In-flight bundles finish; the job ends
    /// [`JobState::Canceled`] unless it completed first.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            self.message(Importance::Info, "cancellation requested".to_string());
            self.cancel.cancel();
        }
    }

    pub fn messages(&self) -> Vec<JobMessage> {
        self.messages.lock().expect("job messages poisoned").clone()
    }

    /// Wait for a terminal state.
    pub async fn wait(&self) -> JobState {
        let mut rx = self.subscribe();
        match rx.wait_for(|s| s.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }

    /// Run `pipeline` to completion with `workers` executing its user
    /// transforms.
    pub async fn run(
        &self,
        pipeline: &Pipeline,
        config: EngineConfig,
        workers: WorkerRegistry,
    ) -> Result<RunReport> {
        if self.state() != JobState::Stopped {
            return Err(EngineError::malformed(format!(
                "job {} already ran ({})",
                self.id,
                self.state()
            ))
            .into());
        }
        self.set_state(JobState::Starting);
        let outcome = self.execute(pipeline, config, workers).await;
        match &outcome {
            Ok(report) => {
                self.message(
                    Importance::Info,
                    format!("finished {} stages", report.plan.stages.len()),
                );
                self.set_state(JobState::Done);
            }
            Err(err) => {
                let canceled = matches!(
                    err.downcast_ref::<EngineError>(),
                    Some(EngineError::Cancelled(_))
                );
                self.message(Importance::Error, format!("{err:#}"));
                self.set_state(if canceled {
                    JobState::Canceled
                } else {
                    JobState::Failed
                });
            }
        }
        outcome
    }

    async fn execute(
        &self,
        pipeline: &Pipeline,
        config: EngineConfig,
        workers: WorkerRegistry,
    ) -> Result<RunReport> {
        let plan = Arc::new(preprocess(pipeline)?);
        self.message(
            Importance::Debug,
            format!("preprocessed into {} stages", plan.stages.len()),
        );
        let em = Arc::new(ElementManager::new(config));
        plan.register(&em)?;
        let executor = Executor::new(Arc::clone(&em), Arc::clone(&plan), workers)?;

        self.set_state(JobState::Running);
        executor.run(self.cancel.clone()).await?;
        Ok(RunReport::collect(plan, &em))
    }

    fn set_state(&self, state: JobState) {
        let prev = self.state.send_replace(state);
        tracing::info!("job {} ({}): {} -> {}", self.id, self.name, prev, state);
        self.message(Importance::Debug, format!("{prev} -> {state}"));
    }

    fn message(&self, importance: Importance, text: String) {
        match importance {
            Importance::Error => tracing::error!("job {}: {}", self.id, text),
            Importance::Warning => tracing::warn!("job {}: {}", self.id, text),
            _ => tracing::debug!("job {}: {}", self.id, text),
        }
        self.messages
            .lock()
            .expect("job messages poisoned")
            .push(JobMessage { importance, text });
    }
}

/// Run `pipeline` as a one-off job.
pub async fn run_pipeline(
    pipeline: &Pipeline,
    config: EngineConfig,
    workers: WorkerRegistry,
) -> Result<RunReport> {
    Job::new("job-001", "pipeline").run(pipeline, config, workers).await
}
