use super::*;

/// Stage descriptors and PCollection coders of one run, shared by every
/// bundle task.
#[derive(Debug)]
pub struct StageContext {
    plan: Arc<ExecutionPlan>,
    pcollections: HashMap<String, Arc<PColInfo>>,
}

impl StageContext {
    pub fn new(plan: Arc<ExecutionPlan>) -> Self {
        let pcollections = plan
            .pcollections
            .iter()
            .map(|(id, info)| (id.clone(), Arc::new(info.clone())))
            .collect();
        Self { plan, pcollections }
    }

    pub fn stage(&self, id: StageId) -> Result<&StageDescriptor, EngineError> {
        self.plan
            .stage(id)
            .ok_or_else(|| EngineError::UnknownStage(id.to_string()))
    }

    pub fn pcollection(&self, id: &str) -> Result<&Arc<PColInfo>, EngineError> {
        self.pcollections
            .get(id)
            .ok_or_else(|| EngineError::UnknownPCollection(id.to_string()))
    }

    /// Execute a runner-native stage.
    ///
    /// Flatten re-encodes its inputs unchanged, window into reassigns each
    /// element's windows and group by key emits one `KV<K, Iterable<V>>` per
    /// fired pane.
    pub fn run_native(
        &self,
        stage: &StageDescriptor,
        input: &BundleInput,
    ) -> Result<BundleOutputs, EngineError> {
        let out_id = stage.only_output()?;
        let out = self.pcollection(out_id)?;
        let mut buf = Vec::new();
        match &stage.op {
            StageOp::Flatten => {
                for e in &input.elements {
                    out.encode_element(e, &mut buf)?;
                }
            }
            StageOp::WindowInto(window_fn) => {
                for e in &input.elements {
                    let windows = window_fn.assign_windows(e.timestamp);
                    encode_windowed_value(
                        out.window_coder,
                        &windows,
                        e.timestamp,
                        &e.pane,
                        &e.elm_bytes,
                        &mut buf,
                    )?;
                }
            }
            StageOp::GroupByKey(_) => {
                let mut value = Vec::new();
                for pane in &input.panes {
                    value.clear();
                    encode_grouped_value(&pane.key, &pane.values, &mut value);
                    encode_windowed_value(
                        out.window_coder,
                        std::slice::from_ref(&pane.window),
                        pane.timestamp,
                        &pane.pane,
                        &value,
                        &mut buf,
                    )?;
                }
            }
            op => {
                return Err(EngineError::malformed(format!(
                    "{} ({}) does not execute bundles",
                    stage.name,
                    op.label()
                )));
            }
        }
        tracing::debug!(
            "{} {}: {} elements, {} panes -> {} bytes",
            stage.name,
            stage.op.label(),
            input.elements.len(),
            input.panes.len(),
            buf.len()
        );
        Ok(BundleOutputs {
            data: HashMap::from([(out_id.to_string(), buf)]),
            ..BundleOutputs::default()
        })
    }

    /// Encode a user stage's bundle for its worker.
    pub fn request(
        &self,
        stage: &StageDescriptor,
        rb: &ReadyBundle,
        input: BundleInput,
    ) -> Result<BundleRequest, EngineError> {
        let StageOp::ParDo { environment, .. } = &stage.op else {
            return Err(EngineError::malformed(format!(
                "{} ({}) does not run on a worker",
                stage.name,
                stage.op.label()
            )));
        };
        // Elements carry no record of which main input they came from; a
        // multi-input user transform sees them all through its first input's
        // coder.
        let main = stage.inputs.first().ok_or_else(|| {
            EngineError::malformed(format!("{} has no main input", stage.name))
        })?;
        let info = Arc::clone(self.pcollection(main)?);
        let mut data = Vec::new();
        for e in &input.elements {
            info.encode_element(e, &mut data)?;
        }

        let mut side_inputs = BTreeMap::new();
        for side in &input.side_inputs {
            let pcollection = Arc::clone(self.pcollection(&side.input.pcollection)?);
            let mut data = Vec::new();
            for e in &side.elements {
                pcollection.encode_element(e, &mut data)?;
            }
            side_inputs.insert(
                side.input.local_id.clone(),
                SideInputPayload { pcollection, data },
            );
        }

        let mut outputs = BTreeMap::new();
        for out in &stage.outputs {
            outputs.insert(out.clone(), Arc::clone(self.pcollection(out)?));
        }
        Ok(BundleRequest {
            instruction_id: rb.instruction_id.clone(),
            stage: stage.name.clone(),
            transform_id: stage.transform_id.clone(),
            environment: environment.clone(),
            input: info,
            data,
            timers: input.timers,
            side_inputs,
            state: input.state,
            processing_time: input.processing_time,
            watermark: input.watermark,
            outputs,
        })
    }
}
