use super::*;

/// Build the execution plan of `pipeline`.
pub fn preprocess(pipeline: &pipeline::Pipeline) -> Result<ExecutionPlan, EngineError> {
    let comps = pipeline
        .components
        .as_ref()
        .ok_or_else(|| EngineError::malformed("pipeline has no components"))?;
    let leaves = leaf_transforms(pipeline, comps)?;
    let order = topological_order(&leaves, comps)?;
    let mut registry = CoderRegistry::new(&comps.coders);

    let mut stages = Vec::with_capacity(order.len());
    for (i, tid) in order.iter().enumerate() {
        let t = &comps.transforms[tid.as_str()];
        let stage = build_stage(StageId(i), tid, t, comps, &mut registry)?;
        tracing::debug!(
            "{} {} {} ({})",
            stage.name,
            stage.op.label(),
            stage.unique_name,
            t.urn()
        );
        stages.push(stage);
    }

    let mut pcollections = BTreeMap::new();
    for stage in &stages {
        let touched = stage
            .inputs
            .iter()
            .chain(&stage.outputs)
            .chain(stage.side_inputs.iter().map(|s| &s.pcollection));
        for pcoll in touched {
            if pcollections.contains_key(pcoll) {
                continue;
            }
            check_windowing(pcoll, comps)?;
            let info = registry.pcollection_info(pcoll, comps)?;
            pcollections.insert(pcoll.clone(), info.as_ref().clone());
        }
    }
    Ok(ExecutionPlan {
        stages,
        pcollections,
    })
}

/// Expand composites from the roots down, keeping first-visit order.
fn leaf_transforms(
    pipeline: &pipeline::Pipeline,
    comps: &pipeline::Components,
) -> Result<Vec<String>, EngineError> {
    if pipeline.root_transform_ids.is_empty() {
        return Err(EngineError::malformed("pipeline has no root transforms"));
    }
    let mut leaves = Vec::new();
    let mut seen = BTreeSet::new();
    let mut stack: Vec<&str> = pipeline
        .root_transform_ids
        .iter()
        .rev()
        .map(String::as_str)
        .collect();
    while let Some(tid) = stack.pop() {
        if !seen.insert(tid) {
            continue;
        }
        let t = comps
            .transforms
            .get(tid)
            .ok_or_else(|| EngineError::malformed(format!("unknown transform {tid:?}")))?;
        if t.subtransforms.is_empty() {
            leaves.push(tid.to_string());
        } else {
            stack.extend(t.subtransforms.iter().rev().map(String::as_str));
        }
    }
    Ok(leaves)
}

/// Kahn's algorithm over the leaves; ties are broken by visit order so the
/// result is deterministic.
fn topological_order(
    leaves: &[String],
    comps: &pipeline::Components,
) -> Result<Vec<String>, EngineError> {
    let mut producer: HashMap<&str, usize> = HashMap::new();
    for (i, tid) in leaves.iter().enumerate() {
        for pcoll in comps.transforms[tid.as_str()].outputs.values() {
            if let Some(prev) = producer.insert(pcoll, i) {
                return Err(EngineError::malformed(format!(
                    "pcollection {pcoll} is produced by both {} and {tid}",
                    leaves[prev]
                )));
            }
        }
    }
    let mut in_degree = vec![0usize; leaves.len()];
    let mut downstream: Vec<Vec<usize>> = vec![Vec::new(); leaves.len()];
    for (i, tid) in leaves.iter().enumerate() {
        let t = &comps.transforms[tid.as_str()];
        let mut deps = BTreeSet::new();
        for pcoll in t.inputs.values() {
            let p = producer
                .get(pcoll.as_str())
                .ok_or_else(|| EngineError::UnknownPCollection(pcoll.clone()))?;
            deps.insert(*p);
        }
        for p in deps {
            in_degree[i] += 1;
            downstream[p].push(i);
        }
    }

    let mut ready: BTreeSet<usize> = (0..leaves.len()).filter(|i| in_degree[*i] == 0).collect();
    let mut order = Vec::with_capacity(leaves.len());
    while let Some(i) = ready.pop_first() {
        order.push(leaves[i].clone());
        for &d in &downstream[i] {
            in_degree[d] -= 1;
            if in_degree[d] == 0 {
                ready.insert(d);
            }
        }
    }
    if order.len() != leaves.len() {
        return Err(EngineError::malformed("pipeline graph has a cycle"));
    }
    Ok(order)
}

fn build_stage(
    id: StageId,
    tid: &str,
    t: &pipeline::PTransform,
    comps: &pipeline::Components,
    registry: &mut CoderRegistry,
) -> Result<StageDescriptor, EngineError> {
    let mut stage = StageDescriptor {
        id,
        name: format!("stage-{:03}", id.0),
        transform_id: tid.to_string(),
        unique_name: t.unique_name.clone(),
        op: StageOp::Flatten,
        inputs: sorted_values(&t.inputs),
        outputs: sorted_values(&t.outputs),
        side_inputs: Vec::new(),
    };
    let op = match t.urn() {
        urns::TRANSFORM_IMPULSE => {
            stage.only_output()?;
            StageOp::Impulse
        }
        urns::TRANSFORM_FLATTEN => {
            stage.only_output()?;
            stage.inputs.dedup();
            StageOp::Flatten
        }
        urns::TRANSFORM_GBK => {
            stage.only_output()?;
            let input = only_input(&stage)?;
            if registry.key_coder_id(&pcollection(input, comps)?.coder_id).is_none() {
                return Err(EngineError::malformed(format!(
                    "{tid}: group by key input {input} is not KV-coded"
                )));
            }
            StageOp::GroupByKey(WinStrat::try_from(windowing_strategy(input, comps)?)?)
        }
        urns::TRANSFORM_WINDOW_INTO => {
            stage.only_output()?;
            only_input(&stage)?;
            let payload = pipeline::WindowIntoPayload::decode(spec_payload(t))
                .map_err(|e| EngineError::malformed(format!("{tid}: window into payload: {e}")))?;
            let spec = payload
                .window_fn
                .ok_or_else(|| EngineError::malformed(format!("{tid}: no window fn")))?;
            StageOp::WindowInto(WindowFn::try_from(&spec)?)
        }
        urns::TRANSFORM_TEST_STREAM => test_stream(tid, t, registry)?,
        urn => {
            let env = &t.environment_id;
            if env.is_empty() || !comps.environments.contains_key(env) {
                return Err(EngineError::UnknownEnvironment(env.clone()));
            }
            if urn == urns::TRANSFORM_PARDO {
                user_pardo(&mut stage, t, comps, registry)?
            } else {
                stage.inputs.dedup();
                StageOp::ParDo {
                    environment: env.clone(),
                    stateful: None,
                }
            }
        }
    };
    stage.op = op;
    Ok(stage)
}

/// Decode a ParDo: split side inputs off the main input and collect its
/// state and timer declarations.
fn user_pardo(
    stage: &mut StageDescriptor,
    t: &pipeline::PTransform,
    comps: &pipeline::Components,
    registry: &mut CoderRegistry,
) -> Result<StageOp, EngineError> {
    let tid = stage.transform_id.clone();
    let payload = pipeline::ParDoPayload::decode(spec_payload(t))
        .map_err(|e| EngineError::malformed(format!("{tid}: pardo payload: {e}")))?;

    let mut main = Vec::new();
    let mut locals: Vec<(&String, &String)> = t.inputs.iter().collect();
    locals.sort();
    for (local, pcoll) in locals {
        if payload.side_inputs.contains_key(local) {
            stage.side_inputs.push(SideInputRef {
                transform_id: tid.clone(),
                local_id: local.clone(),
                pcollection: pcoll.clone(),
            });
        } else {
            main.push(pcoll.clone());
        }
    }
    if main.len() != 1 {
        return Err(EngineError::malformed(format!(
            "{tid}: expected one main input, found {}",
            main.len()
        )));
    }
    stage.inputs = main;

    let on_window_expiration = (!payload.on_window_expiration_timer_family_spec.is_empty())
        .then(|| OnWindowExpiration {
            transform_id: tid.clone(),
            family: payload.on_window_expiration_timer_family_spec.clone(),
        });
    let stateful = !payload.state_specs.is_empty()
        || !payload.timer_family_specs.is_empty()
        || on_window_expiration.is_some();
    let spec = if stateful {
        let input = &stage.inputs[0];
        if registry.key_coder_id(&pcollection(input, comps)?.coder_id).is_none() {
            return Err(EngineError::malformed(format!(
                "{tid}: stateful input {input} is not KV-coded"
            )));
        }
        let mut state_decoders = BTreeMap::new();
        for (state_id, spec) in &payload.state_specs {
            let coder_id = state_value_coder(&tid, state_id, spec)?;
            let lp = registry.lp_unknown(coder_id)?;
            state_decoders.insert(LinkId::new(&tid, state_id), registry.pull_decoder(&lp)?);
        }
        let mut processing_families: Vec<(String, String)> = payload
            .timer_family_specs
            .iter()
            .filter(|(_, spec)| spec.time_domain() == pipeline::TimeDomain::ProcessingTime)
            .map(|(family, _)| (tid.clone(), family.clone()))
            .collect();
        processing_families.sort();
        Some(StatefulSpec {
            state_decoders,
            allowed_lateness: windowing_strategy(input, comps)?.allowed_lateness.max(0),
            on_window_expiration,
            processing_families,
        })
    } else {
        None
    };
    Ok(StageOp::ParDo {
        environment: t.environment_id.clone(),
        stateful: spec,
    })
}

/// The coder of the values a state cell holds.
fn state_value_coder<'a>(
    tid: &str,
    state_id: &str,
    spec: &'a pipeline::StateSpec,
) -> Result<&'a str, EngineError> {
    use pipeline::state_spec::Spec;

    Ok(match &spec.spec {
        Some(Spec::ReadModifyWrite(s)) => &s.coder_id,
        Some(Spec::Bag(s)) => &s.element_coder_id,
        Some(Spec::Combining(s)) => &s.accumulator_coder_id,
        Some(Spec::Map(s)) => &s.value_coder_id,
        Some(Spec::Set(s)) => &s.element_coder_id,
        Some(Spec::Multimap(s)) => &s.value_coder_id,
        None => {
            return Err(EngineError::malformed(format!(
                "{tid}: state {state_id} has no spec"
            )));
        }
    })
}

/// Decode a test stream payload into scripted events.
///
/// Element payloads whose coder had to be length prefixed, or that use the
/// string coder, are length prefixed here so they decode with the rewritten
/// coder.
fn test_stream(
    tid: &str,
    t: &pipeline::PTransform,
    registry: &mut CoderRegistry,
) -> Result<StageOp, EngineError> {
    use pipeline::test_stream_payload::event::Kind;

    let payload = pipeline::TestStreamPayload::decode(spec_payload(t))
        .map_err(|e| EngineError::malformed(format!("{tid}: test stream payload: {e}")))?;
    let rewritten = registry.lp_unknown(&payload.coder_id)?;
    let force_lp = rewritten != payload.coder_id
        || registry.get(&payload.coder_id)?.urn() == urns::CODER_STRING_UTF8;

    let tags: BTreeMap<String, String> = t
        .outputs
        .iter()
        .map(|(tag, pcoll)| (tag.clone(), pcoll.clone()))
        .collect();
    let mut events = Vec::with_capacity(payload.events.len());
    for event in payload.events {
        events.push(match event.kind {
            Some(Kind::ElementEvent(e)) => ScriptedEvent::Elements {
                tag: e.tag,
                elements: e
                    .elements
                    .into_iter()
                    .map(|el| {
                        let bytes = if force_lp {
                            let mut buf = Vec::with_capacity(el.encoded_element.len() + 2);
                            encode_length_prefixed(&el.encoded_element, &mut buf);
                            buf
                        } else {
                            el.encoded_element
                        };
                        (bytes, el.timestamp)
                    })
                    .collect(),
            },
            Some(Kind::WatermarkEvent(w)) => ScriptedEvent::Watermark {
                tag: w.tag,
                watermark: w.new_watermark,
            },
            Some(Kind::ProcessingTimeEvent(p)) => ScriptedEvent::ProcessingTime {
                advance: if p.advance_duration >= MAX_TIMESTAMP {
                    MAX_TIMESTAMP
                } else {
                    p.advance_duration
                },
            },
            None => {
                return Err(EngineError::malformed(format!("{tid}: empty test stream event")));
            }
        });
    }
    Ok(StageOp::TestStream { tags, events })
}

/// Reject windowing the engine cannot run: merging window functions and
/// processing-time triggers.
fn check_windowing(pcoll: &str, comps: &pipeline::Components) -> Result<(), EngineError> {
    let ws = windowing_strategy(pcoll, comps)?;
    if ws.merge_status() == pipeline::MergeStatus::NeedsMerge {
        let urn = ws.window_fn.as_ref().map_or("", |f| f.urn.as_str());
        return Err(EngineError::UnsupportedWindowFn(format!("merging window fn {urn}")));
    }
    if let Some(spec) = &ws.window_fn {
        WindowFn::try_from(spec)?;
    }
    if let Some(trigger) = &ws.trigger {
        Trigger::try_from(trigger)?;
    }
    Ok(())
}

fn pcollection<'a>(
    pcoll: &str,
    comps: &'a pipeline::Components,
) -> Result<&'a pipeline::PCollection, EngineError> {
    comps
        .pcollections
        .get(pcoll)
        .ok_or_else(|| EngineError::UnknownPCollection(pcoll.to_string()))
}

fn windowing_strategy<'a>(
    pcoll: &str,
    comps: &'a pipeline::Components,
) -> Result<&'a pipeline::WindowingStrategy, EngineError> {
    let p = pcollection(pcoll, comps)?;
    comps
        .windowing_strategies
        .get(&p.windowing_strategy_id)
        .ok_or_else(|| {
            EngineError::malformed(format!(
                "pcollection {pcoll} references unknown windowing strategy {:?}",
                p.windowing_strategy_id
            ))
        })
}

fn only_input(stage: &StageDescriptor) -> Result<&String, EngineError> {
    match stage.inputs.as_slice() {
        [input] => Ok(input),
        inputs => Err(EngineError::malformed(format!(
            "{} ({}) has {} inputs, expected one",
            stage.name,
            stage.transform_id,
            inputs.len()
        ))),
    }
}

fn sorted_values(map: &HashMap<String, String>) -> Vec<String> {
    let mut values: Vec<String> = map.values().cloned().collect();
    values.sort();
    values
}

fn spec_payload(t: &pipeline::PTransform) -> &[u8] {
    t.spec.as_ref().map_or(&[], |s| s.payload.as_slice())
}
