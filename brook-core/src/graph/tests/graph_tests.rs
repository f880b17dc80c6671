use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::*;
use crate::engine::{Accumulation, BundleOutputs, EngineConfig, OutputTimePolicy, instruction_ids};
use crate::pipeline::test_stream_payload::{Event, TimestampedElement, event};
use crate::pipeline::{AccumulationMode, OutputTime, ParDoPayload, PipelineBuilder};
use crate::window::Trigger as WindowTrigger;

fn stage<'a>(plan: &'a ExecutionPlan, transform: &str) -> &'a StageDescriptor {
    plan.stages
        .iter()
        .find(|s| s.transform_id == transform)
        .unwrap_or_else(|| panic!("no stage for {transform}"))
}

/// impulse -> keyed (user) -> gbk -> sink (user)
fn keyed_pipeline() -> PipelineBuilder {
    let mut b = PipelineBuilder::new();
    let env = b.environment("sdk");
    let imp = b.impulse("impulse");
    let bytes = b.bytes_coder();
    let kv = b.kv_coder(&bytes, &bytes);
    let keyed = b
        .pardo("keyed", &env, &imp, &[], ParDoPayload::default(), &kv)
        .unwrap();
    let grouped = b.group_by_key("gbk", &keyed).unwrap();
    b.pardo("sink", &env, &grouped, &[], ParDoPayload::default(), &bytes)
        .unwrap();
    b
}

fn element_event(tag: &str, values: &[(&[u8], i64)]) -> Event {
    Event {
        kind: Some(event::Kind::ElementEvent(event::AddElements {
            elements: values
                .iter()
                .map(|(v, ts)| TimestampedElement {
                    encoded_element: v.to_vec(),
                    timestamp: *ts,
                })
                .collect(),
            tag: tag.to_string(),
        })),
    }
}

#[test]
fn test_stages_follow_topological_order() {
    let mut p = keyed_pipeline().build();
    // Declaration order must not matter.
    p.root_transform_ids.reverse();
    let plan = preprocess(&p).unwrap();

    let order: Vec<&str> = plan.stages.iter().map(|s| s.transform_id.as_str()).collect();
    assert_eq!(order, vec!["impulse", "keyed", "gbk", "sink"]);
    for (i, s) in plan.stages.iter().enumerate() {
        assert_eq!(s.id, StageId(i));
        assert_eq!(s.name, format!("stage-{i:03}"));
    }
    assert_eq!(plan.stages[0].op, StageOp::Impulse);
    assert_eq!(plan.environments(), BTreeSet::from(["sdk"]));
    assert_eq!(plan.pcollections.len(), 4);
    assert!(plan.pcollection("gbk.out").unwrap().key.is_some());
}

#[test]
fn test_group_by_key_takes_input_windowing() {
    let mut b = PipelineBuilder::new();
    let env = b.environment("sdk");
    let imp = b.impulse("impulse");
    let bytes = b.bytes_coder();
    let kv = b.kv_coder(&bytes, &bytes);
    let keyed = b
        .pardo("keyed", &env, &imp, &[], ParDoPayload::default(), &kv)
        .unwrap();
    let trigger = WindowTrigger::AfterEndOfWindow {
        early: None,
        late: Some(Box::new(WindowTrigger::ElementCount(1))),
    };
    let fixed = b.windowing(
        "fixed",
        &WindowFn::Fixed { size: 10, offset: 0 },
        &trigger,
        AccumulationMode::Accumulating,
        OutputTime::EarliestInPane,
        100,
    );
    let windowed = b.window_into("win", &keyed, &fixed).unwrap();
    b.group_by_key("gbk", &windowed).unwrap();
    let plan = preprocess(&b.build()).unwrap();

    assert_eq!(
        stage(&plan, "win").op,
        StageOp::WindowInto(WindowFn::Fixed { size: 10, offset: 0 })
    );
    let StageOp::GroupByKey(strat) = &stage(&plan, "gbk").op else {
        panic!("gbk is not a group by key stage");
    };
    assert_eq!(strat.allowed_lateness, 100);
    assert_eq!(strat.accumulation, Accumulation::Accumulating);
    assert_eq!(strat.output_time, OutputTimePolicy::EarliestInPane);
    assert_eq!(strat.trigger, trigger);
}

#[test]
fn test_flatten_deduplicates_inputs() {
    let mut b = PipelineBuilder::new();
    let a = b.impulse("a");
    let c = b.impulse("c");
    b.flatten("flat", &[&c, &a, &c]).unwrap();
    let plan = preprocess(&b.build()).unwrap();
    let flat = stage(&plan, "flat");
    assert_eq!(flat.op, StageOp::Flatten);
    assert_eq!(flat.inputs, vec!["a.out".to_string(), "c.out".to_string()]);
}

#[test]
fn test_test_stream_events_are_scripted() {
    let mut b = PipelineBuilder::new();
    let string = b.string_coder();
    b.test_stream(
        "ts",
        &string,
        PipelineBuilder::GLOBAL_WINDOWING,
        vec![
            element_event("out", &[(b"ab", 5)]),
            Event {
                kind: Some(event::Kind::WatermarkEvent(event::AdvanceWatermark {
                    new_watermark: 10,
                    tag: "out".to_string(),
                })),
            },
            Event {
                kind: Some(event::Kind::ProcessingTimeEvent(event::AdvanceProcessingTime {
                    advance_duration: MAX_TIMESTAMP,
                })),
            },
        ],
    );
    let plan = preprocess(&b.build()).unwrap();

    let StageOp::TestStream { tags, events } = &stage(&plan, "ts").op else {
        panic!("ts is not a test stream stage");
    };
    assert_eq!(tags, &BTreeMap::from([("out".to_string(), "ts.out".to_string())]));
    assert_eq!(
        events,
        &vec![
            // String values are length prefixed for the engine's decoder.
            ScriptedEvent::Elements {
                tag: "out".to_string(),
                elements: vec![(vec![2, b'a', b'b'], 5)],
            },
            ScriptedEvent::Watermark {
                tag: "out".to_string(),
                watermark: 10,
            },
            ScriptedEvent::ProcessingTime {
                advance: MAX_TIMESTAMP,
            },
        ]
    );
}

#[test]
fn test_test_stream_keeps_measurable_values() {
    let mut b = PipelineBuilder::new();
    let varint = b.varint_coder();
    b.test_stream(
        "ts",
        &varint,
        PipelineBuilder::GLOBAL_WINDOWING,
        vec![element_event("out", &[(&[7], 1)])],
    );
    let plan = preprocess(&b.build()).unwrap();
    let StageOp::TestStream { events, .. } = &stage(&plan, "ts").op else {
        panic!("ts is not a test stream stage");
    };
    assert_eq!(
        events[0],
        ScriptedEvent::Elements {
            tag: "out".to_string(),
            elements: vec![(vec![7], 1)],
        }
    );
}

#[test]
fn test_test_stream_rejects_empty_event() {
    let mut b = PipelineBuilder::new();
    let bytes = b.bytes_coder();
    b.test_stream(
        "ts",
        &bytes,
        PipelineBuilder::GLOBAL_WINDOWING,
        vec![Event { kind: None }],
    );
    assert!(matches!(preprocess(&b.build()), Err(EngineError::Malformed(_))));
}

#[test]
fn test_pardo_splits_side_inputs_and_collects_state() {
    use crate::pipeline::{StateSpec, TimeDomain, TimerFamilySpec, state_spec};

    let mut b = PipelineBuilder::new();
    let env = b.environment("sdk");
    let imp = b.impulse("impulse");
    let side = b.impulse("side");
    let bytes = b.bytes_coder();
    let kv = b.kv_coder(&bytes, &bytes);
    let keyed = b
        .pardo("keyed", &env, &imp, &[], ParDoPayload::default(), &kv)
        .unwrap();

    let mut payload = ParDoPayload::default();
    payload.state_specs.insert(
        "bag".to_string(),
        StateSpec {
            spec: Some(state_spec::Spec::Bag(state_spec::Bag {
                element_coder_id: bytes.clone(),
            })),
        },
    );
    payload.timer_family_specs.insert(
        "tick".to_string(),
        TimerFamilySpec {
            time_domain: TimeDomain::ProcessingTime as i32,
            timer_family_coder_id: bytes.clone(),
        },
    );
    payload.timer_family_specs.insert(
        "expiry".to_string(),
        TimerFamilySpec {
            time_domain: TimeDomain::EventTime as i32,
            timer_family_coder_id: bytes.clone(),
        },
    );
    payload.on_window_expiration_timer_family_spec = "expiry".to_string();
    b.pardo("stateful", &env, &keyed, &[("s0", &side)], payload, &bytes)
        .unwrap();
    let plan = preprocess(&b.build()).unwrap();

    let st = stage(&plan, "stateful");
    assert_eq!(st.inputs, vec!["keyed.out".to_string()]);
    assert_eq!(
        st.side_inputs,
        vec![SideInputRef {
            transform_id: "stateful".to_string(),
            local_id: "s0".to_string(),
            pcollection: "side.out".to_string(),
        }]
    );
    assert_eq!(st.op.label(), "stateful_pardo");
    let StageOp::ParDo {
        environment,
        stateful: Some(spec),
    } = &st.op
    else {
        panic!("stateful is not a stateful pardo");
    };
    assert_eq!(environment, "sdk");
    assert_eq!(
        spec.state_decoders,
        BTreeMap::from([(LinkId::new("stateful", "bag"), ElementDecoder::LengthPrefixed)])
    );
    assert_eq!(
        spec.processing_families,
        vec![("stateful".to_string(), "tick".to_string())]
    );
    assert_eq!(
        spec.on_window_expiration,
        Some(OnWindowExpiration {
            transform_id: "stateful".to_string(),
            family: "expiry".to_string(),
        })
    );
    assert_eq!(stage(&plan, "keyed").op.label(), "pardo");
}

#[test]
fn test_stateful_pardo_needs_kv_input() {
    use crate::pipeline::{StateSpec, state_spec};

    let mut b = PipelineBuilder::new();
    let env = b.environment("sdk");
    let imp = b.impulse("impulse");
    let bytes = b.bytes_coder();
    let mut payload = ParDoPayload::default();
    payload.state_specs.insert(
        "value".to_string(),
        StateSpec {
            spec: Some(state_spec::Spec::ReadModifyWrite(
                state_spec::ReadModifyWrite {
                    coder_id: bytes.clone(),
                },
            )),
        },
    );
    b.pardo("stateful", &env, &imp, &[], payload, &bytes).unwrap();
    assert!(matches!(preprocess(&b.build()), Err(EngineError::Malformed(_))));
}

#[test]
fn test_unknown_environment_is_rejected() {
    let mut b = PipelineBuilder::new();
    let imp = b.impulse("impulse");
    let bytes = b.bytes_coder();
    b.pardo("user", "nowhere", &imp, &[], ParDoPayload::default(), &bytes)
        .unwrap();
    assert!(matches!(
        preprocess(&b.build()),
        Err(EngineError::UnknownEnvironment(env)) if env == "nowhere"
    ));
}

#[test]
fn test_merging_windows_are_rejected() {
    let mut p = keyed_pipeline().build();
    let comps = p.components.as_mut().unwrap();
    comps
        .windowing_strategies
        .get_mut(PipelineBuilder::GLOBAL_WINDOWING)
        .unwrap()
        .merge_status = pipeline::MergeStatus::NeedsMerge as i32;
    assert!(matches!(preprocess(&p), Err(EngineError::UnsupportedWindowFn(_))));
}

#[test]
fn test_processing_time_triggers_are_rejected() {
    use crate::pipeline::trigger::{AfterProcessingTime, Kind};

    let mut p = keyed_pipeline().build();
    let comps = p.components.as_mut().unwrap();
    comps
        .windowing_strategies
        .get_mut(PipelineBuilder::GLOBAL_WINDOWING)
        .unwrap()
        .trigger = Some(pipeline::Trigger {
        kind: Some(Kind::AfterProcessingTime(AfterProcessingTime {})),
    });
    assert!(matches!(preprocess(&p), Err(EngineError::UnsupportedTrigger(_))));
}

#[test]
fn test_malformed_graphs_are_rejected() {
    let mut p = keyed_pipeline().build();
    p.root_transform_ids.clear();
    assert!(matches!(preprocess(&p), Err(EngineError::Malformed(_))));

    let mut p = keyed_pipeline().build();
    p.root_transform_ids.push("ghost".to_string());
    assert!(matches!(preprocess(&p), Err(EngineError::Malformed(_))));

    // A transform reading its own output never becomes ready.
    let mut p = keyed_pipeline().build();
    let comps = p.components.as_mut().unwrap();
    let sink = comps.transforms.get_mut("sink").unwrap();
    sink.inputs.insert("loop".to_string(), "sink.out".to_string());
    assert!(matches!(preprocess(&p), Err(EngineError::Malformed(_))));

    let mut p = keyed_pipeline().build();
    let comps = p.components.as_mut().unwrap();
    let sink = comps.transforms.get_mut("sink").unwrap();
    sink.inputs.insert("in".to_string(), "nobody.out".to_string());
    assert!(matches!(preprocess(&p), Err(EngineError::UnknownPCollection(_))));

    let mut p = keyed_pipeline().build();
    p.components = None;
    assert!(matches!(preprocess(&p), Err(EngineError::Malformed(_))));
}

#[test]
fn test_composites_expand_to_leaves() {
    let mut p = keyed_pipeline().build();
    let comps = p.components.as_mut().unwrap();
    comps.transforms.insert(
        "composite".to_string(),
        pipeline::PTransform {
            unique_name: "Composite".to_string(),
            subtransforms: vec!["gbk".to_string(), "sink".to_string()],
            ..pipeline::PTransform::default()
        },
    );
    p.root_transform_ids = vec![
        "impulse".to_string(),
        "keyed".to_string(),
        "composite".to_string(),
    ];
    let plan = preprocess(&p).unwrap();
    let order: Vec<&str> = plan.stages.iter().map(|s| s.transform_id.as_str()).collect();
    assert_eq!(order, vec!["impulse", "keyed", "gbk", "sink"]);
}

#[test]
fn test_plan_serializes_and_prints() {
    let plan = preprocess(&keyed_pipeline().build()).unwrap();
    let bytes = plan.to_bytes().unwrap();
    assert_eq!(ExecutionPlan::from_bytes(&bytes).unwrap(), plan);
    assert!(ExecutionPlan::from_bytes(&bytes[..bytes.len() / 2]).is_err());

    let text = plan.to_string();
    assert!(text.contains("stage-000 impulse"));
    assert!(text.contains("@sdk"));
    assert_eq!(text.lines().filter(|l| l.starts_with("stage-")).count(), 4);
}

#[tokio::test]
async fn test_registered_plan_primes_impulse() {
    let mut b = PipelineBuilder::new();
    let env = b.environment("sdk");
    let imp = b.impulse("impulse");
    let bytes = b.bytes_coder();
    b.pardo("user", &env, &imp, &[], ParDoPayload::default(), &bytes)
        .unwrap();
    let plan = preprocess(&b.build()).unwrap();

    let em = Arc::new(ElementManager::new(EngineConfig::default()));
    plan.register(&em).unwrap();
    assert_eq!(em.stage_count(), 2);
    assert_eq!(em.stage_id("stage-001"), Some(StageId(1)));

    let mut rx = em.bundles(CancellationToken::new(), instruction_ids());
    let rb = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rb.stage, StageId(1));
    let input = em.input_for_bundle(&rb).unwrap();
    assert_eq!(input.elements.len(), 1);

    em.persist_bundle(&rb, BundleOutputs::default()).unwrap();
    let end = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap();
    assert!(end.is_none());
    assert!(em.is_done());
}
