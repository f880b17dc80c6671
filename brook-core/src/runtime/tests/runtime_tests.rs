use std::sync::atomic::{AtomicUsize, Ordering};

use super::*;
use crate::coder::{WindowCoder, encode_length_prefixed, encode_windowed_value};
use crate::engine::{EngineConfig, FiredPane, SideInputData};
use crate::graph::preprocess;
use crate::pipeline::{ParDoPayload, PipelineBuilder};
use crate::types::{Element, MAX_TIMESTAMP};
use crate::window::{PaneInfo, Window, WindowFn};

fn enc(s: &str) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_length_prefixed(s.as_bytes(), &mut buf);
    buf
}

fn input(stage: usize, elements: Vec<Element>) -> BundleInput {
    BundleInput {
        stage: StageId(stage),
        elements,
        panes: Vec::new(),
        timers: Vec::new(),
        side_inputs: Vec::new(),
        state: StateSnapshot::default(),
        processing_time: 0,
        watermark: 0,
    }
}

fn context(b: PipelineBuilder) -> StageContext {
    StageContext::new(Arc::new(preprocess(&b.build()).unwrap()))
}

fn stage_of<'a>(ctx: &'a StageContext, transform: &str) -> &'a StageDescriptor {
    (0..)
        .map_while(|i| ctx.stage(StageId(i)).ok())
        .find(|s| s.transform_id == transform)
        .unwrap()
}

#[test]
fn test_flatten_reencodes_elements() {
    let mut b = PipelineBuilder::new();
    let a = b.impulse("a");
    let c = b.impulse("c");
    b.flatten("flat", &[&a, &c]).unwrap();
    let ctx = context(b);
    let flat = stage_of(&ctx, "flat");

    let out = ctx
        .run_native(flat, &input(2, vec![Element::new(Window::Global, 5, enc("x"))]))
        .unwrap();
    let elements = ctx
        .pcollection("flat.out")
        .unwrap()
        .decode_elements(&out.data["flat.out"])
        .unwrap();
    assert_eq!(elements.len(), 1);
    assert_eq!(elements[0].elm_bytes, enc("x"));
    assert_eq!(elements[0].timestamp, 5);
}

#[test]
fn test_window_into_assigns_every_window() {
    let mut b = PipelineBuilder::new();
    let imp = b.impulse("impulse");
    let sliding = b.windowing(
        "sliding",
        &WindowFn::Sliding {
            size: 10,
            period: 5,
            offset: 0,
        },
        &crate::window::Trigger::Default,
        crate::pipeline::AccumulationMode::Discarding,
        crate::pipeline::OutputTime::EndOfWindow,
        0,
    );
    b.window_into("win", &imp, &sliding).unwrap();
    let ctx = context(b);

    let out = ctx
        .run_native(
            stage_of(&ctx, "win"),
            &input(1, vec![Element::new(Window::Global, 7, enc("x"))]),
        )
        .unwrap();
    let mut windows: Vec<Window> = ctx
        .pcollection("win.out")
        .unwrap()
        .decode_elements(&out.data["win.out"])
        .unwrap()
        .into_iter()
        .map(|e| e.window)
        .collect();
    windows.sort();
    assert_eq!(windows, vec![Window::interval(0, 10), Window::interval(5, 15)]);
}

#[test]
fn test_group_by_key_emits_grouped_panes() {
    let mut b = PipelineBuilder::new();
    let bytes = b.bytes_coder();
    let kv = b.kv_coder(&bytes, &bytes);
    let src = b.test_stream("src", &kv, PipelineBuilder::GLOBAL_WINDOWING, Vec::new());
    b.group_by_key("gbk", &src).unwrap();
    let ctx = context(b);

    let mut bundle = input(1, Vec::new());
    bundle.panes.push(FiredPane {
        key: enc("k"),
        window: Window::Global,
        timestamp: 3,
        pane: PaneInfo::no_firing(),
        values: vec![enc("1"), enc("2")],
    });
    let out = ctx.run_native(stage_of(&ctx, "gbk"), &bundle).unwrap();
    let elements = ctx
        .pcollection("gbk.out")
        .unwrap()
        .decode_elements(&out.data["gbk.out"])
        .unwrap();
    assert_eq!(elements.len(), 1);
    assert_eq!(elements[0].key_bytes, Some(enc("k")));

    let mut expected = enc("k");
    expected.extend(2i32.to_be_bytes());
    expected.extend(enc("1"));
    expected.extend(enc("2"));
    assert_eq!(elements[0].elm_bytes, expected);
}

#[test]
fn test_sources_never_execute_bundles() {
    let mut b = PipelineBuilder::new();
    b.impulse("impulse");
    let ctx = context(b);
    assert!(matches!(
        ctx.run_native(stage_of(&ctx, "impulse"), &input(0, Vec::new())),
        Err(EngineError::Malformed(_))
    ));
}

#[test]
fn test_request_carries_side_inputs_and_outputs() {
    let mut b = PipelineBuilder::new();
    let env = b.environment("sdk");
    let imp = b.impulse("impulse");
    let side = b.impulse("side");
    let bytes = b.bytes_coder();
    b.pardo("user", &env, &imp, &[("s0", &side)], ParDoPayload::default(), &bytes)
        .unwrap();
    let ctx = context(b);
    let user = stage_of(&ctx, "user");

    let mut bundle = input(user.id.0, vec![Element::new(Window::Global, 1, enc("x"))]);
    bundle.side_inputs.push(SideInputData {
        input: user.side_inputs[0].clone(),
        elements: vec![Element::new(Window::Global, 2, enc("s"))],
    });
    let rb = ReadyBundle {
        stage: user.id,
        instruction_id: "inst001".to_string(),
        watermark: 0,
    };
    let req = ctx.request(user, &rb, bundle).unwrap();
    assert_eq!(req.environment, "sdk");
    assert_eq!(req.instruction_id, "inst001");
    assert_eq!(req.input.decode_elements(&req.data).unwrap()[0].elm_bytes, enc("x"));
    assert_eq!(req.side_inputs.keys().collect::<Vec<_>>(), vec!["s0"]);
    let side = &req.side_inputs["s0"];
    assert_eq!(side.pcollection.global_id, "side.out");
    assert_eq!(side.pcollection.decode_elements(&side.data).unwrap()[0].elm_bytes, enc("s"));
    let (out, _) = req.only_output().unwrap();
    assert_eq!(out, "user.out");

    let imp_stage = stage_of(&ctx, "impulse");
    assert!(ctx.request(imp_stage, &rb, input(0, Vec::new())).is_err());
}

// ── Executor ─────────────────────────────────────────────────────────────────

/// impulse -> user (worker of "sdk")
fn single_user_stage() -> Arc<ExecutionPlan> {
    let mut b = PipelineBuilder::new();
    let env = b.environment("sdk");
    let imp = b.impulse("impulse");
    let bytes = b.bytes_coder();
    b.pardo("user", &env, &imp, &[], ParDoPayload::default(), &bytes)
        .unwrap();
    Arc::new(preprocess(&b.build()).unwrap())
}

async fn run_with(
    plan: Arc<ExecutionPlan>,
    worker: Arc<dyn Worker>,
    config: EngineConfig,
    cancel: CancellationToken,
) -> Result<Arc<ElementManager>> {
    let em = Arc::new(ElementManager::new(config));
    plan.register(&em).unwrap();
    let executor =
        Executor::new(Arc::clone(&em), plan, WorkerRegistry::new().with("sdk", worker)).unwrap();
    executor.run(cancel).await?;
    Ok(em)
}

fn echo(req: &BundleRequest) -> Result<BundleResponse> {
    let (out, info) = req.only_output()?;
    let mut buf = Vec::new();
    for e in req.input.decode_elements(&req.data)? {
        info.encode_element(&e, &mut buf)?;
    }
    Ok(BundleResponse {
        data: HashMap::from([(out.to_string(), buf)]),
        ..BundleResponse::default()
    })
}

#[tokio::test]
async fn test_executor_retries_failed_bundles() {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    let worker = FnWorker::new(move |req| {
        if seen.fetch_add(1, Ordering::SeqCst) < 2 {
            anyhow::bail!("transient failure");
        }
        echo(&req)
    });
    let em = run_with(
        single_user_stage(),
        Arc::new(worker),
        EngineConfig::default(),
        CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(em.is_done());
    assert_eq!(em.output_watermark(StageId(1)), Some(MAX_TIMESTAMP));
}

#[tokio::test]
async fn test_executor_gives_up_after_retry_budget() {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    let worker = FnWorker::new(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("always broken")
    });
    let config = EngineConfig {
        max_bundle_retries: 1,
        ..EngineConfig::default()
    };
    let err = run_with(
        single_user_stage(),
        Arc::new(worker),
        config,
        CancellationToken::new(),
    )
    .await
    .unwrap_err();
    match err.downcast_ref::<EngineError>() {
        Some(EngineError::BundleFailed {
            stage,
            attempts,
            cause,
            ..
        }) => {
            assert_eq!(stage, "stage-001");
            assert_eq!(*attempts, 2);
            assert!(cause.contains("always broken"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_undecodable_output_aborts_without_retry() {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    let worker = FnWorker::new(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
        Ok(BundleResponse {
            data: HashMap::from([("user.out".to_string(), vec![0x80])]),
            ..BundleResponse::default()
        })
    });
    let err = run_with(
        single_user_stage(),
        Arc::new(worker),
        EngineConfig::default(),
        CancellationToken::new(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err.downcast_ref::<EngineError>(), Some(EngineError::Decode(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_corrupt_window_header_fails_the_job() {
    let mut truncated = Vec::new();
    encode_windowed_value(
        WindowCoder::Global,
        &[Window::Global],
        0,
        &PaneInfo::no_firing(),
        &enc("x"),
        &mut truncated,
    )
    .unwrap();
    truncated.truncate(truncated.len() - 1);
    let mut oversized = 0i64.to_be_bytes().to_vec();
    oversized.extend(i32::MAX.to_be_bytes());
    oversized.push(0x0f);
    oversized.extend(enc("x"));

    for payload in [truncated, oversized] {
        let worker = FnWorker::new(move |_| {
            Ok(BundleResponse {
                data: HashMap::from([("user.out".to_string(), payload.clone())]),
                ..BundleResponse::default()
            })
        });
        let err = run_with(
            single_user_stage(),
            Arc::new(worker),
            EngineConfig::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err.downcast_ref::<EngineError>(), Some(EngineError::Decode(_))));
    }
}

#[tokio::test]
async fn test_panicking_worker_is_retried() {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    let worker = FnWorker::new(move |req| {
        if seen.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("worker crashed");
        }
        echo(&req)
    });
    run_with(
        single_user_stage(),
        Arc::new(worker),
        EngineConfig::default(),
        CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_missing_worker_is_rejected_up_front() {
    let plan = single_user_stage();
    let em = Arc::new(ElementManager::new(EngineConfig::default()));
    let Err(err) = Executor::new(em, plan, WorkerRegistry::new()) else {
        panic!("executor accepted a plan without workers");
    };
    assert_eq!(err, EngineError::UnknownEnvironment("sdk".to_string()));
}

#[tokio::test]
async fn test_cancellation_stops_dispatch() {
    // impulse -> first -> second; cancelling inside `first` keeps `second`
    // from ever running.
    let mut b = PipelineBuilder::new();
    let env = b.environment("sdk");
    let imp = b.impulse("impulse");
    let bytes = b.bytes_coder();
    let first = b
        .pardo("first", &env, &imp, &[], ParDoPayload::default(), &bytes)
        .unwrap();
    b.pardo("second", &env, &first, &[], ParDoPayload::default(), &bytes)
        .unwrap();
    let plan = Arc::new(preprocess(&b.build()).unwrap());

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let transforms = Arc::new(std::sync::Mutex::new(Vec::new()));
    let log = Arc::clone(&transforms);
    let worker = FnWorker::new(move |req| {
        log.lock().unwrap().push(req.transform_id.clone());
        token.cancel();
        echo(&req)
    });
    let err = run_with(plan, Arc::new(worker), EngineConfig::default(), cancel)
        .await
        .unwrap_err();
    assert!(matches!(err.downcast_ref::<EngineError>(), Some(EngineError::Cancelled(_))));
    assert_eq!(*transforms.lock().unwrap(), vec!["first".to_string()]);
}
