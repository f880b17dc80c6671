//! Keyed click counting with runner-held state.
//!
//! ```text
//! impulse -> clicks (emits KV<user, click>) -> count (stateful, bag "seen")
//! ```
//!
//! The `count` worker never keeps anything between bundles: every bundle
//! reads the user's bag from the request's state snapshot and appends the
//! new clicks through state writes. Bundles of one user never overlap, so
//! the running totals stay exact even with several bundles in flight.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;

use brook_core::coder::{decode_varint, encode_length_prefixed};
use brook_core::engine::EngineConfig;
use brook_core::job::run_pipeline;
use brook_core::pipeline::{ParDoPayload, PipelineBuilder, StateSpec, state_spec};
use brook_core::runtime::{BundleRequest, BundleResponse, FnWorker, WorkerRegistry};
use brook_core::state::{LinkId, StateId, StateWrite};
use brook_core::types::{Element, MIN_TIMESTAMP};
use brook_core::window::Window;

const CLICKS: &[(&str, &str)] = &[
    ("alice", "home"),
    ("bob", "search"),
    ("alice", "cart"),
    ("carol", "home"),
    ("alice", "checkout"),
    ("bob", "home"),
];

fn lp(s: &str) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_length_prefixed(s.as_bytes(), &mut buf);
    buf
}

fn clicks(req: &BundleRequest) -> Result<BundleResponse> {
    let (out, info) = req.only_output()?;
    let mut data = Vec::new();
    for (user, page) in CLICKS {
        let mut value = lp(user);
        value.extend(lp(page));
        info.encode_element(&Element::new(Window::Global, MIN_TIMESTAMP, value), &mut data)?;
    }
    let mut response = BundleResponse::default();
    response.data.insert(out.to_string(), data);
    Ok(response)
}

type Totals = Mutex<BTreeMap<String, usize>>;

fn count(req: &BundleRequest, totals: &Totals) -> Result<BundleResponse> {
    let mut response = BundleResponse::default();
    let mut seen: BTreeMap<StateId, usize> = BTreeMap::new();
    for e in req.input.decode_elements(&req.data)? {
        let key = e.key_bytes.clone().unwrap_or_default();
        let id = StateId {
            link: LinkId::new(&req.transform_id, "seen"),
            key: key.clone(),
            window: e.window,
        };
        let n = seen.entry(id.clone()).or_insert_with(|| req.state.bag(&id).len());
        *n += 1;

        let mut name = key.as_slice();
        decode_varint(&mut name)?;
        let user = String::from_utf8_lossy(name).into_owned();
        println!("{} clicked {} times", user, n);
        totals.lock().unwrap().insert(user, *n);
        response.state_writes.push(StateWrite::BagAppend {
            id,
            data: e.elm_bytes[key.len()..].to_vec(),
        });
    }
    Ok(response)
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut b = PipelineBuilder::new();
    let env = b.environment("local");
    let bytes = b.bytes_coder();
    let kv = b.kv_coder(&bytes, &bytes);
    let impulse = b.impulse("impulse");
    let clicked = b.pardo("clicks", &env, &impulse, &[], ParDoPayload::default(), &kv)?;
    let mut payload = ParDoPayload::default();
    payload.state_specs.insert(
        "seen".to_string(),
        StateSpec {
            spec: Some(state_spec::Spec::Bag(state_spec::Bag {
                element_coder_id: bytes.clone(),
            })),
        },
    );
    b.pardo("count", &env, &clicked, &[], payload, &bytes)?;

    let totals = Arc::new(Mutex::new(BTreeMap::new()));
    let sink = Arc::clone(&totals);
    let worker = FnWorker::new(move |req: BundleRequest| match req.transform_id.as_str() {
        "clicks" => clicks(&req),
        "count" => count(&req, &sink),
        other => anyhow::bail!("unknown transform {other}"),
    });
    let workers = WorkerRegistry::new().with("local", Arc::new(worker));
    let report = run_pipeline(&b.build(), EngineConfig::default(), workers).await?;

    println!("final counts: {:?}", totals.lock().unwrap());
    println!("{}", report.plan);
    Ok(())
}
