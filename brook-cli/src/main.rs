use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use prost::Message;
use tracing_subscriber::EnvFilter;

use brook_core::engine::EngineConfig;
use brook_core::graph::{ExecutionPlan, preprocess};
use brook_core::job::Job;
use brook_core::pipeline::test_stream_payload::{Event, TimestampedElement, event};
use brook_core::pipeline::{
    AccumulationMode, OutputTime, ParDoPayload, Pipeline, PipelineBuilder,
};
use brook_core::runtime::{BundleRequest, BundleResponse, Worker, WorkerRegistry};
use brook_core::window::{Trigger, WindowFn};

#[derive(Parser, Debug)]
#[command(name = "brook")]
#[command(about = "Run portable pipelines on a single process", long_about = None)]
struct Cli {
    /// Default log filter when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the stage plan of a pipeline file.
    Plan {
        pipeline: PathBuf,
        /// Also write the plan, bincode encoded, to this file.
        #[arg(long)]
        dump: Option<PathBuf>,
    },
    /// Execute a pipeline file, passing every user transform's input through.
    Run {
        pipeline: PathBuf,
        #[arg(long, default_value_t = 8)]
        max_in_flight: usize,
        #[arg(long, default_value_t = 3)]
        max_retries: usize,
        #[arg(long)]
        record_watermarks: bool,
        /// Environment ids to serve; defaults to every one the plan uses.
        #[arg(long = "environment")]
        environments: Vec<String>,
        /// Pipeline experiments, e.g. prism_enable_rtc.
        #[arg(long = "experiment")]
        experiments: Vec<String>,
    },
    /// Write a small windowed word pipeline to a file.
    Demo { out: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .context("invalid log filter")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Plan { pipeline, dump } => {
            let plan = preprocess(&read_pipeline(&pipeline)?)?;
            print!("{}", plan);
            if let Some(path) = dump {
                std::fs::write(&path, plan.to_bytes()?)
                    .with_context(|| format!("failed to write {}", path.display()))?;
                println!("plan written to {}", path.display());
            }
        }
        Commands::Run {
            pipeline,
            max_in_flight,
            max_retries,
            record_watermarks,
            environments,
            experiments,
        } => {
            let pipeline = read_pipeline(&pipeline)?;
            let config = EngineConfig {
                max_in_flight_bundles: max_in_flight,
                max_bundle_retries: max_retries,
                record_watermarks,
                ..EngineConfig::default()
            }
            .with_experiments(&experiments);
            let workers = passthrough_workers(&preprocess(&pipeline)?, environments);
            run(&pipeline, config, workers).await?;
        }
        Commands::Demo { out } => {
            std::fs::write(&out, demo_pipeline()?.encode_to_vec())
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("demo pipeline written to {}", out.display());
        }
    }
    Ok(())
}

fn read_pipeline(path: &Path) -> anyhow::Result<Pipeline> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Pipeline::decode(bytes.as_slice())
        .with_context(|| format!("{} is not an encoded pipeline", path.display()))
}

async fn run(
    pipeline: &Pipeline,
    config: EngineConfig,
    workers: WorkerRegistry,
) -> anyhow::Result<()> {
    let job = Arc::new(Job::new("job-001", "cli"));
    let ctrl_c = {
        let job = Arc::clone(&job);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, cancelling {}", job.id());
                job.cancel();
            }
        })
    };
    let result = job.run(pipeline, config, workers).await;
    ctrl_c.abort();

    println!("job {} {}", job.id(), job.state());
    let report = result?;
    for (stage, wm) in &report.output_watermarks {
        println!("  {} output watermark {}", stage, wm);
    }
    for (stage, dropped) in &report.dropped_late {
        println!("  {} dropped {} late elements", stage, dropped);
    }
    if !report.watermark_log.is_empty() {
        println!("  {} watermark changes recorded", report.watermark_log.len());
    }
    Ok(())
}

fn passthrough_workers(plan: &ExecutionPlan, environments: Vec<String>) -> WorkerRegistry {
    let worker: Arc<dyn Worker> = Arc::new(PassthroughWorker);
    let mut workers = WorkerRegistry::new();
    for env in plan.environments() {
        workers.register(env, Arc::clone(&worker));
    }
    for env in environments {
        workers.register(env, Arc::clone(&worker));
    }
    workers
}

/// Re-emits every input element unchanged on each output.
struct PassthroughWorker;

#[async_trait]
impl Worker for PassthroughWorker {
    async fn execute_bundle(&self, req: BundleRequest) -> anyhow::Result<BundleResponse> {
        let elements = req.input.decode_elements(&req.data)?;
        tracing::info!(
            "{} ({}): {} elements, {} timers at watermark {}",
            req.transform_id,
            req.stage,
            elements.len(),
            req.timers.len(),
            req.watermark
        );
        let mut response = BundleResponse::default();
        for (id, info) in &req.outputs {
            let mut buf = Vec::new();
            for e in &elements {
                info.encode_element(e, &mut buf)?;
            }
            response.data.insert(id.clone(), buf);
        }
        Ok(response)
    }
}

/// words -> fixed 1s windows -> group by key -> print
fn demo_pipeline() -> anyhow::Result<Pipeline> {
    let mut b = PipelineBuilder::new();
    let env = b.environment("passthrough");
    let bytes = b.bytes_coder();
    let kv = b.kv_coder(&bytes, &bytes);

    let word = |w: &str, ts: i64| {
        let mut value = Vec::new();
        for part in [w, "1"] {
            brook_core::coder::encode_length_prefixed(part.as_bytes(), &mut value);
        }
        TimestampedElement {
            encoded_element: value,
            timestamp: ts,
        }
    };
    let events = vec![
        Event {
            kind: Some(event::Kind::ElementEvent(event::AddElements {
                elements: vec![word("brook", 100), word("river", 250), word("brook", 900)],
                tag: "out".to_string(),
            })),
        },
        Event {
            kind: Some(event::Kind::WatermarkEvent(event::AdvanceWatermark {
                new_watermark: 1_000,
                tag: "out".to_string(),
            })),
        },
        Event {
            kind: Some(event::Kind::ElementEvent(event::AddElements {
                elements: vec![word("brook", 1_500), word("delta", 400)],
                tag: "out".to_string(),
            })),
        },
    ];
    let words = b.test_stream("words", &kv, PipelineBuilder::GLOBAL_WINDOWING, events);

    let fixed = b.windowing(
        "fixed-1s",
        &WindowFn::Fixed {
            size: 1_000,
            offset: 0,
        },
        &Trigger::AfterEndOfWindow {
            early: None,
            late: Some(Box::new(Trigger::ElementCount(1))),
        },
        AccumulationMode::Discarding,
        OutputTime::EndOfWindow,
        5_000,
    );
    let windowed = b.window_into("window", &words, &fixed)?;
    let grouped = b.group_by_key("group", &windowed)?;
    let grouped_coder = b
        .components()
        .pcollections
        .get(&grouped)
        .map(|p| p.coder_id.clone())
        .context("group output missing")?;
    b.pardo("print", &env, &grouped, &[], ParDoPayload::default(), &grouped_coder)?;
    Ok(b.build())
}
