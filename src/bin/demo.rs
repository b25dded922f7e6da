//! Multi-domain research demo
//!
//! Routes a task to a specialist with the rules in `demos/research.toml`,
//! runs it against a stub search capability and prints the `RunResult` as
//! JSON on stdout. Logs go to stderr and are filtered with `RUST_LOG`.
//!
//! Usage: tower-handoff-demo [--config PATH] [TASK...]

use std::env;

use serde::Deserialize;
use serde_json::{json, Value};
use tower_handoff::{
    tracing_sink, worker_fn, BoxError, EngineBuilder, EngineConfig, HandoffRequest, Payload, Task,
    WorkerAction, WorkerRequest, WorkerSvc,
};
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter};

const DEFAULT_CONFIG: &str = include_str!("../../demos/research.toml");

#[derive(Debug, Deserialize)]
struct SearchArgs {
    query: String,
    domain: String,
}

/// Canned search results; no network access.
fn stub_search(input: Value) -> Result<Value, BoxError> {
    let args: SearchArgs = serde_json::from_value(input)?;
    Ok(json!([
        format!("{} overview: {}", args.domain, args.query),
        format!("Recent {} papers mentioning '{}'", args.domain, args.query),
    ]))
}

fn specialist(domain: &'static str) -> WorkerSvc {
    worker_fn(move |req: WorkerRequest| async move {
        match req.payload {
            Payload::Start | Payload::Handoff { .. } => Ok(WorkerAction::call(
                "webSearch",
                json!({"query": req.task.text, "domain": domain}),
            )),
            Payload::CapabilityResult { .. } => Ok(WorkerAction::Handoff(
                HandoffRequest::to("Writer").with_reason(format!("{} findings ready", domain)),
            )),
            Payload::CapabilityFailed(failure) => {
                Ok(WorkerAction::final_output(json!({"error": failure.to_string()})))
            }
        }
    })
}

fn writer() -> WorkerSvc {
    worker_fn(|req: WorkerRequest| async move {
        let Some(results) = req.context.get_as::<Vec<String>>("searchResults") else {
            return Ok(WorkerAction::final_output(
                json!({"error": "no search results in context"}),
            ));
        };
        Ok(WorkerAction::final_output(json!({
            "topic": req.task.text,
            "report": results.join(" "),
            "sources": results.len(),
        })))
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut args = env::args().skip(1).peekable();
    let config = if args.peek().map(String::as_str) == Some("--config") {
        args.next();
        let path = args.next().ok_or("--config needs a path")?;
        EngineConfig::from_path(path)?
    } else {
        EngineConfig::from_toml_str(DEFAULT_CONFIG)?
    };
    let words: Vec<String> = args.collect();
    let task = if words.is_empty() {
        Task::new("explain CRISPR")
    } else {
        Task::new(words.join(" "))
    };

    let engine = EngineBuilder::from_config(config)
        .bind_worker("Biology", specialist("biology"))
        .bind_worker("ComputerScience", specialist("computer science"))
        .bind_worker("General", specialist("general"))
        .bind_worker("Writer", writer())
        .bind_capability(
            "webSearch",
            tower::service_fn(|input: Value| async move { stub_search(input) }),
        )
        .trace_sink(tracing_sink())
        .build()?;

    let result = engine.run(task).await;
    info!(success = result.is_success(), steps = result.steps, "run complete");
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
