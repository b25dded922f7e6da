use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use serde_json::{json, Value};
use tokio::runtime::Runtime;
use tower_handoff::{
    worker_fn, BoxError, CapabilityDef, Dispatcher, Orchestrator, Payload, Task, TurnBudget,
    WorkerAction, WorkerDef, WorkerRequest,
};

// Two workers bouncing control until the budget ends the run.
fn ping_pong() -> Orchestrator {
    Orchestrator::builder()
        .worker(
            WorkerDef::new("A", worker_fn(|_req| async move { Ok(WorkerAction::handoff("B")) }))
                .handoff_to("B"),
        )
        .worker(
            WorkerDef::new("B", worker_fn(|_req| async move { Ok(WorkerAction::handoff("A")) }))
                .handoff_to("A"),
        )
        .dispatcher(Dispatcher::new("A"))
        .build()
        .unwrap()
}

// One worker calling an in-memory capability N times, then finishing.
fn capability_loop(calls: usize) -> Orchestrator {
    let worker = WorkerDef::new(
        "Caller",
        worker_fn(move |req: WorkerRequest| async move {
            match req.payload {
                Payload::Start | Payload::CapabilityResult { .. } if req.step < calls => {
                    Ok(WorkerAction::call("echo", json!({ "step": req.step })))
                }
                _ => Ok(WorkerAction::final_output(req.step)),
            }
        }),
    )
    .capability("echo");
    Orchestrator::builder()
        .worker(worker)
        .capability(CapabilityDef::new(
            "echo",
            "echoed",
            tower::service_fn(|v: Value| async move { Ok::<_, BoxError>(v) }),
        ))
        .dispatcher(Dispatcher::new("Caller"))
        .budget(TurnBudget::steps(calls + 1))
        .build()
        .unwrap()
}

fn bench_run_loop(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let handoffs = ping_pong();
    c.bench_function("handoff_cycle_64_steps", |b| {
        b.to_async(&rt).iter_batched(
            || Task::new("bounce"),
            |task| {
                let handoffs = handoffs.clone();
                async move {
                    let _ = handoffs.run_with_budget(task, TurnBudget::steps(64)).await;
                }
            },
            BatchSize::SmallInput,
        )
    });

    let calls = capability_loop(32);
    c.bench_function("capability_calls_32", |b| {
        b.to_async(&rt).iter_batched(
            || Task::new("call"),
            |task| {
                let calls = calls.clone();
                async move {
                    let result = calls.run(task).await;
                    assert!(result.is_success());
                }
            },
            BatchSize::SmallInput,
        )
    });

    // Many independent runs sharing one engine
    c.bench_function("concurrent_runs_16", |b| {
        b.to_async(&rt).iter(|| {
            let calls = calls.clone();
            async move {
                let runs = (0..16).map(|i| {
                    let calls = calls.clone();
                    tokio::spawn(async move { calls.run(Task::new(format!("call {}", i))).await })
                });
                for r in futures::future::join_all(runs).await {
                    let _ = r.unwrap();
                }
            }
        })
    });
}

criterion_group!(benches, bench_run_loop);
criterion_main!(benches);
