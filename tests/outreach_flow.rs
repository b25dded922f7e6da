//! Outreach flow: a team lead coordinating profile research and a cold email.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tower_handoff::context::fields;
use tower_handoff::{
    worker_fn, BoxError, CapabilityDef, CapabilityFailureKind, Dispatcher, FailureCause, HandoffRequest,
    Orchestrator, Payload, Task, TurnBudget, WorkerAction, WorkerDef, WorkerRequest, WriteSource,
};

fn team_lead() -> WorkerDef {
    WorkerDef::new(
        "TeamLead",
        worker_fn(|req: WorkerRequest| async move {
            let next = if req.context.contains(fields::PROFILE_DATA) {
                "ColdEmail"
            } else {
                "Research"
            };
            Ok(WorkerAction::Handoff(HandoffRequest::to(next)))
        }),
    )
    .instructions("Coordinate research and outreach.")
    .handoff_to("Research")
    .handoff_to("ColdEmail")
}

/// A lead that skips research entirely.
fn hasty_lead() -> WorkerDef {
    WorkerDef::new(
        "TeamLead",
        worker_fn(|_req| async move { Ok(WorkerAction::handoff("ColdEmail")) }),
    )
    .handoff_to("Research")
    .handoff_to("ColdEmail")
}

fn research() -> WorkerDef {
    WorkerDef::new(
        "Research",
        worker_fn(|req: WorkerRequest| async move {
            match req.payload {
                Payload::Start | Payload::Handoff { .. } => {
                    let url = req.context.get(fields::PROFILE_URL).cloned().unwrap_or(Value::Null);
                    Ok(WorkerAction::call("fetchProfile", json!({ "url": url })))
                }
                Payload::CapabilityResult { .. } => Ok(WorkerAction::handoff("TeamLead")),
                Payload::CapabilityFailed(failure) => Ok(WorkerAction::final_output(json!({
                    "error": failure.message,
                    "capability": failure.capability,
                }))),
            }
        }),
    )
    .handoff_to("TeamLead")
    .capability("fetchProfile")
}

fn cold_email() -> WorkerDef {
    WorkerDef::new(
        "ColdEmail",
        worker_fn(|req: WorkerRequest| async move {
            match req.payload {
                Payload::CapabilityResult { output, .. } => Ok(WorkerAction::Final(output)),
                Payload::CapabilityFailed(failure) => {
                    Ok(WorkerAction::final_output(json!({ "error": failure.message })))
                }
                _ => match req.context.get(fields::PROFILE_DATA) {
                    Some(profile) => Ok(WorkerAction::call(
                        "draftEmail",
                        json!({ "name": req.context.get(fields::NAME), "profile": profile }),
                    )),
                    None => Ok(WorkerAction::final_output(
                        json!({ "error": "profileData is missing" }),
                    )),
                },
            }
        }),
    )
    .handoff_to("TeamLead")
    .capability("draftEmail")
}

fn fetch_profile(calls: Arc<AtomicUsize>) -> CapabilityDef {
    CapabilityDef::new(
        "fetchProfile",
        fields::PROFILE_DATA,
        tower::service_fn(move |input: Value| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let url = input["url"].as_str().unwrap_or_default().to_string();
                Ok::<_, BoxError>(json!({ "url": url, "headline": "Staff Engineer at Acme" }))
            }
        }),
    )
}

fn failing_fetch_profile() -> CapabilityDef {
    CapabilityDef::new(
        "fetchProfile",
        fields::PROFILE_DATA,
        tower::service_fn(|_input: Value| async move { Err::<Value, BoxError>("HTTP 404".into()) }),
    )
}

fn draft_email() -> CapabilityDef {
    CapabilityDef::new(
        "draftEmail",
        fields::GENERATED_ARTIFACT,
        tower::service_fn(|input: Value| async move {
            let name = input["name"].as_str().unwrap_or("there").to_string();
            let headline = input["profile"]["headline"].as_str().unwrap_or_default().to_string();
            Ok::<_, BoxError>(json!(format!("Hi {}, congrats on your role as {}.", name, headline)))
        }),
    )
}

fn engine(lead: WorkerDef, fetch: CapabilityDef) -> Orchestrator {
    Orchestrator::builder()
        .worker(lead)
        .worker(research())
        .worker(cold_email())
        .capability(fetch)
        .capability(draft_email())
        .dispatcher(Dispatcher::new("TeamLead"))
        .budget(TurnBudget::steps(10))
        .build()
        .unwrap()
}

fn outreach_task() -> Task {
    Task::new("Start the outreach process.")
        .with_field(fields::NAME, "Jane Doe")
        .with_field(fields::PROFILE_URL, "https://example.com/in/janedoe")
}

#[tokio::test]
async fn full_outreach_produces_email() {
    let calls = Arc::new(AtomicUsize::new(0));
    let result = engine(team_lead(), fetch_profile(calls.clone()))
        .run(outreach_task())
        .await;

    assert_eq!(
        result.output(),
        Some(&json!("Hi Jane Doe, congrats on your role as Staff Engineer at Acme."))
    );
    // TeamLead→Research, fetchProfile, Research→TeamLead, TeamLead→ColdEmail, draftEmail
    assert_eq!(result.steps, 5);
    assert_eq!(result.final_worker, "ColdEmail");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        result
            .trace
            .worker_path()
            .iter()
            .map(|w| w.as_str())
            .collect::<Vec<_>>(),
        vec!["TeamLead", "Research", "TeamLead", "ColdEmail"]
    );
    assert_eq!(
        result.context.get(fields::PROFILE_DATA).unwrap()["url"],
        "https://example.com/in/janedoe"
    );
    assert_eq!(
        result.context.last_write(fields::GENERATED_ARTIFACT).unwrap().source,
        WriteSource::capability("draftEmail")
    );
}

#[tokio::test]
async fn missing_profile_is_the_workers_problem() {
    let result = engine(hasty_lead(), fetch_profile(Arc::default()))
        .run(outreach_task())
        .await;

    // the engine executes the handoff; ColdEmail reports the gap itself
    assert!(result.is_success());
    assert_eq!(result.output(), Some(&json!({ "error": "profileData is missing" })));
    assert_eq!(result.steps, 1);
    assert!(!result.context.contains(fields::PROFILE_DATA));
}

#[tokio::test]
async fn capability_failure_reaches_worker() {
    let result = engine(team_lead(), failing_fetch_profile())
        .run(outreach_task())
        .await;

    assert!(result.is_success());
    assert_eq!(
        result.output(),
        Some(&json!({ "error": "HTTP 404", "capability": "fetchProfile" }))
    );
    assert_eq!(result.steps, 2);
    assert!(!result.context.contains(fields::PROFILE_DATA));
}

#[tokio::test]
async fn tight_budget_stops_the_flow() {
    let result = engine(team_lead(), fetch_profile(Arc::default()))
        .run_with_budget(outreach_task(), TurnBudget::steps(3))
        .await;

    let failure = result.failure().unwrap();
    assert!(matches!(failure.cause, FailureCause::BudgetExceeded { .. }));
    assert_eq!(failure.step, 3);
    assert_eq!(failure.worker.as_ref().unwrap(), "TeamLead");
    // work done before the limit is kept
    assert!(result.context.contains(fields::PROFILE_DATA));
}

#[tokio::test]
async fn last_writer_wins_on_shared_field() {
    let enrich = CapabilityDef::new(
        "enrichProfile",
        fields::PROFILE_DATA,
        tower::service_fn(|_input: Value| async move {
            Ok::<_, BoxError>(json!({ "headline": "Principal Engineer at Acme" }))
        }),
    );
    let researcher = WorkerDef::new(
        "Research",
        worker_fn(|req: WorkerRequest| async move {
            match req.payload {
                Payload::Start => Ok(WorkerAction::call("fetchProfile", json!({ "url": "u" }))),
                Payload::CapabilityResult { capability, .. } if capability == "fetchProfile" => {
                    Ok(WorkerAction::call("enrichProfile", json!({})))
                }
                _ => Ok(WorkerAction::final_output("done")),
            }
        }),
    )
    .capability("fetchProfile")
    .capability("enrichProfile");

    let orch = Orchestrator::builder()
        .worker(researcher)
        .capability(fetch_profile(Arc::default()))
        .capability(enrich)
        .dispatcher(Dispatcher::new("Research"))
        .build()
        .unwrap();
    let result = orch.run(Task::new("profile")).await;

    assert_eq!(
        result.context.get(fields::PROFILE_DATA),
        Some(&json!({ "headline": "Principal Engineer at Acme" }))
    );
    let writes: Vec<_> = result
        .context
        .writes()
        .iter()
        .filter(|w| w.field == fields::PROFILE_DATA)
        .map(|w| (w.step, w.source.clone()))
        .collect();
    assert_eq!(
        writes,
        vec![
            (1, WriteSource::capability("fetchProfile")),
            (2, WriteSource::capability("enrichProfile")),
        ]
    );
}

#[tokio::test]
async fn deterministic_capability_records_same_value() {
    let orch = engine(team_lead(), fetch_profile(Arc::default()));
    let first = orch.run(outreach_task()).await;
    let second = orch.run(outreach_task()).await;

    assert_ne!(first.run_id, second.run_id);
    assert_eq!(
        first.context.get(fields::PROFILE_DATA),
        second.context.get(fields::PROFILE_DATA)
    );
    assert_eq!(first.output(), second.output());
}

#[tokio::test]
async fn unknown_capability_is_not_fatal() {
    let lost = WorkerDef::new(
        "Lost",
        worker_fn(|req: WorkerRequest| async move {
            match req.payload {
                Payload::CapabilityFailed(f) => Ok(WorkerAction::final_output(format!("{:?}", f.kind))),
                _ => Ok(WorkerAction::call("scrapeEverything", json!({}))),
            }
        }),
    );
    let orch = Orchestrator::builder()
        .worker(lost)
        .dispatcher(Dispatcher::new("Lost"))
        .build()
        .unwrap();
    let result = orch.run(Task::new("x")).await;
    assert_eq!(
        result.output(),
        Some(&json!(format!("{:?}", CapabilityFailureKind::UnknownCapability)))
    );
    assert_eq!(result.steps, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_runs_keep_separate_contexts() {
    let orch = engine(team_lead(), fetch_profile(Arc::default()));
    let runs = (0..16).map(|i| {
        let orch = orch.clone();
        tokio::spawn(async move {
            let task = Task::new("Start the outreach process.")
                .with_field(fields::NAME, format!("Person {}", i))
                .with_field(fields::PROFILE_URL, format!("https://example.com/in/{}", i));
            (i, orch.run(task).await)
        })
    });

    for handle in futures::future::join_all(runs).await {
        let (i, result) = handle.unwrap();
        assert_eq!(result.steps, 5);
        assert_eq!(
            result.context.get(fields::PROFILE_DATA).unwrap()["url"],
            json!(format!("https://example.com/in/{}", i))
        );
        assert!(result
            .output()
            .unwrap()
            .as_str()
            .unwrap()
            .starts_with(&format!("Hi Person {},", i)));
    }
}
