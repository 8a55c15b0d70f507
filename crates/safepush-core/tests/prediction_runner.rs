//! Submission, polling and timeout behaviour of `PredictionRunner`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};

use safepush_core::fakes::{FakeModel, FakeRegistry, ScriptedJob};
use safepush_core::{
    HarnessError, Mode, ModelRef, OutputShape, PredictionOutcome, PredictionRequest,
    PredictionRunner, SubmitTarget, Target,
};

fn model() -> ModelRef {
    ModelRef::new("acme", "echo")
}

fn openapi() -> Value {
    json!({"components": {"schemas": {
        "Input": {"type": "object", "properties": {
            "text": {"type": "string", "description": "Text"}
        }},
        "Output": {"type": "string"}
    }}})
}

fn inputs() -> Map<String, Value> {
    let mut m = Map::new();
    m.insert("text".to_string(), json!("hello"));
    m
}

fn request<'a>(
    target: &'a Target,
    inputs: &'a Map<String, Value>,
    mode: &'a Mode,
    timeout: Duration,
) -> PredictionRequest<'a> {
    PredictionRequest {
        target,
        inputs,
        mode,
        timeout,
        output_shape: OutputShape::Plain,
    }
}

#[tokio::test(start_paused = true)]
async fn test_timeout_is_never_raised_before_the_bound() {
    let registry = Arc::new(FakeRegistry::new().with_model(
        model(),
        FakeModel::new()
            .with_version("v1", openapi())
            .responding(|_| ScriptedJob::never_finishes()),
    ));
    let runner = PredictionRunner::new(registry.clone()).with_poll_interval(Duration::from_millis(500));
    let target = Target::latest(model());
    let inputs = inputs();
    let timeout = Duration::from_millis(1200);

    let started = tokio::time::Instant::now();
    let outcome = runner
        .run(request(&target, &inputs, &Mode::Inference, timeout))
        .await
        .unwrap();
    let waited = started.elapsed();

    let PredictionOutcome::TimedOut { elapsed, job_id } = &outcome else {
        panic!("expected a timeout, got {outcome:?}");
    };
    assert!(*elapsed >= timeout);
    assert!(waited >= timeout);
    assert!(waited < timeout + Duration::from_millis(500), "overshot by a full poll interval");
    assert!(registry.poll_count(job_id) >= 2);

    match outcome.into_output() {
        Err(HarnessError::PredictionTimeout { elapsed_secs, .. }) => {
            assert!(elapsed_secs >= timeout.as_secs_f64())
        }
        other => panic!("expected PredictionTimeout, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_job_finishing_after_several_polls_succeeds() {
    let registry = Arc::new(FakeRegistry::new().with_model(
        model(),
        FakeModel::new()
            .with_version("v1", openapi())
            .responding(|input| ScriptedJob::succeeded(input["text"].clone()).after_polls(3)),
    ));
    let runner = PredictionRunner::new(registry.clone());
    let target = Target::latest(model());
    let inputs = inputs();

    let outcome = runner
        .run(request(&target, &inputs, &Mode::Inference, Duration::from_secs(30)))
        .await
        .unwrap();

    assert_eq!(outcome.output(), Some(&json!("hello")));
    assert_eq!(registry.poll_count(outcome.job_id()), 3);
}

#[tokio::test]
async fn test_failed_prediction_is_returned_as_data() {
    let registry = Arc::new(FakeRegistry::new().with_model(
        model(),
        FakeModel::new()
            .with_version("v1", openapi())
            .responding(|_| ScriptedJob::failed("CUDA out of memory").after_polls(0)),
    ));
    let runner = PredictionRunner::new(registry);
    let target = Target::latest(model());
    let inputs = inputs();

    let outcome = runner
        .run(request(&target, &inputs, &Mode::Inference, Duration::from_secs(5)))
        .await
        .unwrap();

    assert_eq!(outcome.error().as_deref(), Some("CUDA out of memory"));
    assert!(outcome.output().is_none());
}

#[tokio::test]
async fn test_public_model_is_addressed_by_name() {
    let registry = Arc::new(FakeRegistry::new().with_model(
        model(),
        FakeModel::new()
            .with_version("v1", openapi())
            .public_only()
            .responding(|_| ScriptedJob::succeeded(json!("public")).after_polls(0)),
    ));
    let runner = PredictionRunner::new(registry.clone());
    let target = Target::latest(model());
    let inputs = inputs();

    let outcome = runner
        .run(request(&target, &inputs, &Mode::Inference, Duration::from_secs(5)))
        .await
        .unwrap();

    assert_eq!(outcome.output(), Some(&json!("public")));
    let submissions = registry.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].target, SubmitTarget::Model(model()));
}

#[tokio::test]
async fn test_pinned_version_is_submitted_by_version() {
    let registry = Arc::new(FakeRegistry::new().with_model(
        model(),
        FakeModel::new()
            .with_version("v1", openapi())
            .with_version("v2", openapi()),
    ));
    let runner = PredictionRunner::new(registry.clone());
    let target = Target::pinned(model(), "v1");
    let inputs = inputs();

    runner
        .run(request(&target, &inputs, &Mode::Inference, Duration::from_secs(5)))
        .await
        .unwrap();

    match &registry.submissions()[0].target {
        SubmitTarget::Version(v) => assert_eq!(v.id, "v1"),
        other => panic!("expected a version submission, got {other:?}"),
    }
}

#[tokio::test]
async fn test_training_does_not_fall_back_to_model() {
    let registry = Arc::new(FakeRegistry::new().with_model(
        model(),
        FakeModel::new().with_version("v1", openapi()).public_only(),
    ));
    let runner = PredictionRunner::new(registry.clone());
    let target = Target::latest(model());
    let inputs = inputs();
    let mode = Mode::Training {
        destination: ModelRef::new("acme", "echo-dest"),
    };

    let err = runner
        .run(request(&target, &inputs, &mode, Duration::from_secs(5)))
        .await
        .unwrap_err();

    assert!(matches!(err, HarnessError::Registry(e) if e.is_not_found()));
    assert!(registry.submissions().is_empty());
}

#[tokio::test]
async fn test_iterator_output_is_concatenated() {
    let registry = Arc::new(FakeRegistry::new().with_model(
        model(),
        FakeModel::new()
            .with_version("v1", openapi())
            .responding(|_| ScriptedJob::succeeded(json!(["The ", "quick ", "fox"])).after_polls(0)),
    ));
    let runner = PredictionRunner::new(registry);
    let target = Target::latest(model());
    let inputs = inputs();

    let outcome = runner
        .run(PredictionRequest {
            output_shape: OutputShape::Iterator,
            ..request(&target, &inputs, &Mode::Inference, Duration::from_secs(5))
        })
        .await
        .unwrap();

    assert_eq!(outcome.output(), Some(&json!("The quick fox")));
}
