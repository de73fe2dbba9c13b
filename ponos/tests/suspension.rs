//! Durable sleep and wait-for-event across invocations.

use ponos::prelude::*;
use ponos::storage::{bucket_key, marker_key};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use uuid::Uuid;

fn fast_config() -> WorkflowConfig {
    WorkflowConfig::default().with_poll_interval(Duration::from_millis(10))
}

async fn wait_for_state<R: serde::de::DeserializeOwned>(run: &RunHandle<R>, state: JobState) {
    for _ in 0..500 {
        if run.state().await.unwrap() == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("run never reached {}", state);
}

#[tokio::test]
async fn test_sleep_does_not_repeat_earlier_steps() {
    let before = Arc::new(AtomicU32::new(0));
    let after = Arc::new(AtomicU32::new(0));

    let (b, a) = (before.clone(), after.clone());
    let workflow = Workflow::builder("sleepy")
        .config(fast_config())
        .build(move |_input: Value, step: Step| {
            let (before, after) = (b.clone(), a.clone());
            async move {
                step.run("before", || {
                    let before = before.clone();
                    async move { Ok::<_, BoxError>(before.fetch_add(1, Ordering::SeqCst)) }
                })
                .await?;

                step.sleep("nap", Duration::from_millis(50)).await?;

                step.run("after", || {
                    let after = after.clone();
                    async move { Ok::<_, BoxError>(after.fetch_add(1, Ordering::SeqCst)) }
                })
                .await?;
                Ok::<_, BoxError>("rested".to_string())
            }
        });

    let run = workflow
        .start(&Uuid::new_v4().to_string(), &json!({}))
        .await
        .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), run.get_result())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result, RunResult::Success { result: "rested".to_string() });
    assert_eq!(before.load(Ordering::SeqCst), 1);
    assert_eq!(after.load(Ordering::SeqCst), 1);

    workflow.shutdown().await;
}

#[tokio::test]
async fn test_wait_times_out_to_none() {
    let store = Arc::new(InMemoryStepStore::new());
    let workflow = Workflow::builder("wait-timeout")
        .config(fast_config())
        .store(Arc::clone(&store))
        .build(|_input: Value, step: Step| async move {
            let event: Option<Value> = step
                .wait_for_event("approval", WaitForEventOptions::timeout(Duration::from_millis(50)))
                .await?;
            Ok::<_, BoxError>(event.is_none())
        });

    let run_id = Uuid::new_v4().to_string();
    let run = workflow.start(&run_id, &json!({})).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), run.get_result())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result, RunResult::Success { result: true });

    let fields = store.load(&bucket_key("wait-timeout", &run_id)).await.unwrap();
    let marker: Value = serde_json::from_str(&fields[&marker_key("approval")]).unwrap();
    assert_eq!(marker, json!({ "status": "timedout" }));

    workflow.shutdown().await;
}

#[tokio::test]
async fn test_emitted_event_resumes_run() {
    let workflow = Workflow::builder("wait-order")
        .config(fast_config())
        .build(|_input: Value, step: Step| async move {
            let order: Option<Value> = step
                .wait_for_event("order", WaitForEventOptions::default())
                .await?;
            Ok::<_, BoxError>(order)
        });

    let run_id = Uuid::new_v4().to_string();
    let run = workflow.start(&run_id, &json!({})).await.unwrap();
    wait_for_state(&run, JobState::WaitingChildren).await;

    workflow
        .emit_event(&run_id, "order", json!({ "order": { "id": "x" } }))
        .await
        .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), run.get_result())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        result,
        RunResult::Success {
            result: Some(json!({ "order": { "id": "x" } }))
        }
    );

    // The wait has settled; a second emit has nothing to deliver to.
    let err = workflow
        .emit_event(&run_id, "order", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::PendingWaitNotFound { .. }));

    workflow.shutdown().await;
}

#[tokio::test]
async fn test_emit_without_wait_fails() {
    let workflow = Workflow::builder("no-wait")
        .build(|_input: Value, _step: Step| async { Ok::<_, BoxError>(()) });

    let err = workflow
        .emit_event("missing-run", "order", json!(1))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::PendingWaitNotFound { .. }));

    workflow.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_run_rejected() {
    let workflow = Workflow::builder("duplicates")
        .config(fast_config())
        .build(|input: u32, _step: Step| async move { Ok::<_, BoxError>(input + 1) });

    let run = workflow.start("only-once", &1).await.unwrap();
    let err = workflow.start("only-once", &2).await.err().unwrap();
    assert!(matches!(err, WorkflowError::DuplicateRun { .. }));

    assert_eq!(run.get_result().await.unwrap(), RunResult::Success { result: 2 });
    workflow.shutdown().await;
}

#[tokio::test]
async fn test_sleep_then_wait_in_one_run() {
    let workflow = Workflow::builder("sleep-then-wait")
        .config(fast_config())
        .build(|_input: Value, step: Step| async move {
            step.sleep("settle", Duration::from_millis(20)).await?;
            let ack: Option<String> = step
                .wait_for_event("ack", WaitForEventOptions::timeout(Duration::from_secs(30)))
                .await?;
            Ok::<_, BoxError>(ack.unwrap_or_default())
        });

    let run_id = Uuid::new_v4().to_string();
    let run = workflow.start(&run_id, &json!(null)).await.unwrap();
    wait_for_state(&run, JobState::WaitingChildren).await;

    workflow.emit_event(&run_id, "ack", "ok").await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), run.get_result())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result, RunResult::Success { result: "ok".to_string() });

    workflow.shutdown().await;
}

#[tokio::test]
async fn test_unbounded_waits_park_until_event() {
    let workflow = Workflow::builder("unbounded-waits")
        .config(fast_config().with_default_event_timeout(Duration::MAX))
        .build(|_input: Value, step: Step| async move {
            let a: Option<u32> = step
                .wait_for_event("forever", WaitForEventOptions::timeout(Duration::MAX))
                .await?;
            let b: Option<u32> = step
                .wait_for_event(
                    "far",
                    WaitForEventOptions::timeout(Duration::from_secs(10_000_000_000_000)),
                )
                .await?;
            let c: Option<u32> = step
                .wait_for_event("configured", WaitForEventOptions::default())
                .await?;
            Ok::<_, BoxError>(vec![a, b, c])
        });

    let run_id = Uuid::new_v4().to_string();
    let run = workflow.start(&run_id, &json!({})).await.unwrap();

    for (event, value) in [("forever", 1), ("far", 2), ("configured", 3)] {
        let mut delivered = false;
        for _ in 0..500 {
            if workflow.emit_event(&run_id, event, value).await.is_ok() {
                delivered = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(delivered, "wait for {} was never registered", event);
    }

    let result = tokio::time::timeout(Duration::from_secs(5), run.get_result())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        result,
        RunResult::Success {
            result: vec![Some(1), Some(2), Some(3)]
        }
    );

    workflow.shutdown().await;
}

#[tokio::test]
async fn test_unbounded_sleep_stays_delayed() {
    let workflow = Workflow::builder("unbounded-sleep")
        .config(fast_config())
        .build(|_input: Value, step: Step| async move {
            step.sleep("forever", Duration::MAX).await?;
            Ok::<_, BoxError>(())
        });

    let run = workflow
        .start(&Uuid::new_v4().to_string(), &json!({}))
        .await
        .unwrap();
    wait_for_state(&run, JobState::Delayed).await;
    assert!(
        tokio::time::timeout(Duration::from_millis(100), run.get_result())
            .await
            .is_err()
    );
    assert_eq!(run.state().await.unwrap(), JobState::Delayed);

    workflow.shutdown().await;
}
