//! Order flow with a durable reminder.
//!
//! The run charges the order, sleeps briefly, then waits for a shipment
//! event. Main emits the event once the run is parked on it.
//!
//! ```bash
//! RUST_LOG=ponos=debug cargo run --example order_reminder
//! ```

use ponos::prelude::*;
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Order {
    id: String,
    total_cents: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Shipment {
    carrier: String,
    tracking: String,
}

async fn process_order(order: Order, step: Step) -> Result<String, BoxError> {
    let receipt: String = step
        .run_with(
            "charge",
            StepOptions::max_attempts(3).with_backoff(
                Duration::from_millis(50),
                Duration::from_millis(500),
                2.0,
            ),
            || {
                let order = order.clone();
                async move {
                    println!("[charge] charging {} cents for {}", order.total_cents, order.id);
                    Ok::<_, BoxError>(format!("receipt-{}", order.id))
                }
            },
        )
        .await?;

    step.sleep("cool-off", Duration::from_millis(200)).await?;

    let shipment: Option<Shipment> = step
        .wait_for_event("shipped", WaitForEventOptions::timeout(Duration::from_secs(10)))
        .await?;

    let summary = match shipment {
        Some(s) => format!("{}: shipped via {} ({})", receipt, s.carrier, s.tracking),
        None => format!("{}: no shipment in time, reminder sent", receipt),
    };
    step.run("notify", || {
        let summary = summary.clone();
        async move {
            println!("[notify] {}", summary);
            Ok::<_, BoxError>(())
        }
    })
    .await?;

    Ok(summary)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let workflow = Workflow::builder("orders")
        .config(WorkflowConfig::default().with_poll_interval(Duration::from_millis(50)))
        .build(process_order);

    let order = Order {
        id: "A-1001".to_string(),
        total_cents: 4_999,
    };
    let run = workflow.start(&order.id, &order).await?;

    while run.state().await? != JobState::WaitingChildren {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    workflow
        .emit_event(
            &order.id,
            "shipped",
            json!({ "carrier": "DHL", "tracking": "JD0140" }),
        )
        .await?;

    match run.get_result().await? {
        RunResult::Success { result } => println!("done: {}", result),
        RunResult::Failure { failed_reason, .. } => println!("failed: {}", failed_reason),
    }

    workflow.shutdown().await;
    Ok(())
}
