//! Step records in Redis.
//!
//! Runs the same workflow twice against one Redis step store; the second run
//! id reuses nothing, but restarting the example with the same run id would
//! replay the recorded steps.
//!
//! ```bash
//! docker run -p 6379:6379 redis:7
//! cargo run --example redis_store --features redis
//! ```

use ponos::prelude::*;
use ponos::storage::bucket_key;
use serde_json::Value;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let store = Arc::new(RedisStepStore::new(&url).await?);

    let workflow = Workflow::builder("redis-demo")
        .store(Arc::clone(&store))
        .build(|_input: Value, step: Step| async move {
            let fetched: u64 = step
                .run("fetch", || async { Ok::<_, BoxError>(42) })
                .await?;
            let doubled: u64 = step
                .run("double", || async move { Ok::<_, BoxError>(fetched * 2) })
                .await?;
            Ok::<_, BoxError>(doubled)
        });

    let run_id = uuid::Uuid::new_v4().to_string();
    let run = workflow.start(&run_id, &Value::Null).await?;
    println!("result: {:?}", run.get_result().await?);

    let bucket = bucket_key("redis-demo", &run_id);
    for (field, value) in store.load(&bucket).await? {
        println!("{} = {}", field, value);
    }
    store.delete(&bucket).await?;

    workflow.shutdown().await;
    Ok(())
}
