use anyhow::{Context, Result};
use chainwatch::{
    telemetry, ChainDefinition, ChainProgress, ChainSystem, EngineConfig, ExecutionError, Priority,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

async fn extract(progress: ChainProgress) -> Result<Value, ExecutionError> {
    for (pct, step) in [(25, "connect"), (75, "download"), (100, "verify")] {
        progress.report(pct, step);
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    Ok(json!({ "rows": 1200 }))
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_tracing("info")?;

    // Optional YAML config as the first argument
    let config = match std::env::args().nth(1) {
        Some(path) => EngineConfig::from_yaml_file(&path)
            .with_context(|| format!("loading config from {}", path))?,
        None => EngineConfig::builder()
            .max_concurrency(2)
            .monitor_interval(Duration::from_secs(1))
            .retries(2, vec![Duration::from_millis(500), Duration::from_secs(1)])
            .build()?,
    };

    let system = ChainSystem::builder().config(config).build().await?;
    system.start().await?;
    let mut events = system.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!(chain_id = %event.chain_id, from = ?event.from, to = %event.to, "transition");
        }
    });

    let extract_id = system.register(
        ChainDefinition::new("extract")
            .task_id("nightly-extract")
            .priority(Priority::High),
    )?;
    let transform_id = system.register(ChainDefinition::new("transform").depends_on(&extract_id))?;

    // Transform is parked until extract succeeds
    let parked = system
        .dispatch(&transform_id, |_progress: ChainProgress| async {
            Ok::<_, ExecutionError>(json!({ "transformed": true }))
        })
        .await?;
    info!(?parked, "transform dispatched early");

    let outcome = system
        .dispatch(&extract_id, extract)
        .await?
        .handle()
        .context("extract did not start")?
        .wait()
        .await?;
    info!(status = %outcome.status, output = ?outcome.output, "extract finished");

    system.resume(&transform_id).await?;
    if let Some(handle) = system.watch(&transform_id) {
        let outcome = handle.wait().await?;
        info!(status = %outcome.status, "transform finished");
    }

    // A flaky chain that succeeds on its second attempt
    let attempts = Arc::new(AtomicU32::new(0));
    let flaky_id = system.register(ChainDefinition::new("flaky-upload"))?;
    let outcome = system
        .dispatch(&flaky_id, move |_progress: ChainProgress| {
            let attempts = attempts.clone();
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ExecutionError::failed("connection reset"))
                } else {
                    Ok(json!("uploaded"))
                }
            }
        })
        .await?
        .handle()
        .context("flaky-upload did not start")?
        .wait()
        .await?;
    info!(status = %outcome.status, retries = outcome.retry_count, "flaky-upload finished");

    println!("{}", system.dependency_dot());
    println!(
        "{}",
        serde_json::to_string_pretty(&system.get_system_status().await)?
    );

    system.shutdown().await?;
    Ok(())
}
