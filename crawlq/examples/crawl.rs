//! Crawl a handful of urls with the configured stack.
//!
//! ```sh
//! cargo run -p crawlq --example crawl --features http -- crawlq/examples/crawl.yaml \
//!     https://www.rust-lang.org/ https://crates.io/
//! ```
//!
//! With urls the example runs until every one of them is terminal. Without
//! urls it serves the configured queue until Ctrl+C, which needs a Redis
//! queue filled by another process.
use crawlq::config::LoadedConfig;
use crawlq::logging::init_tracing;
use crawlq::manager::{WorkersManager, WorkersManagerOptions};
use crawlq::queue::TaskId;
use crawlq::{CrawlClient, CrawlContext, FetchRequest};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let config_path = args
        .next()
        .unwrap_or_else(|| "crawlq/examples/crawl.yaml".to_string());
    let urls: Vec<String> = args.collect();

    let config = LoadedConfig::from_file(&config_path)?;
    init_tracing(&config.settings.logging);
    let settings = config.settings.clone();

    let ctx = Arc::new(CrawlContext::from_config(config).await?);
    let client = CrawlClient::from_context(&ctx);
    let mut manager = WorkersManager::new(ctx, WorkersManagerOptions::from_settings(&settings));

    if urls.is_empty() {
        tracing::info!(queue = %settings.queue.name, "Serving queue until Ctrl+C");
        let stats = manager.run_workers().await;
        tracing::info!(workers = stats.len(), "Stopped");
        return Ok(());
    }

    // earlier urls first
    let total = urls.len() as i64;
    let ids = client
        .enqueue_batch(
            urls.into_iter()
                .enumerate()
                .map(|(i, url)| (FetchRequest::new(url), total - i as i64)),
        )
        .await?;

    let waiter = client.clone();
    let pending = ids.clone();
    manager
        .run_until(async move {
            for task_id in &pending {
                if let Err(e) = waiter.wait_for_task(task_id, Duration::from_secs(600)).await {
                    tracing::warn!(%task_id, error = %e, "Gave up waiting");
                }
            }
        })
        .await;

    for task_id in &ids {
        report(&client, task_id).await?;
    }
    tracing::info!(stats = ?client.stats().await?, "Done");
    Ok(())
}

async fn report(client: &CrawlClient, task_id: &TaskId) -> anyhow::Result<()> {
    let Some(task) = client.status(task_id).await? else {
        return Ok(());
    };
    let status = task
        .result
        .as_ref()
        .and_then(|r| r["response"]["status"].as_u64());
    tracing::info!(
        url = %task.payload.url,
        state = %task.status,
        http_status = ?status,
        retries = task.retries,
        error = ?task.error_msg,
        "Task"
    );
    Ok(())
}
