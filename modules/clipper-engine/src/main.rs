use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use browserless_client::BrowserlessClient;
use clipper_common::Config;

use clipper_engine::classifier::ClaudeClassifier;
use clipper_engine::classify_queue::ClassificationQueue;
use clipper_engine::fetch::HttpFetcher;
use clipper_engine::orchestrator::Orchestrator;
use clipper_engine::policy;
use clipper_engine::run_log::RunLog;
use clipper_engine::store::PgStore;
use clipper_engine::traits::{ArticleStore, Browser, Classifier, PageFetcher};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("clipper=info".parse()?))
        .init();

    info!("Clipper engine starting...");

    let config = Config::from_env()?;
    config.log_redacted();

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;
    PgStore::migrate(&pool).await?;

    // Collaborators.
    let fetcher: Arc<dyn PageFetcher> = Arc::new(HttpFetcher::new());
    let browser: Arc<dyn Browser> = Arc::new(BrowserlessClient::new(
        &config.browserless_url,
        config.browserless_token.as_deref(),
    ));
    let classifier: Arc<dyn Classifier> = Arc::new(ClaudeClassifier::new(
        &config.anthropic_api_key,
        &config.anthropic_model,
    ));
    let store: Arc<dyn ArticleStore> = Arc::new(PgStore::new(pool));
    let run_log = RunLog::shared();

    let queue = Arc::new(ClassificationQueue::with_settings(
        Arc::clone(&store),
        Arc::clone(&classifier),
        Arc::clone(&run_log),
        config.queue_concurrency.unwrap_or(policy::queue::WORKER_CONCURRENCY),
        policy::queue::MAX_ATTEMPTS,
        policy::queue::RETRY_DELAY,
    ));
    queue.start();

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, finishing in-flight work");
                stop.store(true, Ordering::SeqCst);
            }
        });
    }

    let orchestrator = Orchestrator::new(
        fetcher,
        browser,
        classifier,
        Arc::clone(&store),
        Arc::clone(&queue),
        Arc::clone(&run_log),
        stop,
    )
    .with_batch_size(
        config
            .source_batch_size
            .unwrap_or(policy::orchestrator::SOURCE_BATCH_SIZE),
    );

    let stats = orchestrator.run().await?;
    println!("{stats}");

    // Let the queue finish what the run enqueued, then flush the timeline.
    queue.drain().await;
    queue.stop().await;

    let log = run_log.lock().expect("run log poisoned");
    if let Err(e) = log.save(&stats) {
        warn!(error = %e, "Failed to save run log");
    }

    Ok(())
}
