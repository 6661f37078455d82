//! Classification queue scenarios: ordering, idempotent enqueue, retry and
//! dead-letter behavior.
//!
//! Run with: cargo test -p clipper-engine --test queue_test

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Semaphore;
use uuid::Uuid;

use clipper_common::{Article, CandidateLink, Classification, ExtractionRule};
use clipper_engine::classify_queue::ClassificationQueue;
use clipper_engine::run_log::RunLog;
use clipper_engine::store::MemoryStore;
use clipper_engine::structure::generic_rule;
use clipper_engine::testing::MockClassifier;
use clipper_engine::traits::{ArticleStore, Classifier};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn article(title: &str) -> Article {
    Article {
        id: Uuid::new_v4(),
        source_id: Uuid::new_v4(),
        title: title.to_string(),
        content: "Body text long enough to classify.".to_string(),
        url: format!("https://site.com/{}", title.replace(' ', "-")),
        author: None,
        published_at: None,
        scraped_at: Utc::now(),
        classification: None,
    }
}

/// Classifier that records the order articles reach it.
#[derive(Default)]
struct RecordingClassifier {
    order: Mutex<Vec<String>>,
}

impl RecordingClassifier {
    fn seen(&self) -> Vec<String> {
        self.order.lock().unwrap().clone()
    }
}

#[async_trait]
impl Classifier for RecordingClassifier {
    async fn classify_links(&self, _candidates: &[CandidateLink]) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn infer_selectors(&self, _html: &str, _url: &str) -> Result<ExtractionRule> {
        Ok(generic_rule())
    }

    async fn classify_article(&self, title: &str, _content: &str) -> Result<Classification> {
        self.order.lock().unwrap().push(title.to_string());
        Ok(Classification::neutral())
    }
}

/// Classifier that parks every call on a gate until the test opens it,
/// counting calls started and calls finished.
struct GatedClassifier {
    started: AtomicUsize,
    finished: AtomicUsize,
    gate: Semaphore,
}

impl GatedClassifier {
    fn new() -> Self {
        Self {
            started: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
            gate: Semaphore::new(0),
        }
    }

    fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    fn open_gate(&self) {
        self.gate.add_permits(Semaphore::MAX_PERMITS);
    }
}

#[async_trait]
impl Classifier for GatedClassifier {
    async fn classify_links(&self, _candidates: &[CandidateLink]) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn infer_selectors(&self, _html: &str, _url: &str) -> Result<ExtractionRule> {
        Ok(generic_rule())
    }

    async fn classify_article(&self, _title: &str, _content: &str) -> Result<Classification> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.gate.acquire().await?.forget();
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(Classification::neutral())
    }
}

/// Poll `condition` until it holds or the iteration budget runs out. Sleeps
/// advance instantly under the paused test clock.
async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..2_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

// ===========================================================================
// Scenario: priority ordering
// ===========================================================================

/// Higher priority drains first; equal priorities drain in enqueue order.
#[tokio::test(start_paused = true)]
async fn drains_by_priority_then_fifo() {
    let store = Arc::new(MemoryStore::new());
    let classifier = Arc::new(RecordingClassifier::default());

    let low = article("low");
    let high = article("high");
    let mid_first = article("mid first");
    let mid_second = article("mid second");
    for a in [&low, &high, &mid_first, &mid_second] {
        store.insert(a).await.unwrap();
    }

    let queue = ClassificationQueue::with_settings(
        store.clone(),
        classifier.clone(),
        RunLog::shared(),
        1,
        3,
        Duration::from_millis(50),
    );

    // Everything enqueued before any worker exists.
    queue.enqueue(low.id, 1);
    queue.enqueue(high.id, 5);
    queue.enqueue(mid_first.id, 3);
    queue.enqueue(mid_second.id, 3);
    assert_eq!(queue.depth(), 4);

    queue.start();
    queue.drain().await;
    queue.stop().await;

    assert_eq!(
        classifier.seen(),
        vec!["high", "mid first", "mid second", "low"]
    );
    assert!(queue.is_idle());
}

// ===========================================================================
// Scenario: stop with a backlog still queued
// ===========================================================================

/// Stopping the queue halts dequeues immediately: the item a worker already
/// holds finishes, everything still in the heap stays there untouched.
#[tokio::test(start_paused = true)]
async fn stop_halts_dequeues_with_backlog_remaining() {
    let store = Arc::new(MemoryStore::new());
    let classifier = Arc::new(GatedClassifier::new());

    let articles: Vec<Article> = (0..4).map(|i| article(&format!("queued {i}"))).collect();
    for a in &articles {
        store.insert(a).await.unwrap();
    }

    let queue = Arc::new(ClassificationQueue::with_settings(
        store.clone(),
        classifier.clone(),
        RunLog::shared(),
        1,
        3,
        Duration::from_millis(50),
    ));
    for a in &articles {
        queue.enqueue(a.id, 1);
    }
    queue.start();

    // The single worker is now parked inside classify_article on item one.
    wait_until(|| classifier.started() == 1).await;

    let stopper = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move { queue.stop().await })
    };
    // stop() raises the flag before it waits on the worker; yield so it
    // lands before the in-flight call is released.
    tokio::task::yield_now().await;
    classifier.open_gate();
    stopper.await.unwrap();

    assert_eq!(classifier.finished(), 1, "only the in-flight item finishes");
    assert_eq!(classifier.started(), 1, "no new dequeues after stop");
    assert_eq!(queue.depth(), 3, "backlog stays queued");
}

// ===========================================================================
// Scenario: idempotent enqueue
// ===========================================================================

/// Re-enqueueing an id that is already waiting is a no-op.
#[tokio::test(start_paused = true)]
async fn enqueue_is_idempotent_while_queued() {
    let store = Arc::new(MemoryStore::new());
    let queue = ClassificationQueue::with_settings(
        store,
        Arc::new(MockClassifier::new()),
        RunLog::shared(),
        1,
        3,
        Duration::from_millis(50),
    );

    let id = Uuid::new_v4();
    queue.enqueue(id, 1);
    queue.enqueue(id, 5);
    queue.enqueue(id, 1);

    assert_eq!(queue.depth(), 1);
}

// ===========================================================================
// Scenario: transient failure, then success
// ===========================================================================

/// One transport failure re-enqueues the item after the retry delay; the
/// second attempt succeeds and the classification is persisted.
#[tokio::test(start_paused = true)]
async fn failed_item_retries_and_succeeds() {
    let store = Arc::new(MemoryStore::new());
    let classifier = Arc::new(MockClassifier::new().article_failures(1));

    let a = article("flaky");
    store.insert(&a).await.unwrap();

    let queue = ClassificationQueue::with_settings(
        store.clone(),
        classifier.clone(),
        RunLog::shared(),
        1,
        3,
        Duration::from_millis(100),
    );
    queue.start();
    queue.enqueue(a.id, 1);

    let mut classified = false;
    for _ in 0..2_000 {
        if store.get(a.id).await.unwrap().unwrap().classification.is_some() {
            classified = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    queue.stop().await;

    assert!(classified, "retry never succeeded");
    assert_eq!(classifier.article_calls(), 2);
}

// ===========================================================================
// Scenario: attempts exhausted
// ===========================================================================

/// A permanently failing item is attempted exactly `max_attempts` times and
/// then dead-lettered: dropped from the active set, classification untouched.
#[tokio::test(start_paused = true)]
async fn exhausted_item_is_dead_lettered() {
    let store = Arc::new(MemoryStore::new());
    let classifier = Arc::new(MockClassifier::new().article_failures(10));
    let run_log = RunLog::shared();

    let a = article("doomed");
    store.insert(&a).await.unwrap();

    let queue = ClassificationQueue::with_settings(
        store.clone(),
        classifier.clone(),
        run_log.clone(),
        1,
        2,
        Duration::from_millis(50),
    );
    queue.start();
    queue.enqueue(a.id, 1);

    wait_until(|| classifier.article_calls() == 2).await;
    // Give any stray retry task a chance to misbehave before asserting.
    tokio::time::sleep(Duration::from_millis(500)).await;
    queue.stop().await;

    assert_eq!(classifier.article_calls(), 2);
    assert!(queue.is_idle());
    let stored = store.get(a.id).await.unwrap().unwrap();
    assert!(stored.classification.is_none());
}
