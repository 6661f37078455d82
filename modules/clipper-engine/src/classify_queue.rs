//! Classification queue.
//!
//! A bounded worker pool draining a priority queue of persisted articles
//! into the external classifier. Higher priority dequeues first, FIFO among
//! equals; enqueue is idempotent while an item is queued or in flight; a
//! failed item is re-enqueued after a fixed delay at reduced priority until
//! its attempt budget runs out, then dead-lettered — dropped from the active
//! set with a terminal log, never silently.
//!
//! Explicitly constructed and injected, with a `start`/`stop` lifecycle
//! (`stop` halts dequeues and finishes only in-flight work; `drain` waits
//! out the backlog first), so tests run several isolated instances
//! concurrently. The queue's worker
//! pool is independent of the orchestrator's source pool: a slow classifier
//! never stalls scraping.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use chrono::Utc;
use clipper_common::QueueItem;

use crate::policy::queue as policy;
use crate::run_log::{log_event, EventKind, SharedRunLog};
use crate::traits::{ArticleStore, Classifier};

// ---------------------------------------------------------------------------
// Heap ordering
// ---------------------------------------------------------------------------

/// Heap entry: priority descending, then insertion order ascending so equal
/// priorities drain FIFO.
struct HeapEntry {
    item: QueueItem,
    seq: u64,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.item.priority == other.item.priority && self.seq == other.seq
    }
}
impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.item
            .priority
            .cmp(&other.item.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

struct QueueState {
    heap: BinaryHeap<HeapEntry>,
    /// Ids currently in the heap.
    queued: HashSet<Uuid>,
    /// Ids currently held by a worker. Membership here guards the invariant
    /// that no item is processed by two workers at once.
    processing: HashSet<Uuid>,
    seq: u64,
}

struct QueueInner {
    state: Mutex<QueueState>,
    notify: Notify,
    stopped: AtomicBool,
    store: Arc<dyn ArticleStore>,
    classifier: Arc<dyn Classifier>,
    run_log: SharedRunLog,
    max_attempts: u32,
    retry_delay: Duration,
}

pub struct ClassificationQueue {
    inner: Arc<QueueInner>,
    concurrency: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ClassificationQueue {
    pub fn new(
        store: Arc<dyn ArticleStore>,
        classifier: Arc<dyn Classifier>,
        run_log: SharedRunLog,
    ) -> Self {
        Self::with_settings(
            store,
            classifier,
            run_log,
            policy::WORKER_CONCURRENCY,
            policy::MAX_ATTEMPTS,
            policy::RETRY_DELAY,
        )
    }

    pub fn with_settings(
        store: Arc<dyn ArticleStore>,
        classifier: Arc<dyn Classifier>,
        run_log: SharedRunLog,
        concurrency: usize,
        max_attempts: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    heap: BinaryHeap::new(),
                    queued: HashSet::new(),
                    processing: HashSet::new(),
                    seq: 0,
                }),
                notify: Notify::new(),
                stopped: AtomicBool::new(false),
                store,
                classifier,
                run_log,
                max_attempts,
                retry_delay,
            }),
            concurrency,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker pool. Idempotent only in the sense that calling it
    /// twice doubles the pool; callers own the lifecycle.
    pub fn start(&self) {
        let mut workers = self.workers.lock().expect("worker list poisoned");
        for worker_id in 0..self.concurrency {
            let inner = Arc::clone(&self.inner);
            workers.push(tokio::spawn(worker_loop(inner, worker_id)));
        }
        info!(workers = self.concurrency, "Classification queue started");
    }

    /// Wait until the backlog and all in-flight work are finished. Workers
    /// keep running; call before `stop` at shutdown when everything the run
    /// enqueued should still be classified.
    pub async fn drain(&self) {
        while !self.is_idle() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Stop issuing new dequeues, wait for in-flight work to finish. Items
    /// still queued are abandoned where they sit.
    pub async fn stop(&self) {
        self.inner.stopped.store(true, AtomicOrdering::SeqCst);
        self.inner.notify.notify_waiters();
        let workers: Vec<JoinHandle<()>> = {
            let mut guard = self.workers.lock().expect("worker list poisoned");
            guard.drain(..).collect()
        };
        for handle in workers {
            let _ = handle.await;
        }
        info!("Classification queue stopped");
    }

    /// Enqueue an article for classification. No-op when the article is
    /// already queued or currently processing.
    pub fn enqueue(&self, article_id: Uuid, priority: i32) {
        if self.inner.stopped.load(AtomicOrdering::SeqCst) {
            warn!(%article_id, "Queue stopped, enqueue ignored");
            return;
        }
        let depth = {
            let mut state = self.inner.state.lock().expect("queue state poisoned");
            if state.queued.contains(&article_id) || state.processing.contains(&article_id) {
                debug!(%article_id, "Already queued or processing, enqueue is a no-op");
                return;
            }
            push_entry(&mut state, QueueItem::new(article_id, priority));
            state.heap.len()
        };
        log_event(
            &self.inner.run_log,
            EventKind::QueueEnqueued {
                article_id,
                priority,
                depth,
            },
        );
        self.inner.notify.notify_one();
    }

    /// Items waiting in the heap.
    pub fn depth(&self) -> usize {
        self.inner.state.lock().expect("queue state poisoned").heap.len()
    }

    /// True when nothing is queued or in flight.
    pub fn is_idle(&self) -> bool {
        let state = self.inner.state.lock().expect("queue state poisoned");
        state.heap.is_empty() && state.processing.is_empty()
    }
}

fn push_entry(state: &mut QueueState, item: QueueItem) {
    let seq = state.seq;
    state.seq += 1;
    state.queued.insert(item.article_id);
    state.heap.push(HeapEntry { item, seq });
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

async fn worker_loop(inner: Arc<QueueInner>, worker_id: usize) {
    loop {
        // Stop means no new dequeues: a backlog left in the heap stays there.
        // The item a worker already holds finishes below before this check is
        // reached again.
        if inner.stopped.load(AtomicOrdering::SeqCst) {
            debug!(worker_id, "Queue stopped, worker exiting");
            return;
        }

        let entry = {
            let mut state = inner.state.lock().expect("queue state poisoned");
            match state.heap.pop() {
                Some(entry) => {
                    state.queued.remove(&entry.item.article_id);
                    state.processing.insert(entry.item.article_id);
                    Some(entry.item)
                }
                None => None,
            }
        };

        let Some(mut item) = entry else {
            // Wait for an enqueue or a stop; poll as a backstop so a missed
            // notification never parks a worker forever.
            tokio::select! {
                _ = inner.notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(250)) => {}
            }
            continue;
        };

        item.attempts += 1;
        item.last_attempt = Some(Utc::now());
        let article_id = item.article_id;

        match process_item(&inner, &item).await {
            Ok(()) => {
                debug!(worker_id, %article_id, attempts = item.attempts, "Article classified");
                inner
                    .state
                    .lock()
                    .expect("queue state poisoned")
                    .processing
                    .remove(&article_id);
            }
            Err(e) => {
                item.last_error = Some(e.to_string());
                inner
                    .state
                    .lock()
                    .expect("queue state poisoned")
                    .processing
                    .remove(&article_id);

                if item.attempts >= inner.max_attempts {
                    // Dead-letter: dropped from the active set, preserved in
                    // the logs only.
                    warn!(
                        %article_id,
                        attempts = item.attempts,
                        error = %e,
                        "Classification dead-lettered after exhausting attempts"
                    );
                    log_event(
                        &inner.run_log,
                        EventKind::ClassificationDeadLettered {
                            article_id,
                            attempts: item.attempts,
                            last_error: e.to_string(),
                        },
                    );
                } else {
                    warn!(
                        %article_id,
                        attempts = item.attempts,
                        error = %e,
                        "Classification failed, re-enqueueing at reduced priority"
                    );
                    item.priority -= 1;
                    let inner = Arc::clone(&inner);
                    tokio::spawn(async move {
                        tokio::time::sleep(inner.retry_delay).await;
                        if inner.stopped.load(AtomicOrdering::SeqCst) {
                            warn!(article_id = %item.article_id, "Queue stopped before retry, item dropped");
                            return;
                        }
                        let mut state = inner.state.lock().expect("queue state poisoned");
                        if !state.queued.contains(&item.article_id)
                            && !state.processing.contains(&item.article_id)
                        {
                            push_entry(&mut state, item);
                            drop(state);
                            inner.notify.notify_one();
                        }
                    });
                }
            }
        }
    }
}

async fn process_item(inner: &Arc<QueueInner>, item: &QueueItem) -> anyhow::Result<()> {
    let article = inner
        .store
        .get(item.article_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("article {} not found", item.article_id))?;

    let classification = inner
        .classifier
        .classify_article(&article.title, &article.content)
        .await?;

    inner
        .store
        .update_classification(article.id, &classification)
        .await?;

    log_event(
        &inner.run_log,
        EventKind::ClassificationStored {
            article_id: article.id,
            is_flagged: classification.is_flagged,
            score: classification.score as f64,
        },
    );

    Ok(())
}
