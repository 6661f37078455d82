//! Scrape orchestrator.
//!
//! Drives one full acquisition pass: sources in priority order, processed in
//! fixed-size batches with a jittered pause between batches, articles within
//! a source in a bounded parallel stream. Every failure is contained at its
//! own level: an article failure never kills its siblings, a source failure
//! never kills its batch. Source health is updated after every attempt.
//!
//! The stop signal is cooperative: it prevents new batches and new articles
//! from starting while in-flight work finishes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use rand::Rng;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use clipper_common::{Article, ExtractionRule, ProtectionType, RecommendedAction, Source};

use crate::bypass::{BypassEngine, BypassOutcome};
use crate::classify_queue::ClassificationQueue;
use crate::discovery::LinkDiscovery;
use crate::extract::{extract_article, page_title, readability_text};
use crate::links::extract_candidate_links;
use crate::policy::orchestrator as policy;
use crate::redirect::RedirectResolver;
use crate::run_log::{log_event, EventKind, SharedRunLog};
use crate::structure::StructureDetector;
use crate::traits::{ArticleStore, Browser, Classifier, PageFetcher};
use crate::validation::{detect_vendor, validate, validate_corruption};

// ---------------------------------------------------------------------------
// Run stats
// ---------------------------------------------------------------------------

/// Stats from one acquisition pass.
#[derive(Debug, Default, Serialize)]
pub struct RunStats {
    pub sources_processed: u32,
    pub sources_failed: u32,
    pub protections_detected: u32,
    pub bypasses_succeeded: u32,
    pub bypasses_failed: u32,
    pub links_discovered: u32,
    pub articles_added: u32,
    pub articles_duplicate: u32,
    pub articles_skipped: u32,
    pub articles_failed: u32,
    pub classifications_enqueued: u32,
}

impl std::fmt::Display for RunStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n=== Acquisition Run Complete ===")?;
        writeln!(f, "Sources processed:   {}", self.sources_processed)?;
        writeln!(f, "Sources failed:      {}", self.sources_failed)?;
        writeln!(f, "Protections hit:     {}", self.protections_detected)?;
        writeln!(
            f,
            "Bypasses:            {} succeeded, {} failed",
            self.bypasses_succeeded, self.bypasses_failed
        )?;
        writeln!(f, "Links discovered:    {}", self.links_discovered)?;
        writeln!(f, "Articles added:      {}", self.articles_added)?;
        writeln!(f, "Articles duplicate:  {}", self.articles_duplicate)?;
        writeln!(f, "Articles skipped:    {}", self.articles_skipped)?;
        writeln!(f, "Articles failed:     {}", self.articles_failed)?;
        writeln!(f, "Queued for classify: {}", self.classifications_enqueued)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Per-source / per-article outcomes
// ---------------------------------------------------------------------------

/// One source's contribution to the run, merged into `RunStats` sequentially
/// after each batch.
#[derive(Debug, Default)]
struct SourceReport {
    success: bool,
    error: Option<String>,
    protection_detected: bool,
    bypass_succeeded: Option<bool>,
    links_discovered: u32,
    articles_added: u32,
    articles_duplicate: u32,
    articles_skipped: u32,
    articles_failed: u32,
    enqueued: u32,
}

enum ArticleOutcome {
    Added,
    Duplicate,
    Skipped,
    Failed,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    fetcher: Arc<dyn PageFetcher>,
    store: Arc<dyn ArticleStore>,
    queue: Arc<ClassificationQueue>,
    discovery: LinkDiscovery,
    detector: StructureDetector,
    bypass: BypassEngine,
    run_log: SharedRunLog,
    stop: Arc<AtomicBool>,
    batch_size: usize,
}

impl Orchestrator {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        browser: Arc<dyn Browser>,
        classifier: Arc<dyn Classifier>,
        store: Arc<dyn ArticleStore>,
        queue: Arc<ClassificationQueue>,
        run_log: SharedRunLog,
        stop: Arc<AtomicBool>,
    ) -> Self {
        let resolver = RedirectResolver::new(Arc::clone(&fetcher), Arc::clone(&browser));
        Self {
            fetcher,
            store,
            queue,
            discovery: LinkDiscovery::new(
                resolver,
                Arc::clone(&browser),
                Arc::clone(&classifier),
            ),
            detector: StructureDetector::new(Arc::clone(&classifier)),
            bypass: BypassEngine::new(browser),
            run_log,
            stop,
            batch_size: policy::SOURCE_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Run one full acquisition pass over all active sources.
    pub async fn run(&self) -> Result<RunStats> {
        let mut stats = RunStats::default();
        let sources = self.store.active_sources().await?;
        info!(sources = sources.len(), batch_size = self.batch_size, "Acquisition pass starting");

        let mut batches = sources.chunks(self.batch_size).peekable();
        while let Some(batch) = batches.next() {
            if self.stop.load(Ordering::SeqCst) {
                info!("Stop signal received, no further batches");
                break;
            }

            // Sources in parallel, results merged and persisted sequentially.
            let reports: Vec<(Uuid, SourceReport)> = stream::iter(batch.iter().map(|source| {
                async move { (source.id, self.process_source(source).await) }
            }))
            .buffer_unordered(self.batch_size)
            .collect()
            .await;

            for (source_id, report) in reports {
                if let Err(e) = self.store.update_source_health(source_id, report.success).await {
                    warn!(%source_id, error = %e, "Failed to update source health");
                }
                log_event(
                    &self.run_log,
                    EventKind::SourceCompleted {
                        source_id,
                        success: report.success,
                        articles_added: report.articles_added,
                        articles_skipped: report.articles_duplicate + report.articles_skipped,
                    },
                );
                merge(&mut stats, report);
            }

            if batches.peek().is_some() && !self.stop.load(Ordering::SeqCst) {
                batch_pause().await;
            }
        }

        info!("{stats}");
        Ok(stats)
    }

    /// Process one source end to end. Never returns an error: everything is
    /// captured into the report.
    async fn process_source(&self, source: &Source) -> SourceReport {
        let mut report = SourceReport::default();
        log_event(
            &self.run_log,
            EventKind::SourceStarted {
                source_id: source.id,
                url: source.url.clone(),
            },
        );
        info!(source = source.name.as_str(), url = source.url.as_str(), "Processing source");

        // Listing page, HTTP first.
        let (listing_url, listing_html) = match self.acquire_listing(source, &mut report).await {
            Some(page) => page,
            None => return report,
        };

        let discovered = self.discovery.discover(&listing_html, &listing_url).await;
        report.links_discovered = discovered.len() as u32;
        log_event(
            &self.run_log,
            EventKind::LinksDiscovered {
                url: listing_url.clone(),
                extracted: extract_candidate_links(&listing_html, &listing_url).len() as u32,
                accepted: discovered.len() as u32,
            },
        );
        if discovered.is_empty() {
            warn!(url = listing_url.as_str(), "No article links discovered");
            report.success = true;
            return report;
        }

        let rule = self.ensure_rule(source, &discovered).await;

        // Per-article isolation: each URL gets its own outcome, siblings are
        // never affected by a failure.
        let outcomes: Vec<ArticleOutcome> = stream::iter(
            discovered
                .into_iter()
                .take(policy::MAX_ARTICLES_PER_SOURCE)
                .map(|url| {
                    let rule = &rule;
                    async move {
                        if self.stop.load(Ordering::SeqCst) {
                            return ArticleOutcome::Skipped;
                        }
                        self.process_article(source, &url, rule).await
                    }
                }),
        )
        .buffer_unordered(policy::ARTICLE_CONCURRENCY)
        .collect()
        .await;

        for outcome in outcomes {
            match outcome {
                ArticleOutcome::Added => {
                    report.articles_added += 1;
                    report.enqueued += 1;
                }
                ArticleOutcome::Duplicate => report.articles_duplicate += 1,
                ArticleOutcome::Skipped => report.articles_skipped += 1,
                ArticleOutcome::Failed => report.articles_failed += 1,
            }
        }

        report.success = true;
        info!(
            source = source.name.as_str(),
            added = report.articles_added,
            duplicate = report.articles_duplicate,
            skipped = report.articles_skipped,
            failed = report.articles_failed,
            "Source complete"
        );
        report
    }

    /// Fetch and validate the source's listing page, escalating to the
    /// bypass engine when the validator flags protection. Returns the page
    /// that validated legitimate, or None with the report filled in.
    async fn acquire_listing(
        &self,
        source: &Source,
        report: &mut SourceReport,
    ) -> Option<(String, String)> {
        let page = match self.fetcher.fetch(&source.url).await {
            Ok(page) => page,
            Err(e) => {
                warn!(url = source.url.as_str(), error = %e, "Listing fetch failed");
                report.error = Some(e.to_string());
                return None;
            }
        };

        let title = page_title(&page.html).unwrap_or_default();
        let content = readability_text(&page.html, &page.final_url);
        let links = extract_candidate_links(&page.html, &page.final_url);
        let verdict = validate(&page.html, &title, &content, &links);

        if verdict.is_legitimate {
            return Some((page.final_url, page.html));
        }

        log_event(
            &self.run_log,
            EventKind::ValidationFailed {
                url: page.final_url.clone(),
                confidence: verdict.confidence as f64,
                issues: verdict.issues.clone(),
            },
        );

        if verdict.recommended_action == RecommendedAction::Abort {
            warn!(
                url = page.final_url.as_str(),
                issues = ?verdict.issues,
                "Listing validation says abort"
            );
            report.error = Some(format!("listing not legitimate: {:?}", verdict.issues));
            return None;
        }

        // Protection page: hand the URL to the bypass engine.
        let vendor = detect_vendor(&page.html);
        if verdict.protection_type != ProtectionType::None {
            report.protection_detected = true;
            log_event(
                &self.run_log,
                EventKind::ProtectionDetected {
                    url: page.final_url.clone(),
                    protection: verdict.protection_type.to_string(),
                    vendor: vendor.map(|v| v.to_string()),
                },
            );
        }

        let result = self.bypass.run(&page.final_url, vendor).await;
        log_event(
            &self.run_log,
            EventKind::BypassFinished {
                url: page.final_url.clone(),
                success: result.succeeded(),
                attempts: result.attempts.len() as u32,
                confidence: result.confidence as f64,
            },
        );
        match result.outcome {
            BypassOutcome::Success { html, final_url } => {
                report.bypass_succeeded = Some(true);
                Some((final_url, html))
            }
            BypassOutcome::Aborted => {
                report.bypass_succeeded = Some(false);
                report.error = Some(format!("bypass exhausted: {:?}", result.issues));
                None
            }
        }
    }

    /// Resolve the extraction rule for this source: stored config when one
    /// exists, otherwise fresh detection against the first fetchable article
    /// page, persisted back to the source.
    async fn ensure_rule(&self, source: &Source, urls: &[String]) -> ExtractionRule {
        if let Some(rule) = &source.scraping_config {
            return rule.clone();
        }

        for url in urls {
            match self.fetcher.fetch(url).await {
                Ok(page) => {
                    let rule = self.detector.detect(&page.html, &page.final_url).await;
                    if let Err(e) = self.store.save_scraping_config(source.id, &rule).await {
                        warn!(source_id = %source.id, error = %e, "Failed to persist extraction rule");
                    }
                    return rule;
                }
                Err(e) => {
                    warn!(url = url.as_str(), error = %e, "Sample page fetch failed during structure detection");
                }
            }
        }

        warn!(source_id = %source.id, "No sample page fetchable, using generic rule");
        crate::structure::generic_rule()
    }

    /// One article end to end. Never returns an error.
    async fn process_article(
        &self,
        source: &Source,
        url: &str,
        rule: &ExtractionRule,
    ) -> ArticleOutcome {
        // Cheap pre-check; the insert re-checks atomically.
        match self.store.find_by_url(url).await {
            Ok(Some(_)) => {
                log_event(
                    &self.run_log,
                    EventKind::ArticleSkipped {
                        url: url.to_string(),
                        reason: "duplicate".to_string(),
                    },
                );
                return ArticleOutcome::Duplicate;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(url, error = %e, "Duplicate lookup failed");
                return ArticleOutcome::Failed;
            }
        }

        let page = match self.fetcher.fetch(url).await {
            Ok(page) => page,
            Err(e) => {
                warn!(url, error = %e, "Article fetch failed");
                return ArticleOutcome::Failed;
            }
        };

        let extracted = match extract_article(&page.html, &page.final_url, rule) {
            Some(extracted) => extracted,
            None => {
                log_event(
                    &self.run_log,
                    EventKind::ArticleSkipped {
                        url: url.to_string(),
                        reason: "no usable fields extracted".to_string(),
                    },
                );
                return ArticleOutcome::Skipped;
            }
        };

        // Post-extraction checks: the extracted fields must themselves look
        // like an article, and the text must not be mangled.
        let verdict = validate(&page.html, &extracted.title, &extracted.content, &[]);
        if !verdict.is_legitimate {
            log_event(
                &self.run_log,
                EventKind::ValidationFailed {
                    url: page.final_url.clone(),
                    confidence: verdict.confidence as f64,
                    issues: verdict.issues.clone(),
                },
            );
            return ArticleOutcome::Skipped;
        }
        if validate_corruption(&extracted.content) {
            log_event(
                &self.run_log,
                EventKind::ArticleSkipped {
                    url: url.to_string(),
                    reason: "corrupted text".to_string(),
                },
            );
            return ArticleOutcome::Skipped;
        }

        let article = Article {
            id: Uuid::new_v4(),
            source_id: source.id,
            title: extracted.title,
            content: extracted.content,
            url: page.final_url.clone(),
            author: extracted.author,
            published_at: extracted.published_at,
            scraped_at: Utc::now(),
            classification: None,
        };

        match self.store.insert(&article).await {
            Ok(Some(id)) => {
                log_event(
                    &self.run_log,
                    EventKind::ArticleAdded {
                        article_id: id,
                        url: article.url.clone(),
                        title: article.title.clone(),
                        content_hash: clipper_common::content_hash(&article.content),
                    },
                );
                self.queue.enqueue(id, source.priority);
                ArticleOutcome::Added
            }
            Ok(None) => {
                log_event(
                    &self.run_log,
                    EventKind::ArticleSkipped {
                        url: article.url.clone(),
                        reason: "duplicate".to_string(),
                    },
                );
                ArticleOutcome::Duplicate
            }
            Err(e) => {
                warn!(url, error = %e, "Article insert failed");
                ArticleOutcome::Failed
            }
        }
    }
}

fn merge(stats: &mut RunStats, report: SourceReport) {
    if report.success {
        stats.sources_processed += 1;
    } else {
        stats.sources_failed += 1;
    }
    if report.protection_detected {
        stats.protections_detected += 1;
    }
    match report.bypass_succeeded {
        Some(true) => stats.bypasses_succeeded += 1,
        Some(false) => stats.bypasses_failed += 1,
        None => {}
    }
    stats.links_discovered += report.links_discovered;
    stats.articles_added += report.articles_added;
    stats.articles_duplicate += report.articles_duplicate;
    stats.articles_skipped += report.articles_skipped;
    stats.articles_failed += report.articles_failed;
    stats.classifications_enqueued += report.enqueued;
}

/// Inter-batch pause with 0-1s of jitter so batch starts never align into a
/// fixed request rhythm.
async fn batch_pause() {
    let jitter = rand::rng().random_range(0..1_000);
    tokio::time::sleep(Duration::from_millis(policy::BATCH_PAUSE_MS + jitter)).await;
}
