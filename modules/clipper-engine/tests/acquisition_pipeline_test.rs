//! End-to-end acquisition pipeline scenarios over in-memory collaborators.
//!
//! No network, no browser, no database: `MockFetcher`/`MockBrowser` serve
//! fixture pages, `MockClassifier` answers the LLM seams, `MemoryStore`
//! honors the same URL-dedupe atomicity contract as Postgres.
//!
//! Run with: cargo test -p clipper-engine --test acquisition_pipeline_test

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use clipper_common::{ExtractionRule, SelectorSet, Source};
use clipper_engine::classify_queue::ClassificationQueue;
use clipper_engine::orchestrator::Orchestrator;
use clipper_engine::run_log::RunLog;
use clipper_engine::store::MemoryStore;
use clipper_engine::testing::{
    bogus_selectors, cloudflare_challenge_page, legitimate_article_page, listing_page,
    MockBrowser, MockClassifier, MockFetcher,
};
use clipper_engine::traits::{ArticleStore, Browser, Classifier, PageFetcher};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn fixture_rule() -> ExtractionRule {
    ExtractionRule::new(
        SelectorSet {
            title: "h1.entry-title".to_string(),
            content: ".entry-content".to_string(),
            author: Some(".byline".to_string()),
            date: None,
        },
        0.9,
    )
}

fn source_with_rule(url: &str, name: &str, priority: i32) -> Source {
    let mut source = Source::new(url, name);
    source.priority = priority;
    source.scraping_config = Some(fixture_rule());
    source
}

struct Harness {
    store: Arc<MemoryStore>,
    queue: Arc<ClassificationQueue>,
    orchestrator: Orchestrator,
}

fn harness(fetcher: MockFetcher, browser: MockBrowser, sources: Vec<Source>) -> Harness {
    let store = Arc::new(MemoryStore::new());
    for source in sources {
        store.add_source(source);
    }

    let fetcher: Arc<dyn PageFetcher> = Arc::new(fetcher);
    let browser: Arc<dyn Browser> = Arc::new(browser);
    let classifier: Arc<dyn Classifier> = Arc::new(MockClassifier::new());
    let store_dyn: Arc<dyn ArticleStore> = store.clone();
    let run_log = RunLog::shared();

    let queue = Arc::new(ClassificationQueue::with_settings(
        Arc::clone(&store_dyn),
        Arc::clone(&classifier),
        Arc::clone(&run_log),
        2,
        3,
        Duration::from_millis(50),
    ));
    queue.start();

    let orchestrator = Orchestrator::new(
        fetcher,
        browser,
        classifier,
        store_dyn,
        Arc::clone(&queue),
        run_log,
        Arc::new(AtomicBool::new(false)),
    );

    Harness {
        store,
        queue,
        orchestrator,
    }
}

// ===========================================================================
// Scenario: healthy source, two articles
// ===========================================================================

/// A plain listing with two dated article links: both articles land in the
/// store, both get classified, and the source's health resets.
#[tokio::test(start_paused = true)]
async fn healthy_source_yields_classified_articles() {
    let listing_url = "https://news.example/";
    let story_one = "https://news.example/2024/05/council-approves-transit-plan";
    let story_two = "https://news.example/2024/05/library-branch-reopens";

    let fetcher = MockFetcher::new()
        .on_html(listing_url, &listing_page(&[story_one, story_two]))
        .on_html(story_one, &legitimate_article_page("Council approves transit plan", 10))
        .on_html(story_two, &legitimate_article_page("Library branch reopens", 10));

    let source = source_with_rule(listing_url, "News Example", 5);
    let source_id = source.id;
    let h = harness(fetcher, MockBrowser::new(), vec![source]);

    let stats = h.orchestrator.run().await.unwrap();
    h.queue.drain().await;
    h.queue.stop().await;

    assert_eq!(stats.sources_processed, 1);
    assert_eq!(stats.sources_failed, 0);
    assert_eq!(stats.articles_added, 2);
    assert_eq!(stats.classifications_enqueued, 2);
    assert_eq!(h.store.article_count(), 2);

    for article in h.store.articles() {
        assert!(
            article.classification.is_some(),
            "article {} left unclassified",
            article.url
        );
        assert!(article.title.contains("transit plan") || article.title.contains("Library"));
        assert_eq!(article.author.as_deref(), Some("By Alex Rivera"));
    }

    let source = h.store.source(source_id).unwrap();
    assert_eq!(source.consecutive_failures, 0);
    assert!(source.last_successful_scrape.is_some());
}

// ===========================================================================
// Scenario: same article discovered by two sources
// ===========================================================================

/// Two sources list the same URL in the same batch. The store's atomic
/// insert guarantees one row; the loser is counted as a duplicate.
#[tokio::test(start_paused = true)]
async fn concurrent_sources_deduplicate_shared_article() {
    let shared = "https://news.example/2024/05/shared-wire-story";

    let fetcher = MockFetcher::new()
        .on_html("https://a.example/", &listing_page(&[shared]))
        .on_html("https://b.example/", &listing_page(&[shared]))
        .on_html(shared, &legitimate_article_page("Shared wire story", 10));

    let h = harness(
        fetcher,
        MockBrowser::new(),
        vec![
            source_with_rule("https://a.example/", "Site A", 5),
            source_with_rule("https://b.example/", "Site B", 5),
        ],
    );

    let stats = h.orchestrator.run().await.unwrap();
    h.queue.stop().await;

    assert_eq!(h.store.article_count(), 1);
    assert_eq!(stats.articles_added, 1);
    assert_eq!(stats.articles_duplicate, 1);
    assert_eq!(stats.sources_processed, 2);
}

// ===========================================================================
// Scenario: protected listing, bypass succeeds
// ===========================================================================

/// The HTTP fetch serves a Cloudflare interstitial; the bypass engine's
/// targeted browser attempt gets the real listing and the pass continues.
#[tokio::test(start_paused = true)]
async fn protected_listing_recovers_through_bypass() {
    let listing_url = "https://guarded.example/";
    let story = "https://guarded.example/2024/06/city-budget-passes-final-vote";

    let fetcher = MockFetcher::new()
        .on_html(listing_url, &cloudflare_challenge_page())
        .on_html(story, &legitimate_article_page("City budget passes final vote", 10));

    let browser = MockBrowser::new().on_navigate(
        listing_url,
        browserless_client::Navigation {
            final_url: listing_url.to_string(),
            html: listing_page(&[story]),
        },
    );

    let source = source_with_rule(listing_url, "Guarded Example", 3);
    let h = harness(fetcher, browser, vec![source]);

    let stats = h.orchestrator.run().await.unwrap();
    h.queue.stop().await;

    assert_eq!(stats.protections_detected, 1);
    assert_eq!(stats.bypasses_succeeded, 1);
    assert_eq!(stats.bypasses_failed, 0);
    assert_eq!(stats.articles_added, 1);
    assert_eq!(h.store.article_count(), 1);
}

// ===========================================================================
// Scenario: stop signal raised before the run
// ===========================================================================

/// A stop signal raised before the pass starts means no batch is dispatched:
/// no fetches, no health updates, empty stats.
#[tokio::test(start_paused = true)]
async fn stop_signal_prevents_new_batches() {
    let listing_url = "https://news.example/";
    let fetcher = Arc::new(MockFetcher::new().on_html(listing_url, &listing_page(&[])));
    let source = source_with_rule(listing_url, "News Example", 5);
    let source_id = source.id;

    let store = Arc::new(MemoryStore::new());
    store.add_source(source);
    let store_dyn: Arc<dyn ArticleStore> = store.clone();
    let classifier: Arc<dyn Classifier> = Arc::new(MockClassifier::new());
    let run_log = RunLog::shared();
    let queue = Arc::new(ClassificationQueue::with_settings(
        Arc::clone(&store_dyn),
        Arc::clone(&classifier),
        Arc::clone(&run_log),
        1,
        3,
        Duration::from_millis(50),
    ));

    let stop = Arc::new(AtomicBool::new(true));
    let orchestrator = Orchestrator::new(
        Arc::clone(&fetcher) as Arc<dyn PageFetcher>,
        Arc::new(MockBrowser::new()),
        classifier,
        store_dyn,
        queue,
        run_log,
        stop,
    );

    let stats = orchestrator.run().await.unwrap();

    assert_eq!(stats.sources_processed, 0);
    assert_eq!(stats.sources_failed, 0);
    assert_eq!(fetcher.fetches_for(listing_url), 0);
    assert!(store.source(source_id).unwrap().last_scraped.is_none());
}

// ===========================================================================
// Scenario: unconfigured source, selectors inferred and persisted
// ===========================================================================

/// A source with no stored extraction rule gets one inferred against the
/// first discovered article page and persisted. Inference here returns
/// selectors that match nothing, so the working rule comes from the
/// validation fallbacks, and the article still lands.
#[tokio::test(start_paused = true)]
async fn unconfigured_source_infers_and_persists_rule() {
    let listing_url = "https://fresh.example/";
    let story = "https://fresh.example/2024/06/budget-town-hall-draws-crowd";

    let fetcher: Arc<dyn PageFetcher> = Arc::new(
        MockFetcher::new()
            .on_html(listing_url, &listing_page(&[story]))
            .on_html(story, &legitimate_article_page("Budget town hall draws crowd", 10)),
    );
    let browser: Arc<dyn Browser> = Arc::new(MockBrowser::new());
    let classifier = Arc::new(
        MockClassifier::new().selectors(ExtractionRule::new(bogus_selectors(), 0.9)),
    );

    let store = Arc::new(MemoryStore::new());
    let source = Source::new(listing_url, "Fresh Example");
    let source_id = source.id;
    store.add_source(source);
    let store_dyn: Arc<dyn ArticleStore> = store.clone();
    let run_log = RunLog::shared();

    let queue = Arc::new(ClassificationQueue::with_settings(
        Arc::clone(&store_dyn),
        classifier.clone() as Arc<dyn Classifier>,
        Arc::clone(&run_log),
        2,
        3,
        Duration::from_millis(50),
    ));
    queue.start();

    let orchestrator = Orchestrator::new(
        fetcher,
        browser,
        classifier.clone(),
        store_dyn,
        Arc::clone(&queue),
        run_log,
        Arc::new(AtomicBool::new(false)),
    );

    let stats = orchestrator.run().await.unwrap();
    queue.stop().await;

    assert_eq!(stats.articles_added, 1);
    assert_eq!(classifier.selector_calls(), 1);

    let persisted = store.source(source_id).unwrap().scraping_config.unwrap();
    assert_eq!(persisted.selectors.title, "h1.entry-title");
    assert!(persisted.confidence < 0.9, "substitutions must downgrade confidence");
}

// ===========================================================================
// Scenario: one source down, the other unaffected
// ===========================================================================

/// A source whose listing fetch fails is recorded as a failure and its
/// counter incremented; its batch sibling completes normally.
#[tokio::test(start_paused = true)]
async fn source_failure_is_contained_to_that_source() {
    let healthy_url = "https://up.example/";
    let story = "https://up.example/2024/07/harvest-festival-returns";

    // Nothing registered for down.example: every fetch errors.
    let fetcher = MockFetcher::new()
        .on_html(healthy_url, &listing_page(&[story]))
        .on_html(story, &legitimate_article_page("Harvest festival returns", 10));

    let down = source_with_rule("https://down.example/", "Down Example", 9);
    let down_id = down.id;
    let up = source_with_rule(healthy_url, "Up Example", 1);

    let h = harness(fetcher, MockBrowser::new(), vec![down, up]);

    let stats = h.orchestrator.run().await.unwrap();
    h.queue.stop().await;

    assert_eq!(stats.sources_failed, 1);
    assert_eq!(stats.sources_processed, 1);
    assert_eq!(stats.articles_added, 1);

    let down = h.store.source(down_id).unwrap();
    assert_eq!(down.consecutive_failures, 1);
    assert!(down.last_scraped.is_some());
    assert!(down.last_successful_scrape.is_none());
}
