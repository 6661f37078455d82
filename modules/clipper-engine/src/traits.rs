// Trait abstractions for the acquisition pipeline's external collaborators.
//
// PageFetcher — plain HTTP fetching, redirect-following.
// Browser — headless browser navigation and in-page evaluation.
// Classifier — the LLM collaborator: link triage, selector inference,
//   article classification. Its replies are unreliable by contract; the
//   defensive parsing lives with the implementation, not the callers.
// ArticleStore — persistence for sources, articles, and classification.
//
// These enable deterministic testing with the mocks in `testing`:
// no network, no browser, no database. `cargo test` in seconds.

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use browserless_client::{BrowserlessClient, Navigation, NavigateOptions};
use clipper_common::{
    Article, CandidateLink, Classification, ExtractionRule, Source,
};

// ---------------------------------------------------------------------------
// PageFetcher
// ---------------------------------------------------------------------------

/// A fetched page: where the HTTP client ended up and what it got.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub final_url: String,
    pub status: u16,
    pub html: String,
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Fetch a URL, following HTTP-level redirects. Non-success statuses
    /// are returned, not raised; the validator decides what an error page
    /// means.
    async fn fetch(&self, url: &str) -> Result<FetchedPage>;
}

// ---------------------------------------------------------------------------
// Browser
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Browser: Send + Sync {
    /// Navigate in a real browser, waiting out client-side redirects, and
    /// return the settled URL plus rendered HTML.
    async fn navigate(&self, url: &str, opts: &NavigateOptions) -> Result<Navigation>;

    /// Navigate and evaluate a script in the page, returning its value.
    async fn evaluate(
        &self,
        url: &str,
        script: &str,
        opts: &NavigateOptions,
    ) -> Result<serde_json::Value>;
}

#[async_trait]
impl Browser for BrowserlessClient {
    async fn navigate(&self, url: &str, opts: &NavigateOptions) -> Result<Navigation> {
        Ok(self.navigate(url, opts).await?)
    }

    async fn evaluate(
        &self,
        url: &str,
        script: &str,
        opts: &NavigateOptions,
    ) -> Result<serde_json::Value> {
        Ok(self.evaluate(url, script, opts).await?)
    }
}

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Classifier: Send + Sync {
    /// Pick the candidates that point at actual articles. URLs in the reply
    /// must be echoed byte-for-byte from the input; implementations drop
    /// anything rewritten. An empty reply is valid and means "none" — the
    /// discovery engine owns the fallback.
    async fn classify_links(&self, candidates: &[CandidateLink]) -> Result<Vec<String>>;

    /// Infer CSS selectors for an unfamiliar page layout. The reply is raw:
    /// callers sanitize and validate before trusting it.
    async fn infer_selectors(&self, html: &str, url: &str) -> Result<ExtractionRule>;

    /// Classify an extracted article. Malformed replies degrade to a
    /// neutral classification, never an error; transport failures stay
    /// errors so the queue can retry them.
    async fn classify_article(&self, title: &str, content: &str) -> Result<Classification>;
}

// ---------------------------------------------------------------------------
// ArticleStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ArticleStore: Send + Sync {
    async fn find_by_url(&self, url: &str) -> Result<Option<Article>>;

    /// Insert an article, atomically deduplicating by URL: returns the new
    /// id, or None when an article with this URL already exists. Concurrent
    /// inserts of the same URL must yield exactly one row.
    async fn insert(&self, article: &Article) -> Result<Option<Uuid>>;

    async fn get(&self, id: Uuid) -> Result<Option<Article>>;

    /// Record classification output. Called at most once per article.
    async fn update_classification(&self, id: Uuid, classification: &Classification)
        -> Result<()>;

    /// Active sources, highest priority first.
    async fn active_sources(&self) -> Result<Vec<Source>>;

    /// Update source health after a scrape attempt: success resets
    /// `consecutive_failures` and stamps both timestamps, failure increments
    /// the counter and stamps `last_scraped` only.
    async fn update_source_health(&self, source_id: Uuid, success: bool) -> Result<()>;

    /// Persist a detected extraction rule so later passes skip inference.
    async fn save_scraping_config(&self, source_id: Uuid, rule: &ExtractionRule) -> Result<()>;
}
