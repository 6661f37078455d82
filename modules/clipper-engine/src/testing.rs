//! Deterministic mocks and page fixtures for the test suites.
//!
//! Builder-style mocks over the collaborator traits: register canned
//! responses per URL, everything unregistered fails. No network, no browser,
//! no database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;

use browserless_client::{Navigation, NavigateOptions};
use clipper_common::{CandidateLink, Classification, ExtractionRule, SelectorSet};

use crate::traits::{Browser, Classifier, FetchedPage, PageFetcher};

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MockFetcher {
    pages: HashMap<String, FetchedPage>,
    calls: Mutex<HashMap<String, u32>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the page returned for `url`.
    pub fn on_page(mut self, url: &str, page: FetchedPage) -> Self {
        self.pages.insert(url.to_string(), page);
        self
    }

    /// Register a direct 200 response: final URL equals the request URL.
    pub fn on_html(self, url: &str, html: &str) -> Self {
        let page = FetchedPage {
            final_url: url.to_string(),
            status: 200,
            html: html.to_string(),
        };
        self.on_page(url, page)
    }

    /// How many times `url` has been fetched.
    pub fn fetches_for(&self, url: &str) -> u32 {
        *self
            .calls
            .lock()
            .expect("mock poisoned")
            .get(url)
            .unwrap_or(&0)
    }
}

#[async_trait]
impl PageFetcher for MockFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage> {
        *self
            .calls
            .lock()
            .expect("mock poisoned")
            .entry(url.to_string())
            .or_insert(0) += 1;
        self.pages
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no page registered for {url}"))
    }
}

// ---------------------------------------------------------------------------
// MockBrowser
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MockBrowser {
    navigations: HashMap<String, Navigation>,
    evaluations: HashMap<String, serde_json::Value>,
    navigate_calls: AtomicU32,
    evaluate_calls: AtomicU32,
}

impl MockBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_navigate(mut self, url: &str, nav: Navigation) -> Self {
        self.navigations.insert(url.to_string(), nav);
        self
    }

    pub fn on_evaluate(mut self, url: &str, value: serde_json::Value) -> Self {
        self.evaluations.insert(url.to_string(), value);
        self
    }

    pub fn navigate_calls(&self) -> u32 {
        self.navigate_calls.load(Ordering::SeqCst)
    }

    pub fn evaluate_calls(&self) -> u32 {
        self.evaluate_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Browser for MockBrowser {
    async fn navigate(&self, url: &str, _opts: &NavigateOptions) -> Result<Navigation> {
        self.navigate_calls.fetch_add(1, Ordering::SeqCst);
        self.navigations
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no navigation registered for {url}"))
    }

    async fn evaluate(
        &self,
        url: &str,
        _script: &str,
        _opts: &NavigateOptions,
    ) -> Result<serde_json::Value> {
        self.evaluate_calls.fetch_add(1, Ordering::SeqCst);
        self.evaluations
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no evaluation registered for {url}"))
    }
}

// ---------------------------------------------------------------------------
// MockClassifier
// ---------------------------------------------------------------------------

/// Canned classifier. Defaults: `classify_links` echoes every candidate,
/// `infer_selectors` returns the generic rule, `classify_article` returns the
/// neutral classification. `article_failures(n)` makes the first n article
/// calls fail with a transport-style error, which is what the queue's retry
/// path keys on.
#[derive(Default)]
pub struct MockClassifier {
    link_reply: Option<Vec<String>>,
    links_fail: bool,
    selector_reply: Option<ExtractionRule>,
    article_reply: Option<Classification>,
    article_failures: AtomicU32,
    link_calls: AtomicU32,
    selector_calls: AtomicU32,
    article_calls: AtomicU32,
}

impl MockClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fixed reply for `classify_links`.
    pub fn links(mut self, reply: Vec<String>) -> Self {
        self.link_reply = Some(reply);
        self
    }

    /// `classify_links` fails with a transport error.
    pub fn links_fail(mut self) -> Self {
        self.links_fail = true;
        self
    }

    pub fn selectors(mut self, rule: ExtractionRule) -> Self {
        self.selector_reply = Some(rule);
        self
    }

    pub fn article(mut self, classification: Classification) -> Self {
        self.article_reply = Some(classification);
        self
    }

    /// Fail the first `n` `classify_article` calls, then succeed.
    pub fn article_failures(self, n: u32) -> Self {
        self.article_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn link_calls(&self) -> u32 {
        self.link_calls.load(Ordering::SeqCst)
    }

    pub fn selector_calls(&self) -> u32 {
        self.selector_calls.load(Ordering::SeqCst)
    }

    pub fn article_calls(&self) -> u32 {
        self.article_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Classifier for MockClassifier {
    async fn classify_links(&self, candidates: &[CandidateLink]) -> Result<Vec<String>> {
        self.link_calls.fetch_add(1, Ordering::SeqCst);
        if self.links_fail {
            anyhow::bail!("link classification transport failure");
        }
        Ok(self
            .link_reply
            .clone()
            .unwrap_or_else(|| candidates.iter().map(|c| c.href.clone()).collect()))
    }

    async fn infer_selectors(&self, _html: &str, _url: &str) -> Result<ExtractionRule> {
        self.selector_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .selector_reply
            .clone()
            .unwrap_or_else(crate::structure::generic_rule))
    }

    async fn classify_article(&self, _title: &str, _content: &str) -> Result<Classification> {
        self.article_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.article_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.article_failures.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("article classification transport failure");
        }
        Ok(self
            .article_reply
            .clone()
            .unwrap_or_else(Classification::neutral))
    }
}

// ---------------------------------------------------------------------------
// Page fixtures
// ---------------------------------------------------------------------------

/// A full article page that passes content validation: real title, a body
/// paragraph repeated `repeat` times. No links, so link quality never enters
/// the verdict.
pub fn legitimate_article_page(title: &str, repeat: usize) -> String {
    let paragraph = "The council approved the measure after a lengthy public hearing \
        during which residents raised concerns about traffic and funding. "
        .repeat(repeat.max(1));
    format!(
        r#"<html><head><title>{title}</title></head><body>
<article>
  <h1 class="entry-title">{title}</h1>
  <div class="byline">By Alex Rivera</div>
  <time datetime="2024-05-14T09:00:00Z">May 14, 2024</time>
  <div class="entry-content"><p>{paragraph}</p></div>
</article>
</body></html>"#
    )
}

/// A listing page linking to the given article URLs, with enough intro text
/// to pass the content-length check.
pub fn listing_page(urls: &[&str]) -> String {
    let intro = "Today's top local stories, curated by our newsroom staff. \
        Coverage spans city government, schools, transportation and business. "
        .repeat(4);
    let anchors: String = urls
        .iter()
        .map(|u| format!(r#"<li><a href="{u}">City desk: full story and analysis</a></li>"#))
        .collect();
    format!(
        r#"<html><head><title>Local News Daily</title></head><body>
<main>
  <p>{intro}</p>
  <ul class="headlines">{anchors}</ul>
</main>
</body></html>"#
    )
}

/// A Cloudflare-style challenge interstitial: wrong title, challenge markup,
/// no content.
pub fn cloudflare_challenge_page() -> String {
    r#"<html><head><title>Just a moment...</title>
<script src="/cdn-cgi/challenge-platform/h/b/orchestrate/chl_page"></script>
</head><body>
<p>Checking your browser before accessing the site.</p>
<p>Please enable JavaScript and cookies to continue.</p>
</body></html>"#
        .to_string()
}

/// An interstitial that meta-refreshes to `target`.
pub fn meta_refresh_page(target: &str) -> String {
    format!(
        r#"<html><head><meta http-equiv="refresh" content="0;url={target}"></head>
<body>Redirecting...</body></html>"#
    )
}

/// A selector set that matches nothing in the fixtures, for forcing fallback
/// paths.
pub fn bogus_selectors() -> SelectorSet {
    SelectorSet {
        title: ".nonexistent-title".to_string(),
        content: ".nonexistent-content".to_string(),
        author: None,
        date: None,
    }
}
