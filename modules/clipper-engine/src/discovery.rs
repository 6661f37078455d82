//! Link discovery engine.
//!
//! Turns a listing page into a vetted list of article URLs: anchor
//! extraction (with a browser scroll pass when the page lazy-loads its
//! content), normalization, pattern short-circuits, redirect resolution for
//! every surviving candidate, then classifier triage. Redirects are resolved
//! BEFORE classification — a classifier reasoning over an intermediate
//! redirector URL cannot judge article relevance.
//!
//! Availability beats precision: an empty classifier reply falls back to the
//! full normalized set rather than an empty result.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use futures::stream::{self, StreamExt};
use regex::Regex;
use tracing::{debug, info, warn};

use browserless_client::NavigateOptions;
use clipper_common::CandidateLink;

use crate::links::extract_candidate_links;
use crate::policy::discovery as policy;
use crate::redirect::RedirectResolver;
use crate::traits::{Browser, Classifier};

/// Markers of asynchronous partial-content loading. A page showing these
/// with few anchors has not rendered its listing yet.
static LAZY_LOAD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)infinite[-_]?scroll|lazy[-_]?load|data-lazy|load[-_]?more|IntersectionObserver"#)
        .expect("valid regex")
});

/// Links that are never articles, whatever the classifier thinks.
static DENY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?ix)
        /(?:login|signin|signup|register|subscribe|account|cart|checkout)(?:[/?]|$)
        | /(?:privacy|terms|cookie[-_]?policy|contact|about)(?:[/?]|$)
        | /(?:tag|tags|category|categories|author|topics)/
        | /(?:feed|rss)(?:[/?]|$)
        | \.(?:pdf|jpe?g|png|gif|svg|webp|mp[34]|zip)(?:[?\#]|$)
        ",
    )
    .expect("valid regex")
});

/// Vendor link shapes unambiguous enough to skip classification entirely
/// (cost control): dated article paths and explicit article sections.
static ALLOW_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?ix) /20\d{2}/\d{1,2}/[a-z0-9-]+ | /(?:article|story)/[a-z0-9-]+")
        .expect("valid regex")
});

/// The scroll pass used when a listing lazy-loads: trigger the loads, wait
/// them out, hand back the settled DOM for re-extraction.
const LOAD_MORE_SCRIPT: &str = r#"
(async () => {
    const pause = (ms) => new Promise((r) => setTimeout(r, ms));
    for (let i = 0; i < 4; i++) {
        window.scrollTo(0, document.body.scrollHeight);
        await pause(800);
    }
    return document.documentElement.outerHTML;
})()
"#;

pub struct LinkDiscovery {
    resolver: RedirectResolver,
    browser: Arc<dyn Browser>,
    classifier: Arc<dyn Classifier>,
}

impl LinkDiscovery {
    pub fn new(
        resolver: RedirectResolver,
        browser: Arc<dyn Browser>,
        classifier: Arc<dyn Classifier>,
    ) -> Self {
        Self {
            resolver,
            browser,
            classifier,
        }
    }

    /// Discover article URLs on a fetched listing page.
    pub async fn discover(&self, html: &str, base_url: &str) -> Vec<String> {
        let mut candidates = extract_candidate_links(html, base_url);

        // Lazy-loading listing: few anchors plus loader markers means the
        // real content arrives after scroll. One browser pass, then
        // re-extract.
        if candidates.len() < policy::LAZY_ANCHOR_THRESHOLD && LAZY_LOAD_RE.is_match(html) {
            debug!(base_url, anchors = candidates.len(), "Lazy-loading page, running scroll pass");
            let opts = NavigateOptions::builder()
                .wait_ms(Some(policy::SCROLL_SETTLE_MS))
                .build();
            match self.browser.evaluate(base_url, LOAD_MORE_SCRIPT, &opts).await {
                Ok(value) => {
                    if let Some(settled) = value.as_str() {
                        let reloaded = extract_candidate_links(settled, base_url);
                        if reloaded.len() > candidates.len() {
                            candidates = reloaded;
                        }
                    }
                }
                Err(e) => {
                    warn!(base_url, error = %e, "Scroll pass failed, keeping static anchors");
                }
            }
        }

        // Pattern gates: denied shapes leave, unambiguous article shapes
        // skip the classifier.
        let mut allowed: Vec<CandidateLink> = Vec::new();
        let mut uncertain: Vec<CandidateLink> = Vec::new();
        for link in candidates {
            if DENY_RE.is_match(&link.href) {
                continue;
            }
            if ALLOW_RE.is_match(&link.href) {
                allowed.push(link);
            } else {
                uncertain.push(link);
            }
        }

        // Resolve redirects for every candidate before classification. One
        // resolution per unique URL per pass — resolutions are not reused
        // across passes because sites change.
        let mut resolutions: HashMap<String, String> = HashMap::new();
        let unique: Vec<String> = {
            let mut seen = std::collections::HashSet::new();
            allowed
                .iter()
                .chain(uncertain.iter())
                .map(|l| l.href.clone())
                .filter(|u| seen.insert(u.clone()))
                .collect()
        };
        let resolved: Vec<_> = stream::iter(unique.into_iter().map(|url| {
            let resolver = &self.resolver;
            async move {
                let resolution = resolver.resolve(&url).await;
                (url, resolution)
            }
        }))
        .buffer_unordered(policy::RESOLVE_CONCURRENCY)
        .collect()
        .await;
        for (url, resolution) in resolved {
            if resolution.has_redirects {
                debug!(
                    original = url.as_str(),
                    final_url = resolution.final_url.as_str(),
                    method = ?resolution.method,
                    "Candidate redirect resolved"
                );
            }
            resolutions.insert(url, resolution.final_url);
        }

        let rewrite = |link: CandidateLink| -> CandidateLink {
            let href = resolutions
                .get(&link.href)
                .cloned()
                .unwrap_or(link.href);
            CandidateLink { href, ..link }
        };
        let allowed: Vec<CandidateLink> = allowed.into_iter().map(rewrite).collect();
        let uncertain: Vec<CandidateLink> = uncertain.into_iter().map(rewrite).collect();

        // Classifier triage over the uncertain set, defensively intersected
        // with what was submitted: a rewritten URL is discarded.
        let classified: Vec<String> = if uncertain.is_empty() {
            Vec::new()
        } else {
            let submitted: std::collections::HashSet<&str> =
                uncertain.iter().map(|l| l.href.as_str()).collect();
            match self.classifier.classify_links(&uncertain).await {
                Ok(reply) => {
                    let before = reply.len();
                    let kept: Vec<String> = reply
                        .into_iter()
                        .filter(|u| submitted.contains(u.as_str()))
                        .collect();
                    if kept.len() < before {
                        warn!(
                            base_url,
                            dropped = before - kept.len(),
                            "Classifier rewrote URLs; rewritten entries discarded"
                        );
                    }
                    if kept.is_empty() {
                        // Availability over precision.
                        info!(base_url, "Classifier returned nothing usable, keeping full set");
                        uncertain.iter().map(|l| l.href.clone()).collect()
                    } else {
                        kept
                    }
                }
                Err(e) => {
                    warn!(base_url, error = %e, "Link classification failed, keeping full set");
                    uncertain.iter().map(|l| l.href.clone()).collect()
                }
            }
        };

        // Allow-listed first (already vetted by shape), then classified,
        // deduped preserving order.
        let mut seen = std::collections::HashSet::new();
        let result: Vec<String> = allowed
            .into_iter()
            .map(|l| l.href)
            .chain(classified)
            .filter(|u| seen.insert(u.clone()))
            .collect();

        info!(base_url, articles = result.len(), "Link discovery complete");
        result
    }
}
