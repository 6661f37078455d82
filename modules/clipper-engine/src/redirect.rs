//! Two-stage redirect resolution.
//!
//! Stage 1 is cheap: URL-shape matching against known shortener and
//! redirector patterns, then a plain HTTP fetch inspected for tiny bodies,
//! script redirects and meta-refresh tags, each adding a weighted confidence
//! increment. Confident stage-1 answers are trusted outright. The ambiguous
//! middle band gets a stage-2 browser navigation — ground truth, but
//! expensive, so it is reserved for cases the heuristics cannot settle.
//! Stage-2 failure falls back to the stage-1 verdict, never an error.
//!
//! Exactly two stages, never recursive: a redirector pointing at another
//! redirector resolves one hop per discovery pass, which is all the link
//! classifier needs.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::{debug, warn};

use browserless_client::NavigateOptions;
use clipper_common::{clamp01, RedirectResolution, ResolutionMethod};

use crate::policy::redirect as policy;
use crate::traits::{Browser, PageFetcher};

// ---------------------------------------------------------------------------
// Stage-1 pattern tables
// ---------------------------------------------------------------------------

/// Hosts that exist to redirect.
const SHORTENER_HOSTS: &[&str] = &[
    "bit.ly",
    "t.co",
    "tinyurl.com",
    "goo.gl",
    "ow.ly",
    "buff.ly",
    "lnkd.in",
    "dlvr.it",
    "trib.al",
    "feedproxy.google.com",
    "news.google.com",
];

/// Path/query shapes redirector endpoints use regardless of host.
static REDIRECTOR_SHAPE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)/redirect[/?]|[?&](?:url|u|redirect|target|dest|goto)=https?%?3?a?")
        .expect("valid regex")
});

static META_REFRESH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)<meta[^>]+http-equiv\s*=\s*["']?refresh["']?[^>]*content\s*=\s*["']?\s*\d+\s*;\s*url\s*=\s*([^"'>\s]+)"#,
    )
    .expect("valid regex")
});

static SCRIPT_REDIRECT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)(?:window\.|document\.|top\.)?location(?:\.href)?\s*=\s*["']([^"']+)["']|location\.replace\(\s*["']([^"']+)["']\s*\)"#,
    )
    .expect("valid regex")
});

/// What the stage-1 body inspection found.
#[derive(Debug, Clone, Default)]
pub struct Stage1Assessment {
    pub confidence: f32,
    /// Named signals that fired, for observability.
    pub signals: Vec<&'static str>,
    /// Destination hinted by a meta-refresh or script redirect, if any.
    pub target: Option<String>,
}

impl Stage1Assessment {
    pub fn is_likely_redirect(&self) -> bool {
        self.confidence >= policy::BROWSER_BAND_MIN
    }
}

/// Match a URL against the shortener/redirector shape tables. Returns the
/// name of the matching table for the signal list.
pub fn matches_redirector_shape(url: &str) -> Option<&'static str> {
    if let Ok(parsed) = url::Url::parse(url) {
        if let Some(host) = parsed.host_str() {
            let host = host.trim_start_matches("www.");
            if SHORTENER_HOSTS.contains(&host) {
                return Some("shortener_host");
            }
        }
    }
    if REDIRECTOR_SHAPE_RE.is_match(url) {
        return Some("redirector_shape");
    }
    None
}

/// Inspect a fetched body for client-side redirect signals. Pure function
/// over the markup; the resolver combines it with the URL-shape signal.
pub fn inspect_body(html: &str) -> Stage1Assessment {
    let mut out = Stage1Assessment::default();

    if html.len() < policy::TINY_BODY_MAX_BYTES {
        out.confidence += policy::TINY_BODY_WEIGHT;
        out.signals.push("tiny_body");
    }

    if let Some(caps) = META_REFRESH_RE.captures(html) {
        out.confidence += policy::META_REFRESH_WEIGHT;
        out.signals.push("meta_refresh");
        out.target = caps.get(1).map(|m| m.as_str().trim().to_string());
    }

    if let Some(caps) = SCRIPT_REDIRECT_RE.captures(html) {
        let target = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str().trim().to_string())
            .filter(|t| t.starts_with("http"));
        if let Some(t) = target {
            out.confidence += policy::SCRIPT_REDIRECT_WEIGHT;
            out.signals.push("script_redirect");
            if out.target.is_none() {
                out.target = Some(t);
            }
        }
    }

    out.confidence = clamp01(out.confidence);
    out
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Stateless two-stage resolver. Per-pass memoization is the link discovery
/// engine's job; resolutions must not outlive a pass because sites change.
pub struct RedirectResolver {
    fetcher: Arc<dyn PageFetcher>,
    browser: Arc<dyn Browser>,
}

impl RedirectResolver {
    pub fn new(fetcher: Arc<dyn PageFetcher>, browser: Arc<dyn Browser>) -> Self {
        Self { fetcher, browser }
    }

    /// Determine the true destination of a candidate URL.
    pub async fn resolve(&self, url: &str) -> RedirectResolution {
        let mut confidence = 0.0f32;
        let mut signals: Vec<&'static str> = Vec::new();

        if let Some(signal) = matches_redirector_shape(url) {
            confidence += policy::SHORTENER_WEIGHT;
            signals.push(signal);
        }

        // Plain HTTP fetch. The client follows HTTP-level redirects, so a
        // settled URL different from the start is the network telling us the
        // destination directly.
        let mut body_assessment = Stage1Assessment::default();
        match self.fetcher.fetch(url).await {
            Ok(page) => {
                if !same_url(&page.final_url, url) {
                    debug!(url, final_url = %page.final_url, "HTTP chain resolved redirect");
                    return RedirectResolution {
                        original_url: url.to_string(),
                        final_url: page.final_url,
                        has_redirects: true,
                        confidence: policy::HTTP_CHAIN_CONFIDENCE,
                        method: ResolutionMethod::Confirmed,
                    };
                }
                body_assessment = inspect_body(&page.html);
                confidence += body_assessment.confidence;
                signals.extend(body_assessment.signals.iter());
            }
            Err(e) => {
                debug!(url, error = %e, "Stage-1 fetch failed, judging from URL shape alone");
            }
        }

        let confidence = clamp01(confidence);

        // No redirect signal worth chasing: the URL is its own destination.
        if confidence < policy::BROWSER_BAND_MIN {
            return RedirectResolution {
                original_url: url.to_string(),
                final_url: url.to_string(),
                has_redirects: false,
                confidence: policy::DIRECT_CONFIDENCE,
                method: ResolutionMethod::Heuristic,
            };
        }

        // Strong signal with a concrete destination: trust stage 1 (cost
        // control — most shortener bodies name their target outright).
        if confidence >= policy::TRUST_STAGE1 {
            if let Some(target) = &body_assessment.target {
                debug!(url, target, ?signals, "Stage-1 heuristics trusted");
                return RedirectResolution {
                    original_url: url.to_string(),
                    final_url: target.clone(),
                    has_redirects: true,
                    confidence,
                    method: ResolutionMethod::Heuristic,
                };
            }
        }

        // Ambiguous middle band, or confident but with no destination in
        // hand: stage 2, a real browser navigation.
        match self
            .browser
            .navigate(url, &NavigateOptions::default())
            .await
        {
            Ok(nav) => {
                let moved = !same_url(&nav.final_url, url);
                RedirectResolution {
                    original_url: url.to_string(),
                    final_url: nav.final_url,
                    has_redirects: moved,
                    confidence: policy::CONFIRMED_CONFIDENCE,
                    method: ResolutionMethod::Confirmed,
                }
            }
            Err(e) => {
                warn!(url, error = %e, "Browser confirmation failed, keeping stage-1 verdict");
                match &body_assessment.target {
                    Some(target) => RedirectResolution {
                        original_url: url.to_string(),
                        final_url: target.clone(),
                        has_redirects: true,
                        confidence,
                        method: ResolutionMethod::Fallback,
                    },
                    None => RedirectResolution {
                        original_url: url.to_string(),
                        final_url: url.to_string(),
                        has_redirects: false,
                        confidence,
                        method: ResolutionMethod::Fallback,
                    },
                }
            }
        }
    }
}

/// Compare URLs ignoring the one cosmetic difference HTTP clients introduce:
/// a trailing slash on the path.
fn same_url(a: &str, b: &str) -> bool {
    a.trim_end_matches('/') == b.trim_end_matches('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_refresh_is_detected_with_target() {
        let html = r#"<html><head>
            <meta http-equiv="refresh" content="0;url=https://real.example/a">
            </head><body></body></html>"#;
        let assessment = inspect_body(html);
        assert!(assessment.is_likely_redirect());
        assert!(assessment.signals.contains(&"meta_refresh"));
        assert_eq!(assessment.target.as_deref(), Some("https://real.example/a"));
    }

    #[test]
    fn script_redirect_is_detected() {
        let html = format!(
            r#"<html><body><script>window.location.href = "https://real.example/b";</script>{}</body></html>"#,
            "x".repeat(policy::TINY_BODY_MAX_BYTES)
        );
        let assessment = inspect_body(&html);
        assert!(assessment.signals.contains(&"script_redirect"));
        assert_eq!(assessment.target.as_deref(), Some("https://real.example/b"));
    }

    #[test]
    fn location_replace_is_detected() {
        let html = format!(
            r#"<script>location.replace("https://real.example/c")</script>{}"#,
            "x".repeat(policy::TINY_BODY_MAX_BYTES)
        );
        let assessment = inspect_body(&html);
        assert!(assessment.signals.contains(&"script_redirect"));
        assert_eq!(assessment.target.as_deref(), Some("https://real.example/c"));
    }

    #[test]
    fn relative_script_assignment_is_ignored() {
        // In-page navigation to a relative path is not a redirector signal.
        let html = format!(
            r#"<script>window.location = "/login";</script>{}"#,
            "x".repeat(policy::TINY_BODY_MAX_BYTES)
        );
        let assessment = inspect_body(&html);
        assert!(!assessment.signals.contains(&"script_redirect"));
    }

    #[test]
    fn large_plain_body_has_no_signals() {
        let html = format!(
            "<html><body>{}</body></html>",
            "real article text ".repeat(200)
        );
        let assessment = inspect_body(&html);
        assert_eq!(assessment.confidence, 0.0);
        assert!(assessment.target.is_none());
    }

    #[test]
    fn shortener_hosts_match() {
        assert_eq!(
            matches_redirector_shape("https://bit.ly/3xYzAbC"),
            Some("shortener_host")
        );
        assert_eq!(
            matches_redirector_shape("https://www.bit.ly/3xYzAbC"),
            Some("shortener_host")
        );
        assert_eq!(
            matches_redirector_shape("https://news.google.com/articles/abc123"),
            Some("shortener_host")
        );
    }

    /// A redirector pointing at another redirector resolves exactly one hop:
    /// the chained URL is reported as the destination, never chased.
    #[tokio::test]
    async fn resolution_is_one_hop_even_for_chained_redirectors() {
        use crate::testing::{MockBrowser, MockFetcher};
        use crate::traits::FetchedPage;

        let first = "https://bit.ly/3aAaAaA";
        let second = "https://bit.ly/3bBbBbB";
        let fetcher = Arc::new(MockFetcher::new().on_page(
            first,
            FetchedPage {
                final_url: second.to_string(),
                status: 200,
                html: String::new(),
            },
        ));
        let resolver = RedirectResolver::new(
            Arc::clone(&fetcher) as Arc<dyn crate::traits::PageFetcher>,
            Arc::new(MockBrowser::new()),
        );

        let resolution = resolver.resolve(first).await;

        assert_eq!(resolution.final_url, second);
        assert!(resolution.has_redirects);
        assert_eq!(resolution.method, ResolutionMethod::Confirmed);
        assert_eq!(fetcher.fetches_for(second), 0);
    }

    #[test]
    fn redirector_query_shapes_match() {
        assert_eq!(
            matches_redirector_shape("https://site.com/redirect?id=5"),
            Some("redirector_shape")
        );
        assert_eq!(
            matches_redirector_shape("https://site.com/out?url=https%3A%2F%2Freal.example"),
            Some("redirector_shape")
        );
        assert_eq!(
            matches_redirector_shape("https://site.com/2024/05/article-slug-here"),
            None
        );
    }
}
