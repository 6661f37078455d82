use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Clamp a confidence score into [0, 1].
///
/// Every confidence produced anywhere in the pipeline passes through this
/// before it participates in a decision.
pub fn clamp01(confidence: f32) -> f32 {
    if confidence.is_nan() {
        return 0.0;
    }
    confidence.clamp(0.0, 1.0)
}

// --- Sources ---

/// A scrape target: one independently-operated website we pull articles from.
///
/// Health fields are updated by the orchestrator after every attempt.
/// `consecutive_failures` resets on success and increments on failure; it
/// drives alerting and backoff but never deletes a source automatically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: Uuid,
    pub url: String,
    pub name: String,
    /// Higher priority sources are dispatched first within a run.
    pub priority: i32,
    pub active: bool,
    pub consecutive_failures: u32,
    pub last_scraped: Option<DateTime<Utc>>,
    pub last_successful_scrape: Option<DateTime<Utc>>,
    /// Learned extraction rule for this site's layout, if one has been
    /// detected on a previous run.
    pub scraping_config: Option<ExtractionRule>,
}

impl Source {
    /// A fresh, healthy source with default priority.
    pub fn new(url: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            url: url.into(),
            name: name.into(),
            priority: 0,
            active: true,
            consecutive_failures: 0,
            last_scraped: None,
            last_successful_scrape: None,
            scraping_config: None,
        }
    }
}

// --- Candidate links ---

/// An anchor found on a listing page that has not yet been confirmed to
/// point at an article. Ephemeral: produced by page parsing, consumed by
/// link discovery, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateLink {
    pub href: String,
    pub anchor_text: Option<String>,
    pub surrounding_text: Option<String>,
}

// --- Redirect resolution ---

/// Which stage of the resolver produced the final answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMethod {
    /// Stage-1 pattern/body heuristics were confident enough on their own.
    Heuristic,
    /// The destination was observed directly (HTTP redirect chain or a real
    /// browser navigation).
    Confirmed,
    /// Stage 2 failed; the stage-1 verdict was kept.
    Fallback,
}

/// The resolved destination of a candidate URL. Immutable once computed;
/// cached only for the duration of a single discovery pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedirectResolution {
    pub original_url: String,
    pub final_url: String,
    pub has_redirects: bool,
    pub confidence: f32,
    pub method: ResolutionMethod,
}

impl RedirectResolution {
    /// A URL that resolves to itself with full confidence.
    pub fn direct(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            original_url: url.clone(),
            final_url: url,
            has_redirects: false,
            confidence: 1.0,
            method: ResolutionMethod::Heuristic,
        }
    }
}

// --- Extraction rules ---

/// One complete set of CSS selectors for pulling article fields out of a
/// page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SelectorSet {
    pub title: String,
    pub content: String,
    pub author: Option<String>,
    pub date: Option<String>,
}

/// A site's extraction rule: the primary selector set, the confidence we
/// have in it, and ranked alternatives tried when confidence is low or the
/// primary fails against a concrete document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionRule {
    pub selectors: SelectorSet,
    pub confidence: f32,
    pub alternatives: Vec<SelectorSet>,
}

impl ExtractionRule {
    pub fn new(selectors: SelectorSet, confidence: f32) -> Self {
        Self {
            selectors,
            confidence: clamp01(confidence),
            alternatives: Vec::new(),
        }
    }

    pub fn with_alternatives(mut self, alternatives: Vec<SelectorSet>) -> Self {
        self.alternatives = alternatives;
        self
    }
}

// --- Validation ---

/// What kind of non-article page we believe we are looking at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtectionType {
    None,
    Cloudflare,
    BotProtection,
    ErrorPage,
    MinimalContent,
}

impl std::fmt::Display for ProtectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtectionType::None => write!(f, "none"),
            ProtectionType::Cloudflare => write!(f, "cloudflare"),
            ProtectionType::BotProtection => write!(f, "bot_protection"),
            ProtectionType::ErrorPage => write!(f, "error_page"),
            ProtectionType::MinimalContent => write!(f, "minimal_content"),
        }
    }
}

/// Policy decision handed to callers so they do not re-derive it from the
/// raw verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    Proceed,
    RetryDifferentMethod,
    RetryWithDelay,
    Abort,
}

/// Result of content-legitimacy validation. Computed fresh for every fetch
/// attempt; never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub is_legitimate: bool,
    pub confidence: f32,
    pub issues: Vec<String>,
    pub protection_type: ProtectionType,
    pub recommended_action: RecommendedAction,
}

/// Aggregate quality of a set of extracted links.
#[derive(Debug, Clone)]
pub struct LinkQuality {
    pub score: f32,
    pub issues: Vec<String>,
}

// --- Articles ---

/// Classifier output attached to an article after the queue worker runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Classification {
    pub is_flagged: bool,
    /// Relevance score in [0, 1].
    pub score: f32,
    pub categories: Vec<String>,
    pub summary: String,
    pub keywords: Vec<String>,
}

impl Classification {
    /// The documented neutral default used when classifier output cannot be
    /// parsed at all.
    pub fn neutral() -> Self {
        Self {
            is_flagged: false,
            score: 0.0,
            categories: Vec::new(),
            summary: String::new(),
            keywords: Vec::new(),
        }
    }
}

/// A successfully extracted, de-duplicated article. `url` is the dedupe
/// key: no two articles ever share one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    pub id: Uuid,
    pub source_id: Uuid,
    pub title: String,
    pub content: String,
    pub url: String,
    pub author: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub scraped_at: DateTime<Utc>,
    /// None until the classification queue processes this article; written
    /// exactly once.
    pub classification: Option<Classification>,
}

// --- Classification queue ---

/// A pending classification unit. Removed on success or dead-lettered after
/// exceeding its attempt budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub article_id: Uuid,
    pub priority: i32,
    pub attempts: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl QueueItem {
    pub fn new(article_id: Uuid, priority: i32) -> Self {
        Self {
            article_id,
            priority,
            attempts: 0,
            last_attempt: None,
            last_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp01_bounds() {
        assert_eq!(clamp01(1.7), 1.0);
        assert_eq!(clamp01(-0.3), 0.0);
        assert_eq!(clamp01(0.42), 0.42);
        assert_eq!(clamp01(f32::NAN), 0.0);
    }

    #[test]
    fn extraction_rule_clamps_confidence() {
        let rule = ExtractionRule::new(
            SelectorSet {
                title: "h1".into(),
                content: "article".into(),
                author: None,
                date: None,
            },
            1.4,
        );
        assert_eq!(rule.confidence, 1.0);
    }

    #[test]
    fn direct_resolution_is_identity() {
        let r = RedirectResolution::direct("https://example.com/a");
        assert_eq!(r.original_url, r.final_url);
        assert!(!r.has_redirects);
        assert_eq!(r.confidence, 1.0);
    }
}
