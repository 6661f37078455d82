//! Structure detection: inferring extraction rules for unfamiliar layouts.
//!
//! Selector inference is delegated to the classification collaborator, whose
//! replies are untrusted by contract — the known failure mode is returning
//! extracted text ("By Jordan Smith", "May 14, 2024") instead of a selector.
//! Everything it returns is sanitized, then validated against the actual
//! document; failing fields are substituted from ranked hand-authored
//! fallbacks while working fields are kept, and confidence is downgraded per
//! substitution rather than zeroed.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use scraper::{Html, Selector};
use tracing::{debug, info, warn};

use clipper_common::{clamp01, ExtractionRule, SelectorSet};

use crate::policy::structure as policy;
use crate::traits::Classifier;

// ---------------------------------------------------------------------------
// Fallback selector tables, ranked best-first
// ---------------------------------------------------------------------------

const TITLE_FALLBACKS: &[&str] = &[
    "h1.entry-title",
    "h1.post-title",
    "h1.headline",
    "article h1",
    "main h1",
    "h1",
];

const CONTENT_FALLBACKS: &[&str] = &[
    "article .entry-content",
    ".article-body",
    ".post-content",
    ".story-body",
    "article p",
    "main article",
    "article",
];

const AUTHOR_FALLBACKS: &[&str] = &[".byline", ".author-name", ".author", "[rel=author]", ".post-author"];

const DATE_FALLBACKS: &[&str] = &["time[datetime]", ".published", ".post-date", "time", ".date"];

/// Selectors so broad they capture navigation, footers and ads along with
/// the article.
const BROAD_SELECTORS: &[&str] = &["*", "body", "html", "div", "span", "p", "a"];

/// Nonstandard pseudo-selectors some collaborators invent; stripped rather
/// than rejected because the base selector is often fine.
static NONSTANDARD_PSEUDO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r":(?:contains|has-text|text|visible)\([^)]*\)").expect("valid regex")
});

/// Strings that are page text, not selectors: bylines, dates, captions.
static LOOKS_LIKE_TEXT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?ix)
        ^by\s+\w+
        | \b(?:january|february|march|april|may|june|july|august|september|october|november|december)\s+\d{1,2}
        | \b\d{1,2}/\d{1,2}/\d{2,4}\b
        | \b(?:19|20)\d{2}\b
        | (?:photo|image|credit)s?\s*:
        ",
    )
    .expect("valid regex")
});

// ---------------------------------------------------------------------------
// Sanitization
// ---------------------------------------------------------------------------

/// Reduce a collaborator-supplied string to a usable CSS selector, or reject
/// it outright.
pub fn sanitize_selector(raw: &str) -> Option<String> {
    let stripped = NONSTANDARD_PSEUDO_RE.replace_all(raw.trim(), "");
    let candidate = stripped.trim().trim_end_matches(['>', '+', '~']).trim();

    if candidate.is_empty() || candidate.len() > 120 {
        return None;
    }
    if LOOKS_LIKE_TEXT_RE.is_match(candidate) {
        return None;
    }
    // Multiple bare words with no selector syntax is a sentence fragment,
    // not a descendant combinator chain worth trusting.
    let words: Vec<&str> = candidate.split_whitespace().collect();
    if words.len() >= 3
        && words
            .iter()
            .all(|w| w.chars().all(|c| c.is_alphanumeric()))
    {
        return None;
    }
    if BROAD_SELECTORS.contains(&candidate.to_ascii_lowercase().as_str()) {
        return None;
    }
    if Selector::parse(candidate).is_err() {
        return None;
    }
    Some(candidate.to_string())
}

// ---------------------------------------------------------------------------
// Document validation
// ---------------------------------------------------------------------------

fn title_selector_works(document: &Html, selector: &str) -> bool {
    let Ok(parsed) = Selector::parse(selector) else {
        return false;
    };
    document.select(&parsed).any(|el| {
        el.text().collect::<String>().trim().chars().count() >= policy::MIN_TITLE_CHARS
    })
}

fn content_selector_works(document: &Html, selector: &str) -> bool {
    let Ok(parsed) = Selector::parse(selector) else {
        return false;
    };
    let mut matches = 0usize;
    let mut text_chars = 0usize;
    for el in document.select(&parsed) {
        matches += 1;
        if matches > policy::BROAD_MATCH_CAP {
            return false;
        }
        text_chars += el.text().collect::<String>().trim().chars().count();
    }
    matches >= 1 && text_chars >= policy::MIN_CONTENT_TEXT_CHARS
}

fn optional_selector_works(document: &Html, selector: &str) -> bool {
    let Ok(parsed) = Selector::parse(selector) else {
        return false;
    };
    document
        .select(&parsed)
        .any(|el| {
            !el.text().collect::<String>().trim().is_empty()
                || el.value().attr("datetime").is_some()
        })
}

fn first_working<'a>(
    document: &Html,
    candidates: &'a [&'a str],
    works: impl Fn(&Html, &str) -> bool,
) -> Option<&'a str> {
    candidates.iter().copied().find(|s| works(document, s))
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

pub struct StructureDetector {
    classifier: Arc<dyn Classifier>,
}

impl StructureDetector {
    pub fn new(classifier: Arc<dyn Classifier>) -> Self {
        Self { classifier }
    }

    /// Infer an extraction rule for an unfamiliar page layout. Never errors:
    /// a failed or garbage inference degrades to the hand-authored fallback
    /// tables with generic confidence.
    pub async fn detect(&self, html: &str, url: &str) -> ExtractionRule {
        let inferred = match self.classifier.infer_selectors(html, url).await {
            Ok(rule) => Some(rule),
            Err(e) => {
                warn!(url, error = %e, "Selector inference failed, using fallback tables");
                None
            }
        };

        let document = Html::parse_document(html);
        let mut confidence = match &inferred {
            Some(rule) => clamp01(rule.confidence).max(policy::GENERIC_CONFIDENCE),
            None => policy::GENERIC_CONFIDENCE,
        };
        let mut substitutions = 0usize;

        let inferred_set = inferred.map(|r| r.selectors);

        // Title: sanitized inference if it matches this document, else the
        // fallback ladder.
        let title = inferred_set
            .as_ref()
            .and_then(|s| sanitize_selector(&s.title))
            .filter(|s| title_selector_works(&document, s))
            .unwrap_or_else(|| {
                substitutions += 1;
                first_working(&document, TITLE_FALLBACKS, title_selector_works)
                    .unwrap_or("h1")
                    .to_string()
            });

        let content = inferred_set
            .as_ref()
            .and_then(|s| sanitize_selector(&s.content))
            .filter(|s| content_selector_works(&document, s))
            .unwrap_or_else(|| {
                substitutions += 1;
                first_working(&document, CONTENT_FALLBACKS, content_selector_works)
                    .unwrap_or("article")
                    .to_string()
            });

        // Optional fields: a working inference is kept, a broken one is
        // replaced when a fallback works on this document, otherwise dropped.
        let author = self.optional_field(
            &document,
            inferred_set.as_ref().and_then(|s| s.author.as_deref()),
            AUTHOR_FALLBACKS,
            &mut substitutions,
        );
        let date = self.optional_field(
            &document,
            inferred_set.as_ref().and_then(|s| s.date.as_deref()),
            DATE_FALLBACKS,
            &mut substitutions,
        );

        confidence -= substitutions as f32 * policy::FALLBACK_DOWNGRADE;
        let confidence = confidence.max(policy::MIN_CONFIDENCE);

        if substitutions > 0 {
            info!(url, substitutions, confidence, "Extraction rule built with fallbacks");
        } else {
            debug!(url, confidence, "Extraction rule inferred cleanly");
        }

        ExtractionRule::new(
            SelectorSet {
                title,
                content,
                author,
                date,
            },
            confidence,
        )
        .with_alternatives(vec![generic_selector_set()])
    }

    fn optional_field(
        &self,
        document: &Html,
        inferred: Option<&str>,
        fallbacks: &[&str],
        substitutions: &mut usize,
    ) -> Option<String> {
        if let Some(sel) = inferred
            .and_then(sanitize_selector)
            .filter(|s| optional_selector_works(document, s))
        {
            return Some(sel);
        }
        if inferred.is_some() {
            *substitutions += 1;
        }
        first_working(document, fallbacks, optional_selector_works).map(String::from)
    }
}

/// The fully hand-authored rule used when inference is unavailable entirely.
pub fn generic_rule() -> ExtractionRule {
    ExtractionRule::new(generic_selector_set(), policy::GENERIC_CONFIDENCE)
}

fn generic_selector_set() -> SelectorSet {
    SelectorSet {
        title: "h1".to_string(),
        content: "article".to_string(),
        author: Some(".byline".to_string()),
        date: Some("time[datetime]".to_string()),
    }
}
