//! Claude-backed classification collaborator.
//!
//! All three calls treat the model's output as unreliable by contract. The
//! recovery boundary lives here and nowhere else: code-fence stripping,
//! widest-JSON-fragment extraction, typed parse, documented neutral default.
//! Transport failures stay `Err` so callers can retry them; malformed
//! content never does.

use anyhow::Result;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use ai_client::util::{strip_code_blocks, truncate_to_char_boundary};
use ai_client::Claude;
use clipper_common::{clamp01, CandidateLink, Classification, ExtractionRule, SelectorSet};

use crate::policy::structure as structure_policy;
use crate::traits::Classifier;

/// Page HTML sent for selector inference is capped; layouts show up in the
/// first chunk.
const MAX_HTML_BYTES: usize = 60_000;
/// Article body sent for classification.
const MAX_CONTENT_BYTES: usize = 30_000;
/// Candidates sent per link-triage call.
const MAX_LINK_CANDIDATES: usize = 120;

const LINK_SYSTEM_PROMPT: &str = "\
You triage links scraped from news and blog listing pages. Given candidate \
links (URL, anchor text, surrounding context), return ONLY the URLs that \
point at individual article pages. Exclude navigation, category indexes, \
tag pages, author pages, login/subscribe pages, and utility links.\n\
\n\
Reply with a JSON array of URL strings and nothing else. Echo each selected \
URL EXACTLY as given, byte for byte — do not truncate, decode, re-encode, \
or normalize it. A URL you modify will be discarded.";

const SELECTOR_SYSTEM_PROMPT: &str = "\
You infer CSS selectors for extracting article fields from a web page. \
Return CSS SELECTORS, never the text content they would select.\n\
\n\
Correct: {\"title_selector\": \"h1.entry-title\", \"content_selector\": \
\".article-body\", \"author_selector\": \".byline\", \"date_selector\": \
\"time[datetime]\"}\n\
Wrong (this is extracted text, not a selector): {\"title_selector\": \
\"Mayor announces budget\", \"author_selector\": \"By Jordan Smith\", \
\"date_selector\": \"May 14, 2024\"}\n\
\n\
Prefer specific selectors over broad ones; never answer with bare \"body\" \
or \"div\". Omit author/date selectors when the page has no such elements.";

const ARTICLE_SYSTEM_PROMPT: &str = "\
You classify scraped news articles for a content-monitoring pipeline. Given \
a title and body, return: is_flagged (whether the article matches the \
monitored topics), score (0.0-1.0 relevance), categories (topic slugs), a \
1-2 sentence summary, and salient keywords.";

/// Selector reply schema for forced tool-use.
#[derive(Debug, Deserialize, Serialize, JsonSchema)]
struct InferredSelectors {
    /// CSS selector for the article title.
    title_selector: String,
    /// CSS selector for the article body.
    content_selector: String,
    /// CSS selector for the byline, if present.
    author_selector: Option<String>,
    /// CSS selector for the publish date, if present.
    date_selector: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
struct ArticleVerdict {
    is_flagged: bool,
    /// Relevance in [0, 1].
    score: f32,
    categories: Vec<String>,
    summary: String,
    keywords: Vec<String>,
}

pub struct ClaudeClassifier {
    claude: Claude,
}

impl ClaudeClassifier {
    pub fn new(api_key: &str, model: &str) -> Self {
        Self {
            claude: Claude::new(api_key, model),
        }
    }
}

#[async_trait]
impl Classifier for ClaudeClassifier {
    async fn classify_links(&self, candidates: &[CandidateLink]) -> Result<Vec<String>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let listing: String = candidates
            .iter()
            .take(MAX_LINK_CANDIDATES)
            .map(|c| {
                format!(
                    "URL: {}\nAnchor: {}\nContext: {}\n",
                    c.href,
                    c.anchor_text.as_deref().unwrap_or("-"),
                    truncate_to_char_boundary(c.surrounding_text.as_deref().unwrap_or("-"), 300),
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let reply = self
            .claude
            .chat_completion(LINK_SYSTEM_PROMPT, listing)
            .await?;

        // Malformed reply degrades to "none selected"; discovery owns the
        // fallback to the full candidate set.
        Ok(recover_json::<Vec<String>>(&reply).unwrap_or_default())
    }

    async fn infer_selectors(&self, html: &str, url: &str) -> Result<ExtractionRule> {
        let prompt = format!(
            "Page URL: {url}\n\nHTML:\n{}",
            truncate_to_char_boundary(html, MAX_HTML_BYTES)
        );

        let inferred: InferredSelectors =
            match self.claude.extract(SELECTOR_SYSTEM_PROMPT, prompt).await {
                Ok(v) => v,
                Err(e) if is_contract_violation(&e) => {
                    warn!(url, error = %e, "Malformed selector reply, returning empty rule");
                    return Ok(ExtractionRule::new(
                        SelectorSet {
                            title: String::new(),
                            content: String::new(),
                            author: None,
                            date: None,
                        },
                        0.0,
                    ));
                }
                Err(e) => return Err(e),
            };

        debug!(url, title = %inferred.title_selector, content = %inferred.content_selector,
            "Selectors inferred");

        Ok(ExtractionRule::new(
            SelectorSet {
                title: inferred.title_selector,
                content: inferred.content_selector,
                author: inferred.author_selector,
                date: inferred.date_selector,
            },
            structure_policy::INFERRED_CONFIDENCE,
        ))
    }

    async fn classify_article(&self, title: &str, content: &str) -> Result<Classification> {
        let prompt = format!(
            "Title: {title}\n\nBody:\n{}",
            truncate_to_char_boundary(content, MAX_CONTENT_BYTES)
        );

        let verdict: ArticleVerdict =
            match self.claude.extract(ARTICLE_SYSTEM_PROMPT, prompt).await {
                Ok(v) => v,
                Err(e) if is_contract_violation(&e) => {
                    warn!(error = %e, "Malformed classification reply, using neutral default");
                    return Ok(Classification::neutral());
                }
                Err(e) => return Err(e),
            };

        Ok(Classification {
            is_flagged: verdict.is_flagged,
            score: clamp01(verdict.score),
            categories: verdict.categories,
            summary: verdict.summary,
            keywords: verdict.keywords,
        })
    }
}

/// Transport errors are retryable; a reply that arrived but cannot be parsed
/// into the contract type is not, and degrades to the neutral default.
fn is_contract_violation(e: &anyhow::Error) -> bool {
    let msg = e.to_string();
    msg.contains("deserialize") || msg.contains("No structured output")
}

/// Parse a free-form model reply into `T`: strip code fences, try the whole
/// reply, then the widest JSON array/object fragment. None when nothing
/// parses.
pub fn recover_json<T: serde::de::DeserializeOwned>(reply: &str) -> Option<T> {
    let cleaned = strip_code_blocks(reply);

    if let Ok(v) = serde_json::from_str::<T>(cleaned) {
        return Some(v);
    }

    for (open, close) in [('[', ']'), ('{', '}')] {
        if let (Some(start), Some(end)) = (cleaned.find(open), cleaned.rfind(close)) {
            if start < end {
                if let Ok(v) = serde_json::from_str::<T>(&cleaned[start..=end]) {
                    return Some(v);
                }
            }
        }
    }

    None
}
