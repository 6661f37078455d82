//! Article field extraction.
//!
//! Applies a site's `ExtractionRule` to a concrete document: primary
//! selectors first, ranked alternatives for individually failing fields when
//! the rule's confidence gates allow it, and a Readability pass as the
//! rule-less last resort for the content body.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use scraper::{Html, Selector};
use spider_transformations::transformation::content::{
    transform_content_input, ReturnFormat, TransformConfig, TransformInput,
};
use tracing::debug;

use clipper_common::{ExtractionRule, SelectorSet};

use crate::policy::structure as policy;

/// Fields pulled out of one article page.
#[derive(Debug, Clone, Default)]
pub struct ExtractedContent {
    pub title: String,
    pub content: String,
    pub author: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

/// Extract article fields from `html` using `rule`. Returns None only when
/// neither the rule, its alternatives, nor the Readability fallback yield a
/// usable title and body.
pub fn extract_article(html: &str, url: &str, rule: &ExtractionRule) -> Option<ExtractedContent> {
    let document = Html::parse_document(html);

    let mut title = select_text(&document, &rule.selectors.title);
    let mut content = select_all_text(&document, &rule.selectors.content);
    let mut author = rule
        .selectors
        .author
        .as_deref()
        .and_then(|s| select_text(&document, s));
    let mut date_text = rule
        .selectors
        .date
        .as_deref()
        .and_then(|s| select_date_text(&document, s));

    // Low-confidence rules get their alternatives tried per failing field;
    // a high-confidence rule that misses is more likely a non-article page.
    if rule.confidence < policy::ALTERNATIVES_GATE {
        for alt in &rule.alternatives {
            if title.is_none() {
                title = select_text(&document, &alt.title);
            }
            if content.is_none() {
                content = select_all_text(&document, &alt.content);
            }
            if author.is_none() {
                author = alt.author.as_deref().and_then(|s| select_text(&document, s));
            }
            if date_text.is_none() {
                date_text = alt.date.as_deref().and_then(|s| select_date_text(&document, s));
            }
            if title.is_some() && content.is_some() {
                break;
            }
        }
    }

    // Rule-less fallbacks: document title tag, Readability body.
    if title.is_none() {
        title = page_title(html);
    }
    let content = match content {
        Some(c) if c.chars().count() >= policy::MIN_CONTENT_TEXT_CHARS => c,
        _ => {
            debug!(url, "Selector extraction thin, falling back to Readability");
            let text = readability_text(html, url);
            if text.trim().is_empty() {
                return None;
            }
            text
        }
    };

    let title = title.filter(|t| t.chars().count() >= policy::MIN_TITLE_CHARS)?;

    Some(ExtractedContent {
        title,
        content,
        author,
        published_at: date_text.as_deref().and_then(parse_date),
    })
}

/// Text of the first element matching `selector`, trimmed; None when the
/// selector is invalid, matches nothing, or matches only whitespace.
pub fn select_text(document: &Html, selector: &str) -> Option<String> {
    let parsed = Selector::parse(selector).ok()?;
    document
        .select(&parsed)
        .map(|el| el.text().collect::<Vec<_>>().join(" ").trim().to_string())
        .find(|t| !t.is_empty())
}

/// Concatenated text of every element matching `selector`. Content selectors
/// often match one paragraph each.
pub fn select_all_text(document: &Html, selector: &str) -> Option<String> {
    let parsed = Selector::parse(selector).ok()?;
    let parts: Vec<String> = document
        .select(&parsed)
        .map(|el| el.text().collect::<Vec<_>>().join(" ").trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("\n\n"))
}

/// Date selectors prefer the machine-readable `datetime` attribute of
/// `<time>` elements over their display text.
fn select_date_text(document: &Html, selector: &str) -> Option<String> {
    let parsed = Selector::parse(selector).ok()?;
    for el in document.select(&parsed) {
        if let Some(dt) = el.value().attr("datetime") {
            return Some(dt.to_string());
        }
        let text = el.text().collect::<Vec<_>>().join(" ").trim().to_string();
        if !text.is_empty() {
            return Some(text);
        }
    }
    None
}

/// The document's `<title>` text.
pub fn page_title(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    select_text(&document, "title")
}

/// Readability main-content extraction, markdown-flavored plain text.
pub fn readability_text(html: &str, url: &str) -> String {
    let parsed_url = url::Url::parse(url).ok();
    let config = TransformConfig {
        readability: true,
        main_content: true,
        return_format: ReturnFormat::Markdown,
        filter_images: true,
        filter_svg: true,
        clean_html: true,
    };
    let input = TransformInput {
        url: parsed_url.as_ref(),
        content: html.as_bytes(),
        screenshot_bytes: None,
        encoding: None,
        selector_config: None,
        ignore_tags: None,
    };
    transform_content_input(input, &config)
}

/// Parse the publish-date strings sites actually serve: RFC 3339/2822 plus
/// the common human formats. Bare dates resolve to midnight UTC.
pub fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt.with_timezone(&Utc));
    }

    const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];
    for fmt in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }

    const DATE_FORMATS: &[&str] = &[
        "%Y-%m-%d",
        "%m/%d/%Y",
        "%d/%m/%Y",
        "%B %d, %Y",
        "%b %d, %Y",
        "%d %B %Y",
        "%d %b %Y",
    ];
    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(raw, fmt) {
            return Some(date.and_hms_opt(0, 0, 0)?.and_utc());
        }
    }

    None
}
